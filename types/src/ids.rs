use std::fmt;

use serde::{Deserialize, Serialize};

/// Identity of a node in the test tree.
///
/// Leaf ids come from the test framework (MTP `uid`, VSTest `Id`) and are
/// never regenerated, so a test keeps its id across re-discovery. Synthesized
/// container ids are derived from their parent chain (see [`TestNodeId::namespace`]).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TestNodeId(String);

impl TestNodeId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Id of the namespace node for `path` (e.g. `["MyApp", "Tests"]`) under `root`.
    #[must_use]
    pub fn namespace(root: &TestNodeId, path: &[String]) -> Self {
        Self(format!("{}::{}", root.0, path.join(".")))
    }

    /// Id of the synthesized method node grouping parameterized cases of `method`.
    #[must_use]
    pub fn method_group(root: &TestNodeId, path: &[String], method: &str) -> Self {
        Self(format!("{}::{}#{method}", root.0, path.join(".")))
    }
}

impl fmt::Display for TestNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TestNodeId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Token correlating one discover/run invocation with its streamed updates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(u64);

impl SessionId {
    #[must_use]
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    #[must_use]
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_and_method_group_ids_do_not_collide() {
        let root = TestNodeId::new("proj");
        let path = vec!["Foo".to_string()];
        let ns = TestNodeId::namespace(&root, &path);
        let group = TestNodeId::method_group(&root, &[], "Foo");
        assert_eq!(ns.as_str(), "proj::Foo");
        assert_eq!(group.as_str(), "proj::#Foo");
        assert_ne!(ns, group);
    }

    #[test]
    fn ids_serialize_transparently() {
        let id = TestNodeId::new("abc");
        assert_eq!(serde_json::to_value(&id).unwrap(), serde_json::json!("abc"));
        let session = SessionId::new(7);
        assert_eq!(serde_json::to_value(session).unwrap(), serde_json::json!(7));
    }
}
