use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::ids::TestNodeId;
use crate::status::TestNodeStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TestNodeType {
    Solution,
    Project,
    Namespace,
    TestMethod,
    Subcase,
}

impl TestNodeType {
    /// Nodes of this type represent a runnable test rather than a container.
    #[must_use]
    pub const fn is_test(self) -> bool {
        matches!(self, Self::TestMethod | Self::Subcase)
    }

    /// Containers synthesized from name segments; pruned once they have no children.
    #[must_use]
    pub const fn is_synthesized(self) -> bool {
        matches!(self, Self::Namespace)
    }
}

/// One node of the test tree.
///
/// Invariant (maintained by the registry): every node except a solution root
/// has a `parent_id` naming a node that exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestNode {
    pub id: TestNodeId,
    pub display_name: String,
    pub parent_id: Option<TestNodeId>,
    pub file_path: Option<PathBuf>,
    /// 0-based line of the test in `file_path`.
    pub line_number: Option<u32>,
    #[serde(rename = "type")]
    pub node_type: TestNodeType,
    /// Name handed back to the framework when filtering runs.
    pub fully_qualified_name: Option<String>,
    pub status: TestNodeStatus,
}

impl TestNode {
    #[must_use]
    pub fn container(
        id: TestNodeId,
        display_name: impl Into<String>,
        parent_id: Option<TestNodeId>,
        node_type: TestNodeType,
    ) -> Self {
        Self {
            id,
            display_name: display_name.into(),
            parent_id,
            file_path: None,
            line_number: None,
            node_type,
            fully_qualified_name: None,
            status: TestNodeStatus::Idle,
        }
    }
}
