//! Normalization of framework-specific test records into [`DiscoveredTest`].
//!
//! Two sources feed the tree: Microsoft Testing Platform nodes and legacy
//! VSTest test cases. They disagree on how names are qualified and on line
//! numbering, and the rules below keep those differences out of the hierarchy:
//!
//! - MTP with a test type: FQN is `{type}.{display}`, the leaf keeps the
//!   display name verbatim (argument lists included).
//! - MTP without a test type: FQN is the display name, the leaf is whatever
//!   follows its last `.`.
//! - VSTest: FQN is the framework's own, the leaf follows the executor's
//!   [`VsTestDisplayPolicy`].
//! - MTP lines are 1-based and stored 0-based; VSTest lines are stored as-is.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::ids::TestNodeId;

/// An MTP test node reduced to what normalization needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MtpTestRecord {
    pub uid: String,
    pub display_name: String,
    pub test_type: Option<String>,
    pub file_path: Option<PathBuf>,
    /// 1-based, as reported by the platform.
    pub line_start: Option<u32>,
}

/// A VSTest `TestCase` reduced to what normalization needs.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VsTestCase {
    pub id: String,
    pub fully_qualified_name: String,
    pub display_name: String,
    #[serde(default)]
    pub executor_uri: Option<String>,
    #[serde(default)]
    pub code_file_path: Option<PathBuf>,
    /// Already 0-based.
    #[serde(default)]
    pub line_number: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VsTestDisplayPolicy {
    /// The framework already supplies a short display name (MSTest, NUnit).
    PassThrough,
    /// The display name is namespace-qualified and must be reduced to its last segment (xUnit).
    TrailingSegment,
}

/// Executor URI → display policy table.
///
/// Lookup tries an exact (case-insensitive) match first, then the longest
/// configured prefix. Unknown executors fall back to a heuristic: reduce when
/// the display name equals the fully-qualified name.
#[derive(Debug, Clone)]
pub struct VsTestDisplayPolicies {
    by_executor: HashMap<String, VsTestDisplayPolicy>,
}

impl Default for VsTestDisplayPolicies {
    fn default() -> Self {
        let by_executor = [
            ("executor://mstestadapter/v2", VsTestDisplayPolicy::PassThrough),
            ("executor://nunit3testexecutor", VsTestDisplayPolicy::PassThrough),
            ("executor://xunit/", VsTestDisplayPolicy::TrailingSegment),
        ]
        .into_iter()
        .map(|(uri, policy)| (uri.to_string(), policy))
        .collect();
        Self { by_executor }
    }
}

impl VsTestDisplayPolicies {
    /// Built-in table extended (and overridden) by `overrides`.
    #[must_use]
    pub fn with_overrides<I>(overrides: I) -> Self
    where
        I: IntoIterator<Item = (String, VsTestDisplayPolicy)>,
    {
        let mut policies = Self::default();
        for (uri, policy) in overrides {
            policies.by_executor.insert(normalize_uri(&uri), policy);
        }
        policies
    }

    #[must_use]
    pub fn resolve(&self, case: &VsTestCase) -> VsTestDisplayPolicy {
        case.executor_uri
            .as_deref()
            .and_then(|uri| self.lookup(uri))
            .unwrap_or_else(|| {
                if case.display_name == case.fully_qualified_name {
                    VsTestDisplayPolicy::TrailingSegment
                } else {
                    VsTestDisplayPolicy::PassThrough
                }
            })
    }

    fn lookup(&self, uri: &str) -> Option<VsTestDisplayPolicy> {
        let uri = normalize_uri(uri);
        if let Some(policy) = self.by_executor.get(&uri) {
            return Some(*policy);
        }
        self.by_executor
            .iter()
            .filter(|(prefix, _)| uri.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, policy)| *policy)
    }
}

fn normalize_uri(uri: &str) -> String {
    let lower = uri.trim().to_ascii_lowercase();
    if lower.ends_with('/') && lower.matches('/').count() > 3 {
        lower.trim_end_matches('/').to_string()
    } else {
        lower
    }
}

/// A test normalized for placement in the hierarchy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredTest {
    pub id: TestNodeId,
    pub fully_qualified_name: String,
    /// Leaf display name.
    pub display_name: String,
    pub namespace_path: Vec<String>,
    pub file_path: Option<PathBuf>,
    /// 0-based.
    pub line_number: Option<u32>,
    /// Parenthesized argument list of a parameterized case, verbatim.
    pub arguments: Option<String>,
}

impl DiscoveredTest {
    #[must_use]
    pub fn from_mtp(record: &MtpTestRecord) -> Self {
        let test_type = record
            .test_type
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty());

        let (fully_qualified_name, namespace_path, display_name) = match test_type {
            Some(test_type) => (
                format!("{test_type}.{}", record.display_name),
                split_top_level(test_type),
                record.display_name.clone(),
            ),
            None => {
                let (path, leaf) = match record.display_name.rsplit_once('.') {
                    Some((prefix, leaf)) if !leaf.is_empty() => (
                        prefix
                            .split('.')
                            .filter(|s| !s.is_empty())
                            .map(String::from)
                            .collect(),
                        leaf.to_string(),
                    ),
                    _ => (Vec::new(), record.display_name.clone()),
                };
                (record.display_name.clone(), path, leaf)
            }
        };

        let arguments = split_arguments(&display_name).1.map(String::from);
        Self {
            id: TestNodeId::new(record.uid.clone()),
            fully_qualified_name,
            display_name,
            namespace_path,
            file_path: record.file_path.clone(),
            line_number: record.line_start.map(|line| line.saturating_sub(1)),
            arguments,
        }
    }

    #[must_use]
    pub fn from_vstest(case: &VsTestCase, policies: &VsTestDisplayPolicies) -> Self {
        let display_name = if case.display_name.contains('.') {
            match policies.resolve(case) {
                VsTestDisplayPolicy::PassThrough => case.display_name.clone(),
                VsTestDisplayPolicy::TrailingSegment => split_top_level(&case.display_name)
                    .pop()
                    .unwrap_or_else(|| case.display_name.clone()),
            }
        } else {
            case.display_name.clone()
        };

        let mut namespace_path = split_top_level(&case.fully_qualified_name);
        namespace_path.pop();

        let arguments = split_arguments(&display_name).1.map(String::from);
        Self {
            id: TestNodeId::new(case.id.clone()),
            fully_qualified_name: case.fully_qualified_name.clone(),
            display_name,
            namespace_path,
            file_path: case.code_file_path.clone(),
            line_number: case.line_number,
            arguments,
        }
    }

    /// Display name without the argument list.
    #[must_use]
    pub fn method_name(&self) -> &str {
        split_arguments(&self.display_name).0
    }
}

/// Split a qualified name on `.` separators that are not nested inside
/// `()`, `<>` or `[]`, so argument lists and generic arguments stay intact.
#[must_use]
pub fn split_top_level(name: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, ch) in name.char_indices() {
        match ch {
            '(' | '<' | '[' => depth += 1,
            ')' | '>' | ']' => depth = depth.saturating_sub(1),
            '.' if depth == 0 => {
                if i > start {
                    segments.push(name[start..i].to_string());
                }
                start = i + 1;
            }
            _ => {}
        }
    }
    if start < name.len() {
        segments.push(name[start..].to_string());
    }
    segments
}

/// Split `Method(1, "a")` into `("Method", Some("(1, \"a\")"))`.
///
/// Only a trailing, balanced argument list counts; anything else is `(name, None)`.
#[must_use]
pub fn split_arguments(name: &str) -> (&str, Option<&str>) {
    if !name.ends_with(')') {
        return (name, None);
    }
    let Some(open) = name.find('(') else {
        return (name, None);
    };
    let base = name[..open].trim_end();
    if base.is_empty() {
        return (name, None);
    }
    (base, Some(&name[open..]))
}
