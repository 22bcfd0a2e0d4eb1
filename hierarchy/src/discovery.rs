//! Folding discovered tests into the tree.
//!
//! Each test is placed under `root` by its namespace path. Missing namespace
//! segments are synthesized; parameterized cases are grouped under a
//! synthesized method node. Known ids are updated in place, so a test keeps
//! its node (and status) across re-discovery. Afterwards tests under `root`
//! that were not reported again are removed, along with synthesized
//! containers left empty.

use std::collections::HashSet;

use easy_dotnet_types::{DiscoveredTest, TestNode, TestNodeId, TestNodeStatus, TestNodeType, split_arguments};

use crate::registry::{GlobalLock, RegistryError, TestRegistry, Tree, Upsert};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryReport {
    pub added: usize,
    pub updated: usize,
    pub removed: Vec<TestNodeId>,
    /// Tests whose id already belongs to another root; left untouched.
    pub conflicts: Vec<TestNodeId>,
}

impl DiscoveryReport {
    #[must_use]
    pub fn changed(&self) -> bool {
        self.added > 0 || self.updated > 0 || !self.removed.is_empty()
    }

    fn record(&mut self, upsert: Upsert) {
        match upsert {
            Upsert::Added => self.added += 1,
            Upsert::Updated => self.updated += 1,
            Upsert::Unchanged => {}
        }
    }
}

/// Take the global lock and fold `tests` into the subtree of `root`.
pub async fn process_test_discovery(
    registry: &TestRegistry,
    root: &TestNodeId,
    tests: &[DiscoveredTest],
) -> Result<DiscoveryReport, RegistryError> {
    let mut lock = registry.lock_global().await;
    let report = apply_discovery(&mut lock, root, tests)?;
    if report.changed() {
        lock.structure_changed(root);
    }
    tracing::info!(
        root = %root,
        tests = tests.len(),
        added = report.added,
        updated = report.updated,
        removed = report.removed.len(),
        "Applied test discovery"
    );
    Ok(report)
}

/// [`process_test_discovery`] for callers already holding the global lock.
pub fn apply_discovery(
    lock: &mut GlobalLock<'_>,
    root: &TestNodeId,
    tests: &[DiscoveredTest],
) -> Result<DiscoveryReport, RegistryError> {
    let tree = lock.tree();
    if !tree.contains(root) {
        return Err(RegistryError::UnknownNode(root.clone()));
    }

    let mut report = DiscoveryReport::default();
    let mut seen = HashSet::new();
    for test in tests {
        if tree.contains(&test.id) && !tree.is_within(&test.id, root) {
            tracing::warn!(test = %test.id, root = %root, "Test id already registered under another root");
            report.conflicts.push(test.id.clone());
            continue;
        }
        place(tree, root, test, &mut report, &mut seen)?;
    }

    let stale: Vec<_> = tree
        .descendants(root)
        .into_iter()
        .filter(|id| !seen.contains(id) && tree.is_runnable(id))
        .collect();
    for id in stale {
        report.removed.extend(tree.remove_subtree(&id));
    }
    // Reverse pre-order visits children before their parents.
    for id in tree.descendants(root).into_iter().rev() {
        if tree.is_synthesized(&id) && !tree.has_children(&id) {
            report.removed.extend(tree.remove_subtree(&id));
        }
    }
    Ok(report)
}

fn place(
    tree: &mut Tree,
    root: &TestNodeId,
    test: &DiscoveredTest,
    report: &mut DiscoveryReport,
    seen: &mut HashSet<TestNodeId>,
) -> Result<(), RegistryError> {
    let mut parent = root.clone();
    for depth in 1..=test.namespace_path.len() {
        let path = &test.namespace_path[..depth];
        let id = TestNodeId::namespace(root, path);
        let node = TestNode::container(
            id.clone(),
            path[depth - 1].clone(),
            Some(parent),
            TestNodeType::Namespace,
        );
        report.record(tree.upsert(node, true)?);
        seen.insert(id.clone());
        parent = id;
    }

    let leaf_type = if test.arguments.is_some() {
        let method = test.method_name();
        let id = TestNodeId::method_group(root, &test.namespace_path, method);
        let group = TestNode {
            file_path: test.file_path.clone(),
            line_number: test.line_number,
            fully_qualified_name: Some(split_arguments(&test.fully_qualified_name).0.to_string()),
            ..TestNode::container(id.clone(), method, Some(parent), TestNodeType::TestMethod)
        };
        report.record(tree.upsert(group, true)?);
        seen.insert(id.clone());
        parent = id;
        TestNodeType::Subcase
    } else {
        TestNodeType::TestMethod
    };

    let leaf = TestNode {
        id: test.id.clone(),
        display_name: test.display_name.clone(),
        parent_id: Some(parent),
        file_path: test.file_path.clone(),
        line_number: test.line_number,
        node_type: leaf_type,
        fully_qualified_name: Some(test.fully_qualified_name.clone()),
        status: TestNodeStatus::Idle,
    };
    report.record(tree.upsert(leaf, false)?);
    seen.insert(test.id.clone());
    Ok(())
}
