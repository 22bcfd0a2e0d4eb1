//! Shared test tree with two lock granularities.
//!
//! Structure (which nodes exist, who their parent is) sits behind a
//! [`tokio::sync::RwLock`]. Structural changes take it exclusively through
//! [`TestRegistry::lock_global`]. Status updates take it shared and then a
//! per-node mutex through [`TestRegistry::lock_node`], so unrelated tests
//! update their status concurrently while discovery and removal still
//! exclude every status writer.
//!
//! Never call a structural operation while holding a [`NodeLock`] or
//! [`SharedLock`]: the write lock waits for every shared holder.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use easy_dotnet_types::{TestNode, TestNodeId, TestNodeStatus, TestNodeType};
use tokio::sync::{OwnedMutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard, broadcast};

const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown test node: {0}")]
    UnknownNode(TestNodeId),
    #[error("parent {parent} of node {id} does not exist")]
    UnknownParent { id: TestNodeId, parent: TestNodeId },
}

/// Change notifications for presentation layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    StatusChanged {
        id: TestNodeId,
        status: TestNodeStatus,
    },
    /// Nodes were added, moved or removed below `root`.
    StructureChanged { root: TestNodeId },
}

struct Slot {
    /// `node.status` is stale; the live value is in `status`.
    node: TestNode,
    children: Vec<TestNodeId>,
    synthesized: bool,
    status: Arc<Mutex<TestNodeStatus>>,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl Slot {
    fn new(node: TestNode, synthesized: bool) -> Self {
        let status = Arc::new(Mutex::new(node.status.clone()));
        Self {
            node,
            children: Vec::new(),
            synthesized,
            status,
            lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    fn status(&self) -> TestNodeStatus {
        self.status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn view(&self) -> TestNode {
        TestNode {
            status: self.status(),
            ..self.node.clone()
        }
    }

    fn is_runnable(&self) -> bool {
        self.node.node_type.is_test() && !self.synthesized
    }
}

/// What an upsert did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Upsert {
    Added,
    Updated,
    Unchanged,
}

#[derive(Default)]
pub(crate) struct Tree {
    nodes: HashMap<TestNodeId, Slot>,
    roots: Vec<TestNodeId>,
}

impl Tree {
    pub(crate) fn contains(&self, id: &TestNodeId) -> bool {
        self.nodes.contains_key(id)
    }

    fn get(&self, id: &TestNodeId) -> Result<&Slot, RegistryError> {
        self.nodes
            .get(id)
            .ok_or_else(|| RegistryError::UnknownNode(id.clone()))
    }

    /// Insert `node`, or update it in place keeping its status. A changed
    /// parent moves the node.
    pub(crate) fn upsert(&mut self, node: TestNode, synthesized: bool) -> Result<Upsert, RegistryError> {
        if let Some(parent) = &node.parent_id
            && !self.nodes.contains_key(parent)
        {
            return Err(RegistryError::UnknownParent {
                id: node.id,
                parent: parent.clone(),
            });
        }

        let Some(slot) = self.nodes.get_mut(&node.id) else {
            self.attach(&node.id, node.parent_id.as_ref());
            self.nodes.insert(node.id.clone(), Slot::new(node, synthesized));
            return Ok(Upsert::Added);
        };

        let old_parent = slot.node.parent_id.clone();
        let unchanged = slot.node.display_name == node.display_name
            && slot.node.file_path == node.file_path
            && slot.node.line_number == node.line_number
            && slot.node.node_type == node.node_type
            && slot.node.fully_qualified_name == node.fully_qualified_name
            && old_parent == node.parent_id
            && slot.synthesized == synthesized;
        if unchanged {
            return Ok(Upsert::Unchanged);
        }

        let id = node.id.clone();
        let new_parent = node.parent_id.clone();
        slot.node = TestNode {
            status: TestNodeStatus::Idle,
            ..node
        };
        slot.synthesized = synthesized;
        if old_parent != new_parent {
            self.detach(&id, old_parent.as_ref());
            self.attach(&id, new_parent.as_ref());
        }
        Ok(Upsert::Updated)
    }

    fn attach(&mut self, id: &TestNodeId, parent: Option<&TestNodeId>) {
        let siblings = match parent.and_then(|p| self.nodes.get_mut(p)) {
            Some(parent) => &mut parent.children,
            None => &mut self.roots,
        };
        siblings.push(id.clone());
    }

    fn detach(&mut self, id: &TestNodeId, parent: Option<&TestNodeId>) {
        let siblings = match parent.and_then(|p| self.nodes.get_mut(p)) {
            Some(parent) => &mut parent.children,
            None => &mut self.roots,
        };
        siblings.retain(|child| child != id);
    }

    /// Remove `id` and everything below it. Returns the removed ids, `id` first.
    pub(crate) fn remove_subtree(&mut self, id: &TestNodeId) -> Vec<TestNodeId> {
        let Some(slot) = self.nodes.get(id) else {
            return Vec::new();
        };
        let parent = slot.node.parent_id.clone();
        self.detach(id, parent.as_ref());

        let mut removed = Vec::new();
        let mut stack = vec![id.clone()];
        while let Some(next) = stack.pop() {
            if let Some(slot) = self.nodes.remove(&next) {
                stack.extend(slot.children);
                removed.push(next);
            }
        }
        removed
    }

    /// Depth-first ids below `id`, excluding `id`.
    pub(crate) fn descendants(&self, id: &TestNodeId) -> Vec<TestNodeId> {
        let mut out = Vec::new();
        let mut stack: Vec<TestNodeId> = self
            .nodes
            .get(id)
            .map(|slot| slot.children.iter().rev().cloned().collect())
            .unwrap_or_default();
        while let Some(next) = stack.pop() {
            if let Some(slot) = self.nodes.get(&next) {
                stack.extend(slot.children.iter().rev().cloned());
            }
            out.push(next);
        }
        out
    }

    /// Whether `id` is `ancestor` or lies below it.
    pub(crate) fn is_within(&self, id: &TestNodeId, ancestor: &TestNodeId) -> bool {
        let mut current = Some(id);
        while let Some(next) = current {
            if next == ancestor {
                return true;
            }
            current = self
                .nodes
                .get(next)
                .and_then(|slot| slot.node.parent_id.as_ref());
        }
        false
    }

    pub(crate) fn is_runnable(&self, id: &TestNodeId) -> bool {
        self.nodes.get(id).is_some_and(Slot::is_runnable)
    }

    pub(crate) fn is_synthesized(&self, id: &TestNodeId) -> bool {
        self.nodes.get(id).is_some_and(|slot| slot.synthesized)
    }

    pub(crate) fn has_children(&self, id: &TestNodeId) -> bool {
        self.nodes.get(id).is_some_and(|slot| !slot.children.is_empty())
    }

    fn snapshot(&self) -> Vec<TestNode> {
        let mut out = Vec::with_capacity(self.nodes.len());
        for root in &self.roots {
            if let Some(slot) = self.nodes.get(root) {
                out.push(slot.view());
            }
            out.extend(
                self.descendants(root)
                    .iter()
                    .filter_map(|id| self.nodes.get(id).map(Slot::view)),
            );
        }
        out
    }

    /// `id` followed by everything below it, depth first.
    fn subtree(&self, id: &TestNodeId) -> Result<Vec<TestNode>, RegistryError> {
        let slot = self.get(id)?;
        let mut out = vec![slot.view()];
        out.extend(
            self.descendants(id)
                .iter()
                .filter_map(|child| self.nodes.get(child).map(Slot::view)),
        );
        Ok(out)
    }

    fn children(&self, id: &TestNodeId) -> Result<Vec<TestNode>, RegistryError> {
        let slot = self.get(id)?;
        Ok(slot
            .children
            .iter()
            .filter_map(|child| self.nodes.get(child).map(Slot::view))
            .collect())
    }

    fn runnable_tests(&self, id: &TestNodeId) -> Result<Vec<TestNode>, RegistryError> {
        let slot = self.get(id)?;
        let mut out = Vec::new();
        if slot.is_runnable() {
            out.push(slot.view());
        }
        out.extend(
            self.descendants(id)
                .iter()
                .filter_map(|child| self.nodes.get(child))
                .filter(|slot| slot.is_runnable())
                .map(Slot::view),
        );
        Ok(out)
    }

    fn ancestor_of_type(&self, id: &TestNodeId, node_type: TestNodeType) -> Option<TestNode> {
        let mut current = self.nodes.get(id)?;
        loop {
            if current.node.node_type == node_type {
                return Some(current.view());
            }
            current = self.nodes.get(current.node.parent_id.as_ref()?)?;
        }
    }
}

/// Concurrent registry of every known test node.
pub struct TestRegistry {
    tree: RwLock<Tree>,
    events: broadcast::Sender<RegistryEvent>,
}

impl Default for TestRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TestRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestRegistry").finish_non_exhaustive()
    }
}

impl TestRegistry {
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            tree: RwLock::new(Tree::default()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Exclusive lock for structural changes. Waits for every node and shared lock.
    pub async fn lock_global(&self) -> GlobalLock<'_> {
        GlobalLock {
            tree: self.tree.write().await,
            events: &self.events,
        }
    }

    /// Shared lock: a consistent view of the structure. Status updates still
    /// proceed.
    pub async fn acquire_lock(&self) -> SharedLock<'_> {
        SharedLock {
            tree: self.tree.read().await,
        }
    }

    /// Per-node lock for status changes. Holds the structure shared, so the
    /// node cannot be removed or moved while locked.
    pub async fn lock_node(&self, id: &TestNodeId) -> Result<NodeLock<'_>, RegistryError> {
        let tree = self.tree.read().await;
        let slot = tree.get(id)?;
        let lock = slot.lock.clone();
        let status = slot.status.clone();
        let guard = lock.lock_owned().await;
        Ok(NodeLock {
            tree,
            _guard: guard,
            id: id.clone(),
            status,
            events: &self.events,
        })
    }

    /// Set the status of one node.
    pub async fn update_status(
        &self,
        id: &TestNodeId,
        status: TestNodeStatus,
    ) -> Result<(), RegistryError> {
        self.lock_node(id).await?.set_status(status);
        Ok(())
    }

    pub async fn add_solution(
        &self,
        id: TestNodeId,
        display_name: impl Into<String>,
        file_path: Option<PathBuf>,
    ) -> Result<TestNode, RegistryError> {
        self.lock_global()
            .await
            .add_solution(id, display_name, file_path)
    }

    pub async fn add_project(
        &self,
        solution: Option<&TestNodeId>,
        id: TestNodeId,
        display_name: impl Into<String>,
        file_path: Option<PathBuf>,
    ) -> Result<TestNode, RegistryError> {
        self.lock_global()
            .await
            .add_project(solution, id, display_name, file_path)
    }

    /// Remove a project and its whole subtree. Returns the removed ids.
    pub async fn remove_project(&self, id: &TestNodeId) -> Result<Vec<TestNodeId>, RegistryError> {
        self.lock_global().await.remove_project(id)
    }

    pub async fn get(&self, id: &TestNodeId) -> Option<TestNode> {
        self.tree.read().await.nodes.get(id).map(Slot::view)
    }

    pub async fn children(&self, id: &TestNodeId) -> Result<Vec<TestNode>, RegistryError> {
        self.tree.read().await.children(id)
    }

    pub async fn subtree(&self, id: &TestNodeId) -> Result<Vec<TestNode>, RegistryError> {
        self.tree.read().await.subtree(id)
    }

    /// Depth-first flattened view of the whole tree, parents before children.
    pub async fn snapshot(&self) -> Vec<TestNode> {
        self.tree.read().await.snapshot()
    }

    pub async fn len(&self) -> usize {
        self.tree.read().await.nodes.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tree.read().await.nodes.is_empty()
    }
}

/// Exclusive access to the tree.
pub struct GlobalLock<'a> {
    tree: RwLockWriteGuard<'a, Tree>,
    events: &'a broadcast::Sender<RegistryEvent>,
}

impl GlobalLock<'_> {
    pub fn add_solution(
        &mut self,
        id: TestNodeId,
        display_name: impl Into<String>,
        file_path: Option<PathBuf>,
    ) -> Result<TestNode, RegistryError> {
        let mut node = TestNode::container(id, display_name, None, TestNodeType::Solution);
        node.file_path = file_path;
        self.insert_container(node)
    }

    /// Add a project, under `solution` or as a root of its own.
    pub fn add_project(
        &mut self,
        solution: Option<&TestNodeId>,
        id: TestNodeId,
        display_name: impl Into<String>,
        file_path: Option<PathBuf>,
    ) -> Result<TestNode, RegistryError> {
        let mut node = TestNode::container(
            id,
            display_name,
            solution.cloned(),
            TestNodeType::Project,
        );
        node.file_path = file_path;
        self.insert_container(node)
    }

    fn insert_container(&mut self, node: TestNode) -> Result<TestNode, RegistryError> {
        let id = node.id.clone();
        if self.tree.upsert(node, false)? != Upsert::Unchanged {
            self.structure_changed(&id);
        }
        self.get(&id).ok_or(RegistryError::UnknownNode(id))
    }

    pub fn remove_project(&mut self, id: &TestNodeId) -> Result<Vec<TestNodeId>, RegistryError> {
        let parent = self.tree.get(id)?.node.parent_id.clone();
        let removed = self.tree.remove_subtree(id);
        tracing::debug!(project = %id, removed = removed.len(), "Removed project subtree");
        self.structure_changed(parent.as_ref().unwrap_or(id));
        Ok(removed)
    }

    #[must_use]
    pub fn get(&self, id: &TestNodeId) -> Option<TestNode> {
        self.tree.nodes.get(id).map(Slot::view)
    }

    pub fn children(&self, id: &TestNodeId) -> Result<Vec<TestNode>, RegistryError> {
        self.tree.children(id)
    }

    /// Status change while holding the structure exclusively.
    pub fn set_status(&mut self, id: &TestNodeId, status: TestNodeStatus) -> Result<(), RegistryError> {
        let slot = self.tree.get(id)?;
        *slot.status.lock().unwrap_or_else(PoisonError::into_inner) = status.clone();
        let _ = self.events.send(RegistryEvent::StatusChanged {
            id: id.clone(),
            status,
        });
        Ok(())
    }

    pub(crate) fn tree(&mut self) -> &mut Tree {
        &mut self.tree
    }

    pub(crate) fn structure_changed(&self, root: &TestNodeId) {
        let _ = self
            .events
            .send(RegistryEvent::StructureChanged { root: root.clone() });
    }
}

/// Shared, read-only access to the tree.
pub struct SharedLock<'a> {
    tree: RwLockReadGuard<'a, Tree>,
}

impl SharedLock<'_> {
    #[must_use]
    pub fn get(&self, id: &TestNodeId) -> Option<TestNode> {
        self.tree.nodes.get(id).map(Slot::view)
    }

    pub fn children(&self, id: &TestNodeId) -> Result<Vec<TestNode>, RegistryError> {
        self.tree.children(id)
    }

    pub fn subtree(&self, id: &TestNodeId) -> Result<Vec<TestNode>, RegistryError> {
        self.tree.subtree(id)
    }

    /// Tests that actually run below `id` (including `id` itself), skipping
    /// containers and method groups.
    pub fn runnable_tests(&self, id: &TestNodeId) -> Result<Vec<TestNode>, RegistryError> {
        self.tree.runnable_tests(id)
    }

    /// The project `id` belongs to.
    #[must_use]
    pub fn project_of(&self, id: &TestNodeId) -> Option<TestNode> {
        self.tree.ancestor_of_type(id, TestNodeType::Project)
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<TestNode> {
        self.tree.snapshot()
    }
}

/// Status lock on a single node.
pub struct NodeLock<'a> {
    tree: RwLockReadGuard<'a, Tree>,
    _guard: OwnedMutexGuard<()>,
    id: TestNodeId,
    status: Arc<Mutex<TestNodeStatus>>,
    events: &'a broadcast::Sender<RegistryEvent>,
}

impl NodeLock<'_> {
    #[must_use]
    pub fn id(&self) -> &TestNodeId {
        &self.id
    }

    #[must_use]
    pub fn status(&self) -> TestNodeStatus {
        self.status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn node(&self) -> Option<TestNode> {
        self.tree.nodes.get(&self.id).map(Slot::view)
    }

    pub fn set_status(&mut self, status: TestNodeStatus) {
        {
            let mut current = self.status.lock().unwrap_or_else(PoisonError::into_inner);
            if *current == status {
                return;
            }
            *current = status.clone();
        }
        tracing::trace!(node = %self.id, ?status, "Status changed");
        let _ = self.events.send(RegistryEvent::StatusChanged {
            id: self.id.clone(),
            status,
        });
    }
}
