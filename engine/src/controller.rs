//! Build, discover, run and debug the tests of one project.
//!
//! Projects using the Testing Platform go through [`TestClient`]; everything
//! else takes the `dotnet test` path in [`crate::vstest`]. Every status change
//! goes through the registry's node lock.

use std::collections::HashSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, anyhow, bail};
use easy_dotnet_config::{ProjectProperties, PropertiesCache};
use easy_dotnet_dap::{AttachRequestInterceptor, SessionState};
use easy_dotnet_hierarchy::{RegistryError, TestRegistry, process_test_discovery};
use easy_dotnet_mtp::{
    AttachDebuggerHandler, AttachError, TestClient, TestClientConfig, TestClientError,
    TestNodeRef, TestNodeUpdate,
};
use easy_dotnet_types::{
    DiscoveredTest, TestFailure, TestNode, TestNodeId, TestNodeStatus, VsTestDisplayPolicies,
};
use easy_dotnet_utils::ProcessLauncher;
use futures_util::future::BoxFuture;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::msbuild::build_project;
use crate::sessions::{DebugSessionManager, DebugStart};
use crate::vstest::{self, vstest_case_id};

/// Node id of a project: its path as given.
#[must_use]
pub fn project_node_id(project: &Path) -> TestNodeId {
    TestNodeId::new(project.to_string_lossy())
}

fn file_display_name(path: &Path) -> String {
    path.file_stem().map_or_else(
        || path.display().to_string(),
        |stem| stem.to_string_lossy().into_owned(),
    )
}

fn target_path(project: &Path, properties: &ProjectProperties) -> anyhow::Result<PathBuf> {
    properties
        .target_path
        .clone()
        .ok_or_else(|| anyhow!("{} has no TargetPath", project.display()))
}

/// Status recorded after `error` ended an operation.
fn failure_status(error: &anyhow::Error, token: &CancellationToken) -> TestNodeStatus {
    let cancelled = token.is_cancelled()
        || error
            .downcast_ref::<TestClientError>()
            .is_some_and(TestClientError::is_cancelled);
    if cancelled {
        TestNodeStatus::Cancelled
    } else {
        TestNodeStatus::Failed {
            duration_ms: None,
            error: TestFailure::new(format!("{error:#}")),
        }
    }
}

/// Nodes of a cancelled run read `Cancelling` while the test host shuts down.
async fn mark_cancelling<T>(
    registry: &TestRegistry,
    ids: &[TestNodeId],
    result: &Result<T, TestClientError>,
    token: &CancellationToken,
) {
    if let Err(e) = result
        && (e.is_cancelled() || token.is_cancelled())
    {
        set_statuses(registry, ids, &TestNodeStatus::Cancelling).await;
    }
}

async fn cancellable<T>(
    token: &CancellationToken,
    work: impl Future<Output = anyhow::Result<T>>,
) -> anyhow::Result<T> {
    tokio::select! {
        result = work => result,
        () = token.cancelled() => Err(anyhow!("operation cancelled")),
    }
}

/// Set `status` on every node that still exists.
async fn set_statuses(registry: &TestRegistry, ids: &[TestNodeId], status: &TestNodeStatus) {
    for id in ids {
        set_status(registry, id, status.clone()).await;
    }
}

async fn set_status(registry: &TestRegistry, id: &TestNodeId, status: TestNodeStatus) {
    match registry.update_status(id, status).await {
        Ok(()) => {}
        // Removed by a concurrent discovery.
        Err(RegistryError::UnknownNode(_)) => tracing::debug!(node = %id, "Skipping status of removed node"),
        Err(e) => tracing::warn!(node = %id, "Failed to update status: {e}"),
    }
}

/// Final status per node id from an MTP run.
fn mtp_outcomes(updates: &[TestNodeUpdate]) -> Vec<(TestNodeId, TestNodeStatus)> {
    updates
        .iter()
        .filter_map(|update| {
            let status = update.node.outcome()?;
            Some((TestNodeId::new(update.node.uid.clone()), status))
        })
        .collect()
}

/// Apply outcomes; selected tests without one go back to idle.
async fn apply_outcomes(
    registry: &TestRegistry,
    selected: &[TestNodeId],
    outcomes: Vec<(TestNodeId, TestNodeStatus)>,
) -> Vec<TestNode> {
    let mut reported = HashSet::new();
    for (id, status) in outcomes {
        set_status(registry, &id, status).await;
        reported.insert(id);
    }
    let missing: Vec<TestNodeId> = selected
        .iter()
        .filter(|id| !reported.contains(*id))
        .cloned()
        .collect();
    if !missing.is_empty() {
        tracing::debug!(count = missing.len(), "Tests without a reported outcome");
        set_statuses(registry, &missing, &TestNodeStatus::Idle).await;
    }

    let mut nodes = Vec::with_capacity(selected.len());
    for id in selected {
        if let Some(node) = registry.get(id).await {
            nodes.push(node);
        }
    }
    nodes
}

/// Runnable tests picked for a run.
struct Selection {
    project: PathBuf,
    tests: Vec<TestNode>,
    /// The whole project was requested, so no filter is needed.
    everything: bool,
}

impl Selection {
    fn ids(&self) -> Vec<TestNodeId> {
        self.tests.iter().map(|node| node.id.clone()).collect()
    }

    fn mtp_filter(&self) -> Option<Vec<TestNodeRef>> {
        (!self.everything).then(|| {
            self.tests
                .iter()
                .map(|node| TestNodeRef {
                    uid: node.id.as_str().to_string(),
                    display_name: node.display_name.clone(),
                })
                .collect()
        })
    }

    fn vstest_filter(&self) -> Option<Vec<String>> {
        (!self.everything).then(|| {
            self.tests
                .iter()
                .filter_map(|node| node.fully_qualified_name.clone())
                .collect()
        })
    }
}

/// Starts a proxied debug session when the test host asks for a debugger
/// and hands the editor-facing details to the waiting caller.
struct DebugOnAttach {
    sessions: Arc<DebugSessionManager>,
    started: Mutex<Option<oneshot::Sender<DebugStart>>>,
}

impl AttachDebuggerHandler for DebugOnAttach {
    fn attach(&self, process_id: u32) -> BoxFuture<'static, Result<(), AttachError>> {
        let sessions = self.sessions.clone();
        let started = self
            .started
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        Box::pin(async move {
            let Some(started) = started else {
                return Err("debugger already attached".into());
            };
            let session = sessions
                .start(AttachRequestInterceptor::process_id(process_id))
                .await?;
            let mut state = session.subscribe_state();
            let _ = started.send(DebugStart::from(&session));
            // The host resumes once the editor is attached.
            let reached = state
                .wait_for(|s| matches!(s, SessionState::Active | SessionState::Disposed))
                .await
                .map(|s| *s);
            match reached {
                Ok(SessionState::Active) => Ok(()),
                _ => Err("debug session ended before the editor attached".into()),
            }
        })
    }
}

/// Test operations against the shared registry.
pub struct TestController {
    registry: Arc<TestRegistry>,
    launcher: Arc<dyn ProcessLauncher>,
    properties: PropertiesCache,
    sessions: Arc<DebugSessionManager>,
    dotnet: String,
    client_config: TestClientConfig,
    policies: VsTestDisplayPolicies,
}

impl std::fmt::Debug for TestController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestController")
            .field("dotnet", &self.dotnet)
            .finish_non_exhaustive()
    }
}

impl TestController {
    #[must_use]
    pub fn new(
        registry: Arc<TestRegistry>,
        launcher: Arc<dyn ProcessLauncher>,
        properties: PropertiesCache,
        sessions: Arc<DebugSessionManager>,
        dotnet: impl Into<String>,
        client_config: TestClientConfig,
        policies: VsTestDisplayPolicies,
    ) -> Self {
        Self {
            registry,
            launcher,
            properties,
            sessions,
            dotnet: dotnet.into(),
            client_config,
            policies,
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<TestRegistry> {
        &self.registry
    }

    async fn register_project(
        &self,
        solution: Option<&Path>,
        project: &Path,
    ) -> anyhow::Result<TestNodeId> {
        let mut lock = self.registry.lock_global().await;
        let solution_id = match solution {
            Some(path) => Some(
                lock.add_solution(
                    project_node_id(path),
                    file_display_name(path),
                    Some(path.to_path_buf()),
                )?
                .id,
            ),
            None => None,
        };
        let node = lock.add_project(
            solution_id.as_ref(),
            project_node_id(project),
            file_display_name(project),
            Some(project.to_path_buf()),
        )?;
        Ok(node.id)
    }

    /// Build `project`, discover its tests and fold them into the tree.
    /// Returns the project's subtree.
    pub async fn discover(
        &self,
        solution: Option<&Path>,
        project: &Path,
        token: &CancellationToken,
    ) -> anyhow::Result<Vec<TestNode>> {
        let project_id = self.register_project(solution, project).await?;
        match self.discover_tests(project, &project_id, token).await {
            Ok(()) => {
                set_status(&self.registry, &project_id, TestNodeStatus::Idle).await;
                Ok(self.registry.subtree(&project_id).await?)
            }
            Err(e) => {
                tracing::warn!(project = %project.display(), "Test discovery failed: {e:#}");
                set_status(&self.registry, &project_id, failure_status(&e, token)).await;
                Err(e)
            }
        }
    }

    async fn discover_tests(
        &self,
        project: &Path,
        project_id: &TestNodeId,
        token: &CancellationToken,
    ) -> anyhow::Result<()> {
        set_status(&self.registry, project_id, TestNodeStatus::Building).await;
        cancellable(token, build_project(self.launcher.as_ref(), &self.dotnet, project)).await?;

        set_status(&self.registry, project_id, TestNodeStatus::Discovering).await;
        let properties = self.properties.get(project).await?;
        let tests: Vec<DiscoveredTest> = if properties.uses_testing_platform() {
            let target = target_path(project, &properties)?;
            let client = TestClient::create(
                &target,
                self.launcher.as_ref(),
                self.client_config.clone(),
                None,
                token,
            )
            .await?;
            let updates = client.discover_tests(token).await;
            client.dispose().await;
            updates?
                .iter()
                .filter(|update| update.node.is_test())
                .map(|update| DiscoveredTest::from_mtp(&update.node.to_record()))
                .collect()
        } else {
            let list = vstest::list_tests(self.launcher.as_ref(), &self.dotnet, project);
            cancellable(token, list)
                .await?
                .iter()
                .map(|case| DiscoveredTest::from_vstest(case, &self.policies))
                .collect()
        };

        let report = process_test_discovery(&self.registry, project_id, &tests).await?;
        if !report.conflicts.is_empty() {
            tracing::warn!(
                project = %project.display(),
                conflicts = report.conflicts.len(),
                "Some test ids belong to another project"
            );
        }
        Ok(())
    }

    /// Resolve `node_ids` (or the whole project) to runnable tests of `project`.
    async fn select(
        &self,
        project: &Path,
        node_ids: Option<&[TestNodeId]>,
    ) -> anyhow::Result<Selection> {
        let project_id = project_node_id(project);
        let lock = self.registry.acquire_lock().await;
        if lock.get(&project_id).is_none() {
            bail!("{} has not been discovered", project.display());
        }
        let requested = match node_ids {
            Some(ids) if !ids.is_empty() => ids.to_vec(),
            _ => vec![project_id.clone()],
        };
        let everything = requested == [project_id.clone()];

        let mut seen = HashSet::new();
        let mut tests = Vec::new();
        for id in &requested {
            let owner = lock.project_of(id).map(|node| node.id);
            if owner.as_ref() != Some(&project_id) {
                bail!("{id} is not a test node of {}", project.display());
            }
            for node in lock.runnable_tests(id)? {
                if seen.insert(node.id.clone()) {
                    tests.push(node);
                }
            }
        }
        Ok(Selection {
            project: project.to_path_buf(),
            tests,
            everything,
        })
    }

    /// Build and run the selected tests. Returns their nodes with final statuses.
    pub async fn run(
        &self,
        project: &Path,
        node_ids: Option<&[TestNodeId]>,
        token: &CancellationToken,
    ) -> anyhow::Result<Vec<TestNode>> {
        let selection = self.select(project, node_ids).await?;
        if selection.tests.is_empty() {
            return Ok(Vec::new());
        }
        let ids = selection.ids();
        set_statuses(&self.registry, &ids, &TestNodeStatus::Queued).await;
        tracing::info!(project = %project.display(), tests = ids.len(), "Running tests");

        match self.execute(&selection, token).await {
            Ok(outcomes) => Ok(apply_outcomes(&self.registry, &ids, outcomes).await),
            Err(e) => {
                tracing::warn!(project = %project.display(), "Test run failed: {e:#}");
                set_statuses(&self.registry, &ids, &failure_status(&e, token)).await;
                Err(e)
            }
        }
    }

    async fn build_and_probe(
        &self,
        project: &Path,
        token: &CancellationToken,
    ) -> anyhow::Result<ProjectProperties> {
        let project_id = project_node_id(project);
        set_status(&self.registry, &project_id, TestNodeStatus::Building).await;
        let built =
            cancellable(token, build_project(self.launcher.as_ref(), &self.dotnet, project)).await;
        let status = match &built {
            Ok(()) => TestNodeStatus::Idle,
            Err(e) => failure_status(e, token),
        };
        set_status(&self.registry, &project_id, status).await;
        built?;
        Ok(self.properties.get(project).await?)
    }

    async fn execute(
        &self,
        selection: &Selection,
        token: &CancellationToken,
    ) -> anyhow::Result<Vec<(TestNodeId, TestNodeStatus)>> {
        let properties = self.build_and_probe(&selection.project, token).await?;
        set_statuses(&self.registry, &selection.ids(), &TestNodeStatus::Running).await;

        if properties.uses_testing_platform() {
            let target = target_path(&selection.project, &properties)?;
            let client = TestClient::create(
                &target,
                self.launcher.as_ref(),
                self.client_config.clone(),
                None,
                token,
            )
            .await?;
            let filter = selection.mtp_filter();
            let updates = client.run_tests(filter.as_deref(), token).await;
            mark_cancelling(&self.registry, &selection.ids(), &updates, token).await;
            client.dispose().await;
            Ok(mtp_outcomes(&updates?))
        } else {
            let filter = selection.vstest_filter();
            let run = vstest::run_tests(
                self.launcher.as_ref(),
                &self.dotnet,
                &selection.project,
                filter.as_deref(),
            );
            let outcomes = cancellable(token, run).await?;
            Ok(outcomes
                .into_iter()
                .map(|outcome| {
                    let id = TestNodeId::new(vstest_case_id(&selection.project, &outcome.name));
                    (id, outcome.status)
                })
                .collect())
        }
    }

    /// Build the project and start the selected tests under the debugger.
    ///
    /// Returns once the test host has asked for a debugger and the proxy is
    /// listening; the run itself finishes in the background and records its
    /// outcomes in the registry.
    pub async fn debug(
        &self,
        project: &Path,
        node_ids: Option<&[TestNodeId]>,
        token: &CancellationToken,
    ) -> anyhow::Result<DebugStart> {
        let selection = self.select(project, node_ids).await?;
        if selection.tests.is_empty() {
            bail!("no tests selected in {}", project.display());
        }
        let ids = selection.ids();
        set_statuses(&self.registry, &ids, &TestNodeStatus::Queued).await;

        let properties = match self.build_and_probe(project, token).await {
            Ok(properties) => properties,
            Err(e) => {
                set_statuses(&self.registry, &ids, &failure_status(&e, token)).await;
                return Err(e);
            }
        };
        if !properties.uses_testing_platform() {
            set_statuses(&self.registry, &ids, &TestNodeStatus::Idle).await;
            bail!(
                "debugging requires the Testing Platform; {} uses VSTest",
                project.display()
            );
        }
        let target = target_path(project, &properties)?;

        let (started_tx, started_rx) = oneshot::channel();
        let attach: Arc<dyn AttachDebuggerHandler> = Arc::new(DebugOnAttach {
            sessions: self.sessions.clone(),
            started: Mutex::new(Some(started_tx)),
        });
        let client = TestClient::create(
            &target,
            self.launcher.as_ref(),
            self.client_config.clone(),
            Some(attach),
            token,
        )
        .await
        .context("failed to start test host for debugging");
        let client = match client {
            Ok(client) => client,
            Err(e) => {
                set_statuses(&self.registry, &ids, &failure_status(&e, token)).await;
                return Err(e);
            }
        };
        set_statuses(&self.registry, &ids, &TestNodeStatus::Debugging).await;

        let registry = self.registry.clone();
        let filter = selection.mtp_filter();
        let run_token = token.clone();
        let run = tokio::spawn(async move {
            let updates = client.run_tests(filter.as_deref(), &run_token).await;
            mark_cancelling(&registry, &ids, &updates, &run_token).await;
            client.dispose().await;
            match updates {
                Ok(updates) => {
                    apply_outcomes(&registry, &ids, mtp_outcomes(&updates)).await;
                }
                Err(e) => {
                    let error = anyhow::Error::new(e);
                    tracing::warn!("Debug run failed: {error:#}");
                    set_statuses(&registry, &ids, &failure_status(&error, &run_token)).await;
                }
            }
        });

        match started_rx.await {
            Ok(start) => {
                tracing::info!(session = %start.session_id, port = start.port, "Test debug session ready");
                Ok(start)
            }
            Err(_) => {
                // The run ended without the host asking for a debugger.
                let _ = run.await;
                bail!("test host finished without requesting a debugger")
            }
        }
    }
}
