//! Testing Platform client.
//!
//! [`TestClient::create`] starts a test host in server mode pointed at a
//! loopback listener, accepts its connection and performs the `initialize`
//! handshake. Discover and run calls are then correlated with their streamed
//! updates through a [`RunCorrelator`].

use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use easy_dotnet_rpc::{ErrorObject, RpcConnection, RpcHandler};
use easy_dotnet_types::RunId;
use easy_dotnet_utils::{ProcessHandle, ProcessLauncher, ProcessSpec, spawn_output_logger};
use futures_util::future::BoxFuture;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::correlator::{PushOutcome, RunCorrelator};
use crate::error::{CancelReason, TestClientError};
use crate::protocol::{
    ATTACH_DEBUGGER, CLIENT_LOG, ClientCapabilities, ClientInfo, DISCOVER_TESTS, EXIT, INITIALIZE,
    InitializeParams, InitializeResult, LogLevel, LogParams, RUN_TESTS, TELEMETRY_UPDATE,
    TEST_UPDATES, TestNodeRef, TestNodeUpdate, TestUpdatesParams, TestingCapabilities,
};

pub type AttachError = Box<dyn std::error::Error + Send + Sync>;

/// Serves `client/attachDebugger`: attach a debugger to the test host process
/// before it starts executing tests.
pub trait AttachDebuggerHandler: Send + Sync + 'static {
    fn attach(&self, process_id: u32) -> BoxFuture<'static, Result<(), AttachError>>;
}

#[derive(Debug, Clone)]
pub struct TestClientConfig {
    pub connect_timeout: Duration,
    /// Hard ceiling for a single discover or run call.
    pub run_timeout: Duration,
    pub exit_grace: Duration,
    pub client_name: String,
    pub client_version: String,
}

impl Default for TestClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(60),
            run_timeout: Duration::from_secs(180),
            exit_grace: Duration::from_secs(5),
            client_name: "easy-dotnet".into(),
            client_version: env!("CARGO_PKG_VERSION").into(),
        }
    }
}

/// Command line for a test host listening back on `port`.
///
/// `.dll` test assemblies run through `dotnet exec`; apphosts run directly.
#[must_use]
pub fn test_host_spec(test_exe: &Path, port: u16) -> ProcessSpec {
    let path = test_exe.to_string_lossy().into_owned();
    let is_dll = test_exe
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("dll"));
    let spec = if is_dll {
        ProcessSpec::new("dotnet").args(["exec", path.as_str()])
    } else {
        ProcessSpec::new(path.as_str())
    };
    let spec = match test_exe.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => spec.cwd(dir),
        _ => spec,
    };
    spec.args([
        "--server".to_string(),
        "--client-host".to_string(),
        Ipv4Addr::LOCALHOST.to_string(),
        "--client-port".to_string(),
        port.to_string(),
    ])
    .label("testhost")
}

struct ClientHandler {
    correlator: Arc<RunCorrelator>,
    attach: Option<Arc<dyn AttachDebuggerHandler>>,
}

impl RpcHandler for ClientHandler {
    fn handle_request(
        &self,
        method: String,
        params: Option<Value>,
    ) -> BoxFuture<'static, Result<Value, ErrorObject>> {
        let attach = self.attach.clone();
        Box::pin(async move {
            if method != ATTACH_DEBUGGER {
                return Err(ErrorObject::method_not_found(&method));
            }
            let Some(attach) = attach else {
                return Err(ErrorObject::method_not_found(&method));
            };
            let process_id = params
                .as_ref()
                .and_then(|p| p.get("processId"))
                .and_then(Value::as_u64)
                .and_then(|pid| u32::try_from(pid).ok())
                .ok_or_else(|| ErrorObject::invalid_params("missing processId"))?;
            tracing::info!(process_id, "Test host requested debugger attach");
            attach
                .attach(process_id)
                .await
                .map_err(|e| ErrorObject::internal(format!("debugger attach failed: {e}")))?;
            Ok(Value::Null)
        })
    }

    fn handle_notification(&self, method: String, params: Option<Value>) -> BoxFuture<'static, ()> {
        match method.as_str() {
            TEST_UPDATES => self.test_updates(params),
            CLIENT_LOG => log_from_host(params),
            TELEMETRY_UPDATE => tracing::trace!(?params, "Test host telemetry"),
            _ => tracing::debug!(%method, "Ignoring test host notification"),
        }
        Box::pin(async {})
    }
}

impl ClientHandler {
    fn test_updates(&self, params: Option<Value>) {
        let params: TestUpdatesParams =
            match serde_json::from_value(params.unwrap_or(Value::Null)) {
                Ok(params) => params,
                Err(e) => {
                    tracing::warn!("Malformed test update: {e}");
                    return;
                }
            };
        let run_id = RunId::new(params.run_id);
        let count = params.changes.as_ref().map_or(0, Vec::len);
        match self.correlator.push(&run_id, params.changes) {
            PushOutcome::Buffered => tracing::trace!(%run_id, count, "Buffered test updates"),
            PushOutcome::Completed => tracing::debug!(%run_id, "Test run stream completed"),
            PushOutcome::Dropped => {
                tracing::debug!(%run_id, "Dropping updates for unknown run");
            }
        }
    }
}

fn log_from_host(params: Option<Value>) {
    let Some(Ok(log)) = params.map(serde_json::from_value::<LogParams>) else {
        return;
    };
    let message = log.message;
    match LogLevel::from_wire(&log.level) {
        LogLevel::Trace => tracing::trace!(source = "testhost", "{message}"),
        LogLevel::Debug => tracing::debug!(source = "testhost", "{message}"),
        LogLevel::Information => tracing::info!(source = "testhost", "{message}"),
        LogLevel::Warning => tracing::warn!(source = "testhost", "{message}"),
        LogLevel::Error => tracing::error!(source = "testhost", "{message}"),
    }
}

/// Token cancelled by either `parent` or the expiry of `timeout`.
///
/// The timer stops once the returned guard is dropped.
fn linked_timeout_token(
    parent: &CancellationToken,
    timeout: Duration,
) -> (CancellationToken, tokio_util::sync::DropGuard) {
    let linked = parent.child_token();
    let timer = linked.clone();
    tokio::spawn(async move {
        tokio::select! {
            () = tokio::time::sleep(timeout) => timer.cancel(),
            () = timer.cancelled() => {}
        }
    });
    (linked.clone(), linked.drop_guard())
}

/// Connected, initialized test host.
pub struct TestClient {
    connection: RpcConnection,
    process: ProcessHandle,
    correlator: Arc<RunCorrelator>,
    config: TestClientConfig,
    server: InitializeResult,
    disposed: AtomicBool,
}

impl std::fmt::Debug for TestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestClient")
            .field("process", &self.process)
            .field("active_runs", &self.correlator.active_runs())
            .finish_non_exhaustive()
    }
}

impl TestClient {
    pub async fn create(
        test_exe: &Path,
        launcher: &dyn ProcessLauncher,
        config: TestClientConfig,
        attach: Option<Arc<dyn AttachDebuggerHandler>>,
        token: &CancellationToken,
    ) -> Result<Self, TestClientError> {
        let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
            .await
            .map_err(TestClientError::Bind)?;
        let port = listener.local_addr().map_err(TestClientError::Bind)?.port();

        let spec = test_host_spec(test_exe, port);
        tracing::info!(command = %spec.display(), "Starting test host");
        let mut process = launcher.launch(&spec)?;
        if let Some(output) = process.take_output() {
            spawn_output_logger(spec.label.clone(), output);
        }

        let accepted = tokio::select! {
            accepted = tokio::time::timeout(config.connect_timeout, listener.accept()) => accepted,
            () = token.cancelled() => {
                process.force_terminate().await;
                return Err(TestClientError::Cancelled(CancelReason::Caller));
            }
            exit = process.wait() => {
                tracing::warn!(code = ?exit.code, "Test host exited before connecting");
                return Err(TestClientError::ChannelClosed);
            }
        };
        let stream = match accepted {
            Ok(Ok((stream, _))) => stream,
            Ok(Err(e)) => {
                process.force_terminate().await;
                return Err(TestClientError::Bind(e));
            }
            Err(_) => {
                process.force_terminate().await;
                return Err(TestClientError::ConnectTimeout(config.connect_timeout));
            }
        };
        drop(listener);

        let correlator = RunCorrelator::new();
        let (read, write) = stream.into_split();
        let connection = RpcConnection::spawn(
            "testhost",
            read,
            write,
            Arc::new(ClientHandler {
                correlator: correlator.clone(),
                attach,
            }),
        );

        let params = InitializeParams {
            process_id: std::process::id(),
            client_info: ClientInfo {
                name: config.client_name.clone(),
                version: config.client_version.clone(),
            },
            capabilities: ClientCapabilities {
                testing: TestingCapabilities {
                    debugger_provider: true,
                },
            },
        };
        let handshake = async {
            let params = serde_json::to_value(&params)?;
            let result = connection
                .request_timeout(INITIALIZE, Some(params), config.connect_timeout)
                .await
                .map_err(TestClientError::Handshake)?;
            Ok::<_, TestClientError>(serde_json::from_value::<InitializeResult>(result)?)
        };
        let server = match handshake.await {
            Ok(server) => server,
            Err(e) => {
                connection.close().await;
                process.force_terminate().await;
                return Err(e);
            }
        };
        if let Some(info) = &server.server_info {
            tracing::info!(server = %info.name, version = ?info.version, "Test host initialized");
        }

        Ok(Self {
            connection,
            process,
            correlator,
            config,
            server,
            disposed: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn server_info(&self) -> &InitializeResult {
        &self.server
    }

    #[must_use]
    pub fn process_id(&self) -> Option<u32> {
        self.process.pid()
    }

    /// Discover every test the host knows about.
    pub async fn discover_tests(
        &self,
        token: &CancellationToken,
    ) -> Result<Vec<TestNodeUpdate>, TestClientError> {
        let updates = self.invoke(DISCOVER_TESTS, json!({}), token).await?;
        Ok(latest_per_uid(updates, |_| true))
    }

    /// Run the given tests, or all tests with `None`. Returns final outcomes only.
    pub async fn run_tests(
        &self,
        filter: Option<&[TestNodeRef]>,
        token: &CancellationToken,
    ) -> Result<Vec<TestNodeUpdate>, TestClientError> {
        let params = match filter {
            Some(tests) => json!({ "tests": tests }),
            None => json!({}),
        };
        let updates = self.invoke(RUN_TESTS, params, token).await?;
        Ok(latest_per_uid(updates, |update| {
            update
                .node
                .execution_state
                .is_some_and(|state| !state.is_transient())
        }))
    }

    async fn invoke(
        &self,
        method: &str,
        mut params: Value,
        token: &CancellationToken,
    ) -> Result<Vec<TestNodeUpdate>, TestClientError> {
        let run_id = RunId::new(uuid::Uuid::new_v4().to_string());
        let mut handle = self.correlator.register(run_id.clone());
        params["runId"] = Value::String(run_id.as_str().to_string());
        tracing::debug!(%run_id, %method, "Starting test host call");

        let (linked, _timer) = linked_timeout_token(token, self.config.run_timeout);
        // The request itself is not retracted on cancellation.
        let call = self.connection.request(method, Some(params));
        tokio::pin!(call);
        let mut call_done = false;

        loop {
            tokio::select! {
                biased;
                updates = handle.completed() => {
                    return updates.ok_or(TestClientError::ChannelClosed);
                }
                result = &mut call, if !call_done => {
                    call_done = true;
                    result?;
                }
                () = self.connection.closed() => {
                    tracing::warn!(%run_id, %method, "Test host disconnected mid-call");
                    return Err(TestClientError::ChannelClosed);
                }
                () = linked.cancelled() => {
                    let reason = if token.is_cancelled() {
                        CancelReason::Caller
                    } else {
                        CancelReason::Timeout
                    };
                    tracing::info!(%run_id, %method, %reason, "Test host call cancelled");
                    return Err(TestClientError::Cancelled(reason));
                }
            }
        }
    }

    /// Best-effort ordered teardown: `exit` notification, close the channel
    /// and socket, wait for the host to exit, then kill its tree. Every step
    /// runs even if an earlier one fails. Idempotent.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.connection.notify(EXIT, None).await {
            tracing::debug!("Failed to send exit to test host: {e}");
        }
        self.connection.close().await;
        match self.process.terminate(self.config.exit_grace).await {
            Some(exit) => tracing::debug!(code = ?exit.code, "Test host exited"),
            None => tracing::warn!("Test host did not exit after kill"),
        }
    }
}

/// Keep the last update per node uid, in first-seen order.
fn latest_per_uid(
    updates: Vec<TestNodeUpdate>,
    keep: impl Fn(&TestNodeUpdate) -> bool,
) -> Vec<TestNodeUpdate> {
    let mut order: Vec<String> = Vec::new();
    let mut latest: std::collections::HashMap<String, TestNodeUpdate> =
        std::collections::HashMap::new();
    for update in updates.into_iter().filter(|u| keep(u)) {
        let uid = update.node.uid.clone();
        if latest.insert(uid.clone(), update).is_none() {
            order.push(uid);
        }
    }
    order
        .into_iter()
        .filter_map(|uid| latest.remove(&uid))
        .collect()
}
