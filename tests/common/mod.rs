//! Shared test utilities and fixtures
//!
//! A scripted `dotnet` that builds instantly and starts an in-process
//! Testing Platform host, plus an editor-side client for the endpoint.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use easy_dotnet_config::{
    ProjectProperties, ProjectPropertiesProvider, PropertiesError, ServiceConfig, SettingsStore,
};
use easy_dotnet_engine::{EndpointServer, Services};
use easy_dotnet_rpc::{ErrorObject, RpcConnection, RpcHandler};
use easy_dotnet_utils::process::memory::{self, InMemoryProcess};
use easy_dotnet_utils::{
    LaunchError, OutputLine, ProcessExit, ProcessHandle, ProcessLauncher, ProcessSpec,
};
use futures_util::future::BoxFuture;
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::net::TcpStream;
use tokio::sync::{OnceCell, mpsc, watch};
use tokio_util::sync::CancellationToken;

pub const SOLUTION: &str = "/repo/App.sln";
pub const PROJECT: &str = "/repo/App.Tests/App.Tests.csproj";
pub const TARGET: &str = "/repo/App.Tests/bin/Debug/net8.0/App.Tests.dll";
pub const ADDS: &str = "App.Tests.MathTests.Adds";
pub const DIVIDES: &str = "App.Tests.MathTests.Divides";
pub const HOST_PID: u32 = 4242;

const WAIT: Duration = Duration::from_secs(10);

fn test_node(uid: &str, state: &str) -> Value {
    let (_, method) = uid.rsplit_once('.').unwrap_or(("", uid));
    let line = if uid == ADDS { 10 } else { 20 };
    let mut node = json!({
        "uid": uid,
        "display-name": method,
        "node-type": "action",
        "execution-state": state,
        "location.type": "App.Tests.MathTests",
        "location.file": "/repo/App.Tests/MathTests.cs",
        "location.line-start": line,
    });
    match state {
        "passed" => node["time.duration-ms"] = json!(3.2),
        "failed" => {
            node["time.duration-ms"] = json!(5);
            node["error.message"] = json!("Attempted to divide by zero.");
        }
        _ => {}
    }
    json!({ "node": node })
}

/// Final state the fake host reports for each known test.
fn outcome(uid: &str) -> &'static str {
    if uid == DIVIDES { "failed" } else { "passed" }
}

/// In-process Testing Platform host, connected back to the client's port.
struct FakeHost {
    connection: Arc<OnceCell<RpcConnection>>,
    exit: watch::Sender<Option<ProcessExit>>,
    requests: Arc<Mutex<Vec<(String, Value)>>>,
    request_debugger: bool,
}

impl RpcHandler for FakeHost {
    fn handle_request(
        &self,
        method: String,
        params: Option<Value>,
    ) -> BoxFuture<'static, Result<Value, ErrorObject>> {
        let connection = self.connection.clone();
        let requests = self.requests.clone();
        let request_debugger = self.request_debugger;
        Box::pin(async move {
            let params = params.unwrap_or(Value::Null);
            requests.lock().unwrap().push((method.clone(), params.clone()));
            let Some(conn) = connection.get() else {
                return Err(ErrorObject::internal("not connected"));
            };
            let run_id = params["runId"].clone();
            let updates = |changes: Value| json!({ "runId": run_id, "changes": changes });
            match method.as_str() {
                "initialize" => Ok(json!({
                    "serverInfo": { "name": "fake-testing-platform", "version": "1.6.0" }
                })),
                "testing/discoverTests" => {
                    let changes = json!([test_node(ADDS, "discovered"), test_node(DIVIDES, "discovered")]);
                    conn.notify("testing/testUpdates/tests", Some(updates(changes))).await.unwrap();
                    conn.notify("testing/testUpdates/tests", Some(updates(Value::Null))).await.unwrap();
                    Ok(Value::Null)
                }
                "testing/runTests" => {
                    if request_debugger {
                        conn.request("client/attachDebugger", Some(json!({ "processId": HOST_PID })))
                            .await
                            .map_err(|e| ErrorObject::internal(e.to_string()))?;
                    }
                    let selected: Vec<String> = match params["tests"].as_array() {
                        Some(tests) => tests
                            .iter()
                            .filter_map(|t| t["uid"].as_str().map(String::from))
                            .collect(),
                        None => vec![ADDS.to_string(), DIVIDES.to_string()],
                    };
                    let running: Vec<Value> = selected.iter().map(|uid| test_node(uid, "in-progress")).collect();
                    conn.notify("testing/testUpdates/tests", Some(updates(json!(running)))).await.unwrap();
                    let done: Vec<Value> = selected.iter().map(|uid| test_node(uid, outcome(uid))).collect();
                    conn.notify("testing/testUpdates/tests", Some(updates(json!(done)))).await.unwrap();
                    conn.notify("testing/testUpdates/tests", Some(updates(Value::Null))).await.unwrap();
                    Ok(Value::Null)
                }
                _ => Err(ErrorObject::method_not_found(&method)),
            }
        })
    }

    fn handle_notification(&self, method: String, _params: Option<Value>) -> BoxFuture<'static, ()> {
        if method == "exit" {
            let _ = self.exit.send(Some(ProcessExit { code: Some(0) }));
        }
        Box::pin(async {})
    }
}

/// Stands in for every external program the service starts.
#[derive(Default)]
pub struct ScriptedDotnet {
    pub launched: Mutex<Vec<ProcessSpec>>,
    /// Requests the fake test host received, across all hosts.
    pub host_requests: Arc<Mutex<Vec<(String, Value)>>>,
    /// Kept alive so in-memory pipes stay open.
    pub children: Mutex<Vec<InMemoryProcess>>,
    /// Test hosts ask for a debugger before running.
    pub request_debugger: bool,
}

impl ScriptedDotnet {
    #[must_use]
    pub fn debugging() -> Self {
        Self {
            request_debugger: true,
            ..Self::default()
        }
    }

    pub fn launched_commands(&self) -> Vec<String> {
        self.launched
            .lock()
            .unwrap()
            .iter()
            .map(ProcessSpec::display)
            .collect()
    }

    pub fn host_calls(&self, method: &str) -> Vec<Value> {
        self.host_requests
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, _)| m == method)
            .map(|(_, params)| params.clone())
            .collect()
    }

    fn start_host(&self, spec: &ProcessSpec) -> ProcessHandle {
        let (handle, child) = memory::pair("testhost", Some(HOST_PID));
        let exit = child.exit_sender();
        self.children.lock().unwrap().push(child);

        let port: u16 = spec
            .args
            .iter()
            .skip_while(|a| *a != "--client-port")
            .nth(1)
            .and_then(|p| p.parse().ok())
            .unwrap();
        let cell = Arc::new(OnceCell::new());
        let host = FakeHost {
            connection: cell.clone(),
            exit,
            requests: self.host_requests.clone(),
            request_debugger: self.request_debugger,
        };
        tokio::spawn(async move {
            let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
            let (read, write) = stream.into_split();
            let conn = RpcConnection::spawn("fake-host", read, write, Arc::new(host));
            let _ = cell.set(conn);
        });
        handle
    }
}

impl ProcessLauncher for ScriptedDotnet {
    fn launch(&self, spec: &ProcessSpec) -> Result<ProcessHandle, LaunchError> {
        self.launched.lock().unwrap().push(spec.clone());
        match spec.args.first().map(String::as_str) {
            Some("build") => {
                let (handle, child) = memory::pair("dotnet", Some(1));
                tokio::spawn(async move {
                    let _ = child
                        .output
                        .send(OutputLine::Stdout("Build succeeded.".into()))
                        .await;
                    child.exit(0);
                });
                Ok(handle)
            }
            Some("exec") => Ok(self.start_host(spec)),
            _ if spec.label == "netcoredbg" => {
                let (handle, child) = memory::pair("netcoredbg", Some(7));
                self.children.lock().unwrap().push(child);
                Ok(handle)
            }
            _ => Err(LaunchError::NotFound {
                program: spec.program.clone(),
            }),
        }
    }
}

/// A Testing Platform project built to [`TARGET`].
pub struct MtpProject;

impl ProjectPropertiesProvider for MtpProject {
    fn properties<'a>(
        &'a self,
        _project: &'a Path,
    ) -> BoxFuture<'a, Result<ProjectProperties, PropertiesError>> {
        Box::pin(async {
            Ok(ProjectProperties {
                target_path: Some(PathBuf::from(TARGET)),
                target_framework: Some("net8.0".into()),
                testing_platform_dotnet_test_support: true,
                is_test_project: true,
            })
        })
    }
}

/// Records every notification the endpoint pushes.
struct Recorder {
    tx: mpsc::UnboundedSender<(String, Value)>,
}

impl RpcHandler for Recorder {
    fn handle_request(
        &self,
        method: String,
        _params: Option<Value>,
    ) -> BoxFuture<'static, Result<Value, ErrorObject>> {
        Box::pin(async move { Err(ErrorObject::method_not_found(&method)) })
    }

    fn handle_notification(&self, method: String, params: Option<Value>) -> BoxFuture<'static, ()> {
        let _ = self.tx.send((method, params.unwrap_or(Value::Null)));
        Box::pin(async {})
    }
}

/// A running endpoint plus one connected editor.
pub struct Harness {
    pub launcher: Arc<ScriptedDotnet>,
    pub services: Arc<Services>,
    pub editor: RpcConnection,
    pub notifications: mpsc::UnboundedReceiver<(String, Value)>,
    pub token: CancellationToken,
    _settings: TempDir,
}

impl Harness {
    pub async fn start(launcher: ScriptedDotnet) -> Self {
        let launcher = Arc::new(launcher);
        let settings_dir = tempfile::tempdir().unwrap();
        let mut config = ServiceConfig::default();
        config.debugger.shutdown_grace_secs = 0;
        config.test_client.exit_grace_secs = 1;

        let services = Arc::new(Services::new(
            &config,
            launcher.clone(),
            Arc::new(MtpProject),
            SettingsStore::open_or_default(settings_dir.path().join("settings.json")),
        ));
        let server = EndpointServer::bind("127.0.0.1:0".parse().unwrap(), services.clone())
            .await
            .unwrap();
        let port = server.local_addr().unwrap().port();
        let token = CancellationToken::new();
        tokio::spawn(server.serve(token.clone()));

        let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let (read, write) = stream.into_split();
        let (tx, notifications) = mpsc::unbounded_channel();
        let editor = RpcConnection::spawn("editor", read, write, Arc::new(Recorder { tx }));
        editor.request("initialize", Some(json!({}))).await.unwrap();

        Self {
            launcher,
            services,
            editor,
            notifications,
            token,
            _settings: settings_dir,
        }
    }

    pub async fn call(&self, method: &str, params: Value) -> Value {
        tokio::time::timeout(WAIT, self.editor.request(method, Some(params)))
            .await
            .unwrap_or_else(|_| panic!("{method} timed out"))
            .unwrap()
    }

    pub async fn discover(&self) -> Value {
        let result = self
            .call("test/discover", json!({ "solution": SOLUTION, "project": PROJECT }))
            .await;
        assert_eq!(result["success"], true, "{result}");
        result
    }

    /// Wait for a `test/statusChanged` of `id` to `kind`, skipping others.
    pub async fn status_of(&mut self, id: &str, kind: &str) -> Value {
        let wait = async {
            while let Some((method, params)) = self.notifications.recv().await {
                if method == "test/statusChanged"
                    && params["id"] == id
                    && params["status"]["kind"] == kind
                {
                    return params["status"].clone();
                }
            }
            panic!("endpoint closed before {id} became {kind}");
        };
        tokio::time::timeout(WAIT, wait)
            .await
            .unwrap_or_else(|_| panic!("{id} never became {kind}"))
    }

    /// Every notification received so far.
    pub fn drain(&mut self) -> Vec<(String, Value)> {
        let mut seen = Vec::new();
        while let Ok(notification) = self.notifications.try_recv() {
            seen.push(notification);
        }
        seen
    }
}

pub fn node<'a>(nodes: &'a Value, id: &str) -> &'a Value {
    nodes
        .as_array()
        .and_then(|nodes| nodes.iter().find(|n| n["id"] == id))
        .unwrap_or_else(|| panic!("{id} missing from {nodes}"))
}
