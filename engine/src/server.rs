//! JSON-RPC endpoint the editor plugin talks to.
//!
//! Loopback TCP, one [`RpcConnection`] per client. Registry changes are
//! pushed to every connection as `test/statusChanged` and `test/treeChanged`
//! notifications.

use std::collections::HashMap;
use std::fmt::Display;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use easy_dotnet_config::ProjectKind;
use easy_dotnet_dap::AttachRequestInterceptor;
use easy_dotnet_hierarchy::RegistryEvent;
use easy_dotnet_rpc::{ErrorObject, RpcConnection, RpcHandler};
use easy_dotnet_types::{SessionId, TestNodeId};
use futures_util::future::BoxFuture;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use crate::Services;
use crate::sessions::DebugStart;

const STATUS_CHANGED: &str = "test/statusChanged";
const TREE_CHANGED: &str = "test/treeChanged";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DebuggerStartParams {
    process_id: Option<u32>,
    program: Option<String>,
    args: Option<Vec<String>>,
    cwd: Option<String>,
    env: Option<HashMap<String, String>>,
    /// Command the editor's `attach` is rewritten to, e.g. `launch`.
    request: Option<String>,
}

impl DebuggerStartParams {
    fn into_interceptor(self) -> AttachRequestInterceptor {
        let mut overrides = Map::new();
        if let Some(pid) = self.process_id {
            overrides.insert("processId".into(), json!(pid));
        }
        let launches = self.program.is_some();
        if let Some(program) = self.program {
            overrides.insert("program".into(), json!(program));
        }
        if let Some(args) = self.args {
            overrides.insert("args".into(), json!(args));
        }
        if let Some(cwd) = self.cwd {
            overrides.insert("cwd".into(), json!(cwd));
        }
        if let Some(env) = self.env {
            overrides.insert("env".into(), json!(env));
        }
        let interceptor = AttachRequestInterceptor::new(overrides);
        match self.request {
            Some(command) => interceptor.rename_to(command),
            None if launches => interceptor.rename_to("launch"),
            None => interceptor,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DebuggerStopParams {
    session_id: u64,
    #[serde(default)]
    force: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DiscoverParams {
    solution: Option<PathBuf>,
    project: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunParams {
    project: PathBuf,
    node_ids: Option<Vec<TestNodeId>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GetDefaultProjectParams {
    solution: String,
    kind: ProjectKind,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetDefaultProjectParams {
    solution: String,
    kind: ProjectKind,
    project: Option<PathBuf>,
}

fn parse<T: DeserializeOwned>(params: Option<Value>) -> Result<T, ErrorObject> {
    serde_json::from_value(params.unwrap_or_else(|| json!({}))).map_err(ErrorObject::invalid_params)
}

/// Domain failure reported as a result, not a JSON-RPC error.
fn failure(message: impl Display) -> Value {
    json!({ "success": false, "message": message.to_string() })
}

fn debug_started(start: DebugStart) -> Value {
    json!({ "success": true, "sessionId": start.session_id, "port": start.port })
}

async fn dispatch(
    services: Arc<Services>,
    token: CancellationToken,
    method: String,
    params: Option<Value>,
) -> Result<Value, ErrorObject> {
    tracing::debug!(%method, "Endpoint request");
    match method.as_str() {
        "initialize" => Ok(json!({
            "serverInfo": { "name": "easy-dotnet", "version": env!("CARGO_PKG_VERSION") }
        })),
        "debugger/start" => {
            let params: DebuggerStartParams = parse(params)?;
            Ok(match services.sessions.start(params.into_interceptor()).await {
                Ok(session) => debug_started(DebugStart::from(&session)),
                Err(e) => failure(e),
            })
        }
        "debugger/stop" => {
            let params: DebuggerStopParams = parse(params)?;
            let id = SessionId::new(params.session_id);
            Ok(if services.sessions.stop(id, params.force).await {
                json!({ "success": true })
            } else {
                failure(format!("unknown debug session {id}"))
            })
        }
        "test/discover" => {
            let params: DiscoverParams = parse(params)?;
            let discovered = services
                .controller
                .discover(params.solution.as_deref(), &params.project, &token)
                .await;
            Ok(match discovered {
                Ok(nodes) => json!({ "success": true, "nodes": nodes }),
                Err(e) => failure(format!("{e:#}")),
            })
        }
        "test/run" => {
            let params: RunParams = parse(params)?;
            let ran = services
                .controller
                .run(&params.project, params.node_ids.as_deref(), &token)
                .await;
            Ok(match ran {
                Ok(results) => json!({ "success": true, "results": results }),
                Err(e) => failure(format!("{e:#}")),
            })
        }
        "test/debug" => {
            let params: RunParams = parse(params)?;
            let started = services
                .controller
                .debug(&params.project, params.node_ids.as_deref(), &token)
                .await;
            Ok(match started {
                Ok(start) => debug_started(start),
                Err(e) => failure(format!("{e:#}")),
            })
        }
        "test/tree" => Ok(json!({ "nodes": services.registry.snapshot().await })),
        "settings/getDefaultProject" => {
            let params: GetDefaultProjectParams = parse(params)?;
            let project = services.settings.default_project(&params.solution, params.kind);
            Ok(json!({ "project": project }))
        }
        "settings/setDefaultProject" => {
            let params: SetDefaultProjectParams = parse(params)?;
            Ok(
                match services
                    .settings
                    .set_default_project(&params.solution, params.kind, params.project)
                {
                    Ok(()) => json!({ "success": true }),
                    Err(e) => failure(e),
                },
            )
        }
        _ => Err(ErrorObject::method_not_found(&method)),
    }
}

struct EndpointHandler {
    services: Arc<Services>,
    token: CancellationToken,
}

impl RpcHandler for EndpointHandler {
    fn handle_request(
        &self,
        method: String,
        params: Option<Value>,
    ) -> BoxFuture<'static, Result<Value, ErrorObject>> {
        Box::pin(dispatch(
            self.services.clone(),
            self.token.child_token(),
            method,
            params,
        ))
    }

    fn handle_notification(&self, method: String, _params: Option<Value>) -> BoxFuture<'static, ()> {
        tracing::trace!(%method, "Ignoring client notification");
        Box::pin(async {})
    }
}

/// Push registry changes to one client until it disconnects.
async fn forward_events(services: Arc<Services>, connection: RpcConnection, token: CancellationToken) {
    let mut events = services.registry.subscribe();
    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            () = connection.closed() => return,
            () = token.cancelled() => return,
        };
        let (method, params) = match event {
            Ok(RegistryEvent::StatusChanged { id, status }) => {
                (STATUS_CHANGED, json!({ "id": id, "status": status }))
            }
            Ok(RegistryEvent::StructureChanged { root }) => (TREE_CHANGED, json!({ "root": root })),
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Client fell behind on test events");
                continue;
            }
            Err(RecvError::Closed) => return,
        };
        if connection.notify(method, Some(params)).await.is_err() {
            return;
        }
    }
}

/// Listening endpoint. Dropping it stops accepting.
pub struct EndpointServer {
    listener: TcpListener,
    services: Arc<Services>,
}

impl std::fmt::Debug for EndpointServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointServer")
            .field("local_addr", &self.listener.local_addr().ok())
            .finish_non_exhaustive()
    }
}

impl EndpointServer {
    pub async fn bind(addr: SocketAddr, services: Arc<Services>) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind endpoint on {addr}"))?;
        Ok(Self { listener, services })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept clients until `token` is cancelled, then close every connection.
    pub async fn serve(self, token: CancellationToken) -> anyhow::Result<()> {
        loop {
            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                () = token.cancelled() => break,
            };
            match accepted {
                Ok((stream, peer)) => self.spawn_client(stream, peer, token.child_token()),
                Err(e) => tracing::warn!("Failed to accept endpoint client: {e}"),
            }
        }
        tracing::info!("Endpoint server stopped");
        Ok(())
    }

    fn spawn_client(&self, stream: TcpStream, peer: SocketAddr, token: CancellationToken) {
        tracing::info!(%peer, "Endpoint client connected");
        let (read, write) = stream.into_split();
        let handler = Arc::new(EndpointHandler {
            services: self.services.clone(),
            token: token.clone(),
        });
        let connection = RpcConnection::spawn(format!("client {peer}"), read, write, handler);
        let services = self.services.clone();
        tokio::spawn(async move {
            let events = tokio::spawn(forward_events(services, connection.clone(), token.clone()));
            tokio::select! {
                () = connection.closed() => {}
                () = token.cancelled() => connection.close().await,
            }
            token.cancel();
            let _ = events.await;
            tracing::info!(%peer, "Endpoint client disconnected");
        });
    }
}
