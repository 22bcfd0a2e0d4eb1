//! Debug session coordinator.
//!
//! A [`DebugSession`] owns one debugger process and the single editor
//! connection accepted on its loopback listener. Once connected, four tasks
//! form the pump:
//!
//! - the client reader decodes editor frames, runs client-side interceptors,
//!   renumbers `seq` from the session counter and queues them for the debugger;
//! - the debugger writer drains that queue into the debugger's stdin;
//! - the debugger reader decodes debugger frames, hands replies to synthetic
//!   requests to their waiters, restores the client's `request_seq` on the
//!   rest, and queues them for the processor;
//! - the processor runs debugger-side interceptors and writes frames to the
//!   editor strictly in arrival order.
//!
//! Because nested replies are routed by the reader while the processor waits,
//! a converter's round-trip never blocks on the frame it is converting.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use easy_dotnet_rpc::{FrameReader, FrameWriter};
use easy_dotnet_types::SessionId;
use easy_dotnet_utils::{
    BoxedReader, BoxedWriter, ProcessHandle, ProcessLauncher, ProcessSpec, StdioMode,
    spawn_output_logger,
};
use futures_util::future::BoxFuture;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::converter::{ConversionError, NestedVariables};
use crate::error::DapError;
use crate::interceptor::{DapInterceptor, Direction};
use crate::protocol::{ProtocolMessage, Request, Response};
use crate::variables::{Variable, variables_from_body};

const DEBUGGER_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct DebugSessionConfig {
    pub debugger: ProcessSpec,
    pub listen_addr: IpAddr,
    pub accept_timeout: Duration,
    pub shutdown_grace: Duration,
    pub nested_request_timeout: Duration,
}

impl DebugSessionConfig {
    #[must_use]
    pub fn new(debugger: ProcessSpec) -> Self {
        Self {
            debugger,
            listen_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            accept_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(5),
            nested_request_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Starting,
    Active,
    Stopping,
    Disposed,
}

type FailureHook = Box<dyn FnOnce(&DapError) + Send>;
type DisposeHook = Box<dyn FnOnce() + Send>;

/// Callbacks fired at most once each.
#[derive(Default)]
pub struct SessionHooks {
    on_failure: Option<FailureHook>,
    on_dispose: Option<DisposeHook>,
}

impl SessionHooks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Called when the session fails to start: spawn, bind, accept, or the
    /// debugger exiting before the editor connected.
    #[must_use]
    pub fn on_failure(mut self, hook: impl FnOnce(&DapError) + Send + 'static) -> Self {
        self.on_failure = Some(Box::new(hook));
        self
    }

    /// Called once teardown has finished.
    #[must_use]
    pub fn on_dispose(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_dispose = Some(Box::new(hook));
        self
    }
}

/// Removes a key from a pending map when dropped.
struct PendingGuard<'a, V> {
    map: &'a DashMap<i64, V>,
    key: i64,
}

impl<V> Drop for PendingGuard<'_, V> {
    fn drop(&mut self) {
        self.map.remove(&self.key);
    }
}

/// Sequence bookkeeping shared by the read loops and synthetic requests.
struct Routing {
    next_seq: AtomicI64,
    /// proxy seq → client seq for forwarded client requests.
    client_seqs: DashMap<i64, i64>,
    /// Synthetic requests awaiting their response.
    nested: DashMap<i64, oneshot::Sender<Response>>,
}

impl Routing {
    fn new() -> Self {
        Self {
            next_seq: AtomicI64::new(1),
            client_seqs: DashMap::new(),
            nested: DashMap::new(),
        }
    }

    fn allocate_seq(&self) -> i64 {
        self.next_seq.fetch_add(1, Ordering::SeqCst)
    }
}

/// Issues synthetic `variables` requests on behalf of converters.
struct NestedRequester {
    routing: Arc<Routing>,
    debugger_tx: mpsc::Sender<Value>,
    timeout: Duration,
}

impl NestedVariables for NestedRequester {
    fn variables(
        &self,
        variables_reference: i64,
    ) -> BoxFuture<'_, Result<Vec<Variable>, ConversionError>> {
        Box::pin(async move {
            let seq = self.routing.allocate_seq();
            let (tx, rx) = oneshot::channel();
            self.routing.nested.insert(seq, tx);
            let _guard = PendingGuard {
                map: &self.routing.nested,
                key: seq,
            };

            let request = ProtocolMessage::Request(Request::new(
                seq,
                "variables",
                Some(json!({ "variablesReference": variables_reference })),
            ));
            let frame = request
                .to_value()
                .map_err(|e| ConversionError::Nested(e.to_string()))?;
            self.debugger_tx
                .send(frame)
                .await
                .map_err(|_| ConversionError::Nested("debugger channel closed".into()))?;

            let response = match tokio::time::timeout(self.timeout, rx).await {
                Ok(Ok(response)) => response,
                Ok(Err(_)) => return Err(ConversionError::Nested("session closed".into())),
                Err(_) => {
                    return Err(ConversionError::Nested(format!(
                        "no response within {:?}",
                        self.timeout
                    )));
                }
            };
            if !response.success {
                return Err(ConversionError::Nested(
                    response
                        .message
                        .unwrap_or_else(|| "variables request failed".into()),
                ));
            }
            variables_from_body(response.body.as_ref().unwrap_or(&Value::Null))
                .map_err(|e| ConversionError::Nested(e.to_string()))
        })
    }
}

struct Inner {
    id: SessionId,
    port: u16,
    state: watch::Sender<SessionState>,
    process: ProcessHandle,
    shutdown_grace: Duration,
    routing: Arc<Routing>,
    debugger_tx: mpsc::Sender<Value>,
    /// The client already asked the debugger to disconnect.
    client_disconnected: AtomicBool,
    /// Pump ended: a side closed, a frame was malformed, or the debugger exited.
    completed: CancellationToken,
    disposal_started: CancellationToken,
    disposed: CancellationToken,
    force: CancellationToken,
    /// Stops the pump tasks after they flush what is queued.
    stop: CancellationToken,
    dispose_claimed: AtomicBool,
    /// First error that ended the pump, if any.
    close_reason: Mutex<Option<Arc<DapError>>>,
    hooks: Mutex<SessionHooks>,
    pump_tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Handle to one proxied debug session. Clones share the session.
#[derive(Clone)]
pub struct DebugSession {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for DebugSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebugSession")
            .field("id", &self.inner.id)
            .field("port", &self.inner.port)
            .field("state", &*self.inner.state.borrow())
            .finish_non_exhaustive()
    }
}

impl DebugSession {
    /// Spawn the debugger, bind the listener and start waiting for the editor.
    ///
    /// Returns as soon as the listener is bound so the caller can hand
    /// [`port`](Self::port) to the editor. A failed accept, or a debugger that
    /// exits before the editor connects, fires `on_failure`
    /// and disposes the session without it ever becoming active. Cancelling
    /// `token` force-disposes the session.
    pub async fn start(
        id: SessionId,
        config: DebugSessionConfig,
        launcher: &dyn ProcessLauncher,
        interceptors: Vec<Arc<dyn DapInterceptor>>,
        mut hooks: SessionHooks,
        token: CancellationToken,
    ) -> Result<Self, DapError> {
        let spec = config.debugger.clone().stdio(StdioMode::Protocol);
        let mut process = match launcher.launch(&spec) {
            Ok(process) => process,
            Err(e) => return Err(fail(&mut hooks, DapError::Launch(e))),
        };
        let (Some(stdin), Some(stdout)) = (process.take_stdin(), process.take_stdout()) else {
            process.force_terminate().await;
            return Err(fail(&mut hooks, DapError::MissingPipe));
        };
        if let Some(output) = process.take_output() {
            spawn_output_logger(process.label().to_string(), output);
        }

        let listener = match TcpListener::bind(SocketAddr::new(config.listen_addr, 0)).await {
            Ok(listener) => listener,
            Err(e) => {
                process.force_terminate().await;
                return Err(fail(&mut hooks, DapError::Bind(e)));
            }
        };
        let port = match listener.local_addr() {
            Ok(addr) => addr.port(),
            Err(e) => {
                process.force_terminate().await;
                return Err(fail(&mut hooks, DapError::Bind(e)));
            }
        };

        let (debugger_tx, debugger_rx) = mpsc::channel(DEBUGGER_CHANNEL_CAPACITY);
        let (state, _) = watch::channel(SessionState::Starting);
        let inner = Arc::new(Inner {
            id,
            port,
            state,
            process,
            shutdown_grace: config.shutdown_grace,
            routing: Arc::new(Routing::new()),
            debugger_tx,
            client_disconnected: AtomicBool::new(false),
            completed: CancellationToken::new(),
            disposal_started: CancellationToken::new(),
            disposed: CancellationToken::new(),
            force: CancellationToken::new(),
            stop: CancellationToken::new(),
            dispose_claimed: AtomicBool::new(false),
            close_reason: Mutex::new(None),
            hooks: Mutex::new(hooks),
            pump_tasks: Mutex::new(Vec::new()),
        });
        tracing::info!(session = %id, port, debugger = %spec.display(), "Debug session starting");

        inner
            .pump_tasks
            .lock()
            .await
            .push(tokio::spawn(debugger_writer(inner.clone(), stdin, debugger_rx)));

        // Debugger exit ends the session.
        let exit_inner = inner.clone();
        tokio::spawn(async move {
            let exit = exit_inner.process.wait().await;
            tracing::info!(session = %exit_inner.id, code = ?exit.code, "Debugger exited");
            if *exit_inner.state.borrow() == SessionState::Starting {
                let error = DapError::DebuggerExited(exit.code);
                tracing::warn!(session = %exit_inner.id, "Debug session failed to start: {error}");
                if let Some(hook) = exit_inner.hooks.lock().await.on_failure.take() {
                    hook(&error);
                }
                exit_inner.close_reason.lock().await.get_or_insert(Arc::new(error));
            }
            exit_inner.completed.cancel();
        });

        // Supervisor: completion or caller cancellation tears the session down.
        let supervisor_inner = inner.clone();
        let supervisor_token = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = supervisor_inner.completed.cancelled() => supervisor_inner.clone().shutdown(false).await,
                () = supervisor_token.cancelled() => supervisor_inner.clone().shutdown(true).await,
                () = supervisor_inner.disposal_started.cancelled() => {}
            }
        });

        let accept_inner = inner.clone();
        let accept_timeout = config.accept_timeout;
        let nested_timeout = config.nested_request_timeout;
        tokio::spawn(async move {
            let accepted = tokio::select! {
                accepted = tokio::time::timeout(accept_timeout, listener.accept()) => accepted,
                () = token.cancelled() => return,
                () = accept_inner.disposal_started.cancelled() => return,
            };
            let error = match accepted {
                Ok(Ok((stream, peer))) => {
                    // Only one editor connection per session.
                    drop(listener);
                    tracing::info!(session = %accept_inner.id, %peer, "Debug client connected");
                    accept_inner.state.send_replace(SessionState::Active);
                    let (client_read, client_write) = stream.into_split();
                    start_pump(
                        &accept_inner,
                        client_read,
                        client_write,
                        stdout,
                        interceptors,
                        nested_timeout,
                    )
                    .await;
                    return;
                }
                Ok(Err(e)) => DapError::Accept(e),
                Err(_) => DapError::AcceptTimeout(accept_timeout),
            };
            tracing::warn!(session = %accept_inner.id, "Debug session failed to start: {error}");
            if let Some(hook) = accept_inner.hooks.lock().await.on_failure.take() {
                hook(&error);
            }
            accept_inner.shutdown(true).await;
        });

        Ok(Self { inner })
    }

    #[must_use]
    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    /// Loopback port the editor connects to.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.inner.port
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    #[must_use]
    pub fn debugger_pid(&self) -> Option<u32> {
        self.inner.process.pid()
    }

    /// Resolves when either side closed the connection, the debugger exited,
    /// or the session was disposed.
    pub async fn completion(&self) {
        self.inner.completed.cancelled().await;
    }

    /// Error that ended the session, when it did not end cleanly.
    pub async fn close_reason(&self) -> Option<Arc<DapError>> {
        self.inner.close_reason.lock().await.clone()
    }

    /// Resolves as soon as teardown begins.
    pub async fn disposal_started(&self) {
        self.inner.disposal_started.cancelled().await;
    }

    /// Resolves once teardown has finished.
    pub async fn disposed(&self) {
        self.inner.disposed.cancelled().await;
    }

    /// Graceful teardown: ask the debugger to disconnect, flush queued
    /// frames, close the streams, and wait up to the grace period before
    /// killing the process tree. Idempotent.
    pub async fn dispose(&self) {
        self.inner.clone().shutdown(false).await;
    }

    /// Kill the process tree without a grace period. Idempotent, and
    /// escalates a graceful dispose already in progress.
    pub async fn force_dispose(&self) {
        self.inner.clone().shutdown(true).await;
    }
}

fn fail(hooks: &mut SessionHooks, error: DapError) -> DapError {
    tracing::warn!("Debug session failed to start: {error}");
    if let Some(hook) = hooks.on_failure.take() {
        hook(&error);
    }
    error
}

impl Inner {
    /// Record why the pump stopped and end the session.
    async fn abort_pump(&self, error: DapError) {
        tracing::warn!(session = %self.id, "Ending debug session: {error}");
        self.close_reason.lock().await.get_or_insert(Arc::new(error));
        self.completed.cancel();
    }

    async fn shutdown(self: Arc<Self>, force: bool) {
        if force {
            self.force.cancel();
        }
        if self.dispose_claimed.swap(true, Ordering::SeqCst) {
            self.disposed.cancelled().await;
            return;
        }

        tracing::info!(session = %self.id, force, "Disposing debug session");
        self.state.send_replace(SessionState::Stopping);
        self.disposal_started.cancel();

        if !self.force.is_cancelled()
            && self.process.exit_status().is_none()
            && !self.client_disconnected.load(Ordering::SeqCst)
        {
            let disconnect = ProtocolMessage::Request(Request::new(
                self.routing.allocate_seq(),
                "disconnect",
                Some(json!({ "restart": false })),
            ));
            if let Ok(frame) = disconnect.to_value() {
                let _ = self.debugger_tx.try_send(frame);
            }
        }
        // Writers flush what is queued, then close their streams.
        self.stop.cancel();

        let exit = if self.force.is_cancelled() {
            self.process.force_terminate().await
        } else {
            tokio::select! {
                exit = self.process.terminate(self.shutdown_grace) => exit,
                () = self.force.cancelled() => self.process.force_terminate().await,
            }
        };
        if exit.is_none() {
            tracing::warn!(session = %self.id, "Debugger did not exit after kill");
        }

        for task in self.pump_tasks.lock().await.drain(..) {
            task.abort();
        }
        self.routing.nested.clear();
        self.completed.cancel();
        self.state.send_replace(SessionState::Disposed);
        if let Some(hook) = self.hooks.lock().await.on_dispose.take() {
            hook();
        }
        tracing::info!(session = %self.id, "Debug session disposed");
        self.disposed.cancel();
    }
}

async fn start_pump(
    inner: &Arc<Inner>,
    client_read: OwnedReadHalf,
    client_write: OwnedWriteHalf,
    debugger_stdout: BoxedReader,
    interceptors: Vec<Arc<dyn DapInterceptor>>,
    nested_timeout: Duration,
) {
    let nested = Arc::new(NestedRequester {
        routing: inner.routing.clone(),
        debugger_tx: inner.debugger_tx.clone(),
        timeout: nested_timeout,
    });
    let (client_side, debugger_side): (Vec<_>, Vec<_>) = interceptors
        .into_iter()
        .partition(|i| i.direction() == Direction::ClientToDebugger);
    let (processor_tx, processor_rx) = mpsc::unbounded_channel();

    let tasks = [
        tokio::spawn(client_reader(
            inner.clone(),
            client_read,
            client_side,
            nested.clone(),
        )),
        tokio::spawn(debugger_reader(inner.clone(), debugger_stdout, processor_tx)),
        tokio::spawn(processor(
            inner.clone(),
            client_write,
            processor_rx,
            debugger_side,
            nested,
        )),
    ];
    inner.pump_tasks.lock().await.extend(tasks);
}

async fn run_interceptors(
    interceptors: &[Arc<dyn DapInterceptor>],
    mut message: ProtocolMessage,
    nested: &dyn NestedVariables,
) -> Option<ProtocolMessage> {
    for interceptor in interceptors {
        message = interceptor.intercept(message, nested).await?;
    }
    Some(message)
}

async fn client_reader(
    inner: Arc<Inner>,
    client_read: OwnedReadHalf,
    interceptors: Vec<Arc<dyn DapInterceptor>>,
    nested: Arc<NestedRequester>,
) {
    let mut reader = FrameReader::new(client_read);
    loop {
        let frame = tokio::select! {
            () = inner.stop.cancelled() => return,
            frame = reader.read_frame() => frame,
        };
        let frame = match frame {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                tracing::info!(session = %inner.id, "Debug client closed the connection");
                break;
            }
            Err(e) => return inner.abort_pump(e.into()).await,
        };
        let message = match ProtocolMessage::from_value(frame) {
            Ok(message) => message,
            Err(e) => return inner.abort_pump(e.into()).await,
        };
        tracing::trace!(session = %inner.id, direction = %Direction::ClientToDebugger, name = message.name(), "Frame");

        let Some(mut message) = run_interceptors(&interceptors, message, nested.as_ref()).await
        else {
            continue;
        };
        let proxy_seq = inner.routing.allocate_seq();
        if let ProtocolMessage::Request(request) = &message {
            inner.routing.client_seqs.insert(proxy_seq, request.seq);
            if request.command == "disconnect" {
                inner.client_disconnected.store(true, Ordering::SeqCst);
            }
        }
        message.set_seq(proxy_seq);

        let Ok(frame) = message.to_value() else {
            tracing::warn!(session = %inner.id, "Failed to encode client message");
            continue;
        };
        if inner.debugger_tx.send(frame).await.is_err() {
            return inner.abort_pump(DapError::ChannelClosed).await;
        }
    }
    inner.completed.cancel();
}

async fn debugger_writer(inner: Arc<Inner>, stdin: BoxedWriter, mut rx: mpsc::Receiver<Value>) {
    let mut writer = FrameWriter::new(stdin);
    loop {
        let frame = tokio::select! {
            biased;
            frame = rx.recv() => frame,
            () = inner.stop.cancelled() => None,
        };
        let Some(frame) = frame else { break };
        if let Err(e) = writer.write_frame(&frame).await {
            return inner.abort_pump(e.into()).await;
        }
    }
    let _ = writer.shutdown().await;
}

async fn debugger_reader(
    inner: Arc<Inner>,
    stdout: BoxedReader,
    processor_tx: mpsc::UnboundedSender<ProtocolMessage>,
) {
    let mut reader = FrameReader::new(stdout);
    loop {
        let frame = tokio::select! {
            () = inner.stop.cancelled() => return,
            frame = reader.read_frame() => frame,
        };
        let frame = match frame {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                tracing::info!(session = %inner.id, "Debugger closed its output");
                break;
            }
            Err(e) => return inner.abort_pump(e.into()).await,
        };
        let mut message = match ProtocolMessage::from_value(frame) {
            Ok(message) => message,
            Err(e) => return inner.abort_pump(e.into()).await,
        };

        if let ProtocolMessage::Response(response) = &mut message {
            if let Some((_, waiter)) = inner.routing.nested.remove(&response.request_seq) {
                let _ = waiter.send(response.clone());
                continue;
            }
            if let Some((_, client_seq)) = inner.routing.client_seqs.remove(&response.request_seq) {
                response.request_seq = client_seq;
            }
        }
        if processor_tx.send(message).is_err() {
            break;
        }
    }
    inner.completed.cancel();
}

async fn processor(
    inner: Arc<Inner>,
    client_write: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<ProtocolMessage>,
    interceptors: Vec<Arc<dyn DapInterceptor>>,
    nested: Arc<NestedRequester>,
) {
    let mut writer = FrameWriter::new(client_write);
    loop {
        let message = tokio::select! {
            biased;
            message = rx.recv() => message,
            () = inner.stop.cancelled() => None,
        };
        let Some(message) = message else { break };
        tracing::trace!(session = %inner.id, direction = %Direction::DebuggerToClient, name = message.name(), "Frame");

        let Some(message) = run_interceptors(&interceptors, message, nested.as_ref()).await else {
            continue;
        };
        let Ok(frame) = message.to_value() else {
            tracing::warn!(session = %inner.id, "Failed to encode debugger message");
            continue;
        };
        if let Err(e) = writer.write_frame(&frame).await {
            return inner.abort_pump(e.into()).await;
        }
    }
    let _ = writer.shutdown().await;
}
