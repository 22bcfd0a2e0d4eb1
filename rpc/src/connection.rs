//! Bidirectional JSON-RPC connection over a framed byte stream.
//!
//! One writer task serializes all outgoing frames; one reader task classifies
//! incoming frames. Replies are routed to the pending request by id, peer
//! requests are served concurrently, and notifications are delivered to the
//! handler strictly in arrival order.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::codec::{FrameReader, FrameWriter};
use crate::message::{
    ErrorObject, IncomingFrame, Notification, Request, error_response, into_result,
    success_response,
};

const WRITER_CHANNEL_CAPACITY: usize = 256;

/// Serves what the peer sends us.
pub trait RpcHandler: Send + Sync + 'static {
    /// Each request runs on its own task; the returned value becomes the reply.
    fn handle_request(
        &self,
        method: String,
        params: Option<Value>,
    ) -> BoxFuture<'static, Result<Value, ErrorObject>>;

    /// Awaited inline by the reader, so notifications are never reordered.
    fn handle_notification(&self, method: String, params: Option<Value>) -> BoxFuture<'static, ()>;
}

/// Handler that rejects every request and drops every notification.
pub struct NoopHandler;

impl RpcHandler for NoopHandler {
    fn handle_request(
        &self,
        method: String,
        _params: Option<Value>,
    ) -> BoxFuture<'static, Result<Value, ErrorObject>> {
        Box::pin(async move { Err(ErrorObject::method_not_found(&method)) })
    }

    fn handle_notification(&self, method: String, _params: Option<Value>) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            tracing::trace!(%method, "Ignoring notification");
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("connection closed")]
    Closed,
    #[error("{method} timed out after {timeout:?}")]
    Timeout { method: String, timeout: Duration },
    #[error("{method} failed: {error}")]
    Remote {
        method: String,
        #[source]
        error: ErrorObject,
    },
    #[error("failed to serialize {method}: {source}")]
    Serialize {
        method: String,
        #[source]
        source: serde_json::Error,
    },
}

enum WriterCommand {
    Send(Value),
    Shutdown,
}

struct Shared {
    name: String,
    writer_tx: mpsc::Sender<WriterCommand>,
    pending: DashMap<u64, oneshot::Sender<Value>>,
    next_id: AtomicU64,
    closed: CancellationToken,
}

/// Cheaply cloneable handle to a running connection.
#[derive(Clone)]
pub struct RpcConnection {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for RpcConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcConnection")
            .field("name", &self.shared.name)
            .field("closed", &self.shared.closed.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// Removes a pending entry when the awaiting request is dropped or finishes.
struct PendingGuard<'a> {
    pending: &'a DashMap<u64, oneshot::Sender<Value>>,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

impl RpcConnection {
    /// Start the reader and writer tasks. `name` only appears in logs.
    pub fn spawn<R, W>(
        name: impl Into<String>,
        reader: R,
        writer: W,
        handler: Arc<dyn RpcHandler>,
    ) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (writer_tx, mut writer_rx) = mpsc::channel::<WriterCommand>(WRITER_CHANNEL_CAPACITY);
        let shared = Arc::new(Shared {
            name: name.into(),
            writer_tx,
            pending: DashMap::new(),
            next_id: AtomicU64::new(1),
            closed: CancellationToken::new(),
        });

        let writer_shared = shared.clone();
        tokio::spawn(async move {
            let mut writer = FrameWriter::new(writer);
            while let Some(cmd) = writer_rx.recv().await {
                match cmd {
                    WriterCommand::Send(frame) => {
                        if let Err(e) = writer.write_frame(&frame).await {
                            tracing::warn!(peer = %writer_shared.name, "JSON-RPC write error: {e}");
                            break;
                        }
                    }
                    WriterCommand::Shutdown => {
                        let _ = writer.shutdown().await;
                        break;
                    }
                }
            }
            writer_shared.closed.cancel();
        });

        let reader_shared = shared.clone();
        tokio::spawn(async move {
            let mut reader = FrameReader::new(reader);
            loop {
                let frame = tokio::select! {
                    () = reader_shared.closed.cancelled() => break,
                    frame = reader.read_frame() => frame,
                };
                match frame {
                    Ok(Some(frame)) => Self::dispatch_frame(&reader_shared, &handler, frame).await,
                    Ok(None) => {
                        tracing::debug!(peer = %reader_shared.name, "Peer closed the connection");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(peer = %reader_shared.name, "JSON-RPC read error: {e}");
                        break;
                    }
                }
            }
            reader_shared.closed.cancel();
            // Dropping the senders fails every outstanding request with `Closed`.
            reader_shared.pending.clear();
        });

        Self { shared }
    }

    async fn dispatch_frame(shared: &Arc<Shared>, handler: &Arc<dyn RpcHandler>, frame: Value) {
        let Some(incoming) = IncomingFrame::parse(frame) else {
            tracing::trace!(peer = %shared.name, "Ignoring malformed JSON-RPC frame");
            return;
        };

        match incoming {
            IncomingFrame::Response { id, body } => {
                if let Some((_, tx)) = shared.pending.remove(&id) {
                    let _ = tx.send(body);
                } else {
                    tracing::debug!(peer = %shared.name, id, "Dropping response for unknown request");
                }
            }
            IncomingFrame::Request { id, method, params } => {
                tracing::debug!(peer = %shared.name, %method, "Serving peer request");
                let future = handler.handle_request(method, params);
                let writer_tx = shared.writer_tx.clone();
                tokio::spawn(async move {
                    let reply = match future.await {
                        Ok(result) => success_response(&id, result),
                        Err(error) => error_response(&id, &error),
                    };
                    let _ = writer_tx.send(WriterCommand::Send(reply)).await;
                });
            }
            IncomingFrame::Notification { method, params } => {
                handler.handle_notification(method, params).await;
            }
        }
    }

    /// Send a request and wait for its reply.
    ///
    /// Dropping the returned future abandons the request; a late reply is discarded.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, RpcError> {
        if self.shared.closed.is_cancelled() {
            return Err(RpcError::Closed);
        }
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.shared.pending.insert(id, tx);
        let _guard = PendingGuard {
            pending: &self.shared.pending,
            id,
        };

        let frame = serde_json::to_value(Request::new(id, method, params)).map_err(|source| {
            RpcError::Serialize {
                method: method.to_string(),
                source,
            }
        })?;
        self.send(frame).await?;

        let body = tokio::select! {
            body = rx => body.map_err(|_| RpcError::Closed)?,
            () = self.shared.closed.cancelled() => return Err(RpcError::Closed),
        };
        into_result(body).map_err(|error| RpcError::Remote {
            method: method.to_string(),
            error,
        })
    }

    pub async fn request_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        tokio::time::timeout(timeout, self.request(method, params))
            .await
            .map_err(|_| RpcError::Timeout {
                method: method.to_string(),
                timeout,
            })?
    }

    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), RpcError> {
        let frame = serde_json::to_value(Notification::new(method, params)).map_err(|source| {
            RpcError::Serialize {
                method: method.to_string(),
                source,
            }
        })?;
        self.send(frame).await
    }

    async fn send(&self, frame: Value) -> Result<(), RpcError> {
        self.shared
            .writer_tx
            .send(WriterCommand::Send(frame))
            .await
            .map_err(|_| RpcError::Closed)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Resolves once either side has closed the connection.
    pub async fn closed(&self) {
        self.shared.closed.cancelled().await;
    }

    /// Flush queued frames, close the write half, and stop reading.
    pub async fn close(&self) {
        let _ = self.shared.writer_tx.send(WriterCommand::Shutdown).await;
        self.shared.closed.cancel();
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.shared.pending.len()
    }
}
