use std::io;
use std::time::Duration;

use easy_dotnet_rpc::RpcError;
use easy_dotnet_utils::LaunchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The caller's token was cancelled.
    Caller,
    /// The run exceeded its time limit.
    Timeout,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Caller => "cancelled by caller",
            Self::Timeout => "timed out",
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TestClientError {
    #[error("test operation {0}")]
    Cancelled(CancelReason),
    #[error("failed to start test host: {0}")]
    Launch(#[from] LaunchError),
    #[error("failed to listen for test host: {0}")]
    Bind(#[source] io::Error),
    #[error("test host did not connect within {0:?}")]
    ConnectTimeout(Duration),
    #[error("initialize handshake failed: {0}")]
    Handshake(#[source] RpcError),
    #[error("test host returned error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("malformed message from test host: {0}")]
    Protocol(#[from] serde_json::Error),
    #[error("test host connection closed")]
    ChannelClosed,
}

impl TestClientError {
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }
}

impl From<RpcError> for TestClientError {
    fn from(error: RpcError) -> Self {
        match error {
            RpcError::Closed => Self::ChannelClosed,
            RpcError::Timeout { .. } => Self::Cancelled(CancelReason::Timeout),
            RpcError::Remote { error, .. } => Self::Rpc {
                code: error.code,
                message: error.message,
            },
            RpcError::Serialize { source, .. } => Self::Protocol(source),
        }
    }
}
