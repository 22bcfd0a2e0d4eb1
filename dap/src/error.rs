use std::io;
use std::time::Duration;

use easy_dotnet_rpc::FrameError;
use easy_dotnet_utils::LaunchError;

use crate::protocol::ProtocolError;

#[derive(Debug, thiserror::Error)]
pub enum DapError {
    #[error("failed to start debugger: {0}")]
    Launch(#[from] LaunchError),
    #[error("debugger process has no stdin/stdout pipes")]
    MissingPipe,
    #[error("failed to bind debug listener: {0}")]
    Bind(#[source] io::Error),
    #[error("failed to accept debug client: {0}")]
    Accept(#[source] io::Error),
    #[error("no debug client connected within {0:?}")]
    AcceptTimeout(Duration),
    #[error("debugger exited before the client connected (code {0:?})")]
    DebuggerExited(Option<i32>),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("session channel closed")]
    ChannelClosed,
}
