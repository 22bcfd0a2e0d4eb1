//! JSON-RPC plumbing for easy-dotnet.
//!
//! - **`codec`**: `Content-Length` framing, shared with the debug adapter proxy
//! - **`message`**: JSON-RPC 2.0 message shapes and frame classification
//! - **`connection`**: request/response correlation over a framed stream

pub mod codec;
pub mod connection;
pub mod message;

pub use codec::{FrameError, FrameReader, FrameWriter, MAX_FRAME_BYTES};
pub use connection::{NoopHandler, RpcConnection, RpcError, RpcHandler};
pub use message::{ErrorObject, IncomingFrame};
