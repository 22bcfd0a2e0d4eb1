//! Microsoft Testing Platform client.
//!
//! Test hosts run in `--server` mode connect back to a loopback listener and
//! speak JSON-RPC over Content-Length framing. Discover and run results arrive
//! as `testing/testUpdates/tests` notifications keyed by a client-chosen run id.

#![allow(clippy::missing_errors_doc)]

mod client;
mod correlator;
mod error;
pub mod protocol;

pub use client::{
    AttachDebuggerHandler, AttachError, TestClient, TestClientConfig, test_host_spec,
};
pub use correlator::{PushOutcome, RunCorrelator, RunHandle};
pub use error::{CancelReason, TestClientError};
pub use protocol::{ExecutionState, MtpTestNode, TestNodeRef, TestNodeUpdate};
