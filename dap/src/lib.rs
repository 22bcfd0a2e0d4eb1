//! Debug Adapter Protocol proxy.
//!
//! Sits between an editor's debug client and a native debugger (`netcoredbg`),
//! forwarding frames in both directions while interceptors rewrite attach
//! requests and converters materialize variable values.

mod converter;
mod error;
mod interceptor;
mod protocol;
mod session;
mod variables;

pub use converter::{
    ConversionError, ConverterPipeline, GuidConverter, NestedVariables, ValueConverter,
};
pub use error::DapError;
pub use interceptor::{AttachRequestInterceptor, DapInterceptor, Direction, VariablesInterceptor};
pub use protocol::{Event, ProtocolError, ProtocolMessage, Request, Response};
pub use session::{DebugSession, DebugSessionConfig, SessionHooks, SessionState};
pub use variables::{Variable, variables_from_body};
