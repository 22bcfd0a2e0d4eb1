//! Core domain types for easy-dotnet.
//!
//! This crate contains pure domain types with no IO, no async, and minimal dependencies:
//! test-tree nodes, their run/debug status with the per-status action table, and the
//! normalization that turns framework-specific test records into [`DiscoveredTest`]s.

// Pedantic lint configuration - these are intentional design choices
#![allow(clippy::missing_errors_doc)] // Result-returning functions are self-explanatory
#![allow(clippy::missing_panics_doc)] // Panics are documented in assertions

mod discovery;
mod ids;
mod node;
mod status;

pub use discovery::{
    DiscoveredTest, MtpTestRecord, VsTestCase, VsTestDisplayPolicies, VsTestDisplayPolicy,
    split_arguments, split_top_level,
};
pub use ids::{RunId, SessionId, TestNodeId};
pub use node::{TestNode, TestNodeType};
pub use status::{StatusKind, TestAction, TestFailure, TestNodeStatus};
