//! Test hierarchy registry.
//!
//! An in-memory tree (solution → project → namespace segments → method →
//! parameterized case) shared by every controller, with stable node identity
//! across re-discovery.

mod discovery;
mod registry;

pub use discovery::{DiscoveryReport, apply_discovery, process_test_discovery};
pub use registry::{
    GlobalLock, NodeLock, RegistryError, RegistryEvent, SharedLock, TestRegistry,
};
