//! Shared infrastructure utilities for easy-dotnet.
//!
//! - **`atomic_write`**: Crash-safe file persistence (temp + rename)
//! - **`process`**: Launching external tools with owned pipes and process-tree kill

pub mod atomic_write;
pub mod process;

pub use atomic_write::{
    AtomicWriteOptions, SyncPolicy, atomic_write, atomic_write_with_options, recover_bak_file,
};
pub use process::{
    BoxedReader, BoxedWriter, CompletedProcess, KillOutcome, LaunchError, OutputLine,
    ProcessControl, ProcessExit, ProcessHandle, ProcessLauncher, ProcessSpec, StdioMode,
    TokioProcessLauncher, run_to_completion, spawn_output_logger,
};
