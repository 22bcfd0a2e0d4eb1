//! Correlates streamed `testUpdates` notifications with the call that started the run.
//!
//! Each discover/run call registers a buffer under a fresh [`RunId`]. Updates
//! for that id are appended; a terminal update (no changes) removes the
//! buffer and hands the accumulated nodes to the waiting call. Dropping the
//! [`RunHandle`] removes the buffer too, so later updates for a cancelled run
//! find nothing and are ignored.

use std::sync::Arc;

use dashmap::DashMap;
use easy_dotnet_types::RunId;
use tokio::sync::oneshot;

use crate::protocol::TestNodeUpdate;

struct RunBuffer {
    updates: Vec<TestNodeUpdate>,
    done: oneshot::Sender<Vec<TestNodeUpdate>>,
}

#[derive(Default)]
pub struct RunCorrelator {
    runs: DashMap<RunId, RunBuffer>,
}

/// What happened to a pushed batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Buffered,
    Completed,
    /// No such run: already completed or cancelled.
    Dropped,
}

impl RunCorrelator {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(self: &Arc<Self>, run_id: RunId) -> RunHandle {
        let (done, rx) = oneshot::channel();
        self.runs.insert(
            run_id.clone(),
            RunBuffer {
                updates: Vec::new(),
                done,
            },
        );
        RunHandle {
            run_id,
            rx,
            correlator: self.clone(),
        }
    }

    /// Append a batch for `run_id`. `None` or an empty batch ends the run.
    pub fn push(&self, run_id: &RunId, changes: Option<Vec<TestNodeUpdate>>) -> PushOutcome {
        match changes {
            Some(changes) if !changes.is_empty() => match self.runs.get_mut(run_id) {
                Some(mut buffer) => {
                    buffer.updates.extend(changes);
                    PushOutcome::Buffered
                }
                None => PushOutcome::Dropped,
            },
            _ => match self.runs.remove(run_id) {
                Some((_, buffer)) => {
                    let _ = buffer.done.send(buffer.updates);
                    PushOutcome::Completed
                }
                None => PushOutcome::Dropped,
            },
        }
    }

    #[must_use]
    pub fn active_runs(&self) -> usize {
        self.runs.len()
    }

    #[must_use]
    pub fn is_active(&self, run_id: &RunId) -> bool {
        self.runs.contains_key(run_id)
    }
}

/// Completion handle of one registered run. Dropping it unregisters the run.
pub struct RunHandle {
    run_id: RunId,
    rx: oneshot::Receiver<Vec<TestNodeUpdate>>,
    correlator: Arc<RunCorrelator>,
}

impl RunHandle {
    #[must_use]
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Wait for the terminal update. `None` if the correlator was torn down.
    pub async fn completed(&mut self) -> Option<Vec<TestNodeUpdate>> {
        (&mut self.rx).await.ok()
    }
}

impl Drop for RunHandle {
    fn drop(&mut self) {
        self.correlator.runs.remove(&self.run_id);
    }
}
