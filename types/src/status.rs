//! Run/debug status of a test node and the actions each status permits.
//!
//! The capability table is explicit: [`StatusKind::actions`] is a lookup keyed
//! by the status tag, never derived from the payload.

use serde::{Deserialize, Serialize};

/// Failure details attached to [`TestNodeStatus::Failed`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestFailure {
    pub message: Option<String>,
    pub stack_trace: Option<String>,
}

impl TestFailure {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            stack_trace: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum TestNodeStatus {
    #[default]
    Idle,
    Queued,
    Building,
    Discovering,
    Running,
    Debugging,
    Cancelling,
    Cancelled,
    #[serde(rename_all = "camelCase")]
    Passed { duration_ms: Option<u64> },
    #[serde(rename_all = "camelCase")]
    Failed {
        duration_ms: Option<u64>,
        error: TestFailure,
    },
    Skipped { reason: Option<String> },
}

/// Payload-free tag of a [`TestNodeStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StatusKind {
    Idle,
    Queued,
    Building,
    Discovering,
    Running,
    Debugging,
    Cancelling,
    Cancelled,
    Passed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TestAction {
    Run,
    Debug,
    PeekOutput,
    GoToSource,
    Refresh,
}

const SETTLED: &[TestAction] = &[
    TestAction::Run,
    TestAction::Debug,
    TestAction::GoToSource,
    TestAction::Refresh,
];
const WITH_OUTPUT: &[TestAction] = &[
    TestAction::Run,
    TestAction::Debug,
    TestAction::PeekOutput,
    TestAction::GoToSource,
    TestAction::Refresh,
];
const BUSY: &[TestAction] = &[TestAction::GoToSource];

impl StatusKind {
    #[must_use]
    pub const fn actions(self) -> &'static [TestAction] {
        match self {
            Self::Idle | Self::Cancelled | Self::Skipped => SETTLED,
            Self::Passed | Self::Failed => WITH_OUTPUT,
            Self::Queued
            | Self::Building
            | Self::Discovering
            | Self::Running
            | Self::Debugging
            | Self::Cancelling => BUSY,
        }
    }

    /// Whether an operation is currently in flight for a node in this state.
    #[must_use]
    pub const fn is_busy(self) -> bool {
        matches!(
            self,
            Self::Queued
                | Self::Building
                | Self::Discovering
                | Self::Running
                | Self::Debugging
                | Self::Cancelling
        )
    }
}

impl TestNodeStatus {
    #[must_use]
    pub const fn kind(&self) -> StatusKind {
        match self {
            Self::Idle => StatusKind::Idle,
            Self::Queued => StatusKind::Queued,
            Self::Building => StatusKind::Building,
            Self::Discovering => StatusKind::Discovering,
            Self::Running => StatusKind::Running,
            Self::Debugging => StatusKind::Debugging,
            Self::Cancelling => StatusKind::Cancelling,
            Self::Cancelled => StatusKind::Cancelled,
            Self::Passed { .. } => StatusKind::Passed,
            Self::Failed { .. } => StatusKind::Failed,
            Self::Skipped { .. } => StatusKind::Skipped,
        }
    }

    #[must_use]
    pub const fn actions(&self) -> &'static [TestAction] {
        self.kind().actions()
    }

    #[must_use]
    pub fn allows(&self, action: TestAction) -> bool {
        self.actions().contains(&action)
    }

    /// Terminal outcome of a run (passed, failed, skipped, cancelled).
    #[must_use]
    pub const fn is_outcome(&self) -> bool {
        matches!(
            self,
            Self::Passed { .. } | Self::Failed { .. } | Self::Skipped { .. } | Self::Cancelled
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_states_only_allow_navigation() {
        for status in [
            TestNodeStatus::Queued,
            TestNodeStatus::Building,
            TestNodeStatus::Discovering,
            TestNodeStatus::Running,
            TestNodeStatus::Debugging,
            TestNodeStatus::Cancelling,
        ] {
            assert_eq!(status.actions(), &[TestAction::GoToSource], "{status:?}");
            assert!(status.kind().is_busy());
        }
    }

    #[test]
    fn outcomes_with_output_allow_peek() {
        let passed = TestNodeStatus::Passed {
            duration_ms: Some(12),
        };
        let failed = TestNodeStatus::Failed {
            duration_ms: None,
            error: TestFailure::new("boom"),
        };
        assert!(passed.allows(TestAction::PeekOutput));
        assert!(failed.allows(TestAction::PeekOutput));
        assert!(!TestNodeStatus::Idle.allows(TestAction::PeekOutput));
        assert!(TestNodeStatus::Skipped { reason: None }.allows(TestAction::Run));
    }

    #[test]
    fn status_serializes_with_kind_tag() {
        let failed = TestNodeStatus::Failed {
            duration_ms: Some(3),
            error: TestFailure::new("expected 1"),
        };
        let json = serde_json::to_value(&failed).unwrap();
        assert_eq!(json["kind"], "failed");
        assert_eq!(json["durationMs"], 3);
        assert_eq!(json["error"]["message"], "expected 1");

        let back: TestNodeStatus = serde_json::from_value(json).unwrap();
        assert_eq!(back, failed);
    }
}
