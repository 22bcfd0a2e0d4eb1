//! Testing Platform wire types.
//!
//! Test node properties use the platform's dotted, hyphenated keys
//! (`execution-state`, `location.line-start`, ...). Unmodelled properties are
//! kept in `extra`.

use std::path::PathBuf;

use easy_dotnet_types::{MtpTestRecord, TestFailure, TestNodeStatus};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const INITIALIZE: &str = "initialize";
pub const EXIT: &str = "exit";
pub const DISCOVER_TESTS: &str = "testing/discoverTests";
pub const RUN_TESTS: &str = "testing/runTests";
pub const TEST_UPDATES: &str = "testing/testUpdates/tests";
pub const CLIENT_LOG: &str = "client/log";
pub const TELEMETRY_UPDATE: &str = "telemetry/update";
pub const ATTACH_DEBUGGER: &str = "client/attachDebugger";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub process_id: u32,
    pub client_info: ClientInfo,
    pub capabilities: ClientCapabilities,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientCapabilities {
    pub testing: TestingCapabilities,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestingCapabilities {
    pub debugger_provider: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    #[serde(default)]
    pub server_info: Option<ServerInfo>,
    #[serde(default)]
    pub capabilities: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
}

/// Test selected for a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestNodeRef {
    pub uid: String,
    #[serde(rename = "display-name")]
    pub display_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionState {
    Discovered,
    InProgress,
    Passed,
    Failed,
    Error,
    TimedOut,
    Skipped,
    Cancelled,
    #[serde(other)]
    Unknown,
}

impl ExecutionState {
    /// States that never end up in run results.
    #[must_use]
    pub fn is_transient(self) -> bool {
        matches!(self, Self::Discovered | Self::InProgress | Self::Unknown)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MtpTestNode {
    pub uid: String,
    #[serde(rename = "display-name")]
    pub display_name: String,
    #[serde(rename = "node-type", default, skip_serializing_if = "Option::is_none")]
    pub node_type: Option<String>,
    #[serde(rename = "execution-state", default, skip_serializing_if = "Option::is_none")]
    pub execution_state: Option<ExecutionState>,
    #[serde(rename = "location.file", default, skip_serializing_if = "Option::is_none")]
    pub location_file: Option<PathBuf>,
    #[serde(rename = "location.line-start", default, skip_serializing_if = "Option::is_none")]
    pub location_line_start: Option<u32>,
    #[serde(rename = "location.type", default, skip_serializing_if = "Option::is_none")]
    pub location_type: Option<String>,
    #[serde(rename = "location.method", default, skip_serializing_if = "Option::is_none")]
    pub location_method: Option<String>,
    #[serde(rename = "error.message", default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(rename = "error.stacktrace", default, skip_serializing_if = "Option::is_none")]
    pub error_stacktrace: Option<String>,
    #[serde(rename = "time.duration-ms", default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<f64>,
    #[serde(rename = "skip.reason", default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl MtpTestNode {
    #[must_use]
    pub fn is_test(&self) -> bool {
        self.node_type.as_deref().is_none_or(|t| t == "action")
    }

    #[must_use]
    pub fn reference(&self) -> TestNodeRef {
        TestNodeRef {
            uid: self.uid.clone(),
            display_name: self.display_name.clone(),
        }
    }

    /// Normalization input for discovery.
    #[must_use]
    pub fn to_record(&self) -> MtpTestRecord {
        MtpTestRecord {
            uid: self.uid.clone(),
            display_name: self.display_name.clone(),
            test_type: self.location_type.clone(),
            file_path: self.location_file.clone(),
            line_start: self.location_line_start,
        }
    }

    /// Node status for a run outcome; `None` for transient states.
    #[must_use]
    pub fn outcome(&self) -> Option<TestNodeStatus> {
        let duration_ms = self.duration_ms.map(|ms| ms.max(0.0).round() as u64);
        let failure = || TestFailure {
            message: self.error_message.clone(),
            stack_trace: self.error_stacktrace.clone(),
        };
        match self.execution_state? {
            ExecutionState::Passed => Some(TestNodeStatus::Passed { duration_ms }),
            ExecutionState::Failed | ExecutionState::Error => Some(TestNodeStatus::Failed {
                duration_ms,
                error: failure(),
            }),
            ExecutionState::TimedOut => Some(TestNodeStatus::Failed {
                duration_ms,
                error: TestFailure {
                    message: Some(
                        self.error_message
                            .clone()
                            .unwrap_or_else(|| "Test timed out".into()),
                    ),
                    stack_trace: self.error_stacktrace.clone(),
                },
            }),
            ExecutionState::Skipped => Some(TestNodeStatus::Skipped {
                reason: self.skip_reason.clone(),
            }),
            ExecutionState::Cancelled => Some(TestNodeStatus::Cancelled),
            ExecutionState::Discovered | ExecutionState::InProgress | ExecutionState::Unknown => {
                None
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestNodeUpdate {
    pub node: MtpTestNode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
}

/// Params of `testing/testUpdates/tests`. `changes: null` ends the run's stream.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestUpdatesParams {
    pub run_id: String,
    #[serde(default)]
    pub changes: Option<Vec<TestNodeUpdate>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogParams {
    #[serde(default)]
    pub level: Value,
    #[serde(default)]
    pub message: String,
}

/// Testing Platform log levels, numeric or by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Information,
    Warning,
    Error,
}

impl LogLevel {
    #[must_use]
    pub fn from_wire(level: &Value) -> Self {
        match level {
            Value::Number(n) => match n.as_u64() {
                Some(0) => Self::Trace,
                Some(1) => Self::Debug,
                Some(2) => Self::Information,
                Some(3) => Self::Warning,
                Some(_) => Self::Error,
                None => Self::Information,
            },
            Value::String(s) => match s.to_ascii_lowercase().as_str() {
                "trace" => Self::Trace,
                "debug" => Self::Debug,
                "warning" => Self::Warning,
                "error" | "critical" => Self::Error,
                _ => Self::Information,
            },
            _ => Self::Information,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_hyphenated_node_properties() {
        let update: TestNodeUpdate = serde_json::from_value(json!({
            "node": {
                "uid": "Tests.MathTests.Adds(1,2)",
                "display-name": "Adds(1,2)",
                "node-type": "action",
                "execution-state": "failed",
                "location.file": "/src/Tests/MathTests.cs",
                "location.line-start": 14,
                "location.type": "Tests.MathTests",
                "location.method": "Adds(System.Int32,System.Int32)",
                "error.message": "Expected 3",
                "error.stacktrace": "at Tests.MathTests.Adds",
                "time.duration-ms": 12.6,
                "standardOutput": "hello"
            },
            "parent": "Tests.MathTests"
        }))
        .unwrap();

        let node = &update.node;
        assert!(node.is_test());
        assert_eq!(node.execution_state, Some(ExecutionState::Failed));
        assert_eq!(node.extra["standardOutput"], "hello");

        let record = node.to_record();
        assert_eq!(record.test_type.as_deref(), Some("Tests.MathTests"));
        assert_eq!(record.line_start, Some(14));

        let Some(TestNodeStatus::Failed { duration_ms, error }) = node.outcome() else {
            panic!("expected failure");
        };
        assert_eq!(duration_ms, Some(13));
        assert_eq!(error.message.as_deref(), Some("Expected 3"));
    }

    #[test]
    fn unknown_execution_state_is_transient() {
        let node: MtpTestNode = serde_json::from_value(json!({
            "uid": "x", "display-name": "x", "execution-state": "something-new"
        }))
        .unwrap();
        assert_eq!(node.execution_state, Some(ExecutionState::Unknown));
        assert!(node.outcome().is_none());
        assert!(ExecutionState::InProgress.is_transient());
        assert!(!ExecutionState::Skipped.is_transient());
    }

    #[test]
    fn terminal_update_has_null_changes() {
        let params: TestUpdatesParams =
            serde_json::from_value(json!({"runId": "r1", "changes": null})).unwrap();
        assert!(params.changes.is_none());
    }

    #[test]
    fn log_levels_accept_numbers_and_names() {
        assert_eq!(LogLevel::from_wire(&json!(3)), LogLevel::Warning);
        assert_eq!(LogLevel::from_wire(&json!("Critical")), LogLevel::Error);
        assert_eq!(LogLevel::from_wire(&json!(null)), LogLevel::Information);
    }
}
