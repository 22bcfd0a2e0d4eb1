//! Debug sessions: `test/debug` and the standalone `debugger/*` methods.

use std::time::Duration;

use easy_dotnet_hierarchy::RegistryEvent;
use easy_dotnet_types::TestNodeStatus;
use easy_dotnet_utils::process::memory::InMemoryProcess;
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::broadcast::error::RecvError;

use crate::common::{ADDS, HOST_PID, Harness, PROJECT, ScriptedDotnet, node};

#[tokio::test]
async fn debugging_a_test_hands_out_a_proxy_and_finishes_once_attached() {
    let mut harness = Harness::start(ScriptedDotnet::debugging()).await;
    harness.discover().await;

    let started = harness
        .call("test/debug", json!({ "project": PROJECT, "nodeIds": [ADDS] }))
        .await;
    assert_eq!(started["success"], true, "{started}");
    let session_id = started["sessionId"].as_u64().unwrap();
    let port = u16::try_from(started["port"].as_u64().unwrap()).unwrap();

    assert!(
        harness
            .launcher
            .launched_commands()
            .iter()
            .any(|c| c.starts_with("netcoredbg --interpreter=vscode")),
    );
    harness.status_of(ADDS, "debugging").await;

    // The host stays paused until the editor connects to the proxy.
    assert_eq!(harness.launcher.host_calls("testing/runTests").len(), 1);
    let _editor_dap = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    harness.status_of(ADDS, "passed").await;

    let tree = harness.call("test/tree", json!({})).await;
    assert_eq!(node(&tree["nodes"], ADDS)["status"]["kind"], "passed");

    let stopped = harness
        .call("debugger/stop", json!({ "sessionId": session_id, "force": true }))
        .await;
    assert_eq!(stopped["success"], true, "{stopped}");
    assert!(harness.services.sessions.active().is_empty());
}

#[tokio::test]
async fn editor_leaving_mid_debug_cancels_the_run() {
    let mut harness = Harness::start(ScriptedDotnet::debugging()).await;
    harness.discover().await;
    let started = harness
        .call("test/debug", json!({ "project": PROJECT, "nodeIds": [ADDS] }))
        .await;
    assert_eq!(started["success"], true, "{started}");
    harness.status_of(ADDS, "debugging").await;

    let mut events = harness.services.registry.subscribe();
    harness.editor.close().await;

    let mut seen = Vec::new();
    let wait = async {
        loop {
            match events.recv().await {
                Ok(RegistryEvent::StatusChanged { id, status }) if id.as_str() == ADDS => {
                    let done = status == TestNodeStatus::Cancelled;
                    seen.push(status);
                    if done {
                        break;
                    }
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => panic!("registry dropped"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(10), wait)
        .await
        .expect("run cancelled after the editor left");
    assert_eq!(seen, vec![TestNodeStatus::Cancelling, TestNodeStatus::Cancelled]);
}

#[tokio::test]
async fn debugger_start_attaches_to_a_process_and_stops_once() {
    let harness = Harness::start(ScriptedDotnet::default()).await;

    let started = harness
        .call("debugger/start", json!({ "processId": HOST_PID }))
        .await;
    assert_eq!(started["success"], true, "{started}");
    assert!(started["port"].as_u64().is_some_and(|port| port > 0));
    let session_id = started["sessionId"].clone();
    assert_eq!(harness.services.sessions.active().len(), 1);

    let stopped = harness
        .call("debugger/stop", json!({ "sessionId": session_id }))
        .await;
    assert_eq!(stopped["success"], true);

    let again = harness
        .call("debugger/stop", json!({ "sessionId": session_id }))
        .await;
    assert_eq!(again["success"], false);
    assert!(
        again["message"]
            .as_str()
            .is_some_and(|m| m.starts_with("unknown debug session")),
        "{again}"
    );
}

#[tokio::test]
async fn service_shutdown_tears_down_open_sessions() {
    let harness = Harness::start(ScriptedDotnet::default()).await;
    for pid in [1, 2] {
        let started = harness
            .call("debugger/start", json!({ "processId": pid }))
            .await;
        assert_eq!(started["success"], true, "{started}");
    }
    assert_eq!(harness.services.sessions.active().len(), 2);

    harness.services.shutdown().await;

    assert!(harness.services.sessions.active().is_empty());
    let kills: usize = harness
        .launcher
        .children
        .lock()
        .unwrap()
        .iter()
        .map(InMemoryProcess::kill_count)
        .sum();
    assert_eq!(kills, 2);
}
