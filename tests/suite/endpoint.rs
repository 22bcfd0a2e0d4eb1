//! Endpoint plumbing: handshake, settings and connection lifetime.

use std::time::Duration;

use easy_dotnet_rpc::RpcError;
use serde_json::json;

use crate::common::{Harness, PROJECT, SOLUTION, ScriptedDotnet};

#[tokio::test]
async fn initialize_names_the_service() {
    let harness = Harness::start(ScriptedDotnet::default()).await;
    let info = harness.call("initialize", json!({})).await;
    assert_eq!(info["serverInfo"]["name"], "easy-dotnet");
}

#[tokio::test]
async fn unknown_methods_are_rpc_errors() {
    let harness = Harness::start(ScriptedDotnet::default()).await;
    let err = harness
        .editor
        .request("test/frobnicate", None)
        .await
        .unwrap_err();
    match err {
        RpcError::Remote { error, .. } => assert_eq!(error.code, -32601),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn default_project_is_remembered_per_solution() {
    let harness = Harness::start(ScriptedDotnet::default()).await;
    let unset = harness
        .call(
            "settings/getDefaultProject",
            json!({ "solution": SOLUTION, "kind": "test" }),
        )
        .await;
    assert!(unset["project"].is_null());

    let set = harness
        .call(
            "settings/setDefaultProject",
            json!({ "solution": SOLUTION, "kind": "test", "project": PROJECT }),
        )
        .await;
    assert_eq!(set["success"], true, "{set}");

    let got = harness
        .call(
            "settings/getDefaultProject",
            json!({ "solution": SOLUTION, "kind": "test" }),
        )
        .await;
    assert_eq!(got["project"], PROJECT);
}

#[tokio::test]
async fn cancelling_the_server_disconnects_editors() {
    let harness = Harness::start(ScriptedDotnet::default()).await;
    harness.token.cancel();
    tokio::time::timeout(Duration::from_secs(5), harness.editor.closed())
        .await
        .unwrap();
    assert!(harness.editor.is_closed());
}
