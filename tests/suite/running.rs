//! Test runs through `test/run`.

use serde_json::json;

use crate::common::{ADDS, DIVIDES, Harness, PROJECT, ScriptedDotnet, node};

#[tokio::test]
async fn running_the_project_records_every_outcome() {
    let mut harness = Harness::start(ScriptedDotnet::default()).await;
    harness.discover().await;
    harness.drain();

    let result = harness.call("test/run", json!({ "project": PROJECT })).await;
    assert_eq!(result["success"], true, "{result}");

    let results = &result["results"];
    let adds = node(results, ADDS);
    assert_eq!(adds["status"]["kind"], "passed");
    assert_eq!(adds["status"]["durationMs"], 3);
    let divides = node(results, DIVIDES);
    assert_eq!(divides["status"]["kind"], "failed");
    assert_eq!(
        divides["status"]["error"]["message"],
        "Attempted to divide by zero."
    );

    // Whole-project runs send no filter.
    let runs = harness.launcher.host_calls("testing/runTests");
    assert_eq!(runs.len(), 1);
    assert!(runs[0].get("tests").is_none());

    harness.status_of(ADDS, "queued").await;
    harness.status_of(ADDS, "running").await;
    harness.status_of(ADDS, "passed").await;
}

#[tokio::test]
async fn running_one_test_filters_the_host_run() {
    let mut harness = Harness::start(ScriptedDotnet::default()).await;
    harness.discover().await;

    let result = harness
        .call("test/run", json!({ "project": PROJECT, "nodeIds": [ADDS] }))
        .await;
    assert_eq!(result["success"], true, "{result}");
    assert_eq!(result["results"].as_array().map(Vec::len), Some(1));

    let runs = harness.launcher.host_calls("testing/runTests");
    assert_eq!(runs[0]["tests"][0]["uid"], ADDS);
    assert_eq!(runs[0]["tests"].as_array().map(Vec::len), Some(1));

    let tree = harness.call("test/tree", json!({})).await;
    assert_eq!(node(&tree["nodes"], ADDS)["status"]["kind"], "passed");
    assert_eq!(node(&tree["nodes"], DIVIDES)["status"]["kind"], "idle");
    harness.status_of(ADDS, "passed").await;
}

#[tokio::test]
async fn running_before_discovery_is_a_failure_result() {
    let harness = Harness::start(ScriptedDotnet::default()).await;
    let result = harness.call("test/run", json!({ "project": PROJECT })).await;
    assert_eq!(result["success"], false);
    assert!(
        result["message"]
            .as_str()
            .is_some_and(|m| m.contains("has not been discovered")),
        "{result}"
    );
    assert!(harness.launcher.launched_commands().is_empty());
}
