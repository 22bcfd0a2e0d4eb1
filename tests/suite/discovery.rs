//! Discovery of a Testing Platform project through `test/discover`.

use serde_json::json;

use crate::common::{ADDS, DIVIDES, Harness, PROJECT, SOLUTION, ScriptedDotnet, TARGET, node};

#[tokio::test]
async fn discover_builds_then_asks_the_test_host() {
    let mut harness = Harness::start(ScriptedDotnet::default()).await;
    let result = harness.discover().await;

    let commands = harness.launcher.launched_commands();
    assert!(commands[0].starts_with("dotnet build"), "{commands:?}");
    assert!(commands[0].contains(PROJECT));
    assert!(
        commands[1].starts_with(&format!("dotnet exec {TARGET} --server")),
        "{commands:?}"
    );
    assert_eq!(harness.launcher.host_calls("testing/discoverTests").len(), 1);

    let nodes = &result["nodes"];
    assert_eq!(nodes[0]["id"], PROJECT);
    assert_eq!(nodes[0]["parentId"], SOLUTION);
    assert_eq!(nodes[0]["status"]["kind"], "idle");

    let adds = node(nodes, ADDS);
    assert_eq!(adds["displayName"], "Adds");
    assert_eq!(adds["fullyQualifiedName"], ADDS);
    assert_eq!(adds["filePath"], "/repo/App.Tests/MathTests.cs");
    assert_eq!(adds["type"], "testMethod");
    node(nodes, DIVIDES);

    let seen = harness.drain();
    assert!(seen.iter().any(|(method, _)| method == "test/treeChanged"));
    let project_kinds: Vec<_> = seen
        .iter()
        .filter(|(method, params)| method == "test/statusChanged" && params["id"] == PROJECT)
        .map(|(_, params)| params["status"]["kind"].as_str().unwrap_or_default().to_string())
        .collect();
    assert_eq!(project_kinds, ["building", "discovering", "idle"]);
}

#[tokio::test]
async fn tree_lists_the_solution_and_survives_rediscovery() {
    let harness = Harness::start(ScriptedDotnet::default()).await;
    harness.discover().await;
    harness.discover().await;

    let tree = harness.call("test/tree", json!({})).await;
    let nodes = &tree["nodes"];
    assert_eq!(node(nodes, SOLUTION)["type"], "solution");
    assert_eq!(node(nodes, PROJECT)["parentId"], SOLUTION);
    let leaves = nodes
        .as_array()
        .unwrap()
        .iter()
        .filter(|n| n["id"] == ADDS || n["id"] == DIVIDES)
        .count();
    assert_eq!(leaves, 2);
}
