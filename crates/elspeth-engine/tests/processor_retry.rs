// elspeth-engine/tests/processor_retry.rs
// ============================================================================
// Module: Retry Scenario Tests
// Description: End-to-end retry with per-attempt states.
// ============================================================================
//! ## Overview
//! A transform fails retryably twice, then succeeds with three attempts
//! allowed. Expect three node states with distinct state ids on the same
//! token at the transform node (attempts 0 and 1 failed, attempt 2
//! completed) and a `completed` token outcome.

#![allow(
    clippy::panic,
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::use_debug,
    clippy::dbg_macro,
    clippy::panic_in_result_fn,
    clippy::unwrap_in_result,
    reason = "Test-only output and panic-based assertions are permitted."
)]

mod common;

use std::collections::BTreeSet;

use common::CollectingSink;
use common::FlakyTransform;
use common::MemorySource;
use common::contract_of;
use common::make_processor;
use common::row_of;
use elspeth_core::DataValue;
use elspeth_core::GraphBuilder;
use elspeth_core::GraphNode;
use elspeth_core::NodeId;
use elspeth_core::NodeState;
use elspeth_core::NodeType;
use elspeth_core::RoutingMode;
use elspeth_core::RunId;
use elspeth_core::RunMode;
use elspeth_core::RunStatus;
use elspeth_core::ValueKind;
use elspeth_engine::PipelinePlan;
use elspeth_engine::PlanStep;
use elspeth_engine::SinkBinding;
use elspeth_landscape::Landscape;
use serde_json::json;

/// Builds a graph node for a test plan.
fn node(id: &str, node_type: NodeType) -> GraphNode {
    let config = json!({ "id": id });
    GraphNode {
        node_id: NodeId::new(id),
        plugin_name: format!("{id}_plugin"),
        node_type,
        config_hash: elspeth_core::stable_hash(&config).unwrap(),
        config,
    }
}

/// Tests two retryable failures followed by success.
#[tokio::test]
async fn test_retryable_failures_then_success() {
    let landscape = Landscape::in_memory().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let mut processor = make_processor(landscape.clone(), dir.path());

    let contract = contract_of(&[("id", ValueKind::Integer)]);
    let rows = vec![row_of(&[("id", DataValue::Integer(1))])];
    let source = MemorySource::new(rows, contract.clone());
    let (flaky, calls) = FlakyTransform::new(contract.clone(), 2);
    let (sink, written) = CollectingSink::new("output", contract.clone());

    let graph = GraphBuilder::new()
        .add_node(node("node_src", NodeType::Source))
        .add_node(node("node_flaky", NodeType::Transform))
        .add_node(node("node_out", NodeType::Sink))
        .add_edge(NodeId::new("node_src"), NodeId::new("node_flaky"), "continue", RoutingMode::Move)
        .add_edge(NodeId::new("node_flaky"), NodeId::new("node_out"), "continue", RoutingMode::Move)
        .declare_sink("output", NodeId::new("node_out"))
        .build()
        .unwrap();

    let plan = PipelinePlan {
        run_id: RunId::generate(),
        settings_json: json!({"pipeline": "retry"}),
        run_mode: RunMode::Live,
        source_run_id: None,
        source_node: NodeId::new("node_src"),
        source: Box::new(source),
        steps: vec![PlanStep::Transform {
            node_id: NodeId::new("node_flaky"),
            plugin: Box::new(flaky),
        }],
        sinks: vec![SinkBinding {
            name: "output".to_string(),
            node_id: NodeId::new("node_out"),
            plugin: Box::new(sink),
        }],
        default_sink: "output".to_string(),
        graph,
        resume: false,
        resume_rows: None,
    };

    let report = processor.execute(plan).await.unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(*calls.lock().unwrap(), 3);
    assert_eq!(report.outcome_counts.get("completed"), Some(&1));
    assert_eq!(written.lock().unwrap().len(), 1);

    // Three attempts, three distinct state ids at the flaky node.
    let token = landscape.tokens_for_run(&report.run_id).unwrap().remove(0);
    let states = landscape.states_for_token(&token.token_id).unwrap();
    let flaky_states: Vec<&NodeState> = states
        .iter()
        .filter(|state| state.envelope().node_id == NodeId::new("node_flaky"))
        .collect();
    assert_eq!(flaky_states.len(), 3);

    let distinct: BTreeSet<&str> =
        flaky_states.iter().map(|state| state.state_id().as_str()).collect();
    assert_eq!(distinct.len(), 3);

    let attempts: Vec<u32> =
        flaky_states.iter().map(|state| state.envelope().attempt).collect();
    assert_eq!(attempts, vec![0, 1, 2]);
    assert_eq!(flaky_states[0].status(), "failed");
    assert_eq!(flaky_states[1].status(), "failed");
    assert_eq!(flaky_states[2].status(), "completed");
}

/// Tests exhausted retries fail the token.
#[tokio::test]
async fn test_exhausted_retries_fail_token() {
    let landscape = Landscape::in_memory().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let mut processor = make_processor(landscape.clone(), dir.path());

    let contract = contract_of(&[("id", ValueKind::Integer)]);
    let rows = vec![row_of(&[("id", DataValue::Integer(1))])];
    let source = MemorySource::new(rows, contract.clone());
    let (flaky, calls) = FlakyTransform::new(contract.clone(), 10);
    let (sink, written) = CollectingSink::new("output", contract.clone());

    let graph = GraphBuilder::new()
        .add_node(node("node_src", NodeType::Source))
        .add_node(node("node_flaky", NodeType::Transform))
        .add_node(node("node_out", NodeType::Sink))
        .add_edge(NodeId::new("node_src"), NodeId::new("node_flaky"), "continue", RoutingMode::Move)
        .add_edge(NodeId::new("node_flaky"), NodeId::new("node_out"), "continue", RoutingMode::Move)
        .declare_sink("output", NodeId::new("node_out"))
        .build()
        .unwrap();

    let plan = PipelinePlan {
        run_id: RunId::generate(),
        settings_json: json!({"pipeline": "retry_exhausted"}),
        run_mode: RunMode::Live,
        source_run_id: None,
        source_node: NodeId::new("node_src"),
        source: Box::new(source),
        steps: vec![PlanStep::Transform {
            node_id: NodeId::new("node_flaky"),
            plugin: Box::new(flaky),
        }],
        sinks: vec![SinkBinding {
            name: "output".to_string(),
            node_id: NodeId::new("node_out"),
            plugin: Box::new(sink),
        }],
        default_sink: "output".to_string(),
        graph,
        resume: false,
        resume_rows: None,
    };

    let report = processor.execute(plan).await.unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(*calls.lock().unwrap(), 3);
    assert_eq!(report.outcome_counts.get("failed"), Some(&1));
    assert!(written.lock().unwrap().is_empty());
}
