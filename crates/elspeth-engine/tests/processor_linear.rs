// elspeth-engine/tests/processor_linear.rs
// ============================================================================
// Module: Linear Pipeline Tests
// Description: End-to-end run of source -> transform -> sink.
// ============================================================================
//! ## Overview
//! The linear scenario: two rows through an identity transform into one
//! sink. Expect two rows, two tokens, four node states (transform and sink
//! per token), two artifacts, and a `completed` outcome for both tokens.

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

use common::CollectingSink;
use common::IdentityTransform;
use common::MemorySource;
use common::contract_of;
use common::make_processor;
use common::row_of;
use elspeth_core::DataValue;
use elspeth_core::GraphBuilder;
use elspeth_core::GraphNode;
use elspeth_core::NodeId;
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

/// Tests the linear scenario end to end.
#[tokio::test]
async fn test_linear_pipeline() {
    let landscape = Landscape::in_memory().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let mut processor = make_processor(landscape.clone(), dir.path());

    let contract = contract_of(&[("id", ValueKind::Integer), ("amount", ValueKind::Integer)]);
    let rows = vec![
        row_of(&[("id", DataValue::Integer(1)), ("amount", DataValue::Integer(100))]),
        row_of(&[("id", DataValue::Integer(2)), ("amount", DataValue::Integer(200))]),
    ];
    let source = MemorySource::new(rows, contract.clone());
    let (sink, written) = CollectingSink::new("output", contract.clone());

    let graph = GraphBuilder::new()
        .add_node(node("node_src", NodeType::Source))
        .add_node(node("node_identity", NodeType::Transform))
        .add_node(node("node_out", NodeType::Sink))
        .add_edge(NodeId::new("node_src"), NodeId::new("node_identity"), "continue", RoutingMode::Move)
        .add_edge(NodeId::new("node_identity"), NodeId::new("node_out"), "continue", RoutingMode::Move)
        .declare_sink("output", NodeId::new("node_out"))
        .build()
        .unwrap();

    let plan = PipelinePlan {
        run_id: RunId::generate(),
        settings_json: json!({"pipeline": "linear"}),
        run_mode: RunMode::Live,
        source_run_id: None,
        source_node: NodeId::new("node_src"),
        source: Box::new(source),
        steps: vec![PlanStep::Transform {
            node_id: NodeId::new("node_identity"),
            plugin: Box::new(IdentityTransform::new(contract.clone())),
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
    assert_eq!(report.summary.rows, 2);
    assert_eq!(report.summary.tokens, 2);
    assert_eq!(report.summary.node_states, 4);
    assert_eq!(report.summary.artifacts, 2);
    assert_eq!(report.outcome_counts.get("completed"), Some(&2));

    let delivered = written.lock().unwrap();
    assert_eq!(delivered.len(), 2);
    assert_eq!(delivered[0]["amount"], json!(100));

    // Checkpoints are deleted on successful completion.
    assert!(landscape.latest_checkpoint(&report.run_id).unwrap().is_none());

    // Every artifact carries the hash of the bytes written.
    let artifacts = landscape.artifacts_for_run(&report.run_id).unwrap();
    assert_eq!(artifacts.len(), 2);
    assert!(artifacts.iter().all(|artifact| artifact.content_hash.len() == 64));
    assert!(artifacts.iter().all(|artifact| artifact.size_bytes > 0));
}
