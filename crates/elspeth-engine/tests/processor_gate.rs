// elspeth-engine/tests/processor_gate.rs
// ============================================================================
// Module: Gate Routing Tests
// Description: End-to-end runs for route and fork gates.
// ============================================================================
//! ## Overview
//! Route scenario: `amount > 150` to the high sink, otherwise low; one
//! move-mode routing event per token. Fork scenario: both branches always;
//! parent tokens fork, children share a fork group and complete at their
//! branch sinks with copy-mode events.

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

use common::AmountGate;
use common::CollectingSink;
use common::ForkGate;
use common::MemorySource;
use common::contract_of;
use common::make_processor;
use common::row_of;
use elspeth_core::DataValue;
use elspeth_core::GateRouteTarget;
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

// ============================================================================
// SECTION: Route Gate
// ============================================================================

/// Tests the threshold route scenario.
#[tokio::test]
async fn test_gate_routes_by_threshold() {
    let landscape = Landscape::in_memory().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let mut processor = make_processor(landscape.clone(), dir.path());

    let contract = contract_of(&[("id", ValueKind::Integer), ("amount", ValueKind::Integer)]);
    let rows = vec![
        row_of(&[("id", DataValue::Integer(1)), ("amount", DataValue::Integer(100))]),
        row_of(&[("id", DataValue::Integer(2)), ("amount", DataValue::Integer(200))]),
    ];
    let source = MemorySource::new(rows, contract.clone());
    let (high_sink, high_rows) = CollectingSink::new("high", contract.clone());
    let (low_sink, low_rows) = CollectingSink::new("low", contract.clone());

    let graph = GraphBuilder::new()
        .add_node(node("node_src", NodeType::Source))
        .add_node(node("node_gate", NodeType::Gate))
        .add_node(node("node_high", NodeType::Sink))
        .add_node(node("node_low", NodeType::Sink))
        .add_edge(NodeId::new("node_src"), NodeId::new("node_gate"), "continue", RoutingMode::Move)
        .add_edge(NodeId::new("node_gate"), NodeId::new("node_high"), "above", RoutingMode::Move)
        .add_edge(NodeId::new("node_gate"), NodeId::new("node_low"), "below", RoutingMode::Move)
        .declare_sink("high", NodeId::new("node_high"))
        .declare_sink("low", NodeId::new("node_low"))
        .gate_route(
            NodeId::new("node_gate"),
            "above",
            GateRouteTarget::Sink { sink_name: "high".to_string() },
        )
        .gate_route(
            NodeId::new("node_gate"),
            "below",
            GateRouteTarget::Sink { sink_name: "low".to_string() },
        )
        .build()
        .unwrap();

    let plan = PipelinePlan {
        run_id: RunId::generate(),
        settings_json: json!({"pipeline": "gate"}),
        run_mode: RunMode::Live,
        source_run_id: None,
        source_node: NodeId::new("node_src"),
        source: Box::new(source),
        steps: vec![PlanStep::Gate {
            node_id: NodeId::new("node_gate"),
            plugin: Box::new(AmountGate::new(contract.clone(), 150)),
        }],
        sinks: vec![
            SinkBinding {
                name: "high".to_string(),
                node_id: NodeId::new("node_high"),
                plugin: Box::new(high_sink),
            },
            SinkBinding {
                name: "low".to_string(),
                node_id: NodeId::new("node_low"),
                plugin: Box::new(low_sink),
            },
        ],
        default_sink: "low".to_string(),
        graph,
        resume: false,
        resume_rows: None,
    };

    let report = processor.execute(plan).await.unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.outcome_counts.get("routed"), Some(&2));
    assert_eq!(high_rows.lock().unwrap().len(), 1);
    assert_eq!(low_rows.lock().unwrap().len(), 1);
    assert_eq!(high_rows.lock().unwrap()[0]["id"], json!(2));

    // One move-mode routing event per token, with a recorded reason.
    let mut move_events = 0;
    for token_id in tokens_of(&landscape, &report.run_id) {
        for state in landscape.states_for_token(&token_id).unwrap() {
            for event in landscape.routing_events_for_state(state.state_id()).unwrap() {
                assert_eq!(event.mode, RoutingMode::Move);
                assert!(event.reason_hash.is_some());
                move_events += 1;
            }
        }
    }
    assert_eq!(move_events, 2);
}

// ============================================================================
// SECTION: Fork Gate
// ============================================================================

/// Tests the always-fork scenario.
#[tokio::test]
async fn test_gate_forks_both_branches() {
    let landscape = Landscape::in_memory().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let mut processor = make_processor(landscape.clone(), dir.path());

    let contract = contract_of(&[("id", ValueKind::Integer)]);
    let rows = vec![
        row_of(&[("id", DataValue::Integer(1))]),
        row_of(&[("id", DataValue::Integer(2))]),
    ];
    let source = MemorySource::new(rows, contract.clone());
    let (archive_sink, archive_rows) = CollectingSink::new("archive", contract.clone());
    let (audit_sink, audit_rows) = CollectingSink::new("audit", contract.clone());

    let graph = GraphBuilder::new()
        .add_node(node("node_src", NodeType::Source))
        .add_node(node("node_fork", NodeType::Gate))
        .add_node(node("node_archive", NodeType::Sink))
        .add_node(node("node_audit", NodeType::Sink))
        .add_edge(NodeId::new("node_src"), NodeId::new("node_fork"), "continue", RoutingMode::Move)
        .add_edge(NodeId::new("node_fork"), NodeId::new("node_archive"), "archive", RoutingMode::Copy)
        .add_edge(NodeId::new("node_fork"), NodeId::new("node_audit"), "audit", RoutingMode::Copy)
        .declare_sink("archive", NodeId::new("node_archive"))
        .declare_sink("audit", NodeId::new("node_audit"))
        .gate_route(NodeId::new("node_fork"), "archive", GateRouteTarget::Fork)
        .gate_route(NodeId::new("node_fork"), "audit", GateRouteTarget::Fork)
        .build()
        .unwrap();

    let plan = PipelinePlan {
        run_id: RunId::generate(),
        settings_json: json!({"pipeline": "fork"}),
        run_mode: RunMode::Live,
        source_run_id: None,
        source_node: NodeId::new("node_src"),
        source: Box::new(source),
        steps: vec![PlanStep::Gate {
            node_id: NodeId::new("node_fork"),
            plugin: Box::new(ForkGate::new(contract.clone(), &["archive", "audit"])),
        }],
        sinks: vec![
            SinkBinding {
                name: "archive".to_string(),
                node_id: NodeId::new("node_archive"),
                plugin: Box::new(archive_sink),
            },
            SinkBinding {
                name: "audit".to_string(),
                node_id: NodeId::new("node_audit"),
                plugin: Box::new(audit_sink),
            },
        ],
        default_sink: "archive".to_string(),
        graph,
        resume: false,
        resume_rows: None,
    };

    let report = processor.execute(plan).await.unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    // Per input row: one forked parent, two completed children.
    assert_eq!(report.outcome_counts.get("forked"), Some(&2));
    assert_eq!(report.outcome_counts.get("completed"), Some(&4));
    assert_eq!(archive_rows.lock().unwrap().len(), 2);
    assert_eq!(audit_rows.lock().unwrap().len(), 2);

    // Children of one parent share a fork group; events are copy-mode.
    let mut copy_events = 0;
    let mut children_with_group = 0;
    for token_id in tokens_of(&landscape, &report.run_id) {
        let token = landscape.get_token(&token_id).unwrap().unwrap();
        if token.fork_group_id.is_some() {
            children_with_group += 1;
            assert!(token.branch_name.is_some());
            let parents = landscape.token_parents(&token_id).unwrap();
            assert_eq!(parents.len(), 1);
        }
        for state in landscape.states_for_token(&token_id).unwrap() {
            for event in landscape.routing_events_for_state(state.state_id()).unwrap() {
                assert_eq!(event.mode, RoutingMode::Copy);
                copy_events += 1;
            }
        }
    }
    assert_eq!(children_with_group, 4);
    assert_eq!(copy_events, 4);
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Collects every token id of a run.
fn tokens_of(landscape: &Landscape, run_id: &elspeth_core::RunId) -> Vec<elspeth_core::TokenId> {
    landscape
        .tokens_for_run(run_id)
        .unwrap()
        .into_iter()
        .map(|token| token.token_id)
        .collect()
}
