// elspeth-engine/tests/processor_coalesce.rs
// ============================================================================
// Module: Coalesce Join Tests
// Description: Fork-to-coalesce joins and parked-token accounting.
// ============================================================================
//! ## Overview
//! A coalesce joins fork siblings N-to-1: arrivals are recorded as
//! `buffered` while they wait, the join supersedes them with `coalesced`,
//! and the merged token carries multi-parent links. A run interrupted while
//! a sibling is still waiting must give the parked token a terminal
//! outcome before closing; no token is ever dropped silently.

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

use common::CancelTransform;
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
use elspeth_core::TokenOutcome;
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
// SECTION: Join
// ============================================================================

/// Tests a fork into two branches that join at a coalesce.
#[tokio::test]
async fn test_fork_branches_join_at_coalesce() {
    let landscape = Landscape::in_memory().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let mut processor = make_processor(landscape.clone(), dir.path());

    let contract = contract_of(&[("id", ValueKind::Integer)]);
    let rows = vec![row_of(&[("id", DataValue::Integer(1))])];
    let source = MemorySource::new(rows, contract.clone());
    let (sink, written) = CollectingSink::new("output", contract.clone());

    let graph = GraphBuilder::new()
        .add_node(node("node_src", NodeType::Source))
        .add_node(node("node_fork", NodeType::Gate))
        .add_node(node("node_join", NodeType::Coalesce))
        .add_node(node("node_out", NodeType::Sink))
        .add_edge(NodeId::new("node_src"), NodeId::new("node_fork"), "continue", RoutingMode::Move)
        .add_edge(NodeId::new("node_fork"), NodeId::new("node_join"), "join_a", RoutingMode::Copy)
        .add_edge(NodeId::new("node_fork"), NodeId::new("node_join"), "join_b", RoutingMode::Copy)
        .add_edge(NodeId::new("node_join"), NodeId::new("node_out"), "continue", RoutingMode::Move)
        .declare_sink("output", NodeId::new("node_out"))
        .gate_route(NodeId::new("node_fork"), "join_a", GateRouteTarget::Fork)
        .gate_route(NodeId::new("node_fork"), "join_b", GateRouteTarget::Fork)
        .build()
        .unwrap();

    let plan = PipelinePlan {
        run_id: RunId::generate(),
        settings_json: json!({"pipeline": "coalesce"}),
        run_mode: RunMode::Live,
        source_run_id: None,
        source_node: NodeId::new("node_src"),
        source: Box::new(source),
        steps: vec![
            PlanStep::Gate {
                node_id: NodeId::new("node_fork"),
                plugin: Box::new(ForkGate::new(contract.clone(), &["join_a", "join_b"])),
            },
            PlanStep::Coalesce { node_id: NodeId::new("node_join") },
        ],
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
    // One forked parent, two coalesced siblings, one completed join token.
    assert_eq!(report.outcome_counts.get("forked"), Some(&1));
    assert_eq!(report.outcome_counts.get("coalesced"), Some(&2));
    assert_eq!(report.outcome_counts.get("completed"), Some(&1));
    assert_eq!(report.outcome_counts.get("buffered"), None);
    assert_eq!(written.lock().unwrap().len(), 1);

    // The joined token carries the join group and both parent links.
    let tokens = landscape.tokens_for_run(&report.run_id).unwrap();
    assert_eq!(tokens.len(), 4);
    let joined: Vec<_> = tokens.iter().filter(|token| token.join_group_id.is_some()).collect();
    assert_eq!(joined.len(), 1);
    let parents = landscape.token_parents(&joined[0].token_id).unwrap();
    assert_eq!(parents.len(), 2);
    assert_eq!(parents[0].ordinal, 0);
    assert_eq!(parents[1].ordinal, 1);

    // Every token has an outcome: nothing dropped, nothing left buffered.
    for token in &tokens {
        let outcome = landscape.token_outcome(&token.token_id).unwrap().unwrap();
        assert!(outcome.outcome.is_terminal());
    }
}

// ============================================================================
// SECTION: Interruption
// ============================================================================

/// Tests a run cancelled while one sibling waits at the coalesce.
///
/// Branch `join_a` parks at the join; branch `join_b` passes through a
/// transform that requests cancellation before reaching it. The parked
/// sibling must close with a terminal outcome, not vanish.
#[tokio::test]
async fn test_interruption_fails_parked_sibling() {
    let landscape = Landscape::in_memory().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let mut processor = make_processor(landscape.clone(), dir.path());

    let contract = contract_of(&[("id", ValueKind::Integer)]);
    let rows = vec![row_of(&[("id", DataValue::Integer(1))])];
    let source = MemorySource::new(rows, contract.clone());
    let (sink, written) = CollectingSink::new("output", contract.clone());

    let graph = GraphBuilder::new()
        .add_node(node("node_src", NodeType::Source))
        .add_node(node("node_fork", NodeType::Gate))
        .add_node(node("node_cancel", NodeType::Transform))
        .add_node(node("node_join", NodeType::Coalesce))
        .add_node(node("node_out", NodeType::Sink))
        .add_edge(NodeId::new("node_src"), NodeId::new("node_fork"), "continue", RoutingMode::Move)
        .add_edge(NodeId::new("node_fork"), NodeId::new("node_join"), "join_a", RoutingMode::Copy)
        .add_edge(NodeId::new("node_fork"), NodeId::new("node_cancel"), "join_b", RoutingMode::Copy)
        .add_edge(NodeId::new("node_cancel"), NodeId::new("node_join"), "continue", RoutingMode::Move)
        .add_edge(NodeId::new("node_join"), NodeId::new("node_out"), "continue", RoutingMode::Move)
        .declare_sink("output", NodeId::new("node_out"))
        .gate_route(NodeId::new("node_fork"), "join_a", GateRouteTarget::Fork)
        .gate_route(NodeId::new("node_fork"), "join_b", GateRouteTarget::Fork)
        .build()
        .unwrap();

    let plan = PipelinePlan {
        run_id: RunId::generate(),
        settings_json: json!({"pipeline": "coalesce_interrupt"}),
        run_mode: RunMode::Live,
        source_run_id: None,
        source_node: NodeId::new("node_src"),
        source: Box::new(source),
        steps: vec![
            PlanStep::Gate {
                node_id: NodeId::new("node_fork"),
                plugin: Box::new(ForkGate::new(contract.clone(), &["join_a", "join_b"])),
            },
            PlanStep::Transform {
                node_id: NodeId::new("node_cancel"),
                plugin: Box::new(CancelTransform::new(contract.clone())),
            },
            PlanStep::Coalesce { node_id: NodeId::new("node_join") },
        ],
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

    assert_eq!(report.status, RunStatus::Interrupted);
    assert!(written.lock().unwrap().is_empty());

    // The parent forked; both children failed with explicit reasons; no
    // token is left without a terminal outcome.
    assert_eq!(report.outcome_counts.get("forked"), Some(&1));
    assert_eq!(report.outcome_counts.get("failed"), Some(&2));
    assert_eq!(report.outcome_counts.get("buffered"), None);

    let tokens = landscape.tokens_for_run(&report.run_id).unwrap();
    assert_eq!(tokens.len(), 3);
    let mut reasons = Vec::new();
    for token in &tokens {
        let outcome = landscape.token_outcome(&token.token_id).unwrap().unwrap();
        assert!(outcome.outcome.is_terminal());
        if outcome.outcome == TokenOutcome::Failed {
            reasons.push(outcome.reason.unwrap_or_default());
        }
    }
    reasons.sort();
    assert_eq!(
        reasons,
        vec!["run_interrupted".to_string(), "run_interrupted_before_join".to_string()]
    );
}
