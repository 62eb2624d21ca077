// elspeth-engine/tests/checkpoint_resume.rs
// ============================================================================
// Module: Checkpoint & Recovery Tests
// Description: Checkpoint compatibility and typed row recovery.
// ============================================================================
//! ## Overview
//! Checkpoints record both topology hashes inside the write; resume
//! refuses graph or config drift and pre-cutoff checkpoints. Recovery
//! projects rows after the checkpoint with their original value types
//! restored when a contract is supplied.

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

use std::str::FromStr;
use std::sync::Arc;

use bigdecimal::BigDecimal;
use elspeth_core::CheckpointId;
use elspeth_core::CheckpointRecord;
use elspeth_core::ContractMode;
use elspeth_core::DataValue;
use elspeth_core::FieldContract;
use elspeth_core::FieldSource;
use elspeth_core::FieldType;
use elspeth_core::GraphBuilder;
use elspeth_core::GraphNode;
use elspeth_core::NodeId;
use elspeth_core::NodeType;
use elspeth_core::RoutingMode;
use elspeth_core::RowId;
use elspeth_core::RowRecord;
use elspeth_core::RunId;
use elspeth_core::RunRecord;
use elspeth_core::RunStatus;
use elspeth_core::SchemaContract;
use elspeth_core::Timestamp;
use elspeth_core::TokenId;
use elspeth_core::TokenRecord;
use elspeth_core::ValueKind;
use elspeth_core::interfaces::PayloadStore;
use elspeth_engine::CheckpointError;
use elspeth_engine::CheckpointManager;
use elspeth_engine::RecoveryManager;
use elspeth_landscape::FilesystemPayloadStore;
use elspeth_landscape::Landscape;
use serde_json::json;

/// Builds a two-node graph with a configurable source config.
fn graph_with_config(source_config: serde_json::Value) -> elspeth_core::ExecutionGraph {
    let sink_config = json!({"path": "out.csv"});
    GraphBuilder::new()
        .add_node(GraphNode {
            node_id: NodeId::new("node_src"),
            plugin_name: "memory_source".to_string(),
            node_type: NodeType::Source,
            config_hash: elspeth_core::stable_hash(&source_config).unwrap(),
            config: source_config,
        })
        .add_node(GraphNode {
            node_id: NodeId::new("node_out"),
            plugin_name: "collecting_sink".to_string(),
            node_type: NodeType::Sink,
            config_hash: elspeth_core::stable_hash(&sink_config).unwrap(),
            config: sink_config,
        })
        .add_edge(NodeId::new("node_src"), NodeId::new("node_out"), "continue", RoutingMode::Move)
        .declare_sink("output", NodeId::new("node_out"))
        .build()
        .unwrap()
}

/// Seeds a run with ten rows whose payloads carry typed values.
fn seed_run(landscape: &Landscape, payloads: &FilesystemPayloadStore) -> (RunId, Vec<TokenId>) {
    let run_id = RunId::new("run_cp");
    landscape
        .begin_run(&RunRecord {
            run_id: run_id.clone(),
            started_at: Timestamp::now(),
            completed_at: None,
            status: RunStatus::Running,
            config_hash: "cfg".to_string(),
            settings_json: json!({}),
            canonical_version: "jcs-sha256-1".to_string(),
            schema_contract_json: None,
            schema_contract_hash: None,
            run_mode: None,
            source_run_id: None,
            export_status: None,
            exported_at: None,
        })
        .unwrap();
    let mut tokens = Vec::new();
    for index in 0..10_u64 {
        let payload = json!({
            "id": index,
            "price": "19.99",
            "seen_at": "2026-06-15T08:00:00Z",
        });
        let payload_ref = payloads.store(payload.to_string().as_bytes()).unwrap();
        let row = RowRecord {
            row_id: RowId::new(format!("row_{index}")),
            run_id: run_id.clone(),
            source_node_id: NodeId::new("node_src"),
            row_index: index,
            source_data_hash: elspeth_core::stable_hash(&payload).unwrap(),
            payload_ref: Some(payload_ref),
        };
        let token = TokenRecord {
            token_id: TokenId::new(format!("tok_{index}")),
            row_id: row.row_id.clone(),
            fork_group_id: None,
            join_group_id: None,
            expand_group_id: None,
            branch_name: None,
            step_in_pipeline: Some(0),
        };
        landscape.create_row_with_token(&row, &token).unwrap();
        tokens.push(token.token_id);
    }
    (run_id, tokens)
}

/// Builds the typed recovery contract.
fn typed_contract() -> SchemaContract {
    SchemaContract::new(
        ContractMode::Flexible,
        vec![
            FieldContract {
                normalized_name: "id".to_string(),
                original_name: "id".to_string(),
                field_type: FieldType { kind: ValueKind::Integer, nullable: false },
                required: true,
                source: FieldSource::Declared,
            },
            FieldContract {
                normalized_name: "price".to_string(),
                original_name: "price".to_string(),
                field_type: FieldType { kind: ValueKind::Decimal, nullable: false },
                required: true,
                source: FieldSource::Declared,
            },
            FieldContract {
                normalized_name: "seen_at".to_string(),
                original_name: "seen_at".to_string(),
                field_type: FieldType { kind: ValueKind::Timestamp, nullable: false },
                required: true,
                source: FieldSource::Declared,
            },
        ],
    )
    .unwrap()
}

// ============================================================================
// SECTION: Creation and Compatibility
// ============================================================================

/// Tests checkpoint creation computes both hashes and resume validates.
#[test]
fn test_checkpoint_round_trip_compatible() {
    let landscape = Landscape::in_memory().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let payloads = FilesystemPayloadStore::open(dir.path()).unwrap();
    let (run_id, tokens) = seed_run(&landscape, &payloads);
    let graph = graph_with_config(json!({"path": "in.csv"}));

    let manager = CheckpointManager::new(landscape.clone());
    let checkpoint = manager
        .create_checkpoint(&run_id, &tokens[4], &NodeId::new("node_src"), 5, &graph, None)
        .unwrap();
    assert_eq!(checkpoint.sequence_number, 5);
    assert!(!checkpoint.upstream_topology_hash.is_empty());
    assert!(!checkpoint.checkpoint_node_config_hash.is_empty());

    let recovery = RecoveryManager::new(landscape);
    let latest = recovery.latest_checkpoint(&run_id).unwrap().unwrap();
    assert_eq!(latest.sequence_number, 5);
    recovery.validate_compatibility(&latest, &graph).unwrap();
}

/// Tests checkpoint creation rejects nodes outside the graph.
#[test]
fn test_checkpoint_unknown_node_rejected() {
    let landscape = Landscape::in_memory().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let payloads = FilesystemPayloadStore::open(dir.path()).unwrap();
    let (run_id, tokens) = seed_run(&landscape, &payloads);
    let graph = graph_with_config(json!({"path": "in.csv"}));

    let manager = CheckpointManager::new(landscape);
    let result =
        manager.create_checkpoint(&run_id, &tokens[0], &NodeId::new("ghost"), 1, &graph, None);
    assert!(matches!(result, Err(CheckpointError::UnknownNode(_))));
}

/// Tests a config change at the checkpoint node refuses resume.
#[test]
fn test_config_change_is_incompatible() {
    let landscape = Landscape::in_memory().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let payloads = FilesystemPayloadStore::open(dir.path()).unwrap();
    let (run_id, tokens) = seed_run(&landscape, &payloads);
    let original = graph_with_config(json!({"path": "in.csv"}));

    let manager = CheckpointManager::new(landscape.clone());
    manager
        .create_checkpoint(&run_id, &tokens[4], &NodeId::new("node_src"), 5, &original, None)
        .unwrap();

    let modified = graph_with_config(json!({"path": "different.csv"}));
    let recovery = RecoveryManager::new(landscape);
    let latest = recovery.latest_checkpoint(&run_id).unwrap().unwrap();
    let result = recovery.validate_compatibility(&latest, &modified);
    assert!(matches!(result, Err(CheckpointError::Incompatible { .. })));
}

/// Tests checkpoints predating deterministic node ids are refused.
#[test]
fn test_pre_cutoff_checkpoint_refused() {
    let landscape = Landscape::in_memory().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let payloads = FilesystemPayloadStore::open(dir.path()).unwrap();
    let (run_id, tokens) = seed_run(&landscape, &payloads);

    landscape
        .insert_checkpoint(&CheckpointRecord {
            checkpoint_id: CheckpointId::new("cp-ancient"),
            run_id: run_id.clone(),
            token_id: tokens[0].clone(),
            node_id: NodeId::new("node_src"),
            sequence_number: 1,
            upstream_topology_hash: "topo".to_string(),
            checkpoint_node_config_hash: "cfg".to_string(),
            aggregation_state_json: None,
            created_at: Timestamp::parse("2025-12-31T23:59:59Z").unwrap(),
        })
        .unwrap();

    let recovery = RecoveryManager::new(landscape);
    let result = recovery.latest_checkpoint(&run_id);
    assert!(matches!(result, Err(CheckpointError::Incompatible { .. })));
}

// ============================================================================
// SECTION: Row Recovery
// ============================================================================

/// Tests recovery projects rows after the checkpoint with restored types.
#[test]
fn test_unprocessed_rows_typed_restoration() {
    let landscape = Landscape::in_memory().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let payloads = FilesystemPayloadStore::open(dir.path()).unwrap();
    let (run_id, tokens) = seed_run(&landscape, &payloads);
    let graph = graph_with_config(json!({"path": "in.csv"}));

    let manager = CheckpointManager::new(landscape.clone());
    let checkpoint = manager
        .create_checkpoint(&run_id, &tokens[4], &NodeId::new("node_src"), 5, &graph, None)
        .unwrap();

    let recovery = RecoveryManager::new(landscape);
    let store: Arc<dyn PayloadStore> = Arc::new(payloads);
    let contract = typed_contract();
    let recovered =
        recovery.unprocessed_rows(&run_id, &checkpoint, &store, Some(&contract)).unwrap();

    // Rows 5 through 9 remain.
    assert_eq!(recovered.len(), 5);
    assert_eq!(recovered[0].row_index, 5);
    assert_eq!(recovered[4].row_index, 9);

    let row = &recovered[0].row;
    assert_eq!(
        row.get("price"),
        Some(&DataValue::Decimal(BigDecimal::from_str("19.99").unwrap()))
    );
    assert_eq!(
        row.get("seen_at"),
        Some(&DataValue::Timestamp(Timestamp::parse("2026-06-15T08:00:00Z").unwrap()))
    );

    // Without a contract the degradation to strings is explicit.
    let degraded = recovery_untyped(&recovery, &run_id, &checkpoint, &store);
    assert_eq!(degraded[0].row.get("price"), Some(&DataValue::Text("19.99".to_string())));
}

/// Projects rows without a contract.
fn recovery_untyped(
    recovery: &RecoveryManager,
    run_id: &RunId,
    checkpoint: &CheckpointRecord,
    store: &Arc<dyn PayloadStore>,
) -> Vec<elspeth_engine::RecoveredRow> {
    recovery.unprocessed_rows(run_id, checkpoint, store, None).unwrap()
}
