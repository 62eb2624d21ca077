// elspeth-landscape/src/schema.rs
// ============================================================================
// Module: Landscape Schema
// Description: SQLite DDL, schema version, and the schema guard.
// Purpose: Create the audit tables on empty databases and fail fast with a
//          complete problem list on incompatible existing databases.
// Dependencies: rusqlite
// ============================================================================

//! ## Overview
//! The Landscape schema enforces referential integrity: error tables,
//! checkpoints, token parents, and node states carry foreign keys, and both
//! checkpoint topology hashes are `NOT NULL`. On an empty database every
//! table is created; on an existing database the guard verifies that all
//! required tables and columns are present and reports every gap in one
//! human-readable error. `SQLite` is the developer default; `PostgreSQL`
//! deployments apply equivalent DDL through out-of-band migrations.

// ============================================================================
// SECTION: Imports
// ============================================================================

use rusqlite::Connection;

use crate::error::LandscapeError;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Landscape schema version.
pub const SCHEMA_VERSION: i64 = 1;

/// DDL for every Landscape table, in dependency order.
const CREATE_TABLES: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS schema_version (
        version INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS runs (
        run_id TEXT PRIMARY KEY,
        started_at TEXT NOT NULL,
        completed_at TEXT,
        status TEXT NOT NULL,
        config_hash TEXT NOT NULL,
        settings_json TEXT NOT NULL,
        canonical_version TEXT NOT NULL,
        schema_contract_json TEXT,
        schema_contract_hash TEXT,
        run_mode TEXT,
        source_run_id TEXT,
        export_status TEXT,
        exported_at TEXT
    )",
    "CREATE TABLE IF NOT EXISTS nodes (
        node_id TEXT PRIMARY KEY,
        run_id TEXT NOT NULL REFERENCES runs(run_id),
        plugin_name TEXT NOT NULL,
        node_type TEXT NOT NULL,
        determinism TEXT NOT NULL,
        plugin_version TEXT NOT NULL,
        config_hash TEXT NOT NULL,
        config_json TEXT NOT NULL,
        input_contract_json TEXT,
        output_contract_json TEXT,
        schema_hash TEXT,
        sequence_index INTEGER
    )",
    "CREATE TABLE IF NOT EXISTS edges (
        edge_id TEXT NOT NULL,
        run_id TEXT NOT NULL REFERENCES runs(run_id),
        from_node TEXT NOT NULL,
        to_node TEXT NOT NULL,
        label TEXT NOT NULL,
        default_mode TEXT NOT NULL,
        PRIMARY KEY (run_id, edge_id)
    )",
    "CREATE TABLE IF NOT EXISTS rows (
        row_id TEXT PRIMARY KEY,
        run_id TEXT NOT NULL REFERENCES runs(run_id),
        source_node_id TEXT NOT NULL,
        row_index INTEGER NOT NULL,
        source_data_hash TEXT NOT NULL,
        payload_ref TEXT
    )",
    "CREATE TABLE IF NOT EXISTS tokens (
        token_id TEXT PRIMARY KEY,
        row_id TEXT NOT NULL REFERENCES rows(row_id),
        fork_group_id TEXT,
        join_group_id TEXT,
        expand_group_id TEXT,
        branch_name TEXT,
        step_in_pipeline INTEGER
    )",
    "CREATE TABLE IF NOT EXISTS token_parents (
        token_id TEXT NOT NULL REFERENCES tokens(token_id),
        parent_token_id TEXT NOT NULL REFERENCES tokens(token_id),
        ordinal INTEGER NOT NULL,
        PRIMARY KEY (token_id, parent_token_id, ordinal)
    )",
    "CREATE TABLE IF NOT EXISTS node_states (
        state_id TEXT PRIMARY KEY,
        token_id TEXT NOT NULL REFERENCES tokens(token_id),
        node_id TEXT NOT NULL,
        step_index INTEGER NOT NULL,
        attempt INTEGER NOT NULL,
        status TEXT NOT NULL,
        input_hash TEXT NOT NULL,
        started_at TEXT NOT NULL,
        context_before_json TEXT,
        output_hash TEXT,
        completed_at TEXT,
        duration_ms INTEGER,
        success_reason_json TEXT,
        context_after_json TEXT,
        error_json TEXT
    )",
    "CREATE TABLE IF NOT EXISTS calls (
        call_id TEXT PRIMARY KEY,
        state_id TEXT NOT NULL REFERENCES node_states(state_id),
        call_index INTEGER NOT NULL,
        call_type TEXT NOT NULL,
        status TEXT NOT NULL,
        request_hash TEXT NOT NULL,
        request_ref TEXT,
        response_hash TEXT,
        response_ref TEXT,
        latency_ms INTEGER,
        error TEXT
    )",
    "CREATE TABLE IF NOT EXISTS routing_events (
        event_id TEXT PRIMARY KEY,
        state_id TEXT NOT NULL REFERENCES node_states(state_id),
        edge_id TEXT NOT NULL,
        routing_group_id TEXT NOT NULL,
        ordinal INTEGER NOT NULL,
        mode TEXT NOT NULL,
        reason_hash TEXT,
        reason_ref TEXT
    )",
    "CREATE TABLE IF NOT EXISTS batches (
        batch_id TEXT PRIMARY KEY,
        run_id TEXT NOT NULL REFERENCES runs(run_id),
        aggregation_node_id TEXT NOT NULL,
        attempt INTEGER NOT NULL,
        status TEXT NOT NULL,
        trigger_type TEXT,
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS batch_members (
        batch_id TEXT NOT NULL REFERENCES batches(batch_id),
        token_id TEXT NOT NULL REFERENCES tokens(token_id),
        ordinal INTEGER NOT NULL,
        PRIMARY KEY (batch_id, token_id, ordinal)
    )",
    "CREATE TABLE IF NOT EXISTS artifacts (
        artifact_id TEXT PRIMARY KEY,
        run_id TEXT NOT NULL REFERENCES runs(run_id),
        node_id TEXT NOT NULL,
        path_or_uri TEXT NOT NULL,
        content_hash TEXT NOT NULL,
        size_bytes INTEGER NOT NULL,
        idempotency_key TEXT,
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS checkpoints (
        checkpoint_id TEXT PRIMARY KEY,
        run_id TEXT NOT NULL REFERENCES runs(run_id),
        token_id TEXT NOT NULL REFERENCES tokens(token_id),
        node_id TEXT NOT NULL,
        sequence_number INTEGER NOT NULL,
        upstream_topology_hash TEXT NOT NULL,
        checkpoint_node_config_hash TEXT NOT NULL,
        aggregation_state_json TEXT,
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS validation_errors (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        run_id TEXT NOT NULL REFERENCES runs(run_id),
        node_id TEXT NOT NULL,
        row_index INTEGER,
        field TEXT,
        message TEXT NOT NULL,
        row_json TEXT,
        repr_fallback_json TEXT,
        recorded_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS transform_errors (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        run_id TEXT NOT NULL REFERENCES runs(run_id),
        node_id TEXT NOT NULL,
        token_id TEXT NOT NULL REFERENCES tokens(token_id),
        state_id TEXT NOT NULL REFERENCES node_states(state_id),
        reason_json TEXT NOT NULL,
        retryable INTEGER NOT NULL,
        recorded_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS token_outcomes (
        token_id TEXT PRIMARY KEY REFERENCES tokens(token_id),
        outcome TEXT NOT NULL,
        reason TEXT,
        recorded_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS secret_resolutions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        run_id TEXT NOT NULL REFERENCES runs(run_id),
        secret_name TEXT NOT NULL,
        env_var TEXT NOT NULL,
        resolved INTEGER NOT NULL,
        recorded_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS operations (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        run_id TEXT NOT NULL REFERENCES runs(run_id),
        operation TEXT NOT NULL,
        status TEXT NOT NULL,
        detail TEXT,
        recorded_at TEXT NOT NULL
    )",
];

/// Secondary indices for the natural lookup paths.
const CREATE_INDICES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_nodes_run ON nodes(run_id)",
    "CREATE INDEX IF NOT EXISTS idx_rows_run ON rows(run_id, row_index)",
    "CREATE INDEX IF NOT EXISTS idx_tokens_row ON tokens(row_id)",
    "CREATE INDEX IF NOT EXISTS idx_states_token ON node_states(token_id, step_index)",
    "CREATE INDEX IF NOT EXISTS idx_states_status ON node_states(status)",
    "CREATE INDEX IF NOT EXISTS idx_calls_state ON calls(state_id, call_index)",
    "CREATE INDEX IF NOT EXISTS idx_calls_replay ON calls(call_type, request_hash)",
    "CREATE INDEX IF NOT EXISTS idx_routing_state ON routing_events(state_id, ordinal)",
    "CREATE INDEX IF NOT EXISTS idx_batches_run ON batches(run_id)",
    "CREATE INDEX IF NOT EXISTS idx_checkpoints_run ON checkpoints(run_id, sequence_number)",
    "CREATE INDEX IF NOT EXISTS idx_artifacts_run ON artifacts(run_id)",
];

/// Tables and the columns the guard requires of an existing database.
const REQUIRED_COLUMNS: &[(&str, &[&str])] = &[
    ("runs", &["run_id", "started_at", "completed_at", "status", "config_hash", "settings_json", "canonical_version", "run_mode", "source_run_id"]),
    ("nodes", &["node_id", "run_id", "plugin_name", "node_type", "determinism", "plugin_version", "config_hash", "config_json"]),
    ("edges", &["edge_id", "run_id", "from_node", "to_node", "label", "default_mode"]),
    ("rows", &["row_id", "run_id", "source_node_id", "row_index", "source_data_hash", "payload_ref"]),
    ("tokens", &["token_id", "row_id", "fork_group_id", "join_group_id", "expand_group_id", "branch_name"]),
    ("token_parents", &["token_id", "parent_token_id", "ordinal"]),
    ("node_states", &["state_id", "token_id", "node_id", "step_index", "attempt", "status", "input_hash", "started_at", "output_hash", "completed_at", "duration_ms", "error_json"]),
    ("calls", &["call_id", "state_id", "call_index", "call_type", "status", "request_hash", "response_hash", "latency_ms", "error"]),
    ("routing_events", &["event_id", "state_id", "edge_id", "routing_group_id", "ordinal", "mode", "reason_hash"]),
    ("batches", &["batch_id", "run_id", "aggregation_node_id", "attempt", "status", "trigger_type"]),
    ("batch_members", &["batch_id", "token_id", "ordinal"]),
    ("artifacts", &["artifact_id", "run_id", "node_id", "path_or_uri", "content_hash", "size_bytes"]),
    ("checkpoints", &["checkpoint_id", "run_id", "token_id", "node_id", "sequence_number", "upstream_topology_hash", "checkpoint_node_config_hash"]),
    ("validation_errors", &["run_id", "node_id", "message", "row_json", "repr_fallback_json"]),
    ("transform_errors", &["run_id", "node_id", "token_id", "state_id", "reason_json", "retryable"]),
    ("token_outcomes", &["token_id", "outcome", "recorded_at"]),
    ("secret_resolutions", &["run_id", "secret_name", "env_var", "resolved"]),
    ("operations", &["run_id", "operation", "status"]),
];

// ============================================================================
// SECTION: Initialization
// ============================================================================

/// Creates every table and index on an empty database.
///
/// # Errors
///
/// Returns [`LandscapeError::Db`] when DDL execution fails.
pub fn initialize_schema(connection: &mut Connection) -> Result<(), LandscapeError> {
    let tx = connection.transaction().map_err(|err| LandscapeError::Db(err.to_string()))?;
    for statement in CREATE_TABLES {
        tx.execute(statement, []).map_err(|err| LandscapeError::Db(err.to_string()))?;
    }
    for statement in CREATE_INDICES {
        tx.execute(statement, []).map_err(|err| LandscapeError::Db(err.to_string()))?;
    }
    let versions: i64 = tx
        .query_row("SELECT COUNT(*) FROM schema_version", [], |row| row.get(0))
        .map_err(|err| LandscapeError::Db(err.to_string()))?;
    if versions == 0 {
        tx.execute("INSERT INTO schema_version (version) VALUES (?1)", [SCHEMA_VERSION])
            .map_err(|err| LandscapeError::Db(err.to_string()))?;
    }
    tx.commit().map_err(|err| LandscapeError::Db(err.to_string()))
}

// ============================================================================
// SECTION: Schema Guard
// ============================================================================

/// Returns true when the database has no Landscape tables yet.
///
/// # Errors
///
/// Returns [`LandscapeError::Db`] when the catalog query fails.
pub fn is_empty_database(connection: &Connection) -> Result<bool, LandscapeError> {
    let count: i64 = connection
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'runs'",
            [],
            |row| row.get(0),
        )
        .map_err(|err| LandscapeError::Db(err.to_string()))?;
    Ok(count == 0)
}

/// Validates that an existing database carries the required schema.
///
/// Every missing table and column is collected; the guard fails once with
/// the complete list rather than stopping at the first gap.
///
/// # Errors
///
/// Returns [`LandscapeError::SchemaGuard`] listing every problem, or
/// [`LandscapeError::Db`] when catalog queries fail.
pub fn validate_schema(connection: &Connection) -> Result<(), LandscapeError> {
    let mut problems: Vec<String> = Vec::new();
    for (table, columns) in REQUIRED_COLUMNS {
        let exists: i64 = connection
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [table],
                |row| row.get(0),
            )
            .map_err(|err| LandscapeError::Db(err.to_string()))?;
        if exists == 0 {
            problems.push(format!("missing table '{table}'"));
            continue;
        }
        let mut statement = connection
            .prepare(&format!("PRAGMA table_info({table})"))
            .map_err(|err| LandscapeError::Db(err.to_string()))?;
        let present: Vec<String> = statement
            .query_map([], |row| row.get::<_, String>(1))
            .map_err(|err| LandscapeError::Db(err.to_string()))?
            .collect::<Result<_, _>>()
            .map_err(|err| LandscapeError::Db(err.to_string()))?;
        for column in *columns {
            if !present.iter().any(|name| name == column) {
                problems.push(format!("table '{table}' is missing column '{column}'"));
            }
        }
    }
    if problems.is_empty() {
        Ok(())
    } else {
        Err(LandscapeError::SchemaGuard { problems })
    }
}
