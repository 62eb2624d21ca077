// elspeth-landscape/src/store.rs
// ============================================================================
// Module: Landscape Store
// Description: SQLite-backed repositories for every audit table.
// Purpose: Persist runs, nodes, tokens, states, calls, routing, batches,
//          artifacts, checkpoints, outcomes, and errors durably.
// Dependencies: elspeth-core, rusqlite, serde_json
// ============================================================================

//! ## Overview
//! The Landscape is the single source of truth for a run. Every write is a
//! short transaction; `begin_node_state` and `complete_node_state` are
//! deliberately separate transactions so a crash mid-node leaves an OPEN
//! state that recovery observes. Reads of node states are discriminated by
//! the stored status and return the matching [`NodeState`] variant; corrupt
//! status labels are Tier-1 failures and crash via
//! [`LandscapeError::Corrupt`].
//!
//! Token outcomes are enforced here: a token receives exactly one terminal
//! outcome. A non-terminal `buffered` marker may be superseded once by the
//! terminal outcome recorded at batch flush.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use elspeth_core::ArtifactRecord;
use elspeth_core::BatchMember;
use elspeth_core::BatchRecord;
use elspeth_core::BatchStatus;
use elspeth_core::CallId;
use elspeth_core::CallRecord;
use elspeth_core::CallStatus;
use elspeth_core::CallType;
use elspeth_core::CheckpointId;
use elspeth_core::CheckpointRecord;
use elspeth_core::Determinism;
use elspeth_core::EdgeRecord;
use elspeth_core::ExportStatus;
use elspeth_core::GroupId;
use elspeth_core::NodeId;
use elspeth_core::NodeRecord;
use elspeth_core::NodeState;
use elspeth_core::NodeType;
use elspeth_core::RoutingEventId;
use elspeth_core::RoutingEventRecord;
use elspeth_core::RoutingMode;
use elspeth_core::RowId;
use elspeth_core::RowRecord;
use elspeth_core::RunId;
use elspeth_core::RunMode;
use elspeth_core::RunRecord;
use elspeth_core::RunStatus;
use elspeth_core::StateEnvelope;
use elspeth_core::StateId;
use elspeth_core::Timestamp;
use elspeth_core::TokenId;
use elspeth_core::TokenOutcome;
use elspeth_core::TokenOutcomeRecord;
use elspeth_core::TokenParent;
use elspeth_core::TokenRecord;
use elspeth_core::TransformErrorRecord;
use elspeth_core::TriggerType;
use elspeth_core::ValidationErrorRecord;
use rusqlite::Connection;
use rusqlite::OptionalExtension;
use rusqlite::Row;
use rusqlite::params;
use serde_json::Value;

use crate::error::LandscapeError;
use crate::schema;

// ============================================================================
// SECTION: Landscape Store
// ============================================================================

/// Durable audit store over a shared `SQLite` connection.
#[derive(Clone)]
pub struct Landscape {
    /// Shared connection guarded by a mutex.
    connection: Arc<Mutex<Connection>>,
    /// Database path; `None` for in-memory stores.
    path: Option<PathBuf>,
}

impl Landscape {
    /// Opens (or creates) a Landscape database at `path`.
    ///
    /// An empty database gets the full schema; an existing database passes
    /// through the schema guard first.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the database cannot be opened, the
    /// schema cannot be created, or the guard finds gaps.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LandscapeError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|err| LandscapeError::Io(err.to_string()))?;
            }
        }
        let mut connection =
            Connection::open(&path).map_err(|err| LandscapeError::Db(err.to_string()))?;
        configure_connection(&connection)?;
        if schema::is_empty_database(&connection)? {
            schema::initialize_schema(&mut connection)?;
        } else {
            schema::validate_schema(&connection)?;
        }
        Ok(Self { connection: Arc::new(Mutex::new(connection)), path: Some(path) })
    }

    /// Opens an in-memory Landscape (tests and dry runs).
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when schema creation fails.
    pub fn in_memory() -> Result<Self, LandscapeError> {
        let mut connection =
            Connection::open_in_memory().map_err(|err| LandscapeError::Db(err.to_string()))?;
        configure_connection(&connection)?;
        schema::initialize_schema(&mut connection)?;
        Ok(Self { connection: Arc::new(Mutex::new(connection)), path: None })
    }

    /// Returns the database path, when file-backed.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Locks the shared connection.
    fn lock(&self) -> Result<MutexGuard<'_, Connection>, LandscapeError> {
        self.connection
            .lock()
            .map_err(|_| LandscapeError::Db("landscape connection mutex poisoned".to_string()))
    }

    // ========================================================================
    // SECTION: Runs
    // ========================================================================

    /// Opens a run row.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the insert fails.
    pub fn begin_run(&self, run: &RunRecord) -> Result<(), LandscapeError> {
        let guard = self.lock()?;
        guard
            .execute(
                "INSERT INTO runs (run_id, started_at, completed_at, status, config_hash,
                 settings_json, canonical_version, schema_contract_json, schema_contract_hash,
                 run_mode, source_run_id, export_status, exported_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    run.run_id.as_str(),
                    run.started_at.to_rfc3339(),
                    run.completed_at.map(|at| at.to_rfc3339()),
                    run.status.as_str(),
                    run.config_hash,
                    run.settings_json.to_string(),
                    run.canonical_version,
                    run.schema_contract_json.as_ref().map(Value::to_string),
                    run.schema_contract_hash.as_deref(),
                    run.run_mode.map(RunMode::as_str),
                    run.source_run_id.as_ref().map(RunId::as_str),
                    run.export_status.map(export_status_label),
                    run.exported_at.map(|at| at.to_rfc3339()),
                ],
            )
            .map_err(|err| LandscapeError::Db(err.to_string()))?;
        Ok(())
    }

    /// Closes a run row with a terminal status.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError::NotFound`] when the run does not exist.
    pub fn complete_run(
        &self,
        run_id: &RunId,
        status: RunStatus,
        completed_at: Timestamp,
    ) -> Result<(), LandscapeError> {
        let guard = self.lock()?;
        let affected = guard
            .execute(
                "UPDATE runs SET status = ?2, completed_at = ?3 WHERE run_id = ?1",
                params![run_id.as_str(), status.as_str(), completed_at.to_rfc3339()],
            )
            .map_err(|err| LandscapeError::Db(err.to_string()))?;
        if affected == 0 {
            return Err(LandscapeError::NotFound(format!("run {run_id}")));
        }
        Ok(())
    }

    /// Re-opens an interrupted run for resume.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError::NotFound`] when the run does not exist.
    pub fn resume_run(&self, run_id: &RunId) -> Result<(), LandscapeError> {
        let guard = self.lock()?;
        let affected = guard
            .execute(
                "UPDATE runs SET status = 'running', completed_at = NULL WHERE run_id = ?1",
                params![run_id.as_str()],
            )
            .map_err(|err| LandscapeError::Db(err.to_string()))?;
        if affected == 0 {
            return Err(LandscapeError::NotFound(format!("run {run_id}")));
        }
        Ok(())
    }

    /// Loads a run row.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] on read failure or corrupt stored data.
    pub fn get_run(&self, run_id: &RunId) -> Result<Option<RunRecord>, LandscapeError> {
        let guard = self.lock()?;
        guard
            .query_row(
                "SELECT run_id, started_at, completed_at, status, config_hash, settings_json,
                 canonical_version, schema_contract_json, schema_contract_hash, run_mode,
                 source_run_id, export_status, exported_at FROM runs WHERE run_id = ?1",
                params![run_id.as_str()],
                run_record_from_row,
            )
            .optional()
            .map_err(|err| LandscapeError::Db(err.to_string()))?
            .transpose()
    }

    // ========================================================================
    // SECTION: Nodes and Edges
    // ========================================================================

    /// Registers a node; the determinism declaration is required upstream.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the insert fails.
    pub fn register_node(&self, node: &NodeRecord) -> Result<(), LandscapeError> {
        let guard = self.lock()?;
        guard
            .execute(
                "INSERT INTO nodes (node_id, run_id, plugin_name, node_type, determinism,
                 plugin_version, config_hash, config_json, input_contract_json,
                 output_contract_json, schema_hash, sequence_index)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    node.node_id.as_str(),
                    node.run_id.as_str(),
                    node.plugin_name,
                    node.node_type.as_str(),
                    node.determinism.as_str(),
                    node.plugin_version,
                    node.config_hash,
                    node.config_json.to_string(),
                    node.input_contract_json.as_ref().map(Value::to_string),
                    node.output_contract_json.as_ref().map(Value::to_string),
                    node.schema_hash.as_deref(),
                    node.sequence_index,
                ],
            )
            .map_err(|err| LandscapeError::Db(err.to_string()))?;
        Ok(())
    }

    /// Loads a node row.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] on read failure or corrupt stored data.
    pub fn get_node(&self, node_id: &NodeId) -> Result<Option<NodeRecord>, LandscapeError> {
        let guard = self.lock()?;
        guard
            .query_row(
                "SELECT node_id, run_id, plugin_name, node_type, determinism, plugin_version,
                 config_hash, config_json, input_contract_json, output_contract_json,
                 schema_hash, sequence_index FROM nodes WHERE node_id = ?1",
                params![node_id.as_str()],
                node_record_from_row,
            )
            .optional()
            .map_err(|err| LandscapeError::Db(err.to_string()))?
            .transpose()
    }

    /// Records an edge of the run's graph.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the insert fails.
    pub fn record_edge(&self, edge: &EdgeRecord) -> Result<(), LandscapeError> {
        let guard = self.lock()?;
        guard
            .execute(
                "INSERT INTO edges (edge_id, run_id, from_node, to_node, label, default_mode)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    edge.edge_id,
                    edge.run_id.as_str(),
                    edge.from_node.as_str(),
                    edge.to_node.as_str(),
                    edge.label,
                    edge.default_mode.as_str(),
                ],
            )
            .map_err(|err| LandscapeError::Db(err.to_string()))?;
        Ok(())
    }

    // ========================================================================
    // SECTION: Rows and Tokens
    // ========================================================================

    /// Creates a row and its first token in one transaction.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when either insert fails; neither row is
    /// kept on failure.
    pub fn create_row_with_token(
        &self,
        row: &RowRecord,
        token: &TokenRecord,
    ) -> Result<(), LandscapeError> {
        let mut guard = self.lock()?;
        let tx = guard.transaction().map_err(|err| LandscapeError::Db(err.to_string()))?;
        insert_row_tx(&tx, row)?;
        insert_token_tx(&tx, token)?;
        tx.commit().map_err(|err| LandscapeError::Db(err.to_string()))
    }

    /// Inserts a child token with its parent links in one transaction.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when any insert fails.
    pub fn create_child_token(
        &self,
        token: &TokenRecord,
        parents: &[TokenParent],
    ) -> Result<(), LandscapeError> {
        let mut guard = self.lock()?;
        let tx = guard.transaction().map_err(|err| LandscapeError::Db(err.to_string()))?;
        insert_token_tx(&tx, token)?;
        for parent in parents {
            tx.execute(
                "INSERT INTO token_parents (token_id, parent_token_id, ordinal)
                 VALUES (?1, ?2, ?3)",
                params![
                    parent.token_id.as_str(),
                    parent.parent_token_id.as_str(),
                    parent.ordinal,
                ],
            )
            .map_err(|err| LandscapeError::Db(err.to_string()))?;
        }
        tx.commit().map_err(|err| LandscapeError::Db(err.to_string()))
    }

    /// Loads a token row.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] on read failure.
    pub fn get_token(&self, token_id: &TokenId) -> Result<Option<TokenRecord>, LandscapeError> {
        let guard = self.lock()?;
        guard
            .query_row(
                "SELECT token_id, row_id, fork_group_id, join_group_id, expand_group_id,
                 branch_name, step_in_pipeline FROM tokens WHERE token_id = ?1",
                params![token_id.as_str()],
                |row| {
                    Ok(TokenRecord {
                        token_id: TokenId::new(row.get::<_, String>(0)?),
                        row_id: RowId::new(row.get::<_, String>(1)?),
                        fork_group_id: row.get::<_, Option<String>>(2)?.map(GroupId::new),
                        join_group_id: row.get::<_, Option<String>>(3)?.map(GroupId::new),
                        expand_group_id: row.get::<_, Option<String>>(4)?.map(GroupId::new),
                        branch_name: row.get(5)?,
                        step_in_pipeline: row.get(6)?,
                    })
                },
            )
            .optional()
            .map_err(|err| LandscapeError::Db(err.to_string()))
    }

    /// Loads parent links for a token ordered by ordinal.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] on read failure.
    pub fn token_parents(&self, token_id: &TokenId) -> Result<Vec<TokenParent>, LandscapeError> {
        let guard = self.lock()?;
        let mut statement = guard
            .prepare(
                "SELECT token_id, parent_token_id, ordinal FROM token_parents
                 WHERE token_id = ?1 ORDER BY ordinal",
            )
            .map_err(|err| LandscapeError::Db(err.to_string()))?;
        let parents = statement
            .query_map(params![token_id.as_str()], |row| {
                Ok(TokenParent {
                    token_id: TokenId::new(row.get::<_, String>(0)?),
                    parent_token_id: TokenId::new(row.get::<_, String>(1)?),
                    ordinal: row.get(2)?,
                })
            })
            .map_err(|err| LandscapeError::Db(err.to_string()))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| LandscapeError::Db(err.to_string()))?;
        Ok(parents)
    }

    /// Loads the row a token carries.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] on read failure.
    pub fn row_for_token(&self, token_id: &TokenId) -> Result<Option<RowRecord>, LandscapeError> {
        let guard = self.lock()?;
        guard
            .query_row(
                "SELECT r.row_id, r.run_id, r.source_node_id, r.row_index, r.source_data_hash,
                 r.payload_ref FROM rows r JOIN tokens t ON t.row_id = r.row_id
                 WHERE t.token_id = ?1",
                params![token_id.as_str()],
                row_record_from_row,
            )
            .optional()
            .map_err(|err| LandscapeError::Db(err.to_string()))
    }

    /// Loads every row of a run ordered by index.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] on read failure.
    pub fn rows_for_run(&self, run_id: &RunId) -> Result<Vec<RowRecord>, LandscapeError> {
        let guard = self.lock()?;
        let mut statement = guard
            .prepare(
                "SELECT row_id, run_id, source_node_id, row_index, source_data_hash, payload_ref
                 FROM rows WHERE run_id = ?1 ORDER BY row_index",
            )
            .map_err(|err| LandscapeError::Db(err.to_string()))?;
        let rows = statement
            .query_map(params![run_id.as_str()], row_record_from_row)
            .map_err(|err| LandscapeError::Db(err.to_string()))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| LandscapeError::Db(err.to_string()))?;
        Ok(rows)
    }

    /// Loads every token of a run in creation order.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] on read failure.
    pub fn tokens_for_run(&self, run_id: &RunId) -> Result<Vec<TokenRecord>, LandscapeError> {
        let guard = self.lock()?;
        let mut statement = guard
            .prepare(
                "SELECT t.token_id, t.row_id, t.fork_group_id, t.join_group_id,
                 t.expand_group_id, t.branch_name, t.step_in_pipeline
                 FROM tokens t JOIN rows r ON r.row_id = t.row_id
                 WHERE r.run_id = ?1 ORDER BY t.rowid",
            )
            .map_err(|err| LandscapeError::Db(err.to_string()))?;
        let tokens = statement
            .query_map(params![run_id.as_str()], |row| {
                Ok(TokenRecord {
                    token_id: TokenId::new(row.get::<_, String>(0)?),
                    row_id: RowId::new(row.get::<_, String>(1)?),
                    fork_group_id: row.get::<_, Option<String>>(2)?.map(GroupId::new),
                    join_group_id: row.get::<_, Option<String>>(3)?.map(GroupId::new),
                    expand_group_id: row.get::<_, Option<String>>(4)?.map(GroupId::new),
                    branch_name: row.get(5)?,
                    step_in_pipeline: row.get(6)?,
                })
            })
            .map_err(|err| LandscapeError::Db(err.to_string()))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| LandscapeError::Db(err.to_string()))?;
        Ok(tokens)
    }

    /// Loads rows of a run with `row_index` greater than `after_index`,
    /// ordered by index. Recovery projects unprocessed rows through this.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] on read failure.
    pub fn rows_after(
        &self,
        run_id: &RunId,
        after_index: u64,
    ) -> Result<Vec<RowRecord>, LandscapeError> {
        let guard = self.lock()?;
        let mut statement = guard
            .prepare(
                "SELECT row_id, run_id, source_node_id, row_index, source_data_hash, payload_ref
                 FROM rows WHERE run_id = ?1 AND row_index > ?2 ORDER BY row_index",
            )
            .map_err(|err| LandscapeError::Db(err.to_string()))?;
        let rows = statement
            .query_map(
                params![run_id.as_str(), after_index as i64],
                row_record_from_row,
            )
            .map_err(|err| LandscapeError::Db(err.to_string()))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| LandscapeError::Db(err.to_string()))?;
        Ok(rows)
    }

    // ========================================================================
    // SECTION: Node States
    // ========================================================================

    /// Records an OPEN node state in its own transaction.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError::Invalid`] for non-open variants and
    /// [`LandscapeError::Db`] on write failure.
    pub fn begin_node_state(&self, state: &NodeState) -> Result<(), LandscapeError> {
        let NodeState::Open { envelope } = state else {
            return Err(LandscapeError::Invalid(
                "begin_node_state requires an open state".to_string(),
            ));
        };
        let guard = self.lock()?;
        guard
            .execute(
                "INSERT INTO node_states (state_id, token_id, node_id, step_index, attempt,
                 status, input_hash, started_at, context_before_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'open', ?6, ?7, ?8)",
                params![
                    envelope.state_id.as_str(),
                    envelope.token_id.as_str(),
                    envelope.node_id.as_str(),
                    envelope.step_index,
                    envelope.attempt,
                    envelope.input_hash,
                    envelope.started_at.to_rfc3339(),
                    envelope.context_before.as_ref().map(Value::to_string),
                ],
            )
            .map_err(|err| LandscapeError::Db(err.to_string()))?;
        Ok(())
    }

    /// Transitions an OPEN state to COMPLETED or FAILED in its own
    /// transaction.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError::StateTransition`] when the stored state is
    /// not open, [`LandscapeError::NotFound`] when it does not exist.
    pub fn complete_node_state(&self, state: &NodeState) -> Result<(), LandscapeError> {
        let (envelope, status, output_hash, completed_at, duration_ms, success_json, context_json, error_json) =
            match state {
                NodeState::Open { .. } => {
                    return Err(LandscapeError::Invalid(
                        "complete_node_state requires a terminal state".to_string(),
                    ));
                }
                NodeState::Completed {
                    envelope,
                    output_hash,
                    completed_at,
                    duration_ms,
                    success_reason,
                    context_after,
                } => (
                    envelope,
                    "completed",
                    Some(output_hash.clone()),
                    *completed_at,
                    *duration_ms,
                    success_reason
                        .as_ref()
                        .map(|reason| serde_json::to_string(reason))
                        .transpose()
                        .map_err(|err| LandscapeError::Invalid(err.to_string()))?,
                    context_after.as_ref().map(Value::to_string),
                    None,
                ),
                NodeState::Failed { envelope, completed_at, duration_ms, error, output_hash } => (
                    envelope,
                    "failed",
                    output_hash.clone(),
                    *completed_at,
                    *duration_ms,
                    None,
                    None,
                    error
                        .as_ref()
                        .map(|error| serde_json::to_string(error))
                        .transpose()
                        .map_err(|err| LandscapeError::Invalid(err.to_string()))?,
                ),
            };
        let mut guard = self.lock()?;
        let tx = guard.transaction().map_err(|err| LandscapeError::Db(err.to_string()))?;
        let current: Option<String> = tx
            .query_row(
                "SELECT status FROM node_states WHERE state_id = ?1",
                params![envelope.state_id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|err| LandscapeError::Db(err.to_string()))?;
        match current.as_deref() {
            None => {
                return Err(LandscapeError::NotFound(format!("state {}", envelope.state_id)));
            }
            Some("open") => {}
            Some(existing) => {
                return Err(LandscapeError::StateTransition {
                    state_id: envelope.state_id.to_string(),
                    message: format!("already terminal with status '{existing}'"),
                });
            }
        }
        tx.execute(
            "UPDATE node_states SET status = ?2, output_hash = ?3, completed_at = ?4,
             duration_ms = ?5, success_reason_json = ?6, context_after_json = ?7,
             error_json = ?8 WHERE state_id = ?1",
            params![
                envelope.state_id.as_str(),
                status,
                output_hash,
                completed_at.to_rfc3339(),
                duration_ms,
                success_json,
                context_json,
                error_json,
            ],
        )
        .map_err(|err| LandscapeError::Db(err.to_string()))?;
        tx.commit().map_err(|err| LandscapeError::Db(err.to_string()))
    }

    /// Loads a node state, discriminated by its stored status.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError::Corrupt`] for unknown status labels or
    /// malformed stored JSON (Tier-1 data).
    pub fn get_node_state(&self, state_id: &StateId) -> Result<Option<NodeState>, LandscapeError> {
        let guard = self.lock()?;
        guard
            .query_row(
                "SELECT state_id, token_id, node_id, step_index, attempt, status, input_hash,
                 started_at, context_before_json, output_hash, completed_at, duration_ms,
                 success_reason_json, context_after_json, error_json
                 FROM node_states WHERE state_id = ?1",
                params![state_id.as_str()],
                node_state_from_row,
            )
            .optional()
            .map_err(|err| LandscapeError::Db(err.to_string()))?
            .transpose()
    }

    /// Loads node states for a token ordered by step index then attempt.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] on read failure or corrupt stored data.
    pub fn states_for_token(&self, token_id: &TokenId) -> Result<Vec<NodeState>, LandscapeError> {
        let guard = self.lock()?;
        let mut statement = guard
            .prepare(
                "SELECT state_id, token_id, node_id, step_index, attempt, status, input_hash,
                 started_at, context_before_json, output_hash, completed_at, duration_ms,
                 success_reason_json, context_after_json, error_json
                 FROM node_states WHERE token_id = ?1 ORDER BY step_index, attempt",
            )
            .map_err(|err| LandscapeError::Db(err.to_string()))?;
        let states = statement
            .query_map(params![token_id.as_str()], node_state_from_row)
            .map_err(|err| LandscapeError::Db(err.to_string()))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| LandscapeError::Db(err.to_string()))?;
        states.into_iter().collect()
    }

    /// Loads every OPEN state of a run; recovery inspects these.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] on read failure or corrupt stored data.
    pub fn open_states_for_run(&self, run_id: &RunId) -> Result<Vec<NodeState>, LandscapeError> {
        let guard = self.lock()?;
        let mut statement = guard
            .prepare(
                "SELECT s.state_id, s.token_id, s.node_id, s.step_index, s.attempt, s.status,
                 s.input_hash, s.started_at, s.context_before_json, s.output_hash,
                 s.completed_at, s.duration_ms, s.success_reason_json, s.context_after_json,
                 s.error_json
                 FROM node_states s
                 JOIN tokens t ON t.token_id = s.token_id
                 JOIN rows r ON r.row_id = t.row_id
                 WHERE r.run_id = ?1 AND s.status = 'open' ORDER BY s.started_at",
            )
            .map_err(|err| LandscapeError::Db(err.to_string()))?;
        let states = statement
            .query_map(params![run_id.as_str()], node_state_from_row)
            .map_err(|err| LandscapeError::Db(err.to_string()))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| LandscapeError::Db(err.to_string()))?;
        states.into_iter().collect()
    }

    // ========================================================================
    // SECTION: Calls
    // ========================================================================

    /// Records an external call under an open state.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the insert fails.
    pub fn record_call(&self, call: &CallRecord) -> Result<(), LandscapeError> {
        let guard = self.lock()?;
        guard
            .execute(
                "INSERT INTO calls (call_id, state_id, call_index, call_type, status,
                 request_hash, request_ref, response_hash, response_ref, latency_ms, error)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    call.call_id.as_str(),
                    call.state_id.as_str(),
                    call.call_index,
                    call.call_type.as_str(),
                    call.status.as_str(),
                    call.request_hash,
                    call.request_ref.as_deref(),
                    call.response_hash.as_deref(),
                    call.response_ref.as_deref(),
                    call.latency_ms,
                    call.error.as_deref(),
                ],
            )
            .map_err(|err| LandscapeError::Db(err.to_string()))?;
        Ok(())
    }

    /// Finds the recorded call for `(call_type, request_hash)` under a
    /// source run. The earliest matching call wins.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] on read failure or corrupt stored data.
    pub fn find_recorded_call(
        &self,
        source_run_id: &RunId,
        call_type: CallType,
        request_hash: &str,
    ) -> Result<Option<CallRecord>, LandscapeError> {
        let guard = self.lock()?;
        guard
            .query_row(
                "SELECT c.call_id, c.state_id, c.call_index, c.call_type, c.status,
                 c.request_hash, c.request_ref, c.response_hash, c.response_ref, c.latency_ms,
                 c.error
                 FROM calls c
                 JOIN node_states s ON s.state_id = c.state_id
                 JOIN tokens t ON t.token_id = s.token_id
                 JOIN rows r ON r.row_id = t.row_id
                 WHERE r.run_id = ?1 AND c.call_type = ?2 AND c.request_hash = ?3
                 ORDER BY c.rowid LIMIT 1",
                params![source_run_id.as_str(), call_type.as_str(), request_hash],
                call_record_from_row,
            )
            .optional()
            .map_err(|err| LandscapeError::Db(err.to_string()))?
            .transpose()
    }

    /// Loads calls for a state ordered by call index.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] on read failure or corrupt stored data.
    pub fn calls_for_state(&self, state_id: &StateId) -> Result<Vec<CallRecord>, LandscapeError> {
        let guard = self.lock()?;
        let mut statement = guard
            .prepare(
                "SELECT call_id, state_id, call_index, call_type, status, request_hash,
                 request_ref, response_hash, response_ref, latency_ms, error
                 FROM calls WHERE state_id = ?1 ORDER BY call_index",
            )
            .map_err(|err| LandscapeError::Db(err.to_string()))?;
        let calls = statement
            .query_map(params![state_id.as_str()], call_record_from_row)
            .map_err(|err| LandscapeError::Db(err.to_string()))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| LandscapeError::Db(err.to_string()))?;
        calls.into_iter().collect()
    }

    // ========================================================================
    // SECTION: Routing Events
    // ========================================================================

    /// Records a routing group's events in one transaction.
    ///
    /// Callers assign ordinals in lexicographic edge-label order before
    /// handing the group over.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when any insert fails.
    pub fn record_routing_events(
        &self,
        events: &[RoutingEventRecord],
    ) -> Result<(), LandscapeError> {
        let mut guard = self.lock()?;
        let tx = guard.transaction().map_err(|err| LandscapeError::Db(err.to_string()))?;
        for event in events {
            tx.execute(
                "INSERT INTO routing_events (event_id, state_id, edge_id, routing_group_id,
                 ordinal, mode, reason_hash, reason_ref)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    event.event_id.as_str(),
                    event.state_id.as_str(),
                    event.edge_id,
                    event.routing_group_id.as_str(),
                    event.ordinal,
                    event.mode.as_str(),
                    event.reason_hash.as_deref(),
                    event.reason_ref.as_deref(),
                ],
            )
            .map_err(|err| LandscapeError::Db(err.to_string()))?;
        }
        tx.commit().map_err(|err| LandscapeError::Db(err.to_string()))
    }

    /// Loads routing events for a state ordered by ordinal.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] on read failure or corrupt stored data.
    pub fn routing_events_for_state(
        &self,
        state_id: &StateId,
    ) -> Result<Vec<RoutingEventRecord>, LandscapeError> {
        let guard = self.lock()?;
        let mut statement = guard
            .prepare(
                "SELECT event_id, state_id, edge_id, routing_group_id, ordinal, mode,
                 reason_hash, reason_ref FROM routing_events
                 WHERE state_id = ?1 ORDER BY ordinal",
            )
            .map_err(|err| LandscapeError::Db(err.to_string()))?;
        let events = statement
            .query_map(params![state_id.as_str()], |row| {
                let mode_label: String = row.get(5)?;
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?, row.get::<_, u32>(4)?, mode_label,
                    row.get::<_, Option<String>>(6)?, row.get::<_, Option<String>>(7)?))
            })
            .map_err(|err| LandscapeError::Db(err.to_string()))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| LandscapeError::Db(err.to_string()))?;
        events
            .into_iter()
            .map(|(event_id, state_id, edge_id, group, ordinal, mode, reason_hash, reason_ref)| {
                Ok(RoutingEventRecord {
                    event_id: RoutingEventId::new(event_id),
                    state_id: StateId::new(state_id),
                    edge_id,
                    routing_group_id: GroupId::new(group),
                    ordinal,
                    mode: parse_routing_mode(&mode)?,
                    reason_hash,
                    reason_ref,
                })
            })
            .collect()
    }

    // ========================================================================
    // SECTION: Batches
    // ========================================================================

    /// Creates a batch row.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the insert fails.
    pub fn create_batch(&self, batch: &BatchRecord) -> Result<(), LandscapeError> {
        let guard = self.lock()?;
        guard
            .execute(
                "INSERT INTO batches (batch_id, run_id, aggregation_node_id, attempt, status,
                 trigger_type, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    batch.batch_id.as_str(),
                    batch.run_id.as_str(),
                    batch.aggregation_node_id.as_str(),
                    batch.attempt,
                    batch.status.as_str(),
                    batch.trigger_type.map(TriggerType::as_str),
                    batch.created_at.to_rfc3339(),
                ],
            )
            .map_err(|err| LandscapeError::Db(err.to_string()))?;
        Ok(())
    }

    /// Adds one member to a batch.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the insert fails.
    pub fn add_batch_member(&self, member: &BatchMember) -> Result<(), LandscapeError> {
        let guard = self.lock()?;
        guard
            .execute(
                "INSERT INTO batch_members (batch_id, token_id, ordinal) VALUES (?1, ?2, ?3)",
                params![member.batch_id.as_str(), member.token_id.as_str(), member.ordinal],
            )
            .map_err(|err| LandscapeError::Db(err.to_string()))?;
        Ok(())
    }

    /// Transitions a batch's status, recording the firing trigger.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError::NotFound`] when the batch does not exist.
    pub fn set_batch_status(
        &self,
        batch_id: &elspeth_core::BatchId,
        status: BatchStatus,
        trigger_type: Option<TriggerType>,
    ) -> Result<(), LandscapeError> {
        let guard = self.lock()?;
        let affected = guard
            .execute(
                "UPDATE batches SET status = ?2,
                 trigger_type = COALESCE(?3, trigger_type) WHERE batch_id = ?1",
                params![batch_id.as_str(), status.as_str(), trigger_type.map(TriggerType::as_str)],
            )
            .map_err(|err| LandscapeError::Db(err.to_string()))?;
        if affected == 0 {
            return Err(LandscapeError::NotFound(format!("batch {batch_id}")));
        }
        Ok(())
    }

    /// Loads batch members ordered by ordinal.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] on read failure.
    pub fn batch_members(
        &self,
        batch_id: &elspeth_core::BatchId,
    ) -> Result<Vec<BatchMember>, LandscapeError> {
        let guard = self.lock()?;
        let mut statement = guard
            .prepare(
                "SELECT batch_id, token_id, ordinal FROM batch_members
                 WHERE batch_id = ?1 ORDER BY ordinal",
            )
            .map_err(|err| LandscapeError::Db(err.to_string()))?;
        let members = statement
            .query_map(params![batch_id.as_str()], |row| {
                Ok(BatchMember {
                    batch_id: elspeth_core::BatchId::new(row.get::<_, String>(0)?),
                    token_id: TokenId::new(row.get::<_, String>(1)?),
                    ordinal: row.get(2)?,
                })
            })
            .map_err(|err| LandscapeError::Db(err.to_string()))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| LandscapeError::Db(err.to_string()))?;
        Ok(members)
    }

    // ========================================================================
    // SECTION: Artifacts
    // ========================================================================

    /// Records a sink artifact.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the insert fails.
    pub fn record_artifact(&self, artifact: &ArtifactRecord) -> Result<(), LandscapeError> {
        let guard = self.lock()?;
        guard
            .execute(
                "INSERT INTO artifacts (artifact_id, run_id, node_id, path_or_uri, content_hash,
                 size_bytes, idempotency_key, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    artifact.artifact_id.as_str(),
                    artifact.run_id.as_str(),
                    artifact.node_id.as_str(),
                    artifact.path_or_uri,
                    artifact.content_hash,
                    artifact.size_bytes as i64,
                    artifact.idempotency_key.as_deref(),
                    artifact.created_at.to_rfc3339(),
                ],
            )
            .map_err(|err| LandscapeError::Db(err.to_string()))?;
        Ok(())
    }

    /// Loads artifacts for a run in creation order.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] on read failure or corrupt stored data.
    pub fn artifacts_for_run(&self, run_id: &RunId) -> Result<Vec<ArtifactRecord>, LandscapeError> {
        let guard = self.lock()?;
        let mut statement = guard
            .prepare(
                "SELECT artifact_id, run_id, node_id, path_or_uri, content_hash, size_bytes,
                 idempotency_key, created_at FROM artifacts WHERE run_id = ?1 ORDER BY rowid",
            )
            .map_err(|err| LandscapeError::Db(err.to_string()))?;
        let artifacts = statement
            .query_map(params![run_id.as_str()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, String>(7)?,
                ))
            })
            .map_err(|err| LandscapeError::Db(err.to_string()))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| LandscapeError::Db(err.to_string()))?;
        artifacts
            .into_iter()
            .map(|(artifact_id, run, node, path, hash, size, key, created)| {
                Ok(ArtifactRecord {
                    artifact_id: elspeth_core::ArtifactId::new(artifact_id),
                    run_id: RunId::new(run),
                    node_id: NodeId::new(node),
                    path_or_uri: path,
                    content_hash: hash,
                    size_bytes: size as u64,
                    idempotency_key: key,
                    created_at: parse_timestamp(&created)?,
                })
            })
            .collect()
    }

    // ========================================================================
    // SECTION: Checkpoints
    // ========================================================================

    /// Inserts a checkpoint row; both topology hashes are mandatory.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the insert fails.
    pub fn insert_checkpoint(&self, checkpoint: &CheckpointRecord) -> Result<(), LandscapeError> {
        let guard = self.lock()?;
        guard
            .execute(
                "INSERT INTO checkpoints (checkpoint_id, run_id, token_id, node_id,
                 sequence_number, upstream_topology_hash, checkpoint_node_config_hash,
                 aggregation_state_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    checkpoint.checkpoint_id.as_str(),
                    checkpoint.run_id.as_str(),
                    checkpoint.token_id.as_str(),
                    checkpoint.node_id.as_str(),
                    checkpoint.sequence_number as i64,
                    checkpoint.upstream_topology_hash,
                    checkpoint.checkpoint_node_config_hash,
                    checkpoint.aggregation_state_json.as_ref().map(Value::to_string),
                    checkpoint.created_at.to_rfc3339(),
                ],
            )
            .map_err(|err| LandscapeError::Db(err.to_string()))?;
        Ok(())
    }

    /// Loads the checkpoint with the highest sequence number for a run.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] on read failure or corrupt stored data.
    pub fn latest_checkpoint(
        &self,
        run_id: &RunId,
    ) -> Result<Option<CheckpointRecord>, LandscapeError> {
        let guard = self.lock()?;
        guard
            .query_row(
                "SELECT checkpoint_id, run_id, token_id, node_id, sequence_number,
                 upstream_topology_hash, checkpoint_node_config_hash, aggregation_state_json,
                 created_at FROM checkpoints WHERE run_id = ?1
                 ORDER BY sequence_number DESC LIMIT 1",
                params![run_id.as_str()],
                checkpoint_from_row,
            )
            .optional()
            .map_err(|err| LandscapeError::Db(err.to_string()))?
            .transpose()
    }

    /// Deletes all checkpoints of a run, returning the count removed.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] on write failure.
    pub fn delete_checkpoints(&self, run_id: &RunId) -> Result<usize, LandscapeError> {
        let guard = self.lock()?;
        guard
            .execute("DELETE FROM checkpoints WHERE run_id = ?1", params![run_id.as_str()])
            .map_err(|err| LandscapeError::Db(err.to_string()))
    }

    // ========================================================================
    // SECTION: Error Records
    // ========================================================================

    /// Records a Tier-3 validation error.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the insert fails.
    pub fn record_validation_error(
        &self,
        error: &ValidationErrorRecord,
    ) -> Result<(), LandscapeError> {
        let repr_json = error
            .repr_fallback
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|err| LandscapeError::Invalid(err.to_string()))?;
        let guard = self.lock()?;
        guard
            .execute(
                "INSERT INTO validation_errors (run_id, node_id, row_index, field, message,
                 row_json, repr_fallback_json, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    error.run_id.as_str(),
                    error.node_id.as_str(),
                    error.row_index.map(|v| v as i64),
                    error.field.as_deref(),
                    error.message,
                    error.row_json.as_ref().map(Value::to_string),
                    repr_json,
                    error.recorded_at.to_rfc3339(),
                ],
            )
            .map_err(|err| LandscapeError::Db(err.to_string()))?;
        Ok(())
    }

    /// Records a Tier-2 transform error.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the insert fails.
    pub fn record_transform_error(
        &self,
        error: &TransformErrorRecord,
    ) -> Result<(), LandscapeError> {
        let reason_json = serde_json::to_string(&error.reason)
            .map_err(|err| LandscapeError::Invalid(err.to_string()))?;
        let guard = self.lock()?;
        guard
            .execute(
                "INSERT INTO transform_errors (run_id, node_id, token_id, state_id, reason_json,
                 retryable, recorded_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    error.run_id.as_str(),
                    error.node_id.as_str(),
                    error.token_id.as_str(),
                    error.state_id.as_str(),
                    reason_json,
                    i64::from(error.retryable),
                    error.recorded_at.to_rfc3339(),
                ],
            )
            .map_err(|err| LandscapeError::Db(err.to_string()))?;
        Ok(())
    }

    /// Counts validation errors for a run.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] on read failure.
    pub fn count_validation_errors(&self, run_id: &RunId) -> Result<u64, LandscapeError> {
        let guard = self.lock()?;
        guard
            .query_row(
                "SELECT COUNT(*) FROM validation_errors WHERE run_id = ?1",
                params![run_id.as_str()],
                |row| row.get::<_, i64>(0),
            )
            .map(|count: i64| count as u64)
            .map_err(|err| LandscapeError::Db(err.to_string()))
    }

    // ========================================================================
    // SECTION: Token Outcomes
    // ========================================================================

    /// Records a token outcome, enforcing single-terminal-outcome semantics.
    ///
    /// A missing outcome row is inserted. An existing `buffered` marker is
    /// superseded by a terminal outcome. Any other overwrite is a
    /// [`LandscapeError::DuplicateOutcome`].
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] on invariant violation or write failure.
    pub fn record_token_outcome(&self, record: &TokenOutcomeRecord) -> Result<(), LandscapeError> {
        let mut guard = self.lock()?;
        let tx = guard.transaction().map_err(|err| LandscapeError::Db(err.to_string()))?;
        let existing: Option<String> = tx
            .query_row(
                "SELECT outcome FROM token_outcomes WHERE token_id = ?1",
                params![record.token_id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|err| LandscapeError::Db(err.to_string()))?;
        match existing.as_deref() {
            None => {
                tx.execute(
                    "INSERT INTO token_outcomes (token_id, outcome, reason, recorded_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        record.token_id.as_str(),
                        record.outcome.as_str(),
                        record.reason.as_deref(),
                        record.recorded_at.to_rfc3339(),
                    ],
                )
                .map_err(|err| LandscapeError::Db(err.to_string()))?;
            }
            Some("buffered") if record.outcome.is_terminal() => {
                tx.execute(
                    "UPDATE token_outcomes SET outcome = ?2, reason = ?3, recorded_at = ?4
                     WHERE token_id = ?1",
                    params![
                        record.token_id.as_str(),
                        record.outcome.as_str(),
                        record.reason.as_deref(),
                        record.recorded_at.to_rfc3339(),
                    ],
                )
                .map_err(|err| LandscapeError::Db(err.to_string()))?;
            }
            Some(existing_label) => {
                return Err(LandscapeError::DuplicateOutcome {
                    token_id: record.token_id.to_string(),
                    existing: existing_label.to_string(),
                });
            }
        }
        tx.commit().map_err(|err| LandscapeError::Db(err.to_string()))
    }

    /// Loads a token's outcome.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] on read failure or corrupt stored data.
    pub fn token_outcome(
        &self,
        token_id: &TokenId,
    ) -> Result<Option<TokenOutcomeRecord>, LandscapeError> {
        let guard = self.lock()?;
        guard
            .query_row(
                "SELECT token_id, outcome, reason, recorded_at FROM token_outcomes
                 WHERE token_id = ?1",
                params![token_id.as_str()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()
            .map_err(|err| LandscapeError::Db(err.to_string()))?
            .map(|(token, outcome, reason, recorded)| {
                Ok(TokenOutcomeRecord {
                    token_id: TokenId::new(token),
                    outcome: parse_outcome(&outcome)?,
                    reason,
                    recorded_at: parse_timestamp(&recorded)?,
                })
            })
            .transpose()
    }

    /// Counts token outcomes by label for a run.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] on read failure.
    pub fn outcome_counts(&self, run_id: &RunId) -> Result<BTreeMap<String, u64>, LandscapeError> {
        let guard = self.lock()?;
        let mut statement = guard
            .prepare(
                "SELECT o.outcome, COUNT(*) FROM token_outcomes o
                 JOIN tokens t ON t.token_id = o.token_id
                 JOIN rows r ON r.row_id = t.row_id
                 WHERE r.run_id = ?1 GROUP BY o.outcome",
            )
            .map_err(|err| LandscapeError::Db(err.to_string()))?;
        let counts = statement
            .query_map(params![run_id.as_str()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })
            .map_err(|err| LandscapeError::Db(err.to_string()))?
            .collect::<Result<BTreeMap<_, _>, _>>()
            .map_err(|err| LandscapeError::Db(err.to_string()))?;
        Ok(counts.into_iter().map(|(k, v)| (k, v as u64)).collect())
    }

    // ========================================================================
    // SECTION: Bookkeeping
    // ========================================================================

    /// Records a signing-key or passphrase resolution.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the insert fails.
    pub fn record_secret_resolution(
        &self,
        run_id: &RunId,
        secret_name: &str,
        env_var: &str,
        resolved: bool,
        recorded_at: Timestamp,
    ) -> Result<(), LandscapeError> {
        let guard = self.lock()?;
        guard
            .execute(
                "INSERT INTO secret_resolutions (run_id, secret_name, env_var, resolved,
                 recorded_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    run_id.as_str(),
                    secret_name,
                    env_var,
                    i64::from(resolved),
                    recorded_at.to_rfc3339(),
                ],
            )
            .map_err(|err| LandscapeError::Db(err.to_string()))?;
        Ok(())
    }

    /// Records an operational event (export, migrate, resume).
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the insert fails.
    pub fn record_operation(
        &self,
        run_id: &RunId,
        operation: &str,
        status: &str,
        detail: Option<&str>,
        recorded_at: Timestamp,
    ) -> Result<(), LandscapeError> {
        let guard = self.lock()?;
        guard
            .execute(
                "INSERT INTO operations (run_id, operation, status, detail, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![run_id.as_str(), operation, status, detail, recorded_at.to_rfc3339()],
            )
            .map_err(|err| LandscapeError::Db(err.to_string()))?;
        Ok(())
    }

    /// Returns audit row counts for a run.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] on read failure.
    pub fn run_summary(&self, run_id: &RunId) -> Result<RunSummary, LandscapeError> {
        let guard = self.lock()?;
        let count = |sql: &str| -> Result<u64, LandscapeError> {
            guard
                .query_row(sql, params![run_id.as_str()], |row| row.get::<_, i64>(0))
                .map(|count| count as u64)
                .map_err(|err| LandscapeError::Db(err.to_string()))
        };
        Ok(RunSummary {
            rows: count("SELECT COUNT(*) FROM rows WHERE run_id = ?1")?,
            tokens: count(
                "SELECT COUNT(*) FROM tokens t JOIN rows r ON r.row_id = t.row_id
                 WHERE r.run_id = ?1",
            )?,
            node_states: count(
                "SELECT COUNT(*) FROM node_states s JOIN tokens t ON t.token_id = s.token_id
                 JOIN rows r ON r.row_id = t.row_id WHERE r.run_id = ?1",
            )?,
            artifacts: count("SELECT COUNT(*) FROM artifacts WHERE run_id = ?1")?,
        })
    }
}

// ============================================================================
// SECTION: Run Summary
// ============================================================================

/// Audit row counts for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    /// Rows loaded from sources.
    pub rows: u64,
    /// Tokens created.
    pub tokens: u64,
    /// Node states recorded.
    pub node_states: u64,
    /// Artifacts committed.
    pub artifacts: u64,
}

// ============================================================================
// SECTION: Connection Setup
// ============================================================================

/// Applies the pragmas every Landscape connection requires.
fn configure_connection(connection: &Connection) -> Result<(), LandscapeError> {
    connection
        .pragma_update(None, "foreign_keys", "ON")
        .map_err(|err| LandscapeError::Db(err.to_string()))?;
    connection
        .busy_timeout(std::time::Duration::from_millis(5_000))
        .map_err(|err| LandscapeError::Db(err.to_string()))?;
    Ok(())
}

// ============================================================================
// SECTION: Row Mapping
// ============================================================================

/// Maps a `runs` row; enum parsing is deferred to the caller's error type.
fn run_record_from_row(row: &Row<'_>) -> rusqlite::Result<Result<RunRecord, LandscapeError>> {
    let run_id: String = row.get(0)?;
    let started_at: String = row.get(1)?;
    let completed_at: Option<String> = row.get(2)?;
    let status: String = row.get(3)?;
    let config_hash: String = row.get(4)?;
    let settings_json: String = row.get(5)?;
    let canonical_version: String = row.get(6)?;
    let schema_contract_json: Option<String> = row.get(7)?;
    let schema_contract_hash: Option<String> = row.get(8)?;
    let run_mode: Option<String> = row.get(9)?;
    let source_run_id: Option<String> = row.get(10)?;
    let export_status: Option<String> = row.get(11)?;
    let exported_at: Option<String> = row.get(12)?;
    Ok((|| {
        Ok(RunRecord {
            run_id: RunId::new(run_id),
            started_at: parse_timestamp(&started_at)?,
            completed_at: completed_at.as_deref().map(parse_timestamp).transpose()?,
            status: parse_run_status(&status)?,
            config_hash,
            settings_json: parse_json(&settings_json)?,
            canonical_version,
            schema_contract_json: schema_contract_json.as_deref().map(parse_json).transpose()?,
            schema_contract_hash,
            run_mode: run_mode.as_deref().map(parse_run_mode).transpose()?,
            source_run_id: source_run_id.map(RunId::new),
            export_status: export_status.as_deref().map(parse_export_status).transpose()?,
            exported_at: exported_at.as_deref().map(parse_timestamp).transpose()?,
        })
    })())
}

/// Maps a `nodes` row.
fn node_record_from_row(row: &Row<'_>) -> rusqlite::Result<Result<NodeRecord, LandscapeError>> {
    let node_id: String = row.get(0)?;
    let run_id: String = row.get(1)?;
    let plugin_name: String = row.get(2)?;
    let node_type: String = row.get(3)?;
    let determinism: String = row.get(4)?;
    let plugin_version: String = row.get(5)?;
    let config_hash: String = row.get(6)?;
    let config_json: String = row.get(7)?;
    let input_contract_json: Option<String> = row.get(8)?;
    let output_contract_json: Option<String> = row.get(9)?;
    let schema_hash: Option<String> = row.get(10)?;
    let sequence_index: Option<u32> = row.get(11)?;
    Ok((|| {
        Ok(NodeRecord {
            node_id: NodeId::new(node_id),
            run_id: RunId::new(run_id),
            plugin_name,
            node_type: parse_node_type(&node_type)?,
            determinism: parse_determinism(&determinism)?,
            plugin_version,
            config_hash,
            config_json: parse_json(&config_json)?,
            input_contract_json: input_contract_json.as_deref().map(parse_json).transpose()?,
            output_contract_json: output_contract_json.as_deref().map(parse_json).transpose()?,
            schema_hash,
            sequence_index,
        })
    })())
}

/// Maps a `rows` row.
fn row_record_from_row(row: &Row<'_>) -> rusqlite::Result<RowRecord> {
    Ok(RowRecord {
        row_id: RowId::new(row.get::<_, String>(0)?),
        run_id: RunId::new(row.get::<_, String>(1)?),
        source_node_id: NodeId::new(row.get::<_, String>(2)?),
        row_index: row.get::<_, i64>(3)? as u64,
        source_data_hash: row.get(4)?,
        payload_ref: row.get(5)?,
    })
}

/// Maps a `node_states` row into the discriminated [`NodeState`] variant.
fn node_state_from_row(row: &Row<'_>) -> rusqlite::Result<Result<NodeState, LandscapeError>> {
    let state_id: String = row.get(0)?;
    let token_id: String = row.get(1)?;
    let node_id: String = row.get(2)?;
    let step_index: u32 = row.get(3)?;
    let attempt: u32 = row.get(4)?;
    let status: String = row.get(5)?;
    let input_hash: String = row.get(6)?;
    let started_at: String = row.get(7)?;
    let context_before: Option<String> = row.get(8)?;
    let output_hash: Option<String> = row.get(9)?;
    let completed_at: Option<String> = row.get(10)?;
    let duration_ms: Option<i64> = row.get(11)?;
    let success_reason: Option<String> = row.get(12)?;
    let context_after: Option<String> = row.get(13)?;
    let error_json: Option<String> = row.get(14)?;
    Ok((|| {
        let envelope = StateEnvelope {
            state_id: StateId::new(state_id.clone()),
            token_id: TokenId::new(token_id),
            node_id: NodeId::new(node_id),
            step_index,
            attempt,
            input_hash,
            started_at: parse_timestamp(&started_at)?,
            context_before: context_before.as_deref().map(parse_json).transpose()?,
        };
        match status.as_str() {
            "open" => Ok(NodeState::Open { envelope }),
            "completed" => Ok(NodeState::Completed {
                envelope,
                output_hash: output_hash.ok_or_else(|| {
                    LandscapeError::Corrupt(format!("completed state {state_id} has no output_hash"))
                })?,
                completed_at: completed_at
                    .as_deref()
                    .map(parse_timestamp)
                    .transpose()?
                    .ok_or_else(|| {
                        LandscapeError::Corrupt(format!(
                            "completed state {state_id} has no completed_at"
                        ))
                    })?,
                duration_ms: duration_ms.ok_or_else(|| {
                    LandscapeError::Corrupt(format!("completed state {state_id} has no duration"))
                })?,
                success_reason: success_reason
                    .as_deref()
                    .map(|json| {
                        serde_json::from_str(json)
                            .map_err(|err| LandscapeError::Corrupt(err.to_string()))
                    })
                    .transpose()?,
                context_after: context_after.as_deref().map(parse_json).transpose()?,
            }),
            "failed" => Ok(NodeState::Failed {
                envelope,
                completed_at: completed_at
                    .as_deref()
                    .map(parse_timestamp)
                    .transpose()?
                    .ok_or_else(|| {
                        LandscapeError::Corrupt(format!(
                            "failed state {state_id} has no completed_at"
                        ))
                    })?,
                duration_ms: duration_ms.ok_or_else(|| {
                    LandscapeError::Corrupt(format!("failed state {state_id} has no duration"))
                })?,
                error: error_json
                    .as_deref()
                    .map(|json| {
                        serde_json::from_str(json)
                            .map_err(|err| LandscapeError::Corrupt(err.to_string()))
                    })
                    .transpose()?,
                output_hash,
            }),
            other => Err(LandscapeError::Corrupt(format!(
                "state {state_id} has unknown status '{other}'"
            ))),
        }
    })())
}

/// Maps a `calls` row.
fn call_record_from_row(row: &Row<'_>) -> rusqlite::Result<Result<CallRecord, LandscapeError>> {
    let call_id: String = row.get(0)?;
    let state_id: String = row.get(1)?;
    let call_index: u32 = row.get(2)?;
    let call_type: String = row.get(3)?;
    let status: String = row.get(4)?;
    let request_hash: String = row.get(5)?;
    let request_ref: Option<String> = row.get(6)?;
    let response_hash: Option<String> = row.get(7)?;
    let response_ref: Option<String> = row.get(8)?;
    let latency_ms: Option<i64> = row.get(9)?;
    let error: Option<String> = row.get(10)?;
    Ok((|| {
        Ok(CallRecord {
            call_id: CallId::new(call_id),
            state_id: StateId::new(state_id),
            call_index,
            call_type: parse_call_type(&call_type)?,
            status: parse_call_status(&status)?,
            request_hash,
            request_ref,
            response_hash,
            response_ref,
            latency_ms,
            error,
        })
    })())
}

/// Maps a `checkpoints` row.
fn checkpoint_from_row(
    row: &Row<'_>,
) -> rusqlite::Result<Result<CheckpointRecord, LandscapeError>> {
    let checkpoint_id: String = row.get(0)?;
    let run_id: String = row.get(1)?;
    let token_id: String = row.get(2)?;
    let node_id: String = row.get(3)?;
    let sequence_number: u64 = row.get::<_, i64>(4)? as u64;
    let upstream_topology_hash: String = row.get(5)?;
    let checkpoint_node_config_hash: String = row.get(6)?;
    let aggregation_state_json: Option<String> = row.get(7)?;
    let created_at: String = row.get(8)?;
    Ok((|| {
        Ok(CheckpointRecord {
            checkpoint_id: CheckpointId::new(checkpoint_id),
            run_id: RunId::new(run_id),
            token_id: TokenId::new(token_id),
            node_id: NodeId::new(node_id),
            sequence_number,
            upstream_topology_hash,
            checkpoint_node_config_hash,
            aggregation_state_json: aggregation_state_json
                .as_deref()
                .map(parse_json)
                .transpose()?,
            created_at: parse_timestamp(&created_at)?,
        })
    })())
}

// ============================================================================
// SECTION: Label Parsing (Tier-1)
// ============================================================================

/// Parses a stored timestamp; corruption crashes.
fn parse_timestamp(text: &str) -> Result<Timestamp, LandscapeError> {
    Timestamp::parse(text).map_err(|err| LandscapeError::Corrupt(err.to_string()))
}

/// Parses stored JSON; corruption crashes.
fn parse_json(text: &str) -> Result<Value, LandscapeError> {
    serde_json::from_str(text).map_err(|err| LandscapeError::Corrupt(err.to_string()))
}

/// Parses a stored run status label.
fn parse_run_status(label: &str) -> Result<RunStatus, LandscapeError> {
    match label {
        "running" => Ok(RunStatus::Running),
        "completed" => Ok(RunStatus::Completed),
        "failed" => Ok(RunStatus::Failed),
        "interrupted" => Ok(RunStatus::Interrupted),
        other => Err(LandscapeError::Corrupt(format!("unknown run status '{other}'"))),
    }
}

/// Parses a stored run mode label.
fn parse_run_mode(label: &str) -> Result<RunMode, LandscapeError> {
    match label {
        "live" => Ok(RunMode::Live),
        "replay" => Ok(RunMode::Replay),
        "verify" => Ok(RunMode::Verify),
        other => Err(LandscapeError::Corrupt(format!("unknown run mode '{other}'"))),
    }
}

/// Parses a stored export status label.
fn parse_export_status(label: &str) -> Result<ExportStatus, LandscapeError> {
    match label {
        "pending" => Ok(ExportStatus::Pending),
        "completed" => Ok(ExportStatus::Completed),
        "failed" => Ok(ExportStatus::Failed),
        other => Err(LandscapeError::Corrupt(format!("unknown export status '{other}'"))),
    }
}

/// Returns the storage label for an export status.
const fn export_status_label(status: ExportStatus) -> &'static str {
    match status {
        ExportStatus::Pending => "pending",
        ExportStatus::Completed => "completed",
        ExportStatus::Failed => "failed",
    }
}

/// Parses a stored node type label.
fn parse_node_type(label: &str) -> Result<NodeType, LandscapeError> {
    match label {
        "source" => Ok(NodeType::Source),
        "transform" => Ok(NodeType::Transform),
        "gate" => Ok(NodeType::Gate),
        "aggregation" => Ok(NodeType::Aggregation),
        "coalesce" => Ok(NodeType::Coalesce),
        "sink" => Ok(NodeType::Sink),
        other => Err(LandscapeError::Corrupt(format!("unknown node type '{other}'"))),
    }
}

/// Parses a stored determinism label.
fn parse_determinism(label: &str) -> Result<Determinism, LandscapeError> {
    match label {
        "deterministic" => Ok(Determinism::Deterministic),
        "seeded" => Ok(Determinism::Seeded),
        "io_read" => Ok(Determinism::IoRead),
        "io_write" => Ok(Determinism::IoWrite),
        "external_call" => Ok(Determinism::ExternalCall),
        "non_deterministic" => Ok(Determinism::NonDeterministic),
        other => Err(LandscapeError::Corrupt(format!("unknown determinism '{other}'"))),
    }
}

/// Parses a stored routing mode label.
fn parse_routing_mode(label: &str) -> Result<RoutingMode, LandscapeError> {
    match label {
        "move" => Ok(RoutingMode::Move),
        "copy" => Ok(RoutingMode::Copy),
        "divert" => Ok(RoutingMode::Divert),
        other => Err(LandscapeError::Corrupt(format!("unknown routing mode '{other}'"))),
    }
}

/// Parses a stored call type label.
fn parse_call_type(label: &str) -> Result<CallType, LandscapeError> {
    match label {
        "llm" => Ok(CallType::Llm),
        "http" => Ok(CallType::Http),
        "http_redirect" => Ok(CallType::HttpRedirect),
        "sql" => Ok(CallType::Sql),
        "filesystem" => Ok(CallType::Filesystem),
        other => Err(LandscapeError::Corrupt(format!("unknown call type '{other}'"))),
    }
}

/// Parses a stored call status label.
fn parse_call_status(label: &str) -> Result<CallStatus, LandscapeError> {
    match label {
        "success" => Ok(CallStatus::Success),
        "error" => Ok(CallStatus::Error),
        other => Err(LandscapeError::Corrupt(format!("unknown call status '{other}'"))),
    }
}

/// Parses a stored token outcome label.
fn parse_outcome(label: &str) -> Result<TokenOutcome, LandscapeError> {
    match label {
        "completed" => Ok(TokenOutcome::Completed),
        "routed" => Ok(TokenOutcome::Routed),
        "forked" => Ok(TokenOutcome::Forked),
        "failed" => Ok(TokenOutcome::Failed),
        "quarantined" => Ok(TokenOutcome::Quarantined),
        "consumed_in_batch" => Ok(TokenOutcome::ConsumedInBatch),
        "coalesced" => Ok(TokenOutcome::Coalesced),
        "expanded" => Ok(TokenOutcome::Expanded),
        "buffered" => Ok(TokenOutcome::Buffered),
        other => Err(LandscapeError::Corrupt(format!("unknown token outcome '{other}'"))),
    }
}

// ============================================================================
// SECTION: Transaction Helpers
// ============================================================================

/// Inserts a `rows` row inside an open transaction.
fn insert_row_tx(tx: &rusqlite::Transaction<'_>, row: &RowRecord) -> Result<(), LandscapeError> {
    tx.execute(
        "INSERT INTO rows (row_id, run_id, source_node_id, row_index, source_data_hash,
         payload_ref) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            row.row_id.as_str(),
            row.run_id.as_str(),
            row.source_node_id.as_str(),
            row.row_index as i64,
            row.source_data_hash,
            row.payload_ref.as_deref(),
        ],
    )
    .map_err(|err| LandscapeError::Db(err.to_string()))?;
    Ok(())
}

/// Inserts a `tokens` row inside an open transaction.
fn insert_token_tx(
    tx: &rusqlite::Transaction<'_>,
    token: &TokenRecord,
) -> Result<(), LandscapeError> {
    tx.execute(
        "INSERT INTO tokens (token_id, row_id, fork_group_id, join_group_id, expand_group_id,
         branch_name, step_in_pipeline) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            token.token_id.as_str(),
            token.row_id.as_str(),
            token.fork_group_id.as_ref().map(GroupId::as_str),
            token.join_group_id.as_ref().map(GroupId::as_str),
            token.expand_group_id.as_ref().map(GroupId::as_str),
            token.branch_name.as_deref(),
            token.step_in_pipeline,
        ],
    )
    .map_err(|err| LandscapeError::Db(err.to_string()))?;
    Ok(())
}
