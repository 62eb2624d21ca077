// elspeth-engine/src/checkpoint.rs
// ============================================================================
// Module: Engine Checkpoint & Recovery
// Description: Checkpoint creation, compatibility checks, and row recovery.
// Purpose: Resume interrupted runs only when the graph still matches, and
//          restore row value types on the way back in.
// Dependencies: elspeth-core, elspeth-landscape
// ============================================================================

//! ## Overview
//! Checkpoints capture run progress at row boundaries. Each records the
//! token and node in flight, a monotonic sequence number, the hash of the
//! subgraph upstream of the node, and the node's own config hash, with both
//! hashes computed while the store lock is held so they describe the graph
//! at the exact moment of the write.
//!
//! Resume fails closed: both hashes must match the hashes recomputed from
//! the current graph, and checkpoints older than the deterministic-node-id
//! cutoff are refused outright. Row recovery re-coerces stored JSON through
//! the schema contract so downstream code observes identical types after a
//! resume; without a contract the degradation to strings is explicit.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;

use elspeth_core::CheckpointId;
use elspeth_core::CheckpointRecord;
use elspeth_core::ExecutionGraph;
use elspeth_core::NodeId;
use elspeth_core::RunId;
use elspeth_core::SchemaContract;
use elspeth_core::Timestamp;
use elspeth_core::TokenId;
use elspeth_core::interfaces::PayloadStore;
use elspeth_core::value::PipelineRow;
use elspeth_landscape::Landscape;
use elspeth_landscape::LandscapeError;
use serde_json::Value;
use thiserror::Error;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Checkpoints created before this instant predate deterministic node ids
/// and can never be resumed.
pub const DETERMINISTIC_NODE_ID_CUTOFF: &str = "2026-01-24T00:00:00Z";

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors raised by checkpoint creation and recovery.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// The checkpoint node does not exist in the graph.
    #[error("checkpoint node '{0}' does not exist in the graph")]
    UnknownNode(String),
    /// The checkpoint cannot be resumed against the current graph.
    #[error("incompatible checkpoint '{checkpoint_id}': {message}")]
    Incompatible {
        /// The refused checkpoint.
        checkpoint_id: String,
        /// Why resume is refused.
        message: String,
    },
    /// Audit store failure.
    #[error(transparent)]
    Landscape(#[from] LandscapeError),
    /// Graph inspection failure.
    #[error(transparent)]
    Graph(#[from] elspeth_core::GraphError),
    /// Payload retrieval failure during recovery.
    #[error(transparent)]
    Payload(#[from] elspeth_core::PayloadStoreError),
    /// Stored row data failed type restoration.
    #[error("row recovery failed: {0}")]
    Restore(String),
}

// ============================================================================
// SECTION: Checkpoint Manager
// ============================================================================

/// Creates and deletes checkpoints for a run.
#[derive(Clone)]
pub struct CheckpointManager {
    /// Audit store.
    landscape: Landscape,
}

impl CheckpointManager {
    /// Creates a manager over a Landscape.
    #[must_use]
    pub const fn new(landscape: Landscape) -> Self {
        Self { landscape }
    }

    /// Creates a checkpoint at the current progress point.
    ///
    /// Topology hashes are computed against `graph` immediately before the
    /// insert, under the store's connection lock, so no concurrent graph
    /// change can slip between hash and write.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::UnknownNode`] when `node_id` is not in
    /// the graph, or a wrapped store/hash failure.
    pub fn create_checkpoint(
        &self,
        run_id: &RunId,
        token_id: &TokenId,
        node_id: &NodeId,
        sequence_number: u64,
        graph: &ExecutionGraph,
        aggregation_state: Option<Value>,
    ) -> Result<CheckpointRecord, CheckpointError> {
        if !graph.has_node(node_id) {
            return Err(CheckpointError::UnknownNode(node_id.to_string()));
        }
        let upstream_topology_hash = graph.upstream_topology_hash(node_id)?;
        let checkpoint_node_config_hash = graph
            .get_node_info(node_id)
            .map(|node| node.config_hash.clone())
            .ok_or_else(|| CheckpointError::UnknownNode(node_id.to_string()))?;
        let record = CheckpointRecord {
            checkpoint_id: CheckpointId::generate(),
            run_id: run_id.clone(),
            token_id: token_id.clone(),
            node_id: node_id.clone(),
            sequence_number,
            upstream_topology_hash,
            checkpoint_node_config_hash,
            aggregation_state_json: aggregation_state,
            created_at: Timestamp::now(),
        };
        self.landscape.insert_checkpoint(&record)?;
        Ok(record)
    }

    /// Deletes all checkpoints of a completed run.
    ///
    /// # Errors
    ///
    /// Returns a wrapped store failure.
    pub fn delete_checkpoints(&self, run_id: &RunId) -> Result<usize, CheckpointError> {
        Ok(self.landscape.delete_checkpoints(run_id)?)
    }
}

// ============================================================================
// SECTION: Recovery Manager
// ============================================================================

/// A row projected for reprocessing after a resume.
#[derive(Debug, Clone)]
pub struct RecoveredRow {
    /// Original row index at the source.
    pub row_index: u64,
    /// The restored row with its contract.
    pub row: PipelineRow,
}

/// Loads checkpoints and projects unprocessed rows for resume.
#[derive(Clone)]
pub struct RecoveryManager {
    /// Audit store.
    landscape: Landscape,
}

impl RecoveryManager {
    /// Creates a manager over a Landscape.
    #[must_use]
    pub const fn new(landscape: Landscape) -> Self {
        Self { landscape }
    }

    /// Returns the latest checkpoint for a run, refusing pre-cutoff ones.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Incompatible`] for checkpoints created
    /// before [`DETERMINISTIC_NODE_ID_CUTOFF`].
    pub fn latest_checkpoint(
        &self,
        run_id: &RunId,
    ) -> Result<Option<CheckpointRecord>, CheckpointError> {
        let Some(checkpoint) = self.landscape.latest_checkpoint(run_id)? else {
            return Ok(None);
        };
        let cutoff = Timestamp::parse(DETERMINISTIC_NODE_ID_CUTOFF)
            .map_err(|err| CheckpointError::Restore(err.to_string()))?;
        if checkpoint.created_at < cutoff {
            return Err(CheckpointError::Incompatible {
                checkpoint_id: checkpoint.checkpoint_id.to_string(),
                message: format!(
                    "created {} predates deterministic node ids (cutoff {}); \
                     restart the pipeline from the beginning",
                    checkpoint.created_at, DETERMINISTIC_NODE_ID_CUTOFF
                ),
            });
        }
        Ok(Some(checkpoint))
    }

    /// Validates a checkpoint against the current graph.
    ///
    /// Both the upstream topology hash and the node config hash must equal
    /// the hashes recomputed from `graph` at the checkpoint node.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Incompatible`] on any mismatch.
    pub fn validate_compatibility(
        &self,
        checkpoint: &CheckpointRecord,
        graph: &ExecutionGraph,
    ) -> Result<(), CheckpointError> {
        if !graph.has_node(&checkpoint.node_id) {
            return Err(CheckpointError::Incompatible {
                checkpoint_id: checkpoint.checkpoint_id.to_string(),
                message: format!("node '{}' no longer exists in the graph", checkpoint.node_id),
            });
        }
        let current_topology = graph.upstream_topology_hash(&checkpoint.node_id)?;
        if current_topology != checkpoint.upstream_topology_hash {
            return Err(CheckpointError::Incompatible {
                checkpoint_id: checkpoint.checkpoint_id.to_string(),
                message: "upstream topology changed since the checkpoint was written".to_string(),
            });
        }
        let current_config = graph
            .get_node_info(&checkpoint.node_id)
            .map(|node| node.config_hash.clone())
            .unwrap_or_default();
        if current_config != checkpoint.checkpoint_node_config_hash {
            return Err(CheckpointError::Incompatible {
                checkpoint_id: checkpoint.checkpoint_id.to_string(),
                message: "checkpoint node configuration changed since the checkpoint was written"
                    .to_string(),
            });
        }
        Ok(())
    }

    /// Projects rows not yet processed at the checkpoint.
    ///
    /// With a contract, stored JSON is re-coerced to typed values (RFC 3339
    /// strings become timestamps, numeric strings become decimals). Without
    /// one, values degrade explicitly to the untyped mapping and the caller
    /// owns the consequences.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError`] when row payloads are missing or fail
    /// restoration.
    pub fn unprocessed_rows(
        &self,
        run_id: &RunId,
        checkpoint: &CheckpointRecord,
        payloads: &Arc<dyn PayloadStore>,
        contract: Option<&SchemaContract>,
    ) -> Result<Vec<RecoveredRow>, CheckpointError> {
        let checkpoint_row = self
            .landscape
            .row_for_token(&checkpoint.token_id)?
            .ok_or_else(|| {
                CheckpointError::Restore(format!(
                    "checkpoint token '{}' has no row",
                    checkpoint.token_id
                ))
            })?;
        let pending = self.landscape.rows_after(run_id, checkpoint_row.row_index)?;
        let mut recovered = Vec::with_capacity(pending.len());
        for row in pending {
            let Some(payload_ref) = row.payload_ref.as_deref() else {
                return Err(CheckpointError::Restore(format!(
                    "row '{}' has no stored payload",
                    row.row_id
                )));
            };
            let bytes = payloads.fetch(payload_ref)?;
            let json: Value = serde_json::from_slice(&bytes)
                .map_err(|err| CheckpointError::Restore(err.to_string()))?;
            let effective_contract =
                contract.cloned().unwrap_or_else(SchemaContract::empty_observed);
            let restored = PipelineRow::from_json_object(&json, effective_contract)
                .map_err(|err| CheckpointError::Restore(err.to_string()))?;
            recovered.push(RecoveredRow { row_index: row.row_index, row: restored });
        }
        Ok(recovered)
    }
}
