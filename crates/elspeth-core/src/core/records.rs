// elspeth-core/src/core/records.rs
// ============================================================================
// Module: ELSPETH Audit Records
// Description: Canonical audit-row types stored in the Landscape.
// Purpose: Provide stable, serializable structures for every observable event.
// Dependencies: serde, serde_json
// ============================================================================

//! ## Overview
//! These types are the canonical source of truth for the audit trail. Every
//! observable event of a run (node registration, token creation, state
//! transitions, external calls, routing, batches, artifacts, checkpoints,
//! outcomes, and errors) maps onto exactly one record type here. The
//! Landscape stores them; repositories must return the correct variant and
//! callers never mutate a terminal state after load.
//!
//! Every plugin MUST declare a [`Determinism`] value at registration. There
//! is no default: undeclared determinism fails node registration, because
//! "I don't know what happened" is never an acceptable answer from the
//! audit trail.

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::core::identifiers::ArtifactId;
use crate::core::identifiers::BatchId;
use crate::core::identifiers::CallId;
use crate::core::identifiers::CheckpointId;
use crate::core::identifiers::GroupId;
use crate::core::identifiers::NodeId;
use crate::core::identifiers::RoutingEventId;
use crate::core::identifiers::RowId;
use crate::core::identifiers::RunId;
use crate::core::identifiers::StateId;
use crate::core::identifiers::TokenId;
use crate::core::routing::RoutingMode;
use crate::core::time::Timestamp;

// ============================================================================
// SECTION: Run
// ============================================================================

/// Status of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Run is executing.
    Running,
    /// Run finished and every token reached a terminal outcome.
    Completed,
    /// Run failed.
    Failed,
    /// Run was cancelled; in-flight state was recorded first.
    Interrupted,
}

impl RunStatus {
    /// Returns the stable storage label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Interrupted => "interrupted",
        }
    }
}

/// Pipeline execution mode for live/replay/verify behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Make real external calls and record everything.
    Live,
    /// Satisfy external calls from a recorded source run.
    Replay,
    /// Make real calls and compare against the recorded source run.
    Verify,
}

impl RunMode {
    /// Returns the stable storage label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::Replay => "replay",
            Self::Verify => "verify",
        }
    }
}

/// Status of a run export operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportStatus {
    /// Export has not run yet.
    Pending,
    /// Export completed.
    Completed,
    /// Export failed.
    Failed,
}

/// One end-to-end pipeline execution.
///
/// # Invariants
/// - `completed_at >= started_at` whenever both are present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    /// Run identifier.
    pub run_id: RunId,
    /// When the run opened.
    pub started_at: Timestamp,
    /// When the run closed, if it has.
    pub completed_at: Option<Timestamp>,
    /// Run status.
    pub status: RunStatus,
    /// Stable hash of the resolved configuration.
    pub config_hash: String,
    /// Resolved settings as JSON.
    pub settings_json: Value,
    /// Version label of the canonicalization scheme in effect.
    pub canonical_version: String,
    /// Run-level schema contract as JSON, if declared.
    pub schema_contract_json: Option<Value>,
    /// Stable hash of the run-level schema contract.
    pub schema_contract_hash: Option<String>,
    /// Live, replay, or verify.
    pub run_mode: Option<RunMode>,
    /// Source run for replay and verify modes.
    pub source_run_id: Option<RunId>,
    /// Export bookkeeping status.
    pub export_status: Option<ExportStatus>,
    /// When the export last completed.
    pub exported_at: Option<Timestamp>,
}

// ============================================================================
// SECTION: Node
// ============================================================================

/// Type of node in the execution graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    /// Yields rows into the pipeline.
    Source,
    /// Maps one row to a result.
    Transform,
    /// Decides where tokens go next.
    Gate,
    /// Buffers tokens into batches.
    Aggregation,
    /// Joins tokens from parallel paths.
    Coalesce,
    /// Writes rows out and produces artifacts.
    Sink,
}

impl NodeType {
    /// Returns the stable storage label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Source => "source",
            Self::Transform => "transform",
            Self::Gate => "gate",
            Self::Aggregation => "aggregation",
            Self::Coalesce => "coalesce",
            Self::Sink => "sink",
        }
    }
}

/// Plugin determinism classification for replay and verify.
///
/// Each value tells the engine what replay needs: deterministic nodes just
/// re-run; seeded nodes replay their seed; I/O nodes capture what they read
/// or are treated carefully on write; external-call nodes record
/// request/response pairs; non-deterministic nodes must record output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Determinism {
    /// Re-running yields identical output.
    Deterministic,
    /// Deterministic given a recorded seed.
    Seeded,
    /// Reads external state (time, files, environment).
    IoRead,
    /// Writes external state; replay must be careful.
    IoWrite,
    /// Calls an external service; request/response recorded.
    ExternalCall,
    /// Output cannot be reproduced; must be recorded.
    NonDeterministic,
}

impl Determinism {
    /// Returns the stable storage label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Deterministic => "deterministic",
            Self::Seeded => "seeded",
            Self::IoRead => "io_read",
            Self::IoWrite => "io_write",
            Self::ExternalCall => "external_call",
            Self::NonDeterministic => "non_deterministic",
        }
    }
}

/// A plugin instance bound to a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Deterministic node identifier.
    pub node_id: NodeId,
    /// Owning run.
    pub run_id: RunId,
    /// Plugin name.
    pub plugin_name: String,
    /// Node type.
    pub node_type: NodeType,
    /// Declared determinism class (required; no default).
    pub determinism: Determinism,
    /// Plugin version string.
    pub plugin_version: String,
    /// Stable hash of the node configuration.
    pub config_hash: String,
    /// Node configuration as JSON.
    pub config_json: Value,
    /// Input schema contract as JSON, if declared.
    pub input_contract_json: Option<Value>,
    /// Output schema contract as JSON, if declared.
    pub output_contract_json: Option<Value>,
    /// Stable hash of the declared contracts.
    pub schema_hash: Option<String>,
    /// Position of the node in the pipeline sequence.
    pub sequence_index: Option<u32>,
}

/// A labeled directed edge between two nodes.
///
/// Edges are keyed by `(from, to, label)`; parallel edges with distinct
/// labels exist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeRecord {
    /// Stable edge identifier derived from `(from, to, label)`.
    pub edge_id: String,
    /// Owning run.
    pub run_id: RunId,
    /// Source node.
    pub from_node: NodeId,
    /// Target node.
    pub to_node: NodeId,
    /// Edge label.
    pub label: String,
    /// Default traversal mode.
    pub default_mode: RoutingMode,
}

// ============================================================================
// SECTION: Rows and Tokens
// ============================================================================

/// A record loaded from a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowRecord {
    /// Row identifier.
    pub row_id: RowId,
    /// Owning run.
    pub run_id: RunId,
    /// Source node that yielded the row.
    pub source_node_id: NodeId,
    /// Zero-based index within the source.
    pub row_index: u64,
    /// Stable hash of the source data.
    pub source_data_hash: String,
    /// Payload-store reference for the row data, if stored.
    pub payload_ref: Option<String>,
}

/// A row instance flowing a specific DAG path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenRecord {
    /// Token identifier.
    pub token_id: TokenId,
    /// Row the token carries.
    pub row_id: RowId,
    /// Fork group shared with sibling copies, if forked.
    pub fork_group_id: Option<GroupId>,
    /// Join group shared at a coalesce, if joined.
    pub join_group_id: Option<GroupId>,
    /// Expansion group shared with deaggregation siblings, if expanded.
    pub expand_group_id: Option<GroupId>,
    /// Branch name for fork children.
    pub branch_name: Option<String>,
    /// Step in the pipeline where the token was created.
    pub step_in_pipeline: Option<u32>,
}

/// Parent link for a child token; joins record several with ordinals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenParent {
    /// Child token.
    pub token_id: TokenId,
    /// Parent token.
    pub parent_token_id: TokenId,
    /// Ordinal of the parent among the child's parents.
    pub ordinal: u32,
}

// ============================================================================
// SECTION: Node States
// ============================================================================

/// Reason metadata attached to a successful node state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuccessReason {
    /// Short machine-readable reason label.
    pub reason: String,
    /// Free-form metadata (for example quarantined replicate requests).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// Framework-level execution error attached to a failed state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionError {
    /// Error message.
    pub message: String,
    /// Error kind label (type name or category).
    pub kind: String,
    /// Backtrace or traceback rendering, when captured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
}

/// Plugin-reported transform failure reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformErrorReason {
    /// Short machine-readable reason label.
    pub reason: String,
    /// Underlying error rendering, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Human-readable message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Offending field, if the failure is field-scoped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

/// Fields shared by every node-state variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateEnvelope {
    /// State identifier (fresh per attempt).
    pub state_id: StateId,
    /// Token being processed.
    pub token_id: TokenId,
    /// Node doing the processing.
    pub node_id: NodeId,
    /// Position of this visit along the token's path.
    pub step_index: u32,
    /// Zero-based attempt number.
    pub attempt: u32,
    /// Stable hash of the node input.
    pub input_hash: String,
    /// When the state opened.
    pub started_at: Timestamp,
    /// Context snapshot before execution, if captured.
    pub context_before: Option<Value>,
}

/// The audit record of a single visit of one token at one node.
///
/// # Invariants
/// - Only an `Open` state may transition; `Completed` and `Failed` are
///   terminal and immutable after write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum NodeState {
    /// Initial state: the node is processing the token.
    Open {
        /// Shared state fields.
        #[serde(flatten)]
        envelope: StateEnvelope,
    },
    /// Terminal success.
    Completed {
        /// Shared state fields.
        #[serde(flatten)]
        envelope: StateEnvelope,
        /// Stable hash of the node output.
        output_hash: String,
        /// When the state closed.
        completed_at: Timestamp,
        /// Wall-clock duration in milliseconds.
        duration_ms: i64,
        /// Optional success reason metadata.
        success_reason: Option<SuccessReason>,
        /// Context snapshot after execution, if captured.
        context_after: Option<Value>,
    },
    /// Terminal failure.
    Failed {
        /// Shared state fields.
        #[serde(flatten)]
        envelope: StateEnvelope,
        /// When the state closed.
        completed_at: Timestamp,
        /// Wall-clock duration in milliseconds.
        duration_ms: i64,
        /// Framework error, when the failure was an execution error.
        error: Option<ExecutionError>,
        /// Partial output hash, when any output was produced.
        output_hash: Option<String>,
    },
}

impl NodeState {
    /// Returns the shared envelope fields.
    #[must_use]
    pub const fn envelope(&self) -> &StateEnvelope {
        match self {
            Self::Open { envelope }
            | Self::Completed { envelope, .. }
            | Self::Failed { envelope, .. } => envelope,
        }
    }

    /// Returns the state identifier.
    #[must_use]
    pub const fn state_id(&self) -> &StateId {
        &self.envelope().state_id
    }

    /// Returns the stable status label.
    #[must_use]
    pub const fn status(&self) -> &'static str {
        match self {
            Self::Open { .. } => "open",
            Self::Completed { .. } => "completed",
            Self::Failed { .. } => "failed",
        }
    }

    /// Returns true for the open variant.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }
}

// ============================================================================
// SECTION: Calls
// ============================================================================

/// Type of external call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallType {
    /// Model inference call.
    Llm,
    /// Plain HTTP call.
    Http,
    /// HTTP redirect hop.
    HttpRedirect,
    /// SQL statement against an external database.
    Sql,
    /// Filesystem access.
    Filesystem,
}

impl CallType {
    /// Returns the stable storage label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Llm => "llm",
            Self::Http => "http",
            Self::HttpRedirect => "http_redirect",
            Self::Sql => "sql",
            Self::Filesystem => "filesystem",
        }
    }
}

/// Status of an external call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    /// Call succeeded.
    Success,
    /// Call failed.
    Error,
}

impl CallStatus {
    /// Returns the stable storage label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
        }
    }
}

/// An external call recorded inside a node state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallRecord {
    /// Call identifier.
    pub call_id: CallId,
    /// Owning node state (must have been open at recording time).
    pub state_id: StateId,
    /// Monotonic index within the state.
    pub call_index: u32,
    /// Call type.
    pub call_type: CallType,
    /// Call status.
    pub status: CallStatus,
    /// Stable hash of the request; the replay key.
    pub request_hash: String,
    /// Payload-store reference for the request body.
    pub request_ref: Option<String>,
    /// Stable hash of the response, when one was recorded.
    pub response_hash: Option<String>,
    /// Payload-store reference for the response body.
    pub response_ref: Option<String>,
    /// Wall-clock latency in milliseconds.
    pub latency_ms: Option<i64>,
    /// Error rendering for failed calls.
    pub error: Option<String>,
}

// ============================================================================
// SECTION: Routing Events
// ============================================================================

/// One edge traversal recorded at a gate or fork.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingEventRecord {
    /// Event identifier.
    pub event_id: RoutingEventId,
    /// Gate state that produced the event.
    pub state_id: StateId,
    /// Edge traversed.
    pub edge_id: String,
    /// Group shared by sibling events of one routing decision.
    pub routing_group_id: GroupId,
    /// Ordinal within the group (lexicographic edge-label order).
    pub ordinal: u32,
    /// Traversal mode.
    pub mode: RoutingMode,
    /// Stable hash of the routing reason, if one was supplied.
    pub reason_hash: Option<String>,
    /// Payload-store reference for the routing reason.
    pub reason_ref: Option<String>,
}

// ============================================================================
// SECTION: Batches
// ============================================================================

/// Status of an aggregation batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    /// Accepting members.
    Draft,
    /// Flush in progress.
    Executing,
    /// Flush completed.
    Completed,
    /// Flush failed.
    Failed,
}

impl BatchStatus {
    /// Returns the stable storage label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// What caused an aggregation batch to execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    /// Configured row-count threshold reached.
    Count,
    /// Configured time limit reached.
    Timeout,
    /// Condition expression evaluated true.
    Condition,
    /// Source exhausted; remaining rows flushed.
    EndOfSource,
    /// Explicitly triggered.
    Manual,
}

impl TriggerType {
    /// Returns the stable storage label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Count => "count",
            Self::Timeout => "timeout",
            Self::Condition => "condition",
            Self::EndOfSource => "end_of_source",
            Self::Manual => "manual",
        }
    }
}

/// Output mode for aggregation batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    /// Emit buffered rows unchanged after flush.
    Passthrough,
    /// Emit transformed output from the aggregation plugin.
    Transform,
}

/// An aggregation batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRecord {
    /// Batch identifier.
    pub batch_id: BatchId,
    /// Owning run.
    pub run_id: RunId,
    /// Aggregation node that owns the batch.
    pub aggregation_node_id: NodeId,
    /// Zero-based flush attempt.
    pub attempt: u32,
    /// Batch status.
    pub status: BatchStatus,
    /// What fired the flush, once known.
    pub trigger_type: Option<TriggerType>,
    /// When the batch was opened.
    pub created_at: Timestamp,
}

/// Membership of one token in a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchMember {
    /// Owning batch.
    pub batch_id: BatchId,
    /// Member token.
    pub token_id: TokenId,
    /// Acceptance order within the batch.
    pub ordinal: u32,
}

// ============================================================================
// SECTION: Artifacts
// ============================================================================

/// A sink output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    /// Artifact identifier.
    pub artifact_id: ArtifactId,
    /// Owning run.
    pub run_id: RunId,
    /// Sink node that produced the artifact.
    pub node_id: NodeId,
    /// Path or URI of the written output.
    pub path_or_uri: String,
    /// SHA-256 of the bytes written.
    pub content_hash: String,
    /// Size of the written output in bytes.
    pub size_bytes: u64,
    /// Idempotency key for resumable sinks.
    pub idempotency_key: Option<String>,
    /// When the artifact was committed.
    pub created_at: Timestamp,
}

// ============================================================================
// SECTION: Checkpoints
// ============================================================================

/// A resume point within a run.
///
/// # Invariants
/// - Both topology hashes are always present (`NOT NULL` in storage).
/// - `sequence_number` is monotonic within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// Checkpoint identifier.
    pub checkpoint_id: CheckpointId,
    /// Owning run.
    pub run_id: RunId,
    /// Token being processed at checkpoint time.
    pub token_id: TokenId,
    /// Node the token was at.
    pub node_id: NodeId,
    /// Monotonic progress marker.
    pub sequence_number: u64,
    /// Hash of the subgraph upstream of the node at checkpoint time.
    pub upstream_topology_hash: String,
    /// Hash of the checkpointed node's configuration.
    pub checkpoint_node_config_hash: String,
    /// Serialized aggregation buffers, when a stateful plugin was active.
    pub aggregation_state_json: Option<Value>,
    /// When the checkpoint was written.
    pub created_at: Timestamp,
}

// ============================================================================
// SECTION: Token Outcomes
// ============================================================================

/// Final disposition of a token.
///
/// All outcomes are terminal except `Buffered`, which must be superseded by
/// a terminal outcome when the owning batch flushes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenOutcome {
    /// Reached an output sink successfully.
    Completed,
    /// Sent to a named sink by a gate.
    Routed,
    /// Split into parallel paths (parent token).
    Forked,
    /// Processing failed, not recoverable.
    Failed,
    /// Failed validation; stored for investigation.
    Quarantined,
    /// Absorbed into an aggregate.
    ConsumedInBatch,
    /// Merged in a join from parallel paths.
    Coalesced,
    /// Deaggregated into child tokens (parent token).
    Expanded,
    /// Held for batch processing in passthrough mode (non-terminal).
    Buffered,
}

impl TokenOutcome {
    /// Returns the stable storage label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Routed => "routed",
            Self::Forked => "forked",
            Self::Failed => "failed",
            Self::Quarantined => "quarantined",
            Self::ConsumedInBatch => "consumed_in_batch",
            Self::Coalesced => "coalesced",
            Self::Expanded => "expanded",
            Self::Buffered => "buffered",
        }
    }

    /// Returns true when the outcome is a final state for the token.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Buffered)
    }
}

/// A recorded token outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenOutcomeRecord {
    /// Token the outcome belongs to.
    pub token_id: TokenId,
    /// The outcome.
    pub outcome: TokenOutcome,
    /// Short reason label, when one applies.
    pub reason: Option<String>,
    /// When the outcome was determined.
    pub recorded_at: Timestamp,
}

// ============================================================================
// SECTION: Error Records
// ============================================================================

/// A Tier-3 validation error for external data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationErrorRecord {
    /// Owning run.
    pub run_id: RunId,
    /// Node that observed the error.
    pub node_id: NodeId,
    /// Row index at the source, when known.
    pub row_index: Option<u64>,
    /// Offending field, when field-scoped.
    pub field: Option<String>,
    /// Human-readable message.
    pub message: String,
    /// Canonical row JSON, when the row canonicalized.
    pub row_json: Option<Value>,
    /// Repr fallback when the row could not be canonicalized.
    pub repr_fallback: Option<crate::core::hashing::ReprFallback>,
    /// When the error was recorded.
    pub recorded_at: Timestamp,
}

/// A Tier-2 transform error for pipeline data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformErrorRecord {
    /// Owning run.
    pub run_id: RunId,
    /// Node that failed.
    pub node_id: NodeId,
    /// Token being processed.
    pub token_id: TokenId,
    /// State under which the failure occurred.
    pub state_id: StateId,
    /// Plugin-reported reason.
    pub reason: TransformErrorReason,
    /// Whether the engine considered the failure retryable.
    pub retryable: bool,
    /// When the error was recorded.
    pub recorded_at: Timestamp,
}
