// elspeth-core/src/interfaces/mod.rs
// ============================================================================
// Module: ELSPETH Interfaces
// Description: Backend-agnostic plugin and storage contract surfaces.
// Purpose: Define how the engine integrates sources, transforms, gates,
//          sinks, and payload storage without embedding implementations.
// Dependencies: crate::core
// ============================================================================

//! ## Overview
//! Interfaces define the seams the engine consumes. Concrete plugin
//! implementations (CSV, JSON, HTTP, LLM clients) live outside this
//! workspace; the engine sees only these traits. Implementations must be
//! deterministic to the degree their declared [`Determinism`] promises and
//! must fail closed on missing or invalid data.
//!
//! Plugins never signal ordinary failure by panicking: transforms return
//! [`TransformResult::Error`] with a typed reason, and exceptions are
//! reserved for true crashes.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::core::contract::SchemaContract;
use crate::core::identifiers::NodeId;
use crate::core::identifiers::RunId;
use crate::core::identifiers::StateId;
use crate::core::identifiers::TokenId;
use crate::core::records::Determinism;
use crate::core::records::SuccessReason;
use crate::core::records::TransformErrorReason;
use crate::core::routing::RoutingAction;
use crate::core::value::DataValue;
use crate::core::value::PipelineRow;

// ============================================================================
// SECTION: Cancellation
// ============================================================================

/// Run-scoped cooperative cancellation flag.
///
/// The coordinator checks the flag at every scheduling decision; plugin code
/// should check it at its own safe points. In-flight calls that ignore it
/// are allowed to complete and are recorded before the run closes.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// Creates an un-cancelled flag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Returns true once cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ============================================================================
// SECTION: Plugin Context
// ============================================================================

/// Execution context handed to plugin calls.
#[derive(Debug, Clone)]
pub struct PluginContext {
    /// Owning run.
    pub run_id: RunId,
    /// Node being executed.
    pub node_id: NodeId,
    /// Open state for this attempt, when one exists.
    pub state_id: Option<StateId>,
    /// Cooperative cancellation flag.
    pub cancel: CancelFlag,
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors raised by plugin implementations for true crashes.
#[derive(Debug, Error)]
pub enum PluginError {
    /// The plugin failed in a way that is not a typed transform error.
    #[error("plugin failure: {0}")]
    Failed(String),
    /// A batch operation was requested from a non-batch-aware plugin.
    #[error("plugin '{plugin}' is not batch-aware")]
    NotBatchAware {
        /// Offending plugin name.
        plugin: String,
    },
}

/// Errors raised by payload stores.
#[derive(Debug, Error)]
pub enum PayloadStoreError {
    /// Store I/O failure.
    #[error("payload store io error: {0}")]
    Io(String),
    /// The reference does not exist in the store.
    #[error("payload reference not found: {0}")]
    NotFound(String),
    /// The reference is malformed.
    #[error("invalid payload reference: {0}")]
    InvalidRef(String),
}

// ============================================================================
// SECTION: Transform Results
// ============================================================================

/// Result of a transform or aggregation call.
#[derive(Debug, Clone)]
pub enum TransformResult {
    /// One output row.
    Success {
        /// The output row.
        row: PipelineRow,
        /// Optional success reason metadata.
        reason: Option<SuccessReason>,
    },
    /// Multiple output rows (deaggregation or batch output).
    ///
    /// A multi-row result MUST carry a contract whose fields are the union
    /// of keys across all returned rows; the scheduler fails the state when
    /// the contract is absent.
    SuccessMulti {
        /// The output rows.
        rows: Vec<PipelineRow>,
        /// Optional success reason metadata.
        reason: Option<SuccessReason>,
        /// Contract covering the union of output fields.
        contract: Option<SchemaContract>,
    },
    /// A typed, plugin-reported failure.
    Error {
        /// The failure reason.
        reason: TransformErrorReason,
        /// Whether the engine may retry the attempt.
        retryable: bool,
    },
}

impl TransformResult {
    /// Builds a single-row success.
    #[must_use]
    pub const fn success(row: PipelineRow) -> Self {
        Self::Success { row, reason: None }
    }

    /// Builds a multi-row success with its union contract.
    #[must_use]
    pub const fn success_multi(rows: Vec<PipelineRow>, contract: SchemaContract) -> Self {
        Self::SuccessMulti { rows, reason: None, contract: Some(contract) }
    }

    /// Builds a typed failure.
    #[must_use]
    pub const fn error(reason: TransformErrorReason, retryable: bool) -> Self {
        Self::Error { reason, retryable }
    }
}

// ============================================================================
// SECTION: Source Plugin
// ============================================================================

/// Policy for rows that fail source validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidationPolicy {
    /// Drop the row after recording the validation error.
    Discard,
    /// Route the row to a named quarantine sink.
    Quarantine {
        /// Declared quarantine sink name.
        sink_name: String,
    },
}

/// One record yielded by a source.
#[derive(Debug, Clone)]
pub enum SourceRecord {
    /// A row that passed source validation.
    Valid {
        /// Field values keyed by normalized name.
        data: BTreeMap<String, DataValue>,
    },
    /// A row that failed source validation (Tier-3 external data).
    Invalid {
        /// The raw value as close to the wire form as possible.
        raw: Value,
        /// Human-readable validation message.
        message: String,
        /// Offending field, when field-scoped.
        field: Option<String>,
    },
}

/// A source of pipeline rows.
pub trait SourcePlugin: Send {
    /// Stable plugin name.
    fn name(&self) -> &str;

    /// Plugin version string.
    fn plugin_version(&self) -> &str;

    /// Declared determinism class (required; no default).
    fn determinism(&self) -> Determinism;

    /// Output schema contract.
    fn output_contract(&self) -> &SchemaContract;

    /// Policy applied to rows that fail validation.
    fn on_validation_failure(&self) -> ValidationPolicy {
        ValidationPolicy::Discard
    }

    /// Yields the next record, or `None` at end of source.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError`] only for true source crashes; per-row
    /// validation failures are [`SourceRecord::Invalid`].
    fn next_record(&mut self, ctx: &PluginContext) -> Result<Option<SourceRecord>, PluginError>;
}

// ============================================================================
// SECTION: Transform Plugin
// ============================================================================

/// A row transform; batch-aware transforms also serve aggregation nodes.
pub trait TransformPlugin: Send {
    /// Stable plugin name.
    fn name(&self) -> &str;

    /// Plugin version string.
    fn plugin_version(&self) -> &str;

    /// Declared determinism class (required; no default).
    fn determinism(&self) -> Determinism;

    /// Input schema contract.
    fn input_contract(&self) -> &SchemaContract;

    /// Output schema contract.
    fn output_contract(&self) -> &SchemaContract;

    /// True when the plugin accepts whole batches.
    fn is_batch_aware(&self) -> bool {
        false
    }

    /// Maximum concurrent calls the engine may issue into this plugin.
    ///
    /// Non-batch-aware transforms are always limited to one.
    fn max_concurrency(&self) -> usize {
        1
    }

    /// Processes a single row.
    fn process(&mut self, row: PipelineRow, ctx: &PluginContext) -> TransformResult;

    /// Processes a whole batch (aggregation flush).
    ///
    /// The default refuses; batch-aware plugins override.
    fn process_batch(&mut self, rows: Vec<PipelineRow>, ctx: &PluginContext) -> TransformResult {
        let _ = (rows, ctx);
        TransformResult::Error {
            reason: TransformErrorReason {
                reason: "not_batch_aware".to_string(),
                error: None,
                message: Some(format!("plugin '{}' is not batch-aware", self.name())),
                field: None,
            },
            retryable: false,
        }
    }
}

// ============================================================================
// SECTION: Gate Plugin
// ============================================================================

/// A routing decision point.
pub trait GatePlugin: Send {
    /// Stable plugin name.
    fn name(&self) -> &str;

    /// Plugin version string.
    fn plugin_version(&self) -> &str;

    /// Declared determinism class (required; no default).
    fn determinism(&self) -> Determinism;

    /// Input schema contract.
    fn input_contract(&self) -> &SchemaContract;

    /// Evaluates the routing action for one row.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError`] only for true gate crashes.
    fn evaluate(
        &mut self,
        row: &PipelineRow,
        ctx: &PluginContext,
    ) -> Result<RoutingAction, PluginError>;
}

// ============================================================================
// SECTION: Sink Plugin
// ============================================================================

/// Descriptor for a committed sink artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactDescriptor {
    /// Path or URI of the written output.
    pub path_or_uri: String,
    /// SHA-256 of the bytes written.
    pub content_hash: String,
    /// Size of the written output in bytes.
    pub size_bytes: u64,
    /// Idempotency key for resumable sinks.
    pub idempotency_key: Option<String>,
}

/// A terminal writer of pipeline rows.
pub trait SinkPlugin: Send {
    /// Stable plugin name.
    fn name(&self) -> &str;

    /// Plugin version string.
    fn plugin_version(&self) -> &str;

    /// Declared determinism class (required; no default).
    fn determinism(&self) -> Determinism;

    /// Input schema contract.
    fn input_contract(&self) -> &SchemaContract;

    /// Writes a batch of rows and commits an artifact.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError`] when the write fails.
    fn write(
        &mut self,
        batch: &[PipelineRow],
        ctx: &PluginContext,
    ) -> Result<ArtifactDescriptor, PluginError>;

    /// Flushes buffered output.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError`] when flushing fails.
    fn flush(&mut self) -> Result<(), PluginError>;

    /// Releases sink resources.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError`] when closing fails.
    fn close(&mut self) -> Result<(), PluginError>;

    /// True when the sink can continue a partially written output.
    fn supports_resume(&self) -> bool {
        false
    }

    /// Prepares the sink to append after a resume.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError`] when the sink does not support resume.
    fn configure_for_resume(&mut self) -> Result<(), PluginError> {
        Err(PluginError::Failed(format!("sink '{}' does not support resume", self.name())))
    }
}

// ============================================================================
// SECTION: Payload Store
// ============================================================================

/// Content-addressed storage for large values.
///
/// The content address is the SHA-256 of the stored bytes; the returned
/// reference is backend-dependent (a relative path, a blob URL).
pub trait PayloadStore: Send + Sync {
    /// Stores bytes and returns a reference.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadStoreError`] when the write fails.
    fn store(&self, bytes: &[u8]) -> Result<String, PayloadStoreError>;

    /// Fetches bytes by reference.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadStoreError`] when the reference is unknown or the
    /// read fails.
    fn fetch(&self, payload_ref: &str) -> Result<Vec<u8>, PayloadStoreError>;

    /// Purges a set of references, returning how many were removed.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadStoreError`] when removal fails.
    fn purge(&self, refs: &BTreeSet<String>) -> Result<usize, PayloadStoreError>;
}

// ============================================================================
// SECTION: Token Info
// ============================================================================

/// Minimal token identity passed through worker boundaries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TokenInfo {
    /// Token identifier.
    pub token_id: TokenId,
    /// Row the token carries.
    pub row_id: crate::core::identifiers::RowId,
}
