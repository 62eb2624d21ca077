// elspeth-engine/tests/common/mod.rs
// ============================================================================
// Module: Engine Test Support
// Description: In-repo plugins and harness helpers for engine tests.
// ============================================================================
//! ## Overview
//! Concrete plugins are external collaborators, so the engine tests bind
//! small in-repo implementations: a memory source, an identity transform, a
//! flaky transform for retry scenarios, threshold and fork gates, a
//! batch-aware replicator, and a collecting sink.

#![allow(
    dead_code,
    reason = "Each scenario test binary uses a subset of the shared helpers."
)]

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;

use elspeth_core::CancelFlag;
use elspeth_core::ContractMode;
use elspeth_core::DataValue;
use elspeth_core::Determinism;
use elspeth_core::FieldContract;
use elspeth_core::FieldSource;
use elspeth_core::FieldType;
use elspeth_core::PipelineRow;
use elspeth_core::RetryConfig;
use elspeth_core::RetryManager;
use elspeth_core::RoutingAction;
use elspeth_core::SchemaContract;
use elspeth_core::SuccessReason;
use elspeth_core::TransformErrorReason;
use elspeth_core::ValueKind;
use elspeth_core::hash_bytes;
use elspeth_core::interfaces::ArtifactDescriptor;
use elspeth_core::interfaces::GatePlugin;
use elspeth_core::interfaces::PluginContext;
use elspeth_core::interfaces::PluginError;
use elspeth_core::interfaces::SinkPlugin;
use elspeth_core::interfaces::SourcePlugin;
use elspeth_core::interfaces::SourceRecord;
use elspeth_core::interfaces::TransformPlugin;
use elspeth_core::interfaces::TransformResult;
use elspeth_core::telemetry::TelemetryConfig;
use elspeth_core::telemetry::TelemetryManager;
use elspeth_engine::Processor;
use elspeth_engine::ProcessorOptions;
use elspeth_landscape::FilesystemPayloadStore;
use elspeth_landscape::Landscape;

// ============================================================================
// SECTION: Contract Helpers
// ============================================================================

/// Builds a flexible contract from `(name, kind)` pairs.
pub fn contract_of(fields: &[(&str, ValueKind)]) -> SchemaContract {
    let declared: Vec<FieldContract> = fields
        .iter()
        .map(|(name, kind)| FieldContract {
            normalized_name: (*name).to_string(),
            original_name: (*name).to_string(),
            field_type: FieldType { kind: *kind, nullable: false },
            required: true,
            source: FieldSource::Declared,
        })
        .collect();
    SchemaContract::new(ContractMode::Flexible, declared).unwrap_or_else(|_| {
        SchemaContract::empty_observed()
    })
}

/// Builds a row map from `(name, value)` pairs.
pub fn row_of(cells: &[(&str, DataValue)]) -> BTreeMap<String, DataValue> {
    cells.iter().map(|(name, value)| ((*name).to_string(), value.clone())).collect()
}

// ============================================================================
// SECTION: Memory Source
// ============================================================================

/// A source yielding pre-built records.
pub struct MemorySource {
    /// Pending records.
    records: VecDeque<SourceRecord>,
    /// Declared output contract.
    contract: SchemaContract,
}

impl MemorySource {
    /// Creates a source over valid row maps.
    pub fn new(rows: Vec<BTreeMap<String, DataValue>>, contract: SchemaContract) -> Self {
        let records =
            rows.into_iter().map(|data| SourceRecord::Valid { data }).collect();
        Self { records, contract }
    }

    /// Creates a source over raw records (for validation-failure tests).
    pub fn from_records(records: Vec<SourceRecord>, contract: SchemaContract) -> Self {
        Self { records: records.into_iter().collect(), contract }
    }
}

impl SourcePlugin for MemorySource {
    fn name(&self) -> &str {
        "memory_source"
    }

    fn plugin_version(&self) -> &str {
        "1"
    }

    fn determinism(&self) -> Determinism {
        Determinism::Deterministic
    }

    fn output_contract(&self) -> &SchemaContract {
        &self.contract
    }

    fn next_record(&mut self, _ctx: &PluginContext) -> Result<Option<SourceRecord>, PluginError> {
        Ok(self.records.pop_front())
    }
}

// ============================================================================
// SECTION: Transforms
// ============================================================================

/// A transform returning its input unchanged.
pub struct IdentityTransform {
    /// Shared input/output contract.
    contract: SchemaContract,
}

impl IdentityTransform {
    /// Creates the transform.
    pub const fn new(contract: SchemaContract) -> Self {
        Self { contract }
    }
}

impl TransformPlugin for IdentityTransform {
    fn name(&self) -> &str {
        "identity"
    }

    fn plugin_version(&self) -> &str {
        "1"
    }

    fn determinism(&self) -> Determinism {
        Determinism::Deterministic
    }

    fn input_contract(&self) -> &SchemaContract {
        &self.contract
    }

    fn output_contract(&self) -> &SchemaContract {
        &self.contract
    }

    fn process(&mut self, row: PipelineRow, _ctx: &PluginContext) -> TransformResult {
        TransformResult::success(row)
    }
}

/// A transform failing retryably a fixed number of times, then succeeding.
pub struct FlakyTransform {
    /// Shared input/output contract.
    contract: SchemaContract,
    /// Failures before the first success.
    failures_before_success: u32,
    /// Calls observed so far.
    calls: Arc<Mutex<u32>>,
}

impl FlakyTransform {
    /// Creates the transform with a shared call counter.
    pub fn new(contract: SchemaContract, failures_before_success: u32) -> (Self, Arc<Mutex<u32>>) {
        let calls = Arc::new(Mutex::new(0));
        (
            Self { contract, failures_before_success, calls: Arc::clone(&calls) },
            calls,
        )
    }
}

impl TransformPlugin for FlakyTransform {
    fn name(&self) -> &str {
        "flaky"
    }

    fn plugin_version(&self) -> &str {
        "1"
    }

    fn determinism(&self) -> Determinism {
        Determinism::NonDeterministic
    }

    fn input_contract(&self) -> &SchemaContract {
        &self.contract
    }

    fn output_contract(&self) -> &SchemaContract {
        &self.contract
    }

    fn process(&mut self, row: PipelineRow, _ctx: &PluginContext) -> TransformResult {
        let mut calls = match self.calls.lock() {
            Ok(calls) => calls,
            Err(_) => return TransformResult::success(row),
        };
        *calls += 1;
        if *calls <= self.failures_before_success {
            TransformResult::error(
                TransformErrorReason {
                    reason: "transient".to_string(),
                    error: None,
                    message: Some("transient upstream failure".to_string()),
                    field: None,
                },
                true,
            )
        } else {
            TransformResult::success(row)
        }
    }
}

/// A batch-aware transform replicating rows by their `copies` field.
///
/// Rows with a missing `copies` use the default; rows with a count outside
/// `1..=max_copies` are quarantined into the success-reason metadata and
/// produce no children.
pub struct ReplicateTransform {
    /// Shared input/output contract.
    contract: SchemaContract,
    /// Copies used when the field is absent.
    default_copies: i64,
    /// Upper bound on requested copies.
    max_copies: i64,
}

impl ReplicateTransform {
    /// Creates the replicator.
    pub const fn new(contract: SchemaContract, default_copies: i64, max_copies: i64) -> Self {
        Self { contract, default_copies, max_copies }
    }
}

impl TransformPlugin for ReplicateTransform {
    fn name(&self) -> &str {
        "batch_replicate"
    }

    fn plugin_version(&self) -> &str {
        "1"
    }

    fn determinism(&self) -> Determinism {
        Determinism::Deterministic
    }

    fn input_contract(&self) -> &SchemaContract {
        &self.contract
    }

    fn output_contract(&self) -> &SchemaContract {
        &self.contract
    }

    fn is_batch_aware(&self) -> bool {
        true
    }

    fn process(&mut self, row: PipelineRow, ctx: &PluginContext) -> TransformResult {
        self.process_batch(vec![row], ctx)
    }

    fn process_batch(&mut self, rows: Vec<PipelineRow>, _ctx: &PluginContext) -> TransformResult {
        let mut outputs: Vec<BTreeMap<String, DataValue>> = Vec::new();
        let mut quarantined: Vec<serde_json::Value> = Vec::new();
        for row in rows {
            let copies = match row.get("copies") {
                Some(DataValue::Integer(count)) => *count,
                _ => self.default_copies,
            };
            if copies < 1 || copies > self.max_copies {
                quarantined.push(serde_json::json!({
                    "row": row.to_json_object(),
                    "requested_copies": copies,
                }));
                continue;
            }
            for copy_index in 0..copies {
                let mut data: BTreeMap<String, DataValue> = row
                    .field_names()
                    .filter_map(|name| {
                        row.get(name).map(|value| (name.to_string(), value.clone()))
                    })
                    .collect();
                data.insert("copy_index".to_string(), DataValue::Integer(copy_index));
                outputs.push(data);
            }
        }
        let union_contract = SchemaContract::observe(outputs.iter());
        let reason = (!quarantined.is_empty()).then(|| SuccessReason {
            reason: "replicated_with_quarantine".to_string(),
            metadata: Some(serde_json::json!({ "quarantined": quarantined })),
        });
        let rows: Vec<PipelineRow> = outputs
            .into_iter()
            .map(|data| PipelineRow::new(data, union_contract.clone()))
            .collect();
        TransformResult::SuccessMulti { rows, reason, contract: Some(union_contract) }
    }
}

/// A transform that requests run cancellation, then passes its row through.
pub struct CancelTransform {
    /// Shared input/output contract.
    contract: SchemaContract,
}

impl CancelTransform {
    /// Creates the transform.
    pub const fn new(contract: SchemaContract) -> Self {
        Self { contract }
    }
}

impl TransformPlugin for CancelTransform {
    fn name(&self) -> &str {
        "cancel_requester"
    }

    fn plugin_version(&self) -> &str {
        "1"
    }

    fn determinism(&self) -> Determinism {
        Determinism::Deterministic
    }

    fn input_contract(&self) -> &SchemaContract {
        &self.contract
    }

    fn output_contract(&self) -> &SchemaContract {
        &self.contract
    }

    fn process(&mut self, row: PipelineRow, ctx: &PluginContext) -> TransformResult {
        ctx.cancel.cancel();
        TransformResult::success(row)
    }
}

/// A batch-aware transform that omits the contract (scheduler-error tests).
pub struct ContractlessBatchTransform {
    /// Shared input/output contract.
    contract: SchemaContract,
}

impl ContractlessBatchTransform {
    /// Creates the transform.
    pub const fn new(contract: SchemaContract) -> Self {
        Self { contract }
    }
}

impl TransformPlugin for ContractlessBatchTransform {
    fn name(&self) -> &str {
        "contractless"
    }

    fn plugin_version(&self) -> &str {
        "1"
    }

    fn determinism(&self) -> Determinism {
        Determinism::Deterministic
    }

    fn input_contract(&self) -> &SchemaContract {
        &self.contract
    }

    fn output_contract(&self) -> &SchemaContract {
        &self.contract
    }

    fn is_batch_aware(&self) -> bool {
        true
    }

    fn process(&mut self, row: PipelineRow, _ctx: &PluginContext) -> TransformResult {
        TransformResult::SuccessMulti { rows: vec![row], reason: None, contract: None }
    }

    fn process_batch(&mut self, rows: Vec<PipelineRow>, _ctx: &PluginContext) -> TransformResult {
        TransformResult::SuccessMulti { rows, reason: None, contract: None }
    }
}

// ============================================================================
// SECTION: Gates
// ============================================================================

/// A gate routing by an integer threshold on `amount`.
pub struct AmountGate {
    /// Input contract.
    contract: SchemaContract,
    /// Threshold; strictly-greater routes to `above`.
    threshold: i64,
}

impl AmountGate {
    /// Creates the gate.
    pub const fn new(contract: SchemaContract, threshold: i64) -> Self {
        Self { contract, threshold }
    }
}

impl GatePlugin for AmountGate {
    fn name(&self) -> &str {
        "amount_gate"
    }

    fn plugin_version(&self) -> &str {
        "1"
    }

    fn determinism(&self) -> Determinism {
        Determinism::Deterministic
    }

    fn input_contract(&self) -> &SchemaContract {
        &self.contract
    }

    fn evaluate(
        &mut self,
        row: &PipelineRow,
        _ctx: &PluginContext,
    ) -> Result<RoutingAction, PluginError> {
        let amount = match row.get("amount") {
            Some(DataValue::Integer(amount)) => *amount,
            _ => return Err(PluginError::Failed("amount field missing".to_string())),
        };
        let label = if amount > self.threshold { "above" } else { "below" };
        Ok(RoutingAction::route(
            label,
            Some(elspeth_core::RoutingReason::PluginGate {
                rule: "amount_threshold".to_string(),
                matched_value: serde_json::json!(amount),
                threshold: Some(serde_json::json!(self.threshold)),
                field: Some("amount".to_string()),
                comparison: Some(">".to_string()),
            }),
        ))
    }
}

/// A gate forking every row to a fixed set of branches.
pub struct ForkGate {
    /// Input contract.
    contract: SchemaContract,
    /// Branch names to fork to.
    branches: Vec<String>,
}

impl ForkGate {
    /// Creates the gate.
    pub fn new(contract: SchemaContract, branches: &[&str]) -> Self {
        Self {
            contract,
            branches: branches.iter().map(ToString::to_string).collect(),
        }
    }
}

impl GatePlugin for ForkGate {
    fn name(&self) -> &str {
        "fork_gate"
    }

    fn plugin_version(&self) -> &str {
        "1"
    }

    fn determinism(&self) -> Determinism {
        Determinism::Deterministic
    }

    fn input_contract(&self) -> &SchemaContract {
        &self.contract
    }

    fn evaluate(
        &mut self,
        _row: &PipelineRow,
        _ctx: &PluginContext,
    ) -> Result<RoutingAction, PluginError> {
        RoutingAction::fork_to_paths(self.branches.clone(), None)
            .map_err(|err| PluginError::Failed(err.to_string()))
    }
}

// ============================================================================
// SECTION: Collecting Sink
// ============================================================================

/// A sink collecting written rows in memory.
pub struct CollectingSink {
    /// Sink name, used in artifact paths.
    sink_name: String,
    /// Input contract.
    contract: SchemaContract,
    /// Rows written, as plain JSON.
    written: Arc<Mutex<Vec<serde_json::Value>>>,
    /// Writes performed, for artifact paths.
    writes: u64,
}

impl CollectingSink {
    /// Creates the sink with a shared written-rows handle.
    pub fn new(
        sink_name: &str,
        contract: SchemaContract,
    ) -> (Self, Arc<Mutex<Vec<serde_json::Value>>>) {
        let written = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                sink_name: sink_name.to_string(),
                contract,
                written: Arc::clone(&written),
                writes: 0,
            },
            written,
        )
    }
}

impl SinkPlugin for CollectingSink {
    fn name(&self) -> &str {
        "collecting_sink"
    }

    fn plugin_version(&self) -> &str {
        "1"
    }

    fn determinism(&self) -> Determinism {
        Determinism::IoWrite
    }

    fn input_contract(&self) -> &SchemaContract {
        &self.contract
    }

    fn write(
        &mut self,
        batch: &[PipelineRow],
        _ctx: &PluginContext,
    ) -> Result<ArtifactDescriptor, PluginError> {
        let mut bytes: Vec<u8> = Vec::new();
        for row in batch {
            let json = row.to_json_object();
            bytes.extend_from_slice(json.to_string().as_bytes());
            bytes.push(b'\n');
            self.written
                .lock()
                .map_err(|_| PluginError::Failed("written rows mutex poisoned".to_string()))?
                .push(json);
        }
        self.writes += 1;
        Ok(ArtifactDescriptor {
            path_or_uri: format!("mem://{}/{}", self.sink_name, self.writes),
            content_hash: hash_bytes(&bytes),
            size_bytes: bytes.len() as u64,
            idempotency_key: None,
        })
    }

    fn flush(&mut self) -> Result<(), PluginError> {
        Ok(())
    }

    fn close(&mut self) -> Result<(), PluginError> {
        Ok(())
    }
}

// ============================================================================
// SECTION: Harness
// ============================================================================

/// Builds a processor over the given landscape and a temp payload store.
pub fn make_processor(landscape: Landscape, payload_dir: &std::path::Path) -> Processor {
    let payloads =
        FilesystemPayloadStore::open(payload_dir).unwrap_or_else(|_| {
            // tempdir roots are always creatable in the test environment.
            FilesystemPayloadStore::open(std::env::temp_dir().join("elspeth-tests"))
                .expect("payload store")
        });
    Processor::new(
        landscape,
        Arc::new(payloads),
        TelemetryManager::new(TelemetryConfig::default(), Vec::new()),
        RetryManager::new(RetryConfig::new(3, 0.01, 0.05, 0.0, 2.0).expect("retry config")),
        CancelFlag::new(),
        ProcessorOptions {
            transform_timeout: std::time::Duration::from_secs(5),
            checkpoint_interval: 0,
        },
    )
}
