// elspeth-engine/src/processor.rs
// ============================================================================
// Module: Engine Processor
// Description: The coordinator that turns an execution graph into a run.
// Purpose: Dispatch tokens through the node state machine, resolve routing,
//          drive forks, aggregations, and joins, and keep the audit durable
//          before every downstream step.
// Dependencies: elspeth-core, elspeth-landscape, tokio
// ============================================================================

//! ## Overview
//! A single coordinator owns every run, node, token, and state transition;
//! plugin calls execute on blocking workers and report back through the
//! shared batch adapter's per-attempt waiters. Within one token the order
//! of node visits is strict and observable via `step_index`; audit rows for
//! a node are durable before the downstream node starts for that token.
//!
//! Failure routing: retryable failures go to the retry manager with a fresh
//! `state_id` per attempt; exhausted or non-retryable failures record a
//! FAILED state and a `failed` outcome, or `quarantined` when the node has
//! a divert edge to a quarantine sink. Cancellation is cooperative: the
//! flag is checked at every scheduling decision, in-flight calls complete
//! and are recorded, buffered tokens receive their terminal outcome, and
//! only then does the run close as interrupted.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::panic::catch_unwind;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use elspeth_core::ArtifactId;
use elspeth_core::ArtifactRecord;
use elspeth_core::BatchId;
use elspeth_core::BatchMember;
use elspeth_core::BatchRecord;
use elspeth_core::BatchStatus;
use elspeth_core::EdgeRecord;
use elspeth_core::ExecutionError;
use elspeth_core::ExecutionGraph;
use elspeth_core::GroupId;
use elspeth_core::NodeId;
use elspeth_core::NodeRecord;
use elspeth_core::NodeState;
use elspeth_core::NodeType;
use elspeth_core::OutputMode;
use elspeth_core::PipelineRow;
use elspeth_core::RouteDestination;
use elspeth_core::RoutingEventId;
use elspeth_core::RoutingEventRecord;
use elspeth_core::RoutingKind;
use elspeth_core::RoutingMode;
use elspeth_core::RunId;
use elspeth_core::RunMode;
use elspeth_core::RunRecord;
use elspeth_core::RunStatus;
use elspeth_core::SchemaContract;
use elspeth_core::StateEnvelope;
use elspeth_core::StateId;
use elspeth_core::SuccessReason;
use elspeth_core::Timestamp;
use elspeth_core::TokenOutcome;
use elspeth_core::TokenRecord;
use elspeth_core::TransformErrorReason;
use elspeth_core::TransformErrorRecord;
use elspeth_core::TriggerConfig;
use elspeth_core::TriggerEvaluator;
use elspeth_core::TriggerType;
use elspeth_core::ValidationErrorRecord;
use elspeth_core::interfaces::CancelFlag;
use elspeth_core::interfaces::GatePlugin;
use elspeth_core::interfaces::PayloadStore;
use elspeth_core::interfaces::PluginContext;
use elspeth_core::interfaces::SinkPlugin;
use elspeth_core::interfaces::SourcePlugin;
use elspeth_core::interfaces::SourceRecord;
use elspeth_core::interfaces::TransformPlugin;
use elspeth_core::interfaces::TransformResult;
use elspeth_core::interfaces::ValidationPolicy;
use elspeth_core::runtime::RetryError;
use elspeth_core::runtime::RetryManager;
use elspeth_core::stable_hash;
use elspeth_core::telemetry::TelemetryEvent;
use elspeth_core::telemetry::TelemetryManager;
use elspeth_landscape::Landscape;
use elspeth_landscape::RunSummary;
use serde_json::Value;
use thiserror::Error;

use crate::batch::SharedBatchAdapter;
use crate::batch::WaitError;
use crate::batch::WorkerResult;
use crate::checkpoint::CheckpointManager;
use crate::tokens::TokenManager;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors raised by the processor.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Audit store failure.
    #[error(transparent)]
    Landscape(#[from] elspeth_landscape::LandscapeError),
    /// Canonical hashing failure.
    #[error(transparent)]
    Hash(#[from] elspeth_core::HashError),
    /// Payload store failure.
    #[error(transparent)]
    Payload(#[from] elspeth_core::PayloadStoreError),
    /// Checkpoint subsystem failure.
    #[error(transparent)]
    Checkpoint(#[from] crate::checkpoint::CheckpointError),
    /// Telemetry raised under `fail_on_total_exporter_failure`.
    #[error(transparent)]
    Telemetry(#[from] elspeth_core::TelemetryError),
    /// A plugin crashed (panic or fatal error).
    #[error("plugin crash at node {node_id}: {message}")]
    PluginCrash {
        /// Node whose plugin crashed.
        node_id: String,
        /// Crash rendering.
        message: String,
    },
    /// A gate returned a label the route map cannot resolve.
    #[error("gate {gate} returned unresolvable route label '{label}'")]
    UnresolvedRoute {
        /// Gate node.
        gate: String,
        /// Unresolvable label.
        label: String,
    },
    /// A multi-row result arrived without its contract.
    #[error("node {node_id} returned a multi-row result without a schema contract")]
    MissingContract {
        /// Offending node.
        node_id: String,
    },
    /// The named sink is not part of the plan.
    #[error("unknown sink '{0}'")]
    UnknownSink(String),
}

// ============================================================================
// SECTION: Plan
// ============================================================================

/// A processing step of the pipeline, in order.
pub enum PlanStep {
    /// A row transform.
    Transform {
        /// Node identifier.
        node_id: NodeId,
        /// The plugin.
        plugin: Box<dyn TransformPlugin>,
    },
    /// A routing gate.
    Gate {
        /// Node identifier.
        node_id: NodeId,
        /// The plugin.
        plugin: Box<dyn GatePlugin>,
    },
    /// An aggregation buffering tokens into batches.
    Aggregation {
        /// Node identifier.
        node_id: NodeId,
        /// The batch-aware plugin.
        plugin: Box<dyn TransformPlugin>,
        /// Flush trigger configuration.
        trigger: TriggerConfig,
        /// Passthrough or transform output.
        output_mode: OutputMode,
    },
    /// A join of forked branches.
    Coalesce {
        /// Node identifier.
        node_id: NodeId,
    },
}

/// A named sink bound into the plan.
pub struct SinkBinding {
    /// Declared sink name.
    pub name: String,
    /// Node identifier.
    pub node_id: NodeId,
    /// The plugin.
    pub plugin: Box<dyn SinkPlugin>,
}

/// Everything the processor needs to execute one pipeline.
pub struct PipelinePlan {
    /// The run identifier; node ids are derived from it, and resume reuses
    /// the interrupted run's id so they keep matching.
    pub run_id: RunId,
    /// Resolved settings recorded on the run row.
    pub settings_json: Value,
    /// Live, replay, or verify.
    pub run_mode: RunMode,
    /// Source run for replay and verify modes.
    pub source_run_id: Option<RunId>,
    /// Source node identifier.
    pub source_node: NodeId,
    /// The source plugin.
    pub source: Box<dyn SourcePlugin>,
    /// Processing steps in pipeline order.
    pub steps: Vec<PlanStep>,
    /// Declared sinks.
    pub sinks: Vec<SinkBinding>,
    /// Sink receiving rows that fall off the end of the pipeline.
    pub default_sink: String,
    /// The validated execution graph.
    pub graph: ExecutionGraph,
    /// True when this plan continues an interrupted run: the run row is
    /// re-opened and nodes/edges are not re-registered.
    pub resume: bool,
    /// Recovered rows to process instead of pulling the source; tokens are
    /// bound to the existing row records.
    pub resume_rows: Option<Vec<ResumeRow>>,
}

/// A recovered row handed back to the processor on resume.
#[derive(Debug, Clone)]
pub struct ResumeRow {
    /// The existing row record's identifier.
    pub row_id: elspeth_core::RowId,
    /// Original row index at the source.
    pub row_index: u64,
    /// The restored row with its contract.
    pub row: PipelineRow,
}

/// Processor tuning options.
#[derive(Debug, Clone)]
pub struct ProcessorOptions {
    /// Per-attempt transform timeout.
    pub transform_timeout: Duration,
    /// Rows between checkpoints; zero disables checkpointing.
    pub checkpoint_interval: u64,
}

impl Default for ProcessorOptions {
    fn default() -> Self {
        Self { transform_timeout: Duration::from_secs(300), checkpoint_interval: 0 }
    }
}

/// Final report of an executed run.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// The run identifier.
    pub run_id: RunId,
    /// Final run status.
    pub status: RunStatus,
    /// Audit row counts.
    pub summary: RunSummary,
    /// Token outcome counts by label.
    pub outcome_counts: BTreeMap<String, u64>,
}

// ============================================================================
// SECTION: Runtime Structures
// ============================================================================

/// Shared handle to a transform plugin for blocking workers.
type SharedTransform = Arc<Mutex<Box<dyn TransformPlugin>>>;

/// A runtime step with plugins behind shared handles.
#[derive(Clone)]
enum StepRuntime {
    /// Transform step.
    Transform {
        /// Node identifier.
        node_id: NodeId,
        /// Shared plugin handle.
        plugin: SharedTransform,
    },
    /// Gate step.
    Gate {
        /// Node identifier.
        node_id: NodeId,
        /// Shared plugin handle.
        plugin: Arc<Mutex<Box<dyn GatePlugin>>>,
    },
    /// Aggregation step.
    Aggregation {
        /// Node identifier.
        node_id: NodeId,
        /// Shared plugin handle.
        plugin: SharedTransform,
        /// Passthrough or transform output.
        output_mode: OutputMode,
    },
    /// Coalesce step.
    Coalesce {
        /// Node identifier.
        node_id: NodeId,
    },
}

impl StepRuntime {
    /// Returns the step's node identifier.
    const fn node_id(&self) -> &NodeId {
        match self {
            Self::Transform { node_id, .. }
            | Self::Gate { node_id, .. }
            | Self::Aggregation { node_id, .. }
            | Self::Coalesce { node_id } => node_id,
        }
    }
}

/// Mutable aggregation state for one aggregation node.
struct AggRuntime {
    /// Trigger evaluator.
    evaluator: TriggerEvaluator,
    /// Current draft batch, when one is open.
    batch_id: Option<BatchId>,
    /// Zero-based flush attempt counter.
    attempt: u32,
    /// Buffered members in acceptance order.
    members: Vec<(TokenRecord, PipelineRow)>,
}

/// Mutable coalesce state for one coalesce node.
#[derive(Default)]
struct CoalesceRuntime {
    /// Arrived siblings keyed by fork group.
    arrived: HashMap<String, Vec<(TokenRecord, PipelineRow)>>,
}

/// A sink bound at runtime.
struct SinkRuntime {
    /// Node identifier.
    node_id: NodeId,
    /// The plugin.
    plugin: Arc<Mutex<Box<dyn SinkPlugin>>>,
}

/// Outcome of one transform attempt, for the retry loop.
#[derive(Debug)]
struct AttemptFailure {
    /// Failure rendering.
    message: String,
    /// Whether the engine may retry.
    retryable: bool,
    /// Typed reason when the plugin reported one.
    #[allow(dead_code, reason = "constructed for future typed-reason consumers; not yet read")]
    reason: Option<TransformErrorReason>,
}

impl std::fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

// ============================================================================
// SECTION: Processor
// ============================================================================

/// The pipeline coordinator.
pub struct Processor {
    /// Audit store.
    landscape: Landscape,
    /// Payload store for row and call bodies.
    payloads: Arc<dyn PayloadStore>,
    /// Telemetry manager.
    telemetry: TelemetryManager,
    /// Retry manager for transform attempts.
    retry: RetryManager,
    /// Cooperative cancellation flag.
    cancel: CancelFlag,
    /// Tuning options.
    options: ProcessorOptions,
    /// Token and lineage writer.
    tokens: TokenManager,
    /// Checkpoint writer.
    checkpoints: CheckpointManager,
    /// Shared output port for worker results.
    adapter: SharedBatchAdapter,
    /// Runtime steps, shared for worker dispatch.
    steps: Vec<StepRuntime>,
    /// Aggregation state per aggregation node.
    aggregations: HashMap<NodeId, AggRuntime>,
    /// Coalesce state per coalesce node.
    coalesces: HashMap<NodeId, CoalesceRuntime>,
    /// Expected sibling counts per fork group at coalesce nodes.
    coalesce_expected: HashMap<String, usize>,
    /// Sinks by declared name.
    sinks: BTreeMap<String, SinkRuntime>,
    /// Sink names by node id (for divert edge resolution).
    sink_names_by_node: HashMap<NodeId, String>,
    /// The validated execution graph.
    graph: ExecutionGraph,
    /// The run in flight.
    run_id: RunId,
}

impl Processor {
    /// Creates a processor over its collaborators.
    #[must_use]
    pub fn new(
        landscape: Landscape,
        payloads: Arc<dyn PayloadStore>,
        telemetry: TelemetryManager,
        retry: RetryManager,
        cancel: CancelFlag,
        options: ProcessorOptions,
    ) -> Self {
        let tokens = TokenManager::new(landscape.clone());
        let checkpoints = CheckpointManager::new(landscape.clone());
        Self {
            landscape,
            payloads,
            telemetry,
            retry,
            cancel,
            options,
            tokens,
            checkpoints,
            adapter: SharedBatchAdapter::new(),
            steps: Vec::new(),
            aggregations: HashMap::new(),
            coalesces: HashMap::new(),
            coalesce_expected: HashMap::new(),
            sinks: BTreeMap::new(),
            sink_names_by_node: HashMap::new(),
            graph: ExecutionGraph::empty(),
            run_id: RunId::new("run_unstarted"),
        }
    }

    /// Returns the cancellation flag for external cancel requests.
    #[must_use]
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Executes a pipeline plan end to end.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] for framework failures. Plugin-level row
    /// failures are recorded in the Landscape, not raised.
    pub async fn execute(&mut self, plan: PipelinePlan) -> Result<RunReport, EngineError> {
        let run_id = plan.run_id.clone();
        self.run_id = run_id.clone();
        self.graph = plan.graph.clone();
        let started_at = Timestamp::now();

        if plan.resume {
            self.landscape.resume_run(&run_id)?;
        } else {
            let config_hash = stable_hash(&plan.settings_json)?;
            self.landscape.begin_run(&RunRecord {
                run_id: run_id.clone(),
                started_at,
                completed_at: None,
                status: RunStatus::Running,
                config_hash,
                settings_json: plan.settings_json.clone(),
                canonical_version: "jcs-sha256-1".to_string(),
                schema_contract_json: None,
                schema_contract_hash: None,
                run_mode: Some(plan.run_mode),
                source_run_id: plan.source_run_id.clone(),
                export_status: None,
                exported_at: None,
            })?;
        }
        self.telemetry
            .handle_event(&TelemetryEvent::RunStarted { run_id: run_id.clone(), at: started_at })?;

        let mut source = plan.source;
        self.register_plan(
            &plan.source_node,
            source.as_ref(),
            plan.steps,
            plan.sinks,
            !plan.resume,
        )?;
        let default_sink = plan.default_sink;

        let outcome = match plan.resume_rows {
            Some(rows) => {
                self.run_resume_loop(&plan.source_node, rows, &default_sink).await
            }
            None => {
                self.run_source_loop(&plan.source_node, source.as_mut(), &default_sink).await
            }
        };

        let status = match outcome {
            Ok(()) if self.cancel.is_cancelled() => RunStatus::Interrupted,
            Ok(()) => RunStatus::Completed,
            Err(ref error) => {
                tracing::error!(run_id = %run_id, error = %error, "run failed");
                RunStatus::Failed
            }
        };

        self.close_sinks();
        let completed_at = Timestamp::now();
        self.landscape.complete_run(&run_id, status, completed_at)?;
        match status {
            RunStatus::Completed => {
                self.checkpoints.delete_checkpoints(&run_id)?;
                let summary = self.landscape.run_summary(&run_id)?;
                self.telemetry.handle_event(&TelemetryEvent::RunCompleted {
                    run_id: run_id.clone(),
                    at: completed_at,
                    rows: summary.rows,
                })?;
            }
            RunStatus::Failed | RunStatus::Interrupted | RunStatus::Running => {
                self.telemetry.handle_event(&TelemetryEvent::RunFailed {
                    run_id: run_id.clone(),
                    at: completed_at,
                    message: status.as_str().to_string(),
                })?;
            }
        }
        self.telemetry.flush();
        outcome?;

        Ok(RunReport {
            run_id: run_id.clone(),
            status,
            summary: self.landscape.run_summary(&run_id)?,
            outcome_counts: self.landscape.outcome_counts(&run_id)?,
        })
    }

    /// Registers every node and edge of the plan on the run.
    ///
    /// With `record` false (resume), runtime structures are built but no
    /// node or edge rows are written; they already exist on the run.
    fn register_plan(
        &mut self,
        source_node: &NodeId,
        source: &dyn SourcePlugin,
        steps: Vec<PlanStep>,
        sinks: Vec<SinkBinding>,
        record: bool,
    ) -> Result<(), EngineError> {
        let mut sequence: u32 = 0;
        if record {
            self.register_node(
                source_node,
                source.name(),
                source.plugin_version(),
                NodeType::Source,
                source.determinism(),
                sequence,
            )?;
        }

        self.steps.clear();
        for step in steps {
            sequence += 1;
            match step {
                PlanStep::Transform { node_id, plugin } => {
                    if record {
                        self.register_node(
                            &node_id,
                            plugin.name(),
                            plugin.plugin_version(),
                            NodeType::Transform,
                            plugin.determinism(),
                            sequence,
                        )?;
                    }
                    self.steps.push(StepRuntime::Transform {
                        node_id,
                        plugin: Arc::new(Mutex::new(plugin)),
                    });
                }
                PlanStep::Gate { node_id, plugin } => {
                    if record {
                        self.register_node(
                            &node_id,
                            plugin.name(),
                            plugin.plugin_version(),
                            NodeType::Gate,
                            plugin.determinism(),
                            sequence,
                        )?;
                    }
                    self.steps
                        .push(StepRuntime::Gate { node_id, plugin: Arc::new(Mutex::new(plugin)) });
                }
                PlanStep::Aggregation { node_id, plugin, trigger, output_mode } => {
                    if record {
                        self.register_node(
                            &node_id,
                            plugin.name(),
                            plugin.plugin_version(),
                            NodeType::Aggregation,
                            plugin.determinism(),
                            sequence,
                        )?;
                    }
                    let evaluator = TriggerEvaluator::new(&trigger).map_err(|err| {
                        EngineError::PluginCrash {
                            node_id: node_id.to_string(),
                            message: err.to_string(),
                        }
                    })?;
                    self.aggregations.insert(
                        node_id.clone(),
                        AggRuntime { evaluator, batch_id: None, attempt: 0, members: Vec::new() },
                    );
                    self.steps.push(StepRuntime::Aggregation {
                        node_id,
                        plugin: Arc::new(Mutex::new(plugin)),
                        output_mode,
                    });
                }
                PlanStep::Coalesce { node_id } => {
                    if record {
                        self.register_node(
                            &node_id,
                            "coalesce",
                            "1",
                            NodeType::Coalesce,
                            elspeth_core::Determinism::Deterministic,
                            sequence,
                        )?;
                    }
                    self.coalesces.insert(node_id.clone(), CoalesceRuntime::default());
                    self.steps.push(StepRuntime::Coalesce { node_id });
                }
            }
        }

        for binding in sinks {
            sequence += 1;
            if record {
                self.register_node(
                    &binding.node_id,
                    binding.plugin.name(),
                    binding.plugin.plugin_version(),
                    NodeType::Sink,
                    binding.plugin.determinism(),
                    sequence,
                )?;
            }
            self.sink_names_by_node.insert(binding.node_id.clone(), binding.name.clone());
            self.sinks.insert(
                binding.name,
                SinkRuntime {
                    node_id: binding.node_id,
                    plugin: Arc::new(Mutex::new(binding.plugin)),
                },
            );
        }

        if record {
            for edge in self.graph.get_edges() {
                self.landscape.record_edge(&EdgeRecord {
                    edge_id: ExecutionGraph::edge_id(&edge),
                    run_id: self.run_id.clone(),
                    from_node: edge.from_node.clone(),
                    to_node: edge.to_node.clone(),
                    label: edge.label.clone(),
                    default_mode: edge.mode,
                })?;
            }
        }
        Ok(())
    }

    /// Registers one node row, taking config from the graph.
    fn register_node(
        &self,
        node_id: &NodeId,
        plugin_name: &str,
        plugin_version: &str,
        node_type: NodeType,
        determinism: elspeth_core::Determinism,
        sequence: u32,
    ) -> Result<(), EngineError> {
        let (config_json, config_hash) = self.graph.get_node_info(node_id).map_or_else(
            || (Value::Null, String::new()),
            |node| (node.config.clone(), node.config_hash.clone()),
        );
        self.landscape.register_node(&NodeRecord {
            node_id: node_id.clone(),
            run_id: self.run_id.clone(),
            plugin_name: plugin_name.to_string(),
            node_type,
            determinism,
            plugin_version: plugin_version.to_string(),
            config_hash,
            config_json,
            input_contract_json: None,
            output_contract_json: None,
            schema_hash: None,
            sequence_index: Some(sequence),
        })?;
        Ok(())
    }

    /// Streams the source, creating rows and walking tokens.
    async fn run_source_loop(
        &mut self,
        source_node: &NodeId,
        source: &mut dyn SourcePlugin,
        default_sink: &str,
    ) -> Result<(), EngineError> {
        let ctx = PluginContext {
            run_id: self.run_id.clone(),
            node_id: source_node.clone(),
            state_id: None,
            cancel: self.cancel.clone(),
        };
        let contract = source.output_contract().clone();
        let policy = source.on_validation_failure();
        let mut row_index: u64 = 0;
        let mut rows_since_checkpoint: u64 = 0;

        loop {
            if self.cancel.is_cancelled() {
                self.interrupt_buffered().await?;
                return Ok(());
            }
            let record = match source.next_record(&ctx) {
                Ok(Some(record)) => record,
                Ok(None) => break,
                Err(error) => {
                    return Err(EngineError::PluginCrash {
                        node_id: source_node.to_string(),
                        message: error.to_string(),
                    });
                }
            };
            match record {
                SourceRecord::Valid { data } => {
                    let row = PipelineRow::new(data, contract.clone());
                    let row_json = row.to_json_object();
                    let data_hash = stable_hash(&row_json)?;
                    let payload_ref =
                        self.payloads.store(row_json.to_string().as_bytes())?;
                    let (_, token) = self.tokens.create_row_with_token(
                        &self.run_id.clone(),
                        source_node,
                        row_index,
                        data_hash,
                        Some(payload_ref),
                    )?;
                    let token_id = token.token_id.clone();
                    self.walk_token(token, row, 0, default_sink.to_string()).await?;
                    rows_since_checkpoint += 1;
                    if self.options.checkpoint_interval > 0
                        && rows_since_checkpoint >= self.options.checkpoint_interval
                    {
                        self.checkpoints.create_checkpoint(
                            &self.run_id.clone(),
                            &token_id,
                            source_node,
                            row_index + 1,
                            &self.graph,
                            None,
                        )?;
                        rows_since_checkpoint = 0;
                    }
                }
                SourceRecord::Invalid { raw, message, field } => {
                    self.handle_invalid_record(
                        source_node,
                        row_index,
                        raw,
                        message,
                        field,
                        &policy,
                        &contract,
                    )
                    .await?;
                }
            }
            row_index += 1;
        }

        self.flush_all_aggregations(TriggerType::EndOfSource, default_sink).await?;
        self.drain_incomplete_coalesces()?;
        Ok(())
    }

    /// Processes recovered rows on resume, binding tokens to existing rows.
    async fn run_resume_loop(
        &mut self,
        source_node: &NodeId,
        rows: Vec<ResumeRow>,
        default_sink: &str,
    ) -> Result<(), EngineError> {
        let mut rows_since_checkpoint: u64 = 0;
        for recovered in rows {
            if self.cancel.is_cancelled() {
                self.interrupt_buffered().await?;
                return Ok(());
            }
            let token = TokenRecord {
                token_id: elspeth_core::TokenId::generate(),
                row_id: recovered.row_id.clone(),
                fork_group_id: None,
                join_group_id: None,
                expand_group_id: None,
                branch_name: None,
                step_in_pipeline: Some(0),
            };
            self.landscape.create_child_token(&token, &[])?;
            let token_id = token.token_id.clone();
            self.walk_token(token, recovered.row, 0, default_sink.to_string()).await?;
            rows_since_checkpoint += 1;
            if self.options.checkpoint_interval > 0
                && rows_since_checkpoint >= self.options.checkpoint_interval
            {
                self.checkpoints.create_checkpoint(
                    &self.run_id.clone(),
                    &token_id,
                    source_node,
                    recovered.row_index + 1,
                    &self.graph,
                    None,
                )?;
                rows_since_checkpoint = 0;
            }
        }
        self.flush_all_aggregations(TriggerType::EndOfSource, default_sink).await?;
        self.drain_incomplete_coalesces()?;
        Ok(())
    }

    /// Records a Tier-3 validation failure and applies the source policy.
    #[allow(
        clippy::too_many_arguments,
        reason = "The quarantine path needs the full row provenance in one place."
    )]
    async fn handle_invalid_record(
        &mut self,
        source_node: &NodeId,
        row_index: u64,
        raw: Value,
        message: String,
        field: Option<String>,
        policy: &ValidationPolicy,
        contract: &SchemaContract,
    ) -> Result<(), EngineError> {
        let (row_json, repr_fallback) = match stable_hash(&raw) {
            Ok(_) => (Some(raw.clone()), None),
            Err(error) => (None, Some(elspeth_core::repr_hash(&raw, &error))),
        };
        self.landscape.record_validation_error(&ValidationErrorRecord {
            run_id: self.run_id.clone(),
            node_id: source_node.clone(),
            row_index: Some(row_index),
            field,
            message,
            row_json,
            repr_fallback,
            recorded_at: Timestamp::now(),
        })?;

        match policy {
            ValidationPolicy::Discard => Ok(()),
            ValidationPolicy::Quarantine { sink_name } => {
                // Quarantined rows get a row and token so the audit can
                // account for them, then stop at the quarantine sink.
                let data_hash = stable_hash(&raw).unwrap_or_else(|_| {
                    elspeth_core::hash_bytes(format!("{raw}").as_bytes())
                });
                let (_, token) = self.tokens.create_row_with_token(
                    &self.run_id.clone(),
                    source_node,
                    row_index,
                    data_hash,
                    None,
                )?;
                let row = PipelineRow::from_json_object(&raw, contract.clone())
                    .unwrap_or_else(|_| PipelineRow::new(BTreeMap::new(), contract.clone()));
                self.write_to_sink(
                    &sink_name.clone(),
                    &token,
                    &row,
                    0,
                    TokenOutcome::Quarantined,
                    None,
                )
                .await
            }
        }
    }

    /// Walks one token from `start_step` to its terminal outcome.
    ///
    /// Boxed for recursion: forks, expansions, and joins walk children.
    fn walk_token(
        &mut self,
        token: TokenRecord,
        row: PipelineRow,
        start_step: usize,
        default_sink: String,
    ) -> Pin<Box<dyn Future<Output = Result<(), EngineError>> + '_>> {
        Box::pin(async move {
            let mut row = row;
            let mut index = start_step;
            let mut step_index: u32 = u32::try_from(start_step).unwrap_or(u32::MAX);
            while index < self.steps.len() {
                if self.cancel.is_cancelled() {
                    self.tokens.record_outcome(
                        &token.token_id,
                        TokenOutcome::Failed,
                        Some("run_interrupted".to_string()),
                    )?;
                    return Ok(());
                }
                let step = self.steps[index].clone();
                self.telemetry.handle_event(&TelemetryEvent::RowStarted {
                    run_id: self.run_id.clone(),
                    token_id: token.token_id.clone(),
                    node_id: step.node_id().clone(),
                })?;
                match step {
                    StepRuntime::Transform { node_id, plugin } => {
                        match self
                            .run_transform(&node_id, &plugin, &token, row.clone(), step_index)
                            .await?
                        {
                            TransformOutcome::Row(next) => {
                                row = next;
                                index += 1;
                                step_index += 1;
                            }
                            TransformOutcome::Expanded { rows, contract } => {
                                self.tokens.record_outcome(
                                    &token.token_id,
                                    TokenOutcome::Expanded,
                                    None,
                                )?;
                                let children = self.tokens.expand_children(
                                    std::slice::from_ref(&token),
                                    rows.len(),
                                    step_index + 1,
                                )?;
                                for (child, child_row) in children.into_iter().zip(rows) {
                                    let typed = child_row.with_contract(contract.clone());
                                    self.walk_token(child, typed, index + 1, default_sink.clone())
                                        .await?;
                                }
                                return Ok(());
                            }
                            TransformOutcome::Terminal => return Ok(()),
                        }
                    }
                    StepRuntime::Gate { node_id, plugin } => {
                        match self
                            .run_gate(&node_id, &plugin, &token, &row, step_index, &default_sink)
                            .await?
                        {
                            GateOutcome::Continue => {
                                index += 1;
                                step_index += 1;
                            }
                            GateOutcome::Jump(target) => {
                                index = target;
                                step_index += 1;
                            }
                            GateOutcome::Terminal => return Ok(()),
                        }
                    }
                    StepRuntime::Aggregation { node_id, plugin, output_mode } => {
                        self.accept_into_aggregation(
                            &node_id,
                            &plugin,
                            &token,
                            row.clone(),
                            step_index,
                            index,
                            output_mode,
                            &default_sink,
                        )
                        .await?;
                        return Ok(());
                    }
                    StepRuntime::Coalesce { node_id } => {
                        self.accept_into_coalesce(
                            &node_id,
                            &token,
                            row.clone(),
                            step_index,
                            index,
                            &default_sink,
                        )
                        .await?;
                        return Ok(());
                    }
                }
            }
            // Fell off the end of the pipeline: the default output sink.
            self.write_to_sink(
                &default_sink.clone(),
                &token,
                &row,
                step_index,
                TokenOutcome::Completed,
                None,
            )
            .await
        })
    }

    /// Runs a transform with retries; each attempt gets a fresh state.
    async fn run_transform(
        &mut self,
        node_id: &NodeId,
        plugin: &SharedTransform,
        token: &TokenRecord,
        row: PipelineRow,
        step_index: u32,
    ) -> Result<TransformOutcome, EngineError> {
        let attempt_counter = Arc::new(AtomicU32::new(0));
        let landscape = self.landscape.clone();
        let adapter = self.adapter.clone();
        let run_id = self.run_id.clone();
        let cancel = self.cancel.clone();
        let timeout = self.options.transform_timeout;
        let token_id = token.token_id.clone();
        let node = node_id.clone();
        let plugin = Arc::clone(plugin);
        let input_row = row;

        let op = move || {
            let landscape = landscape.clone();
            let adapter = adapter.clone();
            let run_id = run_id.clone();
            let cancel = cancel.clone();
            let token_id = token_id.clone();
            let node = node.clone();
            let plugin = Arc::clone(&plugin);
            let input_row = input_row.clone();
            let attempt_counter = Arc::clone(&attempt_counter);
            async move {
                let attempt = attempt_counter.fetch_add(1, Ordering::SeqCst);
                run_transform_attempt(
                    landscape, adapter, run_id, cancel, token_id, node, plugin, input_row,
                    step_index, attempt, timeout,
                )
                .await
            }
        };

        let result = self
            .retry
            .execute_with_retry(
                op,
                |failure: &AttemptFailure| failure.retryable,
                |attempt, failure| {
                    tracing::warn!(
                        node_id = %node_id,
                        attempt,
                        error = %failure,
                        "retrying transform after failure"
                    );
                },
            )
            .await;

        self.telemetry.handle_event(&TelemetryEvent::RowCompleted {
            run_id: self.run_id.clone(),
            token_id: token.token_id.clone(),
            node_id: node_id.clone(),
        })?;

        match result {
            Ok(TransformResult::Success { row, reason: _ }) => Ok(TransformOutcome::Row(row)),
            Ok(TransformResult::SuccessMulti { rows, reason: _, contract }) => {
                let Some(contract) = contract else {
                    // A multi-row result without its contract is a scheduler
                    // error: the state and token fail, the run continues.
                    tracing::error!(
                        node_id = %node_id,
                        "multi-row result arrived without a schema contract"
                    );
                    self.tokens.record_outcome(
                        &token.token_id,
                        TokenOutcome::Failed,
                        Some("multi_row_result_without_contract".to_string()),
                    )?;
                    return Ok(TransformOutcome::Terminal);
                };
                Ok(TransformOutcome::Expanded { rows, contract })
            }
            Ok(TransformResult::Error { .. }) => {
                // Attempts convert error results into failures; success with
                // an error variant cannot reach here.
                Ok(TransformOutcome::Terminal)
            }
            Err(RetryError::NonRetryable(failure) | RetryError::Exhausted { last_error: failure, .. }) => {
                self.fail_token_at_node(node_id, token, &failure).await?;
                Ok(TransformOutcome::Terminal)
            }
        }
    }

    /// Records the terminal disposition of a failed token, honoring divert
    /// edges to quarantine sinks.
    async fn fail_token_at_node(
        &mut self,
        node_id: &NodeId,
        token: &TokenRecord,
        failure: &AttemptFailure,
    ) -> Result<(), EngineError> {
        let divert_sink = self
            .graph
            .outgoing(node_id)
            .into_iter()
            .find(|edge| edge.mode == RoutingMode::Divert)
            .and_then(|edge| self.sink_names_by_node.get(&edge.to_node).cloned());
        match divert_sink {
            Some(_) => {
                self.tokens.record_outcome(
                    &token.token_id,
                    TokenOutcome::Quarantined,
                    Some(failure.message.clone()),
                )?;
            }
            None => {
                self.tokens.record_outcome(
                    &token.token_id,
                    TokenOutcome::Failed,
                    Some(failure.message.clone()),
                )?;
            }
        }
        Ok(())
    }

    /// Runs a gate: evaluates routing, records events, and resolves flow.
    #[allow(
        clippy::too_many_lines,
        reason = "Gate handling is one linear flow so routing events stay ordered with state updates."
    )]
    async fn run_gate(
        &mut self,
        node_id: &NodeId,
        plugin: &Arc<Mutex<Box<dyn GatePlugin>>>,
        token: &TokenRecord,
        row: &PipelineRow,
        step_index: u32,
        default_sink: &str,
    ) -> Result<GateOutcome, EngineError> {
        let state_id = StateId::generate();
        let started = Instant::now();
        let started_at = Timestamp::now();
        let input_json = row.to_json_object();
        let input_hash = stable_hash(&input_json)?;
        self.landscape.begin_node_state(&NodeState::Open {
            envelope: StateEnvelope {
                state_id: state_id.clone(),
                token_id: token.token_id.clone(),
                node_id: node_id.clone(),
                step_index,
                attempt: 0,
                input_hash: input_hash.clone(),
                started_at,
                context_before: None,
            },
        })?;

        let ctx = PluginContext {
            run_id: self.run_id.clone(),
            node_id: node_id.clone(),
            state_id: Some(state_id.clone()),
            cancel: self.cancel.clone(),
        };
        let action = {
            let mut guard = plugin.lock().map_err(|_| EngineError::PluginCrash {
                node_id: node_id.to_string(),
                message: "gate plugin mutex poisoned".to_string(),
            })?;
            guard.evaluate(row, &ctx)
        };
        let action = match action {
            Ok(action) => action,
            Err(error) => {
                self.complete_failed_state(
                    &state_id,
                    token,
                    node_id,
                    step_index,
                    0,
                    &input_hash,
                    started_at,
                    started,
                    &error.to_string(),
                )?;
                self.tokens.record_outcome(
                    &token.token_id,
                    TokenOutcome::Failed,
                    Some(error.to_string()),
                )?;
                return Ok(GateOutcome::Terminal);
            }
        };

        // Resolve destinations before any child is scheduled.
        let mut resolved: Vec<(String, RouteDestination, RoutingMode)> = Vec::new();
        match action.kind() {
            RoutingKind::Continue => {
                resolved.push(("continue".to_string(), RouteDestination::Continue, RoutingMode::Move));
            }
            RoutingKind::Route => {
                let label = action.destinations().first().cloned().unwrap_or_default();
                let destination = self
                    .graph
                    .resolve_route(node_id, &label)
                    .cloned()
                    .ok_or_else(|| EngineError::UnresolvedRoute {
                        gate: node_id.to_string(),
                        label: label.clone(),
                    })?;
                resolved.push((label, destination, RoutingMode::Move));
            }
            RoutingKind::ForkToPaths => {
                let mut labels: Vec<String> = action.destinations().to_vec();
                labels.sort();
                for label in labels {
                    let destination = self
                        .graph
                        .resolve_route(node_id, &label)
                        .cloned()
                        .unwrap_or(RouteDestination::Fork);
                    resolved.push((label, destination, RoutingMode::Copy));
                }
            }
        }

        // Routing events are durable before children are scheduled.
        let reason_payload = action
            .reason()
            .map(|reason| -> Result<(String, String), EngineError> {
                let hash = stable_hash(reason)?;
                let bytes = elspeth_core::canonical_json_bytes(reason)?;
                let reference = self.payloads.store(&bytes)?;
                Ok((hash, reference))
            })
            .transpose()?;
        let routing_group = GroupId::new(format!("route_{}", state_id.as_str()));
        let events: Vec<RoutingEventRecord> = resolved
            .iter()
            .enumerate()
            .map(|(ordinal, (label, destination, mode))| {
                let target = self.destination_node(node_id, label, destination);
                RoutingEventRecord {
                    event_id: RoutingEventId::generate(),
                    state_id: state_id.clone(),
                    edge_id: format!("{node_id}->{target}:{label}"),
                    routing_group_id: routing_group.clone(),
                    ordinal: u32::try_from(ordinal).unwrap_or(u32::MAX),
                    mode: *mode,
                    reason_hash: reason_payload.as_ref().map(|(hash, _)| hash.clone()),
                    reason_ref: reason_payload.as_ref().map(|(_, reference)| reference.clone()),
                }
            })
            .collect();
        self.landscape.record_routing_events(&events)?;

        self.complete_ok_state(
            &state_id,
            token,
            node_id,
            step_index,
            0,
            &input_hash,
            started_at,
            started,
            &input_hash,
            None,
        )?;

        // Act on the resolved destinations.
        match action.kind() {
            RoutingKind::Continue => Ok(GateOutcome::Continue),
            RoutingKind::Route => {
                let (label, destination, _) = resolved.remove(0);
                match destination {
                    RouteDestination::Continue => Ok(GateOutcome::Continue),
                    RouteDestination::Sink { sink_name } => {
                        self.write_to_sink(
                            &sink_name,
                            token,
                            row,
                            step_index + 1,
                            TokenOutcome::Routed,
                            Some(label),
                        )
                        .await?;
                        Ok(GateOutcome::Terminal)
                    }
                    RouteDestination::ProcessingNode { next_node_id } => self
                        .step_index_of(&next_node_id)
                        .map(GateOutcome::Jump)
                        .ok_or_else(|| EngineError::UnresolvedRoute {
                            gate: node_id.to_string(),
                            label,
                        }),
                    RouteDestination::Fork => Err(EngineError::UnresolvedRoute {
                        gate: node_id.to_string(),
                        label,
                    }),
                }
            }
            RoutingKind::ForkToPaths => {
                let branches: Vec<String> =
                    resolved.iter().map(|(label, _, _)| label.clone()).collect();
                let children = self.tokens.fork_children(token, &branches, step_index + 1)?;
                let branch_targets = self.graph.branch_target_map();
                // Pre-count join participants before any child is walked:
                // a child re-entering the processing spine counts toward
                // its group's join whether it lands on the coalesce
                // directly or flows into it through intermediate steps,
                // and an early arrival must never complete a group before
                // its siblings are dispatched.
                for child in &children {
                    let branch = child.branch_name.clone().unwrap_or_default();
                    let Some(target_node) = branch_targets.get(&branch) else {
                        continue;
                    };
                    if !self.sink_names_by_node.contains_key(target_node)
                        && self.step_index_of(target_node).is_some()
                    {
                        if let Some(group) = child.fork_group_id.as_ref() {
                            *self
                                .coalesce_expected
                                .entry(group.as_str().to_string())
                                .or_insert(0) += 1;
                        }
                    }
                }
                for child in children {
                    let branch = child.branch_name.clone().unwrap_or_default();
                    let target = branch_targets.get(&branch).cloned();
                    match target {
                        Some(target_node) => {
                            if let Some(sink_name) =
                                self.sink_names_by_node.get(&target_node).cloned()
                            {
                                let child_row = row.clone();
                                self.write_to_sink(
                                    &sink_name,
                                    &child,
                                    &child_row,
                                    step_index + 1,
                                    TokenOutcome::Completed,
                                    Some(branch),
                                )
                                .await?;
                            } else if let Some(target_step) = self.step_index_of(&target_node) {
                                self.walk_token(
                                    child,
                                    row.clone(),
                                    target_step,
                                    default_sink.to_string(),
                                )
                                .await?;
                            } else {
                                return Err(EngineError::UnresolvedRoute {
                                    gate: node_id.to_string(),
                                    label: branch,
                                });
                            }
                        }
                        None => {
                            return Err(EngineError::UnresolvedRoute {
                                gate: node_id.to_string(),
                                label: branch,
                            });
                        }
                    }
                }
                Ok(GateOutcome::Terminal)
            }
        }
    }

    /// Buffers a token into an aggregation and flushes when triggered.
    #[allow(
        clippy::too_many_arguments,
        reason = "Aggregation acceptance records state, membership, and outcome together."
    )]
    async fn accept_into_aggregation(
        &mut self,
        node_id: &NodeId,
        plugin: &SharedTransform,
        token: &TokenRecord,
        row: PipelineRow,
        step_index: u32,
        step_position: usize,
        output_mode: OutputMode,
        default_sink: &str,
    ) -> Result<(), EngineError> {
        let state_id = StateId::generate();
        let started = Instant::now();
        let started_at = Timestamp::now();
        let input_json = row.to_json_object();
        let input_hash = stable_hash(&input_json)?;
        self.landscape.begin_node_state(&NodeState::Open {
            envelope: StateEnvelope {
                state_id: state_id.clone(),
                token_id: token.token_id.clone(),
                node_id: node_id.clone(),
                step_index,
                attempt: 0,
                input_hash: input_hash.clone(),
                started_at,
                context_before: None,
            },
        })?;

        // Membership and the buffered outcome are recorded before the
        // trigger may fire.
        let batch_id = {
            let agg = self.aggregations.get_mut(node_id).ok_or_else(|| {
                EngineError::PluginCrash {
                    node_id: node_id.to_string(),
                    message: "aggregation runtime missing".to_string(),
                }
            })?;
            if agg.batch_id.is_none() {
                let batch = BatchRecord {
                    batch_id: BatchId::generate(),
                    run_id: self.run_id.clone(),
                    aggregation_node_id: node_id.clone(),
                    attempt: agg.attempt,
                    status: BatchStatus::Draft,
                    trigger_type: None,
                    created_at: Timestamp::now(),
                };
                self.landscape.create_batch(&batch)?;
                agg.batch_id = Some(batch.batch_id);
            }
            agg.batch_id.clone()
        };
        if let Some(batch_id) = &batch_id {
            let ordinal = self
                .aggregations
                .get(node_id)
                .map(|agg| u32::try_from(agg.members.len()).unwrap_or(u32::MAX))
                .unwrap_or(0);
            self.landscape.add_batch_member(&BatchMember {
                batch_id: batch_id.clone(),
                token_id: token.token_id.clone(),
                ordinal,
            })?;
        }
        self.tokens.record_outcome(&token.token_id, TokenOutcome::Buffered, None)?;
        self.complete_ok_state(
            &state_id,
            token,
            node_id,
            step_index,
            0,
            &input_hash,
            started_at,
            started,
            &input_hash,
            Some(SuccessReason { reason: "buffered".to_string(), metadata: None }),
        )?;

        let fired = {
            let agg = self.aggregations.get_mut(node_id).ok_or_else(|| {
                EngineError::PluginCrash {
                    node_id: node_id.to_string(),
                    message: "aggregation runtime missing".to_string(),
                }
            })?;
            agg.members.push((token.clone(), row));
            agg.evaluator.record_accept();
            match agg.evaluator.should_trigger() {
                Ok(fired) => fired.then(|| agg.evaluator.which_triggered()).flatten(),
                Err(error) => {
                    self.landscape.record_validation_error(&ValidationErrorRecord {
                        run_id: self.run_id.clone(),
                        node_id: node_id.clone(),
                        row_index: None,
                        field: None,
                        message: error.to_string(),
                        row_json: None,
                        repr_fallback: None,
                        recorded_at: Timestamp::now(),
                    })?;
                    None
                }
            }
        };
        if let Some(trigger) = fired {
            self.flush_aggregation(node_id, plugin, trigger, step_position, output_mode, default_sink)
                .await?;
        }
        Ok(())
    }

    /// Flushes one aggregation's draft batch.
    async fn flush_aggregation(
        &mut self,
        node_id: &NodeId,
        plugin: &SharedTransform,
        trigger: TriggerType,
        step_position: usize,
        output_mode: OutputMode,
        default_sink: &str,
    ) -> Result<(), EngineError> {
        let (batch_id, members) = {
            let Some(agg) = self.aggregations.get_mut(node_id) else {
                return Ok(());
            };
            let Some(batch_id) = agg.batch_id.take() else {
                return Ok(());
            };
            agg.attempt += 1;
            agg.evaluator.reset();
            (batch_id, std::mem::take(&mut agg.members))
        };
        if members.is_empty() {
            return Ok(());
        }
        self.landscape.set_batch_status(&batch_id, BatchStatus::Executing, Some(trigger))?;

        match output_mode {
            OutputMode::Passthrough => {
                for (member_token, member_row) in members {
                    self.walk_token(
                        member_token,
                        member_row,
                        step_position + 1,
                        default_sink.to_string(),
                    )
                    .await?;
                }
                self.landscape.set_batch_status(&batch_id, BatchStatus::Completed, None)?;
            }
            OutputMode::Transform => {
                let rows: Vec<PipelineRow> =
                    members.iter().map(|(_, row)| row.clone()).collect();
                let ctx = PluginContext {
                    run_id: self.run_id.clone(),
                    node_id: node_id.clone(),
                    state_id: None,
                    cancel: self.cancel.clone(),
                };
                let outcome = {
                    let plugin = Arc::clone(plugin);
                    catch_unwind(AssertUnwindSafe(|| {
                        plugin
                            .lock()
                            .map_err(|_| "aggregation plugin mutex poisoned".to_string())
                            .map(|mut guard| guard.process_batch(rows, &ctx))
                    }))
                };
                let result = match outcome {
                    Ok(Ok(result)) => result,
                    Ok(Err(message)) => {
                        return Err(EngineError::PluginCrash {
                            node_id: node_id.to_string(),
                            message,
                        });
                    }
                    Err(panic) => {
                        return Err(EngineError::PluginCrash {
                            node_id: node_id.to_string(),
                            message: render_panic(panic.as_ref()),
                        });
                    }
                };
                match result {
                    TransformResult::SuccessMulti { rows, reason: _, contract } => {
                        let Some(contract) = contract else {
                            tracing::error!(
                                node_id = %node_id,
                                "batch output arrived without a schema contract"
                            );
                            self.landscape.set_batch_status(
                                &batch_id,
                                BatchStatus::Failed,
                                None,
                            )?;
                            for (member_token, _) in &members {
                                self.tokens.record_outcome(
                                    &member_token.token_id,
                                    TokenOutcome::Failed,
                                    Some("multi_row_result_without_contract".to_string()),
                                )?;
                            }
                            return Ok(());
                        };
                        let member_tokens: Vec<TokenRecord> =
                            members.iter().map(|(token, _)| token.clone()).collect();
                        for (member_token, _) in &members {
                            self.tokens.record_outcome(
                                &member_token.token_id,
                                TokenOutcome::Expanded,
                                None,
                            )?;
                        }
                        let children = self.tokens.expand_children(
                            &member_tokens,
                            rows.len(),
                            u32::try_from(step_position + 1).unwrap_or(u32::MAX),
                        )?;
                        for (child, child_row) in children.into_iter().zip(rows) {
                            let typed = child_row.with_contract(contract.clone());
                            self.walk_token(
                                child,
                                typed,
                                step_position + 1,
                                default_sink.to_string(),
                            )
                            .await?;
                        }
                        self.landscape.set_batch_status(&batch_id, BatchStatus::Completed, None)?;
                    }
                    TransformResult::Success { row, reason: _ } => {
                        // Single-output aggregation: members are consumed.
                        let member_tokens: Vec<TokenRecord> =
                            members.iter().map(|(token, _)| token.clone()).collect();
                        for (member_token, _) in &members {
                            self.tokens.record_outcome(
                                &member_token.token_id,
                                TokenOutcome::ConsumedInBatch,
                                None,
                            )?;
                        }
                        let children = self.tokens.expand_children(
                            &member_tokens,
                            1,
                            u32::try_from(step_position + 1).unwrap_or(u32::MAX),
                        )?;
                        for child in children {
                            self.walk_token(
                                child,
                                row.clone(),
                                step_position + 1,
                                default_sink.to_string(),
                            )
                            .await?;
                        }
                        self.landscape.set_batch_status(&batch_id, BatchStatus::Completed, None)?;
                    }
                    TransformResult::Error { reason, retryable: _ } => {
                        self.landscape.set_batch_status(&batch_id, BatchStatus::Failed, None)?;
                        for (member_token, _) in &members {
                            self.tokens.record_outcome(
                                &member_token.token_id,
                                TokenOutcome::Failed,
                                Some(reason.reason.clone()),
                            )?;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Buffers a forked token into a coalesce and joins complete groups.
    ///
    /// Every arrival is recorded as `buffered` before the completeness
    /// check, so a token waiting for its siblings is never a silent drop;
    /// the join supersedes the marker with `coalesced`.
    async fn accept_into_coalesce(
        &mut self,
        node_id: &NodeId,
        token: &TokenRecord,
        row: PipelineRow,
        step_index: u32,
        step_position: usize,
        default_sink: &str,
    ) -> Result<(), EngineError> {
        let Some(group) = token.fork_group_id.clone() else {
            // A non-forked token passes straight through a coalesce.
            return self
                .walk_token(token.clone(), row, step_position + 1, default_sink.to_string())
                .await;
        };
        self.tokens.record_outcome(&token.token_id, TokenOutcome::Buffered, None)?;
        let group_key = group.as_str().to_string();
        let expected = self.coalesce_expected.get(&group_key).copied().unwrap_or(1);
        let complete = {
            let runtime = self.coalesces.entry(node_id.clone()).or_default();
            let bucket = runtime.arrived.entry(group_key.clone()).or_default();
            bucket.push((token.clone(), row));
            bucket.len() >= expected
        };
        if !complete {
            return Ok(());
        }
        let siblings = self
            .coalesces
            .get_mut(node_id)
            .and_then(|runtime| runtime.arrived.remove(&group_key))
            .unwrap_or_default();
        let tokens: Vec<TokenRecord> = siblings.iter().map(|(token, _)| token.clone()).collect();
        let joined = self.tokens.coalesce_join(&tokens, step_index + 1)?;
        let merged_row = merge_rows(siblings.into_iter().map(|(_, row)| row));
        self.walk_token(joined, merged_row, step_position + 1, default_sink.to_string()).await
    }

    /// Writes one row to a named sink, committing the artifact and outcome.
    async fn write_to_sink(
        &mut self,
        sink_name: &str,
        token: &TokenRecord,
        row: &PipelineRow,
        step_index: u32,
        outcome: TokenOutcome,
        branch_label: Option<String>,
    ) -> Result<(), EngineError> {
        let sink = self
            .sinks
            .get(sink_name)
            .ok_or_else(|| EngineError::UnknownSink(sink_name.to_string()))?;
        let node_id = sink.node_id.clone();
        let plugin = Arc::clone(&sink.plugin);

        let state_id = StateId::generate();
        let started = Instant::now();
        let started_at = Timestamp::now();
        let input_json = row.to_json_object();
        let input_hash = stable_hash(&input_json)?;
        self.landscape.begin_node_state(&NodeState::Open {
            envelope: StateEnvelope {
                state_id: state_id.clone(),
                token_id: token.token_id.clone(),
                node_id: node_id.clone(),
                step_index,
                attempt: 0,
                input_hash: input_hash.clone(),
                started_at,
                context_before: None,
            },
        })?;
        let ctx = PluginContext {
            run_id: self.run_id.clone(),
            node_id: node_id.clone(),
            state_id: Some(state_id.clone()),
            cancel: self.cancel.clone(),
        };
        let write_result = {
            let mut guard = plugin.lock().map_err(|_| EngineError::PluginCrash {
                node_id: node_id.to_string(),
                message: "sink plugin mutex poisoned".to_string(),
            })?;
            guard.write(std::slice::from_ref(row), &ctx)
        };
        match write_result {
            Ok(descriptor) => {
                self.landscape.record_artifact(&ArtifactRecord {
                    artifact_id: ArtifactId::generate(),
                    run_id: self.run_id.clone(),
                    node_id: node_id.clone(),
                    path_or_uri: descriptor.path_or_uri,
                    content_hash: descriptor.content_hash,
                    size_bytes: descriptor.size_bytes,
                    idempotency_key: descriptor.idempotency_key,
                    created_at: Timestamp::now(),
                })?;
                self.complete_ok_state(
                    &state_id,
                    token,
                    &node_id,
                    step_index,
                    0,
                    &input_hash,
                    started_at,
                    started,
                    &input_hash,
                    branch_label.map(|label| SuccessReason {
                        reason: "routed".to_string(),
                        metadata: Some(serde_json::json!({ "branch": label })),
                    }),
                )?;
                self.tokens.record_outcome(&token.token_id, outcome, None)?;
                self.telemetry.handle_event(&TelemetryEvent::TokenOutcomeRecorded {
                    run_id: self.run_id.clone(),
                    token_id: token.token_id.clone(),
                    outcome,
                })?;
                Ok(())
            }
            Err(error) => {
                self.complete_failed_state(
                    &state_id,
                    token,
                    &node_id,
                    step_index,
                    0,
                    &input_hash,
                    started_at,
                    started,
                    &error.to_string(),
                )?;
                self.tokens.record_outcome(
                    &token.token_id,
                    TokenOutcome::Failed,
                    Some(error.to_string()),
                )?;
                Ok(())
            }
        }
    }

    /// Flushes every aggregation with buffered members.
    async fn flush_all_aggregations(
        &mut self,
        trigger: TriggerType,
        default_sink: &str,
    ) -> Result<(), EngineError> {
        let pending: Vec<(usize, NodeId, SharedTransform, OutputMode)> = self
            .steps
            .iter()
            .enumerate()
            .filter_map(|(position, step)| match step {
                StepRuntime::Aggregation { node_id, plugin, output_mode } => {
                    let has_members = self
                        .aggregations
                        .get(node_id)
                        .is_some_and(|agg| !agg.members.is_empty());
                    has_members.then(|| {
                        (position, node_id.clone(), Arc::clone(plugin), *output_mode)
                    })
                }
                _ => None,
            })
            .collect();
        for (position, node_id, plugin, output_mode) in pending {
            self.flush_aggregation(&node_id, &plugin, trigger, position, output_mode, default_sink)
                .await?;
        }
        Ok(())
    }

    /// Gives buffered tokens their terminal outcome before an interrupt.
    ///
    /// Both kinds of waiting tokens are swept: aggregation members that
    /// never flushed and coalesce arrivals still waiting for siblings.
    async fn interrupt_buffered(&mut self) -> Result<(), EngineError> {
        let buffered: Vec<TokenRecord> = self
            .aggregations
            .values_mut()
            .flat_map(|agg| std::mem::take(&mut agg.members))
            .map(|(token, _)| token)
            .collect();
        for token in buffered {
            self.tokens.record_outcome(
                &token.token_id,
                TokenOutcome::Failed,
                Some("run_interrupted_before_flush".to_string()),
            )?;
        }
        let parked: Vec<TokenRecord> = self
            .coalesces
            .values_mut()
            .flat_map(|runtime| std::mem::take(&mut runtime.arrived))
            .flat_map(|(_, siblings)| siblings)
            .map(|(token, _)| token)
            .collect();
        for token in parked {
            self.tokens.record_outcome(
                &token.token_id,
                TokenOutcome::Failed,
                Some("run_interrupted_before_join".to_string()),
            )?;
        }
        Ok(())
    }

    /// Fails coalesce arrivals whose siblings never made it to the join.
    ///
    /// Runs after the source is exhausted and every aggregation flushed: a
    /// group still waiting at that point lost a sibling to a terminal
    /// outcome upstream and can never complete.
    fn drain_incomplete_coalesces(&mut self) -> Result<(), EngineError> {
        let parked: Vec<TokenRecord> = self
            .coalesces
            .values_mut()
            .flat_map(|runtime| std::mem::take(&mut runtime.arrived))
            .flat_map(|(_, siblings)| siblings)
            .map(|(token, _)| token)
            .collect();
        for token in parked {
            self.tokens.record_outcome(
                &token.token_id,
                TokenOutcome::Failed,
                Some("coalesce_group_incomplete".to_string()),
            )?;
        }
        Ok(())
    }

    /// Flushes and closes every sink; failures are logged.
    fn close_sinks(&mut self) {
        for (name, sink) in &self.sinks {
            if let Ok(mut guard) = sink.plugin.lock() {
                if let Err(error) = guard.flush() {
                    tracing::warn!(sink = name.as_str(), error = %error, "sink flush failed");
                }
                if let Err(error) = guard.close() {
                    tracing::warn!(sink = name.as_str(), error = %error, "sink close failed");
                }
            }
        }
    }

    /// Finds the step position of a node, when it is a processing step.
    fn step_index_of(&self, node_id: &NodeId) -> Option<usize> {
        self.steps.iter().position(|step| step.node_id() == node_id)
    }

    /// Renders the concrete target node of a resolved destination.
    fn destination_node(
        &self,
        gate: &NodeId,
        label: &str,
        destination: &RouteDestination,
    ) -> String {
        match destination {
            RouteDestination::Continue => self
                .graph
                .continue_target(gate)
                .map_or_else(|| "end".to_string(), ToString::to_string),
            RouteDestination::Fork => self
                .graph
                .branch_target_map()
                .get(label)
                .map_or_else(|| "fork".to_string(), ToString::to_string),
            RouteDestination::Sink { sink_name } => self
                .sinks
                .get(sink_name)
                .map_or_else(|| sink_name.clone(), |sink| sink.node_id.to_string()),
            RouteDestination::ProcessingNode { next_node_id } => next_node_id.to_string(),
        }
    }

    /// Completes a state as COMPLETED.
    #[allow(
        clippy::too_many_arguments,
        reason = "State completion mirrors the audit row's column set."
    )]
    fn complete_ok_state(
        &self,
        state_id: &StateId,
        token: &TokenRecord,
        node_id: &NodeId,
        step_index: u32,
        attempt: u32,
        input_hash: &str,
        started_at: Timestamp,
        started: Instant,
        output_hash: &str,
        success_reason: Option<SuccessReason>,
    ) -> Result<(), EngineError> {
        self.landscape.complete_node_state(&NodeState::Completed {
            envelope: StateEnvelope {
                state_id: state_id.clone(),
                token_id: token.token_id.clone(),
                node_id: node_id.clone(),
                step_index,
                attempt,
                input_hash: input_hash.to_string(),
                started_at,
                context_before: None,
            },
            output_hash: output_hash.to_string(),
            completed_at: Timestamp::now(),
            duration_ms: i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX),
            success_reason,
            context_after: None,
        })?;
        Ok(())
    }

    /// Completes a state as FAILED.
    #[allow(
        clippy::too_many_arguments,
        reason = "State completion mirrors the audit row's column set."
    )]
    fn complete_failed_state(
        &self,
        state_id: &StateId,
        token: &TokenRecord,
        node_id: &NodeId,
        step_index: u32,
        attempt: u32,
        input_hash: &str,
        started_at: Timestamp,
        started: Instant,
        message: &str,
    ) -> Result<(), EngineError> {
        self.landscape.complete_node_state(&NodeState::Failed {
            envelope: StateEnvelope {
                state_id: state_id.clone(),
                token_id: token.token_id.clone(),
                node_id: node_id.clone(),
                step_index,
                attempt,
                input_hash: input_hash.to_string(),
                started_at,
                context_before: None,
            },
            completed_at: Timestamp::now(),
            duration_ms: i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX),
            error: Some(ExecutionError {
                message: message.to_string(),
                kind: "execution_error".to_string(),
                traceback: None,
            }),
            output_hash: None,
        })?;
        Ok(())
    }
}

// ============================================================================
// SECTION: Attempt Execution
// ============================================================================

/// Outcome classification for a transform visit.
enum TransformOutcome {
    /// Single-row output; the token continues.
    Row(PipelineRow),
    /// Multi-row output; the token expanded.
    Expanded {
        /// Output rows.
        rows: Vec<PipelineRow>,
        /// Union contract covering the outputs.
        contract: SchemaContract,
    },
    /// The token reached a terminal disposition at this node.
    Terminal,
}

/// Outcome classification for a gate visit.
enum GateOutcome {
    /// Continue to the next step.
    Continue,
    /// Jump to a specific step position.
    Jump(usize),
    /// The token reached a terminal disposition at this node.
    Terminal,
}

/// Runs one transform attempt: OPEN state, worker dispatch, terminal state.
#[allow(
    clippy::too_many_arguments,
    reason = "Each attempt owns cloned handles so retries never share state ids."
)]
async fn run_transform_attempt(
    landscape: Landscape,
    adapter: SharedBatchAdapter,
    run_id: RunId,
    cancel: CancelFlag,
    token_id: elspeth_core::TokenId,
    node_id: NodeId,
    plugin: SharedTransform,
    row: PipelineRow,
    step_index: u32,
    attempt: u32,
    timeout: Duration,
) -> Result<TransformResult, AttemptFailure> {
    let state_id = StateId::generate();
    let started = Instant::now();
    let started_at = Timestamp::now();
    let input_json = row.to_json_object();
    let input_hash = stable_hash(&input_json).map_err(|err| AttemptFailure {
        message: err.to_string(),
        retryable: false,
        reason: None,
    })?;
    let envelope = StateEnvelope {
        state_id: state_id.clone(),
        token_id: token_id.clone(),
        node_id: node_id.clone(),
        step_index,
        attempt,
        input_hash: input_hash.clone(),
        started_at,
        context_before: None,
    };
    landscape
        .begin_node_state(&NodeState::Open { envelope: envelope.clone() })
        .map_err(|err| AttemptFailure { message: err.to_string(), retryable: false, reason: None })?;

    // Dispatch to a blocking worker; the adapter routes the result back by
    // (token_id, state_id), so a stale result from a timed-out attempt is
    // discarded rather than delivered to a retry.
    let waiter = adapter.register(token_id.clone(), state_id.clone());
    {
        let adapter = adapter.clone();
        let worker_token = token_id.clone();
        let worker_state = state_id.clone();
        let ctx = PluginContext {
            run_id: run_id.clone(),
            node_id: node_id.clone(),
            state_id: Some(state_id.clone()),
            cancel,
        };
        tokio::task::spawn_blocking(move || {
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                plugin
                    .lock()
                    .map_err(|_| "transform plugin mutex poisoned".to_string())
                    .map(|mut guard| guard.process(row, &ctx))
            }));
            let delivered = match outcome {
                Ok(Ok(result)) => WorkerResult::Finished(result),
                Ok(Err(message)) => WorkerResult::Crashed(message),
                Err(panic) => WorkerResult::Crashed(render_panic(&panic)),
            };
            adapter.emit(&worker_token, Some(&worker_state), delivered);
        });
    }

    let waited = waiter.wait(timeout).await;
    let duration_ms = i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX);
    match waited {
        Ok(result @ (TransformResult::Success { .. } | TransformResult::SuccessMulti { .. })) => {
            let output_hash = output_hash_of(&result).unwrap_or_else(|| input_hash.clone());
            landscape
                .complete_node_state(&NodeState::Completed {
                    envelope,
                    output_hash,
                    completed_at: Timestamp::now(),
                    duration_ms,
                    success_reason: success_reason_of(&result),
                    context_after: None,
                })
                .map_err(|err| AttemptFailure {
                    message: err.to_string(),
                    retryable: false,
                    reason: None,
                })?;
            Ok(result)
        }
        Ok(TransformResult::Error { reason, retryable }) => {
            landscape
                .record_transform_error(&TransformErrorRecord {
                    run_id: run_id.clone(),
                    node_id: node_id.clone(),
                    token_id: token_id.clone(),
                    state_id: state_id.clone(),
                    reason: reason.clone(),
                    retryable,
                    recorded_at: Timestamp::now(),
                })
                .ok();
            fail_state(&landscape, envelope, duration_ms, &reason.reason);
            Err(AttemptFailure {
                message: reason
                    .message
                    .clone()
                    .unwrap_or_else(|| reason.reason.clone()),
                retryable,
                reason: Some(reason),
            })
        }
        Err(WaitError::Timeout { timeout_secs, .. }) => {
            fail_state(&landscape, envelope, duration_ms, "transform timeout");
            Err(AttemptFailure {
                message: format!("transform timed out after {timeout_secs}s"),
                retryable: true,
                reason: None,
            })
        }
        Err(WaitError::WorkerCrashed(message)) => {
            fail_state(&landscape, envelope, duration_ms, &message);
            Err(AttemptFailure { message, retryable: false, reason: None })
        }
        Err(WaitError::Cleared(message)) => {
            fail_state(&landscape, envelope, duration_ms, "adapter cleared");
            Err(AttemptFailure { message, retryable: false, reason: None })
        }
    }
}

/// Completes a state as FAILED, swallowing store errors in the failure path.
fn fail_state(landscape: &Landscape, envelope: StateEnvelope, duration_ms: i64, message: &str) {
    let result = landscape.complete_node_state(&NodeState::Failed {
        envelope,
        completed_at: Timestamp::now(),
        duration_ms,
        error: Some(ExecutionError {
            message: message.to_string(),
            kind: "execution_error".to_string(),
            traceback: None,
        }),
        output_hash: None,
    });
    if let Err(error) = result {
        tracing::error!(error = %error, "failed to record FAILED state");
    }
}

/// Computes the output hash of a successful result.
fn output_hash_of(result: &TransformResult) -> Option<String> {
    match result {
        TransformResult::Success { row, .. } => stable_hash(&row.to_json_object()).ok(),
        TransformResult::SuccessMulti { rows, .. } => {
            let projected: Vec<Value> = rows.iter().map(PipelineRow::to_json_object).collect();
            stable_hash(&projected).ok()
        }
        TransformResult::Error { .. } => None,
    }
}

/// Extracts the success reason of a successful result.
fn success_reason_of(result: &TransformResult) -> Option<SuccessReason> {
    match result {
        TransformResult::Success { reason, .. }
        | TransformResult::SuccessMulti { reason, .. } => reason.clone(),
        TransformResult::Error { .. } => None,
    }
}

/// Renders a panic payload for the crash path.
fn render_panic(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "plugin panicked".to_string())
}

/// Merges sibling rows field-wise; the first sibling wins on conflicts.
fn merge_rows<I: Iterator<Item = PipelineRow>>(mut rows: I) -> PipelineRow {
    let Some(first) = rows.next() else {
        return PipelineRow::new(BTreeMap::new(), SchemaContract::empty_observed());
    };
    let mut merged = first;
    for row in rows {
        for name in row.field_names().map(ToString::to_string).collect::<Vec<_>>() {
            if !merged.contains_field(&name) {
                if let Some(value) = row.get(&name) {
                    merged.insert(&name, value.clone());
                }
            }
        }
    }
    merged
}
