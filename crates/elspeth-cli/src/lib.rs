// elspeth-cli/src/lib.rs
// ============================================================================
// Module: ELSPETH CLI Library
// Description: Command implementations behind the elspeth binary.
// Purpose: Validate settings, execute and resume runs, replay and verify
//          recorded runs, and migrate the Landscape schema.
// Dependencies: elspeth-{config, core, engine, landscape}
// ============================================================================

//! ## Overview
//! The binary is a thin shell over this library. Commands return
//! [`CommandOutcome`] with the user-facing report lines and an exit code:
//! 0 for success, 1 for configuration errors, 2 for runtime failures, and
//! 3 for an incompatible checkpoint. Concrete plugins are external
//! collaborators: callers embed the engine by handing the CLI a
//! [`PluginRegistry`] that instantiates their sources, transforms, gates,
//! and sinks by name.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;

use elspeth_config::PipelineLayout;
use elspeth_config::Settings;
use elspeth_config::StepKind;
use elspeth_core::CancelFlag;
use elspeth_core::RetryConfig;
use elspeth_core::RetryManager;
use elspeth_core::RunId;
use elspeth_core::RunMode;
use elspeth_core::TriggerConfig;
use elspeth_core::interfaces::GatePlugin;
use elspeth_core::interfaces::PayloadStore;
use elspeth_core::interfaces::SinkPlugin;
use elspeth_core::interfaces::SourcePlugin;
use elspeth_core::interfaces::TransformPlugin;
use elspeth_core::telemetry::TelemetryConfig;
use elspeth_core::telemetry::TelemetryManager;
use elspeth_engine::CheckpointError;
use elspeth_engine::PipelinePlan;
use elspeth_engine::PlanStep;
use elspeth_engine::Processor;
use elspeth_engine::ProcessorOptions;
use elspeth_engine::RecoveryManager;
use elspeth_engine::ResumeRow;
use elspeth_engine::SinkBinding;
use elspeth_landscape::FilesystemPayloadStore;
use elspeth_landscape::Landscape;
use serde_json::Value;
use thiserror::Error;

// ============================================================================
// SECTION: Exit Codes
// ============================================================================

/// Exit code for success.
pub const EXIT_OK: u8 = 0;
/// Exit code for configuration errors.
pub const EXIT_CONFIG: u8 = 1;
/// Exit code for runtime failures.
pub const EXIT_RUNTIME: u8 = 2;
/// Exit code for incompatible checkpoints.
pub const EXIT_INCOMPATIBLE_CHECKPOINT: u8 = 3;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors raised by CLI commands.
#[derive(Debug, Error)]
pub enum CliError {
    /// Settings or pipeline configuration is invalid.
    #[error("{0}")]
    Config(String),
    /// The run failed at runtime.
    #[error("{0}")]
    Runtime(String),
    /// The checkpoint cannot be resumed.
    #[error("{0}")]
    IncompatibleCheckpoint(String),
}

impl CliError {
    /// Maps the error to its process exit code.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::Config(_) => EXIT_CONFIG,
            Self::Runtime(_) => EXIT_RUNTIME,
            Self::IncompatibleCheckpoint(_) => EXIT_INCOMPATIBLE_CHECKPOINT,
        }
    }
}

/// Report lines produced by a successful command.
#[derive(Debug, Clone, Default)]
pub struct CommandOutcome {
    /// User-facing report lines.
    pub lines: Vec<String>,
}

// ============================================================================
// SECTION: Plugin Registry
// ============================================================================

/// Factory surface embedding applications implement to supply plugins.
pub trait PluginRegistry {
    /// Instantiates a source plugin by name.
    fn create_source(&self, name: &str, config: &Value) -> Option<Box<dyn SourcePlugin>>;

    /// Instantiates a transform plugin by name.
    fn create_transform(&self, name: &str, config: &Value) -> Option<Box<dyn TransformPlugin>>;

    /// Instantiates a gate plugin by name.
    fn create_gate(&self, name: &str, config: &Value) -> Option<Box<dyn GatePlugin>>;

    /// Instantiates a sink plugin by name.
    fn create_sink(&self, name: &str, config: &Value) -> Option<Box<dyn SinkPlugin>>;
}

/// A registry that knows no plugins; `validate` works, `run` reports the
/// missing plugins as configuration errors.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyRegistry;

impl PluginRegistry for EmptyRegistry {
    fn create_source(&self, _name: &str, _config: &Value) -> Option<Box<dyn SourcePlugin>> {
        None
    }

    fn create_transform(&self, _name: &str, _config: &Value) -> Option<Box<dyn TransformPlugin>> {
        None
    }

    fn create_gate(&self, _name: &str, _config: &Value) -> Option<Box<dyn GatePlugin>> {
        None
    }

    fn create_sink(&self, _name: &str, _config: &Value) -> Option<Box<dyn SinkPlugin>> {
        None
    }
}

// ============================================================================
// SECTION: Validate
// ============================================================================

/// Validates settings and reports graph shape.
///
/// Plugin-dependent checks (batch-awareness of aggregations, contract
/// compatibility between connected nodes) run for every plugin the registry
/// can instantiate.
///
/// # Errors
///
/// Returns [`CliError::Config`] listing every problem found.
pub fn cmd_validate(
    settings: &Settings,
    registry: &dyn PluginRegistry,
) -> Result<CommandOutcome, CliError> {
    settings.validate().map_err(|err| CliError::Config(err.to_string()))?;
    let layout = plan_layout(&RunId::new("run_validate"), settings)?;

    let mut problems: Vec<String> = Vec::new();
    let mut previous_output = registry
        .create_source(&settings.pipeline.source.plugin, &settings.pipeline.source.config)
        .map(|source| source.output_contract().clone());
    for step in &settings.pipeline.steps {
        let Some(plugin_name) = step.plugin.as_deref() else {
            continue;
        };
        match step.kind {
            StepKind::Transform | StepKind::Aggregation => {
                let Some(plugin) = registry.create_transform(plugin_name, &step.config) else {
                    continue;
                };
                if step.kind == StepKind::Aggregation && !plugin.is_batch_aware() {
                    problems.push(format!(
                        "step '{}': plugin '{plugin_name}' is not batch-aware and cannot \
                         serve an aggregation node",
                        step.name
                    ));
                }
                if let Some(upstream) = &previous_output {
                    let compatibility = upstream.is_compatible_with(plugin.input_contract());
                    if let Some(message) = compatibility.error_message() {
                        problems.push(format!(
                            "step '{}': schema contract incompatible with upstream: {message}",
                            step.name
                        ));
                    }
                }
                previous_output = Some(plugin.output_contract().clone());
            }
            StepKind::Gate => {
                if let Some(plugin) = registry.create_gate(plugin_name, &step.config) {
                    if let Some(upstream) = &previous_output {
                        let compatibility = upstream.is_compatible_with(plugin.input_contract());
                        if let Some(message) = compatibility.error_message() {
                            problems.push(format!(
                                "step '{}': schema contract incompatible with upstream: {message}",
                                step.name
                            ));
                        }
                    }
                }
            }
            StepKind::Coalesce => {}
        }
    }
    if !problems.is_empty() {
        return Err(CliError::Config(format!(
            "pipeline is invalid:\n  - {}",
            problems.join("\n  - ")
        )));
    }

    Ok(CommandOutcome {
        lines: vec![
            "settings are valid".to_string(),
            format!("graph: {} nodes, {} edges", layout.graph.node_count(), layout.graph.edge_count()),
        ],
    })
}

// ============================================================================
// SECTION: Run / Replay / Verify
// ============================================================================

/// Executes a pipeline in the requested mode.
///
/// # Errors
///
/// Returns [`CliError`] with the failing node and remediation when the
/// plan cannot be built or the run fails.
pub async fn cmd_run(
    settings: &Settings,
    registry: &dyn PluginRegistry,
    run_mode: RunMode,
    source_run_id: Option<RunId>,
) -> Result<CommandOutcome, CliError> {
    settings.validate().map_err(|err| CliError::Config(err.to_string()))?;
    let run_id = RunId::generate();
    let (mut processor, plan) =
        assemble(settings, registry, &run_id, run_mode, source_run_id, false, None)?;
    let report = processor
        .execute(plan)
        .await
        .map_err(|err| CliError::Runtime(err.to_string()))?;
    record_run_bookkeeping(settings, &report)?;
    let mut lines = vec![
        format!("run {} finished: {}", report.run_id, report.status.as_str()),
        format!(
            "rows={} tokens={} states={} artifacts={}",
            report.summary.rows,
            report.summary.tokens,
            report.summary.node_states,
            report.summary.artifacts
        ),
    ];
    for (outcome, count) in &report.outcome_counts {
        lines.push(format!("outcome {outcome}: {count}"));
    }
    Ok(CommandOutcome { lines })
}

/// Resumes an interrupted run from its latest checkpoint.
///
/// # Errors
///
/// Returns [`CliError::IncompatibleCheckpoint`] when the graph changed at
/// the checkpoint node, [`CliError`] otherwise.
pub async fn cmd_resume(
    settings: &Settings,
    registry: &dyn PluginRegistry,
    run_id: &RunId,
) -> Result<CommandOutcome, CliError> {
    settings.validate().map_err(|err| CliError::Config(err.to_string()))?;
    let landscape = open_landscape(settings)?;
    let payloads = open_payloads(settings)?;
    let layout = plan_layout(run_id, settings)?;
    let recovery = RecoveryManager::new(landscape.clone());

    let checkpoint = recovery
        .latest_checkpoint(run_id)
        .map_err(map_checkpoint_error)?
        .ok_or_else(|| CliError::Runtime(format!("run {run_id} has no checkpoint to resume")))?;
    recovery
        .validate_compatibility(&checkpoint, &layout.graph)
        .map_err(map_checkpoint_error)?;
    let contract = settings.source_contract().map_err(|err| CliError::Config(err.to_string()))?;
    let recovered = recovery
        .unprocessed_rows(run_id, &checkpoint, &payloads, Some(&contract))
        .map_err(map_checkpoint_error)?;
    let checkpoint_row = landscape
        .row_for_token(&checkpoint.token_id)
        .map_err(|err| CliError::Runtime(err.to_string()))?
        .ok_or_else(|| CliError::Runtime("checkpoint token has no row".to_string()))?;
    let pending_rows = landscape
        .rows_after(run_id, checkpoint_row.row_index)
        .map_err(|err| CliError::Runtime(err.to_string()))?;
    let resume_rows: Vec<ResumeRow> = recovered
        .iter()
        .filter_map(|recovered_row| {
            pending_rows
                .iter()
                .find(|row| row.row_index == recovered_row.row_index)
                .map(|row| ResumeRow {
                    row_id: row.row_id.clone(),
                    row_index: recovered_row.row_index,
                    row: recovered_row.row.clone(),
                })
        })
        .collect();
    let pending = resume_rows.len();

    let (mut processor, plan) = assemble(
        settings,
        registry,
        run_id,
        RunMode::Live,
        None,
        true,
        Some(resume_rows),
    )?;
    let report = processor
        .execute(plan)
        .await
        .map_err(|err| CliError::Runtime(err.to_string()))?;
    Ok(CommandOutcome {
        lines: vec![
            format!(
                "resumed run {} from checkpoint sequence {}",
                run_id, checkpoint.sequence_number
            ),
            format!("reprocessed {pending} rows; final status {}", report.status.as_str()),
        ],
    })
}

/// Records the signing-key resolution and the run operation row.
///
/// The signing key is read from the configured variable only to note
/// whether it resolved; the value itself never reaches the audit trail.
fn record_run_bookkeeping(
    settings: &Settings,
    report: &elspeth_engine::RunReport,
) -> Result<(), CliError> {
    let landscape = open_landscape(settings)?;
    let signing_var = &settings.environment.signing_key_env;
    let resolved = std::env::var(signing_var).is_ok();
    let now = elspeth_core::Timestamp::now();
    landscape
        .record_secret_resolution(&report.run_id, "signing_key", signing_var, resolved, now)
        .map_err(|err| CliError::Runtime(err.to_string()))?;
    landscape
        .record_operation(
            &report.run_id,
            "run",
            report.status.as_str(),
            None,
            now,
        )
        .map_err(|err| CliError::Runtime(err.to_string()))?;
    Ok(())
}

/// Runs Landscape schema creation or the schema guard.
///
/// # Errors
///
/// Returns [`CliError::Runtime`] carrying the full guard problem list.
pub fn cmd_migrate(settings: &Settings) -> Result<CommandOutcome, CliError> {
    let landscape = open_landscape(settings)?;
    let path = landscape
        .path()
        .map_or_else(|| "(in-memory)".to_string(), |path| path.display().to_string());
    Ok(CommandOutcome {
        lines: vec![format!("landscape schema is current at {path}")],
    })
}

// ============================================================================
// SECTION: Assembly
// ============================================================================

/// Opens the configured Landscape store.
fn open_landscape(settings: &Settings) -> Result<Landscape, CliError> {
    Landscape::open(&settings.landscape.database_path)
        .map_err(|err| CliError::Runtime(err.to_string()))
}

/// Opens the configured payload store.
fn open_payloads(settings: &Settings) -> Result<Arc<dyn PayloadStore>, CliError> {
    let store = FilesystemPayloadStore::open(&settings.landscape.payload_dir)
        .map_err(|err| CliError::Runtime(err.to_string()))?;
    Ok(Arc::new(store))
}

/// Plans the execution graph for a run.
fn plan_layout(run_id: &RunId, settings: &Settings) -> Result<PipelineLayout, CliError> {
    elspeth_config::build_layout(run_id, settings)
        .map_err(|err| CliError::Config(err.to_string()))
}

/// Maps checkpoint errors to their CLI error class.
fn map_checkpoint_error(error: CheckpointError) -> CliError {
    match error {
        CheckpointError::Incompatible { .. } => {
            CliError::IncompatibleCheckpoint(error.to_string())
        }
        other => CliError::Runtime(other.to_string()),
    }
}

/// Builds the processor and plan for a run.
#[allow(
    clippy::too_many_arguments,
    reason = "Assembly threads every runtime collaborator through one place."
)]
fn assemble(
    settings: &Settings,
    registry: &dyn PluginRegistry,
    run_id: &RunId,
    run_mode: RunMode,
    source_run_id: Option<RunId>,
    resume: bool,
    resume_rows: Option<Vec<ResumeRow>>,
) -> Result<(Processor, PipelinePlan), CliError> {
    let landscape = open_landscape(settings)?;
    let payloads = open_payloads(settings)?;
    let layout = plan_layout(run_id, settings)?;

    let mut problems: Vec<String> = Vec::new();
    let source = registry
        .create_source(&settings.pipeline.source.plugin, &settings.pipeline.source.config);
    if source.is_none() {
        problems.push(format!(
            "unknown source plugin '{}'; register it with the embedding application",
            settings.pipeline.source.plugin
        ));
    }

    let mut steps: Vec<PlanStep> = Vec::new();
    for (step, (_, node_id)) in settings.pipeline.steps.iter().zip(&layout.step_nodes) {
        match step.kind {
            StepKind::Transform => {
                let plugin = step
                    .plugin
                    .as_deref()
                    .and_then(|name| registry.create_transform(name, &step.config));
                match plugin {
                    Some(plugin) => {
                        steps.push(PlanStep::Transform { node_id: node_id.clone(), plugin });
                    }
                    None => problems.push(format!(
                        "step '{}': unknown transform plugin '{}'",
                        step.name,
                        step.plugin.as_deref().unwrap_or("<missing>")
                    )),
                }
            }
            StepKind::Gate => {
                let plugin = step
                    .plugin
                    .as_deref()
                    .and_then(|name| registry.create_gate(name, &step.config));
                match plugin {
                    Some(plugin) => {
                        steps.push(PlanStep::Gate { node_id: node_id.clone(), plugin });
                    }
                    None => problems.push(format!(
                        "step '{}': unknown gate plugin '{}'",
                        step.name,
                        step.plugin.as_deref().unwrap_or("<missing>")
                    )),
                }
            }
            StepKind::Aggregation => {
                let plugin = step
                    .plugin
                    .as_deref()
                    .and_then(|name| registry.create_transform(name, &step.config));
                match plugin {
                    Some(plugin) => {
                        let trigger = step.trigger.clone().unwrap_or(TriggerConfig {
                            count: None,
                            timeout_seconds: None,
                            condition: None,
                        });
                        let output_mode = match step.output_mode {
                            Some(elspeth_config::OutputModeSettings::Transform) => {
                                elspeth_core::OutputMode::Transform
                            }
                            _ => elspeth_core::OutputMode::Passthrough,
                        };
                        steps.push(PlanStep::Aggregation {
                            node_id: node_id.clone(),
                            plugin,
                            trigger,
                            output_mode,
                        });
                    }
                    None => problems.push(format!(
                        "step '{}': unknown aggregation plugin '{}'",
                        step.name,
                        step.plugin.as_deref().unwrap_or("<missing>")
                    )),
                }
            }
            StepKind::Coalesce => {
                steps.push(PlanStep::Coalesce { node_id: node_id.clone() });
            }
        }
    }

    let mut sinks: Vec<SinkBinding> = Vec::new();
    for (name, sink) in &settings.pipeline.sinks {
        let Some(node_id) = layout.sink_nodes.get(name).cloned() else {
            continue;
        };
        match registry.create_sink(&sink.plugin, &sink.config) {
            Some(plugin) => sinks.push(SinkBinding { name: name.clone(), node_id, plugin }),
            None => problems.push(format!(
                "sink '{name}': unknown sink plugin '{}'",
                sink.plugin
            )),
        }
    }

    if !problems.is_empty() {
        return Err(CliError::Config(format!(
            "cannot assemble pipeline:\n  - {}",
            problems.join("\n  - ")
        )));
    }
    let Some(source) = source else {
        return Err(CliError::Config("source plugin missing".to_string()));
    };

    let retry_settings = &settings.runtime.retry;
    let retry_config = RetryConfig::new(
        retry_settings.max_attempts,
        retry_settings.base_delay,
        retry_settings.max_delay,
        retry_settings.jitter,
        retry_settings.exponential_base,
    )
    .map_err(|err| CliError::Config(err.to_string()))?;

    let telemetry = TelemetryManager::new(
        TelemetryConfig {
            granularity: settings.runtime.telemetry.granularity,
            fail_on_total_exporter_failure: settings
                .runtime
                .telemetry
                .fail_on_total_exporter_failure,
        },
        Vec::new(),
    );

    let options = ProcessorOptions {
        transform_timeout: std::time::Duration::from_secs_f64(
            settings.runtime.transform_timeout_seconds.max(0.001),
        ),
        checkpoint_interval: settings.runtime.checkpoint_interval,
    };
    let processor = Processor::new(
        landscape,
        payloads,
        telemetry,
        RetryManager::new(retry_config),
        CancelFlag::new(),
        options,
    );
    let settings_json = settings.to_json().map_err(|err| CliError::Config(err.to_string()))?;
    let plan = PipelinePlan {
        run_id: run_id.clone(),
        settings_json,
        run_mode,
        source_run_id,
        source_node: layout.source_node,
        source,
        steps,
        sinks,
        default_sink: settings.pipeline.default_sink.clone(),
        graph: layout.graph,
        resume,
        resume_rows,
    };
    Ok((processor, plan))
}
