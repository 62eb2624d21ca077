// elspeth-config/src/settings.rs
// ============================================================================
// Module: ELSPETH Settings
// Description: Declared pipeline, runtime, and landscape configuration.
// Purpose: Parse YAML settings and validate them, reporting every problem.
// Dependencies: serde, serde_yaml, elspeth-core
// ============================================================================

//! ## Overview
//! Settings are the declarative form of a pipeline: one source, an ordered
//! list of steps (transforms, gates with `routes`, aggregations with
//! triggers, coalesces), named sinks, and the runtime knobs (retry,
//! checkpointing, telemetry, rate limiting). Validation never stops at the
//! first problem: a settings file with five mistakes produces one error
//! listing all five.
//!
//! A configured store passphrase variable is only legal with an encrypted
//! backend; passing a passphrase to an unencrypted store is a
//! configuration error, not a silent no-op.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;

use elspeth_core::ContractMode;
use elspeth_core::FieldContract;
use elspeth_core::FieldSource;
use elspeth_core::FieldType;
use elspeth_core::SchemaContract;
use elspeth_core::TriggerConfig;
use elspeth_core::ValueKind;
use elspeth_core::normalize_field_name;
use elspeth_core::telemetry::TelemetryGranularity;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Default environment variable providing the artifact signing key.
pub const DEFAULT_SIGNING_KEY_ENV: &str = "ELSPETH_SIGNING_KEY";

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors raised while loading or validating settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The settings file could not be read.
    #[error("cannot read settings: {0}")]
    Io(String),
    /// The settings file failed YAML parsing.
    #[error("cannot parse settings: {0}")]
    Parse(String),
    /// The settings failed validation; every problem is listed.
    #[error("settings are invalid:\n  - {}", problems.join("\n  - "))]
    Invalid {
        /// All validation problems found.
        problems: Vec<String>,
    },
}

// ============================================================================
// SECTION: Settings Model
// ============================================================================

/// Landscape storage settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LandscapeSettings {
    /// Path of the `SQLite` database.
    pub database_path: PathBuf,
    /// Root directory of the payload store.
    pub payload_dir: PathBuf,
}

/// Retry policy settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Total attempts including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay in seconds.
    #[serde(default = "default_base_delay")]
    pub base_delay: f64,
    /// Delay ceiling in seconds.
    #[serde(default = "default_max_delay")]
    pub max_delay: f64,
    /// Jitter factor upper bound.
    #[serde(default = "default_jitter")]
    pub jitter: f64,
    /// Exponential growth base.
    #[serde(default = "default_exponential_base")]
    pub exponential_base: f64,
}

/// Default for [`RetrySettings::max_attempts`].
const fn default_max_attempts() -> u32 {
    3
}
/// Default for [`RetrySettings::base_delay`].
const fn default_base_delay() -> f64 {
    1.0
}
/// Default for [`RetrySettings::max_delay`].
const fn default_max_delay() -> f64 {
    60.0
}
/// Default for [`RetrySettings::jitter`].
const fn default_jitter() -> f64 {
    1.0
}
/// Default for [`RetrySettings::exponential_base`].
const fn default_exponential_base() -> f64 {
    2.0
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            jitter: default_jitter(),
            exponential_base: default_exponential_base(),
        }
    }
}

/// Telemetry settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetrySettings {
    /// Event granularity.
    #[serde(default = "default_granularity")]
    pub granularity: TelemetryGranularity,
    /// Whether repeated total exporter failure stops the run.
    #[serde(default)]
    pub fail_on_total_exporter_failure: bool,
}

/// Default for [`TelemetrySettings::granularity`].
const fn default_granularity() -> TelemetryGranularity {
    TelemetryGranularity::Lifecycle
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            granularity: default_granularity(),
            fail_on_total_exporter_failure: false,
        }
    }
}

/// Rate-limit settings for external calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitSettings {
    /// Permits per window.
    pub capacity: u32,
    /// Window length in seconds.
    pub per_seconds: f64,
}

/// Runtime settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeSettings {
    /// Worker pool ceiling.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Rows between checkpoints; zero disables checkpointing.
    #[serde(default)]
    pub checkpoint_interval: u64,
    /// Per-attempt transform timeout in seconds.
    #[serde(default = "default_transform_timeout")]
    pub transform_timeout_seconds: f64,
    /// Retry policy.
    #[serde(default)]
    pub retry: RetrySettings,
    /// Telemetry configuration.
    #[serde(default)]
    pub telemetry: TelemetrySettings,
    /// Optional external-call rate limit.
    #[serde(default)]
    pub rate_limit: Option<RateLimitSettings>,
}

/// Default for [`RuntimeSettings::max_workers`].
const fn default_max_workers() -> usize {
    4
}
/// Default for [`RuntimeSettings::transform_timeout_seconds`].
const fn default_transform_timeout() -> f64 {
    300.0
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            checkpoint_interval: 0,
            transform_timeout_seconds: default_transform_timeout(),
            retry: RetrySettings::default(),
            telemetry: TelemetrySettings::default(),
            rate_limit: None,
        }
    }
}

/// Environment variable settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentSettings {
    /// Variable providing the artifact signing key.
    #[serde(default = "default_signing_key_env")]
    pub signing_key_env: String,
    /// Variable providing the audit-store passphrase, when encrypted.
    #[serde(default)]
    pub store_passphrase_env: Option<String>,
    /// Whether the configured audit-store backend is the encrypted one.
    #[serde(default)]
    pub store_encrypted: bool,
}

/// Default for [`EnvironmentSettings::signing_key_env`].
fn default_signing_key_env() -> String {
    DEFAULT_SIGNING_KEY_ENV.to_string()
}

impl Default for EnvironmentSettings {
    fn default() -> Self {
        Self {
            signing_key_env: default_signing_key_env(),
            store_passphrase_env: None,
            store_encrypted: false,
        }
    }
}

/// One declared contract field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractFieldSettings {
    /// Field name as written by the producer.
    pub name: String,
    /// Declared value kind.
    pub kind: ValueKind,
    /// Whether null is acceptable.
    #[serde(default)]
    pub nullable: bool,
    /// Whether consumers may rely on presence.
    #[serde(default = "default_required")]
    pub required: bool,
}

/// Default for [`ContractFieldSettings::required`].
const fn default_required() -> bool {
    true
}

/// Validation-failure policy settings for a source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidationFailureSettings {
    /// Drop failing rows after recording them.
    Discard,
    /// Route failing rows to a named quarantine sink.
    Quarantine {
        /// Quarantine sink name.
        sink: String,
    },
}

impl Default for ValidationFailureSettings {
    fn default() -> Self {
        Self::Discard
    }
}

/// Source settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSettings {
    /// Plugin name.
    pub plugin: String,
    /// Plugin configuration.
    #[serde(default)]
    pub config: Value,
    /// Declared output contract fields.
    #[serde(default)]
    pub contract: Vec<ContractFieldSettings>,
    /// Policy for rows failing validation.
    #[serde(default)]
    pub on_validation_failure: ValidationFailureSettings,
}

/// The kind of a declared pipeline step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// A row transform.
    Transform,
    /// A routing gate.
    Gate,
    /// An aggregation.
    Aggregation,
    /// A join of forked branches.
    Coalesce,
}

/// Aggregation output mode settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputModeSettings {
    /// Emit buffered rows unchanged after flush.
    Passthrough,
    /// Emit transformed output from the aggregation plugin.
    Transform,
}

/// One declared pipeline step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSettings {
    /// Unique step name; route targets reference it.
    pub name: String,
    /// Step kind.
    pub kind: StepKind,
    /// Plugin name (coalesce steps have none).
    #[serde(default)]
    pub plugin: Option<String>,
    /// Plugin configuration.
    #[serde(default)]
    pub config: Value,
    /// Gate route labels to targets (`continue`, `fork`, a sink name, or
    /// `step:<name>`).
    #[serde(default)]
    pub routes: BTreeMap<String, String>,
    /// Fork branch labels to targets (a sink name or `step:<name>`).
    #[serde(default)]
    pub branches: BTreeMap<String, String>,
    /// Aggregation trigger.
    #[serde(default)]
    pub trigger: Option<TriggerConfig>,
    /// Aggregation output mode.
    #[serde(default)]
    pub output_mode: Option<OutputModeSettings>,
    /// Error divert target: a sink name receiving quarantined rows.
    #[serde(default)]
    pub on_error: Option<String>,
}

/// One declared sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinkSettings {
    /// Plugin name.
    pub plugin: String,
    /// Plugin configuration.
    #[serde(default)]
    pub config: Value,
}

/// The declared pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSettings {
    /// The source.
    pub source: SourceSettings,
    /// Ordered processing steps.
    #[serde(default)]
    pub steps: Vec<StepSettings>,
    /// Named sinks.
    pub sinks: BTreeMap<String, SinkSettings>,
    /// Sink receiving rows that fall off the end of the pipeline.
    pub default_sink: String,
}

/// The complete settings document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Landscape storage settings.
    pub landscape: LandscapeSettings,
    /// Runtime settings.
    #[serde(default)]
    pub runtime: RuntimeSettings,
    /// Environment variable settings.
    #[serde(default)]
    pub environment: EnvironmentSettings,
    /// The declared pipeline.
    pub pipeline: PipelineSettings,
}

// ============================================================================
// SECTION: Loading
// ============================================================================

impl Settings {
    /// Parses settings from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] on malformed YAML.
    pub fn from_yaml_str(input: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(input).map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Loads settings from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] or [`ConfigError::Parse`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|err| ConfigError::Io(err.to_string()))?;
        Self::from_yaml_str(&text)
    }

    /// Renders the settings as plain JSON for the run row.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when serialization fails.
    pub fn to_json(&self) -> Result<Value, ConfigError> {
        serde_json::to_value(self).map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Builds the declared source contract.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] listing normalization collisions.
    pub fn source_contract(&self) -> Result<SchemaContract, ConfigError> {
        let fields: Vec<FieldContract> = self
            .pipeline
            .source
            .contract
            .iter()
            .map(|field| FieldContract {
                normalized_name: normalize_field_name(&field.name),
                original_name: field.name.clone(),
                field_type: FieldType { kind: field.kind, nullable: field.nullable },
                required: field.required,
                source: FieldSource::Declared,
            })
            .collect();
        SchemaContract::new(ContractMode::Flexible, fields)
            .map_err(|err| ConfigError::Invalid { problems: vec![err.to_string()] })
    }

    /// Validates the settings, reporting every problem at once.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] listing all problems found.
    #[allow(
        clippy::too_many_lines,
        reason = "Validation deliberately reports every problem in one linear pass."
    )]
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems: Vec<String> = Vec::new();

        if !self.pipeline.sinks.contains_key(&self.pipeline.default_sink) {
            problems.push(format!(
                "default_sink '{}' is not a declared sink",
                self.pipeline.default_sink
            ));
        }
        if let ValidationFailureSettings::Quarantine { sink } =
            &self.pipeline.source.on_validation_failure
        {
            if !self.pipeline.sinks.contains_key(sink) {
                problems.push(format!(
                    "source quarantine sink '{sink}' is not a declared sink"
                ));
            }
        }

        // Step names must be unique; route targets reference them.
        let mut step_names: BTreeMap<&str, usize> = BTreeMap::new();
        for step in &self.pipeline.steps {
            *step_names.entry(step.name.as_str()).or_insert(0) += 1;
        }
        for (name, count) in &step_names {
            if *count > 1 {
                problems.push(format!("step name '{name}' is declared {count} times"));
            }
        }

        let mut fork_branch_owners: BTreeMap<&str, &str> = BTreeMap::new();
        for step in &self.pipeline.steps {
            match step.kind {
                StepKind::Transform => {
                    if step.plugin.is_none() {
                        problems.push(format!("transform step '{}' has no plugin", step.name));
                    }
                }
                StepKind::Gate => {
                    if step.plugin.is_none() {
                        problems.push(format!("gate step '{}' has no plugin", step.name));
                    }
                    for (label, target) in &step.routes {
                        self.validate_route_target(&mut problems, &step.name, label, target);
                    }
                    for (branch, target) in &step.branches {
                        if let Some(owner) = fork_branch_owners.get(branch.as_str()) {
                            problems.push(format!(
                                "fork branch '{branch}' is declared by both '{owner}' and '{}'",
                                step.name
                            ));
                        } else {
                            fork_branch_owners.insert(branch.as_str(), step.name.as_str());
                        }
                        self.validate_branch_target(&mut problems, &step.name, branch, target);
                    }
                }
                StepKind::Aggregation => {
                    if step.plugin.is_none() {
                        problems.push(format!("aggregation step '{}' has no plugin", step.name));
                    }
                    match &step.trigger {
                        None => problems
                            .push(format!("aggregation step '{}' has no trigger", step.name)),
                        Some(trigger) => {
                            if trigger.count.is_none()
                                && trigger.timeout_seconds.is_none()
                                && trigger.condition.is_none()
                            {
                                problems.push(format!(
                                    "aggregation step '{}' trigger configures no predicate",
                                    step.name
                                ));
                            }
                            if let Some(condition) = &trigger.condition {
                                if let Err(error) = elspeth_core::Condition::parse(condition) {
                                    problems.push(format!(
                                        "aggregation step '{}' condition is invalid: {error}",
                                        step.name
                                    ));
                                }
                            }
                        }
                    }
                    if step.output_mode.is_none() {
                        problems.push(format!(
                            "aggregation step '{}' has no output_mode",
                            step.name
                        ));
                    }
                }
                StepKind::Coalesce => {
                    if step.plugin.is_some() {
                        problems.push(format!(
                            "coalesce step '{}' must not declare a plugin",
                            step.name
                        ));
                    }
                }
            }
            if let Some(on_error) = &step.on_error {
                if !self.pipeline.sinks.contains_key(on_error) {
                    problems.push(format!(
                        "step '{}' on_error sink '{on_error}' is not a declared sink",
                        step.name
                    ));
                }
            }
        }

        // Contract field normalization collisions.
        if let Err(error) = self.source_contract() {
            problems.push(error.to_string());
        }

        // A passphrase must never be handed to an unencrypted store.
        if self.environment.store_passphrase_env.is_some() && !self.environment.store_encrypted {
            problems.push(
                "store_passphrase_env is configured but the audit-store backend is not \
                 encrypted; remove the passphrase or enable the encrypted backend"
                    .to_string(),
            );
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid { problems })
        }
    }

    /// Validates one gate route target.
    fn validate_route_target(
        &self,
        problems: &mut Vec<String>,
        step_name: &str,
        label: &str,
        target: &str,
    ) {
        if target == "continue" || target == "fork" {
            return;
        }
        if let Some(step_target) = target.strip_prefix("step:") {
            if !self.pipeline.steps.iter().any(|step| step.name == step_target) {
                problems.push(format!(
                    "gate '{step_name}' route '{label}' targets unknown step '{step_target}'"
                ));
            }
            return;
        }
        if !self.pipeline.sinks.contains_key(target) {
            problems.push(format!(
                "gate '{step_name}' route '{label}' targets unknown sink '{target}'"
            ));
        }
    }

    /// Validates one fork branch target.
    fn validate_branch_target(
        &self,
        problems: &mut Vec<String>,
        step_name: &str,
        branch: &str,
        target: &str,
    ) {
        if let Some(step_target) = target.strip_prefix("step:") {
            if !self.pipeline.steps.iter().any(|step| step.name == step_target) {
                problems.push(format!(
                    "gate '{step_name}' branch '{branch}' targets unknown step '{step_target}'"
                ));
            }
            return;
        }
        if !self.pipeline.sinks.contains_key(target) {
            problems.push(format!(
                "gate '{step_name}' branch '{branch}' targets unknown sink '{target}'"
            ));
        }
    }
}
