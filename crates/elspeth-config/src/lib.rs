// elspeth-config/src/lib.rs
// ============================================================================
// Module: ELSPETH Config Library
// Description: Public API surface for settings and graph planning.
// Purpose: Expose the settings model, validation, and the planner.
// Dependencies: crate::{planner, settings}
// ============================================================================

//! ## Overview
//! Configuration is declarative: a YAML settings document names the source,
//! steps, sinks, and runtime knobs of a pipeline. This crate parses it,
//! validates it with every problem reported at once, and plans the
//! execution graph the engine runs.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod planner;
pub mod settings;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use planner::PipelineLayout;
pub use planner::build_layout;
pub use settings::ConfigError;
pub use settings::ContractFieldSettings;
pub use settings::DEFAULT_SIGNING_KEY_ENV;
pub use settings::EnvironmentSettings;
pub use settings::LandscapeSettings;
pub use settings::OutputModeSettings;
pub use settings::PipelineSettings;
pub use settings::RateLimitSettings;
pub use settings::RetrySettings;
pub use settings::RuntimeSettings;
pub use settings::Settings;
pub use settings::SinkSettings;
pub use settings::SourceSettings;
pub use settings::StepKind;
pub use settings::StepSettings;
pub use settings::TelemetrySettings;
pub use settings::ValidationFailureSettings;
