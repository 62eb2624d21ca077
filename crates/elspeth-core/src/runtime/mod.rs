// elspeth-core/src/runtime/mod.rs
// ============================================================================
// Module: ELSPETH Runtime Helpers
// Description: Trigger evaluation, condition expressions, and retry policy.
// Purpose: Provide the engine's reusable runtime building blocks.
// Dependencies: rand, thiserror, tokio
// ============================================================================

//! ## Overview
//! Runtime helpers are the pieces of engine behavior that are pure enough
//! to live beside the core types: the aggregation trigger evaluator, the
//! sandboxed condition language it uses, and the retry manager with its
//! audit-aligned attempt numbering.

// ============================================================================
// SECTION: Submodules
// ============================================================================

pub mod condition;
pub mod retry;
pub mod triggers;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use condition::Condition;
pub use condition::ConditionError;
pub use retry::RetryConfig;
pub use retry::RetryConfigError;
pub use retry::RetryError;
pub use retry::RetryManager;
pub use triggers::TriggerConfig;
pub use triggers::TriggerConfigError;
pub use triggers::TriggerEvaluator;
