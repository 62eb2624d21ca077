// elspeth-landscape/src/error.rs
// ============================================================================
// Module: Landscape Errors
// Description: Error taxonomy for the audit store.
// Purpose: Distinguish I/O, corruption, and invariant violations per tier.
// Dependencies: thiserror
// ============================================================================

//! ## Overview
//! Landscape data is Tier-1 ("our data"): corruption is a crash, not a
//! recoverable condition. [`LandscapeError::Corrupt`] therefore propagates
//! out of repositories unchanged: malformed enum labels, broken JSON, or a
//! terminal state transition are bugs in the system, and graceful recovery
//! would hide them.

// ============================================================================
// SECTION: Imports
// ============================================================================

use thiserror::Error;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors raised by the Landscape store.
#[derive(Debug, Error)]
pub enum LandscapeError {
    /// Filesystem or connection I/O failure.
    #[error("landscape io error: {0}")]
    Io(String),
    /// `SQLite` engine failure.
    #[error("landscape db error: {0}")]
    Db(String),
    /// Stored audit data is corrupt (Tier-1: crash, never recover).
    #[error("landscape corruption: {0}")]
    Corrupt(String),
    /// A write violated an audit invariant.
    #[error("landscape invalid write: {0}")]
    Invalid(String),
    /// A second terminal outcome was recorded for a token.
    #[error("token '{token_id}' already has terminal outcome '{existing}'")]
    DuplicateOutcome {
        /// Token with the conflicting outcome.
        token_id: String,
        /// The outcome already recorded.
        existing: String,
    },
    /// A state transition was attempted on a non-open state.
    #[error("state '{state_id}' cannot transition: {message}")]
    StateTransition {
        /// The state being transitioned.
        state_id: String,
        /// Why the transition is invalid.
        message: String,
    },
    /// An existing database is missing required schema.
    #[error("landscape schema guard failed:\n  - {}", problems.join("\n  - "))]
    SchemaGuard {
        /// All schema gaps found.
        problems: Vec<String>,
    },
    /// A required record was not found.
    #[error("landscape record not found: {0}")]
    NotFound(String),
}
