// elspeth-landscape/src/lib.rs
// ============================================================================
// Module: ELSPETH Landscape Library
// Description: Public API surface for the durable audit store.
// Purpose: Expose the store, schema helpers, payload store, and errors.
// Dependencies: crate::{error, payload, schema, store}
// ============================================================================

//! ## Overview
//! The Landscape is ELSPETH's persistent audit trail: a relational store
//! with referential integrity holding runs, nodes, edges, rows, tokens,
//! node states, calls, routing events, batches, artifacts, checkpoints,
//! outcomes, and error records, plus a content-addressed payload store for
//! large values. Every observable event of a run is durable here before the
//! next event is scheduled on the same token.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod error;
pub mod payload;
pub mod schema;
pub mod store;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use error::LandscapeError;
pub use payload::FilesystemPayloadStore;
pub use schema::SCHEMA_VERSION;
pub use schema::initialize_schema;
pub use schema::is_empty_database;
pub use schema::validate_schema;
pub use store::Landscape;
pub use store::RunSummary;
