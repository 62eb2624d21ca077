// elspeth-mcp/src/lib.rs
// ============================================================================
// Module: ELSPETH MCP Library
// Description: Public API surface for the read-only query layer.
// Purpose: Expose SQL validation and the query service.
// Dependencies: crate::query
// ============================================================================

//! ## Overview
//! Inspection tools (the MCP server among them) query the Landscape through
//! this crate. The surface is strictly read-only: every payload passes
//! [`validate_readonly_sql`] before a prepared statement is ever created,
//! and the connection itself is opened read-only as a second line of
//! defense.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod query;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use query::DEFAULT_ROW_LIMIT;
pub use query::QueryError;
pub use query::QueryService;
pub use query::validate_readonly_sql;
