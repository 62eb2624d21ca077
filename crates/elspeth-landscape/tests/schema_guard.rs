// elspeth-landscape/tests/schema_guard.rs
// ============================================================================
// Module: Schema Guard Tests
// Description: Tests for schema creation and the existing-database guard.
// ============================================================================
//! ## Overview
//! An empty database gets the full schema; an existing database with gaps
//! fails fast with every missing table and column listed.

#![allow(
    clippy::panic,
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::use_debug,
    clippy::dbg_macro,
    clippy::panic_in_result_fn,
    clippy::unwrap_in_result,
    reason = "Test-only output and panic-based assertions are permitted."
)]

use elspeth_landscape::Landscape;
use elspeth_landscape::LandscapeError;

// ============================================================================
// SECTION: Schema Creation
// ============================================================================

/// Tests an empty database opens with the full schema and reopens cleanly.
#[test]
fn test_empty_database_initialized_and_reopened() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("landscape.db");

    let first = Landscape::open(&path).unwrap();
    drop(first);

    // Re-open: the guard runs against the existing schema and passes.
    let second = Landscape::open(&path).unwrap();
    assert_eq!(second.path().unwrap(), path.as_path());
}

// ============================================================================
// SECTION: Guard
// ============================================================================

/// Tests the guard lists every gap of an incompatible database.
#[test]
fn test_guard_lists_all_gaps() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("partial.db");
    {
        let connection = rusqlite::Connection::open(&path).unwrap();
        // A plausible-but-wrong schema: runs exists without its columns,
        // tokens is missing entirely.
        connection
            .execute("CREATE TABLE runs (run_id TEXT PRIMARY KEY)", [])
            .unwrap();
    }

    let result = Landscape::open(&path);
    let Err(LandscapeError::SchemaGuard { problems }) = result else {
        panic!("expected the schema guard to fail");
    };
    assert!(problems.iter().any(|p| p.contains("runs") && p.contains("status")));
    assert!(problems.iter().any(|p| p.contains("missing table 'tokens'")));
    assert!(problems.iter().any(|p| p.contains("missing table 'checkpoints'")));
    assert!(problems.len() > 10);
}
