// elspeth-landscape/tests/payload.rs
// ============================================================================
// Module: Payload Store Tests
// Description: Tests for content-addressed filesystem storage.
// ============================================================================
//! ## Overview
//! Stores are idempotent and content-addressed by SHA-256; references are
//! validated before any path is touched; purge removes exactly the given
//! references.

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

use std::collections::BTreeSet;

use elspeth_core::interfaces::PayloadStore;
use elspeth_core::interfaces::PayloadStoreError;
use elspeth_landscape::FilesystemPayloadStore;

// ============================================================================
// SECTION: Round Trip
// ============================================================================

/// Tests store and fetch round-trip and idempotent storage.
#[test]
fn test_store_fetch_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let store = FilesystemPayloadStore::open(dir.path()).unwrap();

    let first = store.store(b"payload bytes").unwrap();
    let second = store.store(b"payload bytes").unwrap();
    assert_eq!(first, second);
    assert!(first.starts_with("objects/"));

    assert_eq!(store.fetch(&first).unwrap(), b"payload bytes");
}

/// Tests the reference embeds the SHA-256 of the content.
#[test]
fn test_reference_is_content_addressed() {
    let dir = tempfile::tempdir().unwrap();
    let store = FilesystemPayloadStore::open(dir.path()).unwrap();

    let reference = store.store(b"").unwrap();
    assert_eq!(
        reference,
        "objects/e3/b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
    );
}

// ============================================================================
// SECTION: Failure Modes
// ============================================================================

/// Tests unknown references are not-found, malformed ones invalid.
#[test]
fn test_reference_validation() {
    let dir = tempfile::tempdir().unwrap();
    let store = FilesystemPayloadStore::open(dir.path()).unwrap();

    let missing = store.fetch(&format!("objects/00/{}", "0".repeat(62)));
    assert!(matches!(missing, Err(PayloadStoreError::NotFound(_))));

    let traversal = store.fetch("objects/../../etc/passwd");
    assert!(matches!(traversal, Err(PayloadStoreError::InvalidRef(_))));

    let malformed = store.fetch("not-a-ref");
    assert!(matches!(malformed, Err(PayloadStoreError::InvalidRef(_))));
}

/// Tests purge removes exactly the named references.
#[test]
fn test_purge() {
    let dir = tempfile::tempdir().unwrap();
    let store = FilesystemPayloadStore::open(dir.path()).unwrap();

    let keep = store.store(b"keep me").unwrap();
    let drop_ref = store.store(b"drop me").unwrap();

    let mut refs = BTreeSet::new();
    refs.insert(drop_ref.clone());
    assert_eq!(store.purge(&refs).unwrap(), 1);

    assert!(store.fetch(&keep).is_ok());
    assert!(matches!(store.fetch(&drop_ref), Err(PayloadStoreError::NotFound(_))));
}
