// elspeth-core/src/core/hashing.rs
// ============================================================================
// Module: ELSPETH Canonical Hashing
// Description: RFC 8785 JSON canonicalization and content hashing utilities.
// Purpose: Provide deterministic hashes for configs, rows, calls, and topology.
// Dependencies: serde, serde_jcs, sha2
// ============================================================================

//! ## Overview
//! ELSPETH hashes all canonical JSON using RFC 8785 (JCS) so that replay and
//! verify can compare digests across processes and platforms. Key order is
//! sorted by the canonicalizer; non-finite floats are rejected before they
//! reach it. Binary payloads hash directly over raw bytes.
//!
//! Tier-3 external data that cannot be canonicalized falls back to
//! [`repr_hash`], which hashes a debug rendering and records the failure so
//! the audit row never silently loses the evidence.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fmt::Debug;

use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;
use thiserror::Error;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Maximum characters of a debug rendering retained by [`repr_hash`].
pub const REPR_TRUNCATE_CHARS: usize = 200;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors raised when computing canonical hashes.
#[derive(Debug, Error)]
pub enum HashError {
    /// JSON canonicalization failed.
    ///
    /// RFC 8785 has no representation for NaN or the infinities, so
    /// non-finite floats land here rather than silently becoming `null`.
    #[error("failed to canonicalize json: {0}")]
    Canonicalization(String),
}

// ============================================================================
// SECTION: Canonical JSON
// ============================================================================

/// Returns canonical JSON bytes for a serializable value using RFC 8785.
///
/// The value is serialized directly by the canonicalizer, never via an
/// intermediate `serde_json::Value`, which would map non-finite floats to
/// `null` and silently change the hashed content.
///
/// # Errors
///
/// Returns [`HashError::Canonicalization`] when serialization fails,
/// including for NaN and infinite floats.
pub fn canonical_json_bytes<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, HashError> {
    serde_jcs::to_vec(value).map_err(|err| HashError::Canonicalization(err.to_string()))
}

// ============================================================================
// SECTION: Stable Hashing
// ============================================================================

/// Computes the stable lowercase-hex SHA-256 hash of a serializable value.
///
/// The value is canonicalized with RFC 8785 first, so dict ordering and
/// insignificant whitespace never change the result.
///
/// # Errors
///
/// Returns [`HashError`] when the value cannot be canonicalized.
pub fn stable_hash<T: Serialize + ?Sized>(value: &T) -> Result<String, HashError> {
    let bytes = canonical_json_bytes(value)?;
    Ok(hash_bytes(&bytes))
}

/// Hashes raw bytes with SHA-256, returning lowercase hex.
#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    hex_encode(&digest)
}

// ============================================================================
// SECTION: Repr Fallback
// ============================================================================

/// Metadata recorded alongside a repr-fallback hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, serde::Deserialize)]
pub struct ReprFallback {
    /// Lowercase-hex SHA-256 of the full debug rendering.
    pub hash: String,
    /// Debug rendering truncated to [`REPR_TRUNCATE_CHARS`] characters.
    pub repr: String,
    /// Type name of the value that failed canonicalization.
    pub type_name: String,
    /// The canonicalization error that forced the fallback.
    pub error: String,
}

/// Hashes the debug rendering of a value that cannot be canonicalized.
///
/// Used for Tier-3 external data (NaN payloads, non-object rows). The full
/// rendering is hashed; the stored repr is truncated to
/// [`REPR_TRUNCATE_CHARS`] characters so audit rows stay bounded.
#[must_use]
#[allow(
    clippy::use_debug,
    reason = "The repr fallback exists to capture the debug rendering of values with no canonical form."
)]
pub fn repr_hash<T: Debug + ?Sized>(value: &T, error: &HashError) -> ReprFallback {
    let rendering = format!("{value:?}");
    let hash = hash_bytes(rendering.as_bytes());
    let repr = rendering.chars().take(REPR_TRUNCATE_CHARS).collect();
    ReprFallback {
        hash,
        repr,
        type_name: std::any::type_name::<T>().to_string(),
        error: error.to_string(),
    }
}

// ============================================================================
// SECTION: Hex Encoding
// ============================================================================

/// Encodes bytes as a lowercase hex string.
fn hex_encode(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(HEX[(byte >> 4) as usize] as char);
        out.push(HEX[(byte & 0x0f) as usize] as char);
    }
    out
}
