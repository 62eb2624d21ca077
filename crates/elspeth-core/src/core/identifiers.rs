// elspeth-core/src/core/identifiers.rs
// ============================================================================
// Module: ELSPETH Identifiers
// Description: Canonical opaque identifiers for ELSPETH runs and audit rows.
// Purpose: Provide strongly typed, serializable IDs with stable string forms.
// Dependencies: rand, serde, sha2
// ============================================================================

//! ## Overview
//! This module defines the canonical string-based identifiers used throughout
//! ELSPETH. Identifiers are opaque and serialize as strings. Generated forms
//! carry a short prefix (`run_`, `tok_`, `st_`, ...) followed by hex so that
//! audit rows remain greppable. Node identifiers are deterministic: they are
//! derived from the run, the plugin, its configuration, and its position so
//! that checkpoint resume can match nodes across process restarts.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fmt;

use rand::Rng;
use serde::Deserialize;
use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;

// ============================================================================
// SECTION: Generation Helpers
// ============================================================================

/// Number of random hex characters appended to generated identifiers.
const RANDOM_SUFFIX_LEN: usize = 12;

/// Returns a random lowercase hex string of [`RANDOM_SUFFIX_LEN`] characters.
fn random_suffix() -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut rng = rand::thread_rng();
    let mut out = String::with_capacity(RANDOM_SUFFIX_LEN);
    for _ in 0..RANDOM_SUFFIX_LEN {
        let nibble: usize = rng.gen_range(0..16);
        out.push(HEX[nibble] as char);
    }
    out
}

/// Returns the first `len` lowercase hex characters of a SHA-256 digest.
fn digest_prefix(bytes: &[u8], len: usize) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(len);
    for byte in digest.iter() {
        if out.len() >= len {
            break;
        }
        out.push(HEX[(byte >> 4) as usize] as char);
        if out.len() >= len {
            break;
        }
        out.push(HEX[(byte & 0x0f) as usize] as char);
    }
    out
}

/// Declares a string-backed identifier type with the shared accessors.
macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Creates a new identifier from an existing string form.
            #[must_use]
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Returns the identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self::new(value)
            }
        }
    };
}

// ============================================================================
// SECTION: Identifier Types
// ============================================================================

string_id! {
    /// Run identifier for one end-to-end pipeline execution.
    RunId
}

impl RunId {
    /// Generates a fresh run identifier (`run_` prefix).
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("run_{}", random_suffix()))
    }
}

string_id! {
    /// Node identifier for a plugin instance bound to a run.
    NodeId
}

impl NodeId {
    /// Derives the deterministic node identifier for a plugin instance.
    ///
    /// The identifier is a function of the run, the plugin name, the plugin
    /// configuration hash, and the node's position in the pipeline, so the
    /// same settings always produce the same node ids. Checkpoint resume
    /// depends on this stability.
    #[must_use]
    pub fn derive(run_id: &RunId, plugin_name: &str, config_hash: &str, position: usize) -> Self {
        let material = format!("{}\n{plugin_name}\n{config_hash}\n{position}", run_id.as_str());
        Self(format!("node_{}", digest_prefix(material.as_bytes(), 16)))
    }
}

string_id! {
    /// Row identifier for a record loaded from a source.
    RowId
}

impl RowId {
    /// Generates a fresh row identifier (`row_` prefix).
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("row_{}", random_suffix()))
    }
}

string_id! {
    /// Token identifier for a row instance flowing one DAG path.
    TokenId
}

impl TokenId {
    /// Generates a fresh token identifier (`tok_` prefix).
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("tok_{}", random_suffix()))
    }
}

string_id! {
    /// Node-state identifier for one visit of one token at one node.
    StateId
}

impl StateId {
    /// Generates a fresh state identifier (`st_` prefix).
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("st_{}", random_suffix()))
    }
}

string_id! {
    /// Call identifier for an external call recorded under a node state.
    CallId
}

impl CallId {
    /// Generates a fresh call identifier (`call_` prefix).
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("call_{}", random_suffix()))
    }
}

string_id! {
    /// Routing-event identifier for one edge traversal at a gate.
    RoutingEventId
}

impl RoutingEventId {
    /// Generates a fresh routing-event identifier (`evt_` prefix).
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("evt_{}", random_suffix()))
    }
}

string_id! {
    /// Batch identifier for an aggregation batch.
    BatchId
}

impl BatchId {
    /// Generates a fresh batch identifier (`batch_` prefix).
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("batch_{}", random_suffix()))
    }
}

string_id! {
    /// Artifact identifier for a sink output.
    ArtifactId
}

impl ArtifactId {
    /// Generates a fresh artifact identifier (`art_` prefix).
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("art_{}", random_suffix()))
    }
}

string_id! {
    /// Checkpoint identifier for a resume point within a run.
    CheckpointId
}

impl CheckpointId {
    /// Generates a fresh checkpoint identifier (`cp-` prefix).
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("cp-{}", random_suffix()))
    }
}

string_id! {
    /// Group identifier shared by tokens related through fork, join, or
    /// expansion.
    GroupId
}

impl GroupId {
    /// Generates a fresh fork group identifier (`fork_` prefix).
    #[must_use]
    pub fn generate_fork() -> Self {
        Self(format!("fork_{}", random_suffix()))
    }

    /// Generates a fresh join group identifier (`join_` prefix).
    #[must_use]
    pub fn generate_join() -> Self {
        Self(format!("join_{}", random_suffix()))
    }

    /// Generates a fresh expansion group identifier (`exp_` prefix).
    #[must_use]
    pub fn generate_expand() -> Self {
        Self(format!("exp_{}", random_suffix()))
    }
}
