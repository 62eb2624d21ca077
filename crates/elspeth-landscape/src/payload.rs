// elspeth-landscape/src/payload.rs
// ============================================================================
// Module: Landscape Payload Store
// Description: Content-addressed filesystem storage for large values.
// Purpose: Keep row payloads and call bodies out of audit rows.
// Dependencies: sha2
// ============================================================================

//! ## Overview
//! Audit rows hold only hashes and references; the bytes themselves live in
//! a payload store. The filesystem backend is content-addressed: the
//! reference is `objects/<aa>/<rest>` where `<aa><rest>` is the SHA-256 of
//! the bytes. Stores are idempotent; re-storing identical bytes returns
//! the same reference without rewriting. References are validated before
//! any path is touched so a corrupted reference can never escape the root.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;

use elspeth_core::hash_bytes;
use elspeth_core::interfaces::PayloadStore;
use elspeth_core::interfaces::PayloadStoreError;

// ============================================================================
// SECTION: Filesystem Payload Store
// ============================================================================

/// Content-addressed payload store rooted at a directory.
#[derive(Debug, Clone)]
pub struct FilesystemPayloadStore {
    /// Root directory holding the `objects/` tree.
    root: PathBuf,
}

impl FilesystemPayloadStore {
    /// Creates a store rooted at `root`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadStoreError::Io`] when the root cannot be created.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, PayloadStoreError> {
        let root = root.into();
        fs::create_dir_all(root.join("objects"))
            .map_err(|err| PayloadStoreError::Io(err.to_string()))?;
        Ok(Self { root })
    }

    /// Returns the absolute path for a validated reference.
    fn path_for(&self, payload_ref: &str) -> Result<PathBuf, PayloadStoreError> {
        validate_ref(payload_ref)?;
        Ok(self.root.join(payload_ref))
    }
}

/// Validates the `objects/<aa>/<rest>` reference shape.
fn validate_ref(payload_ref: &str) -> Result<(), PayloadStoreError> {
    let mut parts = payload_ref.split('/');
    let (Some("objects"), Some(shard), Some(rest), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(PayloadStoreError::InvalidRef(payload_ref.to_string()));
    };
    let hex_ok = |segment: &str| segment.chars().all(|ch| ch.is_ascii_hexdigit());
    if shard.len() == 2 && rest.len() == 62 && hex_ok(shard) && hex_ok(rest) {
        Ok(())
    } else {
        Err(PayloadStoreError::InvalidRef(payload_ref.to_string()))
    }
}

/// Builds the reference for a content hash.
fn ref_for_hash(hash: &str) -> String {
    format!("objects/{}/{}", &hash[..2], &hash[2..])
}

impl PayloadStore for FilesystemPayloadStore {
    fn store(&self, bytes: &[u8]) -> Result<String, PayloadStoreError> {
        let hash = hash_bytes(bytes);
        let payload_ref = ref_for_hash(&hash);
        let path = self.root.join(&payload_ref);
        if path.exists() {
            return Ok(payload_ref);
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| PayloadStoreError::Io(err.to_string()))?;
        }
        fs::write(&path, bytes).map_err(|err| PayloadStoreError::Io(err.to_string()))?;
        Ok(payload_ref)
    }

    fn fetch(&self, payload_ref: &str) -> Result<Vec<u8>, PayloadStoreError> {
        let path = self.path_for(payload_ref)?;
        if !path.exists() {
            return Err(PayloadStoreError::NotFound(payload_ref.to_string()));
        }
        fs::read(&path).map_err(|err| PayloadStoreError::Io(err.to_string()))
    }

    fn purge(&self, refs: &BTreeSet<String>) -> Result<usize, PayloadStoreError> {
        let mut removed = 0_usize;
        for payload_ref in refs {
            let path = self.path_for(payload_ref)?;
            if path.exists() {
                fs::remove_file(&path).map_err(|err| PayloadStoreError::Io(err.to_string()))?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}
