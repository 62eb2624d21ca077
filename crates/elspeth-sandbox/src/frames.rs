// elspeth-sandbox/src/frames.rs
// ============================================================================
// Module: Sandbox Frame Registry & Proxy Table
// Description: Stable frame identities, cached digests, and worker proxies.
// Purpose: Keep the orchestrator the sole holder of frame data while
//          workers operate through revocable, versioned proxy handles.
// Dependencies: blake3, hmac, parking_lot, sha2, uuid
// ============================================================================

//! ## Overview
//! When plugins operate on dataframes out of process, the orchestrator is
//! the only holder of the actual data. The frame registry maps a stable
//! UUID to the frame, a cached 32-byte BLAKE3 digest of its canonical
//! encoding, and a security level; identifiers are never reused, even
//! after deregistration. The proxy table maps opaque random proxy ids to
//! `(frame_id, version)`; every orchestrator-approved mutation bumps the
//! version and revoked proxies never become valid again.
//!
//! Sealed frames carry a tamper-evident HMAC over the security level and
//! frame identity, keyed by a secret private to the registry instance. Seal
//! verification failures raise a security error that leaks no seal
//! internals.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::cell::RefCell;
use std::collections::HashMap;
use std::collections::HashSet;
use std::time::SystemTime;

use hmac::Hmac;
use hmac::Mac;
use parking_lot::ReentrantMutex;
use rand::RngCore;
use serde_json::Value;
use sha2::Sha256;
use thiserror::Error;
use uuid::Uuid;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Inclusive security level ceiling (0 = unofficial, 4 = secret).
pub const MAX_SECURITY_LEVEL: u8 = 4;

/// HMAC-SHA256 alias for seals.
type SealMac = Hmac<Sha256>;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors raised by the frame registry and proxy table.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// The frame id was already used, possibly by a deregistered frame.
    #[error("frame id {0} was previously used and cannot be reused")]
    IdRetired(Uuid),
    /// The frame id is already registered.
    #[error("frame id {0} is already registered")]
    AlreadyRegistered(Uuid),
    /// The frame id is unknown.
    #[error("frame id {0} not found in registry")]
    UnknownFrame(Uuid),
    /// The security level is outside 0..=4.
    #[error("security level must be 0..=4, got {0}")]
    BadLevel(u8),
    /// The proxy id is unknown or revoked.
    #[error("proxy '{0}' is unknown or revoked")]
    UnknownProxy(String),
    /// Seal verification failed; no seal internals are disclosed.
    #[error("frame seal verification failed")]
    SealViolation,
}

// ============================================================================
// SECTION: Sealed Frame
// ============================================================================

/// A frame payload with its tamper-evident seal.
///
/// The seal is an HMAC over `(security_level, frame_id)` keyed by the
/// owning registry's private key; it is checked on every data access.
#[derive(Debug, Clone)]
pub struct SealedFrame {
    /// Stable frame identity.
    frame_id: Uuid,
    /// Security level, 0 through 4.
    security_level: u8,
    /// The frame data (canonically encodable).
    data: Value,
    /// HMAC over the level and identity.
    seal: Vec<u8>,
}

impl SealedFrame {
    /// Returns the frame identity.
    #[must_use]
    pub const fn frame_id(&self) -> Uuid {
        self.frame_id
    }

    /// Returns the security level.
    #[must_use]
    pub const fn security_level(&self) -> u8 {
        self.security_level
    }
}

// ============================================================================
// SECTION: Registry Entries
// ============================================================================

/// Registry entry for one frame.
#[derive(Debug, Clone)]
pub struct FrameEntry {
    /// The sealed frame.
    pub frame: SealedFrame,
    /// 32-byte BLAKE3 digest of the frame's canonical encoding.
    pub digest: [u8; 32],
    /// Security level, 0 through 4.
    pub level: u8,
    /// When the frame was registered.
    pub created_at: SystemTime,
}

/// Proxy table entry for one worker handle.
#[derive(Debug, Clone)]
pub struct ProxyEntry {
    /// Frame the proxy points at.
    pub frame_id: Uuid,
    /// Version, bumped by every approved mutation.
    pub version: u64,
    /// When the proxy was issued.
    pub created_at: SystemTime,
    /// When the proxy was last resolved.
    pub last_accessed: SystemTime,
}

// ============================================================================
// SECTION: Frame Registry
// ============================================================================

/// Interior state shared by the registry and proxy table.
struct RegistryState {
    /// Active frames by id.
    frames: HashMap<Uuid, FrameEntry>,
    /// Retired frame ids; never valid again.
    retired: HashSet<Uuid>,
    /// Active proxies by opaque id.
    proxies: HashMap<String, ProxyEntry>,
    /// Revoked proxy ids; never valid again.
    revoked: HashSet<String>,
}

/// Process-local frame registry with an integrated proxy table.
///
/// All public methods are thread-safe behind one reentrant lock, so an
/// approved-mutation path may resolve proxies while already holding it.
pub struct FrameRegistry {
    /// Shared state behind a reentrant lock.
    state: ReentrantMutex<RefCell<RegistryState>>,
    /// Seal key private to this registry instance; never exported.
    seal_key: [u8; 32],
}

impl Default for FrameRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameRegistry {
    /// Creates a registry with a fresh random seal key.
    #[must_use]
    pub fn new() -> Self {
        let mut seal_key = [0_u8; 32];
        rand::thread_rng().fill_bytes(&mut seal_key);
        Self {
            state: ReentrantMutex::new(RefCell::new(RegistryState {
                frames: HashMap::new(),
                retired: HashSet::new(),
                proxies: HashMap::new(),
                revoked: HashSet::new(),
            })),
            seal_key,
        }
    }

    /// Computes the digest of a frame's canonical encoding.
    #[must_use]
    pub fn compute_digest(data: &Value) -> [u8; 32] {
        let canonical = elspeth_core::canonical_json_bytes(data)
            .unwrap_or_else(|_| data.to_string().into_bytes());
        *blake3::hash(&canonical).as_bytes()
    }

    /// Computes the seal for a level and identity.
    fn seal_for(&self, security_level: u8, frame_id: Uuid) -> Vec<u8> {
        // HMAC-SHA256 accepts keys of any length; construction cannot fail.
        let Ok(mut mac) = <SealMac as Mac>::new_from_slice(&self.seal_key) else {
            return Vec::new();
        };
        mac.update(&[security_level]);
        mac.update(frame_id.as_bytes());
        mac.finalize().into_bytes().to_vec()
    }

    /// Seals a frame payload under this registry's key.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::BadLevel`] for levels above the ceiling.
    pub fn seal_frame(&self, data: Value, security_level: u8) -> Result<SealedFrame, FrameError> {
        if security_level > MAX_SECURITY_LEVEL {
            return Err(FrameError::BadLevel(security_level));
        }
        let frame_id = Uuid::new_v4();
        let seal = self.seal_for(security_level, frame_id);
        Ok(SealedFrame { frame_id, security_level, data, seal })
    }

    /// Verifies a frame's seal and returns its data.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::SealViolation`] when the seal does not match;
    /// the error carries no seal internals.
    pub fn open_frame<'a>(&self, frame: &'a SealedFrame) -> Result<&'a Value, FrameError> {
        let mut mac = <SealMac as Mac>::new_from_slice(&self.seal_key)
            .map_err(|_| FrameError::SealViolation)?;
        mac.update(&[frame.security_level]);
        mac.update(frame.frame_id.as_bytes());
        if mac.verify_slice(&frame.seal).is_err() {
            return Err(FrameError::SealViolation);
        }
        Ok(&frame.data)
    }

    /// Registers a sealed frame.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::IdRetired`] for reused ids,
    /// [`FrameError::AlreadyRegistered`] for duplicates, and digest/level
    /// validation failures.
    pub fn register(
        &self,
        frame: SealedFrame,
        digest: [u8; 32],
        level: u8,
    ) -> Result<(), FrameError> {
        if level > MAX_SECURITY_LEVEL {
            return Err(FrameError::BadLevel(level));
        }
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        let frame_id = frame.frame_id;
        if state.retired.contains(&frame_id) {
            return Err(FrameError::IdRetired(frame_id));
        }
        if state.frames.contains_key(&frame_id) {
            return Err(FrameError::AlreadyRegistered(frame_id));
        }
        state.frames.insert(
            frame_id,
            FrameEntry { frame, digest, level, created_at: SystemTime::now() },
        );
        Ok(())
    }

    /// Looks up a frame entry.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::UnknownFrame`] for unregistered ids.
    pub fn lookup(&self, frame_id: Uuid) -> Result<FrameEntry, FrameError> {
        let guard = self.state.lock();
        let state = guard.borrow();
        state.frames.get(&frame_id).cloned().ok_or(FrameError::UnknownFrame(frame_id))
    }

    /// Returns true when the frame id is registered.
    #[must_use]
    pub fn contains(&self, frame_id: Uuid) -> bool {
        let guard = self.state.lock();
        let state = guard.borrow();
        state.frames.contains_key(&frame_id)
    }

    /// Updates the cached digest after an orchestrator-approved mutation.
    ///
    /// Read-only operations reuse the cached digest and never call this.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::UnknownFrame`] for unregistered ids.
    pub fn update_digest(&self, frame_id: Uuid, new_digest: [u8; 32]) -> Result<(), FrameError> {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        let entry =
            state.frames.get_mut(&frame_id).ok_or(FrameError::UnknownFrame(frame_id))?;
        entry.digest = new_digest;
        // Mutations also bump every proxy pointing at the frame.
        for proxy in state.proxies.values_mut() {
            if proxy.frame_id == frame_id {
                proxy.version += 1;
            }
        }
        Ok(())
    }

    /// Deregisters a frame and permanently retires its id.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::UnknownFrame`] for unregistered ids.
    pub fn deregister(&self, frame_id: Uuid) -> Result<(), FrameError> {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        if state.frames.remove(&frame_id).is_none() {
            return Err(FrameError::UnknownFrame(frame_id));
        }
        state.retired.insert(frame_id);
        Ok(())
    }

    /// Returns the count of active frames.
    #[must_use]
    pub fn active_count(&self) -> usize {
        let guard = self.state.lock();
        let state = guard.borrow();
        state.frames.len()
    }

    // ========================================================================
    // SECTION: Proxy Table
    // ========================================================================

    /// Issues an opaque proxy handle for a registered frame.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::UnknownFrame`] for unregistered ids.
    pub fn issue_proxy(&self, frame_id: Uuid) -> Result<String, FrameError> {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        if !state.frames.contains_key(&frame_id) {
            return Err(FrameError::UnknownFrame(frame_id));
        }
        let proxy_id = Uuid::new_v4().simple().to_string();
        let now = SystemTime::now();
        state.proxies.insert(
            proxy_id.clone(),
            ProxyEntry { frame_id, version: 0, created_at: now, last_accessed: now },
        );
        Ok(proxy_id)
    }

    /// Resolves a proxy to its entry, updating the access time.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::UnknownProxy`] for unknown or revoked proxies.
    pub fn resolve_proxy(&self, proxy_id: &str) -> Result<ProxyEntry, FrameError> {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        if state.revoked.contains(proxy_id) {
            return Err(FrameError::UnknownProxy(proxy_id.to_string()));
        }
        let entry = state
            .proxies
            .get_mut(proxy_id)
            .ok_or_else(|| FrameError::UnknownProxy(proxy_id.to_string()))?;
        entry.last_accessed = SystemTime::now();
        Ok(entry.clone())
    }

    /// Revokes a proxy; revoked proxies never become valid again.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::UnknownProxy`] for unknown proxies.
    pub fn revoke_proxy(&self, proxy_id: &str) -> Result<(), FrameError> {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        if state.proxies.remove(proxy_id).is_none() {
            return Err(FrameError::UnknownProxy(proxy_id.to_string()));
        }
        state.revoked.insert(proxy_id.to_string());
        Ok(())
    }
}
