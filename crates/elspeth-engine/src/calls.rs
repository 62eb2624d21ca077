// elspeth-engine/src/calls.rs
// ============================================================================
// Module: Engine Call Gateway
// Description: External call recording, replay, and verification.
// Purpose: Make every external call traceable by request hash and replayable
//          from a recorded source run.
// Dependencies: elspeth-core, elspeth-landscape, serde_json
// ============================================================================

//! ## Overview
//! On LIVE runs every external call passes through the gateway: the request
//! hash (`stable_hash` of the request data) is the replay key, the request
//! body goes to the payload store, sensitive headers are elided by the
//! filter below, and the call row is written under the current OPEN state.
//!
//! On REPLAY the external client is never invoked: the recorded response
//! for `(call_type, request_hash)` under the source run is returned. A miss
//! raises [`CallError::ReplayMiss`]; a successful call whose payload is
//! gone raises [`CallError::ReplayPayloadMissing`]; recorded ERROR calls
//! are returned with an empty body.
//!
//! On VERIFY the real call is issued and its bytes are compared against the
//! recorded ones; divergences are recorded, not raised.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;
use std::time::Instant;

use elspeth_core::CallId;
use elspeth_core::CallRecord;
use elspeth_core::CallStatus;
use elspeth_core::CallType;
use elspeth_core::RunId;
use elspeth_core::RunMode;
use elspeth_core::StateId;
use elspeth_core::interfaces::PayloadStore;
use elspeth_core::stable_hash;
use elspeth_landscape::Landscape;
use elspeth_landscape::LandscapeError;
use serde_json::Value;
use thiserror::Error;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Maximum stored size for non-JSON response bodies.
pub const MAX_TEXT_BODY_BYTES: usize = 100 * 1024;

/// Request header names always elided from the audit record.
const REQUEST_HEADER_DENYLIST: &[&str] =
    &["authorization", "x-api-key", "api-key", "x-auth-token", "proxy-authorization"];

/// Substrings that mark a request header as sensitive.
const REQUEST_HEADER_DENY_SUBSTRINGS: &[&str] = &["auth", "key", "secret", "token"];

/// Response header names elided from the audit record.
const RESPONSE_HEADER_DENYLIST: &[&str] =
    &["set-cookie", "www-authenticate", "proxy-authenticate", "x-auth-token"];

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors raised by the call gateway.
#[derive(Debug, Error)]
pub enum CallError {
    /// The transport failed to execute the call.
    #[error("external call failed: {0}")]
    Transport(String),
    /// No recorded call matched the request hash on replay.
    #[error("replay miss for {} request hash {request_hash}", call_type.as_str())]
    ReplayMiss {
        /// Call type of the missed request.
        call_type: CallType,
        /// Stable hash of the request.
        request_hash: String,
        /// The request data that missed.
        request: Value,
    },
    /// A recorded successful call has no retrievable response payload.
    #[error("replay payload missing for call {call_id} (hash {request_hash})")]
    ReplayPayloadMissing {
        /// The recorded call whose payload is gone.
        call_id: String,
        /// Stable hash of the request.
        request_hash: String,
    },
    /// Replay and verify require a source run.
    #[error("run mode {} requires a source_run_id", .0.as_str())]
    MissingSourceRun(RunMode),
    /// Audit store failure.
    #[error(transparent)]
    Landscape(#[from] LandscapeError),
    /// Hashing failure.
    #[error(transparent)]
    Hash(#[from] elspeth_core::HashError),
    /// Payload store failure.
    #[error(transparent)]
    Payload(#[from] elspeth_core::PayloadStoreError),
}

// ============================================================================
// SECTION: Requests and Responses
// ============================================================================

/// An external call request as presented to the gateway.
#[derive(Debug, Clone)]
pub struct CallRequest {
    /// Call type.
    pub call_type: CallType,
    /// Canonicalizable request data; its stable hash is the replay key.
    pub data: Value,
    /// Request headers; sensitive names are elided before recording.
    pub headers: Vec<(String, String)>,
}

/// An external call response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallResponse {
    /// Call status.
    pub status: CallStatus,
    /// Raw response body bytes.
    pub body: Vec<u8>,
    /// Response headers after elision.
    pub headers: Vec<(String, String)>,
    /// Wall-clock latency, when the call was actually made.
    pub latency_ms: Option<i64>,
    /// Error rendering for failed calls.
    pub error: Option<String>,
}

/// Transport that actually executes external calls.
pub trait CallTransport: Send + Sync {
    /// Executes the call.
    ///
    /// # Errors
    ///
    /// Returns a rendering of the transport failure.
    fn execute(&self, request: &CallRequest) -> Result<CallResponse, String>;
}

/// One divergence observed in verify mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Divergence {
    /// Stable hash of the diverging request.
    pub request_hash: String,
    /// Hash of the recorded response.
    pub recorded_hash: Option<String>,
    /// Hash of the live response.
    pub live_hash: String,
}

// ============================================================================
// SECTION: Header Filtering
// ============================================================================

/// Elides sensitive request headers by exact name and substring match.
#[must_use]
pub fn filter_request_headers(headers: &[(String, String)]) -> Vec<(String, String)> {
    headers
        .iter()
        .filter(|(name, _)| {
            let lowered = name.to_ascii_lowercase();
            !REQUEST_HEADER_DENYLIST.contains(&lowered.as_str())
                && !REQUEST_HEADER_DENY_SUBSTRINGS
                    .iter()
                    .any(|needle| lowered.contains(needle))
        })
        .cloned()
        .collect()
}

/// Elides sensitive response headers by exact name.
#[must_use]
pub fn filter_response_headers(headers: &[(String, String)]) -> Vec<(String, String)> {
    headers
        .iter()
        .filter(|(name, _)| {
            let lowered = name.to_ascii_lowercase();
            !RESPONSE_HEADER_DENYLIST.contains(&lowered.as_str())
        })
        .cloned()
        .collect()
}

/// Prepares a response body for storage: JSON stays structured, anything
/// else is truncated text.
fn storable_body(body: &[u8]) -> Vec<u8> {
    if serde_json::from_slice::<Value>(body).is_ok() {
        return body.to_vec();
    }
    body.iter().copied().take(MAX_TEXT_BODY_BYTES).collect()
}

// ============================================================================
// SECTION: Call Gateway
// ============================================================================

/// Records, replays, or verifies external calls per the run mode.
pub struct CallGateway {
    /// Audit store.
    landscape: Landscape,
    /// Payload store for request and response bodies.
    payloads: Arc<dyn PayloadStore>,
    /// Run mode in effect.
    mode: RunMode,
    /// Source run for replay and verify.
    source_run_id: Option<RunId>,
    /// Divergences observed in verify mode.
    divergences: std::sync::Mutex<Vec<Divergence>>,
}

impl CallGateway {
    /// Creates a gateway for a run.
    #[must_use]
    pub fn new(
        landscape: Landscape,
        payloads: Arc<dyn PayloadStore>,
        mode: RunMode,
        source_run_id: Option<RunId>,
    ) -> Self {
        Self { landscape, payloads, mode, source_run_id, divergences: std::sync::Mutex::new(Vec::new()) }
    }

    /// Returns the divergences observed so far (verify mode).
    #[must_use]
    pub fn divergences(&self) -> Vec<Divergence> {
        self.divergences.lock().map(|seen| seen.clone()).unwrap_or_default()
    }

    /// Executes one external call under the current OPEN state.
    ///
    /// # Errors
    ///
    /// Returns [`CallError`] per the active mode's rules.
    pub fn invoke(
        &self,
        state_id: &StateId,
        call_index: u32,
        request: &CallRequest,
        transport: &dyn CallTransport,
    ) -> Result<CallResponse, CallError> {
        let request_hash = stable_hash(&request.data)?;
        match self.mode {
            RunMode::Live => self.invoke_live(state_id, call_index, request, &request_hash, transport),
            RunMode::Replay => self.replay(&request_hash, request),
            RunMode::Verify => {
                self.verify(state_id, call_index, request, &request_hash, transport)
            }
        }
    }

    /// LIVE path: execute, record, return.
    fn invoke_live(
        &self,
        state_id: &StateId,
        call_index: u32,
        request: &CallRequest,
        request_hash: &str,
        transport: &dyn CallTransport,
    ) -> Result<CallResponse, CallError> {
        let request_bytes = elspeth_core::canonical_json_bytes(&request.data)?;
        let request_ref = self.payloads.store(&request_bytes)?;

        let started = Instant::now();
        let outcome = transport.execute(request);
        let latency_ms = i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX);

        match outcome {
            Ok(mut response) => {
                response.headers = filter_response_headers(&response.headers);
                response.latency_ms = Some(latency_ms);
                let body = storable_body(&response.body);
                let response_ref = self.payloads.store(&body)?;
                let response_hash = elspeth_core::hash_bytes(&response.body);
                self.landscape.record_call(&CallRecord {
                    call_id: CallId::generate(),
                    state_id: state_id.clone(),
                    call_index,
                    call_type: request.call_type,
                    status: response.status,
                    request_hash: request_hash.to_string(),
                    request_ref: Some(request_ref),
                    response_hash: Some(response_hash),
                    response_ref: Some(response_ref),
                    latency_ms: Some(latency_ms),
                    error: response.error.clone(),
                })?;
                Ok(response)
            }
            Err(message) => {
                self.landscape.record_call(&CallRecord {
                    call_id: CallId::generate(),
                    state_id: state_id.clone(),
                    call_index,
                    call_type: request.call_type,
                    status: CallStatus::Error,
                    request_hash: request_hash.to_string(),
                    request_ref: Some(request_ref),
                    response_hash: None,
                    response_ref: None,
                    latency_ms: Some(latency_ms),
                    error: Some(message.clone()),
                })?;
                Err(CallError::Transport(message))
            }
        }
    }

    /// REPLAY path: return the recorded response, never call out.
    fn replay(&self, request_hash: &str, request: &CallRequest) -> Result<CallResponse, CallError> {
        let source_run = self
            .source_run_id
            .as_ref()
            .ok_or(CallError::MissingSourceRun(RunMode::Replay))?;
        let recorded = self
            .landscape
            .find_recorded_call(source_run, request.call_type, request_hash)?
            .ok_or_else(|| CallError::ReplayMiss {
                call_type: request.call_type,
                request_hash: request_hash.to_string(),
                request: request.data.clone(),
            })?;
        match recorded.status {
            CallStatus::Error => Ok(CallResponse {
                status: CallStatus::Error,
                body: Vec::new(),
                headers: Vec::new(),
                latency_ms: recorded.latency_ms,
                error: recorded.error,
            }),
            CallStatus::Success => {
                let response_ref =
                    recorded.response_ref.as_deref().ok_or(CallError::ReplayPayloadMissing {
                        call_id: recorded.call_id.to_string(),
                        request_hash: request_hash.to_string(),
                    })?;
                let body = self.payloads.fetch(response_ref).map_err(|_| {
                    CallError::ReplayPayloadMissing {
                        call_id: recorded.call_id.to_string(),
                        request_hash: request_hash.to_string(),
                    }
                })?;
                Ok(CallResponse {
                    status: CallStatus::Success,
                    body,
                    headers: Vec::new(),
                    latency_ms: recorded.latency_ms,
                    error: None,
                })
            }
        }
    }

    /// VERIFY path: issue the real call, compare against the recording.
    fn verify(
        &self,
        state_id: &StateId,
        call_index: u32,
        request: &CallRequest,
        request_hash: &str,
        transport: &dyn CallTransport,
    ) -> Result<CallResponse, CallError> {
        let source_run = self
            .source_run_id
            .as_ref()
            .ok_or(CallError::MissingSourceRun(RunMode::Verify))?
            .clone();
        let response = self.invoke_live(state_id, call_index, request, request_hash, transport)?;
        let recorded = self
            .landscape
            .find_recorded_call(&source_run, request.call_type, request_hash)?;
        let live_hash = elspeth_core::hash_bytes(&response.body);
        let recorded_hash = recorded.and_then(|call| call.response_hash);
        if recorded_hash.as_deref() != Some(live_hash.as_str()) {
            if let Ok(mut seen) = self.divergences.lock() {
                seen.push(Divergence {
                    request_hash: request_hash.to_string(),
                    recorded_hash,
                    live_hash,
                });
            }
        }
        Ok(response)
    }
}
