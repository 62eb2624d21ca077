// elspeth-engine/src/batch.rs
// ============================================================================
// Module: Engine Batch Adapter
// Description: Shared output port routing worker results to per-attempt waiters.
// Purpose: Keep N rows in flight into one transform while discarding stale
//          results from timed-out attempts.
// Dependencies: elspeth-core, tokio
// ============================================================================

//! ## Overview
//! One adapter is connected to a transform's output side, but multiple
//! waiters can be registered, one per in-flight attempt, keyed by
//! `(token_id, state_id)`. Workers deliver through [`SharedBatchAdapter::
//! emit`]; the adapter routes each result to the matching waiter or
//! discards it silently when no waiter exists (a stale result from a
//! timed-out attempt).
//!
//! Retry safety: every retry opens a fresh `state_id`, so the retry's
//! waiter key never collides with the timed-out attempt's. A timeout
//! removes the waiter entry, which drops the receiving end; a late
//! `emit` then finds nothing to deliver to and nothing is leaked.
//!
//! Plugin bugs are not swallowed: workers wrap panics as
//! [`WorkerResult::Crashed`] and the waiter re-raises them to the
//! coordinator as errors, so orchestrator failures surface real bugs.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use elspeth_core::StateId;
use elspeth_core::TokenId;
use elspeth_core::interfaces::TransformResult;
use thiserror::Error;
use tokio::sync::oneshot;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors surfaced when waiting for a worker result.
#[derive(Debug, Error)]
pub enum WaitError {
    /// No result arrived within the timeout.
    #[error(
        "no result received for token {token_id} (state {state_id}) within {timeout_secs}s; \
         this may indicate a hung transform, rate limit exhaustion, or an insufficient timeout"
    )]
    Timeout {
        /// Token being processed.
        token_id: String,
        /// State of the attempt that timed out.
        state_id: String,
        /// Timeout that elapsed, in seconds.
        timeout_secs: u64,
    },
    /// The worker crashed with a plugin bug; the panic is re-raised here.
    #[error("plugin worker crashed: {0}")]
    WorkerCrashed(String),
    /// The adapter was cleared while the waiter was pending.
    #[error("batch adapter cleared while waiting for token {0}")]
    Cleared(String),
}

// ============================================================================
// SECTION: Worker Results
// ============================================================================

/// Result delivered by a worker through the shared output port.
#[derive(Debug)]
pub enum WorkerResult {
    /// The transform returned normally.
    Finished(TransformResult),
    /// The transform panicked; the rendering is re-raised to the caller.
    Crashed(String),
}

/// Waiter key: one in-flight attempt.
type WaiterKey = (TokenId, StateId);

// ============================================================================
// SECTION: Shared Batch Adapter
// ============================================================================

/// Shared output port adapter for worker-executed transforms.
#[derive(Clone, Default)]
pub struct SharedBatchAdapter {
    /// Pending waiters keyed by `(token_id, state_id)`.
    waiters: Arc<Mutex<HashMap<WaiterKey, oneshot::Sender<WorkerResult>>>>,
}

impl SharedBatchAdapter {
    /// Creates an empty adapter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a waiter for one attempt.
    ///
    /// Must be called before the worker for that attempt is started.
    #[must_use]
    pub fn register(&self, token_id: TokenId, state_id: StateId) -> RowWaiter {
        let (sender, receiver) = oneshot::channel();
        let key = (token_id.clone(), state_id.clone());
        if let Ok(mut waiters) = self.waiters.lock() {
            waiters.insert(key.clone(), sender);
        }
        RowWaiter { key, receiver, waiters: Arc::clone(&self.waiters) }
    }

    /// Delivers a worker result to the matching waiter.
    ///
    /// A `state_id` of `None`, or a key with no registered waiter, means
    /// the result is discarded: the stale-result path for timed-out
    /// attempts. Nothing is stored for unmatched results.
    pub fn emit(&self, token_id: &TokenId, state_id: Option<&StateId>, result: WorkerResult) {
        let Some(state_id) = state_id else {
            return;
        };
        let sender = self
            .waiters
            .lock()
            .ok()
            .and_then(|mut waiters| waiters.remove(&(token_id.clone(), state_id.clone())));
        if let Some(sender) = sender {
            // A failed send means the waiter timed out between removal and
            // delivery; the result is dropped, matching the stale path.
            let _ = sender.send(result);
        }
    }

    /// Returns the number of pending waiters.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.waiters.lock().map(|waiters| waiters.len()).unwrap_or(0)
    }

    /// Drops every pending waiter (test and shutdown support).
    pub fn clear(&self) {
        if let Ok(mut waiters) = self.waiters.lock() {
            waiters.clear();
        }
    }
}

// ============================================================================
// SECTION: Row Waiter
// ============================================================================

/// Waiter for a specific attempt's result.
pub struct RowWaiter {
    /// Attempt key.
    key: WaiterKey,
    /// Receiving end of the attempt's channel.
    receiver: oneshot::Receiver<WorkerResult>,
    /// Shared waiter map, for timeout cleanup.
    waiters: Arc<Mutex<HashMap<WaiterKey, oneshot::Sender<WorkerResult>>>>,
}

impl RowWaiter {
    /// Blocks until this attempt's result arrives.
    ///
    /// On timeout the waiter entry is removed, so a late result from this
    /// attempt is discarded by `emit` instead of leaking.
    ///
    /// # Errors
    ///
    /// Returns [`WaitError::Timeout`] when no result arrives in time,
    /// [`WaitError::WorkerCrashed`] when the plugin panicked, and
    /// [`WaitError::Cleared`] when the adapter was torn down.
    pub async fn wait(self, timeout: Duration) -> Result<TransformResult, WaitError> {
        let outcome = tokio::time::timeout(timeout, self.receiver).await;
        match outcome {
            Err(_) => {
                if let Ok(mut waiters) = self.waiters.lock() {
                    waiters.remove(&self.key);
                }
                Err(WaitError::Timeout {
                    token_id: self.key.0.to_string(),
                    state_id: self.key.1.to_string(),
                    timeout_secs: timeout.as_secs(),
                })
            }
            Ok(Err(_)) => Err(WaitError::Cleared(self.key.0.to_string())),
            Ok(Ok(WorkerResult::Finished(result))) => Ok(result),
            Ok(Ok(WorkerResult::Crashed(message))) => Err(WaitError::WorkerCrashed(message)),
        }
    }
}
