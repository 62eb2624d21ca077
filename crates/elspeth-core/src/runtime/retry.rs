// elspeth-core/src/runtime/retry.rs
// ============================================================================
// Module: ELSPETH Retry Manager
// Description: Exponential backoff with jitter and a pluggable predicate.
// Purpose: Re-attempt retryable failures; attempt numbering matches the audit.
// Dependencies: rand, thiserror, tokio
// ============================================================================

//! ## Overview
//! The retry manager re-runs an operation while a caller-supplied predicate
//! marks its failures retryable. Attempt numbering is zero-based to match
//! the audit field: the `on_retry` hook observes the attempt that just
//! failed, and fires only when another attempt will follow; with
//! `max_attempts = N` it fires at most `N - 1` times. Non-retryable errors
//! propagate unchanged on first occurrence. Exhaustion yields
//! [`RetryError::Exhausted`] carrying the final cause.
//!
//! The delay before attempt `k` (k >= 1) is
//! `min(max_delay, base_delay * exponential_base^(k-1))` multiplied by a
//! jitter factor drawn uniformly from `[0, jitter]`.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fmt::Display;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors raised when validating a retry configuration.
#[derive(Debug, Error, PartialEq)]
pub enum RetryConfigError {
    /// `max_attempts` must be at least one.
    #[error("max_attempts must be >= 1, got {0}")]
    MaxAttempts(u32),
    /// `base_delay` must be at least 10 milliseconds.
    #[error("base_delay must be >= 0.01 seconds, got {0}")]
    BaseDelay(f64),
    /// `exponential_base` must exceed one.
    #[error("exponential_base must be > 1, got {0}")]
    ExponentialBase(f64),
    /// `jitter` must be non-negative.
    #[error("jitter must be >= 0, got {0}")]
    Jitter(f64),
}

/// Failure of a retried operation.
#[derive(Debug, Error)]
pub enum RetryError<E: Display + std::fmt::Debug> {
    /// The first failure was not retryable; the error is unchanged.
    #[error("{0}")]
    NonRetryable(E),
    /// Every attempt failed.
    #[error("Max retries ({attempts}) exceeded: {last_error}")]
    Exhausted {
        /// Number of attempts taken.
        attempts: u32,
        /// The final attempt's error.
        last_error: E,
    },
}

// ============================================================================
// SECTION: Configuration
// ============================================================================

/// Runtime retry configuration.
///
/// # Invariants
/// - `max_attempts >= 1`, `base_delay >= 0.01`, `exponential_base > 1`,
///   `jitter >= 0`.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first.
    pub max_attempts: u32,
    /// Base delay in seconds.
    pub base_delay: f64,
    /// Delay ceiling in seconds.
    pub max_delay: f64,
    /// Jitter factor upper bound.
    pub jitter: f64,
    /// Exponential growth base.
    pub exponential_base: f64,
}

impl RetryConfig {
    /// Creates a validated configuration.
    ///
    /// # Errors
    ///
    /// Returns [`RetryConfigError`] when any bound is violated.
    pub fn new(
        max_attempts: u32,
        base_delay: f64,
        max_delay: f64,
        jitter: f64,
        exponential_base: f64,
    ) -> Result<Self, RetryConfigError> {
        if max_attempts < 1 {
            return Err(RetryConfigError::MaxAttempts(max_attempts));
        }
        if base_delay < 0.01 {
            return Err(RetryConfigError::BaseDelay(base_delay));
        }
        if exponential_base <= 1.0 {
            return Err(RetryConfigError::ExponentialBase(exponential_base));
        }
        if jitter < 0.0 {
            return Err(RetryConfigError::Jitter(jitter));
        }
        Ok(Self { max_attempts, base_delay, max_delay, jitter, exponential_base })
    }

    /// The default policy: three attempts, one-second base, 60-second cap.
    #[must_use]
    pub const fn default_policy() -> Self {
        Self {
            max_attempts: 3,
            base_delay: 1.0,
            max_delay: 60.0,
            jitter: 1.0,
            exponential_base: 2.0,
        }
    }

    /// A single-attempt policy: safe default when no policy is configured.
    #[must_use]
    pub const fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            base_delay: 0.01,
            max_delay: 0.01,
            jitter: 0.0,
            exponential_base: 2.0,
        }
    }

    /// Computes the pre-jitter delay before attempt `k` (1-based).
    #[must_use]
    pub fn backoff_seconds(&self, attempt: u32) -> f64 {
        let exponent = attempt.saturating_sub(1);
        let raw = self.base_delay * self.exponential_base.powi(exponent.try_into().unwrap_or(i32::MAX));
        raw.min(self.max_delay)
    }
}

// ============================================================================
// SECTION: Retry Manager
// ============================================================================

/// Executes operations under a retry policy.
#[derive(Debug, Clone, Copy)]
pub struct RetryManager {
    /// Active retry configuration.
    config: RetryConfig,
}

impl RetryManager {
    /// Creates a retry manager.
    #[must_use]
    pub const fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Returns the active configuration.
    #[must_use]
    pub const fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Runs `op` until it succeeds, a failure is non-retryable, or attempts
    /// are exhausted.
    ///
    /// `on_retry(attempt, error)` receives the zero-based attempt that just
    /// failed and is called only when another attempt will occur.
    ///
    /// # Errors
    ///
    /// Returns [`RetryError::NonRetryable`] with the unchanged error, or
    /// [`RetryError::Exhausted`] after `max_attempts` failures.
    pub async fn execute_with_retry<T, E, Op, Fut, P, H>(
        &self,
        mut op: Op,
        is_retryable: P,
        mut on_retry: H,
    ) -> Result<T, RetryError<E>>
    where
        E: Display + std::fmt::Debug,
        Op: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        H: FnMut(u32, &E),
    {
        let mut attempt: u32 = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    if !is_retryable(&error) {
                        return Err(RetryError::NonRetryable(error));
                    }
                    let next_attempt = attempt + 1;
                    if next_attempt >= self.config.max_attempts {
                        return Err(RetryError::Exhausted {
                            attempts: self.config.max_attempts,
                            last_error: error,
                        });
                    }
                    on_retry(attempt, &error);
                    let delay = self.jittered_delay(next_attempt);
                    tokio::time::sleep(delay).await;
                    attempt = next_attempt;
                }
            }
        }
    }

    /// Applies the jitter factor to the backoff for attempt `k` (1-based).
    fn jittered_delay(&self, attempt: u32) -> Duration {
        let base = self.config.backoff_seconds(attempt);
        let factor = if self.config.jitter > 0.0 {
            rand::thread_rng().gen_range(0.0..=self.config.jitter)
        } else {
            0.0
        };
        Duration::from_secs_f64((base * factor).max(0.0))
    }
}
