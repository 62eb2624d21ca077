// elspeth-core/tests/retry.rs
// ============================================================================
// Module: Retry Manager Tests
// Description: Tests for backoff, attempt numbering, and exhaustion.
// ============================================================================
//! ## Overview
//! Attempt numbering is zero-based to match the audit field; `on_retry`
//! fires only when another attempt will occur; non-retryable errors
//! propagate unchanged on first occurrence; exhaustion carries the final
//! cause with a stable message format.

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

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

use elspeth_core::RetryConfig;
use elspeth_core::RetryConfigError;
use elspeth_core::RetryError;
use elspeth_core::RetryManager;

/// A quick config with negligible delays.
fn quick(max_attempts: u32) -> RetryManager {
    RetryManager::new(RetryConfig::new(max_attempts, 0.01, 0.05, 0.0, 2.0).unwrap())
}

/// A simple string error where "transient" marks retryable failures.
fn is_transient(error: &String) -> bool {
    error.contains("transient")
}

// ============================================================================
// SECTION: Retry Behavior
// ============================================================================

/// Tests a flaky operation succeeds on the third attempt.
#[tokio::test]
async fn test_retry_on_retryable_error() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);

    let result: Result<&str, RetryError<String>> = quick(3)
        .execute_with_retry(
            move || {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err("transient error".to_string())
                    } else {
                        Ok("success")
                    }
                }
            },
            is_transient,
            |_, _| {},
        )
        .await;

    assert_eq!(result.unwrap(), "success");
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

/// Tests non-retryable errors propagate unchanged after one call.
#[tokio::test]
async fn test_no_retry_on_non_retryable() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);

    let result: Result<(), RetryError<String>> = quick(3)
        .execute_with_retry(
            move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err("permanent failure".to_string())
                }
            },
            is_transient,
            |_, _| {},
        )
        .await;

    let Err(RetryError::NonRetryable(error)) = result else {
        panic!("expected non-retryable propagation");
    };
    assert_eq!(error, "permanent failure");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

/// Tests exhaustion reports the attempt count and message format.
#[tokio::test]
async fn test_max_attempts_exceeded() {
    let result: Result<(), RetryError<String>> = quick(2)
        .execute_with_retry(
            || async { Err("transient always".to_string()) },
            is_transient,
            |_, _| {},
        )
        .await;

    let Err(error @ RetryError::Exhausted { attempts, .. }) = result else {
        panic!("expected exhaustion");
    };
    assert_eq!(attempts, 2);
    assert_eq!(error.to_string(), "Max retries (2) exceeded: transient always");
}

// ============================================================================
// SECTION: The on_retry Hook
// ============================================================================

/// Tests on_retry receives zero-based attempt numbers.
#[tokio::test]
async fn test_on_retry_uses_zero_based_attempts() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let observed: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&observed);

    let result: Result<&str, RetryError<String>> = quick(3)
        .execute_with_retry(
            move || {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 1 {
                        Err("transient".to_string())
                    } else {
                        Ok("ok")
                    }
                }
            },
            is_transient,
            move |attempt, _| sink.lock().unwrap().push(attempt),
        )
        .await;

    assert_eq!(result.unwrap(), "ok");
    assert_eq!(*observed.lock().unwrap(), vec![0]);
}

/// Tests on_retry never fires when only one attempt is allowed.
#[tokio::test]
async fn test_on_retry_not_called_with_single_attempt() {
    let observed: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&observed);

    let result: Result<(), RetryError<String>> = quick(1)
        .execute_with_retry(
            || async { Err("transient".to_string()) },
            is_transient,
            move |attempt, _| sink.lock().unwrap().push(attempt),
        )
        .await;

    assert!(matches!(result, Err(RetryError::Exhausted { attempts: 1, .. })));
    assert!(observed.lock().unwrap().is_empty());
}

/// Tests on_retry fires for attempts 0 and 1, never the final one.
#[tokio::test]
async fn test_on_retry_not_called_on_final_attempt() {
    let observed: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&observed);

    let result: Result<(), RetryError<String>> = quick(3)
        .execute_with_retry(
            || async { Err("transient always".to_string()) },
            is_transient,
            move |attempt, _| sink.lock().unwrap().push(attempt),
        )
        .await;

    assert!(matches!(result, Err(RetryError::Exhausted { .. })));
    assert_eq!(*observed.lock().unwrap(), vec![0, 1]);
}

// ============================================================================
// SECTION: Configuration
// ============================================================================

/// Tests the default policy values.
#[test]
fn test_default_policy_values() {
    let config = RetryConfig::default_policy();
    assert_eq!(config.max_attempts, 3);
    assert!((config.base_delay - 1.0).abs() < f64::EPSILON);
    assert!((config.max_delay - 60.0).abs() < f64::EPSILON);
    assert!((config.jitter - 1.0).abs() < f64::EPSILON);
    assert!((config.exponential_base - 2.0).abs() < f64::EPSILON);
}

/// Tests invalid bounds are rejected with the offending value.
#[test]
fn test_invalid_config_rejected() {
    assert!(matches!(
        RetryConfig::new(0, 1.0, 60.0, 1.0, 2.0),
        Err(RetryConfigError::MaxAttempts(0))
    ));
    assert!(matches!(
        RetryConfig::new(3, 0.001, 60.0, 1.0, 2.0),
        Err(RetryConfigError::BaseDelay(_))
    ));
    assert!(matches!(
        RetryConfig::new(3, 1.0, 60.0, 1.0, 1.0),
        Err(RetryConfigError::ExponentialBase(_))
    ));
    assert!(matches!(
        RetryConfig::new(3, 1.0, 60.0, -0.5, 2.0),
        Err(RetryConfigError::Jitter(_))
    ));
}

/// Tests the no-retry factory allows exactly one attempt.
#[test]
fn test_no_retry_factory() {
    assert_eq!(RetryConfig::no_retry().max_attempts, 1);
}

/// Tests backoff growth respects the ceiling.
#[test]
fn test_backoff_growth_and_ceiling() {
    let config = RetryConfig::new(5, 1.0, 4.0, 0.0, 2.0).unwrap();
    assert!((config.backoff_seconds(1) - 1.0).abs() < f64::EPSILON);
    assert!((config.backoff_seconds(2) - 2.0).abs() < f64::EPSILON);
    assert!((config.backoff_seconds(3) - 4.0).abs() < f64::EPSILON);
    assert!((config.backoff_seconds(4) - 4.0).abs() < f64::EPSILON);
}
