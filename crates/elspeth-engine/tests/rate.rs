// elspeth-engine/tests/rate.rs
// ============================================================================
// Module: Rate Limiter Tests
// Description: Token-bucket admission behavior.
// ============================================================================
//! ## Overview
//! The limiter admits up to `capacity` calls per window immediately and
//! suspends callers until the window refills.

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

use std::time::Instant;

use elspeth_engine::RateLimiter;

/// Tests calls within capacity are admitted without delay.
#[tokio::test]
async fn test_within_capacity_is_immediate() {
    let limiter = RateLimiter::new(3, 60.0);
    let started = Instant::now();
    for _ in 0..3 {
        limiter.acquire().await;
    }
    assert!(started.elapsed().as_millis() < 100);
}

/// Tests exceeding capacity suspends until the window refills.
#[tokio::test]
async fn test_exceeding_capacity_waits_for_refill() {
    let limiter = RateLimiter::new(2, 0.05);
    let started = Instant::now();
    for _ in 0..3 {
        limiter.acquire().await;
    }
    // The third permit had to wait for the 50ms window to roll over.
    assert!(started.elapsed().as_millis() >= 40);
}
