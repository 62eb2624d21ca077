// elspeth-engine/src/rate.rs
// ============================================================================
// Module: Engine Rate Limiter
// Description: Token-bucket admission for external calls.
// Purpose: Bound call rates without holding any cross-token lock.
// Dependencies: tokio
// ============================================================================

//! ## Overview
//! A small token bucket: `capacity` permits refill every `per_seconds`.
//! `acquire` suspends the coordinator until a permit is available. The
//! limiter holds only its own state; admission never blocks other tokens'
//! audit writes.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

// ============================================================================
// SECTION: Rate Limiter
// ============================================================================

/// Internal bucket state.
#[derive(Debug)]
struct Bucket {
    /// Permits remaining in the current window.
    remaining: u32,
    /// When the current window opened.
    window_start: Instant,
}

/// Token-bucket rate limiter.
#[derive(Debug)]
pub struct RateLimiter {
    /// Permits per window.
    capacity: u32,
    /// Window length.
    window: Duration,
    /// Bucket state.
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// Creates a limiter issuing `capacity` permits every `per_seconds`.
    #[must_use]
    pub fn new(capacity: u32, per_seconds: f64) -> Self {
        Self {
            capacity: capacity.max(1),
            window: Duration::from_secs_f64(per_seconds.max(0.001)),
            bucket: Mutex::new(Bucket { remaining: capacity.max(1), window_start: Instant::now() }),
        }
    }

    /// Acquires one permit, suspending until the window refills if needed.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let Ok(mut bucket) = self.bucket.lock() else {
                    return;
                };
                let elapsed = bucket.window_start.elapsed();
                if elapsed >= self.window {
                    bucket.remaining = self.capacity;
                    bucket.window_start = Instant::now();
                }
                if bucket.remaining > 0 {
                    bucket.remaining -= 1;
                    None
                } else {
                    Some(self.window.saturating_sub(bucket.window_start.elapsed()))
                }
            };
            match wait {
                None => return,
                Some(delay) => tokio::time::sleep(delay.max(Duration::from_millis(1))).await,
            }
        }
    }
}
