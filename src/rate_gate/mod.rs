//! Token-bucket throttle shared by every caller of a rate-limited resource.
//!
//! Refill is computed lazily from elapsed time on each call, so an idle gate
//! costs nothing. All bucket arithmetic happens under one mutex which is never
//! held across an `.await`; waiters sleep for the computed deficit and re-check,
//! so tokens go to whichever waiter becomes satisfiable first.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::config::RateLimitConfig;
use crate::error::RateGateError;

const MIN_WAIT: Duration = Duration::from_millis(1);
/// Slowest supported refill, in tokens per second.
pub const MIN_RATE: f64 = 0.001;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket with capacity `burst` and refill rate `requests_per_second`.
///
/// Share it between tasks with `Arc<RateGate>`.
#[derive(Debug)]
pub struct RateGate {
    capacity: u32,
    rate: f64,
    bucket: Mutex<Bucket>,
}

impl RateGate {
    /// Create a gate that starts full.
    ///
    /// A zero burst is treated as 1 and a non-finite or non-positive rate as one
    /// token per second; [`crate::config::Config::from_env`] rejects both.
    /// Positive rates below [`MIN_RATE`] are raised to it.
    pub fn new(requests_per_second: f64, burst: u32) -> Self {
        let capacity = burst.max(1);
        let rate = if requests_per_second.is_finite() && requests_per_second > 0.0 {
            requests_per_second.max(MIN_RATE)
        } else {
            1.0
        };
        Self {
            capacity,
            rate,
            bucket: Mutex::new(Bucket {
                tokens: f64::from(capacity),
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.requests_per_second, config.burst)
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn requests_per_second(&self) -> f64 {
        self.rate
    }

    /// Tokens currently available (after lazy refill).
    pub fn available(&self) -> f64 {
        let mut bucket = self.lock();
        self.refill(&mut bucket);
        bucket.tokens
    }

    /// Take `n` tokens if they are available right now.
    pub fn try_acquire(&self, n: u32) -> Result<bool, RateGateError> {
        self.check_request(n)?;
        Ok(self.take_or_wait(n).is_none())
    }

    /// Wait until `n` tokens are available, then debit them.
    pub async fn acquire(&self, n: u32) -> Result<(), RateGateError> {
        self.check_request(n)?;
        while let Some(wait) = self.take_or_wait(n) {
            debug!(
                tokens = n,
                wait_ms = wait.as_millis(),
                "Rate gate saturated, waiting"
            );
            tokio::time::sleep(wait).await;
        }
        Ok(())
    }

    fn check_request(&self, n: u32) -> Result<(), RateGateError> {
        if n > self.capacity {
            return Err(RateGateError::ExceedsCapacity {
                requested: n,
                capacity: self.capacity,
            });
        }
        Ok(())
    }

    /// Debit `n` tokens and return `None`, or return how long until they could be.
    fn take_or_wait(&self, n: u32) -> Option<Duration> {
        let mut bucket = self.lock();
        self.refill(&mut bucket);

        let needed = f64::from(n);
        if bucket.tokens >= needed {
            bucket.tokens -= needed;
            return None;
        }

        let deficit = needed - bucket.tokens;
        Some(Duration::from_secs_f64(deficit / self.rate).max(MIN_WAIT))
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(bucket.last_refill);
        bucket.tokens =
            (bucket.tokens + elapsed.as_secs_f64() * self.rate).min(f64::from(self.capacity));
        bucket.last_refill = now;
    }

    fn lock(&self) -> MutexGuard<'_, Bucket> {
        // The bucket holds plain numbers, so a poisoned lock is still consistent.
        self.bucket.lock().unwrap_or_else(|e| e.into_inner())
    }
}
