//! Claim rate limiting.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::{FerryError, Result};

/// At most `max` claims per rolling `duration` window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub max: u32,
    pub duration: Duration,
}

impl RateLimit {
    pub fn new(max: u32, duration: Duration) -> Self {
        Self { max, duration }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max == 0 {
            return Err(FerryError::Config(
                "rate limit max must be at least 1".to_string(),
            ));
        }
        if self.duration.is_zero() {
            return Err(FerryError::Config(
                "rate limit duration must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Sliding-window log of recent claims.
///
/// Only successful claims are recorded, so polling an empty queue does not
/// eat into the budget.
#[derive(Debug)]
pub(crate) struct RateLimiter {
    limit: RateLimit,
    claims: VecDeque<Instant>,
}

impl RateLimiter {
    pub fn new(limit: RateLimit) -> Self {
        Self {
            limit,
            claims: VecDeque::new(),
        }
    }

    /// How long to wait before another claim fits in the window.
    pub fn wait_time(&mut self, now: Instant) -> Option<Duration> {
        while let Some(oldest) = self.claims.front() {
            if *oldest + self.limit.duration <= now {
                self.claims.pop_front();
            } else {
                break;
            }
        }

        if self.claims.len() < self.limit.max as usize {
            return None;
        }
        self.claims
            .front()
            .map(|oldest| (*oldest + self.limit.duration).saturating_duration_since(now))
    }

    pub fn record(&mut self, now: Instant) {
        self.claims.push_back(now);
    }

    /// Sleep until the window has room.
    pub async fn ready(&mut self) {
        while let Some(wait) = self.wait_time(Instant::now()) {
            tracing::trace!(wait_ms = wait.as_millis() as u64, "Rate limit reached, waiting");
            tokio::time::sleep(wait).await;
        }
    }
}
