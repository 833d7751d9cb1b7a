//! Exponential backoff with jitter for endpoint polling and routing
//!
//! One [`BackoffState`] tracks one endpoint. State is never shared between
//! endpoints; the owner decides when to consult it.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Failures beyond this count no longer grow the exponent.
pub const MAX_EXPONENT: u32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_ms: u64,
    pub max_ms: u64,
    pub factor: u32,
    pub jitter_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: 4_000,
            max_ms: 60_000,
            factor: 2,
            jitter_ms: 250,
        }
    }
}

impl BackoffConfig {
    /// Delay before jitter for the given consecutive failure count (>= 1).
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(MAX_EXPONENT);
        let growth = (self.factor.max(1) as u64).saturating_pow(exponent);
        Duration::from_millis(self.base_ms.saturating_mul(growth).min(self.max_ms))
    }
}

#[derive(Debug, Clone)]
pub struct BackoffState {
    config: BackoffConfig,
    failures: u32,
    next_allowed_at: Option<Instant>,
}

impl BackoffState {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            failures: 0,
            next_allowed_at: None,
        }
    }

    pub fn can_attempt(&self, now: Instant) -> bool {
        self.next_allowed_at.map_or(true, |at| now >= at)
    }

    pub fn record_success(&mut self) {
        self.failures = 0;
        self.next_allowed_at = None;
    }

    /// Register a failure and return the full delay (including jitter)
    /// until the next attempt is allowed.
    pub fn record_failure(&mut self, now: Instant) -> Duration {
        self.failures = self.failures.saturating_add(1);
        let jitter = if self.config.jitter_ms > 0 {
            rand::thread_rng().gen_range(0..self.config.jitter_ms)
        } else {
            0
        };
        let delay = self.config.delay_for(self.failures) + Duration::from_millis(jitter);
        self.next_allowed_at = Some(now + delay);
        delay
    }

    /// Time remaining until the next attempt is allowed.
    pub fn retry_in(&self, now: Instant) -> Duration {
        self.next_allowed_at
            .map(|at| at.saturating_duration_since(now))
            .unwrap_or_default()
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn next_allowed_at(&self) -> Option<Instant> {
        self.next_allowed_at
    }
}

impl Default for BackoffState {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}
