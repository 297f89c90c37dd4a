//! Retry policy for retryable node failures.
//!
//! Applied around the activity call, before the dispatcher ever sees a
//! terminal failure: rate limits honour a server-supplied hint (clamped to
//! `[0, max_delay_ms]`), everything else retryable backs off exponentially
//! as `base_delay_ms * multiplier^attempt`, clamped the same way. Jitter is
//! available but off by default - backoff sequences are part of the
//! deterministic replay surface.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff configuration. Defaults match the platform contract:
/// 3 retries, 1s base, 30s cap, doubling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    /// Maximum retries after the first attempt.
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Multiply delays by a random factor in `[0.5, 1.5)`. Off by default.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter: false,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    pub fn with_base_delay(mut self, ms: u64) -> Self {
        self.base_delay_ms = ms;
        self
    }

    pub fn with_max_delay(mut self, ms: u64) -> Self {
        self.max_delay_ms = ms;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Whether another attempt is allowed after `attempts_failed` failures.
    pub fn should_retry(&self, attempts_failed: u32, retryable: bool) -> bool {
        retryable && attempts_failed <= self.max_retries
    }

    /// Exponential backoff for the given 0-indexed failed attempt.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let raw = self.base_delay_ms as f64 * self.multiplier.powi(attempt as i32);
        let clamped = raw.min(self.max_delay_ms as f64).max(0.0);
        let delayed = if self.jitter {
            use rand::Rng;
            clamped * rand::thread_rng().gen_range(0.5..1.5)
        } else {
            clamped
        };
        Duration::from_millis(delayed as u64)
    }

    /// Delay before the next attempt: a server hint wins (clamped to the
    /// cap), otherwise exponential backoff.
    pub fn delay_for(&self, attempt: u32, retry_after_secs: Option<u64>) -> Duration {
        match retry_after_secs {
            Some(hint_secs) => {
                let hint_ms = hint_secs.saturating_mul(1000).min(self.max_delay_ms);
                Duration::from_millis(hint_ms)
            }
            None => self.backoff_delay(attempt),
        }
    }
}
