//! Exponential reconnect backoff with optional full jitter

use crate::config::BackoffConfig;
use rand::Rng;
use std::time::Duration;

/// Delay schedule for consecutive failed connect attempts
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    failures: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            failures: 0,
        }
    }

    /// Delay ceiling after `failures` consecutive failures: `min(cap, base * factor^n)`
    pub fn ceiling(&self, failures: u32) -> Duration {
        let growth = (self.config.factor.max(1) as u64)
            .checked_pow(failures)
            .unwrap_or(u64::MAX);
        let millis = self
            .config
            .base_ms
            .saturating_mul(growth)
            .min(self.config.cap_ms);
        Duration::from_millis(millis)
    }

    /// Record a failed attempt and return how long to wait before the next one
    pub fn next_delay(&mut self) -> Duration {
        let ceiling = self.ceiling(self.failures);
        self.failures = self.failures.saturating_add(1);

        if self.config.jitter {
            let millis = ceiling.as_millis() as u64;
            Duration::from_millis(rand::thread_rng().gen_range(0..=millis))
        } else {
            ceiling
        }
    }

    /// Forget past failures after a successful connect
    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}
