//! Exponential backoff with jitter for connection attempts.
//!
//! After a failed dial the manager waits [`ExponentialBackoff::next_delay`]
//! before trying again. The delay doubles per attempt up to a cap and is
//! reset once a connection opens.

use std::time::Duration;

use rand::Rng;

/// Configuration for connect backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Delay before the first retry. Default: 1 s.
    pub initial_delay: Duration,
    /// Multiplier applied after each failed attempt. Default: 2.0.
    pub multiplier: f64,
    /// Upper bound for a single delay. Default: 16 s.
    pub max_delay: Duration,
    /// Give up after this many attempts. `None` retries forever (default).
    pub max_attempts: Option<u32>,
    /// Jitter factor (0.0–1.0), applied as ±jitter. Default: 0.25.
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(16),
            max_attempts: None,
            jitter: 0.25,
        }
    }
}

/// Attempt counter and delay generator.
#[derive(Debug)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
    attempts: u32,
    current_delay: Duration,
}

impl ExponentialBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        let initial = config.initial_delay;
        Self {
            config,
            attempts: 0,
            current_delay: initial,
        }
    }

    /// Compute the next delay and advance the attempt counter.
    /// Returns `None` once `max_attempts` is exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self
            .config
            .max_attempts
            .is_some_and(|max| self.attempts >= max)
        {
            return None;
        }

        let base = self.current_delay;
        self.attempts = self.attempts.saturating_add(1);

        // Uniform in [base * (1 - jitter), base * (1 + jitter)].
        let jittered = if self.config.jitter > 0.0 {
            let factor = rand::rng()
                .random_range((1.0 - self.config.jitter)..=(1.0 + self.config.jitter));
            base.mul_f64(factor)
        } else {
            base
        };

        let next = self.current_delay.mul_f64(self.config.multiplier);
        self.current_delay = next.min(self.config.max_delay);

        Some(jittered.min(self.config.max_delay))
    }

    /// Called after a successful connection.
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.current_delay = self.config.initial_delay;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}
