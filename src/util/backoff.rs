use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_INITIAL_DELAY_MILLIS: u64 = 1_000;
pub const DEFAULT_MAX_DELAY_MILLIS: u64 = 5_000;
pub const DEFAULT_MULTIPLIER: f64 = 1.5;

/// Bounded exponential backoff settings.
///
/// `jitter` is a ratio in `[0, 1]`; a jitter of `0.5` spreads each delay uniformly over
/// `delay * [0.5, 1.5]` before clamping to `max_delay_millis`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackoffConfig {
    pub max_attempts: u32,
    pub initial_delay_millis: u64,
    pub max_delay_millis: u64,
    pub multiplier: f64,
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_delay_millis: DEFAULT_INITIAL_DELAY_MILLIS,
            max_delay_millis: DEFAULT_MAX_DELAY_MILLIS,
            multiplier: DEFAULT_MULTIPLIER,
            jitter: 0.0,
        }
    }
}

impl BackoffConfig {
    /// Retries immediately, useful for tests and for transports that pace themselves.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay_millis: 0,
            max_delay_millis: 0,
            multiplier: 1.0,
            jitter: 0.0,
        }
    }
}

/// Tracks consumed attempts against a [`BackoffConfig`].
#[derive(Debug, Clone)]
pub struct BackoffState {
    config: BackoffConfig,
    attempt: u32,
}

impl BackoffState {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.config.max_attempts
    }

    /// Consumes one attempt and returns the delay to wait before it, or `None` once the
    /// attempt budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.next_delay_with_rng(&mut rand::thread_rng())
    }

    pub fn next_delay_with_rng<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }

        let base = (self.config.initial_delay_millis as f64) * self.config.multiplier.powi(self.attempt as i32);
        let jitter = self.config.jitter.clamp(0.0, 1.0);
        let spread = if jitter > 0.0 {
            base * jitter * rng.gen_range(-1.0..=1.0)
        } else {
            0.0
        };
        let millis = (base + spread)
            .round()
            .clamp(0.0, self.config.max_delay_millis as f64);

        self.attempt += 1;
        Some(Duration::from_millis(millis as u64))
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn delays_grow_until_capped() {
        let mut backoff = BackoffState::new(BackoffConfig {
            max_attempts: 4,
            initial_delay_millis: 1_000,
            max_delay_millis: 2_000,
            multiplier: 1.5,
            jitter: 0.0,
        });

        let delays: Vec<_> = std::iter::from_fn(|| backoff.next_delay()).collect();
        assert_eq!(
            delays,
            [
                Duration::from_millis(1_000),
                Duration::from_millis(1_500),
                Duration::from_millis(2_000),
                Duration::from_millis(2_000),
            ]
        );
        assert!(backoff.is_exhausted());
    }

    #[test]
    fn reset_restores_attempt_budget() {
        let mut backoff = BackoffState::new(BackoffConfig::immediate(1));
        assert_eq!(backoff.next_delay(), Some(Duration::ZERO));
        assert_eq!(backoff.next_delay(), None);
        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        assert_eq!(backoff.next_delay(), Some(Duration::ZERO));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let config = BackoffConfig {
            jitter: 0.5,
            ..BackoffConfig::default()
        };
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..32 {
            let mut backoff = BackoffState::new(config);
            let delay = backoff.next_delay_with_rng(&mut rng).unwrap();
            assert!(delay >= Duration::from_millis(500));
            assert!(delay <= Duration::from_millis(1_500));
        }
    }

    #[test]
    fn zero_attempts_never_retries() {
        let mut backoff = BackoffState::new(BackoffConfig::immediate(0));
        assert!(backoff.is_exhausted());
        assert_eq!(backoff.next_delay(), None);
    }
}
