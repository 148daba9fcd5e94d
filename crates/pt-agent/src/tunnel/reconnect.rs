//! Reconnect delays for the directory link

use std::time::Duration;

use pt_core::config::BackoffConfig;

/// Exponential backoff with proportional jitter
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial: Duration,
    current: Duration,
    max: Duration,
    multiplier: f64,
    /// Fraction of the base delay added at random (0.0 to 1.0)
    jitter: f64,
}

impl ExponentialBackoff {
    pub fn from_config(config: &BackoffConfig) -> Self {
        Self::new(config.initial, config.max, config.multiplier, config.jitter)
    }

    pub fn new(initial: Duration, max: Duration, multiplier: f64, jitter: f64) -> Self {
        Self {
            initial,
            current: initial.min(max),
            max,
            multiplier: multiplier.max(1.0),
            jitter: jitter.clamp(0.0, 1.0),
        }
    }

    /// Delay before the next attempt; grows the base delay up to `max`
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;

        let grown = base.as_secs_f64() * self.multiplier;
        self.current = Duration::from_secs_f64(grown.min(self.max.as_secs_f64()));

        let spread = base.as_secs_f64() * self.jitter * rand::random::<f64>();
        base + Duration::from_secs_f64(spread)
    }

    /// Start over from the initial delay after a successful registration
    pub fn reset(&mut self) {
        self.current = self.initial.min(self.max);
    }
}
