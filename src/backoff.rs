//! Delay policy for reconnection attempts.

use crate::config::ReconnectConfig;
use std::time::Duration;

/// Exponential backoff helper for connection retries.
///
/// With a multiplier of `1.0` this degenerates to a fixed delay, which is the
/// default reconnection behavior.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    current: Duration,
    min: Duration,
    max: Duration,
    multiplier: f64,
}

impl ExponentialBackoff {
    /// Creates a new `ExponentialBackoff` instance.
    ///
    /// # Arguments
    ///
    /// * `min` - The initial delay.
    /// * `max` - The ceiling the delay grows towards.
    /// * `multiplier` - Growth factor applied after each call to `next_backoff()`.
    pub fn new(min: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            current: min,
            min,
            max: max.max(min),
            multiplier,
        }
    }

    pub fn from_config(config: &ReconnectConfig) -> Self {
        Self::new(config.delay(), config.max_delay(), config.multiplier)
    }

    /// Returns the delay to wait now and advances the internal state to
    /// `current * multiplier`, capped at `max`. Overflow saturates at `max`.
    pub fn next_backoff(&mut self) -> Duration {
        let wait = self.current;
        self.current = Duration::try_from_secs_f64(self.current.as_secs_f64() * self.multiplier)
            .map_or(self.max, |next| next.min(self.max));
        wait
    }

    /// Resets the delay to the initial value after a successful reconnect.
    pub fn reset(&mut self) {
        self.current = self.min;
    }
}
