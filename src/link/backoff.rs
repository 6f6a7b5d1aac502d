use std::time::Duration;

const MULTIPLIER: f64 = 1.5;

/// Multiplicative reconnect backoff
///
/// Yields `d0, d0 * 1.5, d0 * 1.5^2, ...` capped at the maximum, until
/// [`Backoff::reset`] is called after a successful connect.
#[derive(Clone, Debug)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            current: initial,
        }
    }

    /// Delay to wait before the next attempt
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.mul_f64(MULTIPLIER).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }

    pub fn current(&self) -> Duration {
        self.current
    }
}
