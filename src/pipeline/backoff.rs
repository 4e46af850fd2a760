use std::time::Duration;

/// Exponential retry delay for a loop that never gives up
///
/// Failures are recoverable everywhere in the pipeline, so unlike a bounded
/// retry policy this only stretches the wait between attempts.
#[derive(Debug)]
pub struct ExponentialBackoff {
    initial_delay: Duration,
    max_delay: Duration,
    current_attempt: u32,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial_delay: initial,
            max_delay: max.max(initial),
            current_attempt: 0,
        }
    }

    /// Delay before the next attempt; grows on every call until reset
    pub fn next_delay(&mut self) -> Duration {
        let factor = 2_u32.saturating_pow(self.current_attempt.min(16));
        let delay = std::cmp::min(self.initial_delay.saturating_mul(factor), self.max_delay);
        self.current_attempt = self.current_attempt.saturating_add(1);
        delay
    }

    pub fn attempts(&self) -> u32 {
        self.current_attempt
    }

    pub fn reset(&mut self) {
        self.current_attempt = 0;
    }
}
