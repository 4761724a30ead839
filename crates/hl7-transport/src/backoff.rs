//! Exponential Backoff with Jitter

use rand::Rng;
use std::time::Duration;

/// Delay generator: `initial * multiplier^attempt`, capped, with ±25% jitter
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    jitter: bool,
    attempt: u32,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration, multiplier: f64, jitter: bool) -> Self {
        Self {
            initial,
            max,
            multiplier: multiplier.max(1.0),
            jitter,
            attempt: 0,
        }
    }

    /// Delay before the next attempt; advances the attempt counter
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.delay_for(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Start over after a success
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Number of delays handed out since the last reset
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let initial_ms = self.initial.as_millis() as f64;
        let max_ms = self.max.as_millis() as f64;

        // Exponential growth in f64 so large attempt counts saturate instead of overflowing
        let mut delay_ms = (initial_ms * self.multiplier.powi(attempt.min(64) as i32)).min(max_ms);

        if self.jitter {
            let jitter_range = delay_ms * 0.25;
            if jitter_range > 0.0 {
                delay_ms += rand::thread_rng().gen_range(-jitter_range..jitter_range);
            }
        }

        Duration::from_millis(delay_ms.max(0.0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_growth_without_jitter() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(10), 2.0, false);
        let delays: Vec<u64> = (0..4).map(|_| backoff.next_delay().as_millis() as u64).collect();
        assert_eq!(delays, vec![100, 200, 400, 800]);
    }

    #[test]
    fn test_delay_capped() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_millis(100), Duration::from_millis(500), 2.0, false);
        for _ in 0..200 {
            assert!(backoff.next_delay() <= Duration::from_millis(500));
        }
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_millis(1000), Duration::from_secs(60), 2.0, true);
        let delay = backoff.next_delay().as_millis();
        assert!((750..=1250).contains(&delay));
    }

    #[test]
    fn test_reset() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_millis(10), Duration::from_secs(1), 3.0, false);
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_millis(10));
    }
}
