//! Admission control for conntrack updates
//!
//! A token bucket refilled continuously at the configured rate. Updates
//! that find the bucket empty are dropped by the caller, never queued.

use std::time::{Duration, Instant};

/// Token bucket sized to one second of updates
#[derive(Debug)]
pub struct RateLimiter {
    /// Updates admitted per second (0 = unlimited)
    rate: u32,
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    /// Create a limiter with a full bucket
    ///
    /// # Arguments
    ///
    /// * `rate` - Updates admitted per second, 0 disables limiting
    /// * `now` - Reference time for the first refill
    pub fn new(rate: u32, now: Instant) -> Self {
        Self {
            rate,
            tokens: f64::from(rate),
            last_refill: now,
        }
    }

    /// Take one token if available
    pub fn allow(&mut self, now: Instant) -> bool {
        if self.rate == 0 {
            return true;
        }

        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        if elapsed.is_zero() {
            return;
        }
        let capacity = f64::from(self.rate);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * capacity).min(capacity);
        self.last_refill = now;
    }

    pub fn rate(&self) -> u32 {
        self.rate
    }
}

/// Delay schedule for reconnect attempts; the last entry repeats
#[derive(Debug, Clone)]
pub struct Backoff {
    schedule: Vec<Duration>,
    attempt: usize,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(vec![
            Duration::from_millis(100),
            Duration::from_millis(500),
            Duration::from_secs(1),
            Duration::from_secs(5),
            Duration::from_secs(30),
        ])
    }
}

impl Backoff {
    pub fn new(schedule: Vec<Duration>) -> Self {
        Self { schedule, attempt: 0 }
    }

    /// Delay before the next attempt, advancing the schedule
    pub fn next_delay(&mut self) -> Duration {
        let delay = self
            .schedule
            .get(self.attempt)
            .or_else(|| self.schedule.last())
            .copied()
            .unwrap_or(Duration::from_secs(1));
        self.attempt += 1;
        delay
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempts(&self) -> usize {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_then_drop() {
        let start = Instant::now();
        let mut limiter = RateLimiter::new(5, start);

        let admitted = (0..10).filter(|_| limiter.allow(start)).count();
        assert_eq!(admitted, 5);
        assert!(!limiter.allow(start));
    }

    #[test]
    fn test_refill_over_time() {
        let start = Instant::now();
        let mut limiter = RateLimiter::new(10, start);
        for _ in 0..10 {
            assert!(limiter.allow(start));
        }
        assert!(!limiter.allow(start));

        // Half a second refills half the bucket
        let later = start + Duration::from_millis(500);
        let admitted = (0..10).filter(|_| limiter.allow(later)).count();
        assert_eq!(admitted, 5);

        // Never more than one second worth of tokens
        let much_later = later + Duration::from_secs(60);
        let admitted = (0..100).filter(|_| limiter.allow(much_later)).count();
        assert_eq!(admitted, 10);
    }

    #[test]
    fn test_unlimited() {
        let start = Instant::now();
        let mut limiter = RateLimiter::new(0, start);
        assert!((0..10_000).all(|_| limiter.allow(start)));
    }

    #[test]
    fn test_backoff_schedule() {
        let mut backoff = Backoff::new(vec![Duration::from_millis(1), Duration::from_millis(2)]);
        assert_eq!(backoff.next_delay(), Duration::from_millis(1));
        assert_eq!(backoff.next_delay(), Duration::from_millis(2));
        assert_eq!(backoff.next_delay(), Duration::from_millis(2));
        assert_eq!(backoff.attempts(), 3);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(1));
    }
}
