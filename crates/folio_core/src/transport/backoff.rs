use std::time::Duration;

use crate::config::SyncTimings;

/// Exponential reconnect schedule: `min(base * 2^attempt, cap)`, bounded by
/// `max_attempts`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    max_attempts: u32,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            cap,
            max_attempts,
            attempt: 0,
        }
    }

    /// Schedule for the project document channel.
    pub fn for_documents(timings: &SyncTimings) -> Self {
        Self::new(
            timings.backoff_base,
            timings.backoff_cap,
            timings.max_reconnect_attempts,
        )
    }

    /// Schedule for the media notification channel.
    pub fn for_media(timings: &SyncTimings) -> Self {
        Self::new(
            timings.backoff_base,
            timings.backoff_cap,
            timings.media_max_reconnect_attempts,
        )
    }

    /// Delay before reconnect number `attempt` (zero-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.cap, |delay| delay.min(self.cap))
    }

    /// Consume one attempt. `None` once the attempts are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }
        let delay = self.delay_for(self.attempt);
        self.attempt += 1;
        Some(delay)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_document_schedule() {
        let mut backoff = Backoff::for_documents(&SyncTimings::default());
        let delays: Vec<u64> = std::iter::from_fn(|| backoff.next_delay())
            .map(|d| d.as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16]);
        assert!(backoff.is_exhausted());

        backoff.reset();
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_media_schedule_hits_cap() {
        let mut backoff = Backoff::for_media(&SyncTimings::default());
        let delays: Vec<u64> = std::iter::from_fn(|| backoff.next_delay())
            .map(|d| d.as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30, 30, 30, 30]);
        assert_eq!(backoff.attempts(), 10);
    }

    #[test]
    fn test_large_attempt_does_not_overflow() {
        let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30), 100);
        assert_eq!(backoff.delay_for(64), Duration::from_secs(30));
    }
}
