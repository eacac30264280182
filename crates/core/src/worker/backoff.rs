//! Capture retry backoff.

use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Exponential backoff between capture attempts, never below one second.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    min: Duration,
    max: Duration,
}

impl BackoffPolicy {
    pub const FLOOR: Duration = Duration::from_secs(1);

    pub fn new(min: Duration, max: Duration) -> Self {
        let min = min.max(Self::FLOOR);
        Self {
            min,
            max: max.max(min),
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1).min(16));
        self.min.saturating_mul(factor).min(self.max)
    }

    /// Sleep before retry `attempt`.
    ///
    /// Returns `false` without sleeping the full delay if the token is
    /// cancelled or `deadline` comes first.
    pub async fn wait(
        &self,
        attempt: u32,
        deadline: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> bool {
        let until_deadline = match (deadline - Utc::now()).to_std() {
            Ok(d) if !d.is_zero() => d,
            _ => return false,
        };
        let delay = self.delay(attempt);
        if delay >= until_deadline {
            tokio::select! {
                _ = tokio::time::sleep(until_deadline) => {}
                _ = cancel.cancelled() => {}
            }
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => !cancel.is_cancelled(),
            _ = cancel.cancelled() => false,
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_delay_grows_and_caps() {
        let policy = BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(10));
        assert_eq!(policy.delay(1), Duration::from_secs(1));
        assert_eq!(policy.delay(2), Duration::from_secs(2));
        assert_eq!(policy.delay(3), Duration::from_secs(4));
        assert_eq!(policy.delay(5), Duration::from_secs(10));
        assert_eq!(policy.delay(1000), Duration::from_secs(10));
    }

    #[test]
    fn test_floor_is_one_second() {
        let policy = BackoffPolicy::new(Duration::from_millis(10), Duration::from_millis(20));
        assert_eq!(policy.delay(1), Duration::from_secs(1));
        assert_eq!(policy.delay(4), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_wait_stops_on_cancel() {
        let policy = BackoffPolicy::new(Duration::from_secs(30), Duration::from_secs(30));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let started = Instant::now();
        let deadline = Utc::now() + chrono::Duration::hours(1);
        assert!(!policy.wait(1, deadline, &cancel).await);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_wait_past_deadline() {
        let policy = BackoffPolicy::default();
        let deadline = Utc::now() - chrono::Duration::seconds(1);
        assert!(!policy.wait(1, deadline, &CancellationToken::new()).await);
    }

    #[tokio::test]
    async fn test_wait_sleeps_full_delay() {
        let policy = BackoffPolicy::default();
        let deadline = Utc::now() + chrono::Duration::hours(1);
        let started = Instant::now();
        assert!(policy.wait(1, deadline, &CancellationToken::new()).await);
        assert!(started.elapsed() >= Duration::from_secs(1));
    }
}
