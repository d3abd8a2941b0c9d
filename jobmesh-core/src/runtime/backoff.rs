//! Bounded, cancellable polling

use std::future::Future;
use std::time::Duration;

use super::shutdown::ShutdownSignal;

/// Retry budget for a polling loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay before the second attempt
    pub interval: Duration,
    /// Upper bound for the doubled delay
    pub max_interval: Duration,
    /// Number of sleeps before giving up
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// Fixed-interval polling
    pub fn fixed(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_interval: interval,
            max_attempts,
        }
    }

    /// Exponential backoff from `interval`, capped at `max_interval`
    pub fn exponential(interval: Duration, max_interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_interval: max_interval.max(interval),
            max_attempts,
        }
    }

    /// Sleep length after the given zero-based attempt
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(16);
        self.interval.saturating_mul(factor).min(self.max_interval)
    }
}

/// How a polling loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Satisfied,
    Exhausted,
    Cancelled,
}

/// Re-evaluate `condition` until it holds, the budget runs out, or shutdown fires
pub async fn poll_until<F, Fut>(
    policy: &RetryPolicy,
    shutdown: &ShutdownSignal,
    mut condition: F,
) -> PollOutcome
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for attempt in 0..policy.max_attempts {
        if condition().await {
            return PollOutcome::Satisfied;
        }
        tokio::select! {
            _ = shutdown.cancelled() => return PollOutcome::Cancelled,
            _ = tokio::time::sleep(policy.delay(attempt)) => {}
        }
    }
    if condition().await {
        PollOutcome::Satisfied
    } else {
        PollOutcome::Exhausted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_exponential_delay_is_capped() {
        let policy = RetryPolicy::exponential(Duration::from_millis(10), Duration::from_millis(50), 10);
        assert_eq!(policy.delay(0), Duration::from_millis(10));
        assert_eq!(policy.delay(1), Duration::from_millis(20));
        assert_eq!(policy.delay(2), Duration::from_millis(40));
        assert_eq!(policy.delay(3), Duration::from_millis(50));
        assert_eq!(policy.delay(30), Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_poll_exhausts_budget() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let policy = RetryPolicy::fixed(Duration::from_millis(1), 3);
        let outcome = poll_until(&policy, &ShutdownSignal::new(), || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            false
        })
        .await;

        assert_eq!(outcome, PollOutcome::Exhausted);
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_poll_stops_on_shutdown() {
        let shutdown = ShutdownSignal::new();
        shutdown.shutdown();
        let policy = RetryPolicy::fixed(Duration::from_secs(60), 100);

        let outcome = poll_until(&policy, &shutdown, || async { false }).await;
        assert_eq!(outcome, PollOutcome::Cancelled);
    }
}
