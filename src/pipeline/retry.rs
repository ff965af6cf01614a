//! Per-stage retry policy and the scheduler that re-queues failed rows.

use std::time::Duration;

use chrono::{DateTime, Utc};

use super::StageError;
use crate::store::{Failure, Store, StoreError};
use crate::state::ItemState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts before a row stays failed for good.
    pub limit: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl RetryPolicy {
    /// Delay after the `attempt`-th failure (1-based): `base * 2^(attempt - 1)`,
    /// capped at `backoff_max`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.backoff_base
            .saturating_mul(1 << exponent)
            .min(self.backoff_max)
    }

    pub fn retry_at(&self, now: DateTime<Utc>, attempt: u32) -> DateTime<Utc> {
        chrono::Duration::from_std(self.backoff(attempt))
            .ok()
            .and_then(|delay| now.checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// The failure to record for an item that had `prior_attempts` failed
    /// attempts before this one.
    pub fn failure(&self, error: &StageError, prior_attempts: i32, now: DateTime<Utc>) -> Failure {
        if error.retryable() {
            let attempt = u32::try_from(prior_attempts).unwrap_or(0).saturating_add(1);
            Failure::retry_at(error.to_string(), self.retry_at(now, attempt))
        } else {
            Failure::permanent(error.to_string())
        }
    }
}

/// Re-queue every failed row whose backoff elapsed, for both failure states.
pub async fn requeue_due(
    store: &Store,
    fetch: &RetryPolicy,
    delivery: &RetryPolicy,
) -> Result<u64, StoreError> {
    let fetched = store
        .requeue_failed(ItemState::FetchFailed, fetch.limit)
        .await?;
    let delivered = store
        .requeue_failed(ItemState::DeliverFailed, delivery.limit)
        .await?;
    Ok(fetched + delivered)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::adapters::AdapterError;

    const POLICY: RetryPolicy = RetryPolicy {
        limit: 5,
        backoff_base: Duration::from_secs(30),
        backoff_max: Duration::from_secs(300),
    };

    #[test]
    fn test_backoff_doubles_until_cap() {
        assert_eq!(POLICY.backoff(1), Duration::from_secs(30));
        assert_eq!(POLICY.backoff(2), Duration::from_secs(60));
        assert_eq!(POLICY.backoff(4), Duration::from_secs(240));
        assert_eq!(POLICY.backoff(5), Duration::from_secs(300));
        assert_eq!(POLICY.backoff(u32::MAX), Duration::from_secs(300));
    }

    #[test]
    fn test_failure_for_permanent_error_has_no_retry() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();

        let failure = POLICY.failure(
            &StageError::from(AdapterError::permanent("HTTP 404")),
            0,
            now,
        );
        assert_eq!(failure.retry_at, None);

        let failure = POLICY.failure(&StageError::from(AdapterError::transient("503")), 1, now);
        assert_eq!(failure.retry_at, Some(now + chrono::Duration::seconds(60)));
        assert_eq!(failure.error, "503");
    }
}
