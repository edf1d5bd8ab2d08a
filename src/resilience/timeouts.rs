//! Timeout enforcement.
//!
//! # Responsibilities
//! - Give every boundary call and component init a deadline
//! - Report expiry as a distinct error carrying the limit that was hit
//!
//! # Design Decisions
//! - Uses Tokio's timeout facilities; the inner future is dropped on expiry
//! - A zero limit is treated as "already expired", never as "no limit"

use std::future::Future;
use std::time::Duration;

/// The deadline passed before the future completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("deadline of {limit:?} exceeded")]
pub struct DeadlineExceeded {
    pub limit: Duration,
}

/// Drive `future` to completion or fail once `limit` elapses.
pub async fn with_deadline<F>(limit: Duration, future: F) -> Result<F::Output, DeadlineExceeded>
where
    F: Future,
{
    if limit.is_zero() {
        return Err(DeadlineExceeded { limit });
    }
    tokio::time::timeout(limit, future)
        .await
        .map_err(|_| DeadlineExceeded { limit })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn completes_within_limit() {
        let value = with_deadline(Duration::from_secs(1), async { 7 }).await;
        assert_eq!(value, Ok(7));
    }

    #[tokio::test(start_paused = true)]
    async fn expires_after_limit() {
        let err = with_deadline(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
        })
        .await
        .unwrap_err();
        assert_eq!(err.limit, Duration::from_millis(10));
    }

    #[tokio::test]
    async fn zero_limit_fails_immediately() {
        assert!(with_deadline(Duration::ZERO, async { () }).await.is_err());
    }
}
