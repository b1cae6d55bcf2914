//! Bounded confirmation polling.
//!
//! A [`Poller`] is built per outstanding request. Each attempt is one HTTP
//! call; transient failures count as "still pending", and running out of
//! attempts means the outcome is unknown, not that the transaction failed.

use crate::{EventsInfo, QuillClient, SdkError};
use quill_types::Receipt;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_MAX_ATTEMPTS: u32 = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome<T> {
    Confirmed(T),
    /// Gave up after `attempts` tries; the outcome is unknown.
    TimedOut { attempts: u32 },
    Cancelled,
}

impl<T> PollOutcome<T> {
    pub fn confirmed(self) -> Option<T> {
        match self {
            PollOutcome::Confirmed(value) => Some(value),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Poller {
    interval: Duration,
    max_attempts: u32,
}

impl Default for Poller {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL, DEFAULT_MAX_ATTEMPTS)
    }
}

impl Poller {
    /// `max_attempts` is clamped to at least one.
    pub fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Run `attempt` until it yields a value, the attempts run out or
    /// `cancel` fires.
    ///
    /// `Ok(None)` and transient errors mean "not yet". Any other error ends
    /// polling and is returned.
    pub async fn poll<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut attempt: F,
    ) -> Result<PollOutcome<T>, SdkError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Option<T>, SdkError>>,
    {
        for n in 1..=self.max_attempts {
            if cancel.is_cancelled() {
                return Ok(PollOutcome::Cancelled);
            }

            match attempt().await {
                Ok(Some(value)) => return Ok(PollOutcome::Confirmed(value)),
                Ok(None) => debug!(attempt = n, "still pending"),
                Err(err) if err.is_transient() => {
                    debug!(attempt = n, error = %err, "transient poll failure")
                }
                Err(err) => return Err(err),
            }

            if n < self.max_attempts {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(PollOutcome::Cancelled),
                    _ = tokio::time::sleep(self.interval) => {}
                }
            }
        }
        Ok(PollOutcome::TimedOut {
            attempts: self.max_attempts,
        })
    }

    /// Poll until the receipt for `hash` reaches a terminal status.
    pub async fn wait_for_receipt(
        &self,
        client: &QuillClient,
        hash: &str,
        cancel: &CancellationToken,
    ) -> Result<PollOutcome<Receipt>, SdkError> {
        self.poll(cancel, || async move {
            let receipt = client.get_transaction_receipt(hash).await?;
            Ok(receipt.status.is_terminal().then_some(receipt))
        })
        .await
    }

    /// Poll until events for `hash` are available.
    pub async fn wait_for_events(
        &self,
        client: &QuillClient,
        hash: &str,
        cancel: &CancellationToken,
    ) -> Result<PollOutcome<EventsInfo>, SdkError> {
        self.poll(cancel, || async move { client.get_events_by_hash(hash).await.map(Some) })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast(max_attempts: u32) -> Poller {
        Poller::new(Duration::from_millis(1), max_attempts)
    }

    #[tokio::test]
    async fn confirms_after_pending_and_transient_attempts() {
        let calls = AtomicU32::new(0);
        let outcome = fast(5)
            .poll(&CancellationToken::new(), || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    match n {
                        0 => Ok(None),
                        1 => Err(SdkError::server_error(404, "transaction not found")),
                        _ => Ok(Some("done")),
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(outcome, PollOutcome::Confirmed("done"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn times_out_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let outcome: PollOutcome<()> = fast(4)
            .poll(&CancellationToken::new(), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(None) }
            })
            .await
            .unwrap();
        assert_eq!(outcome, PollOutcome::TimedOut { attempts: 4 });
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn permanent_errors_stop_polling() {
        let result: Result<PollOutcome<()>, _> = fast(10)
            .poll(&CancellationToken::new(), || async {
                Err(SdkError::server_error(400, "invalid transaction hash"))
            })
            .await;
        assert!(matches!(result, Err(SdkError::ServerError { status: 400, .. })));
    }

    #[tokio::test]
    async fn cancellation_interrupts_the_wait() {
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let poller = Poller::new(Duration::from_secs(60), 3);

        let task = {
            let cancel = cancel.clone();
            let calls = Arc::clone(&calls);
            tokio::spawn(async move {
                poller
                    .poll(&cancel, || {
                        calls.fetch_add(1, Ordering::SeqCst);
                        async { Ok::<Option<()>, SdkError>(None) }
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let outcome = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(outcome, PollOutcome::Cancelled);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn zero_attempts_is_clamped() {
        assert_eq!(Poller::new(Duration::ZERO, 0).max_attempts(), 1);
        assert_eq!(Poller::default().interval(), DEFAULT_POLL_INTERVAL);
    }
}
