use crate::batch::Batch;
use crate::error::InsertError;
use crate::store::{EventStore, TelemetryRow};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// `max_retries` counts retries after the first attempt, not attempts: the
/// default of 3 (`INSERT_MAX_RETRIES`) makes up to 4 inserts, waiting 1s, 2s
/// and 3s between them, before the batch is handed back as failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_unit: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff_unit: Duration) -> Self {
        Self {
            max_retries,
            backoff_unit,
        }
    }

    /// Delay before retry number `attempt` (1-based): linear in the attempt.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_unit.saturating_mul(attempt)
    }

    /// The first attempt plus every retry.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1))
    }
}

/// Maps batches to rows and inserts them, retrying the same rows on failure.
pub struct Writer<S: ?Sized> {
    store: Arc<S>,
    retry: RetryPolicy,
}

impl<S: ?Sized> Clone for Writer<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            retry: self.retry,
        }
    }
}

impl<S: EventStore + ?Sized> Writer<S> {
    pub fn new(store: Arc<S>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    /// Returns the number of attempts it took on success.
    pub async fn insert(&self, batch: &Batch, worker_id: usize) -> Result<u32, InsertError> {
        let rows = batch
            .events()
            .iter()
            .map(TelemetryRow::from)
            .collect::<Vec<_>>();

        let mut attempt = 0u32;
        loop {
            attempt = attempt.saturating_add(1);
            match self.store.insert(&rows).await {
                Ok(()) => {
                    debug!(worker_id, batch_len = rows.len(), attempt, "batch inserted");
                    return Ok(attempt);
                }
                Err(error) => {
                    if attempt >= self.retry.max_attempts() {
                        return Err(InsertError {
                            batch_len: rows.len(),
                            attempts: attempt,
                            last_error: error,
                        });
                    }

                    let backoff = self.retry.backoff(attempt);
                    warn!(
                        worker_id,
                        batch_len = rows.len(),
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %error,
                        "batch insert failed; retrying"
                    );
                    sleep(backoff).await;
                }
            }
        }
    }
}
