use crate::batch::Batch;
use crate::error::InsertError;
use crate::source::{MalformedMessage, MessageHandle, MessageSource};
use crate::stats::Counters;
use std::sync::Arc;
use tracing::{error, warn};

/// Settles broker messages once the store has decided a batch's fate.
pub struct AckCoordinator<M: ?Sized> {
    source: Arc<M>,
    counters: Arc<Counters>,
    max_deliver: u32,
    worker_id: usize,
}

impl<M: MessageSource + ?Sized> AckCoordinator<M> {
    pub fn new(
        source: Arc<M>,
        counters: Arc<Counters>,
        max_deliver: u32,
        worker_id: usize,
    ) -> Self {
        Self {
            source,
            counters,
            max_deliver,
            worker_id,
        }
    }

    /// The batch is durable: ack every message. A failed ack only widens the
    /// duplicate window, so it is logged and skipped.
    pub async fn ack_all(&self, batch: &Batch) {
        for handle in batch.handles() {
            if let Err(error) = self.source.ack(handle).await {
                warn!(
                    worker_id = self.worker_id,
                    partition = handle.partition(),
                    offset = handle.offset(),
                    error = %error,
                    "failed to ack message"
                );
            }
        }
        self.commit().await;
        self.counters.record_inserted(batch.len() as u64);
    }

    /// The batch could not be written: hand every message back for redelivery.
    pub async fn nak_all(&self, batch: &Batch, failure: &InsertError) {
        error!(
            worker_id = self.worker_id,
            batch_len = batch.len(),
            attempts = failure.attempts,
            error = %failure.last_error,
            "batch insert failed; returning messages for redelivery"
        );

        for handle in batch.handles() {
            self.nak(handle).await;
        }
        self.commit().await;
        self.counters.record_errors(batch.len() as u64);
    }

    /// Settles a message that could not be decoded. Once it has been delivered
    /// `max_deliver` times it is moved to the dead-letter topic instead of
    /// being redelivered forever.
    pub async fn reject(&self, handle: &MessageHandle, malformed: &MalformedMessage) {
        self.counters.record_errors(1);
        warn!(
            worker_id = self.worker_id,
            partition = handle.partition(),
            offset = handle.offset(),
            delivery_count = handle.delivery_count(),
            error = %malformed.error,
            "failed to decode event"
        );

        if self.max_deliver == 0 || handle.delivery_count() < self.max_deliver {
            self.nak(handle).await;
            return;
        }

        let reason = malformed.error.to_string();
        match self
            .source
            .dead_letter(handle, &malformed.raw, &reason)
            .await
        {
            Ok(()) => {
                if let Err(error) = self.source.ack(handle).await {
                    warn!(
                        worker_id = self.worker_id,
                        offset = handle.offset(),
                        error = %error,
                        "failed to ack dead-lettered message"
                    );
                }
            }
            Err(error) => {
                warn!(
                    worker_id = self.worker_id,
                    offset = handle.offset(),
                    error = %error,
                    "dead-letter publish failed; message stays pending"
                );
                self.nak(handle).await;
            }
        }
    }

    pub async fn commit(&self) {
        if let Err(error) = self.source.commit().await {
            warn!(worker_id = self.worker_id, error = %error, "offset commit failed");
        }
    }

    async fn nak(&self, handle: &MessageHandle) {
        if let Err(error) = self.source.nak(handle).await {
            warn!(
                worker_id = self.worker_id,
                partition = handle.partition(),
                offset = handle.offset(),
                error = %error,
                "failed to nak message"
            );
        }
    }
}
