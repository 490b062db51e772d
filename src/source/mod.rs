pub mod kafka;
pub mod ledger;

use crate::error::SourceError;
use async_trait::async_trait;
use std::time::Duration;
use telemetry_core::model::{DecodeError, Event};

/// Broker-side reference to one delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHandle {
    partition: i32,
    offset: i64,
    delivery_count: u32,
}

impl MessageHandle {
    pub fn new(partition: i32, offset: i64, delivery_count: u32) -> Self {
        Self {
            partition,
            offset,
            delivery_count,
        }
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    /// 1 on first delivery, incremented on every redelivery seen by this consumer.
    pub fn delivery_count(&self) -> u32 {
        self.delivery_count
    }
}

#[derive(Debug)]
pub struct MalformedMessage {
    pub raw: Vec<u8>,
    pub error: DecodeError,
}

#[derive(Debug)]
pub struct Delivery {
    pub handle: MessageHandle,
    pub decoded: Result<Event, MalformedMessage>,
}

impl Delivery {
    pub fn decode(handle: MessageHandle, raw: Option<&[u8]>) -> Self {
        let decoded = match raw {
            Some(bytes) => Event::from_slice(bytes).map_err(|error| MalformedMessage {
                raw: bytes.to_vec(),
                error,
            }),
            None => Err(MalformedMessage {
                raw: Vec::new(),
                error: DecodeError::EmptyPayload,
            }),
        };

        Self { handle, decoded }
    }
}

/// Pull-based consumer on a durable subscription shared by every worker.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Returns at most `max` deliveries, waiting no longer than `wait`.
    /// An empty result means the wait elapsed without traffic.
    async fn fetch(&self, max: usize, wait: Duration) -> Result<Vec<Delivery>, SourceError>;

    async fn ack(&self, handle: &MessageHandle) -> Result<(), SourceError>;

    /// Rejects the message so the broker delivers it again.
    async fn nak(&self, handle: &MessageHandle) -> Result<(), SourceError>;

    /// Pushes acks and naks recorded since the last call to the broker.
    async fn commit(&self) -> Result<(), SourceError> {
        Ok(())
    }

    async fn dead_letter(
        &self,
        handle: &MessageHandle,
        raw: &[u8],
        reason: &str,
    ) -> Result<(), SourceError>;
}
