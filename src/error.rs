use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    #[error("dead-letter publish failed: {0}")]
    DeadLetter(String),

    #[error("message source closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("clickhouse error: {0}")]
    ClickHouse(#[from] clickhouse::error::Error),

    #[error("insert did not finish within {0:?}")]
    Timeout(Duration),

    #[error("store rejected batch: {0}")]
    Rejected(String),
}

/// Terminal outcome of a batch whose every insert attempt failed.
#[derive(Debug, Error)]
#[error("insert of {batch_len} events failed after {attempts} attempts: {last_error}")]
pub struct InsertError {
    pub batch_len: usize,
    pub attempts: u32,
    #[source]
    pub last_error: StoreError,
}
