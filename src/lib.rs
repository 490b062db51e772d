//! Kafka to ClickHouse batch writer for endpoint security telemetry.
//!
//! Workers compete on one consumer group, buffer decoded events until a size
//! or time trigger fires, insert the batch with retries and only then ack the
//! source messages.

pub mod ack;
pub mod admin;
pub mod batch;
pub mod config;
pub mod dlq;
pub mod error;
pub mod health;
pub mod pool;
pub mod source;
pub mod stats;
pub mod store;
pub mod worker;
pub mod writer;

#[cfg(test)]
pub(crate) mod testing;
