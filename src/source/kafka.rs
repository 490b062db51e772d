use super::ledger::OffsetLedger;
use super::{Delivery, MessageHandle, MessageSource};
use crate::config::Config;
use crate::dlq::DlqProducer;
use crate::error::SourceError;
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use rdkafka::client::ClientContext;
use rdkafka::consumer::{
    BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer,
};
use rdkafka::error::KafkaResult;
use rdkafka::message::Message;
use rdkafka::util::Timeout;
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use telemetry_core::model::DeadLetterEnvelope;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, info, warn};
use uuid::Uuid;

const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection and security settings shared by the consumer, DLQ producer and
/// admin client.
pub fn client_config(config: &Config) -> ClientConfig {
    let mut client = ClientConfig::new();
    client
        .set("bootstrap.servers", &config.kafka_brokers)
        .set("security.protocol", &config.kafka_security_protocol)
        .set(
            "reconnect.backoff.ms",
            config.kafka_reconnect_backoff_ms.to_string(),
        )
        .set(
            "reconnect.backoff.max.ms",
            config.kafka_reconnect_backoff_max_ms.to_string(),
        );

    if let Some(mechanism) = &config.kafka_sasl_mechanism {
        client.set("sasl.mechanism", mechanism);
    }
    if let Some(username) = &config.kafka_sasl_username {
        client.set("sasl.username", username);
    }
    if let Some(password) = &config.kafka_sasl_password {
        client.set("sasl.password", password);
    }
    if let Some(ca_location) = &config.kafka_ssl_ca_location {
        client.set("ssl.ca.location", ca_location);
    }

    client
}

pub struct LedgerContext {
    worker_id: usize,
    topic: String,
    ledger: Arc<Mutex<OffsetLedger>>,
}

impl LedgerContext {
    fn ledger(&self) -> MutexGuard<'_, OffsetLedger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ClientContext for LedgerContext {}

impl ConsumerContext for LedgerContext {
    fn pre_rebalance(&self, base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        let Rebalance::Revoke(revoked) = rebalance else {
            return;
        };

        let mut final_commits = TopicPartitionList::new();
        {
            let mut ledger = self.ledger();
            for element in revoked.elements() {
                if let Some(offset) = ledger.revoke(element.partition()) {
                    let _ = final_commits.add_partition_offset(
                        &self.topic,
                        element.partition(),
                        Offset::Offset(offset),
                    );
                }
            }
        }

        info!(
            worker_id = self.worker_id,
            revoked = revoked.count(),
            "kafka partitions revoked"
        );

        if final_commits.count() > 0
            && let Err(error) = base_consumer.commit(&final_commits, CommitMode::Sync)
        {
            warn!(
                worker_id = self.worker_id,
                error = %error,
                "commit on partition revoke failed"
            );
        }
    }

    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Assign(assigned) => {
                let mut ledger = self.ledger();
                for element in assigned.elements() {
                    ledger.assign(element.partition());
                }
                info!(
                    worker_id = self.worker_id,
                    assigned = assigned.count(),
                    "kafka partitions assigned"
                );
            }
            Rebalance::Revoke(_) => {}
            Rebalance::Error(error) => {
                warn!(worker_id = self.worker_id, error = %error, "kafka rebalance error");
            }
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        match result {
            Ok(()) => debug!(
                worker_id = self.worker_id,
                partitions = offsets.count(),
                "offsets committed"
            ),
            Err(error) => warn!(
                worker_id = self.worker_id,
                error = %error,
                "offset commit failed"
            ),
        }
    }
}

/// One member of the durable consumer group. Every worker owns its own
/// instance; Kafka's partition assignment makes them competing consumers.
pub struct KafkaSource {
    consumer: StreamConsumer<LedgerContext>,
    ledger: Arc<Mutex<OffsetLedger>>,
    topic: String,
    worker_id: usize,
    dlq: Option<DlqProducer>,
}

impl KafkaSource {
    pub fn connect(config: &Config, worker_id: usize, dlq: Option<DlqProducer>) -> Result<Self> {
        let ledger = Arc::new(Mutex::new(OffsetLedger::default()));
        let context = LedgerContext {
            worker_id,
            topic: config.kafka_topic.clone(),
            ledger: ledger.clone(),
        };

        let consumer = client_config(config)
            .set("group.id", &config.kafka_group_id)
            .set(
                "client.id",
                format!("{}-{worker_id}-{}", config.kafka_group_id, Uuid::new_v4()),
            )
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("enable.partition.eof", "false")
            .set("auto.offset.reset", "earliest")
            .set(
                "session.timeout.ms",
                config.kafka_session_timeout_ms.to_string(),
            )
            .set(
                "max.poll.interval.ms",
                config.kafka_max_poll_interval_ms.to_string(),
            )
            .create_with_context::<_, StreamConsumer<LedgerContext>>(context)
            .context("create kafka stream consumer")?;

        let metadata = consumer
            .fetch_metadata(Some(&config.kafka_topic), Timeout::After(METADATA_TIMEOUT))
            .with_context(|| format!("fetch metadata for topic {}", config.kafka_topic))?;
        let partitions = metadata
            .topics()
            .iter()
            .find(|topic| topic.name() == config.kafka_topic)
            .filter(|topic| topic.error().is_none())
            .map(|topic| topic.partitions().len())
            .ok_or_else(|| anyhow!("topic {} is not available", config.kafka_topic))?;

        consumer
            .subscribe(&[config.kafka_topic.as_str()])
            .with_context(|| format!("subscribe to topic: {}", config.kafka_topic))?;

        info!(
            worker_id,
            topic = %config.kafka_topic,
            group = %config.kafka_group_id,
            partitions,
            "kafka consumer subscribed"
        );

        Ok(Self {
            consumer,
            ledger,
            topic: config.kafka_topic.clone(),
            worker_id,
            dlq,
        })
    }

    fn ledger(&self) -> MutexGuard<'_, OffsetLedger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl MessageSource for KafkaSource {
    async fn fetch(&self, max: usize, wait: Duration) -> Result<Vec<Delivery>, SourceError> {
        let deadline = Instant::now() + wait;
        // Nak'd messages go out again ahead of new reads; the partition
        // position itself only moves forward.
        let mut deliveries = self.ledger().take_redeliveries(max);

        while deliveries.len() < max {
            let message = match timeout_at(deadline, self.consumer.recv()).await {
                Err(_elapsed) => break,
                Ok(Ok(message)) => message,
                Ok(Err(error)) if deliveries.is_empty() => return Err(error.into()),
                Ok(Err(error)) => {
                    warn!(worker_id = self.worker_id, error = %error, "kafka poll error");
                    break;
                }
            };

            let partition = message.partition();
            let offset = message.offset();
            let delivery_count = self
                .ledger()
                .delivered(partition, offset, message.payload());
            let handle = MessageHandle::new(partition, offset, delivery_count);
            deliveries.push(Delivery::decode(handle, message.payload()));
        }

        Ok(deliveries)
    }

    async fn ack(&self, handle: &MessageHandle) -> Result<(), SourceError> {
        if !self.ledger().ack(handle.partition(), handle.offset()) {
            debug!(
                worker_id = self.worker_id,
                partition = handle.partition(),
                offset = handle.offset(),
                "ack for offset no longer owned"
            );
        }
        Ok(())
    }

    async fn nak(&self, handle: &MessageHandle) -> Result<(), SourceError> {
        if !self.ledger().nak(handle.partition(), handle.offset()) {
            debug!(
                worker_id = self.worker_id,
                partition = handle.partition(),
                offset = handle.offset(),
                "nak for offset no longer owned"
            );
        }
        Ok(())
    }

    async fn commit(&self) -> Result<(), SourceError> {
        let commits = self.ledger().take_commits();
        if commits.is_empty() {
            return Ok(());
        }

        let mut offsets = TopicPartitionList::new();
        for (partition, offset) in commits {
            offsets.add_partition_offset(&self.topic, partition, Offset::Offset(offset))?;
        }
        self.consumer.commit(&offsets, CommitMode::Async)?;

        Ok(())
    }

    async fn dead_letter(
        &self,
        handle: &MessageHandle,
        raw: &[u8],
        reason: &str,
    ) -> Result<(), SourceError> {
        let dlq = self
            .dlq
            .as_ref()
            .ok_or_else(|| SourceError::DeadLetter("no dead-letter topic configured".into()))?;

        let envelope = DeadLetterEnvelope::new(
            &self.topic,
            handle.partition(),
            handle.offset(),
            handle.delivery_count(),
            raw,
            reason,
        );

        dlq.publish(&envelope)
            .await
            .map_err(|error| SourceError::DeadLetter(format!("{error:#}")))
    }
}
