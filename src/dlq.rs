use crate::config::Config;
use crate::source::kafka::client_config;
use anyhow::{Context, Result, anyhow};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use std::time::Duration;
use telemetry_core::model::DeadLetterEnvelope;
use tracing::warn;

#[derive(Clone)]
pub struct DlqProducer {
    producer: FutureProducer,
    topic: String,
}

impl DlqProducer {
    pub fn from_config(config: &Config) -> Result<Self> {
        let producer = client_config(config)
            .set("message.timeout.ms", "5000")
            .set("queue.buffering.max.ms", "5")
            .create::<FutureProducer>()
            .context("create dlq producer")?;

        Ok(Self {
            producer,
            topic: config.kafka_dlq_topic.clone(),
        })
    }

    pub async fn publish(&self, envelope: &DeadLetterEnvelope) -> Result<()> {
        let payload = serde_json::to_string(envelope).context("serialize dlq envelope")?;
        let key = envelope.key();

        self.producer
            .send(
                FutureRecord::to(&self.topic).key(&key).payload(&payload),
                Timeout::After(Duration::from_secs(5)),
            )
            .await
            .map_err(|(error, _)| anyhow!("publish dlq message failed: {error}"))?;

        warn!(
            topic = %self.topic,
            source_topic = %envelope.topic,
            partition = envelope.partition,
            offset = envelope.offset,
            delivery_count = envelope.delivery_count,
            error = %envelope.error,
            "message dead-lettered"
        );

        Ok(())
    }
}
