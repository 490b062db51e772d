use crate::config::Config;
use crate::source::kafka::client_config;
use anyhow::{Context, Result, anyhow};
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::util::Timeout;
use std::time::Duration;
use tracing::info;

/// Topics the writer reads from and dead-letters into.
pub fn required_topics(config: &Config) -> Vec<&str> {
    let mut topics = vec![config.kafka_topic.as_str()];
    if config.max_deliver > 0 && config.kafka_dlq_topic != config.kafka_topic {
        topics.push(config.kafka_dlq_topic.as_str());
    }
    topics
}

pub async fn ensure_required_topics(config: &Config) -> Result<()> {
    let admin = client_config(config)
        .create::<AdminClient<DefaultClientContext>>()
        .context("create kafka admin client")?;

    let topics = required_topics(config);
    let new_topics = topics
        .iter()
        .map(|topic| {
            NewTopic::new(
                topic,
                config.kafka_topic_partitions,
                TopicReplication::Fixed(config.kafka_topic_replication_factor),
            )
        })
        .collect::<Vec<_>>();

    let options =
        AdminOptions::new().operation_timeout(Some(Timeout::After(Duration::from_secs(10))));
    let results = admin
        .create_topics(&new_topics, &options)
        .await
        .context("create kafka topics")?;

    for result in results {
        match result {
            Ok(topic) => info!(topic = %topic, "kafka topic created"),
            Err((topic, RDKafkaErrorCode::TopicAlreadyExists)) => {
                info!(topic = %topic, "kafka topic already exists");
            }
            Err((topic, code)) => {
                return Err(anyhow!("create kafka topic {topic} failed: {code}"));
            }
        }
    }

    Ok(())
}
