use anyhow::{Context, Result, anyhow};
use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub kafka_brokers: String,
    pub kafka_topic: String,
    pub kafka_group_id: String,
    pub kafka_security_protocol: String,
    pub kafka_sasl_mechanism: Option<String>,
    pub kafka_sasl_username: Option<String>,
    pub kafka_sasl_password: Option<String>,
    pub kafka_ssl_ca_location: Option<String>,
    pub kafka_session_timeout_ms: u64,
    pub kafka_max_poll_interval_ms: u64,
    pub kafka_reconnect_backoff_ms: u64,
    pub kafka_reconnect_backoff_max_ms: u64,
    pub kafka_auto_create_topics: bool,
    pub kafka_topic_partitions: i32,
    pub kafka_topic_replication_factor: i32,
    pub kafka_dlq_topic: String,
    pub max_deliver: u32,
    pub clickhouse_url: String,
    pub clickhouse_database: String,
    pub clickhouse_user: String,
    pub clickhouse_password: Option<String>,
    pub clickhouse_table: String,
    pub clickhouse_max_execution_seconds: u64,
    pub clickhouse_insert_timeout_seconds: u64,
    pub clickhouse_create_table: bool,
    pub batch_size: usize,
    pub batch_timeout_ms: u64,
    pub worker_count: usize,
    pub insert_max_retries: u32,
    pub insert_retry_backoff_ms: u64,
    pub fetch_wait_ms: u64,
    pub stats_interval_seconds: u64,
    pub health_bind: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars { lookup };

        let config = Self {
            kafka_brokers: vars.required("KAFKA_BROKERS")?,
            kafka_topic: vars.string("KAFKA_TOPIC", "edr.events.raw"),
            kafka_group_id: vars.string("KAFKA_GROUP_ID", "clickhouse-writer"),
            kafka_security_protocol: vars.string("KAFKA_SECURITY_PROTOCOL", "PLAINTEXT"),
            kafka_sasl_mechanism: vars.optional("KAFKA_SASL_MECHANISM"),
            kafka_sasl_username: vars.optional("KAFKA_SASL_USERNAME"),
            kafka_sasl_password: vars.optional("KAFKA_SASL_PASSWORD"),
            kafka_ssl_ca_location: vars.optional("KAFKA_SSL_CA_LOCATION"),
            kafka_session_timeout_ms: vars.parsed("KAFKA_SESSION_TIMEOUT_MS", 10_000)?,
            kafka_max_poll_interval_ms: vars.parsed("KAFKA_MAX_POLL_INTERVAL_MS", 60_000)?,
            kafka_reconnect_backoff_ms: vars.parsed("KAFKA_RECONNECT_BACKOFF_MS", 2_000)?,
            kafka_reconnect_backoff_max_ms: vars
                .parsed("KAFKA_RECONNECT_BACKOFF_MAX_MS", 20_000)?,
            kafka_auto_create_topics: vars.boolean("KAFKA_AUTO_CREATE_TOPICS", false),
            kafka_topic_partitions: vars.parsed("KAFKA_TOPIC_PARTITIONS", 8)?,
            kafka_topic_replication_factor: vars.parsed("KAFKA_TOPIC_REPLICATION_FACTOR", 1)?,
            kafka_dlq_topic: vars.string("KAFKA_DLQ_TOPIC", "edr.events.dlq"),
            max_deliver: vars.parsed("CONSUMER_MAX_DELIVER", 5)?,
            clickhouse_url: vars.string("CLICKHOUSE_URL", "http://localhost:8123"),
            clickhouse_database: vars.string("CLICKHOUSE_DATABASE", "default"),
            clickhouse_user: vars.string("CLICKHOUSE_USER", "default"),
            clickhouse_password: vars.optional("CLICKHOUSE_PASSWORD"),
            clickhouse_table: vars.string("CLICKHOUSE_TABLE", "telemetry_events"),
            clickhouse_max_execution_seconds: vars
                .parsed("CLICKHOUSE_MAX_EXECUTION_SECONDS", 60)?,
            clickhouse_insert_timeout_seconds: vars
                .parsed("CLICKHOUSE_INSERT_TIMEOUT_SECONDS", 60)?,
            clickhouse_create_table: vars.boolean("CLICKHOUSE_CREATE_TABLE", false),
            batch_size: vars.parsed("BATCH_SIZE", 1_000)?,
            batch_timeout_ms: vars.parsed("BATCH_TIMEOUT_MS", 5_000)?,
            worker_count: vars.parsed("WORKER_COUNT", 4)?,
            insert_max_retries: vars.parsed("INSERT_MAX_RETRIES", 3)?,
            insert_retry_backoff_ms: vars.parsed("INSERT_RETRY_BACKOFF_MS", 1_000)?,
            fetch_wait_ms: vars.parsed("FETCH_WAIT_MS", 1_000)?,
            stats_interval_seconds: vars.parsed("STATS_INTERVAL_SECONDS", 30)?,
            health_bind: vars.optional("HEALTH_BIND"),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.kafka_topic_partitions <= 0 {
            return Err(anyhow!("KAFKA_TOPIC_PARTITIONS must be a positive integer"));
        }

        if self.kafka_topic_replication_factor <= 0 {
            return Err(anyhow!(
                "KAFKA_TOPIC_REPLICATION_FACTOR must be a positive integer"
            ));
        }

        if !is_identifier(&self.clickhouse_database) {
            return Err(anyhow!(
                "CLICKHOUSE_DATABASE must contain only letters, digits and underscores"
            ));
        }

        if !is_identifier(&self.clickhouse_table) {
            return Err(anyhow!(
                "CLICKHOUSE_TABLE must contain only letters, digits and underscores"
            ));
        }

        if self.batch_size == 0 {
            return Err(anyhow!("BATCH_SIZE must be greater than 0"));
        }

        if self.worker_count == 0 {
            return Err(anyhow!("WORKER_COUNT must be greater than 0"));
        }

        if self.batch_timeout_ms == 0 || self.fetch_wait_ms == 0 {
            return Err(anyhow!(
                "BATCH_TIMEOUT_MS and FETCH_WAIT_MS must be greater than 0"
            ));
        }

        if self.stats_interval_seconds == 0 {
            return Err(anyhow!("STATS_INTERVAL_SECONDS must be greater than 0"));
        }

        if self.clickhouse_insert_timeout_seconds == 0 {
            return Err(anyhow!(
                "CLICKHOUSE_INSERT_TIMEOUT_SECONDS must be greater than 0"
            ));
        }

        Ok(())
    }

    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }

    pub fn fetch_wait(&self) -> Duration {
        Duration::from_millis(self.fetch_wait_ms)
    }

    pub fn insert_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.insert_retry_backoff_ms)
    }

    pub fn insert_timeout(&self) -> Duration {
        Duration::from_secs(self.clickhouse_insert_timeout_seconds)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_seconds)
    }
}

struct Vars<F> {
    lookup: F,
}

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn required(&self, name: &str) -> Result<String> {
        let value = (self.lookup)(name).with_context(|| format!("missing env var: {name}"))?;
        if value.trim().is_empty() {
            return Err(anyhow!("env var {name} cannot be empty"));
        }
        Ok(value)
    }

    fn optional(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|value| !value.trim().is_empty())
    }

    fn string(&self, name: &str, default: &str) -> String {
        self.optional(name).unwrap_or_else(|| default.to_string())
    }

    fn parsed<T>(&self, name: &str, default: T) -> Result<T>
    where
        T: std::str::FromStr,
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        self.optional(name)
            .map(|value| {
                value
                    .trim()
                    .parse::<T>()
                    .with_context(|| format!("invalid {} for {name}", std::any::type_name::<T>()))
            })
            .transpose()
            .map(|value| value.unwrap_or(default))
    }

    fn boolean(&self, name: &str, default: bool) -> bool {
        match (self.lookup)(name) {
            Some(value) => matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            ),
            None => default,
        }
    }
}

fn is_identifier(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|character| character.is_ascii_alphanumeric() || character == '_')
}
