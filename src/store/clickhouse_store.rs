use super::{EventStore, TelemetryRow};
use crate::config::Config;
use crate::error::StoreError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use clickhouse::Client;
use std::time::Duration;
use telemetry_core::category::EventCategory;
use tracing::info;

#[derive(Clone)]
pub struct ClickHouseStore {
    client: Client,
    table: String,
    insert_timeout: Duration,
}

impl ClickHouseStore {
    pub fn from_config(config: &Config) -> Self {
        let mut client = Client::default()
            .with_url(&config.clickhouse_url)
            .with_database(&config.clickhouse_database)
            .with_user(&config.clickhouse_user)
            .with_option(
                "max_execution_time",
                config.clickhouse_max_execution_seconds.to_string(),
            );
        if let Some(password) = &config.clickhouse_password {
            client = client.with_password(password);
        }

        Self {
            client,
            table: config.clickhouse_table.clone(),
            insert_timeout: config.insert_timeout(),
        }
    }

    /// Builds the store and verifies the server answers before any worker starts.
    pub async fn connect(config: &Config) -> Result<Self> {
        let store = Self::from_config(config);
        store
            .client
            .query("SELECT 1")
            .execute()
            .await
            .with_context(|| format!("ping clickhouse at {}", config.clickhouse_url))?;

        info!(
            url = %config.clickhouse_url,
            database = %config.clickhouse_database,
            table = %store.table,
            "clickhouse reachable"
        );
        Ok(store)
    }

    pub async fn ensure_table(&self) -> Result<()> {
        self.client
            .query(&create_table_sql(&self.table))
            .execute()
            .await
            .with_context(|| format!("create clickhouse table {}", self.table))?;

        info!(table = %self.table, "clickhouse table ready");
        Ok(())
    }

    async fn write_rows(&self, rows: &[TelemetryRow]) -> Result<(), clickhouse::error::Error> {
        let mut insert = self
            .client
            .insert::<TelemetryRow>(&self.table)
            .await?
            .with_timeouts(Some(self.insert_timeout), Some(self.insert_timeout));

        for row in rows {
            insert.write(row).await?;
        }
        insert.end().await
    }
}

#[async_trait]
impl EventStore for ClickHouseStore {
    async fn insert(&self, rows: &[TelemetryRow]) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }

        self.write_rows(rows).await.map_err(|error| match error {
            clickhouse::error::Error::TimedOut => StoreError::Timeout(self.insert_timeout),
            clickhouse::error::Error::BadResponse(message) => StoreError::Rejected(message),
            other => StoreError::ClickHouse(other),
        })
    }
}

pub fn create_table_sql(table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (
    agent_id String,
    timestamp DateTime64(3, 'UTC'),
    event_type {event_type},
    mitre_tactic LowCardinality(String),
    mitre_technique LowCardinality(String),
    severity Int32,
    payload String,
    tenant_id LowCardinality(String),
    hostname String,
    os_type LowCardinality(String)
)
ENGINE = MergeTree
PARTITION BY toYYYYMMDD(timestamp)
ORDER BY (tenant_id, event_type, timestamp)",
        event_type = EventCategory::enum8_definition(),
    )
}
