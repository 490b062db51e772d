pub mod clickhouse_store;

use crate::error::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use telemetry_core::category::EventCategory;
use telemetry_core::model::Event;

/// One row of the telemetry table, in column order.
#[derive(Debug, Clone, PartialEq, Serialize, clickhouse::Row)]
pub struct TelemetryRow {
    pub agent_id: String,
    #[serde(with = "clickhouse::serde::chrono::datetime64::millis")]
    pub timestamp: DateTime<Utc>,
    pub event_type: EventCategory,
    pub mitre_tactic: String,
    pub mitre_technique: String,
    pub severity: i32,
    pub payload: String,
    pub tenant_id: String,
    pub hostname: String,
    pub os_type: String,
}

impl From<&Event> for TelemetryRow {
    fn from(event: &Event) -> Self {
        Self {
            agent_id: event.agent_id.clone(),
            timestamp: event.occurred_at(),
            event_type: event.category(),
            mitre_tactic: event.mitre_tactic.clone(),
            mitre_technique: event.mitre_technique.clone(),
            severity: event.severity,
            payload: event.payload.clone(),
            tenant_id: event.tenant_id.clone(),
            hostname: event.hostname.clone(),
            os_type: event.os_type.clone(),
        }
    }
}

/// Columnar sink for telemetry rows. One call is one all-or-nothing insert.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn insert(&self, rows: &[TelemetryRow]) -> Result<(), StoreError>;
}
