use crate::category::EventCategory;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    #[serde(default)]
    pub agent_id: String,
    /// Epoch milliseconds. Absent means the epoch itself.
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub event_type: String,
    #[serde(default)]
    pub mitre_tactic: String,
    #[serde(default)]
    pub mitre_technique: String,
    #[serde(default)]
    pub severity: i32,
    #[serde(default)]
    pub payload: String,
    #[serde(default)]
    pub tenant_id: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub os_type: String,
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("message has no payload")]
    EmptyPayload,

    #[error("invalid event json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("timestamp {0} is outside the representable range")]
    TimestampOutOfRange(i64),
}

impl Event {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.is_empty() {
            return Err(DecodeError::EmptyPayload);
        }

        let event: Event = serde_json::from_slice(bytes)?;
        if DateTime::<Utc>::from_timestamp_millis(event.timestamp).is_none() {
            return Err(DecodeError::TimestampOutOfRange(event.timestamp));
        }

        Ok(event)
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_millis(self.timestamp).unwrap_or_default()
    }

    pub fn category(&self) -> EventCategory {
        EventCategory::from_tag(&self.event_type)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterEnvelope {
    pub failed_at: String,
    pub error: String,
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub delivery_count: u32,
    pub payload: String,
}

impl DeadLetterEnvelope {
    pub fn new(
        topic: &str,
        partition: i32,
        offset: i64,
        delivery_count: u32,
        raw: &[u8],
        error: &str,
    ) -> Self {
        Self {
            failed_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            error: error.to_string(),
            topic: topic.to_string(),
            partition,
            offset,
            delivery_count,
            payload: String::from_utf8_lossy(raw).into_owned(),
        }
    }

    pub fn key(&self) -> String {
        format!("{}-{}-{}", self.topic, self.partition, self.offset)
    }
}
