
use crate::stats::IngestStats;
use crate::store::HistoryStore;
use crate::telemetry::{
    extract_reading, format_timestamp, MessagePayload, RawMessage, SensorReading,
};
use chrono::{DateTime, Local, Utc};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("field `{field}` on {topic} is not numeric: {value}")]
    NonNumericField {
        topic: String,
        field: &'static str,
        value: Value,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    Reading(SensorReading),
    Logged,
}

/// Turns broker deliveries into history entries.
///
/// Runs on the delivery context; it never blocks on I/O.
#[derive(Clone)]
pub struct MessageIngester {
    store: Arc<HistoryStore>,
    stats: Arc<IngestStats>,
}

impl MessageIngester {
    pub fn new(store: Arc<HistoryStore>, stats: Arc<IngestStats>) -> Self {
        Self { store, stats }
    }

    pub fn store(&self) -> Arc<HistoryStore> {
        self.store.clone()
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        self.stats.clone()
    }

    pub fn ingest(&self, topic: &str, raw: &[u8]) -> Result<IngestOutcome, IngestError> {
        self.ingest_at(topic, raw, Local::now())
    }

    /// The message is always logged. The sensor series only grow when the
    /// payload is a JSON object carrying numeric `temperature`/`humidity` keys.
    pub fn ingest_at(
        &self,
        topic: &str,
        raw: &[u8],
        now: DateTime<Local>,
    ) -> Result<IngestOutcome, IngestError> {
        self.stats.record_received(now.with_timezone(&Utc));

        let payload = MessagePayload::decode(raw);
        let timestamp = format_timestamp(&now);
        let reading = match payload.as_structured() {
            Some(map) => extract_reading(map, &timestamp),
            None => Ok(None),
        };

        let message = RawMessage {
            timestamp,
            topic: topic.to_string(),
            payload,
        };

        match reading {
            Ok(Some(reading)) => {
                self.store.record(message, Some(reading.clone()));
                self.stats.record_reading();
                tracing::debug!(
                    topic,
                    temperature = reading.temperature,
                    humidity = reading.humidity,
                    "sensor reading received"
                );
                Ok(IngestOutcome::Reading(reading))
            }
            Ok(None) => {
                tracing::debug!(topic, payload = %message.payload, "message received");
                if message.payload.as_structured().is_none() {
                    self.stats.record_raw_text();
                }
                self.store.record(message, None);
                Ok(IngestOutcome::Logged)
            }
            Err(invalid) => {
                self.store.record(message, None);
                let err = IngestError::NonNumericField {
                    topic: topic.to_string(),
                    field: invalid.field,
                    value: invalid.value,
                };
                self.stats.record_ingest_error(err.to_string());
                Err(err)
            }
        }
    }
}
