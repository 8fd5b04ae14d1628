use crate::mqtt::BrokerConnection;
use crate::stats::{IngestStats, StatsSnapshot};
use crate::store::HistoryStore;
use crate::telemetry::{RawMessage, SensorReading, SensorSeries};
use rumqttc::QoS;
use std::sync::Arc;

/// Read side handed to the dashboard layer, plus a publish passthrough.
///
/// Every accessor returns an owned copy, so callers never hold the store lock.
#[derive(Clone)]
pub struct SnapshotApi {
    store: Arc<HistoryStore>,
    stats: Arc<IngestStats>,
    connection: Option<BrokerConnection>,
}

impl SnapshotApi {
    pub fn new(
        store: Arc<HistoryStore>,
        stats: Arc<IngestStats>,
        connection: Option<BrokerConnection>,
    ) -> Self {
        Self {
            store,
            stats,
            connection,
        }
    }

    pub fn sensor_series(&self) -> SensorSeries {
        self.store.snapshot()
    }

    pub fn latest_reading(&self) -> SensorReading {
        self.store.latest()
    }

    pub fn recent_messages(&self, limit: Option<usize>) -> Vec<RawMessage> {
        self.store.recent_messages(limit)
    }

    /// Logged messages whose topic contains `topic`.
    pub fn message_count_on(&self, topic: &str) -> usize {
        self.store
            .recent_messages(None)
            .iter()
            .filter(|message| message.topic.contains(topic))
            .count()
    }

    /// `false` when there is no live session or the client refused the request.
    pub fn publish_message(&self, topic: &str, payload: &str, qos: Option<QoS>) -> bool {
        let Some(connection) = &self.connection else {
            self.stats
                .record_publish_rejected(format!("publish to {topic} without a connection"));
            tracing::warn!(topic, "MQTT client not connected; publish skipped");
            return false;
        };
        match connection.publish(topic, payload, qos) {
            Ok(()) => {
                tracing::info!(topic, payload, "published");
                true
            }
            Err(err) => {
                tracing::warn!(error = %err, topic, "failed to publish");
                false
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection
            .as_ref()
            .map(BrokerConnection::is_connected)
            .unwrap_or(false)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}
