use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Mutex,
};

#[derive(Debug, Default)]
pub struct IngestStats {
    pub messages_received: AtomicU64,
    pub sensor_readings: AtomicU64,
    pub raw_text_messages: AtomicU64,
    pub ingest_errors: AtomicU64,
    pub messages_published: AtomicU64,
    pub publish_rejected: AtomicU64,
    pub mqtt_connected: AtomicBool,
    pub last_error: Mutex<Option<String>>,
    pub last_activity: Mutex<Option<DateTime<Utc>>>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub messages_received: u64,
    pub sensor_readings: u64,
    pub raw_text_messages: u64,
    pub ingest_errors: u64,
    pub messages_published: u64,
    pub publish_rejected: u64,
    pub mqtt_connected: bool,
    pub last_error: Option<String>,
    pub last_activity: Option<DateTime<Utc>>,
}

impl IngestStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_mqtt_connected(&self, connected: bool) {
        self.mqtt_connected.store(connected, Ordering::Relaxed);
    }

    pub fn record_received(&self, at: DateTime<Utc>) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut guard) = self.last_activity.lock() {
            *guard = Some(at);
        }
    }

    pub fn record_reading(&self) {
        self.sensor_readings.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_raw_text(&self) {
        self.raw_text_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ingest_error(&self, err: impl Into<String>) {
        self.ingest_errors.fetch_add(1, Ordering::Relaxed);
        self.record_error(err);
    }

    pub fn record_published(&self) {
        self.messages_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_publish_rejected(&self, err: impl Into<String>) {
        self.publish_rejected.fetch_add(1, Ordering::Relaxed);
        self.record_error(err);
    }

    pub fn record_error(&self, err: impl Into<String>) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(err.into());
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            messages_received: self.messages_received.load(Ordering::Relaxed),
            sensor_readings: self.sensor_readings.load(Ordering::Relaxed),
            raw_text_messages: self.raw_text_messages.load(Ordering::Relaxed),
            ingest_errors: self.ingest_errors.load(Ordering::Relaxed),
            messages_published: self.messages_published.load(Ordering::Relaxed),
            publish_rejected: self.publish_rejected.load(Ordering::Relaxed),
            mqtt_connected: self.mqtt_connected.load(Ordering::Relaxed),
            last_error: self.last_error.lock().ok().and_then(|guard| guard.clone()),
            last_activity: self.last_activity.lock().ok().and_then(|guard| *guard),
        }
    }
}
