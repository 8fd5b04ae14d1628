mod series;

pub use series::BoundedSeries;

use crate::telemetry::{RawMessage, SensorReading, SensorSeries};
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug)]
struct StoreInner {
    temperature: BoundedSeries<f64>,
    humidity: BoundedSeries<f64>,
    timestamps: BoundedSeries<String>,
    messages: BoundedSeries<RawMessage>,
}

/// Recent sensor history plus the raw message log, behind a single lock.
///
/// Writers and readers take the same mutex for the length of one append or
/// one copy. No I/O or parsing happens while it is held.
#[derive(Debug)]
pub struct HistoryStore {
    inner: Mutex<StoreInner>,
}

impl HistoryStore {
    pub fn new(sensor_capacity: usize, message_capacity: usize) -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                temperature: BoundedSeries::new(sensor_capacity),
                humidity: BoundedSeries::new(sensor_capacity),
                timestamps: BoundedSeries::new(sensor_capacity),
                messages: BoundedSeries::new(message_capacity),
            }),
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self::new(capacity, capacity)
    }

    // Every critical section leaves the series consistent, so a poisoned
    // lock still guards valid data.
    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn append_message(&self, message: RawMessage) {
        self.lock().messages.push(message);
    }

    pub fn append_sensor_triple(&self, temperature: f64, humidity: f64, timestamp: String) {
        let mut inner = self.lock();
        inner.temperature.push(temperature);
        inner.humidity.push(humidity);
        inner.timestamps.push(timestamp);
    }

    /// Logs `message` and, when present, appends `reading` in the same critical section.
    pub fn record(&self, message: RawMessage, reading: Option<SensorReading>) {
        let mut inner = self.lock();
        inner.messages.push(message);
        if let Some(reading) = reading {
            inner.temperature.push(reading.temperature);
            inner.humidity.push(reading.humidity);
            inner.timestamps.push(reading.timestamp);
        }
    }

    pub fn snapshot(&self) -> SensorSeries {
        let inner = self.lock();
        SensorSeries {
            temperature: inner.temperature.to_vec(),
            humidity: inner.humidity.to_vec(),
            timestamps: inner.timestamps.to_vec(),
        }
    }

    pub fn latest(&self) -> SensorReading {
        let inner = self.lock();
        match (
            inner.temperature.last(),
            inner.humidity.last(),
            inner.timestamps.last(),
        ) {
            (Some(temperature), Some(humidity), Some(timestamp)) => SensorReading {
                temperature: *temperature,
                humidity: *humidity,
                timestamp: timestamp.clone(),
            },
            _ => SensorReading::default(),
        }
    }

    /// Message log, oldest first. `limit` keeps only the final entries.
    pub fn recent_messages(&self, limit: Option<usize>) -> Vec<RawMessage> {
        let inner = self.lock();
        match limit {
            Some(limit) => inner.messages.tail(limit),
            None => inner.messages.to_vec(),
        }
    }

    pub fn sensor_len(&self) -> usize {
        self.lock().timestamps.len()
    }

    pub fn message_len(&self) -> usize {
        self.lock().messages.len()
    }
}
