use chrono::{DateTime, TimeZone};
use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;

pub const TIMESTAMP_FORMAT: &str = "%H:%M:%S";
pub const MISSING_TIMESTAMP: &str = "N/A";

/// Body of a received message, classified once when it is decoded.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MessagePayload {
    Structured(Map<String, Value>),
    RawText(String),
}

impl MessagePayload {
    /// Lossy UTF-8 decode, then JSON. Only a JSON object counts as structured;
    /// every other outcome keeps the decoded text verbatim.
    pub fn decode(raw: &[u8]) -> Self {
        let text = String::from_utf8_lossy(raw);
        match serde_json::from_str::<Value>(&text) {
            Ok(Value::Object(map)) => MessagePayload::Structured(map),
            _ => MessagePayload::RawText(text.into_owned()),
        }
    }

    pub fn as_structured(&self) -> Option<&Map<String, Value>> {
        match self {
            MessagePayload::Structured(map) => Some(map),
            MessagePayload::RawText(_) => None,
        }
    }
}

impl fmt::Display for MessagePayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessagePayload::Structured(map) => {
                let rendered = serde_json::to_string(map).map_err(|_| fmt::Error)?;
                f.write_str(&rendered)
            }
            MessagePayload::RawText(text) => f.write_str(text),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RawMessage {
    pub timestamp: String,
    pub topic: String,
    pub payload: MessagePayload,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SensorReading {
    pub temperature: f64,
    pub humidity: f64,
    pub timestamp: String,
}

impl Default for SensorReading {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            humidity: 0.0,
            timestamp: MISSING_TIMESTAMP.to_string(),
        }
    }
}

/// Copy of the three parallel sensor series. All three vectors have the same length.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct SensorSeries {
    pub temperature: Vec<f64>,
    pub humidity: Vec<f64>,
    pub timestamps: Vec<String>,
}

impl SensorSeries {
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InvalidField {
    pub field: &'static str,
    pub value: Value,
}

pub const READING_FIELDS: [&str; 2] = ["temperature", "humidity"];

/// Pulls `temperature` and `humidity` out of a structured payload.
///
/// An object carrying neither key (a control command) is not a reading.
/// Otherwise a missing key or `null` reads as 0.
pub fn extract_reading(
    map: &Map<String, Value>,
    timestamp: &str,
) -> Result<Option<SensorReading>, InvalidField> {
    if !READING_FIELDS.iter().any(|field| map.contains_key(*field)) {
        return Ok(None);
    }
    Ok(Some(SensorReading {
        temperature: numeric_field(map, "temperature")?,
        humidity: numeric_field(map, "humidity")?,
        timestamp: timestamp.to_string(),
    }))
}

fn numeric_field(map: &Map<String, Value>, field: &'static str) -> Result<f64, InvalidField> {
    match map.get(field) {
        None | Some(Value::Null) => Ok(0.0),
        Some(value) => value.as_f64().ok_or_else(|| InvalidField {
            field,
            value: value.clone(),
        }),
    }
}

pub fn format_timestamp<Tz>(now: &DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: fmt::Display,
{
    now.format(TIMESTAMP_FORMAT).to_string()
}
