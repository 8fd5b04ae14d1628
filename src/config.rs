use anyhow::{anyhow, bail, Context, Result};
use rumqttc::QoS;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

const DEFAULT_BROKER: &str = "broker.emqx.io";
const DEFAULT_PORT: u16 = 1883;
const DEFAULT_SENSOR_TOPIC: &str = "weresick/dht11";
const DEFAULT_CONTROL_TOPIC: &str = "weresick/led";
const DEFAULT_CLIENT_ID: &str = "iot-dashboard-dht11";
const DEFAULT_KEEPALIVE_SECS: u64 = 60;
// rumqttc rejects keep-alive intervals shorter than this.
const MIN_KEEPALIVE_SECS: u64 = 5;
const DEFAULT_QOS: u8 = 1;
const DEFAULT_MAX_DATA_POINTS: usize = 100;
const DEFAULT_POLL_INTERVAL_MS: u64 = 3000;

/// Connection settings; fixed once `BrokerConnection::start` is called.
#[derive(Clone, Debug, PartialEq)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub keepalive: Duration,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: String,
    pub topics: Vec<String>,
    pub qos: QoS,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub broker: BrokerConfig,
    pub sensor_topic: String,
    pub control_topic: String,
    pub max_data_points: usize,
    pub message_log_capacity: usize,
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SetupConfigOverrides {
    #[serde(default)]
    mqtt_broker: Option<String>,
    #[serde(default)]
    mqtt_port: Option<u16>,
    #[serde(default)]
    mqtt_username: Option<String>,
    #[serde(default)]
    mqtt_password: Option<String>,
    #[serde(default)]
    mqtt_client_id: Option<String>,
    #[serde(default)]
    mqtt_qos: Option<u8>,
    #[serde(default)]
    mqtt_keepalive_secs: Option<u64>,
    #[serde(default)]
    max_data_points: Option<usize>,
}

fn load_setup_config_overrides(path: &Path) -> Option<SetupConfigOverrides> {
    if !path.exists() {
        return None;
    }
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "failed to read setup config; using env defaults"
            );
            return None;
        }
    };
    match serde_json::from_str(&contents) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "failed to parse setup config; using env defaults"
            );
            None
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from a key lookup. Blank values count as unset, and
    /// setup-file overrides only fill keys the lookup left unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let overrides = get("DHT_INGEST_SETUP_CONFIG_PATH")
            .map(PathBuf::from)
            .and_then(|path| load_setup_config_overrides(&path))
            .unwrap_or_default();

        let broker_raw = get("MQTT_BROKER")
            .or_else(|| non_blank(overrides.mqtt_broker.as_deref()))
            .unwrap_or_else(|| DEFAULT_BROKER.to_string());
        let configured_port = match get("MQTT_PORT") {
            Some(raw) => parse_number::<u16>("MQTT_PORT", &raw)?,
            None => overrides
                .mqtt_port
                .filter(|v| *v != 0)
                .unwrap_or(DEFAULT_PORT),
        };
        let (host, port) = normalize_broker(&broker_raw, configured_port)?;

        let keepalive_secs = match get("MQTT_KEEPALIVE") {
            Some(raw) => parse_number::<u64>("MQTT_KEEPALIVE", &raw)?,
            None => overrides
                .mqtt_keepalive_secs
                .filter(|v| *v != 0)
                .unwrap_or(DEFAULT_KEEPALIVE_SECS),
        };
        let qos_level = match get("MQTT_QOS") {
            Some(raw) => parse_number::<u8>("MQTT_QOS", &raw)?,
            None => overrides.mqtt_qos.unwrap_or(DEFAULT_QOS),
        };
        let qos = parse_qos(qos_level)?;

        let username = get("USERNAME").or_else(|| non_blank(overrides.mqtt_username.as_deref()));
        let password = get("PASSWORD").or_else(|| non_blank(overrides.mqtt_password.as_deref()));
        let client_id = get("CLIENT_ID")
            .or_else(|| non_blank(overrides.mqtt_client_id.as_deref()))
            .unwrap_or_else(|| DEFAULT_CLIENT_ID.to_string());

        let sensor_topic = get("MQTT_TOPIC_DHT").unwrap_or_else(|| DEFAULT_SENSOR_TOPIC.to_string());
        let control_topic =
            get("MQTT_TOPIC_LED").unwrap_or_else(|| DEFAULT_CONTROL_TOPIC.to_string());
        let mut topics = vec![sensor_topic.clone(), control_topic.clone()];
        if let Some(extra) = get("MQTT_EXTRA_TOPICS") {
            for topic in extra.split(',').map(str::trim).filter(|t| !t.is_empty()) {
                if !topics.iter().any(|existing| existing == topic) {
                    topics.push(topic.to_string());
                }
            }
        }

        let max_data_points = match get("MAX_DATA_POINTS") {
            Some(raw) => parse_number::<usize>("MAX_DATA_POINTS", &raw)?,
            None => overrides.max_data_points.unwrap_or(DEFAULT_MAX_DATA_POINTS),
        };
        if max_data_points == 0 {
            bail!("MAX_DATA_POINTS must be at least 1");
        }
        let message_log_capacity = match get("MESSAGE_LOG_CAPACITY") {
            Some(raw) => parse_number::<usize>("MESSAGE_LOG_CAPACITY", &raw)?,
            None => max_data_points,
        };
        if message_log_capacity == 0 {
            bail!("MESSAGE_LOG_CAPACITY must be at least 1");
        }
        let poll_interval_ms = match get("POLL_INTERVAL_MS") {
            Some(raw) => parse_number::<u64>("POLL_INTERVAL_MS", &raw)?,
            None => DEFAULT_POLL_INTERVAL_MS,
        }
        .max(1);

        Ok(Self {
            broker: BrokerConfig {
                host,
                port,
                keepalive: Duration::from_secs(keepalive_secs.max(MIN_KEEPALIVE_SECS)),
                username,
                password,
                client_id,
                topics,
                qos,
            },
            sensor_topic,
            control_topic,
            max_data_points,
            message_log_capacity,
            poll_interval_ms,
        })
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Reduces a broker setting to host and port.
///
/// `mqtt://host:port` keeps only the host, plus the port when one is given.
/// `host:port` splits on the last colon. Anything else is a bare host.
pub fn normalize_broker(raw: &str, default_port: u16) -> Result<(String, u16)> {
    let trimmed = raw.trim();
    if trimmed.contains("://") {
        let url = Url::parse(trimmed).with_context(|| format!("invalid MQTT_BROKER {trimmed}"))?;
        let host = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| anyhow!("MQTT_BROKER {trimmed} is missing a host"))?
            .to_string();
        return Ok((host, url.port().unwrap_or(default_port)));
    }
    if let Some((host, port)) = trimmed.rsplit_once(':') {
        if let Ok(port) = port.parse::<u16>() {
            if !host.is_empty() && !host.contains(':') {
                return Ok((host.to_string(), port));
            }
        }
    }
    Ok((trimmed.to_string(), default_port))
}

pub fn parse_qos(level: u8) -> Result<QoS> {
    match level {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => bail!("invalid MQTT_QOS {other}; expected 0, 1 or 2"),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.parse::<T>().with_context(|| format!("invalid {key}"))
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
}
