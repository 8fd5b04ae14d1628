//! MQTT ingest core for the DHT11 dashboard.
//!
//! A [`mqtt::BrokerConnection`] feeds every delivery to a
//! [`ingest::MessageIngester`], which writes into a bounded
//! [`store::HistoryStore`]. The dashboard reads copies through
//! [`api::SnapshotApi`].

pub mod api;
pub mod config;
pub mod ingest;
pub mod mqtt;
pub mod stats;
pub mod store;
pub mod telemetry;

pub use api::SnapshotApi;
pub use config::{BrokerConfig, Config};
pub use ingest::{IngestError, IngestOutcome, MessageIngester};
pub use mqtt::{BrokerConnection, ConnectError, ConnectionState, PublishError};
pub use stats::{IngestStats, StatsSnapshot};
pub use store::{BoundedSeries, HistoryStore};
pub use telemetry::{MessagePayload, RawMessage, SensorReading, SensorSeries};
