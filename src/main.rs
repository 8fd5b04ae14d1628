use anyhow::Result;
use dht_ingest::{
    BrokerConnection, Config, HistoryStore, IngestStats, MessageIngester, SnapshotApi,
};
use std::sync::Arc;

fn init_tracing() -> Result<()> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,dht_ingest=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;
    let config = Config::from_env()?;

    let store = Arc::new(HistoryStore::new(
        config.max_data_points,
        config.message_log_capacity,
    ));
    let stats = Arc::new(IngestStats::new());
    let ingester = MessageIngester::new(store.clone(), stats.clone());

    // A failed connect is not fatal: the dashboard keeps serving default data.
    let (connection, delivery_handle) =
        match BrokerConnection::start(&config.broker, ingester).await {
            Ok((connection, handle)) => (Some(connection), Some(handle)),
            Err(err) => {
                tracing::error!(error = %err, "running without an MQTT session");
                (None, None)
            }
        };

    let api = SnapshotApi::new(store, stats, connection.clone());
    let sensor_topic = config.sensor_topic.clone();
    let control_topic = config.control_topic.clone();
    let poll_handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.poll_interval());
        loop {
            ticker.tick().await;
            let latest = api.latest_reading();
            let stats = api.stats();
            let sensor_messages = api.message_count_on(&sensor_topic);
            let control_messages = api.message_count_on(&control_topic);
            tracing::info!(
                temperature = latest.temperature,
                humidity = latest.humidity,
                timestamp = %latest.timestamp,
                points = api.sensor_series().len(),
                sensor_messages,
                control_messages,
                received = stats.messages_received,
                ingest_errors = stats.ingest_errors,
                connected = stats.mqtt_connected,
                "history snapshot"
            );
        }
    });

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(err) = signal {
                tracing::debug!(error = %err, "failed to wait for shutdown signal");
            }
            tracing::info!("shutdown signal received");
        }
        _ = async {
            match &connection {
                Some(connection) => connection.wait_for_disconnect().await,
                None => std::future::pending::<()>().await,
            }
        } => {
            tracing::warn!("MQTT session ended; restart the process to reconnect");
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::debug!(error = %err, "failed to wait for shutdown signal");
            }
        }
    }

    if let Some(connection) = &connection {
        if let Err(err) = connection.disconnect() {
            tracing::debug!(error = %err, "disconnect request not queued");
        }
    }
    if let Some(handle) = delivery_handle {
        let _ = tokio::time::timeout(std::time::Duration::from_secs(2), handle).await;
    }
    poll_handle.abort();

    Ok(())
}
