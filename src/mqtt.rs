use crate::config::BrokerConfig;
use crate::ingest::MessageIngester;
use crate::stats::IngestStats;
use rumqttc::{
    AsyncClient, ClientError, ConnectReturnCode, ConnectionError, Event, EventLoop, Incoming,
    MqttOptions, Outgoing, QoS, SubAck, SubscribeReasonCode,
};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

const REQUEST_CHANNEL_CAPACITY: usize = 32;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("mqtt connection failed: {0}")]
    Connection(#[from] ConnectionError),
    #[error("broker refused connection: {0:?}")]
    Refused(ConnectReturnCode),
    #[error("failed to subscribe to {topic}: {source}")]
    Subscribe {
        topic: String,
        #[source]
        source: ClientError,
    },
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("not connected to the MQTT broker")]
    NotConnected,
    #[error("failed to submit publish: {0}")]
    Client(#[from] ClientError),
}

/// Handle to the single broker session.
///
/// Incoming publishes are handed to the ingester on the delivery task that
/// `start` spawns. When that task sees an error or a broker disconnect the
/// state drops to `Disconnected` and stays there; there is no reconnect.
#[derive(Clone)]
pub struct BrokerConnection {
    client: AsyncClient,
    state: Arc<watch::Sender<ConnectionState>>,
    default_qos: QoS,
    stats: Arc<IngestStats>,
}

impl BrokerConnection {
    /// Connects once, then subscribes to every configured topic.
    ///
    /// Returns only after the broker acknowledged the connection. On any
    /// failure the event loop is dropped so no session is left running.
    pub async fn start(
        config: &BrokerConfig,
        ingester: MessageIngester,
    ) -> Result<(Self, JoinHandle<()>), ConnectError> {
        let mut options =
            MqttOptions::new(config.client_id.clone(), config.host.clone(), config.port);
        options.set_keep_alive(config.keepalive);
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            options.set_credentials(username.clone(), password.clone());
        }

        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);
        let stats = ingester.stats();
        let (state, _) = watch::channel(ConnectionState::Connecting);
        let state = Arc::new(state);

        tracing::info!(
            host = %config.host,
            port = config.port,
            client_id = %config.client_id,
            "connecting to MQTT broker"
        );
        if let Err(err) = await_connack(&mut eventloop).await {
            state.send_replace(ConnectionState::Disconnected);
            stats.record_error(err.to_string());
            tracing::error!(
                error = %err,
                host = %config.host,
                port = config.port,
                "failed to connect to MQTT broker"
            );
            return Err(err);
        }
        state.send_replace(ConnectionState::Connected);
        stats.set_mqtt_connected(true);
        tracing::info!(host = %config.host, port = config.port, "connected to MQTT broker");

        let connection = Self {
            client,
            state: state.clone(),
            default_qos: config.qos,
            stats,
        };

        // The event loop must be polled for the subscribe requests to drain.
        let handle = tokio::spawn(run_delivery(eventloop, ingester, state));

        for topic in &config.topics {
            if let Err(source) = connection.client.subscribe(topic.clone(), config.qos).await {
                handle.abort();
                connection.mark_disconnected();
                let err = ConnectError::Subscribe {
                    topic: topic.clone(),
                    source,
                };
                connection.stats.record_error(err.to_string());
                tracing::error!(error = %err, "failed to subscribe");
                return Err(err);
            }
            tracing::info!(topic = %topic, qos = ?config.qos, "subscribed");
        }

        Ok((connection, handle))
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Resolves once the session has ended, for whatever reason.
    pub async fn wait_for_disconnect(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx
            .wait_for(|state| *state == ConnectionState::Disconnected)
            .await;
    }

    /// Queues `payload` for the broker without waiting on the network.
    ///
    /// Fails with `NotConnected` before touching the client when the session
    /// is down. `Ok` only means the request was queued locally.
    pub fn publish(
        &self,
        topic: &str,
        payload: impl Into<Vec<u8>>,
        qos: Option<QoS>,
    ) -> Result<(), PublishError> {
        if !self.is_connected() {
            self.stats
                .record_publish_rejected(format!("publish to {topic} while disconnected"));
            return Err(PublishError::NotConnected);
        }
        let qos = qos.unwrap_or(self.default_qos);
        if let Err(err) = self.client.try_publish(topic, qos, false, payload) {
            self.stats.record_publish_rejected(err.to_string());
            return Err(err.into());
        }
        self.stats.record_published();
        Ok(())
    }

    pub fn disconnect(&self) -> Result<(), ClientError> {
        let previous = self.mark_disconnected();
        if previous == ConnectionState::Disconnected {
            return Ok(());
        }
        tracing::info!("disconnecting from MQTT broker");
        self.client.try_disconnect()
    }

    fn mark_disconnected(&self) -> ConnectionState {
        self.stats.set_mqtt_connected(false);
        self.state.send_replace(ConnectionState::Disconnected)
    }

    #[cfg(test)]
    pub(crate) fn detached(stats: Arc<IngestStats>, state: ConnectionState) -> Self {
        let options = MqttOptions::new("dht-ingest-test", "127.0.0.1", 1883);
        let (client, _eventloop) = AsyncClient::new(options, 1);
        let (state, _) = watch::channel(state);
        Self {
            client,
            state: Arc::new(state),
            default_qos: QoS::AtLeastOnce,
            stats,
        }
    }
}

async fn await_connack(eventloop: &mut EventLoop) -> Result<(), ConnectError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    return Ok(());
                }
                return Err(ConnectError::Refused(ack.code));
            }
            Ok(_) => {}
            // rumqttc reports a non-success CONNACK as an error from poll().
            Err(ConnectionError::ConnectionRefused(code)) => {
                return Err(ConnectError::Refused(code));
            }
            Err(err) => return Err(err.into()),
        }
    }
}

async fn run_delivery(
    mut eventloop: EventLoop,
    ingester: MessageIngester,
    state: Arc<watch::Sender<ConnectionState>>,
) {
    let stats = ingester.stats();
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::Publish(publish))) => {
                dispatch(&ingester, &publish.topic, &publish.payload);
            }
            Ok(Event::Incoming(Incoming::SubAck(ack))) => log_suback(&ack, &stats),
            Ok(Event::Incoming(Incoming::Disconnect)) => {
                tracing::warn!("broker closed the MQTT session");
                break;
            }
            // Polling past our own DISCONNECT would make rumqttc reconnect.
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                tracing::info!("MQTT session closed");
                break;
            }
            Ok(_) => {}
            Err(err) => {
                if *state.borrow() == ConnectionState::Disconnected {
                    tracing::info!("MQTT session closed");
                } else {
                    stats.record_error(err.to_string());
                    tracing::warn!(error = %err, "MQTT connection dropped; not reconnecting");
                }
                break;
            }
        }
    }
    stats.set_mqtt_connected(false);
    state.send_replace(ConnectionState::Disconnected);
}

fn dispatch(ingester: &MessageIngester, topic: &str, payload: &[u8]) {
    if let Err(err) = ingester.ingest(topic, payload) {
        tracing::warn!(error = %err, topic, "dropped sensor update");
    }
}

fn log_suback(ack: &SubAck, stats: &IngestStats) {
    for code in &ack.return_codes {
        match code {
            SubscribeReasonCode::Success(qos) => {
                tracing::info!(pkid = ack.pkid, granted_qos = ?qos, "subscription confirmed");
            }
            SubscribeReasonCode::Failure => {
                stats.record_error(format!("subscription {} rejected by broker", ack.pkid));
                tracing::warn!(pkid = ack.pkid, "subscription rejected by broker");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::HistoryStore;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    const CONNACK_ACCEPTED: u8 = 0x00;
    const CONNACK_NOT_AUTHORIZED: u8 = 0x05;
    const SUBACK_QOS1: u8 = 0x01;
    const SUBACK_FAILURE: u8 = 0x80;

    fn ingester() -> MessageIngester {
        MessageIngester::new(
            Arc::new(HistoryStore::with_capacity(3)),
            Arc::new(IngestStats::new()),
        )
    }

    fn local_config(port: u16, topic: &str) -> BrokerConfig {
        BrokerConfig {
            host: "127.0.0.1".to_string(),
            port,
            keepalive: Duration::from_secs(30),
            username: None,
            password: None,
            client_id: "dht-ingest-test".to_string(),
            topics: vec![topic.to_string()],
            qos: QoS::AtLeastOnce,
        }
    }

    async fn read_packet(stream: &mut TcpStream) -> (u8, Vec<u8>) {
        let header = stream.read_u8().await.expect("fixed header");
        let mut remaining = 0usize;
        let mut shift = 0;
        loop {
            let byte = stream.read_u8().await.expect("remaining length");
            remaining |= usize::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        let mut body = vec![0; remaining];
        stream.read_exact(&mut body).await.expect("packet body");
        (header, body)
    }

    async fn accept_session(listener: &TcpListener, return_code: u8) -> TcpStream {
        let (mut stream, _) = listener.accept().await.expect("accept");
        let (header, _) = read_packet(&mut stream).await;
        assert_eq!(header, 0x10, "expected CONNECT");
        stream
            .write_all(&[0x20, 0x02, 0x00, return_code])
            .await
            .expect("write connack");
        stream
    }

    async fn answer_subscribe(stream: &mut TcpStream, return_code: u8) {
        let (header, body) = read_packet(stream).await;
        assert_eq!(header, 0x82, "expected SUBSCRIBE");
        stream
            .write_all(&[0x90, 0x03, body[0], body[1], return_code])
            .await
            .expect("write suback");
    }

    fn publish_packet(topic: &str, payload: &[u8]) -> Vec<u8> {
        let remaining = 2 + topic.len() + payload.len();
        let mut packet = vec![0x30, u8::try_from(remaining).expect("short packet")];
        packet.extend_from_slice(&(topic.len() as u16).to_be_bytes());
        packet.extend_from_slice(topic.as_bytes());
        packet.extend_from_slice(payload);
        packet
    }

    async fn eventually(mut done: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !done() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition reached");
    }

    #[test]
    fn publish_fails_fast_when_disconnected() {
        let stats = Arc::new(IngestStats::new());
        let connection = BrokerConnection::detached(stats.clone(), ConnectionState::Disconnected);
        let err = connection.publish("x/y", "z", None).unwrap_err();
        assert!(matches!(err, PublishError::NotConnected));
        assert_eq!(stats.snapshot().publish_rejected, 1);
        assert_eq!(stats.snapshot().messages_published, 0);
    }

    #[test]
    fn publish_is_rejected_while_connecting() {
        let stats = Arc::new(IngestStats::new());
        let connection = BrokerConnection::detached(stats, ConnectionState::Connecting);
        assert!(matches!(
            connection.publish("x/y", "z", Some(QoS::AtMostOnce)),
            Err(PublishError::NotConnected)
        ));
    }

    #[test]
    fn disconnect_moves_to_disconnected() {
        let stats = Arc::new(IngestStats::new());
        stats.set_mqtt_connected(true);
        let connection = BrokerConnection::detached(stats.clone(), ConnectionState::Connected);
        assert!(connection.is_connected());

        // The event loop was dropped, so queuing the DISCONNECT itself fails.
        let _ = connection.disconnect();
        assert_eq!(connection.state(), ConnectionState::Disconnected);
        assert!(!stats.snapshot().mqtt_connected);
        assert!(connection.disconnect().is_ok());
    }

    #[tokio::test]
    async fn wait_for_disconnect_returns_when_already_down() {
        let connection =
            BrokerConnection::detached(Arc::new(IngestStats::new()), ConnectionState::Disconnected);
        tokio::time::timeout(Duration::from_secs(1), connection.wait_for_disconnect())
            .await
            .expect("already disconnected");
    }

    #[tokio::test]
    async fn start_against_refused_port_returns_error() {
        let config = local_config(1, "weresick/dht11");
        let ingester = ingester();
        let stats = ingester.stats();
        let result = tokio::time::timeout(
            Duration::from_secs(15),
            BrokerConnection::start(&config, ingester),
        )
        .await
        .expect("connect attempt finishes");
        assert!(matches!(result, Err(ConnectError::Connection(_))));
        assert!(!stats.snapshot().mqtt_connected);
        assert!(stats.snapshot().last_error.is_some());
    }

    #[test]
    fn dispatch_swallows_ingest_errors() {
        let ingester = ingester();
        dispatch(&ingester, "weresick/dht11", br#"{"temperature": [1]}"#);
        dispatch(&ingester, "weresick/dht11", br#"{"temperature": 2, "humidity": 3}"#);
        let store = ingester.store();
        assert_eq!(store.sensor_len(), 1);
        assert_eq!(store.message_len(), 2);
    }

    #[tokio::test]
    async fn session_delivers_publishes_until_broker_drops() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("local addr").port();
        let broker = tokio::spawn(async move {
            let mut stream = accept_session(&listener, CONNACK_ACCEPTED).await;
            answer_subscribe(&mut stream, SUBACK_QOS1).await;
            stream
                .write_all(&publish_packet("a/b", br#"{"temperature":5}"#))
                .await
                .expect("write publish");
            stream
        });

        let ingester = ingester();
        let store = ingester.store();
        let stats = ingester.stats();
        let (connection, delivery) = tokio::time::timeout(
            Duration::from_secs(5),
            BrokerConnection::start(&local_config(port, "a/b"), ingester),
        )
        .await
        .expect("connect attempt finishes")
        .expect("broker accepts");
        assert_eq!(connection.state(), ConnectionState::Connected);
        assert!(stats.snapshot().mqtt_connected);

        eventually(|| store.message_len() == 1).await;
        let series = store.snapshot();
        assert_eq!(series.temperature, vec![5.0]);
        assert_eq!(series.humidity, vec![0.0]);
        assert_eq!(store.recent_messages(None)[0].topic, "a/b");
        assert!(connection.publish("a/b", "on", Some(QoS::AtMostOnce)).is_ok());
        assert_eq!(stats.snapshot().messages_published, 1);

        drop(broker.await.expect("broker task"));
        tokio::time::timeout(Duration::from_secs(5), connection.wait_for_disconnect())
            .await
            .expect("session ends after broker drop");
        tokio::time::timeout(Duration::from_secs(5), delivery)
            .await
            .expect("delivery task stops")
            .expect("delivery task did not panic");

        assert_eq!(connection.state(), ConnectionState::Disconnected);
        assert!(!stats.snapshot().mqtt_connected);
        assert!(stats.snapshot().last_error.is_some());
        assert!(matches!(
            connection.publish("a/b", "on", None),
            Err(PublishError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn rejected_subscription_is_recorded() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("local addr").port();
        let broker = tokio::spawn(async move {
            let mut stream = accept_session(&listener, CONNACK_ACCEPTED).await;
            answer_subscribe(&mut stream, SUBACK_FAILURE).await;
            stream
        });

        let ingester = ingester();
        let stats = ingester.stats();
        let (connection, delivery) = tokio::time::timeout(
            Duration::from_secs(5),
            BrokerConnection::start(&local_config(port, "weresick/led"), ingester),
        )
        .await
        .expect("connect attempt finishes")
        .expect("broker accepts");

        eventually(|| stats.snapshot().last_error.is_some()).await;
        let last_error = stats.snapshot().last_error.unwrap_or_default();
        assert!(last_error.contains("rejected"), "{last_error}");
        assert!(connection.is_connected());

        connection.disconnect().expect("disconnect queued");
        tokio::time::timeout(Duration::from_secs(5), delivery)
            .await
            .expect("delivery task stops")
            .expect("delivery task did not panic");
        assert_eq!(connection.state(), ConnectionState::Disconnected);
        drop(broker.await.expect("broker task"));
    }

    #[tokio::test]
    async fn unauthorized_connack_is_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("local addr").port();
        let broker =
            tokio::spawn(async move { accept_session(&listener, CONNACK_NOT_AUTHORIZED).await });

        let ingester = ingester();
        let stats = ingester.stats();
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            BrokerConnection::start(&local_config(port, "weresick/dht11"), ingester),
        )
        .await
        .expect("connect attempt finishes");

        assert!(matches!(
            result,
            Err(ConnectError::Refused(ConnectReturnCode::NotAuthorized))
        ));
        assert!(!stats.snapshot().mqtt_connected);
        assert!(stats.snapshot().last_error.is_some());
        drop(broker.await.expect("broker task"));
    }
}
