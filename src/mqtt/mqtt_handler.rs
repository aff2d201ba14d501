use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ClientError, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions,
    Packet, QoS,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::config::{InboundTopic, MqttConfig, STATUS_PROBE, TOPIC_COMMAND};
use super::message_manager::{MQTTMessage, SessionEvent, TransportEvent};
use super::tls;

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("MQTT client error: {0}")]
    Client(#[from] ClientError),

    #[error("publish timed out after {0:?}")]
    Timeout(Duration),

    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error("failed to read CA certificate {}: {source}", path.display())]
    CaFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid MQTT options: {0}")]
    InvalidOptions(String),

    #[error("transport rejected request: {0}")]
    Rejected(String),
}

/// The client side of an MQTT session.
///
/// Implemented for [`rumqttc::AsyncClient`]; both calls only hand the request
/// to the client's event loop and never wait for a broker acknowledgment.
/// A full request queue is reported as an error instead of waiting, since the
/// session callbacks run on the task that drains that queue.
#[async_trait]
pub trait MqttTransport: Send + Sync {
    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), TransportError>;

    async fn publish(&self, topic: &str, qos: QoS, payload: Vec<u8>)
        -> Result<(), TransportError>;
}

#[async_trait]
impl MqttTransport for AsyncClient {
    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), TransportError> {
        AsyncClient::try_subscribe(self, topic, qos)?;
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        payload: Vec<u8>,
    ) -> Result<(), TransportError> {
        AsyncClient::try_publish(self, topic, qos, false, payload)?;
        Ok(())
    }
}

/// Owns the session state and translates transport callbacks into
/// [`TransportEvent`]s for the bridge core.
pub struct SessionManager {
    transport: Arc<dyn MqttTransport>,
    state_tx: watch::Sender<ConnectionState>,
    events: mpsc::Sender<TransportEvent>,
}

impl SessionManager {
    pub fn new(transport: Arc<dyn MqttTransport>, events: mpsc::Sender<TransportEvent>) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            transport,
            state_tx,
            events,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn mark_connecting(&self) {
        self.state_tx.send_replace(ConnectionState::Connecting);
    }

    /// Waits up to `attempts` intervals for the session to come up, waking
    /// early on every state change.
    pub async fn wait_until_connected(&self, attempts: u32, interval: Duration) -> bool {
        let mut state_rx = self.watch_state();
        for attempt in 0..attempts {
            if *state_rx.borrow_and_update() == ConnectionState::Connected {
                return true;
            }
            trace!("Waiting for MQTT session ({}/{})", attempt + 1, attempts);
            // the sender lives in self, so changed() only returns on updates
            let _ = tokio::time::timeout(interval, state_rx.changed()).await;
        }
        self.is_connected()
    }

    pub async fn on_connect(&self, code: ConnectReturnCode) {
        if code != ConnectReturnCode::Success {
            let previous = self.state_tx.send_replace(ConnectionState::Disconnected);
            if previous == ConnectionState::Disconnected {
                debug!("MQTT broker refused reconnect, return code: {:?}", code);
                return;
            }
            error!("Failed to connect to MQTT broker, return code: {:?}", code);
            self.emit(TransportEvent::Session(SessionEvent::ConnectionRefused(
                format!("{:?}", code),
            )))
            .await;
            return;
        }

        // subscriptions and the probe go out before commands are accepted
        for topic in InboundTopic::ALL {
            match self.transport.subscribe(topic.topic(), QoS::AtLeastOnce).await {
                Ok(()) => info!("Subscribed to {}", topic.topic()),
                Err(e) => warn!("Failed to subscribe to {}: {}", topic.topic(), e),
            }
        }

        if let Err(e) = self.publish(TOPIC_COMMAND, STATUS_PROBE, QoS::AtMostOnce).await {
            warn!("Failed to request initial device status: {}", e);
        }

        info!("Connected to MQTT broker");
        self.state_tx.send_replace(ConnectionState::Connected);
        self.emit(TransportEvent::Session(SessionEvent::Connected))
            .await;
    }

    /// Handles a transport error reported by the event loop. Only the first
    /// error after a state change is forwarded to the bridge core.
    pub async fn on_connection_error(&self, reason: String) {
        let previous = self.state_tx.send_replace(ConnectionState::Disconnected);
        match previous {
            ConnectionState::Connected => {
                warn!("Disconnected from MQTT broker: {}", reason);
                self.emit(TransportEvent::Session(SessionEvent::Disconnected(reason)))
                    .await;
            }
            ConnectionState::Connecting => {
                error!("MQTT connection failed: {}", reason);
                self.emit(TransportEvent::Session(SessionEvent::ConnectFailed(reason)))
                    .await;
            }
            ConnectionState::Disconnected => {
                debug!("MQTT reconnect attempt failed: {}", reason);
            }
        }
    }

    pub async fn on_disconnect(&self) {
        let previous = self.state_tx.send_replace(ConnectionState::Disconnected);
        if previous != ConnectionState::Disconnected {
            warn!("Disconnected from MQTT broker");
            self.emit(TransportEvent::Session(SessionEvent::Disconnected(
                "broker closed the session".to_string(),
            )))
            .await;
        }
    }

    pub async fn on_message(&self, topic: impl Into<String>, payload: impl Into<Vec<u8>>) {
        let message = MQTTMessage::from_topic(topic, payload);
        debug!("Received {}", message);
        self.emit(TransportEvent::Message(message)).await;
    }

    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Vec<u8>>,
        qos: QoS,
    ) -> Result<(), TransportError> {
        self.transport.publish(topic, qos, payload.into()).await
    }

    pub async fn handle_notification(&self, event: Event) {
        match event {
            Event::Incoming(Packet::ConnAck(ack)) => self.on_connect(ack.code).await,
            Event::Incoming(Packet::Publish(publish)) => {
                self.on_message(publish.topic, publish.payload.to_vec())
                    .await
            }
            Event::Incoming(Packet::Disconnect) => self.on_disconnect().await,
            other => trace!("MQTT event: {:?}", other),
        }
    }

    async fn emit(&self, event: TransportEvent) {
        if self.events.send(event).await.is_err() {
            warn!("Bridge core is gone, dropping transport event");
        }
    }
}

pub fn mqtt_options(config: &MqttConfig) -> Result<MqttOptions, TransportError> {
    if config.client_id.is_empty() || config.client_id.starts_with(' ') {
        return Err(TransportError::InvalidOptions(format!(
            "client id {:?} is not usable",
            config.client_id
        )));
    }
    let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
    options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)));
    if let Some(user) = &config.username {
        options.set_credentials(user, config.password.clone().unwrap_or_default());
    }
    options.set_transport(tls::build_transport(&config.tls)?);
    Ok(options)
}

/// Creates the rumqttc client for `config`. The returned event loop has to be
/// driven by [`spawn_event_loop`] before anything reaches the wire.
pub fn connect_client(config: &MqttConfig) -> Result<(AsyncClient, EventLoop), TransportError> {
    let options = mqtt_options(config)?;
    info!(
        "Connecting to MQTT broker {} (TLS: {}, auth: {})",
        config.broker_addr(),
        config.tls.enabled,
        config.username.is_some()
    );
    Ok(AsyncClient::new(options, config.request_capacity.max(10)))
}

/// Drives the rumqttc event loop until `shutdown` fires. rumqttc reconnects on
/// the next poll after an error; `backoff` spaces those attempts out.
pub fn spawn_event_loop(
    mut eventloop: EventLoop,
    manager: Arc<SessionManager>,
    backoff: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        debug!("Starting MQTT event loop");
        loop {
            let notification = tokio::select! {
                _ = shutdown.cancelled() => break,
                notification = eventloop.poll() => notification,
            };

            match notification {
                Ok(event) => manager.handle_notification(event).await,
                Err(ConnectionError::ConnectionRefused(code)) => {
                    manager.on_connect(code).await;
                    if pause(backoff, &shutdown).await {
                        break;
                    }
                }
                Err(e) => {
                    manager.on_connection_error(e.to_string()).await;
                    if pause(backoff, &shutdown).await {
                        break;
                    }
                }
            }
        }
        manager.state_tx.send_replace(ConnectionState::Disconnected);
        info!("MQTT event loop stopped");
    })
}

/// Sleeps for `backoff`; returns true if shutdown was requested meanwhile.
async fn pause(backoff: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => true,
        _ = tokio::time::sleep(backoff) => false,
    }
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingTransport;
    use super::*;
    use crate::mqtt::config::{TlsConfig, TOPIC_STATE};

    fn manager() -> (
        Arc<RecordingTransport>,
        SessionManager,
        mpsc::Receiver<TransportEvent>,
    ) {
        let transport = Arc::new(RecordingTransport::default());
        let (tx, rx) = mpsc::channel(16);
        let manager = SessionManager::new(transport.clone(), tx);
        (transport, manager, rx)
    }

    #[tokio::test]
    async fn successful_connect_subscribes_and_probes() {
        let (transport, manager, mut rx) = manager();
        manager.mark_connecting();

        manager.on_connect(ConnectReturnCode::Success).await;

        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(
            rx.recv().await,
            Some(TransportEvent::Session(SessionEvent::Connected))
        );
        let subscriptions = transport.subscriptions.lock().unwrap().clone();
        assert_eq!(subscriptions.len(), 3);
        assert!(subscriptions
            .iter()
            .all(|(_, qos)| *qos == QoS::AtLeastOnce));
        assert_eq!(
            transport.published_payloads(),
            vec![(TOPIC_COMMAND.to_string(), "status".to_string())]
        );
    }

    #[tokio::test]
    async fn refused_connect_reports_return_code() {
        let (transport, manager, mut rx) = manager();
        manager.mark_connecting();

        manager.on_connect(ConnectReturnCode::NotAuthorized).await;

        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(
            rx.recv().await,
            Some(TransportEvent::Session(SessionEvent::ConnectionRefused(
                "NotAuthorized".to_string()
            )))
        );
        assert!(transport.subscriptions.lock().unwrap().is_empty());
        assert!(transport.published_payloads().is_empty());
    }

    #[tokio::test]
    async fn repeated_refusals_are_reported_once() {
        let (_transport, manager, mut rx) = manager();
        manager.mark_connecting();

        for _ in 0..3 {
            manager.on_connect(ConnectReturnCode::NotAuthorized).await;
        }

        assert_eq!(
            rx.recv().await,
            Some(TransportEvent::Session(SessionEvent::ConnectionRefused(
                "NotAuthorized".to_string()
            )))
        );
        assert!(rx.try_recv().is_err());
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn watchers_see_connected_after_handshake() {
        let (transport, manager, _rx) = manager();
        let mut state_rx = manager.watch_state();
        manager.mark_connecting();
        state_rx.borrow_and_update();

        manager.on_connect(ConnectReturnCode::Success).await;

        assert!(state_rx.has_changed().unwrap());
        assert_eq!(*state_rx.borrow(), ConnectionState::Connected);
        assert_eq!(transport.subscriptions.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn connect_with_full_request_queue_does_not_block() {
        let options = MqttOptions::new("switch-bridge-test", "localhost", 1883);
        // the event loop is never polled, so nothing drains the queue
        let (client, _eventloop) = AsyncClient::new(options, 10);
        for _ in 0..10 {
            client
                .try_publish(TOPIC_COMMAND, QoS::AtMostOnce, false, "on")
                .unwrap();
        }
        let (tx, mut rx) = mpsc::channel(16);
        let manager = SessionManager::new(Arc::new(client), tx);

        let finished = tokio::time::timeout(
            Duration::from_secs(2),
            manager.on_connect(ConnectReturnCode::Success),
        )
        .await;

        assert!(finished.is_ok());
        assert!(manager.is_connected());
        assert_eq!(
            rx.recv().await,
            Some(TransportEvent::Session(SessionEvent::Connected))
        );
        assert!(matches!(
            manager
                .publish(TOPIC_COMMAND, "off", QoS::AtMostOnce)
                .await,
            Err(TransportError::Client(_))
        ));
    }

    #[tokio::test]
    async fn repeated_errors_are_reported_once() {
        let (_transport, manager, mut rx) = manager();
        manager.on_connect(ConnectReturnCode::Success).await;
        assert_eq!(
            rx.recv().await,
            Some(TransportEvent::Session(SessionEvent::Connected))
        );

        manager.on_connection_error("io error".to_string()).await;
        manager.on_connection_error("io error".to_string()).await;
        manager.on_disconnect().await;

        assert_eq!(
            rx.recv().await,
            Some(TransportEvent::Session(SessionEvent::Disconnected(
                "io error".to_string()
            )))
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn first_failure_while_connecting_is_a_connect_failure() {
        let (_transport, manager, mut rx) = manager();
        manager.mark_connecting();

        manager.on_connection_error("tls handshake".to_string()).await;

        assert_eq!(
            rx.recv().await,
            Some(TransportEvent::Session(SessionEvent::ConnectFailed(
                "tls handshake".to_string()
            )))
        );
    }

    #[tokio::test]
    async fn inbound_publish_is_forwarded_in_order() {
        let (_transport, manager, mut rx) = manager();

        manager.on_message(TOPIC_STATE, "ON").await;
        manager.on_message(TOPIC_STATE, "OFF").await;

        for expected in ["ON", "OFF"] {
            match rx.recv().await {
                Some(TransportEvent::Message(msg)) => {
                    assert_eq!(msg.topic, TOPIC_STATE);
                    assert_eq!(msg.payload, expected.as_bytes());
                }
                other => panic!("unexpected event: {:?}", other),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn wait_gives_up_after_bounded_attempts() {
        let (_transport, manager, _rx) = manager();
        manager.mark_connecting();

        let connected = manager
            .wait_until_connected(3, Duration::from_secs(1))
            .await;

        assert!(!connected);
        assert_eq!(manager.state(), ConnectionState::Connecting);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_wakes_up_on_connect() {
        let (_transport, manager, _rx) = manager();
        let manager = Arc::new(manager);
        manager.mark_connecting();
        let connecting = manager.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            connecting.on_connect(ConnectReturnCode::Success).await;
        });
        let started = tokio::time::Instant::now();

        let connected = manager
            .wait_until_connected(3, Duration::from_secs(10))
            .await;

        assert!(connected);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn options_carry_credentials() {
        let config = MqttConfig {
            username: Some("admin".to_string()),
            password: Some("secret".to_string()),
            tls: TlsConfig {
                enabled: false,
                ..TlsConfig::default()
            },
            ..MqttConfig::default()
        };

        let options = mqtt_options(&config).unwrap();

        assert_eq!(
            options.credentials(),
            Some(("admin".to_string(), "secret".to_string()))
        );
        assert_eq!(options.keep_alive(), Duration::from_secs(60));
    }

    #[test]
    fn blank_client_id_is_rejected() {
        let config = MqttConfig {
            client_id: String::new(),
            ..MqttConfig::default()
        };
        assert!(matches!(
            mqtt_options(&config),
            Err(TransportError::InvalidOptions(_))
        ));
    }
}
