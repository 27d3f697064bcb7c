//! Impure I/O operations for the IoT Hub session
//!
//! This module owns the `rumqttc` client handle and event loop, runs the
//! network task that drives the event loop, and exposes the gateway's publish
//! operations.

use super::connection::{
    configure_mqtt_options, qos_from_level, session_settings_from_config, ConnectCode,
    ConnectionState, SessionError, SessionIdentity, SessionOptions,
};
use super::event_handler::{EventHandler, EventRoute};
use crate::config::{ConfigError, ConnectorConfig};
use crate::protocol::{device_to_cloud_topic, Envelope, TWIN_RESULT_TOPIC};
use crate::transport::{
    ConnectCallback, PublishInfo, PublishOutcome, SessionCallbacks, SessionEvent, Transport,
};
use async_trait::async_trait;
use rumqttc::{AsyncClient, EventLoop, MqttOptions, QoS};
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

/// Delay before the per-connect callback runs, letting the twin subscription go out first
const CONNECT_CALLBACK_DELAY: Duration = Duration::from_millis(50);

/// How long a graceful disconnect may take before the network task is aborted
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// How long the network task keeps polling to flush our DISCONNECT packet
const DISCONNECT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// State shared between the session handle and its network task
struct SessionShared {
    device_id: String,
    client: AsyncClient,
    state_tx: watch::Sender<ConnectionState>,
    callbacks: SessionCallbacks,
    connect_callback: Mutex<Option<ConnectCallback>>,
    /// Identifies the most recently spawned network task
    generation: AtomicU64,
    running: AtomicBool,
}

struct NetworkTask {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

/// MQTT session with Azure IoT Hub for one device identity
pub struct SessionClient {
    identity: SessionIdentity,
    options: SessionOptions,
    topic_d2c: String,
    shared: Arc<SessionShared>,
    event_loop: Arc<Mutex<EventLoop>>,
    network: Mutex<Option<NetworkTask>>,
}

impl SessionClient {
    /// Create a session; no network activity happens until [`SessionClient::connect`]
    pub fn new(identity: SessionIdentity, options: SessionOptions, callbacks: SessionCallbacks) -> Self {
        let mqtt_options = configure_mqtt_options(&identity, &options);
        Self::with_mqtt_options(identity, options, mqtt_options, callbacks)
    }

    pub(crate) fn with_mqtt_options(
        identity: SessionIdentity,
        options: SessionOptions,
        mqtt_options: MqttOptions,
        callbacks: SessionCallbacks,
    ) -> Self {
        let (client, event_loop) = AsyncClient::new(mqtt_options, options.request_capacity);
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);

        let shared = Arc::new(SessionShared {
            device_id: identity.device_id.clone(),
            client,
            state_tx,
            callbacks,
            connect_callback: Mutex::new(None),
            generation: AtomicU64::new(0),
            running: AtomicBool::new(false),
        });

        SessionClient {
            topic_d2c: device_to_cloud_topic(&identity.device_id),
            identity,
            options,
            shared,
            event_loop: Arc::new(Mutex::new(event_loop)),
            network: Mutex::new(None),
        }
    }

    /// Create a session from loaded configuration
    pub fn from_config(
        config: &ConnectorConfig,
        callbacks: SessionCallbacks,
    ) -> Result<Self, ConfigError> {
        let (identity, options) = session_settings_from_config(config)?;
        Ok(Self::new(identity, options, callbacks))
    }

    pub fn device_id(&self) -> &str {
        &self.identity.device_id
    }

    pub fn host(&self) -> &str {
        &self.identity.host
    }

    /// Device-to-cloud topic all envelopes are published to
    pub fn telemetry_topic(&self) -> &str {
        &self.topic_d2c
    }

    /// Current connection state
    pub fn connection_state(&self) -> ConnectionState {
        self.shared.state_tx.borrow().clone()
    }

    /// Watch connection state changes
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Start connecting to IoT Hub.
    ///
    /// Spawns the network task and returns immediately. The optional callback is
    /// remembered and invoked after every connect acknowledgement, before the
    /// callbacks supplied at construction. Failures are logged, never returned.
    pub async fn connect(&self, callback: Option<ConnectCallback>) {
        *self.shared.connect_callback.lock().await = callback;

        let mut network = self.network.lock().await;
        if let Some(task) = network.as_ref() {
            if !task.handle.is_finished() {
                debug!(
                    device_id = %self.identity.device_id,
                    "Network loop already running, connect request ignored"
                );
                return;
            }
        }

        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        self.shared.running.store(true, Ordering::SeqCst);
        self.shared.state_tx.send_replace(ConnectionState::Connecting);

        debug!(
            host = %self.identity.host,
            port = self.options.port,
            generation,
            "Connecting to IoT Hub"
        );

        let span = crate::session_span!(device_id = %self.identity.device_id, generation);
        let handle = tokio::spawn(
            run_network_loop(
                self.shared.clone(),
                self.event_loop.clone(),
                shutdown_rx,
                generation,
            )
            .instrument(span),
        );

        *network = Some(NetworkTask {
            handle,
            shutdown_tx,
        });
    }

    /// Disconnect from IoT Hub and stop the network task
    pub async fn disconnect(&self) -> Result<(), SessionError> {
        debug!("Disconnecting from IoT Hub");

        // A queued DISCONNECT would otherwise end the next session right after CONNACK
        if self.is_connected() {
            if let Err(e) = self.shared.client.try_disconnect() {
                debug!("Disconnect request not queued: {}", e);
            }
        }

        let task = self.network.lock().await.take();
        if let Some(mut task) = task {
            let _ = task.shutdown_tx.send(true);

            match tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut task.handle).await {
                Ok(Ok(())) => debug!("Network task shut down gracefully"),
                Ok(Err(e)) if !e.is_cancelled() => {
                    warn!("Network task ended with error: {}", e);
                }
                Err(_) => {
                    warn!("Network task didn't shut down gracefully, aborting");
                    task.handle.abort();
                }
                _ => {}
            }
        }

        self.shared.running.store(false, Ordering::SeqCst);
        self.shared
            .state_tx
            .send_replace(ConnectionState::Disconnected);
        Ok(())
    }

    /// Check if the broker has acknowledged the session
    pub fn is_connected(&self) -> bool {
        matches!(*self.shared.state_tx.borrow(), ConnectionState::Connected)
    }

    /// Check if a network task is running
    pub fn connection_in_progress(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Serialize `data` and hand it to the MQTT client for `topic`.
    ///
    /// Only QoS 0 and 1 are accepted. The returned handle reports whether the
    /// client queued the message; delivery is up to the client.
    pub fn publish_data<T: Serialize + ?Sized>(
        &self,
        data: &T,
        topic: &str,
        qos: u8,
    ) -> Result<PublishInfo, SessionError> {
        let payload = serde_json::to_string(data).map_err(SessionError::SerializationError)?;

        let mqtt_qos = qos_from_level(qos).map_err(|e| {
            error!("{}", e);
            e
        })?;

        let payload_len = payload.len();
        let outcome = match self.shared.client.try_publish(topic, mqtt_qos, false, payload) {
            Ok(()) => PublishOutcome::Queued,
            Err(e) => {
                warn!(topic = %topic, "Publish rejected by MQTT client: {}", e);
                PublishOutcome::Rejected(e.to_string())
            }
        };

        Ok(PublishInfo {
            topic: topic.to_string(),
            qos,
            payload_len,
            outcome,
        })
    }

    fn resolve_qos(&self, qos: Option<u8>) -> u8 {
        qos.unwrap_or(self.options.default_qos)
    }

    /// Send the gateway's own telemetry; single untimestamped readings become a list
    pub fn send_telemetry(&self, telemetry: Value, qos: Option<u8>) -> Result<PublishInfo, SessionError> {
        let envelope = Envelope::gateway_telemetry(&self.identity.device_id, telemetry);
        self.publish_data(&envelope, &self.topic_d2c, self.resolve_qos(qos))
    }

    /// Send the gateway's own attributes
    pub fn send_attributes(
        &self,
        attributes: Value,
        qos: Option<u8>,
    ) -> Result<PublishInfo, SessionError> {
        let envelope = Envelope::gateway_attributes(&self.identity.device_id, attributes);
        self.publish_data(&envelope, &self.topic_d2c, self.resolve_qos(qos))
    }

    /// Send telemetry on behalf of a sub-device
    pub fn gw_send_telemetry(
        &self,
        device: &str,
        telemetry: Value,
        qos: Option<u8>,
    ) -> Result<PublishInfo, SessionError> {
        let envelope = Envelope::device_telemetry(device, telemetry);
        self.publish_data(&envelope, &self.topic_d2c, qos.unwrap_or(1))
    }

    /// Send attributes on behalf of a sub-device
    pub fn gw_send_attributes(
        &self,
        device: &str,
        attributes: Value,
        qos: Option<u8>,
    ) -> Result<PublishInfo, SessionError> {
        let envelope = Envelope::device_attributes(device, attributes);
        self.publish_data(&envelope, &self.topic_d2c, qos.unwrap_or(1))
    }

    // IoT Hub has no counterpart for the operations below.

    pub fn gw_connect_device(
        &self,
        device_name: &str,
        device_type: &str,
    ) -> Result<PublishInfo, SessionError> {
        error!(
            device_name,
            device_type, "gw_connect_device is not supported by the IoT Hub session"
        );
        Err(SessionError::NotImplemented("gw_connect_device"))
    }

    pub fn gw_disconnect_device(&self, device_name: &str) -> Result<PublishInfo, SessionError> {
        error!(
            device_name,
            "gw_disconnect_device is not supported by the IoT Hub session"
        );
        Err(SessionError::NotImplemented("gw_disconnect_device"))
    }

    pub fn get_subscriptions_in_progress(&self) -> bool {
        error!("get_subscriptions_in_progress is not supported by the IoT Hub session");
        false
    }

    pub fn clean_device_sub_dict(&self) {
        error!("clean_device_sub_dict is not supported by the IoT Hub session");
    }

    pub fn gw_set_server_side_rpc_request_handler<F>(&self, _handler: F)
    where
        F: Fn(&str, Value) + Send + Sync + 'static,
    {
        error!("gw_set_server_side_rpc_request_handler is not supported by the IoT Hub session");
    }

    pub fn set_server_side_rpc_request_handler<F>(&self, _handler: F)
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        error!("set_server_side_rpc_request_handler is not supported by the IoT Hub session");
    }

    pub fn gw_subscribe_to_all_attributes<F>(&self, _callback: F)
    where
        F: Fn(&str, Value) + Send + Sync + 'static,
    {
        error!("gw_subscribe_to_all_attributes is not supported by the IoT Hub session");
    }

    pub fn subscribe_to_all_attributes<F>(&self, _callback: F)
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        error!("subscribe_to_all_attributes is not supported by the IoT Hub session");
    }

    pub fn request_attributes<F>(
        &self,
        _client_keys: &[String],
        _shared_keys: &[String],
        _callback: Option<F>,
    ) where
        F: Fn(Value) + Send + Sync + 'static,
    {
        error!("request_attributes is not supported by the IoT Hub session");
    }
}

impl SessionShared {
    fn is_stale(&self, generation: u64) -> bool {
        generation != self.generation.load(Ordering::SeqCst)
    }

    fn is_connected(&self) -> bool {
        matches!(*self.state_tx.borrow(), ConnectionState::Connected)
    }

    /// Handle the broker's answer to our CONNECT
    async fn handle_connect(&self, generation: u64, code: ConnectCode) {
        if self.is_stale(generation) {
            info!(generation, "Ignoring connect result from superseded network task");
            return;
        }

        let event = if code.is_success() {
            self.state_tx.send_replace(ConnectionState::Connected);
            if let Err(e) = self.client.try_subscribe(TWIN_RESULT_TOPIC, QoS::AtMostOnce) {
                warn!("Failed to subscribe to {}: {}", TWIN_RESULT_TOPIC, e);
            }
            info!(device_id = %self.device_id, "connection SUCCESS");
            SessionEvent::Connected
        } else {
            self.state_tx.send_replace(ConnectionState::Refused(code));
            match code.reason() {
                Some(reason) => error!("connection FAIL with error {} {}", code.code(), reason),
                None => error!("connection FAIL with unknown error {}", code.code()),
            }
            SessionEvent::ConnectFailed(code)
        };

        let connect_callback = self.connect_callback.lock().await.clone();
        if let Some(callback) = connect_callback {
            tokio::time::sleep(CONNECT_CALLBACK_DELAY).await;
            callback(&event);
        }

        if let Some(callback) = &self.callbacks.on_connect {
            callback(&event);
        }
    }

    /// Handle the end of an established session
    fn handle_disconnect(&self, generation: u64, reason: &str) {
        if self.is_stale(generation) {
            info!(
                generation,
                "Disconnect from superseded network task, current session unaffected"
            );
            return;
        }

        self.state_tx.send_replace(ConnectionState::Disconnected);

        let event = SessionEvent::Disconnected {
            reason: reason.to_string(),
        };
        if let Some(callback) = &self.callbacks.on_disconnect {
            callback(&event);
        }

        debug!(device_id = %self.device_id, reason, "Disconnected from IoT Hub");
    }
}

/// Drive the event loop until the session ends or shutdown is requested
async fn run_network_loop(
    shared: Arc<SessionShared>,
    event_loop: Arc<Mutex<EventLoop>>,
    mut shutdown_rx: watch::Receiver<bool>,
    generation: u64,
) {
    let mut event_loop = event_loop.lock().await;

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    if shared.is_connected() {
                        drain_disconnect(&mut event_loop).await;
                        shared.handle_disconnect(generation, "client requested disconnect");
                    }
                    break;
                }
            }

            result = event_loop.poll() => {
                let route = EventHandler::route_poll_result(&result);
                let ends_session = route.ends_session();
                process_route(&shared, generation, route).await;
                if ends_session {
                    break;
                }
            }
        }
    }

    // poll() only drops the socket after an error; the next connect must dial a fresh one
    event_loop.clean();

    if !shared.is_stale(generation) {
        shared.running.store(false, Ordering::SeqCst);
    }
    debug!("Network loop stopped");
}

/// Act on one routed event
async fn process_route(shared: &SessionShared, generation: u64, route: EventRoute) {
    match route {
        EventRoute::ConnectionAcknowledged => {
            shared.handle_connect(generation, ConnectCode::Accepted).await;
        }
        EventRoute::ConnectionRefused(code) => {
            shared.handle_connect(generation, code).await;
        }
        EventRoute::MessageReceived { topic, payload } => {
            info!(
                topic = %topic,
                payload = %String::from_utf8_lossy(&payload),
                "Message received from IoT Hub"
            );
        }
        EventRoute::SubscriptionConfirmed { packet_id } => {
            debug!(packet_id, "Subscription confirmed");
        }
        EventRoute::BrokerDisconnected => {
            shared.handle_disconnect(generation, "broker closed the session");
        }
        EventRoute::LocalDisconnectSent => {
            shared.handle_disconnect(generation, "client requested disconnect");
        }
        EventRoute::NetworkError(reason) => {
            if shared.is_connected() {
                shared.handle_disconnect(generation, &reason);
            } else {
                error!("Failed to connect to IoT Hub: {}", reason);
                if !shared.is_stale(generation) {
                    shared.state_tx.send_replace(ConnectionState::Disconnected);
                }
            }
        }
        EventRoute::InfrastructureEvent(event) => {
            tracing::trace!(target: "iothub_transport", "MQTT event: {}", event);
        }
        EventRoute::OutgoingEvent => {}
    }
}

/// Keep polling briefly so a queued DISCONNECT reaches the broker
async fn drain_disconnect(event_loop: &mut EventLoop) {
    let drained = tokio::time::timeout(DISCONNECT_DRAIN_TIMEOUT, async {
        loop {
            match event_loop.poll().await {
                Ok(event) => {
                    if EventHandler::route_event(&event) == EventRoute::LocalDisconnectSent {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    })
    .await;

    if drained.is_err() {
        debug!("DISCONNECT not flushed before timeout");
    }
}

#[async_trait]
impl Transport for SessionClient {
    type Error = SessionError;

    async fn connect(&self, callback: Option<ConnectCallback>) {
        SessionClient::connect(self, callback).await
    }

    async fn disconnect(&self) -> Result<(), Self::Error> {
        SessionClient::disconnect(self).await
    }

    fn is_connected(&self) -> bool {
        SessionClient::is_connected(self)
    }

    fn connection_in_progress(&self) -> bool {
        SessionClient::connection_in_progress(self)
    }

    fn send_telemetry(&self, telemetry: Value, qos: Option<u8>) -> Result<PublishInfo, Self::Error> {
        SessionClient::send_telemetry(self, telemetry, qos)
    }

    fn send_attributes(
        &self,
        attributes: Value,
        qos: Option<u8>,
    ) -> Result<PublishInfo, Self::Error> {
        SessionClient::send_attributes(self, attributes, qos)
    }

    fn gw_send_telemetry(
        &self,
        device: &str,
        telemetry: Value,
        qos: Option<u8>,
    ) -> Result<PublishInfo, Self::Error> {
        SessionClient::gw_send_telemetry(self, device, telemetry, qos)
    }

    fn gw_send_attributes(
        &self,
        device: &str,
        attributes: Value,
        qos: Option<u8>,
    ) -> Result<PublishInfo, Self::Error> {
        SessionClient::gw_send_attributes(self, device, attributes, qos)
    }
}

impl Drop for SessionClient {
    fn drop(&mut self) {
        // Drop can't await a graceful disconnect; just stop the network task
        if let Some(task) = self.network.get_mut().take() {
            let _ = task.shutdown_tx.send(true);
            task.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn test_session() -> (SessionClient, NamedTempFile) {
        let mut ca = NamedTempFile::new().unwrap();
        writeln!(ca, "-----BEGIN CERTIFICATE-----").unwrap();

        let identity = SessionIdentity::new("127.0.0.1", "gw-1", "SharedAccessSignature sig=abc");
        let mut options = SessionOptions::new(ca.path());
        options.port = 1;

        (
            SessionClient::new(identity, options, SessionCallbacks::new()),
            ca,
        )
    }

    #[test]
    fn test_new_session_is_disconnected() {
        let (session, _ca) = test_session();
        assert_eq!(session.connection_state(), ConnectionState::Disconnected);
        assert!(!session.is_connected());
        assert!(!session.connection_in_progress());
        assert_eq!(session.telemetry_topic(), "devices/gw-1/messages/events/");
    }

    #[test]
    fn test_publish_before_connect_is_queued() {
        let (session, _ca) = test_session();

        let info = session.send_telemetry(json!({"temp": 20}), None).unwrap();

        assert!(info.is_queued());
        assert_eq!(info.topic, "devices/gw-1/messages/events/");
        assert_eq!(info.qos, 1);
        assert!(info.payload_len > 0);
    }

    #[test]
    fn test_publish_data_rejects_bad_qos() {
        let (session, _ca) = test_session();

        for qos in [2u8, 3, 255] {
            let result = session.publish_data(&json!({"a": 1}), "devices/gw-1/messages/events/", qos);
            assert!(matches!(result, Err(SessionError::InvalidQos(q)) if q == qos));
        }
    }

    #[test]
    fn test_explicit_qos_zero() {
        let (session, _ca) = test_session();
        let info = session.send_attributes(json!({"fw": "1.0"}), Some(0)).unwrap();
        assert_eq!(info.qos, 0);
    }

    #[test]
    fn test_gateway_sends_default_to_qos_one() {
        let (session, _ca) = test_session();
        let info = session.gw_send_telemetry("dev1", json!({"t": 1}), None).unwrap();
        assert_eq!(info.qos, 1);
        let info = session.gw_send_attributes("dev1", json!({"a": 1}), None).unwrap();
        assert_eq!(info.qos, 1);
    }

    #[test]
    fn test_unsupported_device_operations() {
        let (session, _ca) = test_session();

        assert!(matches!(
            session.gw_connect_device("dev1", "sensor"),
            Err(SessionError::NotImplemented("gw_connect_device"))
        ));
        assert!(matches!(
            session.gw_disconnect_device("dev1"),
            Err(SessionError::NotImplemented("gw_disconnect_device"))
        ));
        assert!(!session.get_subscriptions_in_progress());
    }

    #[tokio::test]
    async fn test_connect_to_unreachable_host_is_not_an_error() {
        let (session, _ca) = test_session();

        session.connect(None).await;
        assert!(session.connection_in_progress());

        let settled = tokio::time::timeout(Duration::from_secs(5), async {
            while session.connection_in_progress() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;

        assert!(settled.is_ok(), "network task should give up on a closed port");
        assert!(!session.is_connected());
    }

    #[tokio::test]
    async fn test_disconnect_without_connect() {
        let (session, _ca) = test_session();
        assert!(session.disconnect().await.is_ok());
        assert_eq!(session.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_stale_generation_events_are_ignored() {
        let (session, _ca) = test_session();
        session.shared.generation.store(3, Ordering::SeqCst);

        session.shared.handle_connect(2, ConnectCode::Accepted).await;
        assert!(!session.is_connected());

        session.shared.handle_connect(3, ConnectCode::Accepted).await;
        assert!(session.is_connected());

        session.shared.handle_disconnect(2, "old socket closed");
        assert!(session.is_connected());

        session.shared.handle_disconnect(3, "broker closed the session");
        assert!(!session.is_connected());
    }

    #[tokio::test]
    async fn test_connect_callbacks_order() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let mut ca = NamedTempFile::new().unwrap();
        writeln!(ca, "-----BEGIN CERTIFICATE-----").unwrap();
        let external = order.clone();
        let session = SessionClient::new(
            SessionIdentity::new("127.0.0.1", "gw-1", "token"),
            SessionOptions::new(ca.path()),
            SessionCallbacks::new().on_connect(move |event| {
                external.lock().unwrap().push(format!("external:{:?}", event.result_code()));
            }),
        );

        let internal = order.clone();
        *session.shared.connect_callback.lock().await = Some(Arc::new(move |event| {
            internal.lock().unwrap().push(format!("internal:{:?}", event.result_code()));
        }));

        session
            .shared
            .handle_connect(0, ConnectCode::BadUserNamePassword)
            .await;

        assert_eq!(
            *order.lock().unwrap(),
            vec!["internal:Some(4)".to_string(), "external:Some(4)".to_string()]
        );
        assert_eq!(
            session.connection_state(),
            ConnectionState::Refused(ConnectCode::BadUserNamePassword)
        );
    }

    fn session_with_capacity(capacity: usize) -> (SessionClient, NamedTempFile) {
        let mut ca = NamedTempFile::new().unwrap();
        writeln!(ca, "-----BEGIN CERTIFICATE-----").unwrap();

        let mut options = SessionOptions::new(ca.path());
        options.request_capacity = capacity;
        let session = SessionClient::new(
            SessionIdentity::new("127.0.0.1", "gw-1", "token"),
            options,
            SessionCallbacks::new(),
        );
        (session, ca)
    }

    #[tokio::test]
    async fn test_accepted_connack_queues_twin_subscription() {
        let (session, _ca) = session_with_capacity(1);

        session.shared.handle_connect(0, ConnectCode::Accepted).await;
        assert!(session.is_connected());

        // The single request slot is taken by the SUBSCRIBE for the twin results
        let info = session.send_telemetry(json!({"t": 1}), None).unwrap();
        assert!(matches!(info.outcome, PublishOutcome::Rejected(_)));
    }

    #[tokio::test]
    async fn test_refused_connack_does_not_subscribe() {
        let (session, _ca) = session_with_capacity(1);

        session
            .shared
            .handle_connect(0, ConnectCode::NotAuthorized)
            .await;
        assert!(!session.is_connected());

        let info = session.send_telemetry(json!({"t": 1}), None).unwrap();
        assert!(info.is_queued());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_callback_runs_after_fixed_delay() {
        let (session, _ca) = session_with_capacity(10);

        let fired_at = Arc::new(std::sync::Mutex::new(None));
        let slot = fired_at.clone();
        *session.shared.connect_callback.lock().await = Some(Arc::new(move |_event| {
            *slot.lock().unwrap() = Some(tokio::time::Instant::now());
        }));

        let started = tokio::time::Instant::now();
        session.shared.handle_connect(0, ConnectCode::Accepted).await;

        let fired = fired_at.lock().unwrap().expect("connect callback should run");
        assert!(fired - started >= CONNECT_CALLBACK_DELAY);
    }

    /// Minimal MQTT 3.1.1 responder: CONNACK, SUBACK and PINGRESP; closes on DISCONNECT
    async fn serve_mqtt(mut stream: tokio::net::TcpStream) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        loop {
            let Ok(header) = stream.read_u8().await else {
                return;
            };

            let mut len = 0usize;
            let mut shift = 0;
            loop {
                let Ok(byte) = stream.read_u8().await else {
                    return;
                };
                len |= ((byte & 0x7f) as usize) << shift;
                if byte & 0x80 == 0 {
                    break;
                }
                shift += 7;
            }

            let mut body = vec![0u8; len];
            if stream.read_exact(&mut body).await.is_err() {
                return;
            }

            let reply = match header >> 4 {
                1 => vec![0x20, 0x02, 0x00, 0x00],
                8 => vec![0x90, 0x03, body[0], body[1], 0x00],
                12 => vec![0xD0, 0x00],
                14 => return,
                _ => continue,
            };
            if stream.write_all(&reply).await.is_err() {
                return;
            }
        }
    }

    async fn spawn_local_broker() -> (u16, Arc<std::sync::atomic::AtomicUsize>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let accepted = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = accepted.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve_mqtt(stream));
            }
        });

        (port, accepted)
    }

    async fn wait_until(check: impl Fn() -> bool) -> bool {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .is_ok()
    }

    #[tokio::test]
    async fn test_reconnect_after_disconnect_dials_new_socket() {
        let (port, accepted) = spawn_local_broker().await;

        let identity = SessionIdentity::new("127.0.0.1", "gw-1", "token");
        let mut options = SessionOptions::new("/nonexistent/iothub_ca.cer");
        options.port = port;
        let mut mqtt_options = configure_mqtt_options(&identity, &options);
        mqtt_options.set_transport(rumqttc::Transport::Tcp);

        let session =
            SessionClient::with_mqtt_options(identity, options, mqtt_options, SessionCallbacks::new());

        for round in 1..=2 {
            session.connect(None).await;
            assert!(
                wait_until(|| session.is_connected()).await,
                "round {round} never connected"
            );

            session.disconnect().await.unwrap();
            assert_eq!(session.connection_state(), ConnectionState::Disconnected);
            assert!(!session.connection_in_progress());
        }

        assert_eq!(accepted.load(Ordering::SeqCst), 2);
    }
}
