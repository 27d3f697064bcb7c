//! Transport layer between the gateway and the cloud broker
//!
//! This module provides the transport abstraction used by the connection
//! supervisor and the IoT Hub implementation of it.

use serde_json::Value;
use std::sync::Arc;

pub mod iothub;

pub use iothub::{ConnectCode, ConnectionState, SessionClient, SessionError};

/// Notification emitted by a broker session
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Broker acknowledged the session
    Connected,
    /// Broker refused the session
    ConnectFailed(ConnectCode),
    /// An established session ended
    Disconnected { reason: String },
}

impl SessionEvent {
    /// Numeric result code in the broker's connect-acknowledgement convention
    pub fn result_code(&self) -> Option<u8> {
        match self {
            SessionEvent::Connected => Some(0),
            SessionEvent::ConnectFailed(code) => Some(code.code()),
            SessionEvent::Disconnected { .. } => None,
        }
    }
}

/// Callback invoked with connect results (success or refusal)
pub type ConnectCallback = Arc<dyn Fn(&SessionEvent) + Send + Sync>;

/// Callback invoked when an established session ends
pub type DisconnectCallback = Arc<dyn Fn(&SessionEvent) + Send + Sync>;

/// Notification hooks supplied by the owner of a session
#[derive(Clone, Default)]
pub struct SessionCallbacks {
    pub on_connect: Option<ConnectCallback>,
    pub on_disconnect: Option<DisconnectCallback>,
}

impl SessionCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_connect(mut self, callback: impl Fn(&SessionEvent) + Send + Sync + 'static) -> Self {
        self.on_connect = Some(Arc::new(callback));
        self
    }

    pub fn on_disconnect(
        mut self,
        callback: impl Fn(&SessionEvent) + Send + Sync + 'static,
    ) -> Self {
        self.on_disconnect = Some(Arc::new(callback));
        self
    }

    /// Run `self` first, then `next`, for both hooks
    pub fn chain(self, next: SessionCallbacks) -> Self {
        Self {
            on_connect: chain_hook(self.on_connect, next.on_connect),
            on_disconnect: chain_hook(self.on_disconnect, next.on_disconnect),
        }
    }
}

impl std::fmt::Debug for SessionCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCallbacks")
            .field("on_connect", &self.on_connect.is_some())
            .field("on_disconnect", &self.on_disconnect.is_some())
            .finish()
    }
}

fn chain_hook(
    first: Option<Arc<dyn Fn(&SessionEvent) + Send + Sync>>,
    second: Option<Arc<dyn Fn(&SessionEvent) + Send + Sync>>,
) -> Option<Arc<dyn Fn(&SessionEvent) + Send + Sync>> {
    match (first, second) {
        (Some(first), Some(second)) => Some(Arc::new(move |event: &SessionEvent| {
            first(event);
            second(event);
        })),
        (first, None) => first,
        (None, second) => second,
    }
}

/// Outcome of handing a message to the MQTT client
#[derive(Debug, Clone, PartialEq)]
pub enum PublishOutcome {
    /// Accepted into the outgoing request queue
    Queued,
    /// The client refused the request (queue full or event loop gone)
    Rejected(String),
}

/// Handle describing one publish call
#[derive(Debug, Clone, PartialEq)]
pub struct PublishInfo {
    pub topic: String,
    pub qos: u8,
    pub payload_len: usize,
    pub outcome: PublishOutcome,
}

impl PublishInfo {
    pub fn is_queued(&self) -> bool {
        matches!(self.outcome, PublishOutcome::Queued)
    }
}

/// Transport trait for the gateway's broker session
///
/// Abstracts the broker connection so the supervisor can be driven by the
/// IoT Hub session in production and by a mock in tests.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Start connecting; returns immediately, the result arrives through callbacks
    async fn connect(&self, callback: Option<ConnectCallback>);

    /// Tear down the session and stop network processing
    async fn disconnect(&self) -> Result<(), Self::Error>;

    /// Check if the broker has acknowledged the session
    fn is_connected(&self) -> bool;

    /// Check if a connect attempt or live session is being processed
    fn connection_in_progress(&self) -> bool;

    /// Send the gateway's own telemetry
    fn send_telemetry(&self, telemetry: Value, qos: Option<u8>) -> Result<PublishInfo, Self::Error>;

    /// Send the gateway's own attributes
    fn send_attributes(&self, attributes: Value, qos: Option<u8>)
        -> Result<PublishInfo, Self::Error>;

    /// Send telemetry on behalf of a sub-device
    fn gw_send_telemetry(
        &self,
        device: &str,
        telemetry: Value,
        qos: Option<u8>,
    ) -> Result<PublishInfo, Self::Error>;

    /// Send attributes on behalf of a sub-device
    fn gw_send_attributes(
        &self,
        device: &str,
        attributes: Value,
        qos: Option<u8>,
    ) -> Result<PublishInfo, Self::Error>;
}

/// Type alias for the IoT Hub transport
pub type IotHubTransport = iothub::SessionClient;
