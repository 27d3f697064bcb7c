//! Mock session for testing

use crate::protocol::{device_to_cloud_topic, Envelope};
use crate::supervisor::event_channel;
use crate::transport::iothub::connection::qos_from_level;
use crate::transport::{
    ConnectCallback, ConnectCode, PublishInfo, PublishOutcome, SessionCallbacks, SessionError,
    SessionEvent, Transport,
};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// How the mock broker answers a connect attempt
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MockBehavior {
    /// Acknowledge with code 0
    AcceptImmediately,
    /// Acknowledge with code 0 once the delay has passed; `connect` returns after it
    AcceptAfter(Duration),
    /// Refuse with the given code
    Refuse(ConnectCode),
    /// Fail at the network level; no event is emitted
    Unreachable,
}

/// Envelope recorded by the mock, with its topic and QoS
#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    pub topic: String,
    pub qos: u8,
    pub envelope: Envelope,
}

/// Mock broker session
pub struct MockSession {
    device_id: String,
    callbacks: SessionCallbacks,
    behavior: Mutex<MockBehavior>,
    connected: AtomicBool,
    in_progress: AtomicBool,
    connect_calls: AtomicUsize,
    disconnect_calls: AtomicUsize,
    sent: Mutex<Vec<SentMessage>>,
}

impl MockSession {
    pub fn new(device_id: &str, behavior: MockBehavior, callbacks: SessionCallbacks) -> Self {
        Self {
            device_id: device_id.to_string(),
            callbacks,
            behavior: Mutex::new(behavior),
            connected: AtomicBool::new(false),
            in_progress: AtomicBool::new(false),
            connect_calls: AtomicUsize::new(0),
            disconnect_calls: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Mock wired to a supervisor event channel
    pub fn supervised(
        device_id: &str,
        behavior: MockBehavior,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<SessionEvent>) {
        let (callbacks, events) = event_channel();
        (Arc::new(Self::new(device_id, behavior, callbacks)), events)
    }

    pub fn set_behavior(&self, behavior: MockBehavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub fn disconnect_calls(&self) -> usize {
        self.disconnect_calls.load(Ordering::SeqCst)
    }

    pub fn sent_messages(&self) -> Vec<SentMessage> {
        self.sent.lock().unwrap().clone()
    }

    /// Simulate the broker closing an established session
    pub fn drop_connection(&self, reason: &str) {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.in_progress.store(false, Ordering::SeqCst);
            self.notify_disconnect(reason);
        }
    }

    fn notify_connect(&self, callback: Option<ConnectCallback>, event: SessionEvent) {
        if let Some(callback) = callback {
            callback(&event);
        }
        if let Some(callback) = &self.callbacks.on_connect {
            callback(&event);
        }
    }

    fn notify_disconnect(&self, reason: &str) {
        let event = SessionEvent::Disconnected {
            reason: reason.to_string(),
        };
        if let Some(callback) = &self.callbacks.on_disconnect {
            callback(&event);
        }
    }

    fn record(&self, envelope: Envelope, qos: u8) -> Result<PublishInfo, SessionError> {
        qos_from_level(qos)?;

        let payload =
            serde_json::to_string(&envelope).map_err(SessionError::SerializationError)?;
        let topic = device_to_cloud_topic(&self.device_id);

        self.sent.lock().unwrap().push(SentMessage {
            topic: topic.clone(),
            qos,
            envelope,
        });

        Ok(PublishInfo {
            topic,
            qos,
            payload_len: payload.len(),
            outcome: PublishOutcome::Queued,
        })
    }
}

#[async_trait]
impl Transport for MockSession {
    type Error = SessionError;

    async fn connect(&self, callback: Option<ConnectCallback>) {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        if self.in_progress.load(Ordering::SeqCst) {
            return;
        }

        let behavior = *self.behavior.lock().unwrap();
        match behavior {
            MockBehavior::AcceptImmediately => {
                self.in_progress.store(true, Ordering::SeqCst);
                self.connected.store(true, Ordering::SeqCst);
                self.notify_connect(callback, SessionEvent::Connected);
            }
            MockBehavior::AcceptAfter(delay) => {
                self.in_progress.store(true, Ordering::SeqCst);
                tokio::time::sleep(delay).await;
                self.connected.store(true, Ordering::SeqCst);
                self.notify_connect(callback, SessionEvent::Connected);
            }
            MockBehavior::Refuse(code) => {
                self.notify_connect(callback, SessionEvent::ConnectFailed(code));
            }
            MockBehavior::Unreachable => {}
        }
    }

    async fn disconnect(&self) -> Result<(), Self::Error> {
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        self.in_progress.store(false, Ordering::SeqCst);
        if self.connected.swap(false, Ordering::SeqCst) {
            self.notify_disconnect("client requested disconnect");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn connection_in_progress(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }

    fn send_telemetry(&self, telemetry: Value, qos: Option<u8>) -> Result<PublishInfo, Self::Error> {
        self.record(
            Envelope::gateway_telemetry(&self.device_id, telemetry),
            qos.unwrap_or(1),
        )
    }

    fn send_attributes(
        &self,
        attributes: Value,
        qos: Option<u8>,
    ) -> Result<PublishInfo, Self::Error> {
        self.record(
            Envelope::gateway_attributes(&self.device_id, attributes),
            qos.unwrap_or(1),
        )
    }

    fn gw_send_telemetry(
        &self,
        device: &str,
        telemetry: Value,
        qos: Option<u8>,
    ) -> Result<PublishInfo, Self::Error> {
        self.record(Envelope::device_telemetry(device, telemetry), qos.unwrap_or(1))
    }

    fn gw_send_attributes(
        &self,
        device: &str,
        attributes: Value,
        qos: Option<u8>,
    ) -> Result<PublishInfo, Self::Error> {
        self.record(Envelope::device_attributes(device, attributes), qos.unwrap_or(1))
    }
}
