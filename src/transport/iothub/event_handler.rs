//! Pure routing of MQTT event-loop results
//!
//! Each poll of the `rumqttc` event loop yields either an event or a
//! connection error. This module turns both into an [`EventRoute`] so the
//! network task only has to act on a small set of outcomes.

use super::connection::{describe_connection_error, ConnectCode};
use rumqttc::{ConnectionError, Event, Outgoing, Packet};

/// Routing decisions for event-loop results
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    /// Broker accepted the session
    ConnectionAcknowledged,
    /// Broker refused the session
    ConnectionRefused(ConnectCode),
    /// Message received on a subscribed topic
    MessageReceived { topic: String, payload: Vec<u8> },
    /// Subscription acknowledged
    SubscriptionConfirmed { packet_id: u16 },
    /// Broker closed the session
    BrokerDisconnected,
    /// Our DISCONNECT packet went out
    LocalDisconnectSent,
    /// Socket, TLS or protocol failure
    NetworkError(String),
    /// Keep-alive and acknowledgement traffic
    InfrastructureEvent(String),
    /// Other outgoing packets (handled by the client)
    OutgoingEvent,
}

impl EventRoute {
    /// Check if this route ends the current network task
    pub fn ends_session(&self) -> bool {
        matches!(
            self,
            EventRoute::ConnectionRefused(_)
                | EventRoute::BrokerDisconnected
                | EventRoute::LocalDisconnectSent
                | EventRoute::NetworkError(_)
        )
    }
}

/// Pure routing decisions for MQTT events
pub struct EventHandler;

impl EventHandler {
    /// Route one poll result
    pub fn route_poll_result(result: &Result<Event, ConnectionError>) -> EventRoute {
        match result {
            Ok(event) => Self::route_event(event),
            Err(error) => Self::route_error(error),
        }
    }

    /// Route a successfully polled event
    pub fn route_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(Packet::ConnAck(ack)) => {
                let code = ConnectCode::from(ack.code);
                if code.is_success() {
                    EventRoute::ConnectionAcknowledged
                } else {
                    EventRoute::ConnectionRefused(code)
                }
            }
            Event::Incoming(Packet::Publish(publish)) => EventRoute::MessageReceived {
                topic: publish.topic.clone(),
                payload: publish.payload.to_vec(),
            },
            Event::Incoming(Packet::SubAck(suback)) => EventRoute::SubscriptionConfirmed {
                packet_id: suback.pkid,
            },
            Event::Incoming(Packet::Disconnect) => EventRoute::BrokerDisconnected,
            Event::Incoming(other) => EventRoute::InfrastructureEvent(format!("{other:?}")),
            Event::Outgoing(Outgoing::Disconnect) => EventRoute::LocalDisconnectSent,
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }

    /// Route an event-loop error
    pub fn route_error(error: &ConnectionError) -> EventRoute {
        match error {
            ConnectionError::ConnectionRefused(code) => {
                EventRoute::ConnectionRefused(ConnectCode::from(*code))
            }
            other => EventRoute::NetworkError(describe_connection_error(other)),
        }
    }
}
