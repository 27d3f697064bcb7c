//! MQTT session with Azure IoT Hub
//!
//! The session is split the same way as the rest of the transport layer:
//!
//! - [`connection`] - Pure identity, options, result codes and MQTT option building
//! - [`event_handler`] - Pure routing of event-loop results
//! - [`client`] - Impure I/O: the network task and publish operations
//!
//! # Usage
//!
//! ```rust,no_run
//! use iothub_connector::transport::iothub::{SessionClient, SessionIdentity, SessionOptions};
//! use iothub_connector::transport::SessionCallbacks;
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let identity = SessionIdentity::new(
//!     "my-hub.azure-devices.net",
//!     "gateway-01",
//!     "SharedAccessSignature sr=...",
//! );
//! let options = SessionOptions::new("/etc/gateway/certs/azure/iothub_ca.cer");
//!
//! let session = SessionClient::new(identity, options, SessionCallbacks::new());
//! session.connect(None).await;
//! session.send_telemetry(json!({"temperature": 21.5}), None)?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod connection;
pub mod event_handler;

pub use client::SessionClient;
pub use connection::{
    ConnectCode, ConnectionState, SessionError, SessionIdentity, SessionOptions,
};
pub use event_handler::{EventHandler, EventRoute};
