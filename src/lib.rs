//! IoT Hub Connector
//!
//! Connects an IoT gateway to Azure IoT Hub over MQTT with TLS and keeps the
//! connection alive.
//!
//! # Overview
//!
//! - [`transport::iothub::SessionClient`] wraps one MQTT session and publishes
//!   telemetry and attributes for the gateway and the sub-devices it represents
//! - [`supervisor::ConnectionSupervisor`] retries the session until connected and
//!   exposes pause, resume and stop controls
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use iothub_connector::{ConnectionSupervisor, ConnectorConfig, SessionCallbacks};
//! use serde_json::json;
//! use std::path::Path;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ConnectorConfig::load_from_file(Path::new("/etc/gateway/iothub.toml"))?;
//! let supervisor = ConnectionSupervisor::from_config(&config, SessionCallbacks::new())?;
//!
//! supervisor.wait_connected(Duration::from_secs(30)).await?;
//! supervisor
//!     .session()
//!     .gw_send_telemetry("sensor-7", json!({"temperature": 21.5}), None)?;
//!
//! supervisor.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod observability;
pub mod protocol;
pub mod supervisor;
pub mod testing;
pub mod transport;

pub use config::*;
pub use error::{ConnectorError, ConnectorResult};
pub use protocol::*;
pub use supervisor::{ConnectionSupervisor, SupervisorError, SupervisorState};
pub use transport::{SessionCallbacks, SessionClient, SessionEvent, Transport};
