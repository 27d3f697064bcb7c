//! Pure connection configuration for the IoT Hub session
//!
//! This module holds the session identity, connection options, broker
//! connect-return codes and the construction of `rumqttc` options. Nothing in
//! here touches the network.

use crate::config::{ConfigError, ConnectorConfig};
use crate::observability::redact_secrets;
use rumqttc::{MqttOptions, QoS, TlsConfiguration, Transport as RumqttcTransport};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error};

/// Capacity of the outgoing request queue between the client handle and the event loop
pub const DEFAULT_REQUEST_CAPACITY: usize = 100;

/// Identity of one broker session; immutable for the session's lifetime
#[derive(Clone, PartialEq)]
pub struct SessionIdentity {
    pub host: String,
    pub device_id: String,
    pub sas_token: String,
}

impl SessionIdentity {
    pub fn new(
        host: impl Into<String>,
        device_id: impl Into<String>,
        sas_token: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            device_id: device_id.into(),
            sas_token: sas_token.into(),
        }
    }
}

impl fmt::Debug for SessionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionIdentity")
            .field("host", &self.host)
            .field("device_id", &self.device_id)
            .field("sas_token", &"***")
            .finish()
    }
}

/// Transport options for one broker session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOptions {
    pub port: u16,
    pub keep_alive: Duration,
    pub ca_cert: PathBuf,
    pub api_version: Option<String>,
    /// QoS used when a send call does not specify one
    pub default_qos: u8,
    pub request_capacity: usize,
}

impl SessionOptions {
    pub fn new(ca_cert: impl Into<PathBuf>) -> Self {
        Self {
            port: 8883,
            keep_alive: Duration::from_secs(120),
            ca_cert: ca_cert.into(),
            api_version: None,
            default_qos: 1,
            request_capacity: DEFAULT_REQUEST_CAPACITY,
        }
    }
}

/// Build identity and options from loaded configuration
pub fn session_settings_from_config(
    config: &ConnectorConfig,
) -> Result<(SessionIdentity, SessionOptions), ConfigError> {
    let identity = SessionIdentity::new(
        config.hostname(),
        config.connection.device_id.clone(),
        config.sas_token()?,
    );
    let options = SessionOptions {
        port: config.connection.port,
        keep_alive: config.keep_alive(),
        ca_cert: config.ca_cert_path(),
        api_version: config.connection.api_version.clone(),
        default_qos: config.connection.qos,
        request_capacity: DEFAULT_REQUEST_CAPACITY,
    };
    Ok((identity, options))
}

/// Connection state of a broker session
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// No network task is connected (initial state)
    Disconnected,
    /// Network task started, waiting for the broker's acknowledgement
    Connecting,
    /// Broker acknowledged the session
    Connected,
    /// Broker refused the session with the given code
    Refused(ConnectCode),
}

/// Broker connect acknowledgement code (MQTT 3.1.1 CONNACK return code)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectCode {
    Accepted,
    RefusedProtocolVersion,
    BadClientId,
    ServiceUnavailable,
    BadUserNamePassword,
    NotAuthorized,
    Unknown(u8),
}

impl ConnectCode {
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => Self::Accepted,
            1 => Self::RefusedProtocolVersion,
            2 => Self::BadClientId,
            3 => Self::ServiceUnavailable,
            4 => Self::BadUserNamePassword,
            5 => Self::NotAuthorized,
            other => Self::Unknown(other),
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            Self::Accepted => 0,
            Self::RefusedProtocolVersion => 1,
            Self::BadClientId => 2,
            Self::ServiceUnavailable => 3,
            Self::BadUserNamePassword => 4,
            Self::NotAuthorized => 5,
            Self::Unknown(code) => *code,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Accepted)
    }

    /// Human-readable reason for a refusal; `None` for success and unknown codes
    pub fn reason(&self) -> Option<&'static str> {
        match self {
            Self::RefusedProtocolVersion => Some("incorrect protocol version"),
            Self::BadClientId => Some("invalid client identifier"),
            Self::ServiceUnavailable => Some("server unavailable"),
            Self::BadUserNamePassword => Some("bad username or password"),
            Self::NotAuthorized => Some("not authorised"),
            Self::Accepted | Self::Unknown(_) => None,
        }
    }
}

impl From<rumqttc::ConnectReturnCode> for ConnectCode {
    fn from(code: rumqttc::ConnectReturnCode) -> Self {
        use rumqttc::ConnectReturnCode as Rc;
        match code {
            Rc::Success => Self::Accepted,
            Rc::RefusedProtocolVersion => Self::RefusedProtocolVersion,
            Rc::BadClientId => Self::BadClientId,
            Rc::ServiceUnavailable => Self::ServiceUnavailable,
            Rc::BadUserNamePassword => Self::BadUserNamePassword,
            Rc::NotAuthorized => Self::NotAuthorized,
        }
    }
}

/// Broker session errors
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Quality of service (qos) value must be 0 or 1, got {0}")]
    InvalidQos(u8),
    #[error("{0} is not supported by the IoT Hub connector")]
    NotImplemented(&'static str),
    #[error("Serialization error")]
    SerializationError(#[source] serde_json::Error),
}

/// Map a numeric QoS level onto the MQTT client's QoS
pub fn qos_from_level(level: u8) -> Result<QoS, SessionError> {
    match level {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        other => Err(SessionError::InvalidQos(other)),
    }
}

/// MQTT username expected by IoT Hub: `{host}/{device_id}[/?api-version=..]`
pub fn build_username(identity: &SessionIdentity, api_version: Option<&str>) -> String {
    match api_version {
        Some(version) => format!(
            "{}/{}/?api-version={version}",
            identity.host, identity.device_id
        ),
        None => format!("{}/{}", identity.host, identity.device_id),
    }
}

/// Build the TLS transport from the CA certificate.
///
/// An unreadable certificate is logged and the platform root store is used instead.
pub fn build_tls_transport(ca_cert: &Path) -> RumqttcTransport {
    match std::fs::read(ca_cert) {
        Ok(ca) => {
            debug!("Using IoT Hub CA certificate {}", ca_cert.display());
            RumqttcTransport::tls_with_config(TlsConfiguration::Simple {
                ca,
                alpn: None,
                client_auth: None,
            })
        }
        Err(e) => {
            error!(
                "Failed to read CA certificate {}: {}; falling back to platform roots",
                ca_cert.display(),
                e
            );
            RumqttcTransport::tls_with_default_config()
        }
    }
}

/// Configure MQTT options for an IoT Hub device session
pub fn configure_mqtt_options(identity: &SessionIdentity, options: &SessionOptions) -> MqttOptions {
    let mut mqtt_options = MqttOptions::new(&identity.device_id, &identity.host, options.port);

    mqtt_options.set_credentials(
        build_username(identity, options.api_version.as_deref()),
        identity.sas_token.clone(),
    );
    mqtt_options.set_keep_alive(options.keep_alive);
    mqtt_options.set_transport(build_tls_transport(&options.ca_cert));

    mqtt_options
}

/// Render a connection error for logs without leaking credentials
pub fn describe_connection_error(error: &impl fmt::Display) -> String {
    redact_secrets(&error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn test_identity() -> SessionIdentity {
        SessionIdentity::new("hub.azure-devices.net", "gw-1", "SharedAccessSignature sig=abc")
    }

    #[test]
    fn test_connect_code_table() {
        for code in 0u8..=7 {
            assert_eq!(ConnectCode::from_code(code).code(), code);
        }

        assert!(ConnectCode::from_code(0).is_success());
        assert_eq!(ConnectCode::from_code(0).reason(), None);
        assert_eq!(
            ConnectCode::from_code(1).reason(),
            Some("incorrect protocol version")
        );
        assert_eq!(
            ConnectCode::from_code(2).reason(),
            Some("invalid client identifier")
        );
        assert_eq!(ConnectCode::from_code(3).reason(), Some("server unavailable"));
        assert_eq!(
            ConnectCode::from_code(4).reason(),
            Some("bad username or password")
        );
        assert_eq!(ConnectCode::from_code(5).reason(), Some("not authorised"));
        assert_eq!(ConnectCode::from_code(9).reason(), None);
        assert!(!ConnectCode::from_code(9).is_success());
    }

    #[test]
    fn test_rumqttc_codes_map() {
        assert_eq!(
            ConnectCode::from(rumqttc::ConnectReturnCode::Success),
            ConnectCode::Accepted
        );
        assert_eq!(
            ConnectCode::from(rumqttc::ConnectReturnCode::NotAuthorized),
            ConnectCode::NotAuthorized
        );
    }

    #[test]
    fn test_qos_from_level() {
        assert_eq!(qos_from_level(0).unwrap(), QoS::AtMostOnce);
        assert_eq!(qos_from_level(1).unwrap(), QoS::AtLeastOnce);
        assert!(matches!(qos_from_level(2), Err(SessionError::InvalidQos(2))));
    }

    #[test]
    fn test_build_username() {
        let identity = test_identity();
        assert_eq!(build_username(&identity, None), "hub.azure-devices.net/gw-1");
        assert_eq!(
            build_username(&identity, Some("2021-04-12")),
            "hub.azure-devices.net/gw-1/?api-version=2021-04-12"
        );
    }

    #[test]
    fn test_identity_debug_hides_token() {
        let rendered = format!("{:?}", test_identity());
        assert!(rendered.contains("gw-1"));
        assert!(!rendered.contains("sig=abc"));
    }

    #[test]
    fn test_configure_mqtt_options() {
        let mut ca = NamedTempFile::new().unwrap();
        writeln!(ca, "-----BEGIN CERTIFICATE-----").unwrap();

        let identity = test_identity();
        let mut options = SessionOptions::new(ca.path());
        options.keep_alive = Duration::from_secs(60);

        let mqtt_options = configure_mqtt_options(&identity, &options);
        assert_eq!(mqtt_options.client_id(), "gw-1");
        assert_eq!(
            mqtt_options.broker_address(),
            ("hub.azure-devices.net".to_string(), 8883)
        );
        assert_eq!(mqtt_options.keep_alive(), Duration::from_secs(60));
        assert_eq!(
            mqtt_options.credentials(),
            Some((
                "hub.azure-devices.net/gw-1".to_string(),
                "SharedAccessSignature sig=abc".to_string()
            ))
        );
    }

    #[test]
    fn test_session_settings_from_config() {
        let config = ConnectorConfig::test_config();
        let (identity, options) = session_settings_from_config(&config).unwrap();

        assert_eq!(identity.host, "test-hub.azure-devices.net");
        assert_eq!(identity.device_id, "test-gateway");
        assert_eq!(options.port, 8883);
        assert_eq!(options.keep_alive, Duration::from_secs(120));
        assert_eq!(options.default_qos, 1);
        assert!(options.ca_cert.ends_with("certs/azure/iothub_ca.cer"));
    }

    #[test]
    fn test_session_error_display() {
        let errors = vec![
            SessionError::InvalidQos(7),
            SessionError::NotImplemented("gw_connect_device"),
        ];

        for error in errors {
            assert!(!error.to_string().is_empty());
        }
        assert!(SessionError::InvalidQos(7).to_string().contains("must be 0 or 1"));
    }

    #[test]
    fn test_describe_connection_error_redacts() {
        let rendered = describe_connection_error(&"auth failed for sig=c2VjcmV0&se=17");
        assert!(!rendered.contains("c2VjcmV0"));
    }
}
