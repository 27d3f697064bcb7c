//! Connector configuration
//!
//! Configuration is a TOML file with a `[connection]` section describing the
//! IoT Hub identity and an optional `[reconnect]` section tuning the
//! supervisor's polling. Keys inside `[connection]` keep the names used by the
//! gateway's JSON configuration (`iothub`, `deviceId`, `deviceSasToken`,
//! `keep_alive`).

use crate::protocol::validate_device_id;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Domain suffix appended to bare hub names
pub const IOTHUB_DOMAIN: &str = "azure-devices.net";

/// CA certificate location relative to the configuration folder
pub const DEFAULT_CA_CERT_PATH: &str = "certs/azure/iothub_ca.cer";

/// Main connector configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectorConfig {
    pub connection: ConnectionSection,
    #[serde(default)]
    pub reconnect: ReconnectSection,
    /// Directory the configuration was loaded from; relative paths resolve against it
    #[serde(skip)]
    pub config_folder: PathBuf,
}

/// IoT Hub connection settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionSection {
    /// Hub name (`my-hub`) or full host name (`my-hub.azure-devices.net`)
    #[serde(rename = "iothub")]
    pub hub: String,
    #[serde(rename = "deviceId")]
    pub device_id: String,
    /// Pre-issued shared access signature token
    #[serde(rename = "deviceSasToken", default)]
    pub device_sas_token: Option<String>,
    /// Environment variable holding the SAS token, used when no inline token is set
    #[serde(rename = "deviceSasTokenEnv", default)]
    pub device_sas_token_env: Option<String>,
    /// MQTT keep-alive in seconds
    #[serde(default = "default_keep_alive")]
    pub keep_alive: u64,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Default quality of service for gateway publishes (0 or 1)
    #[serde(default = "default_qos")]
    pub qos: u8,
    /// CA certificate override; relative paths resolve against the config folder
    #[serde(default)]
    pub ca_cert: Option<PathBuf>,
    /// IoT Hub API version appended to the MQTT username when set
    #[serde(default)]
    pub api_version: Option<String>,
}

/// Supervisor polling settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectSection {
    /// Minimum spacing between connect attempts in seconds
    #[serde(default = "default_min_reconnect_delay")]
    pub min_reconnect_delay_secs: u64,
    /// Sleep between checks while connecting
    #[serde(default = "default_connect_poll_interval")]
    pub connect_poll_interval_ms: u64,
    /// Sleep between checks while connected, paused or idle
    #[serde(default = "default_idle_poll_interval")]
    pub idle_poll_interval_ms: u64,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            min_reconnect_delay_secs: default_min_reconnect_delay(),
            connect_poll_interval_ms: default_connect_poll_interval(),
            idle_poll_interval_ms: default_idle_poll_interval(),
        }
    }
}

impl ReconnectSection {
    pub fn min_reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.min_reconnect_delay_secs)
    }

    pub fn connect_poll_interval(&self) -> Duration {
        Duration::from_millis(self.connect_poll_interval_ms)
    }

    pub fn idle_poll_interval(&self) -> Duration {
        Duration::from_millis(self.idle_poll_interval_ms)
    }
}

fn default_keep_alive() -> u64 {
    120
}

fn default_port() -> u16 {
    8883
}

fn default_qos() -> u8 {
    1
}

fn default_min_reconnect_delay() -> u64 {
    1
}

fn default_connect_poll_interval() -> u64 {
    1000
}

fn default_idle_poll_interval() -> u64 {
    100
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid device ID: {0}")]
    InvalidDeviceId(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ConnectorConfig {
    /// Load configuration from a TOML file; the file's directory becomes the config folder
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let folder = path.parent().map(Path::to_path_buf).unwrap_or_default();
        Self::from_toml_str(&content, folder)
    }

    /// Parse and validate configuration text
    pub fn from_toml_str(content: &str, config_folder: PathBuf) -> Result<Self, ConfigError> {
        let mut config: ConnectorConfig = toml::from_str(content)?;
        config.config_folder = config_folder;
        config.validate()?;
        Ok(config)
    }

    /// Check field consistency; called by the loaders
    pub fn validate(&self) -> Result<(), ConfigError> {
        let connection = &self.connection;

        if connection.hub.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "connection.iothub must not be empty".to_string(),
            ));
        }

        validate_device_id(&connection.device_id)
            .map_err(|e| ConfigError::InvalidDeviceId(format!("'{}': {e}", connection.device_id)))?;

        if connection.qos > 1 {
            return Err(ConfigError::InvalidConfig(format!(
                "connection.qos must be 0 or 1, got {}",
                connection.qos
            )));
        }

        if connection.device_sas_token.is_none() && connection.device_sas_token_env.is_none() {
            return Err(ConfigError::InvalidConfig(
                "one of connection.deviceSasToken or connection.deviceSasTokenEnv is required"
                    .to_string(),
            ));
        }

        if connection.keep_alive < 5 {
            return Err(ConfigError::InvalidConfig(format!(
                "connection.keep_alive must be at least 5 seconds, got {}",
                connection.keep_alive
            )));
        }

        if self.reconnect.connect_poll_interval_ms == 0 || self.reconnect.idle_poll_interval_ms == 0
        {
            return Err(ConfigError::InvalidConfig(
                "reconnect poll intervals must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Fully qualified IoT Hub host name
    pub fn hostname(&self) -> String {
        let hub = self.connection.hub.trim();
        if hub.contains('.') {
            hub.to_string()
        } else {
            format!("{hub}.{IOTHUB_DOMAIN}")
        }
    }

    /// Resolve the SAS token, preferring the inline value over the environment
    pub fn sas_token(&self) -> Result<String, ConfigError> {
        if let Some(token) = &self.connection.device_sas_token {
            return Ok(token.clone());
        }

        match &self.connection.device_sas_token_env {
            Some(env_name) => std::env::var(env_name)
                .map_err(|_| ConfigError::EnvVarNotFound(env_name.clone())),
            None => Err(ConfigError::InvalidConfig(
                "no SAS token configured".to_string(),
            )),
        }
    }

    /// CA certificate path, resolved against the config folder
    pub fn ca_cert_path(&self) -> PathBuf {
        match &self.connection.ca_cert {
            Some(path) if path.is_absolute() => path.clone(),
            Some(path) => self.config_folder.join(path),
            None => self.config_folder.join(DEFAULT_CA_CERT_PATH),
        }
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.connection.keep_alive)
    }

    /// Copy with the inline SAS token masked, for display
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        config.connection.device_sas_token = config
            .connection
            .device_sas_token
            .as_deref()
            .map(crate::observability::redact_token);
        config
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[connection]
iothub = "test-hub"
deviceId = "test-gateway"
deviceSasToken = "SharedAccessSignature sr=test-hub.azure-devices.net&sig=abc&se=1"
"#;
        Self::from_toml_str(toml_content, PathBuf::from("/etc/gateway"))
            .expect("Test config should parse")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_config() {
        let toml_content = r#"
[connection]
iothub = "plant-hub"
deviceId = "gateway-01"
deviceSasToken = "SharedAccessSignature sr=x&sig=y&se=1"
keep_alive = 60
port = 443
qos = 0
ca_cert = "/opt/certs/hub.pem"
api_version = "2021-04-12"

[reconnect]
min_reconnect_delay_secs = 10
connect_poll_interval_ms = 500
idle_poll_interval_ms = 50
"#;

        let config = ConnectorConfig::from_toml_str(toml_content, PathBuf::from("/cfg")).unwrap();
        assert_eq!(config.connection.hub, "plant-hub");
        assert_eq!(config.connection.device_id, "gateway-01");
        assert_eq!(config.connection.keep_alive, 60);
        assert_eq!(config.connection.port, 443);
        assert_eq!(config.connection.qos, 0);
        assert_eq!(config.ca_cert_path(), PathBuf::from("/opt/certs/hub.pem"));
        assert_eq!(config.reconnect.min_reconnect_delay(), Duration::from_secs(10));
        assert_eq!(config.reconnect.connect_poll_interval(), Duration::from_millis(500));
        assert_eq!(config.reconnect.idle_poll_interval(), Duration::from_millis(50));
    }

    #[test]
    fn test_defaults() {
        let config = ConnectorConfig::test_config();
        assert_eq!(config.connection.keep_alive, 120);
        assert_eq!(config.connection.port, 8883);
        assert_eq!(config.connection.qos, 1);
        assert_eq!(config.reconnect, ReconnectSection::default());
        assert_eq!(config.reconnect.min_reconnect_delay(), Duration::from_secs(1));
        assert_eq!(
            config.ca_cert_path(),
            PathBuf::from("/etc/gateway").join("certs/azure/iothub_ca.cer")
        );
    }

    #[test]
    fn test_hostname() {
        let mut config = ConnectorConfig::test_config();
        assert_eq!(config.hostname(), "test-hub.azure-devices.net");

        config.connection.hub = "custom.example.com".to_string();
        assert_eq!(config.hostname(), "custom.example.com");
    }

    #[test]
    fn test_relative_ca_cert_resolves_against_folder() {
        let mut config = ConnectorConfig::test_config();
        config.connection.ca_cert = Some(PathBuf::from("tls/ca.pem"));
        assert_eq!(
            config.ca_cert_path(),
            PathBuf::from("/etc/gateway").join("tls/ca.pem")
        );
    }

    #[test]
    fn test_invalid_qos_rejected() {
        let mut config = ConnectorConfig::test_config();
        config.connection.qos = 2;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_invalid_device_id_rejected() {
        let mut config = ConnectorConfig::test_config();
        config.connection.device_id = "dev/1".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidDeviceId(_))
        ));
    }

    #[test]
    fn test_missing_token_rejected() {
        let toml_content = r#"
[connection]
iothub = "hub"
deviceId = "gw"
"#;
        let result = ConnectorConfig::from_toml_str(toml_content, PathBuf::new());
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_token_from_environment() {
        let toml_content = r#"
[connection]
iothub = "hub"
deviceId = "gw"
deviceSasTokenEnv = "IOTHUB_CONNECTOR_TEST_TOKEN_CONFIG_RS"
"#;
        let config = ConnectorConfig::from_toml_str(toml_content, PathBuf::new()).unwrap();

        assert!(matches!(
            config.sas_token(),
            Err(ConfigError::EnvVarNotFound(_))
        ));

        std::env::set_var("IOTHUB_CONNECTOR_TEST_TOKEN_CONFIG_RS", "token-from-env");
        assert_eq!(config.sas_token().unwrap(), "token-from-env");
        std::env::remove_var("IOTHUB_CONNECTOR_TEST_TOKEN_CONFIG_RS");
    }

    #[test]
    fn test_inline_token_wins() {
        let config = ConnectorConfig::test_config();
        assert!(config.sas_token().unwrap().starts_with("SharedAccessSignature"));
    }

    #[test]
    fn test_redacted_masks_signature() {
        let config = ConnectorConfig::test_config();
        let redacted = config.redacted();

        let token = redacted.connection.device_sas_token.unwrap();
        assert!(!token.contains("sig=abc"));
        assert!(token.contains("sr=test-hub.azure-devices.net"));
        assert_eq!(redacted.connection.device_id, config.connection.device_id);
    }
}
