//! IoT Hub Connector - Main Entry Point

use clap::{Parser, Subcommand};
use iothub_connector::config::ConnectorConfig;
use iothub_connector::error::{ConnectorError, ConnectorResult};
use iothub_connector::observability::init_default_logging;
use iothub_connector::supervisor::ConnectionSupervisor;
use iothub_connector::transport::SessionCallbacks;
use serde_json::Value;
use std::path::PathBuf;
use std::process;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

/// Azure IoT Hub connector for IoT gateways
#[derive(Parser)]
#[command(name = "iothub-connector")]
#[command(about = "Connect an IoT gateway to Azure IoT Hub over MQTT")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "IOTHUB_CONNECTOR_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Keep the gateway connected until interrupted
    Run,
    /// Validate configuration
    Config {
        /// Show current configuration with secrets masked
        #[arg(long)]
        show: bool,
    },
    /// Connect, publish one message and disconnect
    Send {
        /// JSON payload
        payload: String,
        /// Send on behalf of this sub-device instead of the gateway
        #[arg(long)]
        device: Option<String>,
        /// Send as attributes instead of telemetry
        #[arg(long)]
        attributes: bool,
        /// Quality of service (0 or 1)
        #[arg(long)]
        qos: Option<u8>,
        /// How long to wait for the connection
        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging(cli.verbose);

    info!("Starting IoT Hub connector v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e.user_message());
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_connector(config).await,
        Commands::Config { show } => handle_config_command(&config, show),
        Commands::Send {
            payload,
            device,
            attributes,
            qos,
            timeout_secs,
        } => {
            send_once(
                config,
                &payload,
                device.as_deref(),
                attributes,
                qos,
                Duration::from_secs(timeout_secs),
            )
            .await
        }
    };

    if let Err(e) = result {
        error!("Command failed: {}", e.user_message());
        process::exit(1);
    }

    info!("Connector shutdown complete");
}

fn load_configuration(config_path: &Option<PathBuf>) -> ConnectorResult<ConnectorConfig> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(ConnectorConfig::load_from_file(path)?);
    }

    let default_paths = ["iothub.toml", "config/iothub.toml"];
    for path_str in default_paths {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(ConnectorConfig::load_from_file(&path)?);
        }
    }

    Err(ConnectorError::InvalidInput {
        message: "no configuration file found; pass -c/--config or create iothub.toml"
            .to_string(),
    })
}

async fn run_connector(config: ConnectorConfig) -> ConnectorResult<()> {
    let supervisor = ConnectionSupervisor::from_config(&config, SessionCallbacks::new())?;

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    info!(
        hub = %config.hostname(),
        device_id = %config.connection.device_id,
        "Connector running"
    );

    tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down gracefully...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully...");
        }
    }

    supervisor.stop().await;
    supervisor.join().await;

    let stats = supervisor.stats();
    info!(
        connect_attempts = stats.connect_attempts,
        connections = stats.connections,
        refusals = stats.refusals,
        disconnections = stats.disconnections,
        "Connection statistics"
    );
    Ok(())
}

fn handle_config_command(config: &ConnectorConfig, show: bool) -> ConnectorResult<()> {
    if show {
        let rendered = toml::to_string_pretty(&config.redacted()).map_err(|e| {
            ConnectorError::InvalidInput {
                message: format!("cannot render configuration: {e}"),
            }
        })?;
        println!("Current configuration:");
        println!("{rendered}");
    }

    info!("Configuration validation complete");
    Ok(())
}

async fn send_once(
    config: ConnectorConfig,
    payload: &str,
    device: Option<&str>,
    attributes: bool,
    qos: Option<u8>,
    timeout: Duration,
) -> ConnectorResult<()> {
    let value: Value = serde_json::from_str(payload).map_err(|e| ConnectorError::InvalidInput {
        message: format!("payload is not valid JSON: {e}"),
    })?;

    let supervisor = ConnectionSupervisor::from_config(&config, SessionCallbacks::new())?;

    if let Err(e) = supervisor.wait_connected(timeout).await {
        supervisor.stop().await;
        return Err(e.into());
    }

    let session = supervisor.session();
    let result = match (device, attributes) {
        (Some(device), false) => session.gw_send_telemetry(device, value, qos),
        (Some(device), true) => session.gw_send_attributes(device, value, qos),
        (None, false) => session.send_telemetry(value, qos),
        (None, true) => session.send_attributes(value, qos),
    };

    let outcome = match result {
        Ok(info) if info.is_queued() => {
            info!(topic = %info.topic, qos = info.qos, bytes = info.payload_len, "Message queued");
            Ok(())
        }
        Ok(info) => {
            warn!(topic = %info.topic, "Message was not queued: {:?}", info.outcome);
            Err(ConnectorError::InvalidInput {
                message: format!("publish rejected: {:?}", info.outcome),
            })
        }
        Err(e) => Err(e.into()),
    };

    supervisor.stop().await;
    outcome
}
