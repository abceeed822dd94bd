//! # Wearable Telemetry
//!
//! Heart-rate and location telemetry agent.
//!
//! Reads sensor events and location fixes from stdin as JSON lines (see
//! [`wearable_telemetry::host`]) and publishes joined records to the
//! configured broker topic.
//!
//! # Examples
//!
//! ```bash
//! RUST_LOG=debug wearable-telemetry config/default.toml < events.jsonl
//! ```

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use wearable_telemetry::agent::{EventSources, TelemetryAgent};
use wearable_telemetry::config::{Config, LoggingConfig};
use wearable_telemetry::connection::mqtt::MqttTransport;
use wearable_telemetry::connection::{ConnectionManager, ConnectionState};
use wearable_telemetry::dispatch::Dispatcher;
use wearable_telemetry::host;
use wearable_telemetry::identity::authority::HttpCertificateAuthority;
use wearable_telemetry::identity::keystore::FileIdentityPersistence;
use wearable_telemetry::identity::IdentityStore;
use wearable_telemetry::sensor::buffer::SampleBuffer;
use wearable_telemetry::telemetry::timestamp::SystemClock;

/// Configuration file used when no path is given on the command line
const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Events buffered between the host reader and the agent
const EVENT_QUEUE_DEPTH: usize = 64;

/// File name prefix for the rolling log file
const LOG_FILE_PREFIX: &str = "wearable-telemetry.log";

const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// Install the global tracing subscriber.
///
/// `RUST_LOG` overrides the configured level. When a log directory is
/// configured, output goes to a daily rolling file instead of stdout; the
/// returned guard must stay alive until exit so buffered lines are flushed.
fn init_logging(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .with_context(|| format!("Invalid log level {:?}", config.level))?;

    match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            Ok(None)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path))?;

    let _log_guard = init_logging(&config.logging)?;
    info!("Wearable Telemetry v{} starting...", env!("CARGO_PKG_VERSION"));

    let dispatcher = Dispatcher::spawn();

    let identity = Arc::new(IdentityStore::new(
        &config.identity,
        Arc::new(FileIdentityPersistence::from_config(&config.identity)),
        Arc::new(HttpCertificateAuthority::from_config(&config.identity)?),
        dispatcher.clone(),
    ));
    let connection = Arc::new(ConnectionManager::new(
        config.broker.clone(),
        Arc::new(MqttTransport::new(config.broker.clone())),
        dispatcher.clone(),
    ));
    let buffer = Arc::new(SampleBuffer::from_config(&config.sensor));

    let _status = connection
        .state()
        .subscribe(|state: &ConnectionState| info!("Status: {}", state));

    let (sample_tx, sample_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
    let (fix_tx, fix_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);

    let mut agent = TelemetryAgent::new(config, identity, connection, buffer, Arc::new(SystemClock));
    agent.start(EventSources {
        samples: sample_rx,
        fixes: fix_rx,
    })?;

    info!("Reading host events from stdin; press Ctrl+C to exit");
    tokio::select! {
        _ = async {
            match host::pump(BufReader::new(tokio::io::stdin()), sample_tx, fix_tx).await {
                Ok(count) => info!("Host input closed after {} events", count),
                Err(e) => error!("Host input failed: {}", e),
            }
            // The pump dropped both senders, so the consumers finish what is queued and exit
            agent.drain().await;
        } => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
    }

    agent.stop();
    // Give the MQTT event loop time to send queued publishes ahead of DISCONNECT
    tokio::time::sleep(SHUTDOWN_GRACE).await;
    dispatcher.flush().await;

    Ok(())
}
