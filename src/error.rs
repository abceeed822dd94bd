//! # Error Types
//!
//! Custom error types for the telemetry agent using `thiserror`.

use thiserror::Error;

/// Main error type for the telemetry agent
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Payload or keystore (de)serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Device identity could not be loaded or stored
    #[error("Identity error: {0}")]
    Identity(String),

    /// Certificate creation or policy attachment failed
    #[error("Certificate issuance failed: {0}")]
    Issuance(String),

    /// Credential keystore errors
    #[error("Keystore error: {0}")]
    Keystore(String),

    /// Broker connection errors
    #[error("Connection error: {0}")]
    Connection(String),

    /// Publish rejected by the transport
    #[error("Publish error: {0}")]
    Publish(String),
}

/// Result type alias for the telemetry agent
pub type Result<T> = std::result::Result<T, TelemetryError>;
