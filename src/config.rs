//! # Configuration Module
//!
//! Handles loading and validating configuration from TOML files.
//!
//! Every tunable of the agent (broker endpoint, topic, identity storage,
//! sensor thresholds) lives here as an immutable value handed to the
//! components at construction time.

use serde::de::Error;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, TelemetryError};
use crate::sensor::{accuracy, SensorKind};
use crate::telemetry::timestamp::TimestampFormat;

/// Main configuration structure
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub broker: BrokerConfig,
    pub identity: IdentityConfig,
    #[serde(default)]
    pub sensor: SensorConfig,
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Broker data-plane configuration
#[derive(Debug, Deserialize, Clone)]
pub struct BrokerConfig {
    pub endpoint: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_ca_path")]
    pub ca_path: PathBuf,

    #[serde(default = "default_topic")]
    pub topic: String,

    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,

    #[serde(default = "default_last_will_topic")]
    pub last_will_topic: String,

    #[serde(default = "default_last_will_message")]
    pub last_will_message: String,

    #[serde(default = "default_reconnect_min_backoff_ms")]
    pub reconnect_min_backoff_ms: u64,

    #[serde(default = "default_reconnect_max_backoff_ms")]
    pub reconnect_max_backoff_ms: u64,

    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    #[serde(default = "default_request_capacity")]
    pub request_capacity: usize,
}

/// Device identity storage and issuance configuration
#[derive(Debug, Deserialize, Clone)]
pub struct IdentityConfig {
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    #[serde(default = "default_device_id_file")]
    pub device_id_file: String,

    #[serde(default = "default_keystore_name")]
    pub keystore_name: String,

    #[serde(default = "default_certificate_alias")]
    pub certificate_alias: String,

    pub policy_name: String,

    pub control_plane_url: String,

    /// Name of the environment variable holding a bearer token for the control plane
    #[serde(default)]
    pub access_token_env: Option<String>,

    /// Connect and response deadline for each control-plane request
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

/// Sensor sampling configuration
#[derive(Debug, Deserialize, Clone)]
pub struct SensorConfig {
    #[serde(default)]
    pub kind: SensorKind,

    #[serde(default = "default_accuracy_threshold")]
    pub accuracy_threshold: i32,

    #[serde(default = "default_capacity")]
    pub capacity: usize,

    #[serde(default = "default_reset_delay_ms")]
    pub reset_delay_ms: u64,
}

/// Reported device operating system
#[derive(Debug, Deserialize, Clone)]
pub struct DeviceConfig {
    #[serde(default = "default_os_name")]
    pub os_name: String,

    #[serde(default = "default_os_release")]
    pub os_release: String,
}

/// Telemetry record formatting
#[derive(Debug, Deserialize, Clone, Default)]
pub struct TelemetryConfig {
    #[serde(default)]
    pub timestamp_format: TimestampFormat,
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Directory for daily rolling log files; console only when unset
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

// Default value functions
fn default_port() -> u16 { 8883 }
fn default_ca_path() -> PathBuf { PathBuf::from("AmazonRootCA1.pem") }
fn default_topic() -> String { "topic1".to_string() }
fn default_keep_alive_secs() -> u64 { 10 }
fn default_last_will_topic() -> String { "my/lwt/topic".to_string() }
fn default_last_will_message() -> String { "Android client lost connection".to_string() }
fn default_reconnect_min_backoff_ms() -> u64 { 4000 }
fn default_reconnect_max_backoff_ms() -> u64 { 64000 }
fn default_max_reconnect_attempts() -> u32 { 10 }
fn default_request_capacity() -> usize { 10 }

fn default_storage_dir() -> PathBuf { PathBuf::from("./identity") }
fn default_device_id_file() -> String { "device_id".to_string() }
fn default_keystore_name() -> String { "iot_keystore".to_string() }
fn default_certificate_alias() -> String { "default".to_string() }
fn default_request_timeout_ms() -> u64 { 30_000 }

fn default_accuracy_threshold() -> i32 { accuracy::MEDIUM }
fn default_capacity() -> usize { 10 }
fn default_reset_delay_ms() -> u64 { 5000 }

fn default_os_name() -> String { "Android".to_string() }
fn default_os_release() -> String { "13".to_string() }

fn default_log_level() -> String { "info".to_string() }

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            kind: SensorKind::default(),
            accuracy_threshold: default_accuracy_threshold(),
            capacity: default_capacity(),
            reset_delay_ms: default_reset_delay_ms(),
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            os_name: default_os_name(),
            os_release: default_os_release(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            log_dir: None,
        }
    }
}

impl BrokerConfig {
    /// Keep-alive interval for the MQTT session
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }
}

impl IdentityConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl SensorConfig {
    /// How long ingestion stays paused after a buffer reset
    pub fn reset_delay(&self) -> Duration {
        Duration::from_millis(self.reset_delay_ms)
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - File cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use wearable_telemetry::config::Config;
    ///
    /// let config = Config::load("config/default.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns error if any configuration value is out of valid range
    fn validate(&self) -> Result<()> {
        if self.broker.endpoint.is_empty() {
            return Err(invalid("broker endpoint cannot be empty"));
        }

        if self.broker.port == 0 {
            return Err(invalid("broker port must be greater than 0"));
        }

        if self.broker.topic.is_empty() {
            return Err(invalid("broker topic cannot be empty"));
        }

        if self.broker.topic.contains(|c| c == '+' || c == '#') {
            return Err(invalid("broker topic cannot contain wildcards"));
        }

        // 1200 s is the longest keep-alive AWS IoT Core accepts
        if self.broker.keep_alive_secs < 5 || self.broker.keep_alive_secs > 1200 {
            return Err(invalid("keep_alive_secs must be between 5 and 1200"));
        }

        if self.broker.reconnect_min_backoff_ms == 0 {
            return Err(invalid("reconnect_min_backoff_ms must be greater than 0"));
        }

        if self.broker.reconnect_min_backoff_ms > self.broker.reconnect_max_backoff_ms {
            return Err(invalid(
                "reconnect_min_backoff_ms must not exceed reconnect_max_backoff_ms",
            ));
        }

        if self.broker.request_capacity == 0 {
            return Err(invalid("request_capacity must be greater than 0"));
        }

        if self.identity.storage_dir.as_os_str().is_empty() {
            return Err(invalid("identity storage_dir cannot be empty"));
        }

        if self.identity.device_id_file.is_empty() || self.identity.keystore_name.is_empty() {
            return Err(invalid("identity file names cannot be empty"));
        }

        if self.identity.device_id_file == self.identity.keystore_name {
            return Err(invalid("device_id_file and keystore_name must differ"));
        }

        if self.identity.certificate_alias.is_empty() {
            return Err(invalid("certificate_alias cannot be empty"));
        }

        if self.identity.request_timeout_ms == 0 {
            return Err(invalid("request_timeout_ms must be greater than 0"));
        }

        if !self.identity.control_plane_url.starts_with("http://")
            && !self.identity.control_plane_url.starts_with("https://")
        {
            return Err(invalid("control_plane_url must be an http(s) URL"));
        }

        if self.sensor.accuracy_threshold < accuracy::NO_CONTACT
            || self.sensor.accuracy_threshold > accuracy::HIGH
        {
            return Err(invalid(format!(
                "accuracy_threshold must be between {} and {}",
                accuracy::NO_CONTACT,
                accuracy::HIGH
            )));
        }

        if self.sensor.capacity == 0 {
            return Err(invalid("sensor capacity must be greater than 0"));
        }

        if self.sensor.reset_delay_ms > 600_000 {
            return Err(invalid("reset_delay_ms must be at most 600000"));
        }

        if self.device.os_name.is_empty() {
            return Err(invalid("device os_name cannot be empty"));
        }

        if !["trace", "debug", "info", "warn", "error"].contains(&self.logging.level.as_str()) {
            return Err(invalid(
                "logging level must be one of: trace, debug, info, warn, error",
            ));
        }

        Ok(())
    }
}

fn invalid(msg: impl std::fmt::Display) -> TelemetryError {
    TelemetryError::Config(toml::de::Error::custom(msg))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[broker]
endpoint = "abc123-ats.iot.ca-central-1.amazonaws.com"

[identity]
policy_name = "wearable-policy"
control_plane_url = "https://iot.ca-central-1.amazonaws.com"
"#;

    fn create_valid_config() -> Config {
        Config::from_toml(MINIMAL).unwrap()
    }

    #[test]
    fn test_minimal_config_fills_defaults() {
        let config = create_valid_config();

        assert_eq!(config.broker.port, 8883);
        assert_eq!(config.broker.topic, "topic1");
        assert_eq!(config.broker.keep_alive(), Duration::from_secs(10));
        assert_eq!(config.identity.keystore_name, "iot_keystore");
        assert_eq!(config.identity.certificate_alias, "default");
        assert_eq!(config.sensor.kind, SensorKind::HeartRate);
        assert_eq!(config.sensor.accuracy_threshold, accuracy::MEDIUM);
        assert_eq!(config.sensor.capacity, 10);
        assert_eq!(config.sensor.reset_delay(), Duration::from_secs(5));
        assert_eq!(config.telemetry.timestamp_format, TimestampFormat::Legacy);
        assert_eq!(config.device.os_name, "Android");
        assert!(config.logging.log_dir.is_none());
    }

    #[test]
    fn test_load_config_from_file() {
        use std::io::Write;
        use tempfile::NamedTempFile;

        let toml_content = r#"
[broker]
endpoint = "abc123-ats.iot.ca-central-1.amazonaws.com"
topic = "wearables/health"

[identity]
storage_dir = "/var/lib/wearable"
policy_name = "wearable-policy"
control_plane_url = "https://iot.ca-central-1.amazonaws.com"
access_token_env = "IOT_TOKEN"

[sensor]
kind = "light"
accuracy_threshold = 3

[device]
os_release = "8.1.0"

[telemetry]
timestamp_format = "millis"

[logging]
level = "debug"
log_dir = "./logs"
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(toml_content.as_bytes()).unwrap();
        temp_file.flush().unwrap();

        let config = Config::load(temp_file.path()).unwrap();
        assert_eq!(config.broker.topic, "wearables/health");
        assert_eq!(config.identity.access_token_env.as_deref(), Some("IOT_TOKEN"));
        assert_eq!(config.sensor.kind, SensorKind::Light);
        assert_eq!(config.sensor.accuracy_threshold, accuracy::HIGH);
        assert_eq!(config.device.os_release, "8.1.0");
        assert_eq!(config.telemetry.timestamp_format, TimestampFormat::Millis);
        assert_eq!(config.logging.log_dir, Some(PathBuf::from("./logs")));
    }

    #[test]
    fn test_missing_broker_section_is_rejected() {
        let result = Config::from_toml(
            r#"
[identity]
policy_name = "p"
control_plane_url = "https://example.com"
"#,
        );
        assert!(matches!(result, Err(TelemetryError::Config(_))));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let result = Config::load("/nonexistent/telemetry.toml");
        assert!(matches!(result, Err(TelemetryError::Io(_))));
    }

    #[test]
    fn test_empty_endpoint() {
        let mut config = create_valid_config();
        config.broker.endpoint = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_wildcard_topic() {
        let mut config = create_valid_config();
        config.broker.topic = "health/#".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_keep_alive_too_short() {
        let mut config = create_valid_config();
        config.broker.keep_alive_secs = 2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_keep_alive_broker_maximum() {
        let mut config = create_valid_config();
        config.broker.keep_alive_secs = 1200;
        assert!(config.validate().is_ok());

        config.broker.keep_alive_secs = 1201;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backoff_range_inverted() {
        let mut config = create_valid_config();
        config.broker.reconnect_min_backoff_ms = 10_000;
        config.broker.reconnect_max_backoff_ms = 1_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_request_capacity_zero() {
        let mut config = create_valid_config();
        config.broker.request_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_same_identity_file_names() {
        let mut config = create_valid_config();
        config.identity.device_id_file = "iot_keystore".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_certificate_alias() {
        let mut config = create_valid_config();
        config.identity.certificate_alias = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_request_timeout() {
        let config = create_valid_config();
        assert_eq!(config.identity.request_timeout(), Duration::from_secs(30));

        let mut config = create_valid_config();
        config.identity.request_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_control_plane_url_scheme() {
        let mut config = create_valid_config();
        config.identity.control_plane_url = "iot.ca-central-1.amazonaws.com".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_accuracy_threshold_out_of_range() {
        let mut config = create_valid_config();
        config.sensor.accuracy_threshold = 4;
        assert!(config.validate().is_err());

        config.sensor.accuracy_threshold = -2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_sensor_capacity_zero() {
        let mut config = create_valid_config();
        config.sensor.capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = create_valid_config();
        config.logging.level = "verbose".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_default_functions() {
        assert_eq!(default_port(), 8883);
        assert_eq!(default_topic(), "topic1");
        assert_eq!(default_keep_alive_secs(), 10);
        assert_eq!(default_last_will_topic(), "my/lwt/topic");
        assert_eq!(default_last_will_message(), "Android client lost connection");
        assert_eq!(default_reconnect_min_backoff_ms(), 4000);
        assert_eq!(default_reconnect_max_backoff_ms(), 64000);
        assert_eq!(default_max_reconnect_attempts(), 10);
        assert_eq!(default_keystore_name(), "iot_keystore");
        assert_eq!(default_certificate_alias(), "default");
        assert_eq!(default_accuracy_threshold(), 2);
        assert_eq!(default_capacity(), 10);
        assert_eq!(default_reset_delay_ms(), 5000);
        assert_eq!(default_log_level(), "info");
    }
}
