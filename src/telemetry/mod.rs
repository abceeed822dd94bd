//! # Telemetry Module
//!
//! Fused heart-rate + location records and their wire payload.
//!
//! This module handles:
//! - Joining a location fix with the latest buffered sample
//! - Stamping records with device identity, OS and UTC time
//! - Serializing records as flat JSON for the broker

pub mod joiner;
pub mod timestamp;

use bytes::Bytes;
use serde::Serialize;

use crate::error::Result;

/// One fused telemetry reading, published once and then discarded.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryRecord {
    pub latitude: f64,
    pub longitude: f64,
    pub heart_rate: f32,
    pub heart_rate_accuracy: i32,
    pub location_accuracy: f32,
    pub device_id: String,
    pub device_os: String,
    pub iso_timestamp_utc: String,
}

/// JSON body sent to the broker.
#[derive(Debug, Serialize)]
struct WirePayload<'a> {
    heart_rate: f32,
    latitude: f64,
    longitude: f64,
    #[serde(rename = "deviceID")]
    device_id: &'a str,
    #[serde(rename = "deviceOS")]
    device_os: &'a str,
    time: &'a str,
}

impl TelemetryRecord {
    /// Serialize to the flat JSON wire payload.
    ///
    /// # Examples
    ///
    /// ```
    /// use wearable_telemetry::telemetry::TelemetryRecord;
    ///
    /// let record = TelemetryRecord {
    ///     latitude: 45.0,
    ///     longitude: -73.0,
    ///     heart_rate: 72.0,
    ///     heart_rate_accuracy: 3,
    ///     location_accuracy: 5.0,
    ///     device_id: "device-1".to_string(),
    ///     device_os: "Android 13.0".to_string(),
    ///     iso_timestamp_utc: "2024-03-05T07:08:09.009Z".to_string(),
    /// };
    ///
    /// let payload = record.to_payload()?;
    /// assert!(std::str::from_utf8(&payload)?.contains("\"heart_rate\":72.0"));
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn to_payload(&self) -> Result<Bytes> {
        let body = WirePayload {
            heart_rate: self.heart_rate,
            latitude: self.latitude,
            longitude: self.longitude,
            device_id: &self.device_id,
            device_os: &self.device_os,
            time: &self.iso_timestamp_utc,
        };
        Ok(Bytes::from(serde_json::to_vec(&body)?))
    }
}

/// Build the `deviceOS` label from an OS name and release string.
///
/// Only the leading `major.minor` of the release is kept and it always
/// renders with a fractional part (`"8.1.0"` -> `8.1`, `"13"` -> `13.0`).
/// A release without leading digits is used verbatim.
///
/// # Examples
///
/// ```
/// use wearable_telemetry::telemetry::device_os_label;
///
/// assert_eq!(device_os_label("Android", "8.1.0"), "Android 8.1");
/// assert_eq!(device_os_label("Android", "13"), "Android 13.0");
/// ```
pub fn device_os_label(os_name: &str, release: &str) -> String {
    let release = release.trim();
    let major_len = release.find(|c: char| !c.is_ascii_digit()).unwrap_or(release.len());
    if major_len == 0 {
        return format!("{} {}", os_name, release);
    }

    let rest = &release[major_len..];
    let minor_len = rest
        .strip_prefix('.')
        .map(|tail| tail.find(|c: char| !c.is_ascii_digit()).unwrap_or(tail.len()))
        .unwrap_or(0);

    let version = if minor_len > 0 {
        &release[..major_len + 1 + minor_len]
    } else {
        &release[..major_len]
    };

    match version.parse::<f64>() {
        Ok(v) if v.fract() == 0.0 => format!("{} {:.1}", os_name, v),
        Ok(v) => format!("{} {}", os_name, v),
        Err(_) => format!("{} {}", os_name, release),
    }
}
