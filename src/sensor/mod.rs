//! # Sensor Module
//!
//! Readings delivered by the host platform and the buffer that holds them.
//!
//! This module handles:
//! - Sensor samples and location fixes as immutable value types
//! - Raw sensor events as pushed by the host
//! - Accuracy tiers reported by the device
//! - Accuracy-filtered, self-resetting sample buffering

pub mod buffer;

use serde::Deserialize;

/// Device-reported accuracy tiers.
///
/// Values follow the host sensor convention; larger is better.
pub mod accuracy {
    /// Sensor is not in contact with the wearer.
    pub const NO_CONTACT: i32 = -1;
    /// Reading cannot be trusted.
    pub const UNRELIABLE: i32 = 0;
    /// Low accuracy, calibration required.
    pub const LOW: i32 = 1;
    /// Average accuracy. Default retention threshold.
    pub const MEDIUM: i32 = 2;
    /// Maximum accuracy.
    pub const HIGH: i32 = 3;
}

/// Kind of sensor an event originates from.
///
/// `Light` is accepted so the pipeline can be exercised on hardware without
/// a heart-rate sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorKind {
    #[default]
    HeartRate,
    Light,
}

/// A single sensor reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorSample {
    /// Device-reported quality level (see [`accuracy`]).
    pub accuracy: i32,
    /// Monotonic sensor clock in nanoseconds.
    pub timestamp_nanos: i64,
    /// Reading value (beats per minute for heart rate).
    pub value: f32,
}

impl SensorSample {
    pub fn new(accuracy: i32, timestamp_nanos: i64, value: f32) -> Self {
        Self {
            accuracy,
            timestamp_nanos,
            value,
        }
    }
}

/// A single location determination.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct LocationFix {
    pub latitude: f64,
    pub longitude: f64,
    /// Estimated horizontal accuracy radius in meters.
    #[serde(rename = "accuracy")]
    pub horizontal_accuracy_meters: f32,
}

impl LocationFix {
    pub fn new(latitude: f64, longitude: f64, horizontal_accuracy_meters: f32) -> Self {
        Self {
            latitude,
            longitude,
            horizontal_accuracy_meters,
        }
    }
}

/// Raw sensor event as pushed by the host platform.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RawSensorEvent {
    pub sensor: SensorKind,
    pub accuracy: i32,
    pub timestamp: i64,
    pub values: Vec<f32>,
}

impl RawSensorEvent {
    /// Convert to a sample using the first reported value.
    ///
    /// Returns `None` when the event carries no values.
    pub fn to_sample(&self) -> Option<SensorSample> {
        self.values
            .first()
            .map(|&value| SensorSample::new(self.accuracy, self.timestamp, value))
    }
}
