//! # Fix Joiner
//!
//! Combines each location fix with the latest qualifying sensor sample.
//!
//! A fix that arrives while the buffer is empty is dropped: fixes are never
//! held back waiting for a later sample.

use std::sync::Arc;
use tracing::debug;

use super::timestamp::{format_timestamp, Clock, SystemClock, TimestampFormat};
use super::TelemetryRecord;
use crate::sensor::buffer::SampleBuffer;
use crate::sensor::LocationFix;

/// Builds telemetry records for one device.
#[derive(Clone)]
pub struct FixJoiner {
    device_id: String,
    device_os: String,
    timestamp_format: TimestampFormat,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for FixJoiner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixJoiner")
            .field("device_id", &self.device_id)
            .field("device_os", &self.device_os)
            .field("timestamp_format", &self.timestamp_format)
            .finish_non_exhaustive()
    }
}

impl FixJoiner {
    /// Creates a joiner stamping records with the wall clock.
    pub fn new(
        device_id: impl Into<String>,
        device_os: impl Into<String>,
        timestamp_format: TimestampFormat,
    ) -> Self {
        Self::with_clock(device_id, device_os, timestamp_format, Arc::new(SystemClock))
    }

    pub fn with_clock(
        device_id: impl Into<String>,
        device_os: impl Into<String>,
        timestamp_format: TimestampFormat,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            device_os: device_os.into(),
            timestamp_format,
            clock,
        }
    }

    /// Join `fix` with the latest sample in `buffer`.
    ///
    /// Returns `None` when no qualifying sample has been buffered yet.
    pub fn on_fix(&self, fix: &LocationFix, buffer: &SampleBuffer) -> Option<TelemetryRecord> {
        let Some(sample) = buffer.latest() else {
            debug!(
                "Fix at ({}, {}) skipped: no heart-rate sample buffered",
                fix.latitude, fix.longitude
            );
            return None;
        };

        let record = TelemetryRecord {
            latitude: fix.latitude,
            longitude: fix.longitude,
            heart_rate: sample.value,
            heart_rate_accuracy: sample.accuracy,
            location_accuracy: fix.horizontal_accuracy_meters,
            device_id: self.device_id.clone(),
            device_os: self.device_os.clone(),
            iso_timestamp_utc: format_timestamp(self.clock.now(), self.timestamp_format),
        };

        debug!(
            "lat: {}, lon: {}, hr: {}",
            record.latitude, record.longitude, record.heart_rate
        );
        Some(record)
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }
}
