//! # Sample Buffer
//!
//! Accuracy-filtered, capacity-bounded store of sensor samples.
//!
//! ## Reset Cycle
//!
//! When a qualifying sample arrives while the buffer already holds
//! `capacity` samples, the buffer throttles instead of growing:
//!
//! 1. All stored samples are cleared and the triggering sample is discarded
//! 2. Ingestion pauses for `reset_delay` (samples arriving meanwhile are dropped)
//! 3. The first sample after the pause is accepted normally
//!
//! The pause is a deadline checked on every ingest, so the context that
//! delivers sensor events is never put to sleep.
//!
//! ## Usage
//!
//! ```
//! use std::time::Duration;
//! use wearable_telemetry::sensor::buffer::{IngestOutcome, SampleBuffer};
//! use wearable_telemetry::sensor::{accuracy, SensorSample};
//!
//! let buffer = SampleBuffer::new(accuracy::MEDIUM, 10, Duration::from_secs(5));
//!
//! assert_eq!(buffer.ingest(SensorSample::new(accuracy::LOW, 1, 60.0)), IngestOutcome::Rejected);
//! assert!(buffer.latest().is_none());
//!
//! assert_eq!(buffer.ingest(SensorSample::new(accuracy::HIGH, 2, 72.0)), IngestOutcome::Accepted);
//! assert_eq!(buffer.latest().unwrap().value, 72.0);
//! ```

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use super::SensorSample;
use crate::config::SensorConfig;

/// What happened to an ingested sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Stored; now the latest sample.
    Accepted,
    /// Below the accuracy threshold.
    Rejected,
    /// Buffer was full; it has been cleared and ingestion paused.
    Reset,
    /// Dropped because a reset pause is in effect.
    Paused,
}

#[derive(Debug, Default)]
struct BufferState {
    samples: Vec<SensorSample>,
    paused_until: Option<Instant>,
}

/// Thread-safe sample buffer shared between the sensor and location paths.
#[derive(Debug)]
pub struct SampleBuffer {
    threshold: i32,
    capacity: usize,
    reset_delay: Duration,
    state: Mutex<BufferState>,
}

impl SampleBuffer {
    /// Creates an empty buffer.
    ///
    /// # Arguments
    ///
    /// * `threshold` - Minimum accuracy a sample needs to be retained
    /// * `capacity` - Maximum number of retained samples (at least 1)
    /// * `reset_delay` - Ingestion pause after a reset
    #[must_use]
    pub fn new(threshold: i32, capacity: usize, reset_delay: Duration) -> Self {
        Self {
            threshold,
            capacity: capacity.max(1),
            reset_delay,
            state: Mutex::new(BufferState::default()),
        }
    }

    /// Creates a buffer from the sensor section of the configuration.
    #[must_use]
    pub fn from_config(config: &SensorConfig) -> Self {
        Self::new(config.accuracy_threshold, config.capacity, config.reset_delay())
    }

    /// Offer a sample to the buffer.
    ///
    /// Never fails; the outcome is returned for observability and logged.
    pub fn ingest(&self, sample: SensorSample) -> IngestOutcome {
        let mut state = self.lock();

        if let Some(until) = state.paused_until {
            if Instant::now() < until {
                debug!("Sample dropped: ingestion paused after reset");
                return IngestOutcome::Paused;
            }
            state.paused_until = None;
            info!("Sample ingestion resumed");
        }

        if sample.accuracy < self.threshold {
            debug!(
                "Sample rejected: value {} accuracy {} below threshold {}",
                sample.value, sample.accuracy, self.threshold
            );
            return IngestOutcome::Rejected;
        }

        if state.samples.len() >= self.capacity {
            state.samples.clear();
            state.paused_until = Some(Instant::now() + self.reset_delay);
            info!(
                "Sample buffer reached {} samples; cleared and pausing ingestion for {:?}",
                self.capacity, self.reset_delay
            );
            return IngestOutcome::Reset;
        }

        state.samples.push(sample);
        debug!("Sample accepted: value {} accuracy {}", sample.value, sample.accuracy);
        IngestOutcome::Accepted
    }

    /// Most recently accepted sample, if any.
    pub fn latest(&self) -> Option<SensorSample> {
        self.lock().samples.last().copied()
    }

    /// Number of retained samples.
    pub fn len(&self) -> usize {
        self.lock().samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().samples.is_empty()
    }

    /// Whether a reset pause is currently in effect.
    pub fn is_paused(&self) -> bool {
        self.lock()
            .paused_until
            .map_or(false, |until| Instant::now() < until)
    }

    /// Drop all samples and any pending pause.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.samples.clear();
        state.paused_until = None;
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> MutexGuard<'_, BufferState> {
        // Samples are plain values; a panic elsewhere cannot leave them half-written
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
