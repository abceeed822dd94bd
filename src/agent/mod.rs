//! # Telemetry Agent
//!
//! Wires identity, connection, sample buffering and fix joining together.
//!
//! ## Data Flow
//!
//! ```text
//! sensor events --filter kind--> SampleBuffer
//!                                     |
//! location fixes ---------------> FixJoiner --payload--> ConnectionManager::publish
//!
//! IdentityStore --identity ready--> ConnectionManager::connect
//! ```
//!
//! Sensor events and location fixes are consumed on separate tasks so a slow
//! publish path never delays sample ingestion.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::connection::ConnectionManager;
use crate::dispatch::Subscription;
use crate::error::{Result, TelemetryError};
use crate::identity::{DeviceIdentity, IdentityStore, Resolution};
use crate::sensor::buffer::{IngestOutcome, SampleBuffer};
use crate::sensor::{LocationFix, RawSensorEvent};
use crate::telemetry::device_os_label;
use crate::telemetry::joiner::FixJoiner;
use crate::telemetry::timestamp::Clock;

/// Host-side event streams feeding the agent.
#[derive(Debug)]
pub struct EventSources {
    pub samples: mpsc::Receiver<RawSensorEvent>,
    pub fixes: mpsc::Receiver<LocationFix>,
}

/// Long-running telemetry pipeline for one device.
pub struct TelemetryAgent {
    config: Config,
    identity: Arc<IdentityStore>,
    connection: Arc<ConnectionManager>,
    buffer: Arc<SampleBuffer>,
    clock: Arc<dyn Clock>,
    subscriptions: Vec<Subscription>,
    tasks: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for TelemetryAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryAgent")
            .field("running", &self.is_running())
            .field("connection", &self.connection)
            .finish_non_exhaustive()
    }
}

impl TelemetryAgent {
    pub fn new(
        config: Config,
        identity: Arc<IdentityStore>,
        connection: Arc<ConnectionManager>,
        buffer: Arc<SampleBuffer>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            identity,
            connection,
            buffer,
            clock,
            subscriptions: Vec::new(),
            tasks: Vec::new(),
        }
    }

    /// Start the pipeline.
    ///
    /// Connects as soon as the identity is ready (immediately when a
    /// credential is persisted, otherwise after background issuance) and
    /// begins consuming `sources`.
    ///
    /// # Errors
    ///
    /// Returns error if the device ID or keystore cannot be read or written.
    pub fn start(&mut self, sources: EventSources) -> Result<()> {
        if self.is_running() {
            debug!("Agent already running");
            return Ok(());
        }

        match self.identity.resolve()? {
            Resolution::Ready(identity) => info!("Device {} ready", identity.device_id),
            Resolution::Issuing(_) => info!("Waiting for certificate issuance"),
            Resolution::InProgress => info!("Certificate issuance already in progress"),
        }

        let device_id = self.identity.device_id().ok_or_else(|| {
            TelemetryError::Identity("Device ID unavailable after resolve".to_string())
        })?;

        // Replays an identity that is already ready
        let connection = Arc::clone(&self.connection);
        self.subscriptions.push(
            self.identity
                .identity()
                .subscribe(move |identity: &DeviceIdentity| connection.connect(identity)),
        );
        let device_os = device_os_label(&self.config.device.os_name, &self.config.device.os_release);
        let joiner = FixJoiner::with_clock(
            device_id,
            device_os,
            self.config.telemetry.timestamp_format,
            Arc::clone(&self.clock),
        );
        info!("Publishing as {:?}", joiner);

        self.tasks.push(tokio::spawn(consume_samples(
            sources.samples,
            Arc::clone(&self.buffer),
            self.config.sensor.kind,
        )));
        self.tasks.push(tokio::spawn(consume_fixes(
            sources.fixes,
            joiner,
            Arc::clone(&self.buffer),
            Arc::clone(&self.connection),
            self.config.broker.topic.clone(),
        )));

        Ok(())
    }

    /// Wait until both event streams have ended and every queued event is handled.
    ///
    /// The streams end once all of their senders are dropped.
    pub async fn drain(&mut self) {
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                error!("Event consumer failed: {}", e);
            }
        }
        debug!("Event consumers drained");
    }

    /// Stop consuming events, drop listeners and close the broker session.
    pub fn stop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.subscriptions.clear();
        self.connection.disconnect();
        info!("Agent stopped");
    }

    pub fn is_running(&self) -> bool {
        self.tasks.iter().any(|task| !task.is_finished())
    }
}

async fn consume_samples(
    mut samples: mpsc::Receiver<RawSensorEvent>,
    buffer: Arc<SampleBuffer>,
    kind: crate::sensor::SensorKind,
) {
    while let Some(event) = samples.recv().await {
        if event.sensor != kind {
            continue;
        }
        let Some(sample) = event.to_sample() else {
            debug!("Sensor event without values ignored");
            continue;
        };

        match buffer.ingest(sample) {
            IngestOutcome::Accepted => debug!("Sample {} accepted", sample.value),
            IngestOutcome::Reset => info!("Sample buffer full; cleared and paused"),
            IngestOutcome::Rejected | IngestOutcome::Paused => {}
        }
    }
    debug!("Sensor event stream ended");
}

async fn consume_fixes(
    mut fixes: mpsc::Receiver<LocationFix>,
    joiner: FixJoiner,
    buffer: Arc<SampleBuffer>,
    connection: Arc<ConnectionManager>,
    topic: String,
) {
    while let Some(fix) = fixes.recv().await {
        let Some(record) = joiner.on_fix(&fix, &buffer) else {
            continue;
        };

        match record.to_payload() {
            Ok(payload) => connection.publish(&topic, payload),
            Err(e) => error!("Failed to encode telemetry record: {}", e),
        }
    }
    debug!("Location fix stream ended");
}
