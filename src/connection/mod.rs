//! # Connection Module
//!
//! Owns the single broker session and exposes its state.
//!
//! ## State Mapping
//!
//! | Transport event | Connection state |
//! |-----------------|------------------|
//! | session opened | `Connecting` |
//! | `Connected` | `Connected` |
//! | `Reconnecting` | `Reconnecting` |
//! | `ConnectionLost` | `Disconnected` |
//! | `Closed` | `Disconnected` |
//! | open failure | `Error(message)` |
//!
//! Connection problems never surface as errors to callers; they are states.

pub mod mqtt;
pub mod transport;

use bytes::Bytes;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::BrokerConfig;
use crate::dispatch::{Dispatcher, Observable};
use crate::identity::DeviceIdentity;
use transport::{Session, Transport, TransportEvent};

/// Broker connection status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Reconnecting,
    Disconnected,
    Error(String),
}

impl ConnectionState {
    fn from_event(event: &TransportEvent) -> Self {
        match event {
            TransportEvent::Connected => Self::Connected,
            TransportEvent::Reconnecting { .. } => Self::Reconnecting,
            TransportEvent::ConnectionLost { .. } | TransportEvent::Closed => Self::Disconnected,
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connecting => write!(f, "Connecting..."),
            Self::Connected => write!(f, "Connected"),
            Self::Reconnecting => write!(f, "Reconnecting"),
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Error(message) => write!(f, "Error! {}", message),
        }
    }
}

/// Cleared when a session is retired; its forwarder stops reporting once it sees that.
type Gate = Arc<Mutex<bool>>;

struct ActiveSession {
    session: Arc<dyn Session>,
    forwarder: JoinHandle<()>,
    open: Gate,
}

impl ActiveSession {
    /// Stop reporting this session's events, then close it.
    fn retire(self) {
        *lock(&self.open) = false;
        self.forwarder.abort();
        self.session.close();
    }
}

/// Maintains at most one broker session.
pub struct ConnectionManager {
    config: BrokerConfig,
    transport: Arc<dyn Transport>,
    state: Observable<ConnectionState>,
    active: Mutex<Option<ActiveSession>>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("endpoint", &self.config.endpoint)
            .field("state", &self.state.get())
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    pub fn new(config: BrokerConfig, transport: Arc<dyn Transport>, dispatcher: Dispatcher) -> Self {
        Self {
            config,
            transport,
            state: Observable::new("connection", dispatcher),
            active: Mutex::new(None),
        }
    }

    /// Open a session authenticated as `identity`.
    ///
    /// Does nothing while a session is live. Failure to open is reported as
    /// [`ConnectionState::Error`].
    pub fn connect(&self, identity: &DeviceIdentity) {
        let mut active = self.active();
        if let Some(current) = active.take() {
            if self.is_live(&current) {
                debug!("Session already open; connect ignored");
                *active = Some(current);
                return;
            }
            current.retire();
        }

        self.state.set(ConnectionState::Connecting);
        match self.transport.open(identity) {
            Ok((session, events)) => {
                let open: Gate = Arc::new(Mutex::new(true));
                let forwarder = tokio::spawn(forward(events, self.state.clone(), Arc::clone(&open)));
                *active = Some(ActiveSession {
                    session,
                    forwarder,
                    open,
                });
            }
            Err(e) => {
                error!("Failed to open broker session: {}", e);
                self.state.set(ConnectionState::Error(e.to_string()));
            }
        }
    }

    /// Connection state stream.
    pub fn state(&self) -> &Observable<ConnectionState> {
        &self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state.get() == Some(ConnectionState::Connected)
    }

    /// Fire-and-forget QoS0 publish; never blocks and never fails.
    pub fn publish(&self, topic: &str, payload: Bytes) {
        let session = match self.active().as_ref() {
            Some(active) => Arc::clone(&active.session),
            None => {
                warn!("Not connected; dropping message for {}", topic);
                return;
            }
        };

        match session.try_publish(topic, payload) {
            Ok(()) => debug!("Message queued for {}", topic),
            Err(e) => error!("Publish to {} failed: {}", topic, e),
        }
    }

    /// Close the session and stop reporting its events.
    pub fn disconnect(&self) {
        let active = self.active().take();
        if let Some(active) = active {
            active.retire();
            info!("Disconnected from {}", self.config.endpoint);
        }

        if self.state.get() != Some(ConnectionState::Disconnected) {
            self.state.set(ConnectionState::Disconnected);
        }
    }

    fn is_live(&self, session: &ActiveSession) -> bool {
        !session.forwarder.is_finished()
            && !matches!(
                self.state.get(),
                Some(ConnectionState::Disconnected) | Some(ConnectionState::Error(_))
            )
    }

    fn active(&self) -> MutexGuard<'_, Option<ActiveSession>> {
        lock(&self.active)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn forward(
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    state: Observable<ConnectionState>,
    open: Gate,
) {
    while let Some(event) = events.recv().await {
        // Held across `set` so a retiring session cannot report after its final state
        let reporting = lock(&open);
        if !*reporting {
            break;
        }

        match &event {
            TransportEvent::Reconnecting { error: Some(e) } => debug!("Reconnecting: {}", e),
            TransportEvent::ConnectionLost { error: Some(e) } => warn!("Connection lost: {}", e),
            _ => {}
        }

        let next = ConnectionState::from_event(&event);
        info!("Connection status: {}", next);
        state.set(next);
    }
}
