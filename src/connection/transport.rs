//! Transport seam between the connection manager and a concrete broker client

use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::identity::DeviceIdentity;

/// Lifecycle events reported by a transport session.
///
/// A session is connecting from the moment it opens, so there is no event for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected,
    Reconnecting { error: Option<String> },
    ConnectionLost { error: Option<String> },
    /// Session closed on request.
    Closed,
}

/// Factory for broker sessions.
pub trait Transport: Send + Sync {
    /// Open a session authenticated as `identity`.
    ///
    /// The returned receiver carries the session's lifecycle events; it
    /// closes when the session ends.
    fn open(
        &self,
        identity: &DeviceIdentity,
    ) -> Result<(Arc<dyn Session>, mpsc::UnboundedReceiver<TransportEvent>)>;
}

/// An open broker session.
pub trait Session: Send + Sync {
    /// Queue a fire-and-forget publish without waiting for the network.
    fn try_publish(&self, topic: &str, payload: Bytes) -> Result<()>;

    /// Request an orderly close.
    fn close(&self);
}
