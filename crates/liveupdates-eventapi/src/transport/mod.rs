//! Minimal transport interface consumed by the event API.
//!
//! A [`Connector`] dials a host and hands back a [`Transport`] handle
//! immediately. Everything that happens afterwards (handshake completed,
//! frames received, socket closed or broken) is reported asynchronously as a
//! [`TransportEvent`] tagged with the [`ConnectionId`] on a shared channel.
//!
//! Contract:
//! - `Open` is reported at most once, before any `Message`.
//! - `Error` is terminal; no `Closed` follows it.
//! - After [`Transport::close`] the transport eventually reports `Closed`.

pub mod memory;
pub mod ws;

use std::sync::Arc;

use tokio::sync::mpsc;

/// Unique identifier for a transport connection within one event API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// WebSocket close codes used by this crate.
pub mod close_code {
    /// Normal closure.
    pub const NORMAL: u16 = 1000;
    /// Endpoint going away (server-requested reconnect).
    pub const GOING_AWAY: u16 = 1001;
    /// Closed without a close frame.
    pub const ABNORMAL: u16 = 1006;
    /// Private-use code sent when no heartbeat arrived in time.
    pub const HEARTBEAT_TIMEOUT: u16 = 4000;
}

/// Something that happened on a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Handshake completed; frames may now be sent.
    Open,
    /// A text frame was received.
    Message(String),
    /// The connection closed with a close handshake (either side initiated).
    Closed { code: u16, reason: String },
    /// The dial failed or the socket broke.
    Error(String),
}

/// Sender half of the shared transport event channel.
pub type EventSender = mpsc::UnboundedSender<(ConnectionId, TransportEvent)>;
/// Receiver half of the shared transport event channel.
pub type EventReceiver = mpsc::UnboundedReceiver<(ConnectionId, TransportEvent)>;

/// Create the channel a connector reports transport events on.
pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Errors reported synchronously by transports and connectors.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The host is not a usable WebSocket URL.
    #[error("invalid url '{url}': {reason}")]
    InvalidUrl {
        /// The rejected URL.
        url: String,
        /// Why it was rejected.
        reason: String,
    },
    /// The connection is closed or closing.
    #[error("connection is closed")]
    Closed,
    /// The dial could not be started.
    #[error("connect failed: {0}")]
    Connect(String),
    /// A frame could not be handed to the socket.
    #[error("send failed: {0}")]
    Send(String),
}

/// Handle to one live socket.
pub trait Transport: Send + Sync {
    /// Queue a text frame.
    fn send(&self, text: String) -> Result<(), TransportError>;

    /// Start the close handshake. Calling this on a closed transport does nothing.
    fn close(&self, code: u16, reason: &str);
}

/// Opens transports.
pub trait Connector: Send + Sync {
    /// Start dialing `host`. Events for the new connection are sent on
    /// `events` tagged with `id`.
    fn connect(
        &self,
        host: &str,
        id: ConnectionId,
        events: EventSender,
    ) -> Result<Arc<dyn Transport>, TransportError>;
}
