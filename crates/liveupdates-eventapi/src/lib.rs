//! 7TV EventAPI client: subscriptions, dispatch decoding, heartbeat
//! supervision, and sharding of subscriptions across WebSocket connections.

pub mod backoff;
pub mod connection;
pub mod diagnostics;
pub mod dispatch;
pub mod json;
pub mod manager;
pub mod message;
pub mod signals;
pub mod subscription;
pub mod transport;

pub use backoff::{BackoffConfig, ExponentialBackoff};
pub use connection::{
    Connection, ConnectionConfig, ConnectionError, ConnectionState, ConnectionStateWatch,
    JoinOutcome, SubscriptionStatus,
};
pub use diagnostics::{Diagnostics, DiagnosticsSnapshot};
pub use dispatch::{
    CosmeticCreateDispatch, CosmeticKind, Decoded, Dispatch, EmoteAddDispatch,
    EmoteRemoveDispatch, EmoteUpdateDispatch, EntitlementCreateDeleteDispatch, Event,
    UserConnectionUpdateDispatch, decode_events,
};
pub use manager::{DEFAULT_HOST, EventApi, EventApiConfig};
pub use message::{Hello, Message, Opcode, parse_base_message};
pub use signals::{EventSignals, Listener, ListenerId, Signal};
pub use subscription::{Condition, Subscription, SubscriptionType};
pub use transport::memory::{MemoryConnector, MemoryTransport};
pub use transport::ws::WsConnector;
pub use transport::{ConnectionId, Connector, Transport, TransportError, TransportEvent};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a std mutex, recovering the data if a panicking holder poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
