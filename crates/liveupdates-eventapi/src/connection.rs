//! One EventAPI socket and the subscriptions it carries.
//!
//! A [`Connection`] owns a transport handle, the set of subscriptions joined
//! on it and the heartbeat bookkeeping. State changes are broadcast via a
//! [`watch`] channel so the watchdog and any observer can react without
//! polling. A connection never reconnects on its own; once it reaches
//! [`ConnectionState::Closed`] the manager moves its subscriptions elsewhere.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::diagnostics::Diagnostics;
use crate::lock;
use crate::message::Hello;
use crate::subscription::Subscription;
use crate::transport::{ConnectionId, Transport, TransportError, close_code};

/// Subscriptions one socket may carry.
pub const DEFAULT_MAX_LISTENS: usize = 100;

/// Heartbeat timeout used until the server's Hello arrives.
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(60);

/// Missed server heartbeats tolerated before the socket counts as dead.
pub const HEARTBEAT_TOLERANCE: u32 = 3;

const MIN_WATCHDOG_PERIOD: Duration = Duration::from_millis(10);

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Built, transport not yet dialing.
    Created,
    /// Transport is dialing.
    Starting,
    /// Handshake done, frames flow.
    Connected,
    /// The server asked us to move to another socket.
    Reconnecting,
    /// Terminal.
    Closed,
}

/// Observable connection state backed by a [`watch`] channel.
pub struct ConnectionStateWatch {
    tx: watch::Sender<ConnectionState>,
    rx: watch::Receiver<ConnectionState>,
}

impl Default for ConnectionStateWatch {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStateWatch {
    /// Create a new watch initialized to [`ConnectionState::Created`].
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(ConnectionState::Created);
        Self { tx, rx }
    }

    /// Move to `to` if the current state is one of `from`. `Closed` never
    /// transitions. Returns whether the state changed.
    pub fn transition(&self, from: &[ConnectionState], to: ConnectionState) -> bool {
        self.tx.send_if_modified(|state| {
            if *state != ConnectionState::Closed && *state != to && from.contains(state) {
                *state = to;
                true
            } else {
                false
            }
        })
    }

    /// Move to [`ConnectionState::Closed`]. Returns `true` only for the call
    /// that actually closed it.
    pub fn close(&self) -> bool {
        self.tx.send_if_modified(|state| {
            if *state == ConnectionState::Closed {
                false
            } else {
                *state = ConnectionState::Closed;
                true
            }
        })
    }

    /// Return a new subscriber receiver.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.rx.clone()
    }

    /// Return the current state without blocking.
    pub fn current(&self) -> ConnectionState {
        *self.rx.borrow()
    }
}

/// Server-side status of a joined subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStatus {
    /// Subscribe sent, no Ack yet.
    Pending,
    /// Acknowledged by the server.
    Active,
}

/// Successful result of [`Connection::join`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined,
    AlreadyJoined,
}

/// Why a subscription could not be joined on a connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("connection already carries {0} subscriptions")]
    Capacity(usize),
    #[error("connection is closed")]
    Closed,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Per-connection limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub max_listens: usize,
    /// Silence after which the socket is failed. Replaced by
    /// [`HEARTBEAT_TOLERANCE`] × the interval announced in Hello.
    pub heartbeat_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_listens: DEFAULT_MAX_LISTENS,
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
        }
    }
}

/// One socket to the EventAPI.
pub struct Connection {
    id: ConnectionId,
    transport: Arc<dyn Transport>,
    state: ConnectionStateWatch,
    subscriptions: Mutex<HashMap<Subscription, SubscriptionStatus>>,
    max_listens: usize,
    epoch: Instant,
    /// Milliseconds since `epoch`.
    last_heartbeat_ms: AtomicU64,
    heartbeat_timeout_ms: AtomicU64,
    diag: Arc<Diagnostics>,
}

impl Connection {
    pub fn new(
        id: ConnectionId,
        transport: Arc<dyn Transport>,
        config: &ConnectionConfig,
        diag: Arc<Diagnostics>,
    ) -> Self {
        Self {
            id,
            transport,
            state: ConnectionStateWatch::new(),
            subscriptions: Mutex::new(HashMap::new()),
            max_listens: config.max_listens,
            epoch: Instant::now(),
            last_heartbeat_ms: AtomicU64::new(0),
            heartbeat_timeout_ms: AtomicU64::new(duration_ms(config.heartbeat_timeout)),
            diag,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state.current()
    }

    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Mark the transport as dialing.
    pub fn start(&self) -> bool {
        self.state
            .transition(&[ConnectionState::Created], ConnectionState::Starting)
    }

    /// Handshake completed: reset the heartbeat clock and arm the watchdog.
    ///
    /// Returns `None` if the connection was not waiting to open or if there
    /// is no tokio runtime to run the watchdog on.
    pub fn on_open(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let opened = self.state.transition(
            &[ConnectionState::Created, ConnectionState::Starting],
            ConnectionState::Connected,
        );
        if !opened {
            return None;
        }
        self.handle_heartbeat();
        info!(id = %self.id, "Connection opened");

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => Some(runtime.spawn(watchdog(Arc::downgrade(self), self.state_watch()))),
            Err(_) => {
                debug!(id = %self.id, "No runtime, heartbeat watchdog disabled");
                None
            }
        }
    }

    /// Subscribe to `subscription` on this socket.
    pub fn join(&self, subscription: &Subscription) -> Result<JoinOutcome, ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }

        let mut subscriptions = lock(&self.subscriptions);
        if subscriptions.contains_key(subscription) {
            return Ok(JoinOutcome::AlreadyJoined);
        }
        if subscriptions.len() >= self.max_listens {
            return Err(ConnectionError::Capacity(self.max_listens));
        }

        self.transport.send(subscription.encode_subscribe())?;
        subscriptions.insert(subscription.clone(), SubscriptionStatus::Pending);
        debug!(id = %self.id, %subscription, "Subscribed");
        Ok(JoinOutcome::Joined)
    }

    /// Unsubscribe from `subscription`. The local entry is dropped even if
    /// the Unsubscribe frame cannot be sent.
    pub fn part(&self, subscription: &Subscription) -> bool {
        let removed = lock(&self.subscriptions).remove(subscription).is_some();
        if removed && !self.is_closed() {
            if let Err(e) = self.transport.send(subscription.encode_unsubscribe()) {
                debug!(id = %self.id, %subscription, "Unsubscribe not sent: {e}");
            }
        }
        removed
    }

    /// Server confirmed the subscription.
    pub fn acknowledge(&self, subscription: &Subscription) -> bool {
        match lock(&self.subscriptions).get_mut(subscription) {
            Some(status) => {
                *status = SubscriptionStatus::Active;
                true
            }
            None => false,
        }
    }

    /// Server refused the subscription.
    pub fn reject(&self, subscription: &Subscription) -> bool {
        lock(&self.subscriptions).remove(subscription).is_some()
    }

    pub fn is_joined(&self, subscription: &Subscription) -> bool {
        lock(&self.subscriptions).contains_key(subscription)
    }

    pub fn status(&self, subscription: &Subscription) -> Option<SubscriptionStatus> {
        lock(&self.subscriptions).get(subscription).copied()
    }

    pub fn len(&self) -> usize {
        lock(&self.subscriptions).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.subscriptions).is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.max_listens
    }

    pub fn max_listens(&self) -> usize {
        self.max_listens
    }

    pub fn subscriptions(&self) -> Vec<Subscription> {
        lock(&self.subscriptions).keys().cloned().collect()
    }

    /// Remove and return every subscription, for migration to another socket.
    pub(crate) fn take_subscriptions(&self) -> Vec<Subscription> {
        lock(&self.subscriptions)
            .drain()
            .map(|(subscription, _)| subscription)
            .collect()
    }

    fn now_ms(&self) -> u64 {
        duration_ms(self.epoch.elapsed())
    }

    /// Record a heartbeat from the server.
    pub fn handle_heartbeat(&self) {
        self.last_heartbeat_ms.store(self.now_ms(), Ordering::Release);
    }

    /// Time since the last heartbeat (or since open).
    pub fn heartbeat_age(&self) -> Duration {
        let last = self.last_heartbeat_ms.load(Ordering::Acquire);
        Duration::from_millis(self.now_ms().saturating_sub(last))
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms.load(Ordering::Acquire))
    }

    pub fn set_heartbeat_timeout(&self, timeout: Duration) {
        self.heartbeat_timeout_ms
            .store(duration_ms(timeout), Ordering::Release);
    }

    /// Apply the heartbeat period announced by the server.
    pub fn set_heartbeat_interval(&self, interval: Duration) {
        if interval.is_zero() {
            return;
        }
        self.set_heartbeat_timeout(interval.saturating_mul(HEARTBEAT_TOLERANCE));
    }

    pub(crate) fn on_hello(&self, hello: &Hello) {
        self.set_heartbeat_interval(Duration::from_millis(hello.heartbeat_interval_ms));
        self.handle_heartbeat();
        info!(
            id = %self.id,
            session = %hello.session_id,
            timeout = ?self.heartbeat_timeout(),
            "Hello received"
        );
    }

    /// Fail the connection if the server went quiet for longer than the
    /// heartbeat timeout. Returns `false` once the connection is closed.
    pub fn check_heartbeat(&self) -> bool {
        match self.state() {
            ConnectionState::Closed => return false,
            ConnectionState::Created | ConnectionState::Starting => return true,
            ConnectionState::Connected | ConnectionState::Reconnecting => {}
        }

        let age = self.heartbeat_age();
        let timeout = self.heartbeat_timeout();
        if age > timeout {
            warn!(id = %self.id, ?age, ?timeout, "Heartbeat timed out");
            self.fail("heartbeat timed out");
            return false;
        }
        true
    }

    /// Close cleanly. Only the first call has an effect.
    pub fn close(&self, reason: &str, code: u16) -> bool {
        if !self.state.close() {
            return false;
        }
        self.diag.on_closed();
        info!(id = %self.id, code, reason, "Closing connection");
        self.transport.close(code, reason);
        true
    }

    /// Close as a failure. Only the first call has an effect.
    pub fn fail(&self, reason: &str) -> bool {
        if !self.state.close() {
            return false;
        }
        self.diag.on_failed();
        warn!(id = %self.id, reason, "Connection failed");
        // No-op if the transport itself broke.
        self.transport.close(close_code::HEARTBEAT_TIMEOUT, reason);
        true
    }

    /// The transport reported a completed close handshake.
    pub(crate) fn on_transport_closed(&self, code: u16, reason: &str) -> bool {
        if !self.state.close() {
            return false;
        }
        self.diag.on_closed();
        info!(id = %self.id, code, reason, "Connection closed by server");
        true
    }

    /// The transport broke or the dial failed.
    pub(crate) fn on_transport_error(&self, error: &str) -> bool {
        if !self.state.close() {
            return false;
        }
        self.diag.on_failed();
        warn!(id = %self.id, error, "Transport error");
        true
    }

    /// The server asked us to reconnect.
    pub fn reconnecting(&self, reason: &str) -> bool {
        self.state.transition(
            &[ConnectionState::Starting, ConnectionState::Connected],
            ConnectionState::Reconnecting,
        );
        self.close(reason, close_code::GOING_AWAY)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("subscriptions", &self.len())
            .finish()
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Check the heartbeat every quarter timeout until the connection closes or
/// is dropped.
async fn watchdog(connection: Weak<Connection>, mut state: watch::Receiver<ConnectionState>) {
    loop {
        let period = match connection.upgrade() {
            Some(conn) => (conn.heartbeat_timeout() / 4).max(MIN_WATCHDOG_PERIOD),
            None => return,
        };

        tokio::select! {
            _ = tokio::time::sleep(period) => {
                let Some(conn) = connection.upgrade() else { return };
                if !conn.check_heartbeat() {
                    return;
                }
            }
            changed = state.changed() => {
                if changed.is_err() || *state.borrow() == ConnectionState::Closed {
                    return;
                }
            }
        }
    }
}
