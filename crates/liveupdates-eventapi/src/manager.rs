//! Connection pool that shards subscriptions across sockets.
//!
//! [`EventApi`] is the entry point: callers subscribe to topics and connect
//! listeners to [`EventApi::signals`]. Each socket carries at most
//! `max_listens` subscriptions; when every open socket is full the
//! subscription waits in a backlog while one new socket is dialed. Sockets
//! that close or fail hand their subscriptions back to the pool.
//!
//! All transport events are handled on a single event loop task started by
//! [`EventApi::start`]. Without it, [`EventApi::process_pending`] drains the
//! queue synchronously.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::backoff::{BackoffConfig, ExponentialBackoff};
use crate::connection::{
    Connection, ConnectionConfig, ConnectionState, DEFAULT_HEARTBEAT_TIMEOUT, DEFAULT_MAX_LISTENS,
};
use crate::diagnostics::{Diagnostics, DiagnosticsSnapshot};
use crate::dispatch::{Dispatch, decode_events};
use crate::json::JsonExt;
use crate::lock;
use crate::message::{Hello, Opcode, parse_base_message};
use crate::signals::EventSignals;
use crate::subscription::{Subscription, SubscriptionType};
use crate::transport::{
    ConnectionId, Connector, EventReceiver, EventSender, TransportEvent, close_code, event_channel,
};

/// Public 7TV EventAPI endpoint.
pub const DEFAULT_HOST: &str = "wss://events.7tv.io/v3";

/// Settings for an [`EventApi`].
#[derive(Debug, Clone, PartialEq)]
pub struct EventApiConfig {
    /// WebSocket URL to dial.
    pub host: String,
    /// Heartbeat timeout until the server's Hello says otherwise.
    pub heartbeat_timeout: Duration,
    /// Subscriptions per socket.
    pub max_listens: usize,
    /// Delay policy for failed dials.
    pub backoff: BackoffConfig,
}

impl Default for EventApiConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
            max_listens: DEFAULT_MAX_LISTENS,
            backoff: BackoffConfig::default(),
        }
    }
}

impl EventApiConfig {
    fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            max_listens: self.max_listens,
            heartbeat_timeout: self.heartbeat_timeout,
        }
    }
}

/// Topics carried for one Twitch channel.
pub fn channel_subscriptions(twitch_id: &str) -> [Subscription; 3] {
    [
        Subscription::channel(SubscriptionType::CreateCosmetic, twitch_id),
        Subscription::channel(SubscriptionType::CreateEntitlement, twitch_id),
        Subscription::channel(SubscriptionType::DeleteEntitlement, twitch_id),
    ]
}

struct Pool {
    connections: BTreeMap<ConnectionId, Arc<Connection>>,
    backlog: VecDeque<Subscription>,
    /// Connection whose handshake is in flight. At most one at a time.
    dialing: Option<ConnectionId>,
    retry_pending: bool,
    backoff: ExponentialBackoff,
    users: HashSet<String>,
    emote_sets: HashSet<String>,
    channels: HashSet<String>,
    stopping: bool,
}

/// Client for the 7TV EventAPI.
pub struct EventApi {
    config: EventApiConfig,
    connector: Arc<dyn Connector>,
    pool: Mutex<Pool>,
    next_id: AtomicU64,
    diag: Arc<Diagnostics>,
    signals: EventSignals,
    events_tx: EventSender,
    events_rx: Mutex<Option<EventReceiver>>,
    shutdown: watch::Sender<bool>,
    this: Weak<EventApi>,
}

impl EventApi {
    pub fn new(config: EventApiConfig, connector: Arc<dyn Connector>) -> Arc<Self> {
        let (events_tx, events_rx) = event_channel();
        let (shutdown, _) = watch::channel(false);
        let backoff = ExponentialBackoff::new(config.backoff.clone());

        Arc::new_cyclic(|this| Self {
            config,
            connector,
            pool: Mutex::new(Pool {
                connections: BTreeMap::new(),
                backlog: VecDeque::new(),
                dialing: None,
                retry_pending: false,
                backoff,
                users: HashSet::new(),
                emote_sets: HashSet::new(),
                channels: HashSet::new(),
                stopping: false,
            }),
            next_id: AtomicU64::new(1),
            diag: Arc::new(Diagnostics::new()),
            signals: EventSignals::default(),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            shutdown,
            this: this.clone(),
        })
    }

    pub fn config(&self) -> &EventApiConfig {
        &self.config
    }

    /// Spawn the event loop on the current tokio runtime.
    ///
    /// Returns `None` if it already runs or there is no runtime.
    pub fn start(&self) -> Option<JoinHandle<()>> {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("EventApi::start called outside a tokio runtime");
            return None;
        };
        let events = lock(&self.events_rx).take()?;
        info!(host = %self.config.host, "Starting event API");
        Some(runtime.spawn(run_event_loop(
            self.this.clone(),
            events,
            self.shutdown.subscribe(),
        )))
    }

    /// Close every connection and end the event loop. Idempotent.
    pub fn stop(&self) {
        let connections = {
            let mut pool = lock(&self.pool);
            if pool.stopping {
                return;
            }
            pool.stopping = true;
            pool.backlog.clear();
            pool.dialing = None;
            std::mem::take(&mut pool.connections)
        };

        info!(connections = connections.len(), "Stopping event API");
        for conn in connections.values() {
            conn.close("Shutting down", close_code::NORMAL);
        }
        self.shutdown.send_replace(true);
    }

    /// Handle every queued transport event on the calling thread.
    ///
    /// Only usable before [`EventApi::start`]; returns the number of events
    /// handled.
    pub fn process_pending(&self) -> usize {
        let mut guard = lock(&self.events_rx);
        let Some(events) = guard.as_mut() else {
            return 0;
        };

        let mut handled = 0;
        while let Ok((id, event)) = events.try_recv() {
            self.handle_event(id, event);
            handled += 1;
        }
        handled
    }

    pub fn signals(&self) -> &EventSignals {
        &self.signals
    }

    pub fn diagnostics(&self) -> DiagnosticsSnapshot {
        self.diag.snapshot()
    }

    /// Pooled connections, including one still dialing.
    pub fn connection_count(&self) -> usize {
        lock(&self.pool).connections.len()
    }

    pub fn backlog_len(&self) -> usize {
        lock(&self.pool).backlog.len()
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        lock(&self.pool).connections.values().cloned().collect()
    }

    pub fn connection(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        lock(&self.pool).connections.get(&id).cloned()
    }

    /// Subscriptions joined on some connection.
    pub fn subscription_count(&self) -> usize {
        lock(&self.pool)
            .connections
            .values()
            .map(|conn| conn.len())
            .sum()
    }

    /// Whether `subscription` is joined or waiting in the backlog.
    pub fn is_subscribed(&self, subscription: &Subscription) -> bool {
        let pool = lock(&self.pool);
        pool.backlog.contains(subscription)
            || pool
                .connections
                .values()
                .any(|conn| conn.is_joined(subscription))
    }

    /// Subscribe to a topic on the first connection with room for it.
    pub fn subscribe(&self, subscription: Subscription) {
        let mut pool = lock(&self.pool);
        if pool.stopping {
            debug!(%subscription, "Ignoring subscribe while stopping");
            return;
        }
        self.subscribe_locked(&mut pool, subscription);
    }

    pub fn unsubscribe(&self, subscription: &Subscription) {
        let mut pool = lock(&self.pool);
        self.unsubscribe_locked(&mut pool, subscription);
    }

    /// Follow a user's connections and the emote set currently in use.
    /// Repeated calls with the same ids do nothing; empty ids are skipped.
    pub fn subscribe_user(&self, user_id: &str, emote_set_id: &str) {
        let mut pool = lock(&self.pool);
        if pool.stopping {
            return;
        }
        if !user_id.is_empty() && pool.users.insert(user_id.to_owned()) {
            self.subscribe_locked(
                &mut pool,
                Subscription::object(SubscriptionType::UpdateUser, user_id),
            );
        }
        if !emote_set_id.is_empty() && pool.emote_sets.insert(emote_set_id.to_owned()) {
            self.subscribe_locked(
                &mut pool,
                Subscription::object(SubscriptionType::UpdateEmoteSet, emote_set_id),
            );
        }
    }

    /// Follow cosmetics and entitlements in a Twitch channel.
    pub fn subscribe_twitch_channel(&self, twitch_id: &str) {
        let mut pool = lock(&self.pool);
        if pool.stopping || twitch_id.is_empty() || !pool.channels.insert(twitch_id.to_owned()) {
            return;
        }
        for subscription in channel_subscriptions(twitch_id) {
            self.subscribe_locked(&mut pool, subscription);
        }
    }

    pub fn unsubscribe_user(&self, user_id: &str) {
        let mut pool = lock(&self.pool);
        if pool.users.remove(user_id) {
            let subscription = Subscription::object(SubscriptionType::UpdateUser, user_id);
            self.unsubscribe_locked(&mut pool, &subscription);
        }
    }

    pub fn unsubscribe_emote_set(&self, emote_set_id: &str) {
        let mut pool = lock(&self.pool);
        if pool.emote_sets.remove(emote_set_id) {
            let subscription = Subscription::object(SubscriptionType::UpdateEmoteSet, emote_set_id);
            self.unsubscribe_locked(&mut pool, &subscription);
        }
    }

    pub fn unsubscribe_twitch_channel(&self, twitch_id: &str) {
        let mut pool = lock(&self.pool);
        if pool.channels.remove(twitch_id) {
            for subscription in channel_subscriptions(twitch_id) {
                self.unsubscribe_locked(&mut pool, &subscription);
            }
        }
    }

    fn subscribe_locked(&self, pool: &mut Pool, subscription: Subscription) {
        if pool.backlog.contains(&subscription)
            || pool
                .connections
                .values()
                .any(|conn| conn.is_joined(&subscription))
        {
            return;
        }

        for conn in pool.connections.values() {
            if conn.state() != ConnectionState::Connected {
                continue;
            }
            match conn.join(&subscription) {
                Ok(_) => return,
                Err(e) => trace!(id = %conn.id(), %subscription, "Join refused: {e}"),
            }
        }

        debug!(%subscription, "No connection with room, queueing");
        pool.backlog.push_back(subscription);
        self.add_client(pool);
    }

    fn unsubscribe_locked(&self, pool: &mut Pool, subscription: &Subscription) {
        pool.backlog.retain(|queued| queued != subscription);

        let owner = pool
            .connections
            .values()
            .find(|conn| conn.is_joined(subscription))
            .cloned();
        let Some(conn) = owner else {
            return;
        };

        conn.part(subscription);
        if conn.is_empty() {
            conn.close("No subscriptions left", close_code::NORMAL);
            pool.connections.remove(&conn.id());
        }
    }

    /// Dial one more connection if the backlog needs it and none is in flight.
    fn add_client(&self, pool: &mut Pool) {
        if pool.stopping || pool.dialing.is_some() || pool.retry_pending || pool.backlog.is_empty()
        {
            return;
        }

        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        match self
            .connector
            .connect(&self.config.host, id, self.events_tx.clone())
        {
            Ok(transport) => {
                let conn = Arc::new(Connection::new(
                    id,
                    transport,
                    &self.config.connection_config(),
                    Arc::clone(&self.diag),
                ));
                conn.start();
                pool.connections.insert(id, conn);
                pool.dialing = Some(id);
                info!(%id, host = %self.config.host, backlog = pool.backlog.len(), "Adding an additional client");
            }
            Err(e) => {
                warn!(%id, "Connect failed: {e}");
                self.diag.on_failed();
                self.schedule_retry(pool);
            }
        }
    }

    fn schedule_retry(&self, pool: &mut Pool) {
        if pool.stopping || pool.retry_pending || pool.backlog.is_empty() {
            return;
        }
        let Some(delay) = pool.backoff.next_delay() else {
            warn!(
                attempts = pool.backoff.attempts(),
                backlog = pool.backlog.len(),
                "Giving up on connecting"
            );
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No tokio runtime to schedule a reconnect on");
            return;
        };

        pool.retry_pending = true;
        info!(?delay, attempt = pool.backoff.attempts(), "Reconnecting after backoff");
        let this = self.this.clone();
        runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(api) = this.upgrade() {
                api.retry();
            }
        });
    }

    fn retry(&self) {
        let mut pool = lock(&self.pool);
        pool.retry_pending = false;
        self.add_client(&mut pool);
    }

    fn handle_event(&self, id: ConnectionId, event: TransportEvent) {
        match event {
            TransportEvent::Open => self.on_open(id),
            TransportEvent::Message(text) => self.on_message(id, &text),
            TransportEvent::Closed { code, reason } => self.on_closed(id, code, &reason),
            TransportEvent::Error(error) => self.on_error(id, &error),
        }
    }

    fn on_open(&self, id: ConnectionId) {
        let mut pool = lock(&self.pool);
        let Some(conn) = pool.connections.get(&id).cloned() else {
            debug!(%id, "Open for an evicted connection");
            return;
        };
        if pool.dialing == Some(id) {
            pool.dialing = None;
        }

        self.diag.on_opened();
        pool.backoff.reset();
        conn.on_open();

        while !conn.is_full() {
            let Some(subscription) = pool.backlog.pop_front() else {
                break;
            };
            if let Err(e) = conn.join(&subscription) {
                debug!(%id, %subscription, "Could not drain backlog: {e}");
                pool.backlog.push_front(subscription);
                break;
            }
        }
        debug!(%id, joined = conn.len(), backlog = pool.backlog.len(), "Backlog drained");

        self.add_client(&mut pool);
    }

    fn on_message(&self, id: ConnectionId, text: &str) {
        let Some(conn) = self.connection(id) else {
            trace!(%id, "Message for an evicted connection");
            return;
        };
        let Some(message) = parse_base_message(text) else {
            debug!(%id, "Unable to parse incoming event API message: {text}");
            return;
        };

        match message.opcode() {
            Some(Opcode::Hello) => {
                let hello: Hello = message.to_inner();
                conn.on_hello(&hello);
            }
            Some(Opcode::Heartbeat) => conn.handle_heartbeat(),
            Some(Opcode::Dispatch) => {
                let dispatch: Dispatch = message.to_inner();
                self.on_dispatch(&dispatch);
            }
            Some(Opcode::Reconnect) => {
                info!(%id, "Server requested a reconnect");
                conn.reconnecting("Reconnect requested");
            }
            Some(Opcode::Ack) => on_ack(&conn, &message.data),
            Some(Opcode::Error) => on_server_error(&conn, &message.data),
            Some(Opcode::EndOfStream) => {
                info!(%id, data = %message.data, "End of stream");
                conn.close("End of stream", close_code::NORMAL);
            }
            Some(op) => debug!(%id, ?op, "Unhandled opcode"),
            None => debug!(%id, op = message.op, "Unknown opcode"),
        }
    }

    fn on_dispatch(&self, dispatch: &Dispatch) {
        let decoded = decode_events(dispatch);
        for event in &decoded.events {
            let listeners = self.signals.emit(event);
            trace!(ty = %dispatch.ty, listeners, "Dispatched");
        }
        self.diag
            .on_dispatches(decoded.events.len(), decoded.dropped);
    }

    fn on_closed(&self, id: ConnectionId, code: u16, reason: &str) {
        let mut pool = lock(&self.pool);
        let Some(conn) = pool.connections.remove(&id) else {
            trace!(%id, code, "Close for an evicted connection");
            return;
        };

        if pool.dialing == Some(id) {
            pool.dialing = None;
            conn.on_transport_error(&format!("closed during handshake ({code} {reason})"));
            self.schedule_retry(&mut pool);
            return;
        }

        conn.on_transport_closed(code, reason);
        self.migrate(&mut pool, &conn);
    }

    fn on_error(&self, id: ConnectionId, error: &str) {
        let mut pool = lock(&self.pool);
        let Some(conn) = pool.connections.remove(&id) else {
            trace!(%id, error, "Error for an evicted connection");
            return;
        };

        conn.on_transport_error(error);
        if pool.dialing == Some(id) {
            pool.dialing = None;
            self.schedule_retry(&mut pool);
        } else {
            self.migrate(&mut pool, &conn);
        }
    }

    /// Resubscribe the topics of a dead connection elsewhere.
    fn migrate(&self, pool: &mut Pool, conn: &Connection) {
        let orphans = conn.take_subscriptions();
        if pool.stopping || orphans.is_empty() {
            return;
        }
        info!(id = %conn.id(), count = orphans.len(), "Resubscribing");
        for subscription in orphans {
            self.subscribe_locked(pool, subscription);
        }
    }
}

impl Drop for EventApi {
    fn drop(&mut self) {
        self.stop();
    }
}

fn on_ack(conn: &Connection, data: &Value) {
    let command = data.str_or_empty("command");
    let Some(subscription) = Subscription::from_json(data.field("data")) else {
        debug!(id = %conn.id(), command, "Ack without subscription");
        return;
    };
    if command.eq_ignore_ascii_case("subscribe") && !conn.acknowledge(&subscription) {
        debug!(id = %conn.id(), %subscription, "Ack for an unknown subscription");
    }
}

fn on_server_error(conn: &Connection, data: &Value) {
    warn!(id = %conn.id(), message = data.str_or_empty("message"), "EventAPI error");
    if let Some(subscription) = Subscription::from_json(data.field("data")) {
        if conn.reject(&subscription) {
            warn!(id = %conn.id(), %subscription, "Subscription rejected");
        }
    }
}

async fn run_event_loop(
    api: Weak<EventApi>,
    mut events: EventReceiver,
    mut shutdown: watch::Receiver<bool>,
) {
    if *shutdown.borrow() {
        return;
    }

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some((id, event)) = event else { break };
                let Some(api) = api.upgrade() else { break };
                api.handle_event(id, event);
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    debug!("Event loop finished");
}
