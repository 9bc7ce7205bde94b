//! Fan-out of decoded events to registered listeners.
//!
//! Each event kind has its own [`Signal`]. Listeners are closures; every
//! registered listener is invoked for every event, in no particular order.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

use crate::dispatch::{
    CosmeticCreateDispatch, EmoteAddDispatch, EmoteRemoveDispatch, EmoteUpdateDispatch,
    EntitlementCreateDeleteDispatch, Event, UserConnectionUpdateDispatch,
};

/// Handle returned by [`Signal::connect`], used to disconnect the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

/// Receiver of one event kind.
pub trait Listener<T>: Send + Sync {
    fn notify(&self, value: &T);
}

/// Blanket implementation for closures.
impl<T, F> Listener<T> for F
where
    F: Fn(&T) + Send + Sync,
{
    fn notify(&self, value: &T) {
        self(value);
    }
}

/// Observer list for values of type `T`.
pub struct Signal<T> {
    listeners: DashMap<ListenerId, Arc<dyn Listener<T>>>,
    next_id: AtomicU64,
}

impl<T> Signal<T> {
    pub fn new() -> Self {
        Self {
            listeners: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a listener.
    pub fn connect<L: Listener<T> + 'static>(&self, listener: L) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.insert(id, Arc::new(listener));
        id
    }

    /// Remove a listener. Returns `false` if it was not registered.
    pub fn disconnect(&self, id: ListenerId) -> bool {
        self.listeners.remove(&id).is_some()
    }

    /// Deliver `value` to every listener and return how many were called.
    ///
    /// Listeners are snapshotted first, so a listener may connect or
    /// disconnect listeners on this signal while being notified.
    pub fn invoke(&self, value: &T) -> usize {
        let snapshot: Vec<Arc<dyn Listener<T>>> = self
            .listeners
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        for listener in &snapshot {
            listener.notify(value);
        }
        snapshot.len()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

impl<T> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// All signals exposed by the event API.
#[derive(Default)]
pub struct EventSignals {
    pub emote_added: Signal<EmoteAddDispatch>,
    pub emote_updated: Signal<EmoteUpdateDispatch>,
    pub emote_removed: Signal<EmoteRemoveDispatch>,
    pub user_updated: Signal<UserConnectionUpdateDispatch>,
    pub cosmetic_created: Signal<CosmeticCreateDispatch>,
    pub entitlement_created: Signal<EntitlementCreateDeleteDispatch>,
    pub entitlement_deleted: Signal<EntitlementCreateDeleteDispatch>,
}

impl EventSignals {
    /// Route an event to its signal.
    pub fn emit(&self, event: &Event) -> usize {
        match event {
            Event::EmoteAdded(e) => self.emote_added.invoke(e),
            Event::EmoteUpdated(e) => self.emote_updated.invoke(e),
            Event::EmoteRemoved(e) => self.emote_removed.invoke(e),
            Event::UserUpdated(e) => self.user_updated.invoke(e),
            Event::CosmeticCreated(e) => self.cosmetic_created.invoke(e),
            Event::EntitlementCreated(e) => self.entitlement_created.invoke(e),
            Event::EntitlementDeleted(e) => self.entitlement_deleted.invoke(e),
        }
    }
}
