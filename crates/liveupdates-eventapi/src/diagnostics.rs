//! Connection and dispatch counters.
//!
//! Counters are shared between the manager and every connection it owns and
//! are bumped exactly once per lifecycle transition, so tests and debug
//! overlays can assert on them.

use std::sync::atomic::{AtomicU64, Ordering};

/// Lifetime counters for one event API instance.
#[derive(Debug, Default)]
pub struct Diagnostics {
    pub(crate) connections_opened: AtomicU64,
    pub(crate) connections_closed: AtomicU64,
    pub(crate) connections_failed: AtomicU64,
    pub(crate) dispatches_delivered: AtomicU64,
    pub(crate) dispatches_dropped: AtomicU64,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn on_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn on_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn on_failed(&self) {
        self.connections_failed.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn on_dispatches(&self, delivered: usize, dropped: usize) {
        self.dispatches_delivered
            .fetch_add(delivered as u64, Ordering::Relaxed);
        self.dispatches_dropped
            .fetch_add(dropped as u64, Ordering::Relaxed);
    }

    /// Produce an immutable snapshot of the counters.
    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            connections_opened: self.connections_opened.load(Ordering::Acquire),
            connections_closed: self.connections_closed.load(Ordering::Acquire),
            connections_failed: self.connections_failed.load(Ordering::Acquire),
            dispatches_delivered: self.dispatches_delivered.load(Ordering::Relaxed),
            dispatches_dropped: self.dispatches_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`Diagnostics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiagnosticsSnapshot {
    /// Sockets that completed the handshake.
    pub connections_opened: u64,
    /// Sockets closed cleanly (locally or by the server).
    pub connections_closed: u64,
    /// Failed connection attempts, transport errors and heartbeat timeouts.
    pub connections_failed: u64,
    /// Validated events handed to the signals.
    pub dispatches_delivered: u64,
    /// Events dropped by validation.
    pub dispatches_dropped: u64,
}
