//! In-process transport for tests and offline tooling.
//!
//! [`MemoryConnector`] never touches the network. Every dial produces a
//! [`MemoryTransport`] that records the frames sent through it; the test
//! drives the other side by calling [`MemoryTransport::open`],
//! [`MemoryTransport::inject`], [`MemoryTransport::remote_close`] or
//! [`MemoryTransport::fail`].

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use super::{ConnectionId, Connector, EventSender, Transport, TransportError, TransportEvent};
use crate::lock;

/// One side of an in-memory socket.
pub struct MemoryTransport {
    id: ConnectionId,
    host: String,
    events: EventSender,
    sent: Mutex<Vec<String>>,
    close_frame: Mutex<Option<(u16, String)>>,
    closed: AtomicBool,
}

impl MemoryTransport {
    pub fn new(id: ConnectionId, host: impl Into<String>, events: EventSender) -> Self {
        Self {
            id,
            host: host.into(),
            events,
            sent: Mutex::new(Vec::new()),
            close_frame: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Frames sent so far, oldest first.
    pub fn sent(&self) -> Vec<String> {
        lock(&self.sent).clone()
    }

    /// Drain the recorded frames.
    pub fn take_sent(&self) -> Vec<String> {
        std::mem::take(&mut *lock(&self.sent))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Code and reason of the close frame sent by the local side, if any.
    pub fn close_frame(&self) -> Option<(u16, String)> {
        lock(&self.close_frame).clone()
    }

    /// Report the handshake as complete.
    pub fn open(&self) {
        self.emit(TransportEvent::Open);
    }

    /// Deliver a text frame from the server.
    pub fn inject(&self, text: impl Into<String>) {
        if self.is_closed() {
            return;
        }
        self.emit(TransportEvent::Message(text.into()));
    }

    /// Server-initiated close handshake.
    pub fn remote_close(&self, code: u16, reason: &str) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.emit(TransportEvent::Closed {
            code,
            reason: reason.to_owned(),
        });
    }

    /// Break the socket (or fail the dial if it never opened).
    pub fn fail(&self, error: &str) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.emit(TransportEvent::Error(error.to_owned()));
    }

    fn emit(&self, event: TransportEvent) {
        // The receiver is gone once the owning event API is dropped.
        let _ = self.events.send((self.id, event));
    }
}

impl Transport for MemoryTransport {
    fn send(&self, text: String) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        lock(&self.sent).push(text);
        Ok(())
    }

    fn close(&self, code: u16, reason: &str) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        *lock(&self.close_frame) = Some((code, reason.to_owned()));
        self.emit(TransportEvent::Closed {
            code,
            reason: reason.to_owned(),
        });
    }
}

/// Connector handing out [`MemoryTransport`]s.
#[derive(Default)]
pub struct MemoryConnector {
    transports: Mutex<Vec<Arc<MemoryTransport>>>,
    auto_open: bool,
    refuse: AtomicU32,
    reject: AtomicU32,
}

impl MemoryConnector {
    /// Connector whose transports stay unopened until [`MemoryTransport::open`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Connector whose transports report `Open` as soon as they are dialed.
    pub fn auto_open() -> Self {
        Self {
            auto_open: true,
            ..Self::default()
        }
    }

    /// Let the next `n` dials start but fail before opening.
    pub fn refuse_next(&self, n: u32) {
        self.refuse.store(n, Ordering::Release);
    }

    /// Make the next `n` calls to [`Connector::connect`] return an error.
    pub fn reject_next(&self, n: u32) {
        self.reject.store(n, Ordering::Release);
    }

    /// Every transport dialed so far, in dial order.
    pub fn transports(&self) -> Vec<Arc<MemoryTransport>> {
        lock(&self.transports).clone()
    }

    /// Transport of the `index`-th dial.
    pub fn transport(&self, index: usize) -> Option<Arc<MemoryTransport>> {
        lock(&self.transports).get(index).cloned()
    }

    /// Transport with the given connection id.
    pub fn find(&self, id: ConnectionId) -> Option<Arc<MemoryTransport>> {
        lock(&self.transports).iter().find(|t| t.id == id).cloned()
    }

    pub fn dial_count(&self) -> usize {
        lock(&self.transports).len()
    }

    fn take_one(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Connector for MemoryConnector {
    fn connect(
        &self,
        host: &str,
        id: ConnectionId,
        events: EventSender,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        if Self::take_one(&self.reject) {
            return Err(TransportError::Connect(format!("dial to {host} rejected")));
        }

        let transport = Arc::new(MemoryTransport::new(id, host, events));
        lock(&self.transports).push(Arc::clone(&transport));

        if Self::take_one(&self.refuse) {
            transport.fail("connection refused");
        } else if self.auto_open {
            transport.open();
        }
        Ok(transport)
    }
}
