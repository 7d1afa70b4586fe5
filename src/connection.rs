//! Channel-backed connection abstraction.
//!
//! The transport (a websocket, or a test double) sits on one side of a pair
//! of mpsc channels; the admission pipeline sits on the other:
//!
//! ```text
//! transport ── ConnEvent ──► Connection (admission task, sole consumer)
//! transport ◄── Outgoing ─── ConnHandle (cloned into rooms/watchdogs)
//! ```
//!
//! Inbound frames start queuing in the event channel the instant the pair is
//! created, so the admission pipeline can await authorization or a document
//! load without a single frame being lost — the ordering invariant lives in
//! the channel, not in careful listener registration.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Process-local connection identifier.
pub type ConnId = u64;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Connection lifecycle. Transitions are monotonic:
/// `New → Open → Closing → Closed` (states may be skipped, never revisited).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ConnState {
    New = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ConnState {
    fn from_u8(v: u8) -> ConnState {
        match v {
            0 => ConnState::New,
            1 => ConnState::Open,
            2 => ConnState::Closing,
            _ => ConnState::Closed,
        }
    }
}

/// Shared, monotonically advancing lifecycle cell.
#[derive(Debug, Clone)]
pub struct Lifecycle(Arc<AtomicU8>);

impl Lifecycle {
    fn new() -> Self {
        Lifecycle(Arc::new(AtomicU8::new(ConnState::New as u8)))
    }

    pub fn get(&self) -> ConnState {
        ConnState::from_u8(self.0.load(Ordering::SeqCst))
    }

    /// Advance to `state` unless the current state is already further along.
    pub fn advance(&self, state: ConnState) {
        self.0.fetch_max(state as u8, Ordering::SeqCst);
    }
}

/// Inbound transport event, delivered in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnEvent {
    /// A binary frame.
    Frame(Vec<u8>),
    /// A non-binary payload. The relay speaks a binary-only protocol, so
    /// this is a protocol violation wherever it is observed.
    NonBinary,
    /// Transport-level pong, consumed by the keep-alive watchdog.
    Pong,
    /// The transport is gone (peer close, error, or forced termination).
    Closed,
}

/// Outbound command consumed by the transport pump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    Frame(Vec<u8>),
    Ping,
    /// Graceful close with the given close code.
    Close(u16),
    /// Drop the socket without a close handshake.
    Terminate,
}

/// Cloneable sending/closing half of a connection.
///
/// Rooms, watchdogs, and the shutdown path hold these; only the admission
/// task holds the receiving [`Connection`].
#[derive(Debug, Clone)]
pub struct ConnHandle {
    id: ConnId,
    outgoing: mpsc::UnboundedSender<Outgoing>,
    lifecycle: Lifecycle,
}

impl ConnHandle {
    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn state(&self) -> ConnState {
        self.lifecycle.get()
    }

    /// True while the connection has not begun closing.
    pub fn is_up(&self) -> bool {
        self.lifecycle.get() <= ConnState::Open
    }

    /// Queue a binary frame. Silently dropped once the connection is
    /// closing — a departing peer is not an error for the sender.
    pub fn send(&self, frame: Vec<u8>) {
        if self.is_up() {
            let _ = self.outgoing.send(Outgoing::Frame(frame));
        }
    }

    /// Queue a transport-level ping.
    pub fn ping(&self) {
        if self.is_up() {
            let _ = self.outgoing.send(Outgoing::Ping);
        }
    }

    /// Graceful close with a close code. Idempotent.
    pub fn close(&self, code: u16) {
        if self.is_up() {
            self.lifecycle.advance(ConnState::Closing);
            let _ = self.outgoing.send(Outgoing::Close(code));
        }
    }

    /// Forced termination: no close handshake, the socket is dropped.
    pub fn terminate(&self) {
        if self.lifecycle.get() < ConnState::Closed {
            self.lifecycle.advance(ConnState::Closed);
            let _ = self.outgoing.send(Outgoing::Terminate);
        }
    }
}

/// The admission-task-owned half: a handle plus the sole inbound receiver.
pub struct Connection {
    pub(crate) handle: ConnHandle,
    pub(crate) events: mpsc::UnboundedReceiver<ConnEvent>,
}

impl Connection {
    pub fn handle(&self) -> &ConnHandle {
        &self.handle
    }

    pub fn id(&self) -> ConnId {
        self.handle.id
    }
}

/// The transport-owned half. A websocket pump (see [`crate::ws`]) or a test
/// double feeds events in and drains outgoing commands.
pub struct Transport {
    pub events: mpsc::UnboundedSender<ConnEvent>,
    pub outgoing: mpsc::UnboundedReceiver<Outgoing>,
    pub lifecycle: Lifecycle,
}

impl Transport {
    /// Deliver an inbound binary frame.
    pub fn recv_frame(&self, bytes: Vec<u8>) {
        let _ = self.events.send(ConnEvent::Frame(bytes));
    }

    /// Deliver an inbound non-binary payload.
    pub fn recv_non_binary(&self) {
        let _ = self.events.send(ConnEvent::NonBinary);
    }

    /// Deliver an inbound pong.
    pub fn recv_pong(&self) {
        let _ = self.events.send(ConnEvent::Pong);
    }

    /// The transport is gone: mark the lifecycle closed and notify the
    /// admission task. Safe to call more than once.
    pub fn peer_closed(&self) {
        self.lifecycle.advance(ConnState::Closed);
        let _ = self.events.send(ConnEvent::Closed);
    }

    pub fn mark_open(&self) {
        self.lifecycle.advance(ConnState::Open);
    }

    /// Next outbound command, or `None` once every handle is dropped.
    pub async fn next_outgoing(&mut self) -> Option<Outgoing> {
        self.outgoing.recv().await
    }
}

/// Create a connected (admission half, transport half) pair.
pub fn pair() -> (Connection, Transport) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let lifecycle = Lifecycle::new();
    let handle = ConnHandle {
        id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
        outgoing: out_tx,
        lifecycle: lifecycle.clone(),
    };
    (
        Connection {
            handle,
            events: event_rx,
        },
        Transport {
            events: event_tx,
            outgoing: out_rx,
            lifecycle,
        },
    )
}
