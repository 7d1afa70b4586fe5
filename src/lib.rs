//! syncroom — a room-based relay server core for collaborative editing.
//!
//! Many clients edit shared documents over persistent binary connections
//! speaking the Yjs sync/awareness wire protocol. This crate owns the
//! server side of that arrangement: connection admission, per-document
//! rooms, buffering under backpressure, liveness, and shutdown.
//!
//! ```text
//!                      ┌────────────────────────────┐
//!  websocket ── ws ──► │  Server (admission)        │
//!                      │   auth gate ─ buffer       │
//!                      │   load gate ─ buffer       │
//!                      └──────────┬─────────────────┘
//!                                 │ attach
//!                      ┌──────────▼─────────────────┐
//!                      │  RoomRegistry              │
//!                      │   "notes" ► Room (doc +    │
//!                      │             awareness)     │──► DocStorage
//!                      └────────────────────────────┘
//! ```
//!
//! The transport is pluggable: [`ws::serve`] binds the core to
//! `tokio-tungstenite`, while [`connection::pair`] gives embedders (and
//! tests) a channel-level transport with no sockets involved.
//!
//! ```no_run
//! use syncroom::{ws, Server};
//!
//! #[tokio::main]
//! async fn main() -> std::io::Result<()> {
//!     let listener = tokio::net::TcpListener::bind("127.0.0.1:8000").await?;
//!     ws::serve(listener, Server::with_defaults()).await
//! }
//! ```

pub mod buffer;
pub mod connection;
pub mod keepalive;
pub mod protocol;
pub mod registry;
pub mod room;
pub mod server;
pub mod storage;
pub mod ws;

pub use connection::{ConnEvent, ConnHandle, ConnId, ConnState, Connection, Outgoing, Transport};
pub use protocol::{close_code, ProtocolError};
pub use registry::RoomRegistry;
pub use room::{LoadState, Room};
pub use server::{AuthGate, ConnectRequest, Server, ServerConfig};
pub use storage::{DocStorage, MemoryStore};
