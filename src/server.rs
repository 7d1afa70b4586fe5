//! The relay server: admission pipeline, steady-state relay, shutdown.
//!
//! Every connection travels the same pipeline:
//!
//! ```text
//! admit ─► closed? ─► [buffer ≤ pre-auth ceiling | auth gate]
//!             │
//!             ├─► doc name ─► room lookup ─► [buffer ≤ ceiling | load gate]
//!             │
//!             └─► attach ─► replay backlog ─► live relay ─► detach/reap
//! ```
//!
//! The buffering phases share one backlog, so a frame that arrived before
//! authorization resolved is replayed into the room ahead of anything that
//! arrived after — arrival order is the only order.

use crate::buffer::{buffer_until, BufferVerdict, FrameBacklog};
use crate::connection::{ConnEvent, ConnHandle, Connection};
use crate::keepalive::Watchdog;
use crate::protocol::close_code;
use crate::registry::RoomRegistry;
use crate::room::{LoadState, Room};
use crate::storage::DocStorage;
use futures_util::future::BoxFuture;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use yrs::Doc;

/// Authorization gate: resolves `Ok(true)` to admit, `Ok(false)` to deny
/// quietly, `Err` on gate failure (the connection is then terminated).
pub type AuthGate = BoxFuture<'static, Result<bool, String>>;

/// What the server knows about a connection attempt before admitting it.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    /// Request path of the websocket upgrade, e.g. `/notes/weekly`.
    pub path: String,
}

impl ConnectRequest {
    pub fn new(path: impl Into<String>) -> Self {
        ConnectRequest { path: path.into() }
    }
}

/// Default document-name extraction: the first non-empty path segment,
/// so `/notes/weekly` and `/notes` both map to the document `notes`.
pub fn first_path_segment(req: &ConnectRequest) -> Option<String> {
    req.path
        .split('/')
        .find(|segment| !segment.is_empty())
        .map(str::to_string)
}

pub struct ServerConfig {
    /// Builds the backing document for a new room.
    pub doc_factory: Arc<dyn Fn() -> Doc + Send + Sync>,
    /// Optional persistence backend shared by all rooms.
    pub storage: Option<Arc<dyn DocStorage>>,
    /// Maps a connect request to a document name; `None` rejects the
    /// connection as unsupported.
    pub doc_name: Arc<dyn Fn(&ConnectRequest) -> Option<String> + Send + Sync>,
    /// Keep-alive ping interval; a peer silent for two intervals is
    /// terminated.
    pub keepalive_interval: Duration,
    /// Byte ceiling for frames buffered while authorization is pending.
    pub max_buffered_bytes_before_auth: usize,
    /// Byte ceiling for frames buffered across the whole admission.
    pub max_buffered_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            doc_factory: Arc::new(Doc::new),
            storage: None,
            doc_name: Arc::new(first_path_segment),
            keepalive_interval: Duration::from_secs(30),
            max_buffered_bytes_before_auth: 5 * 1024 * 1024,
            max_buffered_bytes: 100 * 1024 * 1024,
        }
    }
}

struct ServerInner {
    config: ServerConfig,
    rooms: RoomRegistry,
    closed: AtomicBool,
}

/// Cheaply cloneable handle to one relay server instance.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Server {
            inner: Arc::new(ServerInner {
                config,
                rooms: RoomRegistry::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn with_defaults() -> Self {
        Server::new(ServerConfig::default())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub async fn room_count(&self) -> usize {
        self.inner.rooms.len().await
    }

    pub async fn room(&self, name: &str) -> Option<Arc<Room>> {
        self.inner.rooms.get(name).await
    }

    pub async fn room_names(&self) -> Vec<String> {
        self.inner.rooms.names().await
    }

    /// Admit a connection: spawns its pipeline task and returns at once.
    /// `auth` of `None` means the connection is pre-authorized.
    pub fn admit(&self, conn: Connection, request: ConnectRequest, auth: Option<AuthGate>) {
        let server = self.clone();
        tokio::spawn(async move {
            server.run_connection(conn, request, auth).await;
        });
    }

    async fn run_connection(&self, conn: Connection, request: ConnectRequest, auth: Option<AuthGate>) {
        let Connection { handle, mut events } = conn;
        if self.is_closed() {
            log::debug!("connection {}: server is closed, rejecting", handle.id());
            handle.close(close_code::NORMAL);
            return;
        }
        if !handle.is_up() {
            return;
        }

        let config = &self.inner.config;
        let mut backlog = FrameBacklog::new();

        // Authorization gate. Frames buffer under the tighter pre-auth
        // ceiling until the caller's verdict lands.
        let gate: AuthGate = match auth {
            Some(gate) => gate,
            None => Box::pin(async { Ok(true) }),
        };
        match buffer_until(
            &mut events,
            &mut backlog,
            config.max_buffered_bytes_before_auth,
            gate,
        )
        .await
        {
            BufferVerdict::Gate(true) => {}
            // Denied: stop silently. The authorizer owns the socket's fate
            // (it typically closes with an application-specific code).
            BufferVerdict::Gate(false) => {
                log::debug!("connection {}: authorization denied", handle.id());
                return;
            }
            BufferVerdict::GateError(e) => {
                log::error!("connection {}: authorization gate failed: {e}", handle.id());
                handle.terminate();
                return;
            }
            BufferVerdict::ConnectionClosed => return,
            BufferVerdict::NonBinary => {
                log::warn!(
                    "connection {}: non-binary payload during authorization",
                    handle.id()
                );
                handle.terminate();
                return;
            }
            BufferVerdict::Overflow { buffered, ceiling } => {
                log::warn!(
                    "connection {}: {buffered} bytes buffered against a pre-auth ceiling of {ceiling}, terminating",
                    handle.id()
                );
                handle.terminate();
                return;
            }
        }

        // Document name. No name, no service.
        let Some(doc_name) = (config.doc_name)(&request) else {
            log::warn!(
                "connection {}: no document name in request path {:?}",
                handle.id(),
                request.path
            );
            handle.close(close_code::UNSUPPORTED);
            return;
        };

        // Room lookup and load gate. Looped because a room can be reaped
        // between its load resolving and our attach; then we start over
        // with a fresh room.
        let room = loop {
            let room = self
                .inner
                .rooms
                .get_or_create(&doc_name, config.doc_factory.as_ref(), config.storage.clone())
                .await;
            let load_gate = {
                let room = room.clone();
                async move { Ok(room.await_loaded().await) }
            };
            let verdict = buffer_until(
                &mut events,
                &mut backlog,
                config.max_buffered_bytes,
                load_gate,
            )
            .await;
            match verdict {
                BufferVerdict::Gate(LoadState::Ready) => {
                    if room.attach(handle.clone()).await {
                        room.release_pending();
                        break room;
                    }
                    room.release_pending();
                    continue;
                }
                BufferVerdict::Gate(_) => {
                    log::error!(
                        "connection {}: document '{doc_name}' failed to load",
                        handle.id()
                    );
                    room.release_pending();
                    handle.close(close_code::INTERNAL_ERROR);
                    self.reap_if_empty(&doc_name).await;
                    return;
                }
                BufferVerdict::GateError(e) => {
                    log::error!(
                        "connection {}: load gate for '{doc_name}' failed: {e}",
                        handle.id()
                    );
                    room.release_pending();
                    handle.close(close_code::INTERNAL_ERROR);
                    self.reap_if_empty(&doc_name).await;
                    return;
                }
                BufferVerdict::ConnectionClosed => {
                    room.release_pending();
                    self.reap_if_empty(&doc_name).await;
                    return;
                }
                BufferVerdict::NonBinary => {
                    log::warn!(
                        "connection {}: non-binary payload during document load",
                        handle.id()
                    );
                    room.release_pending();
                    handle.terminate();
                    self.reap_if_empty(&doc_name).await;
                    return;
                }
                BufferVerdict::Overflow { buffered, ceiling } => {
                    log::warn!(
                        "connection {}: {buffered} bytes buffered against a ceiling of {ceiling}, terminating",
                        handle.id()
                    );
                    room.release_pending();
                    handle.terminate();
                    self.reap_if_empty(&doc_name).await;
                    return;
                }
            }
        };

        self.relay(room, handle, events, backlog, &doc_name).await;
    }

    /// Steady state: replay the admission backlog, then relay live frames
    /// until the connection goes away or misbehaves.
    async fn relay(
        &self,
        room: Arc<Room>,
        handle: ConnHandle,
        mut events: mpsc::UnboundedReceiver<ConnEvent>,
        mut backlog: FrameBacklog,
        doc_name: &str,
    ) {
        log::info!(
            "connection {} joined room '{doc_name}' ({} buffered frames to replay)",
            handle.id(),
            backlog.len()
        );
        let watchdog = Watchdog::start(handle.clone(), self.inner.config.keepalive_interval);

        let mut protocol_failure = None;
        for frame in backlog.take_frames() {
            if let Err(e) = room.handle_frame(&handle, &frame).await {
                protocol_failure = Some(e);
                break;
            }
        }

        if protocol_failure.is_none() {
            loop {
                match events.recv().await {
                    Some(ConnEvent::Frame(data)) => {
                        if let Err(e) = room.handle_frame(&handle, &data).await {
                            protocol_failure = Some(e);
                            break;
                        }
                    }
                    Some(ConnEvent::Pong) => watchdog.pong_received(),
                    Some(ConnEvent::NonBinary) => {
                        log::warn!("connection {}: non-binary payload", handle.id());
                        handle.close(close_code::UNSUPPORTED);
                        break;
                    }
                    Some(ConnEvent::Closed) | None => break,
                }
            }
        }

        if let Some(e) = protocol_failure {
            log::warn!(
                "connection {}: protocol error in room '{doc_name}': {e}",
                handle.id()
            );
            handle.close(close_code::UNSUPPORTED);
        }

        watchdog.stop();
        let remaining = room.detach(handle.id()).await;
        log::info!(
            "connection {} left room '{doc_name}' ({remaining} remaining)",
            handle.id()
        );
        if remaining == 0 {
            if self.is_closed() {
                // The registry is already cleared during shutdown; destroy
                // directly so a dirty document still gets stored.
                room.destroy().await;
            } else {
                self.reap_if_empty(doc_name).await;
            }
        }
    }

    async fn reap_if_empty(&self, name: &str) {
        if let Some(room) = self.inner.rooms.remove_if_empty(name).await {
            room.destroy().await;
            log::debug!("room '{name}' reaped");
        }
    }

    /// Shut the server down: refuse new admissions, gracefully close every
    /// attached connection with `code`, and clear the registry. Stragglers
    /// that have not finished the close handshake after `terminate_after`
    /// are forcibly terminated. Idempotent; later calls do nothing.
    pub async fn close(&self, code: u16, terminate_after: Option<Duration>) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let rooms = self.inner.rooms.clear().await;
        let mut handles = Vec::new();
        for room in &rooms {
            handles.extend(room.close_all(code).await);
        }
        log::info!(
            "server closing: {} rooms, {} connections notified",
            rooms.len(),
            handles.len()
        );
        if let Some(grace) = terminate_after {
            tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                for handle in handles {
                    handle.terminate();
                }
            });
        }
    }
}
