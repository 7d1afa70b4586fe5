//! Per-document rooms.
//!
//! A room owns one shared document (wrapped in its awareness state), the
//! set of attached connections, and the knowledge of which awareness client
//! ids each connection controls. All mutation funnels through one async
//! mutex, so every connection observes updates in a single global order.
//!
//! ```text
//!            ┌──────────────── Room ────────────────┐
//! frame ───► │ decode → apply to doc/awareness      │ ──► broadcast
//!            │ dirty tracking, controlled-id map    │
//!            └──────────┬───────────────────────────┘
//!                       │ load once / store once
//!                       ▼
//!                  DocStorage
//! ```

use crate::connection::{ConnHandle, ConnId};
use crate::protocol::{self, ProtocolError};
use crate::storage::DocStorage;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use yrs::block::ClientID;
use yrs::sync::{Awareness, AwarenessUpdate, Message, SyncMessage};
use yrs::updates::decoder::Decode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

/// Progress of the one-shot document load that runs at room creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    Loading,
    Ready,
    Failed,
}

struct RoomConn {
    handle: ConnHandle,
    /// Awareness client ids this connection has asserted state for.
    client_ids: HashSet<ClientID>,
}

struct RoomState {
    awareness: Awareness,
    conns: HashMap<ConnId, RoomConn>,
    /// Set on every applied document update, cleared only by destruction.
    dirty: bool,
    destroyed: bool,
}

pub struct Room {
    name: String,
    state: Mutex<RoomState>,
    load: watch::Receiver<LoadState>,
    storage: Option<Arc<dyn DocStorage>>,
    /// Admissions that hold an `Arc` to this room but are not yet attached.
    /// Guards the room against being reaped out from under them.
    pending: AtomicUsize,
}

impl Room {
    /// Create a room around a fresh document. When a storage backend is
    /// present the document load is spawned here, exactly once; the result
    /// is published through the load watch channel.
    pub(crate) fn create(
        name: String,
        doc: Doc,
        storage: Option<Arc<dyn DocStorage>>,
    ) -> Arc<Room> {
        let initial = if storage.is_some() {
            LoadState::Loading
        } else {
            LoadState::Ready
        };
        let (load_tx, load_rx) = watch::channel(initial);
        let room = Arc::new(Room {
            name,
            state: Mutex::new(RoomState {
                awareness: Awareness::new(doc),
                conns: HashMap::new(),
                dirty: false,
                destroyed: false,
            }),
            load: load_rx,
            storage: storage.clone(),
            pending: AtomicUsize::new(0),
        });

        if let Some(store) = storage {
            let room = room.clone();
            tokio::spawn(async move {
                let doc = room.state.lock().await.awareness.doc().clone();
                let outcome = store.load_doc(&room.name, &doc).await;
                let state = match outcome {
                    Ok(()) => {
                        log::debug!("room '{}': document loaded", room.name);
                        LoadState::Ready
                    }
                    Err(e) => {
                        log::error!("room '{}': document load failed: {e}", room.name);
                        LoadState::Failed
                    }
                };
                let _ = load_tx.send(state);
            });
        }
        room
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn load_state(&self) -> LoadState {
        *self.load.borrow()
    }

    /// Wait until the document load has resolved one way or the other.
    pub async fn await_loaded(&self) -> LoadState {
        let mut load = self.load.clone();
        loop {
            let state = *load.borrow_and_update();
            if state != LoadState::Loading {
                return state;
            }
            if load.changed().await.is_err() {
                return *load.borrow();
            }
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.state.lock().await.conns.len()
    }

    /// Whole-document snapshot as a v1 update.
    pub async fn encode_state(&self) -> Vec<u8> {
        let st = self.state.lock().await;
        let update = st
            .awareness
            .doc()
            .transact()
            .encode_state_as_update_v1(&StateVector::default());
        update
    }

    pub(crate) fn hold_pending(&self) {
        self.pending.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn release_pending(&self) {
        self.pending.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Attach a connection and send it the bootstrap sequence: SyncStep1
    /// with the document's state vector, then the current awareness states
    /// if there are any. Returns `false` if the room was destroyed before
    /// the attach, in which case the caller must look the room up again.
    pub(crate) async fn attach(&self, handle: ConnHandle) -> bool {
        let mut st = self.state.lock().await;
        if st.destroyed {
            return false;
        }
        handle.send(protocol::sync_step1(st.awareness.doc()));
        match st.awareness.update() {
            Ok(update) => {
                if !update.clients.is_empty() {
                    handle.send(protocol::awareness_frame(update));
                }
            }
            Err(e) => {
                log::warn!(
                    "room '{}': failed to encode awareness snapshot: {e}",
                    self.name
                );
            }
        }
        st.conns.insert(
            handle.id(),
            RoomConn {
                handle,
                client_ids: HashSet::new(),
            },
        );
        true
    }

    /// Remove a connection, retracting every awareness client id it
    /// controlled. Returns how many connections remain attached.
    pub(crate) async fn detach(&self, id: ConnId) -> usize {
        let mut st = self.state.lock().await;
        if let Some(conn) = st.conns.remove(&id) {
            if !conn.client_ids.is_empty() {
                for client_id in &conn.client_ids {
                    st.awareness.remove_state(*client_id);
                }
                match st
                    .awareness
                    .update_with_clients(conn.client_ids.iter().copied())
                {
                    Ok(update) => {
                        let frame = protocol::awareness_frame(update);
                        for other in st.conns.values() {
                            other.handle.send(frame.clone());
                        }
                    }
                    Err(e) => {
                        log::warn!(
                            "room '{}': failed to encode awareness retraction: {e}",
                            self.name
                        );
                    }
                }
            }
        }
        st.conns.len()
    }

    /// Interpret one inbound frame from `origin`. A returned error means
    /// the frame was unusable and the caller should close the connection.
    pub(crate) async fn handle_frame(
        &self,
        origin: &ConnHandle,
        data: &[u8],
    ) -> Result<(), ProtocolError> {
        match protocol::decode_frame(data)? {
            Message::Sync(SyncMessage::SyncStep1(remote_sv)) => {
                let st = self.state.lock().await;
                origin.send(protocol::sync_step2(st.awareness.doc(), &remote_sv));
                Ok(())
            }
            Message::Sync(SyncMessage::SyncStep2(update))
            | Message::Sync(SyncMessage::Update(update)) => self.apply_doc_update(update).await,
            Message::Awareness(update) => self.apply_awareness_update(origin, update).await,
            other => Err(ProtocolError::UnsupportedKind(protocol::kind_name(&other))),
        }
    }

    /// Apply a document update and fan it out to every attached connection,
    /// the origin included — its own update echoed back is its apply
    /// confirmation.
    async fn apply_doc_update(&self, update: Vec<u8>) -> Result<(), ProtocolError> {
        let decoded =
            Update::decode_v1(&update).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        let mut st = self.state.lock().await;
        st.awareness
            .doc()
            .transact_mut()
            .apply_update(decoded)
            .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        st.dirty = true;

        let frame = protocol::sync_update(update.clone());
        for conn in st.conns.values() {
            conn.handle.send(frame.clone());
        }

        if let Some(store) = &self.storage {
            let doc = st.awareness.doc().clone();
            if let Err(e) = store.on_update(&self.name, &update, &doc).await {
                log::warn!("room '{}': update hook failed: {e}", self.name);
            }
        }
        Ok(())
    }

    /// Apply an awareness update, track which client ids the origin now
    /// controls, and broadcast the delta for the ids that actually changed.
    async fn apply_awareness_update(
        &self,
        origin: &ConnHandle,
        update: AwarenessUpdate,
    ) -> Result<(), ProtocolError> {
        let mut st = self.state.lock().await;
        let summary = st
            .awareness
            .apply_update_summary(update)
            .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        let Some(summary) = summary else {
            return Ok(());
        };

        let mut changed: Vec<ClientID> = Vec::new();
        changed.extend(&summary.added);
        changed.extend(&summary.updated);
        changed.extend(&summary.removed);
        if changed.is_empty() {
            return Ok(());
        }

        if let Some(conn) = st.conns.get_mut(&origin.id()) {
            for client_id in &summary.added {
                conn.client_ids.insert(*client_id);
            }
            for client_id in &summary.removed {
                conn.client_ids.remove(client_id);
            }
        }

        match st.awareness.update_with_clients(changed) {
            Ok(delta) => {
                let frame = protocol::awareness_frame(delta);
                for conn in st.conns.values() {
                    conn.handle.send(frame.clone());
                }
            }
            Err(e) => {
                log::warn!(
                    "room '{}': failed to encode awareness broadcast: {e}",
                    self.name
                );
            }
        }
        Ok(())
    }

    /// Gracefully close every attached connection. Returns the handles so
    /// the caller can schedule forced termination for stragglers.
    pub(crate) async fn close_all(&self, code: u16) -> Vec<ConnHandle> {
        let st = self.state.lock().await;
        let handles: Vec<ConnHandle> = st.conns.values().map(|c| c.handle.clone()).collect();
        for handle in &handles {
            handle.close(code);
        }
        handles
    }

    /// Tear the room down: snapshot the document if it has unsaved changes,
    /// then drop all per-connection state. Runs its body at most once.
    pub(crate) async fn destroy(&self) {
        let mut st = self.state.lock().await;
        if st.destroyed {
            return;
        }
        st.destroyed = true;

        if st.dirty {
            if let Some(store) = &self.storage {
                let doc = st.awareness.doc().clone();
                match store.store_doc(&self.name, &doc).await {
                    Ok(()) => log::info!("room '{}': document stored", self.name),
                    Err(e) => log::warn!("room '{}': document store failed: {e}", self.name),
                }
            }
            st.dirty = false;
        }

        let controlled: Vec<ClientID> = st
            .conns
            .values()
            .flat_map(|c| c.client_ids.iter().copied())
            .collect();
        for client_id in controlled {
            st.awareness.remove_state(client_id);
        }
        st.conns.clear();
    }
}
