//! Pluggable document persistence.
//!
//! A [`DocStorage`] hydrates a room's document once when the room is
//! created and snapshots it once when the room is destroyed. The relay core
//! never interprets what the backend does; it only sequences the calls
//! around the room lifecycle.

use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Mutex;
use yrs::updates::decoder::Decode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

/// Persistence hooks for room documents.
///
/// `load_doc` runs exactly once per room lifetime, before any connection is
/// attached; mutations it applies to `doc` become the room's initial state.
/// `store_doc` runs at most once, when the room is destroyed with unsaved
/// changes. `on_update` fires after every applied document update and is
/// best-effort: failures are logged and do not disturb the relay.
pub trait DocStorage: Send + Sync {
    fn load_doc<'a>(&'a self, name: &'a str, doc: &'a Doc) -> BoxFuture<'a, Result<(), String>>;

    fn store_doc<'a>(&'a self, name: &'a str, doc: &'a Doc) -> BoxFuture<'a, Result<(), String>>;

    fn on_update<'a>(
        &'a self,
        _name: &'a str,
        _update: &'a [u8],
        _doc: &'a Doc,
    ) -> BoxFuture<'a, Result<(), String>> {
        Box::pin(async { Ok(()) })
    }
}

/// Whole-document snapshots in a process-local map. Mostly useful for tests
/// and single-process deployments that just want rooms to survive becoming
/// empty.
#[derive(Default)]
pub struct MemoryStore {
    snapshots: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    /// Raw stored snapshot, if any.
    pub fn snapshot(&self, name: &str) -> Option<Vec<u8>> {
        match self.snapshots.lock() {
            Ok(map) => map.get(name).cloned(),
            Err(poisoned) => poisoned.into_inner().get(name).cloned(),
        }
    }

    pub fn len(&self) -> usize {
        match self.snapshots.lock() {
            Ok(map) => map.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DocStorage for MemoryStore {
    fn load_doc<'a>(&'a self, name: &'a str, doc: &'a Doc) -> BoxFuture<'a, Result<(), String>> {
        Box::pin(async move {
            let snapshot = self.snapshot(name);
            if let Some(bytes) = snapshot {
                let update = Update::decode_v1(&bytes)
                    .map_err(|e| format!("stored snapshot for '{name}' is corrupt: {e}"))?;
                doc.transact_mut()
                    .apply_update(update)
                    .map_err(|e| format!("stored snapshot for '{name}' failed to apply: {e}"))?;
            }
            Ok(())
        })
    }

    fn store_doc<'a>(&'a self, name: &'a str, doc: &'a Doc) -> BoxFuture<'a, Result<(), String>> {
        Box::pin(async move {
            let bytes = doc
                .transact()
                .encode_state_as_update_v1(&StateVector::default());
            match self.snapshots.lock() {
                Ok(mut map) => {
                    map.insert(name.to_string(), bytes);
                }
                Err(poisoned) => {
                    poisoned.into_inner().insert(name.to_string(), bytes);
                }
            }
            Ok(())
        })
    }
}
