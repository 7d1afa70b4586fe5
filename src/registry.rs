//! Room registry.
//!
//! One live room per document name, process-wide. Creation is
//! double-checked under a write lock so concurrent admissions for the same
//! name converge on a single room (and thus a single document load).

use crate::room::Room;
use crate::storage::DocStorage;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use yrs::Doc;

#[derive(Default)]
pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, Arc<Room>>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        RoomRegistry::default()
    }

    pub async fn get(&self, name: &str) -> Option<Arc<Room>> {
        self.rooms.read().await.get(name).cloned()
    }

    pub async fn len(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rooms.read().await.is_empty()
    }

    pub async fn names(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }

    /// Look up the room for `name`, creating it if absent. The returned
    /// room has a pending admission registered on it; the caller must
    /// balance it with [`Room::release_pending`] whether or not the
    /// admission succeeds.
    pub(crate) async fn get_or_create(
        &self,
        name: &str,
        make_doc: &(dyn Fn() -> Doc + Send + Sync),
        storage: Option<Arc<dyn DocStorage>>,
    ) -> Arc<Room> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(name) {
                room.hold_pending();
                return room.clone();
            }
        }
        let mut rooms = self.rooms.write().await;
        // Re-check: another admission may have won the race.
        if let Some(room) = rooms.get(name) {
            room.hold_pending();
            return room.clone();
        }
        log::debug!("creating room '{name}'");
        let room = Room::create(name.to_string(), make_doc(), storage);
        room.hold_pending();
        rooms.insert(name.to_string(), room.clone());
        room
    }

    /// Remove and return the room for `name` if nothing is attached to it
    /// and no admission is in flight toward it.
    pub(crate) async fn remove_if_empty(&self, name: &str) -> Option<Arc<Room>> {
        let mut rooms = self.rooms.write().await;
        let room = rooms.get(name)?;
        if room.connection_count().await == 0 && room.pending_count() == 0 {
            return rooms.remove(name);
        }
        None
    }

    /// Remove every room, returning them for teardown.
    pub(crate) async fn clear(&self) -> Vec<Arc<Room>> {
        let mut rooms = self.rooms.write().await;
        rooms.drain().map(|(_, room)| room).collect()
    }
}
