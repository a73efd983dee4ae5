//! Room snapshot persistence.
//!
//! The [`RoomStore`] trait is the persistence seam used by the reconciler
//! and the login-status query; [`JsonRoomStore`] is the on-disk
//! implementation, one JSON map of room id to snapshot. Loading a missing or
//! corrupted cache yields an empty map rather than an error, since the cache
//! is rebuildable from a sync.

use std::collections::HashMap;

use log::{error, warn};
use mockall::automock;
use serde::{Deserialize, Serialize};
use tokio::{fs, sync::Mutex};

use crate::error::CacheError;

/// Cached projection of one server-side room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomSnapshot {
    /// Room ID, the unique cache key
    pub room_id: String,
    /// Resolved display name
    pub display_name: String,
    /// Avatar URL, if the room has one
    pub avatar_url: Option<String>,
    /// Milliseconds since epoch of the last observed activity
    pub last_message_ts: u64,
    /// Whether the room state carries an encryption event
    pub is_encrypted: bool,
    /// Whether the bridge bot is among the room members
    pub is_bridge_linked: bool,
}

/// Bridge-linked rows of the cache, with their count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkedRooms {
    pub count: usize,
    pub rooms: Vec<RoomSnapshot>,
}

/// Persistence operations on the room cache.
#[automock]
pub trait RoomStore {
    /// Inserts or updates a snapshot by room id.
    async fn upsert(&self, snapshot: &RoomSnapshot) -> Result<(), CacheError>;

    /// Deletes a snapshot by room id. Deleting an absent id is not an error.
    async fn delete(&self, room_id: &str) -> Result<(), CacheError>;

    /// Returns every cached snapshot.
    async fn list_all(&self) -> Result<Vec<RoomSnapshot>, CacheError>;

    /// Returns the snapshots flagged as bridge-linked, with their count.
    async fn count_bridged(&self) -> Result<LinkedRooms, CacheError>;
}

/// JSON-file-backed room store.
pub struct JsonRoomStore {
    /// Path to the JSON cache file.
    path: String,
    /// Serializes read-modify-write cycles.
    write_lock: Mutex<()>,
}

impl JsonRoomStore {
    /// Creates a store backed by the given file path. The file is created on
    /// the first write.
    pub fn new(path: String) -> Self {
        JsonRoomStore {
            path,
            write_lock: Mutex::new(()),
        }
    }

    async fn load_map(&self) -> HashMap<String, RoomSnapshot> {
        let Ok(serialized) = fs::read_to_string(&self.path).await else {
            return HashMap::new();
        };

        match serde_json::from_str(&serialized) {
            Ok(map) => map,
            Err(e) => {
                error!("failed to deserialize room cache, starting empty: {}", e);
                HashMap::new()
            }
        }
    }

    async fn save_map(&self, map: &HashMap<String, RoomSnapshot>) -> Result<(), CacheError> {
        let serialized =
            serde_json::to_string(map).map_err(|e| CacheError::WriteFailed(e.into()))?;
        fs::write(&self.path, serialized)
            .await
            .map_err(|e| CacheError::WriteFailed(e.into()))
    }
}

impl RoomStore for JsonRoomStore {
    async fn upsert(&self, snapshot: &RoomSnapshot) -> Result<(), CacheError> {
        let _guard = self.write_lock.lock().await;

        let mut map = self.load_map().await;
        map.insert(snapshot.room_id.clone(), snapshot.clone());
        self.save_map(&map).await
    }

    async fn delete(&self, room_id: &str) -> Result<(), CacheError> {
        let _guard = self.write_lock.lock().await;

        let mut map = self.load_map().await;
        if map.remove(room_id).is_none() {
            warn!("delete of uncached room {}", room_id);
            return Ok(());
        }
        self.save_map(&map).await
    }

    async fn list_all(&self) -> Result<Vec<RoomSnapshot>, CacheError> {
        Ok(self.load_map().await.into_values().collect())
    }

    async fn count_bridged(&self) -> Result<LinkedRooms, CacheError> {
        let rooms: Vec<RoomSnapshot> = self
            .load_map()
            .await
            .into_values()
            .filter(|room| room.is_bridge_linked)
            .collect();

        Ok(LinkedRooms {
            count: rooms.len(),
            rooms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn snapshot(room_id: &str, bridged: bool) -> RoomSnapshot {
        RoomSnapshot {
            room_id: room_id.to_owned(),
            display_name: format!("room {}", room_id),
            avatar_url: None,
            last_message_ts: 1_700_000_000_000,
            is_encrypted: false,
            is_bridge_linked: bridged,
        }
    }

    fn store_in(dir: &TempDir) -> JsonRoomStore {
        let path = dir.path().join("rooms.json").to_str().unwrap().to_owned();
        JsonRoomStore::new(path)
    }

    #[tokio::test]
    async fn test_list_all_on_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        assert!(store.list_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upsert_inserts_then_updates() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        store.upsert(&snapshot("!a:hs", false)).await.unwrap();
        let mut updated = snapshot("!a:hs", false);
        updated.display_name = "renamed".to_owned();
        store.upsert(&updated).await.unwrap();

        let all = store.list_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].display_name, "renamed");
    }

    #[tokio::test]
    async fn test_delete_removes_the_row() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        store.upsert(&snapshot("!a:hs", false)).await.unwrap();
        store.upsert(&snapshot("!b:hs", false)).await.unwrap();
        store.delete("!a:hs").await.unwrap();

        let all = store.list_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].room_id, "!b:hs");
    }

    #[tokio::test]
    async fn test_delete_of_absent_row_is_ok() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        assert!(store.delete("!missing:hs").await.is_ok());
    }

    #[tokio::test]
    async fn test_count_bridged_filters_rows() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        store.upsert(&snapshot("!a:hs", true)).await.unwrap();
        store.upsert(&snapshot("!b:hs", false)).await.unwrap();
        store.upsert(&snapshot("!c:hs", true)).await.unwrap();

        let linked = store.count_bridged().await.unwrap();
        assert_eq!(linked.count, 2);
        assert!(linked.rooms.iter().all(|room| room.is_bridge_linked));
    }

    #[tokio::test]
    async fn test_corrupted_cache_is_treated_as_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rooms.json");
        fs::write(&path, "[[[").await.unwrap();

        let store = JsonRoomStore::new(path.to_str().unwrap().to_owned());
        assert!(store.list_all().await.unwrap().is_empty());
    }
}
