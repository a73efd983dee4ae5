//! Full reconciliation of the live room set into the cache.
//!
//! A pass is not an incremental diff: it computes the live room-id set,
//! deletes every cached room absent from it (rooms left, kicked from, or
//! removed server-side), then upserts every live room. Deletes run before
//! upserts within a pass, so a room that disappeared and reappeared in the
//! same live set is simply treated as appeared. Passes are serialized by a
//! process-wide single-flight lock; concurrent triggers (an explicit sync, a
//! login confirmation, a new-room detection) queue up instead of scanning
//! the cache at the same time.

use std::collections::HashSet;

use log::{debug, info, warn};
use tokio::sync::Mutex;

use crate::{
    cache::store::{RoomSnapshot, RoomStore},
    error::CacheError,
};

/// Projects live room sets onto a [`RoomStore`].
pub struct RoomCacheReconciler<S: RoomStore> {
    store: S,
    /// Single-flight lock serializing reconciliation passes.
    flight: Mutex<()>,
}

impl<S: RoomStore> RoomCacheReconciler<S> {
    pub fn new(store: S) -> Self {
        RoomCacheReconciler {
            store,
            flight: Mutex::new(()),
        }
    }

    /// The underlying store, for read-only queries.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Runs one full reconciliation pass and returns the number of live
    /// rooms processed.
    ///
    /// Individual row failures are logged and skipped; partial cache
    /// staleness is preferable to a failed pass, and the next pass repairs
    /// it. Only a failure to read the cached id set aborts.
    ///
    /// # Errors
    ///
    /// [`CacheError`] when the cached room set cannot be listed.
    pub async fn reconcile(&self, live_rooms: &[RoomSnapshot]) -> Result<usize, CacheError> {
        let _flight = self.flight.lock().await;

        let live_ids: HashSet<&str> = live_rooms
            .iter()
            .map(|room| room.room_id.as_str())
            .collect();

        let cached = self.store.list_all().await?;
        debug!(
            "reconciling {} live rooms against {} cached",
            live_rooms.len(),
            cached.len()
        );

        let mut deleted = 0;
        for room in &cached {
            if live_ids.contains(room.room_id.as_str()) {
                continue;
            }
            match self.store.delete(&room.room_id).await {
                Ok(()) => deleted += 1,
                Err(e) => warn!("failed to delete cached room {}: {}", room.room_id, e),
            }
        }

        for snapshot in live_rooms {
            if let Err(e) = self.store.upsert(snapshot).await {
                warn!("failed to upsert room {}: {}", snapshot.room_id, e);
            }
        }

        info!(
            "reconciled {} rooms, deleted {} stale entries",
            live_rooms.len(),
            deleted
        );
        Ok(live_rooms.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::store::{JsonRoomStore, MockRoomStore};
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    fn snapshot(room_id: &str) -> RoomSnapshot {
        RoomSnapshot {
            room_id: room_id.to_owned(),
            display_name: format!("room {}", room_id),
            avatar_url: None,
            last_message_ts: 1_700_000_000_000,
            is_encrypted: false,
            is_bridge_linked: false,
        }
    }

    fn json_store(dir: &TempDir) -> JsonRoomStore {
        let path = dir.path().join("rooms.json").to_str().unwrap().to_owned();
        JsonRoomStore::new(path)
    }

    async fn cached_ids<S: RoomStore>(store: &S) -> BTreeSet<String> {
        store
            .list_all()
            .await
            .unwrap()
            .into_iter()
            .map(|room| room.room_id)
            .collect()
    }

    #[tokio::test]
    async fn test_deletes_absentees_and_upserts_live_rooms() {
        let mut store = MockRoomStore::new();
        store
            .expect_list_all()
            .times(1)
            .returning(|| Ok(vec![snapshot("!a:hs"), snapshot("!b:hs")]));
        store
            .expect_delete()
            .withf(|room_id| room_id == "!a:hs")
            .times(1)
            .returning(|_| Ok(()));
        store
            .expect_upsert()
            .withf(|s| s.room_id == "!b:hs" || s.room_id == "!c:hs")
            .times(2)
            .returning(|_| Ok(()));

        let reconciler = RoomCacheReconciler::new(store);
        let count = reconciler
            .reconcile(&[snapshot("!b:hs"), snapshot("!c:hs")])
            .await
            .unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn test_row_failures_do_not_abort_the_pass() {
        let mut store = MockRoomStore::new();
        store
            .expect_list_all()
            .times(1)
            .returning(|| Ok(vec![snapshot("!stale:hs")]));
        store
            .expect_delete()
            .times(1)
            .returning(|_| Err(CacheError::WriteFailed(anyhow::anyhow!("disk full"))));
        store.expect_upsert().times(1).returning(|_| Ok(()));

        let reconciler = RoomCacheReconciler::new(store);
        let count = reconciler.reconcile(&[snapshot("!live:hs")]).await.unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_reconcile_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let reconciler = RoomCacheReconciler::new(json_store(&dir));
        let live = vec![snapshot("!a:hs"), snapshot("!b:hs")];

        assert_eq!(reconciler.reconcile(&live).await.unwrap(), 2);
        assert_eq!(reconciler.reconcile(&live).await.unwrap(), 2);

        let ids = cached_ids(reconciler.store()).await;
        assert_eq!(
            ids,
            BTreeSet::from(["!a:hs".to_owned(), "!b:hs".to_owned()])
        );
    }

    #[tokio::test]
    async fn test_cache_converges_to_the_latest_live_set() {
        let dir = TempDir::new().unwrap();
        let reconciler = RoomCacheReconciler::new(json_store(&dir));

        let first = vec![snapshot("!a:hs"), snapshot("!b:hs"), snapshot("!c:hs")];
        let second = vec![snapshot("!b:hs"), snapshot("!d:hs")];

        reconciler.reconcile(&first).await.unwrap();
        reconciler.reconcile(&second).await.unwrap();

        let ids = cached_ids(reconciler.store()).await;
        assert_eq!(
            ids,
            BTreeSet::from(["!b:hs".to_owned(), "!d:hs".to_owned()])
        );
    }

    #[tokio::test]
    async fn test_empty_live_set_clears_the_cache() {
        let dir = TempDir::new().unwrap();
        let reconciler = RoomCacheReconciler::new(json_store(&dir));

        reconciler
            .reconcile(&[snapshot("!a:hs"), snapshot("!b:hs")])
            .await
            .unwrap();
        assert_eq!(reconciler.reconcile(&[]).await.unwrap(), 0);

        assert!(cached_ids(reconciler.store()).await.is_empty());
    }
}
