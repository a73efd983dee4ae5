//! Incremental sync engine for one homeserver session.
//!
//! The engine drives the matrix-sdk sync loop for a single user and exposes
//! a small lifecycle: [`SyncEngine::start`] performs the cold sync in a
//! background task and only returns once that first pass has completed (or a
//! deadline expires), after which the engine is `Synced` and event handlers
//! receive timeline and membership deltas; [`SyncEngine::stop`] tears the
//! loop down and removes every handler that was registered for this engine.
//!
//! Handler registration is symmetric by construction: whoever registers a
//! handler on the engine's client hands the resulting handle to
//! [`SyncEngine::track_handler`], and `stop` removes all tracked handles, so
//! repeated start/stop cycles for the same user cannot leak handlers.

use std::sync::{Arc, Mutex};

use log::{debug, error, info, warn};
use matrix_sdk::{
    Client, LoopCtrl,
    config::SyncSettings,
    event_handler::EventHandlerHandle,
    ruma::{UInt, api::client::filter::FilterDefinition},
};
use tokio::{
    sync::oneshot,
    task::JoinHandle,
    time::{Duration, timeout},
};

use crate::error::SyncError;

/// Lifecycle state of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// No sync loop is running.
    Stopped,
    /// The cold sync pass is in flight.
    Starting,
    /// The first pass completed; deltas are flowing.
    Synced,
}

/// Drives the incremental sync loop for one user's session.
pub struct SyncEngine {
    client: Client,
    state: Arc<Mutex<SyncState>>,
    handles: Mutex<Vec<EventHandlerHandle>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SyncEngine {
    /// Creates an engine for an authenticated client. Nothing runs until
    /// [`SyncEngine::start`] is called.
    pub fn new(client: Client) -> Self {
        SyncEngine {
            client,
            state: Arc::new(Mutex::new(SyncState::Stopped)),
            handles: Mutex::new(Vec::new()),
            task: Mutex::new(None),
        }
    }

    /// The client this engine drives, for registering event handlers.
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SyncState {
        *self.state.lock().expect("sync state lock poisoned")
    }

    /// Takes ownership of an event handler registered on this engine's
    /// client, so [`SyncEngine::stop`] removes it.
    pub fn track_handler(&self, handle: EventHandlerHandle) {
        self.handles
            .lock()
            .expect("sync handle lock poisoned")
            .push(handle);
    }

    /// Starts the sync loop and waits for the first pass to complete.
    ///
    /// The cold sync requests at most `initial_backlog_limit` timeline events
    /// per room (with lazy-loaded members) and runs in a background task; the
    /// call suspends until that pass finishes. After it returns, the engine
    /// is `Synced` and keeps receiving deltas until stopped.
    ///
    /// # Arguments
    ///
    /// * `initial_backlog_limit` - Timeline backlog requested per room on the
    ///   first pass
    /// * `ready_timeout` - Deadline for the first pass
    ///
    /// # Errors
    ///
    /// * [`SyncError::Timeout`] when the first pass misses the deadline; the
    ///   background task is torn down before returning
    /// * [`SyncError::TransportFailure`] when the first pass fails
    pub async fn start(
        &self,
        initial_backlog_limit: u32,
        ready_timeout: Duration,
    ) -> Result<(), SyncError> {
        {
            let mut state = self.state.lock().expect("sync state lock poisoned");
            if *state != SyncState::Stopped {
                warn!("sync engine already started, ignoring start");
                return Ok(());
            }
            *state = SyncState::Starting;
        }

        info!("starting sync, backlog limit {}", initial_backlog_limit);

        // Lazy-load room members, cap the cold-sync timeline per room.
        // See <https://spec.matrix.org/v1.6/client-server-api/#lazy-loading-room-members>.
        let mut filter = FilterDefinition::with_lazy_loading();
        filter.room.timeline.limit = Some(UInt::from(initial_backlog_limit));
        let settings = SyncSettings::default().filter(filter.into());

        let (ready_tx, ready_rx) = oneshot::channel();
        let client = self.client.clone();
        let state = Arc::clone(&self.state);

        let task = tokio::spawn(async move {
            let first_pass = client.sync_once(settings.clone()).await;

            let next_settings = match first_pass {
                Ok(response) => {
                    debug!("first sync pass complete");
                    let _ = ready_tx.send(Ok(()));
                    settings.token(response.next_batch)
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };

            let loop_result = client
                .sync_with_result_callback(next_settings, |sync_result| async move {
                    sync_result?;
                    Ok(LoopCtrl::Continue)
                })
                .await;

            if let Err(e) = loop_result {
                error!("sync loop ended with error: {:?}", e);
            }
            *state.lock().expect("sync state lock poisoned") = SyncState::Stopped;
        });
        *self.task.lock().expect("sync task lock poisoned") = Some(task);

        match timeout(ready_timeout, ready_rx).await {
            Ok(Ok(Ok(()))) => {
                *self.state.lock().expect("sync state lock poisoned") = SyncState::Synced;
                Ok(())
            }
            Ok(Ok(Err(e))) => {
                self.stop();
                Err(SyncError::TransportFailure(e.into()))
            }
            Ok(Err(_)) => {
                self.stop();
                Err(SyncError::TransportFailure(anyhow::anyhow!(
                    "sync task ended before the first pass completed"
                )))
            }
            Err(_) => {
                warn!("first sync pass missed its {:?} deadline", ready_timeout);
                self.stop();
                Err(SyncError::Timeout(ready_timeout))
            }
        }
    }

    /// Tears down the sync loop and removes every tracked event handler.
    ///
    /// Safe to call on an already stopped engine, and safe to call while a
    /// notification is in flight: handlers are removed from the client before
    /// the call returns, so nothing fires afterwards.
    pub fn stop(&self) {
        if let Some(task) = self
            .task
            .lock()
            .expect("sync task lock poisoned")
            .take()
        {
            task.abort();
        }

        let handles: Vec<EventHandlerHandle> = self
            .handles
            .lock()
            .expect("sync handle lock poisoned")
            .drain(..)
            .collect();
        for handle in handles {
            self.client.remove_event_handler(handle);
        }

        let mut state = self.state.lock().expect("sync state lock poisoned");
        if *state != SyncState::Stopped {
            info!("sync engine stopped");
        }
        *state = SyncState::Stopped;
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use matrix_sdk::{
        Room,
        ruma::events::room::message::OriginalSyncRoomMessageEvent,
    };

    async fn offline_client() -> Client {
        Client::builder()
            .homeserver_url("http://localhost:9")
            .build()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_new_engine_is_stopped() {
        let engine = SyncEngine::new(offline_client().await);
        assert_eq!(engine.state(), SyncState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let engine = SyncEngine::new(offline_client().await);
        engine.stop();
        engine.stop();
        assert_eq!(engine.state(), SyncState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_removes_tracked_handlers() {
        let engine = SyncEngine::new(offline_client().await);

        let handle = engine
            .client()
            .add_event_handler(|_: OriginalSyncRoomMessageEvent, _: Room| async {});
        engine.track_handler(handle);
        assert_eq!(
            engine
                .handles
                .lock()
                .unwrap()
                .len(),
            1
        );

        engine.stop();
        assert!(engine.handles.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_start_against_unreachable_homeserver_fails() {
        let engine = SyncEngine::new(offline_client().await);

        let result = engine.start(10, Duration::from_millis(500)).await;
        assert!(result.is_err());
        assert_eq!(engine.state(), SyncState::Stopped);
    }
}
