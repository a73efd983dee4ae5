//! Credential storage for homeserver sessions.
//!
//! The broker core only ever reads credentials, through the
//! [`CredentialStore`] trait; writing them is the job of whatever sits in
//! front of the core (the CLI here). The file implementation keeps one JSON
//! map of local user to [`MatrixCredentials`] on disk.

use std::collections::HashMap;

use log::{error, info, warn};
use mockall::automock;
use tokio::{fs, sync::Mutex};

use crate::matrix::MatrixCredentials;

/// Read-only lookup of stored homeserver credentials.
#[automock]
pub trait CredentialStore {
    /// Finds the credentials for a local user, if any are stored.
    async fn find_user_by_id(&self, local_user_id: &str) -> Option<MatrixCredentials>;
}

/// JSON-file-backed credential store.
///
/// The whole map is read and rewritten on every persist; the file is small
/// (one record per local user) and the interior mutex keeps concurrent
/// writers from interleaving.
pub struct JsonCredentialStore {
    /// Path to the JSON credentials file.
    path: String,
    /// Serializes read-modify-write cycles.
    write_lock: Mutex<()>,
}

impl JsonCredentialStore {
    /// Creates a store backed by the given file path. The file is created on
    /// the first persist.
    pub fn new(path: String) -> Self {
        JsonCredentialStore {
            path,
            write_lock: Mutex::new(()),
        }
    }

    /// Stores credentials for a local user, replacing any previous record.
    ///
    /// Called on register and login; re-login rotates the token by replacing
    /// the whole record.
    pub async fn persist(&self, credentials: &MatrixCredentials) -> anyhow::Result<()> {
        let _guard = self.write_lock.lock().await;

        let mut map = self.load_map().await;
        map.insert(credentials.local_user_id.clone(), credentials.clone());

        let serialized = serde_json::to_string(&map)?;
        fs::write(&self.path, serialized).await?;

        info!("persisted credentials for {}", credentials.local_user_id);
        Ok(())
    }

    /// Removes the stored credentials for a local user, if present.
    pub async fn remove(&self, local_user_id: &str) -> anyhow::Result<()> {
        let _guard = self.write_lock.lock().await;

        let mut map = self.load_map().await;
        if map.remove(local_user_id).is_some() {
            let serialized = serde_json::to_string(&map)?;
            fs::write(&self.path, serialized).await?;
            info!("removed credentials for {}", local_user_id);
        }
        Ok(())
    }

    async fn load_map(&self) -> HashMap<String, MatrixCredentials> {
        let Ok(serialized) = fs::read_to_string(&self.path).await else {
            warn!("no credential file at {}, starting empty", self.path);
            return HashMap::new();
        };

        match serde_json::from_str(&serialized) {
            Ok(map) => map,
            Err(e) => {
                error!("failed to deserialize credential file: {}", e);
                HashMap::new()
            }
        }
    }
}

impl CredentialStore for JsonCredentialStore {
    async fn find_user_by_id(&self, local_user_id: &str) -> Option<MatrixCredentials> {
        self.load_map().await.remove(local_user_id)
    }
}
