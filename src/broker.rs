//! Broker facade over the session, sync, cache, and link subsystems.
//!
//! This is the surface external callers use. Each operation builds the
//! per-user session it needs, runs against the homeserver, and tears its
//! connection down again; only an active watch keeps a sync loop alive, and
//! the broker tracks exactly one watch handle per user, replacing a previous
//! one when a new watch starts.
//!
//! # Operations
//!
//! - `register_user` / `login_user`: the authentication handshake, returning
//!   credentials for the caller to persist
//! - `sync_rooms`: one cold sync reconciled into the room cache
//! - `connect`: the full link flow (sync, find or create the bot room, start
//!   the watch, send the login command)
//! - `disconnect`: stop and forget a user's watch
//! - `login_status`: pure cache read of the bridge-linked rooms
//! - `ping_bridge` / `provision_login` / `list_puppets`: provisioning API
//!   passthrough

use std::{collections::HashMap, sync::Arc};

use log::{debug, info, warn};
use matrix_sdk::ruma::OwnedUserId;
use tokio::{fs, sync::Mutex, time::Duration};

use crate::{
    cache::{JsonRoomStore, LinkedRooms, RoomCacheReconciler},
    config::Config,
    error::{AuthError, BrokerError},
    events::{DomainEvent, EventBus},
    link::{LoginMatcher, WatchContext, WatchHandle, watcher},
    matrix::{
        MatrixCredentials, auth,
        auth::HomeserverSession,
        delivery::{self, MatrixTransport},
        rooms::{self, EncryptionPolicy},
        session::CredentialStore,
        sync::SyncEngine,
    },
    provisioning::{BridgeRequester, LoginResponse, Provisioner, Puppet},
    utils::get_path,
};

/// Result of the `connect` operation.
#[derive(Debug, Clone)]
pub struct ConnectOutcome {
    /// The 1:1 bot room the login command went to.
    pub room_id: String,
    /// Whether that room already existed.
    pub room_existed: bool,
    /// Event ID of the delivered login command.
    pub command_event_id: String,
    /// Whether the command went out encrypted.
    pub command_encrypted: bool,
}

/// Result of the `login_status` query.
#[derive(Debug, Clone)]
pub struct LoginStatus {
    pub is_linked: bool,
    pub linked_room_count: usize,
    pub rooms: Vec<crate::cache::RoomSnapshot>,
}

/// The broker core, shared by all users of this process.
pub struct Broker<C: CredentialStore> {
    config: Config,
    data_dir: String,
    bot_id: OwnedUserId,
    credentials: Arc<C>,
    reconciler: Arc<RoomCacheReconciler<JsonRoomStore>>,
    provisioner: Arc<BridgeRequester>,
    matcher: Arc<LoginMatcher>,
    bus: EventBus,
    /// Active watch per local user; insertion replaces and stops the
    /// previous handle.
    watches: Arc<Mutex<HashMap<String, WatchHandle>>>,
}

impl<C: CredentialStore> Broker<C> {
    /// Creates the broker, its stores, and the provisioning client.
    ///
    /// # Arguments
    ///
    /// * `config` - Loaded configuration
    /// * `data_dir` - Directory for the room cache and per-user session
    ///   stores; created if missing
    /// * `credentials` - Read-only credential lookup
    pub async fn new(
        config: Config,
        data_dir: &str,
        credentials: Arc<C>,
    ) -> anyhow::Result<Self> {
        fs::create_dir_all(data_dir).await?;

        let bot_id: OwnedUserId = config.bridge.bot_id.as_str().try_into()?;
        let matcher = Arc::new(LoginMatcher::new(
            &config.bridge.login_domain,
            config.bridge.success_phrases.clone(),
        )?);
        let reconciler = Arc::new(RoomCacheReconciler::new(JsonRoomStore::new(get_path(
            data_dir,
            "rooms.json",
        ))));
        let provisioner = Arc::new(BridgeRequester::new(
            &config.provisioning.url,
            &config.provisioning.shared_secret,
        ));

        Ok(Broker {
            config,
            data_dir: data_dir.to_owned(),
            bot_id,
            credentials,
            reconciler,
            provisioner,
            matcher,
            bus: EventBus::new(),
            watches: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Subscribes to the domain events this broker emits.
    pub fn events(&self) -> tokio::sync::broadcast::Receiver<DomainEvent> {
        self.bus.subscribe()
    }

    /// Registers a new user on the homeserver.
    ///
    /// Returns the fresh credentials; persisting them is the caller's job.
    pub async fn register_user(
        &self,
        username: &str,
        password: &str,
    ) -> Result<MatrixCredentials, BrokerError> {
        Ok(auth::register(&self.config.homeserver.base_url, username, password).await?)
    }

    /// Logs an existing user into the homeserver, rotating their token.
    pub async fn login_user(
        &self,
        username: &str,
        password: &str,
    ) -> Result<MatrixCredentials, BrokerError> {
        Ok(auth::login(&self.config.homeserver.base_url, username, password).await?)
    }

    /// Runs one cold sync for the user and reconciles the room cache.
    ///
    /// Returns the number of live rooms processed.
    pub async fn sync_rooms(&self, local_user_id: &str) -> Result<usize, BrokerError> {
        let credentials = self.find_credentials(local_user_id).await?;
        self.sync_rooms_with(&credentials).await
    }

    /// Runs the full link flow for a user.
    ///
    /// Syncs and reconciles first, finds or creates the private bot room,
    /// attaches the watch (replacing any previous one for this user), and
    /// finally delivers the login command so no bot reply can be missed.
    pub async fn connect(&self, local_user_id: &str) -> Result<ConnectOutcome, BrokerError> {
        let credentials = self.find_credentials(local_user_id).await?;

        info!("syncing rooms before connecting {}", local_user_id);
        self.sync_rooms_with(&credentials).await?;

        let session = self.session_for(&credentials).await?;
        let engine = SyncEngine::new(session.client().clone());
        engine
            .start(
                self.config.homeserver.initial_sync_limit,
                Duration::from_secs(self.config.homeserver.sync_ready_timeout),
            )
            .await?;

        let encryption = self.config.bridge.request_encryption.then(|| EncryptionPolicy {
            setup_timeout: Duration::from_secs(self.config.bridge.encryption_setup_timeout),
            poll_interval: Duration::from_millis(self.config.bridge.encryption_poll_interval_ms),
        });
        let bot_room =
            rooms::find_or_create_private_room(engine.client(), &self.bot_id, encryption).await?;

        let context = WatchContext {
            local_user_id: local_user_id.to_owned(),
            room_id: bot_room.room_id.clone(),
            bot_id: self.bot_id.clone(),
            ghost_prefix: self.config.bridge.ghost_prefix.clone(),
            matcher: Arc::clone(&self.matcher),
            bus: self.bus.clone(),
            active: Arc::new(std::sync::atomic::AtomicBool::new(true)),
            reconcile: self.background_reconcile(session.client().clone()),
        };
        let handle = watcher::attach(engine, context);
        self.register_watch(handle).await;

        let transport = MatrixTransport::new(session.client().clone());
        let receipt = delivery::deliver(
            &transport,
            session.encryption_tier(),
            bot_room.room_id.as_str(),
            &self.config.bridge.login_command,
        )
        .await?;

        info!(
            "sent login command to {} (encrypted: {})",
            bot_room.room_id, receipt.encrypted
        );

        Ok(ConnectOutcome {
            room_id: bot_room.room_id.to_string(),
            room_existed: bot_room.existed,
            command_event_id: receipt.event_id,
            command_encrypted: receipt.encrypted,
        })
    }

    /// Stops the user's watch, if one is active.
    pub async fn disconnect(&self, local_user_id: &str) {
        let handle = self.watches.lock().await.remove(local_user_id);
        match handle {
            Some(handle) => handle.stop(),
            None => debug!("no active watch for {}", local_user_id),
        }
    }

    /// Reads the bridge-link status from the cache without touching the
    /// live connection.
    pub async fn login_status(&self, local_user_id: &str) -> Result<LoginStatus, BrokerError> {
        debug!("login status query for {}", local_user_id);
        let LinkedRooms { count, rooms } = self.reconciler.store().count_bridged().await?;

        Ok(LoginStatus {
            is_linked: count > 0,
            linked_room_count: count,
            rooms,
        })
    }

    /// Checks the bridge provisioning API.
    pub async fn ping_bridge(&self) -> Result<bool, BrokerError> {
        self.provisioner
            .ping()
            .await
            .map_err(BrokerError::Provisioning)
    }

    /// Hands external session cookies to the bridge and, on success, syncs
    /// the room cache to pick up the new portal rooms.
    pub async fn provision_login(
        &self,
        local_user_id: &str,
        cookies: &HashMap<String, String>,
    ) -> Result<LoginResponse, BrokerError> {
        let credentials = self.find_credentials(local_user_id).await?;

        let response = self
            .provisioner
            .login(&credentials.user_id, cookies)
            .await
            .map_err(BrokerError::Provisioning)?;

        if response.error.is_none() {
            if let Err(e) = self.sync_rooms_with(&credentials).await {
                warn!("room sync after bridge login failed: {}", e);
            }
        }

        Ok(response)
    }

    /// Unlinks the user's external account on the bridge.
    pub async fn provision_logout(&self, local_user_id: &str) -> Result<bool, BrokerError> {
        let credentials = self.find_credentials(local_user_id).await?;
        self.provisioner
            .logout(&credentials.user_id)
            .await
            .map_err(BrokerError::Provisioning)
    }

    /// Lists the user's puppets on the bridge.
    pub async fn list_puppets(&self, local_user_id: &str) -> Result<Vec<Puppet>, BrokerError> {
        let credentials = self.find_credentials(local_user_id).await?;
        self.provisioner
            .list_puppets(&credentials.user_id)
            .await
            .map_err(BrokerError::Provisioning)
    }

    async fn find_credentials(
        &self,
        local_user_id: &str,
    ) -> Result<MatrixCredentials, BrokerError> {
        self.credentials
            .find_user_by_id(local_user_id)
            .await
            .ok_or_else(|| BrokerError::UnknownUser(local_user_id.to_owned()))
    }

    async fn session_for(
        &self,
        credentials: &MatrixCredentials,
    ) -> Result<HomeserverSession, BrokerError> {
        let store_dir = get_path(
            &get_path(&self.data_dir, "store"),
            &credentials.local_user_id,
        );
        fs::create_dir_all(&store_dir)
            .await
            .map_err(|e| BrokerError::Auth(AuthError::Unknown(e.into())))?;

        Ok(HomeserverSession::restore(
            &self.config.homeserver.base_url,
            &get_path(&store_dir, "sqlite"),
            credentials,
        )
        .await?)
    }

    async fn sync_rooms_with(
        &self,
        credentials: &MatrixCredentials,
    ) -> Result<usize, BrokerError> {
        let session = self.session_for(credentials).await?;
        let engine = SyncEngine::new(session.client().clone());
        engine
            .start(
                self.config.homeserver.initial_sync_limit,
                Duration::from_secs(self.config.homeserver.sync_ready_timeout),
            )
            .await?;

        let snapshots = rooms::snapshot_rooms(engine.client(), &self.bot_id).await;
        let count = self.reconciler.reconcile(&snapshots).await?;
        engine.stop();

        Ok(count)
    }

    /// Builds the best-effort reconciliation trigger used by watch handlers.
    ///
    /// Failures never reach the caller; they are only logged.
    fn background_reconcile(
        &self,
        client: matrix_sdk::Client,
    ) -> Arc<dyn Fn() + Send + Sync> {
        let reconciler = Arc::clone(&self.reconciler);
        let bot_id = self.bot_id.clone();

        Arc::new(move || {
            let reconciler = Arc::clone(&reconciler);
            let client = client.clone();
            let bot_id = bot_id.clone();

            tokio::spawn(async move {
                let snapshots = rooms::snapshot_rooms(&client, &bot_id).await;
                match reconciler.reconcile(&snapshots).await {
                    Ok(count) => info!("background reconciliation covered {} rooms", count),
                    Err(e) => warn!("background reconciliation failed: {}", e),
                }
            });
        })
    }

    /// Stores a watch handle, stopping any previous watch for the same user.
    async fn register_watch(&self, handle: WatchHandle) {
        let mut watches = self.watches.lock().await;
        if let Some(previous) = watches.insert(handle.user_id().to_owned(), handle) {
            warn!("replacing active watch for {}", previous.user_id());
            previous.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{Bridge, Homeserver, Provisioning},
        matrix::session::MockCredentialStore,
    };
    use tempfile::TempDir;

    fn config() -> Config {
        Config {
            homeserver: Homeserver {
                base_url: "http://localhost:9".to_owned(),
                initial_sync_limit: 20,
                sync_ready_timeout: 1,
            },
            bridge: Bridge {
                bot_id: "@metabot:localhost".to_owned(),
                ghost_prefix: "@instagram_".to_owned(),
                login_command: "!ig login".to_owned(),
                login_domain: "instagram.com".to_owned(),
                success_phrases: vec!["Successfully logged in".to_owned()],
                request_encryption: false,
                encryption_setup_timeout: 15,
                encryption_poll_interval_ms: 500,
            },
            provisioning: Provisioning {
                url: "http://localhost:9".to_owned(),
                shared_secret: "topsecret".to_owned(),
            },
        }
    }

    async fn broker(
        dir: &TempDir,
        credentials: MockCredentialStore,
    ) -> Broker<MockCredentialStore> {
        Broker::new(
            config(),
            dir.path().to_str().unwrap(),
            Arc::new(credentials),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_login_status_on_an_empty_cache() {
        let dir = TempDir::new().unwrap();
        let broker = broker(&dir, MockCredentialStore::new()).await;

        let status = broker.login_status("alice").await.unwrap();
        assert!(!status.is_linked);
        assert_eq!(status.linked_room_count, 0);
        assert!(status.rooms.is_empty());
    }

    #[tokio::test]
    async fn test_sync_rooms_for_an_unknown_user() {
        let dir = TempDir::new().unwrap();
        let mut credentials = MockCredentialStore::new();
        credentials
            .expect_find_user_by_id()
            .times(1)
            .returning(|_| None);
        let broker = broker(&dir, credentials).await;

        let error = broker.sync_rooms("ghost").await.unwrap_err();
        assert!(matches!(error, BrokerError::UnknownUser(user) if user == "ghost"));
    }

    #[tokio::test]
    async fn test_disconnect_without_a_watch_is_a_noop() {
        let dir = TempDir::new().unwrap();
        let broker = broker(&dir, MockCredentialStore::new()).await;

        broker.disconnect("alice").await;
    }

    #[tokio::test]
    async fn test_invalid_bot_id_fails_construction() {
        let dir = TempDir::new().unwrap();
        let mut bad_config = config();
        bad_config.bridge.bot_id = "not-a-user-id".to_owned();

        let result = Broker::new(
            bad_config,
            dir.path().to_str().unwrap(),
            Arc::new(MockCredentialStore::new()),
        )
        .await;
        assert!(result.is_err());
    }
}
