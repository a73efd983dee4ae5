//! Configuration file structures for the broker.
//!
//! The configuration is a YAML file split into three sections: the Matrix
//! homeserver, the bridge bot conversation, and the bridge provisioning API.
//! Any value can be overridden with a `PASSERELLE_` environment variable
//! using `__` as the section separator.
//!
//! # Configuration File Format
//!
//! ```yaml
//! homeserver:
//!   # Base URL of the Matrix homeserver
//!   base_url: "http://localhost:8008"
//!   # Timeline backlog requested on the first sync pass
//!   initial_sync_limit: 20
//!   # Seconds to wait for the first sync pass before giving up
//!   sync_ready_timeout: 30
//!
//! bridge:
//!   # Matrix ID of the automated bridge bot
//!   bot_id: "@metabot:localhost"
//!   # User-id prefix of bridged ghost accounts
//!   ghost_prefix: "@instagram_"
//!   # Command that asks the bot for a login link
//!   login_command: "!ig login"
//!   # Domain matched when extracting login URLs from bot replies
//!   login_domain: "instagram.com"
//!   # Phrases that mark a completed login
//!   success_phrases:
//!     - "Successfully logged in"
//!     - "Login successful"
//!   # Ask for room-level encryption when creating the bot room
//!   request_encryption: false
//!   # Seconds to wait for the encryption state event after room creation
//!   encryption_setup_timeout: 15
//!   # Milliseconds between encryption state polls
//!   encryption_poll_interval_ms: 500
//!
//! provisioning:
//!   # Base URL of the bridge provisioning API
//!   url: "http://localhost:29319"
//!   # Shared secret from the bridge configuration
//!   shared_secret: "change-me"
//! ```
//!
//! # Environment Variable Overrides
//!
//! ```bash
//! export PASSERELLE_HOMESERVER__BASE_URL="https://matrix.example.org"
//! export PASSERELLE_PROVISIONING__SHARED_SECRET="secret-from-env"
//! ```

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::Deserialize;

/// Root configuration for the broker.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Matrix homeserver settings
    pub homeserver: Homeserver,
    /// Bridge bot conversation settings
    pub bridge: Bridge,
    /// Bridge provisioning API settings
    pub provisioning: Provisioning,
}

/// Matrix homeserver connection settings.
#[derive(Debug, Clone, Deserialize)]
pub struct Homeserver {
    /// Base URL of the homeserver, including the protocol.
    pub base_url: String,

    /// Timeline backlog requested on the first sync pass.
    #[serde(default = "default_initial_sync_limit")]
    pub initial_sync_limit: u32,

    /// Seconds to wait for the first sync pass to complete.
    #[serde(default = "default_sync_ready_timeout")]
    pub sync_ready_timeout: u64,
}

/// Settings for the scripted conversation with the bridge bot.
#[derive(Debug, Clone, Deserialize)]
pub struct Bridge {
    /// Fully qualified Matrix ID of the bridge bot account.
    pub bot_id: String,

    /// User-id prefix that identifies bridged ghost accounts, used to detect
    /// newly linked rooms.
    #[serde(default = "default_ghost_prefix")]
    pub ghost_prefix: String,

    /// Command sent into the bot room to start the login exchange.
    #[serde(default = "default_login_command")]
    pub login_command: String,

    /// Domain matched when extracting login URLs from bot replies.
    #[serde(default = "default_login_domain")]
    pub login_domain: String,

    /// Phrases in a bot reply that mark a completed login.
    #[serde(default = "default_success_phrases")]
    pub success_phrases: Vec<String>,

    /// Whether to request room-level encryption when creating the bot room.
    #[serde(default)]
    pub request_encryption: bool,

    /// Seconds to wait for the encryption state event after creating an
    /// encrypted room.
    #[serde(default = "default_encryption_setup_timeout")]
    pub encryption_setup_timeout: u64,

    /// Milliseconds between polls of the room encryption state.
    #[serde(default = "default_encryption_poll_interval")]
    pub encryption_poll_interval_ms: u64,
}

/// Bridge provisioning API settings.
#[derive(Debug, Clone, Deserialize)]
pub struct Provisioning {
    /// Base URL where the bridge provisioning API is reachable.
    pub url: String,

    /// Shared secret matching `provisioning.shared_secret` in the bridge
    /// configuration, sent as a bearer token.
    pub shared_secret: String,
}

fn default_initial_sync_limit() -> u32 {
    20
}

fn default_sync_ready_timeout() -> u64 {
    30
}

fn default_ghost_prefix() -> String {
    "@instagram_".to_owned()
}

fn default_login_command() -> String {
    "!ig login".to_owned()
}

fn default_login_domain() -> String {
    "instagram.com".to_owned()
}

fn default_success_phrases() -> Vec<String> {
    vec![
        "Successfully logged in".to_owned(),
        "Login successful".to_owned(),
    ]
}

fn default_encryption_setup_timeout() -> u64 {
    15
}

fn default_encryption_poll_interval() -> u64 {
    500
}

impl Config {
    /// Loads the configuration from a YAML file, merged with `PASSERELLE_`
    /// environment variable overrides.
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the YAML configuration file.
    ///
    /// # Errors
    ///
    /// Returns a [`figment::Error`] if the file cannot be read or a required
    /// field is missing after merging.
    pub fn load(path: &str) -> Result<Config, figment::Error> {
        Figment::new()
            .merge(Yaml::file(path))
            .merge(Env::prefixed("PASSERELLE_").split("__"))
            .extract()
    }
}
