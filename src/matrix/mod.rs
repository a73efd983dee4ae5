//! Matrix protocol integration for the broker.
//!
//! This module owns everything that talks to the homeserver:
//!
//! - **auth**: login, the interactive registration handshake, and building a
//!   live session from stored credentials
//! - **session**: the credential store interface and its JSON-file
//!   implementation
//! - **sync**: the incremental sync engine with its start/stop lifecycle
//! - **rooms**: room snapshot projection and private bot-room creation
//! - **delivery**: the layered encrypted send path

use serde::{Deserialize, Serialize};

pub mod auth;
pub mod delivery;
pub mod rooms;
pub mod session;
pub mod sync;

/// Homeserver credentials owned by one local user.
///
/// Created on register or login, replaced wholesale on re-login. Exactly one
/// live connection per local user is built from these at a time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatrixCredentials {
    /// Local account name the credentials belong to
    pub local_user_id: String,
    /// Fully qualified Matrix user ID
    pub user_id: String,
    /// Access token for the homeserver session
    pub access_token: String,
    /// Device ID the token is bound to
    pub device_id: String,
}
