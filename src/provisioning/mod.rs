//! Client for the bridge provisioning API.
//!
//! The companion mautrix bridge exposes a small HTTP API, authenticated
//! with a shared secret, for managing puppet accounts outside the chat
//! protocol. This module wraps its ping/login/logout/list endpoints.

pub mod requester;
pub mod response_structs;

pub use requester::{BridgeRequester, Provisioner};
pub use response_structs::{LoginResponse, Puppet};
