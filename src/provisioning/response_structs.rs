//! Deserialized responses of the bridge provisioning API.

use serde::Deserialize;

/// Response of the `ping` endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct PingResponse {
    pub success: bool,
}

/// Response of the `login` endpoint.
///
/// The bridge reports failures in-band through the `error` field rather
/// than relying on status codes alone.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    /// Identifier of the created puppet on success.
    #[serde(default)]
    pub puppet_id: Option<String>,
    /// Error description on failure.
    #[serde(default)]
    pub error: Option<String>,
}

/// Response of the `list` endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct ListResponse {
    pub puppets: Vec<Puppet>,
}

/// One puppet account registered on the bridge.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Puppet {
    /// Matrix user the puppet belongs to.
    pub user_id: String,
    /// Identifier of the puppet on the bridge.
    #[serde(default)]
    pub puppet_id: Option<String>,
}
