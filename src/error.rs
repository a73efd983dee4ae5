//! Error types for the broker core.
//!
//! Each subsystem has its own error enum so callers can react to the cases
//! that matter to them (a taken username, a send that fell back to plain
//! text, a room that never became encrypted) instead of string-matching a
//! catch-all error. Transport-level causes are kept as [`anyhow::Error`]
//! sources so the full chain stays printable.

use std::time::Duration;

use thiserror::Error;

use crate::matrix::delivery::DeliveryTier;

/// Errors raised while logging in or registering against the homeserver.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The homeserver reported the username as occupied (`M_USER_IN_USE`).
    #[error("username is already taken on the homeserver")]
    UsernameTaken,

    /// The registration flows offered by the homeserver contain no stage
    /// sequence we can complete (neither password nor dummy auth).
    #[error("no suitable registration flow offered by the homeserver")]
    NoSuitableFlow,

    /// Any other authentication failure, wrapping the transport error.
    #[error("homeserver authentication failed")]
    Unknown(#[source] anyhow::Error),
}

/// Errors raised by the sync engine.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The first sync pass did not complete within the configured deadline.
    #[error("first sync did not complete within {0:?}")]
    Timeout(Duration),

    /// The sync transport failed before the engine reached the synced state.
    #[error("sync transport failure")]
    TransportFailure(#[source] anyhow::Error),
}

/// Errors raised while finding or creating the private bot room.
#[derive(Debug, Error)]
pub enum CreateRoomError {
    /// The room was created with encryption requested, but no encryption
    /// state event appeared within the configured deadline.
    #[error("room {room_id} did not become encrypted within {waited:?}")]
    EncryptionSetupTimeout { room_id: String, waited: Duration },

    /// Creating the room or inviting the bot failed.
    #[error("failed to create the bot room")]
    InviteFailed(#[source] anyhow::Error),
}

/// Errors raised by the layered delivery path.
///
/// `SendFailed` carries the tier that failed last together with the causal
/// chain of every tier attempted before it, so a caller can tell "delivered
/// unencrypted" apart from "not delivered at all".
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The encryption subsystem could not be initialised for the session.
    #[error("encryption subsystem initialisation failed")]
    EncryptionInitFailed(#[source] anyhow::Error),

    /// The message could not be delivered on any attempted tier.
    #[error("send failed at tier {tier:?}")]
    SendFailed {
        tier: DeliveryTier,
        #[source]
        cause: anyhow::Error,
    },
}

/// Errors raised by the room cache.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Reading or writing the cache file failed.
    #[error("room cache write failed")]
    WriteFailed(#[source] anyhow::Error),
}

/// Umbrella error for broker operations, converting from the subsystem
/// taxonomy so the facade can use `?` throughout.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("no stored credentials for user {0}")]
    UnknownUser(String),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    CreateRoom(#[from] CreateRoomError),

    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("bridge provisioning request failed")]
    Provisioning(#[source] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_failed_keeps_the_causal_chain() {
        let cause = anyhow::anyhow!("megolm session not shared")
            .context("encrypted send failed")
            .context("raw send failed");
        let error = DeliveryError::SendFailed {
            tier: DeliveryTier::Raw,
            cause,
        };

        let chain: Vec<String> = anyhow::Error::new(error)
            .chain()
            .map(|e| e.to_string())
            .collect();
        assert_eq!(chain[0], "send failed at tier Raw");
        assert!(chain.iter().any(|m| m.contains("megolm session")));
    }

    #[test]
    fn test_broker_error_converts_from_auth_error() {
        let error: BrokerError = AuthError::UsernameTaken.into();
        assert!(matches!(error, BrokerError::Auth(AuthError::UsernameTaken)));
        assert_eq!(
            error.to_string(),
            "username is already taken on the homeserver"
        );
    }

    #[test]
    fn test_encryption_setup_timeout_message() {
        let error = CreateRoomError::EncryptionSetupTimeout {
            room_id: "!abc:localhost".to_owned(),
            waited: Duration::from_secs(15),
        };
        assert!(error.to_string().contains("!abc:localhost"));
        assert!(error.to_string().contains("15s"));
    }
}
