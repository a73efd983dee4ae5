//! Layered message delivery with encryption fallback.
//!
//! Commands sent to the bridge bot must go out even when the bot has not
//! completed encryption key exchange, so delivery degrades through ordered
//! tiers instead of failing hard: the session's encrypted path first, then a
//! raw event send that bypasses encryption entirely. The receipt always
//! reports truthfully whether confidentiality was achieved, and a failed
//! delivery carries the chain of every tier attempted.
//!
//! Which encrypted path a session gets is a static capability
//! ([`EncryptionTier`]) decided once when the session is constructed, never
//! re-probed per send.

use log::{debug, warn};
use matrix_sdk::{
    Client,
    ruma::{
        RoomId, TransactionId,
        api::client::message::send_message_event,
        events::{MessageLikeEventType, room::message::RoomMessageEventContent},
        serde::Raw,
    },
};
use mockall::automock;

use crate::error::DeliveryError;

/// Encryption capability of a session, decided at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionTier {
    /// No usable crypto store; sends are always raw.
    None,
    /// Device exists but is not cross-signed; olm-era sessions.
    LegacyOlm,
    /// Cross-signed device with group-session encryption.
    ModernGroupSession,
}

/// The tier a concrete send attempt went through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryTier {
    ModernGroupSession,
    LegacyOlm,
    Raw,
}

/// Outcome of a completed delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReceipt {
    /// Event ID of the delivered message.
    pub event_id: String,
    /// Whether the message actually went out encrypted.
    pub encrypted: bool,
}

/// Transport operations the delivery algorithm needs from a session.
///
/// Abstracted behind a trait so the fallback walk can be tested without a
/// homeserver.
#[automock]
pub trait MessageTransport {
    /// Makes sure the encryption subsystem is usable for this session.
    async fn init_encryption(&self) -> anyhow::Result<()>;

    /// Sends through the high-level path; encrypts when the room is
    /// encrypted.
    async fn send_encrypted(&self, room_id: &str, body: &str) -> anyhow::Result<String>;

    /// Sends a raw message event, bypassing encryption entirely.
    async fn send_raw(&self, room_id: &str, body: &str) -> anyhow::Result<String>;

    /// Whether the room currently carries an encryption state event.
    async fn room_is_encrypted(&self, room_id: &str) -> bool;
}

/// Delivers a text message to a room through the tier walk.
///
/// 1. A session with no encryption capability sends raw immediately.
/// 2. Otherwise the encryption subsystem is initialised; an init failure
///    drops straight to the raw tier, keeping the failure in the chain.
/// 3. The encrypted send runs once. On success the receipt reflects the
///    room's actual encryption state. A failure whose text points at the
///    encryption layer is retried exactly once on the raw tier; any other
///    failure surfaces as [`DeliveryError::SendFailed`] without a retry.
///
/// # Errors
///
/// [`DeliveryError::SendFailed`] with the failing tier and the causal chain
/// of every tier attempted before it.
pub async fn deliver<T: MessageTransport>(
    transport: &T,
    tier: EncryptionTier,
    room_id: &str,
    body: &str,
) -> Result<DeliveryReceipt, DeliveryError> {
    let encrypted_tier = match tier {
        EncryptionTier::None => {
            debug!("session has no encryption capability, sending raw");
            return raw_tier(transport, room_id, body, None).await;
        }
        EncryptionTier::LegacyOlm => DeliveryTier::LegacyOlm,
        EncryptionTier::ModernGroupSession => DeliveryTier::ModernGroupSession,
    };

    if let Err(init_error) = transport.init_encryption().await {
        warn!("encryption init failed, falling back to raw: {:?}", init_error);
        let prior = anyhow::Error::new(DeliveryError::EncryptionInitFailed(init_error));
        return raw_tier(transport, room_id, body, Some(prior)).await;
    }

    match transport.send_encrypted(room_id, body).await {
        Ok(event_id) => {
            let encrypted = transport.room_is_encrypted(room_id).await;
            debug!("delivered {} encrypted={}", event_id, encrypted);
            Ok(DeliveryReceipt {
                event_id,
                encrypted,
            })
        }
        Err(send_error) if is_encryption_error(&send_error) => {
            warn!(
                "encrypted send failed on the encryption layer, retrying raw: {:?}",
                send_error
            );
            let prior = send_error.context(format!("send failed at tier {:?}", encrypted_tier));
            raw_tier(transport, room_id, body, Some(prior)).await
        }
        Err(send_error) => Err(DeliveryError::SendFailed {
            tier: encrypted_tier,
            cause: send_error,
        }),
    }
}

/// Raw-tier send, appending any earlier tier failures to the error chain.
async fn raw_tier<T: MessageTransport>(
    transport: &T,
    room_id: &str,
    body: &str,
    prior: Option<anyhow::Error>,
) -> Result<DeliveryReceipt, DeliveryError> {
    match transport.send_raw(room_id, body).await {
        Ok(event_id) => Ok(DeliveryReceipt {
            event_id,
            encrypted: false,
        }),
        Err(raw_error) => {
            let cause = match prior {
                Some(prior) => raw_error.context(format!("raw fallback after: {:#}", prior)),
                None => raw_error,
            };
            Err(DeliveryError::SendFailed {
                tier: DeliveryTier::Raw,
                cause,
            })
        }
    }
}

/// Whether an error's text points at the encryption layer.
fn is_encryption_error(error: &anyhow::Error) -> bool {
    let text = format!("{:#}", error).to_lowercase();
    text.contains("encryption") || text.contains("olm") || text.contains("e2ee")
}

/// [`MessageTransport`] backed by a matrix-sdk client.
pub struct MatrixTransport {
    client: Client,
}

impl MatrixTransport {
    pub fn new(client: Client) -> Self {
        MatrixTransport { client }
    }
}

impl MessageTransport for MatrixTransport {
    async fn init_encryption(&self) -> anyhow::Result<()> {
        match self.client.encryption().get_own_device().await {
            Ok(Some(_)) => Ok(()),
            Ok(None) => Err(anyhow::anyhow!("own device missing from the crypto store")),
            Err(e) => Err(e.into()),
        }
    }

    async fn send_encrypted(&self, room_id: &str, body: &str) -> anyhow::Result<String> {
        let room_id = RoomId::parse(room_id)?;
        let room = self
            .client
            .get_room(&room_id)
            .ok_or_else(|| anyhow::anyhow!("room {} not in the synced state", room_id))?;

        let response = room.send(RoomMessageEventContent::text_plain(body)).await?;
        Ok(response.event_id.to_string())
    }

    async fn send_raw(&self, room_id: &str, body: &str) -> anyhow::Result<String> {
        let room_id = RoomId::parse(room_id)?;
        let content = serde_json::json!({ "msgtype": "m.text", "body": body });

        let request = send_message_event::v3::Request::new_raw(
            room_id,
            TransactionId::new(),
            MessageLikeEventType::RoomMessage,
            Raw::from_json(serde_json::value::to_raw_value(&content)?),
        );

        let response = self.client.send(request).await?;
        Ok(response.event_id.to_string())
    }

    async fn room_is_encrypted(&self, room_id: &str) -> bool {
        RoomId::parse(room_id)
            .ok()
            .and_then(|id| self.client.get_room(&id))
            .map(|room| room.encryption_state().is_encrypted())
            .unwrap_or(false)
    }
}
