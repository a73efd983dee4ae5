//! Room projection and private bot-room management.
//!
//! Projection turns the client's synced room set into [`RoomSnapshot`]s for
//! the cache reconciler, tagging each room with whether the bridge bot is a
//! member and whether the room carries an encryption state event. Room
//! management covers finding the existing 1:1 room with the bridge bot or
//! creating it, including the bounded wait for encryption to be set up when
//! it was requested at creation time.

use futures::future::join_all;
use log::{debug, info, warn};
use matrix_sdk::{
    Client, Room, RoomMemberships,
    ruma::{
        OwnedRoomId, UserId,
        api::client::room::{
            Visibility,
            create_room::v3::{Request as CreateRoomRequest, RoomPreset},
        },
        events::{InitialStateEvent, room::encryption::RoomEncryptionEventContent},
    },
};
use tokio::time::{Duration, Instant, sleep};

use crate::{cache::store::RoomSnapshot, error::CreateRoomError, utils::now_millis};

/// Bounded-wait policy for encryption setup after room creation.
#[derive(Debug, Clone, Copy)]
pub struct EncryptionPolicy {
    /// Deadline for the encryption state event to appear.
    pub setup_timeout: Duration,
    /// Interval between state polls.
    pub poll_interval: Duration,
}

/// Result of looking up or creating the private bot room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BotRoom {
    pub room_id: OwnedRoomId,
    /// Whether the room already existed before the call.
    pub existed: bool,
}

/// Projects the client's joined rooms into cache snapshots.
///
/// Rooms whose member list cannot be loaded are still projected, just
/// without the bridge tag; a partially tagged snapshot beats a missing one
/// and the next reconciliation pass repairs it.
pub async fn snapshot_rooms(client: &Client, bot_id: &UserId) -> Vec<RoomSnapshot> {
    let rooms = client.joined_rooms();
    debug!("projecting {} joined rooms", rooms.len());

    let snapshots = rooms
        .iter()
        .map(|room| snapshot_room(room, bot_id));
    join_all(snapshots).await
}

async fn snapshot_room(room: &Room, bot_id: &UserId) -> RoomSnapshot {
    let room_id = room.room_id().to_string();

    let is_bridge_linked = match room.members(RoomMemberships::ACTIVE).await {
        Ok(members) => members.iter().any(|member| member.user_id() == bot_id),
        Err(e) => {
            warn!("failed to load members of {}: {:?}", room_id, e);
            false
        }
    };

    let display_name = match room.display_name().await {
        Ok(name) => name.to_string(),
        Err(_) => room_id.clone(),
    };

    RoomSnapshot {
        room_id,
        display_name,
        avatar_url: room.avatar_url().map(|url| url.to_string()),
        last_message_ts: now_millis(),
        is_encrypted: room.encryption_state().is_encrypted(),
        is_bridge_linked,
    }
}

/// Searches the synced room set for a room that has `member` in its active
/// member list.
pub async fn find_room_with_member(client: &Client, member: &UserId) -> Option<OwnedRoomId> {
    for room in client.joined_rooms() {
        let members = match room.members(RoomMemberships::ACTIVE).await {
            Ok(members) => members,
            Err(e) => {
                warn!("failed to load members of {}: {:?}", room.room_id(), e);
                continue;
            }
        };

        if members.iter().any(|m| m.user_id() == member) {
            return Some(room.room_id().to_owned());
        }
    }
    None
}

/// Finds the existing 1:1 room with the bridge bot, or creates one.
///
/// A new room is created as a private direct chat with the bot invited.
/// When `encryption` is set, an `m.room.encryption` event is requested at
/// creation time and the call waits, bounded by the policy's deadline, until
/// the room state actually carries it.
///
/// # Errors
///
/// * [`CreateRoomError::InviteFailed`] when the create-room call fails
/// * [`CreateRoomError::EncryptionSetupTimeout`] when encryption was
///   requested but no encryption state event appeared before the deadline
pub async fn find_or_create_private_room(
    client: &Client,
    bot_id: &UserId,
    encryption: Option<EncryptionPolicy>,
) -> Result<BotRoom, CreateRoomError> {
    if let Some(room_id) = find_room_with_member(client, bot_id).await {
        info!("found existing bot room {}", room_id);
        return Ok(BotRoom {
            room_id,
            existed: true,
        });
    }

    info!("creating private room with {}", bot_id);

    let mut request = CreateRoomRequest::new();
    request.is_direct = true;
    request.visibility = Visibility::Private;
    request.preset = Some(RoomPreset::PrivateChat);
    request.invite = vec![bot_id.to_owned()];
    if encryption.is_some() {
        request.initial_state = vec![
            InitialStateEvent::new(RoomEncryptionEventContent::with_recommended_defaults())
                .to_raw_any(),
        ];
    }

    let room = client
        .create_room(request)
        .await
        .map_err(|e| CreateRoomError::InviteFailed(e.into()))?;
    let room_id = room.room_id().to_owned();
    info!("created bot room {}", room_id);

    if let Some(policy) = encryption {
        wait_for_encryption(&room, policy).await?;
    }

    Ok(BotRoom {
        room_id,
        existed: false,
    })
}

/// Polls the room state until an encryption event is observed, bounded by
/// the policy deadline.
async fn wait_for_encryption(room: &Room, policy: EncryptionPolicy) -> Result<(), CreateRoomError> {
    let deadline = Instant::now() + policy.setup_timeout;

    loop {
        match room.latest_encryption_state().await {
            Ok(state) if state.is_encrypted() => {
                debug!("room {} is encrypted", room.room_id());
                return Ok(());
            }
            Ok(_) => {}
            Err(e) => warn!(
                "failed to read encryption state of {}: {:?}",
                room.room_id(),
                e
            ),
        }

        if Instant::now() >= deadline {
            return Err(CreateRoomError::EncryptionSetupTimeout {
                room_id: room.room_id().to_string(),
                waited: policy.setup_timeout,
            });
        }
        sleep(policy.poll_interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn offline_client() -> Client {
        Client::builder()
            .homeserver_url("http://localhost:9")
            .build()
            .await
            .unwrap()
    }

    fn bot_id() -> &'static UserId {
        "@metabot:localhost".try_into().unwrap()
    }

    #[tokio::test]
    async fn test_empty_room_set_yields_no_snapshots() {
        let client = offline_client().await;
        assert!(snapshot_rooms(&client, bot_id()).await.is_empty());
    }

    #[tokio::test]
    async fn test_find_room_with_member_on_empty_room_set() {
        let client = offline_client().await;
        assert!(find_room_with_member(&client, bot_id()).await.is_none());
    }
}
