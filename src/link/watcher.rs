//! Live timeline watching for bridge-bot replies.
//!
//! A watch attaches three event handlers to a user's synced client: a
//! message handler filtered to the bot room and the bot sender, a
//! room-creation handler that spots newly bridged rooms, and an auto-join
//! handler for the invites the bridge sends when portal rooms appear.
//!
//! Every handler receives an explicit [`WatchContext`] through the client's
//! handler context instead of capturing loop variables, and checks the
//! context's cancellation flag before doing anything. Stopping the returned
//! [`WatchHandle`] flips that flag first and then deregisters the handlers
//! through the sync engine, so no domain event fires after `stop` returns.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use log::{error, info, warn};
use matrix_sdk::{
    Client, Room, RoomMemberships, RoomState,
    event_handler::Ctx,
    ruma::{
        OwnedRoomId, OwnedUserId,
        events::room::{
            create::OriginalSyncRoomCreateEvent,
            member::StrippedRoomMemberEvent,
            message::{MessageType, OriginalSyncRoomMessageEvent},
        },
    },
};
use tokio::time::{Duration, sleep};

use crate::{
    events::{DomainEvent, EventBus},
    link::matcher::LoginMatcher,
    matrix::sync::SyncEngine,
    utils::now_millis,
};

/// Context record passed into every watch handler invocation.
#[derive(Clone)]
pub struct WatchContext {
    /// Local user the watch belongs to.
    pub local_user_id: String,
    /// The 1:1 bot room being watched.
    pub room_id: OwnedRoomId,
    /// The bridge bot's Matrix ID.
    pub bot_id: OwnedUserId,
    /// User-id prefix of bridged ghost accounts.
    pub ghost_prefix: String,
    /// Reply pattern matcher.
    pub matcher: Arc<LoginMatcher>,
    /// Bus the domain events are published on.
    pub bus: EventBus,
    /// Cleared on `stop`; handlers emit nothing once false.
    pub active: Arc<AtomicBool>,
    /// Schedules a best-effort cache reconciliation pass.
    pub reconcile: Arc<dyn Fn() + Send + Sync>,
}

/// Owner handle for one user's active watch.
///
/// Returned by [`attach`] and held by the caller; dropping or stopping it
/// tears the watch down. One handle per user is expected, and starting a
/// replacement watch must stop the previous handle first.
pub struct WatchHandle {
    local_user_id: String,
    engine: SyncEngine,
    active: Arc<AtomicBool>,
}

impl WatchHandle {
    /// The local user this watch belongs to.
    pub fn user_id(&self) -> &str {
        &self.local_user_id
    }

    /// Cancels the watch: no event fires after this returns, and the
    /// underlying sync engine is stopped. Safe to call more than once.
    pub fn stop(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.engine.stop();
        info!("stopped watch for {}", self.local_user_id);
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.active.store(false, Ordering::SeqCst);
    }
}

/// Attaches the watch handlers to a started engine and returns the owning
/// handle.
///
/// The engine must already have completed its first sync pass so the
/// handlers only observe new timeline events.
pub fn attach(engine: SyncEngine, context: WatchContext) -> WatchHandle {
    let local_user_id = context.local_user_id.clone();
    let active = Arc::clone(&context.active);

    let client = engine.client();
    client.add_event_handler_context(context);

    let handle = client.add_event_handler(on_bot_message);
    engine.track_handler(handle);
    let handle = client.add_event_handler(on_room_created);
    engine.track_handler(handle);
    let handle = client.add_event_handler(auto_join_invites);
    engine.track_handler(handle);

    info!("watching bot replies for {}", local_user_id);

    WatchHandle {
        local_user_id,
        engine,
        active,
    }
}

/// Timeline handler for replies from the bridge bot.
async fn on_bot_message(
    event: OriginalSyncRoomMessageEvent,
    room: Room,
    Ctx(ctx): Ctx<WatchContext>,
) {
    if room.state() != RoomState::Joined {
        return;
    }
    if room.room_id() != &*ctx.room_id {
        return;
    }
    if event.sender != ctx.bot_id {
        return;
    }
    let MessageType::Text(text) = event.content.msgtype else {
        return;
    };

    handle_bot_body(&ctx, room.room_id().as_str(), &text.body);
}

/// Shared reply processing, split out from the handler so the matching and
/// cancellation semantics are testable without a homeserver.
fn handle_bot_body(ctx: &WatchContext, room_id: &str, body: &str) {
    if !ctx.active.load(Ordering::SeqCst) {
        return;
    }

    if let Some(url) = ctx.matcher.extract_login_url(body) {
        info!("found login url for {} in {}", ctx.local_user_id, room_id);
        ctx.bus.emit(DomainEvent::LoginUrlFound {
            user_id: ctx.local_user_id.clone(),
            room_id: room_id.to_owned(),
            url,
            timestamp: now_millis(),
        });
    }

    if ctx.matcher.is_login_success(body) {
        info!("login confirmed for {}", ctx.local_user_id);
        ctx.bus.emit(DomainEvent::LoginSucceeded {
            user_id: ctx.local_user_id.clone(),
            room_id: room_id.to_owned(),
            timestamp: now_millis(),
        });
        (ctx.reconcile)();
    }
}

/// Room-state handler that spots newly bridged rooms by their ghost members.
async fn on_room_created(
    _event: OriginalSyncRoomCreateEvent,
    room: Room,
    Ctx(ctx): Ctx<WatchContext>,
) {
    if !ctx.active.load(Ordering::SeqCst) {
        return;
    }

    let members = match room.members(RoomMemberships::ACTIVE).await {
        Ok(members) => members,
        Err(e) => {
            warn!("failed to load members of {}: {:?}", room.room_id(), e);
            return;
        }
    };

    let is_bridged = members
        .iter()
        .any(|member| member.user_id().as_str().starts_with(&ctx.ghost_prefix));
    if !is_bridged {
        return;
    }

    // Re-check after the await; the watch may have been cancelled meanwhile.
    if !ctx.active.load(Ordering::SeqCst) {
        return;
    }

    let room_name = match room.display_name().await {
        Ok(name) => name.to_string(),
        Err(_) => room.room_id().to_string(),
    };

    info!("new bridged room {} for {}", room.room_id(), ctx.local_user_id);
    ctx.bus.emit(DomainEvent::NewLinkedRoomDetected {
        user_id: ctx.local_user_id.clone(),
        room_id: room.room_id().to_string(),
        room_name,
        timestamp: now_millis(),
    });
    (ctx.reconcile)();
}

/// Joins rooms the user is invited to while the watch is active; the bridge
/// invites the user into each portal room it creates.
///
/// Retries with backoff because the invite can arrive before the server
/// accepts the join, see
/// <https://github.com/matrix-org/synapse/issues/4345>.
async fn auto_join_invites(
    event: StrippedRoomMemberEvent,
    client: Client,
    room: Room,
    Ctx(ctx): Ctx<WatchContext>,
) {
    if !ctx.active.load(Ordering::SeqCst) {
        return;
    }

    let Some(user_id) = client.user_id() else {
        warn!("could not get user id from client");
        return;
    };

    // Ignore invites addressed to someone else
    if event.state_key != user_id {
        return;
    }

    let active = Arc::clone(&ctx.active);
    tokio::spawn(async move {
        info!("auto joining room {}", room.room_id());
        let mut delay = 2;

        while let Err(err) = room.join().await {
            warn!(
                "failed to join room {} ({err:?}), retrying in {delay}s",
                room.room_id()
            );

            sleep(Duration::from_secs(delay)).await;
            delay *= 2;

            if delay > 64 || !active.load(Ordering::SeqCst) {
                error!("giving up joining room {} ({err:?})", room.room_id());
                return;
            }
        }
        info!("joined room {}", room.room_id());
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn context(bus: EventBus, reconciles: Arc<AtomicUsize>) -> WatchContext {
        let counter = Arc::clone(&reconciles);
        WatchContext {
            local_user_id: "alice".to_owned(),
            room_id: "!bot:localhost".try_into().unwrap(),
            bot_id: "@metabot:localhost".try_into().unwrap(),
            ghost_prefix: "@instagram_".to_owned(),
            matcher: Arc::new(
                LoginMatcher::new(
                    "instagram.com",
                    vec![
                        "Successfully logged in".to_owned(),
                        "Login successful".to_owned(),
                    ],
                )
                .unwrap(),
            ),
            bus,
            active: Arc::new(AtomicBool::new(true)),
            reconcile: Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        }
    }

    #[tokio::test]
    async fn test_url_reply_emits_exactly_one_event() {
        let bus = EventBus::new();
        let mut events = bus.subscribe();
        let reconciles = Arc::new(AtomicUsize::new(0));
        let ctx = context(bus, Arc::clone(&reconciles));

        handle_bot_body(
            &ctx,
            "!bot:localhost",
            "Please login: https://instagram.com/accounts/login/?next=/",
        );

        match events.try_recv().unwrap() {
            DomainEvent::LoginUrlFound { url, user_id, .. } => {
                assert_eq!(url, "https://instagram.com/accounts/login/?next=/");
                assert_eq!(user_id, "alice");
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(events.try_recv().is_err());
        assert_eq!(reconciles.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_success_reply_emits_and_triggers_reconciliation() {
        let bus = EventBus::new();
        let mut events = bus.subscribe();
        let reconciles = Arc::new(AtomicUsize::new(0));
        let ctx = context(bus, Arc::clone(&reconciles));

        handle_bot_body(&ctx, "!bot:localhost", "Successfully logged in as alice");

        assert!(matches!(
            events.try_recv().unwrap(),
            DomainEvent::LoginSucceeded { .. }
        ));
        assert!(events.try_recv().is_err());
        assert_eq!(reconciles.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_waiting_reply_emits_nothing() {
        let bus = EventBus::new();
        let mut events = bus.subscribe();
        let reconciles = Arc::new(AtomicUsize::new(0));
        let ctx = context(bus, Arc::clone(&reconciles));

        handle_bot_body(&ctx, "!bot:localhost", "Still waiting for login");

        assert!(events.try_recv().is_err());
        assert_eq!(reconciles.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancelled_context_emits_nothing() {
        let bus = EventBus::new();
        let mut events = bus.subscribe();
        let reconciles = Arc::new(AtomicUsize::new(0));
        let ctx = context(bus, Arc::clone(&reconciles));

        ctx.active.store(false, Ordering::SeqCst);
        handle_bot_body(
            &ctx,
            "!bot:localhost",
            "Successfully logged in as alice, https://instagram.com/x",
        );

        assert!(events.try_recv().is_err());
        assert_eq!(reconciles.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stop_clears_the_active_flag_and_engine_handlers() {
        let client = Client::builder()
            .homeserver_url("http://localhost:9")
            .build()
            .await
            .unwrap();
        let engine = SyncEngine::new(client);
        let bus = EventBus::new();
        let reconciles = Arc::new(AtomicUsize::new(0));
        let ctx = context(bus, reconciles);
        let active = Arc::clone(&ctx.active);

        let handle = attach(engine, ctx);
        assert!(active.load(Ordering::SeqCst));

        handle.stop();
        assert!(!active.load(Ordering::SeqCst));
        handle.stop();
    }
}
