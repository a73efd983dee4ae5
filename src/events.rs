//! Process-wide event bus carrying domain notifications.
//!
//! The bot conversation layer publishes [`DomainEvent`]s here and external
//! consumers (the CLI today, a push fan-out in a larger deployment) subscribe
//! to them. Events are transient: a subscriber that connects after an event
//! was published misses it, and nothing is persisted.
//!
//! A single bus instance serves the whole process. Every sync loop this
//! process runs belongs to this broker, so each event is produced exactly
//! once here; routing across horizontally scaled instances is left to the
//! deployment.

use log::debug;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Default capacity of the broadcast channel.
///
/// Link flows produce a handful of events per user, so lag at this capacity
/// means a stuck subscriber rather than a bursty producer.
const BUS_CAPACITY: usize = 256;

/// Domain-level notification fanned out to subscribers.
///
/// Timestamps are milliseconds since the Unix epoch, stamped at emission.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    /// The bridge bot replied with an external-service login URL.
    LoginUrlFound {
        user_id: String,
        room_id: String,
        url: String,
        timestamp: u64,
    },

    /// The bridge bot confirmed the external account is linked.
    LoginSucceeded {
        user_id: String,
        room_id: String,
        timestamp: u64,
    },

    /// A freshly bridged room appeared in the user's room set.
    NewLinkedRoomDetected {
        user_id: String,
        room_id: String,
        room_name: String,
        timestamp: u64,
    },
}

impl DomainEvent {
    /// The local user this event belongs to.
    pub fn user_id(&self) -> &str {
        match self {
            DomainEvent::LoginUrlFound { user_id, .. } => user_id,
            DomainEvent::LoginSucceeded { user_id, .. } => user_id,
            DomainEvent::NewLinkedRoomDetected { user_id, .. } => user_id,
        }
    }

    /// A short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            DomainEvent::LoginUrlFound { .. } => "login_url_found",
            DomainEvent::LoginSucceeded { .. } => "login_succeeded",
            DomainEvent::NewLinkedRoomDetected { .. } => "new_linked_room",
        }
    }
}

/// In-process publish/subscribe channel for [`DomainEvent`]s.
///
/// Cloning the bus is cheap and every clone publishes into the same channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<DomainEvent>,
}

impl EventBus {
    /// Creates a bus with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(BUS_CAPACITY)
    }

    /// Creates a bus with a custom capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        EventBus { sender }
    }

    /// Publishes an event to all current subscribers.
    ///
    /// Returns the number of subscribers that received it. Zero subscribers
    /// is not an error; events published before anyone listens are dropped.
    pub fn emit(&self, event: DomainEvent) -> usize {
        let kind = event.kind();
        let user_id = event.user_id().to_owned();

        match self.sender.send(event) {
            Ok(count) => {
                debug!("emitted {} for user {} to {} subscribers", kind, user_id, count);
                count
            }
            Err(_) => {
                debug!("emitted {} for user {} with no subscribers", kind, user_id);
                0
            }
        }
    }

    /// Subscribes to all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.sender.subscribe()
    }

    /// Number of currently attached subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url_event(user: &str) -> DomainEvent {
        DomainEvent::LoginUrlFound {
            user_id: user.to_owned(),
            room_id: "!room:localhost".to_owned(),
            url: "https://instagram.com/accounts/login/".to_owned(),
            timestamp: 1_700_000_000_000,
        }
    }

    #[test]
    fn test_emit_with_no_subscribers_returns_zero() {
        let bus = EventBus::new();
        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(bus.emit(url_event("alice")), 0);
    }

    #[tokio::test]
    async fn test_all_subscribers_receive_the_event() {
        let bus = EventBus::new();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        assert_eq!(bus.emit(url_event("alice")), 2);

        let received = first.recv().await.unwrap();
        assert_eq!(received.user_id(), "alice");
        assert_eq!(received.kind(), "login_url_found");

        let received = second.recv().await.unwrap();
        assert!(matches!(received, DomainEvent::LoginUrlFound { .. }));
    }

    #[tokio::test]
    async fn test_late_subscriber_misses_earlier_events() {
        let bus = EventBus::new();
        bus.emit(url_event("alice"));

        let mut late = bus.subscribe();
        bus.emit(DomainEvent::LoginSucceeded {
            user_id: "alice".to_owned(),
            room_id: "!room:localhost".to_owned(),
            timestamp: 1_700_000_000_001,
        });

        let received = late.recv().await.unwrap();
        assert_eq!(received.kind(), "login_succeeded");
        assert!(late.try_recv().is_err());
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let serialized = serde_json::to_string(&url_event("alice")).unwrap();
        assert!(serialized.contains(r#""type":"login_url_found""#));
        assert!(serialized.contains("alice"));
    }
}
