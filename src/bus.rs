use crate::chat::{ConversationId, ConversationKind};
use crate::entity::UserId;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Event {
    /// A message was appended to a conversation
    MessageAppended {
        kind: ConversationKind,
        conversation: ConversationId,
    },

    /// A private conversation record was created
    ConversationCreated {
        conversation: ConversationId,
        participants: Vec<UserId>,
    },

    /// A user's profile changed (e.g. display name)
    UserUpdated { uid: UserId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(256);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: Event) {
        // No receivers is fine
        let _ = self.tx.send(event);
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

    #[tokio::test]
    async fn publish_without_receivers_is_ok() {
        let bus = EventBus::new();
        bus.publish(Event::UserUpdated {
            uid: UserId::parse("a").unwrap(),
        });

        let mut rx = bus.subscribe();
        bus.publish(Event::MessageAppended {
            kind: ConversationKind::Group,
            conversation: ConversationId::group(),
        });
        assert!(matches!(
            rx.recv().await.unwrap(),
            Event::MessageAppended { kind: ConversationKind::Group, .. }
        ));
    }

    #[test]
    fn events_serialize_tagged() {
        let event = Event::MessageAppended {
            kind: ConversationKind::Private,
            conversation: ConversationId::group(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "MessageAppended");
        assert_eq!(json["data"]["kind"], "private");
    }
}
