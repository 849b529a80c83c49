use crate::entity::{UserId, ID_SEPARATOR};
use crate::error::ChatError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Well-known id of the single group conversation.
pub const GROUP_CONVERSATION_ID: &str = "general";
pub const GROUP_DISPLAY_NAME: &str = "General Chat";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationId(String);

impl ConversationId {
    pub fn group() -> Self {
        Self(GROUP_CONVERSATION_ID.to_string())
    }

    /// Wraps an id read back from the store.
    pub(crate) fn from_stored(raw: String) -> Self {
        Self(raw)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Canonical id of the private conversation between `a` and `b`.
///
/// The smaller uid comes first, so both participants derive the same id no
/// matter who starts the chat. Self-chat is rejected here, before any I/O.
pub fn private_chat_id(a: &UserId, b: &UserId) -> Result<ConversationId, ChatError> {
    if a == b {
        return Err(ChatError::SelfConversation);
    }
    let (first, second) = if a < b { (a, b) } else { (b, a) };
    Ok(ConversationId(format!("{}{}{}", first, ID_SEPARATOR, second)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationKind {
    Group,
    Private,
}

impl ConversationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ConversationKind::Group => "group",
            ConversationKind::Private => "private",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub kind: ConversationKind,
    /// Both participants in canonical order for private chats, empty for the
    /// group (implicitly everyone).
    pub participants: Vec<UserId>,
}

impl Conversation {
    pub fn group() -> Self {
        Self {
            id: ConversationId::group(),
            kind: ConversationKind::Group,
            participants: Vec::new(),
        }
    }

    pub fn private(me: &UserId, other: &UserId) -> Result<Self, ChatError> {
        let id = private_chat_id(me, other)?;
        let mut participants = vec![me.clone(), other.clone()];
        participants.sort();
        Ok(Self {
            id,
            kind: ConversationKind::Private,
            participants,
        })
    }

    /// The participant that is not `me`, for private conversations.
    pub fn counterpart(&self, me: &UserId) -> Option<&UserId> {
        match self.kind {
            ConversationKind::Group => None,
            ConversationKind::Private => self.participants.iter().find(|p| *p != me),
        }
    }
}

/// What the presentation layer asks the session to open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversationTarget {
    Group,
    Private(UserId),
}

/// A persisted private conversation record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrivateConversation {
    pub id: ConversationId,
    pub participant_a: UserId,
    pub participant_b: UserId,
    pub created_at: DateTime<Utc>,
}

impl PrivateConversation {
    pub fn counterpart(&self, me: &UserId) -> Option<&UserId> {
        if &self.participant_a == me {
            Some(&self.participant_b)
        } else if &self.participant_b == me {
            Some(&self.participant_a)
        } else {
            None
        }
    }

    pub fn conversation(&self) -> Conversation {
        Conversation {
            id: self.id.clone(),
            kind: ConversationKind::Private,
            participants: vec![self.participant_a.clone(), self.participant_b.clone()],
        }
    }
}

/// A stored message. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub conversation_id: ConversationId,
    pub text: String,
    pub sender_id: UserId,
    /// Sender's display name at send time.
    pub sender_name: String,
    /// Assigned by the store.
    pub timestamp: DateTime<Utc>,
}

/// Payload handed to the store on send; id and timestamp are assigned there.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub text: String,
    pub sender_id: UserId,
    pub sender_name: String,
}

/// Sort by timestamp, ties broken by store-assigned id.
pub fn order_messages(messages: &mut [ChatMessage]) {
    messages.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn uid(s: &str) -> UserId {
        UserId::parse(s).unwrap()
    }

    #[test]
    fn private_id_is_commutative() {
        let pairs = [("a", "b"), ("alice", "bob"), ("Zed", "amy"), ("u1", "u10")];
        for (x, y) in pairs {
            assert_eq!(
                private_chat_id(&uid(x), &uid(y)).unwrap(),
                private_chat_id(&uid(y), &uid(x)).unwrap()
            );
        }
    }

    #[test]
    fn private_id_differs_per_counterpart() {
        let a = uid("a");
        assert_ne!(
            private_chat_id(&a, &uid("b")).unwrap(),
            private_chat_id(&a, &uid("c")).unwrap()
        );
        // "ab" + "c" must not collide with "a" + "bc"
        assert_ne!(
            private_chat_id(&uid("ab"), &uid("c")).unwrap(),
            private_chat_id(&uid("a"), &uid("bc")).unwrap()
        );
    }

    #[test]
    fn private_id_orders_lexicographically() {
        let id = private_chat_id(&uid("b"), &uid("a")).unwrap();
        assert_eq!(id.as_str(), "a_b");
    }

    #[test]
    fn self_chat_is_rejected() {
        let err = private_chat_id(&uid("a"), &uid("a")).unwrap_err();
        assert!(matches!(err, ChatError::SelfConversation));
        assert!(err.is_contract_violation());
    }

    #[test]
    fn private_conversation_knows_counterpart() {
        let conv = Conversation::private(&uid("b"), &uid("a")).unwrap();
        assert_eq!(conv.participants, vec![uid("a"), uid("b")]);
        assert_eq!(conv.counterpart(&uid("b")), Some(&uid("a")));
        assert_eq!(conv.counterpart(&uid("a")), Some(&uid("b")));
        assert_eq!(Conversation::group().counterpart(&uid("a")), None);
    }

    #[test]
    fn ordering_breaks_ties_by_id() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let msg = |id: &str, secs: i64| ChatMessage {
            id: id.to_string(),
            conversation_id: ConversationId::group(),
            text: "x".into(),
            sender_id: uid("a"),
            sender_name: "A".into(),
            timestamp: ts + chrono::Duration::seconds(secs),
        };
        let mut messages = vec![msg("z", 1), msg("b", 0), msg("a", 1)];
        order_messages(&mut messages);
        let ids: Vec<_> = messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["b", "a", "z"]);
    }
}
