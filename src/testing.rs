//! In-memory collaborators with scripted behaviour for unit tests.

use crate::bus::{Event, EventBus};
use crate::chat::{
    ChatMessage, Conversation, ConversationId, NewMessage, PrivateConversation,
};
use crate::entity::{User, UserId};
use crate::store::{Feed, FeedUpdate, MessageStore, UserDirectory};
use anyhow::{bail, Result};
use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::{broadcast, mpsc};

pub fn uid(s: &str) -> UserId {
    UserId::parse(s).unwrap()
}

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap() + chrono::Duration::seconds(secs)
}

/// A group message with the given id, stamped `secs` after a fixed base time.
pub fn message(id: &str, secs: i64) -> ChatMessage {
    ChatMessage {
        id: id.to_string(),
        conversation_id: ConversationId::group(),
        text: format!("text of {}", id),
        sender_id: uid("someone"),
        sender_name: "Someone".to_string(),
        timestamp: at(secs),
    }
}

#[derive(Default)]
struct State {
    feeds: HashMap<ConversationId, mpsc::Sender<FeedUpdate>>,
    messages: HashMap<ConversationId, Vec<ChatMessage>>,
    records: Vec<PrivateConversation>,
    users: HashMap<UserId, User>,
    subscriptions: Vec<ConversationId>,
    lookups: Vec<UserId>,
}

/// Fake message store and user directory.
///
/// In manual mode (`new`) feeds only carry what the test pushes. In live mode
/// (`live`) every subscription gets the current history right away and a new
/// snapshot after each append, like the real store.
pub struct FakeStore {
    state: Mutex<State>,
    live: bool,
    clock: AtomicUsize,
    fail_appends: AtomicBool,
    fail_reads: AtomicBool,
    bus: EventBus,
}

impl FakeStore {
    pub fn new() -> Self {
        Self::with_mode(false)
    }

    pub fn live() -> Self {
        Self::with_mode(true)
    }

    fn with_mode(live: bool) -> Self {
        Self {
            state: Mutex::new(State::default()),
            live,
            clock: AtomicUsize::new(0),
            fail_appends: AtomicBool::new(false),
            fail_reads: AtomicBool::new(false),
            bus: EventBus::new(),
        }
    }

    /// Push an update into the most recent feed opened for `conversation`.
    pub fn push(&self, conversation: &ConversationId, update: FeedUpdate) {
        let tx = self.state.lock().unwrap().feeds.get(conversation).cloned();
        if let Some(tx) = tx {
            let _ = tx.try_send(update);
        }
    }

    pub fn add_user(&self, uid_str: &str, name: &str) {
        let user = User::new(uid(uid_str), name, format!("{}@example.com", uid_str));
        self.state.lock().unwrap().users.insert(user.uid.clone(), user);
    }

    /// Seed a message without notifying anyone.
    pub fn seed(&self, conversation: &Conversation, message: ChatMessage) {
        let mut state = self.state.lock().unwrap();
        state
            .messages
            .entry(conversation.id.clone())
            .or_default()
            .push(message);
    }

    pub fn seed_record(&self, a: &str, b: &str) {
        let conversation = Conversation::private(&uid(a), &uid(b)).unwrap();
        self.state.lock().unwrap().records.push(PrivateConversation {
            id: conversation.id,
            participant_a: conversation.participants[0].clone(),
            participant_b: conversation.participants[1].clone(),
            created_at: at(0),
        });
    }

    pub fn fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::SeqCst);
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn records(&self) -> Vec<PrivateConversation> {
        self.state.lock().unwrap().records.clone()
    }

    pub fn history(&self, conversation: &ConversationId) -> Vec<ChatMessage> {
        self.state
            .lock()
            .unwrap()
            .messages
            .get(conversation)
            .cloned()
            .unwrap_or_default()
    }

    /// Conversation ids in the order they were subscribed to.
    pub fn subscriptions(&self) -> Vec<ConversationId> {
        self.state.lock().unwrap().subscriptions.clone()
    }

    pub fn lookups(&self) -> Vec<UserId> {
        self.state.lock().unwrap().lookups.clone()
    }

    fn snapshot(&self, conversation: &ConversationId) -> Vec<ChatMessage> {
        let mut messages = self.history(conversation);
        crate::chat::order_messages(&mut messages);
        messages
    }
}

impl MessageStore for FakeStore {
    fn subscribe(&self, conversation: &Conversation) -> Feed {
        let (tx, rx) = mpsc::channel(64);
        if self.live {
            let _ = tx.try_send(Ok(self.snapshot(&conversation.id)));
        }
        let mut state = self.state.lock().unwrap();
        state.feeds.insert(conversation.id.clone(), tx);
        state.subscriptions.push(conversation.id.clone());
        Feed::new(rx, None)
    }

    async fn append(
        &self,
        conversation: &Conversation,
        message: NewMessage,
    ) -> Result<ChatMessage> {
        tokio::task::yield_now().await;
        if self.fail_appends.load(Ordering::SeqCst) {
            bail!("store unavailable");
        }
        let tick = self.clock.fetch_add(1, Ordering::SeqCst) as i64;
        let stored = ChatMessage {
            id: format!("srv-{:04}", tick),
            conversation_id: conversation.id.clone(),
            text: message.text,
            sender_id: message.sender_id,
            sender_name: message.sender_name,
            timestamp: at(1000 + tick),
        };
        self.seed(conversation, stored.clone());
        if self.live {
            self.push(&conversation.id, Ok(self.snapshot(&conversation.id)));
        }
        self.bus.publish(Event::MessageAppended {
            kind: conversation.kind,
            conversation: conversation.id.clone(),
        });
        Ok(stored)
    }

    async fn ensure_conversation_record(&self, conversation: &Conversation) -> Result<bool> {
        // Give concurrent callers a chance to interleave.
        tokio::task::yield_now().await;
        let mut state = self.state.lock().unwrap();
        if state.records.iter().any(|r| r.id == conversation.id) {
            return Ok(false);
        }
        state.records.push(PrivateConversation {
            id: conversation.id.clone(),
            participant_a: conversation.participants[0].clone(),
            participant_b: conversation.participants[1].clone(),
            created_at: Utc::now(),
        });
        drop(state);
        self.bus.publish(Event::ConversationCreated {
            conversation: conversation.id.clone(),
            participants: conversation.participants.clone(),
        });
        Ok(true)
    }

    async fn most_recent_message(
        &self,
        conversation: &Conversation,
    ) -> Result<Option<ChatMessage>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            bail!("read failed");
        }
        Ok(self.snapshot(&conversation.id).pop())
    }

    async fn private_conversations_for(&self, uid: &UserId) -> Result<Vec<PrivateConversation>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .records
            .iter()
            .filter(|r| r.counterpart(uid).is_some())
            .cloned()
            .collect())
    }

    fn changes(&self) -> broadcast::Receiver<Event> {
        self.bus.subscribe()
    }
}

impl UserDirectory for FakeStore {
    async fn lookup(&self, uid: &UserId) -> Result<Option<User>> {
        let mut state = self.state.lock().unwrap();
        state.lookups.push(uid.clone());
        Ok(state.users.get(uid).cloned())
    }

    async fn all_known_users(&self) -> Result<Vec<User>> {
        let state = self.state.lock().unwrap();
        Ok(state.users.values().cloned().collect())
    }
}
