//! Collaborator contracts the conversation core depends on, plus the SQLite
//! implementation used by the binary.

pub mod sqlite;

use crate::bus::Event;
use crate::chat::{ChatMessage, Conversation, NewMessage, PrivateConversation};
use crate::entity::{User, UserId};
use anyhow::Result;
use std::future::Future;
use tokio::sync::{broadcast, mpsc};
use tokio::task::AbortHandle;

pub use sqlite::Store;

/// One item pushed by a store feed: the complete ordered message sequence, or
/// a read error after which the feed delivers nothing more.
pub type FeedUpdate = Result<Vec<ChatMessage>>;

/// Live feed of one conversation's messages as produced by a [`MessageStore`].
///
/// Dropping the feed stops the producer.
pub struct Feed {
    updates: mpsc::Receiver<FeedUpdate>,
    producer: Option<AbortHandle>,
}

impl Feed {
    pub fn new(updates: mpsc::Receiver<FeedUpdate>, producer: Option<AbortHandle>) -> Self {
        Self { updates, producer }
    }

    pub async fn next(&mut self) -> Option<FeedUpdate> {
        self.updates.recv().await
    }
}

impl Drop for Feed {
    fn drop(&mut self) {
        if let Some(producer) = self.producer.take() {
            producer.abort();
        }
    }
}

/// Persisted, append-only message store with push notification on append.
pub trait MessageStore: Send + Sync + 'static {
    /// Start listening to a conversation. The first item is the full snapshot
    /// ordered ascending by timestamp; later items are full re-renders.
    fn subscribe(&self, conversation: &Conversation) -> Feed;

    /// Append a message; the store assigns id and timestamp.
    fn append(
        &self,
        conversation: &Conversation,
        message: NewMessage,
    ) -> impl Future<Output = Result<ChatMessage>> + Send;

    /// Create the private conversation record if absent. Returns whether it
    /// was created by this call.
    fn ensure_conversation_record(
        &self,
        conversation: &Conversation,
    ) -> impl Future<Output = Result<bool>> + Send;

    /// Latest timestamped message of a conversation, if any.
    fn most_recent_message(
        &self,
        conversation: &Conversation,
    ) -> impl Future<Output = Result<Option<ChatMessage>>> + Send;

    /// Private conversation records `uid` participates in, in query order.
    fn private_conversations_for(
        &self,
        uid: &UserId,
    ) -> impl Future<Output = Result<Vec<PrivateConversation>>> + Send;

    /// Change notifications used to drive list recomputation.
    fn changes(&self) -> broadcast::Receiver<Event>;
}

/// Directory of known users.
pub trait UserDirectory: Send + Sync + 'static {
    fn lookup(&self, uid: &UserId) -> impl Future<Output = Result<Option<User>>> + Send;

    fn all_known_users(&self) -> impl Future<Output = Result<Vec<User>>> + Send;
}
