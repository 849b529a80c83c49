//! The active conversation of one user: which conversation is open, its live
//! message sequence, and sending into it.
//!
//! Every switch bumps an epoch. The previous subscription is closed before
//! the next one opens, and any delivery whose epoch is not the current one is
//! dropped instead of applied.

use crate::bus::NotificationLevel;
use crate::chat::{
    ChatMessage, Conversation, ConversationId, ConversationKind, ConversationTarget, NewMessage,
};
use crate::entity::User;
use crate::error::ChatError;
use crate::store::MessageStore;
use crate::subscription::{Delivery, MessageSubscription};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    /// No conversation selected.
    Idle,
    /// Subscription opened, no snapshot yet.
    Loading,
    /// Messages are current.
    Live,
    /// The feed failed; the last known messages are kept for display.
    Errored,
}

/// Dismissible notice for the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notice {
    pub level: NotificationLevel,
    pub message: String,
}

pub struct ConversationSession<S> {
    store: Arc<S>,
    me: User,
    state: SessionState,
    selected: Option<Conversation>,
    messages: Vec<ChatMessage>,
    epoch: u64,
    subscription: Option<MessageSubscription>,
    deliveries_tx: mpsc::UnboundedSender<Delivery>,
    deliveries_rx: mpsc::UnboundedReceiver<Delivery>,
    /// Private conversations known to have a persisted record.
    materialized: HashSet<ConversationId>,
    notice: Option<Notice>,
}

impl<S: MessageStore> ConversationSession<S> {
    pub fn new(store: Arc<S>, me: User) -> Self {
        let (deliveries_tx, deliveries_rx) = mpsc::unbounded_channel();
        Self {
            store,
            me,
            state: SessionState::Idle,
            selected: None,
            messages: Vec::new(),
            epoch: 0,
            subscription: None,
            deliveries_tx,
            deliveries_rx,
            materialized: HashSet::new(),
            notice: None,
        }
    }

    pub fn me(&self) -> &User {
        &self.me
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn conversation(&self) -> Option<&Conversation> {
        self.selected.as_ref()
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn notice(&self) -> Option<&Notice> {
        self.notice.as_ref()
    }

    pub fn dismiss_notice(&mut self) {
        self.notice = None;
    }

    /// The profile changed elsewhere; later sends use the new name.
    pub fn set_display_name(&mut self, display_name: impl Into<String>) {
        self.me.display_name = display_name.into();
    }

    /// Open `target`, closing the current subscription first.
    ///
    /// Returns `Ok(false)` when the target is already selected.
    pub fn select_conversation(&mut self, target: ConversationTarget) -> Result<bool, ChatError> {
        let conversation = match target {
            ConversationTarget::Group => Conversation::group(),
            ConversationTarget::Private(other) => Conversation::private(&self.me.uid, &other)?,
        };

        if self.selected.as_ref().map(|c| &c.id) == Some(&conversation.id) {
            debug!(conversation = %conversation.id, "already selected");
            return Ok(false);
        }

        self.messages.clear();
        self.notice = None;
        self.open(conversation);
        Ok(true)
    }

    /// Re-open the selected conversation, typically after an error.
    /// Messages already shown are kept until the new snapshot arrives.
    pub fn retry(&mut self) -> bool {
        let Some(conversation) = self.selected.clone() else {
            return false;
        };
        self.notice = None;
        self.open(conversation);
        true
    }

    /// Close the conversation and go back to `Idle`.
    pub fn leave(&mut self) {
        self.teardown();
        self.epoch += 1;
        self.selected = None;
        self.messages.clear();
        self.notice = None;
        self.state = SessionState::Idle;
    }

    fn open(&mut self, conversation: Conversation) {
        // Close before open: the old feed must be silent before the new one
        // can deliver anything.
        self.teardown();
        self.epoch += 1;

        info!(conversation = %conversation.id, epoch = self.epoch, "opening conversation");
        self.subscription = Some(MessageSubscription::open(
            self.store.as_ref(),
            &conversation,
            self.epoch,
            self.deliveries_tx.clone(),
        ));
        self.selected = Some(conversation);
        self.state = SessionState::Loading;
    }

    fn teardown(&mut self) {
        if let Some(mut subscription) = self.subscription.take() {
            subscription.close();
        }
    }

    /// Wait for the next delivery and apply it. Returns whether it changed
    /// the session.
    pub async fn process_next(&mut self) -> bool {
        match self.deliveries_rx.recv().await {
            Some(delivery) => self.apply(delivery),
            // The session owns a sender, so this cannot happen.
            None => false,
        }
    }

    pub fn apply(&mut self, delivery: Delivery) -> bool {
        if delivery.epoch != self.epoch {
            debug!(
                conversation = %delivery.conversation,
                stale = delivery.epoch,
                current = self.epoch,
                "dropping delivery from a closed subscription"
            );
            return false;
        }

        match delivery.update {
            Ok(messages) => {
                self.messages = messages;
                self.state = SessionState::Live;
            }
            Err(e) => {
                warn!(conversation = %delivery.conversation, "message feed failed: {:#}", e);
                self.teardown();
                self.state = SessionState::Errored;
                self.notice = Some(Notice {
                    level: NotificationLevel::Error,
                    message: format!("Could not load messages: {:#}", e),
                });
            }
        }
        true
    }

    /// Send `text` to the selected conversation.
    ///
    /// For a private conversation the record is created first if it does not
    /// exist yet. The caller keeps its draft on error so the user can resend.
    pub async fn send(&mut self, text: &str) -> Result<ChatMessage, ChatError> {
        if text.trim().is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        let conversation = self
            .selected
            .clone()
            .ok_or(ChatError::NoConversationSelected)?;

        if conversation.kind == ConversationKind::Private
            && !self.materialized.contains(&conversation.id)
        {
            let created = self
                .store
                .ensure_conversation_record(&conversation)
                .await
                .map_err(ChatError::Materialize)?;
            debug!(conversation = %conversation.id, created, "conversation record ensured");
            self.materialized.insert(conversation.id.clone());
        }

        let message = self
            .store
            .append(
                &conversation,
                NewMessage {
                    text: text.to_string(),
                    sender_id: self.me.uid.clone(),
                    sender_name: self.me.display_name.clone(),
                },
            )
            .await
            .map_err(ChatError::Send)?;

        debug!(conversation = %conversation.id, id = %message.id, "message sent");
        Ok(message)
    }
}

impl<S> Drop for ConversationSession<S> {
    fn drop(&mut self) {
        if let Some(mut subscription) = self.subscription.take() {
            subscription.close();
        }
    }
}
