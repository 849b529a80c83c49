//! Conversation list for the home view: the group conversation followed by
//! every private conversation the user has history in, each with a preview
//! of its latest message.

use crate::bus::Event;
use crate::chat::{Conversation, ConversationId, ConversationKind, GROUP_DISPLAY_NAME};
use crate::entity::{User, UserId};
use crate::store::{MessageStore, UserDirectory};
use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use futures::Stream;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LastMessage {
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversationListEntry {
    pub conversation: Conversation,
    pub display_name: String,
    pub last_message: Option<LastMessage>,
}

/// User lookups memoized for a single aggregation pass.
struct UserCache<'a, D> {
    directory: &'a D,
    users: HashMap<UserId, Option<User>>,
}

impl<'a, D: UserDirectory> UserCache<'a, D> {
    fn new(directory: &'a D) -> Self {
        Self {
            directory,
            users: HashMap::new(),
        }
    }

    async fn resolve(&mut self, uid: &UserId) -> Result<Option<User>> {
        if let Some(cached) = self.users.get(uid) {
            return Ok(cached.clone());
        }
        let user = self.directory.lookup(uid).await?;
        self.users.insert(uid.clone(), user.clone());
        Ok(user)
    }
}

pub struct ConversationListAggregator<S> {
    store: Arc<S>,
}

impl<S> Clone for ConversationListAggregator<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<S: MessageStore + UserDirectory> ConversationListAggregator<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Compute the full list for `me`. Either every entry is produced or the
    /// pass fails as a whole.
    pub async fn aggregate(&self, me: &UserId) -> Result<Vec<ConversationListEntry>> {
        let records = self.store.private_conversations_for(me).await?;
        let mut users = UserCache::new(self.store.as_ref());

        let mut conversations = vec![(Conversation::group(), GROUP_DISPLAY_NAME.to_string())];
        for record in records {
            let Some(other) = record.counterpart(me) else {
                continue;
            };
            match users.resolve(other).await? {
                Some(user) => conversations.push((record.conversation(), user.display_name)),
                None => debug!(
                    conversation = %record.id,
                    counterpart = %other,
                    "skipping conversation with unknown user"
                ),
            }
        }

        let previews = try_join_all(
            conversations
                .iter()
                .map(|(conversation, _)| self.store.most_recent_message(conversation)),
        )
        .await?;

        Ok(conversations
            .into_iter()
            .zip(previews)
            .map(|((conversation, display_name), last)| ConversationListEntry {
                conversation,
                display_name,
                last_message: last.map(|m| LastMessage {
                    text: m.text,
                    timestamp: m.timestamp,
                }),
            })
            .collect())
    }

    /// Known users `me` could start a new private chat with.
    pub async fn start_chat_candidates(&self, me: &UserId) -> Result<Vec<User>> {
        let mut users: Vec<User> = self
            .store
            .all_known_users()
            .await?
            .into_iter()
            .filter(|u| &u.uid != me)
            .collect();
        users.sort_by(|a, b| {
            a.display_name
                .to_lowercase()
                .cmp(&b.display_name.to_lowercase())
                .then_with(|| a.uid.cmp(&b.uid))
        });
        Ok(users)
    }

    /// Recompute the list now and again after every relevant change.
    ///
    /// `refresh` also forces a pass periodically, which picks up writes the
    /// change bus cannot see.
    pub fn watch(
        &self,
        me: UserId,
        refresh: Duration,
    ) -> impl Stream<Item = Result<Vec<ConversationListEntry>>> + Send + 'static {
        let aggregator = self.clone();
        async_stream::stream! {
            let mut changes = aggregator.store.changes();
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + refresh, refresh);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut known: HashSet<ConversationId> = HashSet::new();

            loop {
                let pass = aggregator.aggregate(&me).await;
                if let Ok(entries) = &pass {
                    known = entries.iter().map(|e| e.conversation.id.clone()).collect();
                }
                yield pass;

                loop {
                    tokio::select! {
                        event = changes.recv() => match event {
                            Ok(event) if is_relevant(&event, &me, &known) => break,
                            Ok(_) => continue,
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                warn!(skipped, "conversation list fell behind, recomputing");
                                break;
                            }
                            Err(broadcast::error::RecvError::Closed) => return,
                        },
                        _ = ticker.tick() => break,
                    }
                }
            }
        }
    }
}

fn is_relevant(event: &Event, me: &UserId, known: &HashSet<ConversationId>) -> bool {
    match event {
        Event::MessageAppended { kind, conversation } => {
            *kind == ConversationKind::Group || known.contains(conversation)
        }
        Event::ConversationCreated { participants, .. } => participants.contains(me),
        Event::UserUpdated { .. } => true,
    }
}
