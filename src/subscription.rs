//! An owned, explicitly closed binding to one conversation's message feed.

use crate::chat::{order_messages, Conversation, ConversationId};
use crate::store::{FeedUpdate, MessageStore};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// A feed item tagged with the epoch of the subscription that produced it.
#[derive(Debug)]
pub struct Delivery {
    pub epoch: u64,
    pub conversation: ConversationId,
    pub update: FeedUpdate,
}

type Sink = Arc<Mutex<Option<mpsc::UnboundedSender<Delivery>>>>;

/// Forwards full ordered snapshots from a store feed into a session's
/// delivery channel until [`close`](Self::close) is called.
///
/// A read error is forwarded once and ends the subscription; nothing is
/// retried here.
pub struct MessageSubscription {
    conversation: ConversationId,
    epoch: u64,
    sink: Sink,
    forwarder: Option<JoinHandle<()>>,
}

impl MessageSubscription {
    pub fn open<S: MessageStore>(
        store: &S,
        conversation: &Conversation,
        epoch: u64,
        sink: mpsc::UnboundedSender<Delivery>,
    ) -> Self {
        let mut feed = store.subscribe(conversation);
        let sink: Sink = Arc::new(Mutex::new(Some(sink)));
        let forward_sink = sink.clone();
        let conversation_id = conversation.id.clone();
        let forward_id = conversation_id.clone();

        let forwarder = tokio::spawn(async move {
            while let Some(update) = feed.next().await {
                let update = update.map(|mut messages| {
                    order_messages(&mut messages);
                    messages
                });
                let failed = update.is_err();

                // The lock is held across the send so that `close` cannot
                // return while a delivery is half way out.
                let delivered = {
                    let slot = forward_sink.lock().unwrap_or_else(PoisonError::into_inner);
                    match slot.as_ref() {
                        Some(tx) => tx
                            .send(Delivery {
                                epoch,
                                conversation: forward_id.clone(),
                                update,
                            })
                            .is_ok(),
                        None => false,
                    }
                };

                if !delivered {
                    break;
                }
                if failed {
                    warn!(conversation = %forward_id, epoch, "subscription ended after read error");
                    break;
                }
            }
            debug!(conversation = %forward_id, epoch, "subscription forwarder stopped");
        });

        debug!(conversation = %conversation_id, epoch, "subscription opened");

        Self {
            conversation: conversation_id,
            epoch,
            sink,
            forwarder: Some(forwarder),
        }
    }

    /// Stop deliveries. Idempotent; once this returns nothing more is sent.
    pub fn close(&mut self) {
        let was_open = self
            .sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some();

        // Dropping the forwarder drops the feed, which stops the producer.
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }

        if was_open {
            debug!(conversation = %self.conversation, epoch = self.epoch, "subscription closed");
        }
    }
}

impl Drop for MessageSubscription {
    fn drop(&mut self) {
        self.close();
    }
}
