use crate::{
    bus::{Event, EventBus},
    chat::{
        ChatMessage, Conversation, ConversationId, ConversationKind, NewMessage,
        PrivateConversation,
    },
    entity::{User, UserId},
    store::{Feed, MessageStore, UserDirectory},
};
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteRow},
    ConnectOptions, Row, SqlitePool,
};
use std::{path::Path, str::FromStr, time::Duration};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const FEED_BUFFER: usize = 16;

#[derive(Clone, Debug)]
pub struct Store {
    pool: SqlitePool,
    bus: EventBus,
    poll_interval: Duration,
}

impl Store {
    /// Create a new Store instance.
    /// This will automatically create the database file if it doesn't exist.
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();

        if let Some(parent) = db_path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).context("Failed to create database directory")?;
            }
        }

        let db_url = format!("sqlite://{}", db_path.to_string_lossy());

        let options = SqliteConnectOptions::from_str(&db_url)?
            .create_if_missing(true)
            .log_statements(tracing::log::LevelFilter::Trace);

        let pool = SqlitePool::connect_with(options)
            .await
            .context("Failed to connect to SQLite database")?;

        Ok(Self {
            pool,
            bus: EventBus::new(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }

    /// How often live feeds re-check for messages written by other processes
    /// sharing the same database file.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Initialize the database schema.
    pub async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                uid TEXT PRIMARY KEY,
                display_name TEXT NOT NULL,
                email TEXT NOT NULL DEFAULT ''
            );

            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                participant_a TEXT NOT NULL,
                participant_b TEXT NOT NULL,
                created_at_ms INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_conversations_a ON conversations(participant_a);
            CREATE INDEX IF NOT EXISTS idx_conversations_b ON conversations(participant_b);

            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                conversation_kind TEXT NOT NULL,
                conversation_id TEXT NOT NULL,
                text TEXT NOT NULL,
                sender_id TEXT NOT NULL,
                sender_name TEXT NOT NULL,
                timestamp_ms INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_messages_conversation_timestamp
                ON messages(conversation_kind, conversation_id, timestamp_ms);
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to initialize database schema")?;

        Ok(())
    }

    /// Save or update a user record.
    pub async fn save_user(&self, user: &User) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO users (uid, display_name, email)
            VALUES (?, ?, ?)
            ON CONFLICT(uid) DO UPDATE SET
                display_name = excluded.display_name,
                email = excluded.email
            "#,
        )
        .bind(user.uid.as_str())
        .bind(&user.display_name)
        .bind(&user.email)
        .execute(&self.pool)
        .await
        .context("Failed to save user")?;

        self.bus.publish(Event::UserUpdated {
            uid: user.uid.clone(),
        });
        Ok(())
    }

    pub async fn update_display_name(&self, uid: &UserId, display_name: &str) -> Result<()> {
        let display_name = display_name.trim();
        if display_name.is_empty() {
            bail!("Display name cannot be empty");
        }

        let result = sqlx::query("UPDATE users SET display_name = ? WHERE uid = ?")
            .bind(display_name)
            .bind(uid.as_str())
            .execute(&self.pool)
            .await
            .context("Failed to update display name")?;

        if result.rows_affected() == 0 {
            bail!("Unknown user {}", uid);
        }

        info!(%uid, display_name, "display name updated");
        self.bus.publish(Event::UserUpdated { uid: uid.clone() });
        Ok(())
    }

    /// Full message history of a conversation, oldest first.
    pub async fn conversation_messages(
        &self,
        conversation: &Conversation,
    ) -> Result<Vec<ChatMessage>> {
        let rows = sqlx::query(
            r#"
            SELECT id, conversation_id, text, sender_id, sender_name, timestamp_ms
            FROM messages
            WHERE conversation_kind = ? AND conversation_id = ? AND timestamp_ms IS NOT NULL
            ORDER BY timestamp_ms ASC, id ASC
            "#,
        )
        .bind(conversation.kind.as_str())
        .bind(conversation.id.as_str())
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch conversation messages")?;

        rows.iter().map(row_to_message).collect()
    }
}

impl MessageStore for Store {
    fn subscribe(&self, conversation: &Conversation) -> Feed {
        let (tx, rx) = mpsc::channel(FEED_BUFFER);
        let store = self.clone();
        let conversation = conversation.clone();
        // Subscribe before the first read so no append slips between the two.
        let mut changes = self.bus.subscribe();

        let producer = tokio::spawn(async move {
            let mut last_seen: Option<(usize, Option<String>)> = None;
            let mut ticker = tokio::time::interval_at(
                tokio::time::Instant::now() + store.poll_interval,
                store.poll_interval,
            );
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                match store.conversation_messages(&conversation).await {
                    Ok(messages) => {
                        let seen = (messages.len(), messages.last().map(|m| m.id.clone()));
                        if last_seen.as_ref() != Some(&seen) {
                            last_seen = Some(seen);
                            if tx.send(Ok(messages)).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        warn!(conversation = %conversation.id, "feed read failed: {:#}", e);
                        let _ = tx.send(Err(e)).await;
                        break;
                    }
                }

                loop {
                    tokio::select! {
                        event = changes.recv() => match event {
                            Ok(Event::MessageAppended { kind, conversation: id })
                                if kind == conversation.kind && id == conversation.id => break,
                            Ok(_) => continue,
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                debug!(skipped, "feed lagged behind the bus, re-reading");
                                break;
                            }
                            Err(broadcast::error::RecvError::Closed) => return,
                        },
                        _ = ticker.tick() => break,
                    }
                }
            }
            debug!(conversation = %conversation.id, "feed producer finished");
        });

        Feed::new(rx, Some(producer.abort_handle()))
    }

    async fn append(
        &self,
        conversation: &Conversation,
        message: NewMessage,
    ) -> Result<ChatMessage> {
        let id = Uuid::new_v4().to_string();
        let now_ms = Utc::now().timestamp_millis();

        // Never earlier than the conversation's latest message, so timestamps
        // stay non-decreasing even if the clock steps back.
        let timestamp_ms: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO messages
                (id, conversation_kind, conversation_id, text, sender_id, sender_name, timestamp_ms)
            SELECT ?, ?, ?, ?, ?, ?, MAX(?, COALESCE(
                (SELECT MAX(timestamp_ms) FROM messages
                 WHERE conversation_kind = ? AND conversation_id = ?),
                0
            ))
            RETURNING timestamp_ms
            "#,
        )
        .bind(&id)
        .bind(conversation.kind.as_str())
        .bind(conversation.id.as_str())
        .bind(&message.text)
        .bind(message.sender_id.as_str())
        .bind(&message.sender_name)
        .bind(now_ms)
        .bind(conversation.kind.as_str())
        .bind(conversation.id.as_str())
        .fetch_one(&self.pool)
        .await
        .context("Failed to save message")?;

        self.bus.publish(Event::MessageAppended {
            kind: conversation.kind,
            conversation: conversation.id.clone(),
        });

        Ok(ChatMessage {
            id,
            conversation_id: conversation.id.clone(),
            text: message.text,
            sender_id: message.sender_id,
            sender_name: message.sender_name,
            timestamp: millis_to_datetime(timestamp_ms)?,
        })
    }

    async fn ensure_conversation_record(&self, conversation: &Conversation) -> Result<bool> {
        if conversation.kind == ConversationKind::Group {
            return Ok(false);
        }
        let [a, b] = conversation.participants.as_slice() else {
            bail!(
                "Private conversation {} needs exactly two participants",
                conversation.id
            );
        };

        let result = sqlx::query(
            r#"
            INSERT INTO conversations (id, participant_a, participant_b, created_at_ms)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(conversation.id.as_str())
        .bind(a.as_str())
        .bind(b.as_str())
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await
        .context("Failed to create conversation record")?;

        let created = result.rows_affected() == 1;
        if created {
            info!(conversation = %conversation.id, "conversation record created");
            self.bus.publish(Event::ConversationCreated {
                conversation: conversation.id.clone(),
                participants: conversation.participants.clone(),
            });
        }
        Ok(created)
    }

    async fn most_recent_message(
        &self,
        conversation: &Conversation,
    ) -> Result<Option<ChatMessage>> {
        let row = sqlx::query(
            r#"
            SELECT id, conversation_id, text, sender_id, sender_name, timestamp_ms
            FROM messages
            WHERE conversation_kind = ? AND conversation_id = ? AND timestamp_ms IS NOT NULL
            ORDER BY timestamp_ms DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(conversation.kind.as_str())
        .bind(conversation.id.as_str())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch last message")?;

        row.as_ref().map(row_to_message).transpose()
    }

    async fn private_conversations_for(&self, uid: &UserId) -> Result<Vec<PrivateConversation>> {
        let rows = sqlx::query(
            r#"
            SELECT id, participant_a, participant_b, created_at_ms
            FROM conversations
            WHERE participant_a = ? OR participant_b = ?
            ORDER BY created_at_ms ASC, id ASC
            "#,
        )
        .bind(uid.as_str())
        .bind(uid.as_str())
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch private conversations")?;

        rows.iter()
            .map(|row| -> Result<PrivateConversation> {
                Ok(PrivateConversation {
                    id: ConversationId::from_stored(row.try_get("id")?),
                    participant_a: UserId::parse(row.try_get::<String, _>("participant_a")?)?,
                    participant_b: UserId::parse(row.try_get::<String, _>("participant_b")?)?,
                    created_at: millis_to_datetime(row.try_get("created_at_ms")?)?,
                })
            })
            .collect()
    }

    fn changes(&self) -> broadcast::Receiver<Event> {
        self.bus.subscribe()
    }
}

impl UserDirectory for Store {
    async fn lookup(&self, uid: &UserId) -> Result<Option<User>> {
        let row = sqlx::query("SELECT uid, display_name, email FROM users WHERE uid = ?")
            .bind(uid.as_str())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to look up user")?;

        row.as_ref().map(row_to_user).transpose()
    }

    async fn all_known_users(&self) -> Result<Vec<User>> {
        let rows = sqlx::query(
            "SELECT uid, display_name, email FROM users ORDER BY display_name COLLATE NOCASE, uid",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to list users")?;

        rows.iter().map(row_to_user).collect()
    }
}

fn row_to_message(row: &SqliteRow) -> Result<ChatMessage> {
    Ok(ChatMessage {
        id: row.try_get("id")?,
        conversation_id: ConversationId::from_stored(row.try_get("conversation_id")?),
        text: row.try_get("text")?,
        sender_id: UserId::parse(row.try_get::<String, _>("sender_id")?)?,
        sender_name: row.try_get("sender_name")?,
        timestamp: millis_to_datetime(row.try_get("timestamp_ms")?)?,
    })
}

fn row_to_user(row: &SqliteRow) -> Result<User> {
    Ok(User {
        uid: UserId::parse(row.try_get::<String, _>("uid")?)?,
        display_name: row.try_get("display_name")?,
        email: row.try_get("email")?,
    })
}

fn millis_to_datetime(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).with_context(|| format!("Invalid timestamp {}", ms))
}
