use std::collections::BTreeSet;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use snafu::{OptionExt, ResultExt};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};
use tokio::sync::broadcast;

use super::clock::ServerClock;
use super::error::{
    CreateSqliteDirectorySnafu, DecodeParticipantsSnafu, EncodeParticipantsSnafu,
    InvariantViolationSnafu, NotFoundSnafu, SqliteConnectOptionsSnafu, SqliteConnectSnafu,
    SqliteMigrateSnafu, SqlitePragmaSnafu, SqliteQuerySnafu, StorageResult,
};
use super::ids::{ConversationId, MessageId};
use super::live::{SnapshotCallback, Subscription, SubscriptionRegistry};
use super::types::{
    ChangeEvent, ConversationRecord, MessageRecord, MessageRole, NewConversation, NewMessage,
    ServerTimestamp,
};
use super::{ConversationStore, MessageStore, require_text};

const CHANGE_FEED_CAPACITY: usize = 256;

/// Local stand-in for the hosted document store: server-side ids and timestamps,
/// ordered queries, change fan-out and cascading deletes.
#[derive(Debug, Clone)]
pub struct SqliteBackend {
    pool: SqlitePool,
    clock: Arc<ServerClock>,
    changes: broadcast::Sender<ChangeEvent>,
    subscriptions: SubscriptionRegistry,
}

#[derive(Debug, FromRow)]
struct ChatRow {
    id: String,
    name: String,
    created_at: i64,
    updated_at: i64,
    participants: String,
}

#[derive(Debug, FromRow)]
struct MessageRow {
    id: String,
    chat_id: String,
    content: String,
    username: String,
    role: Option<String>,
    created_at: i64,
}

impl SqliteBackend {
    /// Opens (creating if needed) the database at a file path, a `sqlite:` URL or `:memory:`.
    pub async fn open(database_location: &str) -> StorageResult<Self> {
        let database_url = database_url_for(database_location)?;
        let connect_options = SqliteConnectOptions::from_str(&database_url)
            .context(SqliteConnectOptionsSnafu {
                stage: "sqlite-open-parse-url",
                database_url: database_url.clone(),
            })?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(5_000));

        // One long-lived connection: writes are serialized, and an in-memory database
        // lives exactly as long as that connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(connect_options)
            .await
            .context(SqliteConnectSnafu {
                stage: "sqlite-open-connect",
                database_url: database_url.clone(),
            })?;

        sqlx::query("PRAGMA foreign_keys = ON;")
            .execute(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-foreign-keys",
                pragma: "foreign_keys",
            })?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context(SqliteMigrateSnafu {
                stage: "sqlite-open-migrate",
            })?;

        let latest = sqlx::query_scalar::<_, i64>(
            "SELECT MAX(COALESCE((SELECT MAX(updated_at) FROM chats), 0), COALESCE((SELECT MAX(created_at) FROM messages), 0))",
        )
        .fetch_one(&pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "sqlite-open-latest-timestamp",
        })?;

        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        tracing::info!(database_url = %database_url, "sqlite backend opened");

        Ok(Self {
            pool,
            clock: Arc::new(ServerClock::starting_after(ServerTimestamp::from_millis(
                latest,
            ))),
            changes,
            subscriptions: SubscriptionRegistry::default(),
        })
    }

    pub async fn open_in_memory() -> StorageResult<Self> {
        Self::open(":memory:").await
    }

    /// Number of live subscriptions not yet released.
    pub fn active_subscriptions(&self) -> usize {
        self.subscriptions.active()
    }

    fn publish(&self, event: ChangeEvent) {
        // No receivers just means nobody is subscribed right now.
        let _ = self.changes.send(event);
    }

    async fn query_conversations(&self) -> StorageResult<Vec<ConversationRecord>> {
        let rows = sqlx::query_as::<_, ChatRow>(
            "SELECT id, name, created_at, updated_at, participants FROM chats ORDER BY updated_at DESC, id DESC",
        )
        .fetch_all(&self.pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "chat-list-query",
        })?;

        rows.into_iter().map(chat_row_to_record).collect()
    }

    async fn query_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> StorageResult<Option<ConversationRecord>> {
        let row = sqlx::query_as::<_, ChatRow>(
            "SELECT id, name, created_at, updated_at, participants FROM chats WHERE id = ?",
        )
        .bind(conversation_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "chat-get-query",
        })?;

        row.map(chat_row_to_record).transpose()
    }

    async fn query_messages(
        &self,
        conversation_id: ConversationId,
    ) -> StorageResult<Vec<MessageRecord>> {
        let rows = sqlx::query_as::<_, MessageRow>(
            "SELECT id, chat_id, content, username, role, created_at FROM messages WHERE chat_id = ? ORDER BY created_at ASC, id ASC",
        )
        .bind(conversation_id.to_string())
        .fetch_all(&self.pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "message-list-query",
        })?;

        rows.into_iter().map(message_row_to_record).collect()
    }

    async fn load_existing_conversation(
        &self,
        conversation_id: ConversationId,
        stage: &'static str,
    ) -> StorageResult<ConversationRecord> {
        self.query_conversation(conversation_id)
            .await?
            .context(NotFoundSnafu {
                stage,
                entity: "chat",
                id: conversation_id.to_string(),
            })
    }
}

#[async_trait]
impl ConversationStore for SqliteBackend {
    async fn create_conversation(
        &self,
        input: NewConversation,
    ) -> StorageResult<ConversationRecord> {
        let name = require_text(&input.name, "chat name", "chat-create-validate-name")?;
        let creator = require_text(
            &input.creator_name,
            "creator name",
            "chat-create-validate-creator",
        )?;

        let conversation_id = ConversationId::new_v7();
        let now = self.clock.now();
        let participants = BTreeSet::from([creator.to_string()]);
        let encoded = encode_participants(&participants, conversation_id)?;

        sqlx::query(
            "INSERT INTO chats (id, name, created_at, updated_at, participants) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(conversation_id.to_string())
        .bind(name)
        .bind(now.as_millis())
        .bind(now.as_millis())
        .bind(encoded)
        .execute(&self.pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "chat-create-insert",
        })?;

        tracing::info!(%conversation_id, "chat created");
        self.publish(ChangeEvent::Conversations);

        Ok(ConversationRecord {
            id: conversation_id,
            name: name.to_string(),
            created_at: now,
            updated_at: now,
            participants,
        })
    }

    async fn list_conversations(&self) -> StorageResult<Vec<ConversationRecord>> {
        self.query_conversations().await
    }

    async fn get_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> StorageResult<Option<ConversationRecord>> {
        self.query_conversation(conversation_id).await
    }

    async fn rename_conversation(
        &self,
        conversation_id: ConversationId,
        new_name: &str,
    ) -> StorageResult<ConversationRecord> {
        let name = require_text(new_name, "chat name", "chat-rename-validate-name")?;
        let now = self.clock.now();

        let result = sqlx::query("UPDATE chats SET name = ?, updated_at = ? WHERE id = ?")
            .bind(name)
            .bind(now.as_millis())
            .bind(conversation_id.to_string())
            .execute(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "chat-rename-apply",
            })?;

        if result.rows_affected() == 0 {
            return NotFoundSnafu {
                stage: "chat-rename-missing",
                entity: "chat",
                id: conversation_id.to_string(),
            }
            .fail();
        }

        self.publish(ChangeEvent::Conversations);
        self.load_existing_conversation(conversation_id, "chat-rename-load")
            .await
    }

    async fn delete_conversation(&self, conversation_id: ConversationId) -> StorageResult<()> {
        let result = sqlx::query("DELETE FROM chats WHERE id = ?")
            .bind(conversation_id.to_string())
            .execute(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "chat-delete-apply",
            })?;

        if result.rows_affected() == 0 {
            return NotFoundSnafu {
                stage: "chat-delete-missing",
                entity: "chat",
                id: conversation_id.to_string(),
            }
            .fail();
        }

        tracing::info!(%conversation_id, "chat deleted");
        self.publish(ChangeEvent::Conversations);
        // Messages went with the chat through the foreign key cascade.
        self.publish(ChangeEvent::Messages(conversation_id));
        Ok(())
    }

    async fn touch_conversation(
        &self,
        conversation_id: ConversationId,
        participant: &str,
    ) -> StorageResult<ConversationRecord> {
        let participant = require_text(participant, "participant", "chat-touch-validate")?;
        let mut tx = self.pool.begin().await.context(SqliteQuerySnafu {
            stage: "chat-touch-begin",
        })?;

        let encoded = sqlx::query_scalar::<_, String>("SELECT participants FROM chats WHERE id = ?")
            .bind(conversation_id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "chat-touch-load-participants",
            })?
            .context(NotFoundSnafu {
                stage: "chat-touch-missing",
                entity: "chat",
                id: conversation_id.to_string(),
            })?;

        let mut participants = decode_participants(&encoded, conversation_id)?;
        participants.insert(participant.to_string());
        let encoded = encode_participants(&participants, conversation_id)?;
        let now = self.clock.now();

        sqlx::query("UPDATE chats SET updated_at = ?, participants = ? WHERE id = ?")
            .bind(now.as_millis())
            .bind(encoded)
            .bind(conversation_id.to_string())
            .execute(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "chat-touch-apply",
            })?;

        tx.commit().await.context(SqliteQuerySnafu {
            stage: "chat-touch-commit",
        })?;

        self.publish(ChangeEvent::Conversations);
        self.load_existing_conversation(conversation_id, "chat-touch-load")
            .await
    }

    async fn subscribe_conversations(
        &self,
        callback: SnapshotCallback<ConversationRecord>,
    ) -> StorageResult<Subscription> {
        // Listen before the initial read so no change slips between the two.
        let changes = self.changes.subscribe();
        callback(self.query_conversations().await?);

        let backend = self.clone();
        Ok(self.subscriptions.open(
            "chats",
            changes,
            |event| matches!(event, ChangeEvent::Conversations),
            move || {
                let backend = backend.clone();
                async move { backend.query_conversations().await }
            },
            callback,
        ))
    }
}

#[async_trait]
impl MessageStore for SqliteBackend {
    async fn append_message(
        &self,
        conversation_id: ConversationId,
        input: NewMessage,
    ) -> StorageResult<MessageRecord> {
        require_text(&input.content, "message content", "message-append-validate-content")?;
        let username = require_text(
            &input.username,
            "sender name",
            "message-append-validate-sender",
        )?;

        let exists = sqlx::query_scalar::<_, i64>("SELECT 1 FROM chats WHERE id = ? LIMIT 1")
            .bind(conversation_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-append-chat-exists",
            })?;
        if exists.is_none() {
            return NotFoundSnafu {
                stage: "message-append-chat-missing",
                entity: "chat",
                id: conversation_id.to_string(),
            }
            .fail();
        }

        let message_id = MessageId::new_v7();
        let now = self.clock.now();

        sqlx::query(
            "INSERT INTO messages (id, chat_id, content, username, role, created_at) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(message_id.to_string())
        .bind(conversation_id.to_string())
        .bind(input.content.as_str())
        .bind(username)
        .bind(input.role.map(|role| role.as_str()))
        .bind(now.as_millis())
        .execute(&self.pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "message-append-insert",
        })?;

        self.publish(ChangeEvent::Messages(conversation_id));

        Ok(MessageRecord {
            id: message_id,
            conversation_id,
            content: input.content,
            username: username.to_string(),
            created_at: now,
            role: input.role,
        })
    }

    async fn list_messages(
        &self,
        conversation_id: ConversationId,
    ) -> StorageResult<Vec<MessageRecord>> {
        self.query_messages(conversation_id).await
    }

    async fn subscribe_messages(
        &self,
        conversation_id: ConversationId,
        callback: SnapshotCallback<MessageRecord>,
    ) -> StorageResult<Subscription> {
        let changes = self.changes.subscribe();
        callback(self.query_messages(conversation_id).await?);

        let backend = self.clone();
        Ok(self.subscriptions.open(
            "messages",
            changes,
            move |event| *event == ChangeEvent::Messages(conversation_id),
            move || {
                let backend = backend.clone();
                async move { backend.query_messages(conversation_id).await }
            },
            callback,
        ))
    }
}

fn chat_row_to_record(row: ChatRow) -> StorageResult<ConversationRecord> {
    let id = ConversationId::parse(&row.id)?;
    Ok(ConversationRecord {
        participants: decode_participants(&row.participants, id)?,
        id,
        name: row.name,
        created_at: ServerTimestamp::from_millis(row.created_at),
        updated_at: ServerTimestamp::from_millis(row.updated_at),
    })
}

fn message_row_to_record(row: MessageRow) -> StorageResult<MessageRecord> {
    Ok(MessageRecord {
        id: MessageId::parse(&row.id)?,
        conversation_id: ConversationId::parse(&row.chat_id)?,
        content: row.content,
        username: row.username,
        created_at: ServerTimestamp::from_millis(row.created_at),
        role: row.role.as_deref().map(role_from_sql).transpose()?,
    })
}

fn role_from_sql(raw: &str) -> StorageResult<MessageRole> {
    match raw {
        "user" => Ok(MessageRole::User),
        "assistant" => Ok(MessageRole::Assistant),
        _ => InvariantViolationSnafu {
            stage: "message-role-from-sql",
            details: format!("unknown message role '{raw}'"),
        }
        .fail(),
    }
}

fn encode_participants(
    participants: &BTreeSet<String>,
    conversation_id: ConversationId,
) -> StorageResult<String> {
    serde_json::to_string(participants).context(EncodeParticipantsSnafu {
        stage: "chat-encode-participants",
        chat_id: conversation_id.to_string(),
    })
}

// Participants are a set of names stored as a JSON array; the map-of-flags shape is rejected.
fn decode_participants(
    encoded: &str,
    conversation_id: ConversationId,
) -> StorageResult<BTreeSet<String>> {
    serde_json::from_str(encoded).context(DecodeParticipantsSnafu {
        stage: "chat-decode-participants",
        chat_id: conversation_id.to_string(),
    })
}

/// Maps a path, a `sqlite:` URL or `:memory:` onto a connection URL. File paths get their
/// parent directory created first.
fn database_url_for(location: &str) -> StorageResult<String> {
    match location {
        ":memory:" => Ok(String::from("sqlite::memory:")),
        url if url.starts_with("sqlite:") => Ok(url.to_owned()),
        path => {
            let parent = Path::new(path)
                .parent()
                .filter(|parent| !parent.as_os_str().is_empty());
            if let Some(parent) = parent {
                std::fs::create_dir_all(parent).context(CreateSqliteDirectorySnafu {
                    stage: "sqlite-open-create-directory",
                    path: parent.display().to_string(),
                })?;
            }
            Ok(format!("sqlite://{path}"))
        }
    }
}

#[cfg(test)]
mod tests;
