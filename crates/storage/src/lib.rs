pub mod clock;
pub mod error;
pub mod ids;
pub mod live;
pub mod sqlite;
pub mod types;

use async_trait::async_trait;

pub use clock::ServerClock;
pub use error::{StorageError, StorageResult};
pub use ids::{ConversationId, MessageId};
pub use live::{SnapshotCallback, Subscription, SubscriptionId, SubscriptionRegistry};
pub use sqlite::SqliteBackend;
pub use types::{
    ChangeEvent, ConversationRecord, MessageRecord, MessageRole, NewConversation, NewMessage,
    SendOutcome, ServerTimestamp,
};

/// The `chats` collection.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Rejects a blank name before writing. New rows get `created_at == updated_at`.
    async fn create_conversation(&self, input: NewConversation)
    -> StorageResult<ConversationRecord>;

    /// One-shot read, most recently updated first.
    async fn list_conversations(&self) -> StorageResult<Vec<ConversationRecord>>;

    async fn get_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> StorageResult<Option<ConversationRecord>>;

    async fn rename_conversation(
        &self,
        conversation_id: ConversationId,
        new_name: &str,
    ) -> StorageResult<ConversationRecord>;

    /// Removes the chat together with its messages.
    async fn delete_conversation(&self, conversation_id: ConversationId) -> StorageResult<()>;

    /// Bumps `updated_at` and records `participant`.
    async fn touch_conversation(
        &self,
        conversation_id: ConversationId,
        participant: &str,
    ) -> StorageResult<ConversationRecord>;

    /// Delivers the current ordered list before returning, then again after every change.
    async fn subscribe_conversations(
        &self,
        callback: SnapshotCallback<ConversationRecord>,
    ) -> StorageResult<Subscription>;
}

/// The per-chat `messages` collection.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn append_message(
        &self,
        conversation_id: ConversationId,
        input: NewMessage,
    ) -> StorageResult<MessageRecord>;

    /// Oldest first.
    async fn list_messages(
        &self,
        conversation_id: ConversationId,
    ) -> StorageResult<Vec<MessageRecord>>;

    async fn subscribe_messages(
        &self,
        conversation_id: ConversationId,
        callback: SnapshotCallback<MessageRecord>,
    ) -> StorageResult<Subscription>;
}

#[async_trait]
pub trait ChatBackend: ConversationStore + MessageStore {
    /// Appends a user message, then touches the parent chat as a second, separate write.
    ///
    /// Only the insert decides success. A failed touch is logged and reported through
    /// [`SendOutcome::conversation_touched`].
    async fn send_message(
        &self,
        conversation_id: ConversationId,
        content: &str,
        sender_name: &str,
    ) -> StorageResult<SendOutcome> {
        let content = require_text(content, "message content", "send-message-validate-content")?;
        let sender_name = require_text(sender_name, "sender name", "send-message-validate-sender")?;

        let message = self
            .append_message(conversation_id, NewMessage::user(content, sender_name))
            .await?;

        let conversation_touched = match self.touch_conversation(conversation_id, sender_name).await
        {
            Ok(_) => true,
            Err(error) => {
                tracing::warn!(
                    %conversation_id,
                    message_id = %message.id,
                    "message stored but chat timestamp update failed: {error}"
                );
                false
            }
        };

        Ok(SendOutcome {
            message,
            conversation_touched,
        })
    }
}

impl<T> ChatBackend for T where T: ConversationStore + MessageStore {}

/// Returns the trimmed text, or a validation error when nothing is left.
pub fn require_text<'a>(
    raw: &'a str,
    field: &'static str,
    stage: &'static str,
) -> StorageResult<&'a str> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return error::EmptyFieldSnafu { stage, field }.fail();
    }

    Ok(trimmed)
}
