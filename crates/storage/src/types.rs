use std::collections::BTreeSet;
use std::fmt;

use super::ids::{ConversationId, MessageId};

/// Server-assigned point in time, in milliseconds since the Unix epoch.
///
/// Issued by the backend clock only; values handed out by one backend are strictly increasing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerTimestamp(i64);

impl ServerTimestamp {
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    pub const fn as_millis(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for ServerTimestamp {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

/// Sender classification carried by some messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// One `chats` document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationRecord {
    pub id: ConversationId,
    pub name: String,
    pub created_at: ServerTimestamp,
    pub updated_at: ServerTimestamp,
    pub participants: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewConversation {
    pub name: String,
    pub creator_name: String,
}

impl NewConversation {
    pub fn new(name: impl Into<String>, creator_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            creator_name: creator_name.into(),
        }
    }
}

/// One `chats/{id}/messages` document. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub content: String,
    pub username: String,
    pub created_at: ServerTimestamp,
    pub role: Option<MessageRole>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub content: String,
    pub username: String,
    pub role: Option<MessageRole>,
}

impl NewMessage {
    pub fn user(content: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            username: username.into(),
            role: Some(MessageRole::User),
        }
    }

    pub fn assistant(content: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            username: username.into(),
            role: Some(MessageRole::Assistant),
        }
    }
}

/// Result of the two-write send path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendOutcome {
    pub message: MessageRecord,
    // False when the insert landed but the follow-up chat update failed; the chat keeps its
    // previous sort position until another write touches it.
    pub conversation_touched: bool,
}

/// Committed-write notification fanned out to live subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeEvent {
    Conversations,
    Messages(ConversationId),
}
