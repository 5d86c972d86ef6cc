use parlor_storage::{ConversationId, ConversationRecord, MessageRecord};
use tokio::sync::mpsc;

/// A live snapshot tagged with the controller generation that requested it.
///
/// A controller bumps its generation whenever it releases a subscription, so snapshots
/// still queued from an earlier subscription are recognised and dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    Conversations {
        generation: u64,
        conversations: Vec<ConversationRecord>,
    },
    Messages {
        generation: u64,
        conversation_id: ConversationId,
        messages: Vec<MessageRecord>,
    },
}

pub type EventSender = mpsc::UnboundedSender<ChatEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<ChatEvent>;

pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}
