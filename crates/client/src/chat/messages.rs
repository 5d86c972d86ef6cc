use parlor_storage::{
    ChatBackend, ConversationId, MessageRecord, SendOutcome, SnapshotCallback, Subscription,
};
use snafu::{OptionExt, ResultExt, ensure};

use super::events::{ChatEvent, EventSender};
use crate::error::{BackendSnafu, ClientResult, EmptyInputSnafu, NoSelectionSnafu};

/// Follows the messages of at most one conversation.
#[derive(Debug)]
pub struct MessageStreamController {
    events: EventSender,
    subscription: Option<Subscription>,
    generation: u64,
    following: Option<ConversationId>,
    messages: Vec<MessageRecord>,
}

impl MessageStreamController {
    pub fn new(events: EventSender) -> Self {
        Self {
            events,
            subscription: None,
            generation: 0,
            following: None,
            messages: Vec::new(),
        }
    }

    pub fn following(&self) -> Option<ConversationId> {
        self.following
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscription.is_some()
    }

    /// Exactly what the current subscription delivered last.
    pub fn messages(&self) -> &[MessageRecord] {
        &self.messages
    }

    /// Switches to `target`: the previous subscription is released and the list cleared
    /// before the new subscription opens. Following the same chat again is a no-op.
    pub async fn follow(
        &mut self,
        backend: &dyn ChatBackend,
        target: Option<ConversationId>,
    ) -> ClientResult<()> {
        if target == self.following && (target.is_none() || self.subscription.is_some()) {
            return Ok(());
        }

        self.release();
        self.following = target;
        let Some(conversation_id) = target else {
            return Ok(());
        };

        let generation = self.generation;
        let events = self.events.clone();
        let callback: SnapshotCallback<MessageRecord> = Box::new(move |messages| {
            let _ = events.send(ChatEvent::Messages {
                generation,
                conversation_id,
                messages,
            });
        });

        let subscription = backend
            .subscribe_messages(conversation_id, callback)
            .await
            .context(BackendSnafu {
                stage: "messages-subscribe",
            })?;
        tracing::debug!(%conversation_id, subscription = %subscription.id(), "following chat");
        self.subscription = Some(subscription);
        Ok(())
    }

    /// Stops following. Returns `false` when nothing was followed.
    pub fn teardown(&mut self) -> bool {
        let was_following = self.following.take().is_some();
        self.release();
        was_following
    }

    pub fn apply_snapshot(
        &mut self,
        generation: u64,
        conversation_id: ConversationId,
        messages: Vec<MessageRecord>,
    ) -> bool {
        if generation != self.generation || self.following != Some(conversation_id) {
            tracing::trace!(%conversation_id, generation, "stale message snapshot");
            return false;
        }

        self.messages = messages;
        true
    }

    /// Sends `content` to the followed chat as `sender_name`.
    pub async fn send(
        &self,
        backend: &dyn ChatBackend,
        content: &str,
        sender_name: &str,
    ) -> ClientResult<SendOutcome> {
        let conversation_id = self.following.context(NoSelectionSnafu {
            stage: "messages-send",
        })?;
        ensure!(
            !content.trim().is_empty(),
            EmptyInputSnafu {
                stage: "messages-send-validate",
                field: "message",
            }
        );

        let outcome = backend
            .send_message(conversation_id, content.trim(), sender_name)
            .await
            .context(BackendSnafu {
                stage: "messages-send",
            })?;
        if !outcome.conversation_touched {
            tracing::warn!(%conversation_id, "message sent but chat order was not refreshed");
        }
        Ok(outcome)
    }

    fn release(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
        self.generation += 1;
        self.messages.clear();
    }
}
