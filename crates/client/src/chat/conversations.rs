use std::collections::HashSet;

use parlor_storage::{
    ChatBackend, ConversationId, ConversationRecord, NewConversation, SnapshotCallback,
    Subscription,
};
use snafu::{ResultExt, ensure};

use super::events::{ChatEvent, EventSender};
use crate::error::{BackendSnafu, ClientResult, EmptyInputSnafu, UnknownConversationSnafu};

/// Owns the live conversation list and the current selection.
///
/// Unsubscribed until [`activate`](Self::activate), subscribed until
/// [`deactivate`](Self::deactivate) or drop.
#[derive(Debug)]
pub struct ConversationListController {
    events: EventSender,
    subscription: Option<Subscription>,
    generation: u64,
    conversations: Vec<ConversationRecord>,
    selected: Option<ConversationId>,
    // Whether the selected id has shown up in a snapshot yet. A freshly created chat is
    // selected before its first snapshot lands, and must not be dropped by older ones.
    selected_seen: bool,
    // Deleted here; skipped by snapshots that were taken before the delete landed.
    deleted: HashSet<ConversationId>,
}

impl ConversationListController {
    pub fn new(events: EventSender) -> Self {
        Self {
            events,
            subscription: None,
            generation: 0,
            conversations: Vec::new(),
            selected: None,
            selected_seen: false,
            deleted: HashSet::new(),
        }
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscription.is_some()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn conversations(&self) -> &[ConversationRecord] {
        &self.conversations
    }

    pub fn selected(&self) -> Option<ConversationId> {
        self.selected
    }

    pub fn selected_conversation(&self) -> Option<&ConversationRecord> {
        let selected = self.selected?;
        self.conversations
            .iter()
            .find(|conversation| conversation.id == selected)
    }

    pub fn contains(&self, conversation_id: ConversationId) -> bool {
        self.conversations
            .iter()
            .any(|conversation| conversation.id == conversation_id)
    }

    pub async fn activate(&mut self, backend: &dyn ChatBackend) -> ClientResult<()> {
        if self.subscription.is_some() {
            return Ok(());
        }

        self.generation += 1;
        let generation = self.generation;
        let events = self.events.clone();
        let callback: SnapshotCallback<ConversationRecord> = Box::new(move |conversations| {
            let _ = events.send(ChatEvent::Conversations {
                generation,
                conversations,
            });
        });

        let subscription = backend
            .subscribe_conversations(callback)
            .await
            .context(BackendSnafu {
                stage: "conversations-subscribe",
            })?;
        tracing::info!(subscription = %subscription.id(), "conversation list subscribed");
        self.subscription = Some(subscription);
        Ok(())
    }

    /// Releases the subscription and forgets the list. Returns `false` when already inactive.
    pub fn deactivate(&mut self) -> bool {
        let Some(subscription) = self.subscription.take() else {
            return false;
        };

        subscription.unsubscribe();
        self.generation += 1;
        self.conversations.clear();
        self.selected = None;
        self.selected_seen = false;
        self.deleted.clear();
        tracing::info!("conversation list unsubscribed");
        true
    }

    /// Applies a snapshot from the current subscription. Returns whether the selection moved.
    pub fn apply_snapshot(
        &mut self,
        generation: u64,
        mut conversations: Vec<ConversationRecord>,
    ) -> bool {
        if generation != self.generation || self.subscription.is_none() {
            tracing::trace!(generation, current = self.generation, "stale conversation snapshot");
            return false;
        }

        if !self.deleted.is_empty() {
            // Once a snapshot no longer carries a deleted id, later ones never will.
            self.deleted
                .retain(|id| conversations.iter().any(|conversation| conversation.id == *id));
            conversations.retain(|conversation| !self.deleted.contains(&conversation.id));
        }
        self.conversations = conversations;
        let previous = self.selected;

        match self.selected {
            None => self.selected = self.first_id(),
            Some(selected) if self.contains(selected) => self.selected_seen = true,
            Some(selected) if self.selected_seen => {
                tracing::info!(conversation_id = %selected, "selected chat disappeared");
                self.selected = self.first_id();
            }
            Some(_) => {}
        }

        if self.selected != previous {
            self.selected_seen = self.selected.is_some();
        }
        self.selected != previous
    }

    pub fn select(&mut self, conversation_id: ConversationId) -> ClientResult<bool> {
        ensure!(
            self.contains(conversation_id),
            UnknownConversationSnafu {
                stage: "conversations-select",
                reference: conversation_id.to_string(),
            }
        );

        let changed = self.selected != Some(conversation_id);
        self.selected = Some(conversation_id);
        self.selected_seen = true;
        Ok(changed)
    }

    /// Creates a chat and selects it.
    pub async fn create(
        &mut self,
        backend: &dyn ChatBackend,
        name: &str,
        creator_name: &str,
    ) -> ClientResult<ConversationRecord> {
        let name = name.trim();
        ensure!(
            !name.is_empty(),
            EmptyInputSnafu {
                stage: "conversations-create-validate",
                field: "chat name",
            }
        );

        let created = backend
            .create_conversation(NewConversation::new(name, creator_name))
            .await
            .context(BackendSnafu {
                stage: "conversations-create",
            })?;
        tracing::info!(conversation_id = %created.id, name = %created.name, "chat created");

        self.selected = Some(created.id);
        self.selected_seen = self.contains(created.id);
        Ok(created)
    }

    pub async fn rename(
        &mut self,
        backend: &dyn ChatBackend,
        conversation_id: ConversationId,
        new_name: &str,
    ) -> ClientResult<ConversationRecord> {
        let new_name = new_name.trim();
        ensure!(
            !new_name.is_empty(),
            EmptyInputSnafu {
                stage: "conversations-rename-validate",
                field: "chat name",
            }
        );

        let renamed = backend
            .rename_conversation(conversation_id, new_name)
            .await
            .context(BackendSnafu {
                stage: "conversations-rename",
            })?;
        tracing::info!(%conversation_id, name = %renamed.name, "chat renamed");
        Ok(renamed)
    }

    /// Deletes a chat. When it was selected, the selection moves to the first remaining
    /// chat, or clears. Returns whether the selection moved.
    pub async fn delete(
        &mut self,
        backend: &dyn ChatBackend,
        conversation_id: ConversationId,
    ) -> ClientResult<bool> {
        backend
            .delete_conversation(conversation_id)
            .await
            .context(BackendSnafu {
                stage: "conversations-delete",
            })?;
        tracing::info!(%conversation_id, "chat deleted");
        self.deleted.insert(conversation_id);

        if self.selected != Some(conversation_id) {
            return Ok(false);
        }

        self.selected = self
            .conversations
            .iter()
            .map(|conversation| conversation.id)
            .find(|id| *id != conversation_id);
        self.selected_seen = self.selected.is_some();
        Ok(true)
    }

    fn first_id(&self) -> Option<ConversationId> {
        self.conversations.first().map(|conversation| conversation.id)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use parlor_storage::{ServerTimestamp, SqliteBackend};

    use super::*;
    use crate::chat::events;

    fn record(name: &str, updated_at: i64) -> ConversationRecord {
        ConversationRecord {
            id: ConversationId::new_v7(),
            name: name.to_string(),
            created_at: ServerTimestamp::from_millis(updated_at),
            updated_at: ServerTimestamp::from_millis(updated_at),
            participants: BTreeSet::from(["alice".to_string()]),
        }
    }

    async fn subscribed() -> (ConversationListController, SqliteBackend, events::EventReceiver) {
        let backend = SqliteBackend::open_in_memory()
            .await
            .expect("in-memory backend opens");
        let (sender, receiver) = events::channel();
        let mut controller = ConversationListController::new(sender);
        controller.activate(&backend).await.expect("activate");
        (controller, backend, receiver)
    }

    #[tokio::test]
    async fn first_snapshot_selects_most_recent_chat() {
        let (mut controller, _backend, _events) = subscribed().await;
        let newest = record("Newest", 20);
        let older = record("Older", 10);

        let moved = controller.apply_snapshot(
            controller.generation(),
            vec![newest.clone(), older.clone()],
        );

        assert!(moved);
        assert_eq!(controller.selected(), Some(newest.id));

        let moved = controller.apply_snapshot(controller.generation(), vec![older.clone(), newest]);
        assert!(!moved, "selection sticks when the order changes");
        assert_ne!(controller.selected(), Some(older.id));
    }

    #[tokio::test]
    async fn stale_generation_is_ignored() {
        let (mut controller, _backend, _events) = subscribed().await;
        let stale = controller.generation() - 1;

        assert!(!controller.apply_snapshot(stale, vec![record("Ghost", 1)]));
        assert!(controller.conversations().is_empty());
        assert_eq!(controller.selected(), None);
    }

    #[tokio::test]
    async fn vanished_selection_falls_back_to_first_remaining() {
        let (mut controller, _backend, _events) = subscribed().await;
        let first = record("First", 30);
        let second = record("Second", 20);
        let third = record("Third", 10);
        let generation = controller.generation();
        controller.apply_snapshot(generation, vec![first.clone(), second.clone(), third.clone()]);
        controller.select(second.id).expect("select second");

        let moved = controller.apply_snapshot(generation, vec![first.clone(), third]);

        assert!(moved);
        assert_eq!(controller.selected(), Some(first.id));

        assert!(controller.apply_snapshot(generation, Vec::new()));
        assert_eq!(controller.selected(), None);
    }

    #[tokio::test]
    async fn created_chat_survives_snapshots_that_predate_it() {
        let (mut controller, backend, _events) = subscribed().await;
        let existing = record("Existing", 10);
        let generation = controller.generation();
        controller.apply_snapshot(generation, vec![existing.clone()]);

        let created = controller
            .create(&backend, "  Fresh ", "alice")
            .await
            .expect("create");
        assert_eq!(created.name, "Fresh");
        assert_eq!(controller.selected(), Some(created.id));

        assert!(!controller.apply_snapshot(generation, vec![existing]));
        assert_eq!(controller.selected(), Some(created.id));
    }

    #[tokio::test]
    async fn blank_names_never_reach_the_backend() {
        let (mut controller, backend, _events) = subscribed().await;

        let error = controller
            .create(&backend, "   ", "alice")
            .await
            .expect_err("blank create rejected");
        assert!(matches!(error, crate::ClientError::EmptyInput { .. }));

        let error = controller
            .rename(&backend, ConversationId::new_v7(), "")
            .await
            .expect_err("blank rename rejected");
        assert!(matches!(error, crate::ClientError::EmptyInput { .. }));
    }

    #[tokio::test]
    async fn selecting_unknown_chat_is_rejected() {
        let (mut controller, _backend, _events) = subscribed().await;

        let error = controller
            .select(ConversationId::new_v7())
            .expect_err("unknown chat rejected");

        assert!(error.is_not_found());
    }

    #[tokio::test]
    async fn deleted_ids_are_forgotten_once_snapshots_drop_them() {
        let (mut controller, backend, _events) = subscribed().await;
        let doomed = controller
            .create(&backend, "Doomed", "alice")
            .await
            .expect("create doomed");
        let kept = controller
            .create(&backend, "Kept", "alice")
            .await
            .expect("create kept");
        let generation = controller.generation();
        controller.apply_snapshot(generation, vec![kept.clone(), doomed.clone()]);

        controller.delete(&backend, doomed.id).await.expect("delete");
        assert_eq!(controller.deleted.len(), 1);

        controller.apply_snapshot(generation, vec![kept.clone(), doomed.clone()]);
        assert!(!controller.contains(doomed.id));
        assert_eq!(controller.deleted.len(), 1);

        controller.apply_snapshot(generation, vec![kept.clone()]);
        assert_eq!(controller.deleted.len(), 0);
        assert_eq!(controller.selected(), Some(kept.id));
    }

    #[tokio::test]
    async fn deactivating_twice_is_a_no_op() {
        let (mut controller, backend, _events) = subscribed().await;
        assert_eq!(backend.active_subscriptions(), 1);

        assert!(controller.deactivate());
        assert!(!controller.deactivate());

        assert_eq!(backend.active_subscriptions(), 0);
        assert!(!controller.is_subscribed());
    }
}
