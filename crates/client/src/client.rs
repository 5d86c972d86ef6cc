use std::sync::Arc;

use parlor_storage::{
    ChatBackend, ConversationId, ConversationRecord, MessageRecord, SendOutcome,
};
use snafu::{OptionExt, ResultExt};
use tokio::task::JoinSet;

use crate::chat::{
    ChatEvent, ChatRef, ConversationListController, EventReceiver, MessageStreamController,
    events,
};
use crate::copilot::{CopilotRelay, Responder, RigResponder, is_copilot_command};
use crate::error::{
    ClientResult, CopilotSnafu, NoSessionSnafu, SessionSnafu, UnknownConversationSnafu,
};
use crate::session::Session;
use crate::settings::CopilotSettings;

/// Session, controllers and the event channel their subscriptions feed.
///
/// Every state change happens in a `&mut self` method; live snapshots reach the
/// controllers only through [`handle_event`](Self::handle_event).
pub struct ChatClient {
    backend: Arc<dyn ChatBackend>,
    session: Session,
    conversations: ConversationListController,
    messages: MessageStreamController,
    events: EventReceiver,
    copilot: Option<Arc<CopilotRelay>>,
    copilot_tasks: JoinSet<()>,
}

impl ChatClient {
    /// Subscribes to the conversation list right away when the session is already active.
    pub async fn start(backend: Arc<dyn ChatBackend>, session: Session) -> ClientResult<Self> {
        let (sender, receiver) = events::channel();
        let mut client = Self {
            backend,
            session,
            conversations: ConversationListController::new(sender.clone()),
            messages: MessageStreamController::new(sender),
            events: receiver,
            copilot: None,
            copilot_tasks: JoinSet::new(),
        };

        if client.session.is_active() {
            client.conversations.activate(client.backend.as_ref()).await?;
        }
        Ok(client)
    }

    pub fn with_copilot(mut self, responder: Arc<dyn Responder>) -> Self {
        self.copilot = Some(Arc::new(CopilotRelay::new(
            Arc::clone(&self.backend),
            responder,
        )));
        self
    }

    /// Wires the rig-backed responder when the settings allow it, and drops it otherwise.
    /// Replies already in flight still land.
    pub fn enable_copilot(&mut self, settings: &CopilotSettings) -> ClientResult<bool> {
        if !settings.is_usable() {
            if settings.enabled {
                tracing::warn!("copilot is enabled but has no api key");
            }
            self.copilot = None;
            return Ok(false);
        }

        let responder = RigResponder::new(settings).context(CopilotSnafu {
            stage: "client-enable-copilot",
        })?;
        self.copilot = Some(Arc::new(CopilotRelay::new(
            Arc::clone(&self.backend),
            Arc::new(responder),
        )));
        Ok(true)
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn conversations(&self) -> &[ConversationRecord] {
        self.conversations.conversations()
    }

    pub fn selected_id(&self) -> Option<ConversationId> {
        self.conversations.selected()
    }

    pub fn selected_conversation(&self) -> Option<&ConversationRecord> {
        self.conversations.selected_conversation()
    }

    pub fn messages(&self) -> &[MessageRecord] {
        self.messages.messages()
    }

    pub fn is_subscribed(&self) -> bool {
        self.conversations.is_subscribed()
    }

    pub async fn login(&mut self, name: &str) -> ClientResult<()> {
        self.session.set_name(name).context(SessionSnafu {
            stage: "client-login",
        })?;
        self.conversations.activate(self.backend.as_ref()).await
    }

    /// Releases both subscriptions, then forgets the display name.
    pub fn logout(&mut self) -> ClientResult<()> {
        self.messages.teardown();
        self.conversations.deactivate();
        self.session.clear().context(SessionSnafu {
            stage: "client-logout",
        })
    }

    pub async fn select_chat(&mut self, conversation_id: ConversationId) -> ClientResult<()> {
        self.require_session("client-select-chat")?;
        self.conversations.select(conversation_id)?;
        self.sync_messages().await
    }

    /// Creates and opens a chat. The chat exists once this returns `Ok`, even when its
    /// thread could not be followed yet.
    pub async fn create_chat(&mut self, name: &str) -> ClientResult<ConversationRecord> {
        let creator = self.require_session("client-create-chat")?.to_string();
        let created = self
            .conversations
            .create(self.backend.as_ref(), name, &creator)
            .await?;
        if let Err(error) = self.sync_messages().await {
            tracing::error!(
                conversation_id = %created.id,
                "chat created but its thread could not be followed: {error}"
            );
        }
        Ok(created)
    }

    pub async fn rename_chat(
        &mut self,
        conversation_id: ConversationId,
        new_name: &str,
    ) -> ClientResult<ConversationRecord> {
        self.require_session("client-rename-chat")?;
        self.conversations
            .rename(self.backend.as_ref(), conversation_id, new_name)
            .await
    }

    pub async fn delete_chat(&mut self, conversation_id: ConversationId) -> ClientResult<()> {
        self.require_session("client-delete-chat")?;
        let moved = self
            .conversations
            .delete(self.backend.as_ref(), conversation_id)
            .await?;
        if moved {
            self.sync_messages().await?;
        }
        Ok(())
    }

    /// Sends to the selected chat and, when the text mentions the copilot, queues its reply.
    pub async fn send_message(&mut self, text: &str) -> ClientResult<SendOutcome> {
        let sender = self.require_session("client-send-message")?.to_string();
        let outcome = self
            .messages
            .send(self.backend.as_ref(), text, &sender)
            .await?;

        if let Some(relay) = &self.copilot
            && is_copilot_command(&outcome.message.content)
        {
            let relay = Arc::clone(relay);
            let trigger = outcome.message.clone();
            self.copilot_tasks.spawn(async move {
                if let Err(error) = relay.answer(&trigger).await {
                    tracing::error!(
                        conversation_id = %trigger.conversation_id,
                        "copilot reply failed: {error}"
                    );
                }
            });
        }
        Ok(outcome)
    }

    /// Maps a list position or id onto a chat in the current list.
    pub fn resolve_chat(&self, reference: &ChatRef) -> ClientResult<ConversationId> {
        let conversations = self.conversations.conversations();
        let found = match reference {
            ChatRef::Position(position) => position
                .checked_sub(1)
                .and_then(|index| conversations.get(index))
                .map(|conversation| conversation.id),
            ChatRef::Id(raw) => ConversationId::parse(raw)
                .ok()
                .filter(|id| self.conversations.contains(*id)),
        };

        found.context(UnknownConversationSnafu {
            stage: "client-resolve-chat",
            reference: reference.to_string(),
        })
    }

    pub async fn next_event(&mut self) -> Option<ChatEvent> {
        self.events.recv().await
    }

    /// Applies one snapshot. Returns whether anything visible changed.
    pub async fn handle_event(&mut self, event: ChatEvent) -> ClientResult<bool> {
        match event {
            ChatEvent::Conversations {
                generation,
                conversations,
            } => {
                let current = generation == self.conversations.generation();
                let moved = self.conversations.apply_snapshot(generation, conversations);
                if moved {
                    self.sync_messages().await?;
                }
                Ok(current)
            }
            ChatEvent::Messages {
                generation,
                conversation_id,
                messages,
            } => Ok(self
                .messages
                .apply_snapshot(generation, conversation_id, messages)),
        }
    }

    /// Handles every event already queued, without waiting for more.
    pub async fn drain_events(&mut self) -> ClientResult<bool> {
        let mut changed = false;
        while let Ok(event) = self.events.try_recv() {
            changed |= self.handle_event(event).await?;
        }
        Ok(changed)
    }

    /// Waits for pending copilot replies to be written.
    pub async fn settle_copilot(&mut self) {
        while let Some(joined) = self.copilot_tasks.join_next().await {
            if let Err(error) = joined {
                tracing::warn!("copilot task ended abnormally: {error}");
            }
        }
    }

    /// Releases every subscription and cancels pending copilot replies.
    pub fn shutdown(mut self) {
        self.messages.teardown();
        self.conversations.deactivate();
        self.copilot_tasks.abort_all();
        tracing::info!("chat client stopped");
    }

    async fn sync_messages(&mut self) -> ClientResult<()> {
        let selected = self.conversations.selected();
        self.messages.follow(self.backend.as_ref(), selected).await
    }

    fn require_session(&self, stage: &'static str) -> ClientResult<&str> {
        self.session.name().context(NoSessionSnafu { stage })
    }
}
