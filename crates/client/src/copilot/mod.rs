mod rig_adapter;

use std::sync::Arc;

use async_trait::async_trait;
use parlor_storage::{ChatBackend, MessageRecord, MessageRole, NewMessage, StorageError};
use snafu::{ResultExt, Snafu};

pub use rig_adapter::RigResponder;

pub const COPILOT_MENTION: &str = "@copilot";
pub const COPILOT_SENDER: &str = "Copilot";
pub const HISTORY_LIMIT: usize = 100;

const DEFAULT_CONTEXT_NAME: &str = "User";

pub const COPILOT_PREAMBLE: &str = "You are a helpful facilitator for a chat application. \
Assist users by providing relevant information and answering their questions in a friendly, \
professional tone with clear and concise replies. If you do not know the answer, say \"I don't \
know\". The conversation history is given as <name>message</name> lines. Reply with the content \
of your message only, without name tags and without markdown.";

pub fn is_copilot_command(content: &str) -> bool {
    content.contains(COPILOT_MENTION)
}

pub fn extract_query(content: &str) -> String {
    content.replace(COPILOT_MENTION, "").trim().to_string()
}

/// Renders history as a `<conversation>` block, one `<name>content</name>` line per message.
pub fn format_message_context(messages: &[MessageRecord]) -> String {
    let mut context = String::from("<conversation>\n");
    for message in messages {
        let name = if message.username.trim().is_empty() {
            DEFAULT_CONTEXT_NAME
        } else {
            message.username.as_str()
        };
        context.push_str(&format!("<{name}>{}</{name}>\n", message.content));
    }
    context.push_str("</conversation>");
    context
}

pub fn build_prompt(history: &[MessageRecord], username: &str, query: &str) -> String {
    format!(
        "{}\n\n I'm {username}. {query}",
        format_message_context(history)
    )
}

/// Produces the assistant's reply for one prompt.
#[async_trait]
pub trait Responder: Send + Sync {
    async fn respond(&self, prompt: &str) -> Result<String, CopilotError>;
}

/// Answers `@copilot` mentions with a single assistant message in the same chat.
pub struct CopilotRelay {
    backend: Arc<dyn ChatBackend>,
    responder: Arc<dyn Responder>,
}

impl CopilotRelay {
    pub fn new(backend: Arc<dyn ChatBackend>, responder: Arc<dyn Responder>) -> Self {
        Self { backend, responder }
    }

    /// Returns `None` when `trigger` is not a user message mentioning the copilot.
    pub async fn answer(
        &self,
        trigger: &MessageRecord,
    ) -> Result<Option<MessageRecord>, CopilotError> {
        if trigger.role == Some(MessageRole::Assistant) || !is_copilot_command(&trigger.content) {
            return Ok(None);
        }

        let conversation_id = trigger.conversation_id;
        let mut history = self
            .backend
            .list_messages(conversation_id)
            .await
            .context(BackendSnafu {
                stage: "copilot-load-history",
            })?;
        history.retain(|message| {
            message.id != trigger.id && message.created_at <= trigger.created_at
        });
        let skip = history.len().saturating_sub(HISTORY_LIMIT);
        let history = &history[skip..];

        let prompt = build_prompt(history, &trigger.username, &extract_query(&trigger.content));
        tracing::debug!(
            %conversation_id,
            trigger_id = %trigger.id,
            history = history.len(),
            "asking copilot"
        );

        let content = match self.responder.respond(&prompt).await {
            Ok(reply) if !reply.trim().is_empty() => reply.trim().to_string(),
            Ok(_) => "Error generating response: empty reply".to_string(),
            Err(error) => {
                tracing::error!(%conversation_id, "copilot failed: {error}");
                format!("Error generating response: {error}")
            }
        };

        let reply = self
            .backend
            .append_message(conversation_id, NewMessage::assistant(content, COPILOT_SENDER))
            .await
            .context(BackendSnafu {
                stage: "copilot-append-reply",
            })?;

        // Same second write as a user send; the reply stands even if it fails.
        if let Err(error) = self
            .backend
            .touch_conversation(conversation_id, COPILOT_SENDER)
            .await
        {
            tracing::warn!(
                %conversation_id,
                message_id = %reply.id,
                "copilot reply stored but chat timestamp update failed: {error}"
            );
        }
        Ok(Some(reply))
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CopilotError {
    #[snafu(display("copilot api key is missing on `{stage}`"))]
    MissingApiKey { stage: &'static str },
    #[snafu(display("failed to build copilot client on `{stage}`: {source}"))]
    BuildClient {
        stage: &'static str,
        source: rig::http_client::Error,
    },
    #[snafu(display("copilot prompt failed on `{stage}`: {source}"))]
    Prompt {
        stage: &'static str,
        source: rig::completion::PromptError,
    },
    #[snafu(display("{message}"))]
    Responder {
        stage: &'static str,
        message: String,
    },
    #[snafu(display("copilot backend request failed on `{stage}`: {source}"))]
    Backend {
        stage: &'static str,
        source: StorageError,
    },
}
