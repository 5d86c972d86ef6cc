use async_trait::async_trait;
use rig::completion::Prompt;
use rig::prelude::CompletionClient;
use rig::providers::openai;
use snafu::{ResultExt, ensure};

use super::{
    BuildClientSnafu, COPILOT_PREAMBLE, CopilotError, MissingApiKeySnafu, PromptSnafu, Responder,
};
use crate::settings::CopilotSettings;

/// Answers prompts through an OpenAI-compatible completion endpoint.
pub struct RigResponder {
    client: openai::Client,
    model: String,
}

impl RigResponder {
    pub fn new(settings: &CopilotSettings) -> Result<Self, CopilotError> {
        ensure!(
            !settings.api_key.is_empty(),
            MissingApiKeySnafu {
                stage: "rig-responder-new",
            }
        );

        let mut builder = openai::Client::builder().api_key(settings.api_key.as_str());
        if !settings.endpoint.is_empty() {
            builder = builder.base_url(settings.endpoint.as_str());
        }
        let client = builder.build().context(BuildClientSnafu {
            stage: "rig-responder-build-client",
        })?;

        tracing::info!(model = %settings.model, endpoint = %settings.endpoint, "copilot enabled");
        Ok(Self {
            client,
            model: settings.model.clone(),
        })
    }
}

#[async_trait]
impl Responder for RigResponder {
    async fn respond(&self, prompt: &str) -> Result<String, CopilotError> {
        let agent = self
            .client
            .agent(self.model.as_str())
            .preamble(COPILOT_PREAMBLE)
            .build();

        agent.prompt(prompt.to_string()).await.context(PromptSnafu {
            stage: "rig-responder-prompt",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_api_key_is_rejected_before_building_a_client() {
        let settings = CopilotSettings {
            enabled: true,
            ..CopilotSettings::default()
        };

        let error = RigResponder::new(&settings)
            .err()
            .expect("missing key rejected");
        assert!(matches!(error, CopilotError::MissingApiKey { .. }));
    }
}
