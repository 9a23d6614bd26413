use futures::StreamExt;
use rig::completion::{CompletionModel, Message as RigMessage};
use rig::prelude::CompletionClient;
use rig::providers::openai;
use rig::streaming::StreamedAssistantContent;
use snafu::{ResultExt, ensure};

use super::model::{DEFAULT_MODEL_ID, Model, default_models, resolve_model_id};
use super::provider::{
    BoxFuture, CompletionsFailedSnafu, EmptyCompletionSnafu, EmptyMessageSetSnafu,
    HttpClientSnafu, LlmProvider, MissingApiKeySnafu, ProviderConfig, ProviderError,
    ProviderMessage, ProviderResult, Role,
};

pub const RIG_OPENAI_PROVIDER_ID: &str = "openai";

/// OpenAI-compatible chat completion through rig; works against OpenRouter via `endpoint`.
pub struct RigProviderAdapter {
    config: ProviderConfig,
    models: Vec<Model>,
}

impl RigProviderAdapter {
    pub fn new(config: ProviderConfig) -> ProviderResult<Self> {
        ensure!(
            !config.api_key.is_empty(),
            MissingApiKeySnafu {
                stage: "rig-adapter-new",
                provider_id: config.provider_id.clone(),
            }
        );

        Ok(Self {
            config,
            models: default_models(),
        })
    }

    fn build_client(config: &ProviderConfig) -> ProviderResult<openai::Client> {
        let mut builder = openai::Client::builder().api_key(config.api_key.as_str());
        if !config.endpoint.is_empty() {
            builder = builder.base_url(config.endpoint.as_str());
        }
        builder.build().context(HttpClientSnafu {
            stage: "build-client",
        })
    }

    fn to_rig_message(message: &ProviderMessage) -> Option<RigMessage> {
        match message.role {
            Role::System => None,
            Role::User => Some(RigMessage::user(message.content.clone())),
            Role::Assistant => Some(RigMessage::assistant(message.content.clone())),
        }
    }

    fn merged_preamble(messages: &[ProviderMessage]) -> Option<String> {
        // Rig takes a single preamble, so system turns are folded into it.
        let parts = messages
            .iter()
            .filter(|message| {
                matches!(message.role, Role::System) && !message.content.trim().is_empty()
            })
            .map(|message| message.content.clone())
            .collect::<Vec<_>>();

        if parts.is_empty() {
            None
        } else {
            Some(parts.join("\n\n"))
        }
    }

    async fn complete(
        config: &ProviderConfig,
        messages: &[ProviderMessage],
        model_id: &str,
    ) -> ProviderResult<String> {
        let client = Self::build_client(config)?;
        let model = client.completion_model(model_id.to_string());

        let mut history = messages
            .iter()
            .filter_map(Self::to_rig_message)
            .collect::<Vec<_>>();

        let Some(prompt) = history.pop() else {
            tracing::warn!(
                model_id,
                total_message_count = messages.len(),
                "no user/assistant messages remain after filtering"
            );
            return EmptyMessageSetSnafu {
                stage: "complete-pop-prompt",
                model_id: model_id.to_string(),
            }
            .fail();
        };

        let mut builder = model.completion_request(prompt).messages(history);
        if let Some(preamble) = Self::merged_preamble(messages) {
            builder = builder.preamble(preamble);
        }

        let mut stream = builder.stream().await.context(CompletionsFailedSnafu {
            stage: "open-stream",
        })?;

        let mut response = String::new();
        while let Some(item) = stream.next().await {
            match item {
                Ok(StreamedAssistantContent::Text(text)) => response.push_str(&text.text),
                Ok(_) => {}
                Err(source) => {
                    tracing::warn!(model_id, error = %source, "provider stream emitted an error chunk");
                    return Err(ProviderError::CompletionsFailed {
                        stage: "stream-chunk",
                        source,
                    });
                }
            }
        }

        ensure!(
            !response.trim().is_empty(),
            EmptyCompletionSnafu {
                stage: "complete-collect",
                model_id: model_id.to_string(),
            }
        );

        Ok(response)
    }
}

impl LlmProvider for RigProviderAdapter {
    fn id(&self) -> &str {
        &self.config.provider_id
    }

    fn name(&self) -> &str {
        "Rig OpenAI"
    }

    fn default_model(&self) -> &str {
        self.config.default_model.as_deref().unwrap_or(DEFAULT_MODEL_ID)
    }

    fn models(&self) -> &[Model] {
        &self.models
    }

    fn generate<'a>(
        &'a self,
        messages: Vec<ProviderMessage>,
        model_id: &'a str,
    ) -> BoxFuture<'a, ProviderResult<String>> {
        Box::pin(async move {
            let model_id = resolve_model_id(model_id, self.default_model());
            tracing::debug!(
                provider_id = %self.config.provider_id,
                model_id,
                message_count = messages.len(),
                "dispatching completion"
            );
            Self::complete(&self.config, &messages, model_id).await
        })
    }
}
