use super::model::{DEFAULT_MODEL_ID, Model, default_models, resolve_model_id};
use super::provider::{BoxFuture, LlmProvider, ProviderMessage, ProviderResult, Role};

pub const SIMULATED_PROVIDER_ID: &str = "simulated";
const PREVIEW_CHARS: usize = 200;

/// Offline stand-in used when no API key is configured; echoes the latest user turn.
#[derive(Debug, Clone)]
pub struct SimulatedProvider {
    models: Vec<Model>,
}

impl SimulatedProvider {
    pub fn new() -> Self {
        Self {
            models: default_models(),
        }
    }

    pub fn reply_for(messages: &[ProviderMessage], model_id: &str) -> String {
        let preview = messages
            .iter()
            .rev()
            .find(|message| message.role == Role::User)
            .map(|message| message.content.chars().take(PREVIEW_CHARS).collect::<String>())
            .unwrap_or_default();

        format!("Simulated response ({model_id}): {preview}")
    }
}

impl Default for SimulatedProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl LlmProvider for SimulatedProvider {
    fn id(&self) -> &str {
        SIMULATED_PROVIDER_ID
    }

    fn name(&self) -> &str {
        "Simulated"
    }

    fn default_model(&self) -> &str {
        DEFAULT_MODEL_ID
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
            let model_id = resolve_model_id(model_id, DEFAULT_MODEL_ID);
            Ok(Self::reply_for(&messages, model_id))
        })
    }
}
