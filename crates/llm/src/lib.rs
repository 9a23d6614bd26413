use std::sync::Arc;

mod model;
mod provider;
mod rig_adapter;
mod simulated;

pub use model::{DEFAULT_ENDPOINT, DEFAULT_MODEL_ID, Model, default_models, resolve_model_id};
pub use provider::{
    BoxFuture, LlmProvider, ProviderConfig, ProviderError, ProviderMessage, ProviderResult, Role,
};
pub use rig_adapter::{RIG_OPENAI_PROVIDER_ID, RigProviderAdapter};
pub use simulated::{SIMULATED_PROVIDER_ID, SimulatedProvider};

/// Picks the provider for `config`; without an API key every id resolves to the simulated one.
pub fn create_provider(mut config: ProviderConfig) -> ProviderResult<Arc<dyn LlmProvider>> {
    if config.api_key.is_empty() {
        tracing::info!(
            provider_id = %config.provider_id,
            "no API key configured; using simulated provider"
        );
        return Ok(Arc::new(SimulatedProvider::new()));
    }

    if config.provider_id.trim().is_empty() {
        config.provider_id = RIG_OPENAI_PROVIDER_ID.to_string();
    }

    match config.provider_id.as_str() {
        "openai" | "rig-openai" | "openrouter" => {
            config.provider_id = RIG_OPENAI_PROVIDER_ID.to_string();
            Ok(Arc::new(RigProviderAdapter::new(config)?))
        }
        SIMULATED_PROVIDER_ID => Ok(Arc::new(SimulatedProvider::new())),
        _ => Err(ProviderError::UnsupportedProvider {
            stage: "create-provider",
            provider_id: config.provider_id,
        }),
    }
}
