#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Model {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
}

impl Model {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
        }
    }

    pub fn from_id(id: impl Into<String>) -> Self {
        let id = id.into();
        Self::new(id.clone(), id)
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

pub const DEFAULT_MODEL_ID: &str = "openrouter/auto";
pub const DEFAULT_ENDPOINT: &str = "https://openrouter.ai/api/v1";

pub fn default_models() -> Vec<Model> {
    vec![
        Model::new(DEFAULT_MODEL_ID, "Auto").with_description("Router-selected model"),
        Model::new("anthropic/claude-3.5-sonnet", "Claude 3.5 Sonnet")
            .with_description("Anthropic general model"),
        Model::new("openai/gpt-4o-mini", "GPT-4o mini")
            .with_description("Balanced cost/performance"),
        Model::new("google/gemini-2.0-flash-001", "Gemini 2.0 Flash")
            .with_description("Low latency Google model"),
    ]
}

/// Resolves a caller-supplied model id, falling back when it is blank.
pub fn resolve_model_id<'a>(requested: &'a str, fallback: &'a str) -> &'a str {
    let requested = requested.trim();
    if requested.is_empty() {
        fallback
    } else {
        requested
    }
}
