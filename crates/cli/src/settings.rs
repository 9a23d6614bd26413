use std::path::{Path, PathBuf};
use std::sync::Arc;

use arbor_llm::{DEFAULT_ENDPOINT, DEFAULT_MODEL_ID, ProviderConfig};
use arbor_storage::StoreSelection;
use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

pub const DEFAULT_PROVIDER_ID: &str = "openrouter";
pub const SETTINGS_DIRECTORY_NAME: &str = "arbor";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const LOCAL_STORE_FILE_NAME: &str = "nodes.json";
pub const ENV_PREFIX: &str = "ARBOR_";

/// Values resolved from defaults, then `settings.json`, then `ARBOR_*` variables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArborSettings {
    #[serde(default = "default_provider_id")]
    pub provider_id: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_model")]
    pub default_model: String,
    /// SQLite location; blank selects the local JSON store.
    #[serde(default)]
    pub database_url: String,
    #[serde(default)]
    pub local_store_path: String,
}

impl Default for ArborSettings {
    fn default() -> Self {
        Self {
            provider_id: default_provider_id(),
            api_key: String::new(),
            endpoint: default_endpoint(),
            default_model: default_model(),
            database_url: String::new(),
            local_store_path: String::new(),
        }
    }
}

impl ArborSettings {
    pub fn normalized(mut self) -> Self {
        self.provider_id = non_blank_or(self.provider_id, default_provider_id);
        self.api_key = self.api_key.trim().to_string();
        self.endpoint = non_blank_or(self.endpoint, default_endpoint);
        self.default_model = non_blank_or(self.default_model, default_model);
        self.database_url = self.database_url.trim().to_string();
        self.local_store_path = self.local_store_path.trim().to_string();
        self
    }

    pub fn to_provider_config(&self) -> ProviderConfig {
        ProviderConfig::new(
            &self.provider_id,
            &self.api_key,
            &self.endpoint,
            Some(self.default_model.clone()),
        )
    }

    pub fn store_selection(&self) -> StoreSelection {
        if !self.database_url.is_empty() {
            return StoreSelection::Sqlite {
                database_location: self.database_url.clone(),
            };
        }
        StoreSelection::Local {
            path: Some(self.local_store_file()),
        }
    }

    pub fn local_store_file(&self) -> PathBuf {
        if self.local_store_path.is_empty() {
            default_data_dir().join(LOCAL_STORE_FILE_NAME)
        } else {
            PathBuf::from(&self.local_store_path)
        }
    }

    /// Applies `key=value` from `arbor config set`.
    pub fn with_value(mut self, key: &str, value: &str) -> Result<Self, SettingsError> {
        let slot = match key {
            "provider_id" => &mut self.provider_id,
            "api_key" => &mut self.api_key,
            "endpoint" => &mut self.endpoint,
            "default_model" => &mut self.default_model,
            "database_url" => &mut self.database_url,
            "local_store_path" => &mut self.local_store_path,
            _ => {
                return UnknownKeySnafu {
                    stage: "apply-settings-value",
                    key: key.to_string(),
                }
                .fail();
            }
        };
        *slot = value.to_string();
        Ok(self.normalized())
    }

    /// Copy that is safe to print.
    pub fn redacted(&self) -> Self {
        let mut shown = self.clone();
        if !shown.api_key.is_empty() {
            shown.api_key = "********".to_string();
        }
        shown
    }
}

pub struct SettingsStore {
    settings: Arc<ArcSwap<ArborSettings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".arbor"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let settings = Self::load_from_disk(&config_path);
        Self {
            settings: Arc::new(ArcSwap::from_pointee(settings)),
            config_path,
        }
    }

    pub fn load(config_path: Option<PathBuf>) -> Self {
        Self::new(config_path.unwrap_or_else(Self::default_config_path))
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn settings(&self) -> Arc<ArborSettings> {
        self.settings.load_full()
    }

    pub fn update(&self, settings: ArborSettings) -> Result<(), SettingsError> {
        let normalized = settings.normalized();
        self.persist(&normalized)?;
        self.settings.store(Arc::new(normalized));
        Ok(())
    }

    fn load_from_disk(path: &Path) -> ArborSettings {
        let mut figment = Figment::from(Serialized::defaults(ArborSettings::default()));
        if path.exists() {
            figment = figment.merge(Json::file(path));
        } else {
            tracing::debug!(path = %path.display(), "settings file not found, using defaults");
        }
        figment = figment.merge(Env::prefixed(ENV_PREFIX));

        match figment.extract::<ArborSettings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %error,
                    "failed to parse settings, using defaults"
                );
                ArborSettings::default()
            }
        }
    }

    fn persist(&self, settings: &ArborSettings) -> Result<(), SettingsError> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).context(CreateDirSnafu {
                stage: "create-settings-directory",
                path: parent.to_path_buf(),
            })?;
        }

        let content = serde_json::to_string_pretty(settings).context(SerializeConfigSnafu {
            stage: "serialize-settings-json",
        })?;

        let temp_path = self.config_path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).context(WriteFileSnafu {
            stage: "write-temporary-settings-file",
            path: temp_path.clone(),
        })?;

        std::fs::rename(&temp_path, &self.config_path).context(RenameTempFileSnafu {
            stage: "rename-temporary-settings-file",
            from: temp_path,
            to: self.config_path.clone(),
        })?;

        tracing::info!(path = %self.config_path.display(), "saved settings");
        Ok(())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("unknown settings key `{key}` on `{stage}`"))]
    UnknownKey { stage: &'static str, key: String },
    #[snafu(display("failed to create settings directory at {path:?} on `{stage}`: {source}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to serialize settings on `{stage}`: {source}"))]
    SerializeConfig {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write settings file at {path:?} on `{stage}`: {source}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display(
        "failed to replace settings file from {from:?} to {to:?} on `{stage}`: {source}"
    ))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
        .unwrap_or_else(|| PathBuf::from(".arbor"))
}

fn non_blank_or(value: String, fallback: fn() -> String) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        fallback()
    } else {
        trimmed.to_string()
    }
}

fn default_provider_id() -> String {
    DEFAULT_PROVIDER_ID.to_string()
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn default_model() -> String {
    DEFAULT_MODEL_ID.to_string()
}
