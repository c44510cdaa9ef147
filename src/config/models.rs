use std::{collections::BTreeMap, path::Path};

use serde::Deserialize;

use crate::{
    config::{load_yaml, parse_yaml, ConfigError, ProviderSettings, SettingsLayer},
    providers::ProviderKind,
};

pub const DEFAULT_MODELS_PATH: &str = "config/models.yaml";

/// One entry of `models.yaml`. Optional fields fall back to the environment
/// and then to the provider defaults.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ModelConfig {
    pub provider: ProviderKind,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default, alias = "max_output_tokens")]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub keep_alive: Option<String>,
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
    #[serde(default)]
    pub description: Option<String>,
}

impl ModelConfig {
    pub fn layer(&self) -> SettingsLayer {
        SettingsLayer {
            model: self.model.clone(),
            base_url: self.base_url.clone(),
            api_key: self.api_key.clone(),
            temperature: self.temperature,
            top_p: self.top_p,
            max_tokens: self.max_tokens,
            keep_alive: self.keep_alive.clone(),
            request_timeout_secs: self.request_timeout_secs,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawRegistry {
    #[serde(default)]
    models: BTreeMap<String, ModelConfig>,
}

/// Alias → model configuration, as declared in `models.yaml`.
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    models: BTreeMap<String, ModelConfig>,
}

impl ModelRegistry {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw: RawRegistry = load_yaml(path.as_ref())?;
        Self::from_models(raw.models)
    }

    pub fn from_yaml_str(input: &str) -> Result<Self, ConfigError> {
        let raw: RawRegistry = parse_yaml(input, Path::new("<inline>"))?;
        Self::from_models(raw.models)
    }

    pub fn from_models(models: BTreeMap<String, ModelConfig>) -> Result<Self, ConfigError> {
        for (alias, config) in &models {
            config.layer().validate().map_err(|error| match error {
                ConfigError::Invalid { key, message } => {
                    ConfigError::invalid(format!("models.{alias}.{key}"), message)
                }
                other => other,
            })?;
        }
        Ok(Self { models })
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.models.keys().map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.models.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Result<&ModelConfig, ConfigError> {
        self.models.get(name).ok_or_else(|| ConfigError::UnknownModel {
            name: name.to_string(),
            available: self.names().collect::<Vec<_>>().join(", "),
        })
    }

    /// Resolves an alias against the process environment.
    pub fn resolve(&self, name: &str) -> Result<ProviderSettings, ConfigError> {
        self.resolve_with(name, |key| std::env::var(key).ok())
    }

    pub fn resolve_with<F>(&self, name: &str, lookup: F) -> Result<ProviderSettings, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let config = self.get(name)?;
        let environment = SettingsLayer::from_env(config.provider.env_prefix(), lookup)?;
        ProviderSettings::resolve(config.provider, config.layer(), environment)
    }
}
