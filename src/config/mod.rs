//! YAML-backed configuration: the model registry, experiment settings and
//! per-agent prompt books. Everything is validated once at load time.

use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::de::DeserializeOwned;
use thiserror::Error;

pub mod experiment;
pub mod models;
pub mod settings;

pub use experiment::{
    resolve_player_order, AgentBinding, AgentPrompts, Experiment, ExperimentConfig,
    ExperimentPaths, Player, PromptBook, PromptPair,
};
pub use models::{ModelConfig, ModelRegistry, DEFAULT_MODELS_PATH};
pub use settings::{ProviderSettings, SettingsLayer};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    MissingFile(PathBuf),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("missing required key `{0}`")]
    MissingKey(String),

    #[error("`{first}` and `{second}` cannot both be set")]
    Conflict {
        first: &'static str,
        second: &'static str,
    },

    #[error("model '{name}' is not defined; available: {available}")]
    UnknownModel { name: String, available: String },

    #[error("invalid value for `{key}`: {message}")]
    Invalid { key: String, message: String },
}

impl ConfigError {
    pub(crate) fn invalid(key: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::Invalid {
            key: key.into(),
            message: message.into(),
        }
    }
}

/// Reads a text file, mapping a missing path to [`ConfigError::MissingFile`].
pub fn read_text(path: &Path) -> Result<String, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::MissingFile(path.to_path_buf()));
    }
    fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Parses a YAML document; an empty document is treated as an empty mapping.
pub fn parse_yaml<T: DeserializeOwned>(input: &str, origin: &Path) -> Result<T, ConfigError> {
    let input = if input.trim().is_empty() { "{}" } else { input };
    serde_yaml::from_str(input).map_err(|source| ConfigError::Yaml {
        path: origin.to_path_buf(),
        source,
    })
}

pub fn load_yaml<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let content = read_text(path)?;
    parse_yaml(&content, path)
}

/// Loads `.env` from the working directory into the process environment.
///
/// Returns false when no file was found; an absent `.env` is not an error.
pub fn load_dotenv() -> bool {
    dotenvy::dotenv().is_ok()
}
