use std::time::Duration;

use serde::Deserialize;

use crate::{config::ConfigError, providers::ProviderKind};

const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 120;

/// One source of provider settings. Layers are merged explicitly, highest
/// precedence first: the models file, then the environment, then the
/// provider defaults.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SettingsLayer {
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
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub keep_alive: Option<String>,
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
}

impl SettingsLayer {
    /// Fills every unset field from `lower`.
    pub fn merge(self, lower: SettingsLayer) -> Self {
        Self {
            model: self.model.or(lower.model),
            base_url: self.base_url.or(lower.base_url),
            api_key: self.api_key.or(lower.api_key),
            temperature: self.temperature.or(lower.temperature),
            top_p: self.top_p.or(lower.top_p),
            max_tokens: self.max_tokens.or(lower.max_tokens),
            keep_alive: self.keep_alive.or(lower.keep_alive),
            request_timeout_secs: self.request_timeout_secs.or(lower.request_timeout_secs),
        }
    }

    /// Reads `{PREFIX}MODEL`, `{PREFIX}BASE_URL`, `{PREFIX}API_KEY` and friends.
    pub fn from_env<F>(prefix: &str, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |name: &str| {
            lookup(&format!("{prefix}{name}"))
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        Ok(Self {
            model: read("MODEL"),
            base_url: read("BASE_URL"),
            api_key: read("API_KEY"),
            temperature: parse_env(prefix, "TEMPERATURE", read("TEMPERATURE"))?,
            top_p: parse_env(prefix, "TOP_P", read("TOP_P"))?,
            max_tokens: parse_env(prefix, "MAX_TOKENS", read("MAX_TOKENS"))?,
            keep_alive: read("KEEP_ALIVE"),
            request_timeout_secs: parse_env(prefix, "REQUEST_TIMEOUT_SECS", read("REQUEST_TIMEOUT_SECS"))?,
        })
    }

    pub fn defaults_for(kind: ProviderKind) -> Self {
        let base = Self {
            request_timeout_secs: Some(DEFAULT_REQUEST_TIMEOUT_SECS),
            ..Self::default()
        };

        match kind {
            ProviderKind::Ollama => Self {
                model: Some("llama3.1".to_string()),
                base_url: Some("http://localhost:11434".to_string()),
                temperature: Some(0.7),
                top_p: Some(0.95),
                ..base
            },
            ProviderKind::Gemini => Self {
                model: Some("gemini-1.5-pro".to_string()),
                base_url: Some("https://generativelanguage.googleapis.com".to_string()),
                temperature: Some(0.3),
                top_p: Some(0.95),
                ..base
            },
            ProviderKind::OpenAI => Self {
                model: Some("gpt-4o-mini".to_string()),
                base_url: Some(crate::providers::openai::DEFAULT_BASE_URL.to_string()),
                temperature: Some(0.3),
                ..base
            },
            ProviderKind::Anthropic => Self {
                model: Some("claude-3-haiku-20240307".to_string()),
                base_url: Some("https://api.anthropic.com".to_string()),
                temperature: Some(0.3),
                max_tokens: Some(1024),
                ..base
            },
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(temperature) = self.temperature {
            if !(0.0..=2.0).contains(&temperature) {
                return Err(ConfigError::invalid(
                    "temperature",
                    format!("{temperature} is outside 0.0..=2.0"),
                ));
            }
        }
        if let Some(top_p) = self.top_p {
            if !(0.0..=1.0).contains(&top_p) {
                return Err(ConfigError::invalid(
                    "top_p",
                    format!("{top_p} is outside 0.0..=1.0"),
                ));
            }
        }
        if self.max_tokens == Some(0) {
            return Err(ConfigError::invalid("max_tokens", "must be at least 1"));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(
    prefix: &str,
    name: &str,
    value: Option<String>,
) -> Result<Option<T>, ConfigError> {
    match value {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::invalid(format!("{prefix}{name}"), format!("cannot parse '{raw}'"))),
        None => Ok(None),
    }
}

/// Fully resolved settings for one model alias.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderSettings {
    pub kind: ProviderKind,
    pub model: String,
    pub base_url: String,
    pub api_key: Option<String>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_tokens: Option<u32>,
    pub keep_alive: Option<String>,
    pub request_timeout: Duration,
}

impl ProviderSettings {
    pub fn resolve(
        kind: ProviderKind,
        explicit: SettingsLayer,
        environment: SettingsLayer,
    ) -> Result<Self, ConfigError> {
        let merged = explicit
            .merge(environment)
            .merge(SettingsLayer::defaults_for(kind));
        merged.validate()?;

        let model = merged
            .model
            .ok_or_else(|| ConfigError::MissingKey("model".to_string()))?;
        let base_url = merged
            .base_url
            .ok_or_else(|| ConfigError::MissingKey("base_url".to_string()))?;

        Ok(Self {
            kind,
            model,
            base_url,
            api_key: merged.api_key,
            temperature: merged.temperature,
            top_p: merged.top_p,
            max_tokens: merged.max_tokens,
            keep_alive: merged.keep_alive,
            request_timeout: Duration::from_secs(
                merged
                    .request_timeout_secs
                    .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS),
            ),
        })
    }
}
