use std::{fmt, str::FromStr, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    config::ProviderSettings,
    types::{ChatMessage, CompletionRequest, CompletionResponse, CompletionStream},
    LLMError,
};

pub mod anthropic;
pub mod gemini;
pub mod ollama;
pub mod openai;
pub mod scripted;

#[async_trait]
pub trait LLMProvider: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LLMError>;

    async fn stream_completion(
        &self,
        _request: CompletionRequest,
    ) -> Result<CompletionStream, LLMError> {
        Err(LLMError::Unsupported("streaming completions"))
    }

    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Ollama,
    Gemini,
    OpenAI,
    Anthropic,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Ollama => "ollama",
            ProviderKind::Gemini => "gemini",
            ProviderKind::OpenAI => "openai",
            ProviderKind::Anthropic => "anthropic",
        }
    }

    /// Prefix of the environment variables that override this provider's settings.
    pub fn env_prefix(&self) -> &'static str {
        match self {
            ProviderKind::Ollama => "OLLAMA_",
            ProviderKind::Gemini => "GEMINI_",
            ProviderKind::OpenAI => "OPENAI_",
            ProviderKind::Anthropic => "ANTHROPIC_",
        }
    }

    /// Self-hosted endpoints are probed before a batch starts.
    pub fn requires_reachable_endpoint(&self) -> bool {
        matches!(self, ProviderKind::Ollama)
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        [
            ProviderKind::Ollama,
            ProviderKind::Gemini,
            ProviderKind::OpenAI,
            ProviderKind::Anthropic,
        ]
        .into_iter()
        .find(|kind| kind.as_str().eq_ignore_ascii_case(value.trim()))
        .ok_or_else(|| format!("unknown provider '{value}' (expected ollama, gemini, openai or anthropic)"))
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Builds the HTTP back-end for resolved settings.
pub fn create_provider(settings: &ProviderSettings) -> Result<Arc<dyn LLMProvider>, LLMError> {
    let provider: Arc<dyn LLMProvider> = match settings.kind {
        ProviderKind::Ollama => Arc::new(ollama::Ollama::from_settings(settings)?),
        ProviderKind::Gemini => Arc::new(gemini::Gemini::from_settings(settings)?),
        ProviderKind::OpenAI => Arc::new(openai::OpenAI::from_settings(settings)?),
        ProviderKind::Anthropic => Arc::new(anthropic::Anthropic::from_settings(settings)?),
    };
    Ok(provider)
}

/// A provider bound to one model alias and its sampling parameters.
#[derive(Clone)]
pub struct ChatModel {
    alias: String,
    model: String,
    provider: Arc<dyn LLMProvider>,
    temperature: Option<f32>,
    top_p: Option<f32>,
    max_tokens: Option<u32>,
}

impl fmt::Debug for ChatModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChatModel")
            .field("alias", &self.alias)
            .field("model", &self.model)
            .field("provider", &self.provider.name())
            .field("temperature", &self.temperature)
            .field("top_p", &self.top_p)
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

impl ChatModel {
    pub fn new(
        alias: impl Into<String>,
        model: impl Into<String>,
        provider: Arc<dyn LLMProvider>,
    ) -> Self {
        Self {
            alias: alias.into(),
            model: model.into(),
            provider,
            temperature: None,
            top_p: None,
            max_tokens: None,
        }
    }

    pub fn from_settings(
        alias: impl Into<String>,
        settings: &ProviderSettings,
        provider: Arc<dyn LLMProvider>,
    ) -> Self {
        Self {
            alias: alias.into(),
            model: settings.model.clone(),
            provider,
            temperature: settings.temperature,
            top_p: settings.top_p,
            max_tokens: settings.max_tokens,
        }
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.name()
    }

    fn request(&self, messages: &[ChatMessage]) -> CompletionRequest {
        let mut request = CompletionRequest::new(self.model.clone(), messages.to_vec());
        if let Some(temperature) = self.temperature {
            request = request.with_temperature(temperature);
        }
        if let Some(top_p) = self.top_p {
            request = request.with_top_p(top_p);
        }
        if let Some(max_tokens) = self.max_tokens {
            request = request.with_max_tokens(max_tokens);
        }
        request
    }

    /// Sends the messages and returns the assistant text; a reply without
    /// text content comes back as an empty string.
    pub async fn invoke(&self, messages: &[ChatMessage]) -> Result<String, LLMError> {
        let response = self.provider.complete(self.request(messages)).await?;
        Ok(response.message.content.unwrap_or_default())
    }

    pub async fn stream(&self, messages: &[ChatMessage]) -> Result<CompletionStream, LLMError> {
        self.provider.stream_completion(self.request(messages)).await
    }
}

/// Creates one fresh model handle per agent per match.
pub trait ModelFactory: Send + Sync {
    fn create(&self, alias: &str, settings: &ProviderSettings) -> Result<ChatModel, LLMError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HttpModelFactory;

impl ModelFactory for HttpModelFactory {
    fn create(&self, alias: &str, settings: &ProviderSettings) -> Result<ChatModel, LLMError> {
        let provider = create_provider(settings)?;
        Ok(ChatModel::from_settings(alias, settings, provider))
    }
}

pub(crate) fn endpoint(base_url: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::providers::scripted::ScriptedProvider;

    #[tokio::test]
    async fn chat_model_forwards_sampling_parameters() {
        let provider = Arc::new(ScriptedProvider::new(vec!["ok"]));
        let settings = ProviderSettings {
            kind: ProviderKind::Ollama,
            model: "llama3.1".to_string(),
            base_url: "http://localhost:11434".to_string(),
            api_key: None,
            temperature: Some(0.4),
            top_p: Some(0.9),
            max_tokens: Some(256),
            keep_alive: None,
            request_timeout: std::time::Duration::from_secs(5),
        };
        let model = ChatModel::from_settings("local", &settings, provider.clone());

        let reply = model.invoke(&[ChatMessage::user("hi")]).await.unwrap();
        assert_eq!(reply, "ok");

        let requests = provider.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].model, "llama3.1");
        assert_eq!(requests[0].temperature, Some(0.4));
        assert_eq!(requests[0].top_p, Some(0.9));
        assert_eq!(requests[0].max_tokens, Some(256));
    }

    #[tokio::test]
    async fn chat_model_streams_deltas_then_completion() {
        use futures_util::StreamExt;

        use crate::types::StreamEvent;

        let provider = Arc::new(ScriptedProvider::new(vec!["the seer lies"]));
        let model = ChatModel::new("local", "llama3.1", provider.clone());

        let mut stream = model.stream(&[ChatMessage::user("who?")]).await.unwrap();
        let mut deltas = Vec::new();
        let mut completed = None;
        while let Some(event) = stream.next().await {
            match event.unwrap() {
                StreamEvent::MessageDelta(delta) => deltas.push(delta),
                StreamEvent::Completed(response) => completed = Some(response),
            }
        }

        assert_eq!(deltas, vec!["the ", "seer ", "lies"]);
        assert_eq!(completed.unwrap().message.text(), Some("the seer lies"));
        assert_eq!(provider.requests()[0].model, "llama3.1");
        assert!(model.stream(&[ChatMessage::user("again")]).await.is_err());
    }

    #[test]
    fn provider_kind_parses_lowercase_names() {
        let kind: ProviderKind = serde_yaml::from_str("openai").unwrap();
        assert_eq!(kind, ProviderKind::OpenAI);
        assert_eq!("Gemini".parse::<ProviderKind>(), Ok(ProviderKind::Gemini));
        assert!("bard".parse::<ProviderKind>().is_err());
        assert!(ProviderKind::Ollama.requires_reachable_endpoint());
        assert!(!ProviderKind::Gemini.requires_reachable_endpoint());
    }

    #[test]
    fn endpoint_joins_without_duplicate_slashes() {
        assert_eq!(endpoint("http://host:11434/", "/api/chat"), "http://host:11434/api/chat");
    }
}
