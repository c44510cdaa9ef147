use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::{
    config::ProviderSettings,
    error::LLMError,
    providers::{endpoint, LLMProvider},
    types::{CompletionRequest, CompletionResponse, TokenUsage},
};

const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 1024;

#[derive(Debug, Clone)]
pub struct AnthropicConfig {
    pub api_key: String,
    pub base_url: String,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct Anthropic {
    client: Client,
    config: AnthropicConfig,
}

impl Anthropic {
    pub fn from_settings(settings: &ProviderSettings) -> Result<Self, LLMError> {
        let api_key = settings
            .api_key
            .clone()
            .ok_or(LLMError::MissingApiKey("ANTHROPIC_API_KEY"))?;

        Self::from_config(AnthropicConfig {
            api_key,
            base_url: settings.base_url.clone(),
            request_timeout: settings.request_timeout,
        })
    }

    pub fn from_config(config: AnthropicConfig) -> Result<Self, LLMError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self { client, config })
    }
}

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<MessageParam<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
}

#[derive(Debug, Serialize)]
struct MessageParam<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct AnthropicErrorEnvelope {
    error: AnthropicError,
}

#[derive(Debug, Deserialize)]
struct AnthropicError {
    message: String,
}

#[async_trait]
impl LLMProvider for Anthropic {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LLMError> {
        let (system, conversation) = request.split_system();
        let body = MessagesRequest {
            model: &request.model,
            max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            system,
            messages: conversation
                .into_iter()
                .map(|message| MessageParam {
                    role: message.role.as_str(),
                    content: message.text().unwrap_or_default(),
                })
                .collect(),
            temperature: request.temperature,
            top_p: request.top_p,
        };

        let response = self
            .client
            .post(endpoint(&self.config.base_url, "v1/messages"))
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await?;
        let status = response.status();

        if !status.is_success() {
            let text = response.text().await?;
            if let Ok(error) = serde_json::from_str::<AnthropicErrorEnvelope>(&text) {
                return Err(LLMError::Provider(error.error.message));
            }

            return Err(LLMError::Provider(format!("unexpected status {status}: {text}")));
        }

        let parsed: MessagesResponse = response.json().await?;
        let text = parsed
            .content
            .into_iter()
            .filter(|block| block.kind == "text")
            .filter_map(|block| block.text)
            .collect::<String>();

        let usage = parsed.usage.map(|usage| TokenUsage {
            prompt_tokens: usage.input_tokens,
            completion_tokens: usage.output_tokens,
            total_tokens: usage.input_tokens + usage.output_tokens,
        });

        Ok(CompletionResponse::from_text(text, usage))
    }

    fn name(&self) -> &'static str {
        "anthropic"
    }
}
