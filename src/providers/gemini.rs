use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::{
    config::ProviderSettings,
    error::LLMError,
    providers::{endpoint, LLMProvider},
    types::{CompletionRequest, CompletionResponse, MessageRole, TokenUsage},
};

#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub base_url: String,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct Gemini {
    client: Client,
    config: GeminiConfig,
}

impl Gemini {
    pub fn from_settings(settings: &ProviderSettings) -> Result<Self, LLMError> {
        let api_key = settings
            .api_key
            .clone()
            .ok_or(LLMError::MissingApiKey("GEMINI_API_KEY"))?;

        Self::from_config(GeminiConfig {
            api_key,
            base_url: settings.base_url.clone(),
            request_timeout: settings.request_timeout,
        })
    }

    pub fn from_config(config: GeminiConfig) -> Result<Self, LLMError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self { client, config })
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest<'a> {
    contents: Vec<Content<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content<'a>>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
    parts: Vec<Part<'a>>,
}

#[derive(Debug, Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
    #[serde(default)]
    total_token_count: u32,
}

#[derive(Debug, Deserialize)]
struct GeminiErrorEnvelope {
    error: GeminiError,
}

#[derive(Debug, Deserialize)]
struct GeminiError {
    message: String,
}

fn build_body(request: &CompletionRequest) -> GenerateContentRequest<'_> {
    let (_, conversation) = request.split_system();
    let system_instruction = request
        .messages
        .iter()
        .filter(|message| message.role == MessageRole::System)
        .filter_map(|message| message.text())
        .map(|text| Part { text })
        .collect::<Vec<_>>();

    GenerateContentRequest {
        contents: conversation
            .into_iter()
            .map(|message| Content {
                role: Some(match message.role {
                    MessageRole::Assistant => "model",
                    _ => "user",
                }),
                parts: vec![Part {
                    text: message.text().unwrap_or_default(),
                }],
            })
            .collect(),
        system_instruction: if system_instruction.is_empty() {
            None
        } else {
            Some(Content {
                role: None,
                parts: system_instruction,
            })
        },
        generation_config: GenerationConfig {
            temperature: request.temperature,
            top_p: request.top_p,
            max_output_tokens: request.max_tokens,
        },
    }
}

#[async_trait]
impl LLMProvider for Gemini {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LLMError> {
        let body = build_body(&request);
        let path = format!("v1beta/models/{}:generateContent", request.model);

        let response = self
            .client
            .post(endpoint(&self.config.base_url, &path))
            .header("x-goog-api-key", &self.config.api_key)
            .json(&body)
            .send()
            .await?;
        let status = response.status();

        if !status.is_success() {
            let text = response.text().await?;
            if let Ok(error) = serde_json::from_str::<GeminiErrorEnvelope>(&text) {
                return Err(LLMError::Provider(error.error.message));
            }

            return Err(LLMError::Provider(format!("unexpected status {status}: {text}")));
        }

        let parsed: GenerateContentResponse = response.json().await?;
        let candidate = parsed
            .candidates
            .into_iter()
            .next()
            .ok_or(LLMError::InvalidResponse("response did not contain any candidates"))?;

        let text = candidate
            .content
            .map(|content| {
                content
                    .parts
                    .into_iter()
                    .filter_map(|part| part.text)
                    .collect::<String>()
            })
            .unwrap_or_default();

        let usage = parsed.usage_metadata.map(|usage| TokenUsage {
            prompt_tokens: usage.prompt_token_count,
            completion_tokens: usage.candidates_token_count,
            total_tokens: usage.total_token_count,
        });

        Ok(CompletionResponse::from_text(text, usage))
    }

    fn name(&self) -> &'static str {
        "gemini"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChatMessage;

    #[test]
    fn system_prompt_moves_to_system_instruction() {
        let request = CompletionRequest::new(
            "gemini-1.5-pro",
            vec![
                ChatMessage::system("You are player A."),
                ChatMessage::user("Speak."),
                ChatMessage::assistant("I am a villager."),
            ],
        )
        .with_temperature(0.3);

        let value = serde_json::to_value(build_body(&request)).unwrap();
        assert_eq!(value["systemInstruction"]["parts"][0]["text"], "You are player A.");
        assert_eq!(value["contents"].as_array().unwrap().len(), 2);
        assert_eq!(value["contents"][1]["role"], "model");
        assert!((value["generationConfig"]["temperature"].as_f64().unwrap() - 0.3).abs() < 1e-6);
    }
}
