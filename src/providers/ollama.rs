use std::time::Duration;

use async_stream::try_stream;
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};

use crate::{
    config::ProviderSettings,
    error::LLMError,
    providers::{endpoint, LLMProvider},
    types::{CompletionRequest, CompletionResponse, CompletionStream, StreamEvent, TokenUsage},
};

pub const DEFAULT_BASE_URL: &str = "http://localhost:11434";

#[derive(Debug, Clone)]
pub struct OllamaConfig {
    pub base_url: String,
    pub keep_alive: Option<String>,
    pub request_timeout: Duration,
}

impl OllamaConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            keep_alive: None,
            request_timeout: Duration::from_secs(120),
        }
    }

    pub fn with_keep_alive(mut self, keep_alive: impl Into<String>) -> Self {
        self.keep_alive = Some(keep_alive.into());
        self
    }

    pub fn with_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_URL)
    }
}

#[derive(Debug, Clone)]
pub struct Ollama {
    client: Client,
    config: OllamaConfig,
}

impl Ollama {
    pub fn from_settings(settings: &ProviderSettings) -> Result<Self, LLMError> {
        let mut config = OllamaConfig::new(settings.base_url.clone())
            .with_timeout(settings.request_timeout);
        if let Some(keep_alive) = &settings.keep_alive {
            config = config.with_keep_alive(keep_alive.clone());
        }
        Self::from_config(config)
    }

    pub fn from_config(config: OllamaConfig) -> Result<Self, LLMError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self { client, config })
    }
}

#[derive(Debug, Serialize)]
struct OllamaMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Default, Serialize)]
struct OllamaOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
}

#[derive(Debug, Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: Vec<OllamaMessage<'a>>,
    stream: bool,
    options: OllamaOptions,
    #[serde(skip_serializing_if = "Option::is_none")]
    keep_alive: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    message: OllamaResponseMessage,
    #[serde(default)]
    prompt_eval_count: u32,
    #[serde(default)]
    eval_count: u32,
}

#[derive(Debug, Deserialize)]
struct OllamaResponseMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct OllamaErrorBody {
    error: String,
}

/// One line of a streamed `/api/chat` reply.
#[derive(Debug, Default, Deserialize)]
struct OllamaStreamChunk {
    #[serde(default)]
    message: Option<OllamaResponseMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    prompt_eval_count: u32,
    #[serde(default)]
    eval_count: u32,
    #[serde(default)]
    error: Option<String>,
}

fn usage(prompt_eval_count: u32, eval_count: u32) -> TokenUsage {
    TokenUsage {
        prompt_tokens: prompt_eval_count,
        completion_tokens: eval_count,
        total_tokens: prompt_eval_count + eval_count,
    }
}

fn build_body<'a>(
    request: &'a CompletionRequest,
    stream: bool,
    keep_alive: Option<&'a str>,
) -> OllamaChatRequest<'a> {
    OllamaChatRequest {
        model: &request.model,
        messages: request
            .messages
            .iter()
            .map(|message| OllamaMessage {
                role: message.role.as_str(),
                content: message.text().unwrap_or_default(),
            })
            .collect(),
        stream,
        options: OllamaOptions {
            temperature: request.temperature,
            top_p: request.top_p,
            num_predict: request.max_tokens,
        },
        keep_alive,
    }
}

async fn ensure_success(response: Response) -> Result<Response, LLMError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let text = response.text().await?;
    if let Ok(error) = serde_json::from_str::<OllamaErrorBody>(&text) {
        return Err(LLMError::Provider(error.error));
    }
    Err(LLMError::Provider(format!("unexpected status {status}: {text}")))
}

/// Pops one newline-terminated line off the front of `buffer`.
fn take_line(buffer: &mut Vec<u8>) -> Option<Vec<u8>> {
    let pos = buffer.iter().position(|byte| *byte == b'\n')?;
    let line = buffer[..pos].to_vec();
    buffer.drain(..=pos);
    Some(line)
}

fn parse_stream_line(line: &[u8]) -> Result<Option<OllamaStreamChunk>, LLMError> {
    let text = std::str::from_utf8(line)
        .map_err(|_| LLMError::InvalidResponse("stream line contained invalid utf-8"))?;
    let text = text.trim();
    if text.is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(text)?))
}

#[async_trait]
impl LLMProvider for Ollama {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LLMError> {
        let body = build_body(&request, false, self.config.keep_alive.as_deref());

        let response = self
            .client
            .post(endpoint(&self.config.base_url, "api/chat"))
            .json(&body)
            .send()
            .await?;
        let response = ensure_success(response).await?;

        let parsed: OllamaChatResponse = response.json().await?;
        Ok(CompletionResponse::from_text(
            parsed.message.content,
            Some(usage(parsed.prompt_eval_count, parsed.eval_count)),
        ))
    }

    async fn stream_completion(&self, request: CompletionRequest) -> Result<CompletionStream, LLMError> {
        let body = build_body(&request, true, self.config.keep_alive.as_deref());

        let response = self
            .client
            .post(endpoint(&self.config.base_url, "api/chat"))
            .json(&body)
            .send()
            .await?;
        let response = ensure_success(response).await?;

        let stream = try_stream! {
            let mut buffer = Vec::new();
            let mut message = String::new();
            let mut body_stream = response.bytes_stream();
            let mut finished = false;

            while let Some(chunk) = body_stream.next().await {
                let chunk = chunk?;
                buffer.extend_from_slice(&chunk);

                while let Some(line) = take_line(&mut buffer) {
                    let Some(chunk) = parse_stream_line(&line)? else {
                        continue;
                    };

                    if let Some(error) = chunk.error {
                        Err::<(), _>(LLMError::Provider(error))?;
                    }

                    if let Some(delta) = chunk.message.map(|message| message.content) {
                        if !delta.is_empty() {
                            message.push_str(&delta);
                            yield StreamEvent::MessageDelta(delta);
                        }
                    }

                    if chunk.done {
                        let usage = usage(chunk.prompt_eval_count, chunk.eval_count);
                        yield StreamEvent::Completed(CompletionResponse::from_text(message.clone(), Some(usage)));
                        finished = true;
                        break;
                    }
                }

                if finished {
                    break;
                }
            }

            if !finished {
                Err::<(), _>(LLMError::InvalidResponse("stream ended before the final chunk"))?;
            }
        };

        Ok(Box::pin(stream))
    }

    fn name(&self) -> &'static str {
        "ollama"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChatMessage, MessageRole};

    #[test]
    fn request_body_uses_chat_shape() {
        let request = CompletionRequest::new(
            "llama3.1",
            vec![ChatMessage::system("rules"), ChatMessage::user("go")],
        )
        .with_temperature(0.7);

        let value = serde_json::to_value(build_body(&request, false, Some("5m"))).unwrap();
        assert_eq!(value["messages"][0]["role"], MessageRole::System.as_str());
        assert_eq!(value["stream"], false);
        assert_eq!(value["keep_alive"], "5m");
        assert!(value["options"].get("top_p").is_none());

        let value = serde_json::to_value(build_body(&request, true, None)).unwrap();
        assert_eq!(value["stream"], true);
        assert!(value.get("keep_alive").is_none());
    }

    #[test]
    fn stream_lines_are_split_on_newlines() {
        let mut buffer = b"{\"message\":{\"content\":\"Hel\"},\"done\":false}\n{\"message\":{\"content\":\"lo\"}".to_vec();

        let first = take_line(&mut buffer).unwrap();
        let chunk = parse_stream_line(&first).unwrap().unwrap();
        assert_eq!(chunk.message.unwrap().content, "Hel");
        assert!(!chunk.done);

        // The second line is still incomplete.
        assert!(take_line(&mut buffer).is_none());
        buffer.extend_from_slice(b",\"done\":true,\"prompt_eval_count\":4,\"eval_count\":2}\n\n");

        let second = take_line(&mut buffer).unwrap();
        let chunk = parse_stream_line(&second).unwrap().unwrap();
        assert!(chunk.done);
        assert_eq!(usage(chunk.prompt_eval_count, chunk.eval_count).total_tokens, 6);

        let blank = take_line(&mut buffer).unwrap();
        assert!(parse_stream_line(&blank).unwrap().is_none());
        assert!(buffer.is_empty());
    }

    #[test]
    fn stream_error_lines_are_surfaced() {
        let chunk = parse_stream_line(br#"{"error": "model 'nope' not found"}"#).unwrap().unwrap();
        assert_eq!(chunk.error.as_deref(), Some("model 'nope' not found"));
        assert!(parse_stream_line(b"not json").is_err());
    }
}
