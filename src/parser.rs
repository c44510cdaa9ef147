use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

const FENCE: &str = "```";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("response is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("response JSON is not an object")]
    NotAnObject,

    #[error("response is missing a non-empty 'speech'")]
    MissingSpeech,

    #[error("vote phase response is missing a non-empty 'vote'")]
    MissingVote,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ParsedTurn {
    pub thought: String,
    pub speech: String,
    /// Target agent id; empty outside the vote phase unless the model volunteered one.
    pub vote: String,
}

/// Removes one surrounding markdown code fence, if the text is wrapped in one.
pub fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    if !trimmed.starts_with(FENCE) {
        return raw;
    }

    let body = match trimmed.find('\n') {
        Some(newline) => &trimmed[newline + 1..],
        None => return "",
    };

    let body = body.trim_end();
    match body.rfind('\n') {
        Some(newline) if body[newline + 1..].trim_start().starts_with(FENCE) => &body[..newline],
        None if body.trim_start().starts_with(FENCE) => "",
        _ => body,
    }
}

pub fn parse_agent_output(raw: &str, require_vote: bool) -> Result<ParsedTurn, ParseError> {
    let sanitized = strip_code_fence(raw);
    let value: Value = serde_json::from_str(sanitized.trim())
        .map_err(|error| ParseError::InvalidJson(error.to_string()))?;
    let object = value.as_object().ok_or(ParseError::NotAnObject)?;

    let speech = field_text(object, "speech");
    if speech.is_empty() {
        return Err(ParseError::MissingSpeech);
    }

    let vote = field_text(object, "vote");
    if require_vote && vote.is_empty() {
        return Err(ParseError::MissingVote);
    }

    Ok(ParsedTurn {
        thought: field_text(object, "thought"),
        speech,
        vote,
    })
}

// Non-string scalars keep their JSON text.
fn field_text(object: &Map<String, Value>, key: &str) -> String {
    match object.get(key) {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(text)) => text.trim().to_string(),
        Some(other) => other.to_string().trim().to_string(),
    }
}
