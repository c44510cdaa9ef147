use std::{collections::VecDeque, sync::Mutex};

use async_trait::async_trait;
use futures_util::stream;

use crate::{
    providers::LLMProvider,
    types::{CompletionRequest, CompletionResponse, CompletionStream, StreamEvent},
    LLMError,
};

/// One canned outcome for a scripted call.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptedStep {
    Reply(String),
    Fail(String),
}

impl From<&str> for ScriptedStep {
    fn from(value: &str) -> Self {
        ScriptedStep::Reply(value.to_string())
    }
}

impl From<String> for ScriptedStep {
    fn from(value: String) -> Self {
        ScriptedStep::Reply(value)
    }
}

/// Replays canned replies in order and records every request it receives.
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    steps: Mutex<VecDeque<ScriptedStep>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedProvider {
    pub fn new<I, S>(steps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ScriptedStep>,
    {
        Self {
            steps: Mutex::new(steps.into_iter().map(Into::into).collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, step: impl Into<ScriptedStep>) {
        self.steps
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push_back(step.into());
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn calls(&self) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn remaining(&self) -> usize {
        self.steps
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

impl ScriptedProvider {
    fn next_reply(&self, request: CompletionRequest) -> Result<String, LLMError> {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(request);

        let step = self
            .steps
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front();

        match step {
            Some(ScriptedStep::Reply(text)) => Ok(text),
            Some(ScriptedStep::Fail(message)) => Err(LLMError::Provider(message)),
            None => Err(LLMError::Provider("no more scripted responses".to_string())),
        }
    }
}

#[async_trait]
impl LLMProvider for ScriptedProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LLMError> {
        let text = self.next_reply(request)?;
        Ok(CompletionResponse::from_text(text, None))
    }

    /// Streams the scripted reply one word at a time.
    async fn stream_completion(&self, request: CompletionRequest) -> Result<CompletionStream, LLMError> {
        let text = self.next_reply(request)?;
        let mut events: Vec<Result<StreamEvent, LLMError>> = text
            .split_inclusive(' ')
            .map(|word| Ok(StreamEvent::MessageDelta(word.to_string())))
            .collect();
        events.push(Ok(StreamEvent::Completed(CompletionResponse::from_text(text, None))));
        Ok(Box::pin(stream::iter(events)))
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}
