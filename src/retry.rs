use std::time::Duration;

use thiserror::Error;
use tokio::time;

use crate::{
    parser::{parse_agent_output, ParseError, ParsedTurn},
    providers::ChatModel,
    types::ChatMessage,
    LLMError,
};

#[derive(Debug, Error)]
pub enum TurnError {
    #[error(transparent)]
    Invocation(#[from] LLMError),

    #[error(transparent)]
    Parse(#[from] ParseError),
}

/// Bounded retry for one agent turn. Backoff is optional and doubles per
/// attempt up to `max_backoff`; the attempt budget is never affected by it.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_backoff: Duration,
    max_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.base_backoff = base;
        self.max_backoff = max.max(base);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before the attempt following `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        if self.base_backoff.is_zero() {
            return Duration::ZERO;
        }
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.base_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}

#[derive(Debug)]
pub enum TurnOutcome {
    Parsed {
        turn: ParsedTurn,
        raw_response: String,
        attempts: u32,
    },
    Exhausted {
        error: TurnError,
        /// Raw text of the last attempt that produced a response, if any did.
        last_raw_response: Option<String>,
        attempts: u32,
    },
}

impl TurnOutcome {
    pub fn attempts(&self) -> u32 {
        match self {
            TurnOutcome::Parsed { attempts, .. } | TurnOutcome::Exhausted { attempts, .. } => *attempts,
        }
    }

    pub fn is_parsed(&self) -> bool {
        matches!(self, TurnOutcome::Parsed { .. })
    }
}

/// Invokes the model and parses its reply, retrying both failure kinds
/// until the policy's attempt budget is spent. Never returns an error:
/// exhaustion is reported as [`TurnOutcome::Exhausted`].
pub async fn attempt_turn(
    model: &ChatModel,
    messages: &[ChatMessage],
    require_vote: bool,
    policy: &RetryPolicy,
) -> TurnOutcome {
    let max_attempts = policy.max_attempts();
    let mut last_raw_response = None;
    let mut last_error = None;

    for attempt in 1..=max_attempts {
        match model.invoke(messages).await {
            Ok(raw) => match parse_agent_output(&raw, require_vote) {
                Ok(turn) => {
                    return TurnOutcome::Parsed {
                        turn,
                        raw_response: raw,
                        attempts: attempt,
                    };
                }
                Err(error) => {
                    tracing::warn!(
                        model = model.alias(),
                        "retryable parse error (attempt {attempt}/{max_attempts}): {error}"
                    );
                    tracing::debug!(model = model.alias(), raw = %raw, "unparsable response");
                    last_raw_response = Some(raw);
                    last_error = Some(TurnError::Parse(error));
                }
            },
            Err(error) => {
                tracing::warn!(
                    model = model.alias(),
                    "retryable invocation error (attempt {attempt}/{max_attempts}): {error}"
                );
                if error.is_dns_failure() {
                    tracing::warn!(
                        "hint: the endpoint for model '{}' could not be resolved; check its base_url in the models file",
                        model.alias()
                    );
                }
                last_error = Some(TurnError::Invocation(error));
            }
        }

        if attempt < max_attempts {
            let delay = policy.backoff(attempt);
            if !delay.is_zero() {
                time::sleep(delay).await;
            }
        }
    }

    TurnOutcome::Exhausted {
        error: last_error
            .unwrap_or_else(|| TurnError::Invocation(LLMError::Provider("no attempts were made".to_string()))),
        last_raw_response,
        attempts: max_attempts,
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io,
        sync::{Arc, Mutex},
    };

    use super::*;
    use crate::providers::scripted::{ScriptedProvider, ScriptedStep};

    const GOOD: &str = r#"{"thought": "t", "speech": "I am the seer.", "vote": "B"}"#;

    fn model(provider: Arc<ScriptedProvider>) -> ChatModel {
        ChatModel::new("test-model", "test", provider)
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            ScriptedStep::Fail("connection reset".to_string()),
            ScriptedStep::Reply("not json".to_string()),
            ScriptedStep::Reply(GOOD.to_string()),
        ]));

        let outcome = attempt_turn(&model(provider.clone()), &[ChatMessage::user("go")], true, &RetryPolicy::new(3)).await;

        match outcome {
            TurnOutcome::Parsed { turn, raw_response, attempts } => {
                assert_eq!(turn.speech, "I am the seer.");
                assert_eq!(raw_response, GOOD);
                assert_eq!(attempts, 3);
            }
            other => panic!("expected success, got {other:?}"),
        }
        assert_eq!(provider.calls(), 3);
    }

    #[tokio::test]
    async fn exhausts_after_max_attempts() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            ScriptedStep::Reply("{}".to_string()),
            ScriptedStep::Fail("timeout".to_string()),
            ScriptedStep::Fail("timeout again".to_string()),
            ScriptedStep::Reply(GOOD.to_string()),
        ]));

        let outcome = attempt_turn(&model(provider.clone()), &[ChatMessage::user("go")], false, &RetryPolicy::new(3)).await;

        match outcome {
            TurnOutcome::Exhausted { error, last_raw_response, attempts } => {
                assert_eq!(attempts, 3);
                assert!(matches!(error, TurnError::Invocation(LLMError::Provider(ref m)) if m == "timeout again"));
                assert_eq!(last_raw_response.as_deref(), Some("{}"));
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
        assert_eq!(provider.calls(), 3);
        assert_eq!(provider.remaining(), 1);
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn unresolvable_host_logs_a_base_url_hint_and_keeps_retrying() {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let provider = Arc::new(ScriptedProvider::new(vec![
            ScriptedStep::Fail("[Errno 11001] getaddrinfo failed".to_string()),
            ScriptedStep::Reply(GOOD.to_string()),
        ]));
        let outcome = attempt_turn(&model(provider.clone()), &[ChatMessage::user("go")], true, &RetryPolicy::new(3)).await;

        assert!(outcome.is_parsed());
        assert_eq!(outcome.attempts(), 2);
        assert_eq!(provider.calls(), 2);

        let output = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
        assert!(output.contains("attempt 1/3"));
        assert!(output.contains("endpoint for model 'test-model' could not be resolved"));
        assert_eq!(output.matches("could not be resolved").count(), 1);
    }

    #[tokio::test]
    async fn missing_vote_is_retried_in_vote_phase() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            r#"{"speech": "I abstain."}"#,
            GOOD,
        ]));
        let outcome = attempt_turn(&model(provider), &[ChatMessage::user("vote")], true, &RetryPolicy::new(2)).await;
        assert!(outcome.is_parsed());
        assert_eq!(outcome.attempts(), 2);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::new(5).with_backoff(Duration::from_millis(100), Duration::from_millis(300));
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(300));
        assert_eq!(RetryPolicy::new(3).backoff(2), Duration::ZERO);
        assert_eq!(RetryPolicy::new(0).max_attempts(), 1);
    }
}
