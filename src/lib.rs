pub mod config;
pub mod error;
pub mod game;
pub mod health;
pub mod history;
pub mod orchestrator;
pub mod parser;
pub mod providers;
pub mod retry;
pub mod script;
pub mod sink;
pub mod types;

pub use error::LLMError;
pub use providers::{ChatModel, LLMProvider, ModelFactory, ProviderKind};
pub use types::{
    ChatMessage, CompletionRequest, CompletionResponse, CompletionStream, MessageRole, StreamEvent,
    TokenUsage,
};
pub use config::{ConfigError, Experiment, ExperimentConfig, ModelRegistry, PromptBook};
pub use parser::{parse_agent_output, ParseError, ParsedTurn};
pub use history::{build_user_prompt, Transcript};
pub use retry::{attempt_turn, RetryPolicy, TurnError, TurnOutcome};
pub use sink::{
    next_run_index,
    next_sequential_log_path,
    tally_votes,
    JsonlWriter,
    Phase,
    SinkError,
};
pub use game::{
    MatchEvent,
    MatchFailure,
    MatchOutcome,
    MatchRunner,
    MatchSettings,
    Seat,
};
pub use orchestrator::{
    BatchOrchestrator,
    BatchReport,
    EndpointFailure,
    LogTarget,
    OrchestratorError,
};
pub use health::{EndpointProbe, EndpointStatus, OllamaProbe};
