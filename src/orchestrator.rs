use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use thiserror::Error;

use crate::{
    config::{ConfigError, Experiment, ModelRegistry, ProviderSettings},
    game::{MatchEvent, MatchOutcome, MatchRunner, MatchSettings, Seat},
    health::{EndpointProbe, OllamaProbe},
    providers::{HttpModelFactory, ModelFactory},
    retry::RetryPolicy,
    sink::{next_run_index, next_sequential_log_path, JsonlWriter, SinkError},
    LLMError,
};

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_BACKOFF_FACTOR: u32 = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointFailure {
    pub agent: String,
    pub model_alias: String,
    pub base_url: String,
    pub detail: String,
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("{} endpoint(s) unreachable: {}", .0.len(), describe_failures(.0))]
    Unreachable(Vec<EndpointFailure>),

    #[error(transparent)]
    Sink(#[from] SinkError),

    #[error("failed to create model '{model_alias}' for agent {agent}: {source}")]
    Provider {
        agent: String,
        model_alias: String,
        #[source]
        source: LLMError,
    },

    #[error("{matches} match(es) starting at run {first_run} would overflow run numbering in {}", .log_file.display())]
    RunsExhausted {
        log_file: PathBuf,
        first_run: u32,
        matches: u32,
    },

    #[error("failed to build endpoint probe: {0}")]
    Probe(#[from] reqwest::Error),
}

fn describe_failures(failures: &[EndpointFailure]) -> String {
    failures
        .iter()
        .map(|failure| {
            format!(
                "{} ({}) at {}: {}",
                failure.agent, failure.model_alias, failure.base_url, failure.detail
            )
        })
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogTarget {
    Next,
    /// Continue an existing log, numbering runs after its last record.
    Existing(PathBuf),
}

#[derive(Debug, Clone)]
pub struct BatchReport {
    pub log_file: PathBuf,
    pub outcomes: Vec<MatchOutcome>,
}

impl BatchReport {
    pub fn completed(&self) -> usize {
        self.outcomes.iter().filter(|outcome| outcome.success()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.completed()
    }
}

pub struct BatchOrchestrator {
    experiment: Experiment,
    settings: BTreeMap<String, ProviderSettings>,
    logs_dir: PathBuf,
    log_target: LogTarget,
    probe: Arc<dyn EndpointProbe>,
    factory: Arc<dyn ModelFactory>,
    event_callback: Option<Arc<dyn Fn(&MatchEvent) + Send + Sync>>,
}

impl BatchOrchestrator {
    pub fn new(
        experiment: Experiment,
        settings: BTreeMap<String, ProviderSettings>,
        logs_dir: impl Into<PathBuf>,
        probe: Arc<dyn EndpointProbe>,
        factory: Arc<dyn ModelFactory>,
    ) -> Self {
        Self {
            experiment,
            settings,
            logs_dir: logs_dir.into(),
            log_target: LogTarget::Next,
            probe,
            factory,
            event_callback: None,
        }
    }

    pub fn with_http(
        experiment: Experiment,
        registry: &ModelRegistry,
        logs_dir: impl Into<PathBuf>,
    ) -> Result<Self, OrchestratorError> {
        let mut settings = BTreeMap::new();
        for player in &experiment.players {
            if !settings.contains_key(&player.model_alias) {
                settings.insert(player.model_alias.clone(), registry.resolve(&player.model_alias)?);
            }
        }

        Ok(Self::new(
            experiment,
            settings,
            logs_dir,
            Arc::new(OllamaProbe::new(PROBE_TIMEOUT)?),
            Arc::new(HttpModelFactory),
        ))
    }

    pub fn with_log_target(mut self, target: LogTarget) -> Self {
        self.log_target = target;
        self
    }

    pub fn with_event_callback(mut self, callback: impl Fn(&MatchEvent) + Send + Sync + 'static) -> Self {
        self.event_callback = Some(Arc::new(callback));
        self
    }

    pub fn experiment(&self) -> &Experiment {
        &self.experiment
    }

    pub fn logs_dir(&self) -> &Path {
        &self.logs_dir
    }

    fn settings_for(&self, model_alias: &str) -> Result<&ProviderSettings, OrchestratorError> {
        self.settings.get(model_alias).ok_or_else(|| {
            OrchestratorError::Config(ConfigError::UnknownModel {
                name: model_alias.to_string(),
                available: self.settings.keys().cloned().collect::<Vec<_>>().join(", "),
            })
        })
    }

    /// Checks every agent whose provider needs a reachable endpoint and
    /// reports all failures at once. Each distinct URL is probed only once.
    pub async fn preflight(&self) -> Result<(), OrchestratorError> {
        let mut statuses = HashMap::new();
        let mut failures = Vec::new();

        for player in &self.experiment.players {
            let settings = self.settings_for(&player.model_alias)?;
            if !settings.kind.requires_reachable_endpoint() {
                continue;
            }

            if !statuses.contains_key(&settings.base_url) {
                let status = self.probe.check(&settings.base_url).await;
                tracing::debug!(url = %settings.base_url, ok = status.ok, detail = %status.detail, "endpoint probe");
                statuses.insert(settings.base_url.clone(), status);
            }

            if let Some(status) = statuses.get(&settings.base_url).filter(|status| !status.ok) {
                tracing::error!(
                    agent = %player.agent,
                    model = %player.model_alias,
                    url = %settings.base_url,
                    "endpoint unreachable: {}",
                    status.detail
                );
                failures.push(EndpointFailure {
                    agent: player.agent.clone(),
                    model_alias: player.model_alias.clone(),
                    base_url: settings.base_url.clone(),
                    detail: status.detail.clone(),
                });
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(OrchestratorError::Unreachable(failures))
        }
    }

    fn seat_players(&self) -> Result<Vec<Seat>, OrchestratorError> {
        self.experiment
            .players
            .iter()
            .map(|player| {
                let settings = self.settings_for(&player.model_alias)?;
                let model = self
                    .factory
                    .create(&player.model_alias, settings)
                    .map_err(|source| OrchestratorError::Provider {
                        agent: player.agent.clone(),
                        model_alias: player.model_alias.clone(),
                        source,
                    })?;
                Ok(Seat {
                    agent: player.agent.clone(),
                    model,
                    prompts: player.prompts.clone(),
                })
            })
            .collect()
    }

    fn match_settings(&self) -> MatchSettings {
        let config = &self.experiment.config;
        MatchSettings {
            discussion_rounds: config.discussion_rounds,
            retry: RetryPolicy::new(config.max_retries).with_backoff(
                config.retry_backoff,
                config.retry_backoff.saturating_mul(MAX_BACKOFF_FACTOR),
            ),
            failure_log_dir: self.logs_dir.clone(),
            failure_log_name: config.failure_log.clone(),
        }
    }

    fn log_path(&self) -> Result<PathBuf, OrchestratorError> {
        match &self.log_target {
            LogTarget::Next => Ok(next_sequential_log_path(
                &self.logs_dir,
                &self.experiment.config.log_file_base,
            )?),
            LogTarget::Existing(path) => Ok(path.clone()),
        }
    }

    /// A failed match is reported in the outcome list and the batch moves on.
    pub async fn run(&self, total_matches: u32) -> Result<BatchReport, OrchestratorError> {
        self.preflight().await?;

        let log_path = self.log_path()?;
        let first_run = next_run_index(&log_path)?;
        let last_run = first_run
            .checked_add(total_matches.saturating_sub(1))
            .ok_or_else(|| OrchestratorError::RunsExhausted {
                log_file: log_path.clone(),
                first_run,
                matches: total_matches,
            })?;
        let writer = JsonlWriter::new(&log_path);
        let settings = self.match_settings();

        tracing::info!(
            matches = total_matches,
            first_run,
            log = %log_path.display(),
            "starting batch"
        );

        let mut outcomes = Vec::with_capacity(total_matches as usize);
        for run_index in (first_run..=last_run).take(total_matches as usize) {
            let seats = self.seat_players()?;
            let runner = MatchRunner::new(seats, settings.clone(), writer.clone())
                .with_shared_callback(self.event_callback.clone());

            let outcome = runner.run(run_index).await?;
            if let Some(failure) = &outcome.failure {
                tracing::error!(
                    run = run_index,
                    agent = %failure.agent,
                    phase = failure.phase.as_str(),
                    "match aborted; continuing with the next match"
                );
            }
            outcomes.push(outcome);
        }

        Ok(BatchReport {
            log_file: log_path,
            outcomes,
        })
    }
}
