use std::{
    collections::{BTreeSet, HashMap},
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;

use crate::config::{load_yaml, parse_yaml, ConfigError, ModelRegistry};

pub const DEFAULT_DISCUSSION_ROUNDS: u32 = 2;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_LOG_FILE_BASE: &str = "logfile";
pub const DEFAULT_FAILURE_LOG: &str = "failures.jsonl";

#[derive(Debug, Deserialize)]
struct RawExperimentConfig {
    #[serde(default)]
    agents: serde_yaml::Mapping,
    #[serde(default)]
    player_order: Option<Vec<String>>,
    #[serde(default)]
    discussion_rounds: Option<u32>,
    #[serde(default)]
    max_retries: Option<u32>,
    #[serde(default)]
    retry_backoff_ms: Option<u64>,
    #[serde(default)]
    log_file_base: Option<String>,
    #[serde(default)]
    failure_log: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentBinding {
    pub agent: String,
    pub model_alias: String,
}

/// Typed contents of an experiment's `config.yaml`.
#[derive(Debug, Clone)]
pub struct ExperimentConfig {
    /// Agents in declaration order.
    pub agents: Vec<AgentBinding>,
    pub player_order: Option<Vec<String>>,
    pub discussion_rounds: u32,
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub log_file_base: String,
    pub failure_log: String,
}

impl ExperimentConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw: RawExperimentConfig = load_yaml(path.as_ref())?;
        Self::from_raw(raw)
    }

    pub fn from_yaml_str(input: &str) -> Result<Self, ConfigError> {
        let raw: RawExperimentConfig = parse_yaml(input, Path::new("<inline>"))?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawExperimentConfig) -> Result<Self, ConfigError> {
        if raw.agents.is_empty() {
            return Err(ConfigError::MissingKey("agents".to_string()));
        }

        let mut agents = Vec::with_capacity(raw.agents.len());
        for (key, value) in &raw.agents {
            let agent = key
                .as_str()
                .ok_or_else(|| ConfigError::invalid("agents", "agent ids must be strings"))?;
            let model_alias = value.as_str().ok_or_else(|| {
                ConfigError::invalid(format!("agents.{agent}"), "model alias must be a string")
            })?;
            agents.push(AgentBinding {
                agent: agent.to_string(),
                model_alias: model_alias.to_string(),
            });
        }

        let discussion_rounds = raw.discussion_rounds.unwrap_or(DEFAULT_DISCUSSION_ROUNDS);
        if discussion_rounds == 0 {
            return Err(ConfigError::invalid("discussion_rounds", "must be at least 1"));
        }

        let max_retries = raw.max_retries.unwrap_or(DEFAULT_MAX_RETRIES);
        if max_retries == 0 {
            return Err(ConfigError::invalid("max_retries", "must be at least 1"));
        }

        let log_file_base = raw
            .log_file_base
            .unwrap_or_else(|| DEFAULT_LOG_FILE_BASE.to_string());
        if log_file_base.trim().is_empty() || log_file_base.contains(['/', '\\']) {
            return Err(ConfigError::invalid("log_file_base", "must be a plain file stem"));
        }

        Ok(Self {
            agents,
            player_order: raw.player_order,
            discussion_rounds,
            max_retries,
            retry_backoff: Duration::from_millis(raw.retry_backoff_ms.unwrap_or(0)),
            log_file_base,
            failure_log: raw
                .failure_log
                .unwrap_or_else(|| DEFAULT_FAILURE_LOG.to_string()),
        })
    }

    pub fn model_alias(&self, agent: &str) -> Option<&str> {
        self.agents
            .iter()
            .find(|binding| binding.agent == agent)
            .map(|binding| binding.model_alias.as_str())
    }

    pub fn model_aliases(&self) -> BTreeSet<&str> {
        self.agents
            .iter()
            .map(|binding| binding.model_alias.as_str())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PromptPair {
    pub system_prompt: String,
    pub user_prompt: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AgentPrompts {
    pub discussion: PromptPair,
    pub vote: PromptPair,
}

/// Per-agent prompt templates from `prompts.yaml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PromptBook {
    #[serde(default)]
    pub agents: HashMap<String, AgentPrompts>,
}

impl PromptBook {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        load_yaml(path.as_ref())
    }

    pub fn from_yaml_str(input: &str) -> Result<Self, ConfigError> {
        parse_yaml(input, Path::new("<inline>"))
    }
}

/// Seating order: explicit `player_order` when configured, otherwise the
/// order agents are declared in. Every seat needs a model and prompts.
pub fn resolve_player_order(
    config: &ExperimentConfig,
    prompts: &PromptBook,
) -> Result<Vec<String>, ConfigError> {
    let order: Vec<String> = match &config.player_order {
        Some(order) => order.clone(),
        None => config.agents.iter().map(|binding| binding.agent.clone()).collect(),
    };

    if order.is_empty() {
        return Err(ConfigError::invalid("player_order", "no players configured"));
    }

    let mut seen = BTreeSet::new();
    for agent in &order {
        if !seen.insert(agent.as_str()) {
            return Err(ConfigError::invalid(
                "player_order",
                format!("agent '{agent}' is listed twice"),
            ));
        }
        if config.model_alias(agent).is_none() {
            return Err(ConfigError::MissingKey(format!("agents.{agent}")));
        }
        if !prompts.agents.contains_key(agent) {
            return Err(ConfigError::MissingKey(format!("prompts.agents.{agent}")));
        }
    }

    Ok(order)
}

#[derive(Debug, Clone)]
pub struct Player {
    pub agent: String,
    pub model_alias: String,
    pub prompts: AgentPrompts,
}

/// A validated experiment: settings plus the seated players in order.
#[derive(Debug, Clone)]
pub struct Experiment {
    pub config: ExperimentConfig,
    pub players: Vec<Player>,
}

impl Experiment {
    pub fn new(
        config: ExperimentConfig,
        mut prompts: PromptBook,
        registry: &ModelRegistry,
    ) -> Result<Self, ConfigError> {
        let order = resolve_player_order(&config, &prompts)?;

        let mut players = Vec::with_capacity(order.len());
        for agent in order {
            let model_alias = config
                .model_alias(&agent)
                .map(str::to_string)
                .ok_or_else(|| ConfigError::MissingKey(format!("agents.{agent}")))?;
            registry.get(&model_alias)?;
            let agent_prompts = prompts
                .agents
                .remove(&agent)
                .ok_or_else(|| ConfigError::MissingKey(format!("prompts.agents.{agent}")))?;
            players.push(Player {
                agent,
                model_alias,
                prompts: agent_prompts,
            });
        }

        Ok(Self { config, players })
    }

    pub fn load(paths: &ExperimentPaths, registry: &ModelRegistry) -> Result<Self, ConfigError> {
        let config = ExperimentConfig::load(&paths.config)?;
        let prompts = PromptBook::load(&paths.prompts)?;
        Self::new(config, prompts, registry)
    }

    pub fn player_ids(&self) -> Vec<&str> {
        self.players.iter().map(|player| player.agent.as_str()).collect()
    }
}

/// Where an experiment's files live; defaults follow the directory layout
/// `<dir>/config.yaml`, `<dir>/prompts.yaml`, `<dir>/logs/`.
#[derive(Debug, Clone, PartialEq)]
pub struct ExperimentPaths {
    pub config: PathBuf,
    pub prompts: PathBuf,
    pub logs_dir: PathBuf,
}

impl ExperimentPaths {
    pub fn from_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            config: dir.join("config.yaml"),
            prompts: dir.join("prompts.yaml"),
            logs_dir: dir.join("logs"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
agents:
  C: model-c
  A: model-a
  B: model-b
discussion_rounds: 3
"#;

    fn prompts_for(ids: &[&str]) -> PromptBook {
        let mut agents = HashMap::new();
        for id in ids {
            agents.insert(
                id.to_string(),
                AgentPrompts {
                    discussion: PromptPair {
                        system_prompt: format!("You are {id}."),
                        user_prompt: "{conversation_history}".to_string(),
                    },
                    vote: PromptPair {
                        system_prompt: format!("You are {id}."),
                        user_prompt: "Vote now.".to_string(),
                    },
                },
            );
        }
        PromptBook { agents }
    }

    #[test]
    fn keeps_declaration_order_and_defaults() {
        let config = ExperimentConfig::from_yaml_str(CONFIG).unwrap();
        let ids: Vec<_> = config.agents.iter().map(|b| b.agent.as_str()).collect();
        assert_eq!(ids, vec!["C", "A", "B"]);
        assert_eq!(config.discussion_rounds, 3);
        assert_eq!(config.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(config.log_file_base, "logfile");
        assert_eq!(config.retry_backoff, Duration::ZERO);
    }

    #[test]
    fn explicit_player_order_wins() {
        let mut config = ExperimentConfig::from_yaml_str(CONFIG).unwrap();
        config.player_order = Some(vec!["A".into(), "B".into(), "C".into()]);
        let order = resolve_player_order(&config, &prompts_for(&["A", "B", "C"])).unwrap();
        assert_eq!(order, vec!["A", "B", "C"]);
    }

    #[test]
    fn missing_prompts_for_a_player_is_a_config_error() {
        let config = ExperimentConfig::from_yaml_str(CONFIG).unwrap();
        let error = resolve_player_order(&config, &prompts_for(&["A", "C"])).unwrap_err();
        assert!(matches!(error, ConfigError::MissingKey(key) if key == "prompts.agents.B"));
    }

    #[test]
    fn rejects_zero_rounds_and_missing_agents() {
        let error = ExperimentConfig::from_yaml_str("agents:\n  A: m\ndiscussion_rounds: 0\n").unwrap_err();
        assert!(matches!(error, ConfigError::Invalid { key, .. } if key == "discussion_rounds"));

        let error = ExperimentConfig::from_yaml_str("max_retries: 2\n").unwrap_err();
        assert!(matches!(error, ConfigError::MissingKey(key) if key == "agents"));
    }

    #[test]
    fn experiment_requires_registered_models() {
        let config = ExperimentConfig::from_yaml_str("agents:\n  A: ghost\n").unwrap();
        let registry = ModelRegistry::from_yaml_str("models:\n  real:\n    provider: ollama\n").unwrap();
        let error = Experiment::new(config, prompts_for(&["A"]), &registry).unwrap_err();
        assert!(matches!(error, ConfigError::UnknownModel { name, .. } if name == "ghost"));
    }

    #[test]
    fn builds_players_in_order() {
        let config = ExperimentConfig::from_yaml_str(CONFIG).unwrap();
        let registry = ModelRegistry::from_yaml_str(
            "models:\n  model-a:\n    provider: ollama\n  model-b:\n    provider: ollama\n  model-c:\n    provider: openai\n",
        )
        .unwrap();
        let experiment = Experiment::new(config, prompts_for(&["A", "B", "C"]), &registry).unwrap();
        assert_eq!(experiment.player_ids(), vec!["C", "A", "B"]);
        assert_eq!(experiment.players[0].model_alias, "model-c");
    }
}
