use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    config::{parse_yaml, read_text, ConfigError},
    providers::ChatModel,
    sink::{JsonlWriter, SinkError},
    types::ChatMessage,
    LLMError,
};

pub const DEFAULT_SPEAKER: &str = "User";

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("turn {turn} failed: {source}")]
    Invocation {
        turn: u32,
        #[source]
        source: LLMError,
    },

    #[error(transparent)]
    Sink(#[from] SinkError),
}

#[derive(Debug, Default, Deserialize)]
struct RawScript {
    #[serde(default)]
    model_name: Option<String>,
    #[serde(default)]
    system_prompt: Option<String>,
    #[serde(default)]
    system_prompt_file: Option<String>,
    #[serde(default)]
    turns: Option<Vec<RawTurn>>,
    #[serde(default)]
    prompts_file: Option<String>,
    #[serde(default)]
    speaker: Option<String>,
    #[serde(default)]
    log_filename: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawTurn {
    #[serde(default)]
    speaker: Option<String>,
    #[serde(default)]
    prompt: Option<String>,
    #[serde(default)]
    prompt_file: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawPromptsFile {
    #[serde(default)]
    system_prompt: Option<String>,
    #[serde(default)]
    user_prompt: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptTurn {
    pub speaker: String,
    pub prompt: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptScript {
    pub model_name: String,
    pub system_prompt: String,
    pub turns: Vec<ScriptTurn>,
    pub log_filename: Option<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|text| !text.trim().is_empty())
}

/// Inline text wins over `<key>_file`; files resolve against `base_dir`.
fn inline_or_file(
    inline: Option<String>,
    file: Option<String>,
    base_dir: &Path,
) -> Result<Option<String>, ConfigError> {
    if let Some(text) = non_empty(inline) {
        return Ok(Some(text));
    }
    match file {
        Some(file) => Ok(non_empty(Some(read_text(&base_dir.join(file))?))),
        None => Ok(None),
    }
}

impl PromptScript {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = read_text(path)?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        let raw: RawScript = parse_yaml(&content, path)?;
        Self::from_raw(raw, base_dir)
    }

    pub fn from_yaml_str(input: &str, base_dir: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw: RawScript = parse_yaml(input, Path::new("<inline>"))?;
        Self::from_raw(raw, base_dir.as_ref())
    }

    fn from_raw(raw: RawScript, base_dir: &Path) -> Result<Self, ConfigError> {
        let model_name =
            non_empty(raw.model_name).ok_or_else(|| ConfigError::MissingKey("model_name".to_string()))?;
        let log_filename = non_empty(raw.log_filename);

        if let Some(prompts_file) = raw.prompts_file {
            if non_empty(raw.system_prompt).is_some() || raw.system_prompt_file.is_some() {
                return Err(ConfigError::Conflict {
                    first: "prompts_file",
                    second: "system_prompt",
                });
            }
            if raw.turns.as_ref().is_some_and(|turns| !turns.is_empty()) {
                return Err(ConfigError::Conflict {
                    first: "prompts_file",
                    second: "turns",
                });
            }

            let path = base_dir.join(prompts_file);
            let prompts: RawPromptsFile = parse_yaml(&read_text(&path)?, &path)?;
            let system_prompt = non_empty(prompts.system_prompt)
                .ok_or_else(|| ConfigError::MissingKey("prompts_file.system_prompt".to_string()))?;
            let user_prompt = non_empty(prompts.user_prompt)
                .ok_or_else(|| ConfigError::MissingKey("prompts_file.user_prompt".to_string()))?;

            return Ok(Self {
                model_name,
                system_prompt,
                turns: vec![ScriptTurn {
                    speaker: raw.speaker.unwrap_or_else(|| DEFAULT_SPEAKER.to_string()),
                    prompt: user_prompt,
                }],
                log_filename,
            });
        }

        let system_prompt = inline_or_file(raw.system_prompt, raw.system_prompt_file, base_dir)?
            .ok_or_else(|| ConfigError::MissingKey("system_prompt".to_string()))?;

        let raw_turns = raw.turns.unwrap_or_default();
        if raw_turns.is_empty() {
            return Err(ConfigError::MissingKey("turns".to_string()));
        }

        let mut turns = Vec::with_capacity(raw_turns.len());
        for (index, turn) in raw_turns.into_iter().enumerate() {
            let prompt = inline_or_file(turn.prompt, turn.prompt_file, base_dir)?
                .ok_or_else(|| ConfigError::MissingKey(format!("turns[{}].prompt", index + 1)))?;
            turns.push(ScriptTurn {
                speaker: turn.speaker.unwrap_or_else(|| DEFAULT_SPEAKER.to_string()),
                prompt,
            });
        }

        Ok(Self {
            model_name,
            system_prompt,
            turns,
            log_filename,
        })
    }

    /// `log_filename` when configured, else a UTC-stamped name.
    pub fn log_path(&self, logs_dir: impl AsRef<Path>, now: DateTime<Utc>) -> PathBuf {
        let name = self
            .log_filename
            .clone()
            .unwrap_or_else(|| format!("experiment_{}.jsonl", now.format("%Y%m%dT%H%M%S")));
        logs_dir.as_ref().join(name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptRecord {
    pub timestamp: DateTime<Utc>,
    pub turn_index: u32,
    pub speaker: String,
    pub prompt: String,
    pub response: String,
    pub model_name: String,
    pub log_file: String,
}

#[derive(Debug, Clone)]
pub struct ScriptReport {
    pub log_file: PathBuf,
    pub records: Vec<ScriptRecord>,
}

/// The first failed call stops the script.
pub async fn run_script(
    script: &PromptScript,
    model: &ChatModel,
    logs_dir: impl AsRef<Path>,
    mut on_turn: impl FnMut(&ScriptRecord),
) -> Result<ScriptReport, ScriptError> {
    let writer = JsonlWriter::new(script.log_path(logs_dir, Utc::now()));
    let mut messages = vec![ChatMessage::system(script.system_prompt.clone())];
    let mut records = Vec::with_capacity(script.turns.len());

    for (turn_index, turn) in (1u32..).zip(&script.turns) {
        messages.push(ChatMessage::user(turn.prompt.clone()));
        let response = model
            .invoke(&messages)
            .await
            .map_err(|source| ScriptError::Invocation {
                turn: turn_index,
                source,
            })?;
        messages.push(ChatMessage::assistant(response.clone()));

        let record = ScriptRecord {
            timestamp: Utc::now(),
            turn_index,
            speaker: turn.speaker.clone(),
            prompt: turn.prompt.clone(),
            response,
            model_name: script.model_name.clone(),
            log_file: writer.file_name(),
        };
        writer.append(&record)?;
        tracing::debug!(turn = turn_index, speaker = %record.speaker, "script turn recorded");
        on_turn(&record);
        records.push(record);
    }

    Ok(ScriptReport {
        log_file: writer.path().to_path_buf(),
        records,
    })
}

#[cfg(test)]
mod tests {
    use std::{fs, sync::Arc};

    use chrono::TimeZone;
    use tempfile::TempDir;

    use super::*;
    use crate::{
        providers::scripted::{ScriptedProvider, ScriptedStep},
        types::MessageRole,
    };

    #[test]
    fn prompts_file_conflicts_are_rejected() {
        let dir = TempDir::new().unwrap();
        let with_system = "model_name: m\nprompts_file: p.yaml\nsystem_prompt: hi\n";
        assert!(matches!(
            PromptScript::from_yaml_str(with_system, dir.path()),
            Err(ConfigError::Conflict { second: "system_prompt", .. })
        ));

        let with_turns = "model_name: m\nprompts_file: p.yaml\nturns:\n  - prompt: hi\n";
        assert!(matches!(
            PromptScript::from_yaml_str(with_turns, dir.path()),
            Err(ConfigError::Conflict { second: "turns", .. })
        ));
    }

    #[test]
    fn missing_pieces_are_reported() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            PromptScript::from_yaml_str("system_prompt: s\n", dir.path()),
            Err(ConfigError::MissingKey(key)) if key == "model_name"
        ));
        assert!(matches!(
            PromptScript::from_yaml_str("model_name: m\nsystem_prompt: s\n", dir.path()),
            Err(ConfigError::MissingKey(key)) if key == "turns"
        ));
        assert!(matches!(
            PromptScript::from_yaml_str("model_name: m\nsystem_prompt: s\nturns:\n  - speaker: GM\n", dir.path()),
            Err(ConfigError::MissingKey(key)) if key == "turns[1].prompt"
        ));
        assert!(matches!(
            PromptScript::from_yaml_str("model_name: m\nprompts_file: absent.yaml\n", dir.path()),
            Err(ConfigError::MissingFile(_))
        ));
    }

    #[test]
    fn prompt_files_resolve_next_to_the_config() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("system.txt"), "You are the game master.").unwrap();
        fs::write(dir.path().join("opening.txt"), "Open the night.").unwrap();
        fs::write(
            dir.path().join("script.yaml"),
            "model_name: m\nsystem_prompt_file: system.txt\nturns:\n  - speaker: GM\n    prompt_file: opening.txt\n  - prompt: And now?\n",
        )
        .unwrap();

        let script = PromptScript::load(dir.path().join("script.yaml")).unwrap();
        assert_eq!(script.system_prompt, "You are the game master.");
        assert_eq!(script.turns[0], ScriptTurn { speaker: "GM".into(), prompt: "Open the night.".into() });
        assert_eq!(script.turns[1].speaker, DEFAULT_SPEAKER);

        let stamp = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap();
        assert_eq!(
            script.log_path("logs", stamp),
            PathBuf::from("logs").join("experiment_20240501T123000.jsonl")
        );
    }

    #[tokio::test]
    async fn turns_build_a_growing_conversation() {
        let dir = TempDir::new().unwrap();
        let script = PromptScript::from_yaml_str(
            "model_name: m\nsystem_prompt: sys\nlog_filename: chat.jsonl\nturns:\n  - prompt: one\n  - speaker: B\n    prompt: two\n",
            dir.path(),
        )
        .unwrap();
        let provider = Arc::new(ScriptedProvider::new(vec!["first", "second"]));
        let model = ChatModel::new("m", "scripted", provider.clone());

        let mut seen = Vec::new();
        let report = run_script(&script, &model, dir.path(), |record| seen.push(record.turn_index))
            .await
            .unwrap();

        assert_eq!(seen, vec![1, 2]);
        assert_eq!(report.log_file, dir.path().join("chat.jsonl"));
        assert_eq!(report.records[1].speaker, "B");
        assert_eq!(report.records[1].log_file, "chat.jsonl");

        let second = &provider.requests()[1];
        let roles: Vec<_> = second.messages.iter().map(|message| message.role.clone()).collect();
        assert_eq!(
            roles,
            vec![MessageRole::System, MessageRole::User, MessageRole::Assistant, MessageRole::User]
        );
        assert_eq!(second.messages[2].text(), Some("first"));

        let lines = fs::read_to_string(&report.log_file).unwrap();
        assert_eq!(lines.lines().count(), 2);
    }

    #[tokio::test]
    async fn failed_call_stops_the_script() {
        let dir = TempDir::new().unwrap();
        let script = PromptScript::from_yaml_str(
            "model_name: m\nsystem_prompt: sys\nlog_filename: chat.jsonl\nturns:\n  - prompt: one\n  - prompt: two\n",
            dir.path(),
        )
        .unwrap();
        let provider = Arc::new(ScriptedProvider::new(vec![
            ScriptedStep::Reply("ok".to_string()),
            ScriptedStep::Fail("boom".to_string()),
        ]));
        let model = ChatModel::new("m", "scripted", provider);

        let error = run_script(&script, &model, dir.path(), |_| {}).await.unwrap_err();
        assert!(matches!(error, ScriptError::Invocation { turn: 2, .. }));
        let lines = fs::read_to_string(dir.path().join("chat.jsonl")).unwrap();
        assert_eq!(lines.lines().count(), 1);
    }
}
