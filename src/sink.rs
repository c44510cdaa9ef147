use std::{
    collections::BTreeMap,
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("no log number left after {base_name}_{highest} in {}", .dir.display())]
    LogNumbersExhausted {
        dir: PathBuf,
        base_name: String,
        highest: u32,
    },

    #[error("run index in {} cannot advance past {last_run}", .path.display())]
    RunIndexExhausted { path: PathBuf, last_run: u64 },
}

impl SinkError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        SinkError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Discussion,
    Vote,
    VoteSummary,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Discussion => "discussion",
            Phase::Vote => "vote",
            Phase::VoteSummary => "vote_summary",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRecord {
    pub timestamp: DateTime<Utc>,
    pub run: u32,
    pub round: u32,
    pub phase: Phase,
    pub turn_index: u32,
    pub agent: String,
    pub model_name: String,
    pub vote: String,
    pub thought: String,
    pub speech: String,
    pub system_prompt: String,
    pub user_prompt: String,
    pub raw_response: String,
    pub visible_history: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnErrorRecord {
    pub timestamp: DateTime<Utc>,
    pub run: u32,
    pub round: u32,
    pub phase: Phase,
    pub turn_index: u32,
    pub agent: String,
    pub model_name: String,
    pub error: String,
    pub raw_response: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CastVote {
    pub agent: String,
    pub vote: String,
}

pub type Tally = BTreeMap<String, usize>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteSummaryRecord {
    pub timestamp: DateTime<Utc>,
    pub run: u32,
    pub round: u32,
    pub phase: Phase,
    pub votes: Vec<CastVote>,
    pub tally: Tally,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    pub timestamp: DateTime<Utc>,
    pub run: u32,
    pub round: u32,
    pub phase: Phase,
    pub agent: String,
    pub model_name: String,
    pub system_prompt: String,
    pub user_prompt: String,
    pub raw_response: Option<String>,
    pub error: String,
    pub log_file: String,
}

/// Opens, appends one line and closes on every write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonlWriter {
    path: PathBuf,
}

impl JsonlWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn append<T: Serialize>(&self, record: &T) -> Result<(), SinkError> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|error| SinkError::io(parent, error))?;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|error| SinkError::io(&self.path, error))?;
        file.write_all(line.as_bytes())
            .map_err(|error| SinkError::io(&self.path, error))?;
        Ok(())
    }
}

pub fn append_failure_log(
    dir: impl AsRef<Path>,
    file_name: &str,
    record: &FailureRecord,
) -> Result<PathBuf, SinkError> {
    let path = dir.as_ref().join(file_name);
    JsonlWriter::new(&path).append(record)?;
    Ok(path)
}

/// Returns `dir/{base}_{NNN}.jsonl` with a suffix one past the highest
/// existing one, starting at 001. Creates `dir` when needed.
pub fn next_sequential_log_path(dir: impl AsRef<Path>, base_name: &str) -> Result<PathBuf, SinkError> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir).map_err(|error| SinkError::io(dir, error))?;

    let prefix = format!("{base_name}_");
    let mut highest = 0u32;
    for entry in fs::read_dir(dir).map_err(|error| SinkError::io(dir, error))? {
        let entry = entry.map_err(|error| SinkError::io(dir, error))?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        let Some(digits) = name
            .strip_prefix(&prefix)
            .and_then(|rest| rest.strip_suffix(".jsonl"))
        else {
            continue;
        };
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            continue;
        }
        if let Ok(value) = digits.parse::<u32>() {
            highest = highest.max(value);
        }
    }

    let exhausted = || SinkError::LogNumbersExhausted {
        dir: dir.to_path_buf(),
        base_name: base_name.to_string(),
        highest,
    };
    let mut next = highest.checked_add(1).ok_or_else(exhausted)?;
    loop {
        let candidate = dir.join(format!("{base_name}_{next:03}.jsonl"));
        if !candidate.exists() {
            return Ok(candidate);
        }
        next = next.checked_add(1).ok_or_else(exhausted)?;
    }
}

/// Next 1-based run index for a log: the last non-empty line's `run` plus
/// one, or 1 when the file is missing, empty or its last line is unreadable.
pub fn next_run_index(log_path: impl AsRef<Path>) -> Result<u32, SinkError> {
    let path = log_path.as_ref();
    let Ok(content) = fs::read_to_string(path) else {
        return Ok(1);
    };

    let Some(last) = content.lines().map(str::trim).filter(|line| !line.is_empty()).last() else {
        return Ok(1);
    };

    let last_run = match serde_json::from_str::<Value>(last) {
        Ok(record) => match record.get("run") {
            None => 0,
            Some(value) => match run_number(value) {
                Some(run) => run,
                None => return Ok(1),
            },
        },
        Err(_) => return Ok(1),
    };

    last_run
        .checked_add(1)
        .and_then(|next| u32::try_from(next).ok())
        .ok_or_else(|| SinkError::RunIndexExhausted {
            path: path.to_path_buf(),
            last_run,
        })
}

// Logs written by other tooling may carry the run as a float or a string.
fn run_number(value: &Value) -> Option<u64> {
    match value {
        Value::Number(number) => number.as_u64().or_else(|| {
            number
                .as_f64()
                .filter(|run| run.is_finite() && *run >= 0.0)
                .map(|run| run.trunc() as u64)
        }),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

/// Ties are left visible in the mapping.
pub fn tally_votes(votes: &[CastVote]) -> Tally {
    let mut tally = Tally::new();
    for cast in votes {
        *tally.entry(cast.vote.clone()).or_insert(0) += 1;
    }
    tally
}
