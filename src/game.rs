use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::Utc;

use crate::{
    config::{AgentPrompts, PromptPair},
    history::{build_user_prompt, Transcript},
    providers::ChatModel,
    retry::{attempt_turn, RetryPolicy, TurnError, TurnOutcome},
    sink::{
        append_failure_log, tally_votes, CastVote, FailureRecord, JsonlWriter, Phase, SinkError,
        Tally, TurnErrorRecord, TurnRecord, VoteSummaryRecord,
    },
    types::ChatMessage,
};

#[derive(Clone)]
pub struct Seat {
    pub agent: String,
    pub model: ChatModel,
    pub prompts: AgentPrompts,
}

impl fmt::Debug for Seat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Seat")
            .field("agent", &self.agent)
            .field("model", &self.model.alias())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct MatchSettings {
    pub discussion_rounds: u32,
    pub retry: RetryPolicy,
    pub failure_log_dir: PathBuf,
    pub failure_log_name: String,
}

#[derive(Debug, Clone)]
pub enum MatchEvent {
    Started { run: u32, log_file: PathBuf },
    Speech { run: u32, round: u32, agent: String, speech: String },
    Vote { run: u32, agent: String, speech: String, vote: String },
    Aborted { run: u32, round: u32, phase: Phase, agent: String, error: String },
    Summary { run: u32, tally: Tally },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchFailure {
    pub phase: Phase,
    pub round: u32,
    pub agent: String,
    pub error: String,
}

#[derive(Debug, Clone)]
pub struct MatchOutcome {
    pub run_index: u32,
    pub log_file: PathBuf,
    pub turns: u32,
    pub votes: Vec<CastVote>,
    /// Present only when every vote was cast.
    pub tally: Option<Tally>,
    pub failure: Option<MatchFailure>,
}

impl MatchOutcome {
    pub fn success(&self) -> bool {
        self.failure.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PhaseStep {
    phase: Phase,
    round: u32,
}

impl PhaseStep {
    fn require_vote(&self) -> bool {
        self.phase == Phase::Vote
    }

    fn prompts<'a>(&self, prompts: &'a AgentPrompts) -> &'a PromptPair {
        match self.phase {
            Phase::Vote => &prompts.vote,
            _ => &prompts.discussion,
        }
    }
}

struct MatchState {
    run: u32,
    turn_index: u32,
    transcript: Transcript,
    votes: Vec<CastVote>,
    failure: Option<MatchFailure>,
}

pub struct MatchRunner {
    seats: Vec<Seat>,
    settings: MatchSettings,
    log: JsonlWriter,
    event_callback: Option<Arc<dyn Fn(&MatchEvent) + Send + Sync>>,
}

impl MatchRunner {
    pub fn new(seats: Vec<Seat>, settings: MatchSettings, log: JsonlWriter) -> Self {
        Self {
            seats,
            settings,
            log,
            event_callback: None,
        }
    }

    pub fn with_event_callback(mut self, callback: impl Fn(&MatchEvent) + Send + Sync + 'static) -> Self {
        self.event_callback = Some(Arc::new(callback));
        self
    }

    pub(crate) fn with_shared_callback(
        mut self,
        callback: Option<Arc<dyn Fn(&MatchEvent) + Send + Sync>>,
    ) -> Self {
        self.event_callback = callback;
        self
    }

    pub fn log_path(&self) -> &Path {
        self.log.path()
    }

    fn emit_event(&self, event: MatchEvent) {
        if let Some(callback) = &self.event_callback {
            callback(&event);
        }
    }

    /// Only failures to write the log are returned as errors.
    pub async fn run(&self, run_index: u32) -> Result<MatchOutcome, SinkError> {
        let mut state = MatchState {
            run: run_index,
            turn_index: 0,
            transcript: Transcript::new(),
            votes: Vec::new(),
            failure: None,
        };

        tracing::info!(run = run_index, log = %self.log.path().display(), "starting match");
        self.emit_event(MatchEvent::Started {
            run: run_index,
            log_file: self.log.path().to_path_buf(),
        });

        for round in 1..=self.settings.discussion_rounds {
            let step = PhaseStep {
                phase: Phase::Discussion,
                round,
            };
            if !self.run_phase(&mut state, step, None).await? {
                return Ok(self.finish(state, None));
            }
        }

        let vote_round = self.settings.discussion_rounds + 1;
        let final_history = state.transcript.render();
        let step = PhaseStep {
            phase: Phase::Vote,
            round: vote_round,
        };
        if !self.run_phase(&mut state, step, Some(&final_history)).await? {
            return Ok(self.finish(state, None));
        }

        let tally = tally_votes(&state.votes);
        self.log.append(&VoteSummaryRecord {
            timestamp: Utc::now(),
            run: run_index,
            round: vote_round,
            phase: Phase::VoteSummary,
            votes: state.votes.clone(),
            tally: tally.clone(),
        })?;
        tracing::info!(run = run_index, ?tally, "match complete");
        self.emit_event(MatchEvent::Summary {
            run: run_index,
            tally: tally.clone(),
        });

        Ok(self.finish(state, Some(tally)))
    }

    fn finish(&self, state: MatchState, tally: Option<Tally>) -> MatchOutcome {
        MatchOutcome {
            run_index: state.run,
            log_file: self.log.path().to_path_buf(),
            turns: state.turn_index,
            votes: state.votes,
            tally,
            failure: state.failure,
        }
    }

    // Vote turns all see `frozen_history`; false means the match must stop.
    async fn run_phase(
        &self,
        state: &mut MatchState,
        step: PhaseStep,
        frozen_history: Option<&str>,
    ) -> Result<bool, SinkError> {
        for seat in &self.seats {
            let pair = step.prompts(&seat.prompts);
            let system_prompt = pair.system_prompt.trim().to_string();
            let history_text = match frozen_history {
                Some(text) => text.to_string(),
                None => state.transcript.render(),
            };
            let user_prompt = build_user_prompt(&pair.user_prompt, &history_text);
            let messages = [
                ChatMessage::system(system_prompt.clone()),
                ChatMessage::user(user_prompt.trim()),
            ];

            match attempt_turn(&seat.model, &messages, step.require_vote(), &self.settings.retry).await {
                TurnOutcome::Parsed { turn, raw_response, .. } => {
                    state.turn_index += 1;

                    let visible_history = match step.phase {
                        Phase::Discussion => {
                            state.transcript.push(&seat.agent, &turn.thought, &turn.speech);
                            self.emit_event(MatchEvent::Speech {
                                run: state.run,
                                round: step.round,
                                agent: seat.agent.clone(),
                                speech: turn.speech.clone(),
                            });
                            state.transcript.render()
                        }
                        _ => {
                            state.votes.push(CastVote {
                                agent: seat.agent.clone(),
                                vote: turn.vote.clone(),
                            });
                            self.emit_event(MatchEvent::Vote {
                                run: state.run,
                                agent: seat.agent.clone(),
                                speech: turn.speech.clone(),
                                vote: turn.vote.clone(),
                            });
                            history_text
                        }
                    };

                    self.log.append(&TurnRecord {
                        timestamp: Utc::now(),
                        run: state.run,
                        round: step.round,
                        phase: step.phase,
                        turn_index: state.turn_index,
                        agent: seat.agent.clone(),
                        model_name: seat.model.alias().to_string(),
                        vote: turn.vote,
                        thought: turn.thought,
                        speech: turn.speech,
                        system_prompt,
                        user_prompt,
                        raw_response,
                        visible_history,
                    })?;
                }
                TurnOutcome::Exhausted {
                    error,
                    last_raw_response,
                    attempts,
                } => {
                    tracing::error!(
                        run = state.run,
                        agent = %seat.agent,
                        phase = step.phase.as_str(),
                        attempts,
                        "no usable response; aborting match"
                    );
                    self.record_failure(state, step, seat, system_prompt, user_prompt, error, last_raw_response)?;
                    return Ok(false);
                }
            }
        }

        Ok(true)
    }

    #[allow(clippy::too_many_arguments)]
    fn record_failure(
        &self,
        state: &mut MatchState,
        step: PhaseStep,
        seat: &Seat,
        system_prompt: String,
        user_prompt: String,
        error: TurnError,
        raw_response: Option<String>,
    ) -> Result<(), SinkError> {
        let error = error.to_string();
        let now = Utc::now();

        self.log.append(&TurnErrorRecord {
            timestamp: now,
            run: state.run,
            round: step.round,
            phase: step.phase,
            turn_index: state.turn_index + 1,
            agent: seat.agent.clone(),
            model_name: seat.model.alias().to_string(),
            error: error.clone(),
            raw_response: raw_response.clone(),
        })?;

        append_failure_log(
            &self.settings.failure_log_dir,
            &self.settings.failure_log_name,
            &FailureRecord {
                timestamp: now,
                run: state.run,
                round: step.round,
                phase: step.phase,
                agent: seat.agent.clone(),
                model_name: seat.model.alias().to_string(),
                system_prompt,
                user_prompt,
                raw_response,
                error: error.clone(),
                log_file: self.log.file_name(),
            },
        )?;

        self.emit_event(MatchEvent::Aborted {
            run: state.run,
            round: step.round,
            phase: step.phase,
            agent: seat.agent.clone(),
            error: error.clone(),
        });

        state.failure = Some(MatchFailure {
            phase: step.phase,
            round: step.round,
            agent: seat.agent.clone(),
            error,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{fs, sync::Mutex};

    use serde_json::Value;
    use tempfile::TempDir;

    use super::*;
    use crate::{
        history::EMPTY_HISTORY,
        providers::scripted::{ScriptedProvider, ScriptedStep},
        types::MessageRole,
    };

    fn prompts(agent: &str) -> AgentPrompts {
        AgentPrompts {
            discussion: PromptPair {
                system_prompt: format!("You are player {agent}.  "),
                user_prompt: "Discuss.\n{conversation_history}".to_string(),
            },
            vote: PromptPair {
                system_prompt: format!("You are player {agent}."),
                user_prompt: "Cast your vote.".to_string(),
            },
        }
    }

    fn speech(agent: &str, n: u32) -> String {
        format!(r#"{{"thought": "secret-{agent}-{n}", "speech": "{agent} says {n}"}}"#)
    }

    fn ballot(target: &str) -> String {
        format!(r#"{{"thought": "t", "speech": "I vote {target}", "vote": "{target}"}}"#)
    }

    fn table(dir: &TempDir, scripts: Vec<(&str, Arc<ScriptedProvider>)>, max_attempts: u32) -> MatchRunner {
        let seats = scripts
            .into_iter()
            .map(|(agent, provider)| Seat {
                agent: agent.to_string(),
                model: ChatModel::new(format!("model-{agent}"), "scripted", provider),
                prompts: prompts(agent),
            })
            .collect();

        MatchRunner::new(
            seats,
            MatchSettings {
                discussion_rounds: 2,
                retry: RetryPolicy::new(max_attempts),
                failure_log_dir: dir.path().to_path_buf(),
                failure_log_name: "failures.jsonl".to_string(),
            },
            JsonlWriter::new(dir.path().join("logfile_001.jsonl")),
        )
    }

    fn read_records(path: &Path) -> Vec<Value> {
        fs::read_to_string(path)
            .unwrap_or_default()
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    fn happy_provider(agent: &str, target: &str) -> Arc<ScriptedProvider> {
        Arc::new(ScriptedProvider::new(vec![speech(agent, 1), speech(agent, 2), ballot(target)]))
    }

    #[tokio::test]
    async fn full_match_numbers_turns_and_tallies() {
        let dir = TempDir::new().unwrap();
        let a = happy_provider("A", "B");
        let runner = table(
            &dir,
            vec![
                ("A", a.clone()),
                ("B", happy_provider("B", "C")),
                ("C", happy_provider("C", "B")),
                ("D", happy_provider("D", "B")),
            ],
            3,
        );

        let outcome = runner.run(1).await.unwrap();
        assert!(outcome.success());
        assert_eq!(outcome.turns, 12);

        let tally = outcome.tally.expect("tally");
        assert_eq!(tally["B"], 3);
        assert_eq!(tally["C"], 1);

        let records = read_records(runner.log_path());
        assert_eq!(records.len(), 13);

        let indices: Vec<u64> = records[..12]
            .iter()
            .map(|record| record["turn_index"].as_u64().unwrap())
            .collect();
        assert_eq!(indices, (1..=12).collect::<Vec<u64>>());

        assert_eq!(records[0]["phase"], "discussion");
        assert_eq!(records[0]["round"], 1);
        assert_eq!(records[4]["round"], 2);
        assert_eq!(records[8]["phase"], "vote");
        assert_eq!(records[8]["round"], 3);

        let summary = &records[12];
        assert_eq!(summary["phase"], "vote_summary");
        assert_eq!(summary["run"], 1);
        assert!(summary.get("turn_index").is_none());
        assert_eq!(summary["votes"].as_array().unwrap().len(), 4);

        assert!(!dir.path().join("failures.jsonl").exists());

        // First speaker sees the empty-history sentinel; thoughts never leak into prompts.
        let requests = a.requests();
        let first_user = requests[0].messages[1].text().unwrap().to_string();
        assert!(first_user.contains(EMPTY_HISTORY));
        assert_eq!(requests[0].messages[0].text(), Some("You are player A."));
        for request in &requests {
            assert_eq!(request.messages[1].role, MessageRole::User);
            assert!(!request.messages[1].text().unwrap().contains("secret-"));
        }
        let second_round = requests[1].messages[1].text().unwrap();
        assert!(second_round.contains("A: A says 1\nB: B says 1\nC: C says 1\nD: D says 1"));
    }

    #[tokio::test]
    async fn vote_prompts_share_the_frozen_discussion_history() {
        let dir = TempDir::new().unwrap();
        let providers: Vec<_> = ["A", "B"].iter().map(|id| happy_provider(id, "A")).collect();
        let runner = table(
            &dir,
            vec![("A", providers[0].clone()), ("B", providers[1].clone())],
            1,
        );

        let outcome = runner.run(5).await.unwrap();
        assert!(outcome.success());

        let vote_prompt_a = providers[0].requests()[2].messages[1].text().unwrap().to_string();
        let vote_prompt_b = providers[1].requests()[2].messages[1].text().unwrap().to_string();
        assert_eq!(vote_prompt_a, vote_prompt_b);
        assert!(!vote_prompt_b.contains("I vote"));

        let records = read_records(runner.log_path());
        assert!(records.iter().all(|record| record["run"] == 5));
        assert_eq!(records[4]["visible_history"], records[5]["visible_history"]);
    }

    #[tokio::test]
    async fn discussion_failure_aborts_the_match() {
        let dir = TempDir::new().unwrap();
        let c = Arc::new(ScriptedProvider::new(vec![
            ScriptedStep::Fail("connection refused".to_string()),
            ScriptedStep::Reply("garbage".to_string()),
        ]));
        let d = happy_provider("D", "A");
        let runner = table(
            &dir,
            vec![
                ("A", happy_provider("A", "B")),
                ("B", happy_provider("B", "C")),
                ("C", c),
                ("D", d.clone()),
            ],
            2,
        );

        let outcome = runner.run(1).await.unwrap();
        assert!(!outcome.success());
        assert!(outcome.tally.is_none());
        assert_eq!(outcome.turns, 2);

        let failure = outcome.failure.unwrap();
        assert_eq!(failure.phase, Phase::Discussion);
        assert_eq!(failure.agent, "C");

        let records = read_records(runner.log_path());
        assert_eq!(records.len(), 3);
        assert_eq!(records[2]["agent"], "C");
        assert_eq!(records[2]["turn_index"], 3);
        assert_eq!(records[2]["raw_response"], "garbage");
        assert!(records[2]["error"].as_str().unwrap().contains("not valid JSON"));
        assert!(records.iter().all(|record| record["phase"] != "vote_summary"));
        assert_eq!(d.calls(), 0);

        let failures = read_records(&dir.path().join("failures.jsonl"));
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0]["model_name"], "model-C");
        assert_eq!(failures[0]["log_file"], "logfile_001.jsonl");
        assert!(failures[0]["user_prompt"].as_str().unwrap().contains("A: A says 1"));
    }

    #[tokio::test]
    async fn vote_failure_writes_no_summary() {
        let dir = TempDir::new().unwrap();
        let b = Arc::new(ScriptedProvider::new(vec![
            speech("B", 1),
            speech("B", 2),
            r#"{"speech": "I will not vote."}"#.to_string(),
        ]));
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let runner = table(&dir, vec![("A", happy_provider("A", "B")), ("B", b)], 1)
            .with_event_callback(move |event| sink.lock().unwrap().push(event.clone()));

        let outcome = runner.run(2).await.unwrap();
        assert!(!outcome.success());
        assert_eq!(outcome.votes.len(), 1);
        assert_eq!(outcome.failure.as_ref().unwrap().phase, Phase::Vote);

        let records = read_records(runner.log_path());
        assert_eq!(records.len(), 6);
        assert_eq!(records[5]["phase"], "vote");
        assert_eq!(records[5]["turn_index"], 6);
        assert!(records[5]["error"].as_str().unwrap().contains("vote"));
        assert!(records.iter().all(|record| record["phase"] != "vote_summary"));

        let events = events.lock().unwrap();
        assert!(matches!(events.first(), Some(MatchEvent::Started { run: 2, .. })));
        assert!(matches!(events.last(), Some(MatchEvent::Aborted { agent, phase: Phase::Vote, .. }) if agent == "B"));
        assert!(!events.iter().any(|event| matches!(event, MatchEvent::Summary { .. })));
    }
}
