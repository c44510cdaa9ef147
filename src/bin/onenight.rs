use std::{path::PathBuf, process::ExitCode};

use clap::Parser;
use onenight::{
    config::{load_dotenv, Experiment, ExperimentPaths, ModelRegistry, DEFAULT_MODELS_PATH},
    game::MatchEvent,
    orchestrator::{BatchOrchestrator, LogTarget, OrchestratorError},
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "onenight")]
#[command(about = "Run One Night Werewolf matches between LLM agents")]
struct Args {
    /// Number of matches to play
    #[arg(short, long, value_parser = clap::value_parser!(u32).range(1..))]
    matches: u32,

    /// Directory holding config.yaml, prompts.yaml and logs/
    #[arg(long, default_value = "demos/werewolf_4player")]
    experiment_dir: PathBuf,

    /// Experiment config (defaults to <experiment-dir>/config.yaml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Prompt book (defaults to <experiment-dir>/prompts.yaml)
    #[arg(long)]
    prompts: Option<PathBuf>,

    /// Model registry
    #[arg(long, default_value = DEFAULT_MODELS_PATH)]
    models: PathBuf,

    /// Log directory (defaults to <experiment-dir>/logs)
    #[arg(long)]
    logs_dir: Option<PathBuf>,

    /// Append to this existing log instead of starting a new one
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn print_event(event: &MatchEvent) {
    match event {
        MatchEvent::Started { run, log_file } => {
            println!("=== Match {run} (log: {}) ===", log_file.display());
        }
        MatchEvent::Speech { round, agent, speech, .. } => {
            println!("[round {round}] {agent}: {speech}");
        }
        MatchEvent::Vote { agent, speech, vote, .. } => {
            println!("[vote] {agent} -> {vote}: {speech}");
        }
        MatchEvent::Aborted { run, round, phase, agent, error } => {
            println!(
                "Match {run} aborted in {} round {round}: {agent} gave no usable response ({error})",
                phase.as_str()
            );
        }
        MatchEvent::Summary { run, tally } => {
            let counts = tally
                .iter()
                .map(|(target, count)| format!("{target}: {count}"))
                .collect::<Vec<_>>()
                .join(", ");
            println!("Match {run} tally: {counts}");
        }
    }
}

async fn run(args: Args) -> Result<(), OrchestratorError> {
    let mut paths = ExperimentPaths::from_dir(&args.experiment_dir);
    if let Some(config) = args.config {
        paths.config = config;
    }
    if let Some(prompts) = args.prompts {
        paths.prompts = prompts;
    }
    if let Some(logs_dir) = args.logs_dir {
        paths.logs_dir = logs_dir;
    }

    let registry = ModelRegistry::load(&args.models)?;
    let experiment = Experiment::load(&paths, &registry)?;
    println!("Players: {}", experiment.player_ids().join(", "));

    let target = match args.log_file {
        Some(path) => LogTarget::Existing(path),
        None => LogTarget::Next,
    };
    let orchestrator = BatchOrchestrator::with_http(experiment, &registry, &paths.logs_dir)?
        .with_log_target(target)
        .with_event_callback(print_event);

    let report = orchestrator.run(args.matches).await?;
    println!(
        "Finished {} match(es): {} completed, {} aborted. Log: {}",
        report.outcomes.len(),
        report.completed(),
        report.failed(),
        report.log_file.display()
    );
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    load_dotenv();
    let args = Args::parse();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(OrchestratorError::Unreachable(failures)) => {
            eprintln!("Pre-flight check failed; no matches were run:");
            for failure in failures {
                eprintln!(
                    "  - {} ({}) at {}: {}",
                    failure.agent, failure.model_alias, failure.base_url, failure.detail
                );
            }
            ExitCode::FAILURE
        }
        Err(error) => {
            eprintln!("error: {error}");
            ExitCode::FAILURE
        }
    }
}
