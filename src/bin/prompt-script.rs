use std::{path::PathBuf, process::ExitCode};

use clap::Parser;
use onenight::{
    config::{load_dotenv, ModelRegistry, DEFAULT_MODELS_PATH},
    providers::{HttpModelFactory, ModelFactory},
    script::{run_script, PromptScript},
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "prompt-script")]
#[command(about = "Send a scripted list of prompts to one model and log the replies")]
struct Args {
    /// Script file (model_name, system_prompt and turns, or prompts_file)
    #[arg(short, long)]
    config: PathBuf,

    /// Model registry
    #[arg(long, default_value = DEFAULT_MODELS_PATH)]
    models: PathBuf,

    /// Log directory
    #[arg(long, default_value = "data/logs")]
    logs_dir: PathBuf,
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let script = PromptScript::load(&args.config)?;
    let registry = ModelRegistry::load(&args.models)?;
    let settings = registry.resolve(&script.model_name)?;
    let model = HttpModelFactory.create(&script.model_name, &settings)?;

    let report = run_script(&script, &model, &args.logs_dir, |record| {
        println!("[{}] -> {}", record.speaker, record.response);
    })
    .await?;

    println!("Log saved to {}", report.log_file.display());
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
        Err(error) => {
            eprintln!("error: {error}");
            ExitCode::FAILURE
        }
    }
}
