use std::{
    io::{self, BufRead, Write},
    process::ExitCode,
};

use clap::Parser;
use futures_util::StreamExt;
use onenight::{
    config::{load_dotenv, ProviderSettings, SettingsLayer},
    providers::{create_provider, ChatModel, ProviderKind},
    types::StreamEvent,
    ChatMessage,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "chat")]
#[command(about = "Send one prompt to a model and print the reply")]
struct Args {
    /// User prompt (asked for interactively when omitted)
    #[arg(short, long)]
    prompt: Option<String>,

    /// System message sent before the prompt
    #[arg(long = "system", default_value = "You are a research assistant.")]
    system_prompt: String,

    /// Provider to talk to
    #[arg(long, default_value = "ollama")]
    provider: ProviderKind,

    /// Base URL (overrides <PROVIDER>_BASE_URL)
    #[arg(long)]
    base_url: Option<String>,

    /// Model name (overrides <PROVIDER>_MODEL)
    #[arg(long)]
    model: Option<String>,

    /// Sampling temperature
    #[arg(long)]
    temperature: Option<f32>,

    /// Print the reply as it is generated
    #[arg(long)]
    stream: bool,
}

fn ask_prompt() -> io::Result<String> {
    print!("User prompt: ");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let prompt = match args.prompt {
        Some(prompt) => prompt,
        None => ask_prompt()?,
    };
    if prompt.is_empty() {
        return Err("a prompt is required".into());
    }

    let explicit = SettingsLayer {
        model: args.model,
        base_url: args.base_url,
        temperature: args.temperature,
        ..SettingsLayer::default()
    };
    let environment = SettingsLayer::from_env(args.provider.env_prefix(), |key| std::env::var(key).ok())?;
    let settings = ProviderSettings::resolve(args.provider, explicit, environment)?;
    tracing::debug!(provider = %settings.kind, model = %settings.model, url = %settings.base_url, "resolved chat settings");

    let model = ChatModel::from_settings(settings.model.clone(), &settings, create_provider(&settings)?);
    let messages = [ChatMessage::system(args.system_prompt), ChatMessage::user(prompt)];

    if args.stream {
        let mut stream = model.stream(&messages).await?;
        let mut stdout = io::stdout();
        while let Some(event) = stream.next().await {
            match event? {
                StreamEvent::MessageDelta(delta) => {
                    print!("{delta}");
                    stdout.flush()?;
                }
                StreamEvent::Completed(_) => println!(),
            }
        }
    } else {
        let reply = model.invoke(&messages).await?;
        println!("Assistant: {reply}");
    }

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
