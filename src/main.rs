use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use ticketfix::agent::Agent;
use ticketfix::config::{AgentConfig, Settings, DEFAULT_INTERVAL_SECS, DEFAULT_MAX_ATTEMPTS};
use ticketfix::discovery::LayeredDiscovery;
use ticketfix::llm::client::OpenRouterClient;
use ticketfix::llm::CompletionModel;
use ticketfix::shutdown::Shutdown;
use ticketfix::state::DEFAULT_STATE_FILE;
use ticketfix::tracker::jira::JiraClient;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(
    name = "ticketfix",
    about = "Watches Jira for bug reports and repairs the referenced code",
    version
)]
struct Args {
    /// Directory the agent may read and modify; nothing outside it is touched
    #[arg(long)]
    safe_root: PathBuf,

    /// Compute and log changes without writing files or updating tickets
    #[arg(long)]
    dry_run: bool,

    /// Have the model review each change before the ticket is closed
    #[arg(long)]
    self_review: bool,

    /// Seconds between tracker polls
    #[arg(long, default_value_t = DEFAULT_INTERVAL_SECS)]
    interval: u64,

    /// Generation attempts per ticket
    #[arg(long, default_value_t = DEFAULT_MAX_ATTEMPTS, value_parser = clap::value_parser!(u32).range(1..))]
    max_attempts: u32,

    /// Where processed tickets are recorded
    #[arg(long, default_value = DEFAULT_STATE_FILE)]
    state_file: PathBuf,

    /// Credentials file (defaults to ~/.config/ticketfix/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Debug logging unless RUST_LOG says otherwise
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "ticketfix=debug,info" } else { "info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let safe_root = args
        .safe_root
        .canonicalize()
        .with_context(|| format!("Safe root {} does not exist", args.safe_root.display()))?;

    let settings = Settings::load(args.config.as_deref())?;
    let creds = settings.credentials()?;

    let mut config = AgentConfig::new(&safe_root);
    config.dry_run = args.dry_run;
    config.self_review = args.self_review;
    config.interval = Duration::from_secs(args.interval);
    config.max_attempts = args.max_attempts;
    config.state_file = args.state_file;

    let tracker = Arc::new(JiraClient::new(
        &creds.jira_server,
        &creds.jira_email,
        &creds.jira_token,
    )?);
    let model: Arc<dyn CompletionModel> = Arc::new(OpenRouterClient::new(
        &creds.llm_api_key,
        &creds.llm_model,
        creds.llm_base_url.as_deref(),
    )?);
    let discovery = Arc::new(LayeredDiscovery::new(Some(model.clone())));

    info!(
        root = %safe_root.display(),
        model = %creds.llm_model,
        dry_run = config.dry_run,
        self_review = config.self_review,
        max_attempts = config.max_attempts,
        "starting ticketfix"
    );

    let shutdown = Shutdown::new();
    tokio::spawn(watch_signals(shutdown.clone()));

    let mut agent = Agent::new(config, tracker, model, discovery, shutdown)?;
    agent.run().await
}

/// Trigger shutdown on Ctrl-C or SIGTERM.
async fn watch_signals(shutdown: Shutdown) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!("Failed to install SIGTERM handler: {}", err);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    info!("shutdown requested, finishing the current step");
    shutdown.trigger();
}
