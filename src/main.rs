use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

use costguard::analyzer::SpikeDetector;
use costguard::api::{self, AppState};
use costguard::config::Config;
use costguard::sampler;
use costguard::scheduler::Scheduler;
use costguard::storage;

#[derive(Parser, Debug)]
#[command(name = "costguard", about = "Daily cloud cost spike detector")]
struct Cli {
    /// Path to configuration file (built-in defaults when omitted)
    #[arg(short, long)]
    config: Option<String>,

    /// Validate config and exit
    #[arg(long)]
    check: bool,

    /// Print version and exit
    #[arg(short, long)]
    version: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.version {
        println!("costguard {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    // Load configuration
    let mut config = match cli.config.as_deref() {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    config.apply_env_overrides(|key| std::env::var(key).ok())?;
    config.validate()?;

    if cli.check {
        println!("Configuration is valid.");
        return Ok(());
    }

    init_logging(&config)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        services = ?config.service_names(),
        "Starting costguard"
    );

    if let Err(e) = run(config).await {
        error!(error = %e, "costguard terminated with error");
        return Err(e);
    }

    Ok(())
}

fn init_logging(config: &Config) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.agent.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    Ok(())
}

async fn run(config: Config) -> Result<()> {
    let stores = storage::open(&config.storage)?;
    let sampler = sampler::create_sampler(&config)?;

    let detector = SpikeDetector::new(
        stores.costs.clone(),
        stores.alerts.clone(),
        config.service_names(),
    )
    .with_config(&config.detector);

    let scheduler = Arc::new(Scheduler::new(
        sampler,
        stores.costs.clone(),
        detector,
        config.scheduler.clone(),
    ));

    // The cycle task and request handlers share nothing but the stores.
    tokio::spawn(scheduler.clone().run());

    let state = AppState::new(&stores, scheduler);
    let bind = config.api.bind.clone();
    let server = tokio::spawn(async move { api::start_server(state, &bind).await });

    tokio::select! {
        res = server => {
            res??;
        }
        res = tokio::signal::ctrl_c() => {
            res?;
            info!("Received shutdown signal, exiting");
        }
    }

    Ok(())
}
