//! Rule Automation Worker
//!
//! Long-running consumer: pulls trigger events from the NATS JetStream queue
//! and runs them through the workflow engine until Ctrl-C.
//!
//! Rules, actions, templates and dependencies come from a JSON seed file into
//! in-memory storage. Every action type listed in `--log-types` is served by
//! the logging reference handler, which is handy for dry runs.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use dotenv::dotenv;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use rule_automation::engine::queue::QueueManager;
use rule_automation::engine::storage::StorageSeed;
use rule_automation::settings::Settings;
use rule_automation::{
    CircuitBreaker, HandlerRegistry, InMemoryStorage, LogActionHandler, NatsQueueTransport, WorkflowEngine,
};

#[derive(Parser)]
#[command(name = "automation-worker")]
#[command(about = "Rule automation worker - consume trigger events and execute matching rules")]
#[command(version = "1.0")]
struct Cli {
    /// Settings file (TOML, YAML or JSON)
    #[arg(long, env = "AUTOMATION_CONFIG")]
    config: Option<PathBuf>,

    /// JSON seed with rules, actions, templates and dependencies
    #[arg(long, env = "AUTOMATION_SEED_FILE")]
    seed: Option<PathBuf>,

    /// Action types served by the logging handler
    #[arg(long, value_delimiter = ',', default_value = "log")]
    log_types: Vec<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(e) = dotenv() {
        eprintln!("Warning: Could not load .env file: {}", e);
    }

    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let settings = Settings::load(cli.config.as_deref()).context("Failed to load settings")?;

    // Storage and seed data
    let storage = Arc::new(InMemoryStorage::new());
    let seed_path = cli.seed.clone().or_else(|| settings.seed_file.clone().map(PathBuf::from));
    let dependencies = match &seed_path {
        Some(path) => {
            let seed = StorageSeed::from_file(path)?;
            info!(
                path = %path.display(),
                rules = seed.rules.len(),
                actions = seed.actions.len(),
                templates = seed.templates.len(),
                "Loading seed data"
            );
            seed.load_into(storage.as_ref()).await?
        }
        None => {
            warn!("No seed file given; starting with no rules");
            Vec::new()
        }
    };

    // Handlers
    let registry = HandlerRegistry::new();
    for action_type in &cli.log_types {
        registry.register(Arc::new(LogActionHandler::for_type(action_type.clone())));
    }

    // Engine
    let engine = Arc::new(WorkflowEngine::new(storage.clone(), registry, settings.engine_config())?);
    if !dependencies.is_empty() {
        let created = engine
            .resolver()
            .add_dependencies(dependencies)
            .await
            .context("Seed dependencies were rejected")?;
        info!(dependencies = created.len(), "Seed dependencies stored");
    }
    engine.initialize().await?;

    // Queue
    let nats = settings.nats_config();
    info!(urls = ?nats.nats_urls, stream = %nats.stream_name, "Connecting to NATS");
    let transport = Arc::new(NatsQueueTransport::connect(nats).await?);

    let breaker = Arc::new(CircuitBreaker::new("automation-queue", settings.breaker_config()));
    let queue = QueueManager::new(transport, breaker, settings.queue_config());
    queue.start_consumers(engine.clone()).await?;

    info!("Worker running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    info!("Shutting down");
    queue.shutdown().await;

    let stats = engine.stats().await;
    info!(
        total = stats.total_executions,
        completed = stats.completed,
        failed = stats.failed,
        cancelled = stats.cancelled,
        average_duration_ms = stats.average_duration_ms,
        "Final statistics"
    );
    Ok(())
}
