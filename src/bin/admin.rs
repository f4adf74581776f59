//! Rule Automation Admin CLI
//!
//! Administrative tool for the rule automation engine:
//! - `publish`: push a trigger event onto the NATS queue
//! - `plan`: dry-run an event against a seed file and print the batch plan
//! - `validate`: check a seed file's dependencies for cycles and bad edges

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing::error;
use tracing_subscriber::EnvFilter;

use rule_automation::engine::queue::QueueManager;
use rule_automation::engine::storage::StorageSeed;
use rule_automation::models::{DependencyGraph, RuleId};
use rule_automation::settings::Settings;
use rule_automation::{
    CircuitBreaker, HandlerRegistry, InMemoryStorage, NatsQueueTransport, TriggerEvent, WorkflowEngine,
};

#[derive(Parser)]
#[command(name = "automation-admin")]
#[command(about = "Rule automation admin CLI - publish events, preview plans, validate dependencies")]
#[command(version = "1.0")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Settings file (TOML, YAML or JSON)
    #[arg(long, env = "AUTOMATION_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Publish a trigger event (JSON file) to the queue
    Publish {
        /// Path to the event JSON
        event: PathBuf,
    },

    /// Show which rules an event would run, and in what order
    Plan {
        /// JSON seed with rules and dependencies
        #[arg(long)]
        seed: PathBuf,

        /// Path to the event JSON
        event: PathBuf,
    },

    /// Validate the dependencies in a seed file
    Validate {
        /// JSON seed with rules and dependencies
        seed: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    let settings = Settings::load(cli.config.as_deref()).context("Failed to load settings")?;

    let outcome = match cli.command {
        Commands::Publish { event } => publish(&settings, &event).await,
        Commands::Plan { seed, event } => plan(&settings, &seed, &event).await,
        Commands::Validate { seed } => validate(&seed).await,
    };

    if let Err(e) = &outcome {
        error!(error = %e, "Command failed");
    }
    outcome
}

fn read_event(path: &Path) -> Result<TriggerEvent> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("{} is not a valid trigger event", path.display()))
}

async fn publish(settings: &Settings, event_path: &Path) -> Result<()> {
    let event = read_event(event_path)?;
    let transport = Arc::new(NatsQueueTransport::connect(settings.nats_config()).await?);
    let breaker = Arc::new(CircuitBreaker::new("admin-publish", settings.breaker_config()));
    let queue = QueueManager::new(transport, breaker, settings.queue_config());

    let message = queue.submit(&event).await?;
    println!(
        "{} {} {} ({} {})",
        "✅ Published".green().bold(),
        message.id,
        format!("to {}", message.category).as_str().cyan(),
        message.entity_name,
        message.entity_id
    );
    Ok(())
}

async fn plan(settings: &Settings, seed_path: &Path, event_path: &Path) -> Result<()> {
    let event = read_event(event_path)?;
    let storage = Arc::new(InMemoryStorage::new());
    let dependencies = StorageSeed::from_file(seed_path)?.load_into(storage.as_ref()).await?;

    let engine = WorkflowEngine::new(storage, HandlerRegistry::new(), settings.engine_config())?;
    engine.resolver().add_dependencies(dependencies).await?;

    let plan = engine.plan_workflow(&event).await?;
    println!(
        "{} {} {} {}",
        "📋 Plan for".bold(),
        event.event_type,
        event.entity_name,
        event.entity_id
    );
    if plan.batches.is_empty() {
        println!("   {}", "No rules matched".yellow());
        return Ok(());
    }

    println!(
        "   {} rule(s) in {} batch(es), estimated {} ms",
        plan.matched_rule_count,
        plan.batches.len(),
        plan.total_estimated_duration_ms
    );
    for batch in &plan.batches {
        let mode = if batch.can_run_parallel { "parallel" } else { "sequential" };
        println!(
            "   {} {} (level {}, {}, ~{} ms)",
            "Batch".cyan().bold(),
            batch.batch_number,
            batch.dependency_level,
            mode,
            batch.estimated_duration_ms
        );
        for rule_id in &batch.rule_ids {
            let name = engine
                .storage()
                .get_rule(rule_id)
                .await?
                .map(|rule| rule.name)
                .unwrap_or_default();
            println!("     - {} {}", rule_id, name.as_str().dimmed());
        }
    }
    Ok(())
}

async fn validate(seed_path: &Path) -> Result<()> {
    let seed = StorageSeed::from_file(seed_path)?;
    let rule_ids: Vec<RuleId> = seed.rules.iter().map(|rule| rule.id.clone()).collect();
    let dependencies = seed.dependencies.clone();

    // Every edge between known rules, as if nothing had been validated
    let raw_graph = DependencyGraph::build(rule_ids.clone(), &dependencies);
    let cycles = raw_graph.detect_cycles();
    if cycles.has_cycles {
        println!("{} {} cycle(s)", "❌ Found".red().bold(), cycles.cycles.len());
        for cycle in &cycles.cycles {
            let path: Vec<&str> = cycle.iter().map(|id| id.as_str()).collect();
            println!("   {}", path.join(" -> "));
        }
    } else {
        println!("{}", "✅ No cycles".green().bold());
    }

    let errors = DependencyGraph::build(rule_ids, &[]).validate(&dependencies);
    if errors.is_empty() {
        println!(
            "{} {} dependency edge(s) accepted",
            "✅".green(),
            dependencies.len()
        );
        for (level, rules) in raw_graph.levels() {
            let names: Vec<&str> = rules.iter().map(|id| id.as_str()).collect();
            println!("   level {}: {}", level, names.join(", "));
        }
        return Ok(());
    }

    println!("{} {} rejected dependency edge(s)", "❌".red(), errors.len());
    for error in &errors {
        println!(
            "   {} {} -> {}: {}",
            format!("[{:?}]", error.error_type).as_str().yellow(),
            error.parent_rule_id,
            error.child_rule_id,
            error.message
        );
    }
    anyhow::bail!("{} dependency error(s)", errors.len())
}
