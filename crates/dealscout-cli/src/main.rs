//! Dealscout CLI - model routing and self-learning lead scoring

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};
use dealscout_core::config::Config;
use dealscout_core::feedback::Outcome;
use dealscout_core::invoker::InvocationRequest;
use dealscout_core::records::{InMemoryPropertyRecords, PropertyRecords};
use dealscout_core::registry::{ModelRegistry, Provider, TaskType};
use dealscout_core::storage::Database;
use dealscout_core::trainer::TrainerRun;
use dealscout_core::weights::WeightSet;
use dealscout_core::{BatchSummary, DealEngine};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "dealscout")]
#[command(author, version, about = "Model routing and self-learning lead scoring", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    /// Quiet mode (minimal output)
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Route a task to a model and print its output
    Route {
        /// Task type (summarize, classify, extract, generate, sms, comps, ...)
        task: String,
        /// Prompt text
        prompt: String,
        /// System prompt
        #[arg(long)]
        system: Option<String>,
        #[arg(long)]
        max_tokens: Option<u32>,
        /// Bound on each backend attempt, in seconds
        #[arg(long)]
        timeout_secs: Option<u64>,
        /// Bound on the whole request including fallbacks, in seconds
        #[arg(long)]
        deadline_secs: Option<u64>,
    },

    /// Score one property
    Score {
        /// Property address
        address: String,
        /// JSON record fixture
        #[arg(short, long)]
        records: PathBuf,
        /// Scoring date (YYYY-MM-DD, defaults to today)
        #[arg(long)]
        as_of: Option<NaiveDate>,
    },

    /// Score several properties and summarize
    ScoreBatch {
        /// Addresses to score (defaults to every property in the fixture)
        addresses: Vec<String>,
        /// JSON record fixture
        #[arg(short, long)]
        records: PathBuf,
        #[arg(long)]
        as_of: Option<NaiveDate>,
    },

    /// Record the real-world outcome of a score or routing decision
    Outcome {
        /// Score or decision id
        id: Uuid,
        /// closed, offer_accepted, dead, opt_out or no_response
        outcome: Outcome,
    },

    /// Run the learning loop
    Train {
        /// Keep running on the configured interval until interrupted
        #[arg(long)]
        watch: bool,
    },

    /// Inspect the model catalog
    Models {
        #[command(subcommand)]
        action: ModelAction,
    },

    /// Inspect and roll back scoring weights
    Weights {
        #[command(subcommand)]
        action: WeightAction,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Run health check
    Doctor,
}

#[derive(Subcommand)]
enum ModelAction {
    /// List catalog models
    List {
        /// Only models advertising this task type
        #[arg(short, long)]
        capability: Option<String>,
    },
}

#[derive(Subcommand)]
enum WeightAction {
    /// Show the active weight set
    Show,
    /// List every published weight set
    History,
    /// Make an earlier epoch active again
    Rollback { epoch: u64 },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a configuration value
    Get { key: String },
    /// Set a configuration value
    Set { key: String, value: String },
    /// List all configuration values
    List,
    /// Reset configuration to defaults
    Reset,
    /// Show config file path
    Path,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let directive = if cli.quiet { "dealscout=warn" } else { "dealscout=info" };
    let filter = tracing_subscriber::EnvFilter::from_default_env();
    let filter = match directive.parse() {
        Ok(directive) => filter.add_directive(directive),
        Err(_) => filter,
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            match e.downcast_ref::<dealscout_core::Error>() {
                Some(core) => {
                    eprintln!("Error [{}]: {}", core.code(), core);
                    if let Some(suggestion) = core.suggestion() {
                        eprintln!("  Try: {}", suggestion);
                    }
                }
                None => eprintln!("Error: {:#}", e),
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let format = cli.format;
    let quiet = cli.quiet;

    match cli.command {
        Commands::Route {
            task,
            prompt,
            system,
            max_tokens,
            timeout_secs,
            deadline_secs,
        } => {
            let mut request = InvocationRequest::new(prompt);
            if let Some(system) = system {
                request = request.with_system(system);
            }
            if let Some(max_tokens) = max_tokens {
                request = request.with_max_tokens(max_tokens);
            }
            cmd_route(&task, &request, timeout_secs, deadline_secs, format, quiet).await
        }

        Commands::Score {
            address,
            records,
            as_of,
        } => cmd_score(&address, &records, as_of.unwrap_or_else(today), format, quiet).await,

        Commands::ScoreBatch {
            addresses,
            records,
            as_of,
        } => cmd_score_batch(addresses, &records, as_of.unwrap_or_else(today), format, quiet).await,

        Commands::Outcome { id, outcome } => cmd_outcome(id, outcome, format, quiet).await,

        Commands::Train { watch } => cmd_train(watch, format, quiet).await,

        Commands::Models { action } => cmd_models(action, format),

        Commands::Weights { action } => cmd_weights(action, format, quiet).await,

        Commands::Config { action } => cmd_config(action, format, quiet),

        Commands::Doctor => cmd_doctor(quiet).await,
    }
}

fn today() -> NaiveDate {
    Local::now().date_naive()
}

async fn open_engine(records: Arc<dyn PropertyRecords>) -> anyhow::Result<DealEngine> {
    let config = Config::load()?;
    Ok(DealEngine::open(config, records).await?)
}

fn load_records(path: &Path) -> anyhow::Result<Arc<InMemoryPropertyRecords>> {
    let records = InMemoryPropertyRecords::from_path(path)
        .map_err(|e| anyhow::anyhow!("Failed to load records from {}: {}", path.display(), e))?;
    Ok(Arc::new(records))
}

fn print_json(value: &serde_json::Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// ============================================================================
// Command Implementations
// ============================================================================

async fn cmd_route(
    task: &str,
    request: &InvocationRequest,
    timeout_secs: Option<u64>,
    deadline_secs: Option<u64>,
    format: OutputFormat,
    quiet: bool,
) -> anyhow::Result<()> {
    let engine = open_engine(Arc::new(InMemoryPropertyRecords::new())).await?;

    let cancel = CancellationToken::new();
    let mut options = engine.route_options().with_cancel(cancel.clone());
    if let Some(secs) = timeout_secs {
        options = options.with_timeout(Duration::from_secs(secs));
    }
    if let Some(secs) = deadline_secs {
        options = options.with_deadline(tokio::time::Instant::now() + Duration::from_secs(secs));
    }

    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling request");
            cancel.cancel();
        }
    });
    let result = engine.route(task, request, &options).await;
    interrupt.abort();
    engine.close().await;
    let outcome = result?;

    match format {
        OutputFormat::Json => print_json(&json!({
            "model": outcome.result.model_id,
            "output": outcome.result.output,
            "latency_ms": outcome.result.latency_ms,
            "attempts": outcome.result.attempts,
            "decisions": outcome.decisions,
        })),
        OutputFormat::Text => {
            if !quiet {
                if let Some(decision) = outcome.final_decision() {
                    println!(
                        "Model: {} ({}, {} ms)",
                        decision.model_id(),
                        decision.reason(),
                        outcome.result.latency_ms
                    );
                    if !decision.fallback_chain().is_empty() {
                        println!("Skipped: {}", decision.fallback_chain().join(", "));
                    }
                    println!("Decision: {}", decision.id());
                    println!();
                }
            }
            println!("{}", outcome.result.output);
            Ok(())
        }
    }
}

async fn cmd_score(
    address: &str,
    records: &Path,
    as_of: NaiveDate,
    format: OutputFormat,
    quiet: bool,
) -> anyhow::Result<()> {
    let engine = open_engine(load_records(records)?).await?;
    let result = engine.score(address, as_of).await;
    engine.close().await;
    let result = result?;

    match format {
        OutputFormat::Json => print_json(&serde_json::to_value(&result)?),
        OutputFormat::Text => {
            if quiet {
                println!("{:.1}", result.score());
                return Ok(());
            }
            println!("{}: {:.1}", result.address(), result.score());
            println!("  Id: {}", result.id());
            println!("  As of: {}", result.as_of());
            println!("  Weights epoch: {}", result.weights_epoch());
            println!("  Qualifying comps: {}", result.qualifying_comps());
            if result.recent_sale() {
                println!("  Sold recently: score forced to 0");
            }
            println!("  Contributions:");
            for (feature, value) in result.contributions() {
                println!(
                    "    {:<20} {:>6.3}  (feature {:.3})",
                    feature,
                    value,
                    result.features().get(feature).copied().unwrap_or(0.0)
                );
            }
            Ok(())
        }
    }
}

async fn cmd_score_batch(
    addresses: Vec<String>,
    records: &Path,
    as_of: NaiveDate,
    format: OutputFormat,
    quiet: bool,
) -> anyhow::Result<()> {
    let records = load_records(records)?;
    let addresses = if addresses.is_empty() {
        records.addresses()
    } else {
        addresses
    };
    let engine = open_engine(records).await?;
    let summary: BatchSummary = engine.score_batch(&addresses, as_of).await;
    engine.close().await;

    match format {
        OutputFormat::Json => print_json(&serde_json::to_value(&summary)?),
        OutputFormat::Text => {
            if !quiet {
                for item in &summary.details {
                    match (item.score, &item.error) {
                        (Some(score), _) => println!("  [OK] {:<32} {:>5.1}", item.address, score),
                        (None, Some(error)) => println!("  [!!] {:<32} {}", item.address, error),
                        (None, None) => println!("  [--] {}", item.address),
                    }
                }
            }
            println!(
                "Processed {}: {} scored, {} failed",
                summary.processed, summary.success, summary.failed
            );
            Ok(())
        }
    }
}

async fn cmd_outcome(
    id: Uuid,
    outcome: Outcome,
    format: OutputFormat,
    quiet: bool,
) -> anyhow::Result<()> {
    let engine = open_engine(Arc::new(InMemoryPropertyRecords::new())).await?;
    let record = engine.record_outcome(id, outcome).await;
    engine.close().await;
    let record = record?;

    match format {
        OutputFormat::Json => print_json(&serde_json::to_value(&record)?),
        OutputFormat::Text => {
            if !quiet {
                println!("Recorded {} for {} (seq {})", outcome, id, record.seq);
            }
            Ok(())
        }
    }
}

fn print_run(run: &TrainerRun, format: OutputFormat, quiet: bool) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => print_json(&serde_json::to_value(run)?),
        OutputFormat::Text => {
            match run {
                TrainerRun::Published { epoch, deltas } => {
                    println!("Published weights epoch {}", epoch);
                    if !quiet {
                        for (feature, delta) in deltas {
                            println!("  {:<20} {:+.3}", feature, delta);
                        }
                    }
                }
                TrainerRun::Skipped { reason } => println!("Skipped: {}", reason),
            }
            Ok(())
        }
    }
}

async fn cmd_train(watch: bool, format: OutputFormat, quiet: bool) -> anyhow::Result<()> {
    let engine = open_engine(Arc::new(InMemoryPropertyRecords::new())).await?;

    if !watch {
        let run = engine.train().await;
        engine.close().await;
        return print_run(&run?, format, quiet);
    }

    let cancel = CancellationToken::new();
    let handle = engine.spawn_trainer(cancel.clone());
    if !quiet {
        println!(
            "Trainer running every {}s. Press Ctrl-C to stop.",
            engine.config().trainer.interval_secs
        );
    }
    tokio::signal::ctrl_c().await?;
    info!("Stopping trainer");
    cancel.cancel();
    handle.await?;
    engine.close().await;
    Ok(())
}

fn cmd_models(action: ModelAction, format: OutputFormat) -> anyhow::Result<()> {
    match action {
        ModelAction::List { capability } => {
            let config = Config::load()?;
            let registry = ModelRegistry::new(config.models)?;
            let models = match &capability {
                Some(task) => registry.list(&TaskType::new(task)?),
                None => registry.snapshot().all().to_vec(),
            };

            match format {
                OutputFormat::Json => print_json(&serde_json::to_value(&models)?),
                OutputFormat::Text => {
                    if models.is_empty() {
                        println!("No models found.");
                    }
                    for model in &models {
                        println!(
                            "{:<16} {:<6} prio {:<3} cost {:<6} {}{}",
                            model.id,
                            model.provider.kind(),
                            model.priority,
                            model.cost_weight,
                            model.capabilities.join(","),
                            if model.available { "" } else { "  (unavailable)" }
                        );
                    }
                    Ok(())
                }
            }
        }
    }
}

fn print_weight_set(set: &WeightSet, active: bool) {
    println!(
        "Epoch {}{} ({}, {})",
        set.epoch(),
        if active { " [active]" } else { "" },
        set.origin(),
        set.created_at().format("%Y-%m-%d %H:%M:%S")
    );
}

async fn cmd_weights(action: WeightAction, format: OutputFormat, quiet: bool) -> anyhow::Result<()> {
    let engine = open_engine(Arc::new(InMemoryPropertyRecords::new())).await?;
    let result = weights_action(&engine, action, format, quiet).await;
    engine.close().await;
    result
}

async fn weights_action(
    engine: &DealEngine,
    action: WeightAction,
    format: OutputFormat,
    quiet: bool,
) -> anyhow::Result<()> {
    match action {
        WeightAction::Show => {
            let active = engine.weights().active();
            if format == OutputFormat::Json {
                return print_json(&serde_json::to_value(&*active)?);
            }
            print_weight_set(&active, true);
            for (feature, weight) in active.weights() {
                println!("  {:<20} {:.4}", feature, weight);
            }
            if !active.routing_bias().is_empty() {
                println!("  Routing bias:");
                for (model, bias) in active.routing_bias() {
                    println!("    {:<18} {:+.3}", model, bias);
                }
            }
        }
        WeightAction::History => {
            let active = engine.weights().active().epoch();
            let history = engine.weights().history();
            if format == OutputFormat::Json {
                let sets: Vec<&WeightSet> = history.iter().map(|s| s.as_ref()).collect();
                return print_json(&json!({ "active": active, "history": sets }));
            }
            for set in &history {
                print_weight_set(set, set.epoch() == active);
            }
        }
        WeightAction::Rollback { epoch } => {
            let set = engine.rollback_weights(epoch).await?;
            if format == OutputFormat::Json {
                return print_json(&json!({ "active": set.epoch() }));
            }
            if !quiet {
                println!("Active weights rolled back to epoch {}", set.epoch());
            }
        }
    }
    Ok(())
}

fn cmd_config(action: ConfigAction, format: OutputFormat, quiet: bool) -> anyhow::Result<()> {
    match action {
        ConfigAction::Get { key } => {
            let config = Config::load()?;
            let value = config.get(&key)?;
            println!("{}", value);
        }
        ConfigAction::Set { key, value } => {
            let mut config = Config::load()?;
            config.set(&key, &value)?;
            config.save()?;
            if !quiet {
                println!("Set {} = {}", key, value);
            }
        }
        ConfigAction::List => {
            let config = Config::load()?;
            let items = config.list()?;
            if format == OutputFormat::Json {
                let map: serde_json::Map<String, serde_json::Value> = items
                    .into_iter()
                    .map(|(key, value)| (key, serde_json::Value::String(value)))
                    .collect();
                return print_json(&serde_json::Value::Object(map));
            }
            for (key, value) in items {
                println!("{} = {}", key, value);
            }
        }
        ConfigAction::Reset => {
            Config::default().save()?;
            if !quiet {
                println!("Configuration reset to defaults.");
            }
        }
        ConfigAction::Path => {
            let path = Config::config_path()?;
            println!("{}", path.display());
        }
    }
    Ok(())
}

async fn cmd_doctor(quiet: bool) -> anyhow::Result<()> {
    if !quiet {
        println!("Dealscout Health Check");
        println!("======================");
        println!();
    }

    let mut all_ok = true;

    let config = match Config::load() {
        Ok(config) => {
            if !quiet {
                println!("[OK] Configuration: Valid ({} models)", config.models.len());
            }
            Some(config)
        }
        Err(e) => {
            all_ok = false;
            if !quiet {
                println!("[!!] Configuration: Error - {:#}", e);
            }
            None
        }
    };

    if let Some(config) = &config {
        for model in &config.models {
            if let Provider::OpenAiCompatible { api_key_env, .. } =
                &model.provider
            {
                if std::env::var(api_key_env).is_err() && !quiet {
                    println!("[--] {}: {} not set", model.id, api_key_env);
                }
            }
        }

        match config.database_path() {
            Ok(path) => match Database::open(&path).await {
                Ok(db) => {
                    let healthy = db.health_check().await;
                    db.close().await;
                    match healthy {
                        Ok(()) => {
                            if !quiet {
                                println!("[OK] Database: {}", path.display());
                            }
                        }
                        Err(e) => {
                            all_ok = false;
                            if !quiet {
                                println!("[!!] Database: {}", e);
                            }
                        }
                    }
                }
                Err(e) => {
                    all_ok = false;
                    if !quiet {
                        println!("[!!] Database: {} - {}", path.display(), e);
                    }
                }
            },
            Err(e) => {
                all_ok = false;
                if !quiet {
                    println!("[!!] Database: {:#}", e);
                }
            }
        }
    }

    if !quiet {
        match Config::config_path() {
            Ok(path) if path.exists() => println!("[OK] Config file: {}", path.display()),
            Ok(path) => println!("[--] Config file: {} (using defaults)", path.display()),
            Err(e) => println!("[!!] Config file: {:#}", e),
        }
        println!();
    }

    if all_ok {
        if !quiet {
            println!("All checks passed.");
        }
        Ok(())
    } else {
        Err(anyhow::anyhow!("Health check failed"))
    }
}
