use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use bigdata_director::config::{AgentConfig, ConfigSource, TomlConfigSource};
use bigdata_director::endpoint::EndpointRegistry;
use bigdata_director::ledger::{JobId, JobLedger, SqliteLedger};
use bigdata_director::node::Node;
use bigdata_director::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "bigdata-director")]
#[command(version)]
#[command(about = "Matches grid jobs to big-data clusters, submits them and follows them to completion")]
#[command(propagate_version = true)]
struct Args {
    /// Agent configuration file (TOML)
    #[arg(long, short = 'c', global = true, default_value = "bigdata-director.toml")]
    config: PathBuf,

    /// Log filter, used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the scheduler and monitor loops until SIGTERM/SIGINT
    Run,

    /// Run a single scheduler cycle and wait for its submissions
    ScheduleOnce,

    /// Run a single monitor cycle
    MonitorOnce,

    /// Validate the configuration and list the endpoints that would load
    CheckConfig {
        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,
    },

    /// Show the status history of a job from the SQLite ledger
    History {
        /// Job id
        #[arg(long)]
        job: JobId,

        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,
    },
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// Output Types
// =============================================================================

#[derive(Serialize)]
struct EndpointOutput {
    name: String,
    pool: String,
    name_node: String,
    site: String,
    software: String,
    capacity: u32,
    driver: Option<String>,
}

#[derive(Serialize)]
struct HistoryItem {
    history_id: u64,
    status: String,
    last_update: String,
    backend_id: String,
    error: String,
}

// =============================================================================
// Command Handlers
// =============================================================================

fn init_logging(level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();
}

async fn handle_run(config: AgentConfig, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let node = Node::from_file(config, path)?;
    let shutdown = install_shutdown_handler();
    node.run(shutdown).await?;
    Ok(())
}

async fn handle_schedule_once(
    config: AgentConfig,
    path: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    let node = Node::from_file(config, path)?;
    let scheduler = node.scheduler(CancellationToken::new());
    let report = scheduler.run_once().await;
    scheduler.shutdown().await;
    println!("{}", serde_json::to_string_pretty(&serde_json::json!({
        "endpoints": report.endpoints,
        "full": report.full,
        "pulled": report.pulled,
        "dispatched": report.dispatched,
        "rejected": report.rejected,
        "released": report.released,
        "disabled": report.disabled,
    }))?);
    Ok(())
}

async fn handle_monitor_once(
    config: AgentConfig,
    path: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    let node = Node::from_file(config, path)?;
    let report = node.monitor().run_once().await;
    println!("{}", serde_json::to_string_pretty(&serde_json::json!({
        "checked": report.checked,
        "waiting": report.waiting,
        "orphaned": report.orphaned,
        "transitions": report.transitions,
        "finished": report.finished,
        "resubmitted": report.resubmitted,
        "stalled": report.stalled,
        "unacknowledged": report.unacknowledged,
    }))?);
    Ok(())
}

fn handle_check_config(
    config: &AgentConfig,
    path: &Path,
    output: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let source: Arc<dyn ConfigSource> = Arc::new(TomlConfigSource::open(path));
    let registry = EndpointRegistry::new(source, config.scheduler.endpoints_section.clone());
    let snapshot = registry.reload(&config.scheduler.running_endpoints())?;

    let drivers = bigdata_director::driver::DriverTable::standard_keys();
    let endpoints: Vec<EndpointOutput> = snapshot
        .iter()
        .map(|e| {
            let key = e.driver_key();
            EndpointOutput {
                name: e.name.clone(),
                pool: e.pool.clone(),
                name_node: e.name_node.clone(),
                site: e.site.clone(),
                software: format!(
                    "{} {} {} {}",
                    e.software, e.software_version, e.language.name, e.language.version
                ),
                capacity: e.capacity,
                driver: drivers.contains(&key).then(|| key.to_string()),
            }
        })
        .collect();

    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&endpoints)?),
        OutputFormat::Table => {
            println!(
                "{:<12} {:<10} {:<24} {:<28} {:<5} DRIVER",
                "ENDPOINT", "POOL", "NAME NODE", "SOFTWARE", "SLOTS"
            );
            println!("{}", "-".repeat(100));
            for e in &endpoints {
                println!(
                    "{:<12} {:<10} {:<24} {:<28} {:<5} {}",
                    e.name,
                    e.pool,
                    e.name_node,
                    e.software,
                    e.capacity,
                    e.driver.as_deref().unwrap_or("none (jobs will fail)")
                );
            }
            let requested = config.scheduler.running_endpoints().len();
            if requested != endpoints.len() {
                println!();
                println!(
                    "{} of {} configured endpoints skipped, see log for details",
                    requested - endpoints.len(),
                    requested
                );
            }
        }
    }
    Ok(())
}

fn handle_history(
    config: &AgentConfig,
    job: JobId,
    output: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let Some(db) = &config.ledger.path else {
        return Err("ledger.path is not set, there is no persisted history".into());
    };
    let ledger = SqliteLedger::open(db)?;
    let items: Vec<HistoryItem> = ledger
        .history(job)?
        .into_iter()
        .map(|r| HistoryItem {
            history_id: r.history_id,
            status: r.entry.status.to_string(),
            last_update: r.entry.last_update.to_rfc3339(),
            backend_id: r.entry.backend_id,
            error: r.entry.error_message,
        })
        .collect();

    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&items)?),
        OutputFormat::Table => {
            if items.is_empty() {
                println!("No history for job {}.", job);
                return Ok(());
            }
            println!("{:<8} {:<10} {:<34} {:<28} ERROR", "ID", "STATUS", "UPDATED", "BACKEND ID");
            println!("{}", "-".repeat(100));
            for item in &items {
                println!(
                    "{:<8} {:<10} {:<34} {:<28} {}",
                    item.history_id,
                    item.status,
                    item.last_update,
                    if item.backend_id.is_empty() { "-" } else { item.backend_id.as_str() },
                    item.error
                );
            }
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_logging(&args.log_level);

    let config = AgentConfig::from_file(&args.config)?;

    match args.command {
        Commands::Run => handle_run(config, &args.config).await?,
        Commands::ScheduleOnce => handle_schedule_once(config, &args.config).await?,
        Commands::MonitorOnce => handle_monitor_once(config, &args.config).await?,
        Commands::CheckConfig { output } => handle_check_config(&config, &args.config, &output)?,
        Commands::History { job, output } => handle_history(&config, job, &output)?,
    }

    Ok(())
}
