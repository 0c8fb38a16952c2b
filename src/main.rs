//! Policy automaton: scheduler and worker daemons for signed recurring policies.
//!
//! Usage:
//!   policy-automaton init        Write a default config
//!   policy-automaton scheduler   Run the trigger scheduler
//!   policy-automaton worker      Run the task worker
//!   policy-automaton run         Run scheduler and worker together
//!   policy-automaton status      Show triggers, recent transactions and queue depth

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use policy_automaton::auth::TokenIssuer;
use policy_automaton::config::{self, AutomationConfig, Role};
use policy_automaton::pipeline::{CosignClient, PipelineSettings, WorkerService};
use policy_automaton::plugin::PluginRegistry;
use policy_automaton::queue::{SqliteTaskQueue, TaskQueue, TaskServer, TYPE_KEY_SIGN, TYPE_PLUGIN_TRANSACTION};
use policy_automaton::scheduler::TriggerScheduler;
use policy_automaton::state::{self, tasks, transactions, triggers, Database, SharedDb};
use policy_automaton::sync::HttpSyncer;
use policy_automaton::types::{TransactionStatus, TriggerStatus};

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "policy-automaton")]
#[command(version)]
#[command(about = "Runs user-signed recurring transaction policies")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the home directory holding automation.toml.
    #[arg(long)]
    home: Option<String>,

    /// Log level (debug, info, warn, error). RUST_LOG takes precedence.
    #[arg(long)]
    log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a default config if none exists.
    Init {
        /// Deployment role (plugin or verifier).
        #[arg(long, default_value = "plugin")]
        role: String,
    },

    /// Run the trigger scheduler.
    Scheduler,

    /// Run the task worker.
    Worker,

    /// Run scheduler and worker in one process.
    Run,

    /// Show triggers, recent transactions and queue depth.
    Status,
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let home_dir = match &cli.home {
        Some(home) => PathBuf::from(shellexpand::tilde(home).into_owned()),
        None => config::default_home_dir(),
    };
    let config_path = home_dir.join(config::CONFIG_FILE);
    let cfg = config::load_config(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    let level = cli.log_level.clone().unwrap_or_else(|| cfg.log_level.clone());
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Init { role } => cmd_init(&config_path, &role),
        Commands::Scheduler => serve(cfg, true, false).await,
        Commands::Worker => serve(cfg, false, true).await,
        Commands::Run => serve(cfg, true, true).await,
        Commands::Status => cmd_status(&cfg).await,
    }
}

// ---------------------------------------------------------------------------
// Command implementations
// ---------------------------------------------------------------------------

fn cmd_init(config_path: &Path, role: &str) -> Result<()> {
    if config_path.exists() {
        println!(
            "{} Config already exists at {}",
            "!!!".yellow().bold(),
            config_path.display()
        );
        return Ok(());
    }

    let role = match role {
        "plugin" => Role::Plugin,
        "verifier" => Role::Verifier,
        other => anyhow::bail!("Unknown role '{other}', expected plugin or verifier"),
    };
    let cfg = AutomationConfig {
        role,
        ..Default::default()
    };
    config::save_config(&cfg, config_path)?;
    println!(
        "{} Wrote {} config to {}",
        ">>>".green().bold(),
        role,
        config_path.display()
    );
    Ok(())
}

async fn serve(cfg: AutomationConfig, with_scheduler: bool, with_worker: bool) -> Result<()> {
    let db = open_db(&cfg)?;
    let queue: Arc<dyn TaskQueue> = Arc::new(SqliteTaskQueue::new(db.clone()));
    // Concrete plugins are registered by the embedding application.
    let plugins = PluginRegistry::new();

    println!(
        "{} Starting {} (scheduler: {}, worker: {}, plugins: {})",
        ">>>".green().bold(),
        cfg.role,
        with_scheduler,
        with_worker,
        plugins.types().len(),
    );

    let cancel = CancellationToken::new();
    let mut handles: Vec<(&str, JoinHandle<()>)> = Vec::new();

    if with_scheduler {
        let scheduler = TriggerScheduler::new(db.clone(), queue.clone(), &cfg.queue_name, cfg.scheduler_tick());
        let token = cancel.clone();
        handles.push((
            "scheduler",
            tokio::spawn(async move {
                if let Err(e) = scheduler.run(token).await {
                    error!("Trigger scheduler error: {e:#}");
                }
            }),
        ));
    }

    if with_worker {
        let server = build_task_server(&cfg, db.clone(), queue.clone(), plugins.clone())?;
        let token = cancel.clone();
        handles.push((
            "worker",
            tokio::spawn(async move {
                if let Err(e) = server.run(token).await {
                    error!("Task server error: {e:#}");
                }
            }),
        ));
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    println!("\n{} Shutting down gracefully...", "<<<".red().bold());
    cancel.cancel();

    let shutdown_timeout = tokio::time::Duration::from_secs(30);
    let joined = tokio::time::timeout(shutdown_timeout, async {
        for (name, handle) in handles {
            if let Err(e) = handle.await {
                warn!("{name} task join error: {e}");
            }
        }
    })
    .await;
    if joined.is_err() {
        warn!("Shutdown timed out after {}s", shutdown_timeout.as_secs());
    }

    info!("Shutdown complete");
    Ok(())
}

fn build_task_server(
    cfg: &AutomationConfig,
    db: SharedDb,
    queue: Arc<dyn TaskQueue>,
    plugins: PluginRegistry,
) -> Result<TaskServer> {
    // Pipeline handlers wait on key:sign tasks, so signing gets its own slots.
    let mut server = TaskServer::new(
        db.clone(),
        &cfg.queue_name,
        cfg.worker_concurrency,
        cfg.task_poll_interval(),
    )
    .reserve(TYPE_KEY_SIGN, cfg.worker_concurrency);

    if cfg.role == Role::Plugin {
        let syncer = Arc::new(HttpSyncer::from_config(cfg)?);
        let cosign = CosignClient::new(&cfg.counterpart_url, cfg.sync_timeout())?;
        let tokens = TokenIssuer::from_config(&cfg.token_secret, cfg.token_ttl());
        let worker = WorkerService::new(
            db,
            queue,
            plugins,
            syncer,
            cosign,
            tokens,
            PipelineSettings::from_config(cfg),
        );
        server = server.handle(TYPE_PLUGIN_TRANSACTION, Arc::new(worker));
    }

    // The signing engine is linked in by the embedding application.
    warn!(
        "No signing engine linked; {} tasks will be archived",
        TYPE_KEY_SIGN
    );
    Ok(server)
}

async fn cmd_status(cfg: &AutomationConfig) -> Result<()> {
    let db = open_db(cfg)?;
    let db = db.lock().await;

    let all_triggers = triggers::list(db.conn())?;
    let recent = transactions::list_recent(db.conn(), 10)?;
    let queue_counts = tasks::count_by_state(db.conn(), &cfg.queue_name)?;

    println!();
    println!("{}", "=== Policy Automaton Status ===".bold());
    println!();
    println!("  {}:  {}", "Role".bold(), cfg.role);
    println!("  {}:  {}", "Database".bold(), cfg.resolved_db_path());
    println!();
    println!("  {} ({}):", "Triggers".bold(), all_triggers.len());
    for t in &all_triggers {
        let last = t
            .last_execution
            .map(|ts| ts.to_rfc3339())
            .unwrap_or_else(|| "never".into());
        println!(
            "    {}  {} x{}  {}  last: {}",
            t.policy_id,
            t.frequency,
            t.interval,
            colorize_trigger(t.status),
            last
        );
    }
    println!();
    println!("  {}:", "Recent transactions".bold());
    for tx in &recent {
        println!(
            "    {}  {}  {}",
            tx.updated_at.format("%Y-%m-%d %H:%M:%S"),
            colorize_tx(tx.status),
            tx.tx_hash
        );
    }
    println!();
    println!("  {} ({}):", "Queue".bold(), cfg.queue_name);
    for (state, count) in &queue_counts {
        println!("    {state:<10} {count}");
    }
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn open_db(cfg: &AutomationConfig) -> Result<SharedDb> {
    let db_path = cfg.resolved_db_path();
    let db_path = Path::new(&db_path);
    let db = Database::open(db_path)
        .with_context(|| format!("Failed to open database at {}", db_path.display()))?;
    Ok(state::shared(db))
}

fn colorize_trigger(status: TriggerStatus) -> String {
    match status {
        TriggerStatus::Pending => "PENDING".green().to_string(),
        TriggerStatus::Running => "RUNNING".yellow().to_string(),
    }
}

fn colorize_tx(status: TransactionStatus) -> String {
    let label = status.as_str();
    match status {
        TransactionStatus::Mined => label.green().to_string(),
        TransactionStatus::Signed | TransactionStatus::Pending => label.yellow().to_string(),
        TransactionStatus::SigningFailed | TransactionStatus::Rejected => label.red().to_string(),
    }
}
