//! # Bharat Worker
//!
//! Runs the CRM's background jobs and exposes the operator commands.
//!
//! Usage:
//!   bharat-worker worker                          # Run scheduled jobs + health gateway
//!   bharat-worker reconcile --tenant <id>         # One-off conversation dedup pass
//!   bharat-worker call enqueue --tenant t --phone +91... --script "..."
//!   bharat-worker call list --status failed
//!   bharat-worker init-db                         # Create the schema and exit

use anyhow::Result;
use bharat_conversations::DedupEngine;
use bharat_conversations::dedup::TRIGGER_OPERATOR;
use bharat_core::types::CallStatus;
use bharat_core::{Clock, CrmConfig, SystemClock};
use bharat_db::CrmDb;
use bharat_scheduler::{
    CallQueue, JobDeps, JobScheduler, LockManager, SchedulerSettings, SqliteLeaseStore, dispatcher_from_config,
    register_all, telephony_from_config,
};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "bharat-worker",
    version,
    about = "📇 Bharat CRM background worker"
)]
struct Cli {
    /// Config file (default: ~/.bharat/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the job scheduler until Ctrl+C
    Worker {
        /// Do not start the health gateway
        #[arg(long)]
        no_gateway: bool,
    },
    /// Merge duplicate conversation threads now
    Reconcile {
        /// Limit the pass to one tenant
        #[arg(short, long)]
        tenant: Option<String>,
    },
    /// Inspect and steer the call queue
    Call {
        #[command(subcommand)]
        action: CallAction,
    },
    /// Create the database schema and exit
    InitDb,
}

#[derive(Subcommand)]
enum CallAction {
    /// Queue an outbound call
    Enqueue {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        phone: String,
        #[arg(long)]
        script: String,
        /// Lower is more urgent
        #[arg(long, default_value = "5")]
        priority: i32,
    },
    /// Re-queue a failed call
    Retry { id: String },
    /// Cancel a queued or failed call
    Cancel { id: String },
    /// List calls
    List {
        #[arg(long)]
        tenant: Option<String>,
        /// queued, in_progress, completed, failed, cancelled
        #[arg(long)]
        status: Option<String>,
    },
}

fn load_config(path: Option<&Path>) -> Result<CrmConfig> {
    let mut config = match path {
        Some(p) => CrmConfig::load_from(p)?,
        None => CrmConfig::load()?,
    };
    config.apply_env_overrides()?;
    config.validate()?;
    Ok(config)
}

fn open_db(config: &CrmConfig) -> Result<(Arc<CrmDb>, PathBuf)> {
    let db_path = PathBuf::from(shellexpand::tilde(&config.database.path).to_string());
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let db = CrmDb::open(&db_path)?;
    Ok((Arc::new(db), db_path))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "bharat=debug,tower_http=debug"
    } else {
        "bharat=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    let config = load_config(cli.config.as_deref())?;
    let (db, db_path) = open_db(&config)?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    match cli.command {
        Commands::InitDb => {
            println!("✅ Database ready at {}", db_path.display());
        }
        Commands::Reconcile { tenant } => {
            let engine = DedupEngine::new(db, clock, config.dedup.default_country.clone());
            let summary = engine.reconcile_all(tenant.as_deref(), TRIGGER_OPERATOR).await?;
            println!("🧹 Reconciliation finished");
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Call { action } => {
            let queue = CallQueue::new(db, clock, config.calls.clone());
            run_call_action(&queue, action)?;
        }
        Commands::Worker { no_gateway } => {
            run_worker(config, db, db_path, clock, no_gateway).await?;
        }
    }
    Ok(())
}

fn run_call_action(queue: &CallQueue, action: CallAction) -> Result<()> {
    match action {
        CallAction::Enqueue {
            tenant,
            phone,
            script,
            priority,
        } => {
            let item = queue.enqueue(&tenant, &phone, &script, priority, None)?;
            println!("📞 Queued call {} to {}", item.id, item.target_phone);
        }
        CallAction::Retry { id } => {
            let item = queue.retry(&id)?;
            println!("🔁 Call {} is {} (attempts {})", item.id, item.status, item.attempts);
        }
        CallAction::Cancel { id } => {
            let item = queue.cancel(&id)?;
            println!("🚫 Call {} is {}", item.id, item.status);
        }
        CallAction::List { tenant, status } => {
            let status = status.map(|s| s.parse::<CallStatus>()).transpose()?;
            let items = queue.list(tenant.as_deref(), status)?;
            if items.is_empty() {
                println!("No calls.");
            }
            for item in items {
                println!(
                    "{}  {:<11}  p{}  {}/{}  {}  {}",
                    item.id,
                    item.status.to_string(),
                    item.priority,
                    item.attempts,
                    queue.policy().max_attempts,
                    item.target_phone,
                    item.last_error.as_deref().unwrap_or("")
                );
            }
        }
    }
    Ok(())
}

async fn run_worker(
    config: CrmConfig,
    db: Arc<CrmDb>,
    db_path: PathBuf,
    clock: Arc<dyn Clock>,
    no_gateway: bool,
) -> Result<()> {
    let lease_store = Arc::new(SqliteLeaseStore::open(&db_path)?);
    let locks = LockManager::new(lease_store, clock.clone());
    let settings = SchedulerSettings::from(&config.scheduler);
    let mut scheduler = JobScheduler::new(locks, db.clone(), clock.clone(), settings);

    let deps = JobDeps {
        db: db.clone(),
        clock,
        dispatcher: dispatcher_from_config(&config.dispatch),
        telephony: telephony_from_config(&config.dispatch),
    };
    let job_names = register_all(&mut scheduler, &config, &deps)?;

    let (stop_tx, stop_rx) = watch::channel(false);

    let gateway = if config.gateway.enabled && !no_gateway {
        let state = bharat_gateway::AppState {
            gateway_config: config.gateway.clone(),
            db: db.clone(),
            node_id: config.scheduler.node_id.clone(),
            job_names,
            start_time: std::time::Instant::now(),
        };
        let stop = stop_rx.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = bharat_gateway::serve(state, stop).await {
                tracing::error!("❌ Health gateway failed: {e}");
            }
        }))
    } else {
        None
    };

    let scheduler = Arc::new(scheduler);
    let running = tokio::spawn(scheduler.run(stop_rx));

    tokio::signal::ctrl_c().await?;
    tracing::info!("🛑 Ctrl+C received");
    stop_tx.send_replace(true);

    running.await?;
    if let Some(handle) = gateway {
        handle.await?;
    }
    Ok(())
}
