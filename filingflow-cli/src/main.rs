//! Filingflow operator CLI: inspect and manage the dead-letter store.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tracing::info;
use uuid::Uuid;

use filingflow::config::PipelineConfig;
use filingflow::dlq::{DeadLetterFilter, DeadLetterStatus, DeadLetterStore};
use filingflow::metrics::FacadeMetrics;
use filingflow::observability::{init_tracing, LogFormat};
use filingflow::operator::DeadLetterOperator;
use filingflow::store::SqliteSessionFactory;

#[derive(Parser, Debug)]
#[command(name = "filingflow")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a TOML configuration file.
    #[arg(short, long, env = "FILINGFLOW_CONFIG")]
    config: Option<PathBuf>,

    /// Database URL, overriding the configuration.
    #[arg(long)]
    database_url: Option<String>,

    /// Log output format (plain, json).
    #[arg(long, default_value = "plain")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Command {
    /// List dead letters, newest first.
    List {
        /// Only entries in this status (pending, requeued, completed).
        #[arg(long)]
        status: Option<DeadLetterStatus>,
        /// Only entries for this task.
        #[arg(long)]
        task: Option<String>,
        /// Maximum rows; defaults to the configured list limit.
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Show one dead letter as JSON.
    Show {
        /// Entry id.
        id: Uuid,
    },
    /// Mark a dead letter requeued. A worker pool's requeue sweep
    /// dispatches it once due.
    Requeue {
        /// Entry id.
        id: Uuid,
        /// When the task should run again (RFC 3339). Defaults to now.
        #[arg(long)]
        next_run_at: Option<DateTime<Utc>>,
    },
    /// Mark a dead letter completed.
    Complete {
        /// Entry id.
        id: Uuid,
    },
    /// Republish the dead-letter depth gauge and print the counts.
    RefreshMetrics,
    /// Create the database schema.
    InitDb,
}

fn load_config(args: &Args) -> anyhow::Result<PipelineConfig> {
    let config = match &args.config {
        Some(path) => PipelineConfig::from_file(path)?,
        None => PipelineConfig::default(),
    };
    let mut config = config.with_env_overrides()?;
    if let Some(url) = &args.database_url {
        config.database.url.clone_from(url);
    }
    Ok(config)
}

async fn run(args: Args) -> anyhow::Result<String> {
    let config = load_config(&args)?;
    let sessions = Arc::new(
        SqliteSessionFactory::connect(&config.database)
            .await
            .with_context(|| format!("failed to open {}", config.database.url))?,
    );
    let store = DeadLetterStore::from_config(&config.dead_letter, Arc::new(FacadeMetrics));
    let list_limit = store.list_limit();
    let operator = DeadLetterOperator::new(sessions.clone(), store);

    let output = match args.command {
        Command::List {
            status,
            task,
            limit,
        } => {
            let mut filter = DeadLetterFilter::new(limit.unwrap_or(list_limit));
            if let Some(status) = status {
                filter = filter.with_status(status);
            }
            if let Some(task) = task {
                filter = filter.with_task_name(task);
            }
            operator.list(filter).await?
        }
        Command::Show { id } => operator.show(id).await?,
        Command::Requeue { id, next_run_at } => operator.requeue(id, next_run_at).await?,
        Command::Complete { id } => operator.complete(id).await?,
        Command::RefreshMetrics => operator.refresh_metrics().await?,
        Command::InitDb => {
            sessions.migrate().await?;
            format!("Schema ready at {}", config.database.url)
        }
    };
    Ok(output)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.log_format);
    info!(command = ?args.command, "filingflow starting");

    match run(args).await {
        Ok(output) => {
            println!("{output}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
