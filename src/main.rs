//! Verdict - container-sandboxed algorithm evaluation platform
//!
//! Main entry point: wires configuration, logging, the periodic Docker
//! garbage collector and the queue-runner consumer loop.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use verdict::{Config, ContestStore, EvaluationWorker, QueueRunner, TaskQueue, cleanup};

#[derive(Debug, Parser)]
#[command(name = "verdict", version, about = "Evaluation queue runner")]
struct Cli {
    /// Contest storage root (overrides BASE_DIR)
    #[arg(long)]
    base_dir: Option<PathBuf>,

    /// Task queue file (overrides QUEUE_FILE)
    #[arg(long)]
    queue_file: Option<PathBuf>,

    /// Log file path
    #[arg(long, default_value = "verdict.log")]
    log_file: PathBuf,

    /// Disable the periodic Docker garbage collector
    #[arg(long)]
    no_cleanup: bool,

    /// Hours between Docker garbage collection sweeps
    #[arg(long, default_value_t = 1)]
    cleanup_interval_hours: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    // .env first, so Config::from_env sees it.
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    init_logging(&cli.log_file)?;
    tracing::info!(version = verdict::VERSION, "starting verdict");

    let mut config = Config::from_env();
    if let Some(base_dir) = cli.base_dir {
        config.base_dir = base_dir;
    }
    if let Some(queue_file) = cli.queue_file {
        config.queue_file = queue_file;
    }

    tokio::fs::create_dir_all(&config.base_dir)
        .await
        .with_context(|| format!("failed to create {}", config.base_dir.display()))?;
    tokio::fs::create_dir_all(&config.upload_dir)
        .await
        .with_context(|| format!("failed to create {}", config.upload_dir.display()))?;

    let docker =
        bollard::Docker::connect_with_local_defaults().context("failed to build docker client")?;

    let store = ContestStore::new(&config.base_dir);
    let queue = TaskQueue::new(&config.queue_file);
    let worker = EvaluationWorker::new(docker.clone(), config.clone());
    let runner = QueueRunner::new(queue, store, worker);

    // Crash recovery: anything left RUNNING by a dead process becomes a
    // terminal error before new work starts.
    let downgraded = runner.reconcile_orphans().await?;
    if downgraded > 0 {
        tracing::warn!(downgraded, "downgraded crash-orphaned submissions");
    }

    if !cli.no_cleanup {
        let interval = Duration::from_secs(cli.cleanup_interval_hours.max(1) * 3600);
        tokio::spawn(cleanup::run_periodic(docker, interval));
    }

    tokio::select! {
        _ = runner.run() => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("ctrl-c received, shutting down");
        }
    }

    Ok(())
}

/// Initialize logging to a file and stdout.
fn init_logging(log_file: &PathBuf) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let file = std::fs::File::options()
        .create(true)
        .append(true)
        .open(log_file)
        .with_context(|| format!("failed to open log file {}", log_file.display()))?;

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(file)
                .with_ansi(false)
                .with_target(true),
        )
        .with(fmt::layer().with_target(false))
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("verdict=info,warn")),
        )
        .init();

    Ok(())
}
