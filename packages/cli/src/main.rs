//! Command-line front end for the prospect research queue.
//!
//! Every invocation starts a queue manager on the configured data directory,
//! which restores interrupted batches first. Commands that run jobs stream
//! progress until the batch stops; Ctrl-C pauses the batch so it can be
//! resumed later.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use actors::{ManagerConfig, QueueManager, RunnerConfig};
use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use queue_core::{BatchId, BatchOptions, JobId, QueueEvent};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "prospect-queue")]
#[command(about = "Batch queue for domain prospect research")]
struct Cli {
    #[command(flatten)]
    settings: Settings,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Settings {
    /// Directory holding batch snapshots
    #[arg(long, env = "PROSPECT_QUEUE_DATA_DIR", default_value = store::DEFAULT_DATA_DIR)]
    data_dir: PathBuf,

    /// Working directory of the research process
    #[arg(long, env = "PROSPECT_QUEUE_PROJECT_ROOT", default_value = ".")]
    project_root: PathBuf,

    /// Maximum research processes running at once
    #[arg(long, env = "PROSPECT_QUEUE_MAX_CONCURRENT", default_value_t = 3)]
    max_concurrent: usize,

    /// Minimum delay between two process starts, in milliseconds
    #[arg(long, env = "PROSPECT_QUEUE_RATE_LIMIT_MS", default_value_t = 2000)]
    rate_limit_ms: u64,

    /// Per-attempt timeout, in seconds
    #[arg(long, env = "PROSPECT_QUEUE_TIMEOUT_SECS", default_value_t = 600)]
    timeout_secs: u64,

    /// Automatic retries after a failed attempt
    #[arg(long, env = "PROSPECT_QUEUE_MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a batch from domains given as arguments and/or a file (one per line)
    Submit {
        domains: Vec<String>,
        #[arg(long)]
        file: Option<PathBuf>,
        /// Create the batch without starting it
        #[arg(long)]
        no_start: bool,
    },

    /// Show a batch with its jobs
    Status { batch_id: String },

    /// List all batches
    List,

    /// Resume a paused batch (or start a created one) and follow it
    Resume { batch_id: String },

    /// Re-run the failed jobs of a batch and follow it
    Retry { batch_id: String },

    /// Cancel a batch
    Cancel { batch_id: String },

    /// Delete a batch and its stored results
    Delete { batch_id: String },

    /// Print the stored research results of a batch
    Results { batch_id: String },
}

impl Settings {
    fn manager_config(&self) -> ManagerConfig {
        let runner = RunnerConfig::default()
            .with_project_root(&self.project_root)
            .with_max_concurrent(self.max_concurrent)
            .with_rate_limit(Duration::from_millis(self.rate_limit_ms))
            .with_timeout(Duration::from_secs(self.timeout_secs))
            .with_max_retries(self.max_retries);

        ManagerConfig::default()
            .with_data_dir(&self.data_dir)
            .with_runner(runner)
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn parse_batch_id(raw: &str) -> Result<BatchId> {
    BatchId::parse(raw).with_context(|| format!("invalid batch id: {raw}"))
}

async fn read_domains(mut domains: Vec<String>, file: Option<PathBuf>) -> Result<Vec<String>> {
    if let Some(path) = file {
        let contents = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        domains.extend(
            contents
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .map(String::from),
        );
    }
    Ok(domains)
}

/// Whether an event concerns the followed batch. Job events carry no batch
/// id, so they are matched against the batch's job ids.
fn concerns(event: &QueueEvent, batch_id: BatchId, jobs: &HashSet<JobId>) -> bool {
    match (event.batch_id(), event.job_id()) {
        (Some(id), _) => id == batch_id,
        (None, Some(job_id)) => jobs.contains(&job_id),
        (None, None) => true,
    }
}

/// Print events for `batch_id` until it completes, is cancelled or deleted.
/// Ctrl-C pauses the batch instead.
async fn follow(manager: &QueueManager, batch_id: BatchId) -> Result<()> {
    let mut rx = manager.subscribe();

    let Some(report) = manager.get_batch_status(batch_id).await? else {
        bail!("batch {batch_id} not found");
    };
    // The batch may already be done before we subscribed.
    if report.batch.status.is_terminal() {
        return print_json(&report.batch.summary());
    }
    let jobs: HashSet<JobId> = report.jobs.iter().map(|job| job.id).collect();

    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Ok(event) => {
                    if !concerns(&event, batch_id, &jobs) {
                        continue;
                    }
                    match &event {
                        QueueEvent::JobLog { .. } => tracing::debug!("{}", event.description()),
                        QueueEvent::JobStderr { .. } => tracing::debug!("{}", event.description()),
                        _ => println!("{}", event.description()),
                    }
                    if matches!(
                        event,
                        QueueEvent::BatchCompleted { .. }
                            | QueueEvent::BatchCancelled { .. }
                            | QueueEvent::BatchDeleted { .. }
                    ) {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Skipped {} events", skipped);
                }
                Err(RecvError::Closed) => bail!("queue manager stopped"),
            },
            _ = tokio::signal::ctrl_c() => {
                if manager.pause_batch(batch_id).await? {
                    println!("Paused batch {batch_id}; run `prospect-queue resume {batch_id}` to continue");
                }
                return Ok(());
            }
        }
    }

    if let Some(report) = manager.get_batch_status(batch_id).await? {
        print_json(&report.batch.summary())?;
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let (manager, handle) = QueueManager::start(cli.settings.manager_config()).await?;

    match cli.command {
        Commands::Submit {
            domains,
            file,
            no_start,
        } => {
            let domains = read_domains(domains, file).await?;
            let options = BatchOptions::default()
                .with_max_concurrent(cli.settings.max_concurrent)
                .with_auto_start(!no_start);
            let created = manager.create_batch(domains, options).await?;
            print_json(&created)?;
            if !no_start {
                follow(&manager, created.batch_id).await?;
            }
        }

        Commands::Status { batch_id } => {
            let batch_id = parse_batch_id(&batch_id)?;
            match manager.get_batch_status(batch_id).await? {
                Some(report) => print_json(&report)?,
                None => bail!("batch {batch_id} not found"),
            }
        }

        Commands::List => print_json(&manager.list_batches().await?)?,

        Commands::Resume { batch_id } => {
            let batch_id = parse_batch_id(&batch_id)?;
            if !manager.resume_batch(batch_id).await? {
                manager.start_batch(batch_id).await?;
            }
            follow(&manager, batch_id).await?;
        }

        Commands::Retry { batch_id } => {
            let batch_id = parse_batch_id(&batch_id)?;
            let count = manager.retry_failed(batch_id).await?;
            println!("Retrying {count} failed job(s)");
            if count > 0 {
                follow(&manager, batch_id).await?;
            }
        }

        Commands::Cancel { batch_id } => {
            let batch_id = parse_batch_id(&batch_id)?;
            if manager.cancel_batch(batch_id).await? {
                println!("Cancelled batch {batch_id}");
            } else {
                println!("Batch {batch_id} is not active");
            }
        }

        Commands::Delete { batch_id } => {
            let batch_id = parse_batch_id(&batch_id)?;
            manager.delete_batch(batch_id).await?;
            println!("Deleted batch {batch_id}");
        }

        Commands::Results { batch_id } => {
            let batch_id = parse_batch_id(&batch_id)?;
            print_json(&manager.get_batch_results(batch_id).await?)?;
        }
    }

    manager.shutdown();
    handle.await.context("queue manager task failed")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    run(Cli::parse()).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_events_of_other_batches_are_filtered_out() {
        let followed = BatchId::new();
        let mine = JobId::new();
        let jobs = HashSet::from([mine]);

        let own = QueueEvent::JobCompleted {
            job_id: mine,
            duration: 10,
        };
        let foreign = QueueEvent::JobStarted {
            job_id: JobId::new(),
            domain: "other.com".to_string(),
        };
        assert!(concerns(&own, followed, &jobs));
        assert!(!concerns(&foreign, followed, &jobs));
    }

    #[test]
    fn batch_events_match_on_batch_id() {
        let followed = BatchId::new();
        let jobs = HashSet::new();

        assert!(concerns(&QueueEvent::BatchPaused { batch_id: followed }, followed, &jobs));
        assert!(!concerns(
            &QueueEvent::BatchPaused {
                batch_id: BatchId::new()
            },
            followed,
            &jobs
        ));
        assert!(concerns(&QueueEvent::AllJobsCancelled, followed, &jobs));
    }
}
