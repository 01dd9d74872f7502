//! Shared helpers for queue manager tests.
//!
//! Jobs run real `sh` scripts inside a temporary project root; the domain is
//! passed as `$1`.

#![allow(dead_code, clippy::disallowed_methods)]

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use actors::{CommandTemplate, DOMAIN_PLACEHOLDER, ManagerConfig, QueueManager, RunnerConfig};
use queue_core::{BatchId, BatchStatus, BatchStatusReport, JobId, QueueEvent};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

pub const WAIT: Duration = Duration::from_secs(15);

/// Writes `prospects/<domain with dashes>/research-data.json` like the real research process.
pub const WRITE_RESULT: &str = r#"dir="prospects/$(printf %s "$1" | tr . -)"; mkdir -p "$dir"; printf '{"domain":"%s","score":7}' "$1" > "$dir/research-data.json""#;

pub fn script(body: &str) -> CommandTemplate {
    CommandTemplate::new("sh", ["-c", body, "sh", DOMAIN_PLACEHOLDER])
}

/// Fast runner settings: no rate limit, no retries, short backoff.
pub fn runner_config(project_root: &Path, body: &str) -> RunnerConfig {
    RunnerConfig::default()
        .with_project_root(project_root)
        .with_rate_limit(Duration::ZERO)
        .with_max_retries(0)
        .with_timeout(Duration::from_secs(10))
        .with_retry_backoff(Duration::from_millis(10))
        .with_command(script(body))
}

pub struct Harness {
    pub manager: QueueManager,
    pub handle: JoinHandle<()>,
    pub data_dir: tempfile::TempDir,
    pub project: tempfile::TempDir,
}

impl Harness {
    /// Start a manager whose jobs run `body`; `tune` adjusts the runner settings.
    pub async fn start(body: &str, tune: impl FnOnce(RunnerConfig) -> RunnerConfig) -> Self {
        let data_dir = tempfile::tempdir().unwrap();
        let project = tempfile::tempdir().unwrap();
        let runner = tune(runner_config(project.path(), body));
        let (manager, handle) = start_manager(data_dir.path(), runner).await;
        Self {
            manager,
            handle,
            data_dir,
            project,
        }
    }

    pub async fn status(&self, batch_id: BatchId) -> BatchStatusReport {
        self.manager
            .get_batch_status(batch_id)
            .await
            .unwrap()
            .expect("batch exists")
    }
}

pub async fn start_manager(data_dir: &Path, runner: RunnerConfig) -> (QueueManager, JoinHandle<()>) {
    let config = ManagerConfig::default()
        .with_data_dir(data_dir)
        .with_runner(runner);
    QueueManager::start(config).await.unwrap()
}

/// Receive events until one matches, failing the test after [`WAIT`].
pub async fn next_matching<F>(rx: &mut broadcast::Receiver<QueueEvent>, mut pred: F) -> QueueEvent
where
    F: FnMut(&QueueEvent) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Receive every event up to and including the completion of `batch_id`.
pub async fn collect_until_complete(
    rx: &mut broadcast::Receiver<QueueEvent>,
    batch_id: BatchId,
) -> Vec<QueueEvent> {
    let mut events = Vec::new();
    next_matching(rx, |event| {
        events.push(event.clone());
        matches!(event, QueueEvent::BatchCompleted { batch_id: id, .. } if *id == batch_id)
    })
    .await;
    events
}

/// Poll the batch until it reaches `status`.
pub async fn wait_for_status(
    manager: &QueueManager,
    batch_id: BatchId,
    status: BatchStatus,
) -> BatchStatusReport {
    tokio::time::timeout(WAIT, async {
        loop {
            if let Some(report) = manager.get_batch_status(batch_id).await.unwrap() {
                if report.batch.status == status {
                    return report;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("batch never reached the expected status")
}

/// Domain of every started job, keyed by job id.
pub fn started_domains(events: &[QueueEvent]) -> HashMap<JobId, String> {
    events
        .iter()
        .filter_map(|event| match event {
            QueueEvent::JobStarted { job_id, domain } => Some((*job_id, domain.clone())),
            _ => None,
        })
        .collect()
}

/// Position of the first event matching `pred`.
pub fn position(events: &[QueueEvent], pred: impl Fn(&QueueEvent) -> bool) -> usize {
    events.iter().position(pred).expect("event not found")
}
