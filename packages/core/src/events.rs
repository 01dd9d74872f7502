//! Lifecycle notifications published by the runner and the queue manager.

use serde::{Deserialize, Serialize};

use crate::{BatchId, JobId};

/// Events emitted by the batch queue.
///
/// The `event` tag carries the notification name consumers subscribe to
/// (`job:start`, `batch:complete`, ...); payload keys are camelCase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all_fields = "camelCase")]
pub enum QueueEvent {
    // Job events
    /// A subprocess was spawned for a job.
    #[serde(rename = "job:start")]
    JobStarted { job_id: JobId, domain: String },
    /// A line of subprocess stdout.
    #[serde(rename = "job:log")]
    JobLog { job_id: JobId, text: String },
    /// Best-effort research phase inferred from stdout.
    #[serde(rename = "job:phase")]
    JobPhase { job_id: JobId, phase: u8, name: String },
    /// A line of subprocess stderr.
    #[serde(rename = "job:error")]
    JobStderr { job_id: JobId, text: String },
    /// A subprocess exited with status 0.
    #[serde(rename = "job:complete")]
    JobCompleted { job_id: JobId, duration: u64 },
    /// An attempt failed (non-zero exit, spawn error, timeout or cancellation).
    #[serde(rename = "job:failed")]
    JobFailed { job_id: JobId, error: String },
    /// A retry attempt is about to start after `delay` milliseconds.
    #[serde(rename = "job:retry")]
    JobRetry { job_id: JobId, attempt: u32, delay: u64 },
    /// An attempt failed and another one will follow.
    #[serde(rename = "job:retrying")]
    JobRetrying {
        job_id: JobId,
        attempt: u32,
        error: String,
    },
    /// A running subprocess was force-terminated.
    #[serde(rename = "job:cancelled")]
    JobCancelled { job_id: JobId },
    /// Every running subprocess was force-terminated.
    #[serde(rename = "jobs:cancelled-all")]
    AllJobsCancelled,

    // Batch events
    #[serde(rename = "batch:created")]
    BatchCreated { batch_id: BatchId, total_jobs: usize },
    #[serde(rename = "batch:started")]
    BatchStarted { batch_id: BatchId },
    #[serde(rename = "batch:paused")]
    BatchPaused { batch_id: BatchId },
    #[serde(rename = "batch:resumed")]
    BatchResumed { batch_id: BatchId },
    /// Failed jobs were reset and re-queued.
    #[serde(rename = "batch:retrying")]
    BatchRetrying { batch_id: BatchId, count: usize },
    #[serde(rename = "batch:cancelled")]
    BatchCancelled { batch_id: BatchId },
    #[serde(rename = "batch:complete")]
    BatchCompleted {
        batch_id: BatchId,
        total_jobs: usize,
        completed_jobs: usize,
        failed_jobs: usize,
    },
    #[serde(rename = "batch:deleted")]
    BatchDeleted { batch_id: BatchId },
}

impl QueueEvent {
    /// The notification name, identical to the serialized `event` tag.
    pub fn name(&self) -> &'static str {
        match self {
            QueueEvent::JobStarted { .. } => "job:start",
            QueueEvent::JobLog { .. } => "job:log",
            QueueEvent::JobPhase { .. } => "job:phase",
            QueueEvent::JobStderr { .. } => "job:error",
            QueueEvent::JobCompleted { .. } => "job:complete",
            QueueEvent::JobFailed { .. } => "job:failed",
            QueueEvent::JobRetry { .. } => "job:retry",
            QueueEvent::JobRetrying { .. } => "job:retrying",
            QueueEvent::JobCancelled { .. } => "job:cancelled",
            QueueEvent::AllJobsCancelled => "jobs:cancelled-all",
            QueueEvent::BatchCreated { .. } => "batch:created",
            QueueEvent::BatchStarted { .. } => "batch:started",
            QueueEvent::BatchPaused { .. } => "batch:paused",
            QueueEvent::BatchResumed { .. } => "batch:resumed",
            QueueEvent::BatchRetrying { .. } => "batch:retrying",
            QueueEvent::BatchCancelled { .. } => "batch:cancelled",
            QueueEvent::BatchCompleted { .. } => "batch:complete",
            QueueEvent::BatchDeleted { .. } => "batch:deleted",
        }
    }

    /// Get the batch ID associated with this event, if any.
    pub fn batch_id(&self) -> Option<BatchId> {
        match self {
            QueueEvent::BatchCreated { batch_id, .. }
            | QueueEvent::BatchStarted { batch_id }
            | QueueEvent::BatchPaused { batch_id }
            | QueueEvent::BatchResumed { batch_id }
            | QueueEvent::BatchRetrying { batch_id, .. }
            | QueueEvent::BatchCancelled { batch_id }
            | QueueEvent::BatchCompleted { batch_id, .. }
            | QueueEvent::BatchDeleted { batch_id } => Some(*batch_id),
            _ => None,
        }
    }

    /// Get the job ID associated with this event, if any.
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            QueueEvent::JobStarted { job_id, .. }
            | QueueEvent::JobLog { job_id, .. }
            | QueueEvent::JobPhase { job_id, .. }
            | QueueEvent::JobStderr { job_id, .. }
            | QueueEvent::JobCompleted { job_id, .. }
            | QueueEvent::JobFailed { job_id, .. }
            | QueueEvent::JobRetry { job_id, .. }
            | QueueEvent::JobRetrying { job_id, .. }
            | QueueEvent::JobCancelled { job_id } => Some(*job_id),
            _ => None,
        }
    }

    /// Get a short description of this event for logging.
    pub fn description(&self) -> String {
        match self {
            QueueEvent::JobStarted { job_id, domain } => {
                format!("Job {} started for {}", job_id, domain)
            }
            QueueEvent::JobLog { job_id, text } | QueueEvent::JobStderr { job_id, text } => {
                format!("Job {}: {}", job_id, text)
            }
            QueueEvent::JobPhase {
                job_id,
                phase,
                name,
            } => format!("Job {} phase {}: {}", job_id, phase, name),
            QueueEvent::JobCompleted { job_id, duration } => {
                format!("Job {} completed in {}ms", job_id, duration)
            }
            QueueEvent::JobFailed { job_id, error } => format!("Job {} failed: {}", job_id, error),
            QueueEvent::JobRetry {
                job_id,
                attempt,
                delay,
            } => format!("Job {} retry {} in {}ms", job_id, attempt, delay),
            QueueEvent::JobRetrying {
                job_id,
                attempt,
                error,
            } => format!("Job {} will retry (attempt {}): {}", job_id, attempt, error),
            QueueEvent::JobCancelled { job_id } => format!("Job {} cancelled", job_id),
            QueueEvent::AllJobsCancelled => "All jobs cancelled".to_string(),
            QueueEvent::BatchCreated {
                batch_id,
                total_jobs,
            } => format!("Batch {} created with {} jobs", batch_id, total_jobs),
            QueueEvent::BatchStarted { batch_id } => format!("Batch {} started", batch_id),
            QueueEvent::BatchPaused { batch_id } => format!("Batch {} paused", batch_id),
            QueueEvent::BatchResumed { batch_id } => format!("Batch {} resumed", batch_id),
            QueueEvent::BatchRetrying { batch_id, count } => {
                format!("Batch {} retrying {} failed jobs", batch_id, count)
            }
            QueueEvent::BatchCancelled { batch_id } => format!("Batch {} cancelled", batch_id),
            QueueEvent::BatchCompleted {
                batch_id,
                completed_jobs,
                failed_jobs,
                ..
            } => format!(
                "Batch {} complete: {} completed, {} failed",
                batch_id, completed_jobs, failed_jobs
            ),
            QueueEvent::BatchDeleted { batch_id } => format!("Batch {} deleted", batch_id),
        }
    }
}
