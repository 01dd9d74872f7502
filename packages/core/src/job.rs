//! Job domain types: one unit of research work for a single domain.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::BatchId;

/// Unique identifier for a job, using ULID for chronological sorting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Ulid);

impl JobId {
    /// Create a new unique job ID.
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Parse a job ID from a string.
    pub fn parse(s: &str) -> Result<Self, ulid::DecodeError> {
        Ok(Self(Ulid::from_string(s)?))
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Current status of a job in its lifecycle.
///
/// `pending -> running -> completed | failed`, with `failed -> pending` as the
/// only back-edge (an explicit retry).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting to be dispatched.
    #[default]
    Pending,
    /// Dispatched to the runner (may be between retry attempts).
    Running,
    /// Subprocess exited successfully.
    Completed,
    /// All attempts failed, timed out or the job was cancelled.
    Failed,
}

impl JobStatus {
    /// Check if the job is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Get a simple status string for display.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A job researches one domain on behalf of its owning batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// Unique identifier for this job.
    pub id: JobId,
    /// The batch this job belongs to.
    pub batch_id: BatchId,
    /// Normalised domain name (the unit of work).
    pub domain: String,
    /// Submission index within the batch, used as the dispatch tie-break.
    pub order: usize,
    /// Current status.
    #[serde(default)]
    pub status: JobStatus,
    /// Number of explicit retries consumed.
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Failure message, only set while `status` is `failed`.
    #[serde(default)]
    pub error: Option<String>,
}

impl Job {
    /// Create a new pending job.
    pub fn new(batch_id: BatchId, domain: impl Into<String>, order: usize) -> Self {
        Self {
            id: JobId::new(),
            batch_id,
            domain: domain.into(),
            order,
            status: JobStatus::Pending,
            retries: 0,
            started_at: None,
            completed_at: None,
            error: None,
        }
    }

    /// Mark the job as dispatched.
    pub fn mark_running(&mut self, at: DateTime<Utc>) {
        self.status = JobStatus::Running;
        self.started_at = Some(at);
    }

    /// Mark the job as successfully finished.
    pub fn mark_completed(&mut self, at: DateTime<Utc>) {
        self.status = JobStatus::Completed;
        self.completed_at = Some(at);
        self.error = None;
    }

    /// Mark the job as failed with a human-readable reason.
    pub fn mark_failed(&mut self, error: impl Into<String>, at: DateTime<Utc>) {
        self.status = JobStatus::Failed;
        self.completed_at = Some(at);
        self.error = Some(error.into());
    }

    /// Reset a failed job so it can be dispatched again.
    ///
    /// Returns `false` (and leaves the job untouched) unless the job is `failed`.
    pub fn reset_for_retry(&mut self) -> bool {
        if self.status != JobStatus::Failed {
            return false;
        }
        self.status = JobStatus::Pending;
        self.retries = self.retries.saturating_add(1);
        self.error = None;
        self.started_at = None;
        self.completed_at = None;
        true
    }
}
