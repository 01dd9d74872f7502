//! Batch domain types: a submitted list of domains and its progress counters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::Job;

/// Unique identifier for a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(pub Ulid);

impl BatchId {
    /// Create a new unique batch ID.
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Parse a batch ID from a string.
    pub fn parse(s: &str) -> Result<Self, ulid::DecodeError> {
        Ok(Self(Ulid::from_string(s)?))
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for BatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    /// Submitted but not yet dispatching.
    #[default]
    Created,
    /// Pending jobs are being dispatched.
    Running,
    /// Dispatch suspended; in-flight jobs still finish.
    Paused,
    /// Every job reached a terminal state.
    Completed,
    /// Cancelled by the user.
    Cancelled,
}

impl BatchStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BatchStatus::Completed | BatchStatus::Cancelled)
    }

    /// Whether a batch in this state survives a restart as resumable work.
    pub fn is_resumable(&self) -> bool {
        matches!(self, BatchStatus::Running | BatchStatus::Paused)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Created => "created",
            BatchStatus::Running => "running",
            BatchStatus::Paused => "paused",
            BatchStatus::Completed => "completed",
            BatchStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Options supplied when a batch is submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BatchOptions {
    /// Requested concurrency. Recorded with the batch; the runner's global limit applies.
    pub max_concurrent: usize,
    /// Start dispatching immediately after creation.
    pub auto_start: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            auto_start: true,
        }
    }
}

impl BatchOptions {
    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    pub fn with_auto_start(mut self, auto_start: bool) -> Self {
        self.auto_start = auto_start;
        self
    }
}

/// Batch metadata document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Batch {
    pub id: BatchId,
    pub status: BatchStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub total_jobs: usize,
    pub completed_jobs: usize,
    pub failed_jobs: usize,
    #[serde(default)]
    pub options: BatchOptions,
}

impl Batch {
    /// Create a batch in the `created` state.
    pub fn new(total_jobs: usize, options: BatchOptions) -> Self {
        let now = Utc::now();
        Self {
            id: BatchId::new(),
            status: BatchStatus::Created,
            created_at: now,
            updated_at: now,
            total_jobs,
            completed_jobs: 0,
            failed_jobs: 0,
            options,
        }
    }

    /// Number of jobs that reached a terminal state.
    pub fn finished_jobs(&self) -> usize {
        self.completed_jobs + self.failed_jobs
    }

    /// True once every job is either completed or failed.
    pub fn all_jobs_finished(&self) -> bool {
        self.finished_jobs() >= self.total_jobs
    }

    pub fn summary(&self) -> BatchSummary {
        BatchSummary {
            id: self.id,
            status: self.status,
            created_at: self.created_at,
            total_jobs: self.total_jobs,
            completed_jobs: self.completed_jobs,
            failed_jobs: self.failed_jobs,
        }
    }
}

/// Compact batch view used for listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    pub id: BatchId,
    pub status: BatchStatus,
    pub created_at: DateTime<Utc>,
    pub total_jobs: usize,
    pub completed_jobs: usize,
    pub failed_jobs: usize,
}

/// Detailed status of one batch.
///
/// The live counters are only present when the batch is loaded in memory;
/// a store-only view leaves them empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchStatusReport {
    #[serde(flatten)]
    pub batch: Batch,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub running_jobs: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_processes: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_jobs: Option<usize>,
    pub jobs: Vec<Job>,
}

/// Returned to the submitter of a new batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateBatchResponse {
    pub batch_id: BatchId,
    pub status: BatchStatus,
    pub total_jobs: usize,
    pub domains: Vec<String>,
}

/// A stored research payload for one domain of a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    pub domain: String,
    pub data: serde_json::Value,
}
