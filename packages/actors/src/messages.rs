//! Message types for actor communication.

use queue_core::{
    BatchId, BatchOptions, BatchResult, BatchStatus, BatchStatusReport, BatchSummary,
    CreateBatchResponse, JobId,
};
use ractor::RpcReplyPort;
use store::StoreError;

use crate::runner::{JobError, JobOutput};

/// Messages for the QueueManager actor.
#[derive(Debug)]
pub enum ManagerMessage {
    /// Validate a domain list and create a batch from it.
    CreateBatch {
        domains: Vec<String>,
        options: BatchOptions,
        reply: RpcReplyPort<QueueResult<CreateBatchResponse>>,
    },

    /// Start dispatching a batch's pending jobs.
    StartBatch {
        batch_id: BatchId,
        reply: RpcReplyPort<QueueResult<()>>,
    },

    /// Stop dispatching; in-flight jobs keep running.
    PauseBatch {
        batch_id: BatchId,
        reply: RpcReplyPort<QueueResult<bool>>,
    },

    /// Re-enqueue a paused batch's pending jobs.
    ResumeBatch {
        batch_id: BatchId,
        reply: RpcReplyPort<QueueResult<bool>>,
    },

    /// Reset every failed job of a batch and dispatch them again.
    RetryFailed {
        batch_id: BatchId,
        reply: RpcReplyPort<QueueResult<usize>>,
    },

    /// Kill running jobs and stop the batch for good.
    CancelBatch {
        batch_id: BatchId,
        reply: RpcReplyPort<QueueResult<bool>>,
    },

    /// Remove a batch from memory and from the store.
    DeleteBatch {
        batch_id: BatchId,
        reply: RpcReplyPort<QueueResult<()>>,
    },

    /// Get a batch with its jobs.
    GetBatchStatus {
        batch_id: BatchId,
        reply: RpcReplyPort<QueueResult<Option<BatchStatusReport>>>,
    },

    /// Get the stored research payloads of a batch.
    GetBatchResults {
        batch_id: BatchId,
        reply: RpcReplyPort<QueueResult<Vec<BatchResult>>>,
    },

    /// List every known batch.
    ListBatches {
        reply: RpcReplyPort<QueueResult<Vec<BatchSummary>>>,
    },

    /// Load interrupted batches from the store.
    RestoreState {
        reply: RpcReplyPort<QueueResult<usize>>,
    },

    /// Dispatch the next eligible pending job. Replies whether one was dispatched.
    DispatchNext { reply: RpcReplyPort<bool> },

    /// A dispatched job reached its final outcome.
    JobFinished {
        batch_id: BatchId,
        job_id: JobId,
        outcome: Result<JobOutput, JobError>,
    },
}

/// Result type for manager operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// Error type for manager operations.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Batch not found: {0}")]
    BatchNotFound(BatchId),

    #[error("No valid domains provided")]
    NoValidDomains,

    #[error("Batch {batch_id} is {status}")]
    InvalidState { batch_id: BatchId, status: BatchStatus },

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Actor error: {0}")]
    Actor(String),

    #[error("Queue manager did not reply in time")]
    Timeout,
}
