//! Core domain types for the batch research queue.
//!
//! This crate contains shared types used across all packages:
//! - Batch and BatchStatus for submitted domain lists
//! - Job and JobStatus for per-domain work items
//! - Events for lifecycle notifications
//! - Domain normalisation and heuristic phase detection

mod batch;
pub mod domain;
mod events;
mod job;
pub mod phase;

pub use batch::{
    Batch, BatchId, BatchOptions, BatchResult, BatchStatus, BatchStatusReport, BatchSummary,
    CreateBatchResponse,
};
pub use events::QueueEvent;
pub use job::{Job, JobId, JobStatus};
pub use phase::{Phase, detect_phase};
