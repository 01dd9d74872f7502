//! Actor system for the prospect research queue.
//!
//! This crate runs batches of domain research jobs: a Ractor-based manager
//! actor owns batch lifecycle and dispatch, and a [`JobRunner`] executes each
//! job as an external subprocess under global concurrency and start-rate limits.
//!
//! # Architecture
//!
//! - `ManagerActor` - Owns batches, jobs and the pending-dispatch queue
//! - `JobRunner` - Spawns, streams, times out, retries and cancels subprocesses
//! - `QueueManager` - Cloneable handle wrapping the actor's RPC messages
//!
//! # Usage
//!
//! ```ignore
//! use actors::{ManagerConfig, QueueManager};
//! use queue_core::BatchOptions;
//!
//! let (manager, handle) = QueueManager::start(ManagerConfig::default()).await?;
//! let created = manager.create_batch(["acme.com"], BatchOptions::default()).await?;
//! ```

mod config;
mod handle;
mod limiter;
mod manager;
mod messages;
mod runner;

pub use config::{DEFAULT_EVENT_CAPACITY, DEFAULT_REQUEST_TIMEOUT, ManagerConfig};
pub use handle::QueueManager;
pub use limiter::{ConcurrencyLimiter, ConcurrencyPermit, RateLimiter};
pub use manager::{ManagerActor, ManagerArgs, ManagerState};
pub use messages::{ManagerMessage, QueueError, QueueResult};
pub use runner::{CommandTemplate, DOMAIN_PLACEHOLDER, JobError, JobOutput, JobRunner, RunnerConfig};

/// Re-export ractor types for convenience.
pub use ractor::{Actor, ActorRef, RpcReplyPort};
