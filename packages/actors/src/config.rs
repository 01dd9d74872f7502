//! Queue manager configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::runner::RunnerConfig;

/// Default capacity of the event broadcast channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Default time a caller waits for the manager to answer a request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything needed to start a [`QueueManager`](crate::QueueManager).
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Directory holding batch, job and result snapshots.
    pub data_dir: PathBuf,
    pub runner: RunnerConfig,
    /// Events buffered per subscriber before slow receivers start lagging.
    pub event_capacity: usize,
    /// How long a [`QueueManager`](crate::QueueManager) call waits for its reply.
    pub request_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(store::DEFAULT_DATA_DIR),
            runner: RunnerConfig::default(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl ManagerConfig {
    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.data_dir = data_dir.into();
        self
    }

    pub fn with_runner(mut self, runner: RunnerConfig) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_event_capacity(mut self, event_capacity: usize) -> Self {
        self.event_capacity = event_capacity.max(1);
        self
    }

    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }
}
