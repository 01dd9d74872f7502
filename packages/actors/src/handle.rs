//! Cloneable front door to the manager actor.

use std::sync::Arc;
use std::time::Duration;

use queue_core::{
    BatchId, BatchOptions, BatchResult, BatchStatusReport, BatchSummary, CreateBatchResponse,
    JobId, QueueEvent,
};
use ractor::rpc::CallResult;
use ractor::{Actor, ActorRef, RpcReplyPort};
use store::QueueStore;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::ManagerConfig;
use crate::manager::{ManagerActor, ManagerArgs};
use crate::messages::{ManagerMessage, QueueError, QueueResult};
use crate::runner::JobRunner;

/// Handle to a running queue manager.
///
/// Construct one per process with [`QueueManager::start`] and pass clones to
/// whatever needs to submit or inspect batches.
#[derive(Clone)]
pub struct QueueManager {
    actor: ActorRef<ManagerMessage>,
    runner: Arc<JobRunner>,
    events: broadcast::Sender<QueueEvent>,
    request_timeout: Duration,
}

impl QueueManager {
    /// Open the store, spawn the manager actor and restore interrupted batches.
    pub async fn start(config: ManagerConfig) -> QueueResult<(Self, JoinHandle<()>)> {
        let store = QueueStore::open(&config.data_dir).await?;
        let (events, _) = broadcast::channel(config.event_capacity);
        let runner = Arc::new(JobRunner::new(config.runner, events.clone()));

        let args = ManagerArgs {
            store,
            runner: runner.clone(),
            events: events.clone(),
        };
        let (actor, handle) = Actor::spawn(None, ManagerActor, args)
            .await
            .map_err(|e| QueueError::Actor(e.to_string()))?;

        Ok((
            Self {
                actor,
                runner,
                events,
                request_timeout: config.request_timeout,
            },
            handle,
        ))
    }

    /// Receive every job and batch event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    async fn request<T, F>(&self, build: F) -> QueueResult<T>
    where
        T: Send + 'static,
        F: FnOnce(RpcReplyPort<QueueResult<T>>) -> ManagerMessage,
    {
        match ractor::rpc::call(&self.actor, build, Some(self.request_timeout)).await {
            Ok(CallResult::Success(result)) => result,
            Ok(CallResult::Timeout) => Err(QueueError::Timeout),
            Ok(CallResult::SenderError) => Err(QueueError::Actor("reply dropped".to_string())),
            Err(e) => Err(QueueError::Actor(e.to_string())),
        }
    }

    pub async fn create_batch<S: Into<String>>(
        &self,
        domains: impl IntoIterator<Item = S>,
        options: BatchOptions,
    ) -> QueueResult<CreateBatchResponse> {
        let domains: Vec<String> = domains.into_iter().map(Into::into).collect();
        self.request(|reply| ManagerMessage::CreateBatch {
            domains,
            options,
            reply,
        })
        .await
    }

    pub async fn start_batch(&self, batch_id: BatchId) -> QueueResult<()> {
        self.request(|reply| ManagerMessage::StartBatch { batch_id, reply })
            .await
    }

    /// Returns `false` unless the batch was running.
    pub async fn pause_batch(&self, batch_id: BatchId) -> QueueResult<bool> {
        self.request(|reply| ManagerMessage::PauseBatch { batch_id, reply })
            .await
    }

    /// Returns `false` unless the batch was paused.
    pub async fn resume_batch(&self, batch_id: BatchId) -> QueueResult<bool> {
        self.request(|reply| ManagerMessage::ResumeBatch { batch_id, reply })
            .await
    }

    /// Number of failed jobs reset to pending.
    pub async fn retry_failed(&self, batch_id: BatchId) -> QueueResult<usize> {
        self.request(|reply| ManagerMessage::RetryFailed { batch_id, reply })
            .await
    }

    /// Returns `false` for unknown or already finished batches.
    pub async fn cancel_batch(&self, batch_id: BatchId) -> QueueResult<bool> {
        self.request(|reply| ManagerMessage::CancelBatch { batch_id, reply })
            .await
    }

    pub async fn delete_batch(&self, batch_id: BatchId) -> QueueResult<()> {
        self.request(|reply| ManagerMessage::DeleteBatch { batch_id, reply })
            .await
    }

    pub async fn get_batch_status(&self, batch_id: BatchId) -> QueueResult<Option<BatchStatusReport>> {
        self.request(|reply| ManagerMessage::GetBatchStatus { batch_id, reply })
            .await
    }

    pub async fn get_batch_results(&self, batch_id: BatchId) -> QueueResult<Vec<BatchResult>> {
        self.request(|reply| ManagerMessage::GetBatchResults { batch_id, reply })
            .await
    }

    pub async fn list_batches(&self) -> QueueResult<Vec<BatchSummary>> {
        self.request(|reply| ManagerMessage::ListBatches { reply })
            .await
    }

    /// Load interrupted batches from the store. Already loaded batches are skipped.
    pub async fn restore_state(&self) -> QueueResult<usize> {
        self.request(|reply| ManagerMessage::RestoreState { reply })
            .await
    }

    /// Subprocesses alive right now, across all batches.
    pub fn get_active_count(&self) -> usize {
        self.runner.get_active_count()
    }

    pub fn is_job_running(&self, job_id: JobId) -> bool {
        self.runner.is_job_running(job_id)
    }

    /// Stop the manager. Running subprocesses are killed; persisted state is
    /// left for the next [`restore_state`](Self::restore_state).
    pub fn shutdown(&self) {
        self.actor.stop(Some("shutdown".to_string()));
    }
}
