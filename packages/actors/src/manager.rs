//! Batch manager actor.
//!
//! Owns every in-memory batch and its jobs plus the shared pending-dispatch
//! queue. All state changes go through this actor's mailbox, so the maps need
//! no locking. A background dispatcher task asks the actor for the next job
//! whenever the runner has a free slot.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use queue_core::domain::{normalize_domains, sanitize_domain};
use queue_core::{
    Batch, BatchId, BatchOptions, BatchResult, BatchStatus, BatchStatusReport, BatchSummary,
    CreateBatchResponse, Job, JobId, JobStatus, QueueEvent,
};
use ractor::{Actor, ActorProcessingErr, ActorRef};
use store::QueueStore;
use tokio::sync::{Notify, broadcast};
use tokio::task::JoinHandle;

use crate::messages::{ManagerMessage, QueueError, QueueResult};
use crate::runner::{JobError, JobOutput, JobRunner};

/// Pause between two dispatches, on top of the runner's rate limit.
const DISPATCH_PACING: Duration = Duration::from_millis(100);

/// Where the research process leaves its payload, relative to the project root:
/// `prospects/<sanitized-domain>/research-data.json`.
const RESULT_DIR: &str = "prospects";
const RESULT_FILE: &str = "research-data.json";

/// A batch and its jobs.
#[derive(Debug)]
struct BatchState {
    batch: Batch,
    jobs: HashMap<JobId, Job>,
}

impl BatchState {
    fn new(batch: Batch, jobs: Vec<Job>) -> Self {
        Self {
            batch,
            jobs: jobs.into_iter().map(|job| (job.id, job)).collect(),
        }
    }

    /// Jobs in submission order.
    fn sorted_jobs(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.jobs.values().cloned().collect();
        jobs.sort_by_key(|job| job.order);
        jobs
    }

    fn count(&self, status: JobStatus) -> usize {
        self.jobs.values().filter(|job| job.status == status).count()
    }

    fn ids_with_status(&self, status: JobStatus) -> Vec<JobId> {
        self.jobs
            .values()
            .filter(|job| job.status == status)
            .map(|job| job.id)
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingJob {
    batch_id: BatchId,
    job_id: JobId,
}

/// Dependencies handed to the manager actor at spawn time.
pub struct ManagerArgs {
    pub store: QueueStore,
    pub runner: Arc<JobRunner>,
    pub events: broadcast::Sender<QueueEvent>,
}

/// State for the manager actor.
pub struct ManagerState {
    store: QueueStore,
    runner: Arc<JobRunner>,
    events: broadcast::Sender<QueueEvent>,
    batches: HashMap<BatchId, BatchState>,
    /// Jobs offered to the dispatcher, in enqueue order.
    pending: VecDeque<PendingJob>,
    dispatch_wake: Arc<Notify>,
    dispatcher: Option<JoinHandle<()>>,
}

impl ManagerState {
    fn new(args: ManagerArgs) -> Self {
        Self {
            store: args.store,
            runner: args.runner,
            events: args.events,
            batches: HashMap::new(),
            pending: VecDeque::new(),
            dispatch_wake: Arc::new(Notify::new()),
            dispatcher: None,
        }
    }

    fn broadcast(&self, event: QueueEvent) {
        let _ = self.events.send(event);
    }

    fn wake_dispatcher(&self) {
        self.dispatch_wake.notify_one();
    }

    async fn persist_batch(&mut self, batch_id: BatchId) -> QueueResult<()> {
        let Some(state) = self.batches.get_mut(&batch_id) else {
            return Ok(());
        };
        state.batch = self.store.save_batch(&state.batch).await?;
        tracing::debug!("Persisted batch {} ({})", batch_id, state.batch.status);
        Ok(())
    }

    async fn persist_jobs(&self, batch_id: BatchId) -> QueueResult<()> {
        if let Some(state) = self.batches.get(&batch_id) {
            self.store.save_jobs(batch_id, &state.sorted_jobs()).await?;
        }
        Ok(())
    }

    /// Offer every pending job of a batch to the dispatcher, in submission order.
    fn enqueue_pending(&mut self, batch_id: BatchId) {
        let Some(state) = self.batches.get(&batch_id) else {
            return;
        };
        for job in state.sorted_jobs() {
            let entry = PendingJob {
                batch_id,
                job_id: job.id,
            };
            if job.status == JobStatus::Pending && !self.pending.contains(&entry) {
                self.pending.push_back(entry);
            }
        }
    }

    fn strip_pending(&mut self, batch_id: BatchId) {
        self.pending.retain(|entry| entry.batch_id != batch_id);
    }

    async fn create_batch(
        &mut self,
        domains: Vec<String>,
        options: BatchOptions,
    ) -> QueueResult<CreateBatchResponse> {
        let domains = normalize_domains(&domains);
        if domains.is_empty() {
            return Err(QueueError::NoValidDomains);
        }

        let batch = Batch::new(domains.len(), options);
        let jobs: Vec<Job> = domains
            .iter()
            .enumerate()
            .map(|(order, domain)| Job::new(batch.id, domain.clone(), order))
            .collect();

        let batch = self.store.save_batch(&batch).await?;
        self.store.save_jobs(batch.id, &jobs).await?;

        let batch_id = batch.id;
        let total_jobs = batch.total_jobs;
        self.batches.insert(batch_id, BatchState::new(batch, jobs));
        tracing::info!("Created batch {} with {} jobs", batch_id, total_jobs);
        self.broadcast(QueueEvent::BatchCreated {
            batch_id,
            total_jobs,
        });

        if options.auto_start {
            self.start_batch(batch_id).await?;
        }

        let status = self
            .batches
            .get(&batch_id)
            .map_or(BatchStatus::Created, |state| state.batch.status);
        Ok(CreateBatchResponse {
            batch_id,
            status,
            total_jobs,
            domains,
        })
    }

    async fn start_batch(&mut self, batch_id: BatchId) -> QueueResult<()> {
        if !self.ensure_loaded(batch_id).await? {
            return Err(QueueError::BatchNotFound(batch_id));
        }
        let state = self
            .batches
            .get_mut(&batch_id)
            .ok_or(QueueError::BatchNotFound(batch_id))?;

        match state.batch.status {
            BatchStatus::Running => return Ok(()),
            status if status.is_terminal() => {
                return Err(QueueError::InvalidState { batch_id, status });
            }
            _ => {}
        }

        state.batch.status = BatchStatus::Running;
        self.persist_batch(batch_id).await?;
        self.enqueue_pending(batch_id);
        tracing::info!("Started batch {}", batch_id);
        self.broadcast(QueueEvent::BatchStarted { batch_id });
        self.wake_dispatcher();
        Ok(())
    }

    async fn pause_batch(&mut self, batch_id: BatchId) -> QueueResult<bool> {
        let Some(state) = self.batches.get_mut(&batch_id) else {
            return Ok(false);
        };
        if state.batch.status != BatchStatus::Running {
            return Ok(false);
        }

        state.batch.status = BatchStatus::Paused;
        self.persist_batch(batch_id).await?;
        self.strip_pending(batch_id);
        tracing::info!("Paused batch {}", batch_id);
        self.broadcast(QueueEvent::BatchPaused { batch_id });
        Ok(true)
    }

    async fn resume_batch(&mut self, batch_id: BatchId) -> QueueResult<bool> {
        if !self.ensure_loaded(batch_id).await? {
            return Ok(false);
        }
        let Some(state) = self.batches.get_mut(&batch_id) else {
            return Ok(false);
        };
        if state.batch.status != BatchStatus::Paused {
            return Ok(false);
        }

        state.batch.status = BatchStatus::Running;
        self.persist_batch(batch_id).await?;
        self.enqueue_pending(batch_id);
        tracing::info!("Resumed batch {}", batch_id);
        self.broadcast(QueueEvent::BatchResumed { batch_id });
        self.wake_dispatcher();
        Ok(true)
    }

    async fn retry_failed(&mut self, batch_id: BatchId) -> QueueResult<usize> {
        if !self.ensure_loaded(batch_id).await? {
            return Err(QueueError::BatchNotFound(batch_id));
        }
        let state = self
            .batches
            .get_mut(&batch_id)
            .ok_or(QueueError::BatchNotFound(batch_id))?;

        let count = state
            .jobs
            .values_mut()
            .map(|job| job.reset_for_retry())
            .filter(|reset| *reset)
            .count();
        if count == 0 {
            return Ok(0);
        }

        state.batch.failed_jobs = state.batch.failed_jobs.saturating_sub(count);
        state.batch.status = BatchStatus::Running;
        self.persist_jobs(batch_id).await?;
        self.persist_batch(batch_id).await?;
        self.enqueue_pending(batch_id);
        tracing::info!("Retrying {} failed job(s) in batch {}", count, batch_id);
        self.broadcast(QueueEvent::BatchRetrying { batch_id, count });
        self.wake_dispatcher();
        Ok(count)
    }

    async fn cancel_batch(&mut self, batch_id: BatchId) -> QueueResult<bool> {
        if !self.ensure_loaded(batch_id).await? {
            return Ok(false);
        }
        let Some(state) = self.batches.get_mut(&batch_id) else {
            return Ok(false);
        };
        if state.batch.status.is_terminal() {
            return Ok(false);
        }

        state.batch.status = BatchStatus::Cancelled;
        for job_id in state.ids_with_status(JobStatus::Running) {
            self.runner.abandon_job(job_id);
        }
        self.strip_pending(batch_id);
        self.persist_batch(batch_id).await?;
        tracing::info!("Cancelled batch {}", batch_id);
        self.broadcast(QueueEvent::BatchCancelled { batch_id });
        Ok(true)
    }

    async fn delete_batch(&mut self, batch_id: BatchId) -> QueueResult<()> {
        if let Some(state) = self.batches.remove(&batch_id) {
            for job_id in state.ids_with_status(JobStatus::Running) {
                self.runner.abandon_job(job_id);
            }
            self.strip_pending(batch_id);
        }

        self.store.delete_batch(batch_id).await?;
        tracing::info!("Deleted batch {}", batch_id);
        self.broadcast(QueueEvent::BatchDeleted { batch_id });
        Ok(())
    }

    async fn get_batch_status(&self, batch_id: BatchId) -> QueueResult<Option<BatchStatusReport>> {
        if let Some(state) = self.batches.get(&batch_id) {
            let jobs = state.sorted_jobs();
            let batch = state.batch.clone();
            let running = state.count(JobStatus::Running);
            let active = jobs
                .iter()
                .filter(|job| self.runner.is_job_running(job.id))
                .count();
            let pending = batch
                .total_jobs
                .saturating_sub(batch.completed_jobs + batch.failed_jobs + running);

            return Ok(Some(BatchStatusReport {
                batch,
                running_jobs: Some(running),
                active_processes: Some(active),
                pending_jobs: Some(pending),
                jobs,
            }));
        }

        let Some(batch) = self.store.load_batch(batch_id).await? else {
            return Ok(None);
        };
        let mut jobs = self.store.load_jobs(batch_id).await?;
        jobs.sort_by_key(|job| job.order);
        Ok(Some(BatchStatusReport {
            batch,
            running_jobs: None,
            active_processes: None,
            pending_jobs: None,
            jobs,
        }))
    }

    async fn get_batch_results(&self, batch_id: BatchId) -> QueueResult<Vec<BatchResult>> {
        let jobs = match self.batches.get(&batch_id) {
            Some(state) => state.sorted_jobs(),
            None => {
                if self.store.load_batch(batch_id).await?.is_none() {
                    return Err(QueueError::BatchNotFound(batch_id));
                }
                self.store.load_jobs(batch_id).await?
            }
        };

        // Stored names lose dashes on the way back; prefer the job's own domain.
        let mut known: HashMap<String, String> = jobs
            .iter()
            .map(|job| (sanitize_domain(&job.domain), job.domain.clone()))
            .collect();

        let mut results = Vec::new();
        for name in self.store.list_results(batch_id).await? {
            let domain = known.remove(&sanitize_domain(&name)).unwrap_or(name);
            if let Some(data) = self.store.load_result(batch_id, &domain).await? {
                results.push(BatchResult { domain, data });
            }
        }
        Ok(results)
    }

    async fn list_batches(&self) -> QueueResult<Vec<BatchSummary>> {
        let mut summaries: Vec<BatchSummary> = self
            .batches
            .values()
            .map(|state| state.batch.summary())
            .collect();

        for batch in self.store.list_batches().await? {
            if !self.batches.contains_key(&batch.id) {
                summaries.push(batch.summary());
            }
        }

        summaries.sort_by_key(|summary| summary.created_at);
        Ok(summaries)
    }

    /// Load a stored batch and its jobs into memory, repairing what an
    /// interrupted session left behind: jobs caught `running` go back to
    /// pending, the counters are rebuilt from the job statuses and a `running`
    /// batch is demoted to paused.
    async fn adopt(&mut self, mut batch: Batch) -> QueueResult<()> {
        let mut jobs = self.store.load_jobs(batch.id).await?;
        let mut interrupted = 0;
        for job in jobs.iter_mut().filter(|job| job.status == JobStatus::Running) {
            job.status = JobStatus::Pending;
            job.started_at = None;
            interrupted += 1;
        }
        if interrupted > 0 {
            self.store.save_jobs(batch.id, &jobs).await?;
        }

        let mut dirty = false;
        let completed = jobs.iter().filter(|job| job.status == JobStatus::Completed).count();
        let failed = jobs.iter().filter(|job| job.status == JobStatus::Failed).count();
        if (completed, failed) != (batch.completed_jobs, batch.failed_jobs) {
            tracing::warn!(
                "Batch {} counters were stale ({}/{} recorded, {}/{} from jobs)",
                batch.id,
                batch.completed_jobs,
                batch.failed_jobs,
                completed,
                failed
            );
            batch.completed_jobs = completed;
            batch.failed_jobs = failed;
            dirty = true;
        }

        if batch.status == BatchStatus::Running {
            batch.status = BatchStatus::Paused;
            dirty = true;
            tracing::info!(
                "Batch {} was running at shutdown, restored as paused ({} interrupted job(s))",
                batch.id,
                interrupted
            );
        }
        if dirty {
            batch = self.store.save_batch(&batch).await?;
        }

        self.batches.insert(batch.id, BatchState::new(batch, jobs));
        Ok(())
    }

    /// Make sure a batch is in memory, loading it from the store if needed.
    /// Returns false when the batch does not exist.
    async fn ensure_loaded(&mut self, batch_id: BatchId) -> QueueResult<bool> {
        if self.batches.contains_key(&batch_id) {
            return Ok(true);
        }
        let Some(batch) = self.store.load_batch(batch_id).await? else {
            return Ok(false);
        };
        self.adopt(batch).await?;
        tracing::debug!("Loaded batch {} from the store", batch_id);
        Ok(true)
    }

    /// Load interrupted batches. A batch that was running is demoted to paused
    /// and its in-flight jobs go back to pending. A batch whose jobs had all
    /// finished is completed.
    async fn restore_state(&mut self) -> QueueResult<usize> {
        let mut restored = 0;

        for batch in self.store.get_resumable_batches().await? {
            if self.batches.contains_key(&batch.id) {
                continue;
            }
            let batch_id = batch.id;
            self.adopt(batch).await?;
            self.check_completion(batch_id).await;
            restored += 1;
        }

        if restored > 0 {
            tracing::info!("Restored {} batch(es) from previous session", restored);
        }
        Ok(restored)
    }

    /// Pop the next eligible job and hand it to the runner.
    ///
    /// Entries for absent or non-running batches, and jobs no longer pending,
    /// are dropped.
    async fn dispatch_next(&mut self, myself: &ActorRef<ManagerMessage>) -> bool {
        while let Some(PendingJob { batch_id, job_id }) = self.pending.pop_front() {
            let Some(state) = self.batches.get_mut(&batch_id) else {
                continue;
            };
            if state.batch.status != BatchStatus::Running {
                continue;
            }
            let Some(job) = state.jobs.get_mut(&job_id) else {
                continue;
            };
            if job.status != JobStatus::Pending {
                continue;
            }

            let now = Utc::now();
            job.mark_running(now);
            let job = job.clone();

            if let Err(e) = self
                .store
                .update_job(batch_id, job_id, |stored| stored.mark_running(now))
                .await
            {
                tracing::warn!("Failed to persist start of job {}: {}", job_id, e);
            }

            tracing::debug!("Dispatching job {} ({})", job_id, job.domain);
            let runner = self.runner.clone();
            let manager = myself.clone();
            tokio::spawn(async move {
                let outcome = runner.run_job_with_retry(&job).await;
                let message = ManagerMessage::JobFinished {
                    batch_id,
                    job_id,
                    outcome,
                };
                if manager.send_message(message).is_err() {
                    tracing::warn!("Manager stopped before job {} finished", job_id);
                }
            });
            return true;
        }
        false
    }

    async fn job_finished(
        &mut self,
        batch_id: BatchId,
        job_id: JobId,
        outcome: Result<JobOutput, JobError>,
    ) {
        self.runner.forget_job(job_id);

        let Some(state) = self.batches.get_mut(&batch_id) else {
            tracing::debug!("Ignoring outcome of job {} from unknown batch {}", job_id, batch_id);
            return;
        };
        let Some(job) = state.jobs.get_mut(&job_id) else {
            return;
        };
        if job.status != JobStatus::Running {
            return;
        }

        let now = Utc::now();
        let completed_domain = match outcome {
            Ok(_) => {
                job.mark_completed(now);
                state.batch.completed_jobs += 1;
                Some(job.domain.clone())
            }
            Err(e) => {
                job.mark_failed(e.to_string(), now);
                state.batch.failed_jobs += 1;
                None
            }
        };

        let updated = job.clone();
        if let Err(e) = self
            .store
            .update_job(batch_id, job_id, |stored| *stored = updated)
            .await
        {
            tracing::warn!("Failed to persist outcome of job {}: {}", job_id, e);
        }
        if let Err(e) = self.persist_batch(batch_id).await {
            tracing::warn!("Failed to persist batch {}: {}", batch_id, e);
        }

        if let Some(domain) = completed_domain {
            self.ingest_result(batch_id, &domain).await;
        }
        self.check_completion(batch_id).await;
    }

    /// Copy the payload written by the research process into the result store.
    ///
    /// A missing or unparsable file is logged; the job stays completed.
    async fn ingest_result(&self, batch_id: BatchId, domain: &str) {
        let path = self
            .runner
            .config()
            .project_root
            .join(RESULT_DIR)
            .join(sanitize_domain(domain))
            .join(RESULT_FILE);

        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!("No result for {} at {}: {}", domain, path.display(), e);
                return;
            }
        };
        let data: serde_json::Value = match serde_json::from_str(&raw) {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!("Unparsable result for {} at {}: {}", domain, path.display(), e);
                return;
            }
        };

        match self.store.save_result(batch_id, domain, &data).await {
            Ok(()) => tracing::debug!("Stored result for {} in batch {}", domain, batch_id),
            Err(e) => tracing::warn!("Failed to store result for {}: {}", domain, e),
        }
    }

    async fn check_completion(&mut self, batch_id: BatchId) {
        let Some(state) = self.batches.get_mut(&batch_id) else {
            return;
        };
        let open = matches!(state.batch.status, BatchStatus::Running | BatchStatus::Paused);
        if !open || !state.batch.all_jobs_finished() {
            return;
        }

        state.batch.status = BatchStatus::Completed;
        let event = QueueEvent::BatchCompleted {
            batch_id,
            total_jobs: state.batch.total_jobs,
            completed_jobs: state.batch.completed_jobs,
            failed_jobs: state.batch.failed_jobs,
        };
        tracing::info!(
            "Batch {} completed: {} succeeded, {} failed",
            batch_id,
            state.batch.completed_jobs,
            state.batch.failed_jobs
        );

        self.strip_pending(batch_id);
        if let Err(e) = self.persist_batch(batch_id).await {
            tracing::warn!("Failed to persist batch {}: {}", batch_id, e);
        }
        self.broadcast(event);
    }
}

/// Feeds jobs to the runner: whenever woken, waits for a free slot and asks
/// the manager for the next job until the queue is drained.
fn spawn_dispatcher(
    manager: ActorRef<ManagerMessage>,
    runner: Arc<JobRunner>,
    wake: Arc<Notify>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            wake.notified().await;
            loop {
                runner.wait_for_capacity().await;
                let result = ractor::rpc::call(
                    &manager,
                    |reply| ManagerMessage::DispatchNext { reply },
                    None,
                )
                .await;
                match result {
                    Ok(ractor::rpc::CallResult::Success(true)) => {
                        tokio::time::sleep(DISPATCH_PACING).await;
                    }
                    Ok(ractor::rpc::CallResult::Success(false)) => break,
                    _ => return,
                }
            }
        }
    })
}

/// Actor that owns batch lifecycle and dispatch.
pub struct ManagerActor;

impl Actor for ManagerActor {
    type Msg = ManagerMessage;
    type State = ManagerState;
    type Arguments = ManagerArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!("Starting queue manager in {}", args.store.data_dir().display());

        let mut state = ManagerState::new(args);
        state.restore_state().await?;
        state.dispatcher = Some(spawn_dispatcher(
            myself,
            state.runner.clone(),
            state.dispatch_wake.clone(),
        ));
        Ok(state)
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            ManagerMessage::CreateBatch {
                domains,
                options,
                reply,
            } => {
                let _ = reply.send(state.create_batch(domains, options).await);
            }

            ManagerMessage::StartBatch { batch_id, reply } => {
                let _ = reply.send(state.start_batch(batch_id).await);
            }

            ManagerMessage::PauseBatch { batch_id, reply } => {
                let _ = reply.send(state.pause_batch(batch_id).await);
            }

            ManagerMessage::ResumeBatch { batch_id, reply } => {
                let _ = reply.send(state.resume_batch(batch_id).await);
            }

            ManagerMessage::RetryFailed { batch_id, reply } => {
                let _ = reply.send(state.retry_failed(batch_id).await);
            }

            ManagerMessage::CancelBatch { batch_id, reply } => {
                let _ = reply.send(state.cancel_batch(batch_id).await);
            }

            ManagerMessage::DeleteBatch { batch_id, reply } => {
                let _ = reply.send(state.delete_batch(batch_id).await);
            }

            ManagerMessage::GetBatchStatus { batch_id, reply } => {
                let _ = reply.send(state.get_batch_status(batch_id).await);
            }

            ManagerMessage::GetBatchResults { batch_id, reply } => {
                let _ = reply.send(state.get_batch_results(batch_id).await);
            }

            ManagerMessage::ListBatches { reply } => {
                let _ = reply.send(state.list_batches().await);
            }

            ManagerMessage::RestoreState { reply } => {
                let _ = reply.send(state.restore_state().await);
            }

            ManagerMessage::DispatchNext { reply } => {
                let dispatched = state.dispatch_next(&myself).await;
                let _ = reply.send(dispatched);
            }

            ManagerMessage::JobFinished {
                batch_id,
                job_id,
                outcome,
            } => {
                state.job_finished(batch_id, job_id, outcome).await;
            }
        }

        Ok(())
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        if let Some(dispatcher) = state.dispatcher.take() {
            dispatcher.abort();
        }
        state.runner.cancel_all();
        tracing::info!("Queue manager stopped");
        Ok(())
    }
}
