//! Subprocess job runner.
//!
//! Spawns one external research process per job, gated by a
//! [`ConcurrencyLimiter`] and a [`RateLimiter`], streams its output, enforces a
//! wall-clock timeout and supports retry with exponential backoff and
//! cancellation.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use queue_core::{Job, JobId, QueueEvent, detect_phase};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{broadcast, oneshot};
use tokio::time::Instant;

use crate::limiter::{ConcurrencyLimiter, RateLimiter};

/// Placeholder replaced with the job's domain in command arguments.
pub const DOMAIN_PLACEHOLDER: &str = "{domain}";

const PROSPECT_PROMPT: &str = "Run the /prospect skill for {domain}. This skill is defined in \
     .claude/skills/prospect/skill.md. Execute all phases and generate the research report and PDF.";

/// Invocation template for the external research process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandTemplate {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// The Claude CLI running the prospect research skill.
    pub fn prospect_research() -> Self {
        Self::new("claude", ["-p", "--output-format", "stream-json", PROSPECT_PROMPT])
    }

    /// Arguments with every placeholder replaced by `domain`.
    pub fn render_args(&self, domain: &str) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| arg.replace(DOMAIN_PLACEHOLDER, domain))
            .collect()
    }
}

impl Default for CommandTemplate {
    fn default() -> Self {
        Self::prospect_research()
    }
}

/// Runner configuration.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Working directory of every subprocess.
    pub project_root: PathBuf,
    /// Global cap on simultaneously running subprocesses.
    pub max_concurrent: usize,
    /// Minimum spacing between two subprocess starts.
    pub rate_limit: Duration,
    /// Extra attempts after the first failure.
    pub max_retries: u32,
    /// Wall-clock limit per attempt.
    pub timeout: Duration,
    /// Base of the exponential backoff: attempt `n` waits `base * 2^n`.
    pub retry_backoff: Duration,
    pub command: CommandTemplate,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            project_root: PathBuf::from("."),
            max_concurrent: 3,
            rate_limit: Duration::from_millis(2000),
            max_retries: 3,
            timeout: Duration::from_secs(10 * 60),
            retry_backoff: Duration::from_millis(1000),
            command: CommandTemplate::default(),
        }
    }
}

impl RunnerConfig {
    pub fn with_project_root(mut self, project_root: impl Into<PathBuf>) -> Self {
        self.project_root = project_root.into();
        self
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    pub fn with_rate_limit(mut self, rate_limit: Duration) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry_backoff(mut self, retry_backoff: Duration) -> Self {
        self.retry_backoff = retry_backoff;
        self
    }

    pub fn with_command(mut self, command: CommandTemplate) -> Self {
        self.command = command;
        self
    }
}

/// Output of a successful run.
#[derive(Debug, Clone)]
pub struct JobOutput {
    pub job_id: JobId,
    pub domain: String,
    pub duration: Duration,
    /// Accumulated stdout.
    pub output: String,
}

/// Why a job attempt failed.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job {job_id} failed to start: {source}")]
    Spawn {
        job_id: JobId,
        #[source]
        source: std::io::Error,
    },

    #[error("Job {job_id} failed with exit code {}", .code.map_or_else(|| "none".to_string(), |c| c.to_string()))]
    NonZeroExit { job_id: JobId, code: Option<i32> },

    #[error("Job {job_id} timed out after {}s", .timeout.as_secs_f64())]
    Timeout { job_id: JobId, timeout: Duration },

    #[error("Job {job_id} was cancelled")]
    Cancelled { job_id: JobId },

    #[error("Job {job_id} could not be awaited: {source}")]
    Wait {
        job_id: JobId,
        #[source]
        source: std::io::Error,
    },
}

impl JobError {
    /// Cancellation is final; every other failure may be retried.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, JobError::Cancelled { .. })
    }
}

/// Handle to a spawned subprocess.
#[derive(Debug)]
struct ActiveJob {
    domain: String,
    started: Instant,
    cancel: oneshot::Sender<()>,
}

#[derive(Debug, Default)]
struct ActiveJobs {
    running: HashMap<JobId, ActiveJob>,
    /// Jobs cancelled before their subprocess existed (waiting for a slot or backing off).
    abandoned: HashSet<JobId>,
}

enum Exit {
    /// The process exited and its stdout was drained.
    Finished(std::io::Result<std::process::ExitStatus>, String),
    TimedOut,
    Cancelled,
}

/// Runs research jobs as subprocesses.
#[derive(Debug)]
pub struct JobRunner {
    config: RunnerConfig,
    limiter: ConcurrencyLimiter,
    rate_limiter: RateLimiter,
    active: Mutex<ActiveJobs>,
    events: broadcast::Sender<QueueEvent>,
}

impl JobRunner {
    pub fn new(config: RunnerConfig, events: broadcast::Sender<QueueEvent>) -> Self {
        Self {
            limiter: ConcurrencyLimiter::new(config.max_concurrent),
            rate_limiter: RateLimiter::new(config.rate_limit),
            active: Mutex::new(ActiveJobs::default()),
            events,
            config,
        }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    fn active(&self) -> MutexGuard<'_, ActiveJobs> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, event: QueueEvent) {
        let _ = self.events.send(event);
    }

    /// Run one attempt: take a concurrency slot, respect the start rate, execute.
    ///
    /// The slot is released when this returns, on every path.
    pub async fn run_job(&self, job: &Job) -> Result<JobOutput, JobError> {
        let _permit = self.limiter.acquire().await;
        self.rate_limiter.wait().await;
        self.execute_job(job).await
    }

    /// Run a job, retrying failed attempts up to `max_retries` times.
    ///
    /// Retry `n` waits `retry_backoff * 2^n` first. Cancellation is never retried.
    /// Returns the last error once attempts are exhausted.
    pub async fn run_job_with_retry(&self, job: &Job) -> Result<JobOutput, JobError> {
        let mut attempt = 0u32;
        loop {
            if attempt > 0 {
                let delay = self.backoff_delay(attempt);
                self.publish(QueueEvent::JobRetry {
                    job_id: job.id,
                    attempt,
                    delay: delay.as_millis() as u64,
                });
                tokio::time::sleep(delay).await;
            }

            match self.run_job(job).await {
                Ok(output) => return Ok(output),
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    attempt += 1;
                    tracing::info!("Job {} attempt failed, retrying ({}): {}", job.id, attempt, e);
                    self.publish(QueueEvent::JobRetrying {
                        job_id: job.id,
                        attempt,
                        error: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        self.config
            .retry_backoff
            .saturating_mul(2u32.saturating_pow(attempt))
    }

    /// Spawn the subprocess for a job and wait for it to finish, time out or be cancelled.
    pub async fn execute_job(&self, job: &Job) -> Result<JobOutput, JobError> {
        let job_id = job.id;
        if self.take_abandoned(job_id) {
            return Err(self.fail(JobError::Cancelled { job_id }));
        }

        let mut command = Command::new(&self.config.command.program);
        command
            .args(self.config.command.render_args(&job.domain))
            .current_dir(&self.config.project_root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(source) => return Err(self.fail(JobError::Spawn { job_id, source })),
        };

        let started = Instant::now();
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let registered = {
            let mut active = self.active();
            let abandoned = active.abandoned.remove(&job_id);
            if !abandoned {
                active.running.insert(
                    job_id,
                    ActiveJob {
                        domain: job.domain.clone(),
                        started,
                        cancel: cancel_tx,
                    },
                );
            }
            !abandoned
        };
        if !registered {
            let _ = child.start_kill();
            let _ = child.wait().await;
            return Err(self.fail(JobError::Cancelled { job_id }));
        }

        tracing::info!("Started job {} for {}", job_id, job.domain);
        self.publish(QueueEvent::JobStarted {
            job_id,
            domain: job.domain.clone(),
        });

        let mut stdout = child
            .stdout
            .take()
            .map(|out| tokio::spawn(stream_stdout(out, job_id, self.events.clone())));
        let stderr = child
            .stderr
            .take()
            .map(|err| tokio::spawn(stream_stderr(err, job_id, self.events.clone())));

        // A background child can keep stdout open after the process exits, so
        // the drain is bounded by the timeout and cancellation too.
        let exit = tokio::select! {
            (status, output) = async {
                let status = child.wait().await;
                let output = match stdout.as_mut() {
                    Some(reader) => reader.await.unwrap_or_default(),
                    None => String::new(),
                };
                (status, output)
            } => Exit::Finished(status, output),
            _ = tokio::time::sleep(self.config.timeout) => Exit::TimedOut,
            _ = cancel_rx => Exit::Cancelled,
        };

        if !matches!(exit, Exit::Finished(..)) {
            let _ = child.start_kill();
            let _ = child.wait().await;
            if let Some(reader) = &stdout {
                reader.abort();
            }
            if let Some(reader) = &stderr {
                reader.abort();
            }
        }
        self.active().running.remove(&job_id);

        let duration = started.elapsed();
        match exit {
            Exit::Finished(Ok(status), output) if status.success() => {
                tracing::info!("Job {} completed in {:?}", job_id, duration);
                self.publish(QueueEvent::JobCompleted {
                    job_id,
                    duration: duration.as_millis() as u64,
                });
                Ok(JobOutput {
                    job_id,
                    domain: job.domain.clone(),
                    duration,
                    output,
                })
            }
            Exit::Finished(Ok(status), _) => Err(self.fail(JobError::NonZeroExit {
                job_id,
                code: status.code(),
            })),
            Exit::Finished(Err(source), _) => Err(self.fail(JobError::Wait { job_id, source })),
            Exit::TimedOut => Err(self.fail(JobError::Timeout {
                job_id,
                timeout: self.config.timeout,
            })),
            Exit::Cancelled => Err(self.fail(JobError::Cancelled { job_id })),
        }
    }

    fn fail(&self, error: JobError) -> JobError {
        let job_id = match &error {
            JobError::Spawn { job_id, .. }
            | JobError::NonZeroExit { job_id, .. }
            | JobError::Timeout { job_id, .. }
            | JobError::Cancelled { job_id }
            | JobError::Wait { job_id, .. } => *job_id,
        };
        tracing::warn!("{}", error);
        self.publish(QueueEvent::JobFailed {
            job_id,
            error: error.to_string(),
        });
        error
    }

    fn take_abandoned(&self, job_id: JobId) -> bool {
        self.active().abandoned.remove(&job_id)
    }

    /// Force-terminate a running job. Returns whether it was running.
    pub fn cancel_job(&self, job_id: JobId) -> bool {
        let Some(job) = self.active().running.remove(&job_id) else {
            return false;
        };
        let _ = job.cancel.send(());
        tracing::info!(
            "Cancelled job {} ({}) after {:?}",
            job_id,
            job.domain,
            job.started.elapsed()
        );
        self.publish(QueueEvent::JobCancelled { job_id });
        true
    }

    /// Cancel a job that was handed to the runner, whether or not its
    /// subprocess exists yet. A job still waiting for a slot or backing off
    /// fails with [`JobError::Cancelled`] instead of starting.
    pub fn abandon_job(&self, job_id: JobId) {
        if !self.cancel_job(job_id) {
            self.active().abandoned.insert(job_id);
        }
    }

    /// Drop a pending cancellation mark for a job that has finished.
    pub fn forget_job(&self, job_id: JobId) {
        self.active().abandoned.remove(&job_id);
    }

    /// Force-terminate every running job.
    pub fn cancel_all(&self) {
        let drained: Vec<(JobId, ActiveJob)> = self.active().running.drain().collect();
        for (job_id, job) in drained {
            let _ = job.cancel.send(());
            tracing::info!("Cancelled job {} ({})", job_id, job.domain);
        }
        self.publish(QueueEvent::AllJobsCancelled);
    }

    /// Resolves once a concurrency slot is free.
    pub async fn wait_for_capacity(&self) {
        self.limiter.ready().await;
    }

    /// Number of subprocesses currently alive.
    pub fn get_active_count(&self) -> usize {
        self.active().running.len()
    }

    pub fn is_job_running(&self, job_id: JobId) -> bool {
        self.active().running.contains_key(&job_id)
    }
}

async fn stream_stdout<R>(stdout: R, job_id: JobId, events: broadcast::Sender<QueueEvent>) -> String
where
    R: AsyncRead + Unpin,
{
    let mut output = String::new();
    let mut lines = BufReader::new(stdout).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        output.push_str(&line);
        output.push('\n');

        let phase = detect_phase(&line);
        let _ = events.send(QueueEvent::JobLog {
            job_id,
            text: line,
        });
        if let Some(phase) = phase {
            let _ = events.send(QueueEvent::JobPhase {
                job_id,
                phase: phase.number,
                name: phase.name.to_string(),
            });
        }
    }
    output
}

async fn stream_stderr<R>(stderr: R, job_id: JobId, events: broadcast::Sender<QueueEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let _ = events.send(QueueEvent::JobStderr { job_id, text: line });
    }
}
