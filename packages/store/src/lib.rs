//! File-snapshot persistence for batches, jobs and research results.
//!
//! Layout inside the data directory:
//!
//! - `batch-<id>.json`: batch metadata
//! - `batch-<id>-jobs.json`: the full job list of the batch
//! - `batch-<id>-results/<sanitized-domain>.json`: one result document per domain
//!
//! The store does not validate content; business rules live in the queue manager.
//! Every write replaces the whole file (temp file + rename).

use std::path::{Path, PathBuf};

use chrono::Utc;
use queue_core::domain::{sanitize_domain, unsanitize_domain};
use queue_core::{Batch, BatchId, Job, JobId};
use serde::{Serialize, de::DeserializeOwned};
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Default data directory, relative to the working directory.
pub const DEFAULT_DATA_DIR: &str = "./data/queues";

const BATCH_PREFIX: &str = "batch-";
const JSON_EXT: &str = ".json";

/// Store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Durable file-based queue store.
#[derive(Debug, Clone)]
pub struct QueueStore {
    data_dir: PathBuf,
}

impl QueueStore {
    /// Open a store rooted at `data_dir`, creating the directory if missing.
    pub async fn open(data_dir: impl AsRef<Path>) -> StoreResult<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        fs::create_dir_all(&data_dir).await?;
        Ok(Self { data_dir })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn batch_path(&self, batch_id: BatchId) -> PathBuf {
        self.data_dir.join(format!("{BATCH_PREFIX}{batch_id}{JSON_EXT}"))
    }

    fn jobs_path(&self, batch_id: BatchId) -> PathBuf {
        self.data_dir.join(format!("{BATCH_PREFIX}{batch_id}-jobs{JSON_EXT}"))
    }

    fn results_dir(&self, batch_id: BatchId) -> PathBuf {
        self.data_dir.join(format!("{BATCH_PREFIX}{batch_id}-results"))
    }

    fn result_path(&self, batch_id: BatchId, domain: &str) -> PathBuf {
        self.results_dir(batch_id)
            .join(format!("{}{JSON_EXT}", sanitize_domain(domain)))
    }

    /// Save batch metadata, stamping `updated_at`. Returns the document as written.
    pub async fn save_batch(&self, batch: &Batch) -> StoreResult<Batch> {
        let mut doc = batch.clone();
        doc.updated_at = Utc::now();
        write_json(&self.batch_path(batch.id), &doc).await?;
        Ok(doc)
    }

    /// Load batch metadata; `None` if no snapshot exists.
    pub async fn load_batch(&self, batch_id: BatchId) -> StoreResult<Option<Batch>> {
        read_json(&self.batch_path(batch_id)).await
    }

    /// Overwrite the complete job list of a batch.
    pub async fn save_jobs(&self, batch_id: BatchId, jobs: &[Job]) -> StoreResult<()> {
        write_json(&self.jobs_path(batch_id), &jobs).await
    }

    /// Load the job list of a batch; empty if no snapshot exists.
    pub async fn load_jobs(&self, batch_id: BatchId) -> StoreResult<Vec<Job>> {
        Ok(read_json(&self.jobs_path(batch_id)).await?.unwrap_or_default())
    }

    /// Load the job list, apply `update` to the matching job and save the list.
    ///
    /// Returns `false` without writing when the job is not in the list.
    pub async fn update_job<F>(&self, batch_id: BatchId, job_id: JobId, update: F) -> StoreResult<bool>
    where
        F: FnOnce(&mut Job),
    {
        let mut jobs = self.load_jobs(batch_id).await?;
        let Some(job) = jobs.iter_mut().find(|j| j.id == job_id) else {
            return Ok(false);
        };
        update(job);
        self.save_jobs(batch_id, &jobs).await?;
        Ok(true)
    }

    /// Store the research payload for one domain of a batch.
    pub async fn save_result(
        &self,
        batch_id: BatchId,
        domain: &str,
        data: &serde_json::Value,
    ) -> StoreResult<()> {
        fs::create_dir_all(self.results_dir(batch_id)).await?;
        write_json(&self.result_path(batch_id, domain), data).await
    }

    pub async fn load_result(
        &self,
        batch_id: BatchId,
        domain: &str,
    ) -> StoreResult<Option<serde_json::Value>> {
        read_json(&self.result_path(batch_id, domain)).await
    }

    /// Domains with a stored result, recovered from the sanitized file names.
    pub async fn list_results(&self, batch_id: BatchId) -> StoreResult<Vec<String>> {
        let dir = self.results_dir(batch_id);
        if !fs::try_exists(&dir).await? {
            return Ok(Vec::new());
        }

        let mut domains = Vec::new();
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if let Some(stem) = name.to_string_lossy().strip_suffix(JSON_EXT) {
                domains.push(unsanitize_domain(stem));
            }
        }
        domains.sort();
        Ok(domains)
    }

    /// Remove every file belonging to a batch. Missing files are skipped.
    pub async fn delete_batch(&self, batch_id: BatchId) -> StoreResult<()> {
        remove_if_exists(&self.batch_path(batch_id)).await?;
        remove_if_exists(&self.jobs_path(batch_id)).await?;

        let results = self.results_dir(batch_id);
        if fs::try_exists(&results).await? {
            fs::remove_dir_all(&results).await?;
        }

        tracing::debug!("Deleted stored data for batch {}", batch_id);
        Ok(())
    }

    /// All batch metadata documents in the data directory, oldest first.
    ///
    /// Unparseable snapshots are skipped with a warning.
    pub async fn list_batches(&self) -> StoreResult<Vec<Batch>> {
        let mut batches = Vec::new();
        let mut entries = fs::read_dir(&self.data_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let Some(batch_id) = parse_batch_file_name(&file_name.to_string_lossy()) else {
                continue;
            };

            match self.load_batch(batch_id).await {
                Ok(Some(batch)) => batches.push(batch),
                Ok(None) => {}
                Err(e) => tracing::warn!("Skipping unreadable batch snapshot {}: {}", batch_id, e),
            }
        }

        batches.sort_by_key(|b| b.created_at);
        Ok(batches)
    }

    /// Batches whose last persisted status was `running` or `paused`.
    pub async fn get_resumable_batches(&self) -> StoreResult<Vec<Batch>> {
        let mut batches = self.list_batches().await?;
        batches.retain(|b| b.status.is_resumable());
        Ok(batches)
    }
}

/// Extract the batch id from a metadata file name (`batch-<id>.json`).
///
/// Job lists and temp files do not match.
fn parse_batch_file_name(name: &str) -> Option<BatchId> {
    let id = name.strip_prefix(BATCH_PREFIX)?.strip_suffix(JSON_EXT)?;
    if id.contains('-') {
        return None;
    }
    BatchId::parse(id).ok()
}

async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> StoreResult<()> {
    let json = serde_json::to_string_pretty(value).map_err(|source| StoreError::Json {
        path: path.to_path_buf(),
        source,
    })?;

    // Write to temp file first, then rename for atomicity
    let mut temp_name = path.as_os_str().to_owned();
    temp_name.push(".tmp");
    let temp_path = PathBuf::from(temp_name);

    let mut file = fs::File::create(&temp_path).await?;
    file.write_all(json.as_bytes()).await?;
    file.sync_all().await?;
    fs::rename(&temp_path, path).await?;

    tracing::debug!("Saved {:?}", path);
    Ok(())
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> StoreResult<Option<T>> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let value = serde_json::from_slice(&bytes).map_err(|source| StoreError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(Some(value))
}

async fn remove_if_exists(path: &Path) -> StoreResult<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::disallowed_methods)]

    use super::*;
    use queue_core::{BatchOptions, BatchStatus, JobStatus};
    use serde_json::json;

    async fn temp_store() -> Result<(tempfile::TempDir, QueueStore), StoreError> {
        let dir = tempfile::tempdir()?;
        let store = QueueStore::open(dir.path().join("queues")).await?;
        Ok((dir, store))
    }

    fn jobs_for(batch: &Batch, domains: &[&str]) -> Vec<Job> {
        domains
            .iter()
            .enumerate()
            .map(|(i, d)| Job::new(batch.id, *d, i))
            .collect()
    }

    #[tokio::test]
    async fn creates_missing_data_dir() -> Result<(), StoreError> {
        let (dir, store) = temp_store().await?;
        assert!(dir.path().join("queues").is_dir());
        assert_eq!(store.data_dir(), dir.path().join("queues"));
        Ok(())
    }

    #[tokio::test]
    async fn batch_round_trip() -> Result<(), StoreError> {
        let (_dir, store) = temp_store().await?;
        let mut batch = Batch::new(4, BatchOptions::default().with_auto_start(false));
        batch.status = BatchStatus::Paused;
        batch.completed_jobs = 2;
        batch.failed_jobs = 1;

        let written = store.save_batch(&batch).await?;
        assert!(written.updated_at >= batch.updated_at);

        let loaded = store.load_batch(batch.id).await?.expect("batch persisted");
        assert_eq!(loaded.id, batch.id);
        assert_eq!(loaded.status, BatchStatus::Paused);
        assert_eq!(loaded.total_jobs, 4);
        assert_eq!(loaded.completed_jobs, 2);
        assert_eq!(loaded.failed_jobs, 1);
        assert_eq!(loaded.options, batch.options);

        let raw = std::fs::read_to_string(store.data_dir().join(format!("batch-{}.json", batch.id)))?;
        let doc: serde_json::Value = serde_json::from_str(&raw).expect("valid json");
        assert!(doc["updatedAt"].as_str().is_some());
        assert_eq!(doc["totalJobs"], 4);
        Ok(())
    }

    #[tokio::test]
    async fn missing_batch_is_none() -> Result<(), StoreError> {
        let (_dir, store) = temp_store().await?;
        assert!(store.load_batch(BatchId::new()).await?.is_none());
        assert!(store.load_jobs(BatchId::new()).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn update_job_merges_into_full_list() -> Result<(), StoreError> {
        let (_dir, store) = temp_store().await?;
        let batch = Batch::new(2, BatchOptions::default());
        let jobs = jobs_for(&batch, &["a.com", "b.com"]);
        store.save_jobs(batch.id, &jobs).await?;

        let found = store
            .update_job(batch.id, jobs[1].id, |job| job.mark_failed("exit 1", Utc::now()))
            .await?;
        assert!(found);

        let loaded = store.load_jobs(batch.id).await?;
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].status, JobStatus::Pending);
        assert_eq!(loaded[1].status, JobStatus::Failed);
        assert_eq!(loaded[1].error.as_deref(), Some("exit 1"));
        assert_eq!(loaded[1].order, 1);
        assert_eq!(loaded[1].batch_id, batch.id);
        Ok(())
    }

    #[tokio::test]
    async fn update_unknown_job_is_a_no_op() -> Result<(), StoreError> {
        let (_dir, store) = temp_store().await?;
        let batch = Batch::new(1, BatchOptions::default());
        let jobs = jobs_for(&batch, &["a.com"]);
        store.save_jobs(batch.id, &jobs).await?;

        let found = store
            .update_job(batch.id, JobId::new(), |job| job.retries = 9)
            .await?;
        assert!(!found);
        assert_eq!(store.load_jobs(batch.id).await?, jobs);
        Ok(())
    }

    #[tokio::test]
    async fn results_round_trip_and_listing() -> Result<(), StoreError> {
        let (_dir, store) = temp_store().await?;
        let batch_id = BatchId::new();
        let data = json!({"company": {"name": "A"}, "contacts": [1, 2, 3]});

        store.save_result(batch_id, "a.com", &data).await?;
        store.save_result(batch_id, "www.b.io", &json!({"ok": true})).await?;

        assert_eq!(store.load_result(batch_id, "a.com").await?, Some(data));
        assert!(store.load_result(batch_id, "missing.com").await?.is_none());
        assert!(
            store
                .data_dir()
                .join(format!("batch-{batch_id}-results/www-b-io.json"))
                .is_file()
        );
        assert_eq!(store.list_results(batch_id).await?, vec!["a.com", "www.b.io"]);
        assert!(store.list_results(BatchId::new()).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn delete_batch_removes_everything_and_is_idempotent() -> Result<(), StoreError> {
        let (_dir, store) = temp_store().await?;
        let batch = Batch::new(1, BatchOptions::default());
        store.save_batch(&batch).await?;
        store.save_jobs(batch.id, &jobs_for(&batch, &["a.com"])).await?;
        store.save_result(batch.id, "a.com", &json!({})).await?;

        store.delete_batch(batch.id).await?;
        assert!(store.load_batch(batch.id).await?.is_none());
        assert!(store.load_jobs(batch.id).await?.is_empty());
        assert!(store.list_results(batch.id).await?.is_empty());

        store.delete_batch(batch.id).await?;
        Ok(())
    }

    #[tokio::test]
    async fn lists_batches_and_resumable_subset() -> Result<(), StoreError> {
        let (_dir, store) = temp_store().await?;
        let mut ids = Vec::new();
        for status in [
            BatchStatus::Created,
            BatchStatus::Running,
            BatchStatus::Paused,
            BatchStatus::Completed,
            BatchStatus::Cancelled,
        ] {
            let mut batch = Batch::new(1, BatchOptions::default());
            batch.status = status;
            store.save_batch(&batch).await?;
            store.save_jobs(batch.id, &jobs_for(&batch, &["a.com"])).await?;
            ids.push(batch.id);
        }
        std::fs::write(store.data_dir().join("notes.txt"), "ignored")?;

        let all = store.list_batches().await?;
        assert_eq!(all.len(), 5);

        let resumable: Vec<BatchStatus> = store
            .get_resumable_batches()
            .await?
            .into_iter()
            .map(|b| b.status)
            .collect();
        assert_eq!(resumable.len(), 2);
        assert!(resumable.contains(&BatchStatus::Running));
        assert!(resumable.contains(&BatchStatus::Paused));
        Ok(())
    }

    #[tokio::test]
    async fn corrupt_snapshot_is_skipped_when_listing() -> Result<(), StoreError> {
        let (_dir, store) = temp_store().await?;
        let batch = Batch::new(1, BatchOptions::default());
        store.save_batch(&batch).await?;

        let broken = BatchId::new();
        std::fs::write(store.data_dir().join(format!("batch-{broken}.json")), "{not json")?;

        let listed = store.list_batches().await?;
        assert_eq!(listed.len(), 1);
        assert!(matches!(
            store.load_batch(broken).await,
            Err(StoreError::Json { .. })
        ));
        Ok(())
    }

    #[test]
    fn batch_file_names_exclude_jobs_and_results() {
        let id = BatchId::new();
        assert_eq!(parse_batch_file_name(&format!("batch-{id}.json")), Some(id));
        assert_eq!(parse_batch_file_name(&format!("batch-{id}-jobs.json")), None);
        assert_eq!(parse_batch_file_name(&format!("batch-{id}.json.tmp")), None);
        assert_eq!(parse_batch_file_name("batch-nope.json"), None);
    }
}
