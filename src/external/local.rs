//! Standalone implementations of the collaborator traits.
//!
//! - [`SpoolTaskQueue`]: one JSON file per waiting job in a spool directory
//! - [`FileReplicaCatalog`]: dataset to site map in a JSON file
//! - [`DirectorySandboxStore`]: sandboxes as plain directories
//! - [`JsonLinesAccountingSink`]: accounting records appended to a file
//! - [`LogJobTracker`]: status changes written to the log

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::endpoint::Requirements;
use crate::error::{ExternalError, ExternalResult};
use crate::external::{
    AccountingRecord, AccountingSink, ExternalJobTracker, JobAttributes, QueueDescriptor,
    ReplicaCatalog, SandboxKind, SandboxStore, TaskQueue,
};
use crate::ledger::JobId;

const WAITING_SUFFIX: &str = ".json";
const TAKEN_SUFFIX: &str = ".taken";

/// A job description as stored in the spool.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SpoolJob {
    pub queue: u64,
    pub priority: i64,
    pub cpu_time: u64,
    pub arguments: Option<String>,
    pub input_dataset: Option<String>,
    pub attributes: JobAttributes,
}

/// Task queue backed by a spool directory.
///
/// Waiting jobs are `<job_id>.json`; taking a job renames it to
/// `<job_id>.json.taken` and releasing renames it back.
#[derive(Debug, Clone)]
pub struct SpoolTaskQueue {
    dir: PathBuf,
}

impl SpoolTaskQueue {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn waiting_path(&self, job_id: JobId) -> PathBuf {
        self.dir.join(format!("{}{}", job_id, WAITING_SUFFIX))
    }

    fn taken_path(&self, job_id: JobId) -> PathBuf {
        self.dir
            .join(format!("{}{}{}", job_id, WAITING_SUFFIX, TAKEN_SUFFIX))
    }

    async fn waiting_jobs(&self) -> ExternalResult<Vec<(JobId, SpoolJob)>> {
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| spool_error(&self.dir, e))?;
        let mut jobs = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| spool_error(&self.dir, e))?
        {
            let file_name = entry.file_name();
            let Some(id) = file_name
                .to_str()
                .and_then(|name| name.strip_suffix(WAITING_SUFFIX))
                .and_then(|stem| stem.parse::<JobId>().ok())
            else {
                continue;
            };
            match read_job(&entry.path()).await {
                Ok(job) => jobs.push((id, job)),
                Err(e) => tracing::warn!(job_id = id, error = %e, "Skipping unreadable spool entry"),
            }
        }
        jobs.sort_by_key(|(id, _)| *id);
        Ok(jobs)
    }

    /// Job description, whether waiting or taken.
    async fn job(&self, job_id: JobId) -> ExternalResult<SpoolJob> {
        let taken = self.taken_path(job_id);
        if tokio::fs::try_exists(&taken).await.unwrap_or(false) {
            return read_job(&taken).await;
        }
        read_job(&self.waiting_path(job_id)).await
    }
}

fn spool_error(path: &Path, e: std::io::Error) -> ExternalError {
    ExternalError::new("TaskQueue", format!("{}: {}", path.display(), e))
}

async fn read_job(path: &Path) -> ExternalResult<SpoolJob> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| spool_error(path, e))?;
    serde_json::from_str(&content)
        .map_err(|e| ExternalError::new("TaskQueue", format!("{}: {}", path.display(), e)))
}

#[async_trait]
impl TaskQueue for SpoolTaskQueue {
    async fn matching_queues(
        &self,
        requirements: &Requirements,
    ) -> ExternalResult<Vec<QueueDescriptor>> {
        let mut queues: BTreeMap<u64, QueueDescriptor> = BTreeMap::new();
        for (_, job) in self.waiting_jobs().await? {
            if requirements.cpu_time > 0 && job.cpu_time > requirements.cpu_time {
                continue;
            }
            let queue = queues.entry(job.queue).or_insert_with(|| QueueDescriptor {
                id: job.queue,
                jobs: 0,
                priority: job.priority,
                cpu_time: job.cpu_time,
            });
            queue.jobs += 1;
            queue.priority = queue.priority.max(job.priority);
            queue.cpu_time = queue.cpu_time.max(job.cpu_time);
        }
        let mut queues: Vec<QueueDescriptor> = queues.into_values().collect();
        queues.sort_by(|a, b| b.priority.cmp(&a.priority));
        Ok(queues)
    }

    async fn take_one_job(&self, queue: &QueueDescriptor) -> ExternalResult<Option<JobId>> {
        let next = self
            .waiting_jobs()
            .await?
            .into_iter()
            .filter(|(_, job)| job.queue == queue.id)
            .max_by(|(a_id, a), (b_id, b)| a.priority.cmp(&b.priority).then(b_id.cmp(a_id)));
        let Some((job_id, _)) = next else {
            return Ok(None);
        };
        let from = self.waiting_path(job_id);
        tokio::fs::rename(&from, self.taken_path(job_id))
            .await
            .map_err(|e| spool_error(&from, e))?;
        Ok(Some(job_id))
    }

    async fn job_arguments(&self, job_id: JobId) -> ExternalResult<Option<String>> {
        Ok(self
            .job(job_id)
            .await?
            .arguments
            .filter(|a| !a.trim().is_empty()))
    }

    async fn input_dataset(&self, job_id: JobId) -> ExternalResult<Option<String>> {
        Ok(self
            .job(job_id)
            .await?
            .input_dataset
            .filter(|d| !d.trim().is_empty()))
    }

    async fn job_attributes(&self, job_id: JobId) -> ExternalResult<JobAttributes> {
        Ok(self.job(job_id).await?.attributes)
    }

    async fn release_job(&self, job_id: JobId) -> ExternalResult<()> {
        let taken = self.taken_path(job_id);
        tokio::fs::rename(&taken, self.waiting_path(job_id))
            .await
            .map_err(|e| spool_error(&taken, e))
    }
}

/// Replica catalog read from a JSON object mapping dataset to site labels.
///
/// The file is re-read on every lookup.
#[derive(Debug, Clone)]
pub struct FileReplicaCatalog {
    path: PathBuf,
}

impl FileReplicaCatalog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ReplicaCatalog for FileReplicaCatalog {
    async fn replica_sites(&self, dataset: &str) -> ExternalResult<Vec<String>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(ExternalError::new(
                    "ReplicaCatalog",
                    format!("{}: {}", self.path.display(), e),
                ))
            }
        };
        let replicas: HashMap<String, Vec<String>> = serde_json::from_str(&content)
            .map_err(|e| ExternalError::new("ReplicaCatalog", e.to_string()))?;
        Ok(replicas.get(dataset).cloned().unwrap_or_default())
    }
}

/// Sandboxes stored as `<root>/<job_id>/<Input|Output>/`.
#[derive(Debug, Clone)]
pub struct DirectorySandboxStore {
    root: PathBuf,
}

impl DirectorySandboxStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn sandbox_dir(&self, job_id: JobId, kind: SandboxKind) -> PathBuf {
        self.root.join(job_id.to_string()).join(kind.as_str())
    }
}

fn sandbox_error(e: impl std::fmt::Display) -> ExternalError {
    ExternalError::new("SandboxStore", e.to_string())
}

#[async_trait]
impl SandboxStore for DirectorySandboxStore {
    async fn upload(
        &self,
        files: &[PathBuf],
        job_id: JobId,
        kind: SandboxKind,
        size_limit: u64,
    ) -> ExternalResult<()> {
        let mut total = 0u64;
        for file in files {
            total += tokio::fs::metadata(file)
                .await
                .map_err(|e| sandbox_error(format!("{}: {}", file.display(), e)))?
                .len();
        }
        if total > size_limit {
            return Err(sandbox_error(format!(
                "sandbox of {} bytes exceeds limit of {} bytes",
                total, size_limit
            )));
        }

        let target = self.sandbox_dir(job_id, kind);
        tokio::fs::create_dir_all(&target)
            .await
            .map_err(sandbox_error)?;
        for file in files {
            let Some(name) = file.file_name() else {
                continue;
            };
            tokio::fs::copy(file, target.join(name))
                .await
                .map_err(|e| sandbox_error(format!("{}: {}", file.display(), e)))?;
        }
        tracing::debug!(job_id, kind = kind.as_str(), bytes = total, "Sandbox stored");
        Ok(())
    }

    async fn download_input(
        &self,
        job_id: JobId,
        destination: &Path,
    ) -> ExternalResult<Vec<PathBuf>> {
        let source = self.sandbox_dir(job_id, SandboxKind::Input);
        tokio::fs::create_dir_all(destination)
            .await
            .map_err(sandbox_error)?;
        let mut entries = match tokio::fs::read_dir(&source).await {
            Ok(entries) => entries,
            // A job without an input sandbox
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(sandbox_error(e)),
        };
        let mut written = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(sandbox_error)? {
            if !entry.file_type().await.map_err(sandbox_error)?.is_file() {
                continue;
            }
            let target = destination.join(entry.file_name());
            tokio::fs::copy(entry.path(), &target)
                .await
                .map_err(sandbox_error)?;
            written.push(target);
        }
        written.sort();
        Ok(written)
    }
}

/// Accounting sink appending one JSON object per line on commit.
#[derive(Debug)]
pub struct JsonLinesAccountingSink {
    path: PathBuf,
    pending: Mutex<Vec<AccountingRecord>>,
}

impl JsonLinesAccountingSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            pending: Mutex::new(Vec::new()),
        }
    }
}

fn accounting_error(e: impl std::fmt::Display) -> ExternalError {
    ExternalError::new("Accounting", e.to_string())
}

#[async_trait]
impl AccountingSink for JsonLinesAccountingSink {
    async fn record(&self, record: &AccountingRecord) -> ExternalResult<()> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
        Ok(())
    }

    async fn commit(&self) -> ExternalResult<()> {
        let records = std::mem::take(
            &mut *self
                .pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        if records.is_empty() {
            return Ok(());
        }

        let mut buffer = String::new();
        for record in &records {
            buffer.push_str(&serde_json::to_string(record).map_err(accounting_error)?);
            buffer.push('\n');
        }

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(accounting_error)?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(accounting_error)?;
        file.write_all(buffer.as_bytes())
            .await
            .map_err(accounting_error)?;
        file.flush().await.map_err(accounting_error)?;
        tracing::debug!(records = records.len(), path = %self.path.display(), "Accounting committed");
        Ok(())
    }
}

/// Tracker that only logs what it is told.
#[derive(Debug, Default, Clone)]
pub struct LogJobTracker;

#[async_trait]
impl ExternalJobTracker for LogJobTracker {
    async fn set_status(
        &self,
        job_id: JobId,
        status: &str,
        message: &str,
        origin: &str,
    ) -> ExternalResult<()> {
        tracing::info!(job_id, status, message, origin, "Job status");
        Ok(())
    }

    async fn set_site(&self, job_id: JobId, site: &str) -> ExternalResult<()> {
        tracing::info!(job_id, site, "Job site");
        Ok(())
    }

    async fn set_attribute(&self, job_id: JobId, key: &str, value: &str) -> ExternalResult<()> {
        tracing::info!(job_id, key, value, "Job attribute");
        Ok(())
    }
}
