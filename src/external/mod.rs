//! Services this crate consumes but does not own.
//!
//! The task queue, replica catalog, sandbox store, accounting system and
//! job tracker belong to the wider grid scheduling system. They are reached
//! through the traits below; [`local`] provides directory and file backed
//! implementations for running the agent standalone.

pub mod local;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::endpoint::Requirements;
use crate::error::ExternalResult;
use crate::ledger::JobId;

/// A task queue whose jobs fit an endpoint's requirements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDescriptor {
    pub id: u64,
    /// Jobs currently waiting in the queue.
    pub jobs: u32,
    pub priority: i64,
    pub cpu_time: u64,
}

/// Job attributes kept by the task queue's job store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobAttributes {
    pub name: String,
    pub owner: String,
    pub owner_group: String,
    /// `Executable` attribute of the job description, when present.
    pub executable: Option<String>,
    /// Output sandbox patterns, relative to the job's staging directory.
    pub output_sandbox: Vec<String>,
    pub status: String,
    pub minor_status: String,
    pub site: String,
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn matching_queues(
        &self,
        requirements: &Requirements,
    ) -> ExternalResult<Vec<QueueDescriptor>>;

    /// Pop one job from a queue. `None` once the queue is empty.
    async fn take_one_job(&self, queue: &QueueDescriptor) -> ExternalResult<Option<JobId>>;

    /// Raw `Arguments` string of the job description.
    async fn job_arguments(&self, job_id: JobId) -> ExternalResult<Option<String>>;

    async fn input_dataset(&self, job_id: JobId) -> ExternalResult<Option<String>>;

    async fn job_attributes(&self, job_id: JobId) -> ExternalResult<JobAttributes>;

    /// Hand back a job that was taken but not submitted this cycle.
    async fn release_job(&self, _job_id: JobId) -> ExternalResult<()> {
        Ok(())
    }
}

#[async_trait]
pub trait ReplicaCatalog: Send + Sync {
    /// Labels of the sites holding a replica of `dataset`.
    async fn replica_sites(&self, dataset: &str) -> ExternalResult<Vec<String>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SandboxKind {
    Input,
    Output,
}

impl SandboxKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SandboxKind::Input => "Input",
            SandboxKind::Output => "Output",
        }
    }
}

#[async_trait]
pub trait SandboxStore: Send + Sync {
    /// Upload a resolved file list as the job's sandbox of `kind`.
    ///
    /// Fails when the files add up to more than `size_limit` bytes.
    async fn upload(
        &self,
        files: &[PathBuf],
        job_id: JobId,
        kind: SandboxKind,
        size_limit: u64,
    ) -> ExternalResult<()>;

    /// Unpack the job's input sandbox into `destination`, returning the
    /// files written.
    async fn download_input(&self, job_id: JobId, destination: &Path)
        -> ExternalResult<Vec<PathBuf>>;
}

/// One job accounting record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountingRecord {
    #[serde(rename = "JobID")]
    pub job_id: JobId,
    #[serde(rename = "User")]
    pub user: String,
    #[serde(rename = "UserGroup")]
    pub user_group: String,
    #[serde(rename = "JobGroup")]
    pub job_group: String,
    #[serde(rename = "JobType")]
    pub job_type: String,
    #[serde(rename = "JobClass")]
    pub job_class: String,
    #[serde(rename = "ProcessingType")]
    pub processing_type: String,
    #[serde(rename = "FinalMajorStatus")]
    pub final_major_status: String,
    #[serde(rename = "FinalMinorStatus")]
    pub final_minor_status: String,
    /// Seconds.
    #[serde(rename = "CPUTime")]
    pub cpu_time: f64,
    #[serde(rename = "NormCPUTime")]
    pub norm_cpu_time: f64,
    /// Seconds.
    #[serde(rename = "ExecTime")]
    pub exec_time: f64,
    #[serde(rename = "InputDataSize")]
    pub input_data_size: u64,
    #[serde(rename = "OutputDataSize")]
    pub output_data_size: u64,
    #[serde(rename = "InputDataFiles")]
    pub input_data_files: u64,
    #[serde(rename = "OutputDataFiles")]
    pub output_data_files: u64,
    #[serde(rename = "DiskSpace")]
    pub disk_space: u64,
    #[serde(rename = "InputSandBoxSize")]
    pub input_sandbox_size: u64,
    #[serde(rename = "OutputSandBoxSize")]
    pub output_sandbox_size: u64,
    #[serde(rename = "ProcessedEvents")]
    pub processed_events: u64,
    #[serde(rename = "Site")]
    pub site: String,
    #[serde(rename = "StartTime")]
    pub start_time: DateTime<Utc>,
    #[serde(rename = "EndTime")]
    pub end_time: DateTime<Utc>,
}

#[async_trait]
pub trait AccountingSink: Send + Sync {
    async fn record(&self, record: &AccountingRecord) -> ExternalResult<()>;

    /// Flush everything recorded so far.
    async fn commit(&self) -> ExternalResult<()>;
}

/// Status view of the wider grid scheduling system.
#[async_trait]
pub trait ExternalJobTracker: Send + Sync {
    async fn set_status(
        &self,
        job_id: JobId,
        status: &str,
        message: &str,
        origin: &str,
    ) -> ExternalResult<()>;

    async fn set_site(&self, job_id: JobId, site: &str) -> ExternalResult<()>;

    async fn set_attribute(&self, job_id: JobId, key: &str, value: &str) -> ExternalResult<()>;
}

/// The external collaborators, bundled for the control loops.
#[derive(Clone)]
pub struct Collaborators {
    pub task_queue: Arc<dyn TaskQueue>,
    pub catalog: Arc<dyn ReplicaCatalog>,
    pub sandbox: Arc<dyn SandboxStore>,
    pub accounting: Arc<dyn AccountingSink>,
    pub tracker: Arc<dyn ExternalJobTracker>,
}
