//! Backend drivers.
//!
//! A [`BackendDriver`] knows how to stage, submit, poll, collect and clean
//! up jobs for one software family, version and language combination.
//! Drivers are looked up in a [`DriverTable`] keyed by [`DriverKey`]; a
//! combination with no registered driver is reported to the caller rather
//! than ignored.
//!
//! Everything backend specific (command strings, output formats, where job
//! identifiers hide in free text) stays inside the driver modules. Callers
//! only see [`StatusReport`] and opaque backend ids.

pub mod hadoop;
pub mod hive;
pub mod interactive;
pub mod output;

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::StagingConfig;
use crate::endpoint::Endpoint;
use crate::error::ExternalError;
use crate::external::{JobAttributes, SandboxStore};
use crate::ledger::{JobId, LedgerEntry};
use crate::transport::{
    CommandOutput, CredentialRef, RemoteExecutor, Timeouts, TransportError,
};

pub use hadoop::{HadoopV1Driver, HadoopV2Driver};
pub use hive::HiveDriver;
pub use interactive::InteractiveHadoopDriver;
pub use output::OutputReport;

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Could not parse {operation} output: {output}")]
    UnparseableOutput {
        operation: &'static str,
        output: String,
    },

    #[error("Staging error at {path}: {source}")]
    Staging {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Job {0} has no executable")]
    MissingExecutable(JobId),

    #[error(transparent)]
    External(#[from] ExternalError),
}

pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// Backend status normalized at the driver boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusReport {
    Running,
    Done,
    Unknown,
}

/// Lookup key for the driver table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DriverKey {
    pub software: String,
    pub version: String,
    pub language: String,
    pub interactive: bool,
}

impl DriverKey {
    pub fn new(software: &str, version: &str, language: &str, interactive: bool) -> Self {
        Self {
            software: software.trim().to_ascii_lowercase(),
            version: version.trim().to_ascii_lowercase(),
            language: language.trim().to_ascii_lowercase(),
            interactive,
        }
    }
}

impl fmt::Display for DriverKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.software, self.version, self.language)?;
        if self.interactive {
            f.write_str(" (interactive)")?;
        }
        Ok(())
    }
}

/// Everything a driver needs to submit one job.
#[derive(Debug, Clone)]
pub struct SubmissionContext {
    pub job_id: JobId,
    pub job_name: String,
    pub endpoint: Endpoint,
    pub input_dataset: String,
    pub attributes: JobAttributes,
}

impl SubmissionContext {
    pub fn credential(&self) -> CredentialRef {
        CredentialRef {
            owner: self.attributes.owner.clone(),
            group: self.attributes.owner_group.clone(),
        }
    }
}

/// A ledger entry together with the endpoint it runs on.
#[derive(Debug, Clone, Copy)]
pub struct JobTarget<'a> {
    pub endpoint: &'a Endpoint,
    pub entry: &'a LedgerEntry,
}

#[async_trait]
pub trait BackendDriver: Send + Sync {
    /// Stage and submit a job, returning the backend-assigned id.
    async fn submit(&self, ctx: &SubmissionContext) -> DriverResult<String>;

    async fn query_status(&self, target: JobTarget<'_>) -> DriverResult<StatusReport>;

    /// Bring the job's results back and upload them as its output sandbox.
    ///
    /// `patterns` are extra output sandbox entries, relative to the local job
    /// directory. Entries that match nothing end up in
    /// [`OutputReport::missing`].
    async fn fetch_output(
        &self,
        target: JobTarget<'_>,
        patterns: &[String],
    ) -> DriverResult<OutputReport>;

    /// Remove remote and local staging paths. Failures are logged only.
    async fn cleanup(&self, target: JobTarget<'_>);

    /// Backend text describing the finished job, for metric extraction.
    async fn completion_text(&self, target: JobTarget<'_>) -> DriverResult<String>;

    /// Called when a poll reports the job finished. A driver that runs jobs
    /// in stages submits the next stage here and returns its backend id.
    async fn trigger_followup(&self, _target: JobTarget<'_>) -> DriverResult<Option<String>> {
        Ok(None)
    }
}

/// Shared services and settings handed to every driver.
#[derive(Clone)]
pub struct DriverContext {
    pub executor: Arc<dyn RemoteExecutor>,
    pub sandbox: Arc<dyn SandboxStore>,
    pub staging: StagingConfig,
    pub timeouts: Timeouts,
    pub output_size_limit: u64,
}

impl DriverContext {
    /// Local working directory of a job.
    pub fn local_job_dir(&self, job_id: JobId) -> PathBuf {
        self.staging.local_dir.join(job_id.to_string())
    }

    /// Where the input sandbox is unpacked, inside the local job directory.
    pub fn input_sandbox_dir(&self, job_id: JobId) -> PathBuf {
        self.local_job_dir(job_id)
            .join(format!("InputSandbox{}", job_id))
    }

    /// Remote copy of the local job directory.
    pub fn remote_job_dir(&self, job_id: JobId) -> String {
        format!("{}/{}", self.staging.remote_dir.trim_end_matches('/'), job_id)
    }

    pub fn remote_input_dir(&self, job_id: JobId) -> String {
        format!("{}/InputSandbox{}", self.remote_job_dir(job_id), job_id)
    }

    /// Create the local job directory and unpack the input sandbox into it.
    pub async fn prepare_local(&self, job_id: JobId) -> DriverResult<Vec<PathBuf>> {
        let input_dir = self.input_sandbox_dir(job_id);
        tokio::fs::create_dir_all(&input_dir)
            .await
            .map_err(|source| DriverError::Staging {
                path: input_dir.clone(),
                source,
            })?;
        let files = self.sandbox.download_input(job_id, &input_dir).await?;
        tracing::debug!(job_id, files = files.len(), "Input sandbox staged");
        Ok(files)
    }

    /// Copy the local job directory to the backend host.
    pub async fn upload_job_dir(&self, endpoint: &Endpoint, job_id: JobId) -> DriverResult<()> {
        let local = self.local_job_dir(job_id);
        self.executor
            .copy(
                &endpoint.remote_host(),
                &local.to_string_lossy(),
                &self.staging.remote_dir,
                crate::transport::CopyDirection::Upload,
                self.timeouts.transfer(),
            )
            .await?;
        Ok(())
    }

    /// Best-effort removal of the remote and local job directories.
    pub async fn remove_job_dirs(&self, endpoint: &Endpoint, job_id: JobId) {
        let remote = self.remote_job_dir(job_id);
        match self
            .executor
            .run(
                &endpoint.remote_host(),
                &format!("rm -rf {}", remote),
                self.timeouts.delete(),
            )
            .await
        {
            Ok(output) if output.success() => {}
            Ok(output) => {
                tracing::warn!(job_id, path = %remote, exit_code = output.exit_code, stderr = %output.stderr.trim(), "Remote cleanup failed")
            }
            Err(e) => tracing::warn!(job_id, path = %remote, error = %e, "Remote cleanup failed"),
        }

        let local = self.local_job_dir(job_id);
        if let Err(e) = tokio::fs::remove_dir_all(&local).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(job_id, path = %local.display(), error = %e, "Local cleanup failed");
            }
        }
    }
}

/// Turn a non-zero exit into a transport failure.
pub(crate) fn ensure_success(operation: &str, output: CommandOutput) -> DriverResult<CommandOutput> {
    if output.success() {
        return Ok(output);
    }
    Err(DriverError::Transport(TransportError::Failed {
        operation: operation.to_string(),
        exit_code: output.exit_code,
        stderr: if output.stderr.trim().is_empty() {
            output.stdout
        } else {
            output.stderr
        },
    }))
}

/// Job name reduced to characters safe in file and directory names.
pub(crate) fn path_safe(name: &str) -> String {
    let safe: String = name
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if safe.is_empty() {
        "job".to_string()
    } else {
        safe
    }
}

/// Drivers by software, version, language and interactivity.
#[derive(Clone, Default)]
pub struct DriverTable {
    drivers: HashMap<DriverKey, Arc<dyn BackendDriver>>,
}

impl DriverTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The drivers shipped with this crate.
    pub fn standard(ctx: DriverContext) -> Self {
        let mut table = Self::new();
        table.register(
            DriverKey::new("hadoop", "hdv1", "none", false),
            Arc::new(HadoopV1Driver::new(ctx.clone())),
        );
        table.register(
            DriverKey::new("hadoop", "hdv2", "none", false),
            Arc::new(HadoopV2Driver::new(ctx.clone())),
        );
        let hive: Arc<dyn BackendDriver> = Arc::new(HiveDriver::new(ctx.clone()));
        table.register(DriverKey::new("hadoop", "hdv1", "hive", false), hive.clone());
        table.register(DriverKey::new("hadoop", "hdv2", "hive", false), hive);
        table.register(
            DriverKey::new("hadoop", "hdv2", "none", true),
            Arc::new(InteractiveHadoopDriver::new(ctx)),
        );
        table
    }

    /// Keys registered by [`DriverTable::standard`].
    pub fn standard_keys() -> Vec<DriverKey> {
        vec![
            DriverKey::new("hadoop", "hdv1", "none", false),
            DriverKey::new("hadoop", "hdv2", "none", false),
            DriverKey::new("hadoop", "hdv1", "hive", false),
            DriverKey::new("hadoop", "hdv2", "hive", false),
            DriverKey::new("hadoop", "hdv2", "none", true),
        ]
    }

    pub fn register(&mut self, key: DriverKey, driver: Arc<dyn BackendDriver>) {
        self.drivers.insert(key, driver);
    }

    pub fn resolve(&self, key: &DriverKey) -> Option<Arc<dyn BackendDriver>> {
        self.drivers.get(key).cloned()
    }

    pub fn keys(&self) -> Vec<&DriverKey> {
        let mut keys: Vec<&DriverKey> = self.drivers.keys().collect();
        keys.sort_by_key(|k| k.to_string());
        keys
    }
}
