//! Persistent record of submitted jobs.
//!
//! Every job accepted by the director gets exactly one [`LedgerEntry`],
//! keyed by its job id. Every status change appends a [`HistoryRecord`]
//! snapshot of the entry in the same operation, so a job's lifecycle can be
//! rebuilt in order from its history.
//!
//! The scheduler side only inserts entries and the monitor only updates
//! existing ones by id, so every mutation is a single-entry update.

pub mod memory;
pub mod sqlite;

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use memory::MemoryLedger;
pub use sqlite::SqliteLedger;

/// Job identifier assigned by the upstream task queue.
pub type JobId = u64;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Job {0} already has a ledger entry")]
    AlreadyExists(JobId),

    #[error("Job {0} not found in ledger")]
    NotFound(JobId),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl From<rusqlite::Error> for LedgerError {
    fn from(err: rusqlite::Error) -> Self {
        LedgerError::Storage(err.to_string())
    }
}

pub type LedgerResult<T> = std::result::Result<T, LedgerError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LedgerStatus {
    Submitted,
    Running,
    Done,
    Unknown,
}

impl LedgerStatus {
    /// Statuses the monitor keeps polling.
    pub const ACTIVE: [LedgerStatus; 3] = [
        LedgerStatus::Submitted,
        LedgerStatus::Running,
        LedgerStatus::Unknown,
    ];

    pub fn is_terminal(self) -> bool {
        self == LedgerStatus::Done
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LedgerStatus::Submitted => "Submitted",
            LedgerStatus::Running => "Running",
            LedgerStatus::Done => "Done",
            LedgerStatus::Unknown => "Unknown",
        }
    }
}

impl std::fmt::Display for LedgerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LedgerStatus {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Submitted" => Ok(LedgerStatus::Submitted),
            "Running" => Ok(LedgerStatus::Running),
            "Done" => Ok(LedgerStatus::Done),
            "Unknown" => Ok(LedgerStatus::Unknown),
            other => Err(LedgerError::Storage(format!("unknown status '{}'", other))),
        }
    }
}

/// Fields the director knows when it creates an entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewLedgerEntry {
    pub job_id: JobId,
    pub name: String,
    pub endpoint_address: String,
    pub site: String,
    pub public_address: String,
    pub input_dataset: String,
    pub output_dataset: String,
    pub software: String,
    pub software_version: String,
    pub language: String,
    pub language_version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub job_id: JobId,
    pub name: String,
    pub status: LedgerStatus,
    pub last_update: DateTime<Utc>,
    /// Name-node address of the endpoint the job was sent to.
    pub endpoint_address: String,
    pub site: String,
    pub public_address: String,
    pub error_message: String,
    pub input_dataset: String,
    pub output_dataset: String,
    pub software: String,
    pub software_version: String,
    pub language: String,
    pub language_version: String,
    /// Identifier assigned by the cluster. Empty until the backend accepts
    /// the submission.
    pub backend_id: String,
}

impl LedgerEntry {
    pub fn from_new(new: NewLedgerEntry, at: DateTime<Utc>) -> Self {
        Self {
            job_id: new.job_id,
            name: new.name,
            status: LedgerStatus::Submitted,
            last_update: at,
            endpoint_address: new.endpoint_address,
            site: new.site,
            public_address: new.public_address,
            error_message: String::new(),
            input_dataset: new.input_dataset,
            output_dataset: new.output_dataset,
            software: new.software,
            software_version: new.software_version,
            language: new.language,
            language_version: new.language_version,
            backend_id: String::new(),
        }
    }

    pub fn has_backend_id(&self) -> bool {
        !self.backend_id.trim().is_empty()
    }
}

/// Snapshot of an entry taken when its status changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub history_id: u64,
    pub entry: LedgerEntry,
}

pub trait JobLedger: Send + Sync {
    /// Create the entry for a job in `Submitted` status.
    ///
    /// Fails with [`LedgerError::AlreadyExists`] if the job already has one.
    fn insert(&self, entry: NewLedgerEntry) -> LedgerResult<LedgerEntry>;

    fn get(&self, job_id: JobId) -> LedgerResult<Option<LedgerEntry>>;

    /// Change the status, refresh `last_update` and append a history record.
    fn set_status(&self, job_id: JobId, status: LedgerStatus) -> LedgerResult<LedgerEntry>;

    /// Only status changes move `last_update`; these two leave it alone.
    fn set_backend_id(&self, job_id: JobId, backend_id: &str) -> LedgerResult<()>;

    fn set_error(&self, job_id: JobId, message: &str) -> LedgerResult<()>;

    fn jobs_by_status(&self, status: LedgerStatus) -> LedgerResult<Vec<LedgerEntry>>;

    fn count_by_status_and_endpoint(
        &self,
        status: LedgerStatus,
        endpoint_address: &str,
    ) -> LedgerResult<usize>;

    /// History of a job, oldest first.
    fn history(&self, job_id: JobId) -> LedgerResult<Vec<HistoryRecord>>;

    /// Jobs the endpoint is currently holding (Submitted + Running).
    fn occupied_slots(&self, endpoint_address: &str) -> LedgerResult<usize> {
        Ok(
            self.count_by_status_and_endpoint(LedgerStatus::Submitted, endpoint_address)?
                + self.count_by_status_and_endpoint(LedgerStatus::Running, endpoint_address)?,
        )
    }

    /// Entries in a non-terminal status, grouped in [`LedgerStatus::ACTIVE`] order.
    fn active_jobs(&self) -> LedgerResult<Vec<LedgerEntry>> {
        let mut entries = Vec::new();
        for status in LedgerStatus::ACTIVE {
            entries.extend(self.jobs_by_status(status)?);
        }
        Ok(entries)
    }
}
