//! Status writes that keep the ledger and the external job tracker in step.

use std::sync::Arc;

use crate::external::ExternalJobTracker;
use crate::ledger::{JobId, JobLedger, LedgerEntry, LedgerResult, LedgerStatus};

/// Origin reported for status changes made at submission time.
pub const ORIGIN_SCHEDULER: &str = "BigDataJobScheduler";
/// Origin reported for status changes made while polling.
pub const ORIGIN_MONITOR: &str = "BigDataJobMonitoring";

/// Human readable message the tracker shows for a status.
pub fn status_message(status: LedgerStatus, backend_id: &str, site: &str) -> String {
    match status {
        LedgerStatus::Submitted if backend_id.is_empty() => {
            format!("Submitting to BigData endpoint at {}", site)
        }
        LedgerStatus::Submitted => {
            format!("Submitted to BigData endpoint at {} with ID {}", site, backend_id)
        }
        LedgerStatus::Running => {
            format!("Running in BigData endpoint at {} with ID {}", site, backend_id)
        }
        LedgerStatus::Done => {
            format!("Finished in BigData endpoint at {} with ID {}", site, backend_id)
        }
        LedgerStatus::Unknown => {
            format!("BigData endpoint at {} did not report a status for ID {}", site, backend_id)
        }
    }
}

/// Writes statuses to the ledger and mirrors them to the tracker.
///
/// The ledger write decides success. Tracker failures are logged and do
/// not undo the ledger change.
#[derive(Clone)]
pub struct StatusRecorder {
    ledger: Arc<dyn JobLedger>,
    tracker: Arc<dyn ExternalJobTracker>,
}

impl StatusRecorder {
    pub fn new(ledger: Arc<dyn JobLedger>, tracker: Arc<dyn ExternalJobTracker>) -> Self {
        Self { ledger, tracker }
    }

    pub fn ledger(&self) -> &Arc<dyn JobLedger> {
        &self.ledger
    }

    pub fn tracker(&self) -> &Arc<dyn ExternalJobTracker> {
        &self.tracker
    }

    /// Set the status in the ledger (appending history), then notify.
    pub async fn record(
        &self,
        job_id: JobId,
        status: LedgerStatus,
        origin: &str,
    ) -> LedgerResult<LedgerEntry> {
        let entry = self.ledger.set_status(job_id, status)?;
        self.notify(&entry, origin).await;
        Ok(entry)
    }

    /// Tell the tracker about the entry's current status.
    pub async fn notify(&self, entry: &LedgerEntry, origin: &str) {
        let message = status_message(entry.status, &entry.backend_id, &entry.site);
        if let Err(e) = self
            .tracker
            .set_status(entry.job_id, entry.status.as_str(), &message, origin)
            .await
        {
            tracing::warn!(job_id = entry.job_id, status = %entry.status, error = %e, "Could not update job tracker");
        }
    }

    /// Set a tracker attribute, logging failures.
    pub async fn annotate(&self, job_id: JobId, key: &str, value: &str) {
        if let Err(e) = self.tracker.set_attribute(job_id, key, value).await {
            tracing::warn!(job_id, key, error = %e, "Could not set job attribute");
        }
    }
}
