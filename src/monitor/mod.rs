//! Monitor control loop.
//!
//! Polls every non-terminal ledger entry through its endpoint's driver and
//! moves it along the status state machine. Finished jobs get their output
//! collected, their staging paths cleaned and one accounting record.

pub mod metrics;
pub mod state;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::{AccountingConfig, MonitorConfig};
use crate::driver::{BackendDriver, DriverTable, JobTarget, OutputReport, StatusReport};
use crate::endpoint::{Endpoint, EndpointRegistry};
use crate::external::{AccountingRecord, AccountingSink, JobAttributes, TaskQueue};
use crate::ledger::{LedgerEntry, LedgerError, LedgerStatus};
use crate::tracking::{StatusRecorder, ORIGIN_MONITOR};

pub use metrics::CompletionMetrics;
pub use state::{on_poll, Transition};

/// Tracker attribute listing output patterns that matched nothing.
pub const MISSING_OUTPUT_ATTRIBUTE: &str = "OutputSandboxMissingFiles";
/// Tracker attribute set on entries that stopped changing.
pub const STALLED_ATTRIBUTE: &str = "BigDataStalledSince";

const UNACKNOWLEDGED_PREFIX: &str = "Unacknowledged";

/// What one monitor cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonitorReport {
    pub checked: usize,
    /// Entries skipped because the backend has not assigned an id yet.
    pub waiting: usize,
    /// Entries whose endpoint is no longer configured for monitoring.
    pub orphaned: usize,
    pub transitions: usize,
    pub finished: usize,
    pub resubmitted: usize,
    pub stalled: usize,
    pub unacknowledged: usize,
}

pub struct Monitor {
    config: MonitorConfig,
    job_group: String,
    endpoints: Vec<(String, String)>,
    registry: Arc<EndpointRegistry>,
    drivers: DriverTable,
    recorder: StatusRecorder,
    task_queue: Arc<dyn TaskQueue>,
    accounting: Arc<dyn AccountingSink>,
}

impl Monitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: MonitorConfig,
        accounting_config: &AccountingConfig,
        endpoints: Vec<(String, String)>,
        registry: Arc<EndpointRegistry>,
        drivers: DriverTable,
        recorder: StatusRecorder,
        task_queue: Arc<dyn TaskQueue>,
        accounting: Arc<dyn AccountingSink>,
    ) -> Self {
        Self {
            config,
            job_group: accounting_config.job_group.clone(),
            endpoints,
            registry,
            drivers,
            recorder,
            task_queue,
            accounting,
        }
    }

    pub async fn run(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.polling_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Monitor loop stopping");
                    break;
                }
                _ = interval.tick() => {
                    self.run_once().await;
                }
            }
        }
    }

    /// Poll every active ledger entry once.
    pub async fn run_once(&self) -> MonitorReport {
        let mut report = MonitorReport::default();

        let snapshot = match self.registry.reload(&self.endpoints) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::error!(error = %e, "Could not reload monitoring endpoints, keeping previous set");
                self.registry.snapshot()
            }
        };

        let entries = match self.recorder.ledger().active_jobs() {
            Ok(entries) => entries,
            Err(e) => {
                tracing::error!(error = %e, "Could not load active jobs");
                return report;
            }
        };

        let now = Utc::now();
        for entry in &entries {
            report.checked += 1;

            if !entry.has_backend_id() {
                report.waiting += 1;
                self.check_unacknowledged(entry, now, &mut report).await;
                continue;
            }

            let Some(endpoint) = snapshot.by_address(&entry.endpoint_address) else {
                tracing::warn!(job_id = entry.job_id, address = %entry.endpoint_address, "No monitored endpoint for job");
                report.orphaned += 1;
                continue;
            };
            let key = endpoint.driver_key();
            let Some(driver) = self.drivers.resolve(&key) else {
                tracing::error!(job_id = entry.job_id, driver = %key, "No driver for job's endpoint");
                continue;
            };

            let target = JobTarget { endpoint, entry };
            let polled = match driver.query_status(target).await {
                Ok(status) => status,
                Err(e) => {
                    tracing::warn!(job_id = entry.job_id, backend_id = %entry.backend_id, error = %e, "Status query failed");
                    StatusReport::Unknown
                }
            };

            match on_poll(entry.status, polled) {
                Transition::Stay => self.check_stalled(entry, now, &mut report).await,
                Transition::Move(status) => {
                    match self.recorder.record(entry.job_id, status, ORIGIN_MONITOR).await {
                        Ok(_) => {
                            tracing::info!(job_id = entry.job_id, from = %entry.status, to = %status, "Job status changed");
                            report.transitions += 1;
                        }
                        Err(e) => {
                            tracing::error!(job_id = entry.job_id, error = %e, "Could not record status")
                        }
                    }
                }
                Transition::Finish => {
                    self.finish(driver.as_ref(), endpoint, entry, &mut report).await
                }
            }
        }

        if report.finished > 0 {
            if let Err(e) = self.accounting.commit().await {
                tracing::error!(error = %e, "Could not commit accounting records");
            }
        }

        tracing::info!(
            checked = report.checked,
            waiting = report.waiting,
            transitions = report.transitions,
            finished = report.finished,
            resubmitted = report.resubmitted,
            stalled = report.stalled,
            "Monitor cycle finished"
        );
        report
    }

    async fn finish(
        &self,
        driver: &dyn BackendDriver,
        endpoint: &Endpoint,
        entry: &LedgerEntry,
        report: &mut MonitorReport,
    ) {
        let job_id = entry.job_id;
        let target = JobTarget { endpoint, entry };
        let ledger = self.recorder.ledger();

        match driver.trigger_followup(target).await {
            Ok(Some(backend_id)) => {
                if let Err(e) = ledger.set_backend_id(job_id, &backend_id) {
                    tracing::error!(job_id, error = %e, "Could not store follow-up backend id");
                    return;
                }
                // One transition back to Submitted; an entry already there
                // only has its tracker message refreshed with the new id.
                let recorded = if entry.status == LedgerStatus::Submitted {
                    match ledger.get(job_id) {
                        Ok(Some(updated)) => {
                            self.recorder.notify(&updated, ORIGIN_MONITOR).await;
                            Ok(())
                        }
                        Ok(None) => Err(LedgerError::NotFound(job_id)),
                        Err(e) => Err(e),
                    }
                } else {
                    self.recorder
                        .record(job_id, LedgerStatus::Submitted, ORIGIN_MONITOR)
                        .await
                        .map(|_| ())
                };
                match recorded {
                    Ok(()) => {
                        tracing::info!(job_id, from = %entry.status, previous = %entry.backend_id, backend_id = %backend_id, "Job resubmitted");
                        report.resubmitted += 1;
                    }
                    Err(e) => tracing::error!(job_id, error = %e, "Could not record resubmission"),
                }
                return;
            }
            Ok(None) => {}
            Err(e) => {
                tracing::error!(job_id, error = %e, "Follow-up submission failed, retrying next cycle");
                if let Err(e) = ledger.set_error(job_id, &e.to_string()) {
                    tracing::error!(job_id, error = %e, "Could not store error message");
                }
                return;
            }
        }

        let done = match self.recorder.record(job_id, LedgerStatus::Done, ORIGIN_MONITOR).await {
            Ok(done) => done,
            Err(e) => {
                tracing::error!(job_id, error = %e, "Could not record completion");
                return;
            }
        };
        report.finished += 1;
        tracing::info!(job_id, backend_id = %entry.backend_id, endpoint = %endpoint.name, "Job finished");

        let attributes = match self.task_queue.job_attributes(job_id).await {
            Ok(attributes) => attributes,
            Err(e) => {
                tracing::warn!(job_id, error = %e, "Could not read job attributes");
                JobAttributes::default()
            }
        };

        let output = match driver.fetch_output(target, &attributes.output_sandbox).await {
            Ok(output) => output,
            Err(e) => {
                tracing::error!(job_id, error = %e, "Output collection failed");
                OutputReport::default()
            }
        };
        if !output.missing.is_empty() {
            tracing::warn!(job_id, missing = ?output.missing, "Output sandbox incomplete");
            self.recorder
                .annotate(job_id, MISSING_OUTPUT_ATTRIBUTE, &output.missing.join(", "))
                .await;
        }

        let completion = match driver.completion_text(target).await {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(job_id, error = %e, "Could not read completion report");
                String::new()
            }
        };

        if self.config.clean_after_finish {
            driver.cleanup(target).await;
        }

        let record = self.accounting_record(&done, &attributes, &output, &completion);
        if let Err(e) = self.accounting.record(&record).await {
            tracing::error!(job_id, error = %e, "Could not record accounting");
        }
    }

    fn accounting_record(
        &self,
        done: &LedgerEntry,
        attributes: &JobAttributes,
        output: &OutputReport,
        completion: &str,
    ) -> AccountingRecord {
        let metrics = CompletionMetrics::extract(completion);
        let end_time = done.last_update;
        let start_time = self
            .recorder
            .ledger()
            .history(done.job_id)
            .ok()
            .and_then(|history| history.first().map(|r| r.entry.last_update))
            .unwrap_or(end_time);
        let exec_time = (end_time - start_time).num_milliseconds().max(0) as f64 / 1000.0;

        AccountingRecord {
            job_id: done.job_id,
            user: attributes.owner.clone(),
            user_group: attributes.owner_group.clone(),
            job_group: self.job_group.clone(),
            job_type: "User".to_string(),
            job_class: "unknown".to_string(),
            processing_type: "unknown".to_string(),
            final_major_status: LedgerStatus::Done.as_str().to_string(),
            final_minor_status: "Execution Complete".to_string(),
            cpu_time: metrics.cpu_time,
            norm_cpu_time: 0.0,
            exec_time,
            input_data_size: metrics.bytes_read,
            output_data_size: metrics.bytes_written,
            input_data_files: 0,
            output_data_files: 0,
            disk_space: 0,
            input_sandbox_size: 0,
            output_sandbox_size: output.size,
            processed_events: metrics.input_records,
            site: done.site.clone(),
            start_time,
            end_time,
        }
    }

    async fn check_stalled(&self, entry: &LedgerEntry, now: DateTime<Utc>, report: &mut MonitorReport) {
        let age = (now - entry.last_update).num_seconds();
        if age < 0 || (age as u64) < self.config.stalled_after_secs {
            return;
        }
        report.stalled += 1;
        tracing::warn!(
            job_id = entry.job_id,
            status = %entry.status,
            backend_id = %entry.backend_id,
            age_secs = age,
            "Job status has not changed"
        );
        self.recorder
            .annotate(entry.job_id, STALLED_ATTRIBUTE, &entry.last_update.to_rfc3339())
            .await;
    }

    /// Entries still waiting for a backend id. Without a configured limit
    /// they only count towards stall reporting.
    async fn check_unacknowledged(
        &self,
        entry: &LedgerEntry,
        now: DateTime<Utc>,
        report: &mut MonitorReport,
    ) {
        let Some(limit) = self.config.unacknowledged_after_secs else {
            self.check_stalled(entry, now, report).await;
            return;
        };
        let age = (now - entry.last_update).num_seconds();
        if age < 0 || (age as u64) < limit || entry.error_message.starts_with(UNACKNOWLEDGED_PREFIX) {
            return;
        }

        report.unacknowledged += 1;
        let mut message = format!("{}: no backend id after {}s", UNACKNOWLEDGED_PREFIX, limit);
        if !entry.error_message.is_empty() {
            message.push_str("; ");
            message.push_str(&entry.error_message);
        }
        tracing::warn!(job_id = entry.job_id, age_secs = age, "Submission never acknowledged by backend");
        if let Err(e) = self.recorder.ledger().set_error(entry.job_id, &message) {
            tracing::error!(job_id = entry.job_id, error = %e, "Could not store error message");
        }
        if let Err(e) = self
            .recorder
            .tracker()
            .set_status(entry.job_id, entry.status.as_str(), &message, ORIGIN_MONITOR)
            .await
        {
            tracing::warn!(job_id = entry.job_id, error = %e, "Could not update job tracker");
        }
    }
}
