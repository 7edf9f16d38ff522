//! Hive queries on Hadoop v1 and v2.
//!
//! The job's executable is a Hive script. The input sandbox is copied to the
//! gateway host, the script is staged together with the owner's credential
//! and started detached, writing its log into the Hive staging directory.
//! Progress is read back from that log: Hive announces how many map/reduce
//! jobs the query needs and logs a line as each one starts and ends.

use async_trait::async_trait;

use crate::driver::hadoop::upload_output;
use crate::driver::output::resolve_output_files;
use crate::driver::{
    ensure_success, BackendDriver, DriverContext, DriverError, DriverResult, JobTarget,
    OutputReport, StatusReport, SubmissionContext,
};
use crate::ledger::JobId;
use crate::transport::{CopyDirection, StagedPayload};

const TOTAL_MARKER: &str = "Total MapReduce jobs";
const STARTED_MARKER: &str = "Starting Job";
const ENDED_MARKER: &str = "Ended Job";

/// Counts read from a Hive log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HiveProgress {
    pub total: Option<u32>,
    pub started: u32,
    pub ended: u32,
}

impl HiveProgress {
    pub fn parse(log: &str) -> Self {
        let mut progress = HiveProgress::default();
        for line in log.lines() {
            if line.contains(TOTAL_MARKER) {
                progress.total = line
                    .split('=')
                    .nth(1)
                    .and_then(|n| n.trim().parse().ok())
                    .or(progress.total);
            } else if line.contains(STARTED_MARKER) {
                progress.started += 1;
            } else if line.contains(ENDED_MARKER) {
                progress.ended += 1;
            }
        }
        progress
    }

    pub fn status(&self) -> StatusReport {
        match self.total {
            Some(total) if total > 0 && self.ended >= total => StatusReport::Done,
            Some(total) if total > 0 => StatusReport::Running,
            _ => StatusReport::Unknown,
        }
    }
}

pub struct HiveDriver {
    ctx: DriverContext,
}

impl HiveDriver {
    pub fn new(ctx: DriverContext) -> Self {
        Self { ctx }
    }

    fn log_name(job_id: JobId, executable: &str) -> String {
        format!("{}_{}_out", job_id, crate::driver::path_safe(executable))
    }

    /// The backend id carries the log name, so polling needs no other state.
    fn backend_id(job_id: JobId, executable: &str) -> String {
        format!("hive:{}", Self::log_name(job_id, executable))
    }

    fn log_path(&self, backend_id: &str) -> Option<String> {
        let name = backend_id.strip_prefix("hive:")?;
        Some(format!(
            "{}/{}",
            self.ctx.staging.hive_dir.trim_end_matches('/'),
            name
        ))
    }

    fn target_log(&self, target: JobTarget<'_>) -> DriverResult<String> {
        self.log_path(&target.entry.backend_id)
            .ok_or_else(|| DriverError::UnparseableOutput {
                operation: "hive backend id",
                output: target.entry.backend_id.clone(),
            })
    }

    async fn read_log(&self, target: JobTarget<'_>) -> DriverResult<String> {
        let log = self.target_log(target)?;
        let output = self
            .ctx
            .executor
            .run(
                &target.endpoint.remote_host(),
                &format!("cat {}", log),
                self.ctx.timeouts.status(),
            )
            .await?;
        Ok(ensure_success("cat hive log", output)?.stdout)
    }
}

#[async_trait]
impl BackendDriver for HiveDriver {
    async fn submit(&self, sub: &SubmissionContext) -> DriverResult<String> {
        let executable = sub
            .attributes
            .executable
            .clone()
            .filter(|e| !e.trim().is_empty())
            .ok_or(DriverError::MissingExecutable(sub.job_id))?;

        self.ctx.prepare_local(sub.job_id).await?;
        let local_script = self.ctx.input_sandbox_dir(sub.job_id).join(&executable);
        if !local_script.is_file() {
            return Err(DriverError::MissingExecutable(sub.job_id));
        }
        self.ctx.upload_job_dir(&sub.endpoint, sub.job_id).await?;

        let host = sub.endpoint.remote_host();
        let payload = StagedPayload {
            credential: sub.credential(),
            executable: local_script,
            target_path: format!("{}/{}", self.ctx.remote_job_dir(sub.job_id), executable),
        };
        self.ctx
            .executor
            .stage(&host, &payload, self.ctx.timeouts.transfer())
            .await?;

        let backend_id = Self::backend_id(sub.job_id, &executable);
        let log = self.log_path(&backend_id).unwrap_or_default();
        let hive_dir = self.ctx.staging.hive_dir.trim_end_matches('/');
        let command = format!(
            "mkdir -p {dir} && cd {dir} && X509_USER_PROXY={proxy}/proxy nohup hive -f {script} > {log} 2>&1 < /dev/null &",
            dir = hive_dir,
            proxy = payload.target_dir(),
            script = payload.target_path,
            log = log,
        );
        let output = self
            .ctx
            .executor
            .run(&host, &command, self.ctx.timeouts.transfer())
            .await?;
        ensure_success("hive launch", output)?;

        tracing::info!(job_id = sub.job_id, log = %log, "Hive query launched");
        Ok(backend_id)
    }

    async fn query_status(&self, target: JobTarget<'_>) -> DriverResult<StatusReport> {
        let log = self.read_log(target).await?;
        let progress = HiveProgress::parse(&log);
        tracing::debug!(
            job_id = target.entry.job_id,
            total = ?progress.total,
            started = progress.started,
            ended = progress.ended,
            "Hive progress"
        );
        Ok(progress.status())
    }

    async fn fetch_output(
        &self,
        target: JobTarget<'_>,
        patterns: &[String],
    ) -> DriverResult<OutputReport> {
        let job_id = target.entry.job_id;
        let log = self.target_log(target)?;
        let local_dir = self.ctx.local_job_dir(job_id);
        tokio::fs::create_dir_all(&local_dir)
            .await
            .map_err(|source| DriverError::Staging {
                path: local_dir.clone(),
                source,
            })?;

        if let Err(e) = self
            .ctx
            .executor
            .copy(
                &target.endpoint.remote_host(),
                &log,
                &local_dir.to_string_lossy(),
                CopyDirection::Download,
                self.ctx.timeouts.transfer(),
            )
            .await
        {
            tracing::warn!(job_id, error = %e, "Could not copy Hive log from backend");
        }

        let log_name = log.rsplit('/').next().unwrap_or(&log).to_string();
        let mut wanted = vec![log_name];
        wanted.extend(patterns.iter().cloned());
        let report = resolve_output_files(&local_dir, &wanted).await;
        upload_output(&self.ctx, job_id, &report).await?;
        Ok(report)
    }

    async fn cleanup(&self, target: JobTarget<'_>) {
        if let Ok(log) = self.target_log(target) {
            let removed = self
                .ctx
                .executor
                .run(
                    &target.endpoint.remote_host(),
                    &format!("rm -f {}", log),
                    self.ctx.timeouts.delete(),
                )
                .await;
            if let Err(e) = removed {
                tracing::warn!(job_id = target.entry.job_id, error = %e, "Could not remove Hive log");
            }
        }
        self.ctx
            .remove_job_dirs(target.endpoint, target.entry.job_id)
            .await;
    }

    async fn completion_text(&self, target: JobTarget<'_>) -> DriverResult<String> {
        self.read_log(target).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOG: &str = "Total MapReduce jobs = 2\n\
Launching Job 1 out of 2\n\
Starting Job = job_201301011200_0001, Tracking URL = http://nn:50030/\n\
Ended Job = job_201301011200_0001\n\
Starting Job = job_201301011200_0002, Tracking URL = http://nn:50030/\n";

    #[test]
    fn progress_counts_markers() {
        let progress = HiveProgress::parse(LOG);
        assert_eq!(progress.total, Some(2));
        assert_eq!(progress.started, 2);
        assert_eq!(progress.ended, 1);
        assert_eq!(progress.status(), StatusReport::Running);

        let done = HiveProgress::parse(&format!("{}Ended Job = job_201301011200_0002\n", LOG));
        assert_eq!(done.status(), StatusReport::Done);
    }

    #[test]
    fn log_without_total_is_unknown() {
        assert_eq!(HiveProgress::parse("Hive history file=/tmp/x").status(), StatusReport::Unknown);
        assert_eq!(HiveProgress::parse("").status(), StatusReport::Unknown);
    }

    #[test]
    fn backend_id_names_the_log() {
        assert_eq!(HiveDriver::backend_id(42, "query.q"), "hive:42_query.q_out");
    }
}
