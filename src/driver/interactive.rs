//! Interactive jobs on Hadoop v2.
//!
//! The job's executable is a jar launched with `hadoop jar` over a remote
//! shell that stays attached for the lifetime of the job. Each launch runs
//! as a supervised task that can be cancelled. The backend id is recovered
//! from the launcher's log once Hadoop reports the job submission.
//!
//! Jobs run in two stages. The first launch is a probe; when the monitor
//! sees it finish, [`BackendDriver::trigger_followup`] launches the real
//! job and returns its new backend id. The launch command is written to a
//! script in the job directory and each stage logs to its own file, so the
//! stage a job is in can be read back from the backend after a restart.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::driver::hadoop::{output_name, parse_v2_job_state, upload_output};
use crate::driver::output::resolve_output_files;
use crate::driver::{
    ensure_success, BackendDriver, DriverContext, DriverError, DriverResult,
    JobTarget, OutputReport, StatusReport, SubmissionContext,
};
use crate::ledger::JobId;
use crate::transport::{CopyDirection, RemoteHost, StagedPayload};

const SUBMIT_MARKER: &str = "JobSubmitter: Submitting tokens for job:";
const LAUNCH_SCRIPT: &str = "interactive_launch.sh";

static JOB_ID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"job_+([^:]+)").unwrap());

/// Pull the backend id out of the launcher log.
pub fn extract_submitted_job_id(log: &str) -> Option<String> {
    log.lines()
        .filter(|line| line.contains(SUBMIT_MARKER))
        .filter_map(|line| {
            let marker_end = line.find(SUBMIT_MARKER)? + SUBMIT_MARKER.len();
            JOB_ID_RE
                .find(&line[marker_end..])
                .map(|m| m.as_str().trim().to_string())
        })
        .last()
}

/// Dataset path as seen by HDFS: the leading VO directory is dropped.
pub fn hdfs_dataset_path(dataset: &str) -> String {
    let parts: Vec<&str> = dataset.split('/').filter(|p| !p.is_empty()).collect();
    if parts.len() <= 1 {
        return format!("/{}", parts.join("/"));
    }
    format!("/{}", parts[1..].join("/"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Probe,
    Final,
}

struct Session {
    phase: SessionPhase,
    log: String,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Session {
    fn stop(&self) {
        self.cancel.cancel();
    }

    fn is_active(&self) -> bool {
        !self.handle.is_finished()
    }
}

pub struct InteractiveHadoopDriver {
    ctx: DriverContext,
    sessions: Arc<Mutex<HashMap<JobId, Session>>>,
    id_poll_interval: Duration,
    id_poll_attempts: u32,
}

impl InteractiveHadoopDriver {
    pub fn new(ctx: DriverContext) -> Self {
        Self {
            ctx,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            id_poll_interval: Duration::from_secs(1),
            id_poll_attempts: 10,
        }
    }

    /// How often and how many times the launcher log is searched for the
    /// backend id after a launch.
    pub fn with_id_polling(mut self, interval: Duration, attempts: u32) -> Self {
        self.id_poll_interval = interval;
        self.id_poll_attempts = attempts.max(1);
        self
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<JobId, Session>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn session_phase(&self, job_id: JobId) -> Option<SessionPhase> {
        self.sessions().get(&job_id).map(|s| s.phase)
    }

    fn log_path(&self, job_id: JobId, phase: SessionPhase) -> String {
        let stage = match phase {
            SessionPhase::Probe => "probe",
            SessionPhase::Final => "final",
        };
        format!("{}/{}_{}_out", self.ctx.remote_job_dir(job_id), job_id, stage)
    }

    fn remote_script(&self, job_id: JobId) -> String {
        format!("{}/{}", self.ctx.remote_job_dir(job_id), LAUNCH_SCRIPT)
    }

    /// Stage of a job with no live session, read from the backend host:
    /// the final stage has started once its log exists.
    async fn recover_phase(&self, target: JobTarget<'_>) -> DriverResult<SessionPhase> {
        let job_id = target.entry.job_id;
        let final_log = self.log_path(job_id, SessionPhase::Final);
        let output = self
            .ctx
            .executor
            .run(
                &target.endpoint.remote_host(),
                &format!("test -e {}", final_log),
                self.ctx.timeouts.status(),
            )
            .await?;
        let phase = if output.success() {
            SessionPhase::Final
        } else {
            SessionPhase::Probe
        };
        tracing::warn!(job_id, ?phase, "No interactive session for job, stage read from backend");
        Ok(phase)
    }

    fn launch_task(
        &self,
        job_id: JobId,
        host: &RemoteHost,
        command: &str,
    ) -> (CancellationToken, JoinHandle<()>) {
        let cancel = CancellationToken::new();
        let executor = self.ctx.executor.clone();
        let timeout = self.ctx.timeouts.delete();
        let task_cancel = cancel.clone();
        let host = host.clone();
        let command = command.to_string();

        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = task_cancel.cancelled() => {
                    tracing::info!(job_id, "Interactive session cancelled");
                }
                result = executor.run(&host, &command, timeout) => match result {
                    Ok(output) if output.success() => {
                        tracing::info!(job_id, "Interactive session finished");
                    }
                    Ok(output) => {
                        tracing::warn!(job_id, exit_code = output.exit_code, "Interactive session exited with failure");
                    }
                    Err(e) => {
                        tracing::warn!(job_id, error = %e, "Interactive session failed");
                    }
                },
            }
        });
        (cancel, handle)
    }

    /// Run the job's launch script for `phase` and wait until a backend id
    /// other than `previous` shows up in that phase's log.
    async fn launch(
        &self,
        job_id: JobId,
        phase: SessionPhase,
        host: &RemoteHost,
        previous: Option<&str>,
    ) -> DriverResult<String> {
        let log = self.log_path(job_id, phase);
        let command = format!(
            "rm -f {log} && sh {script} > {log} 2>&1",
            log = log,
            script = self.remote_script(job_id),
        );
        let (cancel, handle) = self.launch_task(job_id, host, &command);
        let grep = format!("grep \"{}\" {}", SUBMIT_MARKER, log);

        let mut backend_id = None;
        for _ in 0..self.id_poll_attempts {
            tokio::time::sleep(self.id_poll_interval).await;
            match self
                .ctx
                .executor
                .run(host, &grep, self.ctx.timeouts.status())
                .await
            {
                Ok(output) => match extract_submitted_job_id(&output.stdout) {
                    Some(id) if previous == Some(id.as_str()) => {
                        tracing::debug!(job_id, backend_id = %id, "Launcher log still shows the previous job");
                    }
                    Some(id) => {
                        backend_id = Some(id);
                        break;
                    }
                    None => {}
                },
                Err(e) => tracing::debug!(job_id, error = %e, "Launcher log not readable yet"),
            }
            if handle.is_finished() {
                break;
            }
        }

        let Some(backend_id) = backend_id else {
            cancel.cancel();
            return Err(DriverError::UnparseableOutput {
                operation: "interactive launch log",
                output: format!("no '{}' line in {}", SUBMIT_MARKER, log),
            });
        };

        let replaced = self.sessions().insert(
            job_id,
            Session {
                phase,
                log,
                cancel,
                handle,
            },
        );
        if let Some(replaced) = replaced {
            replaced.stop();
        }
        tracing::info!(job_id, backend_id = %backend_id, ?phase, "Interactive job launched");
        Ok(backend_id)
    }

    fn remove_session(&self, job_id: JobId) {
        if let Some(session) = self.sessions().remove(&job_id) {
            session.stop();
        }
    }

    /// Log of the job's current stage. Jobs are only collected once the
    /// final stage ran, so that is the fallback.
    fn target_log(&self, target: JobTarget<'_>) -> String {
        let job_id = target.entry.job_id;
        self.sessions()
            .get(&job_id)
            .map(|s| s.log.clone())
            .unwrap_or_else(|| self.log_path(job_id, SessionPhase::Final))
    }

    async fn read_log(&self, target: JobTarget<'_>) -> DriverResult<String> {
        let log = self.target_log(target);
        let output = self
            .ctx
            .executor
            .run(
                &target.endpoint.remote_host(),
                &format!("cat {}", log),
                self.ctx.timeouts.status(),
            )
            .await?;
        Ok(ensure_success("cat interactive log", output)?.stdout)
    }
}

impl Drop for InteractiveHadoopDriver {
    fn drop(&mut self) {
        for session in self.sessions().values() {
            session.stop();
        }
    }
}

#[async_trait]
impl BackendDriver for InteractiveHadoopDriver {
    async fn submit(&self, sub: &SubmissionContext) -> DriverResult<String> {
        let executable = sub
            .attributes
            .executable
            .clone()
            .filter(|e| !e.trim().is_empty())
            .ok_or(DriverError::MissingExecutable(sub.job_id))?;

        self.ctx.prepare_local(sub.job_id).await?;
        let local_jar = self.ctx.input_sandbox_dir(sub.job_id).join(&executable);
        if !local_jar.is_file() {
            return Err(DriverError::MissingExecutable(sub.job_id));
        }

        let payload = StagedPayload {
            credential: sub.credential(),
            executable: local_jar,
            target_path: format!("{}/{}", self.ctx.remote_input_dir(sub.job_id), executable),
        };
        let remote_dir = self.ctx.remote_job_dir(sub.job_id);
        let script = format!(
            "cd {dir} && X509_USER_PROXY={proxy}/proxy hadoop jar {jar} {name} {dataset} {dir}/{output}\n",
            dir = remote_dir,
            proxy = payload.target_dir(),
            jar = payload.target_path,
            name = sub.job_name,
            dataset = hdfs_dataset_path(&sub.input_dataset),
            output = output_name(&sub.job_name, sub.job_id),
        );
        let local_script = self.ctx.local_job_dir(sub.job_id).join(LAUNCH_SCRIPT);
        tokio::fs::write(&local_script, script)
            .await
            .map_err(|source| DriverError::Staging {
                path: local_script.clone(),
                source,
            })?;
        self.ctx.upload_job_dir(&sub.endpoint, sub.job_id).await?;

        let host = sub.endpoint.remote_host();
        self.ctx
            .executor
            .stage(&host, &payload, self.ctx.timeouts.transfer())
            .await?;

        self.launch(sub.job_id, SessionPhase::Probe, &host, None)
            .await
    }

    async fn query_status(&self, target: JobTarget<'_>) -> DriverResult<StatusReport> {
        let command = format!("hadoop job -status {}", target.entry.backend_id);
        let output = self
            .ctx
            .executor
            .run(
                &target.endpoint.remote_host(),
                &command,
                self.ctx.timeouts.status(),
            )
            .await?;
        Ok(parse_v2_job_state(&ensure_success(&command, output)?.stdout))
    }

    async fn trigger_followup(&self, target: JobTarget<'_>) -> DriverResult<Option<String>> {
        let job_id = target.entry.job_id;
        let session = {
            let sessions = self.sessions();
            sessions.get(&job_id).map(|s| (s.phase, s.is_active()))
        };
        let (phase, probe_active) = match session {
            Some(session) => session,
            None => (self.recover_phase(target).await?, false),
        };
        if phase == SessionPhase::Final {
            return Ok(None);
        }

        tracing::info!(job_id, probe_id = %target.entry.backend_id, probe_active, "Probe finished, launching job");
        self.launch(
            job_id,
            SessionPhase::Final,
            &target.endpoint.remote_host(),
            Some(target.entry.backend_id.as_str()),
        )
        .await
        .map(Some)
    }

    async fn fetch_output(
        &self,
        target: JobTarget<'_>,
        patterns: &[String],
    ) -> DriverResult<OutputReport> {
        let job_id = target.entry.job_id;
        let local_dir = self.ctx.local_job_dir(job_id);
        tokio::fs::create_dir_all(&local_dir)
            .await
            .map_err(|source| DriverError::Staging {
                path: local_dir.clone(),
                source,
            })?;

        let log = self.target_log(target);
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
            tracing::warn!(job_id, error = %e, "Could not copy interactive log");
        }
        let mut wanted = vec![log.rsplit('/').next().unwrap_or(&log).to_string()];
        wanted.extend(patterns.iter().cloned());

        let report = resolve_output_files(&local_dir, &wanted).await;
        upload_output(&self.ctx, job_id, &report).await?;
        Ok(report)
    }

    async fn cleanup(&self, target: JobTarget<'_>) {
        self.remove_session(target.entry.job_id);
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

    #[test]
    fn job_id_from_submitter_line() {
        let log = "14/05/01 10:00:00 INFO input.FileInputFormat: Total input paths to process : 1\n\
14/05/01 10:00:01 INFO mapreduce.JobSubmitter: Submitting tokens for job: job_1398930000000_0007\n\
14/05/01 10:00:02 INFO mapreduce.Job: Running job: job_1398930000000_0007\n";
        assert_eq!(
            extract_submitted_job_id(log).as_deref(),
            Some("job_1398930000000_0007")
        );
        assert_eq!(extract_submitted_job_id("INFO mapreduce.Job: Running job: job_1"), None);
        assert_eq!(extract_submitted_job_id(""), None);
    }

    #[test]
    fn dataset_path_drops_vo_prefix() {
        assert_eq!(hdfs_dataset_path("/cesga/data/words"), "/data/words");
        assert_eq!(hdfs_dataset_path("/words"), "/words");
        assert_eq!(hdfs_dataset_path(""), "/");
    }
}
