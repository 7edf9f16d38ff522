//! Plain map/reduce submission to Hadoop v1 and v2 clusters.
//!
//! Both versions stage the same way: the input sandbox is unpacked into a
//! local job directory together with an XML job descriptor, the directory
//! is copied to the cluster's gateway host and `hadoop job -submit` is run
//! there. They differ in where the job id sits in the submit output and in
//! how job state is reported.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::driver::output::resolve_output_files;
use crate::driver::{
    ensure_success, path_safe, BackendDriver, DriverContext, DriverError, DriverResult,
    JobTarget, OutputReport, StatusReport, SubmissionContext,
};
use crate::external::SandboxKind;
use crate::ledger::JobId;
use crate::transport::CopyDirection;

/// Name of the directory a job's results are written to.
pub(crate) fn output_name(job_name: &str, job_id: JobId) -> String {
    format!("{}_{}", path_safe(job_name), job_id)
}

fn descriptor_name(job_id: JobId) -> String {
    format!("job_{}.xml", job_id)
}

/// Hadoop job configuration submitted with `hadoop job -submit`.
pub fn job_descriptor(ctx: &DriverContext, sub: &SubmissionContext) -> String {
    let classpath = ctx.remote_input_dir(sub.job_id);
    let output_dir = format!("{}/{}", classpath, output_name(&sub.job_name, sub.job_id));
    let properties = [
        ("mapred.input.dir", sub.input_dataset.as_str()),
        ("mapred.output.dir", output_dir.as_str()),
        ("mapred.job.name", sub.job_name.as_str()),
        ("mapred.job.classpath", classpath.as_str()),
    ];

    let mut xml = String::from(
        "<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"no\"?>\n<configuration>\n",
    );
    for (name, value) in properties {
        xml.push_str(&format!(
            "  <property>\n    <name>{}</name>\n    <value>{}</value>\n  </property>\n",
            name,
            xml_escape(value)
        ));
    }
    xml.push_str("</configuration>\n");
    xml
}

fn xml_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// `hadoop job -submit` output: `Created job job_201301011200_0001`.
pub fn extract_v1_job_id(stdout: &str) -> Option<String> {
    first_line(stdout)?
        .split_whitespace()
        .nth(2)
        .map(str::to_string)
}

pub fn extract_v2_job_id(stdout: &str) -> Option<String> {
    first_line(stdout)?
        .split_whitespace()
        .last()
        .map(str::to_string)
}

fn first_line(text: &str) -> Option<&str> {
    text.lines().map(str::trim).find(|l| !l.is_empty())
}

/// Find a job's state in `hadoop job -list all` output.
///
/// The listing starts with a legend mapping state codes to names:
///
/// ```text
/// States are:
/// Running : 1	Succeded : 2	Failed : 3	Prep : 4
/// JobId	State	StartTime	UserName	Priority	SchedulingInfo
/// job_201301011200_0001	2	1357041600000	hadoop	NORMAL	NA
/// ```
pub fn parse_v1_job_list(listing: &str, backend_id: &str) -> StatusReport {
    let mut states: HashMap<String, String> = HashMap::new();
    let mut lines = listing.lines();

    while let Some(line) = lines.next() {
        if line.trim() == "States are:" {
            if let Some(legend) = lines.next() {
                for field in legend.split('\t') {
                    let parts: Vec<&str> = field.split_whitespace().collect();
                    if let [name, ":", code] = parts.as_slice() {
                        states.insert(code.to_string(), name.to_string());
                    }
                }
            }
            continue;
        }

        let mut fields = line.split_whitespace();
        if fields.next() == Some(backend_id.trim()) {
            let state = fields
                .next()
                .and_then(|code| states.get(code))
                .map(String::as_str)
                .unwrap_or("Unknown");
            return v1_state(state);
        }
    }
    StatusReport::Unknown
}

fn v1_state(name: &str) -> StatusReport {
    match name.to_ascii_lowercase().as_str() {
        "succeded" | "succeeded" => StatusReport::Done,
        "running" | "prep" => StatusReport::Running,
        _ => StatusReport::Unknown,
    }
}

/// Read the `Job state: X` line of `hadoop job -status` output.
pub fn parse_v2_job_state(status: &str) -> StatusReport {
    let Some(state) = status
        .lines()
        .find_map(|l| l.trim().strip_prefix("Job state:"))
        .map(str::trim)
    else {
        return StatusReport::Unknown;
    };
    match state {
        "SUCCEEDED" => StatusReport::Done,
        "RUNNING" | "PREP" => StatusReport::Running,
        _ => StatusReport::Unknown,
    }
}

/// Staging, collection and cleanup shared by both Hadoop versions.
#[derive(Clone)]
struct HadoopJobs {
    ctx: DriverContext,
}

impl HadoopJobs {
    async fn submit(
        &self,
        sub: &SubmissionContext,
        extract: fn(&str) -> Option<String>,
    ) -> DriverResult<String> {
        self.ctx.prepare_local(sub.job_id).await?;

        let descriptor = self.ctx.local_job_dir(sub.job_id).join(descriptor_name(sub.job_id));
        tokio::fs::write(&descriptor, job_descriptor(&self.ctx, sub))
            .await
            .map_err(|source| DriverError::Staging {
                path: descriptor.clone(),
                source,
            })?;

        self.ctx.upload_job_dir(&sub.endpoint, sub.job_id).await?;

        let command = format!(
            "hadoop job -submit {}/{}",
            self.ctx.remote_job_dir(sub.job_id),
            descriptor_name(sub.job_id)
        );
        let output = self
            .ctx
            .executor
            .run(&sub.endpoint.remote_host(), &command, self.ctx.timeouts.transfer())
            .await?;
        let output = ensure_success("hadoop job -submit", output)?;

        extract(&output.stdout).ok_or(DriverError::UnparseableOutput {
            operation: "hadoop job -submit",
            output: output.stdout,
        })
    }

    async fn run_status(&self, target: JobTarget<'_>, command: &str) -> DriverResult<String> {
        let output = self
            .ctx
            .executor
            .run(
                &target.endpoint.remote_host(),
                command,
                self.ctx.timeouts.status(),
            )
            .await?;
        Ok(ensure_success(command, output)?.stdout)
    }

    async fn fetch_output(
        &self,
        target: JobTarget<'_>,
        patterns: &[String],
    ) -> DriverResult<OutputReport> {
        let job_id = target.entry.job_id;
        let host = target.endpoint.remote_host();
        let name = output_name(&target.entry.name, job_id);
        let hdfs_dir = format!("{}/{}", self.ctx.remote_input_dir(job_id), name);
        let remote_dir = self.ctx.remote_job_dir(job_id);

        let get = format!("hadoop dfs -get {} {}/", hdfs_dir, remote_dir);
        match self
            .ctx
            .executor
            .run(&host, &get, self.ctx.timeouts.transfer())
            .await
        {
            Ok(output) if output.success() => {}
            Ok(output) => {
                tracing::warn!(job_id, exit_code = output.exit_code, stderr = %output.stderr.trim(), "Could not get job output from DFS")
            }
            Err(e) => tracing::warn!(job_id, error = %e, "Could not get job output from DFS"),
        }

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
                &host,
                &format!("{}/{}", remote_dir, name),
                &local_dir.to_string_lossy(),
                CopyDirection::Download,
                self.ctx.timeouts.transfer(),
            )
            .await
        {
            tracing::warn!(job_id, error = %e, "Could not copy job output from backend");
        }

        let mut wanted = vec![name];
        wanted.extend(patterns.iter().cloned());
        let report = resolve_output_files(&local_dir, &wanted).await;
        upload_output(&self.ctx, job_id, &report).await?;
        Ok(report)
    }
}

/// Upload resolved output files as the job's output sandbox.
pub(crate) async fn upload_output(
    ctx: &DriverContext,
    job_id: JobId,
    report: &OutputReport,
) -> DriverResult<()> {
    if report.files.is_empty() {
        return Ok(());
    }
    tracing::info!(job_id, files = report.files.len(), bytes = report.size, limit = ctx.output_size_limit, "Uploading output sandbox");
    ctx.sandbox
        .upload(&report.files, job_id, SandboxKind::Output, ctx.output_size_limit)
        .await?;
    Ok(())
}

pub struct HadoopV1Driver {
    jobs: HadoopJobs,
}

impl HadoopV1Driver {
    pub fn new(ctx: DriverContext) -> Self {
        Self {
            jobs: HadoopJobs { ctx },
        }
    }
}

#[async_trait]
impl BackendDriver for HadoopV1Driver {
    async fn submit(&self, ctx: &SubmissionContext) -> DriverResult<String> {
        self.jobs.submit(ctx, extract_v1_job_id).await
    }

    async fn query_status(&self, target: JobTarget<'_>) -> DriverResult<StatusReport> {
        let listing = self.jobs.run_status(target, "hadoop job -list all").await?;
        Ok(parse_v1_job_list(&listing, &target.entry.backend_id))
    }

    async fn fetch_output(
        &self,
        target: JobTarget<'_>,
        patterns: &[String],
    ) -> DriverResult<OutputReport> {
        self.jobs.fetch_output(target, patterns).await
    }

    async fn cleanup(&self, target: JobTarget<'_>) {
        self.jobs
            .ctx
            .remove_job_dirs(target.endpoint, target.entry.job_id)
            .await;
    }

    async fn completion_text(&self, target: JobTarget<'_>) -> DriverResult<String> {
        self.jobs
            .run_status(
                target,
                &format!("hadoop job -status {}", target.entry.backend_id),
            )
            .await
    }
}

pub struct HadoopV2Driver {
    jobs: HadoopJobs,
}

impl HadoopV2Driver {
    pub fn new(ctx: DriverContext) -> Self {
        Self {
            jobs: HadoopJobs { ctx },
        }
    }
}

#[async_trait]
impl BackendDriver for HadoopV2Driver {
    async fn submit(&self, ctx: &SubmissionContext) -> DriverResult<String> {
        self.jobs.submit(ctx, extract_v2_job_id).await
    }

    async fn query_status(&self, target: JobTarget<'_>) -> DriverResult<StatusReport> {
        let status = self
            .jobs
            .run_status(
                target,
                &format!("hadoop job -status {}", target.entry.backend_id),
            )
            .await?;
        Ok(parse_v2_job_state(&status))
    }

    async fn fetch_output(
        &self,
        target: JobTarget<'_>,
        patterns: &[String],
    ) -> DriverResult<OutputReport> {
        self.jobs.fetch_output(target, patterns).await
    }

    async fn cleanup(&self, target: JobTarget<'_>) {
        self.jobs
            .ctx
            .remove_job_dirs(target.endpoint, target.entry.job_id)
            .await;
    }

    async fn completion_text(&self, target: JobTarget<'_>) -> DriverResult<String> {
        self.jobs
            .run_status(
                target,
                &format!("hadoop job -status {}", target.entry.backend_id),
            )
            .await
    }
}
