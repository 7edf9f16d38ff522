//! Shared fakes for the control-loop integration tests.
//!
//! Remote commands are answered by a [`ScriptedExecutor`]; every external
//! collaborator is replaced by an in-memory recorder.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use bigdata_director::config::{AgentConfig, ConfigSource, TomlConfigSource};
use bigdata_director::director::Director;
use bigdata_director::driver::DriverContext;
use bigdata_director::endpoint::{Endpoint, EndpointRegistry, Requirements};
use bigdata_director::error::{ExternalError, ExternalResult};
use bigdata_director::external::{
    AccountingRecord, AccountingSink, Collaborators, ExternalJobTracker, JobAttributes,
    QueueDescriptor, ReplicaCatalog, SandboxKind, SandboxStore, TaskQueue,
};
use bigdata_director::ledger::{JobId, MemoryLedger};
use bigdata_director::node::Node;
use bigdata_director::tracking::StatusRecorder;
use bigdata_director::transport::{
    CommandOutput, CopyDirection, RemoteExecutor, RemoteHost, StagedPayload, TransportResult,
};

// =============================================================================
// Remote executor
// =============================================================================

/// Answers `run` calls from substring rules. The most recently added rule
/// that matches wins; unmatched commands succeed with empty output.
#[derive(Default)]
pub struct ScriptedExecutor {
    rules: Mutex<Vec<(String, CommandOutput)>>,
    calls: Mutex<Vec<String>>,
    copies: Mutex<Vec<(String, String, CopyDirection)>>,
    staged: Mutex<Vec<StagedPayload>>,
    delay: Option<Duration>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `run` call sleeps this long before answering.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn respond(&self, pattern: &str, stdout: &str) {
        self.respond_with(
            pattern,
            CommandOutput {
                exit_code: 0,
                stdout: stdout.to_string(),
                stderr: String::new(),
            },
        );
    }

    pub fn fail(&self, pattern: &str, stderr: &str) {
        self.respond_with(
            pattern,
            CommandOutput {
                exit_code: 1,
                stdout: String::new(),
                stderr: stderr.to_string(),
            },
        );
    }

    pub fn respond_with(&self, pattern: &str, output: CommandOutput) {
        self.rules
            .lock()
            .unwrap()
            .push((pattern.to_string(), output));
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_matching(&self, pattern: &str) -> usize {
        self.calls().iter().filter(|c| c.contains(pattern)).count()
    }

    pub fn copies(&self) -> Vec<(String, String, CopyDirection)> {
        self.copies.lock().unwrap().clone()
    }

    pub fn staged(&self) -> Vec<StagedPayload> {
        self.staged.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteExecutor for ScriptedExecutor {
    async fn run(
        &self,
        _host: &RemoteHost,
        command: &str,
        _timeout: Duration,
    ) -> TransportResult<CommandOutput> {
        self.calls.lock().unwrap().push(command.to_string());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let output = self
            .rules
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(pattern, _)| command.contains(pattern.as_str()))
            .map(|(_, output)| output.clone())
            .unwrap_or_default();
        Ok(output)
    }

    async fn copy(
        &self,
        _host: &RemoteHost,
        source: &str,
        destination: &str,
        direction: CopyDirection,
        _timeout: Duration,
    ) -> TransportResult<()> {
        self.copies
            .lock()
            .unwrap()
            .push((source.to_string(), destination.to_string(), direction));
        Ok(())
    }

    async fn stage(
        &self,
        _host: &RemoteHost,
        payload: &StagedPayload,
        _timeout: Duration,
    ) -> TransportResult<()> {
        self.staged.lock().unwrap().push(payload.clone());
        Ok(())
    }
}

// =============================================================================
// External collaborators
// =============================================================================

#[derive(Debug, Clone, Default)]
pub struct JobDescription {
    pub arguments: Option<String>,
    pub dataset: Option<String>,
    pub attributes: JobAttributes,
}

#[derive(Default)]
struct QueueState {
    queues: BTreeMap<u64, VecDeque<JobId>>,
    descriptions: HashMap<JobId, JobDescription>,
    released: Vec<JobId>,
}

/// Task queue holding job ids in FIFO queues.
#[derive(Default)]
pub struct FakeTaskQueue {
    state: Mutex<QueueState>,
}

impl FakeTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_job(&self, queue: u64, job_id: JobId, description: JobDescription) {
        let mut state = self.state.lock().unwrap();
        state.queues.entry(queue).or_default().push_back(job_id);
        state.descriptions.insert(job_id, description);
    }

    /// Register a description without queueing the job.
    pub fn describe(&self, job_id: JobId, description: JobDescription) {
        self.state
            .lock()
            .unwrap()
            .descriptions
            .insert(job_id, description);
    }

    pub fn waiting(&self, queue: u64) -> Vec<JobId> {
        self.state
            .lock()
            .unwrap()
            .queues
            .get(&queue)
            .map(|q| q.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn released(&self) -> Vec<JobId> {
        self.state.lock().unwrap().released.clone()
    }
}

#[async_trait]
impl TaskQueue for FakeTaskQueue {
    async fn matching_queues(
        &self,
        _requirements: &Requirements,
    ) -> ExternalResult<Vec<QueueDescriptor>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .queues
            .iter()
            .filter(|(_, jobs)| !jobs.is_empty())
            .map(|(id, jobs)| QueueDescriptor {
                id: *id,
                jobs: jobs.len() as u32,
                priority: 1,
                cpu_time: 0,
            })
            .collect())
    }

    async fn take_one_job(&self, queue: &QueueDescriptor) -> ExternalResult<Option<JobId>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .queues
            .get_mut(&queue.id)
            .and_then(VecDeque::pop_front))
    }

    async fn job_arguments(&self, job_id: JobId) -> ExternalResult<Option<String>> {
        Ok(self.description(job_id)?.arguments)
    }

    async fn input_dataset(&self, job_id: JobId) -> ExternalResult<Option<String>> {
        Ok(self.description(job_id)?.dataset)
    }

    async fn job_attributes(&self, job_id: JobId) -> ExternalResult<JobAttributes> {
        Ok(self.description(job_id)?.attributes)
    }

    async fn release_job(&self, job_id: JobId) -> ExternalResult<()> {
        self.state.lock().unwrap().released.push(job_id);
        Ok(())
    }
}

impl FakeTaskQueue {
    fn description(&self, job_id: JobId) -> ExternalResult<JobDescription> {
        self.state
            .lock()
            .unwrap()
            .descriptions
            .get(&job_id)
            .cloned()
            .ok_or_else(|| ExternalError::new("TaskQueue", format!("no job {}", job_id)))
    }
}

#[derive(Default)]
pub struct FakeCatalog {
    replicas: Mutex<HashMap<String, Vec<String>>>,
    lookups: AtomicUsize,
}

impl FakeCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_replica(&self, dataset: &str, site: &str) {
        self.replicas
            .lock()
            .unwrap()
            .entry(dataset.to_string())
            .or_default()
            .push(site.to_string());
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReplicaCatalog for FakeCatalog {
    async fn replica_sites(&self, dataset: &str) -> ExternalResult<Vec<String>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .replicas
            .lock()
            .unwrap()
            .get(dataset)
            .cloned()
            .unwrap_or_default())
    }
}

/// Sandbox store that writes registered input files and records uploads.
#[derive(Default)]
pub struct FakeSandbox {
    inputs: Mutex<HashMap<JobId, Vec<(String, Vec<u8>)>>>,
    uploads: Mutex<Vec<(JobId, SandboxKind, Vec<PathBuf>)>>,
}

impl FakeSandbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_input(&self, job_id: JobId, name: &str, content: &[u8]) {
        self.inputs
            .lock()
            .unwrap()
            .entry(job_id)
            .or_default()
            .push((name.to_string(), content.to_vec()));
    }

    pub fn uploads(&self) -> Vec<(JobId, SandboxKind, Vec<PathBuf>)> {
        self.uploads.lock().unwrap().clone()
    }
}

#[async_trait]
impl SandboxStore for FakeSandbox {
    async fn upload(
        &self,
        files: &[PathBuf],
        job_id: JobId,
        kind: SandboxKind,
        _size_limit: u64,
    ) -> ExternalResult<()> {
        self.uploads
            .lock()
            .unwrap()
            .push((job_id, kind, files.to_vec()));
        Ok(())
    }

    async fn download_input(
        &self,
        job_id: JobId,
        destination: &Path,
    ) -> ExternalResult<Vec<PathBuf>> {
        let files = self
            .inputs
            .lock()
            .unwrap()
            .get(&job_id)
            .cloned()
            .unwrap_or_default();
        let mut written = Vec::new();
        for (name, content) in files {
            let path = destination.join(name);
            std::fs::write(&path, content)
                .map_err(|e| ExternalError::new("SandboxStore", e.to_string()))?;
            written.push(path);
        }
        Ok(written)
    }
}

#[derive(Default)]
pub struct FakeAccounting {
    records: Mutex<Vec<AccountingRecord>>,
    commits: AtomicUsize,
}

impl FakeAccounting {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AccountingRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AccountingSink for FakeAccounting {
    async fn record(&self, record: &AccountingRecord) -> ExternalResult<()> {
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }

    async fn commit(&self) -> ExternalResult<()> {
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedStatus {
    pub job_id: JobId,
    pub status: String,
    pub message: String,
    pub origin: String,
}

#[derive(Default)]
pub struct RecordingTracker {
    statuses: Mutex<Vec<TrackedStatus>>,
    sites: Mutex<Vec<(JobId, String)>>,
    attributes: Mutex<Vec<(JobId, String, String)>>,
}

impl RecordingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn statuses(&self, job_id: JobId) -> Vec<TrackedStatus> {
        self.statuses
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.job_id == job_id)
            .cloned()
            .collect()
    }

    pub fn sites(&self) -> Vec<(JobId, String)> {
        self.sites.lock().unwrap().clone()
    }

    pub fn attribute(&self, job_id: JobId, key: &str) -> Option<String> {
        self.attributes
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(id, k, _)| *id == job_id && k == key)
            .map(|(_, _, v)| v.clone())
    }
}

#[async_trait]
impl ExternalJobTracker for RecordingTracker {
    async fn set_status(
        &self,
        job_id: JobId,
        status: &str,
        message: &str,
        origin: &str,
    ) -> ExternalResult<()> {
        self.statuses.lock().unwrap().push(TrackedStatus {
            job_id,
            status: status.to_string(),
            message: message.to_string(),
            origin: origin.to_string(),
        });
        Ok(())
    }

    async fn set_site(&self, job_id: JobId, site: &str) -> ExternalResult<()> {
        self.sites.lock().unwrap().push((job_id, site.to_string()));
        Ok(())
    }

    async fn set_attribute(&self, job_id: JobId, key: &str, value: &str) -> ExternalResult<()> {
        self.attributes
            .lock()
            .unwrap()
            .push((job_id, key.to_string(), value.to_string()));
        Ok(())
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// One `[endpoints.<name>]` section.
#[derive(Debug, Clone)]
pub struct EndpointSpec {
    pub name: String,
    pub name_node: String,
    pub site: String,
    pub version: String,
    pub language: String,
    pub language_version: String,
    pub capacity: u32,
    pub interactive: bool,
}

impl EndpointSpec {
    /// Plain map/reduce endpoint on Hadoop v1.
    pub fn hadoop_v1(name: &str, capacity: u32) -> Self {
        Self {
            name: name.to_string(),
            name_node: format!("nn.{}.example.org", name.to_ascii_lowercase()),
            site: format!("BigData.{}.es", name),
            version: "hdv1".to_string(),
            language: "none".to_string(),
            language_version: "1".to_string(),
            capacity,
            interactive: false,
        }
    }

    pub fn with_stack(mut self, version: &str, language: &str) -> Self {
        self.version = version.to_string();
        self.language = language.to_string();
        self
    }

    pub fn interactive(mut self) -> Self {
        self.interactive = true;
        self
    }

    pub fn to_toml(&self) -> String {
        format!(
            r#"
[endpoints.{name}]
NameNode = "{name_node}"
Port = 9000
SiteName = "{site}"
BigDataSoftware = "hadoop"
BigDataSoftwareVersion = "{version}"
LimitQueueJobsEndPoint = {capacity}
URL = "http://{name_node}"
PublicIP = "10.0.0.1"
User = "hadoop"
IsInteractive = {interactive}

[endpoints.{name}.HighLevelLanguage]
HLLName = "{language}"
HLLVersion = "{language_version}"
"#,
            name = self.name,
            name_node = self.name_node,
            site = self.site,
            version = self.version,
            capacity = self.capacity,
            interactive = self.interactive,
            language = self.language,
            language_version = self.language_version,
        )
    }
}

/// Agent configuration with a single `Hadoop` submit pool running every
/// endpoint. `monitor_extra` is appended to the `[monitor]` table.
pub fn agent_toml(
    endpoints: &[EndpointSpec],
    workers: usize,
    queue_depth: usize,
    monitor_extra: &str,
) -> String {
    let names: Vec<String> = endpoints.iter().map(|e| format!("\"{}\"", e.name)).collect();
    let mut toml = format!(
        r#"
[scheduler]
polling_interval_secs = 1
thread_start_delay_ms = 0
submit_pools = ["Hadoop"]

[scheduler.pools.Hadoop]
running_endpoints = [{names}]
workers = {workers}
queue_depth = {queue_depth}

[monitor]
polling_interval_secs = 1
{monitor_extra}
"#,
        names = names.join(", "),
    );
    for endpoint in endpoints {
        toml.push_str(&endpoint.to_toml());
    }
    toml
}

/// Arguments selecting plain Hadoop v1 map/reduce over `dataset`.
pub fn hadoop_v1_arguments(dataset: &str) -> String {
    format!("hadoop hdv1 none 1 {}", dataset)
}

pub fn job(arguments: Option<&str>, dataset: Option<&str>, name: &str) -> JobDescription {
    JobDescription {
        arguments: arguments.map(str::to_string),
        dataset: dataset.map(str::to_string),
        attributes: JobAttributes {
            name: name.to_string(),
            owner: "alice".to_string(),
            owner_group: "cesga_user".to_string(),
            ..JobAttributes::default()
        },
    }
}

// =============================================================================
// Harness
// =============================================================================

/// A node wired to fakes, with staging in a temporary directory.
pub struct Harness {
    pub config: AgentConfig,
    pub source: Arc<dyn ConfigSource>,
    pub node: Node,
    pub ledger: Arc<MemoryLedger>,
    pub executor: Arc<ScriptedExecutor>,
    pub queue: Arc<FakeTaskQueue>,
    pub catalog: Arc<FakeCatalog>,
    pub sandbox: Arc<FakeSandbox>,
    pub accounting: Arc<FakeAccounting>,
    pub tracker: Arc<RecordingTracker>,
    pub staging: TempDir,
}

impl Harness {
    pub fn new(toml: &str) -> Self {
        Self::with_executor(toml, ScriptedExecutor::new())
    }

    pub fn with_executor(toml: &str, executor: ScriptedExecutor) -> Self {
        let staging = tempfile::tempdir().unwrap();
        let mut config = AgentConfig::from_toml(toml).unwrap();
        config.staging.local_dir = staging.path().to_path_buf();

        let source: Arc<dyn ConfigSource> = Arc::new(TomlConfigSource::from_toml(toml).unwrap());
        let ledger = Arc::new(MemoryLedger::new());
        let executor = Arc::new(executor);
        let queue = Arc::new(FakeTaskQueue::new());
        let catalog = Arc::new(FakeCatalog::new());
        let sandbox = Arc::new(FakeSandbox::new());
        let accounting = Arc::new(FakeAccounting::new());
        let tracker = Arc::new(RecordingTracker::new());

        let collaborators = Collaborators {
            task_queue: queue.clone(),
            catalog: catalog.clone(),
            sandbox: sandbox.clone(),
            accounting: accounting.clone(),
            tracker: tracker.clone(),
        };
        let node = Node::new(
            config.clone(),
            source.clone(),
            ledger.clone(),
            collaborators,
            executor.clone(),
        );

        Self {
            config,
            source,
            node,
            ledger,
            executor,
            queue,
            catalog,
            sandbox,
            accounting,
            tracker,
            staging,
        }
    }

    pub fn driver_context(&self) -> DriverContext {
        DriverContext {
            executor: self.executor.clone(),
            sandbox: self.sandbox.clone(),
            staging: self.config.staging.clone(),
            timeouts: self.config.timeouts.clone(),
            output_size_limit: self.config.sandbox.output_size_limit,
        }
    }

    /// Registry loaded with the scheduler's endpoints.
    pub fn registry(&self) -> Arc<EndpointRegistry> {
        let registry = Arc::new(EndpointRegistry::new(
            self.source.clone(),
            self.config.scheduler.endpoints_section.clone(),
        ));
        registry
            .reload(&self.config.scheduler.running_endpoints())
            .unwrap();
        registry
    }

    pub fn recorder(&self) -> StatusRecorder {
        StatusRecorder::new(self.ledger.clone(), self.tracker.clone())
    }

    /// Director over a loaded registry and the node's drivers, plus the
    /// endpoint called `name`. Sharing the drivers with the node's monitor
    /// keeps interactive sessions visible to it.
    pub fn director_for(&self, name: &str) -> (Director, Endpoint) {
        let registry = self.registry();
        let endpoint = registry.snapshot().get(name).cloned().unwrap();
        let director = Director::new(registry, self.node.drivers().clone(), self.recorder());
        (director, endpoint)
    }

    pub fn local_job_dir(&self, job_id: JobId) -> PathBuf {
        self.staging.path().join(job_id.to_string())
    }
}

/// `hadoop job -submit` answer for one job.
pub fn script_v1_submit(executor: &ScriptedExecutor, job_id: JobId, backend_id: &str) {
    executor.respond(
        &format!("job_{}.xml", job_id),
        &format!("Created job {}\n", backend_id),
    );
}

/// `hadoop job -list all` listing with the given `(backend id, state code)`
/// rows. 1 = Running, 2 = Succeded, 3 = Failed, 4 = Prep.
pub fn v1_listing(rows: &[(&str, u8)]) -> String {
    let mut listing = String::from(
        "3 jobs currently running\nStates are:\nRunning : 1\tSucceded : 2\tFailed : 3\tPrep : 4\n\
JobId\tState\tStartTime\tUserName\tPriority\tSchedulingInfo\n",
    );
    for (id, state) in rows {
        listing.push_str(&format!("{}\t{}\t1357041600000\thadoop\tNORMAL\tNA\n", id, state));
    }
    listing
}

// =============================================================================
// Polling helpers
// =============================================================================

pub async fn wait_for<F, Fut>(
    condition: F,
    timeout_duration: Duration,
    poll_interval: Duration,
) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout_duration {
        if condition().await {
            return true;
        }
        tokio::time::sleep(poll_interval).await;
    }
    false
}

pub async fn assert_eventually<F, Fut>(condition: F, timeout_duration: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    assert!(
        wait_for(condition, timeout_duration, Duration::from_millis(20)).await,
        "Condition not met within {:?}: {}",
        timeout_duration,
        message
    );
}
