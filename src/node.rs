use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::{AgentConfig, ConfigSource, TomlConfigSource};
use crate::director::Director;
use crate::driver::{DriverContext, DriverTable};
use crate::endpoint::EndpointRegistry;
use crate::error::{ConfigError, Result};
use crate::external::local::{
    DirectorySandboxStore, FileReplicaCatalog, JsonLinesAccountingSink, LogJobTracker,
    SpoolTaskQueue,
};
use crate::external::Collaborators;
use crate::ledger::{JobLedger, MemoryLedger, SqliteLedger};
use crate::monitor::Monitor;
use crate::scheduler::Scheduler;
use crate::tracking::StatusRecorder;
use crate::transport::ssh::SshExecutor;
use crate::transport::RemoteExecutor;

/// Wires the ledger, collaborators and drivers into the two control loops.
///
/// The scheduler and the monitor each keep their own endpoint registry:
/// they load different endpoint lists from the same configuration source.
/// The director checks submissions against the scheduler's registry.
pub struct Node {
    config: AgentConfig,
    ledger: Arc<dyn JobLedger>,
    collaborators: Collaborators,
    drivers: DriverTable,
    scheduler_registry: Arc<EndpointRegistry>,
    monitor_registry: Arc<EndpointRegistry>,
}

impl Node {
    pub fn new(
        config: AgentConfig,
        source: Arc<dyn ConfigSource>,
        ledger: Arc<dyn JobLedger>,
        collaborators: Collaborators,
        executor: Arc<dyn RemoteExecutor>,
    ) -> Self {
        let drivers = DriverTable::standard(DriverContext {
            executor,
            sandbox: collaborators.sandbox.clone(),
            staging: config.staging.clone(),
            timeouts: config.timeouts.clone(),
            output_size_limit: config.sandbox.output_size_limit,
        });
        Self::with_drivers(config, source, ledger, collaborators, drivers)
    }

    /// Build a node around an explicit driver table.
    pub fn with_drivers(
        config: AgentConfig,
        source: Arc<dyn ConfigSource>,
        ledger: Arc<dyn JobLedger>,
        collaborators: Collaborators,
        drivers: DriverTable,
    ) -> Self {
        let section = config.scheduler.endpoints_section.clone();
        Self {
            scheduler_registry: Arc::new(EndpointRegistry::new(source.clone(), section.clone())),
            monitor_registry: Arc::new(EndpointRegistry::new(source, section)),
            config,
            ledger,
            collaborators,
            drivers,
        }
    }

    /// Build a standalone node from the configuration file at `path`:
    /// SQLite (or in-memory) ledger, spool-directory task queue, file
    /// backed catalog, sandbox and accounting, and `ssh` transport.
    pub fn from_file(config: AgentConfig, path: &Path) -> Result<Self> {
        let spool_dir = config.queue.spool_dir.clone().ok_or_else(|| {
            ConfigError::Invalid("queue.spool_dir is required to run the agent".to_string())
        })?;
        let catalog_path = config
            .queue
            .replica_catalog_path()
            .unwrap_or_else(|| spool_dir.join("replicas.json"));
        let accounting_path = config
            .accounting
            .path
            .clone()
            .unwrap_or_else(|| spool_dir.join("accounting.jsonl"));

        let ledger: Arc<dyn JobLedger> = match &config.ledger.path {
            Some(db) => Arc::new(SqliteLedger::open(db)?),
            None => {
                tracing::warn!("No ledger path configured, job records will not survive a restart");
                Arc::new(MemoryLedger::new())
            }
        };

        let collaborators = Collaborators {
            task_queue: Arc::new(SpoolTaskQueue::new(spool_dir)),
            catalog: Arc::new(FileReplicaCatalog::new(catalog_path)),
            sandbox: Arc::new(DirectorySandboxStore::new(config.sandbox.store_dir.clone())),
            accounting: Arc::new(JsonLinesAccountingSink::new(accounting_path)),
            tracker: Arc::new(LogJobTracker),
        };

        let mut executor = SshExecutor::new();
        if let Some(dir) = &config.staging.credentials_dir {
            executor = executor.with_credentials_dir(dir);
        }

        let source: Arc<dyn ConfigSource> = Arc::new(TomlConfigSource::open(path));
        Ok(Self::new(
            config,
            source,
            ledger,
            collaborators,
            Arc::new(executor),
        ))
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Arc<dyn JobLedger> {
        &self.ledger
    }

    pub fn drivers(&self) -> &DriverTable {
        &self.drivers
    }

    fn recorder(&self) -> StatusRecorder {
        StatusRecorder::new(self.ledger.clone(), self.collaborators.tracker.clone())
    }

    pub fn director(&self) -> Arc<Director> {
        Arc::new(Director::new(
            self.scheduler_registry.clone(),
            self.drivers.clone(),
            self.recorder(),
        ))
    }

    /// Scheduler with its submit pools started. `cancel` stops the pool
    /// workers.
    pub fn scheduler(&self, cancel: CancellationToken) -> Scheduler {
        Scheduler::new(
            self.config.scheduler.clone(),
            self.config.vocabulary.clone(),
            self.scheduler_registry.clone(),
            self.ledger.clone(),
            self.collaborators.task_queue.clone(),
            self.collaborators.catalog.clone(),
            self.director(),
            cancel,
        )
    }

    pub fn monitor(&self) -> Monitor {
        Monitor::new(
            self.config.monitor.clone(),
            &self.config.accounting,
            self.config.scheduler.monitoring_endpoints(),
            self.monitor_registry.clone(),
            self.drivers.clone(),
            self.recorder(),
            self.collaborators.task_queue.clone(),
            self.collaborators.accounting.clone(),
        )
    }

    /// Run both control loops until `shutdown` is cancelled, then let the
    /// submit pools finish what they already queued.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        tracing::info!(
            submit_pools = ?self.config.scheduler.submit_pools,
            drivers = ?self.drivers.keys().iter().map(|k| k.to_string()).collect::<Vec<_>>(),
            "Agent starting"
        );

        // Pool workers outlive the loops so queued submissions can drain.
        let scheduler = Arc::new(self.scheduler(CancellationToken::new()));
        let monitor = Arc::new(self.monitor());

        let scheduler_task = {
            let scheduler = scheduler.clone();
            let cancel = shutdown.clone();
            tokio::spawn(async move { scheduler.run(cancel).await })
        };
        let monitor_task = {
            let monitor = monitor.clone();
            let cancel = shutdown.clone();
            tokio::spawn(async move { monitor.run(cancel).await })
        };

        for (name, task) in [("scheduler", scheduler_task), ("monitor", monitor_task)] {
            if let Err(e) = task.await {
                tracing::error!(task = name, error = %e, "Control loop panicked");
            }
        }

        match Arc::try_unwrap(scheduler) {
            Ok(scheduler) => scheduler.shutdown().await,
            Err(_) => tracing::warn!("Scheduler still referenced, skipping pool drain"),
        }
        tracing::info!("Agent stopped");
        Ok(())
    }
}
