use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::endpoint::Vocabulary;
use crate::error::ConfigError;
use crate::transport::Timeouts;

/// Section that holds one sub-table per endpoint.
pub const DEFAULT_ENDPOINTS_SECTION: &str = "endpoints";

/// Top-level agent configuration, read once at start-up.
///
/// Endpoint definitions live in the same file but are not part of this
/// struct: they are re-read through a [`ConfigSource`] on every cycle.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub scheduler: SchedulerConfig,
    pub monitor: MonitorConfig,
    pub ledger: LedgerConfig,
    pub staging: StagingConfig,
    pub sandbox: SandboxConfig,
    pub accounting: AccountingConfig,
    pub queue: QueueConfig,
    pub vocabulary: Vocabulary,
    pub timeouts: Timeouts,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub polling_interval_secs: u64,
    /// Pause after each queued submission, in milliseconds.
    pub thread_start_delay_ms: u64,
    pub endpoints_section: String,
    /// Submit pools enabled for this agent, in iteration order.
    pub submit_pools: Vec<String>,
    pub pools: BTreeMap<String, SubmitPoolConfig>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            polling_interval_secs: 60,
            thread_start_delay_ms: 1000,
            endpoints_section: DEFAULT_ENDPOINTS_SECTION.to_string(),
            submit_pools: Vec::new(),
            pools: BTreeMap::new(),
        }
    }
}

impl SchedulerConfig {
    pub fn polling_interval(&self) -> Duration {
        Duration::from_secs(self.polling_interval_secs)
    }

    pub fn thread_start_delay(&self) -> Duration {
        Duration::from_millis(self.thread_start_delay_ms)
    }

    /// Running endpoints of every enabled pool, paired with the pool name.
    pub fn running_endpoints(&self) -> Vec<(String, String)> {
        self.submit_pools
            .iter()
            .filter_map(|pool| self.pools.get(pool).map(|cfg| (pool, cfg)))
            .flat_map(|(pool, cfg)| {
                cfg.running_endpoints
                    .iter()
                    .map(move |endpoint| (pool.clone(), endpoint.clone()))
            })
            .collect()
    }

    /// Endpoints the monitor polls: each pool's `endpoint_monitoring`, or its
    /// running endpoints when that list is empty.
    pub fn monitoring_endpoints(&self) -> Vec<(String, String)> {
        let mut pairs: Vec<(String, String)> = Vec::new();
        for pool in &self.submit_pools {
            let Some(cfg) = self.pools.get(pool) else {
                continue;
            };
            let source = if cfg.endpoint_monitoring.is_empty() {
                &cfg.running_endpoints
            } else {
                &cfg.endpoint_monitoring
            };
            for name in source {
                if !pairs.iter().any(|(_, n)| n == name) {
                    pairs.push((pool.clone(), name.clone()));
                }
            }
        }
        pairs
    }
}

/// One submit pool: a set of endpoints sharing a bounded worker pool.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SubmitPoolConfig {
    pub running_endpoints: Vec<String>,
    pub endpoint_monitoring: Vec<String>,
    pub workers: usize,
    pub queue_depth: usize,
}

impl Default for SubmitPoolConfig {
    fn default() -> Self {
        Self {
            running_endpoints: Vec::new(),
            endpoint_monitoring: Vec::new(),
            workers: 2,
            queue_depth: 40,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub polling_interval_secs: u64,
    /// Remove remote and local staging paths once a job is done.
    pub clean_after_finish: bool,
    /// Age after which a non-terminal entry is reported as stalled.
    pub stalled_after_secs: u64,
    /// When set, entries still without a backend id after this many seconds
    /// get an error message recorded. Unset means wait indefinitely.
    pub unacknowledged_after_secs: Option<u64>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            polling_interval_secs: 5,
            clean_after_finish: true,
            stalled_after_secs: 30 * 60,
            unacknowledged_after_secs: None,
        }
    }
}

impl MonitorConfig {
    pub fn polling_interval(&self) -> Duration {
        Duration::from_secs(self.polling_interval_secs)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// SQLite database path. `None` keeps the ledger in memory.
    pub path: Option<PathBuf>,
}

/// Where job payloads are staged, locally and on the backend hosts.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StagingConfig {
    pub local_dir: PathBuf,
    pub remote_dir: String,
    pub hive_dir: String,
    /// Delegated credentials, one file per job owner.
    pub credentials_dir: Option<PathBuf>,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            local_dir: PathBuf::from("/tmp/"),
            remote_dir: "/tmp/".to_string(),
            hive_dir: "/tmp/hive_jobs/".to_string(),
            credentials_dir: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Upper bound for one output sandbox upload.
    pub output_size_limit: u64,
    /// Root of the directory-backed sandbox store.
    pub store_dir: PathBuf,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            output_size_limit: 10 * 1024 * 1024,
            store_dir: PathBuf::from("/tmp/sandbox/"),
        }
    }
}

/// Local spool the bundled task queue reads job descriptions from.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub spool_dir: Option<PathBuf>,
    /// JSON map of dataset to replica sites. Defaults to
    /// `<spool_dir>/replicas.json`.
    pub replica_catalog: Option<PathBuf>,
}

impl QueueConfig {
    pub fn replica_catalog_path(&self) -> Option<PathBuf> {
        self.replica_catalog
            .clone()
            .or_else(|| self.spool_dir.as_ref().map(|dir| dir.join("replicas.json")))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AccountingConfig {
    /// JSON-lines file the accounting sink appends to.
    pub path: Option<PathBuf>,
    pub job_group: String,
}

impl Default for AccountingConfig {
    fn default() -> Self {
        Self {
            path: None,
            job_group: "bigdata".to_string(),
        }
    }
}

impl AgentConfig {
    /// Load and validate the agent configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: AgentConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.polling_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.polling_interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.monitor.polling_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "monitor.polling_interval_secs must be greater than 0".to_string(),
            ));
        }
        for pool in &self.scheduler.submit_pools {
            let Some(cfg) = self.scheduler.pools.get(pool) else {
                return Err(ConfigError::Invalid(format!(
                    "submit pool '{}' has no [scheduler.pools.{}] section",
                    pool, pool
                )));
            };
            if cfg.workers == 0 || cfg.queue_depth == 0 {
                return Err(ConfigError::Invalid(format!(
                    "submit pool '{}' needs at least one worker and one queue slot",
                    pool
                )));
            }
        }
        Ok(())
    }
}

/// Read access to named configuration sections.
///
/// Sections are addressed by `/`-separated paths. Nested tables are
/// flattened into `child/key` option names, so an endpoint section yields
/// options such as `HighLevelLanguage/HLLName`.
pub trait ConfigSource: Send + Sync {
    fn options(&self, section: &str) -> Result<BTreeMap<String, String>, ConfigError>;
}

#[derive(Debug, Clone)]
enum TomlOrigin {
    File(PathBuf),
    Inline(toml::Table),
}

/// [`ConfigSource`] backed by a TOML document.
///
/// A file-backed source re-reads the file on every call so endpoint edits
/// are picked up by the next reload.
#[derive(Debug, Clone)]
pub struct TomlConfigSource {
    origin: TomlOrigin,
}

impl TomlConfigSource {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            origin: TomlOrigin::File(path.into()),
        }
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let table: toml::Table = toml::from_str(content)?;
        Ok(Self {
            origin: TomlOrigin::Inline(table),
        })
    }

    fn document(&self) -> Result<toml::Table, ConfigError> {
        match &self.origin {
            TomlOrigin::Inline(table) => Ok(table.clone()),
            TomlOrigin::File(path) => {
                let content =
                    std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                        path: path.display().to_string(),
                        source,
                    })?;
                Ok(toml::from_str(&content)?)
            }
        }
    }
}

impl ConfigSource for TomlConfigSource {
    fn options(&self, section: &str) -> Result<BTreeMap<String, String>, ConfigError> {
        let document = self.document()?;
        let mut current = &document;
        for part in section.split('/').filter(|p| !p.is_empty()) {
            current = current
                .get(part)
                .and_then(toml::Value::as_table)
                .ok_or_else(|| ConfigError::Invalid(format!("section '{}' not found", section)))?;
        }
        let mut options = BTreeMap::new();
        flatten_into("", current, &mut options);
        Ok(options)
    }
}

fn flatten_into(prefix: &str, table: &toml::Table, out: &mut BTreeMap<String, String>) {
    for (key, value) in table {
        let name = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{}/{}", prefix, key)
        };
        match value {
            toml::Value::Table(child) => flatten_into(&name, child, out),
            other => {
                out.insert(name, scalar_to_string(other));
            }
        }
    }
}

fn scalar_to_string(value: &toml::Value) -> String {
    match value {
        toml::Value::String(s) => s.clone(),
        toml::Value::Integer(i) => i.to_string(),
        toml::Value::Float(f) => f.to_string(),
        toml::Value::Boolean(b) => if *b { "1" } else { "0" }.to_string(),
        toml::Value::Datetime(d) => d.to_string(),
        toml::Value::Array(items) => items
            .iter()
            .map(scalar_to_string)
            .collect::<Vec<_>>()
            .join(","),
        toml::Value::Table(_) => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[scheduler]
polling_interval_secs = 30
submit_pools = ["Hadoop"]

[scheduler.pools.Hadoop]
running_endpoints = ["CESGA", "USC"]
endpoint_monitoring = ["CESGA"]
workers = 4

[monitor]
clean_after_finish = false
unacknowledged_after_secs = 3600

[endpoints.CESGA]
NameNode = "namenode.cesga.es"
Port = 9000
IsInteractive = false

[endpoints.CESGA.HighLevelLanguage]
HLLName = "none"
HLLVersion = "none"
"#;

    #[test]
    fn agent_config_default() {
        let cfg = AgentConfig::default();
        assert_eq!(cfg.scheduler.polling_interval_secs, 60);
        assert_eq!(cfg.scheduler.thread_start_delay_ms, 1000);
        assert_eq!(cfg.monitor.polling_interval_secs, 5);
        assert!(cfg.monitor.clean_after_finish);
        assert_eq!(cfg.monitor.stalled_after_secs, 1800);
        assert!(cfg.monitor.unacknowledged_after_secs.is_none());
        assert!(cfg.ledger.path.is_none());
        assert_eq!(cfg.staging.hive_dir, "/tmp/hive_jobs/");
        assert_eq!(cfg.sandbox.output_size_limit, 10 * 1024 * 1024);
    }

    #[test]
    fn submit_pool_default() {
        let pool = SubmitPoolConfig::default();
        assert_eq!(pool.workers, 2);
        assert_eq!(pool.queue_depth, 40);
        assert!(pool.running_endpoints.is_empty());
    }

    #[test]
    fn agent_config_from_toml() {
        let cfg = AgentConfig::from_toml(SAMPLE).unwrap();
        assert_eq!(cfg.scheduler.polling_interval_secs, 30);
        assert_eq!(cfg.scheduler.submit_pools, vec!["Hadoop".to_string()]);
        let pool = &cfg.scheduler.pools["Hadoop"];
        assert_eq!(pool.workers, 4);
        assert_eq!(pool.queue_depth, 40);
        assert!(!cfg.monitor.clean_after_finish);
        assert_eq!(cfg.monitor.unacknowledged_after_secs, Some(3600));
    }

    #[test]
    fn running_and_monitoring_endpoints() {
        let cfg = AgentConfig::from_toml(SAMPLE).unwrap();
        assert_eq!(
            cfg.scheduler.running_endpoints(),
            vec![
                ("Hadoop".to_string(), "CESGA".to_string()),
                ("Hadoop".to_string(), "USC".to_string()),
            ]
        );
        assert_eq!(
            cfg.scheduler.monitoring_endpoints(),
            vec![("Hadoop".to_string(), "CESGA".to_string())]
        );
    }

    #[test]
    fn monitoring_falls_back_to_running_endpoints() {
        let mut cfg = AgentConfig::from_toml(SAMPLE).unwrap();
        if let Some(pool) = cfg.scheduler.pools.get_mut("Hadoop") {
            pool.endpoint_monitoring.clear();
        }
        assert_eq!(
            cfg.scheduler.monitoring_endpoints(),
            cfg.scheduler.running_endpoints()
        );
    }

    #[test]
    fn validate_rejects_unknown_pool() {
        let err = AgentConfig::from_toml("[scheduler]\nsubmit_pools = [\"Spark\"]\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(msg) if msg.contains("Spark")));
    }

    #[test]
    fn validate_rejects_zero_polling() {
        let err = AgentConfig::from_toml("[monitor]\npolling_interval_secs = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn toml_source_flattens_nested_tables() {
        let source = TomlConfigSource::from_toml(SAMPLE).unwrap();
        let options = source.options("endpoints/CESGA").unwrap();
        assert_eq!(options["NameNode"], "namenode.cesga.es");
        assert_eq!(options["Port"], "9000");
        assert_eq!(options["IsInteractive"], "0");
        assert_eq!(options["HighLevelLanguage/HLLName"], "none");
        assert_eq!(options["HighLevelLanguage/HLLVersion"], "none");
    }

    #[test]
    fn toml_source_missing_section() {
        let source = TomlConfigSource::from_toml(SAMPLE).unwrap();
        assert!(source.options("endpoints/NOWHERE").is_err());
    }

    #[test]
    fn toml_source_rereads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.toml");
        std::fs::write(&path, "[endpoints.A]\nPort = 1\n").unwrap();
        let source = TomlConfigSource::open(&path);
        assert_eq!(source.options("endpoints/A").unwrap()["Port"], "1");

        std::fs::write(&path, "[endpoints.A]\nPort = 2\n").unwrap();
        assert_eq!(source.options("endpoints/A").unwrap()["Port"], "2");
    }
}
