//! Remote execution on backend hosts.
//!
//! Drivers never talk to a cluster directly: they issue commands and file
//! copies through a [`RemoteExecutor`]. Every call carries an explicit
//! timeout; a call that runs out of time fails with
//! [`TransportError::Timeout`] instead of hanging the caller.
//!
//! # Components
//!
//! - [`RemoteExecutor`]: run a command, copy files, stage a payload
//! - [`Timeouts`]: per-operation time limits (status polls, transfers, deletions)
//! - [`StagedPayload`]: executable plus credential handed to the executor as a value
//! - [`ssh::SshExecutor`]: implementation on top of the `ssh` and `scp` binaries

pub mod ssh;

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use ssh::SshExecutor;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("{operation} failed with exit code {exit_code}: {stderr}")]
    Failed {
        operation: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("Local I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Login identity on a backend host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteHost {
    pub user: String,
    pub address: String,
}

impl RemoteHost {
    /// `user@address`, or just the address when no user is configured.
    pub fn login(&self) -> String {
        if self.user.is_empty() {
            self.address.clone()
        } else {
            format!("{}@{}", self.user, self.address)
        }
    }
}

/// Result of a remote command that ran to completion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyDirection {
    /// Local path to the remote host.
    Upload,
    /// Remote path to the local filesystem.
    Download,
}

/// Owner of the credential a payload runs with.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRef {
    pub owner: String,
    pub group: String,
}

/// An executable to be placed on a backend host together with the
/// credential it runs under. How the credential travels is the executor's
/// concern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedPayload {
    pub credential: CredentialRef,
    pub executable: PathBuf,
    /// Remote path the executable must end up at.
    pub target_path: String,
}

impl StagedPayload {
    /// Remote directory that receives the payload.
    pub fn target_dir(&self) -> &str {
        Path::new(&self.target_path)
            .parent()
            .and_then(Path::to_str)
            .filter(|p| !p.is_empty())
            .unwrap_or("/tmp")
    }
}

/// Time limits for the different kinds of remote operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub status_secs: u64,
    pub transfer_secs: u64,
    pub delete_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            status_secs: 10,
            transfer_secs: 100,
            delete_secs: 24 * 60 * 60,
        }
    }
}

impl Timeouts {
    pub fn status(&self) -> Duration {
        Duration::from_secs(self.status_secs)
    }

    pub fn transfer(&self) -> Duration {
        Duration::from_secs(self.transfer_secs)
    }

    pub fn delete(&self) -> Duration {
        Duration::from_secs(self.delete_secs)
    }
}

#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Run a shell command on the host. A non-zero exit code is reported in
    /// the output, not as an error.
    async fn run(
        &self,
        host: &RemoteHost,
        command: &str,
        timeout: Duration,
    ) -> TransportResult<CommandOutput>;

    /// Copy a file or directory tree between the local filesystem and the host.
    async fn copy(
        &self,
        host: &RemoteHost,
        source: &str,
        destination: &str,
        direction: CopyDirection,
        timeout: Duration,
    ) -> TransportResult<()>;

    /// Place an executable and its credential on the host.
    async fn stage(
        &self,
        host: &RemoteHost,
        payload: &StagedPayload,
        timeout: Duration,
    ) -> TransportResult<()>;
}
