use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::transport::{
    CommandOutput, CopyDirection, RemoteExecutor, RemoteHost, StagedPayload, TransportError,
    TransportResult,
};

/// [`RemoteExecutor`] that shells out to `ssh` and `scp`.
///
/// Child processes are killed when their timeout expires. Credentials are
/// looked up as files named after the credential owner inside
/// `credentials_dir` and copied next to the payload as `proxy`.
#[derive(Debug, Clone)]
pub struct SshExecutor {
    ssh_program: String,
    scp_program: String,
    options: Vec<String>,
    credentials_dir: Option<PathBuf>,
}

impl Default for SshExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl SshExecutor {
    pub fn new() -> Self {
        Self {
            ssh_program: "ssh".to_string(),
            scp_program: "scp".to_string(),
            options: vec![
                "-o".to_string(),
                "BatchMode=yes".to_string(),
                "-o".to_string(),
                "StrictHostKeyChecking=accept-new".to_string(),
            ],
            credentials_dir: None,
        }
    }

    pub fn with_credentials_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.credentials_dir = Some(dir.into());
        self
    }

    fn ssh_args(&self, host: &RemoteHost, command: &str) -> Vec<String> {
        let mut args = self.options.clone();
        if !host.user.is_empty() {
            args.push("-l".to_string());
            args.push(host.user.clone());
        }
        args.push(host.address.clone());
        args.push(command.to_string());
        args
    }

    fn scp_args(
        &self,
        host: &RemoteHost,
        source: &str,
        destination: &str,
        direction: CopyDirection,
    ) -> Vec<String> {
        let mut args = self.options.clone();
        args.push("-r".to_string());
        match direction {
            CopyDirection::Upload => {
                args.push(source.to_string());
                args.push(format!("{}:{}", host.login(), destination));
            }
            CopyDirection::Download => {
                args.push(format!("{}:{}", host.login(), source));
                args.push(destination.to_string());
            }
        }
        args
    }

    fn credential_file(&self, owner: &str) -> Option<PathBuf> {
        let dir = self.credentials_dir.as_ref()?;
        let file_name: String = owner
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        let path = dir.join(file_name);
        path.is_file().then_some(path)
    }
}

/// Spawn `program` and wait for it, killing it once `timeout` expires.
async fn execute(
    program: &str,
    args: &[String],
    timeout: Duration,
    operation: &str,
) -> TransportResult<CommandOutput> {
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let result = match tokio::time::timeout(timeout, command.output()).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(operation, ?timeout, "Remote operation timed out");
            return Err(TransportError::Timeout {
                operation: operation.to_string(),
                after: timeout,
            });
        }
    };

    process_output(program, operation, result)
}

fn process_output(
    program: &str,
    operation: &str,
    result: Result<std::process::Output, std::io::Error>,
) -> TransportResult<CommandOutput> {
    match result {
        Ok(output) => {
            let stdout = String::from_utf8_lossy(&output.stdout).to_string();
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            // Killed by a signal: no exit code
            let exit_code = output.status.code().unwrap_or(-1);

            tracing::debug!(operation, exit_code, "Remote operation finished");

            Ok(CommandOutput {
                exit_code,
                stdout,
                stderr,
            })
        }
        Err(e) => {
            tracing::error!(operation, error = %e, "Failed to launch remote operation");
            Err(TransportError::Spawn {
                program: program.to_string(),
                source: e,
            })
        }
    }
}

fn require_success(operation: &str, output: CommandOutput) -> TransportResult<CommandOutput> {
    if output.success() {
        Ok(output)
    } else {
        Err(TransportError::Failed {
            operation: operation.to_string(),
            exit_code: output.exit_code,
            stderr: if output.stderr.is_empty() {
                output.stdout
            } else {
                output.stderr
            },
        })
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn run(
        &self,
        host: &RemoteHost,
        command: &str,
        timeout: Duration,
    ) -> TransportResult<CommandOutput> {
        tracing::debug!(host = %host.login(), command, "Running remote command");
        let args = self.ssh_args(host, command);
        execute(&self.ssh_program, &args, timeout, "ssh").await
    }

    async fn copy(
        &self,
        host: &RemoteHost,
        source: &str,
        destination: &str,
        direction: CopyDirection,
        timeout: Duration,
    ) -> TransportResult<()> {
        tracing::debug!(host = %host.login(), source, destination, ?direction, "Copying");
        let args = self.scp_args(host, source, destination, direction);
        let output = execute(&self.scp_program, &args, timeout, "scp").await?;
        require_success("scp", output).map(|_| ())
    }

    async fn stage(
        &self,
        host: &RemoteHost,
        payload: &StagedPayload,
        timeout: Duration,
    ) -> TransportResult<()> {
        let target_dir = payload.target_dir().to_string();
        let output = self
            .run(host, &format!("mkdir -p {}", target_dir), timeout)
            .await?;
        require_success("mkdir", output)?;

        let executable = payload.executable.to_string_lossy().to_string();
        self.copy(
            host,
            &executable,
            &payload.target_path,
            CopyDirection::Upload,
            timeout,
        )
        .await?;

        let mut setup = format!("chmod 700 {}", payload.target_path);
        match self.credential_file(&payload.credential.owner) {
            Some(credential) => {
                let remote = format!("{}/proxy", target_dir);
                self.copy(
                    host,
                    &credential.to_string_lossy(),
                    &remote,
                    CopyDirection::Upload,
                    timeout,
                )
                .await?;
                setup.push_str(&format!(" && chmod 600 {}", remote));
            }
            None => {
                tracing::debug!(owner = %payload.credential.owner, "No delegated credential for payload owner");
            }
        }

        let output = self.run(host, &setup, timeout).await?;
        require_success("chmod", output).map(|_| ())
    }
}
