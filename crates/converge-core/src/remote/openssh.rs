//! Remote sessions driven through the system `ssh` and `scp` binaries.
//!
//! There is no persistent connection: `connect` checks the host once with
//! the configured timeout, and every later call runs its own `ssh`/`scp`
//! process with the same options.
//!
//! `ssh` exits 255 when it fails to connect or authenticate, but a remote
//! command may exit 255 as well. Status 255 is reported as a transport error
//! only when stderr carries one of ssh's own diagnostics; otherwise it is an
//! ordinary command result.

use super::{CommandOutput, RemoteHost, RemoteSession, RemoteTransport, shell_quote};
use crate::error::TransportError;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

const SSH_FAILURE: i32 = 255;

/// Stderr fragments written by `ssh` itself, never by the remote command.
const SSH_DIAGNOSTICS: &[&str] = &[
    "Permission denied (",
    "Host key verification failed",
    "Connection closed by",
    "Connection reset by",
    "Connection timed out during banner exchange",
    "kex_exchange_identification",
];

/// Transport that shells out to OpenSSH.
#[derive(Debug, Clone)]
pub struct OpenSshTransport {
    ssh_program: PathBuf,
    scp_program: PathBuf,
}

impl Default for OpenSshTransport {
    fn default() -> Self {
        Self {
            ssh_program: PathBuf::from("ssh"),
            scp_program: PathBuf::from("scp"),
        }
    }
}

impl OpenSshTransport {
    pub fn new(ssh_program: impl Into<PathBuf>, scp_program: impl Into<PathBuf>) -> Self {
        Self {
            ssh_program: ssh_program.into(),
            scp_program: scp_program.into(),
        }
    }
}

/// Options shared by `ssh` and `scp`. The port flag differs between them.
fn common_options(host: &RemoteHost, timeout: Duration, port_flag: &str) -> Vec<String> {
    let mut args = vec![
        "-o".to_string(),
        "BatchMode=yes".to_string(),
        "-o".to_string(),
        format!("ConnectTimeout={}", timeout.as_secs().max(1)),
        "-o".to_string(),
        "StrictHostKeyChecking=accept-new".to_string(),
    ];
    if let Some(key) = &host.key_file {
        args.push("-i".to_string());
        args.push(key.display().to_string());
    }
    if let Some(port) = host.port {
        args.push(port_flag.to_string());
        args.push(port.to_string());
    }
    args
}

pub(crate) fn ssh_args(host: &RemoteHost, timeout: Duration, command: &str) -> Vec<String> {
    let mut args = common_options(host, timeout, "-p");
    args.push(host.destination());
    args.push("--".to_string());
    args.push(command.to_string());
    args
}

pub(crate) fn scp_args(host: &RemoteHost, timeout: Duration, source: &Path, destination: &str) -> Vec<String> {
    let mut args = vec!["-q".to_string()];
    args.extend(common_options(host, timeout, "-P"));
    args.push(source.display().to_string());
    args.push(format!("{}:{}", host.destination(), destination));
    args
}

/// Remote command line that starts `command` in the background, detached
/// from the ssh channel.
pub(crate) fn detached_command(command: &str) -> String {
    format!("nohup sh -c {} >/dev/null 2>&1 &", shell_quote(command))
}

/// Whether an exit status and stderr describe `ssh` failing rather than the
/// remote command.
pub(crate) fn is_ssh_failure(code: Option<i32>, stderr: &str) -> bool {
    if code != Some(SSH_FAILURE) {
        return false;
    }
    stderr.lines().map(str::trim_start).any(|line| {
        line.starts_with("ssh: ") || SSH_DIAGNOSTICS.iter().any(|diagnostic| line.contains(diagnostic))
    })
}

async fn run(program: &Path, args: &[String]) -> std::io::Result<Output> {
    Command::new(program)
        .args(args)
        .stdin(std::process::Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
}

impl RemoteTransport for OpenSshTransport {
    type Session = OpenSshSession;

    async fn connect(&self, host: &RemoteHost, timeout: Duration) -> Result<OpenSshSession, TransportError> {
        let connect_err = |reason: String| TransportError::Connect {
            host: host.address.clone(),
            reason,
        };

        let output = run(&self.ssh_program, &ssh_args(host, timeout, "true"))
            .await
            .map_err(|e| connect_err(e.to_string()))?;
        if !output.status.success() {
            return Err(connect_err(String::from_utf8_lossy(&output.stderr).trim().to_string()));
        }

        debug!(host = %host.address, "ssh connectivity check succeeded");
        Ok(OpenSshSession {
            host: host.clone(),
            timeout,
            ssh_program: self.ssh_program.clone(),
            scp_program: self.scp_program.clone(),
        })
    }
}

/// Session state: where to connect and with which options.
#[derive(Debug)]
pub struct OpenSshSession {
    host: RemoteHost,
    timeout: Duration,
    ssh_program: PathBuf,
    scp_program: PathBuf,
}

impl OpenSshSession {
    async fn ssh(&self, command: &str) -> Result<Output, TransportError> {
        run(&self.ssh_program, &ssh_args(&self.host, self.timeout, command))
            .await
            .map_err(|e| TransportError::Exec {
                command: command.to_string(),
                reason: e.to_string(),
            })
    }
}

impl RemoteSession for OpenSshSession {
    async fn put_file(&mut self, source: &Path, destination: &str) -> Result<(), TransportError> {
        let transfer_err = |reason: String| TransportError::Transfer {
            source_path: source.to_path_buf(),
            destination: destination.to_string(),
            reason,
        };

        let args = scp_args(&self.host, self.timeout, source, destination);
        let output = run(&self.scp_program, &args)
            .await
            .map_err(|e| transfer_err(e.to_string()))?;
        if !output.status.success() {
            return Err(transfer_err(String::from_utf8_lossy(&output.stderr).trim().to_string()));
        }
        Ok(())
    }

    async fn execute(&mut self, command: &str) -> Result<CommandOutput, TransportError> {
        let output = self.ssh(command).await?;
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        let code = output.status.code();
        if is_ssh_failure(code, &stderr) {
            return Err(TransportError::Connect {
                host: self.host.address.clone(),
                reason: stderr.trim().to_string(),
            });
        }

        match code {
            Some(return_code) => Ok(CommandOutput {
                return_code,
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr,
            }),
            None => Err(TransportError::Exec {
                command: command.to_string(),
                reason: "ssh terminated by signal".to_string(),
            }),
        }
    }

    async fn spawn_detached(&mut self, command: &str) -> Result<(), TransportError> {
        let output = self.ssh(&detached_command(command)).await?;
        if !output.status.success() {
            return Err(TransportError::Exec {
                command: command.to_string(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    async fn close(&mut self) {}
}
