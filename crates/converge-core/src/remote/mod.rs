//! Parallel remote execution
//!
//! [`RemoteOrchestrator::run`] opens one session per host and works
//! through that host's ordered [`RemoteTask`] list. Hosts are driven
//! concurrently on the calling task, bounded by a semaphore; each host
//! future owns its plan and its results, and the only synchronisation is
//! the final join.
//!
//! A command whose return code exceeds the task's limit stops that host's
//! list. A transport failure is recorded against the host. Neither affects
//! other hosts.

pub mod openssh;

use crate::error::{ConvergeError, Result, TransportError};
use converge_common::defaults::{
    DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_MAX_CONCURRENT_HOSTS, default_max_return_code, default_true,
};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

/// Host to open a session against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteHost {
    pub address: String,
    /// Empty means "use the configured default"
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub key_file: Option<PathBuf>,
    #[serde(default)]
    pub port: Option<u16>,
}

impl RemoteHost {
    pub fn new(address: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            username: username.into(),
            key_file: None,
            port: None,
        }
    }

    pub fn with_key_file(mut self, key_file: impl Into<PathBuf>) -> Self {
        self.key_file = Some(key_file.into());
        self
    }

    /// `user@address`
    pub fn destination(&self) -> String {
        format!("{}@{}", self.username, self.address)
    }
}

/// Local file copied to the host before the task's command runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileTransfer {
    pub source: PathBuf,
    pub destination: String,
    /// `chmod +x` the destination after copying (scripts)
    #[serde(default)]
    pub executable: bool,
}

/// One step of a host's plan.
///
/// With [`openssh::OpenSshTransport`], a command that exits 255 and writes
/// an ssh-style diagnostic to stderr cannot be told apart from `ssh`
/// failing to connect, and is reported as a transport error instead of a
/// result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTask {
    #[serde(default)]
    pub transfer: Option<FileTransfer>,
    #[serde(default)]
    pub command: Option<String>,
    /// Capture output and return code; otherwise start the command and move on
    #[serde(default = "default_true")]
    pub wait_for_completion: bool,
    /// Highest acceptable return code; `None` disables the check
    #[serde(default = "default_max_return_code")]
    pub max_return_code: Option<i32>,
}

impl RemoteTask {
    pub fn command(command: impl Into<String>) -> Self {
        Self {
            transfer: None,
            command: Some(command.into()),
            wait_for_completion: true,
            max_return_code: default_max_return_code(),
        }
    }

    pub fn upload(source: impl Into<PathBuf>, destination: impl Into<String>) -> Self {
        Self {
            transfer: Some(FileTransfer {
                source: source.into(),
                destination: destination.into(),
                executable: false,
            }),
            command: None,
            wait_for_completion: true,
            max_return_code: default_max_return_code(),
        }
    }

    pub fn detached(mut self) -> Self {
        self.wait_for_completion = false;
        self
    }

    pub fn with_max_return_code(mut self, max: Option<i32>) -> Self {
        self.max_return_code = max;
        self
    }
}

/// Outcome of one task. Fire-and-continue commands and transfer-only
/// tasks report code 0 and empty output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RemoteResult {
    pub return_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub command: String,
}

/// Captured result of a completed command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub return_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// A host and the tasks to run on it, in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostPlan {
    pub host: RemoteHost,
    pub tasks: Vec<RemoteTask>,
}

/// What happened on one host.
#[derive(Debug)]
pub struct HostOutcome {
    pub address: String,
    pub results: Vec<RemoteResult>,
    /// A task's return code exceeded its limit and the rest were skipped
    pub max_return_code_exceeded: bool,
    /// Transport failure that ended this host's session early
    pub error: Option<TransportError>,
}

impl HostOutcome {
    fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            results: Vec::new(),
            max_return_code_exceeded: false,
            error: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        !self.max_return_code_exceeded && self.error.is_none()
    }
}

/// Per-host outcomes in input order.
#[derive(Debug, Default)]
pub struct RemoteReport {
    pub hosts: Vec<HostOutcome>,
}

impl RemoteReport {
    pub fn all_succeeded(&self) -> bool {
        self.hosts.iter().all(HostOutcome::succeeded)
    }

    pub fn failed_hosts(&self) -> Vec<&str> {
        self.hosts
            .iter()
            .filter(|h| !h.succeeded())
            .map(|h| h.address.as_str())
            .collect()
    }
}

/// Opens sessions to remote hosts.
#[allow(async_fn_in_trait)] // Send+Sync bounds on trait are sufficient
#[cfg_attr(test, mockall::automock(type Session = MockRemoteSession;))]
pub trait RemoteTransport: Send + Sync {
    type Session: RemoteSession;

    /// Open a session; `timeout` bounds the connection handshake.
    async fn connect(&self, host: &RemoteHost, timeout: Duration) -> std::result::Result<Self::Session, TransportError>;
}

/// An open session to one host.
#[allow(async_fn_in_trait)]
#[cfg_attr(test, mockall::automock)]
pub trait RemoteSession: Send {
    async fn put_file(&mut self, source: &Path, destination: &str) -> std::result::Result<(), TransportError>;

    /// Run `command` to completion and capture its output.
    async fn execute(&mut self, command: &str) -> std::result::Result<CommandOutput, TransportError>;

    /// Start `command` without waiting for it.
    async fn spawn_detached(&mut self, command: &str) -> std::result::Result<(), TransportError>;

    async fn close(&mut self);
}

/// Quote `value` for a POSIX shell.
pub(crate) fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Runs host plans in parallel.
#[derive(Debug)]
pub struct RemoteOrchestrator<T> {
    transport: Arc<T>,
    connect_timeout: Duration,
    max_concurrent_hosts: usize,
}

impl<T: RemoteTransport> RemoteOrchestrator<T> {
    pub fn new(transport: Arc<T>) -> Self {
        Self {
            transport,
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            max_concurrent_hosts: DEFAULT_MAX_CONCURRENT_HOSTS,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Limit on sessions open at once; at least 1.
    pub fn with_max_concurrent_hosts(mut self, max: usize) -> Self {
        self.max_concurrent_hosts = max.max(1);
        self
    }

    /// Run every plan and wait for all hosts to finish.
    ///
    /// # Errors
    /// * `Validation` - a plan has an empty address or username
    pub async fn run(&self, plans: Vec<HostPlan>) -> Result<RemoteReport> {
        for plan in &plans {
            if plan.host.address.is_empty() || plan.host.username.is_empty() {
                return Err(ConvergeError::Validation(
                    "every host needs an address and a username".to_string(),
                ));
            }
        }

        info!(hosts = plans.len(), max_concurrent = self.max_concurrent_hosts, "Starting remote execution");
        let semaphore = Semaphore::new(self.max_concurrent_hosts);

        let hosts = join_all(plans.into_iter().map(|plan| {
            let semaphore = &semaphore;
            async move {
                // The semaphore is never closed, so acquire cannot fail
                let _permit = semaphore.acquire().await.ok();
                run_host(self.transport.as_ref(), plan, self.connect_timeout).await
            }
        }))
        .await;

        let report = RemoteReport { hosts };
        info!(failed = report.failed_hosts().len(), "Remote execution finished");
        Ok(report)
    }
}

async fn run_host<T: RemoteTransport>(transport: &T, plan: HostPlan, connect_timeout: Duration) -> HostOutcome {
    let HostPlan { host, tasks } = plan;
    let mut outcome = HostOutcome::new(host.address.clone());

    let connected = tokio::time::timeout(connect_timeout, transport.connect(&host, connect_timeout)).await;
    let mut session = match connected {
        Ok(Ok(session)) => session,
        Ok(Err(e)) => {
            error!(host = %host.address, error = %e, "Connect failed");
            outcome.error = Some(e);
            return outcome;
        }
        Err(_) => {
            error!(host = %host.address, timeout = ?connect_timeout, "Connect timed out");
            outcome.error = Some(TransportError::ConnectTimeout {
                host: host.address.clone(),
                timeout: connect_timeout,
            });
            return outcome;
        }
    };
    debug!(host = %host.address, tasks = tasks.len(), "Session open");

    for (index, task) in tasks.iter().enumerate() {
        match run_task(&mut session, task).await {
            Ok(result) => {
                let exceeded = task.max_return_code.is_some_and(|max| result.return_code > max);
                if exceeded {
                    warn!(
                        host = %host.address,
                        task = index,
                        return_code = result.return_code,
                        command = %result.command,
                        "Return code above limit, skipping remaining tasks"
                    );
                }
                outcome.results.push(result);
                if exceeded {
                    outcome.max_return_code_exceeded = true;
                    break;
                }
            }
            Err(e) => {
                error!(host = %host.address, task = index, error = %e, "Remote task failed");
                outcome.error = Some(e);
                break;
            }
        }
    }

    session.close().await;
    outcome
}

async fn run_task<S: RemoteSession>(session: &mut S, task: &RemoteTask) -> std::result::Result<RemoteResult, TransportError> {
    if let Some(transfer) = &task.transfer {
        session.put_file(&transfer.source, &transfer.destination).await?;
        if transfer.executable {
            let chmod = format!("chmod +x {}", shell_quote(&transfer.destination));
            let output = session.execute(&chmod).await?;
            if output.return_code != 0 {
                return Err(TransportError::Transfer {
                    source_path: transfer.source.clone(),
                    destination: transfer.destination.clone(),
                    reason: format!("chmod exited with {}: {}", output.return_code, output.stderr.trim()),
                });
            }
        }
    }

    let Some(command) = &task.command else {
        return Ok(RemoteResult::default());
    };

    if task.wait_for_completion {
        let output = session.execute(command).await?;
        Ok(RemoteResult {
            return_code: output.return_code,
            stdout: output.stdout,
            stderr: output.stderr,
            command: command.clone(),
        })
    } else {
        session.spawn_detached(command).await?;
        Ok(RemoteResult {
            command: command.clone(),
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::Sequence;
    use mockall::predicate::eq;

    fn host(address: &str) -> RemoteHost {
        RemoteHost::new(address, "ec2-user")
    }

    fn output(return_code: i32, stdout: &str, stderr: &str) -> CommandOutput {
        CommandOutput {
            return_code,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        }
    }

    /// Transport whose every connect yields the session built by `session`.
    fn transport_with(session: impl Fn() -> MockRemoteSession + Send + Sync + 'static) -> Arc<MockRemoteTransport> {
        let mut transport = MockRemoteTransport::new();
        transport.expect_connect().returning(move |_, _| Ok(session()));
        Arc::new(transport)
    }

    #[test]
    fn test_task_defaults_from_json() {
        let task: RemoteTask = serde_json::from_str(r#"{"command": "uptime"}"#).unwrap();
        assert!(task.wait_for_completion);
        assert_eq!(task.max_return_code, Some(0));

        let unchecked: RemoteTask =
            serde_json::from_str(r#"{"command": "rm -f x", "max_return_code": null}"#).unwrap();
        assert_eq!(unchecked.max_return_code, None);
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/tmp/run.sh"), "'/tmp/run.sh'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[tokio::test]
    async fn test_runs_tasks_in_order() {
        let transport = transport_with(|| {
            let mut session = MockRemoteSession::new();
            let mut seq = Sequence::new();
            session
                .expect_put_file()
                .times(1)
                .in_sequence(&mut seq)
                .withf(|source, destination| {
                    source == Path::new("/tmp/job.tar") && destination == "/home/ec2-user/job.tar"
                })
                .returning(|_, _| Ok(()));
            session
                .expect_execute()
                .with(eq("tar xf job.tar"))
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_| Ok(output(0, "", "")));
            session
                .expect_spawn_detached()
                .with(eq("./start.sh"))
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_| Ok(()));
            session.expect_close().times(1).in_sequence(&mut seq).returning(|| ());
            session
        });
        let plan = HostPlan {
            host: host("10.0.0.1"),
            tasks: vec![
                RemoteTask::upload("/tmp/job.tar", "/home/ec2-user/job.tar"),
                RemoteTask::command("tar xf job.tar"),
                RemoteTask::command("./start.sh").detached(),
            ],
        };

        let report = RemoteOrchestrator::new(transport).run(vec![plan]).await.unwrap();

        assert!(report.all_succeeded());
        let outcome = &report.hosts[0];
        assert_eq!(outcome.results.len(), 3);
        assert_eq!(outcome.results[1].command, "tar xf job.tar");
        assert_eq!(outcome.results[2].return_code, 0);
    }

    #[tokio::test]
    async fn test_executable_upload_is_chmodded() {
        let transport = transport_with(|| {
            let mut session = MockRemoteSession::new();
            session.expect_put_file().times(1).returning(|_, _| Ok(()));
            session
                .expect_execute()
                .with(eq("chmod +x '/tmp/run.sh'"))
                .times(1)
                .returning(|_| Ok(output(0, "", "")));
            session.expect_close().returning(|| ());
            session
        });
        let mut task = RemoteTask::upload("run.sh", "/tmp/run.sh");
        if let Some(transfer) = task.transfer.as_mut() {
            transfer.executable = true;
        }
        let plan = HostPlan {
            host: host("h1"),
            tasks: vec![task],
        };

        let report = RemoteOrchestrator::new(transport).run(vec![plan]).await.unwrap();
        assert!(report.all_succeeded());
    }

    #[tokio::test]
    async fn test_failed_chmod_is_transfer_error() {
        let transport = transport_with(|| {
            let mut session = MockRemoteSession::new();
            session.expect_put_file().returning(|_, _| Ok(()));
            session
                .expect_execute()
                .returning(|_| Ok(output(1, "", "Operation not permitted")));
            session.expect_close().times(1).returning(|| ());
            session
        });
        let mut task = RemoteTask::upload("run.sh", "/tmp/run.sh");
        if let Some(transfer) = task.transfer.as_mut() {
            transfer.executable = true;
        }
        let plans = vec![HostPlan {
            host: host("h1"),
            tasks: vec![task, RemoteTask::command("/tmp/run.sh")],
        }];

        let report = RemoteOrchestrator::new(transport).run(plans).await.unwrap();

        assert!(matches!(report.hosts[0].error, Some(TransportError::Transfer { .. })));
        assert!(report.hosts[0].results.is_empty());
    }

    #[tokio::test]
    async fn test_return_code_limit_stops_host() {
        let transport = transport_with(|| {
            let mut session = MockRemoteSession::new();
            session
                .expect_execute()
                .with(eq("make"))
                .times(1)
                .returning(|_| Ok(output(2, "", "no rule")));
            session.expect_execute().with(eq("make install")).never();
            session.expect_close().times(1).returning(|| ());
            session
        });
        let plan = HostPlan {
            host: host("h1"),
            tasks: vec![RemoteTask::command("make"), RemoteTask::command("make install")],
        };

        let report = RemoteOrchestrator::new(transport).run(vec![plan]).await.unwrap();

        let outcome = &report.hosts[0];
        assert!(outcome.max_return_code_exceeded);
        assert!(outcome.error.is_none());
        assert_eq!(outcome.results.len(), 1);
        assert_eq!(outcome.results[0].return_code, 2);
        assert_eq!(report.failed_hosts(), vec!["h1"]);
    }

    #[tokio::test]
    async fn test_unchecked_return_code_continues() {
        let transport = transport_with(|| {
            let mut session = MockRemoteSession::new();
            session
                .expect_execute()
                .with(eq("rm stale"))
                .returning(|_| Ok(output(1, "", "missing")));
            session
                .expect_execute()
                .with(eq("echo ok"))
                .returning(|_| Ok(output(0, "ok\n", "")));
            session.expect_close().returning(|| ());
            session
        });
        let plan = HostPlan {
            host: host("h1"),
            tasks: vec![
                RemoteTask::command("rm stale").with_max_return_code(None),
                RemoteTask::command("echo ok"),
            ],
        };

        let report = RemoteOrchestrator::new(transport).run(vec![plan]).await.unwrap();

        assert!(report.all_succeeded());
        assert_eq!(report.hosts[0].results.len(), 2);
        assert_eq!(report.hosts[0].results[0].stderr, "missing");
    }

    #[tokio::test]
    async fn test_connect_failure_is_recorded_per_host() {
        let mut transport = MockRemoteTransport::new();
        transport
            .expect_connect()
            .withf(|host, _| host.address == "bad")
            .returning(|host, _| {
                Err(TransportError::Connect {
                    host: host.address.clone(),
                    reason: "no route to host".to_string(),
                })
            });
        transport
            .expect_connect()
            .withf(|host, _| host.address == "good")
            .returning(|_, _| {
                let mut session = MockRemoteSession::new();
                session.expect_execute().returning(|_| Ok(output(0, "", "")));
                session.expect_close().returning(|| ());
                Ok(session)
            });
        let plans = vec![
            HostPlan {
                host: host("bad"),
                tasks: vec![RemoteTask::command("true")],
            },
            HostPlan {
                host: host("good"),
                tasks: vec![RemoteTask::command("true")],
            },
        ];

        let report = RemoteOrchestrator::new(Arc::new(transport)).run(plans).await.unwrap();

        assert_eq!(report.hosts[0].address, "bad");
        assert!(matches!(report.hosts[0].error, Some(TransportError::Connect { .. })));
        assert!(report.hosts[0].results.is_empty());
        assert!(report.hosts[1].succeeded());
        assert_eq!(report.failed_hosts(), vec!["bad"]);
    }

    #[tokio::test]
    async fn test_exec_failure_still_closes_session() {
        let transport = transport_with(|| {
            let mut session = MockRemoteSession::new();
            session.expect_execute().returning(|command| {
                Err(TransportError::Exec {
                    command: command.to_string(),
                    reason: "broken pipe".to_string(),
                })
            });
            session.expect_close().times(1).returning(|| ());
            session
        });
        let plan = HostPlan {
            host: host("h1"),
            tasks: vec![RemoteTask::command("uptime"), RemoteTask::command("uptime")],
        };

        let report = RemoteOrchestrator::new(transport).run(vec![plan]).await.unwrap();

        assert!(matches!(report.hosts[0].error, Some(TransportError::Exec { .. })));
    }

    #[tokio::test]
    async fn test_empty_username_is_invalid() {
        let mut transport = MockRemoteTransport::new();
        transport.expect_connect().never();
        let plan = HostPlan {
            host: RemoteHost::new("h1", ""),
            tasks: vec![],
        };

        let err = RemoteOrchestrator::new(Arc::new(transport))
            .run(vec![plan])
            .await
            .unwrap_err();
        assert!(matches!(err, ConvergeError::Validation(_)));
    }
}
