//! Remote transport with scripted per-host results.

use crate::lock;
use converge_core::error::TransportError;
use converge_core::remote::{CommandOutput, RemoteHost, RemoteSession, RemoteTransport};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Default)]
struct TransportState {
    outputs: HashMap<(String, String), CommandOutput>,
    unreachable: HashSet<String>,
    connect_delays: HashMap<String, Duration>,
    logs: HashMap<String, Vec<String>>,
    open_sessions: usize,
    max_open_sessions: usize,
}

/// Remote transport with per-host scripted command results.
///
/// Commands without a scripted result succeed with empty output.
#[derive(Debug, Default)]
pub struct FakeTransport {
    state: Arc<Mutex<TransportState>>,
    exec_delay: Duration,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_output(self, host: &str, command: &str, return_code: i32, stdout: &str, stderr: &str) -> Self {
        lock(&self.state).outputs.insert(
            (host.to_string(), command.to_string()),
            CommandOutput {
                return_code,
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
            },
        );
        self
    }

    pub fn with_unreachable(self, host: &str) -> Self {
        lock(&self.state).unreachable.insert(host.to_string());
        self
    }

    pub fn with_connect_delay(self, host: &str, delay: Duration) -> Self {
        lock(&self.state).connect_delays.insert(host.to_string(), delay);
        self
    }

    pub fn with_exec_delay(mut self, delay: Duration) -> Self {
        self.exec_delay = delay;
        self
    }

    /// Operations performed on `host`: `put <src> <dst>`, `exec <cmd>`,
    /// `spawn <cmd>`, `close`
    pub fn log(&self, host: &str) -> Vec<String> {
        lock(&self.state).logs.get(host).cloned().unwrap_or_default()
    }

    pub fn max_open_sessions(&self) -> usize {
        lock(&self.state).max_open_sessions
    }
}

impl RemoteTransport for FakeTransport {
    type Session = FakeSession;

    async fn connect(&self, host: &RemoteHost, _timeout: Duration) -> Result<FakeSession, TransportError> {
        let delay = lock(&self.state).connect_delays.get(&host.address).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = lock(&self.state);
        if state.unreachable.contains(&host.address) {
            return Err(TransportError::Connect {
                host: host.address.clone(),
                reason: "no route to host".to_string(),
            });
        }
        state.open_sessions += 1;
        state.max_open_sessions = state.max_open_sessions.max(state.open_sessions);

        Ok(FakeSession {
            address: host.address.clone(),
            state: Arc::clone(&self.state),
            exec_delay: self.exec_delay,
        })
    }
}

#[derive(Debug)]
pub struct FakeSession {
    address: String,
    state: Arc<Mutex<TransportState>>,
    exec_delay: Duration,
}

impl FakeSession {
    fn record(&self, entry: String) {
        lock(&self.state)
            .logs
            .entry(self.address.clone())
            .or_default()
            .push(entry);
    }
}

impl RemoteSession for FakeSession {
    async fn put_file(&mut self, source: &Path, destination: &str) -> Result<(), TransportError> {
        self.record(format!("put {} {}", source.display(), destination));
        Ok(())
    }

    async fn execute(&mut self, command: &str) -> Result<CommandOutput, TransportError> {
        if !self.exec_delay.is_zero() {
            tokio::time::sleep(self.exec_delay).await;
        }
        self.record(format!("exec {command}"));
        let output = lock(&self.state)
            .outputs
            .get(&(self.address.clone(), command.to_string()))
            .cloned()
            .unwrap_or_default();
        Ok(output)
    }

    async fn spawn_detached(&mut self, command: &str) -> Result<(), TransportError> {
        self.record(format!("spawn {command}"));
        Ok(())
    }

    async fn close(&mut self) {
        self.record("close".to_string());
        lock(&self.state).open_sessions -= 1;
    }
}
