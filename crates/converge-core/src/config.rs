//! Settings loading from JSON
//!
//! Every field has a default, so an empty object (or no file at all) gives
//! the stock behaviour.

use crate::allocator::AllocateOptions;
use crate::queue::{PayloadEncoding, QueueClientConfig, RetryPolicy};
use crate::spot::SpotPollConfig;
use crate::wait::PollConfig;
use anyhow::{Context, Result};
use converge_common::defaults::*;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Settings validation errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{section}.max_attempts must be at least 1")]
    ZeroAttempts { section: &'static str },

    #[error("{section}.max_minutes must be greater than 0")]
    ZeroDeadline { section: &'static str },

    #[error("remote.max_concurrent_hosts must be at least 1")]
    ZeroHostConcurrency,

    #[error("transfer.max_concurrency must be at least 1")]
    ZeroTransferConcurrency,

    #[error("remote.username cannot be empty")]
    EmptyUsername,

    #[error("remote.connect_timeout_secs must be greater than 0")]
    ZeroConnectTimeout,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PollSettings {
    pub interval_secs: u64,
    pub max_minutes: u64,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            max_minutes: DEFAULT_POLL_MAX_MINUTES,
        }
    }
}

impl PollSettings {
    pub fn poll_config(&self) -> PollConfig {
        PollConfig::from_minutes(self.interval_secs, self.max_minutes)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AllocateSettings {
    pub max_attempts: u32,
    /// Wait for the new resource to become visible before returning
    pub sync: bool,
}

impl Default for AllocateSettings {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_UNIQUE_MAX_ATTEMPTS,
            sync: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SpotSettings {
    pub interval_secs: u64,
    pub max_minutes: u64,
    pub cancel_on_timeout: bool,
}

impl Default for SpotSettings {
    fn default() -> Self {
        Self {
            interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            max_minutes: DEFAULT_POLL_MAX_MINUTES,
            cancel_on_timeout: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub interval_secs: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_QUEUE_ATTEMPT_MAX,
            interval_secs: DEFAULT_QUEUE_ATTEMPT_INTERVAL_SECS,
        }
    }
}

impl From<RetrySettings> for RetryPolicy {
    fn from(s: RetrySettings) -> Self {
        RetryPolicy {
            max_attempts: s.max_attempts,
            interval: Duration::from_secs(s.interval_secs),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    pub send: RetrySettings,
    pub receive: RetrySettings,
    pub delete: RetrySettings,
    pub purge: RetrySettings,
    pub receive_wait_time_secs: u32,
    pub encoding: PayloadEncoding,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            send: RetrySettings::default(),
            receive: RetrySettings::default(),
            delete: RetrySettings::default(),
            purge: RetrySettings::default(),
            receive_wait_time_secs: DEFAULT_RECEIVE_WAIT_TIME_SECS,
            encoding: PayloadEncoding::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RemoteSettings {
    pub connect_timeout_secs: u64,
    pub username: String,
    pub max_concurrent_hosts: usize,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            username: default_remote_username(),
            max_concurrent_hosts: DEFAULT_MAX_CONCURRENT_HOSTS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TransferSettings {
    pub max_concurrency: usize,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_TRANSFER_CONCURRENCY,
        }
    }
}

/// Settings for every convergence operation
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub poll: PollSettings,
    pub allocate: AllocateSettings,
    pub spot: SpotSettings,
    pub queue: QueueSettings,
    pub remote: RemoteSettings,
    pub transfer: TransferSettings,
}

impl Settings {
    /// Load settings from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file: {}", path.display()))?;

        let settings: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse settings file: {}", path.display()))?;

        settings.validate()?;
        Ok(settings)
    }

    /// Load from `path` when given, else use defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    /// Validate settings values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll.max_minutes == 0 {
            return Err(ConfigError::ZeroDeadline { section: "poll" });
        }
        if self.spot.max_minutes == 0 {
            return Err(ConfigError::ZeroDeadline { section: "spot" });
        }
        if self.allocate.max_attempts == 0 {
            return Err(ConfigError::ZeroAttempts { section: "allocate" });
        }

        for (section, retry) in [
            ("queue.send", self.queue.send),
            ("queue.receive", self.queue.receive),
            ("queue.delete", self.queue.delete),
            ("queue.purge", self.queue.purge),
        ] {
            if retry.max_attempts == 0 {
                return Err(ConfigError::ZeroAttempts { section });
            }
        }

        if self.remote.username.is_empty() {
            return Err(ConfigError::EmptyUsername);
        }
        if self.remote.connect_timeout_secs == 0 {
            return Err(ConfigError::ZeroConnectTimeout);
        }
        if self.remote.max_concurrent_hosts == 0 {
            return Err(ConfigError::ZeroHostConcurrency);
        }
        if self.transfer.max_concurrency == 0 {
            return Err(ConfigError::ZeroTransferConcurrency);
        }

        Ok(())
    }

    pub fn poll_config(&self) -> PollConfig {
        self.poll.poll_config()
    }

    pub fn spot_config(&self) -> SpotPollConfig {
        SpotPollConfig {
            interval: Duration::from_secs(self.spot.interval_secs),
            max_duration: Duration::from_secs(self.spot.max_minutes * 60),
            cancel_on_timeout: self.spot.cancel_on_timeout,
        }
    }

    /// Allocation options; `sync` selects whether existence is polled.
    pub fn allocate_options(&self) -> AllocateOptions {
        AllocateOptions {
            max_attempts: self.allocate.max_attempts,
            seed: None,
            sync: self.allocate.sync.then(|| self.poll_config()),
        }
    }

    pub fn queue_config(&self) -> QueueClientConfig {
        QueueClientConfig {
            send: self.queue.send.into(),
            receive: self.queue.receive.into(),
            delete: self.queue.delete.into(),
            purge: self.queue.purge.into(),
            receive_wait_time_secs: self.queue.receive_wait_time_secs,
            encoding: self.queue.encoding,
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.remote.connect_timeout_secs)
    }
}
