//! Durable message queue client
//!
//! [`DurableQueue`] keeps one [`QueueSession`] open against a named queue
//! and retries send/receive/delete/purge after recoverable failures,
//! rebuilding the whole session between attempts.
//!
//! ## Collaborators
//!
//! - [`QueueConnector`]: opens a fresh connection (region and credentials
//!   are the connector's concern)
//! - [`QueueConnection`]: the per-connection queue calls

mod client;

pub use client::{DurableQueue, QueueOp};

use crate::error::CloudError;
use converge_common::defaults::{
    DEFAULT_QUEUE_ATTEMPT_INTERVAL_SECS, DEFAULT_QUEUE_ATTEMPT_MAX, DEFAULT_RECEIVE_WAIT_TIME_SECS,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

/// Resolved queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueHandle {
    pub name: String,
    pub url: String,
}

/// Optional send parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendOptions {
    /// Per-message delivery delay
    pub delay_seconds: Option<u32>,
    /// String message attributes
    pub attributes: BTreeMap<String, String>,
}

/// Message as returned by the provider, body still encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub message_id: String,
    pub receipt_handle: String,
    pub body: String,
    pub attributes: BTreeMap<String, String>,
}

/// Message with its body decoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReceivedMessage {
    pub message_id: String,
    pub receipt_handle: String,
    pub body: String,
    pub attributes: BTreeMap<String, String>,
}

/// Message whose body did not decode with the configured encoding.
///
/// Carries the receipt handle so the caller can delete it with
/// [`DurableQueue::discard`] instead of having it redelivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UndecodableMessage {
    pub message_id: String,
    pub receipt_handle: String,
    /// Body exactly as received
    pub body: String,
    pub reason: String,
}

/// Everything one receive call took off the queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReceiveBatch {
    pub messages: Vec<ReceivedMessage>,
    pub undecodable: Vec<UndecodableMessage>,
}

impl ReceiveBatch {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.undecodable.is_empty()
    }

    pub fn len(&self) -> usize {
        self.messages.len() + self.undecodable.len()
    }
}

/// Payload encoding applied symmetrically on send and receive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadEncoding {
    /// Standard-alphabet base64
    #[default]
    Base64,
    /// Bodies are sent and returned unchanged
    Raw,
}

/// Attempt budget and fixed delay for one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_QUEUE_ATTEMPT_MAX,
            interval: Duration::from_secs(DEFAULT_QUEUE_ATTEMPT_INTERVAL_SECS),
        }
    }
}

/// Per-operation retry policies plus session settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueClientConfig {
    pub send: RetryPolicy,
    pub receive: RetryPolicy,
    pub delete: RetryPolicy,
    pub purge: RetryPolicy,
    /// Long-poll wait time applied to the queue on every (re)connect
    pub receive_wait_time_secs: u32,
    pub encoding: PayloadEncoding,
}

impl Default for QueueClientConfig {
    fn default() -> Self {
        Self {
            send: RetryPolicy::default(),
            receive: RetryPolicy::default(),
            delete: RetryPolicy::default(),
            purge: RetryPolicy::default(),
            receive_wait_time_secs: DEFAULT_RECEIVE_WAIT_TIME_SECS,
            encoding: PayloadEncoding::Base64,
        }
    }
}

impl QueueClientConfig {
    pub fn policy(&self, op: QueueOp) -> RetryPolicy {
        match op {
            QueueOp::Send => self.send,
            QueueOp::Receive => self.receive,
            QueueOp::Delete => self.delete,
            QueueOp::Purge => self.purge,
        }
    }
}

/// Opens connections to the queue service.
pub trait QueueConnector: Send + Sync {
    type Connection: QueueConnection;

    fn connect(&self) -> impl Future<Output = Result<Self::Connection, CloudError>> + Send;
}

/// Queue calls available on one open connection.
pub trait QueueConnection: Send + Sync {
    /// Look a queue up by name; `None` when it does not exist.
    fn resolve_queue(&self, name: &str) -> impl Future<Output = Result<Option<QueueHandle>, CloudError>> + Send;

    fn set_receive_wait_time(
        &self,
        queue: &QueueHandle,
        seconds: u32,
    ) -> impl Future<Output = Result<(), CloudError>> + Send;

    /// Returns the provider-assigned message id.
    fn send_message(
        &self,
        queue: &QueueHandle,
        body: &str,
        options: &SendOptions,
    ) -> impl Future<Output = Result<String, CloudError>> + Send;

    fn receive_messages(
        &self,
        queue: &QueueHandle,
        max_messages: u32,
        attribute_names: &[String],
    ) -> impl Future<Output = Result<Vec<RawMessage>, CloudError>> + Send;

    fn delete_message(
        &self,
        queue: &QueueHandle,
        receipt_handle: &str,
    ) -> impl Future<Output = Result<(), CloudError>> + Send;

    fn purge_queue(&self, queue: &QueueHandle) -> impl Future<Output = Result<(), CloudError>> + Send;
}

/// One connection plus the queue resolved on it.
///
/// Either both halves are present or the session is disconnected; it is
/// replaced as a whole, never patched.
#[derive(Debug)]
pub struct QueueSession<C> {
    connection: Option<C>,
    queue: Option<QueueHandle>,
}

impl<C> QueueSession<C> {
    pub fn disconnected() -> Self {
        Self {
            connection: None,
            queue: None,
        }
    }

    pub fn connected(connection: C, queue: QueueHandle) -> Self {
        Self {
            connection: Some(connection),
            queue: Some(queue),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some() && self.queue.is_some()
    }

    pub fn parts(&self) -> Option<(&C, &QueueHandle)> {
        match (&self.connection, &self.queue) {
            (Some(connection), Some(queue)) => Some((connection, queue)),
            _ => None,
        }
    }

    pub fn queue(&self) -> Option<&QueueHandle> {
        self.queue.as_ref()
    }
}
