use super::{
    PayloadEncoding, QueueClientConfig, QueueConnection, QueueConnector, QueueHandle, QueueSession,
    RawMessage, ReceiveBatch, ReceivedMessage, RetryPolicy, SendOptions, UndecodableMessage,
};
use crate::error::{CloudError, ConvergeError, Result};
use backon::{BackoffBuilder, ConstantBackoff, ConstantBuilder};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Largest batch a single receive call may ask for.
const MAX_RECEIVE_BATCH: u32 = 10;

/// Public queue operations, each with its own retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueOp {
    Send,
    Receive,
    Delete,
    Purge,
}

impl QueueOp {
    fn operation_name(self) -> &'static str {
        match self {
            QueueOp::Send => "SendMessage",
            QueueOp::Receive => "ReceiveMessage",
            QueueOp::Delete => "DeleteMessage",
            QueueOp::Purge => "PurgeQueue",
        }
    }
}

impl fmt::Display for QueueOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.operation_name())
    }
}

/// One queue call and the type it yields.
trait QueueRequest {
    type Output;

    const OP: QueueOp;

    async fn perform<C: QueueConnection>(
        &self,
        connection: &C,
        queue: &QueueHandle,
    ) -> std::result::Result<Self::Output, CloudError>;
}

struct SendRequest<'a> {
    body: &'a str,
    options: &'a SendOptions,
}

impl QueueRequest for SendRequest<'_> {
    type Output = String;

    const OP: QueueOp = QueueOp::Send;

    async fn perform<C: QueueConnection>(
        &self,
        connection: &C,
        queue: &QueueHandle,
    ) -> std::result::Result<String, CloudError> {
        connection.send_message(queue, self.body, self.options).await
    }
}

struct ReceiveRequest<'a> {
    max_messages: u32,
    attribute_names: &'a [String],
}

impl QueueRequest for ReceiveRequest<'_> {
    type Output = Vec<RawMessage>;

    const OP: QueueOp = QueueOp::Receive;

    async fn perform<C: QueueConnection>(
        &self,
        connection: &C,
        queue: &QueueHandle,
    ) -> std::result::Result<Vec<RawMessage>, CloudError> {
        connection
            .receive_messages(queue, self.max_messages, self.attribute_names)
            .await
    }
}

struct DeleteRequest<'a> {
    receipt_handle: &'a str,
}

impl QueueRequest for DeleteRequest<'_> {
    type Output = ();

    const OP: QueueOp = QueueOp::Delete;

    async fn perform<C: QueueConnection>(&self, connection: &C, queue: &QueueHandle) -> std::result::Result<(), CloudError> {
        connection.delete_message(queue, self.receipt_handle).await
    }
}

struct PurgeRequest;

impl QueueRequest for PurgeRequest {
    type Output = ();

    const OP: QueueOp = QueueOp::Purge;

    async fn perform<C: QueueConnection>(&self, connection: &C, queue: &QueueHandle) -> std::result::Result<(), CloudError> {
        connection.purge_queue(queue).await
    }
}

fn retry_delays(policy: RetryPolicy) -> ConstantBackoff {
    ConstantBuilder::default()
        .with_delay(policy.interval)
        .with_max_times(policy.max_attempts.saturating_sub(1) as usize)
        .build()
}

/// Queue client that survives dropped connections.
///
/// Not internally synchronised: every operation takes `&mut self`, so
/// sharing one client between tasks needs an external lock.
pub struct DurableQueue<K: QueueConnector> {
    connector: K,
    queue_name: String,
    config: QueueClientConfig,
    session: QueueSession<K::Connection>,
    reconnects: u32,
}

impl<K: QueueConnector> fmt::Debug for DurableQueue<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DurableQueue")
            .field("queue_name", &self.queue_name)
            .field("connected", &self.session.is_connected())
            .field("reconnects", &self.reconnects)
            .finish()
    }
}

impl<K: QueueConnector> DurableQueue<K> {
    /// Create the client and open the first session.
    ///
    /// A failure to open the session is logged, not returned; the first
    /// operation then fails recoverably and reconnects.
    ///
    /// # Errors
    /// * `Validation` - empty queue name or a zero attempt budget
    pub async fn connect(connector: K, queue_name: impl Into<String>, config: QueueClientConfig) -> Result<Self> {
        let queue_name = queue_name.into();
        if queue_name.is_empty() {
            return Err(ConvergeError::Validation("queue name is required".to_string()));
        }
        for op in [QueueOp::Send, QueueOp::Receive, QueueOp::Delete, QueueOp::Purge] {
            if config.policy(op).max_attempts == 0 {
                return Err(ConvergeError::Validation(format!(
                    "{op} max_attempts must be at least 1"
                )));
            }
        }

        let mut client = Self {
            connector,
            queue_name,
            config,
            session: QueueSession::disconnected(),
            reconnects: 0,
        };
        client.rebuild_session().await;
        Ok(client)
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn config(&self) -> &QueueClientConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    pub fn queue(&self) -> Option<&QueueHandle> {
        self.session.queue()
    }

    /// Number of reconnects performed after the initial connect.
    pub fn reconnect_count(&self) -> u32 {
        self.reconnects
    }

    /// Tear the session down and build a new one.
    ///
    /// Safe to call in any state. Returns whether the new session is
    /// connected; a failure is logged and leaves the session disconnected.
    pub async fn reconnect(&mut self) -> bool {
        self.reconnects += 1;
        self.rebuild_session().await
    }

    async fn rebuild_session(&mut self) -> bool {
        self.session = QueueSession::disconnected();

        match self.open_session().await {
            Ok(session) => {
                self.session = session;
                info!(queue = %self.queue_name, "Queue session connected");
                true
            }
            Err(e) => {
                warn!(queue = %self.queue_name, error = %e, "Queue session connect failed");
                false
            }
        }
    }

    async fn open_session(&self) -> std::result::Result<QueueSession<K::Connection>, CloudError> {
        let connection = self.connector.connect().await?;

        let queue = connection.resolve_queue(&self.queue_name).await?.ok_or_else(|| {
            CloudError::new(
                "AWS.SimpleQueueService.NonExistentQueue",
                format!("queue {} does not exist", self.queue_name),
            )
        })?;

        // Long polling is an optimisation; the session is usable without it
        if let Err(e) = connection
            .set_receive_wait_time(&queue, self.config.receive_wait_time_secs)
            .await
        {
            warn!(queue = %self.queue_name, error = %e, "Failed to set receive wait time");
        }

        Ok(QueueSession::connected(connection, queue))
    }

    /// Send one message and return its provider-assigned id.
    pub async fn send_message(&mut self, body: &str, options: &SendOptions) -> Result<String> {
        let encoded = encode(self.config.encoding, body);
        self.execute(SendRequest {
            body: &encoded,
            options,
        })
        .await
    }

    pub async fn send(&mut self, body: &str) -> Result<String> {
        self.send_message(body, &SendOptions::default()).await
    }

    /// Receive up to `max_messages` (1..=10) messages.
    ///
    /// A body that does not decode does not fail the call: it is returned in
    /// [`ReceiveBatch::undecodable`] next to the messages that did decode.
    pub async fn receive_messages(&mut self, max_messages: u32, attribute_names: &[String]) -> Result<ReceiveBatch> {
        if max_messages == 0 || max_messages > MAX_RECEIVE_BATCH {
            return Err(ConvergeError::Validation(format!(
                "max_messages must be between 1 and {MAX_RECEIVE_BATCH}, got {max_messages}"
            )));
        }

        let raw = self
            .execute(ReceiveRequest {
                max_messages,
                attribute_names,
            })
            .await?;
        debug!(queue = %self.queue_name, count = raw.len(), "Received messages");

        let mut batch = ReceiveBatch::default();
        for message in raw {
            match decode(self.config.encoding, message) {
                Ok(message) => batch.messages.push(message),
                Err(bad) => {
                    warn!(
                        queue = %self.queue_name,
                        message_id = %bad.message_id,
                        reason = %bad.reason,
                        "Message body did not decode"
                    );
                    batch.undecodable.push(bad);
                }
            }
        }
        Ok(batch)
    }

    /// Receive at most one message.
    ///
    /// # Errors
    /// * `PayloadDecode` - the message body does not decode; the error
    ///   carries its receipt handle
    pub async fn receive_message(&mut self, attribute_names: &[String]) -> Result<Option<ReceivedMessage>> {
        let batch = self.receive_messages(1, attribute_names).await?;
        if let Some(bad) = batch.undecodable.into_iter().next() {
            return Err(ConvergeError::PayloadDecode {
                message_id: bad.message_id,
                receipt_handle: bad.receipt_handle,
                reason: bad.reason,
            });
        }
        Ok(batch.messages.into_iter().next())
    }

    pub async fn delete_message(&mut self, message: &ReceivedMessage) -> Result<()> {
        self.delete_receipt(&message.receipt_handle).await
    }

    /// Delete a message whose body could not be decoded.
    pub async fn discard(&mut self, message: &UndecodableMessage) -> Result<()> {
        self.delete_receipt(&message.receipt_handle).await
    }

    /// Delete by receipt handle, under the delete retry budget.
    pub async fn delete_receipt(&mut self, receipt_handle: &str) -> Result<()> {
        self.execute(DeleteRequest { receipt_handle }).await
    }

    /// Delete a batch, removing each message from `messages` once deleted.
    ///
    /// The whole batch shares the delete budget. After a failure the retry
    /// resumes at the first message not yet deleted, and on error `messages`
    /// holds exactly the ones still outstanding.
    pub async fn delete_messages(&mut self, messages: &mut Vec<ReceivedMessage>) -> Result<()> {
        let mut delays = retry_delays(self.config.delete);
        let mut attempt = 1u32;

        loop {
            match self.drain_deletes(messages).await {
                Ok(()) => return Ok(()),
                Err(e) => self.recover(QueueOp::Delete, e, &mut delays, &mut attempt).await?,
            }
        }
    }

    async fn drain_deletes(&self, messages: &mut Vec<ReceivedMessage>) -> Result<()> {
        while let Some(front) = messages.first() {
            self.perform(&DeleteRequest {
                receipt_handle: &front.receipt_handle,
            })
            .await?;
            messages.remove(0);
        }
        Ok(())
    }

    pub async fn purge(&mut self) -> Result<()> {
        self.execute(PurgeRequest).await
    }

    /// Run one logical operation under its retry budget.
    async fn execute<R: QueueRequest>(&mut self, request: R) -> Result<R::Output> {
        let op = R::OP;
        let mut delays = retry_delays(self.config.policy(op));
        let mut attempt = 1u32;

        loop {
            match self.perform(&request).await {
                Ok(output) => {
                    if attempt > 1 {
                        info!(op = %op, attempt, "Queue operation succeeded after reconnect");
                    }
                    return Ok(output);
                }
                Err(e) => self.recover(op, e, &mut delays, &mut attempt).await?,
            }
        }
    }

    /// Decide whether a failed attempt gets another try.
    ///
    /// Non-retryable errors and an exhausted budget return the error
    /// unchanged. Otherwise sleep the fixed interval and reconnect.
    async fn recover(
        &mut self,
        op: QueueOp,
        error: ConvergeError,
        delays: &mut impl Iterator<Item = Duration>,
        attempt: &mut u32,
    ) -> Result<()> {
        if !error.is_retryable() {
            return Err(error);
        }

        let Some(delay) = delays.next() else {
            warn!(op = %op, attempts = *attempt, error = %error, "Queue operation attempts exhausted");
            return Err(error);
        };

        warn!(
            op = %op,
            attempt = *attempt,
            delay_ms = delay.as_millis(),
            error = %error,
            "Queue operation failed, reconnecting"
        );
        *attempt += 1;
        tokio::time::sleep(delay).await;
        self.reconnect().await;
        Ok(())
    }

    async fn perform<R: QueueRequest>(&self, request: &R) -> Result<R::Output> {
        let operation = R::OP.operation_name();
        let Some((connection, queue)) = self.session.parts() else {
            return Err(ConvergeError::Connection {
                operation,
                source: CloudError::transport("queue session is not connected"),
            });
        };

        request
            .perform(connection, queue)
            .await
            .map_err(|e| ConvergeError::from_cloud(operation, e))
    }
}

fn encode(encoding: PayloadEncoding, body: &str) -> String {
    match encoding {
        PayloadEncoding::Base64 => STANDARD.encode(body.as_bytes()),
        PayloadEncoding::Raw => body.to_string(),
    }
}

fn decode(encoding: PayloadEncoding, raw: RawMessage) -> std::result::Result<ReceivedMessage, UndecodableMessage> {
    let body = match encoding {
        PayloadEncoding::Raw => raw.body,
        PayloadEncoding::Base64 => {
            // MIME-style encoders wrap lines; the alphabet has no whitespace
            let compact: String = raw.body.chars().filter(|c| !c.is_ascii_whitespace()).collect();
            let decoded = STANDARD
                .decode(compact.as_bytes())
                .map_err(|e| e.to_string())
                .and_then(|bytes| String::from_utf8(bytes).map_err(|e| e.to_string()));
            match decoded {
                Ok(body) => body,
                Err(reason) => {
                    return Err(UndecodableMessage {
                        message_id: raw.message_id,
                        receipt_handle: raw.receipt_handle,
                        body: raw.body,
                        reason,
                    });
                }
            }
        }
    };

    Ok(ReceivedMessage {
        message_id: raw.message_id,
        receipt_handle: raw.receipt_handle,
        body,
        attributes: raw.attributes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn raw(body: &str) -> RawMessage {
        RawMessage {
            message_id: "m-1".to_string(),
            receipt_handle: "r-1".to_string(),
            body: body.to_string(),
            attributes: BTreeMap::new(),
        }
    }

    #[test]
    fn test_wrapped_base64_bodies_decode() {
        let message = decode(PayloadEncoding::Base64, raw("aGVsbG8g\nd29ybGQ=\n")).unwrap();
        assert_eq!(message.body, "hello world");
        assert_eq!(message.receipt_handle, "r-1");
    }

    #[test]
    fn test_undecodable_body_keeps_receipt() {
        let bad = decode(PayloadEncoding::Base64, raw("not base64!")).unwrap_err();
        assert_eq!(bad.message_id, "m-1");
        assert_eq!(bad.receipt_handle, "r-1");
        assert_eq!(bad.body, "not base64!");
        assert!(!bad.reason.is_empty());
    }

    #[test]
    fn test_non_utf8_payload_is_undecodable() {
        let body = STANDARD.encode([0xff, 0xfe, 0x00]);
        assert!(decode(PayloadEncoding::Base64, raw(&body)).is_err());
    }

    #[test]
    fn test_raw_encoding_is_passthrough() {
        assert_eq!(encode(PayloadEncoding::Raw, "plain"), "plain");
        let message = decode(PayloadEncoding::Raw, raw("not base64!")).unwrap();
        assert_eq!(message.body, "not base64!");
    }

    #[test]
    fn test_encode_is_standard_base64() {
        assert_eq!(encode(PayloadEncoding::Base64, "héllo"), STANDARD.encode("héllo"));
    }

    #[test]
    fn test_retry_delays_follow_policy() {
        let policy = RetryPolicy {
            max_attempts: 3,
            interval: Duration::from_secs(10),
        };
        let delays: Vec<Duration> = retry_delays(policy).collect();
        assert_eq!(delays, vec![Duration::from_secs(10); 2]);

        let single = RetryPolicy {
            max_attempts: 1,
            interval: Duration::from_secs(10),
        };
        assert_eq!(retry_delays(single).count(), 0);
    }

    #[test]
    fn test_request_ops() {
        assert_eq!(SendRequest::OP, QueueOp::Send);
        assert_eq!(ReceiveRequest::OP, QueueOp::Receive);
        assert_eq!(DeleteRequest::OP, QueueOp::Delete);
        assert_eq!(PurgeRequest::OP, QueueOp::Purge);
    }
}
