//! In-memory queue service.

use crate::lock;
use converge_core::error::CloudError;
use converge_core::queue::{QueueConnection, QueueConnector, QueueHandle, QueueOp, RawMessage, SendOptions};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
struct QueueState {
    queues: BTreeMap<String, VecDeque<RawMessage>>,
    /// Per-operation script: `None` lets a call through, `Some` fails it
    script: HashMap<QueueOp, VecDeque<Option<CloudError>>>,
    op_calls: HashMap<QueueOp, u32>,
    connect_failures: u32,
    connects: u32,
    wait_time_sets: Vec<u32>,
    sent: Vec<(String, String)>,
    deleted: Vec<String>,
    next_id: u64,
}

impl QueueState {
    fn check(&mut self, op: QueueOp) -> Result<(), CloudError> {
        *self.op_calls.entry(op).or_default() += 1;
        match self.script.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(Some(error)) => Err(error),
            _ => Ok(()),
        }
    }

    fn enqueue(&mut self, queue: &str, body: String, attributes: BTreeMap<String, String>) -> String {
        self.next_id += 1;
        let message_id = format!("m-{}", self.next_id);
        let message = RawMessage {
            message_id: message_id.clone(),
            receipt_handle: format!("r-{}", self.next_id),
            body,
            attributes,
        };
        self.queues.entry(queue.to_string()).or_default().push_back(message);
        message_id
    }
}

/// In-memory queue service with scriptable failures.
///
/// Clones share state, so a test can keep one clone for assertions while
/// the client owns another.
#[derive(Debug, Clone, Default)]
pub struct FakeQueueConnector {
    state: Arc<Mutex<QueueState>>,
}

impl FakeQueueConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_queue(self, name: &str) -> Self {
        lock(&self.state).queues.entry(name.to_string()).or_default();
        self
    }

    /// Fail the next `count` calls of `op` with `error`.
    pub fn fail_next(&self, op: QueueOp, count: u32, error: CloudError) {
        let mut state = lock(&self.state);
        let script = state.script.entry(op).or_default();
        script.extend((0..count).map(|_| Some(error.clone())));
    }

    /// Let `successes` calls of `op` through, then fail the one after.
    pub fn fail_after(&self, op: QueueOp, successes: u32, error: CloudError) {
        let mut state = lock(&self.state);
        let script = state.script.entry(op).or_default();
        script.extend((0..successes).map(|_| None));
        script.push_back(Some(error));
    }

    pub fn fail_connects(&self, count: u32) {
        lock(&self.state).connect_failures += count;
    }

    /// Enqueue a body exactly as given, bypassing any encoding.
    pub fn push_raw(&self, queue: &str, body: &str) {
        lock(&self.state).enqueue(queue, body.to_string(), BTreeMap::new());
    }

    pub fn connects(&self) -> u32 {
        lock(&self.state).connects
    }

    pub fn op_calls(&self, op: QueueOp) -> u32 {
        lock(&self.state).op_calls.get(&op).copied().unwrap_or(0)
    }

    pub fn wait_time_sets(&self) -> Vec<u32> {
        lock(&self.state).wait_time_sets.clone()
    }

    /// Bodies as they went over the wire
    pub fn sent_bodies(&self, queue: &str) -> Vec<String> {
        lock(&self.state)
            .sent
            .iter()
            .filter(|(q, _)| q == queue)
            .map(|(_, body)| body.clone())
            .collect()
    }

    /// Receipt handles of successfully deleted messages, in order
    pub fn deleted(&self) -> Vec<String> {
        lock(&self.state).deleted.clone()
    }

    pub fn queue_depth(&self, queue: &str) -> usize {
        lock(&self.state).queues.get(queue).map_or(0, VecDeque::len)
    }
}

impl QueueConnector for FakeQueueConnector {
    type Connection = FakeQueueConnection;

    async fn connect(&self) -> Result<FakeQueueConnection, CloudError> {
        let mut state = lock(&self.state);
        state.connects += 1;
        if state.connect_failures > 0 {
            state.connect_failures -= 1;
            return Err(CloudError::transport("connection refused"));
        }
        Ok(FakeQueueConnection {
            state: Arc::clone(&self.state),
        })
    }
}

#[derive(Debug)]
pub struct FakeQueueConnection {
    state: Arc<Mutex<QueueState>>,
}

impl QueueConnection for FakeQueueConnection {
    async fn resolve_queue(&self, name: &str) -> Result<Option<QueueHandle>, CloudError> {
        let state = lock(&self.state);
        Ok(state.queues.contains_key(name).then(|| QueueHandle {
            name: name.to_string(),
            url: format!("https://queue.test/{name}"),
        }))
    }

    async fn set_receive_wait_time(&self, _queue: &QueueHandle, seconds: u32) -> Result<(), CloudError> {
        lock(&self.state).wait_time_sets.push(seconds);
        Ok(())
    }

    async fn send_message(&self, queue: &QueueHandle, body: &str, options: &SendOptions) -> Result<String, CloudError> {
        let mut state = lock(&self.state);
        state.check(QueueOp::Send)?;
        state.sent.push((queue.name.clone(), body.to_string()));
        Ok(state.enqueue(&queue.name, body.to_string(), options.attributes.clone()))
    }

    async fn receive_messages(
        &self,
        queue: &QueueHandle,
        max_messages: u32,
        _attribute_names: &[String],
    ) -> Result<Vec<RawMessage>, CloudError> {
        let mut state = lock(&self.state);
        state.check(QueueOp::Receive)?;
        let Some(messages) = state.queues.get_mut(&queue.name) else {
            return Err(CloudError::new("AWS.SimpleQueueService.NonExistentQueue", "gone"));
        };
        let take = messages.len().min(max_messages as usize);
        Ok(messages.drain(..take).collect())
    }

    async fn delete_message(&self, _queue: &QueueHandle, receipt_handle: &str) -> Result<(), CloudError> {
        let mut state = lock(&self.state);
        state.check(QueueOp::Delete)?;
        state.deleted.push(receipt_handle.to_string());
        Ok(())
    }

    async fn purge_queue(&self, queue: &QueueHandle) -> Result<(), CloudError> {
        let mut state = lock(&self.state);
        state.check(QueueOp::Purge)?;
        if let Some(messages) = state.queues.get_mut(&queue.name) {
            messages.clear();
        }
        Ok(())
    }
}
