//! Durable queue client against the in-memory queue service
//!
//! Retry delays run on paused tokio time.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use converge_core::error::{CloudError, ConvergeError};
use converge_core::queue::{DurableQueue, PayloadEncoding, QueueClientConfig, QueueOp, RetryPolicy, SendOptions};
use converge_test_utils::FakeQueueConnector;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;

fn policy(max_attempts: u32, interval_secs: u64) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        interval: Duration::from_secs(interval_secs),
    }
}

async fn client(connector: &FakeQueueConnector) -> DurableQueue<FakeQueueConnector> {
    DurableQueue::connect(connector.clone(), "work", QueueClientConfig::default())
        .await
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn bodies_are_base64_on_the_wire() {
    let connector = FakeQueueConnector::new().with_queue("work");
    let mut queue = client(&connector).await;

    queue.send("héllo").await.unwrap();
    let batch = queue.receive_messages(10, &[]).await.unwrap();

    assert_eq!(connector.sent_bodies("work"), vec![STANDARD.encode("héllo")]);
    assert_eq!(batch.messages.len(), 1);
    assert_eq!(batch.messages[0].body, "héllo");
    assert!(batch.undecodable.is_empty());
}

#[tokio::test(start_paused = true)]
async fn raw_encoding_sends_bodies_unchanged() {
    let connector = FakeQueueConnector::new().with_queue("work");
    let config = QueueClientConfig {
        encoding: PayloadEncoding::Raw,
        ..Default::default()
    };
    let mut queue = DurableQueue::connect(connector.clone(), "work", config).await.unwrap();

    let options = SendOptions {
        delay_seconds: None,
        attributes: BTreeMap::from([("run".to_string(), "nightly".to_string())]),
    };
    queue.send_message("plain text", &options).await.unwrap();
    let message = queue.receive_message(&[]).await.unwrap().unwrap();

    assert_eq!(connector.sent_bodies("work"), vec!["plain text".to_string()]);
    assert_eq!(message.body, "plain text");
    assert_eq!(message.attributes.get("run").map(String::as_str), Some("nightly"));
}

#[tokio::test(start_paused = true)]
async fn bad_body_does_not_cost_the_good_ones() {
    let connector = FakeQueueConnector::new().with_queue("work");
    let mut queue = client(&connector).await;
    queue.send("good").await.unwrap();
    connector.push_raw("work", "not base64!");

    let batch = queue.receive_messages(10, &[]).await.unwrap();

    assert_eq!(batch.len(), 2);
    assert_eq!(batch.messages.len(), 1);
    assert_eq!(batch.messages[0].body, "good");
    assert_eq!(batch.undecodable.len(), 1);
    let bad = &batch.undecodable[0];
    assert_eq!(bad.body, "not base64!");
    assert!(!bad.receipt_handle.is_empty());

    let mut good = batch.messages.clone();
    queue.delete_messages(&mut good).await.unwrap();
    queue.discard(bad).await.unwrap();

    assert_eq!(connector.deleted().len(), 2);
    assert!(connector.deleted().contains(&bad.receipt_handle));
    assert_eq!(connector.queue_depth("work"), 0);
}

#[tokio::test(start_paused = true)]
async fn single_receive_of_bad_body_carries_receipt() {
    let connector = FakeQueueConnector::new().with_queue("work");
    let mut queue = client(&connector).await;
    connector.push_raw("work", "%%%");

    let err = queue.receive_message(&[]).await.unwrap_err();

    let receipt_handle = match err {
        ConvergeError::PayloadDecode { receipt_handle, .. } => receipt_handle,
        other => panic!("expected payload decode error, got {other:?}"),
    };
    queue.delete_receipt(&receipt_handle).await.unwrap();
    assert_eq!(connector.deleted(), vec![receipt_handle]);
}

#[tokio::test(start_paused = true)]
async fn empty_queue_yields_none() {
    let connector = FakeQueueConnector::new().with_queue("work");
    let mut queue = client(&connector).await;

    assert!(queue.receive_message(&[]).await.unwrap().is_none());
    assert!(queue.receive_messages(5, &[]).await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn receive_batch_size_is_validated() {
    let connector = FakeQueueConnector::new().with_queue("work");
    let mut queue = client(&connector).await;

    for max in [0, 11] {
        let err = queue.receive_messages(max, &[]).await.unwrap_err();
        assert!(matches!(err, ConvergeError::Validation(_)));
    }
    assert_eq!(connector.op_calls(QueueOp::Receive), 0);
}

#[tokio::test(start_paused = true)]
async fn transient_failure_reconnects_and_retries() {
    let connector = FakeQueueConnector::new().with_queue("work");
    connector.fail_next(QueueOp::Receive, 2, CloudError::transport("connection reset by peer"));
    let config = QueueClientConfig {
        receive: policy(3, 10),
        ..Default::default()
    };
    let mut queue = DurableQueue::connect(connector.clone(), "work", config).await.unwrap();
    let start = Instant::now();

    let batch = queue.receive_messages(1, &[]).await.unwrap();

    assert!(batch.is_empty());
    assert_eq!(start.elapsed(), Duration::from_secs(20));
    assert_eq!(queue.reconnect_count(), 2);
    assert_eq!(connector.connects(), 3);
    // Long polling is reapplied on every session
    assert_eq!(connector.wait_time_sets().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn non_recoverable_failure_is_not_retried() {
    let connector = FakeQueueConnector::new().with_queue("work");
    connector.fail_next(QueueOp::Purge, 1, CloudError::new("AccessDenied", "no purge for you"));
    let mut queue = client(&connector).await;

    let err = queue.purge().await.unwrap_err();

    assert!(matches!(err, ConvergeError::Api { operation: "PurgeQueue", .. }));
    assert_eq!(connector.op_calls(QueueOp::Purge), 1);
    assert_eq!(queue.reconnect_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn send_exhaustion_surfaces_last_error() {
    let connector = FakeQueueConnector::new().with_queue("work");
    connector.fail_next(QueueOp::Send, 10, CloudError::new("ServiceUnavailable", "try later"));
    let config = QueueClientConfig {
        send: policy(3, 1),
        ..Default::default()
    };
    let mut queue = DurableQueue::connect(connector.clone(), "work", config).await.unwrap();

    let err = queue.send("x").await.unwrap_err();

    assert!(matches!(err, ConvergeError::Connection { .. }));
    assert_eq!(err.cloud_error().and_then(CloudError::code), Some("ServiceUnavailable"));
    assert_eq!(connector.op_calls(QueueOp::Send), 3);
}

#[tokio::test(start_paused = true)]
async fn batch_delete_resumes_after_failure() {
    let connector = FakeQueueConnector::new().with_queue("work");
    let mut queue = client(&connector).await;
    for body in ["a", "b", "c"] {
        queue.send(body).await.unwrap();
    }
    let mut messages = queue.receive_messages(10, &[]).await.unwrap().messages;
    let receipts: Vec<String> = messages.iter().map(|m| m.receipt_handle.clone()).collect();
    connector.fail_after(QueueOp::Delete, 1, CloudError::transport("broken pipe"));

    queue.delete_messages(&mut messages).await.unwrap();

    assert!(messages.is_empty());
    assert_eq!(connector.deleted(), receipts);
    assert_eq!(queue.reconnect_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_first_connect_heals_on_first_operation() {
    let connector = FakeQueueConnector::new().with_queue("work");
    connector.fail_connects(1);

    let mut queue = client(&connector).await;
    assert!(!queue.is_connected());

    queue.send("after outage").await.unwrap();
    assert!(queue.is_connected());
    assert_eq!(connector.queue_depth("work"), 1);
}

#[tokio::test(start_paused = true)]
async fn empty_queue_name_is_invalid() {
    let err = DurableQueue::connect(FakeQueueConnector::new(), "", QueueClientConfig::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ConvergeError::Validation(_)));
}
