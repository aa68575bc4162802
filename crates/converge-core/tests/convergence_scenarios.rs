//! End-to-end scenarios against the in-memory fakes
//!
//! Every scenario here runs entirely in memory; waits use paused tokio time.
//!
//! Run with:
//! ```
//! cargo test -p converge-core --test convergence_scenarios
//! ```

use converge_core::error::{CloudError, ConvergeError, TransportError};
use converge_core::queue::{DurableQueue, QueueClientConfig, QueueOp, RetryPolicy};
use converge_core::remote::{HostPlan, RemoteHost, RemoteOrchestrator, RemoteTask};
use converge_core::transfer::{SyncRequest, sync_to_local};
use converge_test_utils::{FakeObjectSource, FakeQueueConnector, FakeTransport};
use std::sync::Arc;
use std::time::Duration;

fn plan(address: &str, tasks: Vec<RemoteTask>) -> HostPlan {
    HostPlan {
        host: RemoteHost::new(address, "ec2-user"),
        tasks,
    }
}

#[tokio::test(start_paused = true)]
async fn queue_send_recovers_with_same_result_as_clean_run() {
    let config = QueueClientConfig {
        send: RetryPolicy {
            max_attempts: 4,
            interval: Duration::from_secs(3),
        },
        ..Default::default()
    };

    let clean = FakeQueueConnector::new().with_queue("work");
    let mut clean_client = DurableQueue::connect(clean.clone(), "work", config.clone()).await.unwrap();
    let clean_id = clean_client.send("job-42").await.unwrap();

    let flaky = FakeQueueConnector::new().with_queue("work");
    flaky.fail_after(QueueOp::Send, 0, CloudError::transport("connection reset by peer"));
    let mut flaky_client = DurableQueue::connect(flaky.clone(), "work", config).await.unwrap();
    let flaky_id = flaky_client.send("job-42").await.unwrap();

    assert_eq!(flaky_client.reconnect_count(), 1);
    assert_eq!(flaky_id, clean_id);
    assert_eq!(flaky.sent_bodies("work"), clean.sent_bodies("work"));
    assert_eq!(flaky.queue_depth("work"), 1);
}

#[tokio::test]
async fn failing_host_stops_alone() {
    let transport = Arc::new(FakeTransport::new().with_output("host-a", "./step1.sh", 5, "", "step1 failed"));
    let tasks = vec![
        RemoteTask::command("./step1.sh"),
        RemoteTask::command("./step2.sh"),
        RemoteTask::command("./step3.sh"),
    ];
    let plans = vec![plan("host-a", tasks.clone()), plan("host-b", tasks)];

    let report = RemoteOrchestrator::new(transport.clone()).run(plans).await.unwrap();

    let a = &report.hosts[0];
    assert_eq!(a.address, "host-a");
    assert!(a.max_return_code_exceeded);
    assert_eq!(a.results.len(), 1);
    assert_eq!(a.results[0].return_code, 5);
    assert_eq!(a.results[0].stderr, "step1 failed");
    assert_eq!(transport.log("host-a"), vec!["exec ./step1.sh".to_string(), "close".to_string()]);

    let b = &report.hosts[1];
    assert!(b.succeeded());
    assert_eq!(b.results.len(), 3);
    assert_eq!(transport.log("host-b").len(), 4);
    assert_eq!(report.failed_hosts(), vec!["host-a"]);
}

#[tokio::test]
async fn remote_sessions_are_bounded() {
    let transport = Arc::new(FakeTransport::new().with_exec_delay(Duration::from_millis(20)));
    let plans = (0..8)
        .map(|i| plan(&format!("h{i}"), vec![RemoteTask::command("sleep")]))
        .collect();

    let report = RemoteOrchestrator::new(transport.clone())
        .with_max_concurrent_hosts(3)
        .run(plans)
        .await
        .unwrap();

    assert_eq!(report.hosts.len(), 8);
    assert!(report.all_succeeded());
    assert!(transport.max_open_sessions() <= 3);
    assert!(transport.max_open_sessions() > 1);
}

#[tokio::test(start_paused = true)]
async fn slow_host_times_out_without_holding_up_others() {
    let transport = Arc::new(FakeTransport::new().with_connect_delay("slow", Duration::from_secs(120)));
    let plans = vec![
        plan("slow", vec![RemoteTask::command("true")]),
        plan("fast", vec![RemoteTask::command("true")]),
    ];

    let report = RemoteOrchestrator::new(transport.clone())
        .with_connect_timeout(Duration::from_secs(60))
        .run(plans)
        .await
        .unwrap();

    assert!(matches!(report.hosts[0].error, Some(TransportError::ConnectTimeout { .. })));
    assert!(report.hosts[1].succeeded());
    assert!(transport.log("slow").is_empty());
}

#[tokio::test]
async fn unreachable_host_is_reported() {
    let transport = Arc::new(FakeTransport::new().with_unreachable("bad"));
    let plans = vec![plan("bad", vec![RemoteTask::command("true")])];

    let report = RemoteOrchestrator::new(transport).run(plans).await.unwrap();

    assert!(matches!(report.hosts[0].error, Some(TransportError::Connect { .. })));
    assert_eq!(report.failed_hosts(), vec!["bad"]);
}

#[tokio::test]
async fn downloads_are_bounded_and_mirrored() {
    let dir = tempfile::tempdir().unwrap();
    let mut source = FakeObjectSource::new().with_download_delay(Duration::from_millis(10));
    for i in 0..12 {
        source = source.with_object(&format!("run-1/f{i}.bin"), "x");
    }
    source = source.with_object("run-2/other.bin", "y");
    let request = SyncRequest {
        bucket: "artifacts".to_string(),
        prefix: "run-1".to_string(),
        local_path: dir.path().to_path_buf(),
        clean_first: true,
    };

    let report = sync_to_local(&source, &request, 3).await.unwrap();

    assert_eq!(report.files.len(), 12);
    assert!(source.max_in_flight() <= 3);
    assert!(source.max_in_flight() > 1);
    assert_eq!(source.listed_prefixes(), vec!["run-1/".to_string()]);
    assert!(!dir.path().join("run-2").exists());
}

#[tokio::test]
async fn missing_object_is_a_bulk_failure() {
    let dir = tempfile::tempdir().unwrap();
    let source = FakeObjectSource::new()
        .with_object("run-1/a.txt", "alpha")
        .with_failing_object("run-1/b.txt");
    let request = SyncRequest {
        bucket: "artifacts".to_string(),
        prefix: "run-1".to_string(),
        local_path: dir.path().to_path_buf(),
        clean_first: false,
    };

    let err = sync_to_local(&source, &request, 2).await.unwrap_err();

    assert!(matches!(err, ConvergeError::BulkTransfer { total: 2, ref failures } if failures.len() == 1));
    assert_eq!(std::fs::read_to_string(dir.path().join("run-1/a.txt")).unwrap(), "alpha");
}
