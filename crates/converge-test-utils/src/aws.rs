//! AWS test utilities
//!
//! Region detection and unique run ID generation for tests that run against
//! a real account.

use chrono::Utc;

/// Get the AWS region for tests.
///
/// Checks, in order, `CONVERGE_TEST_REGION`, `AWS_REGION` and
/// `AWS_DEFAULT_REGION`, falling back to us-east-2.
pub fn get_test_region() -> String {
    std::env::var("CONVERGE_TEST_REGION")
        .or_else(|_| std::env::var("AWS_REGION"))
        .or_else(|_| std::env::var("AWS_DEFAULT_REGION"))
        .unwrap_or_else(|_| "us-east-2".to_string())
}

/// Unique run ID for naming test resources.
///
/// Format: `test-{timestamp_ms}-{counter}`, unique even when tests start in
/// the same millisecond.
///
/// ```
/// use converge_test_utils::aws::test_run_id;
///
/// assert!(test_run_id().starts_with("test-"));
/// ```
pub fn test_run_id() -> String {
    use std::sync::atomic::{AtomicU32, Ordering};
    static COUNTER: AtomicU32 = AtomicU32::new(0);

    let ts = Utc::now().timestamp_millis();
    let counter = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("test-{ts}-{counter}")
}
