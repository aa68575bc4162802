//! Spot request tracking.
//!
//! Every requested id starts pending. A pass batch-describes the pending
//! ids; a request that gained an instance id is fulfilled, a request whose
//! status code is one of [`SPOT_CONSTRAINT_CODES`] fails the whole call at
//! once. At the deadline the still-pending requests expire, and the call
//! optionally cancels them and terminates instances fulfilled so far.

use crate::cloud::{SpotApi, SpotRequestState};
use crate::error::{ConvergeError, Result};
use converge_common::defaults::{DEFAULT_POLL_INTERVAL_SECS, DEFAULT_POLL_MAX_MINUTES};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Status codes after which a request will not be fulfilled in practice.
///
/// A request in one of these states technically stays open until its
/// validity window closes, but it usually ends up expired, so the caller
/// is better off trying elsewhere right away.
pub const SPOT_CONSTRAINT_CODES: &[&str] = &[
    "capacity-not-available",
    "capacity-oversubscribed",
    "price-too-low",
    "not-scheduled-yet",
    "launch-group-constraint",
    "az-group-constraint",
    "placement-group-constraint",
    "constraint-not-fulfillable",
];

pub fn is_constraint_code(code: &str) -> bool {
    SPOT_CONSTRAINT_CODES.contains(&code)
}

/// Lifecycle phase of one tracked request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpotPhase {
    Pending,
    Fulfilled { instance_id: String },
    Constrained { code: String },
    Expired,
}

/// Polling parameters for spot requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpotPollConfig {
    pub interval: Duration,
    pub max_duration: Duration,
    /// Cancel pending requests and terminate fulfilled instances on timeout
    pub cancel_on_timeout: bool,
}

impl Default for SpotPollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            max_duration: Duration::from_secs(DEFAULT_POLL_MAX_MINUTES * 60),
            cancel_on_timeout: true,
        }
    }
}

/// Per-request phases for one polling call.
#[derive(Debug, Clone)]
pub struct SpotTracker {
    phases: BTreeMap<String, SpotPhase>,
    /// Instance ids in the order their requests were fulfilled
    fulfilled: Vec<String>,
}

impl SpotTracker {
    pub fn new(request_ids: &[String]) -> Self {
        Self {
            phases: request_ids
                .iter()
                .map(|id| (id.clone(), SpotPhase::Pending))
                .collect(),
            fulfilled: Vec::new(),
        }
    }

    pub fn phase(&self, request_id: &str) -> Option<&SpotPhase> {
        self.phases.get(request_id)
    }

    pub fn pending(&self) -> Vec<String> {
        self.phases
            .iter()
            .filter(|(_, phase)| **phase == SpotPhase::Pending)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn fulfilled_instances(&self) -> &[String] {
        &self.fulfilled
    }

    pub fn is_done(&self) -> bool {
        self.phases.values().all(|p| *p != SpotPhase::Pending)
    }

    /// Apply one describe result.
    ///
    /// A constraint code moves the request to `Constrained` and returns the
    /// error the caller must raise. Only pending requests transition.
    pub fn observe(&mut self, state: &SpotRequestState) -> Result<()> {
        let Some(phase) = self.phases.get_mut(&state.id) else {
            return Ok(());
        };
        if *phase != SpotPhase::Pending {
            return Ok(());
        }

        if is_constraint_code(&state.status_code) {
            *phase = SpotPhase::Constrained {
                code: state.status_code.clone(),
            };
            return Err(ConvergeError::Constraint {
                request_id: state.id.clone(),
                code: state.status_code.clone(),
            });
        }

        if let Some(instance_id) = &state.instance_id {
            *phase = SpotPhase::Fulfilled {
                instance_id: instance_id.clone(),
            };
            self.fulfilled.push(instance_id.clone());
        }
        Ok(())
    }

    /// Mark every pending request expired and return their ids.
    pub fn expire(&mut self) -> Vec<String> {
        let mut expired = Vec::new();
        for (id, phase) in self.phases.iter_mut() {
            if *phase == SpotPhase::Pending {
                *phase = SpotPhase::Expired;
                expired.push(id.clone());
            }
        }
        expired
    }
}

/// Poll spot requests until every one has an instance id.
///
/// Returns the instance ids in fulfilment order. Describe failures that are
/// recoverable, or that report the requests as not yet visible, are logged
/// and retried on the next pass within the same deadline.
pub async fn poll_spot_requests<A>(api: &A, request_ids: &[String], config: &SpotPollConfig) -> Result<Vec<String>>
where
    A: SpotApi + ?Sized,
{
    let mut tracker = SpotTracker::new(request_ids);
    let start = Instant::now();
    let deadline = start + config.max_duration;

    info!(count = request_ids.len(), "Start polling spot requests");

    while !tracker.is_done() {
        let pending = tracker.pending();

        match api.describe_spot_requests(&pending).await {
            Ok(states) => {
                for state in &states {
                    debug!(
                        request_id = %state.id,
                        instance_id = state.instance_id.as_deref().unwrap_or("None"),
                        status = %state.status_code,
                        "Spot request observed"
                    );
                    tracker.observe(state)?;
                }
            }
            Err(e) if e.is_recoverable() || e.is_not_found() => {
                warn!(error = %e, "Spot request describe failed, retrying");
            }
            Err(e) => return Err(ConvergeError::from_cloud("DescribeSpotInstanceRequests", e)),
        }

        if tracker.is_done() {
            break;
        }

        if Instant::now() >= deadline {
            return Err(expire(api, &mut tracker, config).await);
        }

        debug!(remaining = tracker.pending().len(), "Spot poll pass processed");
        tokio::time::sleep(config.interval).await;
    }

    info!(count = tracker.fulfilled_instances().len(), "Spot requests fulfilled");
    Ok(tracker.fulfilled_instances().to_vec())
}

/// Expire the remaining requests and run the optional cleanup.
async fn expire<A>(api: &A, tracker: &mut SpotTracker, config: &SpotPollConfig) -> ConvergeError
where
    A: SpotApi + ?Sized,
{
    let pending = tracker.expire();
    let mut cleaned_up = false;

    if config.cancel_on_timeout {
        cleaned_up = true;
        if let Err(e) = api.cancel_spot_requests(&pending).await {
            warn!(error = %e, requests = ?pending, "Failed to cancel expired spot requests");
            cleaned_up = false;
        }
        let instances = tracker.fulfilled_instances();
        if !instances.is_empty() {
            if let Err(e) = api.terminate_instances(instances).await {
                warn!(error = %e, instances = ?instances, "Failed to terminate fulfilled spot instances");
                cleaned_up = false;
            }
        }
    }

    ConvergeError::SpotTimeout { pending, cleaned_up }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::MockSpotApi;
    use crate::error::CloudError;
    use mockall::Sequence;

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn spot(id: &str, instance_id: Option<&str>, status_code: &str) -> SpotRequestState {
        SpotRequestState {
            id: id.to_string(),
            instance_id: instance_id.map(str::to_string),
            status_code: status_code.to_string(),
        }
    }

    fn config(interval: u64, max: u64) -> SpotPollConfig {
        SpotPollConfig {
            interval: Duration::from_secs(interval),
            max_duration: Duration::from_secs(max),
            cancel_on_timeout: true,
        }
    }

    /// Describe answers one scripted pass per call, in order.
    fn scripted(passes: Vec<std::result::Result<Vec<SpotRequestState>, CloudError>>) -> MockSpotApi {
        let mut api = MockSpotApi::new();
        let mut seq = Sequence::new();
        for pass in passes {
            api.expect_describe_spot_requests()
                .times(1)
                .in_sequence(&mut seq)
                .returning(move |_| pass.clone());
        }
        api
    }

    #[test]
    fn test_tracker_transitions() {
        let mut tracker = SpotTracker::new(&ids(&["sir-1", "sir-2"]));
        tracker.observe(&spot("sir-1", Some("i-1"), "fulfilled")).unwrap();
        tracker.observe(&spot("sir-2", None, "pending-evaluation")).unwrap();

        assert_eq!(
            tracker.phase("sir-1"),
            Some(&SpotPhase::Fulfilled {
                instance_id: "i-1".to_string()
            })
        );
        assert_eq!(tracker.pending(), ids(&["sir-2"]));
        assert_eq!(tracker.expire(), ids(&["sir-2"]));
        assert_eq!(tracker.phase("sir-2"), Some(&SpotPhase::Expired));
        assert!(tracker.is_done());
    }

    #[test]
    fn test_tracker_ignores_unknown_and_resolved_ids() {
        let mut tracker = SpotTracker::new(&ids(&["sir-1"]));
        tracker.observe(&spot("sir-9", None, "price-too-low")).unwrap();
        tracker.observe(&spot("sir-1", Some("i-1"), "fulfilled")).unwrap();
        tracker.observe(&spot("sir-1", Some("i-1"), "fulfilled")).unwrap();
        assert_eq!(tracker.fulfilled_instances(), ["i-1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_fulfilled_returns_instances() {
        let mut api = MockSpotApi::new();
        let mut seq = Sequence::new();
        api.expect_describe_spot_requests()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| {
                Ok(vec![
                    spot("sir-1", Some("i-1"), "fulfilled"),
                    spot("sir-2", None, "pending-fulfillment"),
                ])
            });
        api.expect_describe_spot_requests()
            .withf(|ids| ids.len() == 1 && ids[0] == "sir-2")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(vec![spot("sir-2", Some("i-2"), "fulfilled")]));

        let instances = poll_spot_requests(&api, &ids(&["sir-1", "sir-2"]), &config(5, 60))
            .await
            .unwrap();

        assert_eq!(instances, ids(&["i-1", "i-2"]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_constraint_fails_fast_despite_fulfilled_peers() {
        let mut api = scripted(vec![Ok(vec![
            spot("sir-1", Some("i-1"), "fulfilled"),
            spot("sir-2", None, "capacity-not-available"),
        ])]);
        api.expect_cancel_spot_requests().never();
        let start = Instant::now();

        let err = poll_spot_requests(&api, &ids(&["sir-1", "sir-2"]), &config(5, 60))
            .await
            .unwrap_err();

        match err {
            ConvergeError::Constraint { request_id, code } => {
                assert_eq!(request_id, "sir-2");
                assert_eq!(code, "capacity-not-available");
            }
            other => panic!("expected constraint error, got {other:?}"),
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_describe_errors_are_swallowed() {
        let api = scripted(vec![
            Err(CloudError::new("InvalidSpotInstanceRequestID.NotFound", "not yet visible")),
            Err(CloudError::transport("connection reset")),
            Ok(vec![spot("sir-1", Some("i-1"), "fulfilled")]),
        ]);

        let instances = poll_spot_requests(&api, &ids(&["sir-1"]), &config(2, 60))
            .await
            .unwrap();

        assert_eq!(instances, ids(&["i-1"]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_describe_error_propagates() {
        let api = scripted(vec![Err(CloudError::new("UnauthorizedOperation", "denied"))]);

        let err = poll_spot_requests(&api, &ids(&["sir-1"]), &config(2, 60))
            .await
            .unwrap_err();

        assert!(matches!(err, ConvergeError::Api { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_cancels_and_terminates() {
        let mut api = MockSpotApi::new();
        api.expect_describe_spot_requests().returning(|ids| {
            Ok(ids
                .iter()
                .map(|id| match id.as_str() {
                    "sir-1" => spot(id, Some("i-1"), "fulfilled"),
                    _ => spot(id, None, "pending-evaluation"),
                })
                .collect())
        });
        api.expect_cancel_spot_requests()
            .withf(|ids| ids.len() == 1 && ids[0] == "sir-2")
            .times(1)
            .returning(|_| Ok(()));
        api.expect_terminate_instances()
            .withf(|ids| ids.len() == 1 && ids[0] == "i-1")
            .times(1)
            .returning(|_| Ok(()));

        let err = poll_spot_requests(&api, &ids(&["sir-1", "sir-2"]), &config(5, 20))
            .await
            .unwrap_err();

        match err {
            ConvergeError::SpotTimeout { pending, cleaned_up } => {
                assert_eq!(pending, ids(&["sir-2"]));
                assert!(cleaned_up);
            }
            other => panic!("expected spot timeout, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_cleanup_is_reported() {
        let mut api = MockSpotApi::new();
        api.expect_describe_spot_requests()
            .returning(|ids| Ok(ids.iter().map(|id| spot(id, None, "pending-evaluation")).collect()));
        api.expect_cancel_spot_requests()
            .times(1)
            .returning(|_| Err(CloudError::new("UnauthorizedOperation", "denied")));
        api.expect_terminate_instances().never();

        let err = poll_spot_requests(&api, &ids(&["sir-1"]), &config(5, 10)).await.unwrap_err();

        assert!(matches!(err, ConvergeError::SpotTimeout { cleaned_up: false, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_without_cleanup() {
        let mut api = MockSpotApi::new();
        api.expect_describe_spot_requests()
            .returning(|ids| Ok(ids.iter().map(|id| spot(id, None, "pending-evaluation")).collect()));
        api.expect_cancel_spot_requests().never();
        api.expect_terminate_instances().never();
        let config = SpotPollConfig {
            cancel_on_timeout: false,
            ..config(5, 10)
        };

        let err = poll_spot_requests(&api, &ids(&["sir-1"]), &config).await.unwrap_err();

        assert!(matches!(err, ConvergeError::SpotTimeout { cleaned_up: false, .. }));
    }
}
