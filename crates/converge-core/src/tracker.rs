//! Batch convergence over a set of resource ids.
//!
//! One batched describe call per pass observes every still-pending id.
//! Ids leave the pending set when their status matches the target; a
//! separate fast-fail predicate aborts the whole wait as soon as any
//! observed status shows the target can no longer be reached.
//!
//! Instance and table waits are built on [`track_batch`].

use crate::cloud::{
    HealthStatus, InstanceState, InstanceStatus, InstanceStatusApi, Observed, TableStatus, TableStatusApi,
};
use crate::error::{ConvergeError, Result};
use crate::wait::PollConfig;
use converge_common::ResourceKind;
use converge_common::defaults::{DEFAULT_TABLE_POLL_INTERVAL_SECS, DEFAULT_TABLE_POLL_MAX_SECS};
use std::collections::BTreeSet;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Delete refused because the table is still being created, updated or deleted
const TABLE_IN_USE_CODE: &str = "ResourceInUseException";

/// Target predicate plus fast-fail predicate for a batch wait.
pub trait Convergence<S> {
    /// Human-readable target, used in errors and logs.
    fn target(&self) -> String;

    fn matches(&self, status: &S) -> bool;

    /// Description of a terminal observation, if `status` is one.
    fn fast_fail(&self, status: &S) -> Option<String>;
}

/// Wait until every id in `ids` matches `policy`.
///
/// `describe` is called once per pass with the ids still pending.
///
/// # Returns
/// * `Ok(true)` - every id matched
/// * `Ok(false)` - immediate mode only: at least one id did not match on the single pass
/// * `Err(TerminalState)` - the fast-fail predicate fired for some id
/// * `Err(Timeout)` - deadline passed; carries every still-pending id
pub async fn track_batch<S, P, F, Fut>(
    ids: &[String],
    policy: &P,
    config: &PollConfig,
    mut describe: F,
) -> Result<bool>
where
    P: Convergence<S>,
    F: FnMut(Vec<String>) -> Fut,
    Fut: Future<Output = Result<Vec<Observed<S>>>>,
{
    let mut pending: BTreeSet<String> = ids.iter().cloned().collect();
    if pending.is_empty() {
        return Ok(true);
    }

    let start = Instant::now();
    let deadline = config.deadline(start);
    let mut passes = 0u32;

    debug!(count = pending.len(), target = %policy.target(), "Start polling batch");

    loop {
        passes += 1;
        let observed = describe(pending.iter().cloned().collect()).await?;

        for item in &observed {
            if let Some(terminal) = policy.fast_fail(&item.status) {
                return Err(ConvergeError::TerminalState {
                    id: item.id.clone(),
                    observed: terminal,
                    target: policy.target(),
                });
            }
            if policy.matches(&item.status) {
                pending.remove(&item.id);
            }
        }

        if pending.is_empty() {
            info!(count = ids.len(), passes, target = %policy.target(), "Batch converged");
            return Ok(true);
        }

        if config.immediate {
            return Ok(false);
        }

        if Instant::now() >= deadline {
            return Err(ConvergeError::Timeout {
                what: format!("{} resources", ids.len()),
                target: policy.target(),
                pending: pending.into_iter().collect(),
                waited: start.elapsed(),
            });
        }

        debug!(
            pass = passes,
            remaining = pending.len(),
            delay_ms = config.interval.as_millis(),
            "Poll pass processed"
        );
        tokio::time::sleep(config.interval).await;
    }
}

/// Instance target state.
///
/// `Running` is a conjunction: the state code must be running AND the
/// system status check must report `ok`. Other targets compare only the
/// state code. Waiting for `Running` fails fast when an instance is
/// observed terminated (e.g. a spot instance reclaimed during checks).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceTarget(pub InstanceState);

impl Convergence<InstanceStatus> for InstanceTarget {
    fn target(&self) -> String {
        self.0.to_string()
    }

    fn matches(&self, status: &InstanceStatus) -> bool {
        match self.0 {
            InstanceState::Running => {
                status.state == InstanceState::Running && status.system_status == HealthStatus::Ok
            }
            target => status.state == target,
        }
    }

    fn fast_fail(&self, status: &InstanceStatus) -> Option<String> {
        (self.0 == InstanceState::Running && status.state == InstanceState::Terminated)
            .then(|| InstanceState::Terminated.to_string())
    }
}

/// Poll a list of instances until all reach `target`.
pub async fn poll_instances<A>(
    api: &A,
    ids: &[String],
    target: InstanceState,
    config: &PollConfig,
) -> Result<bool>
where
    A: InstanceStatusApi + ?Sized,
{
    // Non-running instances are omitted from status results unless asked for
    let include_all = target != InstanceState::Running;

    track_batch(ids, &InstanceTarget(target), config, |pending| async move {
        api.describe_instance_status(&pending, include_all)
            .await
            .map_err(|e| ConvergeError::from_cloud("DescribeInstanceStatus", e))
    })
    .await
}

pub async fn poll_instances_running<A>(api: &A, ids: &[String], config: &PollConfig) -> Result<bool>
where
    A: InstanceStatusApi + ?Sized,
{
    poll_instances(api, ids, InstanceState::Running, config).await
}

pub async fn poll_instances_stopped<A>(api: &A, ids: &[String], config: &PollConfig) -> Result<bool>
where
    A: InstanceStatusApi + ?Sized,
{
    poll_instances(api, ids, InstanceState::Stopped, config).await
}

pub async fn poll_instances_terminated<A>(api: &A, ids: &[String], config: &PollConfig) -> Result<bool>
where
    A: InstanceStatusApi + ?Sized,
{
    poll_instances(api, ids, InstanceState::Terminated, config).await
}

/// Single-pass check that every instance is running and healthy.
pub async fn is_instances_running<A>(api: &A, ids: &[String]) -> Result<bool>
where
    A: InstanceStatusApi + ?Sized,
{
    poll_instances(api, ids, InstanceState::Running, &PollConfig::immediate()).await
}

pub async fn is_instances_stopped<A>(api: &A, ids: &[String]) -> Result<bool>
where
    A: InstanceStatusApi + ?Sized,
{
    poll_instances(api, ids, InstanceState::Stopped, &PollConfig::immediate()).await
}

pub async fn is_instances_terminated<A>(api: &A, ids: &[String]) -> Result<bool>
where
    A: InstanceStatusApi + ?Sized,
{
    poll_instances(api, ids, InstanceState::Terminated, &PollConfig::immediate()).await
}

/// State name and system status of one instance.
///
/// A missing instance reports `("not-found", "not-applicable")` rather than
/// an error.
pub async fn instance_state_and_status<A>(api: &A, id: &str) -> Result<(String, String)>
where
    A: InstanceStatusApi + ?Sized,
{
    let not_found = || ("not-found".to_string(), "not-applicable".to_string());

    match api.describe_instance_status(&[id.to_string()], true).await {
        Ok(observed) => Ok(observed
            .into_iter()
            .find(|o| o.id == id)
            .map(|o| {
                (
                    o.status.state.to_string(),
                    o.status.system_status.as_str().to_string(),
                )
            })
            .unwrap_or_else(not_found)),
        Err(e) if e.is_not_found() => Ok(not_found()),
        Err(e) => Err(ConvergeError::from_cloud("DescribeInstanceStatus", e)),
    }
}

/// Table target status.
///
/// Waiting for `Active` fails fast when a table is seen deleting. Waiting
/// for `NotFound` is the deletion wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableTarget(pub TableStatus);

impl Convergence<TableStatus> for TableTarget {
    fn target(&self) -> String {
        self.0.to_string()
    }

    fn matches(&self, status: &TableStatus) -> bool {
        *status == self.0
    }

    fn fast_fail(&self, status: &TableStatus) -> Option<String> {
        (self.0 == TableStatus::Active && *status == TableStatus::Deleting).then(|| status.to_string())
    }
}

/// Polling cadence for table waits: every 5 seconds for up to a minute.
pub fn default_table_poll() -> PollConfig {
    PollConfig::new(
        Duration::from_secs(DEFAULT_TABLE_POLL_INTERVAL_SECS),
        Duration::from_secs(DEFAULT_TABLE_POLL_MAX_SECS),
    )
}

/// Describe `names`, reporting any the provider left out as not found.
async fn describe_tables<A>(api: &A, names: Vec<String>) -> Result<Vec<Observed<TableStatus>>>
where
    A: TableStatusApi + ?Sized,
{
    let mut observed = match api.describe_tables(&names).await {
        Ok(observed) => observed,
        Err(e) => return Err(ConvergeError::from_cloud("DescribeTable", e)),
    };
    for name in names {
        if !observed.iter().any(|o| o.id == name) {
            observed.push(Observed::new(name, TableStatus::NotFound));
        }
    }
    Ok(observed)
}

/// Wait until every named table is active.
pub async fn wait_until_tables_active<A>(api: &A, names: &[String], config: &PollConfig) -> Result<bool>
where
    A: TableStatusApi + ?Sized,
{
    track_batch(names, &TableTarget(TableStatus::Active), config, |pending| {
        describe_tables(api, pending)
    })
    .await
}

/// Delete every named table and wait until none of them exists.
///
/// Each pass re-issues the delete for tables still present; a table that is
/// still being created refuses the delete until it settles.
pub async fn delete_and_wait_until_tables_deleted<A>(
    api: &A,
    names: &[String],
    config: &PollConfig,
) -> Result<bool>
where
    A: TableStatusApi + ?Sized,
{
    track_batch(names, &TableTarget(TableStatus::NotFound), config, |pending| async move {
        for name in &pending {
            match api.delete_table(name).await {
                Ok(()) => debug!(table = %name, "Delete issued"),
                Err(e) if e.is_not_found_for(ResourceKind::Table) => {}
                Err(e) if e.code() == Some(TABLE_IN_USE_CODE) => {
                    debug!(table = %name, "Table busy, delete retried next pass");
                }
                Err(e) => return Err(ConvergeError::from_cloud("DeleteTable", e)),
            }
        }
        describe_tables(api, pending).await
    })
    .await
}
