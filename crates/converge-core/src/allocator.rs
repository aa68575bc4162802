//! Collision-safe unique name allocation.
//!
//! Candidate names are `prefix + (seed + i)` for attempt `i`, with the seed
//! taken from the wall clock in hundredths of a second. The provider is the
//! arbiter of uniqueness: a create that fails with a name conflict for the
//! kind being created moves on to the next suffix, anything else is fatal.
//! A duplicate-rule error from a follow-up call (e.g. adding ingress to a
//! new security group) is not a name conflict and stops the allocation.

use crate::error::{CloudError, ConvergeError, Result};
use crate::wait::PollConfig;
use converge_common::ResourceKind;
use converge_common::defaults::DEFAULT_UNIQUE_MAX_ATTEMPTS;
use std::future::Future;
use tracing::{debug, info};

/// Options for [`allocate_unique`] callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocateOptions {
    pub max_attempts: u32,
    /// Suffix seed; `None` uses [`default_seed`]
    pub seed: Option<u64>,
    /// Wait for existence-visibility after creation when set
    pub sync: Option<PollConfig>,
}

impl Default for AllocateOptions {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_UNIQUE_MAX_ATTEMPTS,
            seed: None,
            sync: Some(PollConfig::default()),
        }
    }
}

impl AllocateOptions {
    pub fn seed(&self) -> u64 {
        self.seed.unwrap_or_else(default_seed)
    }
}

/// A successfully created resource and the name it got.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocated<H> {
    pub name: String,
    pub handle: H,
    /// 1-based attempt that succeeded
    pub attempts: u32,
}

/// Seed derived from the current time.
pub fn default_seed() -> u64 {
    converge_common::timestamp_centis()
}

/// Candidate name for 0-based attempt `attempt`.
pub fn candidate_name(prefix: &str, seed: u64, attempt: u32) -> String {
    format!("{}{}", prefix, seed.saturating_add(u64::from(attempt)))
}

/// Create a resource under the first free name `prefix + (seed + i)`.
///
/// Only `kind`'s own conflict codes count as a collision.
///
/// # Errors
/// * `Validation` - `max_attempts` is zero
/// * `AllocationExhausted` - every candidate collided; names the last one tried
/// * any non-conflict failure from `create`, on first occurrence
pub async fn allocate_unique<H, F, Fut>(
    kind: ResourceKind,
    prefix: &str,
    seed: u64,
    max_attempts: u32,
    mut create: F,
) -> Result<Allocated<H>>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = std::result::Result<H, CloudError>>,
{
    if max_attempts == 0 {
        return Err(ConvergeError::Validation(
            "max_attempts must be at least 1".to_string(),
        ));
    }

    let mut last_name = String::new();
    for attempt in 0..max_attempts {
        let name = candidate_name(prefix, seed, attempt);

        match create(name.clone()).await {
            Ok(handle) => {
                info!(kind = %kind, name = %name, attempts = attempt + 1, "Allocated unique name");
                return Ok(Allocated {
                    name,
                    handle,
                    attempts: attempt + 1,
                });
            }
            Err(e) if e.is_conflict_for(kind) => {
                debug!(kind = %kind, name = %name, attempt = attempt + 1, "Name taken, trying next suffix");
                last_name = name;
            }
            Err(e) => return Err(ConvergeError::from_cloud("CreateUnique", e)),
        }
    }

    Err(ConvergeError::AllocationExhausted {
        last_name,
        attempts: max_attempts,
    })
}
