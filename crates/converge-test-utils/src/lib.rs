//! Shared test utilities for converge
//!
//! Stateful in-memory fakes of the collaborator traits, for tests that need
//! more than a scripted mock: eventual consistency, queue contents, timing.
//! Kept out of converge-core so none of it ships in the library.
//!
//! ## Modules
//!
//! - [`resources`]: eventually-consistent named-resource store
//! - [`queue`]: in-memory queue service with scriptable failures
//! - [`remote`]: remote transport with per-host scripted command results
//! - [`objects`]: in-memory object store
//! - [`aws`]: AWS region detection and test run ID generation

pub mod aws;
pub mod objects;
pub mod queue;
pub mod remote;
pub mod resources;

use std::sync::{Mutex, MutexGuard, PoisonError};

// Re-export commonly used items
pub use aws::{get_test_region, test_run_id};
pub use objects::FakeObjectSource;
pub use queue::{FakeQueueConnection, FakeQueueConnector};
pub use remote::{FakeSession, FakeTransport};
pub use resources::FakeResourceApi;

/// A panicking test must not poison the fakes for the assertions after it.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
