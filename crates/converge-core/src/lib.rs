//! converge-core - Convergence primitives for eventually-consistent cloud APIs
//!
//! Turns asynchronous create/describe/delete calls into bounded waits with
//! typed outcomes, and adds a self-healing queue client and a parallel
//! remote execution runner on the same retry discipline.
//!
//! ## Modules
//!
//! - [`wait`]: bounded wait-until-predicate polling
//! - [`tracker`]: batch convergence with fast-fail, instance helpers
//! - [`spot`]: spot request state machine with cleanup on timeout
//! - [`allocator`]: collision-safe unique names
//! - [`lifecycle`]: create/delete facades that wait for visibility
//! - [`queue`]: durable queue client
//! - [`remote`]: per-host remote task runner
//! - [`transfer`]: bounded bulk download

pub mod allocator;
pub mod cloud;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod queue;
pub mod remote;
pub mod spot;
pub mod tracker;
pub mod transfer;
pub mod wait;

pub use cloud::{InstanceState, InstanceStatusApi, ResourceApi, ResourceRef, ResourceSpec, SpotApi};
pub use config::Settings;
pub use error::{CloudError, ConvergeError, Result};
pub use wait::PollConfig;
