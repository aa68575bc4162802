//! Default configuration values shared across converge components
//!
//! These constants ensure the core, the AWS adapters and the CLI agree on
//! polling cadence, retry budgets and concurrency limits.

/// Default interval between convergence polls (seconds)
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;

/// Default upper bound on a convergence wait (minutes)
pub const DEFAULT_POLL_MAX_MINUTES: u64 = 10;

/// Default number of suffixes tried when minting a unique resource name
pub const DEFAULT_UNIQUE_MAX_ATTEMPTS: u32 = 100;

/// Default max attempts for each durable queue operation
pub const DEFAULT_QUEUE_ATTEMPT_MAX: u32 = 6;

/// Default sleep between durable queue attempts (seconds)
pub const DEFAULT_QUEUE_ATTEMPT_INTERVAL_SECS: u64 = 10;

/// Long-poll wait time applied to the queue after every (re)connect (seconds)
pub const DEFAULT_RECEIVE_WAIT_TIME_SECS: u32 = 20;

/// Default SSH connect timeout (seconds)
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 60;

/// Default SSH login user for EC2 images
pub const DEFAULT_REMOTE_USERNAME: &str = "ec2-user";

/// Default number of hosts driven concurrently by the remote orchestrator
pub const DEFAULT_MAX_CONCURRENT_HOSTS: usize = 16;

/// Default number of concurrent object downloads in a bulk transfer
pub const DEFAULT_TRANSFER_CONCURRENCY: usize = 8;

/// Default max-acceptable return code for a remote subtask
pub const DEFAULT_MAX_RETURN_CODE: i32 = 0;

/// Name prefix for the key pair created when bootstrapping spot access to a region
pub const DEFAULT_SPOT_KEY_PAIR_PREFIX: &str = "kp_spot_";

/// Name prefix for the SSH security group created alongside it
pub const DEFAULT_SPOT_SECURITY_GROUP_PREFIX: &str = "sg_spot_";

/// Interval between table status polls (seconds)
pub const DEFAULT_TABLE_POLL_INTERVAL_SECS: u64 = 5;

/// Upper bound on a table status wait (seconds)
pub const DEFAULT_TABLE_POLL_MAX_SECS: u64 = 60;

// Serde default functions for struct field defaults

pub fn default_poll_interval_secs() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}

pub fn default_poll_max_minutes() -> u64 {
    DEFAULT_POLL_MAX_MINUTES
}

pub fn default_unique_max_attempts() -> u32 {
    DEFAULT_UNIQUE_MAX_ATTEMPTS
}

pub fn default_queue_attempt_max() -> u32 {
    DEFAULT_QUEUE_ATTEMPT_MAX
}

pub fn default_queue_attempt_interval_secs() -> u64 {
    DEFAULT_QUEUE_ATTEMPT_INTERVAL_SECS
}

pub fn default_receive_wait_time_secs() -> u32 {
    DEFAULT_RECEIVE_WAIT_TIME_SECS
}

pub fn default_connect_timeout_secs() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_SECS
}

pub fn default_remote_username() -> String {
    DEFAULT_REMOTE_USERNAME.to_string()
}

pub fn default_max_concurrent_hosts() -> usize {
    DEFAULT_MAX_CONCURRENT_HOSTS
}

pub fn default_transfer_concurrency() -> usize {
    DEFAULT_TRANSFER_CONCURRENCY
}

pub fn default_max_return_code() -> Option<i32> {
    Some(DEFAULT_MAX_RETURN_CODE)
}

pub fn default_true() -> bool {
    true
}
