//! Error taxonomy for convergence operations
//!
//! Collaborator calls (the cloud API, queue connections, object stores)
//! fail with [`CloudError`], which carries the provider's error code. The
//! core classifies those codes and surfaces [`ConvergeError`] to callers.

use converge_common::ResourceKind;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Classification of a provider error code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloudErrorKind {
    /// Resource was not found
    NotFound,
    /// Resource with the same name already exists
    AlreadyExists,
    /// Rate limit exceeded
    Throttled,
    /// Transport failure or transient service fault
    Transient,
    /// Anything else: validation, authorization, unknown codes
    Other,
}

/// Failure reported by a cloud collaborator.
///
/// `code` is the provider's error code when the service answered; it is
/// `None` when the request never got a service response (DNS, TLS, socket,
/// dispatch timeout).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudError {
    pub code: Option<String>,
    pub message: String,
}

/// Known error codes for "not found" conditions
const NOT_FOUND_CODES: &[&str] = &[
    "InvalidInstanceID.NotFound",
    "InvalidGroup.NotFound",
    "InvalidKeyPair.NotFound",
    "InvalidSpotInstanceRequestID.NotFound",
    "NoSuchBucket",
    "NoSuchKey",
    "NoSuchEntity",
    "AWS.SimpleQueueService.NonExistentQueue",
    "QueueDoesNotExist",
];

/// Known error codes for "already exists" conditions
const ALREADY_EXISTS_CODES: &[&str] = &[
    "InvalidKeyPair.Duplicate",
    "InvalidGroup.Duplicate",
    "InvalidPermission.Duplicate",
    "EntityAlreadyExists",
    "BucketAlreadyOwnedByYou",
    "QueueAlreadyExists",
    "AWS.SimpleQueueService.QueueNameExists",
];

/// Known error codes for throttling/rate limiting
const THROTTLING_CODES: &[&str] = &[
    "Throttling",
    "ThrottlingException",
    "RequestLimitExceeded",
    "RequestThrottled",
    "SlowDown",
];

/// Service-side faults that clear up on their own
const TRANSIENT_CODES: &[&str] = &[
    "InternalError",
    "InternalFailure",
    "ServiceUnavailable",
    "ServiceUnavailableException",
    "Unavailable",
    "RequestTimeout",
    "RequestTimeoutException",
    "AWS.SimpleQueueService.ServiceUnavailable",
];

impl CloudError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            message: message.into(),
        }
    }

    /// A failure that never reached the service.
    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    /// Classify this error using its code.
    pub fn kind(&self) -> CloudErrorKind {
        match self.code() {
            None => CloudErrorKind::Transient,
            Some(c) if NOT_FOUND_CODES.contains(&c) => CloudErrorKind::NotFound,
            Some(c) if ALREADY_EXISTS_CODES.contains(&c) => CloudErrorKind::AlreadyExists,
            Some(c) if THROTTLING_CODES.contains(&c) => CloudErrorKind::Throttled,
            Some(c) if TRANSIENT_CODES.contains(&c) => CloudErrorKind::Transient,
            Some(_) => CloudErrorKind::Other,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == CloudErrorKind::NotFound
    }

    pub fn is_already_exists(&self) -> bool {
        self.kind() == CloudErrorKind::AlreadyExists
    }

    /// Whether this error names an existing resource of `kind`.
    pub fn is_conflict_for(&self, kind: ResourceKind) -> bool {
        self.code()
            .is_some_and(|c| kind.conflict_codes().contains(&c))
    }

    /// Whether this error says a resource of `kind` does not exist.
    pub fn is_not_found_for(&self, kind: ResourceKind) -> bool {
        self.code()
            .is_some_and(|c| kind.not_found_codes().contains(&c))
    }

    /// Check if this error is worth a reconnect-and-retry
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.kind(),
            CloudErrorKind::Throttled | CloudErrorKind::Transient
        )
    }
}

impl fmt::Display for CloudError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{}: {}", code, self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for CloudError {}

/// Failure talking to a remote host
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect to {host} timed out after {timeout:?}")]
    ConnectTimeout { host: String, timeout: Duration },

    #[error("connect to {host} failed: {reason}")]
    Connect { host: String, reason: String },

    #[error("copy {source_path} to {destination} failed: {reason}")]
    Transfer {
        source_path: PathBuf,
        destination: String,
        reason: String,
    },

    #[error("command '{command}' could not be run: {reason}")]
    Exec { command: String, reason: String },
}

/// One object that failed to download during a bulk transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferFailure {
    pub key: String,
    pub reason: String,
}

/// Errors surfaced by convergence operations
#[derive(Debug, Error)]
pub enum ConvergeError {
    /// Missing or invalid parameter; never retried
    #[error("invalid parameter: {0}")]
    Validation(String),

    /// Transient transport/API failure; retried by durable operations
    #[error("{operation} failed (recoverable): {source}")]
    Connection {
        operation: &'static str,
        #[source]
        source: CloudError,
    },

    /// Deadline passed without the predicate matching
    #[error("timed out after {waited:?} waiting for {what} to reach {target} (pending: {})", .pending.join(", "))]
    Timeout {
        what: String,
        target: String,
        pending: Vec<String>,
        waited: Duration,
    },

    /// A fast-fail condition was observed mid-wait
    #[error("{id} entered {observed} while waiting for {target}")]
    TerminalState {
        id: String,
        observed: String,
        target: String,
    },

    /// The provider rejected a spot request for placement or pricing reasons
    #[error("spot request {request_id} cannot be fulfilled: {code}")]
    Constraint { request_id: String, code: String },

    /// Spot requests were still pending at the deadline
    #[error("spot requests not fulfilled before deadline: {}", .pending.join(", "))]
    SpotTimeout {
        pending: Vec<String>,
        cleaned_up: bool,
    },

    /// Every candidate unique name was taken
    #[error("no unique name available after {attempts} attempts (last tried {last_name})")]
    AllocationExhausted { last_name: String, attempts: u32 },

    #[error("{kind} '{name}' already exists")]
    AlreadyExists { kind: ResourceKind, name: String },

    #[error("{kind} '{name}' does not exist")]
    DoesNotExist { kind: ResourceKind, name: String },

    /// Non-recoverable provider failure
    #[error("{operation} failed: {source}")]
    Api {
        operation: &'static str,
        #[source]
        source: CloudError,
    },

    /// A received message body did not decode with the configured encoding.
    /// Deleting it through `receipt_handle` stops redelivery.
    #[error("message {message_id} payload could not be decoded: {reason}")]
    PayloadDecode {
        message_id: String,
        receipt_handle: String,
        reason: String,
    },

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// One or more objects failed to download
    #[error("{} of {total} downloads failed (first: {})", .failures.len(), .failures.first().map(|f| f.key.as_str()).unwrap_or("-"))]
    BulkTransfer {
        failures: Vec<TransferFailure>,
        total: usize,
    },

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ConvergeError {
    /// Wrap a collaborator failure, choosing `Connection` or `Api` by its code.
    pub fn from_cloud(operation: &'static str, source: CloudError) -> Self {
        if source.is_recoverable() {
            ConvergeError::Connection { operation, source }
        } else {
            ConvergeError::Api { operation, source }
        }
    }

    /// Create an IO error with path context
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ConvergeError::Io {
            path: path.into(),
            source,
        }
    }

    /// Only connection-classified errors are retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ConvergeError::Connection { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            ConvergeError::Timeout { .. } | ConvergeError::SpotTimeout { .. }
        )
    }

    /// The underlying provider error, if any.
    pub fn cloud_error(&self) -> Option<&CloudError> {
        match self {
            ConvergeError::Connection { source, .. } | ConvergeError::Api { source, .. } => {
                Some(source)
            }
            _ => None,
        }
    }
}

pub type Result<T, E = ConvergeError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_codes() {
        for code in NOT_FOUND_CODES {
            let err = CloudError::new(*code, "some message");
            assert!(err.is_not_found(), "Expected NotFound for code: {code}");
            assert!(!err.is_recoverable());
        }
    }

    #[test]
    fn already_exists_codes() {
        for code in ALREADY_EXISTS_CODES {
            let err = CloudError::new(*code, "msg");
            assert!(err.is_already_exists(), "Expected AlreadyExists for code: {code}");
        }
    }

    #[test]
    fn every_kind_conflict_code_is_classified() {
        for kind in ResourceKind::ALL {
            for code in kind.conflict_codes() {
                let err = CloudError::new(*code, "dup");
                assert!(err.is_already_exists(), "{kind}: {code}");
                assert!(err.is_conflict_for(kind));
            }
        }
    }

    #[test]
    fn throttling_and_transient_are_recoverable() {
        for code in THROTTLING_CODES.iter().chain(TRANSIENT_CODES) {
            let err = CloudError::new(*code, "msg");
            assert!(err.is_recoverable(), "Expected recoverable for code: {code}");
        }
        assert!(CloudError::transport("connection reset").is_recoverable());
    }

    #[test]
    fn unknown_codes_are_not_recoverable() {
        let err = CloudError::new("InvalidParameterValue", "bad");
        assert_eq!(err.kind(), CloudErrorKind::Other);
        assert!(!err.is_recoverable());
    }

    #[test]
    fn from_cloud_picks_variant() {
        let conn = ConvergeError::from_cloud("SendMessage", CloudError::transport("reset"));
        assert!(conn.is_retryable());

        let api = ConvergeError::from_cloud("SendMessage", CloudError::new("AccessDenied", "no"));
        assert!(!api.is_retryable());
        assert_eq!(api.cloud_error().and_then(|e| e.code()), Some("AccessDenied"));
    }

    #[test]
    fn display_formats() {
        assert_eq!(
            CloudError::new("Throttling", "slow down").to_string(),
            "Throttling: slow down"
        );
        let err = ConvergeError::Timeout {
            what: "instances".to_string(),
            target: "running".to_string(),
            pending: vec!["i-1".to_string(), "i-2".to_string()],
            waited: Duration::from_secs(600),
        };
        assert!(err.to_string().contains("pending: i-1, i-2"));
        let err = ConvergeError::BulkTransfer {
            failures: vec![TransferFailure {
                key: "data/a.bin".to_string(),
                reason: "boom".to_string(),
            }],
            total: 3,
        };
        assert_eq!(err.to_string(), "1 of 3 downloads failed (first: data/a.bin)");
    }
}
