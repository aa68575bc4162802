//! SDK error conversion
//!
//! Every trait boundary reports [`CloudError`]. The service error code is
//! read through `ProvideErrorMetadata`; failures that never got a service
//! response (dispatch, timeout, malformed response) carry no code and are
//! classified as transient by the core.

use aws_sdk_ec2::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use converge_core::error::CloudError;
use std::error::Error;
use std::fmt::Debug;

/// Convert any AWS SDK operation error.
pub(crate) fn cloud_error<E, R>(err: SdkError<E, R>) -> CloudError
where
    E: ProvideErrorMetadata + Error + Send + Sync + 'static,
    R: Debug,
{
    match err.code() {
        Some(code) => CloudError::new(code, err.message().unwrap_or_default()),
        None => CloudError::transport(DisplayErrorContext(&err).to_string()),
    }
}

/// Error for a request the SDK refused to build.
pub(crate) fn invalid_request(message: impl std::fmt::Display) -> CloudError {
    CloudError::new("InvalidParameterValue", message.to_string())
}

/// Error for a response missing a field the call depends on.
pub(crate) fn missing_field(field: &str) -> CloudError {
    CloudError::transport(format!("response is missing {field}"))
}
