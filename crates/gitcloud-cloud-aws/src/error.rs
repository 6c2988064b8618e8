//! AWS error classification
//!
//! Errors are classified by the service error code (`ProvideErrorMetadata::code`)
//! rather than by matching on Debug output.

use aws_sdk_ec2::error::{ProvideErrorMetadata, SdkError};
use gitcloud_cloud::ProviderError;
use thiserror::Error;

/// AWS error categories for retry and teardown logic
#[derive(Debug, Error)]
pub enum AwsError {
    /// Resource was not found (absent on delete, not yet visible on describe)
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Rate limit exceeded (retryable with backoff)
    #[error("Rate limit exceeded: {0}")]
    Throttled(String),

    /// Resource has dependent objects (retryable, e.g. subnet with a releasing ENI)
    #[error("Resource has dependent objects: {0}")]
    DependencyViolation(String),

    /// The request never got a response
    #[error("Request failed before reaching AWS: {0}")]
    Dispatch(String),

    /// Response lacked a field the call depends on
    #[error("AWS response is missing {0}")]
    MissingField(&'static str),

    #[error("Unsupported request: {0}")]
    Unsupported(String),

    /// Waiting for a deletion to settle failed
    #[error(transparent)]
    Wait(#[from] gitcloud_cloud::PollError),

    /// Generic AWS SDK error with code and message
    #[error("AWS error{}: {message}", .code.as_deref().map(|c| format!(" {c}")).unwrap_or_default())]
    Sdk {
        code: Option<String>,
        message: String,
    },
}

impl AwsError {
    /// Check if this is a "not found" error
    pub fn is_not_found(&self) -> bool {
        matches!(self, AwsError::NotFound(_))
    }

    /// Check if this is a retryable error
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AwsError::Throttled(_) | AwsError::DependencyViolation(_) | AwsError::Dispatch(_)
        )
    }

    /// The service refused the request, so nothing was created
    ///
    /// A dispatch failure or timeout may still have reached AWS and does not
    /// count.
    pub fn was_rejected(&self) -> bool {
        matches!(self, AwsError::Throttled(_) | AwsError::NotFound(_))
    }

    /// Service error code of an unclassified SDK error
    pub fn code(&self) -> Option<&str> {
        match self {
            AwsError::Sdk { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    /// Get a user-friendly suggestion for resolving this error, if available.
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            AwsError::Sdk { code: Some(c), .. } => suggestion_for_code(c),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, AwsError>;

/// Known AWS error codes for "not found" conditions
const NOT_FOUND_CODES: &[&str] = &[
    "InvalidVpcID.NotFound",
    "InvalidSubnetID.NotFound",
    "InvalidGroup.NotFound",
    "InvalidGroupId.NotFound",
    "InvalidInstanceID.NotFound",
    "InvalidInternetGatewayID.NotFound",
    "InvalidRouteTableID.NotFound",
    "DBInstanceNotFound",
    "DBInstanceNotFoundFault",
    "DBSubnetGroupNotFoundFault",
];

/// Known AWS error codes for throttling/rate limiting
const THROTTLING_CODES: &[&str] = &[
    "Throttling",
    "ThrottlingException",
    "RequestLimitExceeded",
];

/// Known AWS error codes for dependency violations (resource still in use)
const DEPENDENCY_CODES: &[&str] = &["DependencyViolation", "InvalidDBSubnetGroupStateFault"];

/// Classify an AWS error from its code and message
pub fn classify_aws_error(code: Option<&str>, message: Option<&str>) -> AwsError {
    let message = message.unwrap_or("Unknown error").to_string();

    match code {
        Some(c) if NOT_FOUND_CODES.contains(&c) => AwsError::NotFound(message),
        Some(c) if THROTTLING_CODES.contains(&c) => AwsError::Throttled(message),
        Some(c) if DEPENDENCY_CODES.contains(&c) => AwsError::DependencyViolation(message),
        _ => AwsError::Sdk {
            code: code.map(|s| s.to_string()),
            message,
        },
    }
}

/// Classify any EC2 or RDS SDK error
pub fn classify_sdk_error<E, R>(error: &SdkError<E, R>) -> AwsError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    match error {
        SdkError::TimeoutError(_) => AwsError::Dispatch("request timed out".to_string()),
        SdkError::DispatchFailure(failure) => AwsError::Dispatch(format!("{:?}", failure)),
        _ => {
            let message = error
                .message()
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string());
            classify_aws_error(error.code(), Some(&message))
        }
    }
}

/// `?`-friendly conversion of SDK results
pub(crate) trait SdkResultExt<T> {
    fn classify(self) -> Result<T>;
}

impl<T, E, R> SdkResultExt<T> for std::result::Result<T, SdkError<E, R>>
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    fn classify(self) -> Result<T> {
        self.map_err(|e| classify_sdk_error(&e))
    }
}

/// Turn a not-found error into `None`
pub fn ignore_not_found<T>(result: Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

impl From<AwsError> for ProviderError {
    fn from(error: AwsError) -> Self {
        let message = match error.suggestion() {
            Some(hint) => format!("{} ({})", error, hint),
            None => error.to_string(),
        };
        match error {
            // Fresh ids are not always visible yet
            AwsError::NotFound(_) | AwsError::Wait(_) => ProviderError::transient(message),
            e if e.is_retryable() => ProviderError::transient(message),
            _ => ProviderError::permanent(message),
        }
    }
}

/// Error code to user-friendly suggestion mapping
const SUGGESTIONS: &[(&str, &str)] = &[
    (
        "InsufficientInstanceCapacity",
        "Try a different region or instance size.",
    ),
    (
        "InstanceLimitExceeded",
        "Request a service limit increase via AWS Service Quotas console.",
    ),
    (
        "VcpuLimitExceeded",
        "Request a service limit increase via AWS Service Quotas console.",
    ),
    (
        "VpcLimitExceeded",
        "Delete unused VPCs or request a limit increase.",
    ),
    (
        "InsufficientDBInstanceCapacity",
        "Try a different region or database size.",
    ),
    (
        "UnauthorizedOperation",
        "Check the IAM permissions of the configured credentials.",
    ),
    (
        "AuthFailure",
        "Check the configured AWS access key and secret.",
    ),
];

fn suggestion_for_code(code: &str) -> Option<&'static str> {
    SUGGESTIONS
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, s)| *s)
}
