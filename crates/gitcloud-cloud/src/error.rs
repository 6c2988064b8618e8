//! Error types for provisioning and teardown

use crate::resource::ResourceKind;
use thiserror::Error;

/// Whether a provider failure is worth retrying
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// Throttling, eventual consistency, network hiccups
    Transient,
    /// Anything retrying will not fix
    Permanent,
}

impl std::fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderErrorKind::Transient => write!(f, "transient"),
            ProviderErrorKind::Permanent => write!(f, "permanent"),
        }
    }
}

/// Failure of a single create/describe/delete call against the cloud provider
#[derive(Error, Debug, Clone)]
#[error("{kind} provider error{}: {message}", .resource_id.as_deref().map(|id| format!(" on {id}")).unwrap_or_default())]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
    pub resource_id: Option<String>,
}

impl ProviderError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::Transient,
            message: message.into(),
            resource_id: None,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::Permanent,
            message: message.into(),
            resource_id: None,
        }
    }

    pub fn with_resource(mut self, resource_id: impl Into<String>) -> Self {
        self.resource_id = Some(resource_id.into());
        self
    }

    pub fn is_transient(&self) -> bool {
        self.kind == ProviderErrorKind::Transient
    }
}

/// Why a readiness wait ended without the resource becoming ready
#[derive(Debug, Clone)]
pub enum PollErrorKind {
    /// Budget exhausted while the resource was still transitional
    Timeout {
        elapsed: std::time::Duration,
        attempts: u32,
        last_status: Option<String>,
    },
    /// The resource entered a failed state and will not recover on its own
    RemoteFailure { status: String },
    /// `describe` failed with a permanent error
    Provider(ProviderError),
    /// The caller cancelled the wait
    Cancelled,
}

/// Readiness polling failure
#[derive(Error, Debug, Clone)]
#[error("waiting for {resource_id}: {}", describe_poll_kind(.kind))]
pub struct PollError {
    pub resource_id: String,
    pub kind: PollErrorKind,
}

fn describe_poll_kind(kind: &PollErrorKind) -> String {
    match kind {
        PollErrorKind::Timeout {
            elapsed,
            attempts,
            last_status,
        } => format!(
            "timed out after {:?} ({} attempts, last status: {})",
            elapsed,
            attempts,
            last_status.as_deref().unwrap_or("none")
        ),
        PollErrorKind::RemoteFailure { status } => {
            format!("resource entered failed state '{}'", status)
        }
        PollErrorKind::Provider(e) => e.to_string(),
        PollErrorKind::Cancelled => "cancelled".to_string(),
    }
}

impl PollError {
    pub fn is_timeout(&self) -> bool {
        matches!(self.kind, PollErrorKind::Timeout { .. })
    }

    pub fn is_remote_failure(&self) -> bool {
        matches!(self.kind, PollErrorKind::RemoteFailure { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.kind, PollErrorKind::Cancelled)
    }
}

/// Top-level error for the provisioning core
#[derive(Error, Debug)]
pub enum CloudError {
    #[error("Invalid resource requirement: {0}")]
    Validation(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Poll(#[from] PollError),

    #[error("Provisioning of session {session_id} failed at {kind}: {source}")]
    Provisioning {
        session_id: String,
        kind: ResourceKind,
        #[source]
        source: Box<CloudError>,
    },

    #[error("Provisioning of session {0} was cancelled")]
    Cancelled(String),

    #[error("Dependency {0} is missing from the ledger")]
    MissingDependency(ResourceKind),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Invalid session id {0:?} (expected session_YYYYMMDD_HHMMSS)")]
    InvalidSessionId(String),

    #[error("Session {session_id} is {status} and cannot be {action}")]
    InvalidSessionState {
        session_id: String,
        status: crate::session::SessionStatus,
        action: &'static str,
    },

    #[error("Teardown of session {session_id} left {remaining} resource(s) behind")]
    TeardownPartial { session_id: String, remaining: usize },

    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    #[error("Session record error: {0}")]
    StateError(String),

    #[error("Lock acquisition failed: {0}")]
    LockError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CloudError {
    /// The resource kind a provisioning failure stopped at, if any
    pub fn failed_kind(&self) -> Option<ResourceKind> {
        match self {
            CloudError::Provisioning { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// The session an error belongs to, when it has one
    pub fn session_id(&self) -> Option<&str> {
        match self {
            CloudError::Provisioning { session_id, .. }
            | CloudError::InvalidSessionState { session_id, .. }
            | CloudError::TeardownPartial { session_id, .. } => Some(session_id),
            CloudError::Cancelled(session_id) | CloudError::SessionNotFound(session_id) => {
                Some(session_id)
            }
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, CloudError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_error_display_includes_resource() {
        let err = ProviderError::permanent("quota exceeded").with_resource("vpc-123");
        assert_eq!(
            err.to_string(),
            "permanent provider error on vpc-123: quota exceeded"
        );
        assert!(!err.is_transient());
    }

    #[test]
    fn provisioning_error_exposes_kind() {
        let err = CloudError::Provisioning {
            session_id: "session_20250101_000000".to_string(),
            kind: ResourceKind::ManagedDatabase,
            source: Box::new(ProviderError::permanent("boom").into()),
        };
        assert_eq!(err.failed_kind(), Some(ResourceKind::ManagedDatabase));
        assert_eq!(err.session_id(), Some("session_20250101_000000"));
        assert!(err.to_string().contains("managed-database"));
        assert_eq!(CloudError::Validation("x".into()).session_id(), None);
    }
}
