//! Cloud provider trait definition

use crate::error::ProviderError;
use crate::requirement::{ImageSelector, Sizing};
use crate::resource::{RemoteStatus, ResourceKind};
use crate::rules::IngressRule;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Provider client adapter
///
/// Stateless apart from the credential context it was constructed with. Each
/// call maps onto one logical vendor operation for one resource kind.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Returns the provider name (e.g., "aws")
    fn name(&self) -> &str;

    /// Returns the provider display name for UI
    fn display_name(&self) -> &str;

    /// Region every call is made against
    fn region(&self) -> &str;

    /// Check if the provider is properly configured and authenticated
    async fn check_auth(&self) -> Result<AuthStatus, ProviderError>;

    /// Submit a create request. Not idempotent: calling twice creates two
    /// resources.
    async fn create(
        &self,
        session_id: &str,
        spec: &CreateSpec,
    ) -> Result<CreatedResource, ProviderError>;

    /// Current status of a resource. An id the provider cannot resolve yet is
    /// a transient error.
    async fn describe(
        &self,
        kind: ResourceKind,
        resource_id: &str,
    ) -> Result<RemoteStatus, ProviderError>;

    /// Delete a resource. Deleting something that no longer exists succeeds.
    async fn delete(
        &self,
        kind: ResourceKind,
        resource_id: &str,
    ) -> Result<DeleteOutcome, ProviderError>;
}

/// Authentication status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthStatus {
    /// Whether authentication is valid
    pub authenticated: bool,

    /// Account/user information if available
    pub account_info: Option<String>,

    /// Error message if not authenticated
    pub error: Option<String>,
}

impl AuthStatus {
    pub fn ok(account_info: impl Into<String>) -> Self {
        Self {
            authenticated: true,
            account_info: Some(account_info.into()),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            authenticated: false,
            account_info: None,
            error: Some(error.into()),
        }
    }
}

/// Which security group is being created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupRole {
    Compute,
    Database,
}

/// Everything the provider needs to create one resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CreateSpec {
    Network {
        name: String,
        cidr_block: String,
    },
    Subnet {
        name: String,
        network_id: String,
        cidr_block: String,
        /// 0 for the first subnet, 1 for the second; picks the availability zone
        zone_index: usize,
    },
    SecurityGroup {
        name: String,
        role: GroupRole,
        network_id: String,
        description: String,
        rules: Vec<IngressRule>,
    },
    ComputeInstance {
        name: String,
        sizing: Sizing,
        image: ImageSelector,
        gpu: Option<String>,
        subnet_id: String,
        security_group_id: String,
        ssh_public_key: String,
    },
    ManagedDatabase {
        name: String,
        sizing: Sizing,
        engine: String,
        engine_version: String,
        subnet_ids: Vec<String>,
        security_group_id: String,
        master_username: String,
        #[serde(skip_serializing, default)]
        master_password: String,
        port: u16,
    },
}

impl CreateSpec {
    /// Ledger kind the created resource is recorded under
    pub fn kind(&self) -> ResourceKind {
        match self {
            CreateSpec::Network { .. } => ResourceKind::Network,
            CreateSpec::Subnet { zone_index: 0, .. } => ResourceKind::SubnetA,
            CreateSpec::Subnet { .. } => ResourceKind::SubnetB,
            CreateSpec::SecurityGroup {
                role: GroupRole::Compute,
                ..
            } => ResourceKind::ComputeSecurityGroup,
            CreateSpec::SecurityGroup {
                role: GroupRole::Database,
                ..
            } => ResourceKind::DatabaseSecurityGroup,
            CreateSpec::ComputeInstance { .. } => ResourceKind::ComputeInstance,
            CreateSpec::ManagedDatabase { .. } => ResourceKind::ManagedDatabase,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            CreateSpec::Network { name, .. }
            | CreateSpec::Subnet { name, .. }
            | CreateSpec::SecurityGroup { name, .. }
            | CreateSpec::ComputeInstance { name, .. }
            | CreateSpec::ManagedDatabase { name, .. } => name,
        }
    }
}

/// Acknowledgement of a create request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreatedResource {
    pub id: String,
    pub status: RemoteStatus,
}

/// Acknowledgement of a delete request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeleteOutcome {
    Deleted,
    AlreadyAbsent,
}

impl std::fmt::Display for DeleteOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeleteOutcome::Deleted => write!(f, "deleted"),
            DeleteOutcome::AlreadyAbsent => write!(f, "already absent"),
        }
    }
}

/// Retry configuration for provider operations
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts
    pub max_attempts: usize,

    /// Initial delay between retries
    pub initial_delay: Duration,

    /// Maximum delay between retries
    pub max_delay: Duration,

    /// Backoff multiplier
    pub backoff_multiplier: f32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subnet_kind_follows_zone_index() {
        let spec = |zone_index| CreateSpec::Subnet {
            name: "s".into(),
            network_id: "vpc-1".into(),
            cidr_block: "10.0.1.0/24".into(),
            zone_index,
        };
        assert_eq!(spec(0).kind(), ResourceKind::SubnetA);
        assert_eq!(spec(1).kind(), ResourceKind::SubnetB);
    }

    #[test]
    fn test_database_password_not_serialized() {
        let spec = CreateSpec::ManagedDatabase {
            name: "db".into(),
            sizing: Sizing::new(1, 1024, 20),
            engine: "mysql".into(),
            engine_version: "8.0".into(),
            subnet_ids: vec!["a".into(), "b".into()],
            security_group_id: "sg".into(),
            master_username: "admin".into(),
            master_password: "hunter2".into(),
            port: 3306,
        };
        let json = serde_json::to_string(&spec).unwrap();
        assert!(!json.contains("hunter2"));
        assert_eq!(spec.kind(), ResourceKind::ManagedDatabase);
    }
}
