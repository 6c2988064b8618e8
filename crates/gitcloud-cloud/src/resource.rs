//! Resource kinds and remote status

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Kind of a cloud resource recorded in a session ledger
///
/// The two subnets are distinct kinds so that each has its own ledger entry and
/// can be skipped individually on resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    Network,
    SubnetA,
    SubnetB,
    #[serde(rename = "sg-compute")]
    ComputeSecurityGroup,
    #[serde(rename = "sg-database")]
    DatabaseSecurityGroup,
    ComputeInstance,
    ManagedDatabase,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 7] = [
        ResourceKind::Network,
        ResourceKind::SubnetA,
        ResourceKind::SubnetB,
        ResourceKind::ComputeSecurityGroup,
        ResourceKind::DatabaseSecurityGroup,
        ResourceKind::ComputeInstance,
        ResourceKind::ManagedDatabase,
    ];

    /// Depth in the dependency graph (0 = no dependencies)
    pub fn dependency_rank(self) -> u8 {
        match self {
            ResourceKind::Network => 0,
            ResourceKind::SubnetA | ResourceKind::SubnetB => 1,
            ResourceKind::ComputeSecurityGroup | ResourceKind::DatabaseSecurityGroup => 2,
            ResourceKind::ComputeInstance | ResourceKind::ManagedDatabase => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Network => "network",
            ResourceKind::SubnetA => "subnet-a",
            ResourceKind::SubnetB => "subnet-b",
            ResourceKind::ComputeSecurityGroup => "sg-compute",
            ResourceKind::DatabaseSecurityGroup => "sg-database",
            ResourceKind::ComputeInstance => "compute-instance",
            ResourceKind::ManagedDatabase => "managed-database",
        }
    }

    /// Whether a described status means the resource is usable
    pub fn is_ready(self, status: &RemoteStatus) -> bool {
        status.status == ResourceStatus::Running
    }

    /// Whether a described status means the resource will never become usable
    pub fn is_failed(self, status: &RemoteStatus) -> bool {
        match self {
            // A stopped or terminated instance does not come back by itself
            ResourceKind::ComputeInstance => matches!(
                status.status,
                ResourceStatus::Error
                    | ResourceStatus::Stopped
                    | ResourceStatus::Deleting
                    | ResourceStatus::Deleted
            ),
            _ => matches!(
                status.status,
                ResourceStatus::Error | ResourceStatus::Deleting | ResourceStatus::Deleted
            ),
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        ResourceKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown resource kind: {}", s))
    }
}

/// Status of a resource as reported by the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    /// Resource is being created
    Creating,
    /// Resource is running/available
    Running,
    /// Resource is stopped
    Stopped,
    /// Resource is being deleted
    Deleting,
    /// Resource has been deleted
    Deleted,
    /// Resource is in error state
    Error,
    /// Status is unknown
    Unknown,
}

impl std::fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceStatus::Creating => write!(f, "creating"),
            ResourceStatus::Running => write!(f, "running"),
            ResourceStatus::Stopped => write!(f, "stopped"),
            ResourceStatus::Deleting => write!(f, "deleting"),
            ResourceStatus::Deleted => write!(f, "deleted"),
            ResourceStatus::Error => write!(f, "error"),
            ResourceStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// Result of a `describe` call: normalized status plus raw provider state and
/// attributes (IP addresses, endpoints, ...)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteStatus {
    pub status: ResourceStatus,

    /// Provider's own state string, for logs and error messages
    pub raw: Option<String>,

    pub attributes: HashMap<String, String>,
}

impl RemoteStatus {
    pub fn new(status: ResourceStatus) -> Self {
        Self {
            status,
            raw: None,
            attributes: HashMap::new(),
        }
    }

    pub fn with_raw(mut self, raw: impl Into<String>) -> Self {
        self.raw = Some(raw.into());
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }
}

impl std::fmt::Display for RemoteStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.raw {
            Some(raw) => write!(f, "{} ({})", self.status, raw),
            None => write!(f, "{}", self.status),
        }
    }
}

/// Well-known attribute keys reported by `describe`
pub mod attributes {
    pub const PUBLIC_IP: &str = "public_ip";
    pub const PRIVATE_IP: &str = "private_ip";
    pub const ENDPOINT: &str = "endpoint";
    pub const PORT: &str = "port";
    pub const CIDR_BLOCK: &str = "cidr_block";
}
