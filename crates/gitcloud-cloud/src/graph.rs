//! Resource dependency graph
//!
//! The graph is fixed: network, then the subnet pair, then security groups,
//! then compute and the optional database. It is kept as an explicit ordered
//! list rather than computed by a topological sort.

use crate::resource::ResourceKind;

/// One step of provisioning
///
/// `SubnetPair` is a compound node: both subnets are created before either is
/// polled, and both must be ready before dependants proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Node {
    Network,
    SubnetPair,
    ComputeSecurityGroup,
    DatabaseSecurityGroup,
    ComputeInstance,
    ManagedDatabase,
}

impl Node {
    /// Ledger kinds this node produces
    pub fn kinds(self) -> &'static [ResourceKind] {
        match self {
            Node::Network => &[ResourceKind::Network],
            Node::SubnetPair => &[ResourceKind::SubnetA, ResourceKind::SubnetB],
            Node::ComputeSecurityGroup => &[ResourceKind::ComputeSecurityGroup],
            Node::DatabaseSecurityGroup => &[ResourceKind::DatabaseSecurityGroup],
            Node::ComputeInstance => &[ResourceKind::ComputeInstance],
            Node::ManagedDatabase => &[ResourceKind::ManagedDatabase],
        }
    }

    /// Ledger kinds that must exist before this node can be created
    pub fn depends_on(self) -> &'static [ResourceKind] {
        match self {
            Node::Network => &[],
            Node::SubnetPair => &[ResourceKind::Network],
            Node::ComputeSecurityGroup => &[ResourceKind::Network],
            Node::DatabaseSecurityGroup => {
                &[ResourceKind::Network, ResourceKind::ComputeSecurityGroup]
            }
            Node::ComputeInstance => &[
                ResourceKind::SubnetA,
                ResourceKind::ComputeSecurityGroup,
            ],
            Node::ManagedDatabase => &[
                ResourceKind::SubnetA,
                ResourceKind::SubnetB,
                ResourceKind::DatabaseSecurityGroup,
            ],
        }
    }

    /// First dependency absent from `recorded`
    pub fn missing_dependency(self, recorded: &[ResourceKind]) -> Option<ResourceKind> {
        self.depends_on()
            .iter()
            .copied()
            .find(|dep| !recorded.contains(dep))
    }
}

impl std::fmt::Display for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Node::Network => write!(f, "network"),
            Node::SubnetPair => write!(f, "subnet pair"),
            Node::ComputeSecurityGroup => write!(f, "compute security group"),
            Node::DatabaseSecurityGroup => write!(f, "database security group"),
            Node::ComputeInstance => write!(f, "compute instance"),
            Node::ManagedDatabase => write!(f, "managed database"),
        }
    }
}

/// Topological creation order for a session
pub fn provisioning_order(with_database: bool) -> Vec<Node> {
    let mut nodes = vec![
        Node::Network,
        Node::SubnetPair,
        Node::ComputeSecurityGroup,
    ];
    if with_database {
        nodes.push(Node::DatabaseSecurityGroup);
    }
    nodes.push(Node::ComputeInstance);
    if with_database {
        nodes.push(Node::ManagedDatabase);
    }
    nodes
}
