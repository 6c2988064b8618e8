//! Security group ingress rules

use serde::{Deserialize, Serialize};

pub const SSH_PORT: u16 = 22;
pub const ANYWHERE_CIDR: &str = "0.0.0.0/0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
        }
    }
}

/// Where traffic is allowed from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleSource {
    Anywhere,
    Cidr(String),
    /// Members of another security group, by provider id
    SecurityGroup(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngressRule {
    pub protocol: Protocol,
    pub from_port: u16,
    pub to_port: u16,
    pub source: RuleSource,
    pub description: String,
}

impl IngressRule {
    pub fn tcp(port: u16, source: RuleSource, description: impl Into<String>) -> Self {
        Self {
            protocol: Protocol::Tcp,
            from_port: port,
            to_port: port,
            source,
            description: description.into(),
        }
    }
}

/// SSH plus every application port, open to anywhere
pub fn compute_ingress_rules(app_ports: &[u16]) -> Vec<IngressRule> {
    let mut rules = vec![IngressRule::tcp(SSH_PORT, RuleSource::Anywhere, "SSH")];
    for &port in app_ports {
        if port == SSH_PORT {
            continue;
        }
        rules.push(IngressRule::tcp(
            port,
            RuleSource::Anywhere,
            format!("application port {}", port),
        ));
    }
    rules
}

/// The database port, reachable only from the compute security group
pub fn database_ingress_rules(port: u16, compute_group_id: &str) -> Vec<IngressRule> {
    vec![IngressRule::tcp(
        port,
        RuleSource::SecurityGroup(compute_group_id.to_string()),
        "database access from compute",
    )]
}
