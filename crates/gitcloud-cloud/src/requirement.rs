//! Resource requirement and the provisioning plan derived from it
//!
//! The requirement is produced outside this crate (repository analysis plus an
//! AI recommendation) and is only validated structurally here. All decisions
//! about what to build are made once, by [`ProvisioningPlan::from_requirement`].

use crate::error::{CloudError, Result};
use crate::graph::{self, Node};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_REGION: &str = "us-west-1";
pub const DEFAULT_APP_PORT: u16 = 8080;
pub const DEFAULT_DATABASE_ENGINE: &str = "mysql";
pub const DEFAULT_DATABASE_VERSION: &str = "8.0";
pub const DEFAULT_DATABASE_PORT: u16 = 3306;

/// Validated output of the repository analyzer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequirement {
    #[serde(default = "default_region")]
    pub region: String,

    pub services: Vec<ServiceRequirement>,
}

fn default_region() -> String {
    DEFAULT_REGION.to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    Compute,
    Database,
}

impl std::fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceKind::Compute => write!(f, "compute"),
            ServiceKind::Database => write!(f, "database"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRequirement {
    pub kind: ServiceKind,

    pub sizing: Sizing,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageSelector>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<u16>,

    /// GPU model (e.g. "T4", "A100")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu: Option<String>,

    /// Database engine version (database services only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine_version: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sizing {
    pub cpu_cores: u32,
    pub memory_mb: u32,
    pub disk_gb: u32,
}

impl Sizing {
    pub fn new(cpu_cores: u32, memory_mb: u32, disk_gb: u32) -> Self {
        Self {
            cpu_cores,
            memory_mb,
            disk_gb,
        }
    }

    /// Per-dimension maximum of two sizings
    pub fn max(self, other: Sizing) -> Sizing {
        Sizing {
            cpu_cores: self.cpu_cores.max(other.cpu_cores),
            memory_mb: self.memory_mb.max(other.memory_mb),
            disk_gb: self.disk_gb.max(other.disk_gb),
        }
    }
}

impl Default for Sizing {
    fn default() -> Self {
        Self::new(2, 4096, 50)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Architecture {
    X86_64,
    Arm64,
}

impl std::fmt::Display for Architecture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Architecture::X86_64 => write!(f, "x86_64"),
            Architecture::Arm64 => write!(f, "arm64"),
        }
    }
}

/// Operating system image to boot the compute instance from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSelector {
    pub family: String,
    pub version: String,
    pub architecture: Architecture,
}

impl Default for ImageSelector {
    fn default() -> Self {
        Self {
            family: "ubuntu".to_string(),
            version: "22.04".to_string(),
            architecture: Architecture::X86_64,
        }
    }
}

impl ResourceRequirement {
    pub fn new(region: impl Into<String>, services: Vec<ServiceRequirement>) -> Self {
        Self {
            region: region.into(),
            services,
        }
    }

    /// Load a requirement from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            CloudError::Validation(format!("cannot read {}: {}", path.display(), e))
        })?;
        let requirement: ResourceRequirement = serde_json::from_str(&content)
            .map_err(|e| CloudError::Validation(format!("{}: {}", path.display(), e)))?;
        Ok(requirement)
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    pub fn compute_services(&self) -> impl Iterator<Item = &ServiceRequirement> {
        self.services
            .iter()
            .filter(|s| s.kind == ServiceKind::Compute)
    }

    pub fn database_services(&self) -> impl Iterator<Item = &ServiceRequirement> {
        self.services
            .iter()
            .filter(|s| s.kind == ServiceKind::Database)
    }

    /// Structural validation. Nothing is checked against the provider here.
    pub fn validate(&self) -> Result<()> {
        if self.region.trim().is_empty() {
            return Err(CloudError::Validation("region must not be empty".into()));
        }

        if self.compute_services().next().is_none() {
            return Err(CloudError::Validation(
                "at least one compute service is required".into(),
            ));
        }

        for (index, service) in self.services.iter().enumerate() {
            let Sizing {
                cpu_cores,
                memory_mb,
                disk_gb,
            } = service.sizing;
            if cpu_cores == 0 || memory_mb == 0 || disk_gb == 0 {
                return Err(CloudError::Validation(format!(
                    "services[{}] ({}): sizing values must be positive (cpu_cores={}, memory_mb={}, disk_gb={})",
                    index, service.kind, cpu_cores, memory_mb, disk_gb
                )));
            }
            if service.ports.contains(&0) {
                return Err(CloudError::Validation(format!(
                    "services[{}] ({}): port 0 is not a valid port",
                    index, service.kind
                )));
            }
            if let Some(image) = &service.image {
                if image.family.trim().is_empty() || image.version.trim().is_empty() {
                    return Err(CloudError::Validation(format!(
                        "services[{}] ({}): image family and version must not be empty",
                        index, service.kind
                    )));
                }
            }
        }

        Ok(())
    }
}

impl Default for ResourceRequirement {
    fn default() -> Self {
        Self {
            region: default_region(),
            services: vec![ServiceRequirement {
                kind: ServiceKind::Compute,
                sizing: Sizing::default(),
                image: Some(ImageSelector::default()),
                ports: Vec::new(),
                gpu: None,
                engine_version: None,
            }],
        }
    }
}

/// What the compute instance looks like
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputePlan {
    pub sizing: Sizing,
    pub image: ImageSelector,
    pub app_ports: Vec<u16>,
    pub gpu: Option<String>,
}

/// What the managed database looks like
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabasePlan {
    pub sizing: Sizing,
    pub engine: String,
    pub engine_version: String,
    pub port: u16,
}

/// Everything the orchestrator needs to know about what to build
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisioningPlan {
    pub region: String,
    pub compute: ComputePlan,
    pub database: Option<DatabasePlan>,
}

impl ProvisioningPlan {
    /// Decide sizing, image, ports and whether a database is needed.
    ///
    /// Several compute services collapse into one instance sized to the
    /// per-dimension maximum. Their ports are merged in first-seen order.
    pub fn from_requirement(requirement: &ResourceRequirement) -> Result<Self> {
        requirement.validate()?;

        let mut sizing: Option<Sizing> = None;
        let mut image = None;
        let mut gpu = None;
        let mut app_ports = Vec::new();
        for service in requirement.compute_services() {
            sizing = Some(match sizing {
                Some(current) => current.max(service.sizing),
                None => service.sizing,
            });
            if image.is_none() {
                image = service.image.clone();
            }
            if gpu.is_none() {
                gpu = service.gpu.clone();
            }
            for port in &service.ports {
                if !app_ports.contains(port) {
                    app_ports.push(*port);
                }
            }
        }
        if app_ports.is_empty() {
            app_ports.push(DEFAULT_APP_PORT);
        }

        let compute = ComputePlan {
            sizing: sizing.unwrap_or_default(),
            image: image.unwrap_or_default(),
            app_ports,
            gpu,
        };

        let database = requirement
            .database_services()
            .fold(None::<DatabasePlan>, |acc, service| match acc {
                Some(mut plan) => {
                    plan.sizing = plan.sizing.max(service.sizing);
                    Some(plan)
                }
                None => Some(DatabasePlan {
                    sizing: service.sizing,
                    engine: DEFAULT_DATABASE_ENGINE.to_string(),
                    engine_version: service
                        .engine_version
                        .clone()
                        .unwrap_or_else(|| DEFAULT_DATABASE_VERSION.to_string()),
                    port: service
                        .ports
                        .first()
                        .copied()
                        .unwrap_or(DEFAULT_DATABASE_PORT),
                }),
            });

        Ok(Self {
            region: requirement.region.clone(),
            compute,
            database,
        })
    }

    pub fn needs_database(&self) -> bool {
        self.database.is_some()
    }

    /// Nodes to create, in dependency order
    pub fn nodes(&self) -> Vec<Node> {
        graph::provisioning_order(self.needs_database())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compute(cpu: u32, mem: u32, disk: u32, ports: Vec<u16>) -> ServiceRequirement {
        ServiceRequirement {
            kind: ServiceKind::Compute,
            sizing: Sizing::new(cpu, mem, disk),
            image: None,
            ports,
            gpu: None,
            engine_version: None,
        }
    }

    fn database(disk: u32) -> ServiceRequirement {
        ServiceRequirement {
            kind: ServiceKind::Database,
            sizing: Sizing::new(1, 1024, disk),
            image: None,
            ports: Vec::new(),
            gpu: None,
            engine_version: None,
        }
    }

    #[test]
    fn test_requires_compute_service() {
        let req = ResourceRequirement::new("us-west-1", vec![database(20)]);
        let err = req.validate().unwrap_err();
        assert!(matches!(err, CloudError::Validation(_)));
    }

    #[test]
    fn test_rejects_zero_sizing() {
        let req = ResourceRequirement::new("us-west-1", vec![compute(0, 4096, 50, vec![])]);
        let err = req.validate().unwrap_err();
        assert!(err.to_string().contains("cpu_cores=0"));
    }

    #[test]
    fn test_rejects_empty_region() {
        let req = ResourceRequirement::new(" ", vec![compute(2, 4096, 50, vec![])]);
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_default_requirement_is_valid() {
        let req = ResourceRequirement::default();
        req.validate().unwrap();
        let plan = ProvisioningPlan::from_requirement(&req).unwrap();
        assert_eq!(plan.compute.sizing, Sizing::new(2, 4096, 50));
        assert_eq!(plan.compute.image.version, "22.04");
        assert_eq!(plan.compute.app_ports, vec![DEFAULT_APP_PORT]);
        assert!(!plan.needs_database());
    }

    #[test]
    fn test_plan_merges_compute_services() {
        let req = ResourceRequirement::new(
            "us-east-1",
            vec![
                compute(2, 8192, 30, vec![3000]),
                compute(4, 4096, 80, vec![3000, 9000]),
            ],
        );
        let plan = ProvisioningPlan::from_requirement(&req).unwrap();
        assert_eq!(plan.compute.sizing, Sizing::new(4, 8192, 80));
        assert_eq!(plan.compute.app_ports, vec![3000, 9000]);
        assert_eq!(plan.region, "us-east-1");
    }

    #[test]
    fn test_plan_with_database() {
        let req = ResourceRequirement::new(
            "us-west-1",
            vec![compute(2, 4096, 50, vec![]), database(40)],
        );
        let plan = ProvisioningPlan::from_requirement(&req).unwrap();
        let db = plan.database.as_ref().unwrap();
        assert_eq!(db.engine, "mysql");
        assert_eq!(db.engine_version, "8.0");
        assert_eq!(db.port, 3306);
        assert_eq!(db.sizing.disk_gb, 40);
        assert_eq!(plan.nodes().last(), Some(&Node::ManagedDatabase));
    }

    #[test]
    fn test_requirement_json_defaults() {
        let json = r#"{
            "services": [
                {"kind": "compute", "sizing": {"cpu_cores": 2, "memory_mb": 4096, "disk_gb": 50}}
            ]
        }"#;
        let req: ResourceRequirement = serde_json::from_str(json).unwrap();
        assert_eq!(req.region, DEFAULT_REGION);
        assert!(req.services[0].ports.is_empty());
        req.validate().unwrap();
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("requirement.json");
        let req = ResourceRequirement::new("eu-west-1", vec![compute(1, 2048, 20, vec![80])]);
        std::fs::write(&path, serde_json::to_string(&req).unwrap()).unwrap();

        let loaded = ResourceRequirement::from_file(&path).unwrap();
        assert_eq!(loaded, req);

        let missing = ResourceRequirement::from_file(dir.path().join("nope.json"));
        assert!(matches!(missing, Err(CloudError::Validation(_))));
    }
}
