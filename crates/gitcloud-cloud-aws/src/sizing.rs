//! Sizing tables: requested cores/memory to EC2 instance types and RDS classes

use crate::error::{AwsError, Result};
use gitcloud_cloud::{Architecture, Sizing};

/// Smallest general purpose size that satisfies (cores, memory GiB)
const GENERAL_PURPOSE_SIZES: &[(u32, u32, &str)] = &[
    (2, 4, "large"),
    (2, 8, "large"),
    (4, 16, "xlarge"),
    (8, 32, "2xlarge"),
    (16, 64, "4xlarge"),
    (32, 128, "8xlarge"),
];

const BURSTABLE_SIZES: &[(u32, u32, &str)] = &[(2, 4, "medium"), (2, 8, "large")];

fn memory_gib(memory_mb: u32) -> u32 {
    memory_mb.div_ceil(1024)
}

fn pick<'a>(table: &'a [(u32, u32, &'a str)], cores: u32, gib: u32) -> Option<&'a str> {
    table
        .iter()
        .find(|(c, m, _)| cores <= *c && gib <= *m)
        .map(|(_, _, size)| *size)
}

/// GPU model to instance type
fn gpu_instance_type(gpu: &str) -> Result<&'static str> {
    match gpu.trim().to_ascii_uppercase().as_str() {
        "T4" => Ok("g4dn.xlarge"),
        "A10" | "A10G" => Ok("g5.xlarge"),
        "V100" => Ok("p3.2xlarge"),
        "A100" => Ok("p4d.24xlarge"),
        other => Err(AwsError::Unsupported(format!("GPU type {}", other))),
    }
}

/// EC2 instance type for a compute sizing
///
/// Small machines use the burstable family, larger ones general purpose
/// (`m6i` on x86_64, `m7g` on arm64).
pub fn instance_type(sizing: &Sizing, gpu: Option<&str>, arch: Architecture) -> Result<String> {
    if let Some(gpu) = gpu.filter(|g| !g.trim().is_empty() && !g.eq_ignore_ascii_case("none")) {
        if arch == Architecture::Arm64 {
            return Err(AwsError::Unsupported(
                "GPU instances are only available for x86_64".to_string(),
            ));
        }
        return gpu_instance_type(gpu).map(str::to_string);
    }

    let gib = memory_gib(sizing.memory_mb);
    let (burstable, general) = match arch {
        Architecture::X86_64 => ("t3", "m6i"),
        Architecture::Arm64 => ("t4g", "m7g"),
    };

    if let Some(size) = pick(BURSTABLE_SIZES, sizing.cpu_cores, gib) {
        return Ok(format!("{}.{}", burstable, size));
    }
    match pick(GENERAL_PURPOSE_SIZES, sizing.cpu_cores, gib) {
        Some(size) => Ok(format!("{}.{}", general, size)),
        None => Err(AwsError::Unsupported(format!(
            "no instance type with {} cores and {} GiB",
            sizing.cpu_cores, gib
        ))),
    }
}

/// RDS instance class for a database sizing
pub fn db_instance_class(sizing: &Sizing) -> String {
    let gib = memory_gib(sizing.memory_mb);
    let class = match (sizing.cpu_cores, gib) {
        (c, m) if c <= 2 && m <= 1 => "db.t3.micro",
        (c, m) if c <= 2 && m <= 2 => "db.t3.small",
        (c, m) if c <= 2 && m <= 4 => "db.t3.medium",
        (c, m) if c <= 2 && m <= 8 => "db.t3.large",
        (c, m) if c <= 4 && m <= 16 => "db.m6i.xlarge",
        (c, m) if c <= 8 && m <= 32 => "db.m6i.2xlarge",
        _ => "db.m6i.4xlarge",
    };
    class.to_string()
}

/// RDS storage in GiB (MySQL minimum is 20)
pub fn db_storage_gib(sizing: &Sizing) -> i32 {
    i32::try_from(sizing.disk_gb.max(20)).unwrap_or(i32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_sizing_is_burstable() {
        let t = instance_type(&Sizing::new(2, 4096, 50), None, Architecture::X86_64).unwrap();
        assert_eq!(t, "t3.medium");
        let t = instance_type(&Sizing::new(2, 4096, 50), None, Architecture::Arm64).unwrap();
        assert_eq!(t, "t4g.medium");
    }

    #[test]
    fn larger_sizing_uses_general_purpose() {
        let t = instance_type(&Sizing::new(4, 8192, 50), None, Architecture::X86_64).unwrap();
        assert_eq!(t, "m6i.xlarge");
        let t = instance_type(&Sizing::new(16, 65536, 50), None, Architecture::X86_64).unwrap();
        assert_eq!(t, "m6i.4xlarge");
        assert!(instance_type(&Sizing::new(64, 512_000, 50), None, Architecture::X86_64).is_err());
    }

    #[test]
    fn gpu_types() {
        let s = Sizing::new(4, 16384, 100);
        assert_eq!(
            instance_type(&s, Some("t4"), Architecture::X86_64).unwrap(),
            "g4dn.xlarge"
        );
        assert_eq!(
            instance_type(&s, Some("A100"), Architecture::X86_64).unwrap(),
            "p4d.24xlarge"
        );
        assert_eq!(
            instance_type(&s, Some("None"), Architecture::X86_64).unwrap(),
            "m6i.xlarge"
        );
        assert!(instance_type(&s, Some("H100"), Architecture::X86_64).is_err());
        assert!(instance_type(&s, Some("T4"), Architecture::Arm64).is_err());
    }

    #[test]
    fn database_classes() {
        assert_eq!(db_instance_class(&Sizing::new(1, 1024, 20)), "db.t3.micro");
        assert_eq!(db_instance_class(&Sizing::new(2, 4000, 20)), "db.t3.medium");
        assert_eq!(db_instance_class(&Sizing::new(4, 16384, 20)), "db.m6i.xlarge");
        assert_eq!(db_storage_gib(&Sizing::new(1, 1024, 5)), 20);
        assert_eq!(db_storage_gib(&Sizing::new(1, 1024, 100)), 100);
    }
}
