//! EC2 instance lifecycle operations

use crate::error::{AwsError, Result, SdkResultExt, ignore_not_found};
use crate::provider::AwsProvider;
use crate::sizing;
use crate::tags::ec2_tag_spec;
use aws_sdk_ec2::types::{
    BlockDeviceMapping, EbsBlockDevice, Filter, Instance, InstanceStateName, InstanceType,
    Reservation, ResourceType, VolumeType,
};
use base64::Engine;
use gitcloud_cloud::orchestrator::ssh_user_for;
use gitcloud_cloud::resource::attributes;
use gitcloud_cloud::{
    Architecture, CreatedResource, DeleteOutcome, ImageSelector, ProviderError, RemoteStatus,
    ResourceStatus, Sizing, wait_until_ready,
};
use tracing::{debug, info, warn};

const CANONICAL_OWNER: &str = "099720109477";
const DEBIAN_OWNER: &str = "136693071363";
const AMAZON_OWNER: &str = "amazon";

/// Same client token, different parameters
const IDEMPOTENT_MISMATCH: &str = "IdempotentParameterMismatch";

/// Parameters for one instance launch
pub(crate) struct InstanceRequest<'a> {
    pub name: &'a str,
    pub sizing: &'a Sizing,
    pub image: &'a ImageSelector,
    pub gpu: Option<&'a str>,
    pub subnet_id: &'a str,
    pub security_group_id: &'a str,
    pub ssh_public_key: &'a str,
}

/// `describe_images` parameters for an image selector
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct ImageQuery {
    pub owner: &'static str,
    pub name_pattern: String,
    pub architecture: &'static str,
}

fn ubuntu_codename(version: &str) -> Option<&'static str> {
    match version {
        "20.04" => Some("focal"),
        "22.04" => Some("jammy"),
        "24.04" => Some("noble"),
        _ => None,
    }
}

pub(crate) fn image_query(image: &ImageSelector) -> Result<ImageQuery> {
    let (architecture, debian_arch) = match image.architecture {
        Architecture::X86_64 => ("x86_64", "amd64"),
        Architecture::Arm64 => ("arm64", "arm64"),
    };
    let version = image.version.trim();

    let (owner, name_pattern) = match image.family.to_ascii_lowercase().as_str() {
        "ubuntu" => {
            let codename = ubuntu_codename(version).ok_or_else(|| {
                AwsError::Unsupported(format!("Ubuntu version {}", image.version))
            })?;
            (
                CANONICAL_OWNER,
                format!(
                    "ubuntu/images/hvm-ssd*/ubuntu-{}-{}-{}-server-*",
                    codename, version, debian_arch
                ),
            )
        }
        "debian" => (
            DEBIAN_OWNER,
            format!("debian-{}-{}-*", version, debian_arch),
        ),
        "amazon-linux" | "al2023" => (AMAZON_OWNER, format!("al2023-ami-2023.*-{}", architecture)),
        other => {
            return Err(AwsError::Unsupported(format!("image family {}", other)));
        }
    };

    Ok(ImageQuery {
        owner,
        name_pattern,
        architecture,
    })
}

/// Boot script that authorizes the session key for the image's login user
pub(crate) fn user_data_script(user: &str, public_key: &str) -> String {
    let home = format!("/home/{}", user);
    format!(
        "#!/bin/bash\n\
         set -euo pipefail\n\
         install -d -m 700 -o {user} -g {user} {home}/.ssh\n\
         echo '{key}' >> {home}/.ssh/authorized_keys\n\
         chown {user}:{user} {home}/.ssh/authorized_keys\n\
         chmod 600 {home}/.ssh/authorized_keys\n",
        user = user,
        home = home,
        key = public_key.trim(),
    )
}

pub(crate) fn instance_status(state: Option<&InstanceStateName>) -> ResourceStatus {
    match state {
        Some(InstanceStateName::Pending) => ResourceStatus::Creating,
        Some(InstanceStateName::Running) => ResourceStatus::Running,
        Some(InstanceStateName::Stopping | InstanceStateName::Stopped) => ResourceStatus::Stopped,
        Some(InstanceStateName::ShuttingDown) => ResourceStatus::Deleting,
        Some(InstanceStateName::Terminated) => ResourceStatus::Deleted,
        _ => ResourceStatus::Unknown,
    }
}

/// The live instance among those launched with one client token
pub(crate) fn launched_instance(reservations: &[Reservation]) -> Option<&Instance> {
    reservations
        .iter()
        .flat_map(|r| r.instances())
        .find(|instance| {
            !matches!(
                instance.state().and_then(|s| s.name()),
                Some(InstanceStateName::ShuttingDown | InstanceStateName::Terminated)
            )
        })
}

fn created_instance(instance: &Instance) -> Result<CreatedResource> {
    let instance_id = instance
        .instance_id()
        .ok_or(AwsError::MissingField("instance id"))?
        .to_string();
    let state = instance.state().and_then(|s| s.name());
    let mut status = RemoteStatus::new(instance_status(state))
        .with_raw(state.map(|s| s.as_str()).unwrap_or("pending"));
    if let Some(instance_type) = instance.instance_type() {
        status = status.with_attribute("instance_type", instance_type.as_str());
    }
    Ok(CreatedResource {
        id: instance_id,
        status,
    })
}

impl AwsProvider {
    /// Instance already launched with `client_token`, if any
    async fn find_launched(&self, client_token: &str) -> Result<Option<CreatedResource>> {
        let response = self
            .ec2
            .describe_instances()
            .filters(Filter::builder().name("client-token").values(client_token).build())
            .send()
            .await
            .classify()?;
        launched_instance(response.reservations())
            .map(created_instance)
            .transpose()
    }

    /// Newest image matching the selector, with its root device name
    async fn resolve_image(&self, image: &ImageSelector) -> Result<(String, String)> {
        let query = image_query(image)?;
        let response = self
            .ec2
            .describe_images()
            .owners(query.owner)
            .filters(Filter::builder().name("name").values(&query.name_pattern).build())
            .filters(Filter::builder().name("state").values("available").build())
            .filters(
                Filter::builder()
                    .name("architecture")
                    .values(query.architecture)
                    .build(),
            )
            .send()
            .await
            .classify()?;

        let mut images: Vec<_> = response.images().iter().collect();
        images.sort_by(|a, b| {
            b.creation_date()
                .unwrap_or_default()
                .cmp(a.creation_date().unwrap_or_default())
        });

        let latest = images.first().ok_or_else(|| {
            AwsError::Unsupported(format!(
                "no {} {} image for {} in {}",
                image.family,
                image.version,
                image.architecture,
                self.context().region()
            ))
        })?;
        let ami = latest
            .image_id()
            .ok_or(AwsError::MissingField("image id"))?
            .to_string();
        let root_device = latest.root_device_name().unwrap_or("/dev/sda1").to_string();

        debug!(ami = %ami, pattern = %query.name_pattern, "Resolved image");
        Ok((ami, root_device))
    }

    /// Launch the compute instance
    ///
    /// The resource name doubles as the client token, so a retried launch
    /// returns the instance of the first attempt instead of a second one. An
    /// instance already launched with the token (a resume after a lost
    /// response) is adopted without launching again.
    pub(crate) async fn create_instance(
        &self,
        session_id: &str,
        request: InstanceRequest<'_>,
    ) -> Result<CreatedResource> {
        if let Some(existing) = self.find_launched(request.name).await? {
            warn!(instance_id = %existing.id, "Instance already launched for this session, adopting it");
            return Ok(existing);
        }

        let instance_type =
            sizing::instance_type(request.sizing, request.gpu, request.image.architecture)?;
        let (ami, root_device) = self.resolve_image(request.image).await?;
        let user_data = base64::engine::general_purpose::STANDARD.encode(user_data_script(
            ssh_user_for(&request.image.family),
            request.ssh_public_key,
        ));
        let disk_gb = i32::try_from(request.sizing.disk_gb).unwrap_or(i32::MAX);
        let root_volume = BlockDeviceMapping::builder()
            .device_name(&root_device)
            .ebs(
                EbsBlockDevice::builder()
                    .volume_size(disk_gb)
                    .volume_type(VolumeType::Gp3)
                    .delete_on_termination(true)
                    .build(),
            )
            .build();
        let instance_tags = ec2_tag_spec(ResourceType::Instance, session_id, request.name);
        let volume_tags = ec2_tag_spec(ResourceType::Volume, session_id, request.name);

        info!(
            instance_type = %instance_type,
            ami = %ami,
            subnet_id = %request.subnet_id,
            "Launching instance"
        );

        let launched = self
            .retrying("run instance", request.name, || async {
                self.ec2
                    .run_instances()
                    .client_token(request.name)
                    .image_id(&ami)
                    .instance_type(InstanceType::from(instance_type.as_str()))
                    .min_count(1)
                    .max_count(1)
                    .subnet_id(request.subnet_id)
                    .security_group_ids(request.security_group_id)
                    .user_data(&user_data)
                    .block_device_mappings(root_volume.clone())
                    .tag_specifications(instance_tags.clone())
                    .tag_specifications(volume_tags.clone())
                    .send()
                    .await
                    .classify()
            })
            .await;

        let created = match launched {
            Ok(response) => {
                let instance = response
                    .instances()
                    .first()
                    .ok_or(AwsError::MissingField("instance"))?;
                created_instance(instance)?
            }
            Err(e) if e.code() == Some(IDEMPOTENT_MISMATCH) => {
                warn!(client_token = %request.name, "Launch token already used, adopting its instance");
                self.find_launched(request.name)
                    .await?
                    .ok_or(e)?
            }
            Err(e) => return Err(e),
        };

        info!(instance_id = %created.id, "Instance launched");
        Ok(created)
    }

    pub(crate) async fn describe_instance(&self, instance_id: &str) -> Result<RemoteStatus> {
        let response = self
            .ec2
            .describe_instances()
            .instance_ids(instance_id)
            .send()
            .await
            .classify()?;

        let instance = response
            .reservations()
            .first()
            .and_then(|r| r.instances().first())
            .ok_or_else(|| AwsError::NotFound(instance_id.to_string()))?;
        let state = instance.state().and_then(|s| s.name());

        let mut status = RemoteStatus::new(instance_status(state));
        if let Some(state) = state {
            status = status.with_raw(state.as_str());
        }
        if let Some(ip) = instance.public_ip_address() {
            status = status.with_attribute(attributes::PUBLIC_IP, ip);
        }
        if let Some(ip) = instance.private_ip_address() {
            status = status.with_attribute(attributes::PRIVATE_IP, ip);
        }
        if let Some(reason) = instance.state_reason().and_then(|r| r.message()) {
            status = status.with_attribute("state_reason", reason);
        }
        Ok(status)
    }

    /// Terminate the instance and wait until it is gone
    ///
    /// Its network interface holds on to the subnet and security group until
    /// termination completes, so returning early would fail the next deletes.
    pub(crate) async fn delete_instance(&self, instance_id: &str) -> Result<DeleteOutcome> {
        let terminated = self
            .retrying("terminate instance", instance_id, || async {
                ignore_not_found(
                    self.ec2
                        .terminate_instances()
                        .instance_ids(instance_id)
                        .send()
                        .await
                        .classify(),
                )
            })
            .await?;
        if terminated.is_none() {
            debug!(instance_id = %instance_id, "Instance already gone");
            return Ok(DeleteOutcome::AlreadyAbsent);
        }

        wait_until_ready(
            instance_id,
            || async {
                match self.describe_instance(instance_id).await {
                    Ok(status) => Ok(status),
                    Err(e) if e.is_not_found() => Ok(RemoteStatus::new(ResourceStatus::Deleted)),
                    Err(e) => Err(ProviderError::from(e)),
                }
            },
            |status| status.status == ResourceStatus::Deleted,
            |_| false,
            &self.deletion.instance,
            None,
        )
        .await?;

        info!(instance_id = %instance_id, "Instance terminated");
        Ok(DeleteOutcome::Deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn selector(family: &str, version: &str, architecture: Architecture) -> ImageSelector {
        ImageSelector {
            family: family.to_string(),
            version: version.to_string(),
            architecture,
        }
    }

    #[test]
    fn ubuntu_image_query() {
        let query = image_query(&ImageSelector::default()).unwrap();
        assert_eq!(query.owner, CANONICAL_OWNER);
        assert_eq!(
            query.name_pattern,
            "ubuntu/images/hvm-ssd*/ubuntu-jammy-22.04-amd64-server-*"
        );
        assert_eq!(query.architecture, "x86_64");

        let query = image_query(&selector("Ubuntu", "24.04", Architecture::Arm64)).unwrap();
        assert_eq!(
            query.name_pattern,
            "ubuntu/images/hvm-ssd*/ubuntu-noble-24.04-arm64-server-*"
        );
        assert_eq!(query.architecture, "arm64");
    }

    #[test]
    fn other_families() {
        let query = image_query(&selector("debian", "12", Architecture::X86_64)).unwrap();
        assert_eq!(query.owner, DEBIAN_OWNER);
        assert_eq!(query.name_pattern, "debian-12-amd64-*");

        let query = image_query(&selector("amazon-linux", "2023", Architecture::Arm64)).unwrap();
        assert_eq!(query.name_pattern, "al2023-ami-2023.*-arm64");

        assert!(image_query(&selector("ubuntu", "18.04", Architecture::X86_64)).is_err());
        assert!(image_query(&selector("windows", "2022", Architecture::X86_64)).is_err());
    }

    #[test]
    fn user_data_authorizes_key() {
        let script = user_data_script("ubuntu", "ssh-ed25519 AAAAC3Nza gitcloud\n");
        assert!(script.starts_with("#!/bin/bash\n"));
        assert!(
            script.contains("echo 'ssh-ed25519 AAAAC3Nza gitcloud' >> /home/ubuntu/.ssh/authorized_keys")
        );
        assert!(script.contains("chown ubuntu:ubuntu /home/ubuntu/.ssh/authorized_keys"));
    }

    #[test]
    fn instance_states() {
        assert_eq!(
            instance_status(Some(&InstanceStateName::Pending)),
            ResourceStatus::Creating
        );
        assert_eq!(
            instance_status(Some(&InstanceStateName::Running)),
            ResourceStatus::Running
        );
        assert_eq!(
            instance_status(Some(&InstanceStateName::Stopped)),
            ResourceStatus::Stopped
        );
        assert_eq!(
            instance_status(Some(&InstanceStateName::Terminated)),
            ResourceStatus::Deleted
        );
        assert_eq!(instance_status(None), ResourceStatus::Unknown);
    }

    fn instance(id: &str, state: InstanceStateName) -> Instance {
        Instance::builder()
            .instance_id(id)
            .instance_type(InstanceType::T3Medium)
            .state(aws_sdk_ec2::types::InstanceState::builder().name(state).build())
            .build()
    }

    #[test]
    fn adopts_the_live_instance_of_a_client_token() {
        let reservations = vec![
            Reservation::builder()
                .instances(instance("i-old", InstanceStateName::Terminated))
                .build(),
            Reservation::builder()
                .instances(instance("i-live", InstanceStateName::Pending))
                .build(),
        ];
        let found = launched_instance(&reservations).unwrap();
        assert_eq!(found.instance_id(), Some("i-live"));

        let created = created_instance(found).unwrap();
        assert_eq!(created.id, "i-live");
        assert_eq!(created.status.status, ResourceStatus::Creating);
        assert_eq!(created.status.attribute("instance_type"), Some("t3.medium"));
    }

    #[test]
    fn terminated_launches_are_not_adopted() {
        let reservations = vec![
            Reservation::builder()
                .instances(instance("i-gone", InstanceStateName::ShuttingDown))
                .build(),
        ];
        assert!(launched_instance(&reservations).is_none());
        assert!(launched_instance(&[]).is_none());
    }
}
