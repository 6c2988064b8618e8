//! Security group management

use crate::error::{AwsError, Result, SdkResultExt, ignore_not_found};
use crate::provider::{AwsProvider, delete_outcome};
use crate::tags::ec2_tag_spec;
use aws_sdk_ec2::types::{IpPermission, IpRange, ResourceType, UserIdGroupPair};
use gitcloud_cloud::rules::ANYWHERE_CIDR;
use gitcloud_cloud::{
    CreatedResource, DeleteOutcome, IngressRule, RemoteStatus, ResourceStatus, RuleSource,
};
use tracing::{info, warn};

/// EC2 form of one ingress rule
pub(crate) fn ip_permission(rule: &IngressRule) -> IpPermission {
    let builder = IpPermission::builder()
        .ip_protocol(rule.protocol.as_str())
        .from_port(i32::from(rule.from_port))
        .to_port(i32::from(rule.to_port));

    let cidr_range = |cidr: &str| {
        IpRange::builder()
            .cidr_ip(cidr)
            .description(&rule.description)
            .build()
    };

    match &rule.source {
        RuleSource::Anywhere => builder.ip_ranges(cidr_range(ANYWHERE_CIDR)),
        RuleSource::Cidr(cidr) => builder.ip_ranges(cidr_range(cidr.as_str())),
        RuleSource::SecurityGroup(group_id) => builder.user_id_group_pairs(
            UserIdGroupPair::builder()
                .group_id(group_id)
                .description(&rule.description)
                .build(),
        ),
    }
    .build()
}

impl AwsProvider {
    /// Create a security group inside `vpc_id` and authorize its ingress rules
    pub(crate) async fn create_security_group(
        &self,
        session_id: &str,
        name: &str,
        vpc_id: &str,
        description: &str,
        rules: &[IngressRule],
    ) -> Result<CreatedResource> {
        let output = self
            .retrying_rejected("create security group", vpc_id, || async {
                self.ec2
                    .create_security_group()
                    .group_name(name)
                    .description(description)
                    .vpc_id(vpc_id)
                    .tag_specifications(ec2_tag_spec(
                        ResourceType::SecurityGroup,
                        session_id,
                        name,
                    ))
                    .send()
                    .await
                    .classify()
            })
            .await?;
        let group_id = output
            .group_id()
            .ok_or(AwsError::MissingField("security group id"))?
            .to_string();
        info!(sg_id = %group_id, name = %name, "Created security group, adding rules");

        if !rules.is_empty() {
            let permissions: Vec<IpPermission> = rules.iter().map(ip_permission).collect();
            let authorized = self
                .retrying_fresh("authorize ingress", &group_id, || async {
                    self.ec2
                        .authorize_security_group_ingress()
                        .group_id(&group_id)
                        .set_ip_permissions(Some(permissions.clone()))
                        .send()
                        .await
                        .classify()
                })
                .await;
            if let Err(e) = authorized {
                warn!(sg_id = %group_id, error = %e, "Failed to add rules, deleting group");
                if let Err(cleanup) = self.delete_security_group(&group_id).await {
                    warn!(sg_id = %group_id, error = %cleanup, "Failed to delete security group");
                }
                return Err(e);
            }
        }

        Ok(CreatedResource {
            id: group_id,
            status: RemoteStatus::new(ResourceStatus::Running),
        })
    }

    /// A security group has no lifecycle: it is usable as soon as it exists
    pub(crate) async fn describe_security_group(&self, group_id: &str) -> Result<RemoteStatus> {
        let output = self
            .ec2
            .describe_security_groups()
            .group_ids(group_id)
            .send()
            .await
            .classify()?;
        let group = output
            .security_groups()
            .first()
            .ok_or_else(|| AwsError::NotFound(group_id.to_string()))?;

        Ok(RemoteStatus::new(ResourceStatus::Running)
            .with_raw("exists")
            .with_attribute("rule_count", group.ip_permissions().len().to_string()))
    }

    /// Delete a security group
    ///
    /// Retries on DependencyViolation, which is what AWS answers while the
    /// network interfaces of a just terminated instance are still releasing.
    pub(crate) async fn delete_security_group(&self, group_id: &str) -> Result<DeleteOutcome> {
        let deleted = self
            .retrying("delete security group", group_id, || async {
                ignore_not_found(
                    self.ec2
                        .delete_security_group()
                        .group_id(group_id)
                        .send()
                        .await
                        .classify(),
                )
            })
            .await?;
        match deleted {
            Some(_) => info!(sg_id = %group_id, "Security group deleted"),
            None => info!(sg_id = %group_id, "Security group already deleted"),
        }
        Ok(delete_outcome(deleted))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gitcloud_cloud::rules::{compute_ingress_rules, database_ingress_rules};

    #[test]
    fn compute_rules_open_to_anywhere() {
        let permissions: Vec<IpPermission> =
            compute_ingress_rules(&[8080]).iter().map(ip_permission).collect();
        assert_eq!(permissions.len(), 2);

        let ssh = &permissions[0];
        assert_eq!(ssh.ip_protocol(), Some("tcp"));
        assert_eq!(ssh.from_port(), Some(22));
        assert_eq!(ssh.to_port(), Some(22));
        assert_eq!(ssh.ip_ranges()[0].cidr_ip(), Some(ANYWHERE_CIDR));
        assert!(ssh.user_id_group_pairs().is_empty());

        assert_eq!(permissions[1].from_port(), Some(8080));
    }

    #[test]
    fn database_rule_references_compute_group() {
        let permissions: Vec<IpPermission> = database_ingress_rules(3306, "sg-compute1")
            .iter()
            .map(ip_permission)
            .collect();
        assert_eq!(permissions.len(), 1);
        let rule = &permissions[0];
        assert_eq!(rule.from_port(), Some(3306));
        assert!(rule.ip_ranges().is_empty());
        assert_eq!(rule.user_id_group_pairs()[0].group_id(), Some("sg-compute1"));
    }

    #[test]
    fn explicit_cidr_source() {
        let rule = IngressRule::tcp(443, RuleSource::Cidr("203.0.113.0/24".into()), "https");
        let permission = ip_permission(&rule);
        assert_eq!(permission.ip_ranges()[0].cidr_ip(), Some("203.0.113.0/24"));
        assert_eq!(permission.ip_ranges()[0].description(), Some("https"));
    }
}
