//! AWS implementation of `CloudProvider`

use crate::context::{AwsContext, AwsCredentials};
use crate::error::{AwsError, Result, SdkResultExt};
use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use gitcloud_cloud::{
    AuthStatus, CloudProvider, CreateSpec, CreatedResource, DeleteOutcome, PollConfig,
    ProviderError, RemoteStatus, ResourceKind, RetryConfig,
};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How long deletes wait for the resource to actually disappear
#[derive(Debug, Clone)]
pub struct DeletionWait {
    pub instance: PollConfig,
    pub database: PollConfig,
}

impl Default for DeletionWait {
    fn default() -> Self {
        Self {
            instance: PollConfig::new(Duration::from_secs(300))
                .with_base_interval(Duration::from_secs(5)),
            database: PollConfig::new(Duration::from_secs(1200))
                .with_base_interval(Duration::from_secs(10))
                .with_max_interval(Duration::from_secs(30)),
        }
    }
}

/// Amazon Web Services provider
pub struct AwsProvider {
    context: AwsContext,
    pub(crate) ec2: aws_sdk_ec2::Client,
    pub(crate) rds: aws_sdk_rds::Client,
    pub(crate) retry: RetryConfig,
    pub(crate) deletion: DeletionWait,
}

impl AwsProvider {
    /// Build a provider from a loaded SDK context
    pub fn from_context(context: AwsContext) -> Self {
        Self {
            ec2: context.ec2_client(),
            rds: context.rds_client(),
            context,
            retry: RetryConfig::default(),
            deletion: DeletionWait::default(),
        }
    }

    /// Load the SDK configuration for `region` and build a provider
    pub async fn new(region: &str, credentials: Option<AwsCredentials>) -> Self {
        Self::from_context(AwsContext::new(region, credentials).await)
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_deletion_wait(mut self, deletion: DeletionWait) -> Self {
        self.deletion = deletion;
        self
    }

    pub fn context(&self) -> &AwsContext {
        &self.context
    }

    fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.retry.initial_delay)
            .with_max_delay(self.retry.max_delay)
            .with_factor(self.retry.backoff_multiplier)
            .with_max_times(self.retry.max_attempts)
            .with_jitter()
    }

    /// Run `op` again while it fails with a retryable error
    ///
    /// Covers throttling and DependencyViolation, which show up on deletes
    /// while ENIs of a terminated instance are still being released.
    pub(crate) async fn retrying<T, F, Fut>(&self, what: &str, resource_id: &str, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        op.retry(self.backoff())
            .when(|e: &AwsError| e.is_retryable())
            .notify(|e: &AwsError, delay: Duration| {
                warn!(
                    resource_id = %resource_id,
                    operation = %what,
                    delay = ?delay,
                    error = %e,
                    "Transient AWS error, retrying"
                );
            })
            .await
    }

    /// Like `retrying`, but also retries NotFound
    ///
    /// Used right after a create, when the fresh id may not be visible to
    /// follow-up calls yet.
    pub(crate) async fn retrying_fresh<T, F, Fut>(
        &self,
        what: &str,
        resource_id: &str,
        op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        op.retry(self.backoff())
            .when(|e: &AwsError| e.is_retryable() || e.is_not_found())
            .notify(|e: &AwsError, delay: Duration| {
                debug!(
                    resource_id = %resource_id,
                    operation = %what,
                    delay = ?delay,
                    error = %e,
                    "Resource not yet consistent, retrying"
                );
            })
            .await
    }

    /// Retry a create that has no idempotency token
    ///
    /// Only errors that prove the request was refused are retried, so a
    /// create that landed without a response is never sent twice.
    pub(crate) async fn retrying_rejected<T, F, Fut>(
        &self,
        what: &str,
        resource_id: &str,
        op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        op.retry(self.backoff())
            .when(|e: &AwsError| e.was_rejected())
            .notify(|e: &AwsError, delay: Duration| {
                debug!(
                    resource_id = %resource_id,
                    operation = %what,
                    delay = ?delay,
                    error = %e,
                    "Create refused, retrying"
                );
            })
            .await
    }

    async fn create_resource(&self, session_id: &str, spec: &CreateSpec) -> Result<CreatedResource> {
        match spec {
            CreateSpec::Network { name, cidr_block } => {
                self.create_network(session_id, name, cidr_block).await
            }
            CreateSpec::Subnet {
                name,
                network_id,
                cidr_block,
                zone_index,
            } => {
                self.create_subnet(session_id, name, network_id, cidr_block, *zone_index)
                    .await
            }
            CreateSpec::SecurityGroup {
                name,
                network_id,
                description,
                rules,
                ..
            } => {
                self.create_security_group(session_id, name, network_id, description, rules)
                    .await
            }
            CreateSpec::ComputeInstance {
                name,
                sizing,
                image,
                gpu,
                subnet_id,
                security_group_id,
                ssh_public_key,
            } => {
                self.create_instance(
                    session_id,
                    crate::instance::InstanceRequest {
                        name,
                        sizing,
                        image,
                        gpu: gpu.as_deref(),
                        subnet_id,
                        security_group_id,
                        ssh_public_key,
                    },
                )
                .await
            }
            CreateSpec::ManagedDatabase {
                name,
                sizing,
                engine,
                engine_version,
                subnet_ids,
                security_group_id,
                master_username,
                master_password,
                port,
            } => {
                self.create_database(
                    session_id,
                    crate::database::DatabaseRequest {
                        identifier: name,
                        sizing,
                        engine,
                        engine_version,
                        subnet_ids,
                        security_group_id,
                        master_username,
                        master_password,
                        port: *port,
                    },
                )
                .await
            }
        }
    }

    async fn describe_resource(&self, kind: ResourceKind, id: &str) -> Result<RemoteStatus> {
        match kind {
            ResourceKind::Network => self.describe_network(id).await,
            ResourceKind::SubnetA | ResourceKind::SubnetB => self.describe_subnet(id).await,
            ResourceKind::ComputeSecurityGroup | ResourceKind::DatabaseSecurityGroup => {
                self.describe_security_group(id).await
            }
            ResourceKind::ComputeInstance => self.describe_instance(id).await,
            ResourceKind::ManagedDatabase => self.describe_database(id).await,
        }
    }

    async fn delete_resource(&self, kind: ResourceKind, id: &str) -> Result<DeleteOutcome> {
        match kind {
            ResourceKind::Network => self.delete_network(id).await,
            ResourceKind::SubnetA | ResourceKind::SubnetB => self.delete_subnet(id).await,
            ResourceKind::ComputeSecurityGroup | ResourceKind::DatabaseSecurityGroup => {
                self.delete_security_group(id).await
            }
            ResourceKind::ComputeInstance => self.delete_instance(id).await,
            ResourceKind::ManagedDatabase => self.delete_database(id).await,
        }
    }
}

impl std::fmt::Debug for AwsProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsProvider")
            .field("region", &self.context.region())
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

/// Outcome of a delete call whose result was passed through `ignore_not_found`
pub(crate) fn delete_outcome<T>(result: Option<T>) -> DeleteOutcome {
    match result {
        Some(_) => DeleteOutcome::Deleted,
        None => DeleteOutcome::AlreadyAbsent,
    }
}

#[async_trait]
impl CloudProvider for AwsProvider {
    fn name(&self) -> &str {
        "aws"
    }

    fn display_name(&self) -> &str {
        "Amazon Web Services"
    }

    fn region(&self) -> &str {
        self.context.region()
    }

    async fn check_auth(&self) -> std::result::Result<AuthStatus, ProviderError> {
        match self.ec2.describe_regions().send().await.classify() {
            Ok(output) => Ok(AuthStatus::ok(format!(
                "{} ({} regions visible)",
                self.context.region(),
                output.regions().len()
            ))),
            Err(e) if e.is_retryable() => Err(e.into()),
            Err(e) => {
                let message = match e.suggestion() {
                    Some(hint) => format!("{} ({})", e, hint),
                    None => e.to_string(),
                };
                Ok(AuthStatus::failed(message))
            }
        }
    }

    async fn create(
        &self,
        session_id: &str,
        spec: &CreateSpec,
    ) -> std::result::Result<CreatedResource, ProviderError> {
        info!(kind = %spec.kind(), name = %spec.name(), "Creating AWS resource");
        let created = self
            .create_resource(session_id, spec)
            .await
            .map_err(ProviderError::from)?;
        info!(kind = %spec.kind(), resource_id = %created.id, "AWS resource created");
        Ok(created)
    }

    async fn describe(
        &self,
        kind: ResourceKind,
        resource_id: &str,
    ) -> std::result::Result<RemoteStatus, ProviderError> {
        self.describe_resource(kind, resource_id)
            .await
            .map_err(|e| ProviderError::from(e).with_resource(resource_id))
    }

    async fn delete(
        &self,
        kind: ResourceKind,
        resource_id: &str,
    ) -> std::result::Result<DeleteOutcome, ProviderError> {
        info!(kind = %kind, resource_id = %resource_id, "Deleting AWS resource");
        self.delete_resource(kind, resource_id)
            .await
            .map_err(|e| ProviderError::from(e).with_resource(resource_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delete_outcome_from_optional_result() {
        assert_eq!(delete_outcome(Some(())), DeleteOutcome::Deleted);
        assert_eq!(delete_outcome::<()>(None), DeleteOutcome::AlreadyAbsent);
    }

    #[tokio::test]
    async fn provider_identity() {
        let provider = AwsProvider::new(
            "eu-central-1",
            Some(AwsCredentials::new("AKID", "SECRET")),
        )
        .await;
        assert_eq!(provider.name(), "aws");
        assert_eq!(provider.display_name(), "Amazon Web Services");
        assert_eq!(CloudProvider::region(&provider), "eu-central-1");
        assert_eq!(provider.retry.max_attempts, RetryConfig::default().max_attempts);
    }

    #[tokio::test]
    async fn retrying_stops_on_permanent_errors() {
        let provider = AwsProvider::new("us-west-1", Some(AwsCredentials::new("AKID", "SECRET")))
            .await
            .with_retry(RetryConfig {
                max_attempts: 3,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
                backoff_multiplier: 2.0,
            });

        let calls = std::sync::atomic::AtomicUsize::new(0);
        let result: Result<()> = provider
            .retrying("delete", "sg-1", || async {
                calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Err(AwsError::Unsupported("nope".into()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);

        let calls = std::sync::atomic::AtomicUsize::new(0);
        let result: Result<()> = provider
            .retrying("delete", "sg-1", || async {
                calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Err(AwsError::DependencyViolation("in use".into()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn creates_without_token_are_not_resent_after_dispatch_errors() {
        let provider = AwsProvider::new("us-west-1", Some(AwsCredentials::new("AKID", "SECRET")))
            .await
            .with_retry(RetryConfig {
                max_attempts: 3,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
                backoff_multiplier: 2.0,
            });

        let calls = std::sync::atomic::AtomicUsize::new(0);
        let result: Result<()> = provider
            .retrying_rejected("create subnet", "vpc-1", || async {
                calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Err(AwsError::Dispatch("request timed out".into()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);

        // A VPC that is not visible yet refuses the request outright
        let calls = std::sync::atomic::AtomicUsize::new(0);
        let result: Result<&str> = provider
            .retrying_rejected("create subnet", "vpc-1", || async {
                match calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst) {
                    0 => Err(AwsError::NotFound("vpc-1".into())),
                    _ => Ok("subnet-1"),
                }
            })
            .await;
        assert_eq!(result.unwrap(), "subnet-1");
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 2);
    }
}
