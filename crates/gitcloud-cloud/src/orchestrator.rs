//! Provisioning orchestrator
//!
//! Walks the dependency graph of a [`ProvisioningPlan`] node by node. Every
//! successful `create` is appended to the session ledger before the resource is
//! polled, so whatever happens afterwards the resource can be found and torn
//! down. There is no automatic rollback: a failure leaves the session in
//! `partial-failure` for [`crate::teardown::TeardownEngine`] or a later resume.

use crate::error::{CloudError, ProviderError, Result};
use crate::graph::Node;
use crate::keys::{KeyGenerator, SshKeygen, generate_password};
use crate::poll::{PollSettings, wait_until_ready};
use crate::provider::{CloudProvider, CreateSpec, GroupRole};
use crate::requirement::{ProvisioningPlan, ResourceRequirement};
use crate::resource::{RemoteStatus, ResourceKind, attributes};
use crate::rules::{compute_ingress_rules, database_ingress_rules};
use crate::session::{
    ComputeOutputs, DatabaseCredentials, DatabaseOutputs, LedgerEntry, Session, SessionStatus,
    SessionStore,
};
use futures_util::future::try_join_all;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const NETWORK_CIDR: &str = "10.0.0.0/16";
pub const SUBNET_CIDRS: [&str; 2] = ["10.0.1.0/24", "10.0.2.0/24"];
pub const DATABASE_MASTER_USER: &str = "gitcloud_admin";

/// Provider-side name for a session resource, e.g. `gitcloud-session-20250101-120000-compute`
pub fn resource_name(session_id: &str, suffix: &str) -> String {
    format!(
        "gitcloud-{}-{}",
        session_id.replace('_', "-").to_lowercase(),
        suffix
    )
}

/// Login user baked into the image family
pub fn ssh_user_for(family: &str) -> &'static str {
    match family.to_ascii_lowercase().as_str() {
        "ubuntu" => "ubuntu",
        "debian" => "admin",
        _ => "ec2-user",
    }
}

pub struct Orchestrator {
    provider: Arc<dyn CloudProvider>,
    store: SessionStore,
    keys: Arc<dyn KeyGenerator>,
    poll: PollSettings,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(provider: Arc<dyn CloudProvider>, store: SessionStore) -> Self {
        Self {
            provider,
            store,
            keys: Arc::new(SshKeygen::default()),
            poll: PollSettings::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_key_generator(mut self, keys: Arc<dyn KeyGenerator>) -> Self {
        self.keys = keys;
        self
    }

    pub fn with_poll_settings(mut self, poll: PollSettings) -> Self {
        self.poll = poll;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Provision a fresh session for `requirement`
    pub async fn provision(&self, requirement: &ResourceRequirement) -> Result<Session> {
        let plan = ProvisioningPlan::from_requirement(requirement)?;

        let auth = self.provider.check_auth().await?;
        if !auth.authenticated {
            return Err(ProviderError::permanent(format!(
                "{} authentication failed: {}",
                self.provider.display_name(),
                auth.error.as_deref().unwrap_or("unknown error")
            ))
            .into());
        }

        let session = self.store.open(requirement, self.provider.name()).await?;
        info!(
            session_id = %session.id,
            nodes = plan.nodes().len(),
            database = plan.needs_database(),
            "Provisioning session"
        );
        self.run(&session.id, &plan).await
    }

    /// Continue an interrupted or failed session from its ledger
    pub async fn resume(&self, session_id: &str) -> Result<Session> {
        let session = self.store.load(session_id).await?;
        if session.status == SessionStatus::TornDown {
            return Err(CloudError::InvalidSessionState {
                session_id: session_id.to_string(),
                status: session.status,
                action: "resumed",
            });
        }
        let plan = ProvisioningPlan::from_requirement(&session.requirement)?;
        info!(
            session_id,
            recorded = session.ledger.len(),
            "Resuming session"
        );
        self.run(session_id, &plan).await
    }

    async fn run(&self, session_id: &str, plan: &ProvisioningPlan) -> Result<Session> {
        let lock = self.store.acquire_run_lock(session_id).await?;

        // Re-read under the run lock; another run may have finished meanwhile
        let mut session = self.store.load(session_id).await?;
        if session.status == SessionStatus::TornDown {
            return Err(CloudError::InvalidSessionState {
                session_id: session_id.to_string(),
                status: session.status,
                action: "resumed",
            });
        }
        if session.status != SessionStatus::Provisioning {
            session = self
                .store
                .mark_status(session_id, SessionStatus::Provisioning)
                .await?;
        }

        let outcome = self.run_nodes(&mut session, plan).await;

        let result = match outcome {
            Ok(()) => {
                let session = self
                    .store
                    .mark_status(session_id, SessionStatus::Ready)
                    .await?;
                info!(session_id, resources = session.ledger.len(), "Session ready");
                Ok(session)
            }
            Err(err) => {
                warn!(session_id, error = %err, "Provisioning stopped");
                if let Err(e) = self.store.mark_failed(session_id, err.to_string()).await {
                    warn!(session_id, error = %e, "Could not record provisioning failure");
                }
                Err(err)
            }
        };

        lock.release().await?;
        result
    }

    async fn run_nodes(&self, session: &mut Session, plan: &ProvisioningPlan) -> Result<()> {
        for node in plan.nodes() {
            if self.cancel.is_cancelled() {
                info!(session_id = %session.id, next = %node, "Cancelled before next step");
                return Err(CloudError::Cancelled(session.id.clone()));
            }

            if let Some(missing) = node.missing_dependency(&session.kinds()) {
                return Err(provisioning(
                    &session.id,
                    node.kinds()[0],
                    CloudError::MissingDependency(missing),
                ));
            }

            debug!(session_id = %session.id, node = %node, "Starting step");
            match node {
                Node::Network => self.network(session).await?,
                Node::SubnetPair => self.subnet_pair(session).await?,
                Node::ComputeSecurityGroup => self.compute_group(session, plan).await?,
                Node::DatabaseSecurityGroup => self.database_group(session, plan).await?,
                Node::ComputeInstance => self.compute_instance(session, plan).await?,
                Node::ManagedDatabase => self.managed_database(session, plan).await?,
            }
        }
        Ok(())
    }

    async fn network(&self, session: &mut Session) -> Result<()> {
        let spec = CreateSpec::Network {
            name: resource_name(&session.id, "vpc"),
            cidr_block: NETWORK_CIDR.to_string(),
        };
        let id = self.ensure_created(session, &spec).await?;
        self.wait_ready(session, ResourceKind::Network, &id).await?;
        Ok(())
    }

    /// Both subnets are created before either is polled; dependants wait for both
    async fn subnet_pair(&self, session: &mut Session) -> Result<()> {
        let network_id = require(session, ResourceKind::SubnetA, ResourceKind::Network)?;

        let mut created = Vec::with_capacity(SUBNET_CIDRS.len());
        for (zone_index, cidr) in SUBNET_CIDRS.iter().enumerate() {
            // Stop between the two creates; resume finishes the pair
            if zone_index > 0 && self.cancel.is_cancelled() {
                info!(session_id = %session.id, "Cancelled inside the subnet pair");
                return Err(CloudError::Cancelled(session.id.clone()));
            }
            let spec = CreateSpec::Subnet {
                name: resource_name(&session.id, &format!("subnet-{}", zone_index + 1)),
                network_id: network_id.clone(),
                cidr_block: cidr.to_string(),
                zone_index,
            };
            let kind = spec.kind();
            let id = self.ensure_created(session, &spec).await?;
            created.push((kind, id));
        }

        let session_ref: &Session = session;
        try_join_all(
            created
                .iter()
                .map(|(kind, id)| self.wait_ready(session_ref, *kind, id)),
        )
        .await?;
        Ok(())
    }

    async fn compute_group(&self, session: &mut Session, plan: &ProvisioningPlan) -> Result<()> {
        let kind = ResourceKind::ComputeSecurityGroup;
        let spec = CreateSpec::SecurityGroup {
            name: resource_name(&session.id, "compute"),
            role: GroupRole::Compute,
            network_id: require(session, kind, ResourceKind::Network)?,
            description: format!("gitcloud compute access for {}", session.id),
            rules: compute_ingress_rules(&plan.compute.app_ports),
        };
        let id = self.ensure_created(session, &spec).await?;
        self.wait_ready(session, kind, &id).await?;
        Ok(())
    }

    async fn database_group(&self, session: &mut Session, plan: &ProvisioningPlan) -> Result<()> {
        let kind = ResourceKind::DatabaseSecurityGroup;
        let port = plan
            .database
            .as_ref()
            .map(|db| db.port)
            .unwrap_or(crate::requirement::DEFAULT_DATABASE_PORT);
        let compute_group = require(session, kind, ResourceKind::ComputeSecurityGroup)?;
        let spec = CreateSpec::SecurityGroup {
            name: resource_name(&session.id, "database"),
            role: GroupRole::Database,
            network_id: require(session, kind, ResourceKind::Network)?,
            description: format!("gitcloud database access for {}", session.id),
            rules: database_ingress_rules(port, &compute_group),
        };
        let id = self.ensure_created(session, &spec).await?;
        self.wait_ready(session, kind, &id).await?;
        Ok(())
    }

    async fn compute_instance(&self, session: &mut Session, plan: &ProvisioningPlan) -> Result<()> {
        let kind = ResourceKind::ComputeInstance;
        let subnet_id = require(session, kind, ResourceKind::SubnetA)?;
        let security_group_id = require(session, kind, ResourceKind::ComputeSecurityGroup)?;

        let keypair = self
            .keys
            .ensure_keypair(&self.store.ssh_key_path(&session.id))
            .await
            .map_err(|e| provisioning(&session.id, kind, e))?;

        let compute = &plan.compute;
        let spec = CreateSpec::ComputeInstance {
            name: resource_name(&session.id, "compute"),
            sizing: compute.sizing,
            image: compute.image.clone(),
            gpu: compute.gpu.clone(),
            subnet_id,
            security_group_id,
            ssh_public_key: keypair.public_key,
        };
        let id = self.ensure_created(session, &spec).await?;
        let status = self.wait_ready(session, kind, &id).await?;

        let mut outputs = session.outputs.clone();
        outputs.compute = Some(ComputeOutputs {
            public_ip: status.attribute(attributes::PUBLIC_IP).map(str::to_string),
            private_ip: status.attribute(attributes::PRIVATE_IP).map(str::to_string),
            ssh_user: ssh_user_for(&compute.image.family).to_string(),
            ssh_private_key: keypair.private_key,
        });
        *session = self
            .store
            .record_outputs(&session.id, outputs)
            .await
            .map_err(|e| provisioning(&session.id, kind, e))?;
        Ok(())
    }

    async fn managed_database(&self, session: &mut Session, plan: &ProvisioningPlan) -> Result<()> {
        let kind = ResourceKind::ManagedDatabase;
        let Some(database) = &plan.database else {
            return Ok(());
        };
        let subnet_ids = vec![
            require(session, kind, ResourceKind::SubnetA)?,
            require(session, kind, ResourceKind::SubnetB)?,
        ];
        let security_group_id = require(session, kind, ResourceKind::DatabaseSecurityGroup)?;

        // The password must survive a crash between create and the next resume
        let mut credentials = match self
            .store
            .load_credentials(&session.id)
            .await
            .map_err(|e| provisioning(&session.id, kind, e))?
        {
            Some(existing) => existing,
            None => {
                let fresh = DatabaseCredentials {
                    engine: database.engine.clone(),
                    username: DATABASE_MASTER_USER.to_string(),
                    password: generate_password(),
                    port: database.port,
                    host: None,
                };
                self.store
                    .save_credentials(&session.id, &fresh)
                    .await
                    .map_err(|e| provisioning(&session.id, kind, e))?;
                fresh
            }
        };

        let spec = CreateSpec::ManagedDatabase {
            name: resource_name(&session.id, "db"),
            sizing: database.sizing,
            engine: database.engine.clone(),
            engine_version: database.engine_version.clone(),
            subnet_ids,
            security_group_id,
            master_username: credentials.username.clone(),
            master_password: credentials.password.clone(),
            port: credentials.port,
        };
        let id = self.ensure_created(session, &spec).await?;
        let status = self.wait_ready(session, kind, &id).await?;

        credentials.host = status.attribute(attributes::ENDPOINT).map(str::to_string);
        if let Some(port) = status
            .attribute(attributes::PORT)
            .and_then(|p| p.parse().ok())
        {
            credentials.port = port;
        }
        let credentials_file = self
            .store
            .save_credentials(&session.id, &credentials)
            .await
            .map_err(|e| provisioning(&session.id, kind, e))?;

        let mut outputs = session.outputs.clone();
        outputs.database = Some(DatabaseOutputs {
            host: credentials.host.clone(),
            port: credentials.port,
            username: credentials.username.clone(),
            credentials_file,
        });
        *session = self
            .store
            .record_outputs(&session.id, outputs)
            .await
            .map_err(|e| provisioning(&session.id, kind, e))?;
        Ok(())
    }

    /// Create the resource unless the ledger already has it. Returns its id.
    ///
    /// The create call is never raced against cancellation: once submitted its
    /// id must reach the ledger.
    async fn ensure_created(&self, session: &mut Session, spec: &CreateSpec) -> Result<String> {
        let kind = spec.kind();
        if let Some(existing) = session.resource_id(kind) {
            debug!(session_id = %session.id, kind = %kind, resource_id = existing, "Already recorded, verifying");
            return Ok(existing.to_string());
        }

        info!(session_id = %session.id, kind = %kind, name = spec.name(), "Creating resource");
        let created = self
            .provider
            .create(&session.id, spec)
            .await
            .map_err(|e| provisioning(&session.id, kind, e.into()))?;

        *session = self
            .store
            .append_resource(&session.id, LedgerEntry::new(kind, &created.id))
            .await
            .map_err(|e| provisioning(&session.id, kind, e))?;

        debug!(
            session_id = %session.id,
            kind = %kind,
            resource_id = %created.id,
            status = %created.status,
            "Create accepted"
        );
        Ok(created.id)
    }

    async fn wait_ready(
        &self,
        session: &Session,
        kind: ResourceKind,
        resource_id: &str,
    ) -> Result<RemoteStatus> {
        let config = self.poll.for_kind(kind);
        let status = wait_until_ready(
            resource_id,
            || {
                let provider = Arc::clone(&self.provider);
                let resource_id = resource_id.to_string();
                async move { provider.describe(kind, &resource_id).await }
            },
            |s| kind.is_ready(s),
            |s| kind.is_failed(s),
            &config,
            Some(&self.cancel),
        )
        .await
        .map_err(|e| provisioning(&session.id, kind, e.into()))?;

        info!(session_id = %session.id, kind = %kind, resource_id, "Resource ready");
        Ok(status)
    }
}

fn provisioning(session_id: &str, kind: ResourceKind, source: CloudError) -> CloudError {
    match source {
        already @ CloudError::Provisioning { .. } => already,
        source => CloudError::Provisioning {
            session_id: session_id.to_string(),
            kind,
            source: Box::new(source),
        },
    }
}

/// Ledger id of `dependency`, needed to build `kind`
fn require(session: &Session, kind: ResourceKind, dependency: ResourceKind) -> Result<String> {
    session
        .resource_id(dependency)
        .map(str::to_string)
        .ok_or_else(|| provisioning(&session.id, kind, CloudError::MissingDependency(dependency)))
}
