//! RDS database operations
//!
//! The database resource owns a DB subnet group named `<identifier>-subnets`
//! spanning both session subnets; it is created and deleted together with
//! the instance.

use crate::error::{AwsError, Result, SdkResultExt, ignore_not_found};
use crate::provider::AwsProvider;
use crate::sizing;
use crate::tags::rds_tags;
use gitcloud_cloud::resource::attributes;
use gitcloud_cloud::{
    CreatedResource, DeleteOutcome, ProviderError, RemoteStatus, ResourceStatus, Sizing,
    wait_until_ready,
};
use tracing::{debug, info, warn};

const INSTANCE_EXISTS: &str = "DBInstanceAlreadyExists";
const SUBNET_GROUP_EXISTS: &str = "DBSubnetGroupAlreadyExists";
const INVALID_INSTANCE_STATE: &str = "InvalidDBInstanceState";

/// Parameters for one database instance
pub(crate) struct DatabaseRequest<'a> {
    pub identifier: &'a str,
    pub sizing: &'a Sizing,
    pub engine: &'a str,
    pub engine_version: &'a str,
    pub subnet_ids: &'a [String],
    pub security_group_id: &'a str,
    pub master_username: &'a str,
    pub master_password: &'a str,
    pub port: u16,
}

pub(crate) fn subnet_group_name(identifier: &str) -> String {
    format!("{}-subnets", identifier)
}

/// RDS `DBInstanceStatus` to a normalized status
pub(crate) fn database_status(raw: &str) -> ResourceStatus {
    match raw {
        "available" => ResourceStatus::Running,
        "creating" | "backing-up" | "modifying" | "configuring-enhanced-monitoring"
        | "configuring-log-exports" | "rebooting" | "starting" | "upgrading"
        | "maintenance" | "renaming" | "resetting-master-credentials" => ResourceStatus::Creating,
        "stopped" | "stopping" => ResourceStatus::Stopped,
        "deleting" => ResourceStatus::Deleting,
        "failed"
        | "storage-full"
        | "inaccessible-encryption-credentials"
        | "restore-error" => ResourceStatus::Error,
        s if s.starts_with("incompatible-") => ResourceStatus::Error,
        _ => ResourceStatus::Unknown,
    }
}

fn is_code(error: &AwsError, code: &str) -> bool {
    error.code() == Some(code)
}

impl AwsProvider {
    /// Create the subnet group and the database instance
    ///
    /// Both calls accept "already exists" as success, which lets a resumed
    /// session adopt an instance whose create response was lost.
    pub(crate) async fn create_database(
        &self,
        session_id: &str,
        request: DatabaseRequest<'_>,
    ) -> Result<CreatedResource> {
        let group_name = subnet_group_name(request.identifier);
        let group = self
            .retrying("create db subnet group", &group_name, || async {
                self.rds
                    .create_db_subnet_group()
                    .db_subnet_group_name(&group_name)
                    .db_subnet_group_description(format!(
                        "gitcloud subnets for {}",
                        request.identifier
                    ))
                    .set_subnet_ids(Some(request.subnet_ids.to_vec()))
                    .set_tags(Some(rds_tags(session_id, &group_name)))
                    .send()
                    .await
                    .classify()
            })
            .await;
        match group {
            Ok(_) => debug!(group = %group_name, "Created DB subnet group"),
            Err(e) if is_code(&e, SUBNET_GROUP_EXISTS) => {
                debug!(group = %group_name, "DB subnet group already exists")
            }
            Err(e) => return Err(e),
        }

        let class = sizing::db_instance_class(request.sizing);
        info!(
            identifier = %request.identifier,
            class = %class,
            engine = %request.engine,
            version = %request.engine_version,
            "Creating database instance"
        );

        let created = self
            .retrying("create db instance", request.identifier, || async {
                self.rds
                    .create_db_instance()
                    .db_instance_identifier(request.identifier)
                    .db_instance_class(&class)
                    .engine(request.engine)
                    .engine_version(request.engine_version)
                    .allocated_storage(sizing::db_storage_gib(request.sizing))
                    .storage_type("gp3")
                    .master_username(request.master_username)
                    .master_user_password(request.master_password)
                    .db_subnet_group_name(&group_name)
                    .vpc_security_group_ids(request.security_group_id)
                    .publicly_accessible(false)
                    .port(i32::from(request.port))
                    .set_tags(Some(rds_tags(session_id, request.identifier)))
                    .send()
                    .await
                    .classify()
            })
            .await;

        match created {
            Ok(output) => {
                let raw = output
                    .db_instance()
                    .and_then(|db| db.db_instance_status())
                    .unwrap_or("creating");
                Ok(CreatedResource {
                    id: request.identifier.to_string(),
                    status: RemoteStatus::new(database_status(raw)).with_raw(raw),
                })
            }
            Err(e) if is_code(&e, INSTANCE_EXISTS) => {
                warn!(identifier = %request.identifier, "Database instance already exists, adopting it");
                let status = self.describe_database(request.identifier).await?;
                Ok(CreatedResource {
                    id: request.identifier.to_string(),
                    status,
                })
            }
            Err(e) => {
                if let Err(cleanup) = self.delete_subnet_group(&group_name).await {
                    warn!(group = %group_name, error = %cleanup, "Failed to delete DB subnet group");
                }
                Err(e)
            }
        }
    }

    pub(crate) async fn describe_database(&self, identifier: &str) -> Result<RemoteStatus> {
        let output = self
            .rds
            .describe_db_instances()
            .db_instance_identifier(identifier)
            .send()
            .await
            .classify()?;
        let db = output
            .db_instances()
            .first()
            .ok_or_else(|| AwsError::NotFound(identifier.to_string()))?;

        let raw = db.db_instance_status().unwrap_or("unknown");
        let mut status = RemoteStatus::new(database_status(raw)).with_raw(raw);
        if let Some(endpoint) = db.endpoint() {
            if let Some(address) = endpoint.address() {
                status = status.with_attribute(attributes::ENDPOINT, address);
            }
            if let Some(port) = endpoint.port() {
                status = status.with_attribute(attributes::PORT, port.to_string());
            }
        }
        Ok(status)
    }

    /// Delete the instance without a final snapshot, wait for it to vanish,
    /// then drop its subnet group
    pub(crate) async fn delete_database(&self, identifier: &str) -> Result<DeleteOutcome> {
        let requested = self
            .retrying("delete db instance", identifier, || async {
                ignore_not_found(
                    self.rds
                        .delete_db_instance()
                        .db_instance_identifier(identifier)
                        .skip_final_snapshot(true)
                        .delete_automated_backups(true)
                        .send()
                        .await
                        .classify(),
                )
            })
            .await;

        let outcome = match requested {
            Ok(Some(_)) => DeleteOutcome::Deleted,
            Ok(None) => DeleteOutcome::AlreadyAbsent,
            // Already deleting from an earlier attempt
            Err(e) if is_code(&e, INVALID_INSTANCE_STATE) => {
                debug!(identifier = %identifier, error = %e, "Database not deletable yet, waiting");
                DeleteOutcome::Deleted
            }
            Err(e) => return Err(e),
        };

        if outcome == DeleteOutcome::Deleted {
            wait_until_ready(
                identifier,
                || async {
                    match self.describe_database(identifier).await {
                        Ok(status) => Ok(status),
                        Err(e) if e.is_not_found() => {
                            Ok(RemoteStatus::new(ResourceStatus::Deleted))
                        }
                        Err(e) => Err(ProviderError::from(e)),
                    }
                },
                |status| status.status == ResourceStatus::Deleted,
                |_| false,
                &self.deletion.database,
                None,
            )
            .await?;
            info!(identifier = %identifier, "Database instance deleted");
        }

        self.delete_subnet_group(&subnet_group_name(identifier))
            .await?;
        Ok(outcome)
    }

    async fn delete_subnet_group(&self, group_name: &str) -> Result<()> {
        let deleted = self
            .retrying("delete db subnet group", group_name, || async {
                ignore_not_found(
                    self.rds
                        .delete_db_subnet_group()
                        .db_subnet_group_name(group_name)
                        .send()
                        .await
                        .classify(),
                )
            })
            .await?;
        if deleted.is_some() {
            debug!(group = %group_name, "Deleted DB subnet group");
        }
        Ok(())
    }
}
