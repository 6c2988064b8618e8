//! VPC and subnet operations
//!
//! The network resource is the VPC plus its internet gateway and default
//! route, so the instance gets a reachable public address. The gateway has
//! no ledger entry of its own: it is found through its VPC attachment on
//! delete.

use crate::error::{AwsError, Result, SdkResultExt, ignore_not_found};
use crate::provider::{AwsProvider, delete_outcome};
use crate::tags::ec2_tag_spec;
use aws_sdk_ec2::types::{AttributeBooleanValue, Filter, ResourceType, SubnetState, VpcState};
use gitcloud_cloud::resource::attributes;
use gitcloud_cloud::{CreatedResource, DeleteOutcome, RemoteStatus, ResourceStatus};
use tracing::{debug, info, warn};

const DEFAULT_ROUTE: &str = "0.0.0.0/0";

fn filter(name: &str, value: &str) -> Filter {
    Filter::builder().name(name).values(value).build()
}

fn enabled() -> AttributeBooleanValue {
    AttributeBooleanValue::builder().value(true).build()
}

pub(crate) fn vpc_status(state: Option<&VpcState>) -> ResourceStatus {
    match state {
        Some(VpcState::Available) => ResourceStatus::Running,
        Some(VpcState::Pending) => ResourceStatus::Creating,
        _ => ResourceStatus::Unknown,
    }
}

pub(crate) fn subnet_status(state: Option<&SubnetState>) -> ResourceStatus {
    match state.map(|s| s.as_str()) {
        Some("available") => ResourceStatus::Running,
        Some("pending") => ResourceStatus::Creating,
        Some("unavailable" | "failed" | "failed-insufficient-capacity") => ResourceStatus::Error,
        _ => ResourceStatus::Unknown,
    }
}

impl AwsProvider {
    /// Create the VPC with DNS hostnames, an internet gateway and a default route
    ///
    /// A VPC whose setup fails halfway is deleted again before the error is
    /// returned, because the caller never learns its id.
    pub(crate) async fn create_network(
        &self,
        session_id: &str,
        name: &str,
        cidr_block: &str,
    ) -> Result<CreatedResource> {
        let output = self
            .ec2
            .create_vpc()
            .cidr_block(cidr_block)
            .tag_specifications(ec2_tag_spec(ResourceType::Vpc, session_id, name))
            .send()
            .await
            .classify()?;
        let vpc = output.vpc().ok_or(AwsError::MissingField("vpc"))?;
        let vpc_id = vpc
            .vpc_id()
            .ok_or(AwsError::MissingField("vpc id"))?
            .to_string();
        let status = vpc_status(vpc.state());
        info!(vpc_id = %vpc_id, cidr = %cidr_block, "Created VPC");

        if let Err(e) = self.finish_network(session_id, name, &vpc_id).await {
            warn!(vpc_id = %vpc_id, error = %e, "Network setup failed, deleting VPC");
            if let Err(cleanup) = self.delete_network(&vpc_id).await {
                warn!(vpc_id = %vpc_id, error = %cleanup, "Failed to delete half-built VPC");
            }
            return Err(e);
        }

        Ok(CreatedResource {
            id: vpc_id,
            status: RemoteStatus::new(status)
                .with_raw(vpc.state().map(|s| s.as_str()).unwrap_or("pending"))
                .with_attribute(attributes::CIDR_BLOCK, cidr_block),
        })
    }

    async fn finish_network(&self, session_id: &str, name: &str, vpc_id: &str) -> Result<()> {
        self.retrying_fresh("enable dns hostnames", vpc_id, || async {
            self.ec2
                .modify_vpc_attribute()
                .vpc_id(vpc_id)
                .enable_dns_hostnames(enabled())
                .send()
                .await
                .classify()
        })
        .await?;

        let igw = self
            .ec2
            .create_internet_gateway()
            .tag_specifications(ec2_tag_spec(
                ResourceType::InternetGateway,
                session_id,
                &format!("{}-igw", name),
            ))
            .send()
            .await
            .classify()?;
        let igw_id = igw
            .internet_gateway()
            .and_then(|g| g.internet_gateway_id())
            .ok_or(AwsError::MissingField("internet gateway id"))?
            .to_string();

        let attached = self
            .retrying_fresh("attach internet gateway", &igw_id, || async {
                self.ec2
                    .attach_internet_gateway()
                    .internet_gateway_id(&igw_id)
                    .vpc_id(vpc_id)
                    .send()
                    .await
                    .classify()
            })
            .await;
        if let Err(e) = attached {
            // Not attached yet, so the VPC cleanup would not find it
            if let Err(cleanup) = self
                .ec2
                .delete_internet_gateway()
                .internet_gateway_id(&igw_id)
                .send()
                .await
                .classify()
            {
                warn!(igw_id = %igw_id, error = %cleanup, "Failed to delete internet gateway");
            }
            return Err(e);
        }
        debug!(vpc_id = %vpc_id, igw_id = %igw_id, "Attached internet gateway");

        let route_tables = self
            .ec2
            .describe_route_tables()
            .filters(filter("vpc-id", vpc_id))
            .filters(filter("association.main", "true"))
            .send()
            .await
            .classify()?;
        let route_table_id = route_tables
            .route_tables()
            .first()
            .and_then(|t| t.route_table_id())
            .ok_or(AwsError::MissingField("main route table"))?
            .to_string();

        self.retrying_fresh("create default route", &route_table_id, || async {
            self.ec2
                .create_route()
                .route_table_id(&route_table_id)
                .destination_cidr_block(DEFAULT_ROUTE)
                .gateway_id(&igw_id)
                .send()
                .await
                .classify()
        })
        .await?;

        Ok(())
    }

    pub(crate) async fn describe_network(&self, vpc_id: &str) -> Result<RemoteStatus> {
        let output = self
            .ec2
            .describe_vpcs()
            .vpc_ids(vpc_id)
            .send()
            .await
            .classify()?;
        let vpc = output
            .vpcs()
            .first()
            .ok_or_else(|| AwsError::NotFound(vpc_id.to_string()))?;

        let mut status = RemoteStatus::new(vpc_status(vpc.state()));
        if let Some(state) = vpc.state() {
            status = status.with_raw(state.as_str());
        }
        if let Some(cidr) = vpc.cidr_block() {
            status = status.with_attribute(attributes::CIDR_BLOCK, cidr);
        }
        Ok(status)
    }

    /// Detach and delete the internet gateways, then the VPC
    pub(crate) async fn delete_network(&self, vpc_id: &str) -> Result<DeleteOutcome> {
        let gateways = self
            .ec2
            .describe_internet_gateways()
            .filters(filter("attachment.vpc-id", vpc_id))
            .send()
            .await
            .classify()?;

        for igw_id in gateways
            .internet_gateways()
            .iter()
            .filter_map(|g| g.internet_gateway_id())
        {
            self.retrying("detach internet gateway", igw_id, || async {
                ignore_not_found(
                    self.ec2
                        .detach_internet_gateway()
                        .internet_gateway_id(igw_id)
                        .vpc_id(vpc_id)
                        .send()
                        .await
                        .classify(),
                )
            })
            .await?;
            ignore_not_found(
                self.ec2
                    .delete_internet_gateway()
                    .internet_gateway_id(igw_id)
                    .send()
                    .await
                    .classify(),
            )?;
            debug!(vpc_id = %vpc_id, igw_id = %igw_id, "Deleted internet gateway");
        }

        let deleted = self
            .retrying("delete vpc", vpc_id, || async {
                ignore_not_found(self.ec2.delete_vpc().vpc_id(vpc_id).send().await.classify())
            })
            .await?;
        Ok(delete_outcome(deleted))
    }

    /// Availability zone for the n-th subnet, in name order
    async fn availability_zone(&self, zone_index: usize) -> Result<String> {
        let output = self
            .ec2
            .describe_availability_zones()
            .filters(filter("state", "available"))
            .filters(filter("zone-type", "availability-zone"))
            .send()
            .await
            .classify()?;

        let mut zones: Vec<&str> = output
            .availability_zones()
            .iter()
            .filter_map(|z| z.zone_name())
            .collect();
        zones.sort_unstable();

        zones
            .get(zone_index)
            .map(|z| z.to_string())
            .ok_or_else(|| {
                AwsError::Unsupported(format!(
                    "region {} has only {} available zones",
                    self.context().region(),
                    zones.len()
                ))
            })
    }

    pub(crate) async fn create_subnet(
        &self,
        session_id: &str,
        name: &str,
        vpc_id: &str,
        cidr_block: &str,
        zone_index: usize,
    ) -> Result<CreatedResource> {
        let zone = self.availability_zone(zone_index).await?;

        let output = self
            .retrying_rejected("create subnet", vpc_id, || async {
                self.ec2
                    .create_subnet()
                    .vpc_id(vpc_id)
                    .cidr_block(cidr_block)
                    .availability_zone(&zone)
                    .tag_specifications(ec2_tag_spec(ResourceType::Subnet, session_id, name))
                    .send()
                    .await
                    .classify()
            })
            .await?;
        let subnet = output.subnet().ok_or(AwsError::MissingField("subnet"))?;
        let subnet_id = subnet
            .subnet_id()
            .ok_or(AwsError::MissingField("subnet id"))?
            .to_string();
        info!(subnet_id = %subnet_id, zone = %zone, cidr = %cidr_block, "Created subnet");

        let public = self
            .retrying_fresh("map public ip on launch", &subnet_id, || async {
                self.ec2
                    .modify_subnet_attribute()
                    .subnet_id(&subnet_id)
                    .map_public_ip_on_launch(enabled())
                    .send()
                    .await
                    .classify()
            })
            .await;
        if let Err(e) = public {
            if let Err(cleanup) = self.delete_subnet(&subnet_id).await {
                warn!(subnet_id = %subnet_id, error = %cleanup, "Failed to delete subnet");
            }
            return Err(e);
        }

        Ok(CreatedResource {
            id: subnet_id,
            status: RemoteStatus::new(subnet_status(subnet.state()))
                .with_attribute(attributes::CIDR_BLOCK, cidr_block),
        })
    }

    pub(crate) async fn describe_subnet(&self, subnet_id: &str) -> Result<RemoteStatus> {
        let output = self
            .ec2
            .describe_subnets()
            .subnet_ids(subnet_id)
            .send()
            .await
            .classify()?;
        let subnet = output
            .subnets()
            .first()
            .ok_or_else(|| AwsError::NotFound(subnet_id.to_string()))?;

        let mut status = RemoteStatus::new(subnet_status(subnet.state()));
        if let Some(state) = subnet.state() {
            status = status.with_raw(state.as_str());
        }
        if let Some(cidr) = subnet.cidr_block() {
            status = status.with_attribute(attributes::CIDR_BLOCK, cidr);
        }
        Ok(status)
    }

    pub(crate) async fn delete_subnet(&self, subnet_id: &str) -> Result<DeleteOutcome> {
        let deleted = self
            .retrying("delete subnet", subnet_id, || async {
                ignore_not_found(
                    self.ec2
                        .delete_subnet()
                        .subnet_id(subnet_id)
                        .send()
                        .await
                        .classify(),
                )
            })
            .await?;
        Ok(delete_outcome(deleted))
    }
}
