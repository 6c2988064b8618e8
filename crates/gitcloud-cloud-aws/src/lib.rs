//! AWS provider for gitcloud
//!
//! Maps the provider-neutral resource kinds onto AWS:
//!
//! | Kind | AWS resource |
//! |------|--------------|
//! | network | VPC with internet gateway and default route |
//! | subnet-a / subnet-b | Subnets in the first two availability zones |
//! | sg-compute / sg-database | VPC security groups |
//! | compute-instance | EC2 instance (gp3 root volume) |
//! | managed-database | RDS instance plus its DB subnet group |
//!
//! Every resource is tagged with the session id (see [`tags`]).

pub mod context;
mod database;
pub mod error;
mod instance;
mod network;
pub mod provider;
mod security_group;
pub mod sizing;
pub mod tags;

pub use context::{AwsContext, AwsCredentials};
pub use error::AwsError;
pub use provider::{AwsProvider, DeletionWait};
