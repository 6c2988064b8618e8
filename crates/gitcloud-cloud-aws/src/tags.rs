//! AWS resource tags for gitcloud
//!
//! Every resource gitcloud creates carries these tags so that it can be traced
//! back to its session from the AWS console.
//!
//! | Tag Key | Description |
//! |---------|-------------|
//! | `gitcloud:tool` | Static identifier ("gitcloud") |
//! | `gitcloud:session-id` | Session that created the resource |
//! | `gitcloud:created-at` | RFC 3339 time the session was opened |
//! | `Name` | Human readable resource name |

use aws_sdk_ec2::types::{ResourceType, Tag, TagSpecification};
use gitcloud_cloud::session::session_opened_at;

pub const TAG_TOOL: &str = "gitcloud:tool";
pub const TAG_TOOL_VALUE: &str = "gitcloud";
pub const TAG_SESSION_ID: &str = "gitcloud:session-id";
pub const TAG_CREATED_AT: &str = "gitcloud:created-at";
pub const TAG_NAME: &str = "Name";

/// Helper to format creation timestamp for tags
pub fn format_created_at(time: chrono::DateTime<chrono::Utc>) -> String {
    time.to_rfc3339()
}

/// Standard tags as key/value pairs
///
/// The values depend only on the arguments. Idempotent EC2 calls compare
/// request parameters, so a retried or resumed launch must send the same tags.
pub fn standard_tags(session_id: &str, name: &str) -> Vec<(&'static str, String)> {
    let mut tags = vec![
        (TAG_TOOL, TAG_TOOL_VALUE.to_string()),
        (TAG_SESSION_ID, session_id.to_string()),
    ];
    if let Some(opened) = session_opened_at(session_id) {
        tags.push((TAG_CREATED_AT, format_created_at(opened)));
    }
    tags.push((TAG_NAME, name.to_string()));
    tags
}

/// Build an EC2 TagSpecification with the standard gitcloud tags
pub fn ec2_tag_spec(resource_type: ResourceType, session_id: &str, name: &str) -> TagSpecification {
    standard_tags(session_id, name)
        .into_iter()
        .fold(
            TagSpecification::builder().resource_type(resource_type),
            |builder, (key, value)| builder.tags(Tag::builder().key(key).value(value).build()),
        )
        .build()
}

/// Standard gitcloud tags in RDS form
pub fn rds_tags(session_id: &str, name: &str) -> Vec<aws_sdk_rds::types::Tag> {
    standard_tags(session_id, name)
        .into_iter()
        .map(|(key, value)| aws_sdk_rds::types::Tag::builder().key(key).value(value).build())
        .collect()
}
