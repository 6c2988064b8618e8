//! gitcloud provisioning core
//!
//! This crate turns a resource requirement into a running set of cloud
//! resources and keeps enough state on disk to resume or tear them down later.
//! The cloud API has no transactions, so every created resource is recorded in
//! a per-session ledger before anything else happens to it.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │                  gitcloud CLI                    │
//! │        (provision / resume / teardown)           │
//! └─────────────────┬───────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────┐
//! │               gitcloud-cloud                     │
//! │  ┌──────────────┐  ┌──────────────┐             │
//! │  │ Orchestrator │  │   Teardown   │             │
//! │  └──────┬───────┘  └──────┬───────┘             │
//! │  ┌──────▼───────┐  ┌──────▼───────┐             │
//! │  │   Polling    │  │ SessionStore │             │
//! │  └──────┬───────┘  └──────────────┘             │
//! │  ┌──────▼───────────────────────────────────┐   │
//! │  │  trait CloudProvider { create, ... }      │   │
//! │  └──────────────────────────────────────────┘   │
//! └─────────────────┬───────────────────────────────┘
//!                   │
//!           ┌───────▼───────┐
//!           │ gitcloud-     │
//!           │ cloud-aws     │
//!           └───────────────┘
//! ```

pub mod error;
pub mod graph;
pub mod keys;
pub mod orchestrator;
pub mod poll;
pub mod provider;
pub mod requirement;
pub mod resource;
pub mod rules;
pub mod session;
pub mod teardown;

// Re-exports
pub use error::{CloudError, PollError, PollErrorKind, ProviderError, ProviderErrorKind, Result};
pub use graph::{Node, provisioning_order};
pub use keys::{KeyGenerator, SshKeyPair, SshKeygen, generate_password};
pub use orchestrator::Orchestrator;
pub use poll::{PollConfig, PollSettings, wait_until_ready};
pub use provider::{
    AuthStatus, CloudProvider, CreateSpec, CreatedResource, DeleteOutcome, GroupRole, RetryConfig,
};
pub use requirement::{
    Architecture, ImageSelector, ProvisioningPlan, ResourceRequirement, ServiceKind,
    ServiceRequirement, Sizing,
};
pub use resource::{RemoteStatus, ResourceKind, ResourceStatus};
pub use rules::{IngressRule, Protocol, RuleSource};
pub use session::{
    DatabaseCredentials, LedgerEntry, Session, SessionLock, SessionOutputs, SessionStatus,
    SessionStore, SessionSummary, validate_session_id,
};
pub use teardown::{EntryOutcome, EntryReport, TeardownEngine, TeardownReport};
