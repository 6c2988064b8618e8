//! Teardown engine
//!
//! Deletes the resources recorded in a session ledger, newest first. Only
//! ledger entries are ever deleted.

use crate::error::{CloudError, Result};
use crate::provider::{CloudProvider, DeleteOutcome};
use crate::resource::ResourceKind;
use crate::session::{SessionStatus, SessionStore, validate_session_id};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// What happened to one ledger entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case", tag = "outcome", content = "message")]
pub enum EntryOutcome {
    Deleted,
    AlreadyAbsent,
    Failed(String),
}

impl EntryOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, EntryOutcome::Failed(_))
    }
}

impl std::fmt::Display for EntryOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntryOutcome::Deleted => write!(f, "deleted"),
            EntryOutcome::AlreadyAbsent => write!(f, "already-absent"),
            EntryOutcome::Failed(message) => write!(f, "failed: {}", message),
        }
    }
}

impl From<DeleteOutcome> for EntryOutcome {
    fn from(outcome: DeleteOutcome) -> Self {
        match outcome {
            DeleteOutcome::Deleted => EntryOutcome::Deleted,
            DeleteOutcome::AlreadyAbsent => EntryOutcome::AlreadyAbsent,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryReport {
    pub kind: ResourceKind,
    pub resource_id: String,
    pub outcome: EntryOutcome,
}

/// Result of one teardown run
#[derive(Debug, Clone, Serialize)]
pub struct TeardownReport {
    pub session_id: String,
    /// In deletion order
    pub entries: Vec<EntryReport>,
    pub elapsed: Duration,
    pub status: SessionStatus,
}

impl TeardownReport {
    pub fn is_complete(&self) -> bool {
        self.status == SessionStatus::TornDown
    }

    pub fn failures(&self) -> impl Iterator<Item = &EntryReport> {
        self.entries.iter().filter(|e| !e.outcome.is_success())
    }

    /// Deletion order by kind, for callers that only care about the sequence
    pub fn deleted_kinds(&self) -> Vec<ResourceKind> {
        self.entries.iter().map(|e| e.kind).collect()
    }

    /// Turn a partial teardown into an error
    pub fn into_result(self) -> Result<Self> {
        if self.is_complete() {
            Ok(self)
        } else {
            Err(CloudError::TeardownPartial {
                session_id: self.session_id.clone(),
                remaining: self.failures().count(),
            })
        }
    }
}

pub struct TeardownEngine {
    provider: Arc<dyn CloudProvider>,
    store: SessionStore,
}

impl TeardownEngine {
    pub fn new(provider: Arc<dyn CloudProvider>, store: SessionStore) -> Self {
        Self { provider, store }
    }

    /// Delete every recorded resource of a session in reverse creation order
    ///
    /// A failed delete does not stop the remaining ones. When everything is
    /// gone the session directory is removed; otherwise the ledger is pruned to
    /// what still exists and the session is left `partial-failure`.
    pub async fn teardown(&self, session_id: &str) -> Result<TeardownReport> {
        let start = Instant::now();
        let noop = || TeardownReport {
            session_id: session_id.to_string(),
            entries: Vec::new(),
            elapsed: start.elapsed(),
            status: SessionStatus::TornDown,
        };

        validate_session_id(session_id)?;
        if !self.store.exists(session_id).await {
            info!(session_id, "Session record not found, nothing to tear down");
            return Ok(noop());
        }

        let lock = self.store.acquire_run_lock(session_id).await?;
        let session = match self.store.load(session_id).await {
            Ok(session) => session,
            Err(CloudError::SessionNotFound(_)) => return Ok(noop()),
            Err(e) => return Err(e),
        };

        info!(
            session_id,
            resources = session.ledger.len(),
            status = %session.status,
            "Tearing down session"
        );

        let mut entries = Vec::with_capacity(session.ledger.len());
        for entry in session.ledger.iter().rev() {
            let outcome = match self
                .provider
                .delete(entry.kind, &entry.resource_id)
                .await
            {
                Ok(outcome) => {
                    info!(
                        session_id,
                        kind = %entry.kind,
                        resource_id = %entry.resource_id,
                        outcome = %outcome,
                        "Deleted resource"
                    );
                    EntryOutcome::from(outcome)
                }
                Err(e) => {
                    warn!(
                        session_id,
                        kind = %entry.kind,
                        resource_id = %entry.resource_id,
                        error = %e,
                        "Failed to delete resource"
                    );
                    EntryOutcome::Failed(e.to_string())
                }
            };
            entries.push(EntryReport {
                kind: entry.kind,
                resource_id: entry.resource_id.clone(),
                outcome,
            });
        }

        let remaining: Vec<ResourceKind> = entries
            .iter()
            .filter(|e| !e.outcome.is_success())
            .map(|e| e.kind)
            .collect();

        let status = if remaining.is_empty() {
            self.store
                .mark_status(session_id, SessionStatus::TornDown)
                .await?;
            lock.release().await?;
            self.store.remove(session_id).await?;
            info!(session_id, "Session torn down");
            SessionStatus::TornDown
        } else {
            self.store.retain_resources(session_id, &remaining).await?;
            let kinds: Vec<String> = remaining.iter().map(|k| k.to_string()).collect();
            self.store
                .mark_failed(
                    session_id,
                    format!("teardown left resources behind: {}", kinds.join(", ")),
                )
                .await?;
            lock.release().await?;
            warn!(session_id, remaining = remaining.len(), "Teardown incomplete");
            SessionStatus::PartialFailure
        };

        Ok(TeardownReport {
            session_id: session_id.to_string(),
            entries,
            elapsed: start.elapsed(),
            status,
        })
    }
}
