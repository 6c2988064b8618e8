//! Session records
//!
//! Each provisioning run is tracked by a session stored under
//! `<root>/<session_id>/session.json`. The record holds the ordered ledger of
//! every resource created for the session and is the only thing teardown
//! trusts: a resource that is not in the ledger is never deleted.
//!
//! ```text
//! <root>/session_20250101_120000/
//! ├── session.json          current record
//! ├── session.json.backup   previous record
//! ├── ledger.lock           held while the record is mutated
//! ├── run.lock              held for a whole provision/teardown run
//! ├── ssh_key, ssh_key.pub
//! └── credentials.json      database master credentials (0600)
//! ```

use crate::error::{CloudError, Result};
use crate::requirement::ResourceRequirement;
use crate::resource::ResourceKind;
use backon::{BackoffBuilder, ExponentialBuilder};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;

const SESSION_VERSION: u32 = 1;
const SESSION_FILE: &str = "session.json";
const SESSION_BACKUP: &str = "session.json.backup";
const LEDGER_LOCK: &str = "ledger.lock";
const RUN_LOCK: &str = "run.lock";
const CREDENTIALS_FILE: &str = "credentials.json";

/// Private key file name inside the session directory
pub const SSH_KEY_FILE: &str = "ssh_key";

const LEDGER_LOCK_WAIT: Duration = Duration::from_secs(30);
const STALE_LOCK_HOURS: i64 = 1;

/// Time encoded in a session id of the form `session_YYYYMMDD_HHMMSS[_N]`
///
/// `None` for anything else, which also rejects ids that could escape the
/// session root such as `..` or `a/b`.
pub fn session_opened_at(session_id: &str) -> Option<DateTime<Utc>> {
    let rest = session_id.strip_prefix("session_")?;
    let stamp = rest.get(..15)?;
    let suffix = &rest[15..];
    if !suffix.is_empty() {
        let digits = suffix.strip_prefix('_')?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
    }
    if !stamp.bytes().all(|b| b.is_ascii_digit() || b == b'_') {
        return None;
    }
    NaiveDateTime::parse_from_str(stamp, "%Y%m%d_%H%M%S")
        .ok()
        .map(|naive| naive.and_utc())
}

pub fn validate_session_id(session_id: &str) -> Result<()> {
    match session_opened_at(session_id) {
        Some(_) => Ok(()),
        None => Err(CloudError::InvalidSessionId(session_id.to_string())),
    }
}

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionStatus {
    Provisioning,
    Ready,
    PartialFailure,
    TornDown,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Provisioning => write!(f, "provisioning"),
            SessionStatus::Ready => write!(f, "ready"),
            SessionStatus::PartialFailure => write!(f, "partial-failure"),
            SessionStatus::TornDown => write!(f, "torn-down"),
        }
    }
}

/// One created resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub kind: ResourceKind,
    pub resource_id: String,
    pub created_at: DateTime<Utc>,
    pub dependency_rank: u8,
}

impl LedgerEntry {
    pub fn new(kind: ResourceKind, resource_id: impl Into<String>) -> Self {
        Self {
            kind,
            resource_id: resource_id.into(),
            created_at: Utc::now(),
            dependency_rank: kind.dependency_rank(),
        }
    }
}

/// How to reach the compute instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputeOutputs {
    pub public_ip: Option<String>,
    pub private_ip: Option<String>,
    pub ssh_user: String,
    pub ssh_private_key: PathBuf,
}

impl ComputeOutputs {
    pub fn ssh_command(&self) -> Option<String> {
        self.public_ip.as_ref().map(|ip| {
            format!(
                "ssh -i {} {}@{}",
                self.ssh_private_key.display(),
                self.ssh_user,
                ip
            )
        })
    }
}

/// How to reach the managed database
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseOutputs {
    pub host: Option<String>,
    pub port: u16,
    pub username: String,
    pub credentials_file: PathBuf,
}

/// Connection details for a provisioned session. Never consulted by teardown.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionOutputs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compute: Option<ComputeOutputs>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<DatabaseOutputs>,
}

/// Persisted session record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Record format version
    pub version: u32,

    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: SessionStatus,
    pub region: String,
    pub provider: String,

    /// Requirement the session was opened for, so a resume needs no input
    pub requirement: ResourceRequirement,

    /// Created resources in creation order
    pub ledger: Vec<LedgerEntry>,

    #[serde(default)]
    pub outputs: SessionOutputs,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl Session {
    pub fn entry(&self, kind: ResourceKind) -> Option<&LedgerEntry> {
        self.ledger.iter().find(|e| e.kind == kind)
    }

    pub fn resource_id(&self, kind: ResourceKind) -> Option<&str> {
        self.entry(kind).map(|e| e.resource_id.as_str())
    }

    pub fn has(&self, kind: ResourceKind) -> bool {
        self.entry(kind).is_some()
    }

    pub fn kinds(&self) -> Vec<ResourceKind> {
        self.ledger.iter().map(|e| e.kind).collect()
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            status: self.status,
            created_at: self.created_at,
            region: self.region.clone(),
            resource_count: self.ledger.len(),
            last_error: self.last_error.clone(),
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// One line of `sessions` output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub region: String,
    pub resource_count: usize,
    pub last_error: Option<String>,
}

/// Database master credentials, kept next to the session record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseCredentials {
    pub engine: String,
    pub username: String,
    pub password: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

/// Session store rooted at a directory (default `~/.gitcloud/session`)
#[derive(Debug, Clone)]
pub struct SessionStore {
    root: PathBuf,
}

impl SessionStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding everything for one session
    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        self.root.join(session_id)
    }

    fn record_path(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join(SESSION_FILE)
    }

    fn backup_path(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join(SESSION_BACKUP)
    }

    pub fn credentials_path(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join(CREDENTIALS_FILE)
    }

    pub fn ssh_key_path(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join(SSH_KEY_FILE)
    }

    pub async fn exists(&self, session_id: &str) -> bool {
        if session_opened_at(session_id).is_none() {
            return false;
        }
        fs::try_exists(self.record_path(session_id))
            .await
            .unwrap_or(false)
    }

    /// Open a new session with an empty ledger
    ///
    /// The id is derived from the current time. If another session already
    /// claimed it, a numeric suffix is appended. Directory creation is the
    /// claim, so two processes can never get the same id.
    pub async fn open(
        &self,
        requirement: &ResourceRequirement,
        provider: &str,
    ) -> Result<Session> {
        fs::create_dir_all(&self.root).await?;

        let base = format!("session_{}", Utc::now().format("%Y%m%d_%H%M%S"));
        let mut id = base.clone();
        let mut suffix = 0u32;
        loop {
            match fs::create_dir(self.session_dir(&id)).await {
                Ok(()) => break,
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    suffix += 1;
                    id = format!("{}_{}", base, suffix);
                }
                Err(e) => return Err(e.into()),
            }
        }

        let now = Utc::now();
        let session = Session {
            version: SESSION_VERSION,
            id,
            created_at: now,
            updated_at: now,
            status: SessionStatus::Provisioning,
            region: requirement.region.clone(),
            provider: provider.to_string(),
            requirement: requirement.clone(),
            ledger: Vec::new(),
            outputs: SessionOutputs::default(),
            last_error: None,
        };
        self.write_record(&session).await?;

        tracing::info!(session_id = %session.id, region = %session.region, "Opened session");
        Ok(session)
    }

    /// Load a session record
    pub async fn load(&self, session_id: &str) -> Result<Session> {
        validate_session_id(session_id)?;
        let path = self.record_path(session_id);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(CloudError::SessionNotFound(session_id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let session: Session = match serde_json::from_str(&content) {
            Ok(session) => session,
            Err(e) => {
                // A torn write never reaches session.json, but a damaged disk can
                tracing::warn!(session_id, error = %e, "Session record unreadable, trying backup");
                let backup = fs::read_to_string(self.backup_path(session_id))
                    .await
                    .map_err(|_| CloudError::Json(e))?;
                serde_json::from_str(&backup)?
            }
        };

        // Version check
        if session.version > SESSION_VERSION {
            return Err(CloudError::StateError(format!(
                "Session {} has record version {} which is newer than supported version {}",
                session_id, session.version, SESSION_VERSION
            )));
        }

        tracing::debug!(session_id, resources = session.ledger.len(), "Loaded session");
        Ok(session)
    }

    /// Append one ledger entry. Durable before this returns.
    pub async fn append_resource(&self, session_id: &str, entry: LedgerEntry) -> Result<Session> {
        let kind = entry.kind;
        let resource_id = entry.resource_id.clone();
        let session = self
            .update(session_id, move |session| {
                if let Some(existing) = session.entry(entry.kind) {
                    return Err(CloudError::StateError(format!(
                        "{} is already recorded as {}",
                        entry.kind, existing.resource_id
                    )));
                }
                session.ledger.push(entry);
                Ok(())
            })
            .await?;
        tracing::info!(session_id, kind = %kind, resource_id = %resource_id, "Recorded resource");
        Ok(session)
    }

    pub async fn mark_status(&self, session_id: &str, status: SessionStatus) -> Result<Session> {
        let session = self
            .update(session_id, |session| {
                session.status = status;
                if status != SessionStatus::PartialFailure {
                    session.last_error = None;
                }
                Ok(())
            })
            .await?;
        tracing::debug!(session_id, status = %status, "Session status updated");
        Ok(session)
    }

    /// Mark the session `partial-failure` and remember why
    pub async fn mark_failed(&self, session_id: &str, message: impl Into<String>) -> Result<Session> {
        let message = message.into();
        self.update(session_id, |session| {
            session.status = SessionStatus::PartialFailure;
            session.last_error = Some(message);
            Ok(())
        })
        .await
    }

    pub async fn record_outputs(&self, session_id: &str, outputs: SessionOutputs) -> Result<Session> {
        self.update(session_id, |session| {
            session.outputs = outputs;
            Ok(())
        })
        .await
    }

    /// Drop every ledger entry whose kind is not in `kinds`, keeping order.
    /// Only teardown prunes the ledger.
    pub async fn retain_resources(
        &self,
        session_id: &str,
        kinds: &[ResourceKind],
    ) -> Result<Session> {
        self.update(session_id, |session| {
            session.ledger.retain(|e| kinds.contains(&e.kind));
            Ok(())
        })
        .await
    }

    /// Remove all local files of a session
    pub async fn remove(&self, session_id: &str) -> Result<()> {
        validate_session_id(session_id)?;
        let dir = self.session_dir(session_id);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => {
                tracing::info!(session_id, "Removed session directory");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Summaries of every readable session, oldest first
    pub async fn list_all(&self) -> Result<Vec<SessionSummary>> {
        let mut summaries = Vec::new();
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(summaries),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let id = entry.file_name().to_string_lossy().into_owned();
            if session_opened_at(&id).is_none() {
                continue;
            }
            match self.load(&id).await {
                Ok(session) => summaries.push(session.summary()),
                // A directory claimed by `open` whose record is not written yet
                Err(CloudError::SessionNotFound(_)) => {}
                Err(e) => tracing::warn!(session_id = %id, error = %e, "Skipping unreadable session"),
            }
        }

        summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(summaries)
    }

    pub async fn save_credentials(
        &self,
        session_id: &str,
        credentials: &DatabaseCredentials,
    ) -> Result<PathBuf> {
        validate_session_id(session_id)?;
        let path = self.credentials_path(session_id);
        let content = serde_json::to_vec_pretty(credentials)?;
        write_durable(&path, &content, Some(0o600)).await?;
        tracing::debug!(session_id, path = %path.display(), "Saved database credentials");
        Ok(path)
    }

    pub async fn load_credentials(&self, session_id: &str) -> Result<Option<DatabaseCredentials>> {
        validate_session_id(session_id)?;
        match fs::read_to_string(self.credentials_path(session_id)).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Exclusive lock for a whole provisioning or teardown run. Fails fast.
    pub async fn acquire_run_lock(&self, session_id: &str) -> Result<SessionLock> {
        validate_session_id(session_id)?;
        let path = self.session_dir(session_id).join(RUN_LOCK);
        match try_lock(&path).await? {
            Some(lock) => Ok(lock),
            None => {
                let holder = read_lock_info(&path)
                    .await
                    .map(|info| format!("{} since {}", info.holder, info.acquired_at))
                    .unwrap_or_else(|| "another process".to_string());
                Err(CloudError::LockError(format!(
                    "Session {} is in use by {}",
                    session_id, holder
                )))
            }
        }
    }

    /// Lock serializing record mutations; waits with backoff
    async fn acquire_ledger_lock(&self, session_id: &str) -> Result<SessionLock> {
        let path = self.session_dir(session_id).join(LEDGER_LOCK);
        let start = tokio::time::Instant::now();
        let mut delays = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(10))
            .with_max_delay(Duration::from_millis(500))
            .without_max_times()
            .with_jitter()
            .build();

        loop {
            if let Some(lock) = try_lock(&path).await? {
                return Ok(lock);
            }
            if start.elapsed() >= LEDGER_LOCK_WAIT {
                return Err(CloudError::LockError(format!(
                    "Timed out waiting for the ledger lock of session {}",
                    session_id
                )));
            }
            let delay = delays.next().unwrap_or(Duration::from_millis(500));
            tokio::time::sleep(delay).await;
        }
    }

    /// Load, mutate and durably rewrite a record under the ledger lock
    async fn update<F>(&self, session_id: &str, mutate: F) -> Result<Session>
    where
        F: FnOnce(&mut Session) -> Result<()>,
    {
        validate_session_id(session_id)?;
        if !self.exists(session_id).await {
            return Err(CloudError::SessionNotFound(session_id.to_string()));
        }
        let lock = self.acquire_ledger_lock(session_id).await?;

        let mut session = self.load(session_id).await?;
        mutate(&mut session)?;
        session.touch();
        self.write_record(&session).await?;

        lock.release().await?;
        Ok(session)
    }

    async fn write_record(&self, session: &Session) -> Result<()> {
        let path = self.record_path(&session.id);
        let backup = self.backup_path(&session.id);

        // Keep the previous record around
        if fs::try_exists(&path).await? {
            fs::copy(&path, &backup).await?;
        }

        let content = serde_json::to_vec_pretty(session)?;
        write_durable(&path, &content, None).await?;
        Ok(())
    }
}

/// Write to a sibling temp file, fsync, then rename over `path`
async fn write_durable(path: &Path, content: &[u8], mode: Option<u32>) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let mut file = fs::File::create(&tmp).await?;
    if let Some(mode) = mode {
        set_permissions(&tmp, mode).await?;
    }
    file.write_all(content).await?;
    file.sync_all().await?;
    drop(file);

    fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(unix)]
pub(crate) async fn set_permissions(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await?;
    Ok(())
}

#[cfg(not(unix))]
pub(crate) async fn set_permissions(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

/// Lock information
#[derive(Debug, Serialize, Deserialize)]
struct LockInfo {
    holder: String,
    acquired_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pid: Option<u32>,
}

impl LockInfo {
    fn current() -> Self {
        let host = hostname();
        let pid = std::process::id();
        Self {
            holder: format!("{} (pid {})", host, pid),
            acquired_at: Utc::now(),
            host: Some(host),
            pid: Some(pid),
        }
    }

    /// A lock is stale once it is old, or at once when its holder ran on
    /// this host and is no longer alive
    fn is_stale(&self) -> bool {
        let age = Utc::now().signed_duration_since(self.acquired_at);
        if age.num_hours() >= STALE_LOCK_HOURS {
            return true;
        }
        match (&self.host, self.pid) {
            (Some(host), Some(pid)) => *host == hostname() && !is_process_alive(pid),
            _ => false,
        }
    }
}

#[cfg(unix)]
fn hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(not(unix))]
fn hostname() -> String {
    std::env::var("COMPUTERNAME").unwrap_or_else(|_| "unknown".to_string())
}

#[cfg(unix)]
fn is_process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal;
    use nix::unistd::Pid;

    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    // signal 0 only checks existence; EPERM means it exists under another user
    !matches!(signal::kill(Pid::from_raw(pid), None), Err(Errno::ESRCH))
}

#[cfg(not(unix))]
fn is_process_alive(_pid: u32) -> bool {
    true
}

async fn read_lock_info(path: &Path) -> Option<LockInfo> {
    let content = fs::read_to_string(path).await.ok()?;
    serde_json::from_str(&content).ok()
}

/// Try to take a lock file. `None` means someone else holds it.
async fn try_lock(path: &Path) -> Result<Option<SessionLock>> {
    let lock_info = LockInfo::current();

    match fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await
    {
        Ok(mut file) => {
            let content = serde_json::to_vec_pretty(&lock_info)?;
            file.write_all(&content).await?;
            file.flush().await?;
            tracing::trace!(path = %path.display(), "Acquired lock");
            Ok(Some(SessionLock {
                lock_path: path.to_path_buf(),
                released: false,
            }))
        }
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            if let Some(info) = read_lock_info(path).await {
                if info.is_stale() {
                    tracing::warn!(holder = %info.holder, path = %path.display(), "Removing stale lock");
                    match fs::remove_file(path).await {
                        Ok(()) => return Box::pin(try_lock(path)).await,
                        Err(e) if e.kind() == ErrorKind::NotFound => {
                            return Box::pin(try_lock(path)).await;
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
            }
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

/// RAII guard for a session lock file
#[derive(Debug)]
pub struct SessionLock {
    lock_path: PathBuf,
    released: bool,
}

impl SessionLock {
    /// Release the lock
    pub async fn release(mut self) -> Result<()> {
        if !self.released {
            match fs::remove_file(&self.lock_path).await {
                Ok(()) => tracing::trace!(path = %self.lock_path.display(), "Released lock"),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            self.released = true;
        }
        Ok(())
    }
}

impl Drop for SessionLock {
    fn drop(&mut self) {
        if !self.released {
            let _ = std::fs::remove_file(&self.lock_path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_open_and_load() {
        let temp_dir = tempdir().unwrap();
        let store = SessionStore::new(temp_dir.path());

        let session = store
            .open(&ResourceRequirement::default(), "fake")
            .await
            .unwrap();
        assert!(session.id.starts_with("session_"));
        assert_eq!(session.status, SessionStatus::Provisioning);
        assert!(session.ledger.is_empty());

        let loaded = store.load(&session.id).await.unwrap();
        assert_eq!(loaded.id, session.id);
        assert_eq!(loaded.requirement, ResourceRequirement::default());
    }

    #[tokio::test]
    async fn test_ids_are_unique_within_one_second() {
        let temp_dir = tempdir().unwrap();
        let store = SessionStore::new(temp_dir.path());
        let req = ResourceRequirement::default();

        let a = store.open(&req, "fake").await.unwrap();
        let b = store.open(&req, "fake").await.unwrap();
        let c = store.open(&req, "fake").await.unwrap();
        assert_ne!(a.id, b.id);
        assert_ne!(b.id, c.id);
        assert_ne!(a.id, c.id);
    }

    #[tokio::test]
    async fn test_append_preserves_order_and_rejects_duplicates() {
        let temp_dir = tempdir().unwrap();
        let store = SessionStore::new(temp_dir.path());
        let session = store
            .open(&ResourceRequirement::default(), "fake")
            .await
            .unwrap();

        store
            .append_resource(&session.id, LedgerEntry::new(ResourceKind::Network, "vpc-1"))
            .await
            .unwrap();
        let updated = store
            .append_resource(&session.id, LedgerEntry::new(ResourceKind::SubnetA, "subnet-1"))
            .await
            .unwrap();
        assert_eq!(
            updated.kinds(),
            vec![ResourceKind::Network, ResourceKind::SubnetA]
        );
        assert_eq!(updated.ledger[1].dependency_rank, 1);

        let err = store
            .append_resource(&session.id, LedgerEntry::new(ResourceKind::Network, "vpc-2"))
            .await
            .unwrap_err();
        assert!(matches!(err, CloudError::StateError(_)));

        let loaded = store.load(&session.id).await.unwrap();
        assert_eq!(loaded.resource_id(ResourceKind::Network), Some("vpc-1"));
        assert_eq!(loaded.ledger.len(), 2);
        assert!(store.backup_path(&session.id).exists());
    }

    #[tokio::test]
    async fn test_load_missing_session() {
        let temp_dir = tempdir().unwrap();
        let store = SessionStore::new(temp_dir.path());
        let err = store.load("session_19700101_000000").await.unwrap_err();
        assert!(matches!(err, CloudError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn test_newer_version_rejected() {
        let temp_dir = tempdir().unwrap();
        let store = SessionStore::new(temp_dir.path());
        let mut session = store
            .open(&ResourceRequirement::default(), "fake")
            .await
            .unwrap();
        session.version = SESSION_VERSION + 1;
        store.write_record(&session).await.unwrap();

        let err = store.load(&session.id).await.unwrap_err();
        assert!(matches!(err, CloudError::StateError(_)));
    }

    #[tokio::test]
    async fn test_falls_back_to_backup() {
        let temp_dir = tempdir().unwrap();
        let store = SessionStore::new(temp_dir.path());
        let session = store
            .open(&ResourceRequirement::default(), "fake")
            .await
            .unwrap();
        store
            .append_resource(&session.id, LedgerEntry::new(ResourceKind::Network, "vpc-1"))
            .await
            .unwrap();
        std::fs::write(store.record_path(&session.id), "{ not json").unwrap();

        let loaded = store.load(&session.id).await.unwrap();
        assert_eq!(loaded.id, session.id);
    }

    #[tokio::test]
    async fn test_retain_and_mark_failed() {
        let temp_dir = tempdir().unwrap();
        let store = SessionStore::new(temp_dir.path());
        let session = store
            .open(&ResourceRequirement::default(), "fake")
            .await
            .unwrap();
        for (kind, id) in [
            (ResourceKind::Network, "vpc-1"),
            (ResourceKind::SubnetA, "subnet-a"),
            (ResourceKind::SubnetB, "subnet-b"),
        ] {
            store
                .append_resource(&session.id, LedgerEntry::new(kind, id))
                .await
                .unwrap();
        }

        let pruned = store
            .retain_resources(&session.id, &[ResourceKind::Network, ResourceKind::SubnetB])
            .await
            .unwrap();
        assert_eq!(
            pruned.kinds(),
            vec![ResourceKind::Network, ResourceKind::SubnetB]
        );

        let failed = store.mark_failed(&session.id, "boom").await.unwrap();
        assert_eq!(failed.status, SessionStatus::PartialFailure);
        assert_eq!(failed.last_error.as_deref(), Some("boom"));

        let ready = store
            .mark_status(&session.id, SessionStatus::Ready)
            .await
            .unwrap();
        assert!(ready.last_error.is_none());
    }

    #[tokio::test]
    async fn test_list_all_and_remove() {
        let temp_dir = tempdir().unwrap();
        let store = SessionStore::new(temp_dir.path());
        assert!(store.list_all().await.unwrap().is_empty());

        let a = store
            .open(&ResourceRequirement::default(), "fake")
            .await
            .unwrap();
        let b = store
            .open(&ResourceRequirement::default(), "fake")
            .await
            .unwrap();

        let all = store.list_all().await.unwrap();
        assert_eq!(all.len(), 2);

        store.remove(&a.id).await.unwrap();
        store.remove(&a.id).await.unwrap();
        let all = store.list_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, b.id);
    }

    #[tokio::test]
    async fn test_run_lock_fails_fast() {
        let temp_dir = tempdir().unwrap();
        let store = SessionStore::new(temp_dir.path());
        let session = store
            .open(&ResourceRequirement::default(), "fake")
            .await
            .unwrap();

        let lock = store.acquire_run_lock(&session.id).await.unwrap();
        let err = store.acquire_run_lock(&session.id).await.unwrap_err();
        assert!(matches!(err, CloudError::LockError(_)));

        lock.release().await.unwrap();
        let again = store.acquire_run_lock(&session.id).await.unwrap();
        drop(again);
        store.acquire_run_lock(&session.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_stale_lock_is_broken() {
        let temp_dir = tempdir().unwrap();
        let store = SessionStore::new(temp_dir.path());
        let session = store
            .open(&ResourceRequirement::default(), "fake")
            .await
            .unwrap();

        let stale = LockInfo {
            holder: "crashed".to_string(),
            acquired_at: Utc::now() - chrono::Duration::hours(2),
            host: None,
            pid: None,
        };
        std::fs::write(
            store.session_dir(&session.id).join(RUN_LOCK),
            serde_json::to_string(&stale).unwrap(),
        )
        .unwrap();

        store.acquire_run_lock(&session.id).await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_lock_of_dead_local_process_is_broken_at_once() {
        let temp_dir = tempdir().unwrap();
        let store = SessionStore::new(temp_dir.path());
        let session = store
            .open(&ResourceRequirement::default(), "fake")
            .await
            .unwrap();

        let mut child = std::process::Command::new("true").spawn().unwrap();
        let dead_pid = child.id();
        child.wait().unwrap();

        let mut info = LockInfo::current();
        info.pid = Some(dead_pid);
        std::fs::write(
            store.session_dir(&session.id).join(RUN_LOCK),
            serde_json::to_string(&info).unwrap(),
        )
        .unwrap();

        store.acquire_run_lock(&session.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_fresh_lock_of_other_host_is_kept() {
        let temp_dir = tempdir().unwrap();
        let store = SessionStore::new(temp_dir.path());
        let session = store
            .open(&ResourceRequirement::default(), "fake")
            .await
            .unwrap();

        let mut info = LockInfo::current();
        info.host = Some(format!("{}-elsewhere", hostname()));
        info.pid = Some(u32::MAX);
        std::fs::write(
            store.session_dir(&session.id).join(RUN_LOCK),
            serde_json::to_string(&info).unwrap(),
        )
        .unwrap();

        let err = store.acquire_run_lock(&session.id).await.unwrap_err();
        assert!(matches!(err, CloudError::LockError(_)));
    }

    #[test]
    fn test_session_id_format() {
        let opened = session_opened_at("session_20250102_030405").unwrap();
        assert_eq!(opened.to_rfc3339(), "2025-01-02T03:04:05+00:00");
        assert_eq!(
            session_opened_at("session_20250102_030405_3"),
            Some(opened)
        );

        for bad in [
            "../session_20250102_030405",
            "session_20250102_030405/..",
            "session_20250102_030405_",
            "session_20251302_030405",
            "session_2025010_030405",
            "..",
            "",
        ] {
            assert!(session_opened_at(bad).is_none(), "{bad}");
            assert!(matches!(
                validate_session_id(bad),
                Err(CloudError::InvalidSessionId(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_invalid_id_never_touches_the_filesystem() {
        let temp_dir = tempdir().unwrap();
        let root = temp_dir.path().join("session");
        let outside = temp_dir.path().join("outside");
        std::fs::create_dir_all(&outside).unwrap();
        std::fs::write(outside.join(SESSION_FILE), "{}").unwrap();

        let store = SessionStore::new(&root);
        assert!(!store.exists("../outside").await);
        assert!(matches!(
            store.remove("../outside").await,
            Err(CloudError::InvalidSessionId(_))
        ));
        assert!(matches!(
            store.load("../outside").await,
            Err(CloudError::InvalidSessionId(_))
        ));
        assert!(outside.join(SESSION_FILE).exists());
    }

    #[tokio::test]
    async fn test_credentials_round_trip() {
        let temp_dir = tempdir().unwrap();
        let store = SessionStore::new(temp_dir.path());
        let session = store
            .open(&ResourceRequirement::default(), "fake")
            .await
            .unwrap();
        assert!(store.load_credentials(&session.id).await.unwrap().is_none());

        let creds = DatabaseCredentials {
            engine: "mysql".into(),
            username: "admin".into(),
            password: "secret".into(),
            port: 3306,
            host: None,
        };
        let path = store.save_credentials(&session.id, &creds).await.unwrap();
        assert_eq!(store.load_credentials(&session.id).await.unwrap(), Some(creds));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600, "credentials must be mode 600");
        }
    }
}
