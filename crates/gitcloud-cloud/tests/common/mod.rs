use async_trait::async_trait;
use gitcloud_cloud::{
    AuthStatus, CloudProvider, CreateSpec, CreatedResource, DeleteOutcome, KeyGenerator,
    PollSettings, ProviderError, RemoteStatus, ResourceKind, ResourceRequirement, ResourceStatus,
    ServiceKind, ServiceRequirement, SessionStore, Sizing, SshKeyPair,
};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// In-memory provider that records every call
#[derive(Default)]
pub struct FakeProvider {
    next_id: Mutex<u32>,
    live: Mutex<HashMap<String, ResourceKind>>,
    polls_left: Mutex<HashMap<String, u32>>,
    creates: Mutex<Vec<ResourceKind>>,
    deletes: Mutex<Vec<(ResourceKind, String)>>,
    fail_create: Mutex<HashMap<ResourceKind, ProviderError>>,
    fail_delete: Mutex<HashMap<ResourceKind, ProviderError>>,
    stuck: Mutex<HashMap<ResourceKind, ResourceStatus>>,
    cancel_on_create: Mutex<Option<(ResourceKind, CancellationToken)>>,
    unauthenticated: Mutex<bool>,
}

#[allow(dead_code)]
impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_create(&self, kind: ResourceKind, error: ProviderError) {
        self.fail_create.lock().unwrap().insert(kind, error);
    }

    pub fn clear_create_failures(&self) {
        self.fail_create.lock().unwrap().clear();
    }

    pub fn fail_delete(&self, kind: ResourceKind, error: ProviderError) {
        self.fail_delete.lock().unwrap().insert(kind, error);
    }

    pub fn clear_delete_failures(&self) {
        self.fail_delete.lock().unwrap().clear();
    }

    /// `describe` reports `status` forever for resources of `kind`
    pub fn stick(&self, kind: ResourceKind, status: ResourceStatus) {
        self.stuck.lock().unwrap().insert(kind, status);
    }

    pub fn cancel_during_create(&self, kind: ResourceKind, token: CancellationToken) {
        *self.cancel_on_create.lock().unwrap() = Some((kind, token));
    }

    pub fn deny_auth(&self) {
        *self.unauthenticated.lock().unwrap() = true;
    }

    /// Pretend someone deleted the resource behind our back
    pub fn forget(&self, resource_id: &str) {
        self.live.lock().unwrap().remove(resource_id);
    }

    pub fn creates(&self) -> Vec<ResourceKind> {
        self.creates.lock().unwrap().clone()
    }

    pub fn deletes(&self) -> Vec<ResourceKind> {
        self.deletes.lock().unwrap().iter().map(|(k, _)| *k).collect()
    }

    pub fn live_count(&self) -> usize {
        self.live.lock().unwrap().len()
    }
}

#[async_trait]
impl CloudProvider for FakeProvider {
    fn name(&self) -> &str {
        "fake"
    }

    fn display_name(&self) -> &str {
        "Fake Cloud"
    }

    fn region(&self) -> &str {
        "test-region-1"
    }

    async fn check_auth(&self) -> Result<AuthStatus, ProviderError> {
        if *self.unauthenticated.lock().unwrap() {
            Ok(AuthStatus::failed("invalid credentials"))
        } else {
            Ok(AuthStatus::ok("fake-account"))
        }
    }

    async fn create(
        &self,
        _session_id: &str,
        spec: &CreateSpec,
    ) -> Result<CreatedResource, ProviderError> {
        let kind = spec.kind();

        if let Some((cancel_kind, token)) = self.cancel_on_create.lock().unwrap().as_ref() {
            if *cancel_kind == kind {
                token.cancel();
            }
        }
        if let Some(err) = self.fail_create.lock().unwrap().get(&kind) {
            return Err(err.clone());
        }

        let id = {
            let mut next = self.next_id.lock().unwrap();
            *next += 1;
            format!("{}-{:04}", kind, *next)
        };
        self.creates.lock().unwrap().push(kind);
        self.live.lock().unwrap().insert(id.clone(), kind);
        self.polls_left.lock().unwrap().insert(id.clone(), 1);

        Ok(CreatedResource {
            id,
            status: RemoteStatus::new(ResourceStatus::Creating),
        })
    }

    async fn describe(
        &self,
        kind: ResourceKind,
        resource_id: &str,
    ) -> Result<RemoteStatus, ProviderError> {
        if !self.live.lock().unwrap().contains_key(resource_id) {
            return Err(ProviderError::transient(format!("{} not found", resource_id))
                .with_resource(resource_id));
        }
        if let Some(status) = self.stuck.lock().unwrap().get(&kind) {
            return Ok(RemoteStatus::new(*status).with_raw("stuck"));
        }

        let mut polls = self.polls_left.lock().unwrap();
        let left = polls.entry(resource_id.to_string()).or_insert(0);
        if *left > 0 {
            *left -= 1;
            return Ok(RemoteStatus::new(ResourceStatus::Creating).with_raw("pending"));
        }

        let status = RemoteStatus::new(ResourceStatus::Running).with_raw("available");
        Ok(match kind {
            ResourceKind::ComputeInstance => status
                .with_attribute("public_ip", "203.0.113.10")
                .with_attribute("private_ip", "10.0.1.10"),
            ResourceKind::ManagedDatabase => status
                .with_attribute("endpoint", "db.example.internal")
                .with_attribute("port", "3306"),
            _ => status,
        })
    }

    async fn delete(
        &self,
        kind: ResourceKind,
        resource_id: &str,
    ) -> Result<DeleteOutcome, ProviderError> {
        self.deletes
            .lock()
            .unwrap()
            .push((kind, resource_id.to_string()));
        if let Some(err) = self.fail_delete.lock().unwrap().get(&kind) {
            return Err(err.clone().with_resource(resource_id));
        }
        match self.live.lock().unwrap().remove(resource_id) {
            Some(_) => Ok(DeleteOutcome::Deleted),
            None => Ok(DeleteOutcome::AlreadyAbsent),
        }
    }
}

/// Key generator that writes placeholder files instead of calling ssh-keygen
pub struct FakeKeys;

#[async_trait]
impl KeyGenerator for FakeKeys {
    async fn ensure_keypair(&self, private_key: &Path) -> gitcloud_cloud::Result<SshKeyPair> {
        let public_key = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIFake gitcloud".to_string();
        std::fs::write(private_key, "PRIVATE KEY")?;
        std::fs::write(private_key.with_extension("pub"), &public_key)?;
        Ok(SshKeyPair {
            private_key: private_key.to_path_buf(),
            public_key,
        })
    }
}

pub struct TestRoot {
    pub root: TempDir,
}

impl TestRoot {
    pub fn new() -> Self {
        Self {
            root: tempfile::tempdir().unwrap(),
        }
    }

    pub fn store(&self) -> SessionStore {
        SessionStore::new(self.root.path().join("session"))
    }
}

/// Millisecond polling so tests run in real time
pub fn fast_poll() -> PollSettings {
    PollSettings {
        network_timeout: Duration::from_secs(5),
        compute_timeout: Duration::from_secs(5),
        database_timeout: Duration::from_secs(5),
        base_interval: Duration::from_millis(1),
        max_interval: Duration::from_millis(5),
    }
}

pub fn compute_only() -> ResourceRequirement {
    ResourceRequirement::new(
        "test-region-1",
        vec![ServiceRequirement {
            kind: ServiceKind::Compute,
            sizing: Sizing::new(2, 4096, 50),
            image: None,
            ports: vec![8080],
            gpu: None,
            engine_version: None,
        }],
    )
}

#[allow(dead_code)]
pub fn with_database() -> ResourceRequirement {
    let mut requirement = compute_only();
    requirement.services.push(ServiceRequirement {
        kind: ServiceKind::Database,
        sizing: Sizing::new(1, 2048, 20),
        image: None,
        ports: Vec::new(),
        gpu: None,
        engine_version: None,
    });
    requirement
}
