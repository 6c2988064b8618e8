//! SSH keypairs and database passwords for a session

use crate::error::{CloudError, Result};
use crate::session::set_permissions;
use async_trait::async_trait;
use rand::Rng;
use rand::distributions::Alphanumeric;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::process::Command;

const DATABASE_PASSWORD_LEN: usize = 24;

/// Generated keypair on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshKeyPair {
    pub private_key: PathBuf,
    pub public_key: String,
}

/// Produces the SSH keypair injected into the compute instance
#[async_trait]
pub trait KeyGenerator: Send + Sync {
    /// Make sure a keypair exists at `private_key` (public half at
    /// `<private_key>.pub`) and return it. An existing pair is reused.
    async fn ensure_keypair(&self, private_key: &Path) -> Result<SshKeyPair>;
}

/// Key generator backed by the `ssh-keygen` binary
#[derive(Debug, Clone)]
pub struct SshKeygen {
    comment: String,
}

impl SshKeygen {
    pub fn new(comment: impl Into<String>) -> Self {
        Self {
            comment: comment.into(),
        }
    }
}

impl Default for SshKeygen {
    fn default() -> Self {
        Self::new("gitcloud")
    }
}

fn public_key_path(private_key: &Path) -> PathBuf {
    let mut path = private_key.as_os_str().to_owned();
    path.push(".pub");
    PathBuf::from(path)
}

async fn read_public_key(private_key: &Path) -> Result<Option<String>> {
    if !fs::try_exists(private_key).await? {
        return Ok(None);
    }
    match fs::read_to_string(public_key_path(private_key)).await {
        Ok(content) => Ok(Some(content.trim().to_string())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl KeyGenerator for SshKeygen {
    async fn ensure_keypair(&self, private_key: &Path) -> Result<SshKeyPair> {
        if let Some(public_key) = read_public_key(private_key).await? {
            tracing::debug!(path = %private_key.display(), "Reusing existing SSH keypair");
            return Ok(SshKeyPair {
                private_key: private_key.to_path_buf(),
                public_key,
            });
        }

        // A half-written pair from an interrupted run would make ssh-keygen prompt
        for path in [private_key.to_path_buf(), public_key_path(private_key)] {
            if let Err(e) = fs::remove_file(&path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    return Err(e.into());
                }
            }
        }

        let output = Command::new("ssh-keygen")
            .args(["-t", "ed25519", "-N", "", "-q", "-C", &self.comment, "-f"])
            .arg(private_key)
            .output()
            .await
            .map_err(|e| CloudError::KeyGeneration(format!("failed to run ssh-keygen: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CloudError::KeyGeneration(format!(
                "ssh-keygen exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        set_permissions(private_key, 0o600).await?;

        let public_key = read_public_key(private_key).await?.ok_or_else(|| {
            CloudError::KeyGeneration(format!(
                "ssh-keygen did not produce {}",
                public_key_path(private_key).display()
            ))
        })?;

        tracing::info!(path = %private_key.display(), "Generated SSH keypair");
        Ok(SshKeyPair {
            private_key: private_key.to_path_buf(),
            public_key,
        })
    }
}

/// Random master password for a managed database
///
/// Alphanumeric only: managed database services reject `/`, `@`, `"` and spaces.
pub fn generate_password() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(DATABASE_PASSWORD_LEN)
        .map(char::from)
        .collect()
}
