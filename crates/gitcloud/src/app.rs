//! Process context: home directory, config and provider construction

use anyhow::Context;
use gitcloud_cloud::{CloudProvider, PollSettings, SessionStore};
use gitcloud_cloud_aws::{AwsCredentials, AwsProvider};
use gitcloud_config::GitcloudConfig;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub struct App {
    pub home: PathBuf,
    pub config: GitcloudConfig,
}

impl App {
    /// Resolve the home directory and read its config
    pub fn load(home: Option<PathBuf>) -> anyhow::Result<Self> {
        let home = match home {
            Some(home) => home,
            None => gitcloud_config::home_dir()?,
        };
        let config = GitcloudConfig::load(&home)
            .with_context(|| format!("Failed to load config from {}", home.display()))?;
        debug!(home = %home.display(), region = %config.region, "Loaded configuration");
        Ok(Self { home, config })
    }

    pub fn store(&self) -> SessionStore {
        SessionStore::new(self.config.session_root(&self.home))
    }

    pub fn poll_settings(&self) -> PollSettings {
        let timeouts = self.config.poll;
        PollSettings {
            network_timeout: Duration::from_secs(timeouts.network_secs),
            compute_timeout: Duration::from_secs(timeouts.compute_secs),
            database_timeout: Duration::from_secs(timeouts.database_secs),
            ..PollSettings::default()
        }
    }

    /// AWS provider for `region` with the resolved credential context
    pub async fn provider(&self, region: &str) -> anyhow::Result<Arc<dyn CloudProvider>> {
        let credentials = self
            .config
            .resolve_credentials()
            .context("Failed to resolve AWS credentials")?
            .map(|c| {
                let creds = AwsCredentials::new(c.access_key_id, c.secret_access_key);
                match c.session_token {
                    Some(token) => creds.with_session_token(token),
                    None => creds,
                }
            });
        if credentials.is_none() {
            debug!("No static credentials configured, using the AWS default chain");
        }
        Ok(Arc::new(AwsProvider::new(region, credentials).await))
    }
}
