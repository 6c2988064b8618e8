//! Process-wide configuration for gitcloud
//!
//! Everything lives under one home directory (`~/.gitcloud` unless
//! `GITCLOUD_HOME` says otherwise):
//!
//! ```text
//! ~/.gitcloud/
//! ├── config.json        region, credentials, poll timeouts
//! └── session/<id>/      one directory per provisioning session
//! ```

pub mod error;

pub use error::*;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

pub const HOME_ENV: &str = "GITCLOUD_HOME";
pub const CONFIG_FILE: &str = "config.json";
pub const SESSION_DIR: &str = "session";
pub const DEFAULT_REGION: &str = "us-west-1";

pub const ACCESS_KEY_ENV: &str = "AWS_ACCESS_KEY_ID";
pub const SECRET_KEY_ENV: &str = "AWS_SECRET_ACCESS_KEY";
pub const SESSION_TOKEN_ENV: &str = "AWS_SESSION_TOKEN";

/// Home directory: `GITCLOUD_HOME`, else `~/.gitcloud`
pub fn home_dir() -> Result<PathBuf> {
    if let Some(home) = std::env::var_os(HOME_ENV).filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(home));
    }
    dirs::home_dir()
        .map(|home| home.join(".gitcloud"))
        .ok_or(ConfigError::HomeDirNotFound)
}

/// Static credentials from the config file or the environment
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
}

impl std::fmt::Debug for StaticCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"***")
            .field("session_token", &self.session_token.as_ref().map(|_| "***"))
            .finish()
    }
}

impl StaticCredentials {
    /// Credentials from the AWS environment variables
    ///
    /// Both key variables must be set; one without the other is an error
    /// rather than a silent fallback to the SDK chain.
    pub fn from_env() -> Result<Option<Self>> {
        let read = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());
        match (read(ACCESS_KEY_ENV), read(SECRET_KEY_ENV)) {
            (Some(access_key_id), Some(secret_access_key)) => Ok(Some(Self {
                access_key_id,
                secret_access_key,
                session_token: read(SESSION_TOKEN_ENV),
            })),
            (None, None) => Ok(None),
            (Some(_), None) => Err(ConfigError::IncompleteCredentials(
                "AWS_ACCESS_KEY_ID is set but AWS_SECRET_ACCESS_KEY is not",
            )),
            (None, Some(_)) => Err(ConfigError::IncompleteCredentials(
                "AWS_SECRET_ACCESS_KEY is set but AWS_ACCESS_KEY_ID is not",
            )),
        }
    }
}

/// Poll budgets in seconds, per resource class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollTimeouts {
    pub network_secs: u64,
    pub compute_secs: u64,
    pub database_secs: u64,
}

impl Default for PollTimeouts {
    fn default() -> Self {
        Self {
            network_secs: 120,
            compute_secs: 300,
            database_secs: 900,
        }
    }
}

/// Contents of `config.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GitcloudConfig {
    pub region: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credentials: Option<StaticCredentials>,
    pub poll: PollTimeouts,
    /// Where session directories live; `<home>/session` when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_root: Option<PathBuf>,
}

impl Default for GitcloudConfig {
    fn default() -> Self {
        Self {
            region: DEFAULT_REGION.to_string(),
            credentials: None,
            poll: PollTimeouts::default(),
            session_root: None,
        }
    }
}

impl GitcloudConfig {
    pub fn path(home: &Path) -> PathBuf {
        home.join(CONFIG_FILE)
    }

    /// Load `<home>/config.json`; a missing file yields the defaults
    pub fn load(home: &Path) -> Result<Self> {
        let path = Self::path(home);
        if !path.exists() {
            debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)?;
        serde_json::from_str(&content).map_err(|source| ConfigError::Parse { path, source })
    }

    /// Write `<home>/config.json`, readable by the owner only
    pub fn save(&self, home: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(home)?;
        let path = Self::path(home);
        std::fs::write(&path, serde_json::to_string_pretty(self)?)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(path)
    }

    pub fn session_root(&self, home: &Path) -> PathBuf {
        self.session_root
            .clone()
            .unwrap_or_else(|| home.join(SESSION_DIR))
    }

    /// Credentials to hand to the provider: the environment wins over the
    /// file, `None` means the SDK default chain
    pub fn resolve_credentials(&self) -> Result<Option<StaticCredentials>> {
        match StaticCredentials::from_env()? {
            Some(creds) => {
                debug!("Using credentials from environment");
                Ok(Some(creds))
            }
            None => Ok(self.credentials.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn creds(key: &str) -> StaticCredentials {
        StaticCredentials {
            access_key_id: key.to_string(),
            secret_access_key: "secret".to_string(),
            session_token: None,
        }
    }

    #[test]
    #[serial]
    fn test_home_dir_from_env() {
        temp_env::with_var(HOME_ENV, Some("/tmp/gitcloud-home"), || {
            assert_eq!(home_dir().unwrap(), PathBuf::from("/tmp/gitcloud-home"));
        });
    }

    #[test]
    #[serial]
    fn test_home_dir_default() {
        temp_env::with_var_unset(HOME_ENV, || {
            let home = home_dir().unwrap();
            assert!(home.ends_with(".gitcloud"));
        });
    }

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = GitcloudConfig::load(dir.path()).unwrap();
        assert_eq!(config, GitcloudConfig::default());
        assert_eq!(config.region, "us-west-1");
        assert_eq!(config.poll.database_secs, 900);
        assert_eq!(config.session_root(dir.path()), dir.path().join("session"));
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            r#"{"region": "eu-west-1", "poll": {"compute_secs": 60}}"#,
        )
        .unwrap();

        let config = GitcloudConfig::load(dir.path()).unwrap();
        assert_eq!(config.region, "eu-west-1");
        assert_eq!(config.poll.compute_secs, 60);
        assert_eq!(config.poll.network_secs, 120);
        assert!(config.credentials.is_none());
    }

    #[test]
    fn test_invalid_file_names_path() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "{ not json").unwrap();

        let err = GitcloudConfig::load(dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains(CONFIG_FILE));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let home = dir.path().join("home");
        let config = GitcloudConfig {
            region: "ap-northeast-1".to_string(),
            credentials: Some(creds("AKIDFILE")),
            session_root: Some(dir.path().join("sessions")),
            ..Default::default()
        };

        let path = config.save(&home).unwrap();
        assert_eq!(GitcloudConfig::load(&home).unwrap(), config);
        assert_eq!(config.session_root(&home), dir.path().join("sessions"));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    #[serial]
    fn test_environment_overrides_file_credentials() {
        let config = GitcloudConfig {
            credentials: Some(creds("AKIDFILE")),
            ..Default::default()
        };

        temp_env::with_vars(
            [
                (ACCESS_KEY_ENV, Some("AKIDENV")),
                (SECRET_KEY_ENV, Some("envsecret")),
                (SESSION_TOKEN_ENV, Some("token")),
            ],
            || {
                let resolved = config.resolve_credentials().unwrap().unwrap();
                assert_eq!(resolved.access_key_id, "AKIDENV");
                assert_eq!(resolved.session_token.as_deref(), Some("token"));
            },
        );

        temp_env::with_vars_unset([ACCESS_KEY_ENV, SECRET_KEY_ENV, SESSION_TOKEN_ENV], || {
            let resolved = config.resolve_credentials().unwrap().unwrap();
            assert_eq!(resolved.access_key_id, "AKIDFILE");
            assert!(
                GitcloudConfig::default()
                    .resolve_credentials()
                    .unwrap()
                    .is_none()
            );
        });
    }

    #[test]
    #[serial]
    fn test_half_set_environment_is_an_error() {
        temp_env::with_vars(
            [
                (ACCESS_KEY_ENV, Some("AKIDENV")),
                (SECRET_KEY_ENV, None),
            ],
            || {
                let err = StaticCredentials::from_env().unwrap_err();
                assert!(matches!(err, ConfigError::IncompleteCredentials(_)));
            },
        );
    }

    #[test]
    fn test_credentials_debug_is_redacted() {
        let debug = format!("{:?}", creds("AKID"));
        assert!(debug.contains("AKID"));
        assert!(!debug.contains("secret\""));
    }
}
