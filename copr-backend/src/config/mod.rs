//! Backend configuration.
//!
//! Loaded from a TOML file, then selected keys are overridden from the
//! environment (a `.env` file is honored through `dotenvy`).

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::logging::LoggingConfig;
use crate::worker::ManagerConfig;
use crate::{Error, Result};

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/copr/copr-be.toml";

/// Environment variable naming an alternative configuration file.
pub const CONFIG_PATH_ENV: &str = "COPR_BE_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite URL of the shared state database.
    pub url: String,
    /// Channel carrying control messages from the frontend.
    pub control_channel: String,
    /// Control messages older than this are pruned.
    pub message_retention_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:/var/lib/copr/backend-state.db?mode=rwc".to_string(),
            control_channel: "copr:backend:control".to_string(),
            message_retention_secs: 24 * 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FrontendConfig {
    pub base_url: String,
    /// Backend password, sent as basic auth.
    pub auth: Option<String>,
    pub request_timeout_secs: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    /// Oldest `Copr-FE-BE-API-Version` this backend talks to.
    pub min_api_version: u32,
}

impl Default for FrontendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://copr-fe".to_string(),
            auth: None,
            request_timeout_secs: 30,
            max_retries: 3,
            retry_backoff_ms: 500,
            min_api_version: 4,
        }
    }
}

/// Settings of one worker family.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FamilyConfig {
    pub worker_prefix: String,
    pub max_workers: usize,
    pub worker_timeout_start: f64,
    pub worker_timeout_deadcheck: f64,
    /// Program started for every task.
    pub command: String,
}

impl FamilyConfig {
    fn with(prefix: &str, max_workers: usize, command: &str) -> Self {
        Self {
            worker_prefix: prefix.to_string(),
            max_workers,
            worker_timeout_start: 30.0,
            worker_timeout_deadcheck: 60.0,
            command: command.to_string(),
        }
    }

    pub fn manager_config(&self, idle_sleep: Duration) -> ManagerConfig {
        ManagerConfig {
            worker_prefix: self.worker_prefix.clone(),
            max_workers: self.max_workers,
            worker_timeout_start: self.worker_timeout_start,
            worker_timeout_deadcheck: self.worker_timeout_deadcheck,
            idle_sleep,
        }
    }
}

impl Default for FamilyConfig {
    fn default() -> Self {
        Self::with("worker", 8, "true")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkersConfig {
    pub srpm: FamilyConfig,
    pub rpm: FamilyConfig,
    pub action: FamilyConfig,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            srpm: FamilyConfig::with("srpm_build_worker", 10, "copr-backend-process-build"),
            rpm: FamilyConfig::with("rpm_build_worker", 60, "copr-backend-process-build"),
            action: FamilyConfig::with("action_worker", 10, "copr-backend-process-action"),
        }
    }
}

impl WorkersConfig {
    pub fn families(&self) -> [(&'static str, &FamilyConfig); 3] {
        [
            ("srpm", &self.srpm),
            ("rpm", &self.rpm),
            ("action", &self.action),
        ]
    }
}

/// Per-group build limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Running builds per native architecture.
    pub arch: BTreeMap<String, usize>,
    /// Running builds per build tag.
    pub tags: BTreeMap<String, usize>,
    /// Running builds per sandbox label.
    pub sandbox: usize,
    /// Running builds per project owner.
    pub owner: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            arch: BTreeMap::new(),
            tags: BTreeMap::new(),
            sandbox: 10,
            owner: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CreaterepoConfig {
    /// Repository metadata tool.
    pub command: String,
    pub max_in_batch: usize,
    /// Time a requester waits for peers before merging.
    pub batch_wait_ms: u64,
    /// Poll period while waiting on a peer's run.
    pub poll_interval_ms: u64,
    /// An `executing` marker older than this belongs to a crashed run.
    pub stale_execution_secs: f64,
}

impl Default for CreaterepoConfig {
    fn default() -> Self {
        Self {
            command: "copr-repo".to_string(),
            max_in_batch: 100,
            batch_wait_ms: 500,
            poll_interval_ms: 500,
            stale_execution_secs: 6.0 * 3600.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub store: StoreConfig,
    pub frontend: FrontendConfig,
    /// Period of the frontend sync and of one dispatcher round, in seconds.
    pub sleeptime: f64,
    /// Pause of the worker manager loop when idle, in seconds.
    pub idle_sleep_secs: f64,
    /// Root of the results tree.
    pub destdir: PathBuf,
    pub workers: WorkersConfig,
    pub limits: LimitsConfig,
    pub createrepo: CreaterepoConfig,
    pub logging: LoggingConfig,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            frontend: FrontendConfig::default(),
            sleeptime: 5.0,
            idle_sleep_secs: 1.0,
            destdir: PathBuf::from("/var/lib/copr/public_html/results"),
            workers: WorkersConfig::default(),
            limits: LimitsConfig::default(),
            createrepo: CreaterepoConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl BackendConfig {
    /// Load configuration from `path`, or from `$COPR_BE_CONFIG` /
    /// [`DEFAULT_CONFIG_PATH`] when `path` is `None`.
    ///
    /// An explicitly requested file must exist; a missing default file means
    /// built-in defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let (path, explicit) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => match std::env::var(CONFIG_PATH_ENV) {
                Ok(path) => (PathBuf::from(path), true),
                Err(_) => (PathBuf::from(DEFAULT_CONFIG_PATH), false),
            },
        };

        let mut config = if path.exists() {
            info!("Loading configuration from {}", path.display());
            Self::from_toml(&std::fs::read_to_string(&path)?)?
        } else if explicit {
            return Err(Error::config(format!(
                "configuration file {} does not exist",
                path.display()
            )));
        } else {
            warn!(
                "Configuration file {} not found, using defaults",
                path.display()
            );
            Self::default()
        };

        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::config(format!("invalid configuration: {}", e)))
    }

    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("COPR_BE_STORE_URL") {
            self.store.url = url;
        }
        if let Ok(url) = std::env::var("COPR_BE_FRONTEND_URL") {
            self.frontend.base_url = url;
        }
        if let Ok(auth) = std::env::var("COPR_BE_FRONTEND_AUTH") {
            self.frontend.auth = Some(auth);
        }
    }

    pub fn sleeptime(&self) -> Duration {
        Duration::from_secs_f64(self.sleeptime)
    }

    pub fn idle_sleep(&self) -> Duration {
        Duration::from_secs_f64(self.idle_sleep_secs)
    }

    /// Reject settings the daemon can not run with.
    pub fn validate(&self) -> Result<()> {
        if !(self.sleeptime > 0.0) || !(self.idle_sleep_secs > 0.0) {
            return Err(Error::config("sleeptime and idle_sleep_secs must be positive"));
        }

        let mut prefixes = HashSet::new();
        for (name, family) in self.workers.families() {
            let prefix = &family.worker_prefix;
            if prefix.is_empty() {
                return Err(Error::config(format!("workers.{}: empty worker_prefix", name)));
            }
            if prefix.contains(|c: char| matches!(c, ':' | '*' | '?' | '[' | ']')) {
                return Err(Error::config(format!(
                    "workers.{}: worker_prefix '{}' contains ':' or glob characters",
                    name, prefix
                )));
            }
            if !prefixes.insert(prefix.as_str()) {
                return Err(Error::config(format!(
                    "workers.{}: worker_prefix '{}' is used twice",
                    name, prefix
                )));
            }
            if family.max_workers == 0 {
                return Err(Error::config(format!("workers.{}: max_workers must be > 0", name)));
            }
            if !(family.worker_timeout_start > 0.0) || !(family.worker_timeout_deadcheck > 0.0) {
                return Err(Error::config(format!(
                    "workers.{}: worker timeouts must be positive",
                    name
                )));
            }
            if family.command.trim().is_empty() {
                return Err(Error::config(format!("workers.{}: empty command", name)));
            }
        }

        if self.createrepo.max_in_batch < 1 {
            return Err(Error::config("createrepo.max_in_batch must be at least 1"));
        }
        if self.store.url.trim().is_empty() {
            return Err(Error::config("store.url must not be empty"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = BackendConfig::default();
        config.validate().unwrap();
        assert_eq!(config.workers.rpm.max_workers, 60);
        assert_eq!(config.workers.action.worker_prefix, "action_worker");
        assert_eq!(config.createrepo.max_in_batch, 100);
        assert_eq!(config.sleeptime(), Duration::from_secs(5));
    }

    #[test]
    fn test_parse_partial_toml() {
        let config = BackendConfig::from_toml(
            r#"
            sleeptime = 2.5
            destdir = "/srv/results"

            [frontend]
            base_url = "https://copr.example.org"
            auth = "secret"

            [workers.rpm]
            max_workers = 4

            [limits]
            owner = 3
            [limits.arch]
            s390x = 2
            "#,
        )
        .unwrap();

        assert_eq!(config.sleeptime, 2.5);
        assert_eq!(config.frontend.auth.as_deref(), Some("secret"));
        assert_eq!(config.frontend.min_api_version, 4);
        assert_eq!(config.workers.rpm.max_workers, 4);
        assert_eq!(config.workers.rpm.worker_prefix, "rpm_build_worker");
        assert_eq!(config.limits.arch.get("s390x"), Some(&2));
        assert_eq!(config.limits.sandbox, 10);
        config.validate().unwrap();
    }

    #[test]
    fn test_rejects_duplicate_prefix() {
        let mut config = BackendConfig::default();
        config.workers.srpm.worker_prefix = "rpm_build_worker".to_string();
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_rejects_glob_prefix_and_zero_workers() {
        let mut config = BackendConfig::default();
        config.workers.action.worker_prefix = "action*".to_string();
        assert!(config.validate().is_err());

        let mut config = BackendConfig::default();
        config.workers.srpm.max_workers = 0;
        assert!(config.validate().is_err());

        let mut config = BackendConfig::default();
        config.createrepo.max_in_batch = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = BackendConfig::load(Some(&dir.path().join("nope.toml")));
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("copr-be.toml");
        std::fs::write(&path, "[workers.action]\nmax_workers = 3\n").unwrap();
        let config = BackendConfig::load(Some(&path)).unwrap();
        assert_eq!(config.workers.action.max_workers, 3);
    }
}
