//! Configuration for a reconciliation run.
//!
//! Every component receives its paths and timings from a [`ReconcileConfig`]
//! value; nothing reads ambient global state.
//!
//! ## Layout
//!
//! ```text
//! <workspace_root>/
//! ├── reconcile.toml          # optional overrides
//! ├── state/{worker_id}.json  # one record per worker
//! └── logs/
//!     ├── reconciliation.log  # one JSON report per pass
//!     └── reconcile-state.log.YYYY-MM-DD
//! ```
//!
//! Tests use [`ReconcileConfig::with_root`] with a temp directory.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{ReconcileError, Result};
use crate::identity::{default_rules, IdentityRule};

pub const DEFAULT_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_LOCK_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_LOCK_POLL_MS: u64 = 50;
pub const CONFIG_FILE_NAME: &str = "reconcile.toml";

const DEFAULT_WORKSPACE_RELATIVE_PATH: &str = ".openclaw/workspace";

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    workspace_root: PathBuf,
    state_dir: PathBuf,
    report_log: PathBuf,
    pub interval: Duration,
    pub lock_timeout: Duration,
    pub lock_poll: Duration,
    pub identity_rules: Vec<IdentityRule>,
}

/// On-disk shape of `reconcile.toml`. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    state_dir: Option<PathBuf>,
    report_log: Option<PathBuf>,
    interval_secs: Option<u64>,
    lock_timeout_secs: Option<u64>,
    rules: Option<Vec<IdentityRule>>,
}

impl ReconcileConfig {
    /// Defaults rooted at `root`: `root/state`, `root/logs/reconciliation.log`.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let workspace_root = root.into();
        ReconcileConfig {
            state_dir: workspace_root.join("state"),
            report_log: workspace_root.join("logs").join("reconciliation.log"),
            workspace_root,
            interval: Duration::from_secs(DEFAULT_INTERVAL_SECS),
            lock_timeout: Duration::from_secs(DEFAULT_LOCK_TIMEOUT_SECS),
            lock_poll: Duration::from_millis(DEFAULT_LOCK_POLL_MS),
            identity_rules: default_rules(),
        }
    }

    /// Defaults rooted at `~/.openclaw/workspace`.
    pub fn from_home() -> Result<Self> {
        let home = dirs::home_dir().ok_or(ReconcileError::HomeDirNotFound)?;
        Ok(Self::with_root(home.join(DEFAULT_WORKSPACE_RELATIVE_PATH)))
    }

    /// Loads overrides from `path`, or from `<root>/reconcile.toml` when `path`
    /// is `None`. A missing file yields the defaults.
    pub fn load(root: impl Into<PathBuf>, path: Option<&Path>) -> Result<Self> {
        let mut config = Self::with_root(root);
        let config_path = match path {
            Some(path) => path.to_path_buf(),
            None => config.workspace_root.join(CONFIG_FILE_NAME),
        };

        if !config_path.exists() {
            return Ok(config);
        }

        let content = fs_err::read_to_string(&config_path)
            .map_err(|err| ReconcileError::io("Failed to read reconcile config", err))?;
        let file: ConfigFile =
            toml::from_str(&content).map_err(|err| ReconcileError::ConfigMalformed {
                path: config_path.clone(),
                details: err.to_string(),
            })?;
        config.apply(file, &config_path)?;
        Ok(config)
    }

    fn apply(&mut self, file: ConfigFile, config_path: &Path) -> Result<()> {
        // Relative paths are resolved against the workspace root.
        if let Some(state_dir) = file.state_dir {
            self.state_dir = self.workspace_root.join(state_dir);
        }
        if let Some(report_log) = file.report_log {
            self.report_log = self.workspace_root.join(report_log);
        }
        if let Some(secs) = file.interval_secs {
            if secs == 0 {
                return Err(ReconcileError::ConfigMalformed {
                    path: config_path.to_path_buf(),
                    details: "interval_secs must be greater than zero".to_string(),
                });
            }
            self.interval = Duration::from_secs(secs);
        }
        if let Some(secs) = file.lock_timeout_secs {
            self.lock_timeout = Duration::from_secs(secs);
        }
        if let Some(rules) = file.rules {
            self.identity_rules = rules;
        }
        Ok(())
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn report_log(&self) -> &Path {
        &self.report_log
    }

    /// Directory for the rolling diagnostic log.
    pub fn log_dir(&self) -> PathBuf {
        self.workspace_root.join("logs")
    }

    /// Path of the record for `worker_id`.
    pub fn record_path(&self, worker_id: &str) -> PathBuf {
        self.state_dir.join(format!("{}.json", worker_id))
    }

    pub fn with_state_dir(mut self, state_dir: impl Into<PathBuf>) -> Self {
        self.state_dir = state_dir.into();
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    pub fn with_identity_rules(mut self, rules: Vec<IdentityRule>) -> Self {
        self.identity_rules = rules;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_root_derives_paths() {
        let config = ReconcileConfig::with_root("/ws");
        assert_eq!(config.state_dir(), Path::new("/ws/state"));
        assert_eq!(config.report_log(), Path::new("/ws/logs/reconciliation.log"));
        assert_eq!(config.record_path("mm_1h"), PathBuf::from("/ws/state/mm_1h.json"));
        assert_eq!(config.interval, Duration::from_secs(300));
        assert_eq!(config.identity_rules, default_rules());
    }

    #[test]
    fn load_defaults_when_file_missing() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let config = ReconcileConfig::load(temp_dir.path(), None).expect("load config");
        assert_eq!(config.state_dir(), temp_dir.path().join("state"));
        assert_eq!(config.lock_timeout, Duration::from_secs(DEFAULT_LOCK_TIMEOUT_SECS));
    }

    #[test]
    fn load_parses_overrides_and_rules() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        fs_err::write(
            temp_dir.path().join(CONFIG_FILE_NAME),
            r#"
state_dir = "bots/state"
interval_secs = 60
lock_timeout_secs = 2

[[rules]]
worker_id = "grid_eth"
pattern = "grid.*eth"

[[rules]]
worker_id = "arb"
all = ["arbitrage"]
any = ["python", "node"]
"#,
        )
        .expect("write config");

        let config = ReconcileConfig::load(temp_dir.path(), None).expect("load config");
        assert_eq!(config.state_dir(), temp_dir.path().join("bots/state"));
        assert_eq!(config.interval, Duration::from_secs(60));
        assert_eq!(config.lock_timeout, Duration::from_secs(2));
        assert_eq!(config.identity_rules.len(), 2);
        assert_eq!(config.identity_rules[0].worker_id, "grid_eth");
        assert_eq!(config.identity_rules[1].any, vec!["python", "node"]);
    }

    #[test]
    fn load_rejects_malformed_file() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("custom.toml");
        fs_err::write(&path, "interval_secs = \"soon\"").expect("write config");

        let err = ReconcileConfig::load(temp_dir.path(), Some(&path)).unwrap_err();
        assert!(matches!(err, ReconcileError::ConfigMalformed { .. }));
    }

    #[test]
    fn load_rejects_zero_interval() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        fs_err::write(temp_dir.path().join(CONFIG_FILE_NAME), "interval_secs = 0")
            .expect("write config");
        assert!(ReconcileConfig::load(temp_dir.path(), None).is_err());
    }
}
