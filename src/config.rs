//! Runtime configuration: persistent state layout, retention, and engine
//! tunables. Defaults match SPEC_FULL.md §6; every path is overridable
//! through an environment variable so the crate is testable without root.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

const PRODUCT: &str = "transactional-installer";

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct InstallerConfig {
    /// Root state directory (`/var/lib/<product>` by default).
    pub state_dir: PathBuf,
    /// SQLite journal path.
    pub db_path: PathBuf,
    /// Directory holding snapshot artifacts (file backups etc).
    pub snapshot_dir: PathBuf,
    /// Append-only installer log path.
    pub log_path: PathBuf,
    /// Advisory lockfile path.
    pub lock_path: PathBuf,
    /// Default retention window for `cleanup_old_transactions`.
    pub retention_days: i64,
    /// Per-step deadline; `None` means unbounded.
    pub step_timeout_secs: Option<u64>,
}

impl Default for InstallerConfig {
    fn default() -> Self {
        let state_dir = PathBuf::from(format!("/var/lib/{PRODUCT}"));
        Self {
            db_path: state_dir.join("transactions.db"),
            snapshot_dir: state_dir.join("snapshots"),
            lock_path: state_dir.join("installer.lock"),
            log_path: PathBuf::from(format!("/var/log/{PRODUCT}/installer.log")),
            state_dir,
            retention_days: 30,
            step_timeout_secs: None,
        }
    }
}

impl InstallerConfig {
    /// Build configuration from the process environment, falling back to
    /// the spec defaults for anything unset.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(dir) = std::env::var("INSTALLER_STATE_DIR") {
            let dir = PathBuf::from(dir);
            config.db_path = dir.join("transactions.db");
            config.snapshot_dir = dir.join("snapshots");
            config.lock_path = dir.join("installer.lock");
            config.state_dir = dir;
        }
        if let Ok(path) = std::env::var("INSTALLER_DB_PATH") {
            config.db_path = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("INSTALLER_SNAPSHOT_DIR") {
            config.snapshot_dir = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("INSTALLER_LOG_PATH") {
            config.log_path = PathBuf::from(path);
        }
        if let Ok(days) = std::env::var("INSTALLER_RETENTION_DAYS") {
            if let Ok(days) = days.parse() {
                config.retention_days = days;
            }
        }

        config
    }

    /// A config rooted at a scratch directory, for tests.
    pub fn ephemeral(root: &std::path::Path) -> Self {
        Self {
            state_dir: root.to_path_buf(),
            db_path: root.join("transactions.db"),
            snapshot_dir: root.join("snapshots"),
            log_path: root.join("installer.log"),
            lock_path: root.join("installer.lock"),
            retention_days: 30,
            step_timeout_secs: None,
        }
    }

    /// sea_orm connection string for this config's database path.
    pub fn connection_string(&self) -> String {
        format!("sqlite://{}?mode=rwc", self.db_path.display())
    }
}
