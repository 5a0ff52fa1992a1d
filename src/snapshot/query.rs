//! Read-only host queries the snapshotter needs to build a pre-image
//! (is this package installed, is this unit active, does this user
//! exist). Behind a trait so the snapshotter can be unit-tested without
//! a real host; [`SystemHostQuery`] is the production implementation,
//! shelling out the same way the step handlers do (SPEC_FULL.md §9
//! subprocess contract).

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::errors::InstallerError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserIdentity {
    pub uid: u32,
    pub gid: u32,
    pub home: String,
    pub shell: String,
    pub groups: Vec<String>,
}

#[async_trait]
pub trait HostQuery: Send + Sync {
    /// Returns the subset of `names` currently installed on the host.
    async fn installed_packages(&self, names: &BTreeSet<String>) -> Result<BTreeSet<String>, InstallerError>;

    /// Returns `(active, enabled)` for a systemd unit.
    async fn service_state(&self, name: &str) -> Result<(bool, bool), InstallerError>;

    /// Returns the user's identity if the account exists.
    async fn user_identity(&self, username: &str) -> Result<Option<UserIdentity>, InstallerError>;
}

/// Queries the real host via `dpkg-query`, `systemctl`, and `getent`.
pub struct SystemHostQuery;

#[async_trait]
impl HostQuery for SystemHostQuery {
    async fn installed_packages(&self, names: &BTreeSet<String>) -> Result<BTreeSet<String>, InstallerError> {
        let mut installed = BTreeSet::new();
        for name in names {
            let output = Command::new("dpkg-query")
                .args(["-W", "-f=${Status}", name])
                .output()
                .await?;
            if output.status.success()
                && String::from_utf8_lossy(&output.stdout).contains("install ok installed")
            {
                installed.insert(name.clone());
            }
        }
        Ok(installed)
    }

    async fn service_state(&self, name: &str) -> Result<(bool, bool), InstallerError> {
        let active = Command::new("systemctl")
            .args(["is-active", "--quiet", name])
            .status()
            .await?
            .success();
        let enabled = Command::new("systemctl")
            .args(["is-enabled", "--quiet", name])
            .status()
            .await?
            .success();
        Ok((active, enabled))
    }

    async fn user_identity(&self, username: &str) -> Result<Option<UserIdentity>, InstallerError> {
        let passwd = Command::new("getent").args(["passwd", username]).output().await?;
        if !passwd.status.success() {
            return Ok(None);
        }
        let line = String::from_utf8_lossy(&passwd.stdout);
        let fields: Vec<&str> = line.trim().split(':').collect();
        if fields.len() < 7 {
            return Ok(None);
        }
        let uid: u32 = fields[2]
            .parse()
            .map_err(|_| InstallerError::CustomError(format!("malformed uid for `{username}`")))?;
        let gid: u32 = fields[3]
            .parse()
            .map_err(|_| InstallerError::CustomError(format!("malformed gid for `{username}`")))?;

        let groups_output = Command::new("id").args(["-Gn", username]).output().await?;
        let groups = if groups_output.status.success() {
            String::from_utf8_lossy(&groups_output.stdout)
                .split_whitespace()
                .map(str::to_string)
                .collect()
        } else {
            Vec::new()
        };

        Ok(Some(UserIdentity {
            uid,
            gid,
            home: fields[5].to_string(),
            shell: fields[6].to_string(),
            groups,
        }))
    }
}
