//! The state snapshotter (SPEC_FULL.md §4.3): given a step about to run,
//! captures the minimum pre-image needed to undo it.
//!
//! Snapshots are a closed, `{kind, payload}`-tagged variant (§9 redesign
//! flag) rather than an opaque mapping interpreted by kind at rollback
//! time — the rollback engine matches on `Snapshot` directly.
//!
//! Capturing a `systemd_service`/`apt_package`/`user_management` pre-image
//! means asking the host a read-only question ("is this package
//! installed?", "is this unit active?"). That's routed through a
//! [`HostQuery`] trait so the snapshotter stays unit-testable without a
//! real host, the same indirection the step handler registry uses for
//! host mutation.

mod query;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::errors::InstallerError;
use crate::manifest::step::{AptAction, AptPackageStep, FileCopyStep};
use crate::manifest::{Step, StepBody};
use crate::utils::now_millis;

pub use query::{HostQuery, SystemHostQuery, UserIdentity};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileSnapshot {
    pub exists: bool,
    pub size: Option<u64>,
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub mtime_ms: Option<i64>,
    /// Path under the snapshot store holding a byte-for-byte backup of
    /// `dest`, present iff `exists` is true and the backup copy succeeded.
    pub backup_path: Option<PathBuf>,
}

/// Packages relevant to reversing one `apt_package` step. For `install`,
/// `packages` is the subset already installed before the step ran (must
/// survive rollback). For `remove`, it's the subset installed before the
/// step ran that the step is about to remove (must be reinstalled on
/// rollback).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PackageSnapshot {
    pub action: AptAction,
    pub packages: BTreeSet<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceSnapshot {
    pub active: bool,
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserSnapshot {
    pub exists: bool,
    /// Populated only for `action: remove`, where identity must be
    /// reconstructable to undo the removal.
    pub identity: Option<UserIdentity>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AnsibleSnapshot {
    pub playbook: String,
    pub vars: std::collections::BTreeMap<String, serde_json::Value>,
}

/// Fallback payload for a step kind with nothing meaningful to capture, or
/// for a capture that failed outright (the failure reason is kept so
/// rollback can classify the step `unrecoverable` rather than silently
/// no-op).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct MinimalSnapshot {
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum Snapshot {
    File(FileSnapshot),
    Package(PackageSnapshot),
    Service(ServiceSnapshot),
    User(UserSnapshot),
    Ansible(AnsibleSnapshot),
    Minimal(MinimalSnapshot),
}

impl Snapshot {
    pub fn failed(reason: impl Into<String>) -> Self {
        Snapshot::Minimal(MinimalSnapshot {
            reason: Some(reason.into()),
        })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Snapshot::Minimal(MinimalSnapshot { reason: Some(_) }))
    }
}

/// Envelope actually written to the journal's `snapshot_data` column:
/// the tagged payload plus the millisecond capture timestamp
/// (SPEC_FULL.md §4.3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotEnvelope {
    pub captured_at_ms: i64,
    #[serde(flatten)]
    pub snapshot: Snapshot,
}

pub struct Snapshotter {
    store_dir: PathBuf,
    host: Arc<dyn HostQuery>,
}

impl Snapshotter {
    pub fn new(store_dir: impl Into<PathBuf>) -> Self {
        Self {
            store_dir: store_dir.into(),
            host: Arc::new(SystemHostQuery),
        }
    }

    /// Inject a fake [`HostQuery`] for tests.
    pub fn with_host_query(store_dir: impl Into<PathBuf>, host: Arc<dyn HostQuery>) -> Self {
        Self {
            store_dir: store_dir.into(),
            host,
        }
    }

    /// Capture the pre-image for `step`. Never fails the caller: an
    /// internal capture error becomes a [`Snapshot::Minimal`] with the
    /// failure reason, per SPEC_FULL.md §4.3 ("a snapshot whose capture
    /// fails records the error but does not abort the transaction").
    pub async fn capture(&self, transaction_id: i64, step_order: i32, step: &Step) -> SnapshotEnvelope {
        let result = match &step.body {
            StepBody::FileCopy(s) => self.capture_file(transaction_id, step_order, s).await,
            StepBody::AptPackage(s) => self.capture_package(s).await,
            StepBody::SystemdService(s) => self.capture_service(&s.service).await,
            StepBody::UserManagement(s) => self.capture_user(&s.username).await,
            StepBody::AnsiblePlaybook(s) => Ok(Snapshot::Ansible(AnsibleSnapshot {
                playbook: s.playbook.clone(),
                vars: s.vars.clone(),
            })),
        };

        let snapshot = result.unwrap_or_else(|err| {
            tracing::warn!(transaction_id, step_order, error = %err, "snapshot capture failed");
            Snapshot::failed(err.to_string())
        });

        SnapshotEnvelope {
            captured_at_ms: now_millis(),
            snapshot,
        }
    }

    async fn capture_file(
        &self,
        transaction_id: i64,
        step_order: i32,
        step: &FileCopyStep,
    ) -> Result<Snapshot, InstallerError> {
        let dest = Path::new(&step.dest);
        if !dest.exists() {
            return Ok(Snapshot::File(FileSnapshot {
                exists: false,
                size: None,
                mode: None,
                uid: None,
                gid: None,
                mtime_ms: None,
                backup_path: None,
            }));
        }

        let metadata = tokio::fs::metadata(dest).await?;
        let backup_path = self.backup_path(transaction_id, step_order);
        if let Some(parent) = backup_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(dest, &backup_path).await?;

        Ok(Snapshot::File(FileSnapshot {
            exists: true,
            size: Some(metadata.len()),
            mode: Some(unix_mode(&metadata)),
            uid: Some(unix_uid(&metadata)),
            gid: Some(unix_gid(&metadata)),
            mtime_ms: metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_millis() as i64),
            backup_path: Some(backup_path),
        }))
    }

    async fn capture_package(&self, step: &AptPackageStep) -> Result<Snapshot, InstallerError> {
        let installed = self.host.installed_packages(&step.packages).await?;
        Ok(Snapshot::Package(PackageSnapshot {
            action: step.action,
            packages: installed,
        }))
    }

    async fn capture_service(&self, name: &str) -> Result<Snapshot, InstallerError> {
        let (active, enabled) = self.host.service_state(name).await?;
        Ok(Snapshot::Service(ServiceSnapshot { active, enabled }))
    }

    async fn capture_user(&self, username: &str) -> Result<Snapshot, InstallerError> {
        let identity = self.host.user_identity(username).await?;
        Ok(Snapshot::User(UserSnapshot {
            exists: identity.is_some(),
            identity,
        }))
    }

    fn backup_path(&self, transaction_id: i64, step_order: i32) -> PathBuf {
        self.store_dir
            .join(format!("{transaction_id}-{step_order}.bin"))
    }

    /// Remove backup artifacts for a transaction, whether because it
    /// committed (SPEC_FULL.md §4.5: eligible for cleanup only after
    /// commit) or because retention cleanup is purging its terminal
    /// journal rows and the artifacts would otherwise be orphaned.
    pub async fn release(&self, transaction_id: i64) -> Result<(), InstallerError> {
        let prefix = format!("{transaction_id}-");
        let mut entries = match tokio::fs::read_dir(&self.store_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with(&prefix))
            {
                tokio::fs::remove_file(entry.path()).await?;
            }
        }
        Ok(())
    }
}

#[cfg(unix)]
fn unix_mode(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn unix_mode(_metadata: &std::fs::Metadata) -> u32 {
    0
}

#[cfg(unix)]
fn unix_uid(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::MetadataExt;
    metadata.uid()
}

#[cfg(not(unix))]
fn unix_uid(_metadata: &std::fs::Metadata) -> u32 {
    0
}

#[cfg(unix)]
fn unix_gid(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::MetadataExt;
    metadata.gid()
}

#[cfg(not(unix))]
fn unix_gid(_metadata: &std::fs::Metadata) -> u32 {
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::step::{RollbackPolicy, ServiceAction, SystemdServiceStep, UserAction, UserManagementStep};
    use async_trait::async_trait;
    use std::collections::BTreeMap;

    struct FakeHost {
        installed: BTreeSet<String>,
        service: (bool, bool),
        user: Option<UserIdentity>,
    }

    #[async_trait]
    impl HostQuery for FakeHost {
        async fn installed_packages(
            &self,
            names: &BTreeSet<String>,
        ) -> Result<BTreeSet<String>, InstallerError> {
            Ok(names.intersection(&self.installed).cloned().collect())
        }

        async fn service_state(&self, _name: &str) -> Result<(bool, bool), InstallerError> {
            Ok(self.service)
        }

        async fn user_identity(&self, _username: &str) -> Result<Option<UserIdentity>, InstallerError> {
            Ok(self.user.clone())
        }
    }

    fn step(body: StepBody) -> Step {
        Step {
            body,
            rollback: RollbackPolicy::Auto,
            description: None,
        }
    }

    #[tokio::test]
    async fn file_copy_records_not_exists_when_dest_missing() {
        let dir = tempfile::tempdir().unwrap();
        let snapshotter = Snapshotter::new(dir.path());
        let s = step(StepBody::FileCopy(FileCopyStep {
            src: "a".to_string(),
            dest: dir.path().join("does-not-exist").to_string_lossy().to_string(),
            owner: None,
            group: None,
            mode: None,
        }));
        let envelope = snapshotter.capture(1, 1, &s).await;
        match envelope.snapshot {
            Snapshot::File(f) => assert!(!f.exists),
            other => panic!("expected File snapshot, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn file_copy_backs_up_existing_dest_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("existing.conf");
        tokio::fs::write(&dest, b"original contents").await.unwrap();
        let snapshotter = Snapshotter::new(dir.path().join("store"));
        let s = step(StepBody::FileCopy(FileCopyStep {
            src: "a".to_string(),
            dest: dest.to_string_lossy().to_string(),
            owner: None,
            group: None,
            mode: None,
        }));
        let envelope = snapshotter.capture(7, 2, &s).await;
        match envelope.snapshot {
            Snapshot::File(f) => {
                assert!(f.exists);
                assert_eq!(f.size, Some(18));
                let backup = f.backup_path.unwrap();
                let bytes = tokio::fs::read(&backup).await.unwrap();
                assert_eq!(bytes, b"original contents");
            }
            other => panic!("expected File snapshot, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn apt_install_records_already_installed_subset() {
        let dir = tempfile::tempdir().unwrap();
        let host = Arc::new(FakeHost {
            installed: BTreeSet::from(["curl".to_string()]),
            service: (false, false),
            user: None,
        });
        let snapshotter = Snapshotter::with_host_query(dir.path(), host);
        let s = step(StepBody::AptPackage(AptPackageStep {
            action: AptAction::Install,
            packages: BTreeSet::from(["curl".to_string(), "nginx".to_string()]),
            update_cache: true,
        }));
        let envelope = snapshotter.capture(1, 1, &s).await;
        match envelope.snapshot {
            Snapshot::Package(p) => {
                assert_eq!(p.packages, BTreeSet::from(["curl".to_string()]));
            }
            other => panic!("expected Package snapshot, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn systemd_service_records_active_and_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let host = Arc::new(FakeHost {
            installed: BTreeSet::new(),
            service: (true, false),
            user: None,
        });
        let snapshotter = Snapshotter::with_host_query(dir.path(), host);
        let s = step(StepBody::SystemdService(SystemdServiceStep {
            service: "nginx".to_string(),
            action: ServiceAction::Restart,
        }));
        let envelope = snapshotter.capture(1, 1, &s).await;
        match envelope.snapshot {
            Snapshot::Service(svc) => {
                assert!(svc.active);
                assert!(!svc.enabled);
            }
            other => panic!("expected Service snapshot, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn user_remove_captures_identity_when_present() {
        let dir = tempfile::tempdir().unwrap();
        let identity = UserIdentity {
            uid: 1500,
            gid: 1500,
            home: "/home/deploy".to_string(),
            shell: "/bin/bash".to_string(),
            groups: vec!["sudo".to_string()],
        };
        let host = Arc::new(FakeHost {
            installed: BTreeSet::new(),
            service: (false, false),
            user: Some(identity.clone()),
        });
        let snapshotter = Snapshotter::with_host_query(dir.path(), host);
        let s = step(StepBody::UserManagement(UserManagementStep {
            username: "deploy".to_string(),
            action: UserAction::Remove,
            user_data: None,
        }));
        let envelope = snapshotter.capture(1, 1, &s).await;
        match envelope.snapshot {
            Snapshot::User(u) => {
                assert!(u.exists);
                assert_eq!(u.identity, Some(identity));
            }
            other => panic!("expected User snapshot, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn ansible_snapshot_records_playbook_and_vars() {
        let dir = tempfile::tempdir().unwrap();
        let snapshotter = Snapshotter::new(dir.path());
        let mut vars = BTreeMap::new();
        vars.insert("env".to_string(), serde_json::json!("prod"));
        let s = step(StepBody::AnsiblePlaybook(crate::manifest::step::AnsiblePlaybookStep {
            playbook: "deploy.yml".to_string(),
            rollback_playbook: None,
            vars: vars.clone(),
            inventory: None,
        }));
        let envelope = snapshotter.capture(1, 1, &s).await;
        match envelope.snapshot {
            Snapshot::Ansible(a) => {
                assert_eq!(a.playbook, "deploy.yml");
                assert_eq!(a.vars, vars);
            }
            other => panic!("expected Ansible snapshot, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn release_removes_only_matching_transaction_backups() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("store");
        tokio::fs::create_dir_all(&store).await.unwrap();
        tokio::fs::write(store.join("1-1.bin"), b"a").await.unwrap();
        tokio::fs::write(store.join("2-1.bin"), b"b").await.unwrap();
        let snapshotter = Snapshotter::new(&store);
        snapshotter.release(1).await.unwrap();
        assert!(!store.join("1-1.bin").exists());
        assert!(store.join("2-1.bin").exists());
    }
}
