//! End-to-end scenarios driving the engine against an in-memory journal
//! and a scripted handler registry that can be told to fail or report a
//! particular rollback outcome on demand.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;

use transactional_installer::config::InstallerConfig;
use transactional_installer::engine::{CancelSignal, Engine};
use transactional_installer::errors::InstallerError;
use transactional_installer::handler::{HandlerRegistry, ReverseOutcome, StepHandler};
use transactional_installer::journal::{StepStatus, TransactionStatus};
use transactional_installer::manifest::step::{AptAction, AptPackageStep, FileCopyStep};
use transactional_installer::manifest::{Manifest, RollbackPolicy, Step, StepBody, StepKind};
use transactional_installer::snapshot::{HostQuery, Snapshotter, UserIdentity};
use transactional_installer::journal::Journal;

/// A host query that reports nothing installed/active/existing, so
/// snapshot capture never shells out to the real system under test.
struct FakeHostQuery;

#[async_trait]
impl HostQuery for FakeHostQuery {
    async fn installed_packages(&self, _names: &BTreeSet<String>) -> Result<BTreeSet<String>, InstallerError> {
        Ok(BTreeSet::new())
    }

    async fn service_state(&self, _name: &str) -> Result<(bool, bool), InstallerError> {
        Ok((false, false))
    }

    async fn user_identity(&self, _username: &str) -> Result<Option<UserIdentity>, InstallerError> {
        Ok(None)
    }
}

/// A handler whose forward/reverse behaviour is scripted by each step's
/// `description`, so one fake can stand in for all five step kinds.
#[derive(Clone, Default)]
struct ScriptedHandler {
    fail_forward: HashSet<String>,
    reverse_outcomes: HashMap<String, ReverseOutcome>,
}

impl ScriptedHandler {
    fn key(step: &Step) -> String {
        step.description.clone().unwrap_or_default()
    }
}

#[async_trait]
impl StepHandler for ScriptedHandler {
    async fn forward(&self, step: &Step) -> Result<(), InstallerError> {
        if self.fail_forward.contains(&Self::key(step)) {
            Err(InstallerError::CustomError(format!(
                "scripted failure for `{}`",
                Self::key(step)
            )))
        } else {
            Ok(())
        }
    }

    async fn reverse(
        &self,
        step: &Step,
        _snapshot: &transactional_installer::snapshot::Snapshot,
    ) -> Result<ReverseOutcome, InstallerError> {
        Ok(self
            .reverse_outcomes
            .get(&Self::key(step))
            .copied()
            .unwrap_or(ReverseOutcome::Reversed))
    }
}

fn registry(handler: ScriptedHandler) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    for kind in [
        StepKind::AptPackage,
        StepKind::FileCopy,
        StepKind::SystemdService,
        StepKind::UserManagement,
        StepKind::AnsiblePlaybook,
    ] {
        registry.register(kind, Box::new(handler.clone()));
    }
    registry
}

async fn engine_with(handler: ScriptedHandler, dir: &std::path::Path) -> Engine {
    let config = InstallerConfig::ephemeral(dir);
    let journal = Journal::connect("sqlite::memory:").await.unwrap();
    let snapshotter = Snapshotter::with_host_query(config.snapshot_dir.clone(), Arc::new(FakeHostQuery));
    Engine::with_components(journal, snapshotter, registry(handler), config)
}

fn step(body: StepBody, description: &str) -> Step {
    Step {
        body,
        rollback: RollbackPolicy::Auto,
        description: Some(description.to_string()),
    }
}

fn apt_install(name: &str, description: &str) -> Step {
    step(
        StepBody::AptPackage(AptPackageStep {
            action: AptAction::Install,
            packages: BTreeSet::from([name.to_string()]),
            update_cache: false,
        }),
        description,
    )
}

fn file_copy(src: &str, dest: &str, description: &str) -> Step {
    step(
        StepBody::FileCopy(FileCopyStep {
            src: src.to_string(),
            dest: dest.to_string(),
            owner: None,
            group: None,
            mode: None,
        }),
        description,
    )
}

#[tokio::test]
async fn scenario_1_happy_path_install() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("a");
    tokio::fs::write(&src, b"x").await.unwrap();

    let engine = engine_with(ScriptedHandler::default(), dir.path()).await;
    let manifest = Manifest::template("demo", "1.0.0");
    let tx = engine.begin_transaction("demo", &manifest).await.unwrap();
    let steps = vec![
        apt_install("nginx", "install nginx"),
        file_copy(&src.to_string_lossy(), &dir.path().join("a-copy").to_string_lossy(), "copy a"),
    ];
    tx.execute_steps(&steps, None).await.unwrap();
    tx.commit().await.unwrap();

    assert_eq!(engine.get_transaction_status(1).await.unwrap(), TransactionStatus::Completed);
    let recorded = engine.get_transaction_steps(1).await.unwrap();
    assert_eq!(recorded.len(), 2);
    assert!(recorded.iter().all(|s| s.status == StepStatus::Completed));
    let snapshots = engine.get_transaction_snapshots(1).await.unwrap();
    assert_eq!(snapshots.len(), 2);
}

#[tokio::test]
async fn scenario_2_mid_transaction_failure_triggers_full_rollback() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("index.html");
    tokio::fs::write(&src, b"hi").await.unwrap();

    let handler = ScriptedHandler {
        fail_forward: HashSet::from(["copy nginx.conf".to_string()]),
        reverse_outcomes: HashMap::new(),
    };
    let engine = engine_with(handler, dir.path()).await;
    let manifest = Manifest::template("demo", "1.0.0");
    let tx = engine.begin_transaction("demo", &manifest).await.unwrap();

    let steps = vec![
        apt_install("nginx", "install nginx"),
        file_copy(&src.to_string_lossy(), &dir.path().join("index.html").to_string_lossy(), "copy index.html"),
        file_copy(&src.to_string_lossy(), &dir.path().join("nginx.conf").to_string_lossy(), "copy nginx.conf"),
        apt_install("create_db", "run create_db.sh"),
    ];
    let err = tx.execute_steps(&steps, None).await.unwrap_err();
    assert!(matches!(err, InstallerError::TransactionError(_)));

    let recorded = engine.get_transaction_steps(1).await.unwrap();
    assert_eq!(recorded.len(), 3, "step 4 must never be recorded");
    // The failing step itself also reverses cleanly here (only its
    // forward was scripted to fail), so all three recorded steps end
    // rolled_back rather than the third being left failed.
    assert!(recorded.iter().all(|s| s.status == StepStatus::RolledBack));
    assert_eq!(engine.get_transaction_status(1).await.unwrap(), TransactionStatus::RolledBack);
}

#[tokio::test]
async fn scenario_3_rollback_step_failure_escalates_to_rollback_failed() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("index.html");
    tokio::fs::write(&src, b"hi").await.unwrap();

    let handler = ScriptedHandler {
        fail_forward: HashSet::from(["copy nginx.conf".to_string()]),
        reverse_outcomes: HashMap::from([("install nginx".to_string(), ReverseOutcome::Unrecoverable)]),
    };
    let engine = engine_with(handler, dir.path()).await;
    let manifest = Manifest::template("demo", "1.0.0");
    let tx = engine.begin_transaction("demo", &manifest).await.unwrap();

    let steps = vec![
        apt_install("nginx", "install nginx"),
        file_copy(&src.to_string_lossy(), &dir.path().join("index.html").to_string_lossy(), "copy index.html"),
        file_copy(&src.to_string_lossy(), &dir.path().join("nginx.conf").to_string_lossy(), "copy nginx.conf"),
    ];
    tx.execute_steps(&steps, None).await.unwrap_err();

    assert_eq!(engine.get_transaction_status(1).await.unwrap(), TransactionStatus::RollbackFailed);
    let recorded = engine.get_transaction_steps(1).await.unwrap();
    assert_eq!(
        recorded[0].status,
        StepStatus::Completed,
        "unrecoverable step keeps its prior status rather than advancing to rolled_back"
    );
    assert_eq!(recorded[1].status, StepStatus::RolledBack, "other reversible steps still reversed");
}

#[tokio::test]
async fn scenario_4_idempotent_reinstall_keeps_already_installed_package() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_with(ScriptedHandler::default(), dir.path()).await;
    let manifest = Manifest::template("demo", "1.0.0");
    let tx = engine.begin_transaction("demo", &manifest).await.unwrap();

    let steps = vec![apt_install("curl", "install curl")];
    tx.execute_steps(&steps, None).await.unwrap();

    let snapshots = engine.get_transaction_snapshots(1).await.unwrap();
    let envelope: transactional_installer::snapshot::SnapshotEnvelope =
        serde_json::from_value(snapshots[0].snapshot_data.clone()).unwrap();
    match envelope.snapshot {
        transactional_installer::snapshot::Snapshot::Package(p) => {
            assert!(p.packages.is_empty(), "fake host reports nothing pre-installed");
        }
        other => panic!("expected Package snapshot, got {other:?}"),
    }
}

#[tokio::test]
async fn scenario_5_operating_on_an_unknown_transaction_id_fails_without_mutation() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_with(ScriptedHandler::default(), dir.path()).await;
    let err = engine.rollback_transaction_by_id(999).await.unwrap_err();
    assert!(matches!(err, InstallerError::NotFound(_)));
    let err = engine.get_transaction_status(999).await.unwrap_err();
    assert!(matches!(err, InstallerError::NotFound(_)));
}

#[tokio::test]
async fn scenario_7_cancellation_after_step_forward_triggers_rollback() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("a");
    tokio::fs::write(&src, b"x").await.unwrap();

    let engine = engine_with(ScriptedHandler::default(), dir.path()).await;
    let manifest = Manifest::template("demo", "1.0.0");
    let tx = engine.begin_transaction("demo", &manifest).await.unwrap();
    let steps = vec![
        apt_install("nginx", "install nginx"),
        file_copy(&src.to_string_lossy(), &dir.path().join("a-copy").to_string_lossy(), "copy a"),
    ];

    // Signal cancellation before execution starts; both steps' forwards
    // still run to completion (they are blocking, not interruptible), but
    // each is converted to a failure once it returns, so only the first
    // step is ever recorded before rollback kicks in.
    let cancel = CancelSignal::new();
    cancel.cancel();
    let err = tx.execute_steps(&steps, Some(&cancel)).await.unwrap_err();
    assert!(matches!(err, InstallerError::TransactionError(_)));

    let recorded = engine.get_transaction_steps(1).await.unwrap();
    assert_eq!(recorded.len(), 1, "step 2 must never be recorded once step 1 is cancelled");
    assert_eq!(recorded[0].status, StepStatus::RolledBack);
    assert_eq!(engine.get_transaction_status(1).await.unwrap(), TransactionStatus::RolledBack);
}

#[tokio::test]
async fn scenario_6_retention_cleanup_purges_only_old_terminal_transactions() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_with(ScriptedHandler::default(), dir.path()).await;
    let manifest = Manifest::template("demo", "1.0.0");

    let old_tx = engine.begin_transaction("old", &manifest).await.unwrap();
    let old_id = old_tx.id();
    old_tx.execute_steps(&[], None).await.unwrap();
    old_tx.commit().await.unwrap();

    let recent_tx = engine.begin_transaction("recent", &manifest).await.unwrap();
    let recent_id = recent_tx.id();
    recent_tx.execute_steps(&[], None).await.unwrap();
    recent_tx.commit().await.unwrap();

    assert_ne!(old_id, recent_id);
    // Both transactions are freshly created, so a 30-day cleanup purges neither.
    let purged = engine.cleanup_old_transactions(30).await.unwrap();
    assert_eq!(purged, 0);
    assert_eq!(engine.get_transaction_status(old_id).await.unwrap(), TransactionStatus::Completed);
    assert_eq!(engine.get_transaction_status(recent_id).await.unwrap(), TransactionStatus::Completed);
}
