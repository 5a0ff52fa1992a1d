//! The transaction engine (SPEC_FULL.md §4.5): drives the lifecycle
//! `begin → for each step {snapshot, journal, execute, mark} → commit`,
//! or on failure triggers rollback.
//!
//! `Engine` itself is a long-lived handle onto the journal, snapshotter,
//! and handler registry. `begin_transaction` hands back an
//! [`ActiveTransaction`] guard scoped to exactly one transaction (§9
//! redesign flag) that holds the host-wide advisory lock for its
//! lifetime, releasing it on `Drop`, `commit`, or `rollback`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::InstallerConfig;
use crate::errors::InstallerError;
use crate::handler::HandlerRegistry;
use crate::journal::{Journal, StepStatus, TransactionStatus, TransactionSummary};
use crate::lock::{self, LockGuard};
use crate::manifest::{Manifest, Step};
use crate::rollback::{RollbackEngine, RollbackReport};
use crate::snapshot::Snapshotter;

/// Cooperative cancellation handle for [`ActiveTransaction::execute_steps`]
/// (SPEC_FULL.md §5, §9): a plain `AtomicBool` polled between steps rather
/// than a `tokio_util::sync::CancellationToken`, since the teacher pulls in
/// `tokio-util` only as a dev-dependency and never for this purpose.
#[derive(Clone, Default)]
pub struct CancelSignal(Arc<AtomicBool>);

impl CancelSignal {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct Engine {
    journal: Journal,
    snapshotter: Snapshotter,
    handlers: HandlerRegistry,
    config: InstallerConfig,
}

impl Engine {
    pub async fn connect(config: InstallerConfig) -> Result<Self, InstallerError> {
        let journal = Journal::connect(&config.connection_string()).await?;
        let snapshotter = Snapshotter::new(config.snapshot_dir.clone());
        Ok(Self {
            journal,
            snapshotter,
            handlers: HandlerRegistry::with_builtin_handlers(),
            config,
        })
    }

    /// Build an engine from already-constructed components, for tests
    /// that want a fake handler registry or host-query.
    pub fn with_components(
        journal: Journal,
        snapshotter: Snapshotter,
        handlers: HandlerRegistry,
        config: InstallerConfig,
    ) -> Self {
        Self {
            journal,
            snapshotter,
            handlers,
            config,
        }
    }

    /// `begin_transaction(package_name, manifest)`: computes
    /// `metadata_hash`, creates the journal row, and acquires the
    /// advisory lock for the returned guard's lifetime. Concurrent
    /// `begin` attempts fail with `EngineBusy`.
    pub async fn begin_transaction(
        &self,
        package_name: &str,
        manifest: &Manifest,
    ) -> Result<ActiveTransaction<'_>, InstallerError> {
        let guard = lock::acquire(&self.config.lock_path)?;
        let metadata_hash = manifest.content_hash().to_string();
        let metadata = serde_json::to_value(manifest)?;
        let id = self
            .journal
            .create_transaction(package_name, &metadata_hash, &metadata)
            .await?;
        Ok(ActiveTransaction {
            engine: self,
            id,
            _lock: guard,
        })
    }

    pub async fn get_transaction_status(&self, id: i64) -> Result<TransactionStatus, InstallerError> {
        let record = self
            .journal
            .get_transaction(id)
            .await?
            .ok_or_else(|| InstallerError::NotFound(format!("transaction {id}")))?;
        Ok(record.status)
    }

    pub async fn list_transactions(&self, limit: u64) -> Result<Vec<TransactionSummary>, InstallerError> {
        self.journal.list_transactions(limit).await
    }

    /// Purges terminal transactions older than `days`, releasing each
    /// purged transaction's physical snapshot artifacts so the backup
    /// files under the snapshot directory never outlive the journal
    /// rows that would otherwise be needed to find them.
    pub async fn cleanup_old_transactions(&self, days: i64) -> Result<u64, InstallerError> {
        let ids = self.journal.cleanup_old_transactions(days).await?;
        for id in &ids {
            self.snapshotter.release(*id).await?;
        }
        Ok(ids.len() as u64)
    }

    pub async fn get_transaction_steps(&self, id: i64) -> Result<Vec<crate::journal::StepRecord>, InstallerError> {
        self.journal.get_transaction_steps(id).await
    }

    pub async fn get_transaction_snapshots(
        &self,
        id: i64,
    ) -> Result<Vec<crate::journal::SnapshotRecord>, InstallerError> {
        self.journal.get_transaction_snapshots(id).await
    }

    /// Reverse an out-of-process transaction (the CLI `rollback <id>`
    /// path, where there is no live `ActiveTransaction` guard). Refuses
    /// `completed` transactions.
    pub async fn rollback_transaction_by_id(&self, id: i64) -> Result<RollbackReport, InstallerError> {
        let record = self
            .journal
            .get_transaction(id)
            .await?
            .ok_or_else(|| InstallerError::NotFound(format!("transaction {id}")))?;
        if record.status == TransactionStatus::Completed {
            return Err(InstallerError::TransactionError(format!(
                "transaction {id} already completed; refusing to roll back"
            )));
        }
        let _guard = lock::acquire(&self.config.lock_path)?;
        RollbackEngine::new(&self.journal, &self.handlers)
            .rollback(id)
            .await
    }
}

/// A transaction in progress. Its lifetime spans exactly one
/// `begin` → `commit`/`rollback` cycle.
pub struct ActiveTransaction<'e> {
    engine: &'e Engine,
    id: i64,
    _lock: LockGuard,
}

impl<'e> ActiveTransaction<'e> {
    pub fn id(&self) -> i64 {
        self.id
    }

    /// `execute_steps(steps, cancel)`: iterates `k = 1..n`, snapshotting,
    /// journaling, and executing each step in turn. On any failure the
    /// offending step is marked `failed`, rollback runs exactly once,
    /// and the returned error wraps both the original cause and the
    /// rollback outcome (SPEC_FULL.md §4.5, §9 open question).
    ///
    /// If `cancel` is set, forward calls are still allowed to complete
    /// (they're treated as blocking, not interruptible), but once step
    /// `k`'s forward returns, a cancellation observed in the interim
    /// turns that success into a failure and rollback proceeds as
    /// though `k` had failed (spec.md §5 "Suspension points").
    pub async fn execute_steps(
        &self,
        steps: &[Step],
        cancel: Option<&CancelSignal>,
    ) -> Result<(), InstallerError> {
        for (idx, step) in steps.iter().enumerate() {
            let step_order = (idx + 1) as i32;
            if let Err(err) = self.execute_one(step_order, step, cancel).await {
                let _ = self
                    .engine
                    .journal
                    .update_step_status(self.id, step_order, StepStatus::Failed)
                    .await;
                let rollback_report = RollbackEngine::new(&self.engine.journal, &self.engine.handlers)
                    .rollback(self.id)
                    .await?;
                return Err(InstallerError::TransactionError(format!(
                    "step {step_order} failed: {err}; rollback finished as {}",
                    rollback_report.final_status
                )));
            }
        }
        Ok(())
    }

    async fn execute_one(
        &self,
        step_order: i32,
        step: &Step,
        cancel: Option<&CancelSignal>,
    ) -> Result<(), InstallerError> {
        let envelope = self.engine.snapshotter.capture(self.id, step_order, step).await;
        self.engine
            .journal
            .save_snapshot(self.id, step_order, &serde_json::to_value(&envelope)?)
            .await?;
        self.engine
            .journal
            .record_step(
                self.id,
                step_order,
                step.kind().as_str(),
                &serde_json::to_value(step)?,
                StepStatus::Pending,
            )
            .await?;

        let handler = self.engine.handlers.get(step.kind())?;
        self.run_forward_with_retry(handler, step, step_order).await?;

        if cancel.is_some_and(CancelSignal::is_cancelled) {
            return Err(InstallerError::Cancelled(step_order));
        }

        self.engine
            .journal
            .update_step_status(self.id, step_order, StepStatus::Completed)
            .await?;
        Ok(())
    }

    /// At most one retry on a forward-step timeout (SPEC_FULL.md §4.5,
    /// §9 "Retries"); the second timeout is terminal.
    async fn run_forward_with_retry(
        &self,
        handler: &dyn crate::handler::StepHandler,
        step: &Step,
        step_order: i32,
    ) -> Result<(), InstallerError> {
        match self.run_forward_once(handler, step, step_order).await {
            Err(InstallerError::StepTimeout(_)) => self.run_forward_once(handler, step, step_order).await,
            other => other,
        }
    }

    async fn run_forward_once(
        &self,
        handler: &dyn crate::handler::StepHandler,
        step: &Step,
        step_order: i32,
    ) -> Result<(), InstallerError> {
        let forward = handler.forward(step);
        let result = match self.engine.config.step_timeout_secs {
            Some(secs) => match tokio::time::timeout(Duration::from_secs(secs), forward).await {
                Ok(result) => result,
                Err(_) => return Err(InstallerError::StepTimeout(step_order)),
            },
            None => forward.await,
        };
        result.map_err(|source| InstallerError::StepExecutionFailure {
            step_order,
            step_type: step.kind().to_string(),
            source: Box::new(source),
        })
    }

    /// `commit_transaction()`: transitions `pending → completed` and
    /// releases snapshot artifacts. A journal write failure leaves the
    /// transaction `pending` (a later rollback remains legal).
    pub async fn commit(self) -> Result<(), InstallerError> {
        self.engine
            .journal
            .update_transaction_status(self.id, TransactionStatus::Completed)
            .await?;
        self.engine.snapshotter.release(self.id).await?;
        Ok(())
    }

    /// `rollback_transaction()`: delegates to the rollback engine.
    pub async fn rollback(self) -> Result<RollbackReport, InstallerError> {
        RollbackEngine::new(&self.engine.journal, &self.engine.handlers)
            .rollback(self.id)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::step::FileCopyStep;
    use crate::manifest::StepBody;

    async fn engine_in(dir: &std::path::Path) -> Engine {
        let config = InstallerConfig::ephemeral(dir);
        let journal = Journal::connect("sqlite::memory:").await.unwrap();
        let snapshotter = Snapshotter::new(config.snapshot_dir.clone());
        Engine::with_components(journal, snapshotter, HandlerRegistry::with_builtin_handlers(), config)
    }

    fn manual_step(body: StepBody) -> Step {
        Step {
            body,
            rollback: crate::manifest::RollbackPolicy::Manual,
            description: None,
        }
    }

    #[tokio::test]
    async fn happy_path_file_copy_commits() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a.txt");
        tokio::fs::write(&src, b"hello").await.unwrap();
        let dest = dir.path().join("b.txt");

        let engine = engine_in(dir.path()).await;
        let manifest = Manifest::template("demo", "1.0.0");
        let tx = engine.begin_transaction("demo", &manifest).await.unwrap();
        let steps = vec![manual_step(StepBody::FileCopy(FileCopyStep {
            src: src.to_string_lossy().to_string(),
            dest: dest.to_string_lossy().to_string(),
            owner: None,
            group: None,
            mode: None,
        }))];
        tx.execute_steps(&steps, None).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(
            engine.get_transaction_status(1).await.unwrap(),
            TransactionStatus::Completed
        );
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn concurrent_begin_fails_with_engine_busy() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_in(dir.path()).await;
        let manifest = Manifest::template("demo", "1.0.0");
        let _held = engine.begin_transaction("demo", &manifest).await.unwrap();
        let err = engine.begin_transaction("demo", &manifest).await.unwrap_err();
        assert!(matches!(err, InstallerError::EngineBusy(_)));
    }

    #[tokio::test]
    async fn failing_step_triggers_rollback_of_prior_steps() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a.txt");
        tokio::fs::write(&src, b"hello").await.unwrap();
        let engine = engine_in(dir.path()).await;
        let manifest = Manifest::template("demo", "1.0.0");
        let tx = engine.begin_transaction("demo", &manifest).await.unwrap();

        let ok_step = manual_step(StepBody::FileCopy(FileCopyStep {
            src: src.to_string_lossy().to_string(),
            dest: dir.path().join("copied.txt").to_string_lossy().to_string(),
            owner: None,
            group: None,
            mode: None,
        }));
        let failing_step = manual_step(StepBody::FileCopy(FileCopyStep {
            src: dir.path().join("does-not-exist").to_string_lossy().to_string(),
            dest: dir.path().join("out").to_string_lossy().to_string(),
            owner: None,
            group: None,
            mode: None,
        }));

        let err = tx
            .execute_steps(&[ok_step, failing_step], None)
            .await
            .unwrap_err();
        assert!(matches!(err, InstallerError::TransactionError(_)));

        assert_eq!(
            engine.get_transaction_status(1).await.unwrap(),
            TransactionStatus::RolledBack
        );
    }
}
