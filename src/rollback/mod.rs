//! The rollback engine (SPEC_FULL.md §4.6): reverses a transaction's
//! completed steps in strictly descending order, classifying the
//! outcome `rolled_back` or `rollback_failed`.

use crate::errors::InstallerError;
use crate::handler::{HandlerRegistry, ReverseOutcome};
use crate::journal::{Journal, StepStatus, TransactionStatus};
use crate::manifest::{RollbackPolicy, Step};
use crate::snapshot::Snapshot;

/// One step's rollback outcome, surfaced to the caller alongside the
/// transaction's terminal status.
#[derive(Debug, Clone)]
pub struct StepRollbackReport {
    pub step_order: i32,
    pub outcome: StepRollbackOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepRollbackOutcome {
    Reversed,
    NoOp,
    SkippedManual,
    Unrecoverable { reason: String },
}

#[derive(Debug, Clone)]
pub struct RollbackReport {
    pub transaction_id: i64,
    pub final_status: TransactionStatus,
    pub steps: Vec<StepRollbackReport>,
}

pub struct RollbackEngine<'a> {
    journal: &'a Journal,
    handlers: &'a HandlerRegistry,
}

impl<'a> RollbackEngine<'a> {
    pub fn new(journal: &'a Journal, handlers: &'a HandlerRegistry) -> Self {
        Self { journal, handlers }
    }

    /// Reverse `transaction_id`'s completed steps in strict descending
    /// order. Never reorders steps; accumulates per-step failures rather
    /// than aborting, per SPEC_FULL.md §4.6 policy.
    pub async fn rollback(&self, transaction_id: i64) -> Result<RollbackReport, InstallerError> {
        let mut step_records = self.journal.get_transaction_steps(transaction_id).await?;
        let snapshot_records = self.journal.get_transaction_snapshots(transaction_id).await?;
        step_records.sort_by(|a, b| b.step_order.cmp(&a.step_order));

        let mut reports = Vec::with_capacity(step_records.len());
        let mut any_unrecoverable = false;

        for record in step_records {
            if record.status != StepStatus::Completed && record.status != StepStatus::Failed {
                continue;
            }

            let step: Step = serde_json::from_value(record.step_data.clone())?;
            let snapshot_record = snapshot_records
                .iter()
                .find(|s| s.step_order == record.step_order);

            let outcome = self
                .reverse_one(transaction_id, record.step_order, &step, snapshot_record)
                .await;

            if let StepRollbackOutcome::Unrecoverable { .. } = &outcome {
                any_unrecoverable = true;
            } else {
                self.journal
                    .update_step_status(transaction_id, record.step_order, StepStatus::RolledBack)
                    .await?;
            }

            reports.push(StepRollbackReport {
                step_order: record.step_order,
                outcome,
            });
        }

        let final_status = if any_unrecoverable {
            TransactionStatus::RollbackFailed
        } else {
            TransactionStatus::RolledBack
        };
        self.journal
            .update_transaction_status(transaction_id, final_status)
            .await?;

        Ok(RollbackReport {
            transaction_id,
            final_status,
            steps: reports,
        })
    }

    async fn reverse_one(
        &self,
        transaction_id: i64,
        step_order: i32,
        step: &Step,
        snapshot_record: Option<&crate::journal::SnapshotRecord>,
    ) -> StepRollbackOutcome {
        if step.rollback == RollbackPolicy::Manual {
            return StepRollbackOutcome::SkippedManual;
        }

        let Some(snapshot_record) = snapshot_record else {
            return StepRollbackOutcome::Unrecoverable {
                reason: "no snapshot recorded for this step".to_string(),
            };
        };
        let envelope: crate::snapshot::SnapshotEnvelope =
            match serde_json::from_value(snapshot_record.snapshot_data.clone()) {
                Ok(envelope) => envelope,
                Err(e) => {
                    return StepRollbackOutcome::Unrecoverable {
                        reason: format!("malformed snapshot: {e}"),
                    }
                }
            };
        if envelope.snapshot.is_failed() {
            let reason = match &envelope.snapshot {
                Snapshot::Minimal(m) => m.reason.clone().unwrap_or_default(),
                _ => unreachable!(),
            };
            return StepRollbackOutcome::Unrecoverable { reason };
        }

        let handler = match self.handlers.get(step.kind()) {
            Ok(handler) => handler,
            Err(e) => return StepRollbackOutcome::Unrecoverable { reason: e.to_string() },
        };

        match handler.reverse(step, &envelope.snapshot).await {
            Ok(ReverseOutcome::Reversed) => StepRollbackOutcome::Reversed,
            Ok(ReverseOutcome::NoOp) => StepRollbackOutcome::NoOp,
            Ok(ReverseOutcome::Unrecoverable) => StepRollbackOutcome::Unrecoverable {
                reason: format!("step {transaction_id}/{step_order} has no recovery path"),
            },
            Err(e) => StepRollbackOutcome::Unrecoverable { reason: e.to_string() },
        }
    }
}
