//! Row types for the journal's three tables (SPEC_FULL.md §3, §6).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of a [`TransactionRecord`].
///
/// ```text
///           begin                    execute_step (per k)
///    (none) ──────▶ pending ──────────────────────────▶ pending
///                     │  │ all steps ok                  │ step k fails
///                     │  ▼                               ▼
///                     │ commit                        rollback
///                     ▼                                  │
///                 completed                      ┌───────┴──────┐
///                                                ▼              ▼
///                                           rolled_back   rollback_failed
/// ```
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Completed,
    RolledBack,
    RollbackFailed,
    Failed,
}

impl TransactionStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Completed => "completed",
            TransactionStatus::RolledBack => "rolled_back",
            TransactionStatus::RollbackFailed => "rollback_failed",
            TransactionStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => TransactionStatus::Pending,
            "completed" => TransactionStatus::Completed,
            "rolled_back" => TransactionStatus::RolledBack,
            "rollback_failed" => TransactionStatus::RollbackFailed,
            "failed" => TransactionStatus::Failed,
            _ => return None,
        })
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransactionStatus::Pending)
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle status of a [`StepRecord`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Completed,
    Failed,
    RolledBack,
}

impl StepStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::RolledBack => "rolled_back",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => StepStatus::Pending,
            "completed" => StepStatus::Completed,
            "failed" => StepStatus::Failed,
            "rolled_back" => StepStatus::RolledBack,
            _ => return None,
        })
    }

    /// Permitted transitions per SPEC_FULL.md §4.2: pending->completed,
    /// pending->failed, completed->rolled_back, failed->rolled_back.
    pub fn can_transition_to(self, next: StepStatus) -> bool {
        matches!(
            (self, next),
            (StepStatus::Pending, StepStatus::Completed)
                | (StepStatus::Pending, StepStatus::Failed)
                | (StepStatus::Completed, StepStatus::RolledBack)
                | (StepStatus::Failed, StepStatus::RolledBack)
        )
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub id: i64,
    pub package_name: String,
    pub metadata_hash: String,
    pub metadata: serde_json::Value,
    pub status: TransactionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub id: i64,
    pub transaction_id: i64,
    pub step_order: i32,
    pub step_type: String,
    pub step_data: serde_json::Value,
    pub status: StepStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub id: i64,
    pub transaction_id: i64,
    pub step_order: i32,
    pub snapshot_data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Summary row returned by `list_transactions`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionSummary {
    pub id: i64,
    pub package_name: String,
    pub status: TransactionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
