//! Error types for the transactional installer.
//!
//! This module defines a unified error enumeration used across manifest
//! parsing/validation, journal access, snapshotting, step execution, and
//! rollback. It integrates with `thiserror` to provide rich `Display`
//! implementations and error source chaining where applicable.
//!
//! Notes:
//! - Each variant carries contextual details via its message payload.
//! - The engine's recovery policy per variant is documented in SPEC_FULL.md
//!   §7; this enum only defines the taxonomy, not the policy.

use thiserror::Error;

#[derive(Error, Debug)]
/// Unified error enumeration for the installer crate.
pub enum InstallerError {
    /// Manifest failed structural or per-step schema validation.
    #[error("validation failed at `{path}`: {message}")]
    ValidationFailure { path: String, message: String },

    /// The journal (transaction/step/snapshot store) failed an operation.
    #[error("journal error: {0}")]
    JournalError(String),

    /// A step's forward operation failed.
    #[error("step {step_order} ({step_type}) failed: {source}")]
    StepExecutionFailure {
        step_order: i32,
        step_type: String,
        #[source]
        source: Box<InstallerError>,
    },

    /// A step's forward operation exceeded its deadline.
    #[error("step {0} timed out")]
    StepTimeout(i32),

    /// Snapshot capture failed; recorded but non-fatal to the transaction.
    #[error("snapshot capture failed for step {0}: {1}")]
    SnapshotFailure(i32, String),

    /// A single step's reverse operation failed during rollback.
    #[error("rollback of step {0} failed: {1}")]
    RollbackStepFailure(i32, String),

    /// The advisory host-wide lock could not be acquired.
    #[error("another installer process holds the advisory lock at `{0}`")]
    EngineBusy(String),

    /// The journal was asked to perform a transition that is never legal.
    #[error("invalid state transition for transaction {transaction_id}: {from} -> {to}")]
    InvalidStateTransition {
        transaction_id: i64,
        from: String,
        to: String,
    },

    /// Caller invoked an engine operation without a current transaction, or
    /// attempted to begin one while another is already open.
    #[error("transaction error: {0}")]
    TransactionError(String),

    /// Step kind has no registered handler.
    #[error("no handler registered for step kind `{0}`")]
    UnregisteredHandler(String),

    /// Transaction, step, or snapshot row not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A cooperative cancel signal was observed after the step's forward
    /// call returned; the step is treated as failed and rollback proceeds.
    #[error("step {0} cancelled")]
    Cancelled(i32),

    /// I/O error from underlying filesystem or subprocess interaction.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Database error surfaced directly from the storage layer.
    #[error("database error: {0}")]
    DbError(#[from] sea_orm::DbErr),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// YAML (de)serialization error.
    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// Generic custom error for miscellaneous failures.
    #[error("{0}")]
    CustomError(String),
}

impl InstallerError {
    pub fn validation(path: impl Into<String>, message: impl Into<String>) -> Self {
        InstallerError::ValidationFailure {
            path: path.into(),
            message: message.into(),
        }
    }
}
