//! The step handler registry (SPEC_FULL.md §4.4): maps a step kind to a
//! capability that can execute a step's forward operation and reverse
//! it given the paired snapshot.
//!
//! Concrete mutation mechanics are adapters behind [`StepHandler`] — the
//! transaction and rollback engines only ever see this trait. The
//! built-in handlers shell out with `tokio::process::Command`, per the
//! subprocess contract in SPEC_FULL.md §9 (argv in, exit code decides
//! success; a non-zero exit becomes `StepExecutionFailure`).

mod builtin;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::errors::InstallerError;
use crate::manifest::{Step, StepKind};
use crate::snapshot::Snapshot;

pub use builtin::{AptPackageHandler, AnsiblePlaybookHandler, FileCopyHandler, SystemdServiceHandler, UserManagementHandler};

/// Result of a handler's reverse operation (SPEC_FULL.md §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReverseOutcome {
    /// The pre-transaction state was restored.
    Reversed,
    /// Nothing needed to change (e.g. the package was already installed).
    NoOp,
    /// Reversal could not be performed; the rollback engine records this
    /// as a failure and the transaction ends `rollback_failed`.
    Unrecoverable,
}

#[async_trait]
pub trait StepHandler: Send + Sync {
    /// Perform the step's mutating action.
    async fn forward(&self, step: &Step) -> Result<(), InstallerError>;

    /// Undo the step's action using the snapshot captured before it ran.
    async fn reverse(&self, step: &Step, snapshot: &Snapshot) -> Result<ReverseOutcome, InstallerError>;
}

/// Maps [`StepKind`] to its handler. Populated with the built-in set at
/// construction; an embedder may substitute handlers for testing.
pub struct HandlerRegistry {
    handlers: HashMap<StepKind, Box<dyn StepHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn with_builtin_handlers() -> Self {
        let mut registry = Self::new();
        registry.register(StepKind::AptPackage, Box::new(AptPackageHandler));
        registry.register(StepKind::FileCopy, Box::new(FileCopyHandler));
        registry.register(StepKind::SystemdService, Box::new(SystemdServiceHandler));
        registry.register(StepKind::UserManagement, Box::new(UserManagementHandler));
        registry.register(StepKind::AnsiblePlaybook, Box::new(AnsiblePlaybookHandler));
        registry
    }

    pub fn register(&mut self, kind: StepKind, handler: Box<dyn StepHandler>) {
        self.handlers.insert(kind, handler);
    }

    pub fn get(&self, kind: StepKind) -> Result<&dyn StepHandler, InstallerError> {
        self.handlers
            .get(&kind)
            .map(|h| h.as_ref())
            .ok_or_else(|| InstallerError::UnregisteredHandler(kind.to_string()))
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::with_builtin_handlers()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_has_all_five_kinds() {
        let registry = HandlerRegistry::with_builtin_handlers();
        for kind in [
            StepKind::AptPackage,
            StepKind::FileCopy,
            StepKind::SystemdService,
            StepKind::UserManagement,
            StepKind::AnsiblePlaybook,
        ] {
            assert!(registry.get(kind).is_ok());
        }
    }

    #[test]
    fn empty_registry_reports_unregistered_handler() {
        let registry = HandlerRegistry::new();
        let err = registry.get(StepKind::AptPackage).unwrap_err();
        assert!(matches!(err, InstallerError::UnregisteredHandler(_)));
    }
}
