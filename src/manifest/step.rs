//! The closed `Step` variant set (SPEC_FULL.md §4.1, §9 redesign flag:
//! dispatch becomes exhaustive pattern matching instead of a string-keyed
//! table, so an unknown `type` is a deserialization error rather than a
//! runtime `UnknownStepType` case).

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

/// Discriminant used by the handler registry and journal `step_type`
/// column. Kept separate from `Step` so the registry can key on it without
/// holding a full step value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StepKind {
    AptPackage,
    FileCopy,
    SystemdService,
    UserManagement,
    AnsiblePlaybook,
}

impl StepKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            StepKind::AptPackage => "apt_package",
            StepKind::FileCopy => "file_copy",
            StepKind::SystemdService => "systemd_service",
            StepKind::UserManagement => "user_management",
            StepKind::AnsiblePlaybook => "ansible_playbook",
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-step rollback policy (SPEC_FULL.md §3; schema-level values are
/// authoritative per the §9 open-question resolution).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RollbackPolicy {
    #[default]
    Auto,
    Manual,
    Ansible,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AptPackageStep {
    pub action: AptAction,
    pub packages: BTreeSet<String>,
    #[serde(default = "default_true")]
    pub update_cache: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AptAction {
    Install,
    Remove,
    Update,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileCopyStep {
    pub src: String,
    pub dest: String,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub mode: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SystemdServiceStep {
    pub service: String,
    pub action: ServiceAction,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ServiceAction {
    Enable,
    Disable,
    Start,
    Stop,
    Restart,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserManagementStep {
    pub username: String,
    pub action: UserAction,
    #[serde(default)]
    pub user_data: Option<UserData>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UserAction {
    Create,
    Remove,
    Modify,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct UserData {
    #[serde(default)]
    pub home: Option<String>,
    #[serde(default)]
    pub shell: Option<String>,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub system: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AnsiblePlaybookStep {
    pub playbook: String,
    #[serde(default)]
    pub rollback_playbook: Option<String>,
    #[serde(default)]
    pub vars: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub inventory: Option<String>,
}

/// One typed unit of host mutation. Tagged on `type`; unknown tags fail to
/// deserialize rather than falling through to a catch-all variant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepBody {
    AptPackage(AptPackageStep),
    FileCopy(FileCopyStep),
    SystemdService(SystemdServiceStep),
    UserManagement(UserManagementStep),
    AnsiblePlaybook(AnsiblePlaybookStep),
}

impl StepBody {
    pub fn kind(&self) -> StepKind {
        match self {
            StepBody::AptPackage(_) => StepKind::AptPackage,
            StepBody::FileCopy(_) => StepKind::FileCopy,
            StepBody::SystemdService(_) => StepKind::SystemdService,
            StepBody::UserManagement(_) => StepKind::UserManagement,
            StepBody::AnsiblePlaybook(_) => StepKind::AnsiblePlaybook,
        }
    }
}

/// A manifest step: the typed body plus the rollback policy and optional
/// human description carried by every step (SPEC_FULL.md §3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Step {
    #[serde(flatten)]
    pub body: StepBody,
    #[serde(default)]
    pub rollback: RollbackPolicy,
    #[serde(default)]
    pub description: Option<String>,
}

impl Step {
    pub fn kind(&self) -> StepKind {
        self.body.kind()
    }
}
