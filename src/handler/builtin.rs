//! Built-in handlers, one per step kind, mutating the host via
//! subprocess invocations (SPEC_FULL.md §9 subprocess contract).

use async_trait::async_trait;
use tokio::process::Command;

use crate::errors::InstallerError;
use crate::manifest::step::{AptAction, ServiceAction, UserAction};
use crate::manifest::{Step, StepBody};
use crate::snapshot::Snapshot;

use super::{ReverseOutcome, StepHandler};

fn mismatched_snapshot(step_kind: &str) -> InstallerError {
    InstallerError::CustomError(format!("{step_kind} handler received a mismatched snapshot"))
}

/// Run `command` to completion; a non-zero exit becomes a plain error.
/// The engine, which knows the step's order, wraps this into
/// `StepExecutionFailure` when driving `forward`/`reverse`.
async fn run(mut command: Command) -> Result<(), InstallerError> {
    let status = command.status().await?;
    if status.success() {
        Ok(())
    } else {
        Err(InstallerError::CustomError(format!(
            "command exited with {status}"
        )))
    }
}

pub struct AptPackageHandler;

#[async_trait]
impl StepHandler for AptPackageHandler {
    async fn forward(&self, step: &Step) -> Result<(), InstallerError> {
        let StepBody::AptPackage(s) = &step.body else {
            return Err(mismatched_snapshot("apt_package"));
        };
        if s.update_cache {
            let mut update = Command::new("apt-get");
            update.args(["update"]);
            run(update).await?;
        }
        let mut cmd = Command::new("apt-get");
        match s.action {
            AptAction::Install => {
                cmd.arg("install").arg("-y").args(&s.packages);
            }
            AptAction::Remove => {
                cmd.arg("remove").arg("-y").args(&s.packages);
            }
            AptAction::Update => {
                cmd.arg("install").arg("--only-upgrade").arg("-y").args(&s.packages);
            }
        }
        run(cmd).await
    }

    async fn reverse(&self, step: &Step, snapshot: &Snapshot) -> Result<ReverseOutcome, InstallerError> {
        let (StepBody::AptPackage(s), Snapshot::Package(snap)) = (&step.body, snapshot) else {
            return Ok(ReverseOutcome::Unrecoverable);
        };
        match s.action {
            AptAction::Install => {
                let to_remove: Vec<&String> = s.packages.difference(&snap.packages).collect();
                if to_remove.is_empty() {
                    return Ok(ReverseOutcome::NoOp);
                }
                let mut cmd = Command::new("apt-get");
                cmd.arg("remove").arg("-y").args(&to_remove);
                run(cmd).await?;
                Ok(ReverseOutcome::Reversed)
            }
            AptAction::Remove => {
                if snap.packages.is_empty() {
                    return Ok(ReverseOutcome::NoOp);
                }
                let mut cmd = Command::new("apt-get");
                cmd.arg("install").arg("-y").args(&snap.packages);
                run(cmd).await?;
                Ok(ReverseOutcome::Reversed)
            }
            AptAction::Update => Ok(ReverseOutcome::NoOp),
        }
    }
}

pub struct FileCopyHandler;

#[async_trait]
impl StepHandler for FileCopyHandler {
    async fn forward(&self, step: &Step) -> Result<(), InstallerError> {
        let StepBody::FileCopy(s) = &step.body else {
            return Err(mismatched_snapshot("file_copy"));
        };
        tokio::fs::copy(&s.src, &s.dest).await?;
        apply_ownership(&s.dest, s.owner.as_deref(), s.group.as_deref(), s.mode.as_deref()).await
    }

    async fn reverse(&self, step: &Step, snapshot: &Snapshot) -> Result<ReverseOutcome, InstallerError> {
        let (StepBody::FileCopy(s), Snapshot::File(snap)) = (&step.body, snapshot) else {
            return Ok(ReverseOutcome::Unrecoverable);
        };
        if !snap.exists {
            if tokio::fs::metadata(&s.dest).await.is_ok() {
                tokio::fs::remove_file(&s.dest).await?;
            }
            return Ok(ReverseOutcome::Reversed);
        }
        let Some(backup_path) = &snap.backup_path else {
            return Ok(ReverseOutcome::Unrecoverable);
        };
        tokio::fs::copy(backup_path, &s.dest).await?;
        let mode = snap.mode.map(|m| format!("{m:o}"));
        apply_ownership(&s.dest, s.owner.as_deref(), s.group.as_deref(), mode.as_deref()).await?;
        Ok(ReverseOutcome::Reversed)
    }
}

async fn apply_ownership(
    dest: &str,
    owner: Option<&str>,
    group: Option<&str>,
    mode: Option<&str>,
) -> Result<(), InstallerError> {
    if let Some(mode) = mode {
        let mut cmd = Command::new("chmod");
        cmd.arg(mode).arg(dest);
        run(cmd).await?;
    }
    if owner.is_some() || group.is_some() {
        let spec = format!("{}:{}", owner.unwrap_or(""), group.unwrap_or(""));
        let mut cmd = Command::new("chown");
        cmd.arg(spec).arg(dest);
        run(cmd).await?;
    }
    Ok(())
}

pub struct SystemdServiceHandler;

fn action_verb(action: ServiceAction) -> &'static str {
    match action {
        ServiceAction::Enable => "enable",
        ServiceAction::Disable => "disable",
        ServiceAction::Start => "start",
        ServiceAction::Stop => "stop",
        ServiceAction::Restart => "restart",
    }
}

#[async_trait]
impl StepHandler for SystemdServiceHandler {
    async fn forward(&self, step: &Step) -> Result<(), InstallerError> {
        let StepBody::SystemdService(s) = &step.body else {
            return Err(mismatched_snapshot("systemd_service"));
        };
        let mut cmd = Command::new("systemctl");
        cmd.arg(action_verb(s.action)).arg(&s.service);
        run(cmd).await
    }

    async fn reverse(&self, step: &Step, snapshot: &Snapshot) -> Result<ReverseOutcome, InstallerError> {
        let (StepBody::SystemdService(s), Snapshot::Service(snap)) = (&step.body, snapshot) else {
            return Ok(ReverseOutcome::Unrecoverable);
        };
        let complementary = match s.action {
            ServiceAction::Enable if snap.enabled => return Ok(ReverseOutcome::NoOp),
            ServiceAction::Enable => "disable",
            ServiceAction::Disable if !snap.enabled => return Ok(ReverseOutcome::NoOp),
            ServiceAction::Disable => "enable",
            ServiceAction::Start if snap.active => return Ok(ReverseOutcome::NoOp),
            ServiceAction::Start => "stop",
            ServiceAction::Stop if !snap.active => return Ok(ReverseOutcome::NoOp),
            ServiceAction::Stop => "start",
            ServiceAction::Restart => {
                if snap.active {
                    "start"
                } else {
                    "stop"
                }
            }
        };
        let mut cmd = Command::new("systemctl");
        cmd.arg(complementary).arg(&s.service);
        run(cmd).await?;
        Ok(ReverseOutcome::Reversed)
    }
}

pub struct UserManagementHandler;

#[async_trait]
impl StepHandler for UserManagementHandler {
    async fn forward(&self, step: &Step) -> Result<(), InstallerError> {
        let StepBody::UserManagement(s) = &step.body else {
            return Err(mismatched_snapshot("user_management"));
        };
        let cmd = match s.action {
            UserAction::Create => {
                let mut cmd = Command::new("useradd");
                if let Some(data) = &s.user_data {
                    if let Some(home) = &data.home {
                        cmd.arg("-d").arg(home);
                    }
                    if let Some(shell) = &data.shell {
                        cmd.arg("-s").arg(shell);
                    }
                    if !data.groups.is_empty() {
                        cmd.arg("-G").arg(data.groups.join(","));
                    }
                    if data.system {
                        cmd.arg("--system");
                    }
                }
                cmd.arg(&s.username);
                cmd
            }
            UserAction::Remove => {
                let mut cmd = Command::new("userdel");
                cmd.arg("-r").arg(&s.username);
                cmd
            }
            UserAction::Modify => {
                let mut cmd = Command::new("usermod");
                if let Some(data) = &s.user_data {
                    if let Some(home) = &data.home {
                        cmd.arg("-d").arg(home);
                    }
                    if let Some(shell) = &data.shell {
                        cmd.arg("-s").arg(shell);
                    }
                    if !data.groups.is_empty() {
                        cmd.arg("-G").arg(data.groups.join(","));
                    }
                }
                cmd.arg(&s.username);
                cmd
            }
        };
        run(cmd).await
    }

    async fn reverse(&self, step: &Step, snapshot: &Snapshot) -> Result<ReverseOutcome, InstallerError> {
        let (StepBody::UserManagement(s), Snapshot::User(snap)) = (&step.body, snapshot) else {
            return Ok(ReverseOutcome::Unrecoverable);
        };
        match s.action {
            UserAction::Create => {
                let mut cmd = Command::new("userdel");
                cmd.arg("-r").arg(&s.username);
                run(cmd).await?;
                Ok(ReverseOutcome::Reversed)
            }
            UserAction::Remove => {
                let Some(identity) = &snap.identity else {
                    return Ok(ReverseOutcome::Unrecoverable);
                };
                let mut cmd = Command::new("useradd");
                cmd.arg("-u")
                    .arg(identity.uid.to_string())
                    .arg("-g")
                    .arg(identity.gid.to_string())
                    .arg("-d")
                    .arg(&identity.home)
                    .arg("-s")
                    .arg(&identity.shell);
                if !identity.groups.is_empty() {
                    cmd.arg("-G").arg(identity.groups.join(","));
                }
                cmd.arg(&s.username);
                run(cmd).await?;
                Ok(ReverseOutcome::Reversed)
            }
            UserAction::Modify => {
                let Some(identity) = &snap.identity else {
                    return Ok(ReverseOutcome::NoOp);
                };
                let mut cmd = Command::new("usermod");
                cmd.arg("-d")
                    .arg(&identity.home)
                    .arg("-s")
                    .arg(&identity.shell)
                    .arg("-G")
                    .arg(identity.groups.join(","))
                    .arg(&s.username);
                run(cmd).await?;
                Ok(ReverseOutcome::Reversed)
            }
        }
    }
}

pub struct AnsiblePlaybookHandler;

#[async_trait]
impl StepHandler for AnsiblePlaybookHandler {
    async fn forward(&self, step: &Step) -> Result<(), InstallerError> {
        let StepBody::AnsiblePlaybook(s) = &step.body else {
            return Err(mismatched_snapshot("ansible_playbook"));
        };
        run(playbook_command(&s.playbook, &s.inventory, &s.vars)).await
    }

    async fn reverse(&self, step: &Step, _snapshot: &Snapshot) -> Result<ReverseOutcome, InstallerError> {
        let StepBody::AnsiblePlaybook(s) = &step.body else {
            return Ok(ReverseOutcome::Unrecoverable);
        };
        let Some(rollback_playbook) = &s.rollback_playbook else {
            return Ok(ReverseOutcome::Unrecoverable);
        };
        run(playbook_command(rollback_playbook, &s.inventory, &s.vars)).await?;
        Ok(ReverseOutcome::Reversed)
    }
}

fn playbook_command(
    playbook: &str,
    inventory: &Option<String>,
    vars: &std::collections::BTreeMap<String, serde_json::Value>,
) -> Command {
    let mut cmd = Command::new("ansible-playbook");
    cmd.arg(playbook);
    if let Some(inventory) = inventory {
        cmd.arg("-i").arg(inventory);
    }
    if !vars.is_empty() {
        let extra_vars = serde_json::to_string(vars).unwrap_or_default();
        cmd.arg("--extra-vars").arg(extra_vars);
    }
    cmd
}
