//! Structural and per-step validation (SPEC_FULL.md §4.1).
//!
//! Top-level structure and step-kind shape are already enforced by
//! `serde`'s strict deserialization (`deny_unknown_fields`, the tagged
//! `Step` enum); this module adds the checks serde's shape-only validation
//! can't express: identifier/version patterns, non-empty required
//! collections, and value-range constraints.

use crate::errors::InstallerError;
use crate::utils::{is_package_name, is_semver, is_username, parse_octal_mode};

use super::step::StepBody;
use super::Manifest;

const VALID_ARCHITECTURES: &[&str] = &["amd64", "arm64", "i386"];

pub fn validate(manifest: &Manifest) -> Result<(), InstallerError> {
    validate_package(manifest)?;
    validate_requirements(manifest)?;

    if manifest.install_steps.is_empty() {
        return Err(InstallerError::validation(
            "/install_steps",
            "must be a non-empty sequence",
        ));
    }

    for (idx, step) in manifest.pre_install.iter().enumerate() {
        validate_step(&format!("/pre_install/{idx}"), step)?;
    }
    for (idx, step) in manifest.install_steps.iter().enumerate() {
        validate_step(&format!("/install_steps/{idx}"), step)?;
    }
    for (idx, step) in manifest.post_install.iter().enumerate() {
        validate_step(&format!("/post_install/{idx}"), step)?;
    }

    Ok(())
}

fn validate_package(manifest: &Manifest) -> Result<(), InstallerError> {
    let package = &manifest.package;
    if !is_package_name(&package.name) {
        return Err(InstallerError::validation(
            "/package/name",
            format!("`{}` does not match [A-Za-z0-9_-]+", package.name),
        ));
    }
    if !is_semver(&package.version) {
        return Err(InstallerError::validation(
            "/package/version",
            format!(
                "`{}` is not MAJOR.MINOR.PATCH[-PRERELEASE]",
                package.version
            ),
        ));
    }
    Ok(())
}

fn validate_requirements(manifest: &Manifest) -> Result<(), InstallerError> {
    for arch in &manifest.requirements.architectures {
        if !VALID_ARCHITECTURES.contains(&arch.as_str()) {
            return Err(InstallerError::validation(
                "/requirements/architectures",
                format!("unsupported architecture `{arch}`"),
            ));
        }
    }
    Ok(())
}

fn validate_step(path: &str, step: &super::Step) -> Result<(), InstallerError> {
    match &step.body {
        StepBody::AptPackage(s) => {
            if s.packages.is_empty() {
                return Err(InstallerError::validation(
                    format!("{path}/packages"),
                    "must be a non-empty set of package names",
                ));
            }
            for name in &s.packages {
                if !is_package_name(name) {
                    return Err(InstallerError::validation(
                        format!("{path}/packages"),
                        format!("`{name}` does not match [A-Za-z0-9_-]+"),
                    ));
                }
            }
        }
        StepBody::FileCopy(s) => {
            if s.src.is_empty() || s.dest.is_empty() {
                return Err(InstallerError::validation(
                    path,
                    "file_copy requires non-empty `src` and `dest`",
                ));
            }
            if let Some(mode) = &s.mode {
                if parse_octal_mode(mode).is_none() {
                    return Err(InstallerError::validation(
                        format!("{path}/mode"),
                        format!("`{mode}` is not a 3-4 digit octal mode"),
                    ));
                }
            }
        }
        StepBody::SystemdService(s) => {
            if s.service.is_empty() {
                return Err(InstallerError::validation(
                    format!("{path}/service"),
                    "must not be empty",
                ));
            }
        }
        StepBody::UserManagement(s) => {
            if !is_username(&s.username) {
                return Err(InstallerError::validation(
                    format!("{path}/username"),
                    format!(
                        "`{}` does not match [A-Za-z_][A-Za-z0-9_-]*",
                        s.username
                    ),
                ));
            }
        }
        StepBody::AnsiblePlaybook(s) => {
            if s.playbook.is_empty() {
                return Err(InstallerError::validation(
                    format!("{path}/playbook"),
                    "must not be empty",
                ));
            }
        }
    }
    Ok(())
}
