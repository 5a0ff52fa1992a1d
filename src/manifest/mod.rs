//! Manifest model, parser, and validator (SPEC_FULL.md §4.1).
//!
//! A manifest is accepted in either of two equivalent textual encodings — a
//! human-oriented indentation-based form (YAML, via `serde_yaml`) or an
//! object-notation form (JSON, via `serde_json`) — and deserializes to the
//! same [`Manifest`] value either way.

pub mod step;
pub mod validator;

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

pub use step::{RollbackPolicy, Step, StepBody, StepKind};

use crate::errors::InstallerError;
use crate::hash::ContentHash;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Package {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub license: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Requirements {
    #[serde(default)]
    pub min_memory_mb: Option<u64>,
    #[serde(default)]
    pub min_disk_mb: Option<u64>,
    #[serde(default)]
    pub os_version: Option<String>,
    #[serde(default)]
    pub architectures: BTreeSet<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    pub package: Package,
    pub install_steps: Vec<Step>,
    #[serde(default)]
    pub pre_install: Vec<Step>,
    #[serde(default)]
    pub post_install: Vec<Step>,
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    #[serde(default)]
    pub conflicts: BTreeSet<String>,
    #[serde(default)]
    pub requirements: Requirements,
}

impl Manifest {
    /// Parse a manifest from text, trying JSON first (it's a strict subset
    /// check — a JSON document is also technically valid YAML, but trying
    /// JSON first keeps error messages accurate for the common case) and
    /// falling back to YAML, then running full validation.
    pub fn parse(content: &str) -> Result<Self, InstallerError> {
        let manifest = match serde_json::from_str::<Manifest>(content) {
            Ok(m) => m,
            Err(json_err) => serde_yaml::from_str::<Manifest>(content).map_err(|yaml_err| {
                InstallerError::validation(
                    "$",
                    format!("not valid JSON ({json_err}) or YAML ({yaml_err})"),
                )
            })?,
        };
        validator::validate(&manifest)?;
        Ok(manifest)
    }

    pub fn to_json(&self) -> Result<String, InstallerError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn to_yaml(&self) -> Result<String, InstallerError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// SHA-256 of the canonicalised manifest (SPEC_FULL.md §3, §4.5).
    pub fn content_hash(&self) -> ContentHash {
        ContentHash::compute_canonical(self)
    }

    /// A minimal valid manifest for `name`/`version` (SPEC_FULL.md §4.1).
    pub fn template(name: &str, version: &str) -> Self {
        Manifest {
            package: Package {
                name: name.to_string(),
                version: version.to_string(),
                description: Some("Package description".to_string()),
                author: Some("Package author".to_string()),
                license: Some("Package license".to_string()),
            },
            install_steps: vec![Step {
                body: StepBody::AptPackage(step::AptPackageStep {
                    action: step::AptAction::Install,
                    packages: BTreeSet::from(["example-package".to_string()]),
                    update_cache: true,
                }),
                rollback: RollbackPolicy::Auto,
                description: Some("Install example package".to_string()),
            }],
            pre_install: Vec::new(),
            post_install: Vec::new(),
            dependencies: BTreeSet::new(),
            conflicts: BTreeSet::new(),
            requirements: Requirements {
                min_memory_mb: Some(512),
                min_disk_mb: Some(100),
                os_version: Some("11.0".to_string()),
                architectures: BTreeSet::from(["amd64".to_string(), "arm64".to_string()]),
            },
        }
    }

    /// Merge `override_manifest` onto `base`: scalar `package`/`requirements`
    /// fields from the override win, sequence fields concatenate
    /// base-then-override (SPEC_FULL.md §4.1, §8 property tests).
    pub fn merge(base: &Manifest, override_manifest: &Manifest) -> Manifest {
        let package = Package {
            name: override_manifest.package.name.clone(),
            version: override_manifest.package.version.clone(),
            description: override_manifest
                .package
                .description
                .clone()
                .or_else(|| base.package.description.clone()),
            author: override_manifest
                .package
                .author
                .clone()
                .or_else(|| base.package.author.clone()),
            license: override_manifest
                .package
                .license
                .clone()
                .or_else(|| base.package.license.clone()),
        };

        let requirements = Requirements {
            min_memory_mb: override_manifest
                .requirements
                .min_memory_mb
                .or(base.requirements.min_memory_mb),
            min_disk_mb: override_manifest
                .requirements
                .min_disk_mb
                .or(base.requirements.min_disk_mb),
            os_version: override_manifest
                .requirements
                .os_version
                .clone()
                .or_else(|| base.requirements.os_version.clone()),
            architectures: if override_manifest.requirements.architectures.is_empty() {
                base.requirements.architectures.clone()
            } else {
                override_manifest.requirements.architectures.clone()
            },
        };

        let concat = |a: &[Step], b: &[Step]| -> Vec<Step> {
            a.iter().chain(b.iter()).cloned().collect()
        };

        Manifest {
            package,
            install_steps: concat(&base.install_steps, &override_manifest.install_steps),
            pre_install: concat(&base.pre_install, &override_manifest.pre_install),
            post_install: concat(&base.post_install, &override_manifest.post_install),
            dependencies: base
                .dependencies
                .union(&override_manifest.dependencies)
                .cloned()
                .collect(),
            conflicts: base
                .conflicts
                .union(&override_manifest.conflicts)
                .cloned()
                .collect(),
            requirements,
        }
    }
}
