//! Target model derived from the `codemodel` reply
//!
//! The reply is shaped as configurations → projects → targets. Only the
//! configuration matching the active build variant is considered.

use crate::error::CodeModelError;
use crate::types::{ModelStatus, Target, TargetKind, ALL_TARGET};
use serde::Deserialize;
use std::collections::HashSet;
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
struct RawCodeModel {
    #[serde(default)]
    configurations: Vec<RawConfiguration>,
}

#[derive(Debug, Deserialize)]
struct RawConfiguration {
    #[serde(default)]
    name: String,
    #[serde(default)]
    projects: Vec<RawProject>,
}

#[derive(Debug, Deserialize)]
struct RawProject {
    #[serde(default)]
    targets: Vec<RawTarget>,
}

#[derive(Debug, Deserialize)]
struct RawTarget {
    name: String,
    #[serde(rename = "type", default)]
    type_name: String,
}

/// Snapshot of the buildable targets of the active configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetModel {
    targets: Vec<Target>,
    status: ModelStatus,
}

impl Default for TargetModel {
    fn default() -> Self {
        Self {
            targets: Vec::new(),
            status: ModelStatus::NotLoaded,
        }
    }
}

impl TargetModel {
    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    pub fn status(&self) -> ModelStatus {
        self.status
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Target> {
        self.targets.iter().find(|t| t.name == name)
    }

    /// Names callers may build: the synthetic `[all]` first, then every
    /// target in code model order.
    pub fn target_names(&self) -> Vec<String> {
        std::iter::once(ALL_TARGET.to_string())
            .chain(self.targets.iter().map(|t| t.name.clone()))
            .collect()
    }

    /// Parse a `codemodel` reply payload for `variant`.
    ///
    /// `Err(ConfigurationNotFound)` means the caller keeps its previous
    /// model. `Err(NoTargets)` comes with nothing usable; callers replace
    /// their model with [`TargetModel::no_usable_targets`].
    pub fn parse(payload: &serde_json::Value, variant: &str) -> Result<Self, CodeModelError> {
        let raw: RawCodeModel = serde_json::from_value(payload.clone())
            .map_err(|e| CodeModelError::Malformed(e.to_string()))?;

        let configuration = raw
            .configurations
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(variant))
            .ok_or_else(|| CodeModelError::ConfigurationNotFound {
                variant: variant.to_string(),
                available: raw.configurations.iter().map(|c| c.name.clone()).collect(),
            })?;

        let mut seen = HashSet::new();
        let mut targets = Vec::new();
        let mut unsupported = 0usize;

        for target in configuration.projects.iter().flat_map(|p| p.targets.iter()) {
            let kind = TargetKind::from_cmake(&target.type_name);
            if !kind.is_supported() {
                debug!(
                    "Skipping target {} of unsupported type {}",
                    target.name, target.type_name
                );
                unsupported += 1;
                continue;
            }
            if !seen.insert(target.name.clone()) {
                continue;
            }
            targets.push(Target::new(target.name.clone(), kind));
        }

        if targets.is_empty() {
            warn!(
                "Configuration {} has no usable targets ({} unsupported)",
                configuration.name, unsupported
            );
            return Err(CodeModelError::NoTargets {
                configuration: configuration.name.clone(),
                unsupported,
            });
        }

        debug!(
            "Code model for {}: {} targets, {} unsupported",
            configuration.name,
            targets.len(),
            unsupported
        );

        Ok(Self {
            targets,
            status: ModelStatus::Ready,
        })
    }

    /// Model for a configuration that exists but has nothing buildable
    pub fn no_usable_targets() -> Self {
        Self {
            targets: Vec::new(),
            status: ModelStatus::NoUsableTargets,
        }
    }
}
