//! Project settings and the collaborator context built from them
//!
//! Settings are read from a JSON file (camelCase keys, every field
//! optional). The lookup order is:
//! 1. An explicit path (`--settings`)
//! 2. `<source>/.cmake-pilot.json`
//! 3. `<config dir>/cmake-pilot/settings.json`
//! 4. Built-in defaults

use crate::context::{
    BuildPaths, Collaborators, Confirm, GeneratorProvider, LogSink, ToolchainProvider,
    TracingLogSink, VariantStore,
};
use crate::error::{ConfigError, Result};
use crate::types::{Generator, GlobalCapabilities, Toolchain};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Settings file looked up in the source directory
pub const PROJECT_SETTINGS_FILE: &str = ".cmake-pilot.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Settings {
    /// CMake executable
    pub cmake_path: PathBuf,
    pub source_directory: PathBuf,
    /// Relative paths are resolved against the source directory
    pub build_directory: PathBuf,
    /// Build variants offered to the user
    pub configurations: Vec<String>,
    pub default_variant: String,
    pub default_target: Option<String>,
    pub parallel_jobs: usize,
    pub toolchains: Vec<Toolchain>,
    /// Name of the toolchain to use; the first one when unset
    pub selected_toolchain: Option<String>,
    pub generator: Option<Generator>,
    /// Environment applied under every toolchain's own overlay
    pub environment: HashMap<String, String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cmake_path: PathBuf::from("cmake"),
            source_directory: PathBuf::from("."),
            build_directory: PathBuf::from("build"),
            configurations: ["Debug", "Release", "MinSizeRel", "RelWithDebInfo"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            default_variant: "Debug".to_string(),
            default_target: None,
            parallel_jobs: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            toolchains: Vec::new(),
            selected_toolchain: None,
            generator: None,
            environment: HashMap::new(),
        }
    }
}

impl Settings {
    /// Read and validate a settings file. Relative directories are
    /// resolved against the file's parent directory.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let mut settings: Settings =
            serde_json::from_str(&content).map_err(|e| ConfigError::Invalid {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        if settings.source_directory.is_relative() {
            settings.source_directory = base.join(&settings.source_directory);
        }
        settings.validate()?;
        debug!("Loaded settings from {}", path.display());
        Ok(settings)
    }

    /// Locate settings for a project rooted at `source_dir`
    pub fn discover(explicit: Option<&Path>, source_dir: &Path) -> Result<Self> {
        if let Some(path) = explicit {
            info!("Using settings file {}", path.display());
            return Self::load(path);
        }

        let candidates = std::iter::once(source_dir.join(PROJECT_SETTINGS_FILE)).chain(
            dirs::config_dir().map(|dir| dir.join("cmake-pilot").join("settings.json")),
        );
        for candidate in candidates {
            if candidate.is_file() {
                info!("Using settings file {}", candidate.display());
                let mut settings = Self::load(&candidate)?;
                if !candidate.starts_with(source_dir) {
                    // A user-wide file does not pin the project
                    settings.source_directory = source_dir.to_path_buf();
                }
                return Ok(settings);
            }
        }

        debug!("No settings file found, using defaults");
        Ok(Self {
            source_directory: source_dir.to_path_buf(),
            ..Self::default()
        })
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if let Some(name) = &self.selected_toolchain {
            if !self.toolchains.iter().any(|t| &t.name == name) {
                return Err(ConfigError::UnknownToolchain(name.clone()));
            }
        }
        if !self.has_configuration(&self.default_variant) {
            return Err(ConfigError::UnknownConfiguration(
                self.default_variant.clone(),
            ));
        }
        Ok(())
    }

    pub fn has_configuration(&self, name: &str) -> bool {
        self.configurations
            .iter()
            .any(|c| c.eq_ignore_ascii_case(name))
    }

    pub fn build_dir(&self) -> PathBuf {
        if self.build_directory.is_absolute() {
            self.build_directory.clone()
        } else {
            self.source_directory.join(&self.build_directory)
        }
    }
}

/// Collaborator context backed by [`Settings`] and the user's current
/// selections.
pub struct SettingsContext {
    settings: Settings,
    variant: RwLock<String>,
    target: RwLock<Option<String>>,
    toolchain: RwLock<Option<String>>,
    capabilities: RwLock<Option<GlobalCapabilities>>,
    accept_unknown_version: bool,
    log: TracingLogSink,
}

impl SettingsContext {
    pub fn new(settings: Settings) -> Self {
        Self {
            variant: RwLock::new(settings.default_variant.clone()),
            target: RwLock::new(settings.default_target.clone()),
            toolchain: RwLock::new(settings.selected_toolchain.clone()),
            capabilities: RwLock::new(None),
            accept_unknown_version: false,
            log: TracingLogSink,
            settings,
        }
    }

    /// Continue when `cmake --version` output cannot be parsed
    pub fn accept_unknown_version(mut self, accept: bool) -> Self {
        self.accept_unknown_version = accept;
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn collaborators(self: &Arc<Self>) -> Collaborators {
        Collaborators::from_shared(Arc::clone(self))
    }

    pub fn set_variant(&self, variant: &str) -> std::result::Result<(), ConfigError> {
        let Some(name) = self
            .settings
            .configurations
            .iter()
            .find(|c| c.eq_ignore_ascii_case(variant))
        else {
            return Err(ConfigError::UnknownConfiguration(variant.to_string()));
        };
        *self.variant.write() = name.clone();
        Ok(())
    }

    pub fn set_target(&self, target: Option<String>) {
        *self.target.write() = target;
    }

    pub fn select_toolchain(&self, name: &str) -> std::result::Result<(), ConfigError> {
        if !self.settings.toolchains.iter().any(|t| t.name == name) {
            return Err(ConfigError::UnknownToolchain(name.to_string()));
        }
        *self.toolchain.write() = Some(name.to_string());
        Ok(())
    }

    /// Capabilities reported by the last `globalSettings` reply
    pub fn capabilities(&self) -> Option<GlobalCapabilities> {
        self.capabilities.read().clone()
    }
}

impl ToolchainProvider for SettingsContext {
    fn selected_toolchain(&self) -> Option<Toolchain> {
        let selected = self.toolchain.read().clone();
        let toolchain = match selected {
            Some(name) => self.settings.toolchains.iter().find(|t| t.name == name),
            None => self.settings.toolchains.first(),
        }?;

        let mut toolchain = toolchain.clone();
        for (key, value) in &self.settings.environment {
            toolchain
                .env
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
        Some(toolchain)
    }
}

impl GeneratorProvider for SettingsContext {
    fn selected_generator(&self) -> Option<Generator> {
        self.settings.generator.clone()
    }

    fn update_capabilities(&self, capabilities: GlobalCapabilities) {
        if let Some(generator) = &self.settings.generator {
            if !capabilities.supports_generator(&generator.name) {
                warn!(
                    "CMake does not list generator {} among its capabilities",
                    generator.name
                );
            }
        }
        *self.capabilities.write() = Some(capabilities);
    }
}

impl VariantStore for SettingsContext {
    fn active_variant(&self) -> String {
        self.variant.read().clone()
    }

    fn active_target(&self) -> Option<String> {
        self.target.read().clone()
    }

    fn configurations(&self) -> Vec<String> {
        self.settings.configurations.clone()
    }
}

impl BuildPaths for SettingsContext {
    fn source_dir(&self) -> PathBuf {
        self.settings.source_directory.clone()
    }

    fn build_dir(&self) -> PathBuf {
        self.settings.build_dir()
    }

    fn cmake_path(&self) -> PathBuf {
        self.settings.cmake_path.clone()
    }

    fn parallel_jobs(&self) -> usize {
        self.settings.parallel_jobs.max(1)
    }
}

impl LogSink for SettingsContext {
    fn log(&self, line: &str) {
        self.log.log(line);
    }

    fn debug(&self, line: &str) {
        self.log.debug(line);
    }
}

impl Confirm for SettingsContext {
    fn confirm_unknown_version(&self, version_output: &str) -> bool {
        if self.accept_unknown_version {
            warn!("Unrecognized cmake version output: {}", version_output.trim());
        }
        self.accept_unknown_version
    }
}
