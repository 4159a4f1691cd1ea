//! Collaborator interfaces the core reads its configuration context from
//!
//! Every value is fetched at the moment a request or invocation is built
//! and never cached by the engine.

use crate::types::{GlobalCapabilities, Generator, Toolchain};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// Supplies the toolchain used to configure
#[cfg_attr(test, mockall::automock)]
pub trait ToolchainProvider: Send + Sync {
    fn selected_toolchain(&self) -> Option<Toolchain>;
}

/// Supplies the generator and receives the server's generator capabilities
#[cfg_attr(test, mockall::automock)]
pub trait GeneratorProvider: Send + Sync {
    fn selected_generator(&self) -> Option<Generator>;
    fn update_capabilities(&self, capabilities: GlobalCapabilities);
}

/// Build variant and target selection
#[cfg_attr(test, mockall::automock)]
pub trait VariantStore: Send + Sync {
    fn active_variant(&self) -> String;
    fn active_target(&self) -> Option<String>;
    fn configurations(&self) -> Vec<String>;
}

/// Resolvers for directories, the cmake executable and parallelism
#[cfg_attr(test, mockall::automock)]
pub trait BuildPaths: Send + Sync {
    fn source_dir(&self) -> PathBuf;
    fn build_dir(&self) -> PathBuf;
    fn cmake_path(&self) -> PathBuf;
    fn parallel_jobs(&self) -> usize;
}

/// User-facing output lines
#[cfg_attr(test, mockall::automock)]
pub trait LogSink: Send + Sync {
    fn log(&self, line: &str);
    fn debug(&self, line: &str);
}

/// Policy decisions that need the caller's consent
#[cfg_attr(test, mockall::automock)]
pub trait Confirm: Send + Sync {
    /// The cmake version could not be parsed; return true to continue anyway
    fn confirm_unknown_version(&self, version_output: &str) -> bool;
}

/// The full set of collaborators handed to the engine and controller
#[derive(Clone)]
pub struct Collaborators {
    pub toolchains: Arc<dyn ToolchainProvider>,
    pub generators: Arc<dyn GeneratorProvider>,
    pub variants: Arc<dyn VariantStore>,
    pub paths: Arc<dyn BuildPaths>,
    pub log: Arc<dyn LogSink>,
    pub confirm: Arc<dyn Confirm>,
}

impl Collaborators {
    /// Use one object for every role
    pub fn from_shared<T>(context: Arc<T>) -> Self
    where
        T: ToolchainProvider
            + GeneratorProvider
            + VariantStore
            + BuildPaths
            + LogSink
            + Confirm
            + 'static,
    {
        Self {
            toolchains: context.clone(),
            generators: context.clone(),
            variants: context.clone(),
            paths: context.clone(),
            log: context.clone(),
            confirm: context,
        }
    }
}

/// Log sink that forwards to `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn log(&self, line: &str) {
        info!(target: "cmake", "{}", line);
    }

    fn debug(&self, line: &str) {
        debug!(target: "cmake", "{}", line);
    }
}
