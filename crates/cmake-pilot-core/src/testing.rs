//! In-memory collaborators for unit tests

use crate::context::{
    BuildPaths, Collaborators, Confirm, GeneratorProvider, LogSink, ToolchainProvider,
    VariantStore,
};
use crate::types::{GlobalCapabilities, Generator, Toolchain};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug)]
struct Inner {
    toolchain: Option<Toolchain>,
    generator: Option<Generator>,
    capabilities: Option<GlobalCapabilities>,
    variant: String,
    target: Option<String>,
    configurations: Vec<String>,
    source_dir: PathBuf,
    build_dir: PathBuf,
    cmake: PathBuf,
    jobs: usize,
    logged: Vec<String>,
    accept_unknown_version: bool,
}

/// Shared, mutable fake context. Clones observe the same state.
#[derive(Debug, Clone)]
pub struct TestContext(Arc<Mutex<Inner>>);

impl TestContext {
    pub fn new() -> Self {
        let mut toolchain = Toolchain::new("gcc", "/usr/bin/gcc");
        toolchain.cxx_compiler_path = Some("/usr/bin/g++".into());
        toolchain.env.insert("CC".to_string(), "gcc".to_string());

        Self(Arc::new(Mutex::new(Inner {
            toolchain: Some(toolchain),
            generator: Some(Generator::new("Ninja")),
            capabilities: None,
            variant: "Debug".to_string(),
            target: None,
            configurations: vec!["Debug".to_string(), "Release".to_string()],
            source_dir: PathBuf::from("/work"),
            build_dir: PathBuf::from("/work/build"),
            cmake: PathBuf::from("cmake"),
            jobs: 4,
            logged: Vec::new(),
            accept_unknown_version: false,
        })))
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators::from_shared(Arc::new(self.clone()))
    }

    pub fn log_sink(&self) -> Arc<dyn LogSink> {
        Arc::new(self.clone())
    }

    pub fn set_toolchain(&self, toolchain: Option<Toolchain>) {
        self.0.lock().toolchain = toolchain;
    }

    pub fn set_generator(&self, generator: Option<Generator>) {
        self.0.lock().generator = generator;
    }

    pub fn set_variant(&self, variant: &str) {
        self.0.lock().variant = variant.to_string();
    }

    pub fn set_target(&self, target: Option<&str>) {
        self.0.lock().target = target.map(str::to_string);
    }

    pub fn set_build_dir(&self, dir: impl Into<PathBuf>) {
        self.0.lock().build_dir = dir.into();
    }

    pub fn set_accept_unknown_version(&self, accept: bool) {
        self.0.lock().accept_unknown_version = accept;
    }

    pub fn capabilities(&self) -> Option<GlobalCapabilities> {
        self.0.lock().capabilities.clone()
    }

    pub fn logged(&self) -> Vec<String> {
        self.0.lock().logged.clone()
    }
}

impl ToolchainProvider for TestContext {
    fn selected_toolchain(&self) -> Option<Toolchain> {
        self.0.lock().toolchain.clone()
    }
}

impl GeneratorProvider for TestContext {
    fn selected_generator(&self) -> Option<Generator> {
        self.0.lock().generator.clone()
    }

    fn update_capabilities(&self, capabilities: GlobalCapabilities) {
        self.0.lock().capabilities = Some(capabilities);
    }
}

impl VariantStore for TestContext {
    fn active_variant(&self) -> String {
        self.0.lock().variant.clone()
    }

    fn active_target(&self) -> Option<String> {
        self.0.lock().target.clone()
    }

    fn configurations(&self) -> Vec<String> {
        self.0.lock().configurations.clone()
    }
}

impl BuildPaths for TestContext {
    fn source_dir(&self) -> PathBuf {
        self.0.lock().source_dir.clone()
    }

    fn build_dir(&self) -> PathBuf {
        self.0.lock().build_dir.clone()
    }

    fn cmake_path(&self) -> PathBuf {
        self.0.lock().cmake.clone()
    }

    fn parallel_jobs(&self) -> usize {
        self.0.lock().jobs
    }
}

impl LogSink for TestContext {
    fn log(&self, line: &str) {
        self.0.lock().logged.push(line.to_string());
    }

    fn debug(&self, _line: &str) {}
}

impl Confirm for TestContext {
    fn confirm_unknown_version(&self, _version_output: &str) -> bool {
        self.0.lock().accept_unknown_version
    }
}
