//! Configuration context types consumed by the protocol engine

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// A compiler + linker + environment bundle used to configure a build
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Toolchain {
    pub name: String,
    /// C compiler
    pub compiler_path: PathBuf,
    /// C++ compiler, defaults to `compiler_path`
    #[serde(default)]
    pub cxx_compiler_path: Option<PathBuf>,
    #[serde(default)]
    pub linker_path: Option<PathBuf>,
    /// Extra arguments appended to the configure cache arguments
    #[serde(default)]
    pub extra_options: Vec<String>,
    /// Environment overlay applied to the server and to build invocations
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl Toolchain {
    pub fn new(name: impl Into<String>, compiler_path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            compiler_path: compiler_path.into(),
            cxx_compiler_path: None,
            linker_path: None,
            extra_options: Vec::new(),
            env: HashMap::new(),
        }
    }

    pub fn cxx_compiler(&self) -> &PathBuf {
        self.cxx_compiler_path.as_ref().unwrap_or(&self.compiler_path)
    }

    /// Cache arguments for a `configure` request, in the order CMake receives them
    pub fn cache_arguments(&self, variant: &str) -> Vec<String> {
        let mut args = vec![
            format!("-DCMAKE_BUILD_TYPE={}", variant),
            format!("-DCMAKE_C_COMPILER={}", self.compiler_path.display()),
            format!("-DCMAKE_CXX_COMPILER={}", self.cxx_compiler().display()),
        ];
        if let Some(linker) = &self.linker_path {
            args.push(format!("-DCMAKE_LINKER={}", linker.display()));
        }
        args.extend(self.extra_options.iter().cloned());
        args
    }
}

/// The build-file generator CMake should emit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Generator {
    pub name: String,
    /// Trailing arguments handed to the native build tool
    #[serde(default)]
    pub extra_options: Vec<String>,
}

impl Generator {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            extra_options: Vec::new(),
        }
    }

    pub fn family(&self) -> GeneratorFamily {
        GeneratorFamily::from_name(&self.name)
    }
}

/// Native build tool families, which differ in their parallelism flag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneratorFamily {
    Ninja,
    Makefiles,
    VisualStudio,
    Other,
}

impl GeneratorFamily {
    pub fn from_name(name: &str) -> Self {
        if name.contains("Ninja") {
            Self::Ninja
        } else if name.contains("Makefiles") {
            Self::Makefiles
        } else if name.starts_with("Visual Studio") {
            Self::VisualStudio
        } else {
            Self::Other
        }
    }

    pub fn parallel_flag(&self, jobs: usize) -> Option<String> {
        match self {
            Self::Ninja | Self::Makefiles => Some(format!("-j{}", jobs)),
            Self::VisualStudio => Some(format!("/m:{}", jobs)),
            Self::Other => None,
        }
    }
}

/// Capabilities reported by the `globalSettings` reply
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalCapabilities {
    #[serde(default)]
    pub generators: Vec<GeneratorInfo>,
    #[serde(default)]
    pub server_mode: bool,
    #[serde(default)]
    pub version: Option<CapabilityVersion>,
}

impl GlobalCapabilities {
    pub fn supports_generator(&self, name: &str) -> bool {
        self.generators.iter().any(|g| g.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratorInfo {
    pub name: String,
    #[serde(default)]
    pub platform_support: bool,
    #[serde(default)]
    pub toolset_support: bool,
    #[serde(default)]
    pub extra_generators: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityVersion {
    #[serde(default)]
    pub string: String,
    #[serde(default)]
    pub major: u32,
    #[serde(default)]
    pub minor: u32,
}
