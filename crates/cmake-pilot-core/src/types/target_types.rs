//! Buildable target types

use serde::{Deserialize, Serialize};

/// Synthetic target that builds everything
pub const ALL_TARGET: &str = "[all]";

/// Kind of a buildable target as reported by the code model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Executable,
    SharedLibrary,
    StaticLibrary,
    Utility,
    Unsupported,
}

impl TargetKind {
    /// Map the `type` string CMake reports for a target
    pub fn from_cmake(type_name: &str) -> Self {
        match type_name {
            "EXECUTABLE" => Self::Executable,
            "SHARED_LIBRARY" => Self::SharedLibrary,
            "STATIC_LIBRARY" => Self::StaticLibrary,
            "UTILITY" => Self::Utility,
            _ => Self::Unsupported,
        }
    }

    pub fn is_supported(&self) -> bool {
        !matches!(self, Self::Unsupported)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub name: String,
    pub kind: TargetKind,
}

impl Target {
    pub fn new(name: impl Into<String>, kind: TargetKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// Whether the target model reflects a usable code model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelStatus {
    /// No code model has been parsed yet
    NotLoaded,
    /// The active configuration yielded at least one target
    Ready,
    /// The active configuration was found but nothing in it is buildable
    NoUsableTargets,
}
