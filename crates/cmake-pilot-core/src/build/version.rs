//! `cmake --version` probing
//!
//! Server mode with protocol 1 appeared in CMake 3.7, so older binaries are
//! refused before any server is spawned.

use crate::context::Confirm;
use crate::error::{Error, Result, StartupError};
use async_trait::async_trait;
use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Oldest CMake with a usable server mode
pub const MINIMUM_VERSION: CmakeVersion = CmakeVersion {
    major: 3,
    minor: 7,
    patch: 0,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CmakeVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl std::fmt::Display for CmakeVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

fn version_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"cmake\d*\s+version\s+(\d+)\.(\d+)(?:\.(\d+))?").ok())
        .as_ref()
}

/// Extract the version from `cmake --version` output
pub fn parse_version(output: &str) -> Option<CmakeVersion> {
    let caps = version_regex()?.captures(output)?;
    let number = |i: usize| caps.get(i).and_then(|m| m.as_str().parse::<u32>().ok());
    Some(CmakeVersion {
        major: number(1)?,
        minor: number(2)?,
        patch: number(3).unwrap_or(0),
    })
}

/// What a query found out about a cmake binary
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionOutcome {
    Version(CmakeVersion),
    /// The binary ran but its output had no recognizable version
    Unrecognized(String),
}

/// Runs `<cmake> --version`
#[async_trait]
pub trait VersionQuery: Send + Sync {
    async fn query(&self, cmake: &Path) -> Result<VersionOutcome>;
}

#[derive(Debug, Default, Clone)]
pub struct CommandVersionQuery;

#[async_trait]
impl VersionQuery for CommandVersionQuery {
    async fn query(&self, cmake: &Path) -> Result<VersionOutcome> {
        let output = Command::new(cmake)
            .arg("--version")
            .output()
            .await
            .map_err(|e| {
                Error::Startup(StartupError::SpawnFailed {
                    command: cmake.display().to_string(),
                    reason: e.to_string(),
                })
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        debug!("{} --version: {}", cmake.display(), stdout.trim());
        Ok(match parse_version(&stdout) {
            Some(version) => VersionOutcome::Version(version),
            None => VersionOutcome::Unrecognized(stdout),
        })
    }
}

/// Query `cmake` and enforce [`MINIMUM_VERSION`]. An unrecognized version
/// is accepted only when `confirm` agrees.
pub async fn check_version(
    query: &dyn VersionQuery,
    cmake: &Path,
    confirm: &dyn Confirm,
) -> Result<Option<CmakeVersion>> {
    match query.query(cmake).await? {
        VersionOutcome::Version(version) if version < MINIMUM_VERSION => {
            warn!("CMake {} is older than {}", version, MINIMUM_VERSION);
            Err(StartupError::VersionTooOld {
                found: version.to_string(),
                required: MINIMUM_VERSION.to_string(),
            }
            .into())
        }
        VersionOutcome::Version(version) => {
            info!("Using CMake {}", version);
            Ok(Some(version))
        }
        VersionOutcome::Unrecognized(output) => {
            if confirm.confirm_unknown_version(&output) {
                warn!("Continuing with unrecognized CMake version");
                Ok(None)
            } else {
                Err(StartupError::VersionUnconfirmed(output.trim().to_string()).into())
            }
        }
    }
}
