//! Build verbs on top of the server session
//!
//! - `controller` - The `BuildController` façade and its driver task
//! - `invocation` - `cmake --build` command lines and the runner that executes them
//! - `version` - `cmake --version` probing

pub mod controller;
pub mod invocation;
pub mod version;

pub use controller::BuildController;
pub use invocation::{
    BuildAction, BuildInvocation, BuildRunner, ProcessBuildRunner, DEFAULT_GENERATOR,
};
pub use version::{
    check_version, parse_version, CmakeVersion, CommandVersionQuery, VersionOutcome, VersionQuery,
    MINIMUM_VERSION,
};
