//! cmake-pilot Core Library
//!
//! This crate drives a `cmake -E server` process and exposes build verbs on
//! top of it:
//! - Framing and transport for the CMake server protocol (major version 1)
//! - The handshake → configure → compute → codemodel session state machine
//! - The target model of the active build variant
//! - Build, clean and install invocations through `cmake --build`
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     cmake-pilot-core                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  build/        - BuildController, build invocations, cmake  │
//! │  server/       - Codec, transport, protocol engine          │
//! │  codemodel.rs  - Target model from codemodel replies        │
//! │  context.rs    - Collaborator traits                        │
//! │  config.rs     - Settings file and SettingsContext          │
//! │  types/        - Shared type definitions                    │
//! │  error.rs      - Error types                                │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod build;
pub mod codemodel;
pub mod config;
pub mod context;
pub mod error;
pub mod server;
pub mod types;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use error::{Error, Result};
pub use types::*;

pub use build::{BuildAction, BuildController, BuildInvocation};
pub use codemodel::TargetModel;
pub use config::{Settings, SettingsContext};
pub use context::{
    BuildPaths, Collaborators, Confirm, GeneratorProvider, LogSink, ToolchainProvider,
    TracingLogSink, VariantStore,
};
pub use server::{ControllerEvent, EngineSnapshot, SessionState};
