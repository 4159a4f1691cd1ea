//! Error types for cmake-pilot core

use thiserror::Error;

/// Main error type for cmake-pilot operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("Startup error: {0}")]
    Startup(#[from] StartupError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Code model error: {0}")]
    CodeModel(#[from] CodeModelError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Failures that abort a start attempt. The session stays disconnected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StartupError {
    #[error("Could not start {command}: {reason}")]
    SpawnFailed { command: String, reason: String },

    #[error("CMake {found} is too old, at least {required} is required")]
    VersionTooOld { found: String, required: String },

    #[error("Unable to determine the CMake version from: {0}")]
    VersionUnconfirmed(String),

    #[error("Server exited before its endpoint was ready: {0}")]
    ExitedBeforeReady(String),
}

/// Wire-level protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Server does not support protocol major version {required} (offered: {offered:?})")]
    UnsupportedProtocol { required: u32, offered: Vec<u32> },

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Server closed the connection")]
    ConnectionClosed,
}

/// Errors raised by the protocol engine when a verb cannot run
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("No CMake server session is running")]
    NotConnected,

    #[error("A session is busy: {0}")]
    Busy(String),

    #[error("No toolchain selected")]
    NoToolchain,

    #[error("CMake server exited unexpectedly: {0}")]
    UnexpectedExit(String),
}

/// Failures while turning a codemodel reply into a target model
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodeModelError {
    #[error("No configuration named {variant} in the code model (available: {available:?})")]
    ConfigurationNotFound {
        variant: String,
        available: Vec<String>,
    },

    #[error("Configuration {configuration} has no usable targets ({unsupported} unsupported)")]
    NoTargets {
        configuration: String,
        unsupported: usize,
    },

    #[error("Malformed code model: {0}")]
    Malformed(String),
}

/// Settings loading errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read settings file {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("Invalid settings file {path}: {reason}")]
    Invalid { path: String, reason: String },

    #[error("Unknown toolchain: {0}")]
    UnknownToolchain(String),

    #[error("Unknown configuration: {0}")]
    UnknownConfiguration(String),
}

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;
