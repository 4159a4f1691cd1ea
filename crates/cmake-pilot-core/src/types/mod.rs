//! Core type definitions for cmake-pilot
//!
//! Wire types for the CMake server protocol, configuration context types and
//! target types shared across the crate.

mod context_types;
mod protocol_types;
mod target_types;

pub use context_types::*;
pub use protocol_types::*;
pub use target_types::*;
