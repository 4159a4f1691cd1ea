//! Seams between the controller and the server process
//!
//! - `ServerLauncher` - Starts a server and wires its events to a channel
//! - `ServerLink` - An active connection to a started server
//!
//! The real implementations are [`super::ProcessLauncher`] and
//! [`super::Transport`]; tests substitute in-memory servers.

use super::transport::{LaunchSpec, TransportEvent};
use crate::error::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Starts server processes
#[async_trait]
pub trait ServerLauncher: Send + Sync {
    /// Start a server for session `generation`. Every event the server
    /// produces must be tagged with that generation.
    async fn launch(
        &self,
        spec: LaunchSpec,
        generation: u64,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<Box<dyn ServerLink>>;
}

/// A started server
#[async_trait]
pub trait ServerLink: Send + Sync {
    /// Send an encoded frame
    async fn send(&self, frame: Vec<u8>) -> Result<()>;

    /// Terminate the server; idempotent
    fn stop(&self);
}
