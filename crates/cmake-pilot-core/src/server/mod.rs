//! CMake server client
//!
//! # Architecture
//!
//! - `FrameCodec` - Delimited JSON framing of the server byte stream
//! - `Transport` - The `cmake -E server` subprocess and its local endpoint
//! - `ProtocolHandler` - Request builders and message classification
//! - `ProtocolEngine` - The session state machine, free of I/O
//!
//! `ServerLauncher` and `ServerLink` are the seams the controller talks
//! through; `ProcessLauncher` and `Transport` implement them for real
//! processes.

pub mod codec;
pub mod engine;
pub mod protocol;
mod traits;
pub mod transport;

pub use codec::{FrameCodec, FrameError, MAX_FRAME_BYTES};
pub use engine::{
    ControllerEvent, Effect, EngineSnapshot, PendingAction, ProtocolEngine, SessionState,
    CACHE_FILE,
};
pub use protocol::{ProtocolHandler, ServerMessage};
pub use traits::{ServerLauncher, ServerLink};
pub use transport::{
    endpoint_path, ExitKind, ExitReport, LaunchSpec, LifecycleFlag, ProcessLauncher,
    ProcessLifecycle, Transport, TransportEvent, TransportEventKind, CONNECT_RETRY_INTERVAL,
    STDERR_TAIL_LINES,
};
