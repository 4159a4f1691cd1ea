//! Frame codec for the CMake server wire format
//!
//! Every message travels as
//! `\n[== "CMake Server" ==[\n{json}\n]== "CMake Server" ==]\n`.
//! [`FrameCodec`] wraps outgoing requests and pulls complete frames out of
//! the byte stream, keeping partial frames buffered between reads.

use crate::types::{Request, SERVER_NAME};
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Upper bound for a single buffered frame (16 MiB)
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// A frame that could not be decoded. The stream stays usable.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("malformed JSON in frame: {reason}")]
    Malformed { reason: String, raw: String },

    #[error("frame exceeded {limit} bytes without an end marker")]
    Oversized { limit: usize },
}

/// Incremental encoder/decoder for delimited JSON frames
#[derive(Debug)]
pub struct FrameCodec {
    start_marker: Vec<u8>,
    end_marker: Vec<u8>,
    buffer: Vec<u8>,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::with_server_name(SERVER_NAME)
    }

    pub fn with_server_name(name: &str) -> Self {
        Self {
            start_marker: format!("\n[== \"{}\" ==[\n", name).into_bytes(),
            end_marker: format!("\n]== \"{}\" ==]\n", name).into_bytes(),
            buffer: Vec::new(),
        }
    }

    /// Wrap a request into a complete frame
    pub fn encode(&self, request: &Request) -> Vec<u8> {
        self.encode_value(&request.to_value())
    }

    pub fn encode_value(&self, value: &serde_json::Value) -> Vec<u8> {
        let body = value.to_string();
        let mut frame =
            Vec::with_capacity(self.start_marker.len() + body.len() + self.end_marker.len());
        frame.extend_from_slice(&self.start_marker);
        frame.extend_from_slice(body.as_bytes());
        frame.extend_from_slice(&self.end_marker);
        frame
    }

    /// Bytes held back waiting for the rest of a frame
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Consume newly arrived bytes and return every complete frame, in order
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Result<serde_json::Value, FrameError>> {
        self.buffer.extend_from_slice(bytes);
        let mut frames = Vec::new();

        loop {
            let Some(start) = find(&self.buffer, &self.start_marker, 0) else {
                self.discard_noise();
                break;
            };

            if start > 0 {
                let noise = String::from_utf8_lossy(&self.buffer[..start]);
                if !noise.trim().is_empty() {
                    debug!("Discarding {} bytes outside of a frame: {}", start, noise.trim());
                }
                self.buffer.drain(..start);
            }

            let body_start = self.start_marker.len();
            let Some(end) = find(&self.buffer, &self.end_marker, body_start) else {
                if self.buffer.len() > MAX_FRAME_BYTES {
                    warn!(
                        "Dropping {} buffered bytes without an end marker",
                        self.buffer.len()
                    );
                    self.buffer.clear();
                    frames.push(Err(FrameError::Oversized {
                        limit: MAX_FRAME_BYTES,
                    }));
                }
                break;
            };

            let body = &self.buffer[body_start..end];
            let decoded = serde_json::from_slice::<serde_json::Value>(body).map_err(|e| {
                FrameError::Malformed {
                    reason: e.to_string(),
                    raw: String::from_utf8_lossy(body).chars().take(300).collect(),
                }
            });
            if let Ok(value) = &decoded {
                trace!("Decoded frame: {}", value);
            }
            frames.push(decoded);

            // The trailing newline of the end marker doubles as the leading
            // newline of the next start marker.
            let consumed = end + self.end_marker.len() - 1;
            self.buffer.drain(..consumed);
        }

        frames
    }

    /// Without a start marker in sight only a possible marker prefix is worth keeping
    fn discard_noise(&mut self) {
        let keep = self.start_marker.len() - 1;
        if self.buffer.len() > keep {
            let cut = self.buffer.len() - keep;
            let noise = String::from_utf8_lossy(&self.buffer[..cut]);
            if !noise.trim().is_empty() {
                debug!("Discarding {} bytes outside of a frame: {}", cut, noise.trim());
            }
            self.buffer.drain(..cut);
        }
    }
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if haystack.len() < from + needle.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}
