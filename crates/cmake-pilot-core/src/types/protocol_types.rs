//! CMake server protocol type definitions
//!
//! Mirrors the JSON objects exchanged with `cmake -E server` (protocol 1.x).

use serde::{Deserialize, Serialize};

/// Protocol major version spoken by this client
pub const PROTOCOL_MAJOR: u32 = 1;

/// Name embedded in the frame delimiters
pub const SERVER_NAME: &str = "CMake Server";

/// A protocol version as advertised in `hello` or sent with requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolVersion {
    pub major: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minor: Option<u32>,
    #[serde(
        rename = "isExperimental",
        default,
        skip_serializing_if = "std::ops::Not::not"
    )]
    pub experimental: bool,
}

impl ProtocolVersion {
    pub fn major(major: u32) -> Self {
        Self {
            major,
            minor: None,
            experimental: false,
        }
    }
}

/// Request types produced by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Handshake,
    GlobalSettings,
    Configure,
    Compute,
    CodeModel,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Handshake => "handshake",
            Self::GlobalSettings => "globalSettings",
            Self::Configure => "configure",
            Self::Compute => "compute",
            Self::CodeModel => "codemodel",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "handshake" => Some(Self::Handshake),
            "globalSettings" => Some(Self::GlobalSettings),
            "configure" => Some(Self::Configure),
            "compute" => Some(Self::Compute),
            "codemodel" => Some(Self::CodeModel),
            _ => None,
        }
    }
}

impl std::fmt::Display for RequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An outgoing request. Serialized as a flat object carrying `type`,
/// `cookie`, `protocolVersion` and the request-specific fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub kind: RequestKind,
    pub cookie: String,
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl Request {
    pub fn new(kind: RequestKind, cookie: impl Into<String>) -> Self {
        Self {
            kind,
            cookie: cookie.into(),
            fields: serde_json::Map::new(),
        }
    }

    pub fn with_field(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    /// Build the JSON object sent on the wire
    pub fn to_value(&self) -> serde_json::Value {
        let mut obj = self.fields.clone();
        obj.insert("type".to_string(), self.kind.as_str().into());
        obj.insert("cookie".to_string(), self.cookie.clone().into());
        obj.insert(
            "protocolVersion".to_string(),
            serde_json::json!({ "major": PROTOCOL_MAJOR }),
        );
        serde_json::Value::Object(obj)
    }
}

/// `hello` message sent by the server right after a client connects
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloMessage {
    #[serde(default)]
    pub supported_protocol_versions: Vec<ProtocolVersion>,
}

impl HelloMessage {
    pub fn supports_major(&self, major: u32) -> bool {
        self.supported_protocol_versions
            .iter()
            .any(|v| v.major == major)
    }

    pub fn offered_majors(&self) -> Vec<u32> {
        self.supported_protocol_versions
            .iter()
            .map(|v| v.major)
            .collect()
    }
}

/// `reply` to one of our requests
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyMessage {
    pub in_reply_to: String,
    #[serde(default)]
    pub cookie: String,
    #[serde(flatten)]
    pub payload: serde_json::Map<String, serde_json::Value>,
}

/// `error` reply to one of our requests
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorMessage {
    pub in_reply_to: String,
    #[serde(default)]
    pub cookie: String,
    #[serde(default)]
    pub error_message: String,
}

/// Unsolicited `signal`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalMessage {
    pub name: String,
    #[serde(flatten)]
    pub payload: serde_json::Map<String, serde_json::Value>,
}

/// Free-text `message` from the server, usually CMake output
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogMessage {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub in_reply_to: Option<String>,
}

/// `progress` indicator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressMessage {
    #[serde(default)]
    pub progress_message: String,
    #[serde(default)]
    pub progress_minimum: i64,
    #[serde(default)]
    pub progress_current: i64,
    #[serde(default)]
    pub progress_maximum: i64,
    #[serde(default)]
    pub in_reply_to: Option<String>,
}

/// Signal names the engine reacts to
pub mod signals {
    pub const DIRTY: &str = "dirty";
    pub const FILE_CHANGE: &str = "fileChange";
}
