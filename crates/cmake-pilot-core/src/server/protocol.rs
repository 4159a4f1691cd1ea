//! CMake server protocol message handling

use crate::error::{Error, ProtocolError, Result};
use crate::types::{
    ErrorMessage, Generator, HelloMessage, LogMessage, ProgressMessage, ReplyMessage, Request,
    RequestKind, SignalMessage,
};
use std::path::Path;
use tracing::{trace, warn};

/// Builds requests for one session and classifies incoming messages
pub struct ProtocolHandler {
    cookie: String,
}

impl ProtocolHandler {
    pub fn new(cookie: impl Into<String>) -> Self {
        Self {
            cookie: cookie.into(),
        }
    }

    pub fn cookie(&self) -> &str {
        &self.cookie
    }

    /// Whether a reply cookie belongs to this session
    pub fn is_current(&self, cookie: &str) -> bool {
        cookie == self.cookie
    }

    /// Create handshake request
    pub fn create_handshake_request(
        &self,
        source_dir: &Path,
        build_dir: &Path,
        generator: &Generator,
    ) -> Request {
        Request::new(RequestKind::Handshake, &self.cookie)
            .with_field("sourceDirectory", source_dir.display().to_string())
            .with_field("buildDirectory", build_dir.display().to_string())
            .with_field("generator", generator.name.clone())
    }

    /// Create globalSettings request
    pub fn create_global_settings_request(&self) -> Request {
        Request::new(RequestKind::GlobalSettings, &self.cookie)
    }

    /// Create configure request
    pub fn create_configure_request(&self, cache_arguments: Vec<String>) -> Request {
        Request::new(RequestKind::Configure, &self.cookie)
            .with_field("cacheArguments", cache_arguments)
    }

    /// Create compute request
    pub fn create_compute_request(&self) -> Request {
        Request::new(RequestKind::Compute, &self.cookie)
    }

    /// Create codemodel request
    pub fn create_codemodel_request(&self) -> Request {
        Request::new(RequestKind::CodeModel, &self.cookie)
    }

    /// Parse an incoming frame payload
    pub fn parse_message(&self, value: &serde_json::Value) -> Result<ServerMessage> {
        let Some(kind) = value.get("type").and_then(|t| t.as_str()) else {
            return Err(Error::Protocol(ProtocolError::InvalidMessage(format!(
                "Message without type: {}",
                value
            ))));
        };

        let message = match kind {
            "hello" => ServerMessage::Hello(serde_json::from_value::<HelloMessage>(value.clone())?),
            "reply" => ServerMessage::Reply(serde_json::from_value::<ReplyMessage>(value.clone())?),
            "error" => ServerMessage::Error(serde_json::from_value::<ErrorMessage>(value.clone())?),
            "signal" => {
                ServerMessage::Signal(serde_json::from_value::<SignalMessage>(value.clone())?)
            }
            "message" => ServerMessage::Message(serde_json::from_value::<LogMessage>(value.clone())?),
            "progress" => {
                trace!("Progress message: {:?}", value);
                ServerMessage::Progress(serde_json::from_value::<ProgressMessage>(value.clone())?)
            }
            other => {
                warn!("Unknown message type: {}", other);
                ServerMessage::Unknown(value.clone())
            }
        };

        Ok(message)
    }
}

/// Parsed server message types
#[derive(Debug, Clone)]
pub enum ServerMessage {
    /// Greeting with the supported protocol versions
    Hello(HelloMessage),
    /// Reply to one of our requests
    Reply(ReplyMessage),
    /// Error in reply to one of our requests
    Error(ErrorMessage),
    /// Unsolicited signal
    Signal(SignalMessage),
    /// Log line
    Message(LogMessage),
    /// Progress indicator
    Progress(ProgressMessage),
    /// Unknown message
    Unknown(serde_json::Value),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_create_handshake_request() {
        let handler = ProtocolHandler::new("session-cookie");
        let request = handler.create_handshake_request(
            Path::new("/src/app"),
            Path::new("/src/app/build"),
            &Generator::new("Ninja"),
        );
        let value = request.to_value();

        assert_eq!(value["type"], "handshake");
        assert_eq!(value["cookie"], "session-cookie");
        assert_eq!(value["protocolVersion"]["major"], 1);
        assert_eq!(value["sourceDirectory"], "/src/app");
        assert_eq!(value["buildDirectory"], "/src/app/build");
        assert_eq!(value["generator"], "Ninja");
    }

    #[test]
    fn test_create_configure_request() {
        let handler = ProtocolHandler::new("c");
        let request = handler.create_configure_request(vec![
            "-DCMAKE_BUILD_TYPE=Debug".to_string(),
        ]);
        let value = request.to_value();

        assert_eq!(value["type"], "configure");
        assert_eq!(value["cacheArguments"], json!(["-DCMAKE_BUILD_TYPE=Debug"]));
    }

    #[test]
    fn test_every_request_carries_the_session_cookie() {
        let handler = ProtocolHandler::new("xyz");
        for request in [
            handler.create_global_settings_request(),
            handler.create_compute_request(),
            handler.create_codemodel_request(),
        ] {
            assert_eq!(request.to_value()["cookie"], "xyz");
        }
        assert!(handler.is_current("xyz"));
        assert!(!handler.is_current("other"));
    }

    #[test]
    fn test_parse_message_reply() {
        let handler = ProtocolHandler::new("c");
        let msg = handler
            .parse_message(&json!({ "type": "reply", "inReplyTo": "compute", "cookie": "c" }))
            .unwrap();
        assert!(matches!(msg, ServerMessage::Reply(ref r) if r.in_reply_to == "compute"));
    }

    #[test]
    fn test_parse_message_error() {
        let handler = ProtocolHandler::new("c");
        let msg = handler
            .parse_message(&json!({
                "type": "error",
                "inReplyTo": "configure",
                "cookie": "c",
                "errorMessage": "Configuration failed."
            }))
            .unwrap();
        match msg {
            ServerMessage::Error(e) => assert_eq!(e.error_message, "Configuration failed."),
            other => panic!("Expected error, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_message_signal() {
        let handler = ProtocolHandler::new("c");
        let msg = handler
            .parse_message(&json!({ "type": "signal", "name": "dirty", "cookie": "", "inReplyTo": "" }))
            .unwrap();
        assert!(matches!(msg, ServerMessage::Signal(ref s) if s.name == "dirty"));
    }

    #[test]
    fn test_parse_message_unknown_type() {
        let handler = ProtocolHandler::new("c");
        let msg = handler
            .parse_message(&json!({ "type": "fileSystemWatchers" }))
            .unwrap();
        assert!(matches!(msg, ServerMessage::Unknown(_)));
    }

    #[test]
    fn test_parse_message_without_type() {
        let handler = ProtocolHandler::new("c");
        assert!(handler.parse_message(&json!({ "cookie": "c" })).is_err());
    }
}
