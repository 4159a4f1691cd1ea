//! Session state machine for the CMake server protocol
//!
//! The engine owns at most one [`Session`] and never performs I/O. Every
//! input (a façade verb, a transport event, a finished build) returns an
//! ordered list of [`Effect`]s which the driver executes in order.
//!
//! ```text
//! Disconnected → Starting → AwaitingHello → Handshaking → Idle
//!                                                          │
//!        Idle ← ExtractingTargets ← Computing ← Generating ← Configuring
//! ```

use super::protocol::{ProtocolHandler, ServerMessage};
use super::transport::{ExitKind, TransportEvent, TransportEventKind};
use crate::build::{BuildAction, BuildInvocation, DEFAULT_GENERATOR};
use crate::codemodel::TargetModel;
use crate::context::Collaborators;
use crate::error::{CodeModelError, EngineError, ProtocolError, StartupError};
use crate::types::{
    signals, ErrorMessage, Generator, GlobalCapabilities, HelloMessage, ReplyMessage, Request,
    RequestKind, SignalMessage, PROTOCOL_MAJOR,
};
use std::path::PathBuf;
use tracing::{debug, error, info, trace, warn};

/// Name of the cache file removed by a clean configure
pub const CACHE_FILE: &str = "CMakeCache.txt";

/// Protocol state of the current session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Disconnected,
    Starting,
    AwaitingHello,
    Handshaking,
    Idle,
    Configuring,
    Generating,
    Computing,
    ExtractingTargets,
}

impl SessionState {
    /// The request whose reply this state waits for
    fn awaiting(&self) -> Option<RequestKind> {
        match self {
            Self::Handshaking => Some(RequestKind::Handshake),
            Self::Configuring => Some(RequestKind::Configure),
            Self::Computing => Some(RequestKind::Compute),
            Self::ExtractingTargets => Some(RequestKind::CodeModel),
            _ => None,
        }
    }

    /// Part of the configure → compute → codemodel chain
    pub fn in_chain(&self) -> bool {
        matches!(
            self,
            Self::Configuring | Self::Generating | Self::Computing | Self::ExtractingTargets
        )
    }

    /// Connected but not yet handshaken
    pub fn before_handshake(&self) -> bool {
        matches!(self, Self::Starting | Self::AwaitingHello | Self::Handshaking)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Starting => "starting",
            Self::AwaitingHello => "awaiting hello",
            Self::Handshaking => "handshaking",
            Self::Idle => "idle",
            Self::Configuring => "configuring",
            Self::Generating => "generating",
            Self::Computing => "computing",
            Self::ExtractingTargets => "extracting targets",
        };
        f.write_str(name)
    }
}

/// A verb deferred until the session reaches a point where it can run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingAction {
    Configure { clean_cache: bool },
    Run(BuildAction),
}

/// Notifications published to controller subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerEvent {
    /// The server endpoint accepted our connection
    Connected,
    /// Handshake completed, verbs can run
    Ready,
    /// A configure chain produced a target model
    Configured { targets: Vec<String> },
    /// The chain completed but the code model was not usable
    CodeModelFailed(CodeModelError),
    /// The server answered one of our requests with an error
    ServerError { in_reply_to: String, message: String },
    /// The server spoke something we cannot use
    ProtocolError(ProtocolError),
    /// The server went away before the session came up
    StartFailed(StartupError),
    /// A deferred verb could not run
    Failed(EngineError),
    BuildStarted(BuildAction),
    BuildFinished {
        action: BuildAction,
        exit_code: Option<i32>,
    },
    /// The build tool could not be run at all
    BuildFailed { action: BuildAction, reason: String },
    Disconnected {
        unexpected: bool,
        reason: Option<String>,
    },
}

/// Work the driver performs on behalf of the engine
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Send(Request),
    RemoveCache(PathBuf),
    RunBuild(BuildInvocation),
    StopServer,
    Notify(ControllerEvent),
}

/// Read-only view of the engine published to queries
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSnapshot {
    pub state: SessionState,
    pub configured: bool,
    pub targets: TargetModel,
    pub build_running: Option<BuildAction>,
}

impl Default for EngineSnapshot {
    fn default() -> Self {
        Self {
            state: SessionState::Disconnected,
            configured: false,
            targets: TargetModel::default(),
            build_running: None,
        }
    }
}

/// The single live protocol context
struct Session {
    generation: u64,
    protocol: ProtocolHandler,
    state: SessionState,
    configured: bool,
    targets: TargetModel,
    after_handshake: Option<PendingAction>,
    after_configure: Option<BuildAction>,
}

impl Session {
    fn new(generation: u64) -> Self {
        Self {
            generation,
            protocol: ProtocolHandler::new(uuid::Uuid::new_v4().to_string()),
            state: SessionState::Starting,
            configured: false,
            targets: TargetModel::default(),
            after_handshake: None,
            after_configure: None,
        }
    }
}

pub struct ProtocolEngine {
    ctx: Collaborators,
    session: Option<Session>,
    next_generation: u64,
    build_running: Option<BuildAction>,
}

impl ProtocolEngine {
    pub fn new(ctx: Collaborators) -> Self {
        Self {
            ctx,
            session: None,
            next_generation: 1,
            build_running: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.session
            .as_ref()
            .map(|s| s.state)
            .unwrap_or(SessionState::Disconnected)
    }

    pub fn is_configured(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.configured)
    }

    pub fn targets(&self) -> TargetModel {
        self.session
            .as_ref()
            .map(|s| s.targets.clone())
            .unwrap_or_default()
    }

    pub fn generation(&self) -> Option<u64> {
        self.session.as_ref().map(|s| s.generation)
    }

    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            state: self.state(),
            configured: self.is_configured(),
            targets: self.targets(),
            build_running: self.build_running,
        }
    }

    /// Create a session in `Starting`. Returns its generation, or `None`
    /// when a session already exists.
    pub fn begin_start(&mut self) -> Option<u64> {
        if let Some(session) = &self.session {
            debug!(
                "Start ignored, session {} is {}",
                session.generation, session.state
            );
            return None;
        }
        let generation = self.next_generation;
        self.next_generation += 1;
        let session = Session::new(generation);
        debug!(
            "Session {} created (cookie {})",
            generation,
            session.protocol.cookie()
        );
        self.session = Some(session);
        Some(generation)
    }

    /// Drop a session whose server could not be launched
    pub fn abort_start(&mut self, generation: u64) {
        if self.generation() == Some(generation) {
            debug!("Session {} aborted during start", generation);
            self.session = None;
        }
    }

    /// Tear the session down on request
    pub fn stop(&mut self) -> Vec<Effect> {
        match self.session.take() {
            Some(session) => {
                info!("Stopping session {}", session.generation);
                vec![
                    Effect::StopServer,
                    Effect::Notify(ControllerEvent::Disconnected {
                        unexpected: false,
                        reason: None,
                    }),
                ]
            }
            None => Vec::new(),
        }
    }

    pub fn on_transport_event(&mut self, event: TransportEvent) -> Vec<Effect> {
        let Some(session) = self.session.as_mut() else {
            trace!("Transport event for generation {} without a session", event.generation);
            return Vec::new();
        };
        if session.generation != event.generation {
            trace!(
                "Ignoring event of superseded session {} (current {})",
                event.generation,
                session.generation
            );
            return Vec::new();
        }

        match event.kind {
            TransportEventKind::Connected => {
                if session.state != SessionState::Starting {
                    warn!("Connected while {}", session.state);
                    return Vec::new();
                }
                session.state = SessionState::AwaitingHello;
                vec![Effect::Notify(ControllerEvent::Connected)]
            }
            TransportEventKind::Frame(value) => self.on_frame(value),
            TransportEventKind::Malformed(e) => {
                warn!("Dropping malformed frame: {}", e);
                Vec::new()
            }
            TransportEventKind::Exited(report) => {
                self.session = None;
                match report.kind {
                    ExitKind::Intentional => {
                        debug!("Server exited after stop");
                        vec![Effect::Notify(ControllerEvent::Disconnected {
                            unexpected: false,
                            reason: None,
                        })]
                    }
                    ExitKind::Unexpected => {
                        let reason = report.describe();
                        let failure = if report.before_ready {
                            ControllerEvent::StartFailed(StartupError::ExitedBeforeReady(
                                reason.clone(),
                            ))
                        } else {
                            ControllerEvent::Failed(EngineError::UnexpectedExit(reason.clone()))
                        };
                        error!("CMake server exited unexpectedly: {}", reason);
                        self.ctx
                            .log
                            .log(&format!("CMake server exited unexpectedly: {}", reason));
                        vec![
                            Effect::Notify(failure),
                            Effect::Notify(ControllerEvent::Disconnected {
                                unexpected: true,
                                reason: Some(reason),
                            }),
                        ]
                    }
                }
            }
        }
    }

    /// Dispatch one decoded frame
    pub fn on_frame(&mut self, value: serde_json::Value) -> Vec<Effect> {
        let parsed = match &self.session {
            Some(session) => session.protocol.parse_message(&value),
            None => return Vec::new(),
        };
        let message = match parsed {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping invalid message: {}", e);
                return Vec::new();
            }
        };

        match message {
            ServerMessage::Hello(hello) => self.on_hello(hello),
            ServerMessage::Reply(reply) => self.on_reply(reply),
            ServerMessage::Error(err) => self.on_error(err),
            ServerMessage::Signal(signal) => self.on_signal(signal),
            ServerMessage::Message(msg) => {
                if let Some(title) = msg.title.as_deref().filter(|t| !t.is_empty()) {
                    self.ctx.log.log(&format!("{}: {}", title, msg.message));
                } else {
                    self.ctx.log.log(&msg.message);
                }
                Vec::new()
            }
            ServerMessage::Progress(progress) => {
                trace!(
                    "{} ({}/{})",
                    progress.progress_message,
                    progress.progress_current,
                    progress.progress_maximum
                );
                Vec::new()
            }
            ServerMessage::Unknown(_) => Vec::new(),
        }
    }

    fn on_hello(&mut self, hello: HelloMessage) -> Vec<Effect> {
        let Some(session) = self.session.as_mut() else {
            return Vec::new();
        };
        if session.state != SessionState::AwaitingHello {
            warn!("Unexpected hello while {}", session.state);
            return Vec::new();
        }

        if !hello.supports_major(PROTOCOL_MAJOR) {
            let err = ProtocolError::UnsupportedProtocol {
                required: PROTOCOL_MAJOR,
                offered: hello.offered_majors(),
            };
            let reason = err.to_string();
            error!("Unsupported CMake server: {}", reason);
            self.ctx.log.log(&format!("Unsupported CMake server: {}", reason));
            self.session = None;
            return vec![
                Effect::Notify(ControllerEvent::ProtocolError(err)),
                Effect::StopServer,
                Effect::Notify(ControllerEvent::Disconnected {
                    unexpected: false,
                    reason: Some(reason),
                }),
            ];
        }

        let generator = self
            .ctx
            .generators
            .selected_generator()
            .unwrap_or_else(|| Generator::new(DEFAULT_GENERATOR));
        let request = session.protocol.create_handshake_request(
            &self.ctx.paths.source_dir(),
            &self.ctx.paths.build_dir(),
            &generator,
        );
        session.state = SessionState::Handshaking;
        debug!("Handshaking with generator {}", generator.name);
        vec![Effect::Send(request)]
    }

    fn on_reply(&mut self, reply: ReplyMessage) -> Vec<Effect> {
        let Some(session) = self.session.as_ref() else {
            return Vec::new();
        };
        if !session.protocol.is_current(&reply.cookie) {
            trace!("Discarding reply with foreign cookie {:?}", reply.cookie);
            return Vec::new();
        }

        let Some(kind) = RequestKind::parse(&reply.in_reply_to) else {
            warn!("Reply to unknown request {}", reply.in_reply_to);
            return Vec::new();
        };

        if kind == RequestKind::GlobalSettings {
            self.on_global_settings(&reply);
            return Vec::new();
        }

        let Some(session) = self.session.as_mut() else {
            return Vec::new();
        };
        if session.state.awaiting() != Some(kind) {
            debug!("Dropping reply to {} while {}", kind, session.state);
            return Vec::new();
        }

        match kind {
            RequestKind::Handshake => {
                session.state = SessionState::Idle;
                info!("CMake server session {} ready", session.generation);
                let pending = session.after_handshake.take();
                let global_settings = session.protocol.create_global_settings_request();

                let mut effects = vec![Effect::Notify(ControllerEvent::Ready)];
                if let Some(action) = pending {
                    debug!("Running {:?} deferred until handshake", action);
                    effects.extend(self.run_pending(action));
                }
                effects.push(Effect::Send(global_settings));
                effects
            }
            RequestKind::Configure => {
                session.state = SessionState::Generating;
                debug!("Configure done, generating");
                let request = session.protocol.create_compute_request();
                session.state = SessionState::Computing;
                vec![Effect::Send(request)]
            }
            RequestKind::Compute => {
                session.configured = true;
                session.state = SessionState::ExtractingTargets;
                vec![Effect::Send(session.protocol.create_codemodel_request())]
            }
            RequestKind::CodeModel => self.on_codemodel(&reply),
            RequestKind::GlobalSettings => Vec::new(),
        }
    }

    fn on_global_settings(&self, reply: &ReplyMessage) {
        let Some(capabilities) = reply.payload.get("capabilities") else {
            debug!("globalSettings reply without capabilities");
            return;
        };
        match serde_json::from_value::<GlobalCapabilities>(capabilities.clone()) {
            Ok(capabilities) => {
                debug!(
                    "Server reports {} generators",
                    capabilities.generators.len()
                );
                self.ctx.generators.update_capabilities(capabilities);
            }
            Err(e) => warn!("Invalid capabilities in globalSettings reply: {}", e),
        }
    }

    fn on_codemodel(&mut self, reply: &ReplyMessage) -> Vec<Effect> {
        let variant = self.ctx.variants.active_variant();
        let payload = serde_json::Value::Object(reply.payload.clone());
        let parsed = TargetModel::parse(&payload, &variant);

        let Some(session) = self.session.as_mut() else {
            return Vec::new();
        };
        session.state = SessionState::Idle;

        let mut effects = match parsed {
            Ok(model) => {
                let targets = model.target_names();
                info!("Configured {} with {} targets", variant, model.len());
                session.targets = model;
                vec![Effect::Notify(ControllerEvent::Configured { targets })]
            }
            Err(e) => {
                warn!("Code model unusable: {}", e);
                if matches!(e, CodeModelError::NoTargets { .. }) {
                    session.targets = TargetModel::no_usable_targets();
                }
                self.ctx.log.log(&e.to_string());
                vec![Effect::Notify(ControllerEvent::CodeModelFailed(e))]
            }
        };

        if let Some(action) = session.after_configure.take() {
            debug!("Running {} deferred until configure", action);
            effects.extend(self.run_pending(PendingAction::Run(action)));
        }
        effects
    }

    fn on_error(&mut self, err: ErrorMessage) -> Vec<Effect> {
        let Some(session) = self.session.as_mut() else {
            return Vec::new();
        };
        if !session.protocol.is_current(&err.cookie) {
            trace!("Discarding error with foreign cookie {:?}", err.cookie);
            return Vec::new();
        }

        let notice = Effect::Notify(ControllerEvent::ServerError {
            in_reply_to: err.in_reply_to.clone(),
            message: err.error_message.clone(),
        });
        let kind = RequestKind::parse(&err.in_reply_to);

        if kind == Some(RequestKind::GlobalSettings) {
            warn!("globalSettings failed: {}", err.error_message);
            return vec![notice];
        }
        if kind.is_none() || session.state.awaiting() != kind {
            debug!(
                "Dropping error in reply to {} while {}",
                err.in_reply_to, session.state
            );
            return Vec::new();
        }

        error!(
            "CMake server error in reply to {} (session {}, {}): {}",
            err.in_reply_to, session.generation, session.state, err.error_message
        );
        self.ctx
            .log
            .log(&format!("CMake error ({}): {}", err.in_reply_to, err.error_message));

        if session.state == SessionState::Handshaking {
            self.session = None;
            return vec![
                notice,
                Effect::StopServer,
                Effect::Notify(ControllerEvent::Disconnected {
                    unexpected: false,
                    reason: Some(err.error_message),
                }),
            ];
        }

        session.state = SessionState::Idle;
        if let Some(dropped) = session.after_configure.take() {
            debug!("Dropping {} queued behind the failed chain", dropped);
        }
        vec![notice]
    }

    fn on_signal(&mut self, signal: SignalMessage) -> Vec<Effect> {
        let Some(session) = self.session.as_mut() else {
            return Vec::new();
        };
        match signal.name.as_str() {
            signals::DIRTY => {
                debug!("Build system is dirty");
                session.configured = false;
            }
            signals::FILE_CHANGE => trace!("File change signal: {:?}", signal.payload),
            other => trace!("Ignoring signal {}", other),
        }
        Vec::new()
    }

    /// Begin a configure chain
    pub fn configure(&mut self, clean_cache: bool) -> Result<Vec<Effect>, EngineError> {
        let Some(session) = self.session.as_mut() else {
            self.ctx
                .log
                .log("Unable to configure: the CMake server is not running");
            return Err(EngineError::NotConnected);
        };

        let state = session.state;
        if state.before_handshake() {
            return park(session, PendingAction::Configure { clean_cache });
        }
        if state.in_chain() {
            return Err(EngineError::Busy(format!("configure already {}", state)));
        }
        self.start_configure(clean_cache)
    }

    fn start_configure(&mut self, clean_cache: bool) -> Result<Vec<Effect>, EngineError> {
        let Some(toolchain) = self.ctx.toolchains.selected_toolchain() else {
            warn!("Configure requested without a toolchain");
            self.ctx.log.log("Unable to configure: no toolchain selected");
            return Err(EngineError::NoToolchain);
        };
        let variant = self.ctx.variants.active_variant();
        let build_dir = self.ctx.paths.build_dir();
        let Some(session) = self.session.as_mut() else {
            return Err(EngineError::NotConnected);
        };

        let mut effects = Vec::new();
        if clean_cache {
            effects.push(Effect::RemoveCache(build_dir.join(CACHE_FILE)));
        }
        info!("Configuring {} with toolchain {}", variant, toolchain.name);
        effects.push(Effect::Send(
            session
                .protocol
                .create_configure_request(toolchain.cache_arguments(&variant)),
        ));
        session.state = SessionState::Configuring;
        Ok(effects)
    }

    /// Build, clean or install; configures first when needed
    pub fn run(&mut self, action: BuildAction) -> Result<Vec<Effect>, EngineError> {
        let Some(session) = self.session.as_mut() else {
            self.ctx
                .log
                .log(&format!("Unable to {}: the CMake server is not running", action));
            return Err(EngineError::NotConnected);
        };
        if let Some(running) = self.build_running {
            return Err(EngineError::Busy(format!("{} is running", running)));
        }

        let state = session.state;
        if state.before_handshake() {
            return park(session, PendingAction::Run(action));
        }
        if state.in_chain() {
            if session.configured || session.after_configure.is_some() {
                return Err(EngineError::Busy(format!("configure is {}", state)));
            }
            session.after_configure = Some(action);
            return Ok(Vec::new());
        }
        if session.configured {
            return Ok(self.start_build(action));
        }

        session.after_configure = Some(action);
        let result = self.start_configure(false);
        if result.is_err() {
            if let Some(session) = self.session.as_mut() {
                session.after_configure = None;
            }
        }
        result
    }

    fn start_build(&mut self, action: BuildAction) -> Vec<Effect> {
        let invocation = BuildInvocation::for_action(action, &self.ctx);
        self.build_running = Some(action);
        vec![
            Effect::Notify(ControllerEvent::BuildStarted(action)),
            Effect::RunBuild(invocation),
        ]
    }

    fn run_pending(&mut self, action: PendingAction) -> Vec<Effect> {
        let result = match action {
            PendingAction::Configure { clean_cache } => self.configure(clean_cache),
            PendingAction::Run(action) => self.run(action),
        };
        result.unwrap_or_else(|e| {
            warn!("Deferred {:?} failed: {}", action, e);
            vec![Effect::Notify(ControllerEvent::Failed(e))]
        })
    }

    /// Record the outcome of a build invocation
    pub fn on_build_finished(
        &mut self,
        action: BuildAction,
        outcome: Result<Option<i32>, String>,
    ) -> Vec<Effect> {
        self.build_running = None;
        let event = match outcome {
            Ok(exit_code) => {
                info!("{} finished with {:?}", action, exit_code);
                ControllerEvent::BuildFinished { action, exit_code }
            }
            Err(reason) => {
                error!("{} failed: {}", action, reason);
                self.ctx.log.log(&format!("Unable to {}: {}", action, reason));
                ControllerEvent::BuildFailed { action, reason }
            }
        };
        vec![Effect::Notify(event)]
    }
}

fn park(session: &mut Session, action: PendingAction) -> Result<Vec<Effect>, EngineError> {
    if session.after_handshake.is_some() {
        return Err(EngineError::Busy(format!(
            "another request is waiting for the handshake ({})",
            session.state
        )));
    }
    debug!("Deferring {:?} until the handshake completes", action);
    session.after_handshake = Some(action);
    Ok(Vec::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Collaborators, MockGeneratorProvider};
    use crate::server::transport::ExitReport;
    use crate::testing::TestContext;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};
    use std::sync::Arc;

    struct Harness {
        ctx: TestContext,
        engine: ProtocolEngine,
        generation: u64,
    }

    impl Harness {
        fn new() -> Self {
            let ctx = TestContext::new();
            Self::with_collaborators(ctx.clone(), ctx.collaborators())
        }

        fn with_collaborators(ctx: TestContext, collaborators: Collaborators) -> Self {
            let mut engine = ProtocolEngine::new(collaborators);
            let generation = engine.begin_start().unwrap();
            Self {
                ctx,
                engine,
                generation,
            }
        }

        fn cookie(&self) -> String {
            self.engine
                .session
                .as_ref()
                .map(|s| s.protocol.cookie().to_string())
                .unwrap()
        }

        fn event(&mut self, kind: TransportEventKind) -> Vec<Effect> {
            self.engine.on_transport_event(TransportEvent {
                generation: self.generation,
                kind,
            })
        }

        fn frame(&mut self, value: Value) -> Vec<Effect> {
            self.event(TransportEventKind::Frame(value))
        }

        fn reply(&mut self, in_reply_to: &str, payload: Value) -> Vec<Effect> {
            let mut value = json!({
                "type": "reply",
                "inReplyTo": in_reply_to,
                "cookie": self.cookie(),
            });
            if let (Some(obj), Value::Object(extra)) = (value.as_object_mut(), payload) {
                obj.extend(extra);
            }
            self.frame(value)
        }

        fn error(&mut self, in_reply_to: &str, message: &str) -> Vec<Effect> {
            let cookie = self.cookie();
            self.frame(json!({
                "type": "error",
                "inReplyTo": in_reply_to,
                "cookie": cookie,
                "errorMessage": message,
            }))
        }

        fn hello(&mut self) -> Vec<Effect> {
            self.frame(json!({
                "type": "hello",
                "supportedProtocolVersions": [{ "major": 1, "minor": 0 }]
            }))
        }

        /// Drive the session to Idle after a completed handshake
        fn ready(mut self) -> Self {
            self.event(TransportEventKind::Connected);
            self.hello();
            self.reply("handshake", json!({}));
            assert_eq!(self.engine.state(), SessionState::Idle);
            self
        }

        /// Drive a configure chain to completion
        fn configured(mut self) -> Self {
            self.engine.configure(false).unwrap();
            self.reply("configure", json!({}));
            self.reply("compute", json!({}));
            self.reply("codemodel", debug_codemodel());
            assert!(self.engine.is_configured());
            self
        }
    }

    fn debug_codemodel() -> Value {
        json!({
            "configurations": [{
                "name": "Debug",
                "projects": [{
                    "name": "demo",
                    "targets": [
                        { "name": "app", "type": "EXECUTABLE" },
                        { "name": "gen", "type": "UTILITY" }
                    ]
                }]
            }]
        })
    }

    fn sent(effects: &[Effect]) -> Vec<RequestKind> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Send(request) => Some(request.kind),
                _ => None,
            })
            .collect()
    }

    fn notices(effects: &[Effect]) -> Vec<ControllerEvent> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Notify(event) => Some(event.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_start_is_noop_with_live_session() {
        let mut harness = Harness::new();
        assert_eq!(harness.engine.state(), SessionState::Starting);
        assert_eq!(harness.engine.begin_start(), None);
        assert_eq!(harness.engine.generation(), Some(harness.generation));
    }

    #[test]
    fn test_handshake_flow() {
        let mut harness = Harness::new();

        let effects = harness.event(TransportEventKind::Connected);
        assert_eq!(notices(&effects), vec![ControllerEvent::Connected]);
        assert_eq!(harness.engine.state(), SessionState::AwaitingHello);

        let effects = harness.hello();
        assert_eq!(sent(&effects), vec![RequestKind::Handshake]);
        assert_eq!(harness.engine.state(), SessionState::Handshaking);
        let Effect::Send(handshake) = &effects[0] else {
            panic!("Expected handshake request");
        };
        let value = handshake.to_value();
        assert_eq!(value["sourceDirectory"], "/work");
        assert_eq!(value["buildDirectory"], "/work/build");
        assert_eq!(value["generator"], "Ninja");
        assert_eq!(value["cookie"], harness.cookie().as_str());

        let effects = harness.reply("handshake", json!({}));
        assert_eq!(harness.engine.state(), SessionState::Idle);
        assert_eq!(sent(&effects), vec![RequestKind::GlobalSettings]);
        assert_eq!(notices(&effects), vec![ControllerEvent::Ready]);
    }

    #[test]
    fn test_handshake_uses_default_generator() {
        let mut harness = Harness::new();
        harness.ctx.set_generator(None);
        harness.event(TransportEventKind::Connected);
        let effects = harness.hello();
        let Effect::Send(handshake) = &effects[0] else {
            panic!("Expected handshake request");
        };
        assert_eq!(handshake.to_value()["generator"], DEFAULT_GENERATOR);
    }

    #[test]
    fn test_unsupported_protocol_stops_session() {
        let mut harness = Harness::new();
        harness.event(TransportEventKind::Connected);
        let effects = harness.frame(json!({
            "type": "hello",
            "supportedProtocolVersions": [{ "major": 2, "minor": 0 }]
        }));

        assert!(effects.contains(&Effect::StopServer));
        assert_eq!(
            notices(&effects)[0],
            ControllerEvent::ProtocolError(ProtocolError::UnsupportedProtocol {
                required: 1,
                offered: vec![2],
            })
        );
        assert_eq!(harness.engine.state(), SessionState::Disconnected);
    }

    #[test]
    fn test_global_settings_capabilities_forwarded() {
        let mut harness = Harness::new().ready();
        harness.reply(
            "globalSettings",
            json!({
                "capabilities": {
                    "generators": [{ "name": "Ninja", "platformSupport": false }],
                    "serverMode": true,
                    "version": { "string": "3.10.2", "major": 3, "minor": 10 }
                }
            }),
        );

        let capabilities = harness.ctx.capabilities().unwrap();
        assert!(capabilities.supports_generator("Ninja"));
        assert!(capabilities.server_mode);
    }

    #[test]
    fn test_global_settings_with_mock_provider() {
        let ctx = TestContext::new();
        let mut generators = MockGeneratorProvider::new();
        generators
            .expect_selected_generator()
            .returning(|| Some(Generator::new("Unix Makefiles")));
        generators
            .expect_update_capabilities()
            .withf(|caps| caps.supports_generator("Unix Makefiles"))
            .times(1)
            .return_const(());

        let mut collaborators = ctx.collaborators();
        collaborators.generators = Arc::new(generators);
        let harness = Harness::with_collaborators(ctx, collaborators);
        let mut harness = harness.ready();
        harness.reply(
            "globalSettings",
            json!({ "capabilities": { "generators": [{ "name": "Unix Makefiles" }] } }),
        );
    }

    #[test]
    fn test_configure_chain() {
        let mut harness = Harness::new().ready();

        let effects = harness.engine.configure(false).unwrap();
        assert_eq!(harness.engine.state(), SessionState::Configuring);
        let Effect::Send(configure) = &effects[0] else {
            panic!("Expected configure request");
        };
        assert_eq!(
            configure.to_value()["cacheArguments"],
            json!([
                "-DCMAKE_BUILD_TYPE=Debug",
                "-DCMAKE_C_COMPILER=/usr/bin/gcc",
                "-DCMAKE_CXX_COMPILER=/usr/bin/g++"
            ])
        );

        let effects = harness.reply("configure", json!({}));
        assert_eq!(sent(&effects), vec![RequestKind::Compute]);
        assert_eq!(harness.engine.state(), SessionState::Computing);
        assert!(!harness.engine.is_configured());

        let effects = harness.reply("compute", json!({}));
        assert_eq!(sent(&effects), vec![RequestKind::CodeModel]);
        assert_eq!(harness.engine.state(), SessionState::ExtractingTargets);
        assert!(harness.engine.is_configured());

        let effects = harness.reply("codemodel", debug_codemodel());
        assert_eq!(harness.engine.state(), SessionState::Idle);
        assert_eq!(
            notices(&effects),
            vec![ControllerEvent::Configured {
                targets: vec!["[all]".into(), "app".into(), "gen".into()]
            }]
        );
        assert_eq!(
            harness.engine.targets().target_names(),
            vec!["[all]", "app", "gen"]
        );
    }

    #[test]
    fn test_clean_configure_removes_cache_first() {
        let mut harness = Harness::new().ready();
        let effects = harness.engine.configure(true).unwrap();
        assert_eq!(
            effects[0],
            Effect::RemoveCache(PathBuf::from("/work/build/CMakeCache.txt"))
        );
        assert_eq!(sent(&effects), vec![RequestKind::Configure]);
    }

    #[test]
    fn test_configure_without_session() {
        let ctx = TestContext::new();
        let mut engine = ProtocolEngine::new(ctx.collaborators());
        assert_eq!(engine.configure(false), Err(EngineError::NotConnected));
        assert!(!ctx.logged().is_empty());
    }

    #[test]
    fn test_configure_without_toolchain() {
        let mut harness = Harness::new().ready();
        harness.ctx.set_toolchain(None);
        assert_eq!(harness.engine.configure(false), Err(EngineError::NoToolchain));
        assert_eq!(harness.engine.state(), SessionState::Idle);
    }

    #[test]
    fn test_configure_while_chain_in_flight_is_busy() {
        let mut harness = Harness::new().ready();
        harness.engine.configure(false).unwrap();
        assert!(matches!(
            harness.engine.configure(false),
            Err(EngineError::Busy(_))
        ));
    }

    #[test]
    fn test_dirty_clears_configured_only() {
        let mut harness = Harness::new().ready().configured();
        let before = harness.engine.snapshot();

        harness.frame(json!({ "type": "signal", "name": "dirty", "cookie": "", "inReplyTo": "" }));

        let after = harness.engine.snapshot();
        assert!(!harness.engine.is_configured());
        assert_eq!(after.state, before.state);
        assert_eq!(after.targets, before.targets);
    }

    #[test]
    fn test_dirty_during_chain_keeps_chain_and_deferred_build() {
        let mut harness = Harness::new().ready();
        harness.engine.run(BuildAction::Build).unwrap();
        harness.reply("configure", json!({}));
        assert_eq!(harness.engine.state(), SessionState::Computing);

        let effects =
            harness.frame(json!({ "type": "signal", "name": "dirty", "cookie": "", "inReplyTo": "" }));
        assert!(effects.is_empty());
        assert_eq!(harness.engine.state(), SessionState::Computing);
        assert!(!harness.engine.is_configured());

        harness.reply("compute", json!({}));
        assert!(harness.engine.is_configured());
        let effects = harness.reply("codemodel", debug_codemodel());
        let builds = effects
            .iter()
            .filter(|e| matches!(e, Effect::RunBuild(_)))
            .count();
        assert_eq!(builds, 1);
        assert_eq!(harness.engine.state(), SessionState::Idle);
    }

    #[test]
    fn test_missing_configuration_keeps_previous_model() {
        let mut harness = Harness::new().ready().configured();
        harness.ctx.set_variant("Release");

        harness.engine.configure(false).unwrap();
        harness.reply("configure", json!({}));
        harness.reply("compute", json!({}));
        let effects = harness.reply("codemodel", debug_codemodel());

        assert!(matches!(
            notices(&effects)[0],
            ControllerEvent::CodeModelFailed(CodeModelError::ConfigurationNotFound { .. })
        ));
        assert_eq!(harness.engine.state(), SessionState::Idle);
        assert_eq!(
            harness.engine.targets().target_names(),
            vec!["[all]", "app", "gen"]
        );
    }

    #[test]
    fn test_no_usable_targets_replaces_model() {
        let mut harness = Harness::new().ready().configured();
        harness.engine.configure(false).unwrap();
        harness.reply("configure", json!({}));
        harness.reply("compute", json!({}));
        harness.reply(
            "codemodel",
            json!({ "configurations": [{ "name": "Debug", "projects": [] }] }),
        );

        let targets = harness.engine.targets();
        assert_eq!(targets.status(), crate::types::ModelStatus::NoUsableTargets);
        assert_eq!(targets.target_names(), vec!["[all]"]);
    }

    #[test]
    fn test_build_when_unconfigured_configures_once_then_builds() {
        let mut harness = Harness::new().ready();
        let mut effects = harness.engine.run(BuildAction::Build).unwrap();
        effects.extend(harness.reply("configure", json!({})));
        effects.extend(harness.reply("compute", json!({})));
        effects.extend(harness.reply("codemodel", debug_codemodel()));

        let configures = sent(&effects)
            .into_iter()
            .filter(|k| *k == RequestKind::Configure)
            .count();
        assert_eq!(configures, 1);

        let builds: Vec<usize> = effects
            .iter()
            .enumerate()
            .filter(|(_, e)| matches!(e, Effect::RunBuild(_)))
            .map(|(i, _)| i)
            .collect();
        assert_eq!(builds.len(), 1);
        let configure_at = effects
            .iter()
            .position(|e| matches!(e, Effect::Send(r) if r.kind == RequestKind::Configure))
            .unwrap();
        assert!(configure_at < builds[0]);
        assert_eq!(
            harness.engine.snapshot().build_running,
            Some(BuildAction::Build)
        );
    }

    #[test]
    fn test_build_when_configured_runs_directly() {
        let mut harness = Harness::new().ready().configured();
        harness.ctx.set_target(Some("app"));

        let effects = harness.engine.run(BuildAction::Build).unwrap();
        assert!(sent(&effects).is_empty());
        let Some(Effect::RunBuild(invocation)) = effects.last() else {
            panic!("Expected build invocation");
        };
        assert!(invocation.command_line().contains("--target app"));
    }

    #[test]
    fn test_second_build_while_running_is_busy() {
        let mut harness = Harness::new().ready().configured();
        harness.engine.run(BuildAction::Build).unwrap();
        assert!(matches!(
            harness.engine.run(BuildAction::Clean),
            Err(EngineError::Busy(_))
        ));

        let effects = harness
            .engine
            .on_build_finished(BuildAction::Build, Ok(Some(0)));
        assert_eq!(
            notices(&effects),
            vec![ControllerEvent::BuildFinished {
                action: BuildAction::Build,
                exit_code: Some(0)
            }]
        );
        assert!(harness.engine.run(BuildAction::Clean).is_ok());
    }

    #[test]
    fn test_build_attaches_to_inflight_configure() {
        let mut harness = Harness::new().ready();
        harness.engine.configure(false).unwrap();

        assert_eq!(harness.engine.run(BuildAction::Install).unwrap(), Vec::new());
        assert!(matches!(
            harness.engine.run(BuildAction::Build),
            Err(EngineError::Busy(_))
        ));

        harness.reply("configure", json!({}));
        harness.reply("compute", json!({}));
        let effects = harness.reply("codemodel", debug_codemodel());
        let Some(Effect::RunBuild(invocation)) = effects.last() else {
            panic!("Expected install invocation");
        };
        assert_eq!(invocation.action, BuildAction::Install);
    }

    #[test]
    fn test_verbs_before_handshake_are_deferred() {
        let mut harness = Harness::new();
        assert_eq!(harness.engine.configure(false).unwrap(), Vec::new());
        assert!(matches!(
            harness.engine.run(BuildAction::Build),
            Err(EngineError::Busy(_))
        ));

        harness.event(TransportEventKind::Connected);
        harness.hello();
        let effects = harness.reply("handshake", json!({}));

        assert_eq!(
            sent(&effects),
            vec![RequestKind::Configure, RequestKind::GlobalSettings]
        );
        assert_eq!(harness.engine.state(), SessionState::Configuring);
    }

    #[test]
    fn test_cookie_mismatch_leaves_snapshot_identical() {
        let mut harness = Harness::new().ready();
        harness.engine.configure(false).unwrap();
        let before = harness.engine.snapshot();

        let effects = harness.frame(json!({
            "type": "reply",
            "inReplyTo": "configure",
            "cookie": "someone-else"
        }));
        assert!(effects.is_empty());
        let effects = harness.frame(json!({
            "type": "error",
            "inReplyTo": "configure",
            "cookie": "someone-else",
            "errorMessage": "nope"
        }));
        assert!(effects.is_empty());

        assert_eq!(harness.engine.snapshot(), before);
    }

    #[test]
    fn test_reply_to_unexpected_request_is_dropped() {
        let mut harness = Harness::new().ready();
        harness.engine.configure(false).unwrap();
        let before = harness.engine.snapshot();

        assert!(harness.reply("compute", json!({})).is_empty());
        assert_eq!(harness.engine.snapshot(), before);
    }

    #[test]
    fn test_server_error_aborts_chain() {
        let mut harness = Harness::new().ready();
        harness.engine.run(BuildAction::Build).unwrap();

        let effects = harness.error("configure", "CMake Error at CMakeLists.txt:3");
        assert_eq!(
            notices(&effects),
            vec![ControllerEvent::ServerError {
                in_reply_to: "configure".into(),
                message: "CMake Error at CMakeLists.txt:3".into()
            }]
        );
        assert_eq!(harness.engine.state(), SessionState::Idle);
        assert!(!harness.engine.is_configured());
        assert!(harness
            .ctx
            .logged()
            .iter()
            .any(|l| l.contains("CMakeLists.txt:3")));

        // The queued build was dropped with the chain
        assert!(harness.engine.configure(false).is_ok());
        harness.reply("configure", json!({}));
        harness.reply("compute", json!({}));
        let effects = harness.reply("codemodel", debug_codemodel());
        assert!(!effects.iter().any(|e| matches!(e, Effect::RunBuild(_))));
    }

    #[test]
    fn test_server_error_keeps_configured() {
        let mut harness = Harness::new().ready().configured();
        harness.engine.configure(false).unwrap();
        harness.error("configure", "boom");
        assert!(harness.engine.is_configured());
    }

    #[test]
    fn test_handshake_error_stops_session() {
        let mut harness = Harness::new();
        harness.event(TransportEventKind::Connected);
        harness.hello();
        let effects = harness.error("handshake", "Failed to activate protocol version");

        assert!(effects.contains(&Effect::StopServer));
        assert_eq!(harness.engine.state(), SessionState::Disconnected);
    }

    #[test]
    fn test_server_messages_reach_log_sink() {
        let mut harness = Harness::new().ready();
        harness.frame(json!({ "type": "message", "message": "-- The C compiler identification is GNU" }));
        harness.frame(json!({ "type": "progress", "progressMessage": "Configuring", "progressCurrent": 1 }));
        assert_eq!(
            harness.ctx.logged(),
            vec!["-- The C compiler identification is GNU".to_string()]
        );
    }

    #[test]
    fn test_stop_then_exit_is_not_unexpected() {
        let mut harness = Harness::new().ready();
        let effects = harness.engine.stop();
        assert_eq!(effects[0], Effect::StopServer);
        assert_eq!(
            notices(&effects),
            vec![ControllerEvent::Disconnected {
                unexpected: false,
                reason: None
            }]
        );

        let effects = harness.event(TransportEventKind::Exited(ExitReport {
            kind: ExitKind::Intentional,
            before_ready: false,
            status: None,
            stderr_tail: Vec::new(),
        }));
        assert!(effects.is_empty());
        assert_eq!(harness.engine.state(), SessionState::Disconnected);
    }

    #[test]
    fn test_unexpected_exit_resets_and_allows_restart() {
        let mut harness = Harness::new().ready().configured();
        let effects = harness.event(TransportEventKind::Exited(ExitReport {
            kind: ExitKind::Unexpected,
            before_ready: false,
            status: Some(1),
            stderr_tail: vec!["Segmentation fault".to_string()],
        }));

        assert!(matches!(
            notices(&effects)[0],
            ControllerEvent::Failed(EngineError::UnexpectedExit(_))
        ));
        assert_eq!(harness.engine.state(), SessionState::Disconnected);
        assert!(!harness.engine.is_configured());

        let next = harness.engine.begin_start().unwrap();
        assert!(next > harness.generation);
    }

    #[test]
    fn test_exit_before_endpoint_reports_start_failure() {
        let mut harness = Harness::new();
        let effects = harness.event(TransportEventKind::Exited(ExitReport {
            kind: ExitKind::Unexpected,
            before_ready: true,
            status: Some(3),
            stderr_tail: Vec::new(),
        }));

        assert_eq!(
            notices(&effects),
            vec![
                ControllerEvent::StartFailed(StartupError::ExitedBeforeReady(
                    "exit code 3".to_string()
                )),
                ControllerEvent::Disconnected {
                    unexpected: true,
                    reason: Some("exit code 3".to_string()),
                },
            ]
        );
        assert_eq!(harness.engine.state(), SessionState::Disconnected);
    }

    #[test]
    fn test_events_from_superseded_session_are_ignored() {
        let mut harness = Harness::new();
        harness.engine.stop();
        let next = harness.engine.begin_start().unwrap();

        let effects = harness.event(TransportEventKind::Exited(ExitReport {
            kind: ExitKind::Unexpected,
            before_ready: false,
            status: Some(1),
            stderr_tail: Vec::new(),
        }));
        assert!(effects.is_empty());
        assert_eq!(harness.engine.generation(), Some(next));
        assert_eq!(harness.engine.state(), SessionState::Starting);
    }
}
