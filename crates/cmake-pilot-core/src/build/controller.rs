//! Build controller: the verbs the rest of the system calls
//!
//! [`BuildController`] is a cheap handle over one driver task. The driver
//! owns the [`ProtocolEngine`] and the live server link, and processes
//! verbs, transport events and build completions one at a time. Queries
//! read the latest [`EngineSnapshot`] from a watch channel and never wait
//! on the driver.

use super::invocation::{BuildAction, BuildRunner, ProcessBuildRunner};
use super::version::{check_version, CommandVersionQuery, VersionQuery};
use crate::context::Collaborators;
use crate::error::{Error, Result};
use crate::server::{
    endpoint_path, ControllerEvent, Effect, EngineSnapshot, FrameCodec, LaunchSpec,
    ProcessLauncher, ProtocolEngine, ServerLauncher, ServerLink, SessionState, TransportEvent,
};
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

const COMMAND_CHANNEL_CAPACITY: usize = 32;
const TRANSPORT_CHANNEL_CAPACITY: usize = 256;
const EVENT_CHANNEL_CAPACITY: usize = 128;

#[derive(Debug, Clone, Copy)]
enum Verb {
    Start,
    Stop,
    Restart { delete_build_dir: bool },
    Configure { clean_cache: bool },
    Run(BuildAction),
    Nuke,
}

struct Command {
    verb: Verb,
    reply: oneshot::Sender<Result<()>>,
}

type BuildOutcome = (BuildAction, std::result::Result<Option<i32>, String>);

/// Handle to the controller driver. Dropping the last handle stops the
/// server.
pub struct BuildController {
    ctx: Collaborators,
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<EngineSnapshot>,
    events: broadcast::Sender<ControllerEvent>,
}

impl BuildController {
    /// Controller backed by real `cmake` processes. Must be called inside
    /// a Tokio runtime.
    pub fn new(ctx: Collaborators) -> Self {
        Self::with_parts(
            ctx,
            Arc::new(ProcessLauncher),
            Arc::new(ProcessBuildRunner),
            Arc::new(CommandVersionQuery),
        )
    }

    pub fn with_parts(
        ctx: Collaborators,
        launcher: Arc<dyn ServerLauncher>,
        runner: Arc<dyn BuildRunner>,
        query: Arc<dyn VersionQuery>,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (transport_tx, transport_rx) = mpsc::channel(TRANSPORT_CHANNEL_CAPACITY);
        let (build_tx, build_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (snapshot_tx, snapshot_rx) = watch::channel(EngineSnapshot::default());
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let driver = Driver {
            engine: ProtocolEngine::new(ctx.clone()),
            ctx: ctx.clone(),
            launcher,
            runner,
            query,
            codec: FrameCodec::new(),
            link: None,
            transport_tx,
            build_tx,
            snapshot_tx,
            events: events_tx.clone(),
        };
        tokio::spawn(driver.run(commands_rx, transport_rx, build_rx));

        Self {
            ctx,
            commands: commands_tx,
            snapshot: snapshot_rx,
            events: events_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.events.subscribe()
    }

    pub fn watch(&self) -> watch::Receiver<EngineSnapshot> {
        self.snapshot.clone()
    }

    async fn request(&self, verb: Verb) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command { verb, reply })
            .await
            .map_err(|_| Error::Internal("controller driver has stopped".to_string()))?;
        rx.await
            .map_err(|_| Error::Internal(format!("controller dropped {:?}", verb)))?
    }

    /// Query cmake and launch a server. A no-op while a session exists.
    pub async fn start(&self) -> Result<()> {
        self.request(Verb::Start).await
    }

    pub async fn stop(&self) -> Result<()> {
        self.request(Verb::Stop).await
    }

    pub async fn restart(&self, delete_build_dir: bool) -> Result<()> {
        self.request(Verb::Restart { delete_build_dir }).await
    }

    pub async fn configure(&self, clean_cache: bool) -> Result<()> {
        self.request(Verb::Configure { clean_cache }).await
    }

    pub async fn build(&self) -> Result<()> {
        self.request(Verb::Run(BuildAction::Build)).await
    }

    pub async fn clean(&self) -> Result<()> {
        self.request(Verb::Run(BuildAction::Clean)).await
    }

    pub async fn install(&self) -> Result<()> {
        self.request(Verb::Run(BuildAction::Install)).await
    }

    /// Stop, delete the build directory, start again and configure
    pub async fn nuke(&self) -> Result<()> {
        self.request(Verb::Nuke).await
    }

    /// `[all]` followed by the current targets
    pub fn targets(&self) -> Vec<String> {
        self.snapshot.borrow().targets.target_names()
    }

    pub fn configurations(&self) -> Vec<String> {
        self.ctx.variants.configurations()
    }

    pub fn is_configured(&self) -> bool {
        self.snapshot.borrow().configured
    }

    pub fn state(&self) -> SessionState {
        self.snapshot.borrow().state
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        self.snapshot.borrow().clone()
    }
}

/// Owns the engine and the server link
struct Driver {
    engine: ProtocolEngine,
    ctx: Collaborators,
    launcher: Arc<dyn ServerLauncher>,
    runner: Arc<dyn BuildRunner>,
    query: Arc<dyn VersionQuery>,
    codec: FrameCodec,
    link: Option<Box<dyn ServerLink>>,
    transport_tx: mpsc::Sender<TransportEvent>,
    build_tx: mpsc::Sender<BuildOutcome>,
    snapshot_tx: watch::Sender<EngineSnapshot>,
    events: broadcast::Sender<ControllerEvent>,
}

impl Driver {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut transport: mpsc::Receiver<TransportEvent>,
        mut builds: mpsc::Receiver<BuildOutcome>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(Command { verb, reply }) = command else {
                        break;
                    };
                    let result = self.handle(verb).await;
                    if let Err(e) = &result {
                        debug!("{:?} failed: {}", verb, e);
                    }
                    let _ = reply.send(result);
                }
                Some(event) = transport.recv() => {
                    let effects = self.engine.on_transport_event(event);
                    self.apply(effects).await;
                    if !self.engine.has_session() && self.link.take().is_some() {
                        debug!("Released link of ended session");
                    }
                }
                Some((action, outcome)) = builds.recv() => {
                    let effects = self.engine.on_build_finished(action, outcome);
                    self.apply(effects).await;
                }
            }
        }

        debug!("Controller handle dropped, shutting down");
        let effects = self.engine.stop();
        self.apply(effects).await;
    }

    async fn handle(&mut self, verb: Verb) -> Result<()> {
        match verb {
            Verb::Start => self.start().await,
            Verb::Stop => {
                let effects = self.engine.stop();
                self.apply(effects).await;
                Ok(())
            }
            Verb::Restart { delete_build_dir } => self.restart(delete_build_dir).await,
            Verb::Configure { clean_cache } => {
                let effects = self.engine.configure(clean_cache)?;
                self.apply(effects).await;
                Ok(())
            }
            Verb::Run(action) => {
                let effects = self.engine.run(action)?;
                self.apply(effects).await;
                Ok(())
            }
            Verb::Nuke => {
                info!("Nuking build directory");
                self.restart(true).await?;
                let effects = self.engine.configure(false)?;
                self.apply(effects).await;
                Ok(())
            }
        }
    }

    async fn start(&mut self) -> Result<()> {
        if self.engine.has_session() {
            debug!("Server already running ({})", self.engine.state());
            return Ok(());
        }

        let cmake = self.ctx.paths.cmake_path();
        check_version(self.query.as_ref(), &cmake, self.ctx.confirm.as_ref()).await?;

        let build_dir = self.ctx.paths.build_dir();
        tokio::fs::create_dir_all(&build_dir).await?;

        let Some(generation) = self.engine.begin_start() else {
            return Ok(());
        };
        self.publish();

        let env = self
            .ctx
            .toolchains
            .selected_toolchain()
            .map(|t| t.env)
            .unwrap_or_default();
        let endpoint = endpoint_path(&format!("{}-{}", std::process::id(), generation));
        let mut spec = LaunchSpec::cmake_server(cmake, endpoint, env);
        spec.cwd = Some(self.ctx.paths.source_dir());

        match self
            .launcher
            .launch(spec, generation, self.transport_tx.clone())
            .await
        {
            Ok(link) => {
                self.link = Some(link);
                Ok(())
            }
            Err(e) => {
                error!("Failed to start CMake server: {}", e);
                self.ctx
                    .log
                    .log(&format!("Unable to start the CMake server: {}", e));
                self.engine.abort_start(generation);
                self.publish();
                Err(e)
            }
        }
    }

    async fn restart(&mut self, delete_build_dir: bool) -> Result<()> {
        let effects = self.engine.stop();
        self.apply(effects).await;
        if delete_build_dir {
            let build_dir = self.ctx.paths.build_dir();
            remove_build_dir(&build_dir).await?;
        }
        self.start().await
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(self.engine.snapshot());
    }

    /// Execute effects in order. The snapshot is published first so that
    /// subscribers reacting to a notification read the new state.
    async fn apply(&mut self, effects: Vec<Effect>) {
        self.publish();
        for effect in effects {
            match effect {
                Effect::Send(request) => {
                    let Some(link) = &self.link else {
                        warn!("No server link, dropping {} request", request.kind);
                        continue;
                    };
                    debug!("Sending {} request", request.kind);
                    if let Err(e) = link.send(self.codec.encode(&request)).await {
                        error!("Failed to send {} request: {}", request.kind, e);
                    }
                }
                Effect::RemoveCache(path) => remove_cache(&path).await,
                Effect::RunBuild(invocation) => {
                    let runner = Arc::clone(&self.runner);
                    let log = Arc::clone(&self.ctx.log);
                    let done = self.build_tx.clone();
                    tokio::spawn(async move {
                        let action = invocation.action;
                        let outcome = runner
                            .run(invocation, log)
                            .await
                            .map_err(|e| e.to_string());
                        if done.send((action, outcome)).await.is_err() {
                            debug!("Controller gone before {} finished", action);
                        }
                    });
                }
                Effect::StopServer => {
                    if let Some(link) = self.link.take() {
                        link.stop();
                    }
                }
                Effect::Notify(event) => {
                    // No subscribers is fine
                    let _ = self.events.send(event);
                }
            }
        }
    }
}

async fn remove_cache(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => info!("Removed {}", path.display()),
        Err(e) if e.kind() == ErrorKind::NotFound => debug!("No cache at {}", path.display()),
        Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
    }
}

async fn remove_build_dir(path: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => {
            info!("Removed build directory {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
