//! Native build invocations (`cmake --build`)

use crate::context::{Collaborators, LogSink};
use crate::error::{Error, Result, StartupError};
use crate::types::{Generator, ALL_TARGET};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, error, info};

/// Generator used when none is selected
pub const DEFAULT_GENERATOR: &str = "Ninja";

/// Verbs that end in a build-tool invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuildAction {
    Build,
    Clean,
    Install,
}

impl BuildAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Build => "build",
            Self::Clean => "clean",
            Self::Install => "install",
        }
    }
}

impl std::fmt::Display for BuildAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fully resolved `cmake --build` command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildInvocation {
    pub action: BuildAction,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: PathBuf,
}

impl BuildInvocation {
    /// Resolve the invocation for `action` from the current context
    pub fn for_action(action: BuildAction, ctx: &Collaborators) -> Self {
        let build_dir = ctx.paths.build_dir();
        let mut args = vec![
            "--build".to_string(),
            build_dir.display().to_string(),
            "--config".to_string(),
            ctx.variants.active_variant(),
        ];

        let target = match action {
            BuildAction::Build => ctx
                .variants
                .active_target()
                .filter(|t| !t.is_empty() && t != ALL_TARGET),
            BuildAction::Clean => Some("clean".to_string()),
            BuildAction::Install => Some("install".to_string()),
        };
        if let Some(target) = target {
            args.push("--target".to_string());
            args.push(target);
        }

        let generator = ctx
            .generators
            .selected_generator()
            .unwrap_or_else(|| Generator::new(DEFAULT_GENERATOR));
        let mut trailing = Vec::new();
        if let Some(flag) = generator.family().parallel_flag(ctx.paths.parallel_jobs().max(1)) {
            trailing.push(flag);
        }
        trailing.extend(generator.extra_options.iter().cloned());
        if !trailing.is_empty() {
            args.push("--".to_string());
            args.extend(trailing);
        }

        let env = ctx
            .toolchains
            .selected_toolchain()
            .map(|t| t.env)
            .unwrap_or_default();

        Self {
            action,
            program: ctx.paths.cmake_path(),
            args,
            env,
            cwd: build_dir,
        }
    }

    pub fn command_line(&self) -> String {
        std::iter::once(self.program.display().to_string())
            .chain(self.args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Executes build invocations
#[async_trait]
pub trait BuildRunner: Send + Sync {
    /// Run to completion, forwarding output lines to `log`. Returns the
    /// exit code, `None` when the tool was killed by a signal.
    async fn run(&self, invocation: BuildInvocation, log: Arc<dyn LogSink>) -> Result<Option<i32>>;
}

/// Runs invocations as child processes
#[derive(Debug, Default, Clone)]
pub struct ProcessBuildRunner;

impl ProcessBuildRunner {
    async fn forward_lines(stream: impl AsyncRead + Unpin, log: Arc<dyn LogSink>) {
        let mut reader = BufReader::new(stream).lines();
        loop {
            match reader.next_line().await {
                Ok(Some(line)) => log.log(&line),
                Ok(None) => break,
                Err(e) => {
                    error!("Error reading build output: {}", e);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl BuildRunner for ProcessBuildRunner {
    async fn run(&self, invocation: BuildInvocation, log: Arc<dyn LogSink>) -> Result<Option<i32>> {
        info!("Running {}: {}", invocation.action, invocation.command_line());
        log.log(&format!("[{}] {}", invocation.action, invocation.command_line()));

        tokio::fs::create_dir_all(&invocation.cwd).await?;

        let mut child = Command::new(&invocation.program)
            .args(&invocation.args)
            .envs(&invocation.env)
            .current_dir(&invocation.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::Startup(StartupError::SpawnFailed {
                    command: invocation.program.display().to_string(),
                    reason: e.to_string(),
                })
            })?;

        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(Self::forward_lines(stderr, Arc::clone(&log))));
        if let Some(stdout) = child.stdout.take() {
            Self::forward_lines(stdout, Arc::clone(&log)).await;
        }
        if let Some(task) = stderr_task {
            let _ = task.await;
        }

        let status = child.wait().await?;
        debug!("{} finished with {}", invocation.action, status);
        Ok(status.code())
    }
}
