//! Waiting on controller events until a verb has finished

use anyhow::{anyhow, bail, Result};
use cmake_pilot_core::{BuildAction, ControllerEvent};
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// What the command is waiting for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Goal {
    Configured,
    Build(BuildAction),
}

/// Outcome of one event with respect to the goal
#[derive(Debug, PartialEq)]
pub enum Step {
    Continue,
    Done,
}

pub fn step(goal: Goal, event: &ControllerEvent) -> Result<Step> {
    match event {
        ControllerEvent::Configured { targets } => {
            debug!("Configured, targets: {:?}", targets);
            Ok(match goal {
                Goal::Configured => Step::Done,
                Goal::Build(_) => Step::Continue,
            })
        }
        ControllerEvent::CodeModelFailed(e) => {
            warn!("{}", e);
            Ok(match goal {
                Goal::Configured => Step::Done,
                Goal::Build(_) => Step::Continue,
            })
        }
        ControllerEvent::BuildFinished { action, exit_code } if Goal::Build(*action) == goal => {
            match exit_code {
                Some(0) => Ok(Step::Done),
                Some(code) => bail!("{} failed with exit code {}", action, code),
                None => bail!("{} was terminated by a signal", action),
            }
        }
        ControllerEvent::BuildFailed { action, reason } => bail!("{} failed: {}", action, reason),
        ControllerEvent::ServerError {
            in_reply_to,
            message,
        } => bail!("CMake {} failed: {}", in_reply_to, message),
        ControllerEvent::ProtocolError(e) => Err(anyhow!(e.clone())),
        ControllerEvent::StartFailed(e) => Err(anyhow!(e.clone())),
        ControllerEvent::Failed(e) => Err(anyhow!(e.clone())),
        ControllerEvent::Disconnected {
            unexpected: true,
            reason,
        } => bail!(
            "CMake server exited unexpectedly: {}",
            reason.as_deref().unwrap_or("no details")
        ),
        ControllerEvent::Disconnected {
            unexpected: false,
            reason: Some(reason),
        } => bail!("CMake server session ended: {}", reason),
        _ => Ok(Step::Continue),
    }
}

pub async fn wait_for(
    events: &mut broadcast::Receiver<ControllerEvent>,
    goal: Goal,
) -> Result<()> {
    loop {
        match events.recv().await {
            Ok(event) => {
                if step(goal, &event)? == Step::Done {
                    return Ok(());
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Missed {} controller events", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => {
                bail!("controller stopped before {:?} completed", goal)
            }
        }
    }
}
