use nix::errno::Errno;
use nix::unistd::Pid;
use thiserror::Error;

use crate::process_control::{Role, SignalKind};

/// Errors raised while spawning, signalling or waiting on stress processes
#[derive(Error, Debug)]
pub enum StressError {
    #[error("Error spawning {role} process: {source}")]
    Spawn { role: Role, source: Errno },

    #[error("Failed to send {kind} to process {pid}: {source}")]
    Signal {
        pid: Pid,
        kind: SignalKind,
        source: Errno,
    },

    #[error("Wait on {} failed: {source}", wait_target(.pid))]
    Wait { pid: Option<Pid>, source: Errno },

    #[error("Setup failed ({0}): {1}")]
    Setup(String, Errno),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl StressError {
    /// Interrupted and no-child wait outcomes are retried by the observer
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StressError::Wait {
                source: Errno::EINTR | Errno::ECHILD,
                ..
            }
        )
    }

    /// The underlying errno, when there is one
    pub fn errno(&self) -> Option<Errno> {
        match self {
            StressError::Spawn { source, .. }
            | StressError::Signal { source, .. }
            | StressError::Wait { source, .. }
            | StressError::Setup(_, source) => Some(*source),
            StressError::Config(_) => None,
        }
    }
}

fn wait_target(pid: &Option<Pid>) -> String {
    pid.map_or_else(|| "any child".to_string(), |pid| pid.to_string())
}
