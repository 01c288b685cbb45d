//! Drive an OCI bundle through an external runtime (`runc` and friends):
//! create, run the declared hooks, start, wait, and always delete.
//!
//! Hook timeouts are parsed but not enforced. A hook that never exits blocks
//! its phase indefinitely; a warning is logged when such a hook is loaded.
pub mod cli;
pub mod config;
pub mod container;
pub mod hooks;
pub mod lifecycle;
pub mod linux;
pub mod runtime;

use std::panic::Location;

use thiserror::Error;

use crate::{container::Status, runtime::RuntimePhase};

/// Exit code when `create` (or the follow-up `state` query) fails.
pub const EXIT_CREATE: i32 = 10;
/// Exit code when `start` fails.
pub const EXIT_START: i32 = 11;
/// Exit code when a hook fails.
pub const EXIT_HOOK: i32 = 12;
/// Exit code when `delete` is the only failure.
pub const EXIT_DELETE: i32 = 13;
/// Exit code when the parent-death supervisor cannot be set up.
pub const EXIT_SUPERVISOR: i32 = 14;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("runtime {phase} failed with exit code `{exit_code:?}`: {stderr}")]
    Runtime {
        phase: RuntimePhase,
        exit_code: Option<i32>,
        stderr: String,
    },
    #[error("{name} exited with status {status}: {stderr}")]
    Hook {
        name: String,
        status: i32,
        stderr: String,
    },
    #[error("{name} could not be spawned: `{err:?}`")]
    HookSpawn {
        name: String,
        err: std::io::Error,
    },
    /// Never produced yet: hook timeouts are not enforced.
    #[error("{name} did not exit within {timeout}s")]
    HookTimeout { name: String, timeout: i32 },
    #[error("cleanup failed: {0}")]
    Cleanup(Box<OrchestratorError>),
    #[error("invalid state transition `{from}` -> `{to}`")]
    InvalidTransition { from: Status, to: Status },
    #[error("death signal supervisor: `{0:?}`")]
    DeathSignal(nix::Error),
    #[error("Nix error: `{0:?}`, '{1:?}'")]
    NixError(nix::Error, &'static Location<'static>),
    #[error(transparent)]
    IOError(#[from] std::io::Error),
    #[error(transparent)]
    SerdeError(#[from] serde_json::error::Error),
}

impl From<nix::Error> for OrchestratorError {
    #[track_caller]
    fn from(err: nix::Error) -> Self {
        OrchestratorError::NixError(err, std::panic::Location::caller())
    }
}

impl OrchestratorError {
    /// Process exit code for the failure class of this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            OrchestratorError::Runtime { phase, .. } => match phase {
                RuntimePhase::Create | RuntimePhase::State => EXIT_CREATE,
                RuntimePhase::Start => EXIT_START,
                RuntimePhase::Delete => EXIT_DELETE,
            },
            OrchestratorError::Hook { .. }
            | OrchestratorError::HookSpawn { .. }
            | OrchestratorError::HookTimeout { .. } => EXIT_HOOK,
            OrchestratorError::Cleanup(_) => EXIT_DELETE,
            OrchestratorError::DeathSignal(_) => EXIT_SUPERVISOR,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
