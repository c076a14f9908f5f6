//! Errors surfaced by the process supervisor.

use crate::process::ExitState;
use thiserror::Error;

/// Errors produced by supervisor operations and the process it owns.
///
/// Only the variants listed per operation are returned to callers.
/// `CrashDetected` is never returned from a call; it is recorded on the
/// supervisor status when the child dies on its own.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("server is already running")]
    AlreadyRunning,

    #[error("server is not running")]
    NotRunning,

    #[error("failed to spawn '{program}': {source}")]
    SpawnError {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("process is not running")]
    ProcessNotRunning,

    #[error("server terminated unexpectedly ({exit})")]
    CrashDetected { exit: ExitState },
}

impl SupervisorError {
    /// Short stable label (snake_case) used in logs and on the wire.
    pub fn as_label(&self) -> &'static str {
        match self {
            SupervisorError::AlreadyRunning => "already_running",
            SupervisorError::NotRunning => "not_running",
            SupervisorError::SpawnError { .. } => "spawn_error",
            SupervisorError::ProcessNotRunning => "process_not_running",
            SupervisorError::CrashDetected { .. } => "crash_detected",
        }
    }

    pub(crate) fn spawn(program: impl Into<String>, source: std::io::Error) -> Self {
        SupervisorError::SpawnError {
            program: program.into(),
            source,
        }
    }
}

pub type Result<T, E = SupervisorError> = std::result::Result<T, E>;
