//! Supervisor state, status snapshots and options

use crate::logs::BroadcasterOptions;
use crate::process::ExitState;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};
use tokio::sync::watch;

use super::CommandChannel;

/// Lifecycle state of the supervised server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SupervisorState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl SupervisorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SupervisorState::Stopped => "Stopped",
            SupervisorState::Starting => "Starting",
            SupervisorState::Running => "Running",
            SupervisorState::Stopping => "Stopping",
        }
    }
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of the supervisor
#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorStatus {
    pub state: SupervisorState,

    /// Process ID while a process is alive
    pub pid: Option<u32>,

    /// Time since the current process was spawned
    pub uptime: Option<Duration>,

    /// Number of the current (or last) run, starting at 1
    pub run_id: u64,

    /// How the previous process ended
    pub last_exit: Option<ExitState>,

    /// Last asynchronous failure, such as a crash
    pub last_error: Option<String>,
}

/// Options for [`Supervisor`](super::Supervisor)
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// Console command that asks the server to exit. `None` sends SIGTERM.
    pub stop_command: Option<String>,

    /// How long Stop waits for a graceful exit
    pub stop_timeout: Duration,

    /// How long Stop waits after a forced kill
    pub kill_timeout: Duration,

    /// Console commands that may be queued before senders wait
    pub command_queue: usize,

    pub broadcaster: BroadcasterOptions,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            stop_command: None,
            stop_timeout: Duration::from_secs(15),
            kill_timeout: Duration::from_secs(5),
            command_queue: 64,
            broadcaster: BroadcasterOptions::default(),
        }
    }
}

impl SupervisorOptions {
    pub fn with_stop_command(mut self, command: impl Into<String>) -> Self {
        self.stop_command = Some(command.into());
        self
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn with_kill_timeout(mut self, timeout: Duration) -> Self {
        self.kill_timeout = timeout;
        self
    }

    pub fn with_broadcaster(mut self, options: BroadcasterOptions) -> Self {
        self.broadcaster = options;
        self
    }
}

/// What the supervisor publishes after every transition.
///
/// The command channel travels with the state so that a reader always sees
/// a channel that belongs to the state it read.
#[derive(Clone)]
pub(crate) struct Published {
    pub state: SupervisorState,
    pub pid: Option<u32>,
    pub started_at: Option<Instant>,
    pub run_id: u64,
    pub last_exit: Option<ExitState>,
    pub last_error: Option<String>,
    pub commands: Option<CommandChannel>,
}

impl Published {
    pub fn stopped() -> Self {
        Self {
            state: SupervisorState::Stopped,
            pid: None,
            started_at: None,
            run_id: 0,
            last_exit: None,
            last_error: None,
            commands: None,
        }
    }

    pub fn to_status(&self) -> SupervisorStatus {
        SupervisorStatus {
            state: self.state,
            pid: self.pid,
            uptime: self.started_at.map(|t| t.elapsed()),
            run_id: self.run_id,
            last_exit: self.last_exit,
            last_error: self.last_error.clone(),
        }
    }
}

/// Receives supervisor status changes
pub struct StatusWatch {
    rx: watch::Receiver<Published>,
}

impl StatusWatch {
    pub(crate) fn new(rx: watch::Receiver<Published>) -> Self {
        Self { rx }
    }

    /// Current status without waiting
    pub fn current(&self) -> SupervisorStatus {
        self.rx.borrow().to_status()
    }

    /// Wait for the next change. Returns `None` once the supervisor is gone.
    pub async fn changed(&mut self) -> Option<SupervisorStatus> {
        self.rx.changed().await.ok()?;
        let status = self.rx.borrow_and_update().to_status();
        Some(status)
    }
}
