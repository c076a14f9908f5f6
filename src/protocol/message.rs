//! Message types for the terra-panel protocol

use crate::logs::{LogLine, LogStream};
use crate::process::ExitState;
use crate::stats::StatsSnapshot;
use crate::supervisor::{SupervisorState, SupervisorStatus};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Messages sent from client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Handshake with protocol version
    Hello { protocol_version: u32 },

    /// Start the game server
    Start,

    /// Stop the game server
    Stop,

    /// Send a console command to the game server
    SendCommand { text: String },

    /// Request supervisor status
    GetStatus,

    /// Request resource usage
    GetSystemStats,

    /// Request the buffered log history
    GetHistory,

    /// Stream log output (history first, then live)
    Subscribe,

    /// Stop streaming log output
    Unsubscribe,

    /// Detach from the gateway (daemon keeps running)
    Detach,

    /// Stop the game server and shut the daemon down
    Shutdown,
}

/// Messages sent from server to client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Handshake response
    Welcome {
        gateway_id: Uuid,
        protocol_version: u32,
    },

    /// One line of server output
    Log(LogEntry),

    /// Log history response
    History { lines: Vec<LogEntry> },

    /// Status response
    Status(StatusInfo),

    /// Resource usage response
    Stats(StatsInfo),

    /// Supervisor event notification
    Event(SupervisorEvent),

    /// Error response
    Error { code: String, message: String },

    /// Acknowledgment (for commands that need confirmation)
    Ack { for_command: String },
}

/// Events pushed to every connected client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SupervisorEvent {
    /// Supervisor changed state
    StateChanged {
        state: SupervisorState,
        pid: Option<u32>,
    },

    /// Server died without being asked to
    Crashed { exit: ExitState },

    /// This connection fell too far behind and its log stream was cut
    SubscriptionDropped,
}

/// Log line as sent over the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub seq: u64,
    /// Unix timestamp in milliseconds
    pub timestamp: i64,
    pub stream: LogStream,
    pub text: String,
}

impl From<&LogLine> for LogEntry {
    fn from(line: &LogLine) -> Self {
        Self {
            seq: line.seq,
            timestamp: line.timestamp.timestamp_millis(),
            stream: line.stream,
            text: line.text.clone(),
        }
    }
}

/// Supervisor status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusInfo {
    pub state: SupervisorState,
    pub pid: Option<u32>,
    pub uptime_secs: Option<u64>,
    pub run_id: u64,
    pub last_exit: Option<ExitState>,
    pub last_error: Option<String>,
}

impl From<&SupervisorStatus> for StatusInfo {
    fn from(status: &SupervisorStatus) -> Self {
        Self {
            state: status.state,
            pid: status.pid,
            uptime_secs: status.uptime.map(|u| u.as_secs()),
            run_id: status.run_id,
            last_exit: status.last_exit,
            last_error: status.last_error.clone(),
        }
    }
}

/// Resource usage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsInfo {
    pub running: bool,
    pub pid: Option<u32>,
    pub cpu_percent: f32,
    pub memory_bytes: u64,
    pub uptime_secs: u64,
    pub host_cpu_percent: f32,
    pub host_memory_used: u64,
    pub host_memory_total: u64,
    /// Unix timestamp in milliseconds
    pub timestamp: i64,
}

impl From<&StatsSnapshot> for StatsInfo {
    fn from(stats: &StatsSnapshot) -> Self {
        Self {
            running: stats.running,
            pid: stats.pid,
            cpu_percent: stats.cpu_percent,
            memory_bytes: stats.memory_bytes,
            uptime_secs: stats.uptime.as_secs(),
            host_cpu_percent: stats.host_cpu_percent,
            host_memory_used: stats.host_memory_used,
            host_memory_total: stats.host_memory_total,
            timestamp: stats.timestamp.timestamp_millis(),
        }
    }
}
