//! Log streaming - line splitting, history buffer and subscriber fan-out

mod broadcaster;
mod buffer;
mod lines;

pub use broadcaster::{BroadcasterOptions, OutputBroadcaster, SubscriberId, Subscription};
pub use buffer::LogBuffer;
pub use lines::LineSplitter;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which output pipe a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl fmt::Display for LogStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogStream::Stdout => write!(f, "stdout"),
            LogStream::Stderr => write!(f, "stderr"),
        }
    }
}

/// A single line of server output. Immutable once published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    /// Sequence number, strictly increasing for the broadcaster's lifetime
    pub seq: u64,

    /// When the line was published
    pub timestamp: DateTime<Utc>,

    /// Pipe the line was read from
    pub stream: LogStream,

    /// Line content without its terminator
    pub text: String,
}
