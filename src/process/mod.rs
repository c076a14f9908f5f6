//! Process handling - spawning, piping and reaping the supervised server

mod handle;

pub use handle::{ProcessHandle, ProcessInput};

pub(crate) use handle::wait_for_exit;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::process::ExitStatus;

/// Launch configuration for the supervised process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchConfig {
    /// Executable to run
    pub executable: PathBuf,

    /// Command line arguments
    pub args: Vec<String>,

    /// Working directory (defaults to the daemon's current dir)
    pub working_dir: Option<PathBuf>,

    /// Extra environment variables
    pub env: Vec<(String, String)>,
}

impl LaunchConfig {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
        }
    }

    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Executable as a display string, for logs and errors
    pub fn program(&self) -> String {
        self.executable.display().to_string()
    }
}

/// Exit state of a child process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitState {
    /// Process is still alive
    Running,
    /// Process exited with a status code
    Exited(i32),
    /// Process was terminated without an exit code (signal on Unix)
    Crashed { signal: Option<i32> },
}

impl ExitState {
    pub fn is_exited(&self) -> bool {
        !matches!(self, ExitState::Running)
    }

    pub(crate) fn from_status(status: ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return ExitState::Exited(code);
        }

        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            ExitState::Crashed {
                signal: status.signal(),
            }
        }

        #[cfg(not(unix))]
        {
            ExitState::Crashed { signal: None }
        }
    }
}

impl fmt::Display for ExitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitState::Running => write!(f, "running"),
            ExitState::Exited(code) => write!(f, "exit code {}", code),
            ExitState::Crashed { signal: Some(sig) } => write!(f, "killed by signal {}", sig),
            ExitState::Crashed { signal: None } => write!(f, "terminated abnormally"),
        }
    }
}
