//! Child process handle

use super::{ExitState, LaunchConfig};
use crate::error::{Result, SupervisorError};
use std::io;
use std::process::Stdio;
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, watch};

/// Owns a spawned server process.
///
/// The OS child itself lives in a reaper task, which is the only caller of
/// `wait()`. The exit state is published once through a watch channel, so
/// any number of observers can wait for it without racing each other.
pub struct ProcessHandle {
    pid: u32,
    program: String,
    started_at: Instant,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    exit: watch::Receiver<ExitState>,
    kill: KillSwitch,
}

impl ProcessHandle {
    /// Spawn the configured executable with piped stdio.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(config: &LaunchConfig) -> Result<Self> {
        let program = config.program();

        if let Some(dir) = &config.working_dir {
            if !dir.is_dir() {
                return Err(SupervisorError::spawn(
                    program,
                    io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("working directory '{}' does not exist", dir.display()),
                    ),
                ));
            }
        }

        let mut cmd = Command::new(&config.executable);
        cmd.args(&config.args)
            .envs(config.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &config.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| SupervisorError::spawn(program.clone(), e))?;

        let pid = child.id().ok_or_else(|| {
            SupervisorError::spawn(
                program.clone(),
                io::Error::other("process exited before its pid was read"),
            )
        })?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (exit_tx, exit_rx) = watch::channel(ExitState::Running);
        let (kill_tx, kill_rx) = mpsc::channel(1);
        tokio::spawn(reap(child, pid, kill_rx, exit_tx));

        tracing::info!(pid, "Spawned '{}' with args {:?}", program, config.args);

        Ok(Self {
            pid,
            program,
            started_at: Instant::now(),
            stdin,
            stdout,
            stderr,
            exit: exit_rx,
            kill: KillSwitch { tx: kill_tx },
        })
    }

    /// Get process ID
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Get the program this handle was spawned from
    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Exit state if the process has exited, without waiting
    pub fn try_exit(&self) -> Option<ExitState> {
        let state = *self.exit.borrow();
        state.is_exited().then_some(state)
    }

    /// Wait until the process has exited
    pub async fn wait_exit(&self) -> ExitState {
        wait_for_exit(self.exit.clone()).await
    }

    /// A receiver that observes the exit state
    pub fn exit_watch(&self) -> watch::Receiver<ExitState> {
        self.exit.clone()
    }

    /// Take the input side of the process. Returns `None` once taken.
    pub fn take_input(&mut self) -> Option<ProcessInput> {
        self.stdin.take().map(|stdin| ProcessInput {
            pid: self.pid,
            stdin,
            exit: self.exit.clone(),
        })
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.stderr.take()
    }

    /// Ask the process to exit (SIGTERM on Unix)
    #[cfg(unix)]
    pub fn terminate(&self) -> Result<()> {
        use nix::errno::Errno;
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        if self.try_exit().is_some() {
            return Err(SupervisorError::ProcessNotRunning);
        }

        match signal::kill(Pid::from_raw(self.pid as i32), Signal::SIGTERM) {
            Ok(()) => {
                tracing::debug!(pid = self.pid, "Sent SIGTERM");
                Ok(())
            }
            Err(Errno::ESRCH) => Err(SupervisorError::ProcessNotRunning),
            Err(e) => {
                tracing::warn!(pid = self.pid, "SIGTERM failed ({}), killing instead", e);
                self.kill();
                Ok(())
            }
        }
    }

    /// Ask the process to exit. No graceful signal exists here, so this kills.
    #[cfg(not(unix))]
    pub fn terminate(&self) -> Result<()> {
        if self.try_exit().is_some() {
            return Err(SupervisorError::ProcessNotRunning);
        }
        self.kill();
        Ok(())
    }

    /// Force-kill the process
    pub fn kill(&self) {
        self.kill.trigger();
    }
}

/// Requests a forced kill from the reaper task.
///
/// Dropping the switch (with its handle) makes the reaper kill the process
/// too, so a lost handle never leaves an orphan behind.
struct KillSwitch {
    tx: mpsc::Sender<()>,
}

impl KillSwitch {
    fn trigger(&self) {
        let _ = self.tx.try_send(());
    }
}

/// Write side of the process's stdin
pub struct ProcessInput {
    pid: u32,
    stdin: ChildStdin,
    exit: watch::Receiver<ExitState>,
}

impl ProcessInput {
    /// Write one line, terminated by `\n`, and flush it.
    pub async fn write_line(&mut self, line: &str) -> Result<()> {
        if self.exit.borrow().is_exited() {
            return Err(SupervisorError::ProcessNotRunning);
        }

        let line = line.trim_end_matches(['\r', '\n']);
        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');

        self.stdin
            .write_all(&buf)
            .await
            .map_err(|e| self.broken(e))?;
        self.stdin.flush().await.map_err(|e| self.broken(e))?;

        Ok(())
    }

    fn broken(&self, error: io::Error) -> SupervisorError {
        tracing::debug!(pid = self.pid, "Write to stdin failed: {}", error);
        SupervisorError::ProcessNotRunning
    }
}

pub(crate) async fn wait_for_exit(mut exit: watch::Receiver<ExitState>) -> ExitState {
    let waited = exit.wait_for(|state| state.is_exited()).await.map(|state| *state);
    match waited {
        Ok(state) => state,
        // The reaper always publishes before it goes away
        Err(_) => {
            let state = *exit.borrow();
            if state.is_exited() {
                state
            } else {
                ExitState::Crashed { signal: None }
            }
        }
    }
}

async fn reap(
    mut child: Child,
    pid: u32,
    mut kill_rx: mpsc::Receiver<()>,
    exit_tx: watch::Sender<ExitState>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill_rx.recv() => {
            tracing::debug!(pid, "Force-killing process");
            if let Err(e) = child.start_kill() {
                tracing::warn!(pid, "Failed to kill process: {}", e);
            }
            child.wait().await
        }
    };

    let exit = match status {
        Ok(status) => ExitState::from_status(status),
        Err(e) => {
            tracing::error!(pid, "Failed to wait for process: {}", e);
            ExitState::Crashed { signal: None }
        }
    };

    tracing::debug!(pid, "Process reaped: {}", exit);
    exit_tx.send_replace(exit);
}
