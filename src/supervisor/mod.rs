//! Supervisor - owns the server process and its lifecycle.
//!
//! State machine:
//!
//! ```text
//! Stopped -> Starting -> Running -> Stopping -> Stopped
//!               \___________\_____ crash ______/
//! ```
//!
//! Start, Stop and crash handling all run under one async mutex, held for
//! the whole transition. The resulting state is published through a watch
//! channel, so `status()` and `send_command()` never wait on a transition.

mod command;
mod state;

pub use command::CommandChannel;
pub use state::{StatusWatch, SupervisorOptions, SupervisorState, SupervisorStatus};

use crate::error::{Result, SupervisorError};
use crate::logs::{LogStream, OutputBroadcaster, SubscriberId, Subscription};
use crate::process::{ExitState, LaunchConfig, ProcessHandle};
use crate::stats::{StatsProbe, StatsSnapshot};
use state::Published;
use std::io;
use std::sync::{Arc, Weak};
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// One spawned process and the tasks bound to it
struct ActiveRun {
    run_id: u64,
    handle: ProcessHandle,
    commands: CommandChannel,
    writer: JoinHandle<()>,
}

#[derive(Default)]
struct Slot {
    next_run: u64,
    active: Option<ActiveRun>,
}

struct Shared {
    launch: LaunchConfig,
    options: SupervisorOptions,
    broadcaster: OutputBroadcaster,
    stats: StatsProbe,
    slot: Mutex<Slot>,
    status: watch::Sender<Published>,
}

impl Shared {
    fn publish(&self, update: impl FnOnce(&mut Published)) {
        self.status.send_modify(update);
        let published = self.status.borrow();
        tracing::debug!(state = %published.state, run_id = published.run_id, "Supervisor state published");
    }

    /// Force-kill the given run if it is still the active one
    async fn kill_run(&self, run_id: u64) {
        let slot = self.slot.lock().await;
        if let Some(run) = slot.active.as_ref().filter(|r| r.run_id == run_id) {
            run.handle.kill();
        }
    }

    /// Exit observed by the watcher. Ignored when Stop already handled it.
    async fn on_exit(&self, run_id: u64, exit: ExitState) {
        let mut slot = self.slot.lock().await;
        if slot.active.as_ref().map(|r| r.run_id) != Some(run_id) {
            return;
        }
        let Some(run) = slot.active.take() else {
            return;
        };
        run.writer.abort();

        let pid = run.handle.pid();
        let last_error = if exit == ExitState::Exited(0) {
            tracing::info!(pid, run_id, "Server exited on its own");
            None
        } else {
            let error = SupervisorError::CrashDetected { exit };
            tracing::error!(pid, run_id, label = error.as_label(), "{}", error);
            Some(error.to_string())
        };

        self.publish(|p| {
            p.state = SupervisorState::Stopped;
            p.pid = None;
            p.started_at = None;
            p.last_exit = Some(exit);
            p.last_error = last_error;
            p.commands = None;
        });
    }
}

/// Supervises a single server process.
///
/// Cheap to clone; all clones drive the same process.
#[derive(Clone)]
pub struct Supervisor {
    shared: Arc<Shared>,
}

impl Supervisor {
    /// Create a supervisor for the given launch configuration
    pub fn new(launch: LaunchConfig, options: SupervisorOptions) -> Self {
        let broadcaster = OutputBroadcaster::new(options.broadcaster.clone());
        let (status, _) = watch::channel(Published::stopped());

        Self {
            shared: Arc::new(Shared {
                launch,
                options,
                broadcaster,
                stats: StatsProbe::new(),
                slot: Mutex::new(Slot::default()),
                status,
            }),
        }
    }

    pub fn launch_config(&self) -> &LaunchConfig {
        &self.shared.launch
    }

    pub fn options(&self) -> &SupervisorOptions {
        &self.shared.options
    }

    /// Start the server.
    ///
    /// Fails with `AlreadyRunning` unless stopped, and with `SpawnError` if
    /// the process cannot be spawned (the state reverts to Stopped).
    ///
    /// A Start issued during another transition is rejected right away
    /// instead of waiting for the lock.
    pub async fn start(&self) -> Result<()> {
        if self.shared.status.borrow().state != SupervisorState::Stopped {
            return Err(SupervisorError::AlreadyRunning);
        }

        let mut slot = self.shared.slot.lock().await;
        if slot.active.is_some() || self.shared.status.borrow().state != SupervisorState::Stopped {
            return Err(SupervisorError::AlreadyRunning);
        }

        slot.next_run += 1;
        let run_id = slot.next_run;
        self.shared.publish(|p| {
            p.state = SupervisorState::Starting;
            p.run_id = run_id;
            p.last_exit = None;
            p.last_error = None;
        });
        tracing::info!(run_id, "Starting server '{}'", self.shared.launch.program());

        let mut handle = match ProcessHandle::spawn(&self.shared.launch) {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!(run_id, "{}", e);
                self.revert_to_stopped(&e);
                return Err(e);
            }
        };

        let Some(input) = handle.take_input() else {
            handle.kill();
            let e = SupervisorError::spawn(
                self.shared.launch.program(),
                io::Error::other("stdin was not captured"),
            );
            self.revert_to_stopped(&e);
            return Err(e);
        };

        if let Some(stdout) = handle.take_stdout() {
            let broadcaster = self.shared.broadcaster.clone();
            tokio::spawn(async move { broadcaster.drain(LogStream::Stdout, stdout).await });
        }
        if let Some(stderr) = handle.take_stderr() {
            let broadcaster = self.shared.broadcaster.clone();
            tokio::spawn(async move { broadcaster.drain(LogStream::Stderr, stderr).await });
        }

        let (failure_tx, failure_rx) = oneshot::channel();
        let (commands, writer) =
            CommandChannel::spawn(input, self.shared.options.command_queue, failure_tx);

        tokio::spawn(watch_run(
            Arc::downgrade(&self.shared),
            run_id,
            handle.exit_watch(),
            failure_rx,
        ));

        let pid = handle.pid();
        let started_at = handle.started_at();
        slot.active = Some(ActiveRun {
            run_id,
            handle,
            commands: commands.clone(),
            writer,
        });

        self.shared.publish(|p| {
            p.state = SupervisorState::Running;
            p.pid = Some(pid);
            p.started_at = Some(started_at);
            p.commands = Some(commands);
        });
        tracing::info!(pid, run_id, "Server running");

        Ok(())
    }

    /// Stop the server.
    ///
    /// Sends the configured stop command (or SIGTERM), waits up to
    /// `stop_timeout`, then kills. A Stop racing another Stop of the same run
    /// returns `Ok` without signalling the process again.
    pub async fn stop(&self) -> Result<()> {
        let (observed_state, observed_run) = {
            let published = self.shared.status.borrow();
            (published.state, published.run_id)
        };

        match observed_state {
            SupervisorState::Stopped => return Err(SupervisorError::NotRunning),
            SupervisorState::Stopping => {
                self.wait_run_finished(observed_run).await;
                return Ok(());
            }
            SupervisorState::Starting | SupervisorState::Running => {}
        }

        let mut slot = self.shared.slot.lock().await;
        let exit = match slot.active.as_ref() {
            Some(run) if run.run_id == observed_run => self.shutdown_run(run).await,
            // The run we meant to stop is gone already
            _ => return Ok(()),
        };

        if let Some(run) = slot.active.take() {
            run.writer.abort();
        }

        self.shared.publish(|p| {
            p.state = SupervisorState::Stopped;
            p.pid = None;
            p.started_at = None;
            p.last_exit = Some(exit);
            p.last_error = None;
            p.commands = None;
        });
        tracing::info!(run_id = observed_run, "Server stopped ({})", exit);

        Ok(())
    }

    /// Queue a console command. Ignored unless the server is running.
    pub async fn send_command(&self, text: impl Into<String>) {
        let text = text.into();
        let commands = {
            let published = self.shared.status.borrow();
            if published.state != SupervisorState::Running {
                tracing::debug!(state = %published.state, "Ignoring command while not running");
                return;
            }
            published.commands.clone()
        };

        if let Some(commands) = commands {
            if let Err(e) = commands.send(text).await {
                tracing::debug!("Command dropped: {}", e);
            }
        }
    }

    /// Current status. Never waits.
    pub fn status(&self) -> SupervisorStatus {
        self.shared.status.borrow().to_status()
    }

    /// Follow status changes
    pub fn watch_status(&self) -> StatusWatch {
        StatusWatch::new(self.shared.status.subscribe())
    }

    /// Sample resource usage; process fields are zeroed when not running
    pub async fn system_stats(&self) -> StatsSnapshot {
        let status = self.status();
        let (pid, uptime) = match status.state {
            SupervisorState::Running | SupervisorState::Stopping => (status.pid, status.uptime),
            _ => (None, None),
        };
        self.shared.stats.sample(pid, uptime).await
    }

    /// Subscribe to server output: buffered history first, then live lines
    pub fn subscribe(&self) -> Subscription {
        self.shared.broadcaster.subscribe()
    }

    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.shared.broadcaster.unsubscribe(id)
    }

    pub fn broadcaster(&self) -> &OutputBroadcaster {
        &self.shared.broadcaster
    }

    /// Stop the server if it is running
    pub async fn shutdown(&self) {
        match self.stop().await {
            Ok(()) | Err(SupervisorError::NotRunning) => {}
            Err(e) => tracing::warn!("Failed to stop server during shutdown: {}", e),
        }
    }

    fn revert_to_stopped(&self, error: &SupervisorError) {
        let message = error.to_string();
        self.shared.publish(|p| {
            p.state = SupervisorState::Stopped;
            p.pid = None;
            p.started_at = None;
            p.last_error = Some(message);
            p.commands = None;
        });
    }

    /// Graceful stop, escalating to a kill. Always returns within
    /// `stop_timeout + kill_timeout`.
    async fn shutdown_run(&self, run: &ActiveRun) -> ExitState {
        let options = &self.shared.options;
        let pid = run.handle.pid();

        self.shared.publish(|p| p.state = SupervisorState::Stopping);

        let sent_command = match options.stop_command.as_deref().map(str::trim) {
            Some(command) if !command.is_empty() => match run.commands.try_send(command) {
                Ok(()) => {
                    tracing::info!(pid, "Sent stop command '{}'", command);
                    true
                }
                Err(e) => {
                    tracing::warn!(pid, "Could not queue stop command: {}", e);
                    false
                }
            },
            _ => false,
        };

        if !sent_command {
            if let Err(e) = run.handle.terminate() {
                tracing::debug!(pid, "Terminate skipped: {}", e);
            }
        }

        if let Ok(exit) = timeout(options.stop_timeout, run.handle.wait_exit()).await {
            return exit;
        }

        tracing::warn!(
            pid,
            "Server did not exit within {:?}, killing it",
            options.stop_timeout
        );
        run.handle.kill();

        match timeout(options.kill_timeout, run.handle.wait_exit()).await {
            Ok(exit) => exit,
            Err(_) => {
                tracing::error!(pid, "Server still alive {:?} after kill", options.kill_timeout);
                ExitState::Crashed { signal: None }
            }
        }
    }

    /// Wait until `run_id` is no longer the active run
    async fn wait_run_finished(&self, run_id: u64) {
        let mut rx = self.shared.status.subscribe();
        let _ = rx
            .wait_for(|p| p.run_id != run_id || p.state == SupervisorState::Stopped)
            .await;
    }
}

/// Watches one run for exit or a broken console, independent of Stop
async fn watch_run(
    shared: Weak<Shared>,
    run_id: u64,
    exit_rx: watch::Receiver<ExitState>,
    failure_rx: oneshot::Receiver<SupervisorError>,
) {
    let exit = tokio::select! {
        exit = crate::process::wait_for_exit(exit_rx.clone()) => exit,
        Ok(error) = failure_rx => {
            tracing::warn!(run_id, "Console input failed ({}), killing server", error);
            if let Some(shared) = shared.upgrade() {
                shared.kill_run(run_id).await;
            }
            crate::process::wait_for_exit(exit_rx).await
        }
    };

    if let Some(shared) = shared.upgrade() {
        shared.on_exit(run_id, exit).await;
    }
}
