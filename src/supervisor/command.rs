//! Console command channel - single writer for the server's stdin

use crate::error::{Result, SupervisorError};
use crate::process::ProcessInput;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Ordered queue of console commands for one run of the server.
///
/// Commands reach the server in enqueue order; each is written and flushed
/// with its line terminator before the next one starts. Cloning shares the
/// same queue.
#[derive(Clone)]
pub struct CommandChannel {
    tx: mpsc::Sender<String>,
}

impl CommandChannel {
    /// Spawn the writer task that owns `input`.
    ///
    /// The first write failure is reported through `failures` and ends the
    /// writer; later sends fail with `ProcessNotRunning`.
    pub fn spawn(
        input: ProcessInput,
        capacity: usize,
        failures: oneshot::Sender<SupervisorError>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let writer = tokio::spawn(writer_task(input, rx, failures));
        (Self { tx }, writer)
    }

    /// Queue a command, waiting only for queue space
    pub async fn send(&self, command: impl Into<String>) -> Result<()> {
        self.tx
            .send(command.into())
            .await
            .map_err(|_| SupervisorError::ProcessNotRunning)
    }

    /// Queue a command without waiting. Fails if the queue is full or closed.
    pub fn try_send(&self, command: impl Into<String>) -> Result<()> {
        self.tx
            .try_send(command.into())
            .map_err(|_| SupervisorError::ProcessNotRunning)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

async fn writer_task(
    mut input: ProcessInput,
    mut rx: mpsc::Receiver<String>,
    failures: oneshot::Sender<SupervisorError>,
) {
    while let Some(command) = rx.recv().await {
        tracing::debug!(command = %command, "Writing console command");
        if let Err(e) = input.write_line(&command).await {
            tracing::warn!("Failed to write console command '{}': {}", command, e);
            let _ = failures.send(e);
            return;
        }
    }

    tracing::debug!("Command writer finished");
}
