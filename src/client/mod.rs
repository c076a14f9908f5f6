//! Client - operator side of the daemon socket

mod commands;

pub use commands::{
    format_bytes, format_duration, format_log_entry, format_stats, format_status,
};

use crate::protocol::{
    recv_message, send_message, ClientMessage, LogEntry, ServerMessage, StatsInfo, StatusInfo,
    SupervisorEvent, PROTOCOL_VERSION,
};
use anyhow::{anyhow, bail, Context, Result};
use std::path::Path;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use uuid::Uuid;

/// Connection to a running daemon
pub struct PanelClient {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    gateway_id: Uuid,
}

impl PanelClient {
    /// Connect and complete the handshake
    pub async fn connect(socket_path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(socket_path).await.with_context(|| {
            format!(
                "Failed to connect to {} (is terra-panel-server running?)",
                socket_path.display()
            )
        })?;
        let (mut reader, writer) = stream.into_split();

        let gateway_id = match recv_message::<_, ServerMessage>(&mut reader).await? {
            Some(ServerMessage::Welcome {
                gateway_id,
                protocol_version,
            }) => {
                tracing::debug!(%gateway_id, protocol_version, "Connected to daemon");
                gateway_id
            }
            Some(other) => bail!("Expected Welcome, got {:?}", other),
            None => bail!("Daemon closed the connection during handshake"),
        };

        let mut client = Self {
            reader,
            writer,
            gateway_id,
        };
        client
            .expect_ack(
                ClientMessage::Hello {
                    protocol_version: PROTOCOL_VERSION,
                },
                "Hello",
            )
            .await?;

        Ok(client)
    }

    pub fn gateway_id(&self) -> Uuid {
        self.gateway_id
    }

    pub async fn send(&mut self, msg: &ClientMessage) -> Result<()> {
        send_message(&mut self.writer, msg).await
    }

    /// Next message from the daemon. `None` once it hangs up.
    pub async fn recv(&mut self) -> Result<Option<ServerMessage>> {
        recv_message(&mut self.reader).await
    }

    pub async fn start(&mut self) -> Result<()> {
        self.expect_ack(ClientMessage::Start, "Start").await
    }

    pub async fn stop(&mut self) -> Result<()> {
        self.expect_ack(ClientMessage::Stop, "Stop").await
    }

    pub async fn send_command(&mut self, text: impl Into<String>) -> Result<()> {
        let msg = ClientMessage::SendCommand { text: text.into() };
        self.expect_ack(msg, "SendCommand").await
    }

    pub async fn status(&mut self) -> Result<StatusInfo> {
        match self.request(ClientMessage::GetStatus).await? {
            ServerMessage::Status(status) => Ok(status),
            other => Err(unexpected("Status", &other)),
        }
    }

    pub async fn stats(&mut self) -> Result<StatsInfo> {
        match self.request(ClientMessage::GetSystemStats).await? {
            ServerMessage::Stats(stats) => Ok(stats),
            other => Err(unexpected("Stats", &other)),
        }
    }

    /// Buffered output without subscribing
    pub async fn history(&mut self) -> Result<Vec<LogEntry>> {
        match self.request(ClientMessage::GetHistory).await? {
            ServerMessage::History { lines } => Ok(lines),
            other => Err(unexpected("History", &other)),
        }
    }

    /// Stop the server and the daemon
    pub async fn shutdown(&mut self) -> Result<()> {
        self.expect_ack(ClientMessage::Shutdown, "Shutdown").await
    }

    /// Leave without affecting the daemon
    pub async fn detach(mut self) -> Result<()> {
        self.expect_ack(ClientMessage::Detach, "Detach").await
    }

    /// Subscribe and hand every line to `on_line` until the daemon hangs up.
    ///
    /// Fails if the daemon drops the subscription because this client fell
    /// behind.
    pub async fn follow_logs<F>(&mut self, mut on_line: F) -> Result<()>
    where
        F: FnMut(&LogEntry),
    {
        self.expect_ack(ClientMessage::Subscribe, "Subscribe").await?;

        while let Some(msg) = self.recv().await? {
            match msg {
                ServerMessage::Log(entry) => on_line(&entry),
                ServerMessage::Event(SupervisorEvent::SubscriptionDropped) => {
                    bail!("Log stream dropped: client fell too far behind")
                }
                ServerMessage::Event(event) => tracing::info!("Server event: {:?}", event),
                ServerMessage::Error { code, message } => {
                    tracing::warn!("Daemon error ({}): {}", code, message)
                }
                other => tracing::debug!("Ignoring {:?}", other),
            }
        }

        Ok(())
    }

    /// Send a request and wait for its reply, skipping pushed messages
    async fn request(&mut self, msg: ClientMessage) -> Result<ServerMessage> {
        self.send(&msg).await?;

        loop {
            match self.recv().await? {
                Some(ServerMessage::Event(event)) => {
                    tracing::debug!("Event while waiting for reply: {:?}", event)
                }
                Some(ServerMessage::Log(_)) => {}
                Some(ServerMessage::Error { code, message }) => {
                    return Err(anyhow!("{} ({})", message, code))
                }
                Some(reply) => return Ok(reply),
                None => bail!("Daemon closed the connection"),
            }
        }
    }

    async fn expect_ack(&mut self, msg: ClientMessage, command: &str) -> Result<()> {
        match self.request(msg).await? {
            ServerMessage::Ack { for_command } if for_command == command => Ok(()),
            other => Err(unexpected(&format!("Ack for {}", command), &other)),
        }
    }
}

fn unexpected(expected: &str, got: &ServerMessage) -> anyhow::Error {
    anyhow!("Expected {} from daemon, got {:?}", expected, got)
}
