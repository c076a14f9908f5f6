//! Client connection handling

use crate::error::SupervisorError;
use crate::logs::Subscription;
use crate::protocol::{
    send_message, LogEntry, ServerMessage, SupervisorEvent, PROTOCOL_VERSION,
};
use std::sync::Arc;
use tokio::net::unix::OwnedWriteHalf;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

/// Outbound queue size per client
pub const CLIENT_QUEUE: usize = 256;

/// Represents a connected client
#[derive(Clone)]
pub struct ClientConnection {
    /// Unique client identifier
    id: Uuid,

    /// Channel to send messages to this client
    sender: mpsc::Sender<ServerMessage>,

    /// Fired when the client stops reading and must be disconnected
    lagging: Arc<Notify>,
}

impl ClientConnection {
    /// Create a new client connection
    pub fn new(sender: mpsc::Sender<ServerMessage>) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender,
            lagging: Arc::new(Notify::new()),
        }
    }

    /// Get client ID
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn sender(&self) -> mpsc::Sender<ServerMessage> {
        self.sender.clone()
    }

    /// Resolves once the client has been marked as lagging
    pub async fn lagged(&self) {
        self.lagging.notified().await
    }

    /// Push a message without waiting. A client whose queue is full is not
    /// reading; it is marked as lagging so its connection gets closed.
    pub fn push(&self, msg: ServerMessage) {
        match self.sender.try_send(msg) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                tracing::warn!("Client {} is not reading, disconnecting it", self.id);
                self.lagging.notify_one();
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!("Client {} already gone", self.id);
            }
        }
    }
}

/// Task to write outgoing messages to the client
pub async fn client_writer_task(
    mut writer: OwnedWriteHalf,
    mut receiver: mpsc::Receiver<ServerMessage>,
) {
    while let Some(msg) = receiver.recv().await {
        if let Err(e) = send_message(&mut writer, &msg).await {
            tracing::debug!("Failed to write message to client: {}", e);
            break;
        }
    }

    tracing::debug!("Client writer task finished");
}

/// Forward a log subscription to one client.
///
/// Waiting on the client's queue only ever stalls this task. If the client
/// cannot keep up, the broadcaster drops the subscription and the client is
/// told so.
pub async fn deliver_logs(mut subscription: Subscription, outbound: mpsc::Sender<ServerMessage>) {
    let id = subscription.id();

    while let Some(line) = subscription.recv().await {
        let msg = ServerMessage::Log(LogEntry::from(line.as_ref()));
        if outbound.send(msg).await.is_err() {
            tracing::debug!(subscriber = id, "Client gone, ending log delivery");
            return;
        }
    }

    tracing::warn!(subscriber = id, "Log subscription dropped by broadcaster");
    let _ = outbound
        .send(ServerMessage::Event(SupervisorEvent::SubscriptionDropped))
        .await;
}

/// Create a welcome message for a new client
pub fn create_welcome_message(gateway_id: Uuid) -> ServerMessage {
    ServerMessage::Welcome {
        gateway_id,
        protocol_version: PROTOCOL_VERSION,
    }
}

/// Create an error message
pub fn create_error_message(code: &str, message: String) -> ServerMessage {
    ServerMessage::Error {
        code: code.to_string(),
        message,
    }
}

/// Error message for a rejected supervisor operation
pub fn supervisor_error_message(error: &SupervisorError) -> ServerMessage {
    create_error_message(error.as_label(), error.to_string())
}

pub fn ack(for_command: &str) -> ServerMessage {
    ServerMessage::Ack {
        for_command: for_command.to_string(),
    }
}
