//! Unix socket gateway and daemon main loop

use super::connection::{
    ack, client_writer_task, create_error_message, create_welcome_message, deliver_logs,
    supervisor_error_message, ClientConnection, CLIENT_QUEUE,
};
use crate::logs::SubscriberId;
use crate::protocol::{
    check_version_compatibility, deserialize, read_frame, ClientMessage, LogEntry, ServerMessage,
    StatsInfo, StatusInfo, SupervisorEvent, PROTOCOL_VERSION,
};
use crate::supervisor::{Supervisor, SupervisorState};
use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// How long queued replies may take to flush after a client leaves
const WRITER_DRAIN: Duration = Duration::from_secs(5);

/// State shared across connections
struct GatewayState {
    gateway_id: Uuid,
    supervisor: Supervisor,
    clients: RwLock<HashMap<Uuid, ClientConnection>>,
    shutdown_tx: mpsc::Sender<()>,
}

/// Log stream of one connection
struct Delivery {
    subscriber: SubscriberId,
    task: JoinHandle<()>,
}

impl Delivery {
    /// Unregister now; aborting the task alone would release it later
    fn cancel(self, supervisor: &Supervisor) {
        supervisor.unsubscribe(self.subscriber);
        self.task.abort();
    }
}

/// Accepts observer and operator connections on a Unix socket
pub struct StreamGateway {
    socket_path: PathBuf,
    supervisor: Supervisor,
}

impl StreamGateway {
    /// Create a new gateway
    pub fn new(supervisor: Supervisor, socket_path: PathBuf) -> Self {
        Self {
            socket_path,
            supervisor,
        }
    }

    /// Check if socket already exists (another daemon running)
    pub fn socket_exists(&self) -> bool {
        self.socket_path.exists()
    }

    /// Get the socket path
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Run the gateway until `shutdown_rx` fires or a client asks to shut down
    pub async fn run(&self, mut shutdown_rx: mpsc::Receiver<()>) -> Result<()> {
        // Ensure parent directory exists
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // Remove stale socket if it exists
        if self.socket_path.exists() {
            match UnixStream::connect(&self.socket_path).await {
                Ok(_) => {
                    return Err(anyhow!(
                        "Daemon already listening on {}",
                        self.socket_path.display()
                    ));
                }
                Err(_) => {
                    tracing::info!("Removing stale socket: {:?}", self.socket_path);
                    std::fs::remove_file(&self.socket_path)?;
                }
            }
        }

        let listener = UnixListener::bind(&self.socket_path)?;
        tracing::info!("Gateway listening on {:?}", self.socket_path);

        let (client_shutdown_tx, mut client_shutdown_rx) = mpsc::channel::<()>(1);
        let state = Arc::new(GatewayState {
            gateway_id: Uuid::new_v4(),
            supervisor: self.supervisor.clone(),
            clients: RwLock::new(HashMap::new()),
            shutdown_tx: client_shutdown_tx,
        });

        let events = tokio::spawn(forward_status_events(Arc::clone(&state)));

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    tracing::info!("Shutdown signal received");
                    break;
                }

                _ = client_shutdown_rx.recv() => {
                    tracing::info!("Shutdown requested by client");
                    break;
                }

                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, _addr)) => {
                            let state = Arc::clone(&state);
                            tokio::spawn(async move {
                                if let Err(e) = handle_client(stream, state).await {
                                    tracing::error!("Client error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Failed to accept connection: {}", e);
                        }
                    }
                }
            }
        }

        events.abort();
        self.cleanup().await;

        Ok(())
    }

    /// Clean up gateway resources
    async fn cleanup(&self) {
        tracing::info!("Cleaning up gateway resources");

        if self.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                tracing::error!("Failed to remove socket file: {}", e);
            }
        }
    }
}

/// Handle a single client connection
async fn handle_client(stream: UnixStream, state: Arc<GatewayState>) -> Result<()> {
    let (mut reader, writer) = stream.into_split();

    let (tx, rx) = mpsc::channel::<ServerMessage>(CLIENT_QUEUE);
    let client = ClientConnection::new(tx);
    let client_id = client.id();
    let outbound = client.sender();

    tracing::info!("Client connected: {}", client_id);
    state.clients.write().await.insert(client_id, client.clone());

    let mut writer_handle = tokio::spawn(client_writer_task(writer, rx));
    let mut delivery: Option<Delivery> = None;
    let mut lagged = false;

    let _ = outbound.send(create_welcome_message(state.gateway_id)).await;

    loop {
        let frame = tokio::select! {
            frame = read_frame(&mut reader) => frame,
            _ = client.lagged() => {
                lagged = true;
                break;
            }
        };

        match frame {
            Ok(Some(bytes)) => match deserialize::<ClientMessage>(&bytes) {
                Ok(ClientMessage::Detach) => {
                    tracing::info!("Client {} detached", client_id);
                    let _ = outbound.send(ack("Detach")).await;
                    break;
                }
                Ok(msg) => {
                    let response = process_message(msg, &state, &outbound, &mut delivery).await;
                    if let Some(response) = response {
                        let sent = tokio::select! {
                            sent = outbound.send(response) => sent.is_ok(),
                            _ = client.lagged() => {
                                lagged = true;
                                false
                            }
                        };
                        if !sent {
                            break;
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!("Failed to parse message from {}: {}", client_id, e);
                    let _ = outbound
                        .send(create_error_message(
                            "invalid_message",
                            format!("Invalid message: {}", e),
                        ))
                        .await;
                }
            },
            Ok(None) => {
                tracing::info!("Client disconnected: {}", client_id);
                break;
            }
            Err(e) => {
                tracing::warn!("Error reading from client {}: {}", client_id, e);
                break;
            }
        }
    }

    if let Some(delivery) = delivery.take() {
        delivery.cancel(&state.supervisor);
    }
    state.clients.write().await.remove(&client_id);

    // Let queued replies (such as the Detach ack) go out before closing,
    // unless the client stopped reading them
    drop(outbound);
    drop(client);
    let drain = if lagged { Duration::ZERO } else { WRITER_DRAIN };
    if tokio::time::timeout(drain, &mut writer_handle)
        .await
        .is_err()
    {
        writer_handle.abort();
    }

    tracing::info!("Client handler finished: {}", client_id);

    Ok(())
}

/// Process a client message and return an optional response
async fn process_message(
    msg: ClientMessage,
    state: &GatewayState,
    outbound: &mpsc::Sender<ServerMessage>,
    delivery: &mut Option<Delivery>,
) -> Option<ServerMessage> {
    let supervisor = &state.supervisor;

    match msg {
        ClientMessage::Hello { protocol_version } => {
            match check_version_compatibility(protocol_version, PROTOCOL_VERSION) {
                Ok(()) => Some(ack("Hello")),
                Err(e) => Some(create_error_message("protocol_version", e.to_string())),
            }
        }

        ClientMessage::Start => match supervisor.start().await {
            Ok(()) => Some(ack("Start")),
            Err(e) => Some(supervisor_error_message(&e)),
        },

        ClientMessage::Stop => match supervisor.stop().await {
            Ok(()) => Some(ack("Stop")),
            Err(e) => Some(supervisor_error_message(&e)),
        },

        ClientMessage::SendCommand { text } => {
            supervisor.send_command(text).await;
            Some(ack("SendCommand"))
        }

        ClientMessage::GetStatus => Some(ServerMessage::Status(StatusInfo::from(
            &supervisor.status(),
        ))),

        ClientMessage::GetSystemStats => {
            let stats = supervisor.system_stats().await;
            Some(ServerMessage::Stats(StatsInfo::from(&stats)))
        }

        ClientMessage::GetHistory => {
            let lines = supervisor
                .broadcaster()
                .history()
                .iter()
                .map(|line| LogEntry::from(line.as_ref()))
                .collect();
            Some(ServerMessage::History { lines })
        }

        ClientMessage::Subscribe => {
            let broadcaster = supervisor.broadcaster();
            if delivery
                .as_ref()
                .is_some_and(|d| broadcaster.is_subscribed(d.subscriber))
            {
                return Some(ack("Subscribe"));
            }
            // A stream the broadcaster dropped is replaced by a fresh one
            if let Some(stale) = delivery.take() {
                stale.cancel(supervisor);
            }
            // Ack before the replay starts flowing
            if outbound.send(ack("Subscribe")).await.is_err() {
                return None;
            }
            let subscription = supervisor.subscribe();
            let subscriber = subscription.id();
            let task = tokio::spawn(deliver_logs(subscription, outbound.clone()));
            *delivery = Some(Delivery { subscriber, task });
            None
        }

        ClientMessage::Unsubscribe => {
            if let Some(delivery) = delivery.take() {
                delivery.cancel(supervisor);
            }
            Some(ack("Unsubscribe"))
        }

        ClientMessage::Shutdown => {
            tracing::info!("Client requested daemon shutdown");
            let _ = state.shutdown_tx.try_send(());
            Some(ack("Shutdown"))
        }

        // Handled by the connection loop
        ClientMessage::Detach => Some(ack("Detach")),
    }
}

/// Broadcasts a server message to all connected clients.
///
/// Never waits on a client: the lock is released before sending and a
/// client with a full queue is disconnected.
async fn broadcast_to_clients(msg: ServerMessage, state: &GatewayState) {
    let clients: Vec<ClientConnection> = state.clients.read().await.values().cloned().collect();
    for client in clients {
        client.push(msg.clone());
    }
}

/// Pushes supervisor state changes to every client
async fn forward_status_events(state: Arc<GatewayState>) {
    let mut watch = state.supervisor.watch_status();
    let mut last_state = watch.current().state;

    while let Some(status) = watch.changed().await {
        if status.state == last_state {
            continue;
        }
        last_state = status.state;

        broadcast_to_clients(
            ServerMessage::Event(SupervisorEvent::StateChanged {
                state: status.state,
                pid: status.pid,
            }),
            &state,
        )
        .await;

        if status.state == SupervisorState::Stopped && status.last_error.is_some() {
            if let Some(exit) = status.last_exit {
                broadcast_to_clients(
                    ServerMessage::Event(SupervisorEvent::Crashed { exit }),
                    &state,
                )
                .await;
            }
        }
    }
}
