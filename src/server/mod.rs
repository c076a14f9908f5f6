//! Server module - Unix socket gateway and client connection handling

mod connection;
mod listener;

pub use connection::{deliver_logs, ClientConnection};
pub use listener::StreamGateway;
