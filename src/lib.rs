//! terra-panel - Game server supervisor with a live log and command channel
//!
//! This crate provides the core functionality for terra-panel, including:
//! - Process supervision (start, stop, crash detection)
//! - Output capture with replay for late viewers
//! - Client-daemon protocol
//!
//! # Architecture
//!
//! terra-panel uses a client-daemon model where:
//! - The daemon (`terra-panel-server`) owns the game server process
//! - The client (`terra-panel`) sends control requests and follows output
//! - Communication happens over Unix domain sockets

pub mod client;
pub mod config;
pub mod error;
pub mod logs;
pub mod process;
pub mod protocol;
pub mod server;
pub mod stats;
pub mod supervisor;

pub use error::SupervisorError;
pub use logs::{LogLine, LogStream, OutputBroadcaster, Subscription};
pub use process::{ExitState, LaunchConfig, ProcessHandle};
pub use stats::{StatsProbe, StatsSnapshot};
pub use supervisor::{Supervisor, SupervisorOptions, SupervisorState, SupervisorStatus};
