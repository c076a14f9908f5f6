//! Configuration management
//!
//! Only the daemon reads this file. The supervisor receives plain values
//! built from it (`launch_config`, `supervisor_options`).

use crate::logs::BroadcasterOptions;
use crate::process::LaunchConfig;
use crate::supervisor::SupervisorOptions;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub supervisor: SupervisorConfig,
    pub logs: LogsConfig,
    pub general: GeneralConfig,
}

/// How to launch the game server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server executable
    pub executable: Option<PathBuf>,

    /// Arguments passed to the executable
    pub args: Vec<String>,

    /// Working directory for the server
    pub working_dir: Option<PathBuf>,

    /// Extra environment variables
    pub env: BTreeMap<String, String>,

    /// Console command used for a graceful stop (empty sends SIGTERM)
    pub stop_command: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            executable: None,
            args: Vec::new(),
            working_dir: None,
            env: BTreeMap::new(),
            stop_command: "exit".to_string(),
        }
    }
}

/// Supervisor timing and queue sizes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Seconds to wait for a graceful stop before killing
    pub stop_timeout_secs: u64,

    /// Seconds to wait for the process to die after a kill
    pub kill_timeout_secs: u64,

    /// Queued console commands before senders wait
    pub command_queue: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            stop_timeout_secs: 15,
            kill_timeout_secs: 5,
            command_queue: 64,
        }
    }
}

/// Log history and streaming
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogsConfig {
    /// Lines kept for replay to new viewers
    pub history_limit: usize,

    /// Lines a viewer may lag behind before it is disconnected
    pub subscriber_queue: usize,

    /// Longest line before it is cut
    pub max_line_bytes: usize,

    /// Milliseconds before an unterminated line is published anyway
    pub partial_flush_ms: u64,
}

impl Default for LogsConfig {
    fn default() -> Self {
        Self {
            history_limit: 1000,
            subscriber_queue: 256,
            max_line_bytes: 8192,
            partial_flush_ms: 250,
        }
    }
}

/// General settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Socket directory
    pub runtime_dir: Option<PathBuf>,
}

impl Config {
    /// Load config from the default path, or return defaults if not found
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            Ok(Config::default())
        }
    }

    /// Load config from an explicit path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Get the config file path
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("terra-panel")
            .join("config.toml")
    }

    /// Get the runtime directory for sockets
    pub fn runtime_dir(&self) -> PathBuf {
        self.general
            .runtime_dir
            .clone()
            .or_else(dirs::runtime_dir)
            .unwrap_or_else(std::env::temp_dir)
            .join("terra-panel")
    }

    /// Get socket path for a daemon instance
    pub fn socket_path(&self, instance: &str) -> PathBuf {
        self.runtime_dir().join(format!("{}.sock", instance))
    }

    /// Launch configuration for the supervisor
    pub fn launch_config(&self) -> Result<LaunchConfig> {
        let Some(executable) = self.server.executable.clone() else {
            bail!("No server executable configured ([server].executable)");
        };

        let mut launch = LaunchConfig::new(executable).with_args(self.server.args.clone());
        if let Some(dir) = &self.server.working_dir {
            launch = launch.with_working_dir(dir);
        }
        for (key, value) in &self.server.env {
            launch = launch.with_env(key, value);
        }

        Ok(launch)
    }

    /// Supervisor options built from the file
    pub fn supervisor_options(&self) -> SupervisorOptions {
        let stop_command = self.server.stop_command.trim();

        SupervisorOptions {
            stop_command: (!stop_command.is_empty()).then(|| stop_command.to_string()),
            stop_timeout: Duration::from_secs(self.supervisor.stop_timeout_secs),
            kill_timeout: Duration::from_secs(self.supervisor.kill_timeout_secs),
            command_queue: self.supervisor.command_queue,
            broadcaster: BroadcasterOptions {
                history_limit: self.logs.history_limit,
                subscriber_queue: self.logs.subscriber_queue,
                max_line_bytes: self.logs.max_line_bytes,
                partial_flush: Duration::from_millis(self.logs.partial_flush_ms),
            },
        }
    }
}
