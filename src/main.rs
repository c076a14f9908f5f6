//! terra-panel - Control a running terra-panel-server daemon

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use terra_panel::client::{format_log_entry, format_stats, format_status, PanelClient};
use terra_panel::config::Config;

#[derive(Parser)]
#[command(name = "terra-panel")]
#[command(about = "Control a supervised game server")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Daemon instance to talk to
    #[arg(short, long, global = true, default_value = "default")]
    instance: String,

    /// Socket path override
    #[arg(long, global = true)]
    socket: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the game server
    Start,
    /// Stop the game server
    Stop,
    /// Send a console command to the game server
    Cmd {
        /// Command text
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        text: Vec<String>,
    },
    /// Show supervisor status
    Status {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show resource usage
    Stats {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print buffered server output
    Logs {
        /// Keep streaming new lines
        #[arg(short, long)]
        follow: bool,
    },
    /// Stop the game server and the daemon
    Shutdown,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging; stdout is reserved for command output
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let socket_path = match cli.socket {
        Some(path) => path,
        None => {
            let config = match &cli.config {
                Some(path) => Config::load_from(path)?,
                None => Config::load()?,
            };
            config.socket_path(&cli.instance)
        }
    };

    let mut client = PanelClient::connect(&socket_path).await?;

    match cli.command {
        Commands::Start => {
            client.start().await?;
            println!("Server started.");
        }
        Commands::Stop => {
            client.stop().await?;
            println!("Server stopped.");
        }
        Commands::Cmd { text } => {
            let text = text.join(" ");
            tracing::debug!("Sending command: {}", text);
            client.send_command(text).await?;
        }
        Commands::Status { json } => {
            let status = client.status().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                println!("{}", format_status(&status));
            }
        }
        Commands::Stats { json } => {
            let stats = client.stats().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("{}", format_stats(&stats));
            }
        }
        Commands::Logs { follow: false } => {
            for entry in client.history().await? {
                println!("{}", format_log_entry(&entry));
            }
        }
        Commands::Logs { follow: true } => {
            tokio::select! {
                result = client.follow_logs(|entry| println!("{}", format_log_entry(entry))) => result?,
                _ = tokio::signal::ctrl_c() => {}
            }
            return Ok(());
        }
        Commands::Shutdown => {
            client.shutdown().await?;
            println!("Daemon shutting down.");
            return Ok(());
        }
    }

    client.detach().await
}
