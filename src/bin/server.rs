//! terra-panel-server - Daemon that supervises one game server

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use terra_panel::config::Config;
use terra_panel::server::StreamGateway;
use terra_panel::supervisor::Supervisor;
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(name = "terra-panel-server")]
#[command(about = "terra-panel game server daemon")]
struct Cli {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Instance name, used for the socket file
    #[arg(short, long, default_value = "default")]
    instance: String,

    /// Socket path override
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Start the game server right away
    #[arg(long)]
    autostart: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    let launch = config.launch_config()?;
    let socket_path = cli
        .socket
        .clone()
        .unwrap_or_else(|| config.socket_path(&cli.instance));

    tracing::info!(
        "Starting terra-panel server '{}' for {}",
        cli.instance,
        launch.program()
    );

    let supervisor = Supervisor::new(launch, config.supervisor_options());
    let gateway = StreamGateway::new(supervisor.clone(), socket_path);

    if cli.autostart {
        if let Err(e) = supervisor.start().await {
            tracing::error!("Autostart failed: {}", e);
        }
    }

    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(()).await;
        }
    });

    let result = gateway.run(shutdown_rx).await;

    supervisor.shutdown().await;
    tracing::info!("terra-panel server exited");

    result
}
