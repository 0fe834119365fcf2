use std::path::PathBuf;

use clap::Parser;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use vsp::config::{DataplaneKind, VspConfig};
use vsp::daemon::VspDaemon;

#[derive(Parser)]
#[command(name = "vsp")]
#[command(about = "Dataplane control daemon for SmartNIC/DPU platforms")]
struct Args {
    /// Unix socket the gRPC services listen on
    #[arg(short, long, default_value = "/var/run/vsp/vsp.sock")]
    socket: PathBuf,

    /// JSON config file; defaults apply for missing fields
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the configured forwarding backend
    #[arg(long, value_enum)]
    dataplane: Option<DataplaneKind>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("vsp=info".parse()?),
        )
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => VspConfig::load(path)?,
        None => VspConfig::default(),
    };
    if let Some(kind) = args.dataplane {
        config.dataplane = kind;
    }

    info!(socket = %args.socket.display(), "Starting vsp");
    let daemon = VspDaemon::new(config, args.socket);
    let listener = daemon.listen().await?;

    let stopper = daemon.clone();
    tokio::spawn(async move {
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "Failed to install SIGINT handler");
                return;
            }
        };
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                return;
            }
        };
        tokio::select! {
            _ = sigint.recv() => info!("Received SIGINT, shutting down..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
        }
        if let Err(e) = stopper.stop().await {
            error!(error = %e, "Errors during shutdown");
        }
    });

    daemon.serve(listener).await?;
    Ok(())
}
