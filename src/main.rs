mod cli;

use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use warden::app::App;
use warden::bridge::{LogTarget, PresentationBridge};
use warden::config::WardenConfig;

#[derive(Parser)]
#[command(name = "warden", version, about = "Worker supervision and control plane for the knowledge-capture app")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the worker, the control plane, and the event relay
    Serve,
    /// Inspect or edit the port registry
    Ports {
        #[command(subcommand)]
        action: PortsAction,
    },
    /// Check configuration and registry health
    Doctor,
}

#[derive(Subcommand)]
enum PortsAction {
    /// List live leases
    List,
    /// Print the port leased by a service
    Discover { service: String },
    /// Drop a service's lease
    Release { service: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = WardenConfig::load()?;

    // stdout is left to command output
    let filter = EnvFilter::try_new(&config.server.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Serve => serve(config).await?,
        Command::Ports { action } => match action {
            PortsAction::List => cli::ports_list(&config)?,
            PortsAction::Discover { service } => cli::ports_discover(&config, &service)?,
            PortsAction::Release { service } => cli::ports_release(&config, &service)?,
        },
        Command::Doctor => cli::doctor::doctor(&config)?,
    }

    Ok(())
}

async fn serve(config: WardenConfig) -> Result<()> {
    let bridge = Arc::new(PresentationBridge::new(config.server.presentation_queue));
    // no window in headless mode: presentation calls go to the log
    bridge.attach(Arc::new(LogTarget));

    let app = App::start(config, bridge).await?;
    tracing::info!(addr = %app.control_addr(), "serving, press Ctrl+C to stop");

    shutdown_signal().await;
    app.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received Ctrl+C"),
        _ = terminate => tracing::info!("received SIGTERM"),
    }
}
