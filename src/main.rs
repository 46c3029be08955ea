//! mesh-sidecar
//!
//! # Architecture Overview
//!
//! ```text
//!                 ┌──────────────────────────────────────────────────────────────┐
//!                 │                         SIDECAR                              │
//!   downstream    │  ┌──────────┐   ┌─────────────┐   ┌────────────────┐         │
//!  ───────────────┼─▶│ listener │──▶│ L4 codec    │──▶│ receive chain  │─────────┼──▶ upstream
//!                 │  └──────────┘   │ (one stream │   └────────────────┘         │
//!                 │                 │  per conn)  │   ┌────────────────┐         │
//!  ◀──────────────┼─────────────────│             │◀──│  send chain    │◀────────┼─── upstream
//!                 │                 └─────────────┘   └────────────────┘         │
//!                 │                                                              │
//!                 │   ResourceContext per stream ◀── StreamPools (sharded)       │
//!                 │   config · observability · lifecycle                         │
//!                 └──────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;

use clap::Parser;

use mesh_sidecar::config::{load_config, SidecarConfig};
use mesh_sidecar::lifecycle::shutdown_signal;
use mesh_sidecar::net::{Listener, SidecarServer};
use mesh_sidecar::observability::logging::init_logging;

#[derive(Parser)]
#[command(name = "mesh-sidecar")]
#[command(about = "Service-mesh sidecar data plane", long_about = None)]
struct Cli {
    /// TOML configuration file; built-in defaults when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Validate the configuration and exit.
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => SidecarConfig::default(),
    };

    if cli.check {
        println!("configuration OK");
        return Ok(());
    }

    init_logging(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "mesh-sidecar starting");
    tracing::info!(
        bind_address = %config.listener.bind_address,
        upstream = %config.upstream.address,
        receive_filters = config.filters.receive.len(),
        send_filters = config.filters.send.len(),
        "Configuration loaded"
    );

    let listener = Listener::bind(&config.listener).await?;
    let server = SidecarServer::new(&config);

    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        shutdown_signal().await;
        shutdown.trigger();
    });

    server.run(listener).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
