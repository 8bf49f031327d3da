//! OpenEM ingestor - daemon entry point

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use openem_ingestor::logging::init_logging;
use openem_ingestor::Config;
use openem_ingestor_server::{run_server, AppState};

#[derive(Parser, Debug)]
#[command(name = "openem-ingestor", version, about = "Dataset ingestion daemon for SciCat")]
struct Args {
    /// Configuration file; searched beside the executable and in the user config dir when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override `WebServer.Host`
    #[arg(long)]
    host: Option<String>,

    /// Override `WebServer.Port`
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let (mut config, path) =
        Config::load(args.config.as_deref()).context("failed to load configuration")?;
    if let Some(host) = args.host {
        config.web_server.host = host;
    }
    if let Some(port) = args.port {
        config.web_server.port = port;
    }
    config.validate().context("invalid configuration")?;
    init_logging(&config.logging).context("failed to initialise logging")?;
    tracing::info!(config = %path.display(), "configuration loaded");

    let state = AppState::from_config(config).context("failed to set up the ingestor")?;
    run_server(state, shutdown_signal()).await
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
