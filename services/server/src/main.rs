//! thand control plane server: authentication gateway, elevation engine and
//! provider registry.

use clap::Parser;
use std::path::PathBuf;

use thand_server::server::ThandServer;
use thand_shared::{logging::init_logging, AppConfig};

#[derive(Debug, Parser)]
#[command(name = "thand-server", about = "thand just-in-time access server")]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the listen port.
    #[arg(long)]
    port: Option<u16>,

    /// Override the configured login server endpoint.
    #[arg(long)]
    login_server: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let mut config = AppConfig::load(args.config.as_deref())?;
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(login_server) = args.login_server {
        config.login_server = login_server;
    }

    init_logging(&config.logging)?;
    tracing::info!(
        port = config.server.port,
        public_url = %config.server.public_url,
        "Starting thand server"
    );

    let server = ThandServer::new(&config).await?;
    server.run().await?;
    Ok(())
}
