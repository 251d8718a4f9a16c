//! thand local agent daemon.

use clap::Parser;
use std::path::PathBuf;

use thand_agent::server::AgentServer;
use thand_shared::{logging::init_logging, AppConfig};

#[derive(Debug, Parser)]
#[command(name = "thand-agent", about = "thand local session agent")]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the loopback listen port.
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
        config.agent.port = port;
    }
    if let Some(login_server) = args.login_server {
        config.login_server = login_server;
    }

    init_logging(&config.logging)?;
    tracing::info!(
        url = %config.agent.local_server_url(),
        login_server = %config.login_server,
        "Starting thand agent"
    );

    let server = AgentServer::new(&config)?;
    server.run().await?;
    Ok(())
}
