use std::net::SocketAddr;
use tokio::net::TcpListener;

use thand_shared::{AppConfig, Result, ServiceError};

use crate::routes::create_routes;
use crate::state::AgentServices;

pub struct AgentServer {
    app: axum::Router,
    addr: SocketAddr,
}

impl AgentServer {
    pub fn new(config: &AppConfig) -> Result<Self> {
        let state = AgentServices::build(config.clone())?;
        let app = create_routes(state);

        // The agent only ever listens on loopback.
        let addr = format!("{}:{}", config.agent.host, config.agent.port)
            .parse()
            .map_err(|e| ServiceError::Configuration(format!("invalid agent address: {}", e)))?;

        Ok(Self { app, addr })
    }

    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(self.addr)
            .await
            .map_err(|e| ServiceError::Internal(format!("failed to bind {}: {}", self.addr, e)))?;

        tracing::info!("thand agent listening on {}", self.addr);

        axum::serve(listener, self.app)
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
            })
            .await
            .map_err(|e| ServiceError::Internal(format!("agent error: {}", e)))?;
        Ok(())
    }
}
