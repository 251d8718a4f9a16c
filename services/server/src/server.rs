use axum::Router;
use std::net::SocketAddr;
use tokio::net::TcpListener;

use thand_shared::{AppConfig, Result, ServiceError};

use crate::routes::create_versioned_routes;
use crate::services::Services;

pub struct ThandServer {
    app: Router,
    addr: SocketAddr,
}

impl ThandServer {
    pub async fn new(config: &AppConfig) -> Result<Self> {
        let state = Services::build(config.clone()).await?;
        let app = create_versioned_routes(state);

        let addr = format!("{}:{}", config.server.host, config.server.port)
            .parse()
            .map_err(|e| ServiceError::Configuration(format!("invalid server address: {}", e)))?;

        Ok(Self { app, addr })
    }

    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(self.addr)
            .await
            .map_err(|e| ServiceError::Internal(format!("failed to bind {}: {}", self.addr, e)))?;

        tracing::info!("thand server listening on {}", self.addr);

        axum::serve(
            listener,
            self.app
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| ServiceError::Internal(format!("server error: {}", e)))?;

        Ok(())
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("Shutdown signal received");
}
