// Structured logging setup shared by all thand binaries

use tracing::info;
use tracing_subscriber::fmt::Layer as FmtLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

use crate::config::LoggingConfig;
use crate::error::{Result, ServiceError};

pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let registry = Registry::default().with(env_filter);

    if let Some(file_path) = &config.file_path {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(file_path)
            .map_err(|e| ServiceError::Internal(format!("Failed to open log file: {}", e)))?;

        registry
            .with(FmtLayer::new().json().with_writer(file))
            .init();
        return Ok(());
    }

    match config.format.as_str() {
        "json" => registry.with(FmtLayer::new().json()).init(),
        "pretty" => registry.with(FmtLayer::new().pretty()).init(),
        _ => registry.with(FmtLayer::new()).init(),
    }

    info!("Logging initialized with level: {}", config.level);
    Ok(())
}

pub fn generate_correlation_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[macro_export]
macro_rules! log_workflow_event {
    ($workflow_id:expr, $workflow_name:expr, $event:expr) => {
        tracing::info!(
            workflow_id = %$workflow_id,
            workflow_name = %$workflow_name,
            event = %$event,
            "Workflow event"
        );
    };
}
