// Error handling for thand services

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ServiceError>;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Invalid state token: {0}")]
    InvalidState(String),

    #[error("Unexpected state type: expected {expected}, got {actual}")]
    InvalidStateType { expected: String, actual: String },

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Provider error ({kind}): {message}")]
    Provider {
        kind: String,
        retryable: bool,
        message: String,
    },

    #[error("Service not configured: {0}")]
    NotConfigured(String),

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("Replay detected: assertion {0} already seen")]
    ReplayDetected(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Workflow error: {0}")]
    Workflow(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    /// Build a provider error with a classified kind.
    pub fn provider(kind: impl Into<String>, retryable: bool, message: impl Into<String>) -> Self {
        ServiceError::Provider {
            kind: kind.into(),
            retryable,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ServiceError::Provider { retryable: true, .. }
                | ServiceError::Timeout(_)
                | ServiceError::Io(_)
        )
    }

    pub fn status_code(&self) -> u16 {
        match self {
            ServiceError::InvalidState(_) | ServiceError::InvalidStateType { .. } => 400,
            ServiceError::Validation(_) | ServiceError::ReplayDetected(_) => 400,
            ServiceError::Unauthorized(_) => 401,
            ServiceError::Forbidden(_) => 403,
            ServiceError::NotFound(_) => 404,
            ServiceError::Timeout(_) => 408,
            ServiceError::RateLimited => 429,
            ServiceError::NotConfigured(_) => 501,
            _ => 500,
        }
    }

    /// Stable machine-readable code for API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::InvalidState(_) => "INVALID_STATE",
            ServiceError::InvalidStateType { .. } => "INVALID_STATE_TYPE",
            ServiceError::Unauthorized(_) => "UNAUTHORIZED",
            ServiceError::Forbidden(_) => "FORBIDDEN",
            ServiceError::Provider { .. } => "PROVIDER_ERROR",
            ServiceError::NotConfigured(_) => "NOT_CONFIGURED",
            ServiceError::RateLimited => "RATE_LIMITED",
            ServiceError::ReplayDetected(_) => "REPLAY_DETECTED",
            ServiceError::Timeout(_) => "TIMEOUT",
            ServiceError::Validation(_) => "VALIDATION_FAILED",
            ServiceError::NotFound(_) => "NOT_FOUND",
            ServiceError::Workflow(_) => "WORKFLOW_ERROR",
            ServiceError::Configuration(_) => "CONFIGURATION_ERROR",
            ServiceError::Serialization(_) => "SERIALIZATION_ERROR",
            ServiceError::Io(_) => "IO_ERROR",
            ServiceError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        ServiceError::Serialization(err.to_string())
    }
}
