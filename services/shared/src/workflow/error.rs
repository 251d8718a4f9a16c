use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Workflow-level errors. Terminal for the instance unless noted.
#[derive(Debug, Error, Clone, Serialize, Deserialize)]
pub enum WorkflowError {
    #[error("Workflow validation failed: {errors:?}")]
    ValidationFailed { errors: Vec<String> },

    #[error("Activity failed: {activity_name} - {error}")]
    ActivityFailed { activity_name: String, error: String },

    #[error("Workflow cancelled: {workflow_id}")]
    Cancelled { workflow_id: String },

    #[error("Workflow terminated: {workflow_id} - {reason}")]
    Terminated { workflow_id: String, reason: String },

    #[error("Workflow timed out: {workflow_name} after {timeout_seconds}s")]
    TimedOut {
        workflow_name: String,
        timeout_seconds: u64,
    },

    #[error("Security violation: {message}")]
    SecurityViolation { message: String },

    #[error("Serialization error in workflow {workflow_id}: {error}")]
    SerializationError { workflow_id: String, error: String },

    #[error("Workflow execution failed: {workflow_id} - {error}")]
    ExecutionFailed { workflow_id: String, error: String },
}

/// Activity-level errors, classified for the retry loop.
#[derive(Debug, Error, Clone, Serialize, Deserialize)]
pub enum ActivityError {
    #[error("Provider error ({kind}): {message}")]
    Provider {
        kind: String,
        retryable: bool,
        message: String,
    },

    #[error("Validation error: {message}")]
    Validation { message: String },

    #[error("Authorization error: {message}")]
    Authorization { message: String },

    #[error("Network error: {message}")]
    Network { message: String },

    #[error("Serialization error: {message}")]
    Serialization { message: String },

    #[error("Resource not found: {resource}")]
    NotFound { resource: String },

    #[error("Activity cancelled")]
    Cancelled,

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl ActivityError {
    pub fn provider(kind: impl Into<String>, retryable: bool, message: impl Into<String>) -> Self {
        ActivityError::Provider {
            kind: kind.into(),
            retryable,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            ActivityError::Provider { retryable, .. } => *retryable,
            ActivityError::Network { .. } => true,
            ActivityError::Validation { .. } => false,
            ActivityError::Authorization { .. } => false,
            ActivityError::Serialization { .. } => false,
            ActivityError::NotFound { .. } => false,
            ActivityError::Cancelled => false,
            ActivityError::Internal { .. } => false,
        }
    }

    /// Classified kind for the structured failure chain.
    pub fn kind(&self) -> String {
        match self {
            ActivityError::Provider { kind, .. } => kind.clone(),
            ActivityError::Validation { .. } => "ValidationError".to_string(),
            ActivityError::Authorization { .. } => "AuthorizationError".to_string(),
            ActivityError::Network { .. } => "NetworkError".to_string(),
            ActivityError::Serialization { .. } => "SerializationError".to_string(),
            ActivityError::NotFound { .. } => "NotFoundError".to_string(),
            ActivityError::Cancelled => "CancelledError".to_string(),
            ActivityError::Internal { .. } => "InternalError".to_string(),
        }
    }
}

impl From<ActivityError> for WorkflowError {
    fn from(err: ActivityError) -> Self {
        WorkflowError::ActivityFailed {
            activity_name: "unknown".to_string(),
            error: err.to_string(),
        }
    }
}

impl From<crate::error::ServiceError> for ActivityError {
    fn from(err: crate::error::ServiceError) -> Self {
        match err {
            crate::error::ServiceError::Provider {
                kind,
                retryable,
                message,
            } => ActivityError::Provider {
                kind,
                retryable,
                message,
            },
            crate::error::ServiceError::Forbidden(m) => ActivityError::Authorization { message: m },
            crate::error::ServiceError::Unauthorized(m) => {
                ActivityError::Authorization { message: m }
            }
            crate::error::ServiceError::Validation(m) => ActivityError::Validation { message: m },
            crate::error::ServiceError::NotFound(m) => ActivityError::NotFound { resource: m },
            crate::error::ServiceError::Serialization(m) => {
                ActivityError::Serialization { message: m }
            }
            other => ActivityError::Internal {
                message: other.to_string(),
            },
        }
    }
}

/// Structured failure kinds exposed through the status view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    Application,
    Activity,
    Timeout,
    Cancelled,
    Terminated,
    Server,
}

/// Structured failure record for a workflow instance, carried in the journal
/// and surfaced to status queries with its cause chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowFailure {
    pub kind: FailureKind,
    pub message: String,
    /// Step reference where the failure occurred, if known.
    pub step: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<WorkflowFailure>>,
    /// Step references traversed up to the failure.
    #[serde(default)]
    pub stack: Vec<String>,
}

impl WorkflowFailure {
    pub fn from_workflow_error(err: &WorkflowError, step: Option<String>) -> Self {
        let kind = match err {
            WorkflowError::Cancelled { .. } => FailureKind::Cancelled,
            WorkflowError::Terminated { .. } => FailureKind::Terminated,
            WorkflowError::TimedOut { .. } => FailureKind::Timeout,
            WorkflowError::ActivityFailed { .. } => FailureKind::Activity,
            _ => FailureKind::Application,
        };
        Self {
            kind,
            message: err.to_string(),
            step,
            cause: None,
            stack: Vec::new(),
        }
    }
}

/// Runtime (engine) errors, distinct from workflow business failures.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Workflow not found: {workflow_id}")]
    WorkflowNotFound { workflow_id: String },

    #[error("Workflow already exists: {workflow_id}")]
    WorkflowAlreadyExists { workflow_id: String },

    #[error("Workflow definition not registered: {workflow_name}")]
    DefinitionNotRegistered { workflow_name: String },

    #[error("Workflow is not running: {workflow_id}")]
    NotRunning { workflow_id: String },

    #[error("Journal error: {message}")]
    Journal { message: String },

    #[error("Query timed out after {timeout_ms}ms")]
    QueryTimeout { timeout_ms: u64 },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<RuntimeError> for crate::error::ServiceError {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::WorkflowNotFound { workflow_id } => {
                crate::error::ServiceError::NotFound(format!("workflow {}", workflow_id))
            }
            RuntimeError::QueryTimeout { timeout_ms } => {
                crate::error::ServiceError::Timeout(format!("workflow query after {}ms", timeout_ms))
            }
            other => crate::error::ServiceError::Workflow(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_activity_error_retryability() {
        assert!(ActivityError::provider("GcpRoleBindingError", true, "503").is_retryable());
        assert!(!ActivityError::provider("GcpCustomRoleCreationError", false, "409").is_retryable());
        assert!(ActivityError::Network {
            message: "reset".to_string()
        }
        .is_retryable());
        assert!(!ActivityError::Cancelled.is_retryable());
    }

    #[test]
    fn test_failure_kind_classification() {
        let err = WorkflowError::Cancelled {
            workflow_id: "wf-1".to_string(),
        };
        let failure = WorkflowFailure::from_workflow_error(&err, Some("active".to_string()));
        assert_eq!(failure.kind, FailureKind::Cancelled);
        assert_eq!(failure.step.as_deref(), Some("active"));
    }
}
