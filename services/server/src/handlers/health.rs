// Liveness, readiness, metrics and discovery endpoints

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use std::sync::Arc;

use thand_shared::health::{HealthCheckProvider, HealthChecker};
use thand_shared::types::HealthCheck;
use thand_shared::workflow::WorkflowRuntime;

use crate::providers::ProviderRegistry;
use crate::services::AppState;

struct EncryptionHealthCheck {
    fingerprint: String,
}

#[async_trait::async_trait]
impl HealthCheckProvider for EncryptionHealthCheck {
    async fn check(&self) -> thand_shared::Result<HealthCheck> {
        Ok(HealthCheck {
            status: "healthy".to_string(),
            message: Some(format!("key fingerprint {}", self.fingerprint)),
            duration_ms: 0,
        })
    }

    fn name(&self) -> &str {
        "encryption"
    }
}

struct WorkflowRuntimeHealthCheck {
    runtime: Arc<WorkflowRuntime>,
}

#[async_trait::async_trait]
impl HealthCheckProvider for WorkflowRuntimeHealthCheck {
    async fn check(&self) -> thand_shared::Result<HealthCheck> {
        let executions = self.runtime.list_workflows().len();
        Ok(HealthCheck {
            status: "healthy".to_string(),
            message: Some(format!("{} executions tracked", executions)),
            duration_ms: 0,
        })
    }

    fn name(&self) -> &str {
        "workflow_runtime"
    }
}

struct ProvidersHealthCheck {
    registry: Arc<ProviderRegistry>,
}

#[async_trait::async_trait]
impl HealthCheckProvider for ProvidersHealthCheck {
    async fn check(&self) -> thand_shared::Result<HealthCheck> {
        let count = self.registry.list().len();
        Ok(HealthCheck {
            status: "healthy".to_string(),
            message: Some(format!("{} providers registered", count)),
            duration_ms: 0,
        })
    }

    fn name(&self) -> &str {
        "providers"
    }
}

pub async fn health(State(state): State<AppState>) -> Json<thand_shared::types::HealthStatus> {
    let mut checker = HealthChecker::new(env!("CARGO_PKG_VERSION"));
    checker.add_check(EncryptionHealthCheck {
        fingerprint: state.encryption.fingerprint().to_string(),
    });
    checker.add_check(WorkflowRuntimeHealthCheck {
        runtime: Arc::clone(&state.runtime),
    });
    checker.add_check(ProvidersHealthCheck {
        registry: Arc::clone(&state.registry),
    });

    Json(checker.check_health().await)
}

pub async fn ready(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    if state.setup_complete() {
        (StatusCode::OK, Json(serde_json::json!({"ready": true})))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({"ready": false, "reason": "setup incomplete"})),
        )
    }
}

pub async fn metrics(State(state): State<AppState>) -> Json<serde_json::Value> {
    let snapshot = state.metrics.snapshot();
    let executions = state.runtime.list_workflows();

    let mut by_status = std::collections::HashMap::new();
    for view in &executions {
        *by_status.entry(view.status.to_string()).or_insert(0u64) += 1;
    }

    Json(serde_json::json!({
        "uptime_secs": snapshot.uptime_secs,
        "total_requests": snapshot.total_requests,
        "elevate_requests": snapshot.elevate_requests,
        "auth_requests": snapshot.auth_requests,
        "executions": {
            "total": executions.len(),
            "by_status": by_status,
        },
    }))
}

/// `/.well-known/api-configuration`: endpoint discovery for agents and CLIs.
pub async fn api_configuration(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "login_server": state.config.login_server,
        "endpoints": {
            "auth_request": "/api/v1/auth/request/{provider}",
            "auth_callback": "/api/v1/auth/callback/{provider}",
            "elevate": "/api/v1/elevate",
            "elevate_resume": "/api/v1/elevate/resume",
            "elevate_llm": "/api/v1/elevate/llm",
            "executions": "/api/v1/executions",
            "execution": "/api/v1/execution/{id}",
            "roles": "/api/v1/roles",
            "workflows": "/api/v1/workflows",
            "providers": "/api/v1/providers",
            "identities": "/api/v1/identities",
        },
        "capabilities": {
            "llm_elevation": state.llm.is_some(),
            "providers": state.registry.list(),
        },
    }))
}
