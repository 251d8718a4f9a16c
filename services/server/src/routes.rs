use axum::middleware::from_fn_with_state;
use axum::routing::{get, post};
use axum::Router;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::handlers::{auth, discovery, elevate, executions, health};
use crate::middleware::{
    auth::auth_context_middleware, cors::cors_middleware, request_id::request_id_middleware,
    setup_gate::setup_gate_middleware,
};
use crate::services::AppState;

pub fn create_routes(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/health", get(health::health))
        .route("/ready", get(health::ready))
        .route("/metrics", get(health::metrics))
        .route(
            "/.well-known/api-configuration",
            get(health::api_configuration),
        );

    let auth_routes = Router::new()
        .route("/auth", get(auth::auth_index))
        .route("/auth/request/:provider", get(auth::auth_request))
        .route(
            "/auth/callback/:provider",
            get(auth::auth_callback_oauth).post(auth::auth_callback_saml),
        )
        .route("/auth/logout", get(auth::logout))
        .route("/auth/logout/:provider", get(auth::logout));

    let elevate_routes = Router::new()
        .route(
            "/elevate",
            get(elevate::elevate_get).post(elevate::elevate_post),
        )
        .route(
            "/elevate/resume",
            get(elevate::elevate_resume).post(elevate::elevate_resume),
        )
        .route(
            "/elevate/llm",
            get(elevate::elevate_llm_get).post(elevate::elevate_llm_post),
        )
        .route("/executions", get(executions::list_executions))
        .route("/execution/:id", get(executions::get_execution))
        .route("/execution/:id/signal", get(executions::signal_execution))
        .route("/execution/:id/cancel", get(executions::cancel_execution))
        .route(
            "/execution/:id/terminate",
            get(executions::terminate_execution),
        );

    let discovery_routes = Router::new()
        .route("/roles", get(discovery::list_roles))
        .route("/workflows", get(discovery::list_workflows))
        .route("/providers", get(discovery::list_providers))
        .route("/identities", get(discovery::list_identities))
        .route("/register", post(discovery::register));

    Router::new()
        .merge(public_routes)
        .merge(auth_routes)
        .merge(elevate_routes)
        .merge(discovery_routes)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(from_fn_with_state(state.clone(), request_id_middleware))
                .layer(from_fn_with_state(state.clone(), cors_middleware))
                .layer(from_fn_with_state(state.clone(), setup_gate_middleware))
                .layer(from_fn_with_state(state.clone(), auth_context_middleware)),
        )
        .with_state(state)
}

/// Routes are served both at the root and under `/api/v1`.
pub fn create_versioned_routes(state: AppState) -> Router {
    Router::new()
        .merge(create_routes(state.clone()))
        .nest("/api/v1", create_routes(state))
        .fallback(not_found_handler)
}

async fn not_found_handler() -> (axum::http::StatusCode, axum::Json<serde_json::Value>) {
    (
        axum::http::StatusCode::NOT_FOUND,
        axum::Json(serde_json::json!({
            "code": "NOT_FOUND",
            "title": "Not Found",
            "message": "The requested endpoint was not found",
        })),
    )
}
