use axum::middleware::from_fn_with_state;
use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::state::AgentState;

pub fn create_routes(state: AgentState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/sessions", get(handlers::list_sessions))
        .route("/sessions", delete(handlers::delete_all_sessions))
        .route(
            "/session/:provider",
            get(handlers::get_session)
                .post(handlers::put_session)
                .delete(handlers::delete_session),
        )
        .route("/register", post(handlers::register))
        .route("/preflight", post(handlers::preflight))
        .route("/postflight", get(handlers::postflight))
        .route("/await", get(handlers::await_refresh))
        .layer(TraceLayer::new_for_http())
        .layer(from_fn_with_state(
            state.clone(),
            handlers::cookie_reissue_middleware,
        ))
        .with_state(state)
}
