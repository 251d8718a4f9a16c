use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::error::wants_html;
use crate::services::AppState;

const SETUP_EXEMPT: &[&str] = &["/health", "/ready", "/api/v1/health", "/api/v1/ready"];

/// Until the install is configured (login endpoint set, server secret
/// rotated, encryption present), every non-health request is answered with
/// the setup page, or `421 Misdirected Request` for JSON clients.
pub async fn setup_gate_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    if state.setup_complete() || SETUP_EXEMPT.contains(&request.uri().path()) {
        return next.run(request).await;
    }

    if wants_html(request.headers()) {
        let body = "<!DOCTYPE html><html><head><title>Setup required</title></head>\
                    <body><h1>Setup required</h1>\
                    <p>This server has not been configured yet. Set the login \
                    endpoint and rotate the server secret, then restart.</p>\
                    </body></html>";
        return (
            StatusCode::MISDIRECTED_REQUEST,
            [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
            body,
        )
            .into_response();
    }

    (
        StatusCode::MISDIRECTED_REQUEST,
        axum::Json(serde_json::json!({
            "code": "NOT_CONFIGURED",
            "title": "Setup required",
            "message": "login endpoint and server secret must be configured",
        })),
    )
        .into_response()
}
