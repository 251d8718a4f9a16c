// Loopback HTTP surface: session management and the client bootstrap
// handoff

use axum::extract::{Path, Query, Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Redirect, Response};
use axum::Json;
use serde::Deserialize;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

use thand_shared::auth::{provider_cookie_name, LocalSession};
use thand_shared::ServiceError;

use crate::state::AgentState;

type ApiError = (StatusCode, Json<serde_json::Value>);

fn error_response(err: ServiceError) -> ApiError {
    (
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        Json(serde_json::json!({
            "code": err.code(),
            "title": "Request failed",
            "message": err.to_string(),
        })),
    )
}

pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "healthy", "role": "agent"}))
}

/// GET /sessions — providers with sessions for the configured login server.
pub async fn list_sessions(State(state): State<AgentState>) -> Json<serde_json::Value> {
    let host = state.login_server_host();
    let sessions = state.store.load(&host).await;

    let entries: Vec<serde_json::Value> = sessions
        .providers
        .iter()
        .map(|(provider, session)| {
            serde_json::json!({
                "provider": provider,
                "expires_at": session.expires_at,
                "expired": session.is_expired(),
            })
        })
        .collect();

    Json(serde_json::json!({
        "login_server": host,
        "sessions": entries,
    }))
}

/// GET /session/{provider} — the encoded session for Bearer / X-API-Key use.
pub async fn get_session(
    State(state): State<AgentState>,
    Path(provider): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let host = state.login_server_host();
    let session = state
        .store
        .get_session(&host, &provider)
        .await
        .ok_or_else(|| {
            error_response(ServiceError::NotFound(format!("session for {}", provider)))
        })?;

    let encoded = session.encode().map_err(error_response)?;
    Ok(Json(serde_json::json!({
        "provider": provider,
        "session": encoded,
        "expires_at": session.expires_at,
    })))
}

#[derive(Debug, Deserialize)]
pub struct PutSessionRequest {
    pub session: String,
}

/// POST /session/{provider} — store a session delivered out of band.
pub async fn put_session(
    State(state): State<AgentState>,
    Path(provider): Path<String>,
    Json(request): Json<PutSessionRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let local = LocalSession::decode(&request.session).map_err(error_response)?;
    let host = state.login_server_host();
    state
        .store
        .add_session(&host, &provider, local)
        .await
        .map_err(error_response)?;
    Ok(Json(serde_json::json!({"stored": true})))
}

/// DELETE /session/{provider} and DELETE /sessions.
pub async fn delete_session(
    State(state): State<AgentState>,
    Path(provider): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let host = state.login_server_host();
    state
        .store
        .remove_session(&host, &provider)
        .await
        .map_err(error_response)?;
    Ok(Json(serde_json::json!({"removed": true})))
}

pub async fn delete_all_sessions(
    State(state): State<AgentState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let host = state.login_server_host();
    state.store.remove_all(&host).await.map_err(error_response)?;
    Ok(Json(serde_json::json!({"removed": true})))
}

/// POST /register — issue a one-time bootstrap code for a login round trip.
pub async fn register(State(state): State<AgentState>) -> Json<serde_json::Value> {
    let (code, _) = state.issue_code();
    Json(serde_json::json!({
        "code": code,
        "callback_url": state.postflight_url(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct PreflightRequest {
    pub provider: String,
    pub code: String,
}

/// POST /preflight — build the login-server auth URL the client should open
/// in a browser.
pub async fn preflight(
    State(state): State<AgentState>,
    Json(request): Json<PreflightRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let known = state
        .pending_codes
        .lock()
        .unwrap()
        .contains_key(&request.code);
    if !known {
        return Err(error_response(ServiceError::Validation(
            "unknown bootstrap code".to_string(),
        )));
    }

    let auth_url = format!(
        "{}/api/v1/auth/request/{}?callback={}&code={}",
        state.config.login_server.trim_end_matches('/'),
        request.provider,
        urlencoding::encode(&state.postflight_url()),
        urlencoding::encode(&request.code),
    );
    Ok(Json(serde_json::json!({"auth_url": auth_url})))
}

#[derive(Debug, Deserialize)]
pub struct PostflightQuery {
    pub code: String,
    pub provider: String,
    pub session: String,
}

/// GET /postflight — the login server redirects the browser here with the
/// one-time code and the sealed session. Consuming the code stores the
/// session and wakes any waiting client.
pub async fn postflight(
    State(state): State<AgentState>,
    Query(query): Query<PostflightQuery>,
) -> Result<Response, ApiError> {
    if !state.consume_code(&query.code) {
        return Err(error_response(ServiceError::Forbidden(
            "invalid or expired bootstrap code".to_string(),
        )));
    }

    let local = LocalSession::decode(&query.session).map_err(error_response)?;
    let host = state.login_server_host();
    state
        .store
        .add_session(&host, &query.provider, local)
        .await
        .map_err(error_response)?;

    tracing::info!(provider = %query.provider, "Session received via bootstrap handoff");

    let body = "<!DOCTYPE html><html><head><title>Signed in</title></head>\
                <body><h1>Signed in</h1><p>You can close this window and \
                return to the terminal.</p></body></html>";
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
        body,
    )
        .into_response())
}

#[derive(Debug, Deserialize)]
pub struct AwaitQuery {
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default = "default_await_timeout")]
    pub timeout_secs: u64,
}

fn default_await_timeout() -> u64 {
    60
}

/// GET /await — long-poll until the session store is refreshed. 204 when the
/// timeout elapses first.
pub async fn await_refresh(
    State(state): State<AgentState>,
    Query(query): Query<AwaitQuery>,
) -> Response {
    let host = state.login_server_host();
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        let timeout = query.timeout_secs.min(300);
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(timeout)).await;
            cancel.cancel();
        });
    }

    match &query.provider {
        Some(provider) => {
            match state
                .store
                .await_provider_refresh(&host, provider, &cancel)
                .await
            {
                Some(session) => Json(serde_json::json!({
                    "provider": provider,
                    "expires_at": session.expires_at,
                }))
                .into_response(),
                None => StatusCode::NO_CONTENT.into_response(),
            }
        }
        None => match state.store.await_refresh(&host, &cancel).await {
            Some(sessions) => Json(serde_json::json!({
                "providers": sessions.providers.keys().collect::<Vec<_>>(),
            }))
            .into_response(),
            None => StatusCode::NO_CONTENT.into_response(),
        },
    }
}

/// Agent-mode cookie re-issue: when a browser request carries no (or stale)
/// provider cookies but the session store has fresher sessions, set the
/// cookies and redirect once. The equality check is the loop protection:
/// after the redirect the cookies match and the request passes through.
pub async fn cookie_reissue_middleware(
    State(state): State<AgentState>,
    request: Request,
    next: Next,
) -> Response {
    // Only browser traffic participates; API clients authenticate with
    // Bearer / X-API-Key.
    let is_browser = request
        .headers()
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|accept| accept.contains("text/html"))
        .unwrap_or(false);
    if !is_browser {
        return next.run(request).await;
    }

    let host = state.login_server_host();
    let stored = state.store.load(&host).await;
    if stored.providers.is_empty() {
        return next.run(request).await;
    }

    let request_cookies = parse_cookies(request.headers());
    let mut missing: Vec<(String, String)> = Vec::new();
    for (provider, session) in &stored.providers {
        let Ok(encoded) = session.encode() else {
            continue;
        };
        let cookie_name = provider_cookie_name(provider);
        if request_cookies.get(&cookie_name) != Some(&encoded) {
            missing.push((cookie_name, encoded));
        }
    }

    if missing.is_empty() {
        return next.run(request).await;
    }

    let target = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let mut response = Redirect::temporary(&target).into_response();
    for (name, value) in missing {
        if let Ok(cookie) = HeaderValue::from_str(&format!(
            "{}={}; HttpOnly; Max-Age={}; Path=/",
            name,
            value,
            thand_shared::auth::COOKIE_MAX_AGE_SECS
        )) {
            response.headers_mut().append(header::SET_COOKIE, cookie);
        }
    }
    response
}

fn parse_cookies(headers: &axum::http::HeaderMap) -> HashMap<String, String> {
    let mut cookies = HashMap::new();
    for cookie_header in headers.get_all(header::COOKIE) {
        if let Ok(raw) = cookie_header.to_str() {
            for pair in raw.split(';') {
                if let Some((name, value)) = pair.trim().split_once('=') {
                    cookies.insert(name.to_string(), value.to_string());
                }
            }
        }
    }
    cookies
}
