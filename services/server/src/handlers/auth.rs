// Authentication gateway: SP-initiated starts, OAuth2 and SAML finishes,
// state dispatch and session cookies

use axum::extract::{Extension, Form, FromRequest, Path, Query, Request, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use axum::Json;
use serde::Deserialize;

use thand_shared::auth::{
    provider_cookie_name, AuthState, LocalSession, Session, COOKIE_MAX_AGE_SECS, COOKIE_PRIMARY,
};
use thand_shared::envelope::{Envelope, EnvelopeKind};
use thand_shared::workflow::WorkflowTask;
use thand_shared::ServiceError;

use crate::error::{html_error_response, wants_html, ApiError, ApiResult};
use crate::middleware::auth::AuthContext;
use crate::middleware::rate_limit::client_ip;
use crate::providers::AuthorizeUser;
use crate::services::AppState;

const CSRF_COOKIE: &str = "_thand_csrf";

fn acs_url(state: &AppState, provider: &str) -> String {
    format!(
        "{}/api/v1/auth/callback/{}",
        state.config.server.public_url.trim_end_matches('/'),
        provider
    )
}

fn session_cookie(name: &str, value: &str) -> HeaderValue {
    HeaderValue::from_str(&format!(
        "{}={}; HttpOnly; Secure; Max-Age={}; Path=/",
        name, value, COOKIE_MAX_AGE_SECS
    ))
    .unwrap_or_else(|_| HeaderValue::from_static(""))
}

fn expired_cookie(name: &str) -> HeaderValue {
    HeaderValue::from_str(&format!("{}=; HttpOnly; Secure; Max-Age=0; Path=/", name))
        .unwrap_or_else(|_| HeaderValue::from_static(""))
}

/// Reject callbacks that would loop straight back into the auth-request
/// surface on this host.
fn validate_callback(state: &AppState, callback: &str) -> Result<(), ServiceError> {
    if callback.is_empty() {
        return Ok(());
    }

    let own_host = host_of(&state.config.server.public_url);
    let (callback_host, callback_path) = split_url(callback);

    if callback_path.contains("/auth/request/")
        && (callback_host.is_empty() || callback_host == own_host)
    {
        return Err(ServiceError::Validation(
            "callback must not loop back to the auth request endpoint".to_string(),
        ));
    }
    Ok(())
}

fn host_of(url: &str) -> String {
    split_url(url).0
}

fn split_url(url: &str) -> (String, String) {
    match url.split_once("://") {
        Some((_, rest)) => match rest.split_once('/') {
            Some((host, path)) => (host.to_string(), format!("/{}", path)),
            None => (rest.to_string(), "/".to_string()),
        },
        None => (String::new(), url.to_string()),
    }
}

/// GET /auth — authenticator inventory and current session summary.
pub async fn auth_index(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> Json<serde_json::Value> {
    let sessions: Vec<serde_json::Value> = auth
        .found_sessions
        .iter()
        .map(|(provider, session)| {
            serde_json::json!({
                "provider": provider,
                "email": session.user.email,
                "expires_at": session.expires_at,
                "expired": session.is_expired(),
            })
        })
        .collect();

    Json(serde_json::json!({
        "authenticators": state.registry.authenticator_names(),
        "sessions": sessions,
        "active_provider": auth.active_provider,
    }))
}

#[derive(Debug, Deserialize)]
pub struct AuthRequestQuery {
    #[serde(default)]
    pub callback: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub client: Option<String>,
}

/// GET /auth/request/{provider} — SP-initiated start. Builds the sealed AUTH
/// state and bounces the browser to the provider's authorize URL.
pub async fn auth_request(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Query(query): Query<AuthRequestQuery>,
) -> ApiResult<Response> {
    state.metrics.record_auth();
    let callback = query.callback.unwrap_or_default();
    validate_callback(&state, &callback)?;

    let authorizer = state.registry.authorizer(&provider)?;

    let auth_state = AuthState {
        callback,
        client_id: query.client.unwrap_or_default(),
        provider: provider.clone(),
        code: query.code,
    };
    let sealed = Envelope::seal_payload(EnvelopeKind::Auth, &auth_state, &state.encryption)?;

    let response = authorizer
        .authorize_session(AuthorizeUser {
            scopes: Vec::new(),
            state: sealed,
            code: None,
            redirect_uri: acs_url(&state, &provider),
        })
        .await?;

    let mut redirect = Redirect::to(&response.url).into_response();

    // IdP-initiated SAML gets a single-use CSRF token to present later.
    let provider_config = state.registry.get(&provider)?;
    if provider_config.kind == "saml" && provider_config.config.get_bool("idp_initiated") {
        let token = state.csrf.issue();
        redirect
            .headers_mut()
            .append(header::SET_COOKIE, session_cookie(CSRF_COOKIE, &token));
    }

    Ok(redirect)
}

#[derive(Debug, Deserialize)]
pub struct OAuthCallbackQuery {
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
}

/// GET /auth/callback/{provider} — OAuth2 finish.
pub async fn auth_callback_oauth(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    Query(query): Query<OAuthCallbackQuery>,
) -> Response {
    state.metrics.record_auth();

    let result = async {
        let sealed = query
            .state
            .as_deref()
            .ok_or_else(|| ServiceError::InvalidState("missing state parameter".to_string()))?;
        let envelope = Envelope::open(sealed, &state.encryption)?;
        finish_authentication(&state, &provider, envelope, query.code.clone(), &headers).await
    }
    .await;

    match result {
        Ok(response) => response,
        Err(err) => {
            if wants_html(&headers) {
                html_error_response(&err)
            } else {
                ApiError(err).into_response()
            }
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SamlCallbackForm {
    #[serde(rename = "RelayState", default)]
    pub relay_state: Option<String>,
    #[serde(rename = "SAMLResponse", default)]
    pub saml_response: Option<String>,
}

/// POST /auth/callback/{provider} — SAML finish. Parameters are taken from
/// the POST form only; an empty RelayState is accepted only when the
/// provider allows IdP-initiated flows.
pub async fn auth_callback_saml(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    request: Request,
) -> Response {
    state.metrics.record_auth();

    let headers = request.headers().clone();
    let ip = client_ip(&request);
    if let Err(err) = state.saml_limiter.check(&ip) {
        return ApiError(err).into_response();
    }

    let result = async {
        let Form(form) = Form::<SamlCallbackForm>::from_request(request, &())
            .await
            .map_err(|_| ServiceError::Validation("malformed callback form".to_string()))?;

        let saml_response = form.saml_response.clone().ok_or_else(|| {
            ServiceError::Validation("SAMLResponse is required".to_string())
        })?;

        let envelope = match form.relay_state.as_deref().filter(|s| !s.is_empty()) {
            Some(relay) => Envelope::open(relay, &state.encryption)?,
            None => {
                // IdP-initiated: synthesize a default AUTH state, guarded by
                // the single-use CSRF token issued at request time.
                let provider_config = state.registry.get(&provider)?;
                if !provider_config.config.get_bool("idp_initiated") {
                    return Err(ServiceError::Validation(
                        "RelayState is required for SP-initiated flows".to_string(),
                    ));
                }
                let token = cookie_value(&headers, CSRF_COOKIE);
                let valid = token.map(|t| state.csrf.consume(&t)).unwrap_or(false);
                if !valid {
                    return Err(ServiceError::Forbidden(
                        "missing or stale CSRF token for IdP-initiated flow".to_string(),
                    ));
                }
                Envelope::new(
                    EnvelopeKind::Auth,
                    &AuthState {
                        callback: String::new(),
                        client_id: String::new(),
                        provider: provider.clone(),
                        code: None,
                    },
                )?
            }
        };

        finish_authentication(&state, &provider, envelope, Some(saml_response), &headers).await
    }
    .await;

    match result {
        Ok(response) => response,
        Err(err) => {
            if wants_html(&headers) {
                html_error_response(&err)
            } else {
                ApiError(err).into_response()
            }
        }
    }
}

/// Shared finish path: dispatch on the decrypted envelope kind, then create
/// the session. AUTH sets cookies and redirects; WORKFLOW_TASK resumes the
/// suspended elevation.
async fn finish_authentication(
    state: &AppState,
    provider: &str,
    envelope: Envelope,
    code: Option<String>,
    headers: &HeaderMap,
) -> Result<Response, ServiceError> {
    // Type dispatch comes first: an unexpected envelope kind is rejected
    // before any provider round trip.
    enum Dispatch {
        Auth(AuthState),
        Task(WorkflowTask),
    }
    let dispatch = match envelope.kind {
        EnvelopeKind::Auth => Dispatch::Auth(envelope.expect(EnvelopeKind::Auth)?),
        EnvelopeKind::WorkflowTask => {
            Dispatch::Task(envelope.expect(EnvelopeKind::WorkflowTask)?)
        }
        other => {
            return Err(ServiceError::InvalidStateType {
                expected: "AUTH or WORKFLOW_TASK".to_string(),
                actual: other.to_string(),
            })
        }
    };

    let authorizer = state.registry.authorizer(provider)?;
    let session = authorizer
        .create_session(AuthorizeUser {
            scopes: Vec::new(),
            state: String::new(),
            code,
            redirect_uri: acs_url(state, provider),
        })
        .await?;

    match dispatch {
        Dispatch::Auth(auth_state) => {
            if !auth_state.provider.is_empty() && auth_state.provider != provider {
                return Err(ServiceError::InvalidState(format!(
                    "state was issued for provider {}",
                    auth_state.provider
                )));
            }
            complete_session_flow(state, provider, &session, &auth_state, headers)
        }
        Dispatch::Task(mut task) => {
            task.user = Some(session.user.clone());
            task.authentication_provider = Some(provider.to_string());

            let view = state
                .runtime
                .resume_workflow(task)
                .map_err(ServiceError::from)?;
            tracing::info!(
                workflow_id = %view.workflow_id,
                email = %session.user.email,
                "Elevation resumed after authentication"
            );

            let mut response = if wants_html(headers) {
                Redirect::to(&format!("/api/v1/execution/{}", view.workflow_id)).into_response()
            } else {
                Json(serde_json::json!({
                    "workflow_id": view.workflow_id,
                    "status": view.status,
                }))
                .into_response()
            };
            attach_session_cookies(&mut response, state, provider, &session)?;
            Ok(response)
        }
    }
}

fn complete_session_flow(
    state: &AppState,
    provider: &str,
    session: &Session,
    auth_state: &AuthState,
    headers: &HeaderMap,
) -> Result<Response, ServiceError> {
    let mut response = if !auth_state.callback.is_empty() {
        // Agent bootstrap: hand the one-time code and the sealed session back
        // to the waiting callback.
        let target = match &auth_state.code {
            Some(code) => {
                let local = LocalSession::seal(session, &state.encryption)?;
                let sep = if auth_state.callback.contains('?') { '&' } else { '?' };
                format!(
                    "{}{}code={}&provider={}&session={}",
                    auth_state.callback,
                    sep,
                    urlencoding::encode(code),
                    urlencoding::encode(provider),
                    urlencoding::encode(&local.encode()?),
                )
            }
            None => auth_state.callback.clone(),
        };
        Redirect::to(&target).into_response()
    } else if wants_html(headers) {
        let body = format!(
            "<!DOCTYPE html><html><head><title>Signed in</title></head>\
             <body><h1>Signed in</h1><p>Authenticated as {} via {}. You can \
             close this window.</p></body></html>",
            crate::error::html_escape(&session.user.email),
            crate::error::html_escape(provider),
        );
        (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
            body,
        )
            .into_response()
    } else {
        Json(serde_json::json!({
            "provider": provider,
            "email": session.user.email,
            "expires_at": session.expires_at,
        }))
        .into_response()
    };

    attach_session_cookies(&mut response, state, provider, session)?;
    tracing::info!(provider = %provider, email = %session.user.email, "Session established");
    Ok(response)
}

fn attach_session_cookies(
    response: &mut Response,
    state: &AppState,
    provider: &str,
    session: &Session,
) -> Result<(), ServiceError> {
    let local = LocalSession::seal(session, &state.encryption)?;
    let encoded = local.encode()?;

    let headers = response.headers_mut();
    headers.append(
        header::SET_COOKIE,
        session_cookie(&provider_cookie_name(provider), &encoded),
    );
    headers.append(header::SET_COOKIE, session_cookie(COOKIE_PRIMARY, provider));
    Ok(())
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    for cookie_header in headers.get_all(header::COOKIE) {
        let raw = cookie_header.to_str().ok()?;
        for pair in raw.split(';') {
            if let Some((n, v)) = pair.trim().split_once('=') {
                if n == name {
                    return Some(v.to_string());
                }
            }
        }
    }
    None
}

/// GET /auth/logout and /auth/logout/{provider} — expire session cookies.
pub async fn logout(
    State(_state): State<AppState>,
    provider: Option<Path<String>>,
) -> Response {
    let mut response = Json(serde_json::json!({"logged_out": true})).into_response();
    let headers = response.headers_mut();

    match provider {
        Some(Path(provider)) => {
            headers.append(
                header::SET_COOKIE,
                expired_cookie(&provider_cookie_name(&provider)),
            );
        }
        None => {
            headers.append(header::SET_COOKIE, expired_cookie(COOKIE_PRIMARY));
        }
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_url() {
        assert_eq!(
            split_url("https://thand.example.com/api/v1/auth/request/okta"),
            (
                "thand.example.com".to_string(),
                "/api/v1/auth/request/okta".to_string()
            )
        );
        assert_eq!(split_url("/local/path"), (String::new(), "/local/path".to_string()));
    }

    #[test]
    fn test_cookie_header_shape() {
        let cookie = session_cookie("_thand_okta", "abc");
        let value = cookie.to_str().unwrap();
        assert!(value.contains("HttpOnly"));
        assert!(value.contains("Secure"));
        assert!(value.contains("Max-Age=604800"));
        assert!(value.contains("Path=/"));
    }
}
