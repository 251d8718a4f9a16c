use axum::extract::{Request, State};
use axum::http::header;
use axum::middleware::Next;
use axum::response::Response;
use std::collections::HashMap;

use thand_shared::auth::{LocalSession, Session, COOKIE_PRIMARY};
use thand_shared::crypto::EncryptionService;
use thand_shared::{Result, ServiceError};

use crate::services::AppState;

/// Sessions recovered from the request, keyed by provider. Built from, in
/// order: provider cookies, `Authorization: Bearer`, `X-API-Key`.
#[derive(Debug, Clone, Default)]
pub struct AuthContext {
    pub found_sessions: HashMap<String, Session>,
    /// Provider named by the primary cookie's active-provider attribute.
    pub active_provider: Option<String>,
}

impl AuthContext {
    pub fn is_empty(&self) -> bool {
        self.found_sessions.is_empty()
    }
}

pub async fn auth_context_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let context = extract_auth_context(request.headers(), &state.encryption);
    request.extensions_mut().insert(context);
    next.run(request).await
}

/// Build the found-sessions map from every source the request matches.
pub fn extract_auth_context(
    headers: &axum::http::HeaderMap,
    encryption: &EncryptionService,
) -> AuthContext {
    let mut context = AuthContext::default();

    // 1. Provider cookies.
    for cookie_header in headers.get_all(header::COOKIE) {
        let Ok(raw) = cookie_header.to_str() else {
            continue;
        };
        for pair in raw.split(';') {
            let Some((name, value)) = pair.trim().split_once('=') else {
                continue;
            };
            if name == COOKIE_PRIMARY {
                context.active_provider = Some(value.to_string());
                continue;
            }
            if let Some(provider) = name.strip_prefix(&format!("{}_", COOKIE_PRIMARY)) {
                if let Some(session) = open_local_session(value, encryption) {
                    context
                        .found_sessions
                        .insert(provider.to_string(), session);
                }
            }
        }
    }

    // 2. Bearer token carrying an encoded LocalSession.
    if let Some(auth) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        if let Some(token) = auth.strip_prefix("Bearer ") {
            if let Some(session) = open_local_session(token.trim(), encryption) {
                context
                    .found_sessions
                    .entry(session.user.source.clone())
                    .or_insert(session);
            }
        }
    }

    // 3. X-API-Key, same wire form.
    if let Some(key) = headers.get("X-API-Key").and_then(|v| v.to_str().ok()) {
        if let Some(session) = open_local_session(key.trim(), encryption) {
            context
                .found_sessions
                .entry(session.user.source.clone())
                .or_insert(session);
        }
    }

    context
}

fn open_local_session(token: &str, encryption: &EncryptionService) -> Option<Session> {
    let local = LocalSession::decode(token).ok()?;
    local.open(encryption).ok()
}

/// Pick the session to act as. When the request nominates authenticators
/// (role's allowed list or explicit override), the first non-expired
/// nominated session wins, then the first nominated even if expired.
/// Otherwise the active-provider cookie decides, then the latest expiry.
pub fn select_session(context: &AuthContext, nominated: &[String]) -> Result<(String, Session)> {
    if !nominated.is_empty() {
        for name in nominated {
            if let Some(session) = context.found_sessions.get(name) {
                if !session.is_expired() {
                    return Ok((name.clone(), session.clone()));
                }
            }
        }
        for name in nominated {
            if let Some(session) = context.found_sessions.get(name) {
                return Ok((name.clone(), session.clone()));
            }
        }
        return Err(ServiceError::Unauthorized(format!(
            "no session for any nominated authenticator: {:?}",
            nominated
        )));
    }

    if let Some(active) = &context.active_provider {
        if let Some(session) = context.found_sessions.get(active) {
            return Ok((active.clone(), session.clone()));
        }
    }

    context
        .found_sessions
        .iter()
        .max_by_key(|(_, session)| session.expires_at)
        .map(|(name, session)| (name.clone(), session.clone()))
        .ok_or_else(|| ServiceError::Unauthorized("no usable session".to_string()))
}

/// The requester's identity, from whichever session selection yields.
pub fn require_identity(context: &AuthContext) -> Result<thand_shared::UserIdentity> {
    let (_, session) = select_session(context, &[])?;
    if session.is_expired() {
        return Err(ServiceError::Unauthorized("session expired".to_string()));
    }
    Ok(session.user)
}
