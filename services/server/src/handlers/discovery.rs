// Discovery surfaces backing the approval UI and the CLI

use axum::extract::{Query, State};
use axum::response::Json;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::ApiResult;
use crate::providers::Identity;
use crate::services::AppState;

pub async fn list_roles(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "roles": state.catalog.roles() }))
}

pub async fn list_workflows(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "workflows": state.catalog.workflows() }))
}

pub async fn list_providers(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "providers": state.registry.list() }))
}

#[derive(Debug, Deserialize)]
pub struct IdentityQuery {
    #[serde(default)]
    pub filter: Option<String>,
}

/// Merge identities across every provider carrying the capability.
pub async fn list_identities(
    State(state): State<AppState>,
    Query(query): Query<IdentityQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let providers = state.registry.identity_providers();
    let filter = query.filter.clone();
    let results = futures::future::join_all(providers.iter().map(|(name, provider)| {
        let filter = filter.clone();
        async move { (name.clone(), provider.list_identities(filter.as_deref()).await) }
    }))
    .await;

    let mut identities: Vec<Identity> = Vec::new();
    for (name, result) in results {
        match result {
            Ok(mut found) => identities.append(&mut found),
            Err(e) => {
                tracing::warn!(provider = %name, error = %e, "Identity listing failed");
            }
        }
    }
    identities.sort_by(|a, b| a.email.cmp(&b.email));
    identities.dedup_by(|a, b| a.email == b.email && a.kind == b.kind);

    Ok(Json(serde_json::json!({ "identities": identities })))
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    #[serde(default)]
    pub client: Option<String>,
}

/// Device registration: hand back a stable client identifier for the auth
/// state round-trip.
pub async fn register(
    State(_state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> Json<serde_json::Value> {
    let client_id = request
        .client
        .filter(|c| !c.is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    Json(serde_json::json!({ "client": client_id }))
}
