// Workflow execution surfaces: listing, status, signals, cancellation

use axum::extract::{Extension, Path, Query, State};
use axum::response::Json;
use serde::Deserialize;
use std::time::Duration;

use thand_shared::envelope::{Envelope, EnvelopeKind};
use thand_shared::workflow::{attributes, signals, WorkflowExecutionView, WorkflowSignal};
use thand_shared::ServiceError;

use crate::error::ApiResult;
use crate::middleware::auth::{require_identity, AuthContext};
use crate::services::AppState;

/// Budget for live state queries against a running workflow.
const QUERY_TIMEOUT: Duration = Duration::from_secs(2);

fn view_user(view: &WorkflowExecutionView) -> Option<&str> {
    view.search_attributes
        .get(attributes::USER)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
}

/// Only the identity matching the execution's `user` search attribute may
/// operate on it.
fn require_owner(state: &AppState, auth: &AuthContext, workflow_id: &str) -> ApiResult<()> {
    let identity = require_identity(auth)?;
    let view = state.runtime.get_workflow(workflow_id)?;

    match view_user(&view) {
        Some(owner) if owner == identity.email => Ok(()),
        Some(_) => Err(ServiceError::Forbidden(format!(
            "{} does not own this execution",
            identity.email
        ))
        .into()),
        None => Err(ServiceError::Forbidden(
            "execution has no recorded owner".to_string(),
        )
        .into()),
    }
}

/// GET /executions — the requester's workflows, newest first.
pub async fn list_executions(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> ApiResult<Json<serde_json::Value>> {
    let identity = require_identity(&auth)?;

    let executions: Vec<serde_json::Value> = state
        .runtime
        .list_workflows()
        .into_iter()
        .filter(|view| view_user(view) == Some(identity.email.as_str()))
        .map(summarize)
        .collect();

    Ok(Json(serde_json::json!({ "executions": executions })))
}

fn summarize(view: WorkflowExecutionView) -> serde_json::Value {
    serde_json::json!({
        "workflow_id": view.workflow_id,
        "workflow_name": view.workflow_name,
        "status": view.status,
        "task": view.task.task_reference,
        "role": view.task.role,
        "approved": view.task.approved,
        "started_at": view.started_at,
    })
}

/// GET /execution/{id} — status view. Running instances are queried live
/// within a 2s budget; failed instances expose the structured failure chain;
/// completed instances return their final output.
pub async fn get_execution(
    State(state): State<AppState>,
    Path(workflow_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let view = state
        .runtime
        .query_workflow(&workflow_id, QUERY_TIMEOUT)
        .await?;

    Ok(Json(serde_json::json!({
        "workflow_id": view.workflow_id,
        "workflow_name": view.workflow_name,
        "status": view.status,
        "task": view.task,
        "search_attributes": view.search_attributes,
        "output": view.output,
        "failure": view.failure,
        "started_at": view.started_at,
    })))
}

#[derive(Debug, Deserialize)]
pub struct SignalQuery {
    pub input: String,
}

/// GET /execution/{id}/signal?input=<sealed WORKFLOW_SIGNAL envelope>. The
/// CloudEvent's `user` extension names the signer; an authenticated session
/// must agree with it.
pub async fn signal_execution(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(workflow_id): Path<String>,
    Query(query): Query<SignalQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let mut signal: WorkflowSignal =
        Envelope::open_payload(&query.input, EnvelopeKind::WorkflowSignal, &state.encryption)?;

    match require_identity(&auth) {
        Ok(identity) => match &signal.user {
            Some(signer) if signer != &identity.email => {
                return Err(ServiceError::Forbidden(format!(
                    "signal signed for {} but session belongs to {}",
                    signer, identity.email
                ))
                .into());
            }
            _ => signal.user = Some(identity.email),
        },
        // No session: the sealed envelope itself must carry the signer.
        Err(_) if signal.user.is_none() => {
            return Err(
                ServiceError::Unauthorized("signal carries no signer identity".to_string()).into(),
            );
        }
        Err(_) => {}
    }

    if signal.event_type == signals::CANCEL {
        require_owner(&state, &auth, &workflow_id)?;
        state.runtime.cancel_workflow(&workflow_id, Some("cancel signal".to_string()))?;
    } else {
        state.runtime.signal_workflow(&workflow_id, signal)?;
    }

    Ok(Json(serde_json::json!({"delivered": true})))
}

/// GET /execution/{id}/cancel — graceful cancellation, owner-only. During
/// the active window this triggers an immediate revoke pass.
pub async fn cancel_execution(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(workflow_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    require_owner(&state, &auth, &workflow_id)?;
    state
        .runtime
        .cancel_workflow(&workflow_id, Some("requested by owner".to_string()))?;
    Ok(Json(serde_json::json!({"cancelled": true})))
}

/// GET /execution/{id}/terminate — forcible end, owner-only.
pub async fn terminate_execution(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(workflow_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    require_owner(&state, &auth, &workflow_id)?;
    state
        .runtime
        .terminate_workflow(&workflow_id, "terminated by owner")?;
    Ok(Json(serde_json::json!({"terminated": true})))
}
