// Elevation submission, resume and natural-language derivation

use axum::extract::{Extension, FromRequest, Query, Request, State};
use axum::http::header;
use axum::response::Json;
use serde::Deserialize;
use std::time::Duration;

use thand_shared::auth::LocalSession;
use thand_shared::envelope::{Envelope, EnvelopeKind};
use thand_shared::workflow::{attributes, SearchAttributes, WorkflowTask};
use thand_shared::ServiceError;

use crate::elevation::{ElevateRequest, ElevationInput, ELEVATION_WORKFLOW};
use crate::error::ApiResult;
use crate::middleware::auth::{select_session, AuthContext};
use crate::services::AppState;

/// How long the submit handler waits for the workflow to reach a reportable
/// state (suspended with a redirect, waiting for approval, or terminal).
const SUBMIT_WAIT_BUDGET: Duration = Duration::from_secs(2);

/// Flat form/query shape for elevation submissions. List fields arrive as
/// comma-separated strings.
#[derive(Debug, Default, Deserialize)]
pub struct ElevateForm {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub providers: Option<String>,
    #[serde(default)]
    pub identities: Option<String>,
    #[serde(default)]
    pub authenticator: Option<String>,
    #[serde(default)]
    pub workflow: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub duration: Option<String>,
    #[serde(default)]
    pub permissions: Option<String>,
    #[serde(default)]
    pub inherits: Option<String>,
}

fn split_list(value: Option<String>) -> Vec<String> {
    value
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

impl From<ElevateForm> for ElevateRequest {
    fn from(form: ElevateForm) -> Self {
        ElevateRequest {
            role: form.role,
            provider: form.provider,
            providers: split_list(form.providers),
            identities: split_list(form.identities),
            authenticator: form.authenticator,
            workflow: form.workflow,
            reason: form.reason,
            duration: form.duration,
            permissions: split_list(form.permissions),
            inherits: split_list(form.inherits),
            scopes: None,
            session: None,
        }
    }
}

/// POST /elevate — JSON, form or multipart.
pub async fn elevate_post(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    request: Request,
) -> ApiResult<Json<serde_json::Value>> {
    let content_type = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let elevate_request = if content_type.starts_with("application/json") {
        let Json(parsed) = Json::<ElevateRequest>::from_request(request, &())
            .await
            .map_err(|e| ServiceError::Validation(format!("malformed JSON body: {}", e)))?;
        parsed
    } else if content_type.starts_with("multipart/form-data") {
        let mut multipart = axum::extract::Multipart::from_request(request, &())
            .await
            .map_err(|e| ServiceError::Validation(format!("malformed multipart body: {}", e)))?;
        let mut form = ElevateForm::default();
        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| ServiceError::Validation(e.to_string()))?
        {
            let name = field.name().unwrap_or_default().to_string();
            let value = field
                .text()
                .await
                .map_err(|e| ServiceError::Validation(e.to_string()))?;
            match name.as_str() {
                "role" => form.role = Some(value),
                "provider" => form.provider = Some(value),
                "providers" => form.providers = Some(value),
                "identities" => form.identities = Some(value),
                "authenticator" => form.authenticator = Some(value),
                "workflow" => form.workflow = Some(value),
                "reason" => form.reason = Some(value),
                "duration" => form.duration = Some(value),
                "permissions" => form.permissions = Some(value),
                "inherits" => form.inherits = Some(value),
                _ => {}
            }
        }
        form.into()
    } else {
        let axum::Form(form) = axum::Form::<ElevateForm>::from_request(request, &())
            .await
            .map_err(|e| ServiceError::Validation(format!("malformed form body: {}", e)))?;
        form.into()
    };

    submit_elevation(state, auth, elevate_request).await
}

/// GET /elevate?role&provider&reason&duration — static shortcut.
pub async fn elevate_get(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Query(form): Query<ElevateForm>,
) -> ApiResult<Json<serde_json::Value>> {
    submit_elevation(state, auth, form.into()).await
}

async fn submit_elevation(
    state: AppState,
    auth: AuthContext,
    request: ElevateRequest,
) -> ApiResult<Json<serde_json::Value>> {
    state.metrics.record_elevate();
    let mut request = request.normalize();

    let resolved = state.catalog.resolve(&request)?;

    // Session selection: explicit authenticator override first, then the
    // role's allowed list.
    let nominated: Vec<String> = match &request.authenticator {
        Some(authenticator) => vec![authenticator.clone()],
        None => resolved.role.authenticators.clone(),
    };
    let requester = match select_session(&auth, &nominated) {
        Ok((_, session)) if !session.is_expired() => {
            // Carry an encrypted snapshot of the requester's session.
            request.session = LocalSession::seal(&session, &state.encryption)
                .ok()
                .and_then(|l| l.encode().ok());
            Some(session.user)
        }
        _ => None,
    };

    let mut search_attributes = SearchAttributes::new();
    search_attributes.insert(
        attributes::USER.to_string(),
        serde_json::Value::String(
            requester.as_ref().map(|u| u.email.clone()).unwrap_or_default(),
        ),
    );
    search_attributes.insert(
        attributes::ROLE.to_string(),
        serde_json::Value::String(resolved.role.name.clone()),
    );
    search_attributes.insert(
        attributes::WORKFLOW.to_string(),
        serde_json::Value::String(
            resolved.policy.as_ref().map(|p| p.name.clone()).unwrap_or_default(),
        ),
    );
    search_attributes.insert(
        attributes::TASK.to_string(),
        serde_json::Value::String(String::new()),
    );
    search_attributes.insert(
        attributes::STATUS.to_string(),
        serde_json::Value::String("pending".to_string()),
    );
    search_attributes.insert(attributes::APPROVED.to_string(), serde_json::Value::Null);
    search_attributes.insert(
        attributes::REASON.to_string(),
        serde_json::Value::String(request.reason.clone().unwrap_or_default()),
    );
    search_attributes.insert(
        attributes::DURATION.to_string(),
        serde_json::Value::String(request.duration.clone().unwrap_or_default()),
    );
    search_attributes.insert(
        attributes::IDENTITIES.to_string(),
        serde_json::json!(request.identities),
    );
    search_attributes.insert(
        attributes::PROVIDERS.to_string(),
        serde_json::json!(resolved.role.providers),
    );

    let input = ElevationInput {
        request,
        role: resolved.role,
        policy: resolved.policy,
        requester,
        duration_secs: resolved.duration.as_secs(),
    };

    let view = state.runtime.start_workflow(
        ELEVATION_WORKFLOW,
        None,
        serde_json::to_value(&input).map_err(ServiceError::from)?,
        search_attributes,
    )?;
    let workflow_id = view.workflow_id.clone();

    // Give the workflow a moment to reach a reportable state so the caller
    // gets either the auth redirect or the waiting status in one round trip.
    let deadline = tokio::time::Instant::now() + SUBMIT_WAIT_BUDGET;
    let view = loop {
        let view = state.runtime.get_workflow(&workflow_id)?;
        let has_redirect = view
            .task
            .context
            .get("redirect_url")
            .and_then(|v| v.as_str())
            .is_some();
        let settled = view.status.is_terminal()
            || has_redirect
            || matches!(
                view.status,
                thand_shared::workflow::WorkflowStatus::Waiting
                    | thand_shared::workflow::WorkflowStatus::Suspended
            );
        if settled || tokio::time::Instant::now() >= deadline {
            break view;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    };

    let redirect_url = view
        .task
        .context
        .get("redirect_url")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    Ok(Json(serde_json::json!({
        "workflow_id": view.workflow_id,
        "status": view.status,
        "task": view.task.task_reference,
        "approved": view.task.approved,
        "redirect_url": redirect_url,
    })))
}

#[derive(Debug, Deserialize)]
pub struct ResumeQuery {
    pub state: String,
}

/// GET/POST /elevate/resume?state — decode the task envelope and resume the
/// suspended execution.
pub async fn elevate_resume(
    State(state): State<AppState>,
    Query(query): Query<ResumeQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let task: WorkflowTask =
        Envelope::open_payload(&query.state, EnvelopeKind::WorkflowTask, &state.encryption)?;

    let view = state.runtime.resume_workflow(task)?;
    Ok(Json(serde_json::json!({
        "workflow_id": view.workflow_id,
        "status": view.status,
        "task": view.task.task_reference,
    })))
}

#[derive(Debug, Deserialize)]
pub struct LlmElevateRequest {
    pub input: String,
}

/// GET/POST /elevate/llm — turn a natural-language request into a structured
/// elevation shape. The caller decides whether to submit it.
pub async fn elevate_llm_post(
    State(state): State<AppState>,
    Json(request): Json<LlmElevateRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    derive_llm_request(state, request.input).await
}

pub async fn elevate_llm_get(
    State(state): State<AppState>,
    Query(request): Query<LlmElevateRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    derive_llm_request(state, request.input).await
}

async fn derive_llm_request(
    state: AppState,
    input: String,
) -> ApiResult<Json<serde_json::Value>> {
    let llm = state
        .llm
        .as_ref()
        .ok_or_else(|| ServiceError::NotConfigured("llm service".to_string()))?;

    let derived = llm
        .derive_request(&input, &state.catalog, &state.registry)
        .await?;
    Ok(Json(serde_json::json!({ "request": derived, "submitted": false })))
}
