// End-to-end elevation tests: submit → approve → bind → active → revoke,
// against a stateful IAM-style API double.

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tower::ServiceExt;
use wiremock::{Mock, MockServer, Respond, ResponseTemplate};

use thand_server::routes::create_versioned_routes;
use thand_server::services::{AppState, Services};
use thand_shared::auth::{LocalSession, Session};
use thand_shared::config::ProviderSettings;
use thand_shared::envelope::{Envelope, EnvelopeKind};
use thand_shared::workflow::{signals, WorkflowSignal};
use thand_shared::{AppConfig, Role, UserIdentity, WorkflowPolicy};

/// Stateful IAM policy shared between the get/set endpoints of the mock.
#[derive(Clone)]
struct PolicyStore(Arc<Mutex<serde_json::Value>>);

impl PolicyStore {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(
            serde_json::json!({"version": 3, "bindings": []}),
        )))
    }

    fn bindings(&self) -> Vec<serde_json::Value> {
        self.0.lock().unwrap()["bindings"]
            .as_array()
            .cloned()
            .unwrap_or_default()
    }

    fn managed_bindings(&self) -> Vec<serde_json::Value> {
        self.bindings()
            .into_iter()
            .filter(|b| b["condition"]["title"] == "managed-by-thand")
            .collect()
    }
}

struct PolicyRead(PolicyStore);

impl Respond for PolicyRead {
    fn respond(&self, _request: &wiremock::Request) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(self.0 .0.lock().unwrap().clone())
    }
}

struct PolicyWrite(PolicyStore);

impl Respond for PolicyWrite {
    fn respond(&self, request: &wiremock::Request) -> ResponseTemplate {
        let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
        *self.0 .0.lock().unwrap() = body["policy"].clone();
        ResponseTemplate::new(200).set_body_json(serde_json::json!({}))
    }
}

async fn iam_mock(policy: PolicyStore) -> MockServer {
    let mock = MockServer::start().await;

    Mock::given(wiremock::matchers::method("POST"))
        .and(wiremock::matchers::path("/v1/projects/acme-prod:getIamPolicy"))
        .respond_with(PolicyRead(policy.clone()))
        .mount(&mock)
        .await;

    Mock::given(wiremock::matchers::method("POST"))
        .and(wiremock::matchers::path("/v1/projects/acme-prod:setIamPolicy"))
        .respond_with(PolicyWrite(policy.clone()))
        .mount(&mock)
        .await;

    // Custom role creation and lookup for dynamic elevations.
    Mock::given(wiremock::matchers::method("POST"))
        .and(wiremock::matchers::path("/v1/projects/acme-prod/roles"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "name": "projects/acme-prod/roles/created",
            "title": "created",
        })))
        .mount(&mock)
        .await;
    Mock::given(wiremock::matchers::method("GET"))
        .and(wiremock::matchers::path_regex(
            r"^/v1/projects/acme-prod/roles/.+$",
        ))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "name": "projects/acme-prod/roles/found",
            "title": "found",
            "includedPermissions": ["storage.objects.get"],
        })))
        .mount(&mock)
        .await;

    mock
}

fn config_with_gcp(iam_base: &str) -> AppConfig {
    let dir = tempfile::tempdir().unwrap();
    let mut config = AppConfig::default();
    config.data_dir = dir.path().to_path_buf();
    std::mem::forget(dir);

    config.login_server = "https://login.corp.example.com".to_string();
    config.server_secret = "rotated-secret".to_string();
    config.server.public_url = "https://thand.example.com".to_string();

    config.providers.insert(
        "gcp-prod".to_string(),
        ProviderSettings {
            kind: "gcp".to_string(),
            options: HashMap::from([
                ("project".to_string(), "acme-prod".to_string()),
                ("api_base_url".to_string(), iam_base.to_string()),
                ("access_token".to_string(), "test-token".to_string()),
            ]),
        },
    );

    let mut readonly = Role::named("readonly");
    readonly.inherits = vec!["roles/viewer".to_string()];
    readonly.providers = vec!["gcp-prod".to_string()];
    readonly.workflows = vec!["default-approval".to_string()];
    config.roles.insert("readonly".to_string(), readonly);

    config.workflows.insert(
        "default-approval".to_string(),
        WorkflowPolicy {
            name: "default-approval".to_string(),
            approvers: vec!["secops@example.com".to_string()],
            notifiers: vec![],
            approval_timeout_secs: 3600,
        },
    );
    config
}

fn bearer_for(state: &AppState, email: &str) -> String {
    let mut user = UserIdentity::from_email(email);
    user.source = "okta".to_string();
    let session = Session::new(
        user,
        "at".to_string(),
        Utc::now() + ChronoDuration::hours(1),
    );
    let local = LocalSession::seal(&session, &state.encryption).unwrap();
    format!("Bearer {}", local.encode().unwrap())
}

async fn submit(app: &Router, bearer: &str, body: serde_json::Value) -> serde_json::Value {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/v1/elevate")
                .header(header::AUTHORIZATION, bearer)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), 256 * 1024)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn get_execution(app: &Router, id: &str) -> serde_json::Value {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/api/v1/execution/{}", id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), 256 * 1024)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn approve(app: &Router, state: &AppState, id: &str, approver: &str, approved: bool) {
    let signal = {
        let mut s = WorkflowSignal::new(
            signals::APPROVAL,
            "/approvals",
            serde_json::json!({ "approved": approved }),
        );
        s.user = Some(approver.to_string());
        s
    };
    let sealed =
        Envelope::seal_payload(EnvelopeKind::WorkflowSignal, &signal, &state.encryption).unwrap();

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!(
                    "/api/v1/execution/{}/signal?input={}",
                    id,
                    urlencoding::encode(&sealed)
                ))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

async fn wait_for_status(app: &Router, id: &str, status: &str, max_secs: u64) -> serde_json::Value {
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(max_secs);
    loop {
        let view = get_execution(app, id).await;
        if view["status"] == status {
            return view;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!(
                "execution {} never reached {}; last view: {}",
                id, status, view
            );
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
}

#[tokio::test]
async fn test_static_elevation_binds_then_revokes() {
    let policy = PolicyStore::new();
    let iam = iam_mock(policy.clone()).await;
    let state = Services::build(config_with_gcp(&iam.uri())).await.unwrap();
    let app = create_versioned_routes(state.clone());
    let bearer = bearer_for(&state, "dev@example.com");

    let submitted = submit(
        &app,
        &bearer,
        serde_json::json!({
            "role": "readonly",
            "providers": ["gcp-prod"],
            "reason": "debug prod incident",
            "duration": "PT1S",
        }),
    )
    .await;
    let id = submitted["workflow_id"].as_str().unwrap().to_string();

    // Suspended awaiting approval; nothing bound yet.
    assert_eq!(submitted["status"], "waiting");
    assert!(policy.managed_bindings().is_empty());

    approve(&app, &state, &id, "secops@example.com", true).await;

    // Bind happens-before active-sleep happens-before revoke; after the 1s
    // window everything managed is gone again.
    let view = wait_for_status(&app, &id, "completed", 20).await;
    let output = &view["output"];
    assert_eq!(output["approved"], true);
    assert_eq!(output["approved_by"], "secops@example.com");
    assert_eq!(output["grants"][0]["grant"]["roles"][0], "roles/viewer");
    assert_eq!(output["grants"][0]["grant"]["user_id"], "user:dev@example.com");
    assert!(output["revoked_at"].is_string());

    assert!(
        policy.managed_bindings().is_empty(),
        "revocation must remove every managed binding: {:?}",
        policy.bindings()
    );
}

#[tokio::test]
async fn test_rejected_elevation_never_binds() {
    let policy = PolicyStore::new();
    let iam = iam_mock(policy.clone()).await;
    let state = Services::build(config_with_gcp(&iam.uri())).await.unwrap();
    let app = create_versioned_routes(state.clone());
    let bearer = bearer_for(&state, "dev@example.com");

    let submitted = submit(
        &app,
        &bearer,
        serde_json::json!({
            "role": "readonly",
            "reason": "poking around",
            "duration": "PT1H",
        }),
    )
    .await;
    let id = submitted["workflow_id"].as_str().unwrap().to_string();

    approve(&app, &state, &id, "secops@example.com", false).await;

    let view = wait_for_status(&app, &id, "completed", 10).await;
    assert_eq!(view["output"]["approved"], false);
    assert_eq!(view["task"]["task_reference"], "reject");
    assert!(policy.bindings().is_empty());
}

#[tokio::test]
async fn test_self_approval_signal_is_ignored() {
    let policy = PolicyStore::new();
    let iam = iam_mock(policy.clone()).await;
    let mut config = config_with_gcp(&iam.uri());
    // Allow anyone as approver so only the self-approval rule applies.
    config
        .workflows
        .get_mut("default-approval")
        .unwrap()
        .approvers
        .clear();
    let state = Services::build(config).await.unwrap();
    let app = create_versioned_routes(state.clone());
    let bearer = bearer_for(&state, "dev@example.com");

    let submitted = submit(
        &app,
        &bearer,
        serde_json::json!({
            "role": "readonly",
            "reason": "debug",
            "duration": "PT1S",
        }),
    )
    .await;
    let id = submitted["workflow_id"].as_str().unwrap().to_string();

    // The requester's own approval is ignored; the execution keeps waiting.
    approve(&app, &state, &id, "dev@example.com", true).await;
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    let view = get_execution(&app, &id).await;
    assert_eq!(view["status"], "waiting");

    // A different signer resolves it.
    approve(&app, &state, &id, "other@example.com", true).await;
    wait_for_status(&app, &id, "completed", 20).await;
}

#[tokio::test]
async fn test_dynamic_elevation_materializes_custom_role() {
    let policy = PolicyStore::new();
    let iam = iam_mock(policy.clone()).await;
    let state = Services::build(config_with_gcp(&iam.uri())).await.unwrap();
    let app = create_versioned_routes(state.clone());
    let bearer = bearer_for(&state, "dev@example.com");

    let submitted = submit(
        &app,
        &bearer,
        serde_json::json!({
            "permissions": ["storage.objects.get"],
            "providers": ["gcp-prod"],
            "workflow": "default-approval",
            "reason": "storage audit",
            "duration": "PT1S",
        }),
    )
    .await;
    let id = submitted["workflow_id"].as_str().unwrap().to_string();

    approve(&app, &state, &id, "secops@example.com", true).await;
    let view = wait_for_status(&app, &id, "completed", 20).await;

    let role_name = view["output"]["role"].as_str().unwrap();
    assert!(role_name.starts_with("dynamic-role-"));
    let bound = view["output"]["grants"][0]["grant"]["roles"][0]
        .as_str()
        .unwrap();
    assert!(bound.starts_with("projects/acme-prod/roles/dynamic_role_"));
    assert!(policy.managed_bindings().is_empty());
}

#[tokio::test]
async fn test_owner_gating_on_cancel() {
    let policy = PolicyStore::new();
    let iam = iam_mock(policy.clone()).await;
    let state = Services::build(config_with_gcp(&iam.uri())).await.unwrap();
    let app = create_versioned_routes(state.clone());
    let owner = bearer_for(&state, "dev@example.com");
    let attacker = bearer_for(&state, "mallory@example.com");

    let submitted = submit(
        &app,
        &owner,
        serde_json::json!({
            "role": "readonly",
            "reason": "debug",
            "duration": "PT1H",
        }),
    )
    .await;
    let id = submitted["workflow_id"].as_str().unwrap().to_string();

    // A different identity may not cancel.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/api/v1/execution/{}/cancel", id))
                .header(header::AUTHORIZATION, &attacker)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    // Nor may an anonymous caller.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/api/v1/execution/{}/cancel", id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // The owner may.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/api/v1/execution/{}/cancel", id))
                .header(header::AUTHORIZATION, &owner)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    wait_for_status(&app, &id, "cancelled", 10).await;
}

#[tokio::test]
async fn test_cancel_during_active_revokes_immediately() {
    let policy = PolicyStore::new();
    let iam = iam_mock(policy.clone()).await;
    let state = Services::build(config_with_gcp(&iam.uri())).await.unwrap();
    let app = create_versioned_routes(state.clone());
    let bearer = bearer_for(&state, "dev@example.com");

    let submitted = submit(
        &app,
        &bearer,
        serde_json::json!({
            "role": "readonly",
            "reason": "long lived grant",
            "duration": "PT1H",
        }),
    )
    .await;
    let id = submitted["workflow_id"].as_str().unwrap().to_string();

    approve(&app, &state, &id, "secops@example.com", true).await;

    // Wait for the binding to land (ACTIVE window).
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(10);
    while policy.managed_bindings().is_empty() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "binding never appeared"
        );
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }

    // Cancel cuts the hour-long sleep short and revokes right away.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/api/v1/execution/{}/cancel", id))
                .header(header::AUTHORIZATION, &bearer)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    wait_for_status(&app, &id, "cancelled", 10).await;
    assert!(policy.managed_bindings().is_empty());
}

#[tokio::test]
async fn test_executions_listing_is_scoped_to_requester() {
    let policy = PolicyStore::new();
    let iam = iam_mock(policy.clone()).await;
    let state = Services::build(config_with_gcp(&iam.uri())).await.unwrap();
    let app = create_versioned_routes(state.clone());
    let dev = bearer_for(&state, "dev@example.com");
    let other = bearer_for(&state, "other@example.com");

    submit(
        &app,
        &dev,
        serde_json::json!({
            "role": "readonly",
            "reason": "debug",
            "duration": "PT1H",
        }),
    )
    .await;

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/v1/executions")
                .header(header::AUTHORIZATION, &other)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), 64 * 1024)
        .await
        .unwrap();
    let parsed: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(parsed["executions"].as_array().unwrap().len(), 0);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/v1/executions")
                .header(header::AUTHORIZATION, &dev)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let bytes = axum::body::to_bytes(response.into_body(), 64 * 1024)
        .await
        .unwrap();
    let parsed: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(parsed["executions"].as_array().unwrap().len(), 1);
}
