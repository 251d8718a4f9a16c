// Integration tests for the authentication gateway and HTTP façade

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use tower::ServiceExt;

use thand_server::routes::create_versioned_routes;
use thand_server::services::{AppState, Services};
use thand_shared::auth::AuthState;
use thand_shared::config::ProviderSettings;
use thand_shared::envelope::{Envelope, EnvelopeKind};
use thand_shared::AppConfig;

const PUBLIC_URL: &str = "https://thand.example.com";

fn base_config() -> AppConfig {
    let dir = tempfile::tempdir().unwrap();
    let mut config = AppConfig::default();
    config.data_dir = dir.path().to_path_buf();
    std::mem::forget(dir);

    config.login_server = "https://login.corp.example.com".to_string();
    config.server_secret = "rotated-secret".to_string();
    config.server.public_url = PUBLIC_URL.to_string();
    config.cors.allowed_origins = vec![
        "https://console.example.com".to_string(),
        "https://*.corp.example.com".to_string(),
    ];

    config.providers.insert(
        "corp-saml".to_string(),
        ProviderSettings {
            kind: "saml".to_string(),
            options: HashMap::from([
                (
                    "idp_sso_url".to_string(),
                    "https://idp.example.com/sso".to_string(),
                ),
                ("entity_id".to_string(), PUBLIC_URL.to_string()),
                ("idp_initiated".to_string(), "true".to_string()),
            ]),
        },
    );
    config
}

async fn test_state(config: AppConfig) -> AppState {
    Services::build(config).await.unwrap()
}

fn saml_response_xml() -> String {
    format!(
        r#"<samlp:Response xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol"
    xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion"
    ID="_resp1" Destination="{acs}">
  <saml:Assertion ID="_assert-{nonce}">
    <saml:Subject><saml:NameID>dev@example.com</saml:NameID></saml:Subject>
    <saml:Conditions NotBefore="{not_before}" NotOnOrAfter="{not_after}">
      <saml:AudienceRestriction><saml:Audience>{audience}</saml:Audience></saml:AudienceRestriction>
    </saml:Conditions>
  </saml:Assertion>
</samlp:Response>"#,
        acs = format!("{}/api/v1/auth/callback/corp-saml", PUBLIC_URL),
        nonce = uuid::Uuid::new_v4(),
        not_before = (Utc::now() - ChronoDuration::minutes(1)).to_rfc3339(),
        not_after = (Utc::now() + ChronoDuration::minutes(5)).to_rfc3339(),
        audience = PUBLIC_URL,
    )
}

fn saml_post_body(state: &AppState, saml_response: &str) -> String {
    let relay = Envelope::seal_payload(
        EnvelopeKind::Auth,
        &AuthState {
            callback: String::new(),
            client_id: String::new(),
            provider: "corp-saml".to_string(),
            code: None,
        },
        &state.encryption,
    )
    .unwrap();

    format!(
        "RelayState={}&SAMLResponse={}",
        urlencoding::encode(&relay),
        urlencoding::encode(&BASE64_STANDARD.encode(saml_response)),
    )
}

fn saml_post(body: String, ip: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/api/v1/auth/callback/corp-saml")
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .header("X-Forwarded-For", ip)
        .body(Body::from(body))
        .unwrap()
}

#[tokio::test]
async fn test_setup_gate_blocks_unconfigured_server() {
    let mut config = base_config();
    config.login_server = thand_shared::config::DEFAULT_LOGIN_SERVER.to_string();
    let state = test_state(config).await;
    let app = create_versioned_routes(state);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/v1/roles")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::MISDIRECTED_REQUEST);

    // Health stays reachable for probes.
    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/v1/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_auth_request_rejects_loopback_callback() {
    let state = test_state(base_config()).await;
    let app = create_versioned_routes(state);

    let callback = urlencoding::encode(
        "https://thand.example.com/api/v1/auth/request/other-provider",
    )
    .to_string();
    let response = app
        .oneshot(
            Request::builder()
                .uri(format!(
                    "/api/v1/auth/request/corp-saml?callback={}",
                    callback
                ))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_auth_request_redirects_to_idp() {
    let state = test_state(base_config()).await;
    let app = create_versioned_routes(state);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/v1/auth/request/corp-saml")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    let location = response
        .headers()
        .get(header::LOCATION)
        .unwrap()
        .to_str()
        .unwrap();
    assert!(location.starts_with("https://idp.example.com/sso?RelayState="));
}

#[tokio::test]
async fn test_saml_login_sets_cookies_and_rejects_replay() {
    let state = test_state(base_config()).await;
    let app = create_versioned_routes(state.clone());

    let xml = saml_response_xml();

    // First presentation establishes a session.
    let response = app
        .clone()
        .oneshot(saml_post(saml_post_body(&state, &xml), "10.0.0.1"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let cookies: Vec<String> = response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .map(|v| v.to_str().unwrap().to_string())
        .collect();
    assert!(cookies.iter().any(|c| c.starts_with("_thand_corp-saml=")));
    assert!(cookies.iter().any(|c| c.starts_with("_thand=corp-saml")));

    // The identical assertion within the validity window is replay.
    let response = app
        .oneshot(saml_post(saml_post_body(&state, &xml), "10.0.0.1"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = axum::body::to_bytes(response.into_body(), 64 * 1024)
        .await
        .unwrap();
    let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed["code"], "REPLAY_DETECTED");
}

#[tokio::test]
async fn test_saml_rate_limit_burst() {
    let state = test_state(base_config()).await;
    let app = create_versioned_routes(state);

    // burst=10: the first ten requests pass the limiter (and fail later, on
    // the malformed body), the eleventh is rejected outright.
    for _ in 0..10 {
        let response = app
            .clone()
            .oneshot(saml_post("SAMLResponse=garbage".to_string(), "10.9.9.9"))
            .await
            .unwrap();
        assert_ne!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }
    let response = app
        .oneshot(saml_post("SAMLResponse=garbage".to_string(), "10.9.9.9"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn test_state_envelope_kind_is_pinned() {
    let state = test_state(base_config()).await;
    let app = create_versioned_routes(state.clone());

    // A SESSION_CODE envelope is not acceptable where AUTH/WORKFLOW_TASK is
    // expected.
    let wrong_kind = Envelope::seal_payload(
        EnvelopeKind::SessionCode,
        &serde_json::json!({"callback_url": "x", "issued_at": Utc::now(), "ttl_secs": 60}),
        &state.encryption,
    )
    .unwrap();

    let response = app
        .oneshot(
            Request::builder()
                .uri(format!(
                    "/api/v1/auth/callback/corp-saml?state={}&code=abc",
                    wrong_kind
                ))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_cors_preflight_enforcement() {
    let state = test_state(base_config()).await;
    let app = create_versioned_routes(state);

    // Non-matching origin: preflight refused.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("OPTIONS")
                .uri("/api/v1/roles")
                .header(header::ORIGIN, "https://evil.example.org")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    // Wildcard subdomain match.
    let response = app
        .oneshot(
            Request::builder()
                .method("OPTIONS")
                .uri("/api/v1/roles")
                .header(header::ORIGIN, "https://dev.corp.example.com")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(
        response
            .headers()
            .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
            .unwrap(),
        "https://dev.corp.example.com"
    );
}

#[tokio::test]
async fn test_request_id_echoed() {
    let state = test_state(base_config()).await;
    let app = create_versioned_routes(state);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/v1/health")
                .header("X-Request-Id", "corr-123")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.headers().get("X-Request-Id").unwrap(), "corr-123");
}

#[tokio::test]
async fn test_metrics_and_discovery_surfaces() {
    let state = test_state(base_config()).await;
    let app = create_versioned_routes(state);

    for path in [
        "/api/v1/metrics",
        "/.well-known/api-configuration",
        "/api/v1/providers",
        "/api/v1/roles",
        "/api/v1/workflows",
    ] {
        let response = app
            .clone()
            .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK, "path {}", path);
    }
}
