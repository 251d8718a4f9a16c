// Integration tests for the agent's loopback surface

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use chrono::{Duration as ChronoDuration, Utc};
use tower::ServiceExt;

use thand_agent::routes::create_routes;
use thand_agent::state::{AgentServices, AgentState};
use thand_shared::auth::{LocalSession, Session};
use thand_shared::crypto::{generate_key, EncryptionService};
use thand_shared::{AppConfig, UserIdentity};

fn test_state() -> AgentState {
    let dir = tempfile::tempdir().unwrap();
    let mut config = AppConfig::default();
    config.data_dir = dir.path().to_path_buf();
    config.login_server = "https://login.corp.example.com".to_string();
    std::mem::forget(dir);
    AgentServices::build(config).unwrap()
}

fn sealed_session(email: &str) -> String {
    // Sealed by the server's key in production; the agent stores it opaquely.
    let enc = EncryptionService::new(&generate_key());
    let mut user = UserIdentity::from_email(email);
    user.source = "okta".to_string();
    let session = Session::new(
        user,
        "at".to_string(),
        Utc::now() + ChronoDuration::hours(1),
    );
    LocalSession::seal(&session, &enc).unwrap().encode().unwrap()
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), 64 * 1024)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_session_crud_roundtrip() {
    let state = test_state();
    let app = create_routes(state);

    // Empty store.
    let response = app
        .clone()
        .oneshot(Request::builder().uri("/sessions").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let listed = body_json(response).await;
    assert_eq!(listed["sessions"].as_array().unwrap().len(), 0);

    // Store a session out of band.
    let encoded = sealed_session("dev@example.com");
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/session/okta")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    serde_json::json!({"session": encoded}).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Fetch it back for Bearer use.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/session/okta")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let fetched = body_json(response).await;
    assert_eq!(fetched["session"], encoded);

    // Remove it.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/session/okta")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/session/okta")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_bootstrap_handoff_flow() {
    let state = test_state();
    let app = create_routes(state.clone());

    // Register a one-time code.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/register")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from("{}"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let registered = body_json(response).await;
    let code = registered["code"].as_str().unwrap().to_string();

    // Preflight returns the login-server URL to open in a browser.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/preflight")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    serde_json::json!({"provider": "okta", "code": code}).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let preflight = body_json(response).await;
    let auth_url = preflight["auth_url"].as_str().unwrap();
    assert!(auth_url.starts_with("https://login.corp.example.com/api/v1/auth/request/okta?"));
    assert!(auth_url.contains("postflight"));

    // The login server redirects the browser to postflight with the code and
    // the sealed session.
    let encoded = sealed_session("dev@example.com");
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!(
                    "/postflight?code={}&provider=okta&session={}",
                    urlencoding::encode(&code),
                    urlencoding::encode(&encoded)
                ))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // The session is now in the store.
    let stored = state
        .store
        .get_session(&state.login_server_host(), "okta")
        .await;
    assert!(stored.is_some());

    // The code is single-use.
    let response = app
        .oneshot(
            Request::builder()
                .uri(format!(
                    "/postflight?code={}&provider=okta&session={}",
                    urlencoding::encode(&code),
                    urlencoding::encode(&encoded)
                ))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_preflight_requires_known_code() {
    let state = test_state();
    let app = create_routes(state);

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/preflight")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    serde_json::json!({"provider": "okta", "code": "bogus"}).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_await_wakes_on_session_arrival() {
    let state = test_state();
    let app = create_routes(state.clone());

    let waiter = {
        let app = app.clone();
        tokio::spawn(async move {
            app.oneshot(
                Request::builder()
                    .uri("/await?provider=okta&timeout_secs=10")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap()
        })
    };

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let local = LocalSession::decode(&sealed_session("dev@example.com")).unwrap();
    state
        .store
        .add_session(&state.login_server_host(), "okta", local)
        .await
        .unwrap();

    let response = tokio::time::timeout(std::time::Duration::from_secs(5), waiter)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_await_times_out_with_no_content() {
    let state = test_state();
    let app = create_routes(state);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/await?provider=okta&timeout_secs=1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn test_browser_cookie_reissue_redirects_once() {
    let state = test_state();
    let app = create_routes(state.clone());

    let local = LocalSession::decode(&sealed_session("dev@example.com")).unwrap();
    let encoded = local.encode().unwrap();
    state
        .store
        .add_session(&state.login_server_host(), "okta", local)
        .await
        .unwrap();

    // Browser request without cookies: cookies re-issued, one redirect.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/sessions")
                .header(header::ACCEPT, "text/html")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
    let cookie = response
        .headers()
        .get(header::SET_COOKIE)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(cookie.starts_with("_thand_okta="));

    // With matching cookies the request passes straight through: no loop.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/sessions")
                .header(header::ACCEPT, "text/html")
                .header(header::COOKIE, format!("_thand_okta={}", encoded))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // API clients are never redirected.
    let response = app
        .oneshot(
            Request::builder()
                .uri("/sessions")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
