use axum::extract::{Request, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::services::AppState;

/// Match an origin against an accept-list entry. Entries may carry a single
/// `*.` wildcard after the scheme (`https://*.example.com`); the matched
/// suffix must begin with `.`, so `evilexample.com` never matches.
pub fn origin_matches(origin: &str, pattern: &str) -> bool {
    if origin == pattern {
        return true;
    }

    let Some((scheme, host_pattern)) = pattern.split_once("://") else {
        return false;
    };
    let Some(rest) = host_pattern.strip_prefix("*.") else {
        return false;
    };
    let Some((origin_scheme, origin_host)) = origin.split_once("://") else {
        return false;
    };

    origin_scheme == scheme && origin_host.ends_with(&format!(".{}", rest))
}

pub fn origin_allowed(origin: &str, allowed: &[String]) -> bool {
    allowed.iter().any(|pattern| origin_matches(origin, pattern))
}

/// CORS with wildcard-capable accept-list. Preflight from a non-matching
/// origin is answered with 403.
pub async fn cors_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let origin = request
        .headers()
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    let allowed = origin
        .as_deref()
        .map(|o| origin_allowed(o, &state.config.cors.allowed_origins))
        .unwrap_or(false);

    if request.method() == Method::OPTIONS && origin.is_some() {
        if !allowed {
            return StatusCode::FORBIDDEN.into_response();
        }
        let mut response = StatusCode::NO_CONTENT.into_response();
        apply_cors_headers(&mut response, origin.as_deref().unwrap());
        return response;
    }

    let mut response = next.run(request).await;
    if allowed {
        if let Some(origin) = origin.as_deref() {
            apply_cors_headers(&mut response, origin);
        }
    }
    response
}

fn apply_cors_headers(response: &mut Response, origin: &str) {
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(origin) {
        headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
    }
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, DELETE, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Authorization, Content-Type, X-API-Key, X-Request-Id"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
        HeaderValue::from_static("true"),
    );
    headers.insert(header::VARY, HeaderValue::from_static("Origin"));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_origin_match() {
        assert!(origin_matches(
            "https://console.example.com",
            "https://console.example.com"
        ));
        assert!(!origin_matches(
            "http://console.example.com",
            "https://console.example.com"
        ));
    }

    #[test]
    fn test_wildcard_requires_dot_boundary() {
        let pattern = "https://*.example.com";
        assert!(origin_matches("https://app.example.com", pattern));
        assert!(origin_matches("https://a.b.example.com", pattern));
        // Suffix must begin with a dot: no bare-domain or lookalike matches.
        assert!(!origin_matches("https://example.com", pattern));
        assert!(!origin_matches("https://evilexample.com", pattern));
        assert!(!origin_matches("http://app.example.com", pattern));
    }

    #[test]
    fn test_accept_list() {
        let allowed = vec![
            "https://console.example.com".to_string(),
            "https://*.corp.example.com".to_string(),
        ];
        assert!(origin_allowed("https://console.example.com", &allowed));
        assert!(origin_allowed("https://dev.corp.example.com", &allowed));
        assert!(!origin_allowed("https://corp.example.com", &allowed));
        assert!(!origin_allowed("https://other.example.com", &allowed));
    }
}
