// HTTP mapping for service errors

use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;

use thand_shared::ServiceError;

pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Wrapper making `ServiceError` renderable as an HTTP response. 500-class
/// errors never leak internal detail; the correlation id travels in the
/// `X-Request-Id` response header set by middleware.
#[derive(Debug)]
pub struct ApiError(pub ServiceError);

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        ApiError(err)
    }
}

impl From<thand_shared::workflow::RuntimeError> for ApiError {
    fn from(err: thand_shared::workflow::RuntimeError) -> Self {
        ApiError(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        let (title, message) = if status.is_server_error() {
            tracing::error!(error = %self.0, "Request failed");
            (
                "Internal Server Error".to_string(),
                format!("An internal error occurred at {}", Utc::now().to_rfc3339()),
            )
        } else {
            (
                status
                    .canonical_reason()
                    .unwrap_or("Request Failed")
                    .to_string(),
                self.0.to_string(),
            )
        };

        let body = Json(serde_json::json!({
            "code": self.0.code(),
            "title": title,
            "message": message,
        }));

        (status, body).into_response()
    }
}

/// True when the client prefers an HTML rendering over JSON.
pub fn wants_html(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|accept| {
            let html = accept.find("text/html");
            let json = accept.find("application/json");
            match (html, json) {
                (Some(h), Some(j)) => h < j,
                (Some(_), None) => true,
                _ => false,
            }
        })
        .unwrap_or(false)
}

/// Render an error for a browser client: a minimal HTML shell carrying the
/// same code/title/message triple as the JSON body.
pub fn html_error_response(err: &ServiceError) -> Response {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let message = if status.is_server_error() {
        format!("An internal error occurred at {}", Utc::now().to_rfc3339())
    } else {
        err.to_string()
    };

    let body = format!(
        "<!DOCTYPE html><html><head><title>{code}</title></head>\
         <body><h1>{code}</h1><p>{message}</p></body></html>",
        code = err.code(),
        message = html_escape(&message),
    );

    (
        status,
        [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
        body,
    )
        .into_response()
}

pub fn html_escape(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accept_header_negotiation() {
        let mut headers = HeaderMap::new();
        assert!(!wants_html(&headers));

        headers.insert(header::ACCEPT, "application/json".parse().unwrap());
        assert!(!wants_html(&headers));

        headers.insert(
            header::ACCEPT,
            "text/html,application/xhtml+xml".parse().unwrap(),
        );
        assert!(wants_html(&headers));

        headers.insert(
            header::ACCEPT,
            "application/json, text/html".parse().unwrap(),
        );
        assert!(!wants_html(&headers));
    }

    #[test]
    fn test_html_escape() {
        assert_eq!(html_escape("<script>"), "&lt;script&gt;");
    }
}
