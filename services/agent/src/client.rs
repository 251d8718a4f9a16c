// Loopback client for the agent's HTTP surface. The CLI front end drives
// these operations; any failure maps to a non-zero exit.

use serde::Deserialize;

use thand_shared::{Result, ServiceError};

pub struct AgentClient {
    base_url: String,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
pub struct RegisterResponse {
    pub code: String,
    pub callback_url: String,
}

#[derive(Debug, Deserialize)]
pub struct PreflightResponse {
    pub auth_url: String,
}

#[derive(Debug, Deserialize)]
pub struct SessionResponse {
    pub provider: String,
    pub session: String,
    pub expires_at: chrono::DateTime<chrono::Utc>,
}

impl AgentClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(ServiceError::Internal(format!(
            "agent returned {}: {}",
            status, body
        )))
    }

    /// Begin a browser login: register a one-time code, then ask the agent
    /// for the auth URL to open.
    pub async fn begin_login(&self, provider: &str) -> Result<PreflightResponse> {
        let response = self
            .http
            .post(format!("{}/register", self.base_url))
            .json(&serde_json::json!({}))
            .send()
            .await
            .map_err(|e| ServiceError::Internal(e.to_string()))?;
        let register: RegisterResponse = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| ServiceError::Serialization(e.to_string()))?;

        let response = self
            .http
            .post(format!("{}/preflight", self.base_url))
            .json(&serde_json::json!({
                "provider": provider,
                "code": register.code,
            }))
            .send()
            .await
            .map_err(|e| ServiceError::Internal(e.to_string()))?;
        Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| ServiceError::Serialization(e.to_string()))
    }

    /// Fetch the encoded session for a provider, usable as a Bearer token
    /// against the login server.
    pub async fn session(&self, provider: &str) -> Result<Option<SessionResponse>> {
        let response = self
            .http
            .get(format!("{}/session/{}", self.base_url, provider))
            .send()
            .await
            .map_err(|e| ServiceError::Internal(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(
            Self::check(response)
                .await?
                .json()
                .await
                .map_err(|e| ServiceError::Serialization(e.to_string()))?,
        ))
    }

    /// Block until a session for `provider` appears or the timeout elapses.
    pub async fn await_session(
        &self,
        provider: &str,
        timeout_secs: u64,
    ) -> Result<Option<SessionResponse>> {
        let response = self
            .http
            .get(format!(
                "{}/await?provider={}&timeout_secs={}",
                self.base_url, provider, timeout_secs
            ))
            .send()
            .await
            .map_err(|e| ServiceError::Internal(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NO_CONTENT {
            return Ok(None);
        }
        Self::check(response).await?;
        self.session(provider).await
    }

    pub async fn logout(&self, provider: Option<&str>) -> Result<()> {
        let url = match provider {
            Some(p) => format!("{}/session/{}", self.base_url, p),
            None => format!("{}/sessions", self.base_url),
        };
        let response = self
            .http
            .delete(url)
            .send()
            .await
            .map_err(|e| ServiceError::Internal(e.to_string()))?;
        Self::check(response).await?;
        Ok(())
    }
}
