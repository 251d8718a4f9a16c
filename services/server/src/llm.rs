// Natural-language elevation: derive a structured request from free text

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use thand_shared::config::LlmConfig;
use thand_shared::{Result, ServiceError};

use crate::elevation::{ElevateRequest, RoleCatalog};
use crate::providers::ProviderRegistry;

/// Turns a natural-language reason into an `ElevateRequest` shape via an
/// OpenAI-compatible chat-completions endpoint. The derived request is
/// returned to the caller, never auto-submitted.
pub struct LlmService {
    config: LlmConfig,
    http: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

impl LlmService {
    pub fn new(config: LlmConfig, http: reqwest::Client) -> Self {
        Self { config, http }
    }

    fn system_prompt(catalog: &RoleCatalog, registry: &ProviderRegistry) -> String {
        let roles: Vec<String> = catalog.roles().iter().map(|r| r.name.clone()).collect();
        let providers: Vec<String> = registry.list().iter().map(|p| p.name.clone()).collect();

        format!(
            "You translate access requests into JSON. Respond with a single JSON \
             object with fields: role (one of {roles:?}, or null for ad-hoc \
             requests), providers (subset of {providers:?}), permissions \
             (list of provider permission strings, only for ad-hoc requests), \
             reason (string), duration (ISO-8601 duration such as PT1H). \
             Respond with JSON only, no prose."
        )
    }

    /// Derive an elevation request from free text.
    pub async fn derive_request(
        &self,
        text: &str,
        catalog: &Arc<RoleCatalog>,
        registry: &Arc<ProviderRegistry>,
    ) -> Result<ElevateRequest> {
        let request = ChatRequest {
            model: self.config.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: Self::system_prompt(catalog, registry),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: text.to_string(),
                },
            ],
            temperature: 0.0,
        };

        let response = self
            .http
            .post(format!(
                "{}/chat/completions",
                self.config.endpoint.trim_end_matches('/')
            ))
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| ServiceError::provider("LlmError", true, e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(ServiceError::provider(
                "LlmError",
                status.is_server_error(),
                format!("chat endpoint returned {}", status),
            ));
        }

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| ServiceError::provider("LlmError", false, e.to_string()))?;
        let content = chat
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .ok_or_else(|| {
                ServiceError::provider("LlmError", false, "empty completion".to_string())
            })?;

        parse_derived_request(content)
    }
}

/// Extract the JSON object from a completion, tolerating code fences.
fn parse_derived_request(content: &str) -> Result<ElevateRequest> {
    let trimmed = content.trim();
    let json = if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        &trimmed[start..=end]
    } else {
        trimmed
    };

    let request: ElevateRequest = serde_json::from_str(json).map_err(|e| {
        ServiceError::Validation(format!("model returned an unusable request shape: {}", e))
    })?;
    Ok(request.normalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_json() {
        let request = parse_derived_request(
            r#"{"role": "readonly", "providers": ["gcp-prod"], "reason": "debug prod", "duration": "PT1H"}"#,
        )
        .unwrap();
        assert_eq!(request.role.as_deref(), Some("readonly"));
        assert_eq!(request.duration.as_deref(), Some("PT1H"));
    }

    #[test]
    fn test_parse_fenced_json() {
        let content = "```json\n{\"permissions\": [\"storage.objects.get\"], \"providers\": [\"gcp-prod\"], \"reason\": \"audit\", \"duration\": \"PT15M\"}\n```";
        let request = parse_derived_request(content).unwrap();
        assert!(request.is_dynamic());
        assert_eq!(request.permissions, vec!["storage.objects.get"]);
    }

    #[test]
    fn test_parse_garbage_rejected() {
        assert!(parse_derived_request("I cannot help with that").is_err());
    }
}
