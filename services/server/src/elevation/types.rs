use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use thand_shared::{Role, RoleScopes, UserIdentity, WorkflowPolicy};

use crate::providers::RoleGrant;

/// An elevation submission. Accepted as JSON, form or query parameters;
/// static requests name a role, dynamic requests carry permissions and/or
/// inherited provider roles.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ElevateRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub providers: Vec<String>,
    /// Single-provider convenience used by the GET shortcut.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    /// Target identities; defaults to the requester.
    #[serde(default)]
    pub identities: Vec<String>,
    /// Authentication provider override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authenticator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// ISO-8601-like duration string, e.g. `PT1H`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub inherits: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scopes: Option<RoleScopes>,
    /// Sealed snapshot of the requester's provider session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
}

impl ElevateRequest {
    /// Fold the singular `provider` convenience field into `providers`.
    pub fn normalize(mut self) -> Self {
        if let Some(provider) = self.provider.take() {
            if !provider.is_empty() && !self.providers.contains(&provider) {
                self.providers.push(provider);
            }
        }
        self
    }

    pub fn is_dynamic(&self) -> bool {
        self.role.is_none()
    }
}

/// Input handed to the elevation workflow: the validated request plus the
/// resolved role, approval policy and requester identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElevationInput {
    pub request: ElevateRequest,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<WorkflowPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requester: Option<UserIdentity>,
    pub duration_secs: u64,
}

/// One applied binding: the provider, the target identity and the
/// authoritative grant artefact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderGrant {
    pub provider: String,
    pub identity: String,
    pub grant: RoleGrant,
}

/// Terminal output of an elevation workflow.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ElevationOutput {
    pub role: String,
    pub providers: Vec<String>,
    pub approved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_by: Option<String>,
    #[serde(default)]
    pub grants: Vec<ProviderGrant>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorized_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cancelled: bool,
}

/// Redirect emitted while the workflow is suspended awaiting authentication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthRedirect {
    pub provider: String,
    pub url: String,
}

/// Composite role plus resolved target identities, produced by the
/// evaluate-role step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluatedRole {
    pub role: Role,
    pub identities: Vec<UserIdentity>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_folds_provider() {
        let request = ElevateRequest {
            provider: Some("gcp-prod".to_string()),
            ..Default::default()
        };
        let normalized = request.normalize();
        assert_eq!(normalized.providers, vec!["gcp-prod"]);
        assert!(normalized.provider.is_none());
    }

    #[test]
    fn test_dynamic_detection() {
        let static_request = ElevateRequest {
            role: Some("readonly".to_string()),
            ..Default::default()
        };
        assert!(!static_request.is_dynamic());

        let dynamic_request = ElevateRequest {
            permissions: vec!["storage.objects.get".to_string()],
            ..Default::default()
        };
        assert!(dynamic_request.is_dynamic());
    }

    #[test]
    fn test_form_encoded_request_parses() {
        // The GET shortcut and form submissions arrive as flat strings.
        let request: ElevateRequest = serde_json::from_value(serde_json::json!({
            "role": "readonly",
            "provider": "gcp-prod",
            "reason": "debug",
            "duration": "PT1H"
        }))
        .unwrap();
        assert_eq!(request.normalize().providers, vec!["gcp-prod"]);
    }
}
