// Common types shared across thand services

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::error::{Result, ServiceError};

pub type UserId = String;
pub type ProviderName = String;
pub type WorkflowId = String;

/// Identity of an authenticated user as reported by a provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserIdentity {
    pub id: UserId,
    pub email: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub groups: Vec<String>,
    /// Provider that asserted this identity.
    #[serde(default)]
    pub source: String,
}

impl UserIdentity {
    pub fn from_email(email: &str) -> Self {
        Self {
            id: email.to_string(),
            email: email.to_string(),
            username: email.split('@').next().unwrap_or(email).to_string(),
            name: String::new(),
            groups: Vec::new(),
            source: String::new(),
        }
    }
}

/// Allow/deny permission sets attached to a role.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RolePermissions {
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
}

/// Identity scoping restrictions for a role.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RoleScopes {
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub users: Vec<String>,
    #[serde(default)]
    pub domains: Vec<String>,
}

/// An elevatable role definition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Role {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Approval workflows this role may be routed through. The first entry is
    /// the default when the request names none.
    #[serde(default)]
    pub workflows: Vec<String>,
    #[serde(default)]
    pub permissions: RolePermissions,
    /// Names of predefined provider roles this role inherits.
    #[serde(default)]
    pub inherits: Vec<String>,
    #[serde(default)]
    pub providers: Vec<ProviderName>,
    /// Authentication providers permitted to assert the requesting identity.
    #[serde(default)]
    pub authenticators: Vec<ProviderName>,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub resources: Vec<String>,
    #[serde(default)]
    pub scopes: RoleScopes,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub require_approval: bool,
    /// Whether the requester may approve their own elevation. Default deny.
    #[serde(default)]
    pub allow_self_approval: bool,
}

fn default_true() -> bool {
    true
}

impl Role {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            description: String::new(),
            workflows: Vec::new(),
            permissions: RolePermissions::default(),
            inherits: Vec::new(),
            providers: Vec::new(),
            authenticators: Vec::new(),
            groups: Vec::new(),
            resources: Vec::new(),
            scopes: RoleScopes::default(),
            enabled: true,
            require_approval: true,
            allow_self_approval: false,
        }
    }
}

/// Approval workflow policy attached to roles by name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowPolicy {
    pub name: String,
    /// Identities (emails or group names) permitted to approve.
    #[serde(default)]
    pub approvers: Vec<String>,
    /// Notifier providers to fan approval requests out to.
    #[serde(default)]
    pub notifiers: Vec<ProviderName>,
    /// Seconds to wait for an approval signal before failing the elevation.
    #[serde(default = "default_approval_timeout")]
    pub approval_timeout_secs: u64,
}

fn default_approval_timeout() -> u64 {
    24 * 3600
}

/// String-keyed provider instance configuration with typed accessors.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BasicConfig(pub HashMap<String, String>);

impl BasicConfig {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(|s| s.as_str())
    }

    pub fn get_string(&self, key: &str) -> String {
        self.0.get(key).cloned().unwrap_or_default()
    }

    pub fn require(&self, key: &str) -> Result<&str> {
        self.get(key)
            .ok_or_else(|| ServiceError::Configuration(format!("missing provider option: {}", key)))
    }

    pub fn get_bool(&self, key: &str) -> bool {
        self.get(key)
            .map(|v| matches!(v, "true" | "1" | "yes"))
            .unwrap_or(false)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    pub fn get_list(&self, key: &str) -> Vec<String> {
        self.get(key)
            .map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Standard API response wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub data: T,
    pub metadata: ResponseMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMetadata {
    pub correlation_id: String,
    pub timestamp: DateTime<Utc>,
    pub version: String,
}

impl ResponseMetadata {
    pub fn new(correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            timestamp: Utc::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub version: String,
    pub checks: HashMap<String, HealthCheck>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    pub status: String,
    pub message: Option<String>,
    pub duration_ms: u64,
}

/// Parse an ISO-8601-like duration string such as `PT1H`, `PT15M` or `PT90S`.
/// Bare forms like `1h`, `30m`, `45s` are accepted for convenience.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let s = input.trim();
    if s.is_empty() {
        return Err(ServiceError::Validation("duration is required".to_string()));
    }

    let body = s
        .strip_prefix("PT")
        .or_else(|| s.strip_prefix("pt"))
        .unwrap_or(s);

    let mut total = 0u64;
    let mut digits = String::new();
    let mut saw_unit = false;

    for c in body.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let value: u64 = digits
            .parse()
            .map_err(|_| ServiceError::Validation(format!("invalid duration: {}", input)))?;
        digits.clear();
        saw_unit = true;
        total += match c.to_ascii_lowercase() {
            'h' => value * 3600,
            'm' => value * 60,
            's' => value,
            'd' => value * 86400,
            _ => {
                return Err(ServiceError::Validation(format!(
                    "invalid duration unit '{}' in {}",
                    c, input
                )))
            }
        };
    }

    if !digits.is_empty() || !saw_unit {
        return Err(ServiceError::Validation(format!("invalid duration: {}", input)));
    }
    if total == 0 {
        return Err(ServiceError::Validation("duration must be positive".to_string()));
    }

    Ok(Duration::from_secs(total))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("PT1H").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("PT15M").unwrap(), Duration::from_secs(900));
        assert_eq!(parse_duration("PT1H30M").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("90s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("2d").unwrap(), Duration::from_secs(172800));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("PT").is_err());
        assert!(parse_duration("1x").is_err());
        assert!(parse_duration("PT0S").is_err());
    }

    #[test]
    fn test_basic_config_accessors() {
        let mut map = HashMap::new();
        map.insert("client_id".to_string(), "abc".to_string());
        map.insert("idp_initiated".to_string(), "true".to_string());
        map.insert("scopes".to_string(), "openid, profile,email".to_string());
        let cfg = BasicConfig(map);

        assert_eq!(cfg.require("client_id").unwrap(), "abc");
        assert!(cfg.require("client_secret").is_err());
        assert!(cfg.get_bool("idp_initiated"));
        assert!(!cfg.get_bool("missing"));
        assert_eq!(cfg.get_list("scopes"), vec!["openid", "profile", "email"]);
    }

    #[test]
    fn test_role_defaults() {
        let role: Role = serde_yaml::from_str("name: readonly").unwrap();
        assert!(role.enabled);
        assert!(role.require_approval);
        assert!(!role.allow_self_approval);
        assert!(role.inherits.is_empty());
    }
}
