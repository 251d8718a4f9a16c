// Capability-tagged provider abstraction and registry

pub mod gcp;
pub mod identity;
pub mod notifier;
pub mod oauth2;
pub mod saml;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use thand_shared::auth::Session;
use thand_shared::config::ProviderSettings;
use thand_shared::{BasicConfig, Result, Role, ServiceError, UserIdentity};

/// Session authorization request handed to an authorizer.
#[derive(Debug, Clone, Default)]
pub struct AuthorizeUser {
    pub scopes: Vec<String>,
    /// Opaque state round-tripped through the provider.
    pub state: String,
    /// Authorization code nonce, or the raw SAML response for SAML providers.
    pub code: Option<String>,
    pub redirect_uri: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizeSessionResponse {
    pub url: String,
}

/// Authentication capability: OAuth2, OIDC and SAML providers implement this.
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Build the provider's authorize URL for a browser redirect.
    async fn authorize_session(&self, req: AuthorizeUser) -> Result<AuthorizeSessionResponse>;

    /// Complete the flow: exchange the code (or consume the assertion) and
    /// produce a server-side session.
    async fn create_session(&self, req: AuthorizeUser) -> Result<Session>;

    async fn validate_session(&self, session: &Session) -> Result<()>;

    async fn renew_session(&self, session: &Session) -> Result<Session>;
}

/// A provider-native role as listed for the approval UI.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderRole {
    pub name: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub permissions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderPermission {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizeRoleRequest {
    pub user: UserIdentity,
    pub role: Role,
}

/// Authorization artefact: the authoritative record of bindings actually
/// applied, consumed verbatim at revoke time.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RoleGrant {
    pub user_id: String,
    pub roles: Vec<String>,
}

/// RBAC capability: uniform role binding and symmetric revocation.
#[async_trait]
pub trait RbacProvider: Send + Sync {
    async fn authorize_role(&self, req: &AuthorizeRoleRequest) -> Result<RoleGrant>;

    /// Revocation must consume the grant's `roles[]`; revoking without it
    /// fails.
    async fn revoke_role(&self, req: &AuthorizeRoleRequest, grant: &RoleGrant) -> Result<()>;

    async fn get_role(&self, name: &str) -> Result<ProviderRole>;

    async fn list_roles(&self) -> Result<Vec<ProviderRole>>;

    async fn get_permission(&self, name: &str) -> Result<ProviderPermission>;

    async fn list_permissions(&self, filter: Option<&str>) -> Result<Vec<ProviderPermission>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityKind {
    User,
    Group,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Identity {
    pub id: String,
    pub kind: IdentityKind,
    pub email: String,
    #[serde(default)]
    pub name: String,
}

/// Identity directory capability.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn list_identities(&self, filter: Option<&str>) -> Result<Vec<Identity>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub title: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    #[serde(default)]
    pub recipients: Vec<String>,
}

/// Notification capability for approval fan-out.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<()>;
}

/// A named provider instance composing only the capabilities it implements.
/// The control plane never inspects concrete provider types.
pub struct Provider {
    pub name: String,
    pub kind: String,
    pub config: BasicConfig,
    pub authorizer: Option<Arc<dyn Authorizer>>,
    pub rbac: Option<Arc<dyn RbacProvider>>,
    pub identities: Option<Arc<dyn IdentityProvider>>,
    pub notifier: Option<Arc<dyn Notifier>>,
}

impl Provider {
    pub fn capabilities(&self) -> Vec<&'static str> {
        let mut caps = Vec::new();
        if self.authorizer.is_some() {
            caps.push("authorizer");
        }
        if self.rbac.is_some() {
            caps.push("rbac");
        }
        if self.identities.is_some() {
            caps.push("identities");
        }
        if self.notifier.is_some() {
            caps.push("notifier");
        }
        caps
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderDescriptor {
    pub name: String,
    pub kind: String,
    pub capabilities: Vec<String>,
}

/// Registry of provider instances, keyed by name.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Instantiate all configured providers. SAML authorizers share the
    /// gateway's assertion replay cache.
    pub fn from_settings(
        settings: &HashMap<String, ProviderSettings>,
        http: reqwest::Client,
        replay_cache: Arc<crate::saml::ReplayCache>,
    ) -> Result<Self> {
        let mut registry = Self::new();
        for (name, cfg) in settings {
            let provider = build_provider(name, cfg, http.clone(), Arc::clone(&replay_cache))?;
            registry.register(provider);
        }
        Ok(registry)
    }

    pub fn register(&mut self, provider: Provider) {
        tracing::info!(
            provider = %provider.name,
            kind = %provider.kind,
            capabilities = ?provider.capabilities(),
            "Provider registered"
        );
        self.providers
            .insert(provider.name.clone(), Arc::new(provider));
    }

    pub fn get(&self, name: &str) -> Result<Arc<Provider>> {
        self.providers
            .get(name)
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(format!("provider {}", name)))
    }

    pub fn authorizer(&self, name: &str) -> Result<Arc<dyn Authorizer>> {
        self.get(name)?.authorizer.clone().ok_or_else(|| {
            ServiceError::Validation(format!("provider {} has no authorizer capability", name))
        })
    }

    pub fn rbac(&self, name: &str) -> Result<Arc<dyn RbacProvider>> {
        self.get(name)?.rbac.clone().ok_or_else(|| {
            ServiceError::Validation(format!("provider {} has no rbac capability", name))
        })
    }

    pub fn notifier(&self, name: &str) -> Result<Arc<dyn Notifier>> {
        self.get(name)?.notifier.clone().ok_or_else(|| {
            ServiceError::Validation(format!("provider {} has no notifier capability", name))
        })
    }

    pub fn identity_providers(&self) -> Vec<(String, Arc<dyn IdentityProvider>)> {
        self.providers
            .iter()
            .filter_map(|(name, p)| p.identities.clone().map(|i| (name.clone(), i)))
            .collect()
    }

    /// Names of providers carrying the authorizer capability.
    pub fn authenticator_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .providers
            .iter()
            .filter(|(_, p)| p.authorizer.is_some())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn list(&self) -> Vec<ProviderDescriptor> {
        let mut descriptors: Vec<ProviderDescriptor> = self
            .providers
            .values()
            .map(|p| ProviderDescriptor {
                name: p.name.clone(),
                kind: p.kind.clone(),
                capabilities: p.capabilities().iter().map(|c| c.to_string()).collect(),
            })
            .collect();
        descriptors.sort_by(|a, b| a.name.cmp(&b.name));
        descriptors
    }
}

fn build_provider(
    name: &str,
    settings: &ProviderSettings,
    http: reqwest::Client,
    replay_cache: Arc<crate::saml::ReplayCache>,
) -> Result<Provider> {
    let config = BasicConfig(settings.options.clone());
    let mut provider = Provider {
        name: name.to_string(),
        kind: settings.kind.clone(),
        config: config.clone(),
        authorizer: None,
        rbac: None,
        identities: None,
        notifier: None,
    };

    match settings.kind.as_str() {
        "oauth2" => {
            provider.authorizer = Some(Arc::new(oauth2::OAuth2Authorizer::new(
                name, &config, http,
            )?));
        }
        "saml" => {
            provider.authorizer = Some(Arc::new(saml::SamlAuthorizer::new(
                name,
                &config,
                replay_cache,
            )?));
        }
        "gcp" => {
            let gcp = Arc::new(gcp::GcpProvider::new(name, &config, http)?);
            provider.rbac = Some(gcp);
        }
        "directory" => {
            provider.identities = Some(Arc::new(identity::DirectoryProvider::new(name, &config)));
        }
        "webhook" => {
            provider.notifier = Some(Arc::new(notifier::WebhookNotifier::new(
                name, &config, http,
            )?));
        }
        other => {
            return Err(ServiceError::Configuration(format!(
                "unknown provider kind: {}",
                other
            )));
        }
    }

    Ok(provider)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_capability_lookup() {
        let mut settings = HashMap::new();
        settings.insert(
            "gcp-prod".to_string(),
            ProviderSettings {
                kind: "gcp".to_string(),
                options: HashMap::from([
                    ("project".to_string(), "acme-prod".to_string()),
                    ("api_base_url".to_string(), "http://localhost:1".to_string()),
                    ("access_token".to_string(), "t".to_string()),
                ]),
            },
        );

        let replay_cache = Arc::new(crate::saml::ReplayCache::new(
            std::time::Duration::from_secs(300),
        ));
        let registry =
            ProviderRegistry::from_settings(&settings, reqwest::Client::new(), replay_cache)
                .unwrap();
        assert!(registry.rbac("gcp-prod").is_ok());
        assert!(registry.authorizer("gcp-prod").is_err());
        assert!(registry.get("missing").is_err());

        let descriptors = registry.list();
        assert_eq!(descriptors.len(), 1);
        assert_eq!(descriptors[0].capabilities, vec!["rbac"]);
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let mut settings = HashMap::new();
        settings.insert(
            "x".to_string(),
            ProviderSettings {
                kind: "teleport".to_string(),
                options: HashMap::new(),
            },
        );
        let replay_cache = Arc::new(crate::saml::ReplayCache::new(
            std::time::Duration::from_secs(300),
        ));
        assert!(
            ProviderRegistry::from_settings(&settings, reqwest::Client::new(), replay_cache)
                .is_err()
        );
    }
}
