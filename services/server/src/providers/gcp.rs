// IAM-style RBAC provider with idempotent tagged bindings

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use thand_shared::auth::validate_member_email;
use thand_shared::{BasicConfig, Result, ServiceError};

use super::{
    AuthorizeRoleRequest, ProviderPermission, ProviderRole, RbacProvider, RoleGrant,
};

/// Condition title marking bindings this system manages. Revocation only ever
/// touches bindings carrying this tag.
pub const MANAGED_TAG: &str = "managed-by-thand";

const POLICY_VERSION: i32 = 3;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct IamCondition {
    pub title: String,
    pub expression: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl IamCondition {
    pub fn managed() -> Self {
        Self {
            title: MANAGED_TAG.to_string(),
            expression: "true".to_string(),
            description: None,
        }
    }

    pub fn is_managed(&self) -> bool {
        self.title == MANAGED_TAG
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct IamBinding {
    pub role: String,
    #[serde(default)]
    pub members: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<IamCondition>,
}

impl IamBinding {
    fn is_managed(&self) -> bool {
        self.condition.as_ref().map(|c| c.is_managed()).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct IamPolicy {
    #[serde(default)]
    pub version: i32,
    #[serde(default)]
    pub bindings: Vec<IamBinding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

/// Add `member` to the tagged binding for `role`, appending a fresh tagged
/// binding when none exists. Returns whether the policy changed; a no-op on
/// re-binding is what makes `authorize_role` idempotent.
pub fn upsert_tagged_member(policy: &mut IamPolicy, role: &str, member: &str) -> bool {
    if let Some(binding) = policy
        .bindings
        .iter_mut()
        .find(|b| b.role == role && b.is_managed())
    {
        if binding.members.iter().any(|m| m == member) {
            return false;
        }
        binding.members.push(member.to_string());
        return true;
    }

    policy.bindings.push(IamBinding {
        role: role.to_string(),
        members: vec![member.to_string()],
        condition: Some(IamCondition::managed()),
    });
    true
}

/// Remove `member` from the tagged binding for `role`, dropping the binding
/// when its last member leaves. Bindings without the management tag are never
/// touched.
pub fn remove_tagged_member(policy: &mut IamPolicy, role: &str, member: &str) -> Result<()> {
    let index = policy
        .bindings
        .iter()
        .position(|b| b.role == role && b.is_managed())
        .ok_or_else(|| {
            ServiceError::provider(
                "BindingNotFound",
                false,
                format!("no managed binding for role {}", role),
            )
        })?;

    let binding = &mut policy.bindings[index];
    binding.members.retain(|m| m != member);
    if binding.members.is_empty() {
        policy.bindings.remove(index);
    }
    Ok(())
}

/// Derive a provider-safe custom role id from a role name (snake_case).
pub fn custom_role_id(role_name: &str) -> String {
    role_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GetPolicyRequest {
    options: PolicyOptions,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PolicyOptions {
    requested_policy_version: i32,
}

#[derive(Debug, Serialize)]
struct SetPolicyRequest {
    policy: IamPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CustomRole {
    #[serde(default)]
    name: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    included_permissions: Vec<String>,
    #[serde(default)]
    stage: String,
}

#[derive(Debug, Deserialize)]
struct RoleList {
    #[serde(default)]
    roles: Vec<CustomRole>,
}

#[derive(Debug, Deserialize)]
struct PermissionList {
    #[serde(default)]
    permissions: Vec<ProviderPermission>,
}

/// RBAC provider speaking an IAM-style REST API. The base URL is
/// configurable so environments and tests can point it anywhere.
pub struct GcpProvider {
    name: String,
    project: String,
    base_url: String,
    access_token: String,
    http: reqwest::Client,
}

impl GcpProvider {
    pub fn new(name: &str, config: &BasicConfig, http: reqwest::Client) -> Result<Self> {
        Ok(Self {
            name: name.to_string(),
            project: config.require("project")?.to_string(),
            base_url: config
                .get("api_base_url")
                .unwrap_or("https://cloudresourcemanager.googleapis.com")
                .trim_end_matches('/')
                .to_string(),
            access_token: config.require("access_token")?.to_string(),
            http,
        })
    }

    async fn get_policy(&self) -> Result<IamPolicy> {
        let url = format!(
            "{}/v1/projects/{}:getIamPolicy",
            self.base_url, self.project
        );
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.access_token)
            .json(&GetPolicyRequest {
                options: PolicyOptions {
                    requested_policy_version: POLICY_VERSION,
                },
            })
            .send()
            .await
            .map_err(|e| ServiceError::provider("GcpPolicyReadError", true, e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(ServiceError::provider(
                "GcpPolicyReadError",
                status.is_server_error(),
                format!("getIamPolicy returned {}", status),
            ));
        }
        response
            .json()
            .await
            .map_err(|e| ServiceError::provider("GcpPolicyReadError", false, e.to_string()))
    }

    async fn set_policy(&self, mut policy: IamPolicy) -> Result<()> {
        policy.version = POLICY_VERSION;
        let url = format!(
            "{}/v1/projects/{}:setIamPolicy",
            self.base_url, self.project
        );
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.access_token)
            .json(&SetPolicyRequest { policy })
            .send()
            .await
            .map_err(|e| ServiceError::provider("GcpRoleBindingError", true, e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(ServiceError::provider(
                "GcpRoleBindingError",
                status.is_server_error(),
                format!("setIamPolicy returned {}", status),
            ));
        }
        Ok(())
    }

    /// Materialize a custom role carrying exactly the requested permissions.
    /// An already-existing role is treated as success.
    async fn ensure_custom_role(&self, role_id: &str, role: &thand_shared::Role) -> Result<String> {
        let full_name = format!("projects/{}/roles/{}", self.project, role_id);
        let url = format!(
            "{}/v1/projects/{}/roles?roleId={}",
            self.base_url, self.project, role_id
        );
        let body = CustomRole {
            name: String::new(),
            title: role.name.clone(),
            description: role.description.clone(),
            included_permissions: role.permissions.allow.clone(),
            stage: "GA".to_string(),
        };

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.access_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                ServiceError::provider("GcpCustomRoleCreationError", true, e.to_string())
            })?;

        let status = response.status();
        if status.is_success() || status == reqwest::StatusCode::CONFLICT {
            tracing::info!(
                provider = %self.name,
                role = %full_name,
                existed = status == reqwest::StatusCode::CONFLICT,
                "Custom role materialized"
            );
            return Ok(full_name);
        }
        Err(ServiceError::provider(
            "GcpCustomRoleCreationError",
            status.is_server_error(),
            format!("role creation returned {}", status),
        ))
    }

    async fn fetch_role(&self, full_name: &str) -> Result<CustomRole> {
        let url = format!("{}/v1/{}", self.base_url, full_name);
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map_err(|e| ServiceError::provider("GcpRoleReadError", true, e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ServiceError::NotFound(format!("role {}", full_name)));
        }
        if !response.status().is_success() {
            let status = response.status();
            return Err(ServiceError::provider(
                "GcpRoleReadError",
                status.is_server_error(),
                format!("role read returned {}", status),
            ));
        }
        response
            .json()
            .await
            .map_err(|e| ServiceError::provider("GcpRoleReadError", false, e.to_string()))
    }

    /// Target platform role identifiers for a composite role: inherited
    /// predefined roles as-is, plus a materialized custom role when the role
    /// grants bare permissions.
    async fn resolve_targets(&self, role: &thand_shared::Role) -> Result<Vec<String>> {
        let mut targets: Vec<String> = role.inherits.clone();
        if !role.permissions.allow.is_empty() {
            let role_id = custom_role_id(&role.name);
            targets.push(self.ensure_custom_role(&role_id, role).await?);
        }
        if targets.is_empty() {
            return Err(ServiceError::Validation(format!(
                "role {} names neither inherited roles nor permissions",
                role.name
            )));
        }
        Ok(targets)
    }
}

#[async_trait]
impl RbacProvider for GcpProvider {
    async fn authorize_role(&self, req: &AuthorizeRoleRequest) -> Result<RoleGrant> {
        validate_member_email(&req.user.email)?;
        let member = format!("user:{}", req.user.email);

        let targets = self.resolve_targets(&req.role).await?;

        let mut policy = self.get_policy().await?;
        let mut changed = false;
        for target in &targets {
            changed |= upsert_tagged_member(&mut policy, target, &member);
        }
        if changed {
            self.set_policy(policy).await?;
        }

        tracing::info!(
            provider = %self.name,
            member = %member,
            roles = ?targets,
            changed = changed,
            "Role bindings applied"
        );
        Ok(RoleGrant {
            user_id: member,
            roles: targets,
        })
    }

    async fn revoke_role(&self, req: &AuthorizeRoleRequest, grant: &RoleGrant) -> Result<()> {
        if grant.roles.is_empty() {
            return Err(ServiceError::Validation(
                "revocation requires the authorization artefact".to_string(),
            ));
        }
        let member = if grant.user_id.is_empty() {
            format!("user:{}", req.user.email)
        } else {
            grant.user_id.clone()
        };

        let mut policy = self.get_policy().await?;
        for target in &grant.roles {
            // Custom roles are fetched before unbinding; predefined roles are
            // unbound by name.
            if target.starts_with("projects/") {
                match self.fetch_role(target).await {
                    Ok(_) => {}
                    Err(ServiceError::NotFound(_)) => {
                        tracing::warn!(
                            provider = %self.name,
                            role = %target,
                            "Custom role definition missing at revoke time"
                        );
                    }
                    Err(e) => return Err(e),
                }
            }
            remove_tagged_member(&mut policy, target, &member)?;
        }
        self.set_policy(policy).await?;

        tracing::info!(
            provider = %self.name,
            member = %member,
            roles = ?grant.roles,
            "Role bindings revoked"
        );
        Ok(())
    }

    async fn get_role(&self, name: &str) -> Result<ProviderRole> {
        let full_name = if name.starts_with("projects/") || name.starts_with("roles/") {
            name.to_string()
        } else {
            format!("projects/{}/roles/{}", self.project, name)
        };
        let role = self.fetch_role(&full_name).await?;
        Ok(ProviderRole {
            name: full_name,
            title: role.title,
            description: role.description,
            permissions: role.included_permissions,
        })
    }

    async fn list_roles(&self) -> Result<Vec<ProviderRole>> {
        let url = format!("{}/v1/projects/{}/roles", self.base_url, self.project);
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map_err(|e| ServiceError::provider("GcpRoleReadError", true, e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(ServiceError::provider(
                "GcpRoleReadError",
                status.is_server_error(),
                format!("role listing returned {}", status),
            ));
        }
        let list: RoleList = response
            .json()
            .await
            .map_err(|e| ServiceError::provider("GcpRoleReadError", false, e.to_string()))?;
        Ok(list
            .roles
            .into_iter()
            .map(|r| ProviderRole {
                name: r.name,
                title: r.title,
                description: r.description,
                permissions: r.included_permissions,
            })
            .collect())
    }

    async fn get_permission(&self, name: &str) -> Result<ProviderPermission> {
        let permissions = self.list_permissions(Some(name)).await?;
        permissions
            .into_iter()
            .find(|p| p.name == name)
            .ok_or_else(|| ServiceError::NotFound(format!("permission {}", name)))
    }

    async fn list_permissions(&self, filter: Option<&str>) -> Result<Vec<ProviderPermission>> {
        let url = format!("{}/v1/permissions:queryTestablePermissions", self.base_url);
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.access_token)
            .json(&serde_json::json!({
                "fullResourceName": format!("//cloudresourcemanager.googleapis.com/projects/{}", self.project),
                "pageSize": 1000,
            }))
            .send()
            .await
            .map_err(|e| ServiceError::provider("GcpPermissionReadError", true, e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(ServiceError::provider(
                "GcpPermissionReadError",
                status.is_server_error(),
                format!("permission listing returned {}", status),
            ));
        }
        let list: PermissionList = response
            .json()
            .await
            .map_err(|e| ServiceError::provider("GcpPermissionReadError", false, e.to_string()))?;

        Ok(match filter {
            Some(f) => list
                .permissions
                .into_iter()
                .filter(|p| p.name.contains(f))
                .collect(),
            None => list.permissions,
        })
    }
}
