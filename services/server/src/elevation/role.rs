// Role catalog, composite evaluation and dynamic role synthesis

use chrono::Utc;
use std::collections::HashMap;
use std::time::Duration;

use thand_shared::{parse_duration, Result, Role, ServiceError, UserIdentity, WorkflowPolicy};

use super::types::ElevateRequest;

/// A validated elevation ready for workflow bootstrap.
#[derive(Debug, Clone)]
pub struct ResolvedElevation {
    pub role: Role,
    pub policy: Option<WorkflowPolicy>,
    pub duration: Duration,
}

/// Catalog of elevatable roles and approval workflow policies.
pub struct RoleCatalog {
    roles: HashMap<String, Role>,
    workflows: HashMap<String, WorkflowPolicy>,
}

impl RoleCatalog {
    pub fn new(roles: HashMap<String, Role>, workflows: HashMap<String, WorkflowPolicy>) -> Self {
        Self { roles, workflows }
    }

    pub fn role(&self, name: &str) -> Result<Role> {
        let role = self
            .roles
            .get(name)
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(format!("role {}", name)))?;
        if !role.enabled {
            return Err(ServiceError::Forbidden(format!("role {} is disabled", name)));
        }
        Ok(role)
    }

    pub fn roles(&self) -> Vec<Role> {
        let mut roles: Vec<Role> = self.roles.values().cloned().collect();
        roles.sort_by(|a, b| a.name.cmp(&b.name));
        roles
    }

    pub fn workflow(&self, name: &str) -> Result<WorkflowPolicy> {
        self.workflows
            .get(name)
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(format!("workflow {}", name)))
    }

    pub fn workflows(&self) -> Vec<WorkflowPolicy> {
        let mut policies: Vec<WorkflowPolicy> = self.workflows.values().cloned().collect();
        policies.sort_by(|a, b| a.name.cmp(&b.name));
        policies
    }

    /// Validate an elevation request and resolve its role, approval policy
    /// and duration.
    pub fn resolve(&self, request: &ElevateRequest) -> Result<ResolvedElevation> {
        let reason = request.reason.as_deref().unwrap_or("").trim();
        if reason.is_empty() {
            return Err(ServiceError::Validation("reason is required".to_string()));
        }

        let duration_str = request
            .duration
            .as_deref()
            .ok_or_else(|| ServiceError::Validation("duration is required".to_string()))?;
        let duration = parse_duration(duration_str)?;

        let mut role = match &request.role {
            Some(name) => self.role(name)?,
            None => self.synthesize_dynamic(request)?,
        };

        // Providers from the request override the role's defaults.
        if !request.providers.is_empty() {
            role.providers = request.providers.clone();
        }
        if role.providers.is_empty() {
            return Err(ServiceError::Validation(
                "at least one provider is required".to_string(),
            ));
        }

        let workflow_name = request
            .workflow
            .clone()
            .or_else(|| role.workflows.first().cloned());

        let policy = match workflow_name {
            Some(name) => Some(self.workflow(&name)?),
            None if role.require_approval => {
                return Err(ServiceError::Validation(format!(
                    "role {} requires approval but names no workflow",
                    role.name
                )))
            }
            None => None,
        };

        Ok(ResolvedElevation {
            role,
            policy,
            duration,
        })
    }

    /// Synthesize an ad-hoc role from bare permissions and inherited
    /// provider roles.
    fn synthesize_dynamic(&self, request: &ElevateRequest) -> Result<Role> {
        if request.permissions.is_empty() && request.inherits.is_empty() {
            return Err(ServiceError::Validation(
                "either permissions or inherits is required".to_string(),
            ));
        }

        let mut role = Role::named(&format!(
            "dynamic-role-{}",
            Utc::now().format("%Y%m%d-%H%M%S")
        ));
        role.description = request.reason.clone().unwrap_or_default();
        role.permissions.allow = request.permissions.clone();
        role.inherits = request.inherits.clone();
        role.providers = request.providers.clone();
        if let Some(scopes) = &request.scopes {
            role.scopes = scopes.clone();
        }
        Ok(role)
    }
}

/// Compose a role with an identity overlay, failing closed on any scope or
/// permission violation.
pub fn composite_role(role: &Role, identity: &UserIdentity) -> Result<Role> {
    let scopes = &role.scopes;

    if !scopes.users.is_empty() && !scopes.users.iter().any(|u| u == &identity.email) {
        return Err(ServiceError::Forbidden(format!(
            "{} is not in the role's user scope",
            identity.email
        )));
    }

    if !scopes.domains.is_empty() {
        let domain = identity.email.rsplit('@').next().unwrap_or_default();
        if !scopes.domains.iter().any(|d| d == domain) {
            return Err(ServiceError::Forbidden(format!(
                "domain {} is not in the role's domain scope",
                domain
            )));
        }
    }

    let mut allowed_groups = scopes.groups.clone();
    allowed_groups.extend(role.groups.iter().cloned());
    if !allowed_groups.is_empty()
        && !identity.groups.iter().any(|g| allowed_groups.contains(g))
    {
        return Err(ServiceError::Forbidden(format!(
            "{} is not a member of any permitted group",
            identity.email
        )));
    }

    // Denied permissions always win over allowed ones.
    let denied: Vec<&String> = role
        .permissions
        .allow
        .iter()
        .filter(|p| role.permissions.deny.contains(p))
        .collect();
    if !denied.is_empty() {
        return Err(ServiceError::Forbidden(format!(
            "requested permissions are denied by policy: {:?}",
            denied
        )));
    }

    Ok(role.clone())
}
