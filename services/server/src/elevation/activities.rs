// Provider-facing activities of the elevation workflow

use chrono::{DateTime, Utc};
use std::sync::Arc;

use thand_shared::crypto::EncryptionService;
use thand_shared::envelope::{Envelope, EnvelopeKind};
use thand_shared::workflow::{ActivityError, WorkflowTask};
use thand_shared::{UserIdentity, WorkflowPolicy};

use super::types::{AuthRedirect, EvaluatedRole};
use crate::providers::{
    AuthorizeRoleRequest, AuthorizeUser, Notification, ProviderRegistry, RoleGrant,
};

/// Activity implementations used by the elevation workflow. Everything here
/// may be retried by the runtime; provider errors carry a classified kind and
/// retryability.
pub struct ElevationActivities {
    registry: Arc<ProviderRegistry>,
    encryption: Arc<EncryptionService>,
    public_url: String,
}

impl ElevationActivities {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        encryption: Arc<EncryptionService>,
        public_url: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            encryption,
            public_url: public_url.into(),
        }
    }

    pub fn acs_url(&self, provider: &str) -> String {
        format!(
            "{}/api/v1/auth/callback/{}",
            self.public_url.trim_end_matches('/'),
            provider
        )
    }

    /// Build the IdP redirect for a suspended workflow. The opaque state is
    /// the sealed task envelope, so the callback can resume this execution.
    pub async fn prepare_auth_redirect(
        &self,
        task: &WorkflowTask,
        authenticators: &[String],
    ) -> Result<AuthRedirect, ActivityError> {
        let provider_name = authenticators
            .iter()
            .find(|name| self.registry.authorizer(name).is_ok())
            .ok_or_else(|| ActivityError::Validation {
                message: "no usable authentication provider configured".to_string(),
            })?;

        let authorizer = self.registry.authorizer(provider_name)?;
        let state = Envelope::seal_payload(EnvelopeKind::WorkflowTask, task, &self.encryption)
            .map_err(ActivityError::from)?;

        let response = authorizer
            .authorize_session(AuthorizeUser {
                scopes: Vec::new(),
                state,
                code: None,
                redirect_uri: self.acs_url(provider_name),
            })
            .await?;

        Ok(AuthRedirect {
            provider: provider_name.clone(),
            url: response.url,
        })
    }

    /// Resolve the composite role for every target identity, failing closed
    /// on scope violations.
    pub async fn evaluate_role(
        &self,
        role: &thand_shared::Role,
        identity_emails: &[String],
        requester: &UserIdentity,
    ) -> Result<EvaluatedRole, ActivityError> {
        // Targets default to the requester.
        let identities: Vec<UserIdentity> = if identity_emails.is_empty() {
            vec![requester.clone()]
        } else {
            identity_emails
                .iter()
                .map(|email| {
                    if email == &requester.email {
                        requester.clone()
                    } else {
                        UserIdentity::from_email(email)
                    }
                })
                .collect()
        };

        let composite = super::role::composite_role(role, requester)?;
        for identity in &identities {
            if identity.email != requester.email {
                super::role::composite_role(role, identity)?;
            }
        }

        Ok(EvaluatedRole {
            role: composite,
            identities,
        })
    }

    /// Fan the approval request out to the policy's notifiers. Delivery
    /// failures are logged and swallowed; approvers can still act through
    /// the execution link.
    pub async fn notify_approvers(
        &self,
        policy: &WorkflowPolicy,
        role_name: &str,
        requester: &str,
        reason: &str,
        workflow_id: &str,
    ) -> Result<u32, ActivityError> {
        let notification = Notification {
            title: format!("Elevation requested: {}", role_name),
            message: format!("{} requests {} — {}", requester, role_name, reason),
            link: Some(format!(
                "{}/api/v1/execution/{}",
                self.public_url.trim_end_matches('/'),
                workflow_id
            )),
            recipients: policy.approvers.clone(),
        };

        let mut delivered = 0;
        for name in &policy.notifiers {
            match self.registry.notifier(name) {
                Ok(notifier) => match notifier.notify(&notification).await {
                    Ok(()) => delivered += 1,
                    Err(e) => {
                        tracing::warn!(notifier = %name, error = %e, "Approval notification failed")
                    }
                },
                Err(e) => {
                    tracing::warn!(notifier = %name, error = %e, "Notifier not available")
                }
            }
        }
        Ok(delivered)
    }

    /// Journaled wall-clock reads keep the workflow deterministic on replay.
    pub async fn timestamp(&self) -> Result<DateTime<Utc>, ActivityError> {
        Ok(Utc::now())
    }

    pub async fn approval_deadline(
        &self,
        timeout_secs: u64,
    ) -> Result<DateTime<Utc>, ActivityError> {
        Ok(Utc::now() + chrono::Duration::seconds(timeout_secs as i64))
    }

    pub async fn bind_role(
        &self,
        provider: &str,
        role: &thand_shared::Role,
        identity: &UserIdentity,
    ) -> Result<RoleGrant, ActivityError> {
        let rbac = self.registry.rbac(provider)?;
        let grant = rbac
            .authorize_role(&AuthorizeRoleRequest {
                user: identity.clone(),
                role: role.clone(),
            })
            .await?;
        tracing::info!(
            provider = %provider,
            identity = %identity.email,
            roles = ?grant.roles,
            "Bind step applied"
        );
        Ok(grant)
    }

    /// Revoke exactly what the grant artefact records.
    pub async fn revoke_role(
        &self,
        provider: &str,
        role: &thand_shared::Role,
        identity_email: &str,
        grant: &RoleGrant,
    ) -> Result<(), ActivityError> {
        let rbac = self.registry.rbac(provider)?;
        rbac.revoke_role(
            &AuthorizeRoleRequest {
                user: UserIdentity::from_email(identity_email),
                role: role.clone(),
            },
            grant,
        )
        .await?;
        tracing::info!(
            provider = %provider,
            identity = %identity_email,
            roles = ?grant.roles,
            "Revoke step applied"
        );
        Ok(())
    }
}
