// The elevation state machine:
//
//   START → AWAIT-AUTH → EVALUATE-ROLE → AWAIT-APPROVAL → BIND-ROLES
//         → ACTIVE (durable sleep) → REVOKE-ROLES → COMPLETED
//
// Rejection short-circuits after approval; cancellation during ACTIVE (or
// mid-bind) triggers an immediate revoke pass over the grant artefact.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use thand_shared::workflow::{
    signals, RetryPolicy, SignalOutcome, StepStatus, TimerOutcome, WorkflowCtx,
    WorkflowDefinition, WorkflowError, WorkflowSignal, WorkflowStatus, WorkflowTask,
};
use thand_shared::{Role, UserIdentity, WorkflowPolicy};

use super::activities::ElevationActivities;
use super::types::{ElevationInput, ElevationOutput, ProviderGrant};

pub const ELEVATION_WORKFLOW: &str = "elevation";

pub mod steps {
    pub const AWAIT_AUTH: &str = "await_auth";
    pub const EVALUATE_ROLE: &str = "evaluate_role";
    pub const AWAIT_APPROVAL: &str = "await_approval";
    pub const REJECT: &str = "reject";
    pub const BIND_ROLES: &str = "bind_roles";
    pub const ACTIVE: &str = "active";
    pub const REVOKE_ROLES: &str = "revoke_roles";
    pub const COMPLETED: &str = "completed";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalDecision {
    pub approved: bool,
    pub approver: String,
}

/// Validate an approval signal against the workflow policy. Returns the
/// decision, or the reason the signal must be ignored.
pub fn validate_approval_signal(
    signal: &WorkflowSignal,
    policy: &WorkflowPolicy,
    role: &Role,
    requester: &UserIdentity,
) -> Result<ApprovalDecision, String> {
    let signer = signal
        .user
        .as_deref()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| "signal carries no signer identity".to_string())?;

    if !policy.approvers.is_empty() && !policy.approvers.iter().any(|a| a == signer) {
        return Err(format!("{} is not a permitted approver", signer));
    }

    if signer == requester.email && !role.allow_self_approval {
        return Err(format!("{} cannot approve their own elevation", signer));
    }

    let approved = signal
        .data
        .get("approved")
        .and_then(|v| v.as_bool())
        .ok_or_else(|| "signal carries no approval decision".to_string())?;

    Ok(ApprovalDecision {
        approved,
        approver: signer.to_string(),
    })
}

pub struct ElevationWorkflow {
    activities: Arc<ElevationActivities>,
}

impl ElevationWorkflow {
    pub fn new(activities: Arc<ElevationActivities>) -> Self {
        Self { activities }
    }

    async fn await_authentication(
        &self,
        ctx: &WorkflowCtx,
        input: &ElevationInput,
    ) -> Result<UserIdentity, WorkflowError> {
        ctx.update_task(|t| t.set_step(steps::AWAIT_AUTH, StepStatus::Running));

        if let Some(requester) = &input.requester {
            ctx.update_task(|t| {
                t.user = Some(requester.clone());
                t.set_step(steps::AWAIT_AUTH, StepStatus::Completed);
            });
            return Ok(requester.clone());
        }

        // No usable session: suspend with a redirect whose state is this
        // task, sealed. The browser bounces through the IdP and lands on the
        // callback, which resumes us with the authenticated identity.
        let authenticators = if input.role.authenticators.is_empty() {
            input
                .request
                .authenticator
                .clone()
                .into_iter()
                .collect::<Vec<_>>()
        } else {
            input.role.authenticators.clone()
        };

        let activities = Arc::clone(&self.activities);
        let task_snapshot = ctx.task();
        let redirect = ctx
            .activity("prepare_auth_redirect", &RetryPolicy::no_retry(), || {
                activities.prepare_auth_redirect(&task_snapshot, &authenticators)
            })
            .await
            .map_err(|e| WorkflowError::ActivityFailed {
                activity_name: "prepare_auth_redirect".to_string(),
                error: e.to_string(),
            })?;

        ctx.update_task(|t| {
            t.context = serde_json::json!({
                "redirect_url": redirect.url,
                "authentication_provider": redirect.provider,
            });
        });
        ctx.set_status(WorkflowStatus::Suspended);

        match ctx.await_signal(signals::AUTHENTICATED).await {
            SignalOutcome::Signal(signal) => {
                let task: WorkflowTask =
                    serde_json::from_value(signal.data).map_err(|e| {
                        WorkflowError::SerializationError {
                            workflow_id: ctx.workflow_id().to_string(),
                            error: e.to_string(),
                        }
                    })?;
                let user = task.user.ok_or_else(|| WorkflowError::ValidationFailed {
                    errors: vec!["authentication callback carried no identity".to_string()],
                })?;
                ctx.update_task(|t| {
                    t.user = Some(user.clone());
                    t.authentication_provider = task.authentication_provider.clone();
                    t.set_step(steps::AWAIT_AUTH, StepStatus::Completed);
                });
                Ok(user)
            }
            _ => Err(WorkflowError::Cancelled {
                workflow_id: ctx.workflow_id().to_string(),
            }),
        }
    }

    async fn await_approval(
        &self,
        ctx: &WorkflowCtx,
        input: &ElevationInput,
        role: &Role,
        requester: &UserIdentity,
    ) -> Result<ApprovalDecision, WorkflowError> {
        ctx.update_task(|t| t.set_step(steps::AWAIT_APPROVAL, StepStatus::Running));

        let policy = input
            .policy
            .clone()
            .ok_or_else(|| WorkflowError::ValidationFailed {
                errors: vec![format!(
                    "role {} requires approval but no workflow policy was resolved",
                    role.name
                )],
            })?;

        {
            let activities = Arc::clone(&self.activities);
            let policy = policy.clone();
            let role_name = role.name.clone();
            let requester_email = requester.email.clone();
            let reason = input.request.reason.clone().unwrap_or_default();
            let workflow_id = ctx.workflow_id().to_string();
            let _ = ctx
                .activity("notify_approvers", &RetryPolicy::no_retry(), || {
                    activities.notify_approvers(
                        &policy,
                        &role_name,
                        &requester_email,
                        &reason,
                        &workflow_id,
                    )
                })
                .await;
        }

        let activities = Arc::clone(&self.activities);
        let timeout_secs = policy.approval_timeout_secs;
        let deadline: DateTime<Utc> = ctx
            .activity("approval_deadline", &RetryPolicy::no_retry(), || {
                activities.approval_deadline(timeout_secs)
            })
            .await
            .map_err(|e| WorkflowError::ActivityFailed {
                activity_name: "approval_deadline".to_string(),
                error: e.to_string(),
            })?;

        loop {
            match ctx.await_signal_until(signals::APPROVAL, deadline).await {
                SignalOutcome::Signal(signal) => {
                    match validate_approval_signal(&signal, &policy, role, requester) {
                        Ok(decision) => {
                            ctx.update_task(|t| {
                                t.approved = Some(decision.approved);
                                t.set_step(steps::AWAIT_APPROVAL, StepStatus::Completed);
                            });
                            ctx.upsert_search_attributes(
                                [(
                                    thand_shared::workflow::attributes::APPROVED.to_string(),
                                    serde_json::Value::Bool(decision.approved),
                                )]
                                .into(),
                            );
                            return Ok(decision);
                        }
                        Err(reason) => {
                            tracing::warn!(
                                workflow_id = %ctx.workflow_id(),
                                signer = ?signal.user,
                                reason = %reason,
                                "Ignoring approval signal"
                            );
                        }
                    }
                }
                SignalOutcome::TimedOut => {
                    return Err(WorkflowError::TimedOut {
                        workflow_name: ELEVATION_WORKFLOW.to_string(),
                        timeout_seconds: timeout_secs,
                    });
                }
                SignalOutcome::Cancelled => {
                    return Err(WorkflowError::Cancelled {
                        workflow_id: ctx.workflow_id().to_string(),
                    });
                }
            }
        }
    }
}

#[async_trait]
impl WorkflowDefinition for ElevationWorkflow {
    fn name(&self) -> &str {
        ELEVATION_WORKFLOW
    }

    async fn run(
        &self,
        ctx: WorkflowCtx,
        input: serde_json::Value,
    ) -> Result<serde_json::Value, WorkflowError> {
        let input: ElevationInput =
            serde_json::from_value(input).map_err(|e| WorkflowError::ValidationFailed {
                errors: vec![format!("malformed elevation input: {}", e)],
            })?;

        ctx.update_task(|t| {
            t.role = Some(input.role.name.clone());
            t.duration = input.request.duration.clone();
        });

        // AWAIT-AUTH
        let requester = self.await_authentication(&ctx, &input).await?;

        // EVALUATE-ROLE
        ctx.update_task(|t| t.set_step(steps::EVALUATE_ROLE, StepStatus::Running));
        let evaluated = {
            let activities = Arc::clone(&self.activities);
            let role = input.role.clone();
            let identities = input.request.identities.clone();
            let requester = requester.clone();
            ctx.activity("evaluate_role", &RetryPolicy::no_retry(), || {
                activities.evaluate_role(&role, &identities, &requester)
            })
            .await
            .map_err(|e| WorkflowError::ActivityFailed {
                activity_name: "evaluate_role".to_string(),
                error: e.to_string(),
            })?
        };
        ctx.update_task(|t| t.set_step(steps::EVALUATE_ROLE, StepStatus::Completed));

        // AWAIT-APPROVAL
        let decision = if evaluated.role.require_approval {
            self.await_approval(&ctx, &input, &evaluated.role, &requester)
                .await?
        } else {
            ApprovalDecision {
                approved: true,
                approver: String::new(),
            }
        };

        let mut output = ElevationOutput {
            role: evaluated.role.name.clone(),
            providers: evaluated.role.providers.clone(),
            approved: decision.approved,
            approved_by: if decision.approver.is_empty() {
                None
            } else {
                Some(decision.approver.clone())
            },
            ..Default::default()
        };

        if !decision.approved {
            // REJECT: terminal, nothing was bound.
            ctx.update_task(|t| t.set_step(steps::REJECT, StepStatus::Completed));
            tracing::info!(
                workflow_id = %ctx.workflow_id(),
                approver = %decision.approver,
                "Elevation rejected"
            );
            return Ok(serde_json::to_value(output).unwrap_or_default());
        }

        // BIND-ROLES: per (identity, provider); the grant artefact accumulates
        // exactly what was applied, so a cancellation mid-bind still revokes
        // every partial binding.
        ctx.update_task(|t| t.set_step(steps::BIND_ROLES, StepStatus::Running));
        let mut grants: Vec<ProviderGrant> = Vec::new();
        let mut bind_error: Option<WorkflowError> = None;

        'bind: for identity in &evaluated.identities {
            for provider in &evaluated.role.providers {
                // Stop binding once cancellation is requested, but never skip
                // a bind the journal already recorded: replay must rebuild
                // the same grant artefact.
                if ctx.is_cancel_requested() && !ctx.next_activity_recorded() {
                    break 'bind;
                }
                let activities = Arc::clone(&self.activities);
                let role = evaluated.role.clone();
                let identity = identity.clone();
                let activity_name = format!("bind:{}:{}", provider, identity.email);
                match ctx
                    .activity(&activity_name, &RetryPolicy::provider_calls(), || {
                        activities.bind_role(provider, &role, &identity)
                    })
                    .await
                {
                    Ok(grant) => grants.push(ProviderGrant {
                        provider: provider.clone(),
                        identity: identity.email.clone(),
                        grant,
                    }),
                    Err(e) => {
                        bind_error = Some(WorkflowError::ActivityFailed {
                            activity_name,
                            error: e.to_string(),
                        });
                        break 'bind;
                    }
                }
            }
        }

        let activities = Arc::clone(&self.activities);
        let authorized_at: DateTime<Utc> = ctx
            .activity("authorized_at", &RetryPolicy::no_retry(), || {
                activities.timestamp()
            })
            .await
            .map_err(|e| WorkflowError::ActivityFailed {
                activity_name: "authorized_at".to_string(),
                error: e.to_string(),
            })?;
        ctx.update_task(|t| {
            t.authorized_at = Some(authorized_at);
            t.set_step(steps::BIND_ROLES, StepStatus::Completed);
        });
        output.grants = grants.clone();
        output.authorized_at = Some(authorized_at);

        // ACTIVE: durable sleep until expiry. The deadline is absolute, so a
        // restart resumes the remaining time rather than the full duration.
        // The timer slot is always taken when binding succeeded, keeping the
        // durable-call sequence identical on replay; with a cancellation
        // pending it returns immediately.
        let mut cancelled = false;
        if bind_error.is_none() {
            ctx.update_task(|t| t.set_step(steps::ACTIVE, StepStatus::Running));
            let expiry = authorized_at + chrono::Duration::seconds(input.duration_secs as i64);
            match ctx.sleep_until(expiry).await {
                TimerOutcome::Fired => {}
                TimerOutcome::Cancelled => cancelled = true,
            }
            ctx.update_task(|t| t.set_step(steps::ACTIVE, StepStatus::Completed));
        }

        // REVOKE-ROLES: iterate the exact artefact captured at bind time.
        ctx.update_task(|t| t.set_step(steps::REVOKE_ROLES, StepStatus::Running));
        let mut revoke_errors: Vec<String> = Vec::new();
        for provider_grant in &grants {
            let activities = Arc::clone(&self.activities);
            let role = evaluated.role.clone();
            let provider_grant = provider_grant.clone();
            let activity_name = format!(
                "revoke:{}:{}",
                provider_grant.provider, provider_grant.identity
            );
            if let Err(e) = ctx
                .activity(&activity_name, &RetryPolicy::provider_calls(), || {
                    activities.revoke_role(
                        &provider_grant.provider,
                        &role,
                        &provider_grant.identity,
                        &provider_grant.grant,
                    )
                })
                .await
            {
                revoke_errors.push(format!("{}: {}", activity_name, e));
            }
        }

        let activities = Arc::clone(&self.activities);
        let revoked_at: DateTime<Utc> = ctx
            .activity("revoked_at", &RetryPolicy::no_retry(), || {
                activities.timestamp()
            })
            .await
            .map_err(|e| WorkflowError::ActivityFailed {
                activity_name: "revoked_at".to_string(),
                error: e.to_string(),
            })?;
        ctx.update_task(|t| t.set_step(steps::REVOKE_ROLES, StepStatus::Completed));
        output.revoked_at = Some(revoked_at);
        output.cancelled = cancelled;

        if let Some(err) = bind_error {
            return Err(err);
        }
        if !revoke_errors.is_empty() {
            return Err(WorkflowError::ActivityFailed {
                activity_name: steps::REVOKE_ROLES.to_string(),
                error: revoke_errors.join("; "),
            });
        }

        ctx.update_task(|t| {
            t.set_step(steps::COMPLETED, StepStatus::Completed);
            t.output = serde_json::to_value(&output).ok();
        });

        if cancelled {
            tracing::info!(
                workflow_id = %ctx.workflow_id(),
                "Elevation cancelled; bindings revoked"
            );
            return Err(WorkflowError::Cancelled {
                workflow_id: ctx.workflow_id().to_string(),
            });
        }

        tracing::info!(
            workflow_id = %ctx.workflow_id(),
            role = %output.role,
            grants = output.grants.len(),
            "Elevation completed"
        );
        Ok(serde_json::to_value(output).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(approvers: &[&str]) -> WorkflowPolicy {
        WorkflowPolicy {
            name: "default-approval".to_string(),
            approvers: approvers.iter().map(|a| a.to_string()).collect(),
            notifiers: vec![],
            approval_timeout_secs: 3600,
        }
    }

    fn signal(user: Option<&str>, approved: bool) -> WorkflowSignal {
        let mut s = WorkflowSignal::new(
            signals::APPROVAL,
            "/approvals",
            serde_json::json!({ "approved": approved }),
        );
        s.user = user.map(|u| u.to_string());
        s
    }

    fn requester() -> UserIdentity {
        UserIdentity::from_email("dev@example.com")
    }

    #[test]
    fn test_approval_requires_signer() {
        let role = Role::named("readonly");
        let err = validate_approval_signal(&signal(None, true), &policy(&[]), &role, &requester())
            .unwrap_err();
        assert!(err.contains("signer"));
    }

    #[test]
    fn test_approver_list_enforced() {
        let role = Role::named("readonly");
        let p = policy(&["secops@example.com"]);

        assert!(validate_approval_signal(
            &signal(Some("secops@example.com"), true),
            &p,
            &role,
            &requester()
        )
        .is_ok());

        assert!(validate_approval_signal(
            &signal(Some("random@example.com"), true),
            &p,
            &role,
            &requester()
        )
        .is_err());
    }

    #[test]
    fn test_self_approval_denied_by_default() {
        let role = Role::named("readonly");
        let err = validate_approval_signal(
            &signal(Some("dev@example.com"), true),
            &policy(&[]),
            &role,
            &requester(),
        )
        .unwrap_err();
        assert!(err.contains("own elevation"));
    }

    #[test]
    fn test_self_approval_allowed_when_role_permits() {
        let mut role = Role::named("sandbox");
        role.allow_self_approval = true;
        let decision = validate_approval_signal(
            &signal(Some("dev@example.com"), true),
            &policy(&[]),
            &role,
            &requester(),
        )
        .unwrap();
        assert!(decision.approved);
        assert_eq!(decision.approver, "dev@example.com");
    }

    #[test]
    fn test_rejection_decision() {
        let role = Role::named("readonly");
        let decision = validate_approval_signal(
            &signal(Some("secops@example.com"), false),
            &policy(&["secops@example.com"]),
            &role,
            &requester(),
        )
        .unwrap();
        assert!(!decision.approved);
    }
}
