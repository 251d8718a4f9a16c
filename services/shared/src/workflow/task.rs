use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::types::UserIdentity;

pub type SearchAttributes = HashMap<String, serde_json::Value>;

/// Well-known search attribute keys, indexed for later query.
pub mod attributes {
    pub const USER: &str = "user";
    pub const ROLE: &str = "role";
    pub const WORKFLOW: &str = "workflow";
    pub const TASK: &str = "task";
    pub const STATUS: &str = "status";
    pub const APPROVED: &str = "approved";
    pub const REASON: &str = "reason";
    pub const DURATION: &str = "duration";
    pub const IDENTITIES: &str = "identities";
    pub const PROVIDERS: &str = "providers";
}

/// Well-known signal names.
pub mod signals {
    pub const APPROVAL: &str = "approval";
    pub const AUTHENTICATED: &str = "authenticated";
    pub const FORM: &str = "form";
    pub const CANCEL: &str = "cancel";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Waiting,
    Suspended,
    Completed,
    Failed,
    Cancelled,
    Terminated,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed
                | WorkflowStatus::Failed
                | WorkflowStatus::Cancelled
                | WorkflowStatus::Terminated
        )
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkflowStatus::Pending => "pending",
            WorkflowStatus::Running => "running",
            WorkflowStatus::Waiting => "waiting",
            WorkflowStatus::Suspended => "suspended",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Cancelled => "cancelled",
            WorkflowStatus::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

/// Durable execution record of a single elevation. Roundtrippable through a
/// `WORKFLOW_TASK` envelope so it can ride through an IdP redirect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowTask {
    pub workflow_id: String,
    pub workflow_name: String,
    /// Current step reference.
    #[serde(default)]
    pub task_reference: String,
    #[serde(default)]
    pub step_status: HashMap<String, StepStatus>,
    pub input: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    /// Accumulated workflow context (elevation request plus gathered state).
    #[serde(default)]
    pub context: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<UserIdentity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authentication_provider: Option<String>,
    pub status: WorkflowStatus,
    /// Tri-state approval outcome.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorized_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
}

impl WorkflowTask {
    pub fn new(workflow_id: &str, workflow_name: &str, input: serde_json::Value) -> Self {
        Self {
            workflow_id: workflow_id.to_string(),
            workflow_name: workflow_name.to_string(),
            task_reference: String::new(),
            step_status: HashMap::new(),
            input,
            output: None,
            context: serde_json::Value::Null,
            user: None,
            role: None,
            authentication_provider: None,
            status: WorkflowStatus::Pending,
            approved: None,
            authorized_at: None,
            duration: None,
        }
    }

    pub fn set_step(&mut self, step: &str, status: StepStatus) {
        self.task_reference = step.to_string();
        self.step_status.insert(step.to_string(), status);
    }
}

/// Externally delivered workflow signal, shaped as a CloudEvent with the
/// signer's identity carried in the `user` extension.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSignal {
    #[serde(default = "default_specversion")]
    pub specversion: String,
    pub id: String,
    pub source: String,
    #[serde(rename = "type")]
    pub event_type: String,
    /// Signer identity (CloudEvent extension).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default = "Utc::now")]
    pub time: DateTime<Utc>,
}

fn default_specversion() -> String {
    "1.0".to_string()
}

impl WorkflowSignal {
    pub fn new(event_type: &str, source: &str, data: serde_json::Value) -> Self {
        Self {
            specversion: default_specversion(),
            id: Uuid::new_v4().to_string(),
            source: source.to_string(),
            event_type: event_type.to_string(),
            user: None,
            data,
            time: Utc::now(),
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(WorkflowStatus::Completed.is_terminal());
        assert!(WorkflowStatus::Cancelled.is_terminal());
        assert!(!WorkflowStatus::Running.is_terminal());
        assert!(!WorkflowStatus::Suspended.is_terminal());
    }

    #[test]
    fn test_task_step_tracking() {
        let mut task = WorkflowTask::new("wf-1", "elevate", serde_json::json!({}));
        task.set_step("bind_roles", StepStatus::Running);
        assert_eq!(task.task_reference, "bind_roles");
        task.set_step("bind_roles", StepStatus::Completed);
        assert_eq!(
            task.step_status.get("bind_roles"),
            Some(&StepStatus::Completed)
        );
    }

    #[test]
    fn test_signal_cloudevent_shape() {
        let signal = WorkflowSignal::new("approval", "/approvals", serde_json::json!({"approved": true}))
            .with_user("approver@example.com");
        let json = serde_json::to_value(&signal).unwrap();
        assert_eq!(json["specversion"], "1.0");
        assert_eq!(json["type"], "approval");
        assert_eq!(json["user"], "approver@example.com");
    }
}
