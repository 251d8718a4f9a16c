use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::error::{FailureKind, RuntimeError, WorkflowError, WorkflowFailure};
use super::journal::{journal_path, list_journals, read_journal, Journal, JournalEvent};
use super::retry::RetryPolicy;
use super::task::{SearchAttributes, WorkflowStatus, WorkflowTask, WorkflowSignal};
use crate::workflow::ActivityError;

/// A registered workflow implementation. One instance serves all executions
/// of its name; per-execution state flows through the [`WorkflowCtx`].
#[async_trait]
pub trait WorkflowDefinition: Send + Sync {
    fn name(&self) -> &str;

    async fn run(
        &self,
        ctx: WorkflowCtx,
        input: serde_json::Value,
    ) -> Result<serde_json::Value, WorkflowError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerOutcome {
    Fired,
    Cancelled,
}

#[derive(Debug, Clone)]
pub enum SignalOutcome {
    Signal(WorkflowSignal),
    Cancelled,
    TimedOut,
}

/// Snapshot of one workflow execution for status queries and listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecutionView {
    pub workflow_id: String,
    pub workflow_name: String,
    pub status: WorkflowStatus,
    pub task: WorkflowTask,
    pub search_attributes: SearchAttributes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<WorkflowFailure>,
    pub started_at: DateTime<Utc>,
}

struct InstanceState {
    history: Vec<JournalEvent>,
    task: WorkflowTask,
    search_attributes: SearchAttributes,
    failure: Option<WorkflowFailure>,
    started_at: DateTime<Utc>,
}

/// Shared core of one workflow instance. Handlers never touch this directly;
/// all interaction goes through the runtime's signal/query surface.
pub struct InstanceShared {
    workflow_id: String,
    workflow_name: String,
    journal: Mutex<Journal>,
    state: Mutex<InstanceState>,
    signal_notify: Notify,
    cancel: CancellationToken,
}

impl InstanceShared {
    fn record(&self, event: JournalEvent) {
        let mut state = self.state.lock().unwrap();
        self.append_locked(&mut state, event);
    }

    fn append_locked(&self, state: &mut InstanceState, event: JournalEvent) {
        if let Err(e) = self.journal.lock().unwrap().append(&event) {
            // A failed journal write is unrecoverable for durability, but the
            // in-memory run continues; the instance will not replay correctly.
            tracing::error!(workflow_id = %self.workflow_id, error = %e, "Journal append failed");
        }
        state.history.push(event);
    }

    fn input(&self) -> serde_json::Value {
        let state = self.state.lock().unwrap();
        state
            .history
            .iter()
            .find_map(|e| match e {
                JournalEvent::Started { input, .. } => Some(input.clone()),
                _ => None,
            })
            .unwrap_or(serde_json::Value::Null)
    }

    fn recorded_activity(&self, seq: u64) -> Option<Result<serde_json::Value, (String, String)>> {
        let state = self.state.lock().unwrap();
        state.history.iter().find_map(|e| match e {
            JournalEvent::ActivityCompleted { seq: s, result, .. } if *s == seq => {
                Some(Ok(result.clone()))
            }
            JournalEvent::ActivityFailed {
                seq: s, kind, error, ..
            } if *s == seq => Some(Err((kind.clone(), error.clone()))),
            _ => None,
        })
    }

    /// Returns the timer deadline and whether it already fired. Records the
    /// timer start on first encounter so the deadline is stable across
    /// restarts.
    fn timer_state(&self, seq: u64, requested_fire_at: DateTime<Utc>) -> (DateTime<Utc>, bool) {
        let mut state = self.state.lock().unwrap();
        let mut fire_at = None;
        let mut fired = false;
        for event in &state.history {
            match event {
                JournalEvent::TimerStarted { seq: s, fire_at: f } if *s == seq => {
                    fire_at = Some(*f);
                }
                JournalEvent::TimerFired { seq: s } if *s == seq => {
                    fired = true;
                }
                _ => {}
            }
        }
        match fire_at {
            Some(f) => (f, fired),
            None => {
                self.append_locked(
                    &mut state,
                    JournalEvent::TimerStarted {
                        seq,
                        fire_at: requested_fire_at,
                    },
                );
                (requested_fire_at, false)
            }
        }
    }

    fn nth_signal(&self, name: &str, index: usize) -> Option<WorkflowSignal> {
        let state = self.state.lock().unwrap();
        state
            .history
            .iter()
            .filter_map(|e| match e {
                JournalEvent::SignalReceived { signal } if signal.event_type == name => {
                    Some(signal.clone())
                }
                _ => None,
            })
            .nth(index)
    }

    fn set_status(&self, status: WorkflowStatus) {
        let mut state = self.state.lock().unwrap();
        if !state.task.status.is_terminal() {
            state.task.status = status;
            state.search_attributes.insert(
                super::task::attributes::STATUS.to_string(),
                serde_json::Value::String(status.to_string()),
            );
        }
    }

    fn update_task(&self, f: impl FnOnce(&mut WorkflowTask)) {
        let mut state = self.state.lock().unwrap();
        f(&mut state.task);
    }

    fn upsert_search_attributes(&self, attributes: SearchAttributes) {
        let mut state = self.state.lock().unwrap();
        let changed: SearchAttributes = attributes
            .into_iter()
            .filter(|(k, v)| state.search_attributes.get(k) != Some(v))
            .collect();
        if changed.is_empty() {
            return;
        }
        for (k, v) in &changed {
            state.search_attributes.insert(k.clone(), v.clone());
        }
        self.append_locked(
            &mut state,
            JournalEvent::SearchAttributesUpserted {
                attributes: changed,
            },
        );
    }

    /// Idempotent terminal transition. Returns false when already terminal.
    fn try_finish(&self, status: WorkflowStatus, event: JournalEvent) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.task.status.is_terminal() {
            return false;
        }
        match &event {
            JournalEvent::Completed { output, .. } => {
                state.task.output = Some(output.clone());
            }
            JournalEvent::Failed { failure, .. } => {
                state.failure = Some(failure.clone());
            }
            JournalEvent::Terminated { reason, .. } => {
                state.failure = Some(WorkflowFailure {
                    kind: FailureKind::Terminated,
                    message: reason.clone(),
                    step: Some(state.task.task_reference.clone()),
                    cause: None,
                    stack: Vec::new(),
                });
            }
            _ => {}
        }
        state.task.status = status;
        state.search_attributes.insert(
            super::task::attributes::STATUS.to_string(),
            serde_json::Value::String(status.to_string()),
        );
        self.append_locked(&mut state, event);
        true
    }

    fn view(&self) -> WorkflowExecutionView {
        let state = self.state.lock().unwrap();
        WorkflowExecutionView {
            workflow_id: self.workflow_id.clone(),
            workflow_name: self.workflow_name.clone(),
            status: state.task.status,
            task: state.task.clone(),
            search_attributes: state.search_attributes.clone(),
            output: state.task.output.clone(),
            failure: state.failure.clone(),
            started_at: state.started_at,
        }
    }

    fn is_terminal(&self) -> bool {
        self.state.lock().unwrap().task.status.is_terminal()
    }

    fn cancel_requested_in_history(&self) -> bool {
        let state = self.state.lock().unwrap();
        state
            .history
            .iter()
            .any(|e| matches!(e, JournalEvent::CancelRequested { .. }))
    }
}

/// Per-execution handle passed to workflow definitions. Durable calls are
/// sequence-numbered in program order, which is what makes replay
/// deterministic: the same code path yields the same sequence, and recorded
/// results short-circuit re-execution.
///
/// Cancellation interrupts timers and signal waits but never a running
/// activity; compensation paths (revocation) keep full use of `activity`
/// after a cancel has been requested.
#[derive(Clone)]
pub struct WorkflowCtx {
    shared: Arc<InstanceShared>,
    seq: Arc<AtomicU64>,
    signal_cursors: Arc<Mutex<HashMap<String, usize>>>,
}

impl WorkflowCtx {
    fn new(shared: Arc<InstanceShared>) -> Self {
        Self {
            shared,
            seq: Arc::new(AtomicU64::new(0)),
            signal_cursors: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn workflow_id(&self) -> &str {
        &self.shared.workflow_id
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// True when the journal already holds an outcome for the next durable
    /// call. Replaying workflows must consume recorded activities before
    /// acting on a cancellation flag, or the replayed path would diverge
    /// from the one that was journaled.
    pub fn next_activity_recorded(&self) -> bool {
        let next_seq = self.seq.load(Ordering::SeqCst) + 1;
        self.shared.recorded_activity(next_seq).is_some()
    }

    pub fn task(&self) -> WorkflowTask {
        self.shared.state.lock().unwrap().task.clone()
    }

    pub fn update_task(&self, f: impl FnOnce(&mut WorkflowTask)) {
        self.shared.update_task(f);
    }

    pub fn set_status(&self, status: WorkflowStatus) {
        self.shared.set_status(status);
    }

    pub fn upsert_search_attributes(&self, attributes: SearchAttributes) {
        self.shared.upsert_search_attributes(attributes);
    }

    /// Execute an activity with journal-backed memoization. On replay a
    /// recorded outcome is returned without re-executing. Retryable errors
    /// are retried per `policy` with exponential backoff.
    pub async fn activity<O, Fut>(
        &self,
        name: &str,
        policy: &RetryPolicy,
        mut run: impl FnMut() -> Fut,
    ) -> Result<O, ActivityError>
    where
        O: Serialize + DeserializeOwned,
        Fut: std::future::Future<Output = Result<O, ActivityError>>,
    {
        let seq = self.next_seq();

        if let Some(recorded) = self.shared.recorded_activity(seq) {
            return match recorded {
                Ok(value) => serde_json::from_value(value).map_err(|e| {
                    ActivityError::Serialization {
                        message: format!("replayed activity {}: {}", name, e),
                    }
                }),
                Err((kind, error)) => Err(ActivityError::Provider {
                    kind,
                    retryable: false,
                    message: error,
                }),
            };
        }

        let mut attempt: u32 = 0;
        loop {
            match run().await {
                Ok(output) => {
                    let value = serde_json::to_value(&output).map_err(|e| {
                        ActivityError::Serialization {
                            message: e.to_string(),
                        }
                    })?;
                    self.shared.record(JournalEvent::ActivityCompleted {
                        seq,
                        name: name.to_string(),
                        result: value,
                        completed_at: Utc::now(),
                    });
                    return Ok(output);
                }
                Err(err) if err.is_retryable() && attempt + 1 < policy.max_attempts => {
                    attempt += 1;
                    let delay = policy.calculate_delay(attempt);
                    tracing::warn!(
                        workflow_id = %self.shared.workflow_id,
                        activity = %name,
                        attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Activity failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    self.shared.record(JournalEvent::ActivityFailed {
                        seq,
                        name: name.to_string(),
                        kind: err.kind(),
                        error: err.to_string(),
                        failed_at: Utc::now(),
                    });
                    return Err(err);
                }
            }
        }
    }

    /// Durable timer. The deadline is journaled on first encounter, so a
    /// restart resumes the original deadline rather than restarting the
    /// clock.
    pub async fn sleep_until(&self, fire_at: DateTime<Utc>) -> TimerOutcome {
        let seq = self.next_seq();
        let (deadline, fired) = self.shared.timer_state(seq, fire_at);
        if fired {
            return TimerOutcome::Fired;
        }
        // A journaled cancellation with no fire event means the original run
        // observed the cancel first; replay must take the same branch even if
        // the deadline has since passed.
        if self.shared.cancel_requested_in_history() {
            return TimerOutcome::Cancelled;
        }

        loop {
            let now = Utc::now();
            if now >= deadline {
                self.shared.record(JournalEvent::TimerFired { seq });
                return TimerOutcome::Fired;
            }
            let remaining = (deadline - now).to_std().unwrap_or_default();
            tokio::select! {
                _ = tokio::time::sleep(remaining) => {}
                _ = self.shared.cancel.cancelled() => return TimerOutcome::Cancelled,
            }
        }
    }

    /// Wait for the next unconsumed signal of the given type. Signals already
    /// in the journal are consumed in order, which makes replay transparent.
    pub async fn await_signal(&self, name: &str) -> SignalOutcome {
        let index = self.take_signal_cursor(name);
        self.shared.set_status(WorkflowStatus::Waiting);

        let outcome = loop {
            let notified = self.shared.signal_notify.notified();
            if let Some(signal) = self.shared.nth_signal(name, index) {
                break SignalOutcome::Signal(signal);
            }
            if self.shared.cancel.is_cancelled() {
                break SignalOutcome::Cancelled;
            }
            notified.await;
        };

        self.shared.set_status(WorkflowStatus::Running);
        outcome
    }

    /// Like `await_signal` with an absolute deadline.
    pub async fn await_signal_until(
        &self,
        name: &str,
        deadline: DateTime<Utc>,
    ) -> SignalOutcome {
        let index = self.take_signal_cursor(name);
        self.shared.set_status(WorkflowStatus::Waiting);

        let outcome = loop {
            let notified = self.shared.signal_notify.notified();
            if let Some(signal) = self.shared.nth_signal(name, index) {
                break SignalOutcome::Signal(signal);
            }
            if self.shared.cancel.is_cancelled() {
                break SignalOutcome::Cancelled;
            }
            let now = Utc::now();
            if now >= deadline {
                break SignalOutcome::TimedOut;
            }
            let remaining = (deadline - now).to_std().unwrap_or_default();
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(remaining) => {}
            }
        };

        self.shared.set_status(WorkflowStatus::Running);
        outcome
    }

    fn take_signal_cursor(&self, name: &str) -> usize {
        let mut cursors = self.signal_cursors.lock().unwrap();
        let entry = cursors.entry(name.to_string()).or_insert(0);
        let index = *entry;
        *entry += 1;
        index
    }
}

/// The durable workflow runtime: owns all instances, their journals and their
/// driver tasks.
pub struct WorkflowRuntime {
    dir: PathBuf,
    definitions: RwLock<HashMap<String, Arc<dyn WorkflowDefinition>>>,
    instances: Mutex<HashMap<String, Arc<InstanceShared>>>,
    handles: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl WorkflowRuntime {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            definitions: RwLock::new(HashMap::new()),
            instances: Mutex::new(HashMap::new()),
            handles: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, definition: Arc<dyn WorkflowDefinition>) {
        self.definitions
            .write()
            .unwrap()
            .insert(definition.name().to_string(), definition);
    }

    fn definition(&self, name: &str) -> Result<Arc<dyn WorkflowDefinition>, RuntimeError> {
        self.definitions
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| RuntimeError::DefinitionNotRegistered {
                workflow_name: name.to_string(),
            })
    }

    fn instance(&self, workflow_id: &str) -> Result<Arc<InstanceShared>, RuntimeError> {
        self.instances
            .lock()
            .unwrap()
            .get(workflow_id)
            .cloned()
            .ok_or_else(|| RuntimeError::WorkflowNotFound {
                workflow_id: workflow_id.to_string(),
            })
    }

    pub fn generate_workflow_id(workflow_name: &str) -> String {
        format!("{}-{}", workflow_name, Uuid::new_v4())
    }

    /// Start a new workflow execution with typed input and indexed search
    /// attributes.
    pub fn start_workflow(
        &self,
        workflow_name: &str,
        workflow_id: Option<String>,
        input: serde_json::Value,
        search_attributes: SearchAttributes,
    ) -> Result<WorkflowExecutionView, RuntimeError> {
        let definition = self.definition(workflow_name)?;
        let workflow_id =
            workflow_id.unwrap_or_else(|| Self::generate_workflow_id(workflow_name));

        let mut journal = Journal::create(&self.dir, &workflow_id)?;
        let started_at = Utc::now();
        let started = JournalEvent::Started {
            workflow_name: workflow_name.to_string(),
            input: input.clone(),
            search_attributes: search_attributes.clone(),
            started_at,
        };
        journal.append(&started)?;

        let mut task = WorkflowTask::new(&workflow_id, workflow_name, input);
        task.status = WorkflowStatus::Pending;

        let shared = Arc::new(InstanceShared {
            workflow_id: workflow_id.clone(),
            workflow_name: workflow_name.to_string(),
            journal: Mutex::new(journal),
            state: Mutex::new(InstanceState {
                history: vec![started],
                task,
                search_attributes,
                failure: None,
                started_at,
            }),
            signal_notify: Notify::new(),
            cancel: CancellationToken::new(),
        });

        self.instances
            .lock()
            .unwrap()
            .insert(workflow_id.clone(), Arc::clone(&shared));
        self.spawn_driver(definition, Arc::clone(&shared));

        tracing::info!(
            workflow_id = %workflow_id,
            workflow_name = %workflow_name,
            "Workflow started"
        );
        Ok(shared.view())
    }

    fn spawn_driver(&self, definition: Arc<dyn WorkflowDefinition>, shared: Arc<InstanceShared>) {
        let workflow_id = shared.workflow_id.clone();
        let handle = tokio::spawn(async move {
            shared.set_status(WorkflowStatus::Running);
            let input = shared.input();
            let ctx = WorkflowCtx::new(Arc::clone(&shared));
            let result = definition.run(ctx, input).await;

            match result {
                Ok(output) => {
                    shared.try_finish(
                        WorkflowStatus::Completed,
                        JournalEvent::Completed {
                            output,
                            completed_at: Utc::now(),
                        },
                    );
                    tracing::info!(workflow_id = %shared.workflow_id, "Workflow completed");
                }
                Err(WorkflowError::Cancelled { .. }) => {
                    shared.try_finish(
                        WorkflowStatus::Cancelled,
                        JournalEvent::Cancelled {
                            cancelled_at: Utc::now(),
                        },
                    );
                    tracing::info!(workflow_id = %shared.workflow_id, "Workflow cancelled");
                }
                Err(err) => {
                    let step = {
                        let state = shared.state.lock().unwrap();
                        Some(state.task.task_reference.clone())
                    };
                    let failure = WorkflowFailure::from_workflow_error(&err, step);
                    shared.try_finish(
                        WorkflowStatus::Failed,
                        JournalEvent::Failed {
                            failure,
                            failed_at: Utc::now(),
                        },
                    );
                    tracing::warn!(
                        workflow_id = %shared.workflow_id,
                        error = %err,
                        "Workflow failed"
                    );
                }
            }
        });
        self.handles.lock().unwrap().insert(workflow_id, handle);
    }

    /// Deliver an external signal to a running workflow.
    pub fn signal_workflow(
        &self,
        workflow_id: &str,
        signal: WorkflowSignal,
    ) -> Result<(), RuntimeError> {
        let shared = self.instance(workflow_id)?;
        if shared.is_terminal() {
            return Err(RuntimeError::NotRunning {
                workflow_id: workflow_id.to_string(),
            });
        }
        shared.record(JournalEvent::SignalReceived { signal });
        shared.signal_notify.notify_waiters();
        Ok(())
    }

    /// Request graceful cancellation. The workflow observes it at its next
    /// timer or signal wait and runs its compensation path.
    pub fn cancel_workflow(
        &self,
        workflow_id: &str,
        reason: Option<String>,
    ) -> Result<(), RuntimeError> {
        let shared = self.instance(workflow_id)?;
        if shared.is_terminal() {
            return Err(RuntimeError::NotRunning {
                workflow_id: workflow_id.to_string(),
            });
        }
        shared.record(JournalEvent::CancelRequested {
            reason,
            requested_at: Utc::now(),
        });
        shared.cancel.cancel();
        shared.signal_notify.notify_waiters();
        tracing::info!(workflow_id = %workflow_id, "Workflow cancellation requested");
        Ok(())
    }

    /// Forcibly end a workflow without running compensation.
    pub fn terminate_workflow(
        &self,
        workflow_id: &str,
        reason: &str,
    ) -> Result<(), RuntimeError> {
        let shared = self.instance(workflow_id)?;
        if shared.is_terminal() {
            return Err(RuntimeError::NotRunning {
                workflow_id: workflow_id.to_string(),
            });
        }
        if let Some(handle) = self.handles.lock().unwrap().remove(workflow_id) {
            handle.abort();
        }
        shared.try_finish(
            WorkflowStatus::Terminated,
            JournalEvent::Terminated {
                reason: reason.to_string(),
                terminated_at: Utc::now(),
            },
        );
        tracing::warn!(workflow_id = %workflow_id, reason = %reason, "Workflow terminated");
        Ok(())
    }

    /// Mutate the instance task with externally gathered state and wake the
    /// suspended workflow. Used by the browser-bounce resume path.
    pub fn resume_workflow(&self, task: WorkflowTask) -> Result<WorkflowExecutionView, RuntimeError> {
        let shared = self.instance(&task.workflow_id)?;
        if shared.is_terminal() {
            return Err(RuntimeError::NotRunning {
                workflow_id: task.workflow_id.clone(),
            });
        }

        shared.update_task(|t| {
            if task.user.is_some() {
                t.user = task.user.clone();
            }
            if task.role.is_some() {
                t.role = task.role.clone();
            }
            if task.authentication_provider.is_some() {
                t.authentication_provider = task.authentication_provider.clone();
            }
            if !task.context.is_null() {
                t.context = task.context.clone();
            }
        });

        let data = serde_json::to_value(&task)?;
        let signal = WorkflowSignal::new(
            super::task::signals::AUTHENTICATED,
            "/auth/callback",
            data,
        );
        self.signal_workflow(&task.workflow_id, signal)?;
        Ok(shared.view())
    }

    pub fn get_workflow(&self, workflow_id: &str) -> Result<WorkflowExecutionView, RuntimeError> {
        Ok(self.instance(workflow_id)?.view())
    }

    /// Query live state with a bounded budget.
    pub async fn query_workflow(
        &self,
        workflow_id: &str,
        timeout: std::time::Duration,
    ) -> Result<WorkflowExecutionView, RuntimeError> {
        let shared = self.instance(workflow_id)?;
        tokio::time::timeout(timeout, async move { shared.view() })
            .await
            .map_err(|_| RuntimeError::QueryTimeout {
                timeout_ms: timeout.as_millis() as u64,
            })
    }

    /// List executions, newest first.
    pub fn list_workflows(&self) -> Vec<WorkflowExecutionView> {
        let mut views: Vec<WorkflowExecutionView> = self
            .instances
            .lock()
            .unwrap()
            .values()
            .map(|i| i.view())
            .collect();
        views.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        views
    }

    /// Replay all journals found on disk. Completed executions are restored
    /// as queryable views; incomplete ones are re-driven from their journal,
    /// so durable timers resume with their original deadlines.
    pub fn recover(&self) -> Result<usize, RuntimeError> {
        let mut recovered = 0;
        for (workflow_id, path) in list_journals(&self.dir)? {
            if self.instances.lock().unwrap().contains_key(&workflow_id) {
                continue;
            }
            let events = read_journal(&path)?;
            let Some(state) = reduce_events(&workflow_id, &events) else {
                tracing::warn!(workflow_id = %workflow_id, "Journal has no start event, skipping");
                continue;
            };

            let workflow_name = state.task.workflow_name.clone();
            let terminal = state.task.status.is_terminal();
            let cancel = CancellationToken::new();
            if events
                .iter()
                .any(|e| matches!(e, JournalEvent::CancelRequested { .. }))
            {
                cancel.cancel();
            }

            let journal = Journal::open(&self.dir, &workflow_id)?;
            let shared = Arc::new(InstanceShared {
                workflow_id: workflow_id.clone(),
                workflow_name: workflow_name.clone(),
                journal: Mutex::new(journal),
                state: Mutex::new(state),
                signal_notify: Notify::new(),
                cancel,
            });
            self.instances
                .lock()
                .unwrap()
                .insert(workflow_id.clone(), Arc::clone(&shared));

            if !terminal {
                match self.definition(&workflow_name) {
                    Ok(definition) => {
                        tracing::info!(
                            workflow_id = %workflow_id,
                            workflow_name = %workflow_name,
                            "Replaying workflow after restart"
                        );
                        self.spawn_driver(definition, shared);
                        recovered += 1;
                    }
                    Err(_) => {
                        tracing::error!(
                            workflow_id = %workflow_id,
                            workflow_name = %workflow_name,
                            "No definition registered for recovered workflow"
                        );
                        shared.try_finish(
                            WorkflowStatus::Failed,
                            JournalEvent::Failed {
                                failure: WorkflowFailure {
                                    kind: FailureKind::Server,
                                    message: format!(
                                        "workflow definition {} not registered",
                                        workflow_name
                                    ),
                                    step: None,
                                    cause: None,
                                    stack: Vec::new(),
                                },
                                failed_at: Utc::now(),
                            },
                        );
                    }
                }
            }
        }
        Ok(recovered)
    }

    pub fn journal_file(&self, workflow_id: &str) -> PathBuf {
        journal_path(&self.dir, workflow_id)
    }
}

/// Deterministic reducer from journal events to instance state.
fn reduce_events(workflow_id: &str, events: &[JournalEvent]) -> Option<InstanceState> {
    let mut state: Option<InstanceState> = None;

    for event in events {
        match event {
            JournalEvent::Started {
                workflow_name,
                input,
                search_attributes,
                started_at,
            } => {
                let mut task = WorkflowTask::new(workflow_id, workflow_name, input.clone());
                task.status = WorkflowStatus::Suspended;
                state = Some(InstanceState {
                    history: Vec::new(),
                    task,
                    search_attributes: search_attributes.clone(),
                    failure: None,
                    started_at: *started_at,
                });
            }
            JournalEvent::SearchAttributesUpserted { attributes } => {
                if let Some(s) = state.as_mut() {
                    for (k, v) in attributes {
                        s.search_attributes.insert(k.clone(), v.clone());
                    }
                }
            }
            JournalEvent::Completed { output, .. } => {
                if let Some(s) = state.as_mut() {
                    s.task.status = WorkflowStatus::Completed;
                    s.task.output = Some(output.clone());
                }
            }
            JournalEvent::Failed { failure, .. } => {
                if let Some(s) = state.as_mut() {
                    s.task.status = WorkflowStatus::Failed;
                    s.failure = Some(failure.clone());
                }
            }
            JournalEvent::Cancelled { .. } => {
                if let Some(s) = state.as_mut() {
                    s.task.status = WorkflowStatus::Cancelled;
                }
            }
            JournalEvent::Terminated { reason, .. } => {
                if let Some(s) = state.as_mut() {
                    s.task.status = WorkflowStatus::Terminated;
                    s.failure = Some(WorkflowFailure {
                        kind: FailureKind::Terminated,
                        message: reason.clone(),
                        step: None,
                        cause: None,
                        stack: Vec::new(),
                    });
                }
            }
            _ => {}
        }
        if let Some(s) = state.as_mut() {
            s.history.push(event.clone());
        }
    }

    if let Some(s) = state.as_mut() {
        if let Some(approved) = s
            .search_attributes
            .get(super::task::attributes::APPROVED)
            .and_then(|v| v.as_bool())
        {
            s.task.approved = Some(approved);
        }
    }
    state
}
