//! Workflow Run State
//!
//! Mutable execution state attached to an otherwise immutable [`Workflow`]:
//! status, per-step results, timestamps and the terminal error.
//!
//! State machine: `pending -> running -> {completed | failed | cancelled}`.
//! Every transition emits [`WorkflowEvent::StatusChanged`], every recorded
//! result emits [`WorkflowEvent::StepCompleted`], and `reset` emits
//! [`WorkflowEvent::Reset`].

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::PoisonError;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::{StepError, StructuralError};

use super::model::Workflow;

/// Lifecycle status of a workflow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    /// Returns true for `completed`, `failed` and `cancelled`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Recorded outcome of one step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepResult {
    /// Worker output or the error that ended the step
    pub outcome: Result<Value, StepError>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration: Duration,
    /// Attempts made, including the first
    pub attempts: u32,
}

impl StepResult {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn output(&self) -> Option<&Value> {
        self.outcome.as_ref().ok()
    }

    pub fn error(&self) -> Option<&StepError> {
        self.outcome.as_ref().err()
    }
}

/// Notification published on a workflow's event channel.
#[derive(Debug, Clone)]
pub enum WorkflowEvent {
    StepCompleted {
        workflow_id: String,
        step_id: String,
        result: StepResult,
    },
    StatusChanged {
        workflow_id: String,
        from: WorkflowStatus,
        to: WorkflowStatus,
    },
    Reset {
        workflow_id: String,
    },
}

/// Interior state guarded by the workflow's mutex.
#[derive(Debug, Clone)]
pub(crate) struct RunState {
    pub status: WorkflowStatus,
    pub results: HashMap<String, StepResult>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl Default for RunState {
    fn default() -> Self {
        Self {
            status: WorkflowStatus::Pending,
            results: HashMap::new(),
            started_at: None,
            finished_at: None,
            error: None,
        }
    }
}

impl RunState {
    /// Applies a transition, stamping timestamps. Returns the old status.
    fn transition(&mut self, to: WorkflowStatus, error: Option<String>) -> WorkflowStatus {
        let from = self.status;
        self.status = to;
        if to == WorkflowStatus::Running && self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        if to.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        if error.is_some() {
            self.error = error;
        }
        from
    }
}

/// Serializable point-in-time view of a workflow.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowSnapshot {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub status: WorkflowStatus,
    pub results: BTreeMap<String, StepResult>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl Workflow {
    fn run_state(&self) -> std::sync::MutexGuard<'_, RunState> {
        self.run.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current status.
    pub fn status(&self) -> WorkflowStatus {
        self.run_state().status
    }

    /// Copy of every recorded step result.
    pub fn results(&self) -> HashMap<String, StepResult> {
        self.run_state().results.clone()
    }

    /// Recorded result of one step, if any.
    pub fn step_result(&self, step_id: &str) -> Option<StepResult> {
        self.run_state().results.get(step_id).cloned()
    }

    /// IDs of steps whose latest result is a success.
    pub fn completed_steps(&self) -> BTreeSet<String> {
        self.run_state()
            .results
            .iter()
            .filter(|(_, r)| r.is_success())
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.run_state().started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.run_state().finished_at
    }

    /// Error that ended the workflow, if it failed.
    pub fn error(&self) -> Option<String> {
        self.run_state().error.clone()
    }

    /// Records a step's result, replacing any earlier one.
    pub fn set_step_result(
        &self,
        step_id: &str,
        result: StepResult,
    ) -> Result<(), StructuralError> {
        if self.get_step(step_id).is_none() {
            return Err(StructuralError::UnknownStep(step_id.to_string()));
        }

        self.run_state()
            .results
            .insert(step_id.to_string(), result.clone());

        debug!(
            "Workflow '{}': step '{}' recorded ({})",
            self.name(),
            step_id,
            if result.is_success() { "ok" } else { "error" }
        );
        self.events.emit(WorkflowEvent::StepCompleted {
            workflow_id: self.id().to_string(),
            step_id: step_id.to_string(),
            result,
        });
        Ok(())
    }

    /// Moves the workflow to `status`, stamping timestamps.
    ///
    /// `started_at` is set on the first entry into `running` only;
    /// `finished_at` on every terminal transition.
    pub fn update_status(&self, status: WorkflowStatus, error: Option<String>) {
        let from = self.run_state().transition(status, error);
        self.announce(from, status);
    }

    /// Atomically moves `pending` to `running`. Returns the actual status
    /// on refusal.
    pub(crate) fn begin_run(&self) -> Result<(), WorkflowStatus> {
        let from = {
            let mut state = self.run_state();
            if state.status != WorkflowStatus::Pending {
                return Err(state.status);
            }
            state.transition(WorkflowStatus::Running, None)
        };
        self.announce(from, WorkflowStatus::Running);
        Ok(())
    }

    /// Moves a `running` workflow to a terminal status. Returns false, and
    /// changes nothing, if the workflow was no longer running.
    pub(crate) fn finish_if_running(&self, status: WorkflowStatus, error: Option<String>) -> bool {
        let from = {
            let mut state = self.run_state();
            if state.status != WorkflowStatus::Running {
                return false;
            }
            state.transition(status, error)
        };
        self.announce(from, status);
        true
    }

    fn announce(&self, from: WorkflowStatus, to: WorkflowStatus) {
        if from != to {
            info!("Workflow '{}' {} -> {}", self.name(), from, to);
        }
        self.events.emit(WorkflowEvent::StatusChanged {
            workflow_id: self.id().to_string(),
            from,
            to,
        });
    }

    /// Returns the workflow to `pending`, clearing results, timestamps and
    /// error.
    pub fn reset(&self) {
        *self.run_state() = RunState::default();
        debug!("Workflow '{}' reset", self.name());
        self.events.emit(WorkflowEvent::Reset {
            workflow_id: self.id().to_string(),
        });
    }

    /// Subscribes to this workflow's events.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.events.subscribe()
    }

    /// Serializable view of the current state.
    pub fn snapshot(&self) -> WorkflowSnapshot {
        let state = self.run_state();
        WorkflowSnapshot {
            id: self.id().to_string(),
            name: self.name().to_string(),
            description: self.description().map(str::to_string),
            status: state.status,
            results: state
                .results
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            started_at: state.started_at,
            finished_at: state.finished_at,
            error: state.error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{WorkflowConfig, WorkflowStep};
    use serde_json::json;

    fn workflow() -> Workflow {
        Workflow::new(
            "state-test",
            vec![
                WorkflowStep::new("a", "echo"),
                WorkflowStep::new("b", "echo").depends_on("a"),
            ],
            WorkflowConfig::default(),
        )
        .unwrap()
    }

    fn ok_result(value: Value) -> StepResult {
        let now = Utc::now();
        StepResult {
            outcome: Ok(value),
            started_at: now,
            finished_at: now,
            duration: Duration::from_millis(5),
            attempts: 1,
        }
    }

    #[test]
    fn test_initial_state() {
        let wf = workflow();
        assert_eq!(wf.status(), WorkflowStatus::Pending);
        assert!(wf.results().is_empty());
        assert!(wf.started_at().is_none());
        assert!(wf.error().is_none());
    }

    #[test]
    fn test_status_display_and_terminal() {
        assert_eq!(WorkflowStatus::Cancelled.to_string(), "cancelled");
        assert!(WorkflowStatus::Failed.is_terminal());
        assert!(!WorkflowStatus::Running.is_terminal());
    }

    #[test]
    fn test_started_at_stamped_once() {
        let wf = workflow();
        wf.update_status(WorkflowStatus::Running, None);
        let first = wf.started_at().unwrap();
        assert!(wf.finished_at().is_none());

        wf.update_status(WorkflowStatus::Running, None);
        assert_eq!(wf.started_at(), Some(first));

        wf.update_status(WorkflowStatus::Failed, Some("boom".into()));
        assert!(wf.finished_at().is_some());
        assert_eq!(wf.error().as_deref(), Some("boom"));
    }

    #[test]
    fn test_begin_run_requires_pending() {
        let wf = workflow();
        assert!(wf.begin_run().is_ok());
        assert_eq!(wf.begin_run(), Err(WorkflowStatus::Running));
    }

    #[test]
    fn test_finish_if_running() {
        let wf = workflow();
        assert!(!wf.finish_if_running(WorkflowStatus::Completed, None));
        assert_eq!(wf.status(), WorkflowStatus::Pending);

        wf.begin_run().unwrap();
        assert!(wf.finish_if_running(WorkflowStatus::Cancelled, None));
        assert!(!wf.finish_if_running(WorkflowStatus::Completed, None));
        assert_eq!(wf.status(), WorkflowStatus::Cancelled);
    }

    #[test]
    fn test_set_step_result() {
        let wf = workflow();
        wf.set_step_result("a", ok_result(json!(1))).unwrap();
        assert_eq!(wf.step_result("a").unwrap().output(), Some(&json!(1)));

        // overwrite on retry
        wf.set_step_result("a", ok_result(json!(2))).unwrap();
        assert_eq!(wf.step_result("a").unwrap().output(), Some(&json!(2)));
        assert_eq!(wf.completed_steps().len(), 1);
    }

    #[test]
    fn test_set_unknown_step_rejected() {
        let wf = workflow();
        assert_eq!(
            wf.set_step_result("ghost", ok_result(json!(null))),
            Err(StructuralError::UnknownStep("ghost".to_string()))
        );
    }

    #[test]
    fn test_reset_clears_everything() {
        let wf = workflow();
        wf.update_status(WorkflowStatus::Running, None);
        wf.set_step_result("a", ok_result(json!(1))).unwrap();
        wf.update_status(WorkflowStatus::Failed, Some("x".into()));

        wf.reset();
        assert_eq!(wf.status(), WorkflowStatus::Pending);
        assert!(wf.results().is_empty());
        assert!(wf.started_at().is_none());
        assert!(wf.finished_at().is_none());
        assert!(wf.error().is_none());
    }

    #[tokio::test]
    async fn test_events_emitted() {
        let wf = workflow();
        let mut rx = wf.subscribe();

        wf.update_status(WorkflowStatus::Running, None);
        wf.set_step_result("a", ok_result(json!("done"))).unwrap();
        wf.reset();

        assert!(matches!(
            rx.recv().await.unwrap(),
            WorkflowEvent::StatusChanged {
                from: WorkflowStatus::Pending,
                to: WorkflowStatus::Running,
                ..
            }
        ));
        assert!(matches!(
            rx.recv().await.unwrap(),
            WorkflowEvent::StepCompleted { step_id, .. } if step_id == "a"
        ));
        assert!(matches!(rx.recv().await.unwrap(), WorkflowEvent::Reset { .. }));
    }

    #[test]
    fn test_snapshot_serializes() {
        let wf = workflow();
        wf.update_status(WorkflowStatus::Running, None);
        wf.set_step_result("a", ok_result(json!({"n": 1}))).unwrap();

        let snapshot = wf.snapshot();
        let value = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(value["status"], "running");
        assert_eq!(value["results"]["a"]["outcome"]["Ok"]["n"], 1);
        assert_eq!(value["name"], "state-test");
    }
}
