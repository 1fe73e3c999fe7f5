//! Execution Planner
//!
//! Tracks per-step status during one run of a workflow and decides which
//! steps are runnable:
//! - Dependency tracking over the index-based graph
//! - Declaration-order selection, capped per dispatch group
//! - Failure handling according to `stop_on_error`

use log::debug;

use crate::error::StepError;

use super::model::Workflow;

/// Status of a workflow step during execution.
#[derive(Debug, Clone, PartialEq)]
pub enum StepStatus {
    /// Step is waiting for dependencies
    Pending,
    /// Step is currently executing
    Running,
    /// Step completed successfully
    Completed,
    /// Step failed with error
    Failed(StepError),
}

impl StepStatus {
    fn is_resolved(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed(_))
    }
}

/// Decides which steps of one workflow run may be dispatched next.
#[derive(Debug)]
pub struct ExecutionPlanner<'a> {
    workflow: &'a Workflow,
    statuses: Vec<StepStatus>,
    /// A failed dependency unblocks its dependents
    failure_unblocks: bool,
}

impl<'a> ExecutionPlanner<'a> {
    /// Creates a planner with every step pending.
    pub fn new(workflow: &'a Workflow) -> Self {
        Self {
            workflow,
            statuses: vec![StepStatus::Pending; workflow.len()],
            failure_unblocks: !workflow.config().stop_on_error,
        }
    }

    /// Returns up to `limit` runnable step indices in declaration order.
    ///
    /// A step is runnable when it is pending and every dependency has
    /// recorded a result that unblocks it.
    pub fn ready_steps(&self, limit: usize) -> Vec<usize> {
        let ready: Vec<usize> = (0..self.statuses.len())
            .filter(|&i| self.statuses[i] == StepStatus::Pending)
            .filter(|&i| {
                self.workflow
                    .dependencies_of(i)
                    .iter()
                    .all(|&d| self.unblocks(&self.statuses[d]))
            })
            .take(limit)
            .collect();

        debug!("Ready steps: {:?}", ready);
        ready
    }

    fn unblocks(&self, status: &StepStatus) -> bool {
        match status {
            StepStatus::Completed => true,
            StepStatus::Failed(_) => self.failure_unblocks,
            _ => false,
        }
    }

    pub fn mark_step_running(&mut self, index: usize) {
        if let Some(status) = self.statuses.get_mut(index) {
            *status = StepStatus::Running;
        }
    }

    pub fn mark_step_completed(&mut self, index: usize) {
        if let Some(status) = self.statuses.get_mut(index) {
            *status = StepStatus::Completed;
        }
    }

    pub fn mark_step_failed(&mut self, index: usize, error: StepError) {
        if let Some(status) = self.statuses.get_mut(index) {
            *status = StepStatus::Failed(error);
        }
    }

    pub fn status(&self, index: usize) -> Option<&StepStatus> {
        self.statuses.get(index)
    }

    /// Returns true if any step is pending or running.
    pub fn has_work_remaining(&self) -> bool {
        self.statuses.iter().any(|s| !s.is_resolved())
    }

    /// IDs of steps that never started.
    pub fn unresolved(&self) -> Vec<String> {
        self.statuses
            .iter()
            .enumerate()
            .filter(|(_, s)| **s == StepStatus::Pending)
            .map(|(i, _)| self.workflow.steps()[i].id.clone())
            .collect()
    }

    /// Returns (resolved, total).
    pub fn progress(&self) -> (usize, usize) {
        let resolved = self.statuses.iter().filter(|s| s.is_resolved()).count();
        (resolved, self.statuses.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{WorkflowConfig, WorkflowStep};

    fn create_test_workflow(stop_on_error: bool) -> Workflow {
        Workflow::new(
            "planner",
            vec![
                WorkflowStep::new("a", "w"),
                WorkflowStep::new("b", "w"),
                WorkflowStep::new("c", "w").depends_on("a").depends_on("b"),
                WorkflowStep::new("d", "w").depends_on("c"),
            ],
            WorkflowConfig::default().with_stop_on_error(stop_on_error),
        )
        .unwrap()
    }

    #[test]
    fn test_planner_get_ready_steps() {
        let wf = create_test_workflow(true);
        let planner = ExecutionPlanner::new(&wf);
        assert_eq!(planner.ready_steps(10), vec![0, 1]);
        assert_eq!(planner.ready_steps(1), vec![0]);
    }

    #[test]
    fn test_planner_running_steps_not_ready() {
        let wf = create_test_workflow(true);
        let mut planner = ExecutionPlanner::new(&wf);
        planner.mark_step_running(0);
        assert_eq!(planner.ready_steps(10), vec![1]);
        assert_eq!(planner.status(0), Some(&StepStatus::Running));
    }

    #[test]
    fn test_planner_dependent_ready_after_all_dependencies() {
        let wf = create_test_workflow(true);
        let mut planner = ExecutionPlanner::new(&wf);

        planner.mark_step_completed(0);
        assert_eq!(planner.ready_steps(10), vec![1]);

        planner.mark_step_completed(1);
        assert_eq!(planner.ready_steps(10), vec![2]);
    }

    #[test]
    fn test_planner_failed_step_blocks_with_stop_on_error() {
        let wf = create_test_workflow(true);
        let mut planner = ExecutionPlanner::new(&wf);

        planner.mark_step_completed(0);
        planner.mark_step_failed(1, StepError::Worker("boom".into()));
        assert!(planner.ready_steps(10).is_empty());
        assert_eq!(planner.unresolved(), vec!["c", "d"]);
    }

    #[test]
    fn test_planner_failed_step_unblocks_without_stop_on_error() {
        let wf = create_test_workflow(false);
        let mut planner = ExecutionPlanner::new(&wf);

        planner.mark_step_completed(0);
        planner.mark_step_failed(1, StepError::Worker("boom".into()));
        assert_eq!(planner.ready_steps(10), vec![2]);
    }

    #[test]
    fn test_planner_has_work_remaining_and_progress() {
        let wf = create_test_workflow(true);
        let mut planner = ExecutionPlanner::new(&wf);
        assert!(planner.has_work_remaining());
        assert_eq!(planner.progress(), (0, 4));

        for i in 0..4 {
            planner.mark_step_completed(i);
        }
        assert!(!planner.has_work_remaining());
        assert_eq!(planner.progress(), (4, 4));
    }
}
