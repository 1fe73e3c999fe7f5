//! Workflow Data Model
//!
//! Core data structures describing a workflow: its steps, the worker each
//! step targets, inter-step dependencies and the execution policy.
//!
//! # Example YAML Format
//!
//! ```yaml
//! name: portfolio-report
//! config:
//!   parallel: true
//!   max_concurrent_steps: 2
//!   stop_on_error: true
//!   timeout_ms: 30000
//! steps:
//!   - id: balances
//!     worker: portfolio-analyst
//!     input: { wallet: "0xabc" }
//!
//!   - id: trends
//!     worker: trend-spotter
//!     input: { window: "24h" }
//!
//!   - id: report
//!     worker: report-writer
//!     depends_on: [balances, trends]
//!     timeout_ms: 60000
//! ```
//!
//! Steps live in a flat list; dependencies are resolved once, at
//! construction, into index lists so the graph never holds references
//! into itself.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

use crate::error::StructuralError;
use crate::events::EventBus;

use super::state::{RunState, WorkflowEvent};
use super::validator::validate_steps;

/// Zero-argument function producing a step's input when it is dispatched.
pub type InputProducer = Arc<dyn Fn() -> Result<Value, String> + Send + Sync>;

/// Input handed to a step's worker.
#[derive(Clone)]
pub enum StepInput {
    /// A fixed JSON payload.
    Value(Value),
    /// Computed lazily, right before dispatch.
    Producer(InputProducer),
}

impl StepInput {
    /// Returns the payload, invoking the producer if there is one.
    pub fn resolve(&self) -> Result<Value, String> {
        match self {
            Self::Value(value) => Ok(value.clone()),
            Self::Producer(producer) => producer(),
        }
    }
}

impl Default for StepInput {
    fn default() -> Self {
        Self::Value(Value::Null)
    }
}

impl fmt::Debug for StepInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Self::Producer(_) => f.write_str("Producer(..)"),
        }
    }
}

impl Serialize for StepInput {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Value(value) => value.serialize(serializer),
            Self::Producer(_) => serializer.serialize_str("<producer>"),
        }
    }
}

impl<'de> Deserialize<'de> for StepInput {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Value::deserialize(deserializer).map(Self::Value)
    }
}

/// Exponential backoff retry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay_ms: u64,
    /// Upper bound for any single delay
    pub max_delay_ms: u64,
    /// Growth factor applied per attempt
    pub backoff_multiplier: f64,
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay to wait after `attempt` failed attempts (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        let capped = delay.min(self.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 10_000,
            backoff_multiplier: 2.0,
        }
    }
}

/// Execution policy for a whole workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Dispatch independent steps concurrently
    pub parallel: bool,
    /// Cap on steps dispatched together in parallel mode
    pub max_concurrent_steps: usize,
    /// Abort the workflow on the first failed step
    pub stop_on_error: bool,
    /// Default per-step deadline
    pub timeout_ms: u64,
    /// Default per-step retry policy
    pub retry_policy: RetryPolicy,
}

impl WorkflowConfig {
    /// Switches to parallel dispatch with the given concurrency cap.
    pub fn with_parallel(mut self, max_concurrent_steps: usize) -> Self {
        self.parallel = true;
        self.max_concurrent_steps = max_concurrent_steps;
        self
    }

    pub fn with_stop_on_error(mut self, stop_on_error: bool) -> Self {
        self.stop_on_error = stop_on_error;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Default per-step deadline.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            parallel: false,
            max_concurrent_steps: 5,
            stop_on_error: true,
            timeout_ms: 300_000,
            retry_policy: RetryPolicy::default(),
        }
    }
}

/// A single unit of work, assigned to one worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    /// Unique identifier within the workflow
    pub id: String,

    /// Worker that processes this step
    #[serde(rename = "worker")]
    pub worker_id: String,

    /// Payload passed to the worker
    #[serde(default)]
    pub input: StepInput,

    /// IDs of steps that must record a result before this one runs
    #[serde(default, deserialize_with = "single_or_vec")]
    pub depends_on: Vec<String>,

    /// Overrides the workflow's default deadline
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    /// Overrides the workflow's default retry policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
}

/// Deserializes either a single string or an array of strings into Vec<String>
fn single_or_vec<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let val = Value::deserialize(deserializer)?;
    match val {
        Value::Null => Ok(Vec::new()),
        Value::String(s) if s.is_empty() => Ok(Vec::new()),
        Value::String(s) => Ok(vec![s]),
        Value::Array(arr) => arr
            .into_iter()
            .map(|v| match v {
                Value::String(s) => Ok(s),
                _ => Err(de::Error::custom("Expected string in array")),
            })
            .collect(),
        _ => Err(de::Error::custom("Expected string or array of strings")),
    }
}

impl WorkflowStep {
    /// Creates a step targeting `worker_id` with a null input.
    ///
    /// # Example
    ///
    /// ```
    /// use agentrunner::workflow::WorkflowStep;
    /// use serde_json::json;
    ///
    /// let step = WorkflowStep::new("report", "report-writer")
    ///     .with_input(json!({ "format": "markdown" }))
    ///     .depends_on("balances")
    ///     .depends_on("trends");
    ///
    /// assert_eq!(step.depends_on.len(), 2);
    /// ```
    pub fn new(id: impl Into<String>, worker_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            worker_id: worker_id.into(),
            input: StepInput::default(),
            depends_on: Vec::new(),
            timeout_ms: None,
            retry_policy: None,
        }
    }

    /// Sets a fixed input payload.
    pub fn with_input(mut self, input: impl Into<Value>) -> Self {
        self.input = StepInput::Value(input.into());
        self
    }

    /// Computes the input lazily at dispatch time.
    pub fn with_producer<F>(mut self, producer: F) -> Self
    where
        F: Fn() -> Result<Value, String> + Send + Sync + 'static,
    {
        self.input = StepInput::Producer(Arc::new(producer));
        self
    }

    /// Adds a dependency on another step.
    pub fn depends_on(mut self, step_id: impl Into<String>) -> Self {
        self.depends_on.push(step_id.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Step-specific deadline, if any.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// A validated dependency graph of steps, executed as a unit.
///
/// The graph and config are immutable once constructed. Execution status
/// and per-step results are interior-mutable so that a caller holding an
/// `Arc<Workflow>` can poll them while the scheduler runs it.
#[derive(Debug)]
pub struct Workflow {
    id: String,
    name: String,
    description: Option<String>,
    steps: Vec<WorkflowStep>,
    config: WorkflowConfig,
    index: HashMap<String, usize>,
    dependencies: Vec<Vec<usize>>,
    pub(super) run: Mutex<RunState>,
    pub(super) events: EventBus<WorkflowEvent>,
}

impl Workflow {
    /// Builds and validates a workflow with a generated ID.
    ///
    /// Fails with [`StructuralError`] on duplicate step IDs, dependencies on
    /// unknown steps, cycles, or an invalid config.
    pub fn new(
        name: impl Into<String>,
        steps: Vec<WorkflowStep>,
        config: WorkflowConfig,
    ) -> Result<Self, StructuralError> {
        let id = format!("workflow-{}", uuid::Uuid::new_v4());
        Self::with_id(id, name, steps, config)
    }

    /// Builds and validates a workflow with a caller-chosen ID.
    pub fn with_id(
        id: impl Into<String>,
        name: impl Into<String>,
        steps: Vec<WorkflowStep>,
        config: WorkflowConfig,
    ) -> Result<Self, StructuralError> {
        let graph = validate_steps(&steps, &config)?;

        Ok(Self {
            id: id.into(),
            name: name.into(),
            description: None,
            steps,
            config,
            index: graph.index,
            dependencies: graph.dependencies,
            run: Mutex::new(RunState::default()),
            events: EventBus::default(),
        })
    }

    /// Attaches a human-readable description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Steps in declaration order.
    pub fn steps(&self) -> &[WorkflowStep] {
        &self.steps
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    /// Gets a step by ID.
    pub fn get_step(&self, id: &str) -> Option<&WorkflowStep> {
        self.index.get(id).map(|&i| &self.steps[i])
    }

    /// Position of a step in declaration order.
    pub fn step_index(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Indices of the steps that `index` depends on.
    pub fn dependencies_of(&self, index: usize) -> &[usize] {
        self.dependencies
            .get(index)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Returns steps with no dependencies (entry points).
    pub fn root_steps(&self) -> Vec<&WorkflowStep> {
        self.steps
            .iter()
            .enumerate()
            .filter(|(i, _)| self.dependencies[*i].is_empty())
            .map(|(_, s)| s)
            .collect()
    }

    /// Returns steps nothing depends on (exit points).
    pub fn leaf_steps(&self) -> Vec<&WorkflowStep> {
        let mut has_dependents = vec![false; self.steps.len()];
        for deps in &self.dependencies {
            for &d in deps {
                has_dependents[d] = true;
            }
        }
        self.steps
            .iter()
            .enumerate()
            .filter(|(i, _)| !has_dependents[*i])
            .map(|(_, s)| s)
            .collect()
    }

    /// Returns the number of steps in the workflow.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns true if the workflow has no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Returns a fresh, pending copy of this workflow with another config.
    /// The ID, name, description and steps are kept.
    pub fn reconfigured(&self, config: WorkflowConfig) -> Result<Self, StructuralError> {
        let workflow = Self::with_id(
            self.id.clone(),
            self.name.clone(),
            self.steps.clone(),
            config,
        )?;
        Ok(Self {
            description: self.description.clone(),
            ..workflow
        })
    }
}
