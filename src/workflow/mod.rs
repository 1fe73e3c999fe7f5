//! Workflow Definition Module
//!
//! Provides data structures and utilities for defining, parsing, and
//! validating step graphs executed by long-lived workers.
//!
//! # Structure
//!
//! - [`model`]: Core data structures (WorkflowStep, Workflow, config)
//! - [`state`]: Run status, step results and workflow events
//! - [`parser`]: YAML parsing and loading
//! - [`validator`]: Structural checks and cycle detection
//! - [`planner`]: Runnable-step selection during execution

pub mod model;
pub mod parser;
pub mod planner;
pub mod state;
pub mod validator;

pub use model::{InputProducer, RetryPolicy, StepInput, Workflow, WorkflowConfig, WorkflowStep};
pub use parser::{load_workflow, parse_workflow};
pub use planner::{ExecutionPlanner, StepStatus};
pub use state::{StepResult, WorkflowEvent, WorkflowSnapshot, WorkflowStatus};
pub use validator::execution_layers;
