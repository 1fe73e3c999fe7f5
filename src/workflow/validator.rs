//! Workflow Validation
//!
//! Structural checks run once, when a workflow is constructed:
//! - Non-empty workflow with non-empty, unique step IDs
//! - Every dependency names an existing step
//! - No cyclic dependencies (depth-first search, reports the cycle)
//! - Sane execution config
//!
//! Also provides a layered topological ordering used to preview a plan.

use std::collections::{HashMap, HashSet, VecDeque};

use log::debug;

use crate::error::StructuralError;

use super::model::{RetryPolicy, Workflow, WorkflowConfig, WorkflowStep};

/// Resolved dependency graph: ID lookup plus dependency index lists.
#[derive(Debug, Default)]
pub(crate) struct StepGraph {
    pub index: HashMap<String, usize>,
    pub dependencies: Vec<Vec<usize>>,
}

/// Validates steps and config and resolves dependencies into indices.
pub(crate) fn validate_steps(
    steps: &[WorkflowStep],
    config: &WorkflowConfig,
) -> Result<StepGraph, StructuralError> {
    if steps.is_empty() {
        return Err(StructuralError::EmptyWorkflow);
    }

    validate_config(config)?;

    let mut index = HashMap::with_capacity(steps.len());
    for (i, step) in steps.iter().enumerate() {
        if step.id.trim().is_empty() {
            return Err(StructuralError::EmptyStepId);
        }
        if index.insert(step.id.clone(), i).is_some() {
            return Err(StructuralError::DuplicateStepId(step.id.clone()));
        }
        if let Some(policy) = &step.retry_policy {
            validate_retry_policy(policy, &step.id)?;
        }
    }

    let mut dependencies = Vec::with_capacity(steps.len());
    for step in steps {
        let mut deps: Vec<usize> = Vec::with_capacity(step.depends_on.len());
        for dep in &step.depends_on {
            let &target = index
                .get(dep)
                .ok_or_else(|| StructuralError::UnknownDependency {
                    step: step.id.clone(),
                    dependency: dep.clone(),
                })?;
            if !deps.contains(&target) {
                deps.push(target);
            }
        }
        dependencies.push(deps);
    }

    detect_cycle(steps, &dependencies)?;

    debug!("Validated {} steps", steps.len());
    Ok(StepGraph {
        index,
        dependencies,
    })
}

fn validate_config(config: &WorkflowConfig) -> Result<(), StructuralError> {
    if config.max_concurrent_steps == 0 {
        return Err(StructuralError::InvalidConfig(
            "max_concurrent_steps must be at least 1".to_string(),
        ));
    }
    if config.timeout_ms == 0 {
        return Err(StructuralError::InvalidConfig(
            "timeout_ms must be greater than 0".to_string(),
        ));
    }
    validate_retry_policy(&config.retry_policy, "workflow default")
}

fn validate_retry_policy(policy: &RetryPolicy, owner: &str) -> Result<(), StructuralError> {
    if policy.max_attempts == 0 {
        return Err(StructuralError::InvalidConfig(format!(
            "retry policy for {} must allow at least one attempt",
            owner
        )));
    }
    if !policy.backoff_multiplier.is_finite() || policy.backoff_multiplier < 1.0 {
        return Err(StructuralError::InvalidConfig(format!(
            "retry policy for {} has invalid backoff multiplier {}",
            owner, policy.backoff_multiplier
        )));
    }
    Ok(())
}

/// Depth-first cycle search with an explicit stack, so arbitrarily long
/// dependency chains are fine.
///
/// `visiting` holds the nodes on the current path, `visited` the nodes whose
/// whole subgraph is known to be acyclic. Only an edge back into `visiting`
/// is a cycle, so diamonds pass.
fn detect_cycle(steps: &[WorkflowStep], dependencies: &[Vec<usize>]) -> Result<(), StructuralError> {
    let n = dependencies.len();
    let mut visiting = vec![false; n];
    let mut visited = vec![false; n];
    // (node, next dependency to follow); the nodes form the current path
    let mut stack: Vec<(usize, usize)> = Vec::new();

    for start in 0..n {
        if visited[start] {
            continue;
        }
        visiting[start] = true;
        stack.push((start, 0));

        while let Some(frame) = stack.last_mut() {
            let (node, next) = *frame;
            frame.1 += 1;

            match dependencies[node].get(next) {
                Some(&dep) if visiting[dep] => {
                    return Err(cycle_through(steps, &stack, dep));
                }
                Some(&dep) => {
                    if !visited[dep] {
                        visiting[dep] = true;
                        stack.push((dep, 0));
                    }
                }
                None => {
                    stack.pop();
                    visiting[node] = false;
                    visited[node] = true;
                }
            }
        }
    }
    Ok(())
}

/// The cycle closed by an edge from the top of `stack` back to `dep`.
fn cycle_through(steps: &[WorkflowStep], stack: &[(usize, usize)], dep: usize) -> StructuralError {
    let start = stack.iter().position(|&(node, _)| node == dep).unwrap_or(0);
    let mut path: Vec<String> = stack[start..]
        .iter()
        .map(|&(node, _)| steps[node].id.clone())
        .collect();
    path.push(steps[dep].id.clone());
    StructuralError::CyclicDependency { path }
}

/// Groups step IDs into layers using Kahn's algorithm.
///
/// Every step in a layer depends only on steps in earlier layers, so each
/// layer is a set of steps that may run together. Layers preserve
/// declaration order.
pub fn execution_layers(workflow: &Workflow) -> Vec<Vec<String>> {
    let n = workflow.len();
    let mut in_degree: Vec<usize> = (0..n).map(|i| workflow.dependencies_of(i).len()).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
    for i in 0..n {
        for &dep in workflow.dependencies_of(i) {
            dependents[dep].push(i);
        }
    }

    let mut current: VecDeque<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
    let mut placed: HashSet<usize> = HashSet::new();
    let mut layers = Vec::new();

    while !current.is_empty() {
        let mut layer: Vec<usize> = current.drain(..).collect();
        layer.sort_unstable();

        let mut next = Vec::new();
        for &i in &layer {
            placed.insert(i);
            for &d in &dependents[i] {
                in_degree[d] -= 1;
                if in_degree[d] == 0 {
                    next.push(d);
                }
            }
        }
        current.extend(next);

        layers.push(
            layer
                .into_iter()
                .map(|i| workflow.steps()[i].id.clone())
                .collect(),
        );
    }

    debug!("Plan has {} layers covering {} steps", layers.len(), placed.len());
    layers
}
