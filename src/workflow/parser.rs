//! Workflow Parser
//!
//! Loads workflow definitions from YAML. A definition carries the
//! workflow name, optional ID and description, execution config and the
//! step list; it is validated into a [`Workflow`] on load.

use std::fs;
use std::path::Path;

use log::{debug, info};
use serde::Deserialize;

use crate::error::LoadError;

use super::model::{Workflow, WorkflowConfig, WorkflowStep};

/// On-disk shape of a workflow.
#[derive(Debug, Deserialize)]
struct WorkflowDefinition {
    #[serde(default)]
    id: Option<String>,
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    config: WorkflowConfig,
    steps: Vec<WorkflowStep>,
}

/// Parses and validates a workflow from YAML text.
pub fn parse_workflow(yaml: &str) -> Result<Workflow, LoadError> {
    let definition: WorkflowDefinition = serde_yaml::from_str(yaml)?;
    debug!(
        "Parsed definition '{}' with {} steps",
        definition.name,
        definition.steps.len()
    );

    let workflow = match definition.id {
        Some(id) => Workflow::with_id(id, definition.name, definition.steps, definition.config)?,
        None => Workflow::new(definition.name, definition.steps, definition.config)?,
    };

    Ok(match definition.description {
        Some(description) => workflow.with_description(description),
        None => workflow,
    })
}

/// Loads a workflow from a YAML file.
///
/// # Example
///
/// ```rust,no_run
/// use agentrunner::workflow::load_workflow;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let workflow = load_workflow("report.yaml")?;
///     println!("Loaded {} steps", workflow.len());
///     Ok(())
/// }
/// ```
pub fn load_workflow(path: impl AsRef<Path>) -> Result<Workflow, LoadError> {
    let path = path.as_ref();
    info!("Loading workflow from: {}", path.display());

    let yaml_content = fs::read_to_string(path).map_err(|source| LoadError::Io {
        path: path.display().to_string(),
        source,
    })?;
    debug!("YAML content loaded ({} bytes)", yaml_content.len());

    let workflow = parse_workflow(&yaml_content)?;
    info!(
        "Loaded workflow '{}' ({} steps)",
        workflow.name(),
        workflow.len()
    );
    Ok(workflow)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StructuralError;
    use serde_json::json;
    use std::time::Duration;
    use tempfile::tempdir;

    const REPORT_YAML: &str = r#"
id: wf-report
name: portfolio-report
description: nightly summary
config:
  parallel: true
  max_concurrent_steps: 2
  timeout_ms: 5000
  retry_policy:
    max_attempts: 1
steps:
  - id: balances
    worker: portfolio-analyst
    input: { wallet: "0xabc" }
  - id: trends
    worker: trend-spotter
  - id: report
    worker: report-writer
    depends_on: [balances, trends]
    timeout_ms: 60000
"#;

    #[test]
    fn test_parse_workflow() {
        let workflow = parse_workflow(REPORT_YAML).unwrap();

        assert_eq!(workflow.id(), "wf-report");
        assert_eq!(workflow.name(), "portfolio-report");
        assert_eq!(workflow.description(), Some("nightly summary"));
        assert!(workflow.config().parallel);
        assert_eq!(workflow.config().max_concurrent_steps, 2);
        assert_eq!(workflow.config().retry_policy.max_attempts, 1);
        // unspecified fields keep their defaults
        assert!(workflow.config().stop_on_error);
        assert_eq!(workflow.config().retry_policy.initial_delay_ms, 1000);

        let report = workflow.get_step("report").unwrap();
        assert_eq!(report.worker_id, "report-writer");
        assert_eq!(report.depends_on, vec!["balances", "trends"]);
        assert_eq!(report.timeout(), Some(Duration::from_secs(60)));

        let balances = workflow.get_step("balances").unwrap();
        assert_eq!(balances.input.resolve().unwrap(), json!({"wallet": "0xabc"}));
    }

    #[test]
    fn test_parse_workflow_generates_id() {
        let workflow = parse_workflow("name: x\nsteps:\n  - id: a\n    worker: echo\n").unwrap();
        assert!(workflow.id().starts_with("workflow-"));
        assert_eq!(*workflow.config(), WorkflowConfig::default());
    }

    #[test]
    fn test_parse_workflow_structural_error() {
        let yaml = "name: x\nsteps:\n  - id: a\n    worker: echo\n    depends_on: missing\n";
        match parse_workflow(yaml) {
            Err(LoadError::Structural(StructuralError::UnknownDependency { dependency, .. })) => {
                assert_eq!(dependency, "missing");
            }
            other => panic!("expected structural error, got {:?}", other),
        }
    }

    #[test]
    fn test_load_workflow_file_not_found() {
        let result = load_workflow("/nonexistent/path/workflow.yaml");
        assert!(matches!(result, Err(LoadError::Io { .. })));
    }

    #[test]
    fn test_load_workflow_valid_yaml() {
        let temp_dir = tempdir().unwrap();
        let workflow_path = temp_dir.path().join("report.yaml");
        std::fs::write(&workflow_path, REPORT_YAML).unwrap();

        let workflow = load_workflow(&workflow_path).unwrap();
        assert_eq!(workflow.len(), 3);
        assert_eq!(workflow.steps()[0].id, "balances");
    }

    #[test]
    fn test_load_workflow_invalid_yaml() {
        let temp_dir = tempdir().unwrap();
        let workflow_path = temp_dir.path().join("bad.yaml");
        std::fs::write(&workflow_path, "this is not valid yaml: [[[").unwrap();

        let result = load_workflow(&workflow_path);
        assert!(matches!(result, Err(LoadError::Parse(_))));
    }
}
