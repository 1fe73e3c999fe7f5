//! AgentRunner CLI Entry Point
//!
//! Loads a workflow definition and runs it through the scheduler, engine,
//! performance manager and monitor.
//!
//! # Usage
//!
//! ```bash
//! # Execute a workflow
//! agentrunner workflow.yaml
//!
//! # Preview the execution plan
//! agentrunner workflow.yaml --dry-run
//!
//! # Use a runtime configuration file
//! agentrunner workflow.yaml --config runtime.yaml
//!
//! # Run up to 8 steps at once
//! agentrunner workflow.yaml --parallel 8
//! ```

use std::env;
use std::process::ExitCode;
use std::sync::Arc;

use log::{error, info, warn};
use tokio::sync::broadcast::error::RecvError;

use agentrunner::config::{load_config, RuntimeConfig};
use agentrunner::execution::{Engine, TaskScheduler};
use agentrunner::monitoring::{ExecutionTimeline, MetricsMonitor};
use agentrunner::performance::PerformanceManager;
use agentrunner::worker::{EchoWorker, WorkerRegistry};
use agentrunner::workflow::{execution_layers, load_workflow, Workflow, WorkflowStatus};
use agentrunner::{APP_NAME, VERSION};

/// Default workflow file used when none is specified.
const DEFAULT_WORKFLOW: &str = "workflow.yaml";

/// Command-line options parsed from arguments.
#[derive(Debug)]
struct CliOptions {
    workflow_path: String,
    config_path: Option<String>,
    parallel: Option<usize>,
    dry_run: bool,
    verbose: bool,
}

impl Default for CliOptions {
    fn default() -> Self {
        Self {
            workflow_path: DEFAULT_WORKFLOW.to_string(),
            config_path: None,
            parallel: None,
            dry_run: false,
            verbose: false,
        }
    }
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

/// Prints the application banner with version information.
fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME, VERSION);
    println!("Workflow Orchestration for Agent Workers");
    println!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: agentrunner [OPTIONS] <WORKFLOW_FILE>");
    println!();
    println!("Arguments:");
    println!("  <WORKFLOW_FILE>     Path to workflow YAML file");
    println!();
    println!("Options:");
    println!("  --config PATH       Runtime configuration YAML file");
    println!("  --parallel N        Run up to N steps at once (enables parallel mode)");
    println!("  --dry-run           Print the execution plan without running it");
    println!("  --verbose           Enable debug logging");
    println!("  --help              Show this help message");
    println!("  --version           Show version information");
    println!();
    println!("Examples:");
    println!("  agentrunner pipeline.yaml");
    println!("  agentrunner pipeline.yaml --dry-run");
    println!("  agentrunner pipeline.yaml --config runtime.yaml --parallel 8");
}

/// Parses command-line arguments into [`CliOptions`].
fn parse_arguments(args: &[String]) -> Result<CliOptions, String> {
    let mut options = CliOptions::default();
    let mut positional_seen = false;
    let mut i = 1; // Skip program name

    while i < args.len() {
        let arg = &args[i];

        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--dry-run" => {
                options.dry_run = true;
            }
            "--verbose" | "-v" => {
                options.verbose = true;
            }
            "--config" => {
                i += 1;
                if i >= args.len() {
                    return Err("--config requires a path argument".to_string());
                }
                options.config_path = Some(args[i].clone());
            }
            "--parallel" => {
                i += 1;
                if i >= args.len() {
                    return Err("--parallel requires a number argument".to_string());
                }
                let n: usize = args[i]
                    .parse()
                    .map_err(|_| format!("Invalid parallel value: {}", args[i]))?;
                if n == 0 {
                    return Err("--parallel must be at least 1".to_string());
                }
                options.parallel = Some(n);
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => {
                if positional_seen {
                    return Err(format!("Unexpected argument: {}", arg));
                }
                options.workflow_path = arg.clone();
                positional_seen = true;
            }
        }
        i += 1;
    }

    Ok(options)
}

/// Prints the dependency layers of a workflow.
fn print_plan(workflow: &Workflow) {
    let config = workflow.config();
    println!("Execution plan for '{}':", workflow.name());
    if config.parallel {
        println!("  Mode: parallel (max {} steps)", config.max_concurrent_steps);
    } else {
        println!("  Mode: sequential");
    }
    println!();

    for (i, layer) in execution_layers(workflow).iter().enumerate() {
        println!("  Layer {}:", i + 1);
        for step_id in layer {
            if let Some(step) = workflow.get_step(step_id) {
                println!("    - {} -> {}", step.id, step.worker_id);
            }
        }
    }
    println!();
}

/// Waits until the scheduler reports a final event for `workflow`.
async fn wait_for_outcome(
    events: &mut tokio::sync::broadcast::Receiver<agentrunner::execution::SchedulerEvent>,
    workflow: &Workflow,
) {
    loop {
        match events.recv().await {
            Ok(event) if event.is_final_for(workflow.id()) => return,
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                warn!("Missed {} scheduler events", skipped);
                if workflow.status().is_terminal() {
                    return;
                }
            }
            Err(RecvError::Closed) => return,
        }
    }
}

/// Main application entry point. Returns whether the workflow completed.
async fn run() -> Result<bool, Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    // Parse arguments
    let options = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    setup_logging(options.verbose);
    print_banner();

    let runtime = match &options.config_path {
        Some(path) => load_config(path)?,
        None => RuntimeConfig::default(),
    };

    // Load workflow
    let workflow = load_workflow(&options.workflow_path).map_err(|e| {
        error!("Failed to load workflow: {}", e);
        format!(
            "Could not load workflow from '{}': {}",
            options.workflow_path, e
        )
    })?;

    let workflow = match options.parallel {
        Some(n) => workflow.reconfigured(workflow.config().clone().with_parallel(n))?,
        None => workflow,
    };

    info!(
        "Workflow loaded: {} steps, {} roots",
        workflow.len(),
        workflow.root_steps().len()
    );

    if options.dry_run {
        info!("Mode: DRY RUN (steps will not execute)");
        println!();
        print_plan(&workflow);
        return Ok(true);
    }

    // Build the stack
    let registry = Arc::new(WorkerRegistry::new());
    registry.register(Arc::new(EchoWorker::new("echo")))?;

    let performance = Arc::new(PerformanceManager::new(runtime.performance.clone())?);
    performance.start_maintenance();
    let monitor = Arc::new(MetricsMonitor::new(runtime.monitor.clone())?);
    monitor.start();

    let engine = Arc::new(
        Engine::new(registry.clone())
            .with_performance(performance.clone())
            .with_monitor(monitor.clone()),
    );
    let scheduler = TaskScheduler::new(runtime.scheduler.clone(), engine)?;

    // Execute workflow
    let workflow = Arc::new(workflow);
    let mut events = scheduler.subscribe();
    scheduler.enqueue(workflow.clone())?;
    wait_for_outcome(&mut events, &workflow).await;

    println!();
    println!("{}", serde_json::to_string_pretty(&workflow.snapshot())?);
    println!("{}", ExecutionTimeline::from_workflow(&workflow).gantt_chart());
    println!("{}", monitor.get_summary());

    let stats = performance.stats();
    println!(
        "Requests: {} ({} cache hits, {} batches, {} rate limited, {} errors)",
        stats.total_requests,
        stats.cache_hits,
        stats.batches_processed,
        stats.rate_limited,
        stats.errors
    );

    let failures = registry.cleanup_all().await;
    if !failures.is_empty() {
        warn!("{} workers failed to clean up", failures.len());
    }
    performance.shutdown();
    monitor.shutdown();

    Ok(workflow.status() == WorkflowStatus::Completed)
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
