use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use conductor::config::Config;
use conductor::orchestration::ProgressEvent;
use conductor::shell::ShellRunner;
use conductor::store::FileWorkflowStore;
use conductor::workflow::{ExecutionStrategy, Workflow, WorkflowDefinition, WorkflowId};
use conductor::{clog, clog_error, Result, WorkflowService, WorkflowStatus};

/// Conductor - run task DAGs with bounded parallelism, retries and progress
#[derive(Parser, Debug)]
#[command(name = "conductor")]
#[command(version, about, long_about = None)]
#[command(
    after_help = "ENVIRONMENT:\n    CONDUCTOR_DEBUG=1     Enable debug logging (alternative to --debug)"
)]
pub struct Cli {
    /// Enable debug logging (writes to ~/.conductor/conductor.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Execute a workflow definition (JSON or TOML) with the shell runner
    Run {
        /// Path to the definition file
        definition: PathBuf,

        /// Override the execution strategy (sequential, parallel, hybrid)
        #[arg(long)]
        strategy: Option<ExecutionStrategy>,

        /// Override the maximum number of concurrently running tasks
        #[arg(long)]
        breadth: Option<usize>,

        /// Print progress events as JSON lines
        #[arg(long)]
        json: bool,
    },

    /// Check a definition and print its stage plan
    Validate {
        /// Path to the definition file
        definition: PathBuf,
    },

    /// List stored workflows
    Status,

    /// Print a stored workflow as JSON
    Show {
        /// Workflow ID
        workflow_id: WorkflowId,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    conductor::log::init_with_debug(cli.debug);

    if conductor::log::is_debug() {
        clog!("Conductor starting (debug mode enabled)");
    } else {
        clog!("Conductor starting");
    }

    let config = Config::load()?;
    let result = match cli.command {
        Command::Run {
            definition,
            strategy,
            breadth,
            json,
        } => run_workflow(&config, definition, strategy, breadth, json).await,
        Command::Validate { definition } => validate(&config, definition).map(|_| ExitCode::SUCCESS),
        Command::Status => run_status(&config).await.map(|_| ExitCode::SUCCESS),
        Command::Show { workflow_id } => run_show(&config, workflow_id).await.map(|_| ExitCode::SUCCESS),
    };

    if let Err(e) = &result {
        clog_error!("Command failed: {}", e);
    }
    result
}

fn load_workflow(
    config: &Config,
    path: PathBuf,
    strategy: Option<ExecutionStrategy>,
    breadth: Option<usize>,
) -> Result<Workflow> {
    let defaults = config.workflow_config();
    let mut definition = WorkflowDefinition::from_path(&path)?;
    let mut workflow_config = definition.config.take().unwrap_or_else(|| defaults.clone());
    if let Some(strategy) = strategy {
        workflow_config.strategy = strategy;
    }
    if let Some(breadth) = breadth {
        workflow_config.breadth = breadth;
    }
    definition.config = Some(workflow_config);
    definition.into_builder(defaults).build()
}

fn service(config: &Config) -> Result<Arc<WorkflowService>> {
    let store = FileWorkflowStore::new(config.store_dir()?);
    let service = WorkflowService::new(Arc::new(store), Arc::new(ShellRunner::new()))
        .with_defaults(config.workflow_config())
        .with_event_buffer(config.defaults.event_buffer);
    Ok(Arc::new(service))
}

async fn run_workflow(
    config: &Config,
    path: PathBuf,
    strategy: Option<ExecutionStrategy>,
    breadth: Option<usize>,
    json: bool,
) -> Result<ExitCode> {
    let workflow = load_workflow(config, path, strategy, breadth)?;
    let service = service(config)?;
    let id = service.insert(workflow).await?;
    let mut events = service.subscribe(id).await?;
    service.execute(id).await?;

    let interrupt = Arc::clone(&service);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Interrupted, cancelling workflow {}...", id.short());
            if let Err(e) = interrupt.cancel(id).await {
                clog_error!("Cancel failed: {}", e);
            }
        }
    });

    while let Some(event) = events.recv().await {
        print_event(&event, json)?;
    }

    let finished = service.wait(id).await?;
    if let Some(results) = &finished.results {
        let summary = &results.summary;
        eprintln!(
            "{} {}: {}/{} completed, {} failed, {} skipped, {} cancelled in {}ms",
            finished.id.short(),
            finished.status,
            summary.completed_count,
            summary.total_tasks,
            summary.failed_count,
            summary.skipped_count,
            summary.cancelled_count,
            summary.elapsed_ms
        );
        for failure in &results.failures {
            let reason = failure
                .error
                .as_ref()
                .map(|e| e.to_string())
                .unwrap_or_default();
            eprintln!("  {} [{}] {}", failure.task_id, failure.status, reason);
        }
    }

    Ok(if finished.status == WorkflowStatus::Completed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn print_event(event: &ProgressEvent, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(event)?);
    } else {
        println!(
            "[{:>5.1}%] {:<20} {}",
            event.progress_percent, event.event_type, event.message
        );
    }
    Ok(())
}

fn validate(config: &Config, path: PathBuf) -> Result<()> {
    let workflow = load_workflow(config, path, None, None)?;
    let dag = workflow.validate()?;
    println!(
        "{}: {} tasks, {} dependencies, strategy {}",
        workflow.name,
        dag.task_count(),
        dag.dependency_count(),
        workflow.config.strategy
    );
    for (i, stage) in dag.stages(&workflow.tasks).iter().enumerate() {
        let ids: Vec<&str> = stage.iter().map(|id| id.as_str()).collect();
        println!("  stage {}: {}", i + 1, ids.join(", "));
    }
    Ok(())
}

async fn run_status(config: &Config) -> Result<()> {
    let workflows = service(config)?.list().await?;
    if workflows.is_empty() {
        println!("No workflows found.");
        return Ok(());
    }
    println!("{:<10} {:<24} {:<10} {:>8}", "ID", "NAME", "STATUS", "PROGRESS");
    for workflow in workflows {
        println!(
            "{:<10} {:<24} {:<10} {:>7.1}%",
            workflow.id.short(),
            workflow.name,
            workflow.status,
            workflow.progress_percent()
        );
    }
    Ok(())
}

async fn run_show(config: &Config, id: WorkflowId) -> Result<()> {
    let workflow = service(config)?.store().get(id).await?;
    println!("{}", workflow.to_json()?);
    Ok(())
}
