// ==============================================================================
// main.rs - Metabolomics Analysis Pipeline Entry Point
// ==============================================================================
// Description: CLI for running a single analysis task against a query export
//              directory with in-process cache and registry
// Created: 2026-02-10
// Modified: 2026-08-30
// Version: 1.0.0
// ==============================================================================

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use serde_json::Map;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use metabo_processor::cache::InMemoryResultCache;
use metabo_processor::correction::CorrectionBatchTask;
use metabo_processor::dataset::CsvDatasetSource;
use metabo_processor::models::{AnalysisConfig, TaskRun};
use metabo_processor::registry::InMemoryRunRegistry;
use metabo_processor::script::ScriptTask;
use metabo_processor::task::{execute_task, LoadTask, TaskContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum TaskCommand {
    /// Load the query dataset into the cache
    Load,
    /// Derive and persist correction batch labels
    AssignCorrectionBatches,
    /// Render and execute an engine script against the dataset
    RunScript,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Task to run
    #[arg(value_enum)]
    task: TaskCommand,

    /// Saved query ID to load data for
    #[arg(short, long)]
    query_id: i64,

    /// Root directory holding query_<id>/ exports
    #[arg(short, long, default_value = "/data/metabolomics")]
    data_dir: String,

    /// Task configuration as a JSON object
    #[arg(long)]
    config: Option<String>,

    /// Engine script template path (run-script only)
    #[arg(long)]
    template: Option<String>,

    /// Engine executable (run-script only)
    #[arg(long, env = "ENGINE_EXEC_PATH", default_value = "Rscript")]
    engine_exec_path: String,

    /// Working directory for engine jobs
    #[arg(long, default_value = "/tmp/metabo-jobs")]
    work_dir: String,

    /// Chain from an existing task run instead of loading fresh
    #[arg(long)]
    upstream_task_run_id: Option<Uuid>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "metabo_processor=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Metabolomics analysis pipeline starting...");

    let args = Args::parse();

    let config: AnalysisConfig = match &args.config {
        Some(raw) => serde_json::from_str(raw).context("Failed to parse --config")?,
        None => AnalysisConfig::default(),
    };

    let ctx = TaskContext {
        cache: Arc::new(InMemoryResultCache::new()),
        dataset_source: Arc::new(CsvDatasetSource::new(&args.data_dir)),
        registry: Arc::new(InMemoryRunRegistry::new()),
        config,
    };

    let mut run = TaskRun::new(task_class_name(args.task), Some(args.query_id));
    if let Some(upstream) = args.upstream_task_run_id {
        run = run.with_upstream(upstream);
    }
    let run_id = run.id;

    let results = match args.task {
        TaskCommand::Load => {
            let mut task = LoadTask::new(ctx, run)?;
            execute_task(&mut task).await?
        }
        TaskCommand::AssignCorrectionBatches => {
            let mut task = CorrectionBatchTask::new(ctx, run)?;
            execute_task(&mut task).await?
        }
        TaskCommand::RunScript => {
            let template_path = args
                .template
                .context("--template is required for run-script")?;
            let template = std::fs::read_to_string(&template_path)
                .with_context(|| format!("Failed to read template {}", template_path))?;
            let mut task = ScriptTask::new(
                ctx,
                run,
                args.engine_exec_path,
                args.work_dir,
                template,
                Map::new(),
            )?;
            execute_task(&mut task).await?
        }
    };

    info!("Task run {} finished", run_id);
    if let Some(results) = results {
        println!("{}", serde_json::to_string_pretty(&results)?);
    }
    Ok(())
}

fn task_class_name(task: TaskCommand) -> &'static str {
    match task {
        TaskCommand::Load => "LoadTaskData",
        TaskCommand::AssignCorrectionBatches => "AssignCorrectionBatches",
        TaskCommand::RunScript => "RunAnalysisScript",
    }
}
