// ==============================================================================
// main.rs - Metabolomics Analysis Worker Process
// ==============================================================================
// Description: Background worker that processes analysis jobs from the Redis
//              queue and records run outcomes in Postgres
// Created: 2026-02-10
// Modified: 2026-08-30
// Version: 1.0.0
// ==============================================================================

use anyhow::{Context, Result};
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::Client as RedisClient;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn, Level};

mod cache;
mod queue;

use cache::RedisResultCache;
use queue::{AnalysisJobRequest, JobQueue, TaskKind};

use metabo_processor::correction::CorrectionBatchTask;
use metabo_processor::dataset::CsvDatasetSource;
use metabo_processor::models::{TaskRun, TaskStatus};
use metabo_processor::reconcile::SaveCorrectionTask;
use metabo_processor::registry::{PgRunRegistry, RunRegistry};
use metabo_processor::script::ScriptTask;
use metabo_processor::task::{execute_task, LoadTask, TaskContext};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_target(false)
        .compact()
        .init();

    info!("Starting Metabolomics Analysis Worker v1.0.0");

    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize database connection
    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;

    let db_pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .context("Failed to connect to PostgreSQL")?;

    info!("Connected to PostgreSQL");

    // Initialize Redis connection
    let redis_url =
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());

    let redis_client = RedisClient::open(redis_url).context("Failed to create Redis client")?;

    let redis_conn = ConnectionManager::new(redis_client)
        .await
        .context("Failed to create Redis connection manager")?;

    info!("Connected to Redis");

    let data_dir = PathBuf::from(
        std::env::var("DATA_DIR").unwrap_or_else(|_| "/data/metabolomics".to_string()),
    );
    if !data_dir.exists() {
        error!("Data directory not found at {:?}", data_dir);
        return Err(anyhow::anyhow!("Data directory not accessible"));
    }
    info!("Data directory accessible at {:?}", data_dir);

    let engine_exec_path =
        std::env::var("ENGINE_EXEC_PATH").unwrap_or_else(|_| "Rscript".to_string());
    let work_dir =
        PathBuf::from(std::env::var("JOB_WORK_DIR").unwrap_or_else(|_| "/tmp/metabo-jobs".to_string()));

    let worker = Worker::new(db_pool, redis_conn, data_dir, engine_exec_path, work_dir);

    // Recover runs orphaned by a previous worker instance
    info!("Checking for stuck runs from previous worker instance...");
    if let Err(e) = worker.recover_stuck_runs().await {
        error!("Failed to recover stuck runs: {}", e);
    }

    // Start main processing loop
    info!("Worker ready, waiting for jobs...");
    worker.run().await
}

/// Main worker struct
#[derive(Clone)]
struct Worker {
    db_pool: PgPool,
    redis_conn: ConnectionManager,
    data_dir: PathBuf,
    engine_exec_path: String,
    work_dir: PathBuf,
}

impl Worker {
    fn new(
        db_pool: PgPool,
        redis_conn: ConnectionManager,
        data_dir: PathBuf,
        engine_exec_path: String,
        work_dir: PathBuf,
    ) -> Self {
        Self {
            db_pool,
            redis_conn,
            data_dir,
            engine_exec_path,
            work_dir,
        }
    }

    /// Main processing loop - polls the Redis queue for jobs
    async fn run(&self) -> Result<()> {
        let mut job_queue = JobQueue::new(self.redis_conn.clone());

        loop {
            match job_queue.dequeue().await {
                Ok(Some(request)) => {
                    info!(
                        "Received job: {} ({})",
                        request.task_run_id,
                        request.kind.class_name()
                    );

                    // Process job in background (don't block the queue)
                    let worker = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = worker.process_job(request).await {
                            error!("Job processing failed: {}", e);
                        }
                    });
                }
                Ok(None) => {
                    // No jobs in queue, wait a bit
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                Err(e) => {
                    error!("Failed to dequeue job: {}", e);
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
        }
    }

    fn context(&self, request: &AnalysisJobRequest) -> TaskContext {
        TaskContext {
            cache: Arc::new(RedisResultCache::new(self.redis_conn.clone())),
            dataset_source: Arc::new(CsvDatasetSource::new(&self.data_dir)),
            registry: Arc::new(PgRunRegistry::new(self.db_pool.clone())),
            config: request.config.clone(),
        }
    }

    fn run_record(&self, request: &AnalysisJobRequest) -> TaskRun {
        let mut run = TaskRun::new(request.kind.class_name(), request.saved_query_id);
        run.id = request.task_run_id;
        if let Some(upstream) = request.upstream_task_run_id {
            run = run.with_upstream(upstream);
        }
        run
    }

    /// Process a single job
    async fn process_job(&self, request: AnalysisJobRequest) -> Result<()> {
        let task_run_id = request.task_run_id;

        info!("Processing task run {}", task_run_id);
        self.publish_progress(task_run_id, "started").await?;

        let ctx = self.context(&request);
        let run = self.run_record(&request);

        let outcome = match request.kind {
            TaskKind::Load => {
                let mut task = LoadTask::new(ctx, run)?;
                execute_task(&mut task).await
            }
            TaskKind::AssignCorrectionBatches => {
                let mut task = CorrectionBatchTask::new(ctx, run)?;
                execute_task(&mut task).await
            }
            TaskKind::RunScript => {
                let template = request
                    .template
                    .clone()
                    .context("run_script job has no template")?;
                let mut task = ScriptTask::new(
                    ctx,
                    run,
                    self.engine_exec_path.clone(),
                    self.work_dir.clone(),
                    template,
                    request.params.clone(),
                )?;
                execute_task(&mut task).await
            }
            TaskKind::SaveCorrection => {
                let mut task = SaveCorrectionTask::new(ctx, run, Some(self.db_pool.clone()))?;
                execute_task(&mut task).await
            }
        };

        match outcome {
            Ok(_) => {
                info!("Task run {} completed successfully", task_run_id);
                self.publish_progress(task_run_id, "success").await?;
            }
            Err(e) => {
                // terminal status is already recorded by execute_task
                error!("Task run {} failed: {}", task_run_id, e);
                self.publish_progress(task_run_id, &format!("error: {}", e))
                    .await?;
            }
        }

        Ok(())
    }

    /// Publish progress update via Redis pub/sub
    async fn publish_progress(&self, task_run_id: uuid::Uuid, message: &str) -> Result<()> {
        let mut job_queue = JobQueue::new(self.redis_conn.clone());

        let progress_msg = serde_json::json!({
            "task_run_id": task_run_id,
            "message": message,
            "timestamp": Utc::now().to_rfc3339(),
        });

        job_queue
            .publish_progress(task_run_id, &progress_msg.to_string())
            .await?;

        Ok(())
    }

    /// Fail runs left in "started" state by a previous worker instance
    async fn recover_stuck_runs(&self) -> Result<()> {
        let registry = PgRunRegistry::new(self.db_pool.clone());
        let cutoff = Utc::now() - chrono::Duration::minutes(10);

        let stuck = registry
            .stale_started_runs(cutoff)
            .await
            .context("Failed to query stuck runs")?;

        if stuck.is_empty() {
            info!("No stuck runs found");
            return Ok(());
        }

        info!("Found {} stuck run(s), marking as error", stuck.len());

        for task_run_id in stuck {
            warn!("Marking stuck run as error: {}", task_run_id);
            let message = "Run interrupted by worker restart. Please resubmit the task.";
            registry
                .update_status(task_run_id, TaskStatus::Error, Some(message))
                .await?;
            self.publish_progress(task_run_id, message).await?;
        }

        Ok(())
    }
}
