// ==============================================================================
// registry.rs - Task Run Registry
// ==============================================================================
// Description: Durable record of task runs, their status transitions, args
//              and report artifacts
// Created: 2026-02-10
// Modified: 2026-08-30
// Version: 1.0.0
// ==============================================================================

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::errors::TaskError;
use crate::models::{TaskRun, TaskStatus};

/// Durable store of task run records.
///
/// Status transitions are append-style: a run is created as `started` and
/// later moved to `success` or `error` exactly once. The registry is the
/// audit trail; the cache holds the payloads.
#[async_trait]
pub trait RunRegistry: Send + Sync {
    /// Insert the run record, or refresh it if the id already exists
    /// (a retried run reuses its id).
    async fn create_run(&self, run: &TaskRun) -> Result<(), TaskError>;

    async fn get_run(&self, id: Uuid) -> Result<Option<TaskRun>, TaskError>;

    async fn update_status(
        &self,
        id: Uuid,
        status: TaskStatus,
        error_message: Option<&str>,
    ) -> Result<(), TaskError>;

    /// Persist the resolved args map so the run record is self-describing.
    async fn save_args(&self, id: Uuid, args: &Map<String, Value>) -> Result<(), TaskError>;

    /// Attach a named report artifact (a folder of plots or summaries).
    async fn attach_report(&self, id: Uuid, name: &str, path: &str) -> Result<(), TaskError>;

    /// Ids of runs left in `started` past the given cutoff. Used at worker
    /// startup to fail runs orphaned by a crash.
    async fn stale_started_runs(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, TaskError>;
}

/// Postgres-backed registry.
pub struct PgRunRegistry {
    pool: PgPool,
}

impl PgRunRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RunRegistry for PgRunRegistry {
    async fn create_run(&self, run: &TaskRun) -> Result<(), TaskError> {
        sqlx::query(
            r#"
            INSERT INTO task_runs
                (id, class_name, saved_query_id, upstream_task_run_id, args,
                 status, execution_date, datetime_started)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                args = EXCLUDED.args,
                datetime_started = EXCLUDED.datetime_started,
                datetime_finished = NULL,
                error_message = NULL
            "#,
        )
        .bind(run.id)
        .bind(&run.class_name)
        .bind(run.saved_query_id)
        .bind(run.upstream_task_run_id)
        .bind(Value::Object(run.args.clone()))
        .bind(run.status.as_str())
        .bind(run.execution_date)
        .bind(run.datetime_started)
        .execute(&self.pool)
        .await?;
        info!("Registered task run {} ({})", run.id, run.class_name);
        Ok(())
    }

    async fn get_run(&self, id: Uuid) -> Result<Option<TaskRun>, TaskError> {
        let row = sqlx::query(
            r#"
            SELECT id, class_name, saved_query_id, upstream_task_run_id, args,
                   status, execution_date, datetime_started, datetime_finished,
                   reports
            FROM task_runs
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let args: Value = row.try_get("args")?;
        let args = match args {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        let status: String = row.try_get("status")?;
        let status = match status.as_str() {
            "success" => TaskStatus::Success,
            "error" => TaskStatus::Error,
            _ => TaskStatus::Started,
        };
        let reports: Option<Value> = row.try_get("reports")?;
        let reports: HashMap<String, String> = reports
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();

        Ok(Some(TaskRun {
            id: row.try_get("id")?,
            class_name: row.try_get("class_name")?,
            saved_query_id: row.try_get("saved_query_id")?,
            upstream_task_run_id: row.try_get("upstream_task_run_id")?,
            args,
            status,
            execution_date: row.try_get("execution_date")?,
            datetime_started: row.try_get("datetime_started")?,
            datetime_finished: row.try_get("datetime_finished")?,
            reports,
        }))
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: TaskStatus,
        error_message: Option<&str>,
    ) -> Result<(), TaskError> {
        let finished = match status {
            TaskStatus::Started => None,
            TaskStatus::Success | TaskStatus::Error => Some(Utc::now()),
        };
        let result = sqlx::query(
            r#"
            UPDATE task_runs
            SET status = $1, error_message = $2,
                datetime_finished = COALESCE($3, datetime_finished)
            WHERE id = $4
            "#,
        )
        .bind(status.as_str())
        .bind(error_message)
        .bind(finished)
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            warn!("Status update for unknown task run {}", id);
        }
        Ok(())
    }

    async fn save_args(&self, id: Uuid, args: &Map<String, Value>) -> Result<(), TaskError> {
        sqlx::query("UPDATE task_runs SET args = $1 WHERE id = $2")
            .bind(Value::Object(args.clone()))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn attach_report(&self, id: Uuid, name: &str, path: &str) -> Result<(), TaskError> {
        sqlx::query(
            r#"
            UPDATE task_runs
            SET reports = COALESCE(reports, '{}'::jsonb) || $1
            WHERE id = $2
            "#,
        )
        .bind(serde_json::json!({ name: path }))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn stale_started_runs(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, TaskError> {
        let rows = sqlx::query(
            "SELECT id FROM task_runs WHERE status = 'started' AND datetime_started < $1",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        let mut ids = Vec::with_capacity(rows.len());
        for row in rows {
            ids.push(row.try_get("id")?);
        }
        Ok(ids)
    }
}

/// In-process registry for tests and dry runs.
#[derive(Default)]
pub struct InMemoryRunRegistry {
    runs: Mutex<HashMap<Uuid, StoredRun>>,
}

#[derive(Clone)]
struct StoredRun {
    run: TaskRun,
    error_message: Option<String>,
}

impl InMemoryRunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn error_message(&self, id: Uuid) -> Option<String> {
        self.runs
            .lock()
            .ok()
            .and_then(|runs| runs.get(&id).and_then(|s| s.error_message.clone()))
    }

    fn with_run<T>(
        &self,
        id: Uuid,
        f: impl FnOnce(&mut StoredRun) -> T,
    ) -> Result<Option<T>, TaskError> {
        let mut runs = self
            .runs
            .lock()
            .map_err(|e| TaskError::Cache(format!("registry lock poisoned: {}", e)))?;
        Ok(runs.get_mut(&id).map(f))
    }
}

#[async_trait]
impl RunRegistry for InMemoryRunRegistry {
    async fn create_run(&self, run: &TaskRun) -> Result<(), TaskError> {
        let mut runs = self
            .runs
            .lock()
            .map_err(|e| TaskError::Cache(format!("registry lock poisoned: {}", e)))?;
        runs.insert(
            run.id,
            StoredRun {
                run: run.clone(),
                error_message: None,
            },
        );
        Ok(())
    }

    async fn get_run(&self, id: Uuid) -> Result<Option<TaskRun>, TaskError> {
        let runs = self
            .runs
            .lock()
            .map_err(|e| TaskError::Cache(format!("registry lock poisoned: {}", e)))?;
        Ok(runs.get(&id).map(|s| s.run.clone()))
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: TaskStatus,
        error_message: Option<&str>,
    ) -> Result<(), TaskError> {
        let updated = self.with_run(id, |stored| {
            stored.run.status = status;
            stored.error_message = error_message.map(str::to_string);
            if status != TaskStatus::Started {
                stored.run.datetime_finished = Some(Utc::now());
            }
        })?;
        if updated.is_none() {
            warn!("Status update for unknown task run {}", id);
        }
        Ok(())
    }

    async fn save_args(&self, id: Uuid, args: &Map<String, Value>) -> Result<(), TaskError> {
        self.with_run(id, |stored| {
            stored.run.args = args.clone();
        })?;
        Ok(())
    }

    async fn attach_report(&self, id: Uuid, name: &str, path: &str) -> Result<(), TaskError> {
        self.with_run(id, |stored| {
            stored.run.reports.insert(name.to_string(), path.to_string());
        })?;
        Ok(())
    }

    async fn stale_started_runs(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, TaskError> {
        let runs = self
            .runs
            .lock()
            .map_err(|e| TaskError::Cache(format!("registry lock poisoned: {}", e)))?;
        Ok(runs
            .values()
            .filter(|s| {
                s.run.status == TaskStatus::Started
                    && s.run.datetime_started.map(|t| t < cutoff).unwrap_or(false)
            })
            .map(|s| s.run.id)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn test_run_lifecycle() {
        let registry = InMemoryRunRegistry::new();
        let mut run = TaskRun::new("RunBatchCorrection", Some(4));
        run.datetime_started = Some(Utc::now());
        registry.create_run(&run).await.unwrap();

        registry
            .update_status(run.id, TaskStatus::Error, Some("engine failed"))
            .await
            .unwrap();

        let stored = registry.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Error);
        assert!(stored.datetime_finished.is_some());
        assert_eq!(
            registry.error_message(run.id),
            Some("engine failed".to_string())
        );
    }

    #[tokio::test]
    async fn test_stale_started_runs() {
        let registry = InMemoryRunRegistry::new();
        let mut stale = TaskRun::new("LoadTaskData", None);
        stale.datetime_started = Some(Utc::now() - Duration::hours(3));
        registry.create_run(&stale).await.unwrap();

        let mut fresh = TaskRun::new("LoadTaskData", None);
        fresh.datetime_started = Some(Utc::now());
        registry.create_run(&fresh).await.unwrap();

        let cutoff = Utc::now() - Duration::hours(1);
        let ids = registry.stale_started_runs(cutoff).await.unwrap();
        assert_eq!(ids, vec![stale.id]);
    }

    #[tokio::test]
    async fn test_attach_report() {
        let registry = InMemoryRunRegistry::new();
        let run = TaskRun::new("RunPCA", Some(1));
        registry.create_run(&run).await.unwrap();
        registry
            .attach_report(run.id, "feature_summary", "/reports/feature_summary")
            .await
            .unwrap();
        let stored = registry.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(
            stored.reports.get("feature_summary"),
            Some(&"/reports/feature_summary".to_string())
        );
    }
}
