// ==============================================================================
// queue.rs - Redis Job Queue Management (Worker Side)
// ==============================================================================
// Description: Job queue operations for consuming analysis jobs from Redis
// Created: 2026-02-10
// Modified: 2026-08-30
// Version: 1.0.0
// ==============================================================================

use anyhow::{Context, Result};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use metabo_processor::models::AnalysisConfig;

const QUEUE_KEY: &str = "metabolomics:job_queue";

/// Which task the job should run (must match the scheduler)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Load the saved query's dataset into the cache
    Load,
    /// Derive and persist correction batch labels
    AssignCorrectionBatches,
    /// Render and execute an engine script against the dataset
    RunScript,
    /// Write an upstream correction run's values back to the database
    SaveCorrection,
}

impl TaskKind {
    pub fn class_name(&self) -> &'static str {
        match self {
            TaskKind::Load => "LoadTaskData",
            TaskKind::AssignCorrectionBatches => "AssignCorrectionBatches",
            TaskKind::RunScript => "RunAnalysisScript",
            TaskKind::SaveCorrection => "SaveBatchCorrection",
        }
    }
}

/// Job payload from the Redis queue (must match the scheduler)
#[derive(Debug, Serialize, Deserialize)]
pub struct AnalysisJobRequest {
    /// Run id assigned by the scheduler so it can poll cache keys directly
    pub task_run_id: Uuid,
    pub kind: TaskKind,
    pub saved_query_id: Option<i64>,
    /// Chain from this run's cached data/output instead of loading fresh
    pub upstream_task_run_id: Option<Uuid>,
    #[serde(default)]
    pub config: AnalysisConfig,
    /// Script template body (run_script only)
    pub template: Option<String>,
    /// Extra template parameters (run_script only)
    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

/// Job queue manager
pub struct JobQueue {
    conn: ConnectionManager,
}

impl JobQueue {
    /// Create new job queue manager
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    /// Dequeue a job (blocking pop with timeout)
    pub async fn dequeue(&mut self) -> Result<Option<AnalysisJobRequest>> {
        // BRPOP with 1 second timeout
        let result: Option<(String, String)> = self
            .conn
            .brpop(QUEUE_KEY, 1.0)
            .await
            .context("Failed to pop from queue")?;

        match result {
            Some((_, payload_json)) => {
                let payload: AnalysisJobRequest = serde_json::from_str(&payload_json)
                    .context("Failed to deserialize job payload")?;
                Ok(Some(payload))
            }
            None => Ok(None),
        }
    }

    /// Publish progress update to pub/sub channel
    pub async fn publish_progress(&mut self, task_run_id: Uuid, message: &str) -> Result<()> {
        let channel = format!("metabolomics:progress:{}", task_run_id);
        self.conn
            .publish::<_, _, ()>(channel, message)
            .await
            .context("Failed to publish progress update")?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_round_trip() {
        let payload = AnalysisJobRequest {
            task_run_id: Uuid::new_v4(),
            kind: TaskKind::RunScript,
            saved_query_id: Some(4),
            upstream_task_run_id: None,
            config: AnalysisConfig::default(),
            template: Some("writeLines('ok')".to_string()),
            params: serde_json::Map::new(),
        };
        let json = serde_json::to_string(&payload).unwrap();
        let decoded: AnalysisJobRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.kind, TaskKind::RunScript);
        assert_eq!(decoded.saved_query_id, Some(4));
    }

    #[test]
    fn test_kind_class_names() {
        assert_eq!(TaskKind::SaveCorrection.class_name(), "SaveBatchCorrection");
        assert_eq!(
            serde_json::to_string(&TaskKind::AssignCorrectionBatches).unwrap(),
            "\"assign_correction_batches\""
        );
    }
}
