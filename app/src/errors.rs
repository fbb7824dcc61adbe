// ==============================================================================
// errors.rs - Task Pipeline Error Taxonomy
// ==============================================================================
// Description: Error types for analysis task execution and reconciliation
// Created: 2026-02-10
// Modified: 2026-08-30
// Version: 1.0.0
// ==============================================================================

use thiserror::Error;
use uuid::Uuid;

/// Errors raised by the analysis task pipeline.
///
/// Fatal conditions surface as variants here; non-fatal conditions (a missing
/// results file after a clean engine exit, metadata columns dropped by an
/// upstream task) are logged and degrade to nulls instead.
#[derive(Error, Debug)]
pub enum TaskError {
    /// Invalid or contradictory task parameters. Raised at construction,
    /// before any I/O happens.
    #[error("Invalid task configuration: {0}")]
    Configuration(String),

    /// The upstream task run's cached data is missing. The operator must
    /// re-run the pipeline from the named task run.
    #[error(
        "The upstream task run cache does not exist! Please re-run the pipeline \
         from the previous task: {task_run_id}"
    )]
    UpstreamUnavailable { task_run_id: Uuid },

    /// The external engine process exited non-zero or timed out. Carries the
    /// captured content of the engine's own log file.
    #[error("External engine failed: {log}")]
    EngineFailure { log: String },

    /// Corrected matrix dimensions do not match the feature identity matrix.
    /// Position-based write-back under a shape mismatch would mis-align
    /// values, so this is always fatal.
    #[error(
        "Corrected matrix shape {actual_rows}x{actual_cols} does not match \
         original shape {expected_rows}x{expected_cols}: sample and feature \
         exclusions are not supported"
    )]
    ShapeMismatch {
        expected_rows: usize,
        expected_cols: usize,
        actual_rows: usize,
        actual_cols: usize,
    },

    /// A required column is absent from a metadata table.
    #[error("Missing column '{0}' in metadata table")]
    MissingColumn(String),

    /// Row/column counts of a table or matrix are inconsistent.
    #[error("Table shape error: {0}")]
    Shape(String),

    /// Result cache backend failure.
    #[error("Cache error: {0}")]
    Cache(String),

    /// Dataset source failure (query directory missing, malformed table).
    #[error("Dataset error: {0}")]
    Dataset(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_unavailable_names_run_id() {
        let id = Uuid::new_v4();
        let err = TaskError::UpstreamUnavailable { task_run_id: id };
        assert!(err.to_string().contains(&id.to_string()));
    }

    #[test]
    fn test_engine_failure_carries_log() {
        let err = TaskError::EngineFailure {
            log: "Error in loess(): singular matrix".to_string(),
        };
        assert!(err.to_string().contains("singular matrix"));
    }
}
