// ==============================================================================
// reconcile.rs - Corrected Matrix Reconciliation
// ==============================================================================
// Description: Maps corrected intensity values back onto the persisted
//              annotated-feature entities via the feature identity matrix
// Created: 2026-02-10
// Modified: 2026-08-30
// Version: 1.0.0
// ==============================================================================

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::PgPool;
use std::path::Path;
use tracing::{info, warn};

use crate::errors::TaskError;
use crate::models::{CorrectionType, TaskRun, WorkingDataset};
use crate::table::IntensityMatrix;
use crate::task::{AnalysisTask, TaskContext, TaskState};

/// Cache key under which correction tasks store the identity matrix.
pub const KEY_FEATURE_ID_MATRIX: &str = "original_annotated_feature_id_matrix";
pub const KEY_CORRECTED_INTENSITY: &str = "corrected_intensity_data";
pub const KEY_CORRECTED_SAMPLE_METADATA: &str = "corrected_sample_metadata";
pub const KEY_CORRECTED_FEATURE_METADATA: &str = "corrected_feature_metadata";

/// A samples x features matrix of persistent annotated-feature ids, aligned
/// cell-for-cell with the original intensity matrix at assembly time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureIdentityMatrix {
    data: Vec<Vec<i64>>,
}

impl FeatureIdentityMatrix {
    pub fn new(data: Vec<Vec<i64>>) -> Result<Self, TaskError> {
        if let Some(first) = data.first() {
            let width = first.len();
            if data.iter().any(|row| row.len() != width) {
                return Err(TaskError::Shape(
                    "feature identity matrix rows have unequal lengths".to_string(),
                ));
            }
        }
        Ok(Self { data })
    }

    pub fn shape(&self) -> (usize, usize) {
        let rows = self.data.len();
        let cols = self.data.first().map(|r| r.len()).unwrap_or(0);
        (rows, cols)
    }

    pub fn get(&self, row: usize, col: usize) -> Option<i64> {
        self.data.get(row).and_then(|r| r.get(col)).copied()
    }

    /// Read a headerless CSV of integer ids.
    pub fn read_csv(path: impl AsRef<Path>) -> Result<Self, TaskError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .from_path(path.as_ref())?;
        let mut data = Vec::new();
        for record in reader.records() {
            let record = record?;
            let mut row = Vec::with_capacity(record.len());
            for cell in record.iter() {
                let id = cell.trim().parse::<i64>().map_err(|_| {
                    TaskError::Dataset(format!(
                        "feature identity matrix cell '{}' is not an integer id",
                        cell
                    ))
                })?;
                row.push(id);
            }
            data.push(row);
        }
        Self::new(data)
    }
}

/// One corrected value attached back to its persistent entity.
#[derive(Debug, Clone, PartialEq)]
pub struct CorrectedCell {
    pub feature_entity_id: i64,
    pub row: usize,
    pub col: usize,
    pub value: f64,
}

/// Result of a reconciliation pass.
#[derive(Debug, Clone, Default)]
pub struct ReconcileOutcome {
    pub cells: Vec<CorrectedCell>,
    pub skipped_non_finite: usize,
}

/// Map a corrected matrix back onto the original entity identifiers.
///
/// Non-finite corrected values mark engine-side exclusions and are skipped
/// so they never overwrite a valid prior value. A shape difference between
/// the corrected matrix and the identity matrix means rows or columns were
/// dropped by the engine; position-based writes would then mis-align, so the
/// mismatch is fatal. The engine contract requires shape preservation, with
/// excluded cells padded with an infinity sentinel.
pub fn reconcile(
    identity: &FeatureIdentityMatrix,
    corrected: &IntensityMatrix,
) -> Result<ReconcileOutcome, TaskError> {
    let (expected_rows, expected_cols) = identity.shape();
    let (actual_rows, actual_cols) = corrected.shape();
    if (expected_rows, expected_cols) != (actual_rows, actual_cols) {
        return Err(TaskError::ShapeMismatch {
            expected_rows,
            expected_cols,
            actual_rows,
            actual_cols,
        });
    }

    let mut outcome = ReconcileOutcome::default();
    for row in 0..actual_rows {
        for col in 0..actual_cols {
            let value = corrected.get(row, col).unwrap_or(f64::NAN);
            if !value.is_finite() {
                outcome.skipped_non_finite += 1;
                continue;
            }
            // identity lookup cannot fail after the shape check
            if let Some(feature_entity_id) = identity.get(row, col) {
                outcome.cells.push(CorrectedCell {
                    feature_entity_id,
                    row,
                    col,
                    value,
                });
            }
        }
    }
    Ok(outcome)
}

/// Write reconciled values onto the annotated-feature rows.
pub async fn save_corrected_intensities(
    pool: &PgPool,
    correction_type: CorrectionType,
    cells: &[CorrectedCell],
) -> Result<u64, TaskError> {
    let column = match correction_type {
        CorrectionType::LoessSr => "sr_corrected_intensity",
        CorrectionType::LoessLtr => "ltr_corrected_intensity",
    };
    let sql = format!(
        "UPDATE annotated_feature SET {} = $1 WHERE id = $2",
        column
    );

    let mut updated = 0u64;
    for cell in cells {
        let result = sqlx::query(&sql)
            .bind(cell.value)
            .bind(cell.feature_entity_id)
            .execute(pool)
            .await?;
        updated += result.rows_affected();
    }
    info!("Updated {} corrected intensities ({})", updated, column);
    Ok(updated)
}

/// Task that adopts a correction run's output and writes the corrected
/// values back onto their original entities.
///
/// Runs downstream of a correction task: the upstream output must carry the
/// corrected tables plus the feature identity matrix captured when the
/// original matrix was assembled.
pub struct SaveCorrectionTask {
    ctx: TaskContext,
    state: TaskState,
    pool: Option<PgPool>,
    correction_type: CorrectionType,
}

impl SaveCorrectionTask {
    pub fn new(ctx: TaskContext, run: TaskRun, pool: Option<PgPool>) -> Result<Self, TaskError> {
        ctx.config.validate()?;
        let correction_type = ctx.config.correction_type.ok_or_else(|| {
            TaskError::Configuration(
                "save-correction task requires a correction_type".to_string(),
            )
        })?;
        if run.upstream_task_run_id.is_none() {
            return Err(TaskError::Configuration(
                "save-correction task requires an upstream task run id".to_string(),
            ));
        }
        Ok(Self {
            ctx,
            state: TaskState::new(run),
            pool,
            correction_type,
        })
    }

    fn required_extra(data: &WorkingDataset, key: &str) -> Result<Value, TaskError> {
        data.extra
            .get(key)
            .cloned()
            .ok_or_else(|| TaskError::Dataset(format!("upstream output has no {}", key)))
    }
}

#[async_trait::async_trait]
impl AnalysisTask for SaveCorrectionTask {
    fn split(&mut self) -> (&TaskContext, &mut TaskState) {
        (&self.ctx, &mut self.state)
    }

    async fn run_analysis(&mut self) -> Result<(), TaskError> {
        let corrected_value = Self::required_extra(&self.state.data, KEY_CORRECTED_INTENSITY)?;
        let identity_value = Self::required_extra(&self.state.data, KEY_FEATURE_ID_MATRIX)?;
        // the corrected metadata tables must be present even though the
        // write-back is positional, so a truncated upstream output fails
        // loudly instead of writing a partial correction
        Self::required_extra(&self.state.data, KEY_CORRECTED_SAMPLE_METADATA)?;
        Self::required_extra(&self.state.data, KEY_CORRECTED_FEATURE_METADATA)?;

        let corrected = IntensityMatrix::from_json_value(&corrected_value)?;
        let identity: FeatureIdentityMatrix = serde_json::from_value(identity_value)?;

        let outcome = reconcile(&identity, &corrected)?;
        if outcome.skipped_non_finite > 0 {
            warn!(
                "Skipped {} non-finite corrected cells (engine exclusions)",
                outcome.skipped_non_finite
            );
        }

        let correction_type = self.correction_type;
        let written = match &self.pool {
            Some(pool) => save_corrected_intensities(pool, correction_type, &outcome.cells).await?,
            None => {
                info!("No database pool configured, skipping intensity write-back");
                0
            }
        };

        self.state.results = Some(json!({
            "correction_type": correction_type.as_str(),
            "cells_reconciled": outcome.cells.len(),
            "cells_skipped_non_finite": outcome.skipped_non_finite,
            "rows_updated": written,
        }));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity_2x2() -> FeatureIdentityMatrix {
        FeatureIdentityMatrix::new(vec![vec![101, 102], vec![201, 202]]).unwrap()
    }

    #[test]
    fn test_reconcile_skips_infinite_cells() {
        let corrected =
            IntensityMatrix::new(vec![vec![1.0, f64::INFINITY], vec![3.0, 4.0]]).unwrap();
        let outcome = reconcile(&identity_2x2(), &corrected).unwrap();
        assert_eq!(outcome.skipped_non_finite, 1);
        assert_eq!(outcome.cells.len(), 3);
        // the +Infinity cell (row 0, col 1 -> id 102) must not be written
        assert!(outcome
            .cells
            .iter()
            .all(|cell| cell.feature_entity_id != 102));
    }

    #[test]
    fn test_reconcile_maps_entity_ids_by_position() {
        let corrected = IntensityMatrix::new(vec![vec![1.5, 2.5], vec![3.5, 4.5]]).unwrap();
        let outcome = reconcile(&identity_2x2(), &corrected).unwrap();
        let cell = outcome
            .cells
            .iter()
            .find(|c| c.row == 1 && c.col == 0)
            .unwrap();
        assert_eq!(cell.feature_entity_id, 201);
        assert_eq!(cell.value, 3.5);
    }

    #[test]
    fn test_reconcile_rejects_shape_mismatch() {
        let corrected = IntensityMatrix::new(vec![vec![1.0, 2.0]]).unwrap();
        let err = reconcile(&identity_2x2(), &corrected).unwrap_err();
        assert!(matches!(err, TaskError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_identity_matrix_rejects_ragged_rows() {
        assert!(FeatureIdentityMatrix::new(vec![vec![1], vec![1, 2]]).is_err());
    }

    #[test]
    fn test_identity_matrix_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feature_id_matrix.csv");
        std::fs::write(&path, "101,102\n201,202\n").unwrap();
        let matrix = FeatureIdentityMatrix::read_csv(&path).unwrap();
        assert_eq!(matrix, identity_2x2());
    }
}
