// ==============================================================================
// correction.rs - Correction Batch Assignment
// ==============================================================================
// Description: Derives monotonically increasing correction batch labels from
//              project and analytical batch boundaries in run order
// Created: 2026-02-10
// Modified: 2026-08-30
// Version: 1.0.0
// ==============================================================================

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::dataset::DatasetKind;
use crate::errors::TaskError;
use crate::models::{TaskRun, COL_BATCH, COL_CORRECTION_BATCH, COL_PROJECT};
use crate::table::DataTable;
use crate::task::{AnalysisTask, TaskContext, TaskState};

/// Read a batch-ish cell as a number.
///
/// Nulls count as zero (an unlabelled batch inherits). Non-numeric
/// placeholder strings come back as NaN, which compares unequal to every
/// value and therefore reads as a boundary wherever the placeholder appears.
pub fn read_numeric_batch(value: &Value) -> f64 {
    match value {
        Value::Null => 0.0,
        Value::Number(n) => n.as_f64().unwrap_or(f64::NAN),
        Value::String(s) => s.trim().parse::<f64>().unwrap_or(f64::NAN),
        _ => f64::NAN,
    }
}

/// Assign correction batch labels in a single forward pass over the rows.
///
/// The first row seeds from its existing Correction Batch value, defaulting
/// to 1. After that a project change or an analytical batch change starts a
/// new correction batch; a zero batch label inherits the previous row's
/// correction batch; anything else continues it. Labels never decrease.
/// The derived labels are written back into the Correction Batch column.
pub fn assign_correction_batches(
    sample_metadata: &mut DataTable,
) -> Result<Vec<f64>, TaskError> {
    for column in [COL_PROJECT, COL_BATCH] {
        if !sample_metadata.has_column(column) {
            return Err(TaskError::MissingColumn(column.to_string()));
        }
    }
    if !sample_metadata.has_column(COL_CORRECTION_BATCH) {
        sample_metadata.add_null_column(COL_CORRECTION_BATCH)?;
    }
    if sample_metadata.is_empty() {
        return Ok(Vec::new());
    }

    let n_rows = sample_metadata.n_rows();
    let mut labels = Vec::with_capacity(n_rows);

    let seed = sample_metadata
        .get(0, COL_CORRECTION_BATCH)
        .map(read_numeric_batch)
        .unwrap_or(0.0);
    let mut current = if seed.is_finite() && seed > 0.0 {
        seed
    } else {
        1.0
    };
    labels.push(current);

    let mut prev_project = sample_metadata.get(0, COL_PROJECT).cloned();
    let mut prev_batch = sample_metadata
        .get(0, COL_BATCH)
        .map(read_numeric_batch)
        .unwrap_or(0.0);

    for row in 1..n_rows {
        let project = sample_metadata.get(row, COL_PROJECT).cloned();
        let batch = sample_metadata
            .get(row, COL_BATCH)
            .map(read_numeric_batch)
            .unwrap_or(0.0);

        if project != prev_project {
            current += 1.0;
            debug!("Project boundary at row {}", row);
        } else if batch == 0.0 {
            // unlabelled analytical batch inherits
        } else if batch != prev_batch {
            current += 1.0;
            debug!("Batch boundary at row {}", row);
        }

        labels.push(current);
        prev_project = project;
        if batch != 0.0 {
            prev_batch = batch;
        }
    }

    for (row, label) in labels.iter().enumerate() {
        sample_metadata.set(row, COL_CORRECTION_BATCH, json!(label))?;
    }
    Ok(labels)
}

/// Task that derives correction batches for the run's dataset, writes them
/// back to the dataset source and re-caches the updated table.
pub struct CorrectionBatchTask {
    ctx: TaskContext,
    state: TaskState,
}

impl CorrectionBatchTask {
    pub fn new(ctx: TaskContext, run: TaskRun) -> Result<Self, TaskError> {
        ctx.config.validate()?;
        Ok(Self {
            ctx,
            state: TaskState::new(run),
        })
    }
}

#[async_trait]
impl AnalysisTask for CorrectionBatchTask {
    fn split(&mut self) -> (&TaskContext, &mut TaskState) {
        (&self.ctx, &mut self.state)
    }

    async fn run_analysis(&mut self) -> Result<(), TaskError> {
        let labels = assign_correction_batches(&mut self.state.data.sample_metadata)?;
        let n_batches = labels.last().copied().unwrap_or(0.0);
        info!(
            "Assigned {} correction batches over {} samples",
            n_batches,
            labels.len()
        );

        if let Some(query_id) = self.state.run.saved_query_id {
            self.ctx
                .dataset_source
                .persist_table(
                    DatasetKind::SampleMetadata,
                    query_id,
                    &self.state.data.sample_metadata,
                )
                .await?;
        }

        self.state.results = Some(json!({
            "n_samples": labels.len(),
            "n_correction_batches": n_batches,
        }));
        Ok(())
    }
}
