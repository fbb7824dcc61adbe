// ==============================================================================
// task.rs - Analysis Task Lifecycle
// ==============================================================================
// Description: The load / run / save lifecycle shared by all analysis tasks,
//              including upstream chaining and cache persistence
// Created: 2026-02-10
// Modified: 2026-08-30
// Version: 1.0.0
// ==============================================================================

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::cache::{ResultCache, TASK_CACHE_TTL_SECS};
use crate::dataset::{DatasetKind, DatasetSource};
use crate::errors::TaskError;
use crate::models::{
    AnalysisConfig, TaskRun, TaskStatus, WorkingDataset, COL_SAMPLE_FILE_NAME, COL_SAMPLE_ID,
};
use crate::reconcile::KEY_FEATURE_ID_MATRIX;
use crate::registry::RunRegistry;
use crate::table::DataTable;

/// Shared services and resolved configuration for one task execution.
#[derive(Clone)]
pub struct TaskContext {
    pub cache: Arc<dyn ResultCache>,
    pub dataset_source: Arc<dyn DatasetSource>,
    pub registry: Arc<dyn RunRegistry>,
    pub config: AnalysisConfig,
}

/// Mutable per-run state threaded through the lifecycle.
pub struct TaskState {
    pub run: TaskRun,
    pub data: WorkingDataset,
    pub results: Option<Value>,
}

impl TaskState {
    pub fn new(run: TaskRun) -> Self {
        Self {
            run,
            data: WorkingDataset::default(),
            results: None,
        }
    }
}

/// The fixed load / run / save lifecycle every analysis task follows.
///
/// Implementors provide `split` (and usually `run_analysis`); the provided
/// methods supply the shared semantics: data acquisition from the source or
/// an upstream run, cache persistence with TTL, and args echoing into the
/// run record. Overriding a phase replaces it wholesale.
#[async_trait]
pub trait AnalysisTask: Send {
    /// Borrow the shared context and the mutable state together.
    fn split(&mut self) -> (&TaskContext, &mut TaskState);

    /// Acquire the working dataset and persist it under the run's data key.
    async fn load_data(&mut self) -> Result<(), TaskError> {
        let (ctx, state) = self.split();
        info!(
            "Loading data for task run {} ({})",
            state.run.id, state.run.class_name
        );
        if let Some(upstream_id) = state.run.upstream_task_run_id {
            load_from_upstream(ctx, state, upstream_id).await?;
        } else {
            load_from_source(ctx, state).await?;
        }
        persist_data(ctx, state).await
    }

    /// The task's own computation. The default is a pass-through for tasks
    /// whose purpose is loading and caching alone.
    async fn run_analysis(&mut self) -> Result<(), TaskError> {
        Ok(())
    }

    /// Persist the declared output, re-persist the (possibly mutated) data
    /// and echo the resolved args into the run record.
    async fn save_results(&mut self) -> Result<(), TaskError> {
        let (ctx, state) = self.split();
        persist_results(ctx, state).await
    }

    /// Run the full lifecycle and return the declared output.
    async fn process(&mut self) -> Result<Option<Value>, TaskError> {
        self.load_data().await?;
        self.run_analysis().await?;
        self.save_results().await?;
        let (_, state) = self.split();
        Ok(state.results.clone())
    }
}

/// Load the working dataset from the dataset source for the run's saved
/// query. A prior cached dataset is reused unless `reload_cache` is set.
async fn load_from_source(ctx: &TaskContext, state: &mut TaskState) -> Result<(), TaskError> {
    let data_key = state.run.task_data_cache_key();
    if !ctx.config.reload_cache && ctx.cache.exists(&data_key).await? {
        info!("Reusing cached data for task run {}", state.run.id);
        let cached = ctx.cache.get(&data_key).await?.unwrap_or(Value::Null);
        state.data = WorkingDataset::from_cache_value(&cached)?;
        return Ok(());
    }

    let query_id = state.run.saved_query_id.ok_or_else(|| {
        TaskError::Configuration(
            "task has neither a saved query id nor an upstream task run".to_string(),
        )
    })?;

    let mut sample_metadata = ctx
        .dataset_source
        .load_table(DatasetKind::SampleMetadata, query_id, &ctx.config)
        .await?;
    let mut feature_metadata = ctx
        .dataset_source
        .load_table(DatasetKind::FeatureMetadata, query_id, &ctx.config)
        .await?;
    let intensity = ctx
        .dataset_source
        .load_intensity(query_id, &ctx.config)
        .await?;

    sample_metadata.normalize_for_cache();
    feature_metadata.normalize_for_cache();

    state.data = WorkingDataset {
        untransformed_sample_metadata: Some(sample_metadata.clone()),
        sample_metadata,
        feature_metadata,
        intensity_matrix: intensity,
        extra: serde_json::Map::new(),
    };

    // carried through the cache so a downstream save-correction task can
    // map corrected values back onto their entities
    if let Some(identity) = ctx.dataset_source.load_feature_id_matrix(query_id).await? {
        state.data.extra.insert(
            KEY_FEATURE_ID_MATRIX.to_string(),
            serde_json::to_value(&identity)?,
        );
    }

    state.data.validate_shape()
}

/// Adopt an upstream run's declared output as this run's working data.
///
/// The upstream data blob must still be cached; its absence is fatal and the
/// operator must re-run the pipeline from the upstream task. Metadata
/// columns the upstream task dropped are restored from its untransformed
/// sample metadata.
async fn load_from_upstream(
    ctx: &TaskContext,
    state: &mut TaskState,
    upstream_id: uuid::Uuid,
) -> Result<(), TaskError> {
    let data_key = TaskRun::data_cache_key_for(upstream_id);
    if !ctx.cache.exists(&data_key).await? {
        return Err(TaskError::UpstreamUnavailable {
            task_run_id: upstream_id,
        });
    }
    let upstream_data_value = ctx.cache.get(&data_key).await?.unwrap_or(Value::Null);
    let upstream_data = WorkingDataset::from_cache_value(&upstream_data_value)?;

    let output_key = TaskRun::output_cache_key_for(upstream_id);
    let upstream_output_value = ctx.cache.get(&output_key).await?.unwrap_or(Value::Null);
    let mut adopted = WorkingDataset::from_cache_value(&upstream_output_value)?;

    match upstream_data.untransformed_sample_metadata {
        Some(untransformed) if !adopted.sample_metadata.columns().is_empty() => {
            info!("Found upstream sample metadata");
            reattach_sample_metadata(&mut adopted.sample_metadata, &untransformed);
            adopted.untransformed_sample_metadata = Some(untransformed);
        }
        _ => {
            info!("Did not find upstream sample metadata!");
            if adopted.sample_metadata.columns().is_empty() {
                // output carried no tabular data, fall back to the data blob
                adopted.sample_metadata = upstream_data.sample_metadata;
                adopted.feature_metadata = upstream_data.feature_metadata;
                if adopted.intensity_matrix.is_empty() {
                    adopted.intensity_matrix = upstream_data.intensity_matrix;
                }
                adopted.untransformed_sample_metadata =
                    upstream_data.untransformed_sample_metadata;
            }
        }
    }

    // the identity matrix travels with the data blob, not the output
    if !adopted.extra.contains_key(KEY_FEATURE_ID_MATRIX) {
        if let Some(identity) = upstream_data.extra.get(KEY_FEATURE_ID_MATRIX) {
            adopted
                .extra
                .insert(KEY_FEATURE_ID_MATRIX.to_string(), identity.clone());
        }
    }

    state.data = adopted;
    Ok(())
}

/// Restore metadata columns the upstream task dropped.
///
/// When row counts match the missing columns are copied across by position.
/// Otherwise rows are matched on a lookup key; rows without a match keep
/// nulls, logged rather than raised.
fn reattach_sample_metadata(sample_metadata: &mut DataTable, untransformed: &DataTable) {
    let missing: Vec<String> = untransformed
        .columns()
        .iter()
        .filter(|name| !sample_metadata.has_column(name))
        .cloned()
        .collect();
    if missing.is_empty() {
        return;
    }

    if sample_metadata.n_rows() == untransformed.n_rows() {
        debug!(
            "Reattaching {} dropped metadata columns by position",
            missing.len()
        );
        for name in &missing {
            if let Some(values) = untransformed.column_values(name) {
                if let Err(e) = sample_metadata.add_column(name, values) {
                    warn!("Could not reattach column '{}': {}", name, e);
                }
            }
        }
        return;
    }

    let lookup_key = [COL_SAMPLE_FILE_NAME, COL_SAMPLE_ID]
        .into_iter()
        .find(|key| sample_metadata.has_column(key) && untransformed.has_column(key));
    let Some(lookup_key) = lookup_key else {
        warn!(
            "Upstream sample metadata has {} rows but the output has {} and no \
             lookup key is shared, leaving {} columns unrestored",
            untransformed.n_rows(),
            sample_metadata.n_rows(),
            missing.len()
        );
        return;
    };

    debug!(
        "Reattaching {} dropped metadata columns via '{}'",
        missing.len(),
        lookup_key
    );
    for name in &missing {
        if let Err(e) = sample_metadata.add_null_column(name) {
            warn!("Could not reattach column '{}': {}", name, e);
        }
    }
    let mut unmatched = 0usize;
    for row in 0..sample_metadata.n_rows() {
        let key_value = match sample_metadata.get(row, lookup_key) {
            Some(v) => v.clone(),
            None => continue,
        };
        match untransformed.find_row(lookup_key, &key_value) {
            Some(source_row) => {
                for name in &missing {
                    if let Some(value) = untransformed.get(source_row, name) {
                        let value = value.clone();
                        if let Err(e) = sample_metadata.set(row, name, value) {
                            warn!("Could not restore '{}' for row {}: {}", name, row, e);
                        }
                    }
                }
            }
            None => unmatched += 1,
        }
    }
    if unmatched > 0 {
        warn!(
            "{} sample rows had no '{}' match in upstream metadata, values left null",
            unmatched, lookup_key
        );
    }
}

/// Persist the working dataset under the run's data key with the shared TTL.
async fn persist_data(ctx: &TaskContext, state: &mut TaskState) -> Result<(), TaskError> {
    state.data.validate_shape()?;
    let ttl = Duration::from_secs(TASK_CACHE_TTL_SECS);
    let blob = state.data.to_cache_value()?;
    ctx.cache
        .set(&state.run.task_data_cache_key(), &blob, Some(ttl))
        .await
}

/// Persist the declared output, refresh the data blob and echo the resolved
/// args into the run record.
async fn persist_results(ctx: &TaskContext, state: &mut TaskState) -> Result<(), TaskError> {
    info!("Saving results for task run {}", state.run.id);
    let ttl = Duration::from_secs(TASK_CACHE_TTL_SECS);
    let results = state.results.clone().unwrap_or(Value::Null);
    ctx.cache
        .set(&state.run.task_output_cache_key(), &results, Some(ttl))
        .await?;
    persist_data(ctx, state).await?;

    for (key, value) in ctx.config.to_args() {
        state.run.args.entry(key).or_insert(value);
    }
    ctx.registry.save_args(state.run.id, &state.run.args).await?;
    info!("Done");
    Ok(())
}

/// Drive a task through its lifecycle with registry bookkeeping.
///
/// The run is registered as started, any stale output entry for this run id
/// is invalidated, and the terminal status (with the error message on
/// failure) is recorded before the result propagates.
pub async fn execute_task<T: AnalysisTask>(task: &mut T) -> Result<Option<Value>, TaskError> {
    {
        let (ctx, state) = task.split();
        state.run.status = TaskStatus::Started;
        state.run.datetime_started = Some(Utc::now());
        ctx.registry.create_run(&state.run).await?;

        let output_key = state.run.task_output_cache_key();
        if ctx.cache.exists(&output_key).await? {
            ctx.cache.delete(&output_key).await?;
            info!("Invalidated stale output entry {}", output_key);
        }
    }

    match task.process().await {
        Ok(results) => {
            let (ctx, state) = task.split();
            state.run.status = TaskStatus::Success;
            state.run.datetime_finished = Some(Utc::now());
            ctx.registry
                .update_status(state.run.id, TaskStatus::Success, None)
                .await?;
            info!("Task run {} succeeded", state.run.id);
            Ok(results)
        }
        Err(err) => {
            let (ctx, state) = task.split();
            state.run.status = TaskStatus::Error;
            state.run.datetime_finished = Some(Utc::now());
            let message = err.to_string();
            error!("Task run {} failed: {}", state.run.id, message);
            if let Err(update_err) = ctx
                .registry
                .update_status(state.run.id, TaskStatus::Error, Some(&message))
                .await
            {
                error!(
                    "Could not record failure for task run {}: {}",
                    state.run.id, update_err
                );
            }
            Err(err)
        }
    }
}

/// Task that loads a saved query's dataset into the cache and declares the
/// dataset itself as output, so downstream tasks can chain from it.
pub struct LoadTask {
    ctx: TaskContext,
    state: TaskState,
}

impl LoadTask {
    pub fn new(ctx: TaskContext, run: TaskRun) -> Result<Self, TaskError> {
        ctx.config.validate()?;
        Ok(Self {
            ctx,
            state: TaskState::new(run),
        })
    }
}

#[async_trait]
impl AnalysisTask for LoadTask {
    fn split(&mut self) -> (&TaskContext, &mut TaskState) {
        (&self.ctx, &mut self.state)
    }

    async fn run_analysis(&mut self) -> Result<(), TaskError> {
        self.state.results = Some(self.state.data.to_cache_value()?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryResultCache;
    use crate::dataset::{InMemoryDatasetSource, QueryData};
    use crate::models::{COL_BATCH, COL_PROJECT};
    use crate::registry::InMemoryRunRegistry;
    use crate::table::IntensityMatrix;
    use serde_json::json;

    fn context_with_query(query_id: i64) -> TaskContext {
        let mut sample_metadata = DataTable::new(vec![
            COL_SAMPLE_ID.to_string(),
            COL_PROJECT.to_string(),
            COL_BATCH.to_string(),
        ]);
        sample_metadata
            .push_row(vec![json!("S1"), json!("X"), json!(1)])
            .unwrap();
        sample_metadata
            .push_row(vec![json!("S2"), json!("X"), json!(1)])
            .unwrap();
        let mut feature_metadata = DataTable::new(vec!["feature_id".to_string()]);
        feature_metadata.push_row(vec![json!(10)]).unwrap();
        feature_metadata.push_row(vec![json!(11)]).unwrap();

        let source = InMemoryDatasetSource::new();
        source.insert(
            query_id,
            QueryData {
                sample_metadata,
                feature_metadata,
                intensity: IntensityMatrix::new(vec![vec![1.0, 2.0], vec![3.0, 4.0]]).unwrap(),
                feature_id_matrix: None,
            },
        );
        TaskContext {
            cache: Arc::new(InMemoryResultCache::new()),
            dataset_source: Arc::new(source),
            registry: Arc::new(InMemoryRunRegistry::new()),
            config: AnalysisConfig::default(),
        }
    }

    #[tokio::test]
    async fn test_process_persists_data_and_output() {
        let ctx = context_with_query(4);
        let run = TaskRun::new("LoadTaskData", Some(4));
        let data_key = run.task_data_cache_key();
        let output_key = run.task_output_cache_key();

        let mut task = LoadTask::new(ctx.clone(), run).unwrap();
        let results = execute_task(&mut task).await.unwrap();

        assert!(results.is_some());
        assert!(ctx.cache.exists(&data_key).await.unwrap());
        assert!(ctx.cache.exists(&output_key).await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_upstream_cache_is_fatal() {
        let ctx = context_with_query(4);
        let upstream_id = uuid::Uuid::new_v4();
        let run = TaskRun::new("RunPCA", None).with_upstream(upstream_id);

        let mut task = LoadTask::new(ctx.clone(), run.clone()).unwrap();
        let err = execute_task(&mut task).await.unwrap_err();
        assert!(matches!(
            err,
            TaskError::UpstreamUnavailable { task_run_id } if task_run_id == upstream_id
        ));
        assert!(err.to_string().contains(&upstream_id.to_string()));

        let stored = ctx.registry.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Error);
    }

    #[tokio::test]
    async fn test_args_echoed_into_run_record() {
        let mut ctx = context_with_query(4);
        ctx.config.harmonise_annotations = true;
        let run = TaskRun::new("LoadTaskData", Some(4));
        let run_id = run.id;

        let mut task = LoadTask::new(ctx.clone(), run).unwrap();
        execute_task(&mut task).await.unwrap();

        let stored = ctx.registry.get_run(run_id).await.unwrap().unwrap();
        assert_eq!(stored.args.get("harmonise_annotations"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn test_downstream_adopts_upstream_output() {
        let ctx = context_with_query(4);
        let upstream_run = TaskRun::new("LoadTaskData", Some(4));
        let mut upstream = LoadTask::new(ctx.clone(), upstream_run.clone()).unwrap();
        execute_task(&mut upstream).await.unwrap();

        let run = TaskRun::new("RunPCA", None).with_upstream(upstream_run.id);
        let mut downstream = LoadTask::new(ctx.clone(), run).unwrap();
        execute_task(&mut downstream).await.unwrap();

        let (_, state) = downstream.split();
        assert_eq!(state.data.sample_metadata.n_rows(), 2);
        assert_eq!(state.data.intensity_matrix.shape(), (2, 2));
    }

    #[test]
    fn test_reattach_by_position_when_rows_match() {
        // upstream output kept 2 of 4 columns; rows align, so the dropped
        // columns come back by position
        let mut output = DataTable::new(vec![
            COL_SAMPLE_ID.to_string(),
            COL_BATCH.to_string(),
        ]);
        output.push_row(vec![json!("S1"), json!(1)]).unwrap();
        output.push_row(vec![json!("S2"), json!(2)]).unwrap();

        let mut untransformed = DataTable::new(vec![
            COL_SAMPLE_ID.to_string(),
            COL_BATCH.to_string(),
            "metadata::Age".to_string(),
            "metadata::BMI".to_string(),
        ]);
        untransformed
            .push_row(vec![json!("S1"), json!(1), json!(34), json!(22.5)])
            .unwrap();
        untransformed
            .push_row(vec![json!("S2"), json!(2), json!(51), json!(27.1)])
            .unwrap();

        reattach_sample_metadata(&mut output, &untransformed);
        assert_eq!(output.n_cols(), 4);
        assert_eq!(output.get(1, "metadata::Age"), Some(&json!(51)));
    }

    #[test]
    fn test_reattach_falls_back_to_keyed_join() {
        // upstream output dropped a row, so positional copy is unsafe and
        // the join runs on Sample ID; the unmatched row keeps nulls
        let mut output = DataTable::new(vec![COL_SAMPLE_ID.to_string()]);
        output.push_row(vec![json!("S2")]).unwrap();
        output.push_row(vec![json!("S3")]).unwrap();

        let mut untransformed = DataTable::new(vec![
            COL_SAMPLE_ID.to_string(),
            "metadata::Age".to_string(),
        ]);
        untransformed.push_row(vec![json!("S1"), json!(34)]).unwrap();
        untransformed.push_row(vec![json!("S2"), json!(51)]).unwrap();

        reattach_sample_metadata(&mut output, &untransformed);
        assert_eq!(output.get(0, "metadata::Age"), Some(&json!(51)));
        assert_eq!(output.get(1, "metadata::Age"), Some(&Value::Null));
    }

    #[tokio::test]
    async fn test_output_invalidated_at_start() {
        let ctx = context_with_query(4);
        let run = TaskRun::new("LoadTaskData", Some(4));
        let output_key = run.task_output_cache_key();
        ctx.cache
            .set(&output_key, &json!("stale"), None)
            .await
            .unwrap();

        let mut task = LoadTask::new(ctx.clone(), run).unwrap();
        execute_task(&mut task).await.unwrap();

        // the stale value must be gone; the fresh output replaces it
        let value = ctx.cache.get(&output_key).await.unwrap();
        assert_ne!(value, Some(json!("stale")));
    }
}
