// ==============================================================================
// models.rs - Run Identity, Configuration and Working Dataset Models
// ==============================================================================
// Description: Data structures for analysis task runs and in-flight datasets
// Created: 2026-02-10
// Modified: 2026-08-30
// Version: 1.0.0
// ==============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use uuid::Uuid;

use crate::errors::TaskError;
use crate::table::{DataTable, IntensityMatrix};

// Core sample metadata column names. Everything else lives under the
// "metadata::" / "h_metadata::" namespaces.
pub const COL_PROJECT: &str = "Project";
pub const COL_BATCH: &str = "Batch";
pub const COL_RUN_ORDER: &str = "Run Order";
pub const COL_CORRECTION_BATCH: &str = "Correction Batch";
pub const COL_ACQUIRED_TIME: &str = "Acquired Time";
pub const COL_SAMPLE_TYPE: &str = "Sample Type";
pub const COL_ASSAY_ROLE: &str = "Assay Role";
pub const COL_SAMPLE_FILE_NAME: &str = "Sample File Name";
pub const COL_SAMPLE_ID: &str = "Sample ID";

pub const METADATA_PREFIX: &str = "metadata::";
pub const HARMONISED_METADATA_PREFIX: &str = "h_metadata::";

/// Feature metadata column holding the persistent feature identifier.
pub const COL_FEATURE_ID: &str = "feature_id";
/// Feature identifier column when harmonised annotations are requested.
pub const COL_HARMONISED_ANNOTATION_ID: &str = "harmonised_annotation_id";

/// Task run lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Started,
    Success,
    Error,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Started => "started",
            TaskStatus::Success => "success",
            TaskStatus::Error => "error",
        }
    }
}

/// Intensity scaling applied by the dataset source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalingType {
    /// Univariate (unit variance)
    Uv,
    /// Pareto
    Pa,
    /// Mean centring
    Mc,
    /// Median
    Med,
}

/// Intensity transform applied by the dataset source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransformType {
    Log,
    Sqrt,
}

/// Sample type filter values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleType {
    StudySample,
    StudyPool,
    ExternalReference,
}

/// Assay role filter values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssayRole {
    Assay,
    PrecisionReference,
    LinearityReference,
}

/// Batch correction flavour, keyed to the reference sample type used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CorrectionType {
    LoessSr,
    LoessLtr,
}

impl CorrectionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CorrectionType::LoessSr => "LOESS_SR",
            CorrectionType::LoessLtr => "LOESS_LTR",
        }
    }
}

/// Aggregation function for class-level queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateFunction {
    Mean,
    Median,
    Sum,
    Avg,
}

/// The resolved configuration for one analysis task.
///
/// This is the fixed enumerated option set passed through to the dataset
/// source; unrecognized combinations are the source's concern, not the
/// pipeline's. The full map is echoed into the run record on save so every
/// run is self-describing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalysisConfig {
    pub scaling: Option<ScalingType>,
    pub transform: Option<TransformType>,
    #[serde(default)]
    pub sample_types: Vec<SampleType>,
    #[serde(default)]
    pub assay_roles: Vec<AssayRole>,
    pub correction_type: Option<CorrectionType>,
    #[serde(default)]
    pub harmonise_annotations: bool,
    pub class_level: Option<String>,
    pub class_type: Option<String>,
    pub aggregate_function: Option<AggregateFunction>,
    #[serde(default)]
    pub columns_to_include: Vec<String>,
    #[serde(default)]
    pub columns_to_exclude: Vec<String>,
    #[serde(default)]
    pub reload_cache: bool,
}

impl AnalysisConfig {
    /// Validate the configuration. Contradictions fail here, before any I/O.
    pub fn validate(&self) -> Result<(), TaskError> {
        for column in &self.columns_to_include {
            if self.columns_to_exclude.contains(column) {
                return Err(TaskError::Configuration(format!(
                    "column '{}' is both included and excluded",
                    column
                )));
            }
        }
        if self.class_level.is_some() && self.aggregate_function.is_none() {
            return Err(TaskError::Configuration(
                "class_level requires an aggregate_function".to_string(),
            ));
        }
        Ok(())
    }

    /// Render the configuration as an args map for the run record.
    pub fn to_args(&self) -> Map<String, Value> {
        let mut args = Map::new();
        if let Ok(Value::Object(map)) = serde_json::to_value(self) {
            for (key, value) in map {
                let empty_list = matches!(&value, Value::Array(items) if items.is_empty());
                if !value.is_null() && !empty_list {
                    args.insert(key, value);
                }
            }
        }
        args
    }
}

/// One execution of an analysis task: the run identity.
///
/// Owns the resolved parameter map and the optional upstream link. The cache
/// entries derived from it outlive the task object so downstream tasks and
/// UI consumers can read them without re-running.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRun {
    pub id: Uuid,
    pub class_name: String,
    pub saved_query_id: Option<i64>,
    pub upstream_task_run_id: Option<Uuid>,
    pub args: Map<String, Value>,
    pub status: TaskStatus,
    pub execution_date: DateTime<Utc>,
    pub datetime_started: Option<DateTime<Utc>>,
    pub datetime_finished: Option<DateTime<Utc>>,
    /// Named report folders produced as side artifacts (plots, summaries).
    pub reports: HashMap<String, String>,
}

impl TaskRun {
    pub fn new(class_name: &str, saved_query_id: Option<i64>) -> Self {
        Self {
            id: Uuid::new_v4(),
            class_name: class_name.to_string(),
            saved_query_id,
            upstream_task_run_id: None,
            args: Map::new(),
            status: TaskStatus::Started,
            execution_date: Utc::now(),
            datetime_started: None,
            datetime_finished: None,
            reports: HashMap::new(),
        }
    }

    pub fn with_upstream(mut self, upstream_task_run_id: Uuid) -> Self {
        self.upstream_task_run_id = Some(upstream_task_run_id);
        self
    }

    /// Cache key for the working dataset blob.
    pub fn task_data_cache_key(&self) -> String {
        Self::data_cache_key_for(self.id)
    }

    /// Cache key for the declared output blob.
    pub fn task_output_cache_key(&self) -> String {
        Self::output_cache_key_for(self.id)
    }

    pub fn data_cache_key_for(id: Uuid) -> String {
        format!("TaskData::{}", id)
    }

    pub fn output_cache_key_for(id: Uuid) -> String {
        format!("TaskOutput::{}", id)
    }
}

/// The in-flight payload a task operates on.
///
/// Invariant: at every persisted checkpoint the intensity matrix shape equals
/// (sample_metadata rows, feature_metadata rows). `validate_shape` enforces
/// it; tasks must resolve violations before saving.
#[derive(Debug, Clone, Default)]
pub struct WorkingDataset {
    pub sample_metadata: DataTable,
    pub feature_metadata: DataTable,
    pub intensity_matrix: IntensityMatrix,
    /// Pre-transform sample metadata, kept so downstream tasks can restore
    /// columns an upstream task dropped.
    pub untransformed_sample_metadata: Option<DataTable>,
    /// Extra named blobs carried through the cache (e.g. corrected outputs
    /// adopted from an upstream run).
    pub extra: Map<String, Value>,
}

impl WorkingDataset {
    /// Enforce the samples x features shape invariant. An empty matrix is
    /// allowed (metadata-only tasks and upstream adoptions of non-tabular
    /// output).
    pub fn validate_shape(&self) -> Result<(), TaskError> {
        if self.intensity_matrix.is_empty() {
            return Ok(());
        }
        let (rows, cols) = self.intensity_matrix.shape();
        if rows != self.sample_metadata.n_rows() || cols != self.feature_metadata.n_rows() {
            return Err(TaskError::Shape(format!(
                "intensity matrix is {}x{} but sample metadata has {} rows and \
                 feature metadata has {} rows",
                rows,
                cols,
                self.sample_metadata.n_rows(),
                self.feature_metadata.n_rows()
            )));
        }
        Ok(())
    }

    /// Serialize to the JSON-safe cache representation.
    pub fn to_cache_value(&self) -> Result<Value, TaskError> {
        let mut map = Map::new();
        map.insert(
            "sample_metadata".to_string(),
            serde_json::to_value(&self.sample_metadata)?,
        );
        map.insert(
            "feature_metadata".to_string(),
            serde_json::to_value(&self.feature_metadata)?,
        );
        map.insert(
            "intensity_data".to_string(),
            self.intensity_matrix.to_json_value(),
        );
        if let Some(untransformed) = &self.untransformed_sample_metadata {
            map.insert(
                "untransformed_sample_metadata".to_string(),
                serde_json::to_value(untransformed)?,
            );
        }
        for (key, value) in &self.extra {
            map.insert(key.clone(), value.clone());
        }
        Ok(Value::Object(map))
    }

    /// Rebuild from a cache blob. Missing parts come back empty; unknown
    /// keys are retained in `extra` so adopted upstream output is not lost.
    pub fn from_cache_value(value: &Value) -> Result<Self, TaskError> {
        let map = match value {
            Value::Object(map) => map,
            Value::Null => return Ok(Self::default()),
            other => {
                return Err(TaskError::Shape(format!(
                    "expected object for cached dataset, got {}",
                    other
                )))
            }
        };
        let mut dataset = WorkingDataset::default();
        for (key, entry) in map {
            match key.as_str() {
                "sample_metadata" => {
                    dataset.sample_metadata = serde_json::from_value(entry.clone())?
                }
                "feature_metadata" => {
                    dataset.feature_metadata = serde_json::from_value(entry.clone())?
                }
                "intensity_data" => {
                    dataset.intensity_matrix = IntensityMatrix::from_json_value(entry)?
                }
                "untransformed_sample_metadata" => {
                    dataset.untransformed_sample_metadata =
                        Some(serde_json::from_value(entry.clone())?)
                }
                _ => {
                    dataset.extra.insert(key.clone(), entry.clone());
                }
            }
        }
        Ok(dataset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn two_by_two() -> WorkingDataset {
        let mut sample_metadata = DataTable::new(vec!["Sample ID".to_string()]);
        sample_metadata.push_row(vec![json!("S1")]).unwrap();
        sample_metadata.push_row(vec![json!("S2")]).unwrap();
        let mut feature_metadata = DataTable::new(vec!["feature_id".to_string()]);
        feature_metadata.push_row(vec![json!(10)]).unwrap();
        feature_metadata.push_row(vec![json!(11)]).unwrap();
        WorkingDataset {
            sample_metadata,
            feature_metadata,
            intensity_matrix: IntensityMatrix::new(vec![vec![1.0, 2.0], vec![3.0, 4.0]]).unwrap(),
            untransformed_sample_metadata: None,
            extra: Map::new(),
        }
    }

    #[test]
    fn test_cache_keys_are_deterministic() {
        let run = TaskRun::new("RunBatchCorrection", Some(4));
        assert_eq!(run.task_data_cache_key(), format!("TaskData::{}", run.id));
        assert_eq!(
            run.task_output_cache_key(),
            format!("TaskOutput::{}", run.id)
        );
    }

    #[test]
    fn test_config_validation_rejects_contradiction() {
        let config = AnalysisConfig {
            columns_to_include: vec!["Age".to_string()],
            columns_to_exclude: vec!["Age".to_string()],
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(TaskError::Configuration(_))
        ));
    }

    #[test]
    fn test_config_args_echo() {
        let config = AnalysisConfig {
            correction_type: Some(CorrectionType::LoessSr),
            harmonise_annotations: true,
            ..Default::default()
        };
        let args = config.to_args();
        assert_eq!(args.get("correction_type"), Some(&json!("LOESS_SR")));
        assert_eq!(args.get("harmonise_annotations"), Some(&json!(true)));
        assert!(!args.contains_key("scaling"));
        assert!(!args.contains_key("columns_to_include"));
    }

    #[test]
    fn test_shape_invariant() {
        let dataset = two_by_two();
        assert!(dataset.validate_shape().is_ok());

        let mut bad = two_by_two();
        bad.intensity_matrix = IntensityMatrix::new(vec![vec![1.0, 2.0]]).unwrap();
        assert!(bad.validate_shape().is_err());
    }

    #[test]
    fn test_dataset_cache_round_trip() {
        let mut dataset = two_by_two();
        dataset
            .extra
            .insert("feature_dataset_id".to_string(), json!(7));
        let value = dataset.to_cache_value().unwrap();
        let restored = WorkingDataset::from_cache_value(&value).unwrap();
        assert_eq!(restored.sample_metadata, dataset.sample_metadata);
        assert_eq!(restored.feature_metadata, dataset.feature_metadata);
        assert_eq!(restored.intensity_matrix, dataset.intensity_matrix);
        assert_eq!(restored.extra.get("feature_dataset_id"), Some(&json!(7)));
    }
}
