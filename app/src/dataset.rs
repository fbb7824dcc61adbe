// ==============================================================================
// dataset.rs - Dataset Source Contract and Implementations
// ==============================================================================
// Description: Loads sample/feature metadata tables and intensity matrices
//              for a saved query, with column include/exclude filtering
// Created: 2026-02-10
// Modified: 2026-08-30
// Version: 1.0.0
// ==============================================================================

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{debug, info};

use crate::errors::TaskError;
use crate::models::{
    AnalysisConfig, COL_ACQUIRED_TIME, COL_ASSAY_ROLE, COL_BATCH, COL_CORRECTION_BATCH,
    COL_PROJECT, COL_RUN_ORDER, COL_SAMPLE_FILE_NAME, COL_SAMPLE_ID, COL_SAMPLE_TYPE,
    HARMONISED_METADATA_PREFIX, METADATA_PREFIX,
};
use crate::reconcile::FeatureIdentityMatrix;
use crate::table::{DataTable, IntensityMatrix};

/// The three dataset tables a saved query materializes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetKind {
    SampleMetadata,
    FeatureMetadata,
    IntensityData,
}

impl DatasetKind {
    pub fn file_name(&self) -> &'static str {
        match self {
            DatasetKind::SampleMetadata => "sample_metadata.csv",
            DatasetKind::FeatureMetadata => "feature_metadata.csv",
            DatasetKind::IntensityData => "intensity_data.csv",
        }
    }
}

/// Core sample metadata columns that survive include-filtering regardless of
/// the configured column list. Downstream tasks depend on these.
const CORE_SAMPLE_COLUMNS: &[&str] = &[
    COL_SAMPLE_ID,
    COL_SAMPLE_FILE_NAME,
    COL_PROJECT,
    COL_BATCH,
    COL_CORRECTION_BATCH,
    COL_RUN_ORDER,
    COL_ACQUIRED_TIME,
    COL_SAMPLE_TYPE,
    COL_ASSAY_ROLE,
];

/// Provider of query-materialized dataset tables.
///
/// The source owns scaling/transform/filter semantics; the pipeline passes
/// the configured option set through and consumes whatever comes back.
#[async_trait]
pub trait DatasetSource: Send + Sync {
    async fn load_table(
        &self,
        kind: DatasetKind,
        query_id: i64,
        options: &AnalysisConfig,
    ) -> Result<DataTable, TaskError>;

    async fn load_intensity(
        &self,
        query_id: i64,
        options: &AnalysisConfig,
    ) -> Result<IntensityMatrix, TaskError>;

    /// The entity-id matrix aligned with the intensity matrix, when the
    /// source materializes one.
    async fn load_feature_id_matrix(
        &self,
        query_id: i64,
    ) -> Result<Option<FeatureIdentityMatrix>, TaskError>;

    /// Write a (possibly modified) table back to the source.
    async fn persist_table(
        &self,
        kind: DatasetKind,
        query_id: i64,
        table: &DataTable,
    ) -> Result<(), TaskError>;
}

/// Apply the configured column filter to a sample metadata table.
///
/// Core columns always survive. With an include list, only core columns and
/// listed columns are kept; otherwise all columns minus the exclude list.
/// Namespaced metadata columns match with or without their prefix.
fn filter_sample_columns(table: &DataTable, options: &AnalysisConfig) -> DataTable {
    let keep: Vec<String> = table
        .columns()
        .iter()
        .filter(|name| {
            let bare = name
                .strip_prefix(METADATA_PREFIX)
                .or_else(|| name.strip_prefix(HARMONISED_METADATA_PREFIX))
                .unwrap_or(name);
            if CORE_SAMPLE_COLUMNS.contains(&name.as_str()) {
                return true;
            }
            let excluded = options
                .columns_to_exclude
                .iter()
                .any(|c| c == *name || c == bare);
            if excluded {
                return false;
            }
            if options.columns_to_include.is_empty() {
                return true;
            }
            options
                .columns_to_include
                .iter()
                .any(|c| c == *name || c == bare)
        })
        .cloned()
        .collect();

    if keep.len() == table.n_cols() {
        return table.clone();
    }
    debug!(
        "Column filter kept {} of {} sample metadata columns",
        keep.len(),
        table.n_cols()
    );
    let mut filtered = DataTable::new(keep.clone());
    for row in 0..table.n_rows() {
        let values: Vec<serde_json::Value> = keep
            .iter()
            .map(|name| table.get(row, name).cloned().unwrap_or_default())
            .collect();
        // keep was derived from this table, so the shape always matches
        let _ = filtered.push_row(values);
    }
    filtered
}

/// Dataset source backed by a directory of query exports.
///
/// Expects `<root>/query_<id>/` to hold the three CSV tables, plus an
/// optional `feature_id_matrix.csv` for correction write-back.
pub struct CsvDatasetSource {
    root: PathBuf,
}

impl CsvDatasetSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn query_dir(&self, query_id: i64) -> PathBuf {
        self.root.join(format!("query_{}", query_id))
    }

    fn table_path(&self, kind: DatasetKind, query_id: i64) -> Result<PathBuf, TaskError> {
        let path = self.query_dir(query_id).join(kind.file_name());
        if !path.is_file() {
            return Err(TaskError::Dataset(format!(
                "no {} for saved query {} (looked in {})",
                kind.file_name(),
                query_id,
                self.query_dir(query_id).display()
            )));
        }
        Ok(path)
    }
}

#[async_trait]
impl DatasetSource for CsvDatasetSource {
    async fn load_table(
        &self,
        kind: DatasetKind,
        query_id: i64,
        options: &AnalysisConfig,
    ) -> Result<DataTable, TaskError> {
        let path = self.table_path(kind, query_id)?;
        let table = DataTable::read_csv(&path)?;
        info!(
            "Loaded {} ({} rows) for saved query {}",
            kind.file_name(),
            table.n_rows(),
            query_id
        );
        if kind == DatasetKind::SampleMetadata {
            return Ok(filter_sample_columns(&table, options));
        }
        Ok(table)
    }

    async fn load_intensity(
        &self,
        query_id: i64,
        _options: &AnalysisConfig,
    ) -> Result<IntensityMatrix, TaskError> {
        let path = self.table_path(DatasetKind::IntensityData, query_id)?;
        IntensityMatrix::read_csv(&path)
    }

    async fn load_feature_id_matrix(
        &self,
        query_id: i64,
    ) -> Result<Option<FeatureIdentityMatrix>, TaskError> {
        let path = self.query_dir(query_id).join("feature_id_matrix.csv");
        if !path.is_file() {
            return Ok(None);
        }
        Ok(Some(FeatureIdentityMatrix::read_csv(&path)?))
    }

    async fn persist_table(
        &self,
        kind: DatasetKind,
        query_id: i64,
        table: &DataTable,
    ) -> Result<(), TaskError> {
        let dir = self.query_dir(query_id);
        std::fs::create_dir_all(&dir)?;
        table.write_csv(dir.join(kind.file_name()))?;
        info!(
            "Persisted {} ({} rows) for saved query {}",
            kind.file_name(),
            table.n_rows(),
            query_id
        );
        Ok(())
    }
}

/// Seeded in-process source for tests and dry runs.
#[derive(Default)]
pub struct InMemoryDatasetSource {
    queries: Mutex<HashMap<i64, QueryData>>,
}

/// The materialized tables for one saved query.
#[derive(Debug, Clone, Default)]
pub struct QueryData {
    pub sample_metadata: DataTable,
    pub feature_metadata: DataTable,
    pub intensity: IntensityMatrix,
    pub feature_id_matrix: Option<FeatureIdentityMatrix>,
}

impl InMemoryDatasetSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, query_id: i64, data: QueryData) {
        if let Ok(mut queries) = self.queries.lock() {
            queries.insert(query_id, data);
        }
    }

    fn fetch(&self, query_id: i64) -> Result<QueryData, TaskError> {
        let queries = self
            .queries
            .lock()
            .map_err(|e| TaskError::Dataset(format!("dataset lock poisoned: {}", e)))?;
        queries
            .get(&query_id)
            .cloned()
            .ok_or_else(|| TaskError::Dataset(format!("no data for saved query {}", query_id)))
    }
}

#[async_trait]
impl DatasetSource for InMemoryDatasetSource {
    async fn load_table(
        &self,
        kind: DatasetKind,
        query_id: i64,
        options: &AnalysisConfig,
    ) -> Result<DataTable, TaskError> {
        let data = self.fetch(query_id)?;
        match kind {
            DatasetKind::SampleMetadata => {
                Ok(filter_sample_columns(&data.sample_metadata, options))
            }
            DatasetKind::FeatureMetadata => Ok(data.feature_metadata),
            DatasetKind::IntensityData => Err(TaskError::Dataset(
                "intensity data is a matrix, use load_intensity".to_string(),
            )),
        }
    }

    async fn load_intensity(
        &self,
        query_id: i64,
        _options: &AnalysisConfig,
    ) -> Result<IntensityMatrix, TaskError> {
        Ok(self.fetch(query_id)?.intensity)
    }

    async fn load_feature_id_matrix(
        &self,
        query_id: i64,
    ) -> Result<Option<FeatureIdentityMatrix>, TaskError> {
        Ok(self.fetch(query_id)?.feature_id_matrix)
    }

    async fn persist_table(
        &self,
        kind: DatasetKind,
        query_id: i64,
        table: &DataTable,
    ) -> Result<(), TaskError> {
        let mut queries = self
            .queries
            .lock()
            .map_err(|e| TaskError::Dataset(format!("dataset lock poisoned: {}", e)))?;
        let data = queries.entry(query_id).or_default();
        match kind {
            DatasetKind::SampleMetadata => data.sample_metadata = table.clone(),
            DatasetKind::FeatureMetadata => data.feature_metadata = table.clone(),
            DatasetKind::IntensityData => {
                return Err(TaskError::Dataset(
                    "intensity data is a matrix, not a table".to_string(),
                ))
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn sample_metadata() -> DataTable {
        let mut table = DataTable::new(vec![
            COL_SAMPLE_ID.to_string(),
            COL_PROJECT.to_string(),
            COL_BATCH.to_string(),
            format!("{}Age", METADATA_PREFIX),
            format!("{}BMI", METADATA_PREFIX),
        ]);
        table
            .push_row(vec![json!("S1"), json!("X"), json!(1), json!(34), json!(22.5)])
            .unwrap();
        table
    }

    #[test]
    fn test_include_filter_keeps_core_columns() {
        let options = AnalysisConfig {
            columns_to_include: vec!["Age".to_string()],
            ..Default::default()
        };
        let filtered = filter_sample_columns(&sample_metadata(), &options);
        assert!(filtered.has_column(COL_SAMPLE_ID));
        assert!(filtered.has_column(COL_PROJECT));
        assert!(filtered.has_column("metadata::Age"));
        assert!(!filtered.has_column("metadata::BMI"));
    }

    #[test]
    fn test_exclude_filter_matches_bare_names() {
        let options = AnalysisConfig {
            columns_to_exclude: vec!["BMI".to_string()],
            ..Default::default()
        };
        let filtered = filter_sample_columns(&sample_metadata(), &options);
        assert!(filtered.has_column("metadata::Age"));
        assert!(!filtered.has_column("metadata::BMI"));
    }

    #[tokio::test]
    async fn test_csv_source_round_trip() {
        let dir = tempdir().unwrap();
        let source = CsvDatasetSource::new(dir.path());
        let options = AnalysisConfig::default();

        source
            .persist_table(DatasetKind::SampleMetadata, 7, &sample_metadata())
            .await
            .unwrap();
        let loaded = source
            .load_table(DatasetKind::SampleMetadata, 7, &options)
            .await
            .unwrap();
        assert_eq!(loaded.n_rows(), 1);
        assert_eq!(loaded.get(0, COL_SAMPLE_ID), Some(&json!("S1")));
    }

    #[tokio::test]
    async fn test_csv_source_missing_query_errors() {
        let dir = tempdir().unwrap();
        let source = CsvDatasetSource::new(dir.path());
        let err = source
            .load_table(DatasetKind::SampleMetadata, 99, &AnalysisConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::Dataset(_)));
    }

    #[tokio::test]
    async fn test_in_memory_source_feature_id_matrix() {
        let source = InMemoryDatasetSource::new();
        source.insert(
            3,
            QueryData {
                feature_id_matrix: Some(
                    FeatureIdentityMatrix::new(vec![vec![1, 2]]).unwrap(),
                ),
                ..Default::default()
            },
        );
        let matrix = source.load_feature_id_matrix(3).await.unwrap();
        assert!(matrix.is_some());
        assert_eq!(source.load_feature_id_matrix(3).await.unwrap().unwrap().shape(), (1, 2));
    }
}
