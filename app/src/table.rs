// ==============================================================================
// table.rs - Tabular Data Model and JSON-Safe Conversion
// ==============================================================================
// Description: Ordered named-column tables and intensity matrices with
//              lossless cache round-tripping (NaN/Infinity sentinels)
// Created: 2026-02-10
// Modified: 2026-08-30
// Version: 1.0.0
// ==============================================================================

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use tracing::debug;

use crate::errors::TaskError;

/// Values treated as "missing" when tables are normalized for the cache.
const MISSING_SENTINELS: &[&str] = &["", "NA", "NaN", "nan", "None", "NULL", "null"];

/// Datetime formats accepted during normalization. Everything is rewritten to
/// CACHE_DATETIME_FORMAT before JSON-safing so round-trips are stable.
const DATETIME_INPUT_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.fZ",
];

pub const CACHE_DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Convert a float to a JSON-safe value.
///
/// NaN becomes null; positive and negative infinity become the string
/// sentinels "Infinity" / "-Infinity" so serialization never fails on
/// non-finite numbers.
pub fn json_safe_f64(value: f64) -> Value {
    if value.is_nan() {
        Value::Null
    } else if value == f64::INFINITY {
        Value::String("Infinity".to_string())
    } else if value == f64::NEG_INFINITY {
        Value::String("-Infinity".to_string())
    } else {
        serde_json::Number::from_f64(value)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

/// Inverse of [`json_safe_f64`]: null reads back as NaN, the infinity
/// sentinels read back as +/- infinity.
pub fn f64_from_json(value: &Value) -> f64 {
    match value {
        Value::Null => f64::NAN,
        Value::Number(n) => n.as_f64().unwrap_or(f64::NAN),
        Value::String(s) if s == "Infinity" => f64::INFINITY,
        Value::String(s) if s == "-Infinity" => f64::NEG_INFINITY,
        Value::String(s) => s.parse::<f64>().unwrap_or(f64::NAN),
        _ => f64::NAN,
    }
}

/// An ordered table of named columns over rows of JSON values.
///
/// Row order is significant (sample metadata is kept in acquisition order)
/// and column order is preserved through cache round-trips.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataTable {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

impl DataTable {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn n_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn n_cols(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Append a row. The row length must match the column count.
    pub fn push_row(&mut self, row: Vec<Value>) -> Result<(), TaskError> {
        if row.len() != self.columns.len() {
            return Err(TaskError::Shape(format!(
                "row has {} values but table has {} columns",
                row.len(),
                self.columns.len()
            )));
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn get(&self, row: usize, column: &str) -> Option<&Value> {
        let col = self.column_index(column)?;
        self.rows.get(row).and_then(|r| r.get(col))
    }

    pub fn set(&mut self, row: usize, column: &str, value: Value) -> Result<(), TaskError> {
        let col = self
            .column_index(column)
            .ok_or_else(|| TaskError::MissingColumn(column.to_string()))?;
        let cells = self
            .rows
            .get_mut(row)
            .ok_or_else(|| TaskError::Shape(format!("row index {} out of bounds", row)))?;
        cells[col] = value;
        Ok(())
    }

    /// Add a new column with one value per existing row.
    pub fn add_column(&mut self, name: &str, values: Vec<Value>) -> Result<(), TaskError> {
        if values.len() != self.rows.len() {
            return Err(TaskError::Shape(format!(
                "column '{}' has {} values but table has {} rows",
                name,
                values.len(),
                self.rows.len()
            )));
        }
        if self.has_column(name) {
            return Err(TaskError::Shape(format!("column '{}' already exists", name)));
        }
        self.columns.push(name.to_string());
        for (row, value) in self.rows.iter_mut().zip(values) {
            row.push(value);
        }
        Ok(())
    }

    /// Add a new column filled with nulls.
    pub fn add_null_column(&mut self, name: &str) -> Result<(), TaskError> {
        let nulls = vec![Value::Null; self.rows.len()];
        self.add_column(name, nulls)
    }

    pub fn column_values(&self, name: &str) -> Option<Vec<Value>> {
        let col = self.column_index(name)?;
        Some(self.rows.iter().map(|r| r[col].clone()).collect())
    }

    /// Reorder the columns to the given order. Every current column must
    /// appear in `order`, and vice versa.
    pub fn reorder_columns(&mut self, order: &[String]) -> Result<(), TaskError> {
        if order.len() != self.columns.len() {
            return Err(TaskError::Shape(format!(
                "cannot reorder {} columns into {} positions",
                self.columns.len(),
                order.len()
            )));
        }
        let mut indices = Vec::with_capacity(order.len());
        for name in order {
            let idx = self
                .column_index(name)
                .ok_or_else(|| TaskError::MissingColumn(name.clone()))?;
            indices.push(idx);
        }
        for row in &mut self.rows {
            let reordered: Vec<Value> = indices.iter().map(|&i| row[i].clone()).collect();
            *row = reordered;
        }
        self.columns = order.to_vec();
        Ok(())
    }

    /// Find the first row where `column` equals `value`.
    pub fn find_row(&self, column: &str, value: &Value) -> Option<usize> {
        let col = self.column_index(column)?;
        self.rows.iter().position(|r| &r[col] == value)
    }

    /// Normalize the table in place so it round-trips through the cache:
    /// missing-value sentinels become explicit nulls and datetime strings
    /// are rewritten to the fixed cache format.
    pub fn normalize_for_cache(&mut self) {
        let mut normalized = 0usize;
        for row in &mut self.rows {
            for cell in row.iter_mut() {
                if let Value::String(s) = cell {
                    if MISSING_SENTINELS.contains(&s.as_str()) {
                        *cell = Value::Null;
                        normalized += 1;
                    } else if let Some(formatted) = normalize_datetime(s) {
                        if *s != formatted {
                            *cell = Value::String(formatted);
                            normalized += 1;
                        }
                    }
                }
            }
        }
        if normalized > 0 {
            debug!("Normalized {} cells for cache", normalized);
        }
    }

    /// Write the table as CSV with a header row.
    pub fn write_csv(&self, path: impl AsRef<Path>) -> Result<(), TaskError> {
        let mut writer = csv::Writer::from_path(path.as_ref())?;
        writer.write_record(&self.columns)?;
        for row in &self.rows {
            let record: Vec<String> = row.iter().map(csv_cell).collect();
            writer.write_record(&record)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Read a table from CSV. Numeric-looking cells are parsed as numbers,
    /// empty cells become nulls, everything else stays a string.
    pub fn read_csv(path: impl AsRef<Path>) -> Result<Self, TaskError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_path(path.as_ref())?;
        let columns: Vec<String> = reader
            .headers()?
            .iter()
            .map(|h| h.to_string())
            .collect();
        let mut table = DataTable::new(columns);
        for record in reader.records() {
            let record = record?;
            let row: Vec<Value> = record.iter().map(parse_csv_cell).collect();
            table.push_row(row)?;
        }
        Ok(table)
    }
}

fn csv_cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn parse_csv_cell(raw: &str) -> Value {
    if raw.is_empty() {
        return Value::Null;
    }
    if let Ok(i) = raw.parse::<i64>() {
        return Value::Number(i.into());
    }
    if let Ok(f) = raw.parse::<f64>() {
        if let Some(n) = serde_json::Number::from_f64(f) {
            return Value::Number(n);
        }
    }
    Value::String(raw.to_string())
}

/// Parse a datetime string in any accepted input format and reformat it to
/// the fixed cache format. Returns None for non-datetime strings.
fn normalize_datetime(raw: &str) -> Option<String> {
    for format in DATETIME_INPUT_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(dt.format(CACHE_DATETIME_FORMAT).to_string());
        }
    }
    None
}

/// A dense samples x features intensity matrix.
///
/// Rows align 1:1 with sample metadata rows and columns align 1:1 with
/// feature metadata rows at construction time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IntensityMatrix {
    data: Vec<Vec<f64>>,
}

impl IntensityMatrix {
    pub fn new(data: Vec<Vec<f64>>) -> Result<Self, TaskError> {
        if let Some(first) = data.first() {
            let width = first.len();
            if data.iter().any(|row| row.len() != width) {
                return Err(TaskError::Shape(
                    "intensity matrix rows have unequal lengths".to_string(),
                ));
            }
        }
        Ok(Self { data })
    }

    pub fn empty() -> Self {
        Self { data: Vec::new() }
    }

    pub fn shape(&self) -> (usize, usize) {
        let rows = self.data.len();
        let cols = self.data.first().map(|r| r.len()).unwrap_or(0);
        (rows, cols)
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn get(&self, row: usize, col: usize) -> Option<f64> {
        self.data.get(row).and_then(|r| r.get(col)).copied()
    }

    pub fn rows(&self) -> &[Vec<f64>] {
        &self.data
    }

    /// Serialize with the NaN/Infinity sentinel mapping applied per cell.
    pub fn to_json_value(&self) -> Value {
        Value::Array(
            self.data
                .iter()
                .map(|row| Value::Array(row.iter().map(|v| json_safe_f64(*v)).collect()))
                .collect(),
        )
    }

    /// Deserialize from the JSON-safe representation. Nulls read back as NaN.
    pub fn from_json_value(value: &Value) -> Result<Self, TaskError> {
        let rows = match value {
            Value::Array(rows) => rows,
            Value::Null => return Ok(Self::empty()),
            other => {
                return Err(TaskError::Shape(format!(
                    "expected array for intensity matrix, got {}",
                    other
                )))
            }
        };
        let mut data = Vec::with_capacity(rows.len());
        for row in rows {
            let cells = match row {
                Value::Array(cells) => cells,
                other => {
                    return Err(TaskError::Shape(format!(
                        "expected array for intensity row, got {}",
                        other
                    )))
                }
            };
            data.push(cells.iter().map(f64_from_json).collect());
        }
        Self::new(data)
    }

    /// Write the matrix as headerless CSV for the external engine.
    pub fn write_csv(&self, path: impl AsRef<Path>) -> Result<(), TaskError> {
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_path(path.as_ref())?;
        for row in &self.data {
            let record: Vec<String> = row.iter().map(|v| v.to_string()).collect();
            writer.write_record(&record)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Read a headerless CSV matrix. Unparseable cells become NaN.
    pub fn read_csv(path: impl AsRef<Path>) -> Result<Self, TaskError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .from_path(path.as_ref())?;
        let mut data = Vec::new();
        for record in reader.records() {
            let record = record?;
            let row: Vec<f64> = record
                .iter()
                .map(|cell| cell.parse::<f64>().unwrap_or(f64::NAN))
                .collect();
            data.push(row);
        }
        Self::new(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn sample_table() -> DataTable {
        let mut table = DataTable::new(vec![
            "Sample ID".to_string(),
            "Project".to_string(),
            "Batch".to_string(),
        ]);
        table
            .push_row(vec![json!("S1"), json!("X"), json!(1)])
            .unwrap();
        table
            .push_row(vec![json!("S2"), json!("X"), json!(2)])
            .unwrap();
        table
    }

    #[test]
    fn test_json_safe_f64_sentinels() {
        assert_eq!(json_safe_f64(f64::NAN), Value::Null);
        assert_eq!(json_safe_f64(f64::INFINITY), json!("Infinity"));
        assert_eq!(json_safe_f64(f64::NEG_INFINITY), json!("-Infinity"));
        assert_eq!(json_safe_f64(1.5), json!(1.5));
    }

    #[test]
    fn test_f64_round_trip() {
        for v in [0.0, -2.25, f64::INFINITY, f64::NEG_INFINITY] {
            assert_eq!(f64_from_json(&json_safe_f64(v)), v);
        }
        assert!(f64_from_json(&json_safe_f64(f64::NAN)).is_nan());
    }

    #[test]
    fn test_push_row_shape_check() {
        let mut table = sample_table();
        assert!(table.push_row(vec![json!("S3")]).is_err());
    }

    #[test]
    fn test_add_column_and_lookup() {
        let mut table = sample_table();
        table
            .add_column("Run Order", vec![json!(1), json!(2)])
            .unwrap();
        assert_eq!(table.get(1, "Run Order"), Some(&json!(2)));
        assert_eq!(table.find_row("Sample ID", &json!("S2")), Some(1));
        assert_eq!(table.find_row("Sample ID", &json!("S9")), None);
    }

    #[test]
    fn test_normalize_for_cache() {
        let mut table = DataTable::new(vec![
            "Acquired Time".to_string(),
            "Comment".to_string(),
        ]);
        table
            .push_row(vec![json!("2021-03-01T10:15:30.500"), json!("NA")])
            .unwrap();
        table.normalize_for_cache();
        assert_eq!(table.get(0, "Acquired Time"), Some(&json!("2021-03-01 10:15:30")));
        assert_eq!(table.get(0, "Comment"), Some(&Value::Null));
    }

    #[test]
    fn test_reorder_columns() {
        let mut table = sample_table();
        table
            .reorder_columns(&[
                "Batch".to_string(),
                "Sample ID".to_string(),
                "Project".to_string(),
            ])
            .unwrap();
        assert_eq!(table.columns()[0], "Batch");
        assert_eq!(table.get(0, "Sample ID"), Some(&json!("S1")));
    }

    #[test]
    fn test_table_csv_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("table.csv");
        let mut table = sample_table();
        table.set(1, "Batch", Value::Null).unwrap();
        table.write_csv(&path).unwrap();
        let read = DataTable::read_csv(&path).unwrap();
        assert_eq!(read, table);
    }

    #[test]
    fn test_matrix_shape_and_round_trip() {
        let matrix =
            IntensityMatrix::new(vec![vec![1.0, 2.0, f64::NAN], vec![4.0, f64::INFINITY, 6.0]])
                .unwrap();
        assert_eq!(matrix.shape(), (2, 3));

        let value = matrix.to_json_value();
        let restored = IntensityMatrix::from_json_value(&value).unwrap();
        assert_eq!(restored.shape(), (2, 3));
        assert!(restored.get(0, 2).unwrap().is_nan());
        assert_eq!(restored.get(1, 1), Some(f64::INFINITY));
        assert_eq!(restored.get(1, 2), Some(6.0));
    }

    #[test]
    fn test_matrix_rejects_ragged_rows() {
        assert!(IntensityMatrix::new(vec![vec![1.0], vec![1.0, 2.0]]).is_err());
    }

    #[test]
    fn test_matrix_csv_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("intensity.csv");
        let matrix = IntensityMatrix::new(vec![vec![1.5, 2.5], vec![3.5, 4.5]]).unwrap();
        matrix.write_csv(&path).unwrap();
        let read = IntensityMatrix::read_csv(&path).unwrap();
        assert_eq!(read, matrix);
    }
}
