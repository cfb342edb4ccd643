//! Parquet-backed event source.
//!
//! A sample is a directory:
//!
//! | Path                  | Content                                           |
//! |-----------------------|---------------------------------------------------|
//! | `<tree>.parquet`      | one flat table per tree, one numeric column per branch |
//! | `counters.json`       | optional `{"hCounter": 1234.5, ...}` scalar counters |
//!
//! Columns may be `Float64`, `Float32`, `Int32` or `Int64` (any numeric Arrow
//! type is accepted); values are cast to `f64` on read and nulls become NaN,
//! which the aggregator masks out.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, AsArray, Float64Array};
use arrow::datatypes::{DataType, Field, Float64Type, Schema};
use arrow::record_batch::RecordBatch;
use parquet::arrow::ProjectionMask;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use yf_core::{Error, EventSource, Result};

/// File holding the scalar counters of a sample directory.
pub const COUNTERS_FILE: &str = "counters.json";

/// Extension of per-tree table files.
pub const TREE_EXTENSION: &str = "parquet";

/// Event source reading `<dir>/<tree>.parquet` tables.
#[derive(Debug, Clone)]
pub struct ParquetEventSource {
    dir: PathBuf,
    counters: HashMap<String, f64>,
}

impl ParquetEventSource {
    /// Open a sample directory. Counters are loaded eagerly, tables lazily.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        if !dir.is_dir() {
            return Err(Error::DataSource(format!(
                "sample directory {} does not exist",
                dir.display()
            )));
        }
        let counters_path = dir.join(COUNTERS_FILE);
        let counters = if counters_path.is_file() {
            let text = std::fs::read_to_string(&counters_path)?;
            serde_json::from_str(&text).map_err(|e| {
                Error::DataSource(format!("invalid counters in {}: {e}", counters_path.display()))
            })?
        } else {
            HashMap::new()
        };
        Ok(Self { dir, counters })
    }

    /// Path of the table for `tree`.
    pub fn tree_path(&self, tree: &str) -> PathBuf {
        self.dir.join(format!("{tree}.{TREE_EXTENSION}"))
    }

    fn builder(&self, tree: &str) -> Result<ParquetRecordBatchReaderBuilder<File>> {
        let path = self.tree_path(tree);
        let file = File::open(&path).map_err(|e| {
            Error::DataSource(format!("tree '{tree}' not readable at {}: {e}", path.display()))
        })?;
        ParquetRecordBatchReaderBuilder::try_new(file)
            .map_err(|e| Error::DataSource(format!("failed to read Parquet {}: {e}", path.display())))
    }
}

impl EventSource for ParquetEventSource {
    fn n_entries(&self, tree: &str) -> Result<usize> {
        let rows = self.builder(tree)?.metadata().file_metadata().num_rows();
        usize::try_from(rows)
            .map_err(|_| Error::DataSource(format!("tree '{tree}' reports {rows} rows")))
    }

    fn branch_names(&self, tree: &str) -> Result<Vec<String>> {
        Ok(self.builder(tree)?.schema().fields().iter().map(|f| f.name().clone()).collect())
    }

    fn branch(&self, tree: &str, branch: &str, entry_stop: Option<usize>) -> Result<Vec<f64>> {
        let builder = self.builder(tree)?;
        let index = builder.schema().index_of(branch).map_err(|_| {
            Error::DataSource(format!("branch '{branch}' not found in tree '{tree}' of {}", self.describe()))
        })?;
        let data_type = builder.schema().field(index).data_type().clone();
        if !data_type.is_numeric() {
            return Err(Error::DataSource(format!(
                "branch '{branch}' has type {data_type:?}, expected a numeric column"
            )));
        }

        let mask = ProjectionMask::roots(builder.parquet_schema(), [index]);
        let mut builder = builder.with_projection(mask);
        if let Some(stop) = entry_stop {
            builder = builder.with_limit(stop);
        }
        let reader = builder
            .build()
            .map_err(|e| Error::DataSource(format!("failed to build Parquet reader: {e}")))?;

        let mut values = Vec::new();
        for batch in reader {
            let batch =
                batch.map_err(|e| Error::DataSource(format!("failed to read Parquet batch: {e}")))?;
            append_as_f64(batch.column(0), &mut values)?;
        }
        if let Some(stop) = entry_stop {
            values.truncate(stop);
        }
        Ok(values)
    }

    fn counter(&self, name: &str) -> Result<Option<f64>> {
        Ok(self.counters.get(name).copied())
    }

    fn describe(&self) -> String {
        self.dir.display().to_string()
    }
}

fn append_as_f64(column: &ArrayRef, out: &mut Vec<f64>) -> Result<()> {
    let cast = arrow::compute::cast(column, &DataType::Float64)
        .map_err(|e| Error::DataSource(format!("cannot cast {:?} to Float64: {e}", column.data_type())))?;
    let floats = cast.as_primitive::<Float64Type>();
    if floats.null_count() == 0 {
        out.extend_from_slice(floats.values());
    } else {
        out.extend(floats.iter().map(|v| v.unwrap_or(f64::NAN)));
    }
    Ok(())
}

/// Write `columns` as a `Float64` table to `path` (Snappy compressed).
pub fn write_tree(path: &Path, columns: &[(&str, &[f64])]) -> Result<()> {
    let fields: Vec<Field> =
        columns.iter().map(|(name, _)| Field::new(*name, DataType::Float64, false)).collect();
    let arrays: Vec<ArrayRef> = columns
        .iter()
        .map(|(_, values)| Arc::new(Float64Array::from(values.to_vec())) as ArrayRef)
        .collect();
    let batch = RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)
        .map_err(|e| Error::Validation(format!("failed to build RecordBatch: {e}")))?;
    write_batch(path, &batch)
}

/// Write an arbitrary Arrow batch to `path`.
pub fn write_batch(path: &Path, batch: &RecordBatch) -> Result<()> {
    let file = File::create(path)?;
    let props = parquet::file::properties::WriterProperties::builder()
        .set_compression(parquet::basic::Compression::SNAPPY)
        .build();
    let mut writer = parquet::arrow::ArrowWriter::try_new(file, batch.schema(), Some(props))
        .map_err(|e| Error::Validation(format!("failed to create Parquet writer: {e}")))?;
    writer.write(batch).map_err(|e| Error::Validation(format!("failed to write Parquet: {e}")))?;
    writer
        .close()
        .map_err(|e| Error::Validation(format!("failed to close Parquet writer: {e}")))?;
    Ok(())
}

/// Write the scalar counters of a sample directory.
pub fn write_counters(dir: &Path, counters: &HashMap<String, f64>) -> Result<()> {
    std::fs::write(dir.join(COUNTERS_FILE), serde_json::to_string_pretty(counters)?)?;
    Ok(())
}
