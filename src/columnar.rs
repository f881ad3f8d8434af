//! Parquet helpers for staged source files.
//!
//! [`normalize_column_to_float`] is the destructive half of drift recovery: it
//! rewrites a staged file so that one column carries `Float64` values, keeping
//! every other column, the schema metadata and snappy compression. The new
//! file is written next to the original and renamed over it, so a failed
//! rewrite never leaves a truncated file at the staged path.

use std::{
    fs::File,
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use arrow::{
    array::ArrayRef,
    compute::cast,
    datatypes::{DataType, Schema},
    error::ArrowError,
    record_batch::RecordBatch,
};
use log::{debug, info};
use parquet::{
    arrow::{ArrowWriter, arrow_reader::ParquetRecordBatchReaderBuilder},
    basic::Compression,
    errors::ParquetError,
    file::{
        properties::WriterProperties,
        reader::{FileReader, SerializedFileReader},
    },
};
use tempfile::NamedTempFile;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RewriteError {
    #[error("accessing {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("parquet error in {path:?}: {source}")]
    Parquet {
        path: PathBuf,
        #[source]
        source: ParquetError,
    },
    #[error("reading record batches from {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: ArrowError,
    },
    #[error("casting column '{column}' in {path:?} to Float64: {source}")]
    Cast {
        path: PathBuf,
        column: String,
        #[source]
        source: ArrowError,
    },
}

/// Casts `column` to `Float64` and rewrites the file at the same path.
///
/// Returns `false` without touching the file when the column is absent.
pub fn normalize_column_to_float(path: &Path, column: &str) -> Result<bool, RewriteError> {
    let source = File::open(path).map_err(|source| io_error(path, source))?;
    let builder =
        ParquetRecordBatchReaderBuilder::try_new(source).map_err(|err| parquet_error(path, err))?;
    let schema = builder.schema().clone();
    let Some((index, _)) = schema.column_with_name(column) else {
        debug!("Column '{column}' not present in {path:?}; nothing to normalize");
        return Ok(false);
    };
    let target_schema = Arc::new(widened_schema(&schema, index));
    let reader = builder.build().map_err(|err| parquet_error(path, err))?;

    let directory = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mut staged = NamedTempFile::new_in(directory).map_err(|source| io_error(path, source))?;
    let properties = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();
    let mut writer = ArrowWriter::try_new(
        staged.as_file_mut(),
        Arc::clone(&target_schema),
        Some(properties),
    )
    .map_err(|err| parquet_error(path, err))?;

    let mut rows = 0usize;
    for batch in reader {
        let batch = batch.map_err(|source| RewriteError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let columns = batch
            .columns()
            .iter()
            .enumerate()
            .map(|(idx, array)| {
                if idx == index {
                    cast(array, &DataType::Float64)
                } else {
                    Ok(Arc::clone(array))
                }
            })
            .collect::<Result<Vec<ArrayRef>, ArrowError>>()
            .map_err(|source| cast_error(path, column, source))?;
        let widened = RecordBatch::try_new(Arc::clone(&target_schema), columns)
            .map_err(|source| cast_error(path, column, source))?;
        rows += widened.num_rows();
        writer
            .write(&widened)
            .map_err(|err| parquet_error(path, err))?;
    }
    writer.close().map_err(|err| parquet_error(path, err))?;

    staged
        .persist(path)
        .map_err(|err| io_error(path, err.error))?;
    info!(
        "Normalized parquet column to FLOAT64: {}.{column} ({rows} row(s))",
        display_name(path)
    );
    Ok(true)
}

/// Row count recorded in the parquet footer.
pub fn row_count(path: &Path) -> Result<u64, RewriteError> {
    let file = File::open(path).map_err(|source| io_error(path, source))?;
    let reader = SerializedFileReader::new(file).map_err(|err| parquet_error(path, err))?;
    let rows = reader.metadata().file_metadata().num_rows();
    Ok(u64::try_from(rows).unwrap_or(0))
}

fn widened_schema(schema: &Schema, index: usize) -> Schema {
    let fields = schema
        .fields()
        .iter()
        .enumerate()
        .map(|(idx, field)| {
            if idx == index {
                Arc::new(field.as_ref().clone().with_data_type(DataType::Float64))
            } else {
                Arc::clone(field)
            }
        })
        .collect::<Vec<_>>();
    Schema::new_with_metadata(fields, schema.metadata().clone())
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn io_error(path: &Path, source: io::Error) -> RewriteError {
    RewriteError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn parquet_error(path: &Path, source: ParquetError) -> RewriteError {
    RewriteError::Parquet {
        path: path.to_path_buf(),
        source,
    }
}

fn cast_error(path: &Path, column: &str, source: ArrowError) -> RewriteError {
    RewriteError::Cast {
        path: path.to_path_buf(),
        column: column.to_string(),
        source,
    }
}
