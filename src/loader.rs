//! Bounded, drift-tolerant load of a single staged file.
//!
//! A file starts in [`LoadState::Fresh`] (auto-detected schema). When the
//! warehouse rejects it with an integer/float drift that can be resolved, the
//! destination column is widened, the staged file is normalized when needed,
//! and the file is retried in [`LoadState::SchemaForced`] with the
//! destination's current schema. Once forced, a file never goes back to
//! auto-detection. At most [`MAX_LOAD_ATTEMPTS`] loads are issued per file;
//! any other failure ends in [`LoadState::Fatal`] with the original error.

use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use thiserror::Error;

use crate::{
    columnar::{self, RewriteError},
    drift::{self, DriftSignal},
    promote::promote_column_to_float,
    warehouse::{LoadConfig, SchemaMode, TableId, Warehouse, WarehouseError},
};

pub const MAX_LOAD_ATTEMPTS: usize = 3;

#[derive(Debug, Error)]
pub enum LoadError {
    /// The warehouse error that ended the load, untouched.
    #[error(transparent)]
    Warehouse(WarehouseError),
    #[error("promoting {table}.{column} to FLOAT64 failed: {source}")]
    Promotion {
        table: TableId,
        column: String,
        #[source]
        source: WarehouseError,
    },
    #[error("normalizing column '{column}' in {path:?} failed: {source}")]
    Normalize {
        path: PathBuf,
        column: String,
        #[source]
        source: RewriteError,
    },
    #[error("reading the current schema of {table} failed: {source}")]
    Schema {
        table: TableId,
        #[source]
        source: WarehouseError,
    },
    #[error("reading the row count of {table} failed: {source}")]
    RowCount {
        table: TableId,
        #[source]
        source: WarehouseError,
    },
}

#[derive(Debug)]
pub enum LoadState {
    Fresh,
    SchemaForced,
    Done { table_rows: u64 },
    Fatal(LoadError),
}

/// What to do about a classified drift before retrying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recovery {
    /// Widen the destination column; the file already carries floats.
    Promote { column: String },
    /// Widen the destination column and cast the file's column to float.
    /// With `require_rewrite` the retry only happens if the file had the column.
    PromoteAndNormalize { column: String, require_rewrite: bool },
}

/// Decides whether a drift signal is safe to resolve automatically.
pub fn plan_recovery(signal: &DriftSignal) -> Option<Recovery> {
    match signal {
        DriftSignal::TypeChanged(change) if change.is_int_float() => {
            if change.to.is_float() {
                Some(Recovery::Promote {
                    column: change.column.clone(),
                })
            } else {
                // Destination is already FLOAT and the file carries integers. The
                // promotion is a no-op but keeps the destination pinned to FLOAT64.
                Some(Recovery::PromoteAndNormalize {
                    column: change.column.clone(),
                    require_rewrite: false,
                })
            }
        }
        DriftSignal::ParquetTypeMismatch { column } => Some(Recovery::PromoteAndNormalize {
            column: column.clone(),
            require_rewrite: true,
        }),
        DriftSignal::TypeChanged(_) | DriftSignal::Unclassified => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadReport {
    /// Cumulative destination row count after the append; progress only.
    pub table_rows: u64,
    pub attempts: usize,
    pub recoveries: Vec<Recovery>,
}

pub struct LoadAttemptController<'a, W: ?Sized> {
    warehouse: &'a W,
    table: &'a TableId,
    partition_field: &'a str,
}

impl<'a, W> LoadAttemptController<'a, W>
where
    W: Warehouse + ?Sized,
{
    pub fn new(warehouse: &'a W, table: &'a TableId, partition_field: &'a str) -> Self {
        Self {
            warehouse,
            table,
            partition_field,
        }
    }

    pub fn load(&self, path: &Path) -> Result<LoadReport, LoadError> {
        let mut state = LoadState::Fresh;
        let mut attempts = 0usize;
        let mut recoveries = Vec::new();
        loop {
            state = match state {
                LoadState::Done { table_rows } => {
                    return Ok(LoadReport {
                        table_rows,
                        attempts,
                        recoveries,
                    });
                }
                LoadState::Fatal(err) => return Err(err),
                active => {
                    attempts += 1;
                    self.attempt(active, attempts, path, &mut recoveries)
                }
            };
        }
    }

    fn attempt(
        &self,
        state: LoadState,
        attempt: usize,
        path: &Path,
        recoveries: &mut Vec<Recovery>,
    ) -> LoadState {
        let schema = match state {
            LoadState::Fresh => SchemaMode::AutoDetect,
            LoadState::SchemaForced => match self.warehouse.table_schema(self.table) {
                Ok(schema) => {
                    debug!("Forcing destination schema {:?}", schema.column_types());
                    SchemaMode::Explicit(schema)
                }
                Err(source) => {
                    return LoadState::Fatal(LoadError::Schema {
                        table: self.table.clone(),
                        source,
                    });
                }
            },
            terminal => return terminal,
        };
        debug!(
            "Load attempt {attempt}/{MAX_LOAD_ATTEMPTS} for {path:?} into {} (autodetect={})",
            self.table,
            schema.is_auto_detect()
        );
        let config = LoadConfig::append(self.partition_field, schema);

        let error = match self.warehouse.load_file(path, self.table, &config) {
            Ok(output_rows) => {
                debug!("Load job wrote {output_rows} row(s) into {}", self.table);
                return match self.warehouse.table_row_count(self.table) {
                    Ok(table_rows) => LoadState::Done { table_rows },
                    Err(source) => LoadState::Fatal(LoadError::RowCount {
                        table: self.table.clone(),
                        source,
                    }),
                };
            }
            Err(error) => error,
        };

        if attempt >= MAX_LOAD_ATTEMPTS {
            warn!(
                "Giving up on {path:?} after {attempt} load attempt(s) into {}",
                self.table
            );
            return LoadState::Fatal(LoadError::Warehouse(error));
        }
        let Some(recovery) = error
            .rejection_message()
            .map(drift::classify)
            .as_ref()
            .and_then(plan_recovery)
        else {
            return LoadState::Fatal(LoadError::Warehouse(error));
        };

        match self.recover(&recovery, path) {
            Ok(true) => {
                info!(
                    "Retrying load after schema promotion: {} (attempt {} of {MAX_LOAD_ATTEMPTS})",
                    file_label(path),
                    attempt + 1
                );
                recoveries.push(recovery);
                LoadState::SchemaForced
            }
            Ok(false) => LoadState::Fatal(LoadError::Warehouse(error)),
            Err(err) => LoadState::Fatal(err),
        }
    }

    /// Applies a recovery. `Ok(false)` means the original error must be raised.
    fn recover(&self, recovery: &Recovery, path: &Path) -> Result<bool, LoadError> {
        match recovery {
            Recovery::Promote { column } => {
                self.promote(column)?;
                Ok(true)
            }
            Recovery::PromoteAndNormalize {
                column,
                require_rewrite,
            } => {
                self.promote(column)?;
                let rewritten = columnar::normalize_column_to_float(path, column).map_err(
                    |source| LoadError::Normalize {
                        path: path.to_path_buf(),
                        column: column.clone(),
                        source,
                    },
                )?;
                if !rewritten {
                    warn!(
                        "Column '{column}' not found in {}; file was not normalized",
                        file_label(path)
                    );
                }
                Ok(rewritten || !require_rewrite)
            }
        }
    }

    fn promote(&self, column: &str) -> Result<(), LoadError> {
        promote_column_to_float(self.warehouse, self.table, column).map_err(|source| {
            LoadError::Promotion {
                table: self.table.clone(),
                column: column.to_string(),
                source,
            }
        })
    }
}

fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
