//! Warehouse capability and the types shared across its implementations.
//!
//! The loader never talks to a concrete client directly. Everything it needs
//! from the destination (loading a staged file, reading the current schema,
//! widening a column, table bookkeeping) goes through the [`Warehouse`] trait,
//! which is handed down explicitly from the command layer.
//!
//! ## Responsibilities
//!
//! - Table and dataset identifiers with `project.dataset.table` parsing
//! - Canonical field type names and their integer/float families
//! - Schema snapshots as reported by the warehouse
//! - Load job configuration (append, partitioning, schema evolution options)
//! - The structured [`WarehouseError`] carrying the warehouse's own message

pub mod bigquery;

use std::{collections::BTreeMap, fmt, io, path::Path, path::PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DatasetId {
    pub project: String,
    pub dataset: String,
}

impl DatasetId {
    pub fn new(project: impl Into<String>, dataset: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            dataset: dataset.into(),
        }
    }

    pub fn table(&self, table: impl Into<String>) -> TableId {
        TableId {
            project: self.project.clone(),
            dataset: self.dataset.clone(),
            table: table.into(),
        }
    }
}

impl fmt::Display for DatasetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.project, self.dataset)
    }
}

/// Fully qualified destination table identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableId {
    pub project: String,
    pub dataset: String,
    pub table: String,
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.project, self.dataset, self.table)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeFamily {
    Integer,
    Float,
    Other,
}

/// Canonical (upper-case) warehouse type name such as `INTEGER` or `FLOAT64`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct FieldType(String);

impl FieldType {
    pub const FLOAT64: &'static str = "FLOAT64";

    pub fn new(name: &str) -> Self {
        FieldType(name.trim().to_ascii_uppercase())
    }

    /// The wide floating type every drifting numeric column is promoted to.
    pub fn float64() -> Self {
        FieldType(Self::FLOAT64.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn family(&self) -> TypeFamily {
        match self.0.as_str() {
            "INTEGER" | "INT64" => TypeFamily::Integer,
            "FLOAT" | "FLOAT64" => TypeFamily::Float,
            _ => TypeFamily::Other,
        }
    }

    pub fn is_integer(&self) -> bool {
        self.family() == TypeFamily::Integer
    }

    pub fn is_float(&self) -> bool {
        self.family() == TypeFamily::Float
    }
}

impl From<String> for FieldType {
    fn from(value: String) -> Self {
        FieldType::new(&value)
    }
}

impl From<FieldType> for String {
    fn from(value: FieldType) -> Self {
        value.0
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One column of a destination table, as the warehouse reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaField {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<SchemaField>,
}

impl SchemaField {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            mode: Some("NULLABLE".to_string()),
            fields: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    #[serde(default)]
    pub fields: Vec<SchemaField>,
}

impl TableSchema {
    pub fn field(&self, name: &str) -> Option<&SchemaField> {
        self.fields.iter().find(|field| field.name == name)
    }

    pub fn column_types(&self) -> BTreeMap<String, FieldType> {
        self.fields
            .iter()
            .map(|field| (field.name.clone(), field.field_type.clone()))
            .collect()
    }
}

/// Whether a load infers the file's schema or carries the destination's.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaMode {
    AutoDetect,
    Explicit(TableSchema),
}

impl SchemaMode {
    pub fn is_auto_detect(&self) -> bool {
        matches!(self, SchemaMode::AutoDetect)
    }

    pub fn explicit_schema(&self) -> Option<&TableSchema> {
        match self {
            SchemaMode::Explicit(schema) => Some(schema),
            SchemaMode::AutoDetect => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WriteDisposition {
    WriteAppend,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SchemaUpdateOption {
    AllowFieldAddition,
    AllowFieldRelaxation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadConfig {
    pub schema: SchemaMode,
    pub write_disposition: WriteDisposition,
    /// Column used for DAY time partitioning of the destination.
    pub partition_field: String,
    pub schema_update_options: Vec<SchemaUpdateOption>,
}

impl LoadConfig {
    /// Append load that allows additive schema evolution.
    pub fn append(partition_field: impl Into<String>, schema: SchemaMode) -> Self {
        Self {
            schema,
            write_disposition: WriteDisposition::WriteAppend,
            partition_field: partition_field.into(),
            schema_update_options: vec![
                SchemaUpdateOption::AllowFieldAddition,
                SchemaUpdateOption::AllowFieldRelaxation,
            ],
        }
    }
}

#[derive(Debug, Error)]
pub enum WarehouseError {
    /// The warehouse refused the request or job. The message is kept verbatim.
    #[error("{message}")]
    Rejected { message: String },
    #[error("{resource} was not found")]
    NotFound { resource: String },
    #[error("warehouse request failed with status {status}: {message}")]
    Status { status: u16, message: String },
    #[error("warehouse request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("reading {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("unexpected warehouse response: {0}")]
    Decode(String),
    #[error("missing warehouse credentials: {0}")]
    Credentials(String),
}

impl WarehouseError {
    pub fn rejected(message: impl Into<String>) -> Self {
        WarehouseError::Rejected {
            message: message.into(),
        }
    }

    /// Message of a rejected request, the only kind that can describe drift.
    pub fn rejection_message(&self) -> Option<&str> {
        match self {
            WarehouseError::Rejected { message } => Some(message),
            _ => None,
        }
    }
}

/// Blocking operations the loader needs from the destination warehouse.
pub trait Warehouse {
    /// Appends a local parquet file to `table`, returning the rows the job wrote.
    fn load_file(
        &self,
        path: &Path,
        table: &TableId,
        config: &LoadConfig,
    ) -> Result<u64, WarehouseError>;

    fn table_schema(&self, table: &TableId) -> Result<TableSchema, WarehouseError>;

    fn table_row_count(&self, table: &TableId) -> Result<u64, WarehouseError>;

    /// Changes a column's declared type. Returns only once the change has landed.
    fn alter_column_type(
        &self,
        table: &TableId,
        column: &str,
        new_type: &FieldType,
    ) -> Result<(), WarehouseError>;

    fn table_exists(&self, table: &TableId) -> Result<bool, WarehouseError>;

    fn ensure_dataset(&self, dataset: &DatasetId, location: &str) -> Result<(), WarehouseError>;

    fn drop_table_if_exists(&self, table: &TableId) -> Result<(), WarehouseError>;
}
