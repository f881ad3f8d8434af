#![allow(dead_code)]

use std::{
    cell::RefCell,
    collections::{BTreeMap, HashMap, VecDeque},
    fs::File,
    path::{Path, PathBuf},
    sync::Arc,
};

use arrow::{
    array::{ArrayRef, Float64Array, Int64Array, StringArray, TimestampMicrosecondArray},
    datatypes::{DataType, Field, Schema, TimeUnit},
    record_batch::RecordBatch,
};
use parquet::arrow::{ArrowWriter, arrow_reader::ParquetRecordBatchReaderBuilder};
use reqwest::StatusCode;
use taxi_ingest::{
    download::{DownloadError, Downloader},
    warehouse::{
        DatasetId, FieldType, LoadConfig, SchemaField, SchemaMode, SchemaUpdateOption, TableId,
        TableSchema, Warehouse, WarehouseError, WriteDisposition,
    },
};
use tempfile::{TempDir, tempdir};

/// Scratch directory helper that cleans up files automatically on drop.
pub struct TestWorkspace {
    temp_dir: TempDir,
}

impl TestWorkspace {
    /// Creates a fresh scratch directory for the current test case.
    pub fn new() -> Self {
        Self {
            temp_dir: tempdir().expect("temp dir"),
        }
    }

    /// Returns the root path for all files owned by this workspace.
    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Writes a three-row trip file under the workspace and returns the path.
    pub fn trip_file(&self, name: &str, pickup_column: &str, fee: Fee) -> PathBuf {
        let path = self.temp_dir.path().join(name);
        write_trip_file(&path, pickup_column, &fee);
        path
    }
}

pub fn table_id(table: &str) -> TableId {
    TableId {
        project: "proj".to_string(),
        dataset: "raw_ny_taxi".to_string(),
        table: table.to_string(),
    }
}

/// Shape of the drifting `airport_fee` column in a generated trip file.
#[derive(Debug, Clone)]
pub enum Fee {
    Integer,
    Float,
    Absent,
}

pub fn write_trip_file(path: &Path, pickup_column: &str, fee: &Fee) {
    let mut fields = vec![
        Field::new("VendorID", DataType::Int64, true),
        Field::new(
            pickup_column,
            DataType::Timestamp(TimeUnit::Microsecond, None),
            true,
        ),
        Field::new("store_and_fwd_flag", DataType::Utf8, true),
        Field::new("fare_amount", DataType::Float64, true),
    ];
    let mut columns: Vec<ArrayRef> = vec![
        Arc::new(Int64Array::from(vec![1, 2, 1])),
        Arc::new(TimestampMicrosecondArray::from(vec![
            1_704_067_200_000_000,
            1_704_070_800_000_000,
            1_704_074_400_000_000,
        ])),
        Arc::new(StringArray::from(vec!["N", "N", "Y"])),
        Arc::new(Float64Array::from(vec![12.5, 7.0, 30.25])),
    ];
    match fee {
        Fee::Integer => {
            fields.push(Field::new("airport_fee", DataType::Int64, true));
            columns.push(Arc::new(Int64Array::from(vec![Some(0), None, Some(2)])));
        }
        Fee::Float => {
            fields.push(Field::new("airport_fee", DataType::Float64, true));
            columns.push(Arc::new(Float64Array::from(vec![Some(0.0), Some(1.75), None])));
        }
        Fee::Absent => {}
    }
    let schema = Arc::new(Schema::new(fields));
    let batch = RecordBatch::try_new(Arc::clone(&schema), columns).expect("record batch");
    let file = File::create(path).expect("create parquet file");
    let mut writer = ArrowWriter::try_new(file, schema, None).expect("parquet writer");
    writer.write(&batch).expect("write batch");
    writer.close().expect("close writer");
}

fn parquet_columns(path: &Path) -> (Vec<(String, DataType)>, u64) {
    let file = File::open(path).expect("open parquet file");
    let builder = ParquetRecordBatchReaderBuilder::try_new(file).expect("parquet reader");
    let columns = builder
        .schema()
        .fields()
        .iter()
        .map(|field| (field.name().clone(), field.data_type().clone()))
        .collect();
    let rows = builder.metadata().file_metadata().num_rows() as u64;
    (columns, rows)
}

pub fn column_type(path: &Path, column: &str) -> Option<DataType> {
    parquet_columns(path)
        .0
        .into_iter()
        .find(|(name, _)| name == column)
        .map(|(_, data_type)| data_type)
}

fn warehouse_type(data_type: &DataType) -> FieldType {
    let name = match data_type {
        DataType::Int8
        | DataType::Int16
        | DataType::Int32
        | DataType::Int64
        | DataType::UInt8
        | DataType::UInt16
        | DataType::UInt32
        | DataType::UInt64 => "INTEGER",
        DataType::Float32 | DataType::Float64 => "FLOAT",
        DataType::Boolean => "BOOLEAN",
        DataType::Timestamp(_, _) => "TIMESTAMP",
        _ => "STRING",
    };
    FieldType::new(name)
}

fn physical_name(field_type: &FieldType) -> &'static str {
    if field_type.is_float() {
        "DOUBLE"
    } else if field_type.is_integer() {
        "INT64"
    } else {
        "BYTE_ARRAY"
    }
}

fn same_type(left: &FieldType, right: &FieldType) -> bool {
    left == right
        || (left.is_integer() && right.is_integer())
        || (left.is_float() && right.is_float())
}

/// Every call a fake warehouse received, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Load {
        table: String,
        auto_detect: bool,
        partition_field: String,
    },
    Alter {
        table: String,
        column: String,
        new_type: String,
    },
    Schema(String),
    RowCount(String),
    Exists(String),
    EnsureDataset(String, String),
    Drop(String),
}

fn assert_append_config(config: &LoadConfig) {
    assert_eq!(config.write_disposition, WriteDisposition::WriteAppend);
    assert!(config.schema_update_options.contains(&SchemaUpdateOption::AllowFieldAddition));
    assert!(config.schema_update_options.contains(&SchemaUpdateOption::AllowFieldRelaxation));
}

#[derive(Debug, Clone, Default)]
pub struct SimTable {
    pub schema: TableSchema,
    pub rows: u64,
}

/// In-memory warehouse that inspects staged parquet files and rejects them
/// with the same phrasing the real warehouse uses for type drift.
#[derive(Default)]
pub struct SimulatedWarehouse {
    tables: RefCell<BTreeMap<String, SimTable>>,
    calls: RefCell<Vec<Call>>,
    alter_failure: RefCell<Option<WarehouseError>>,
}

impl SimulatedWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(self, table: &TableId, fields: &[(&str, &str)], rows: u64) -> Self {
        let schema = TableSchema {
            fields: fields
                .iter()
                .map(|(name, field_type)| SchemaField::new(*name, FieldType::new(field_type)))
                .collect(),
        };
        self.tables
            .borrow_mut()
            .insert(table.to_string(), SimTable { schema, rows });
        self
    }

    pub fn fail_alters_with(self, error: WarehouseError) -> Self {
        *self.alter_failure.borrow_mut() = Some(error);
        self
    }

    pub fn table(&self, table: &TableId) -> Option<SimTable> {
        self.tables.borrow().get(&table.to_string()).cloned()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.borrow().clone()
    }

    pub fn load_calls(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|call| matches!(call, Call::Load { .. }))
            .collect()
    }

    pub fn alter_calls(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|call| matches!(call, Call::Alter { .. }))
            .collect()
    }

    fn record(&self, call: Call) {
        self.calls.borrow_mut().push(call);
    }
}

impl Warehouse for SimulatedWarehouse {
    fn load_file(
        &self,
        path: &Path,
        table: &TableId,
        config: &LoadConfig,
    ) -> Result<u64, WarehouseError> {
        assert_append_config(config);
        self.record(Call::Load {
            table: table.to_string(),
            auto_detect: config.schema.is_auto_detect(),
            partition_field: config.partition_field.clone(),
        });
        let (columns, rows) = parquet_columns(path);
        let mut tables = self.tables.borrow_mut();
        let Some(existing) = tables.get_mut(&table.to_string()) else {
            let schema = TableSchema {
                fields: columns
                    .iter()
                    .map(|(name, data_type)| SchemaField::new(name.clone(), warehouse_type(data_type)))
                    .collect(),
            };
            tables.insert(table.to_string(), SimTable { schema, rows });
            return Ok(rows);
        };

        let declared = match &config.schema {
            SchemaMode::AutoDetect => None,
            SchemaMode::Explicit(schema) => Some(schema.clone()),
        };
        for (name, data_type) in &columns {
            let file_type = warehouse_type(data_type);
            match &declared {
                None => {
                    let existing_type = existing.schema.field(name).map(|field| &field.field_type);
                    if let Some(table_type) = existing_type.filter(|t| !same_type(t, &file_type)) {
                        return Err(WarehouseError::rejected(format!(
                            "Provided Schema does not match Table {}:{}.{}. Field {name} has changed type from {table_type} to {file_type}",
                            table.project, table.dataset, table.table
                        )));
                    }
                }
                Some(schema) => {
                    let declared_type = schema.field(name).map(|field| &field.field_type);
                    if let Some(target) = declared_type.filter(|t| !same_type(t, &file_type)) {
                        return Err(WarehouseError::rejected(format!(
                            "Error while reading data, error message: Parquet column '{name}' has type {} which does not match the target cpp_type {}. File: {}",
                            physical_name(&file_type),
                            physical_name(target),
                            path.display()
                        )));
                    }
                }
            }
        }
        for (name, data_type) in &columns {
            if existing.schema.field(name).is_none() {
                existing
                    .schema
                    .fields
                    .push(SchemaField::new(name.clone(), warehouse_type(data_type)));
            }
        }
        existing.rows += rows;
        Ok(rows)
    }

    fn table_schema(&self, table: &TableId) -> Result<TableSchema, WarehouseError> {
        self.record(Call::Schema(table.to_string()));
        self.table(table)
            .map(|sim| sim.schema)
            .ok_or_else(|| WarehouseError::NotFound {
                resource: format!("table {table}"),
            })
    }

    fn table_row_count(&self, table: &TableId) -> Result<u64, WarehouseError> {
        self.record(Call::RowCount(table.to_string()));
        self.table(table)
            .map(|sim| sim.rows)
            .ok_or_else(|| WarehouseError::NotFound {
                resource: format!("table {table}"),
            })
    }

    fn alter_column_type(
        &self,
        table: &TableId,
        column: &str,
        new_type: &FieldType,
    ) -> Result<(), WarehouseError> {
        self.record(Call::Alter {
            table: table.to_string(),
            column: column.to_string(),
            new_type: new_type.to_string(),
        });
        if let Some(error) = self.alter_failure.borrow_mut().take() {
            return Err(error);
        }
        let mut tables = self.tables.borrow_mut();
        let sim = tables
            .get_mut(&table.to_string())
            .ok_or_else(|| WarehouseError::NotFound {
                resource: format!("table {table}"),
            })?;
        if let Some(field) = sim.schema.fields.iter_mut().find(|field| field.name == column) {
            field.field_type = new_type.clone();
        }
        Ok(())
    }

    fn table_exists(&self, table: &TableId) -> Result<bool, WarehouseError> {
        self.record(Call::Exists(table.to_string()));
        Ok(self.table(table).is_some())
    }

    fn ensure_dataset(&self, dataset: &DatasetId, location: &str) -> Result<(), WarehouseError> {
        self.record(Call::EnsureDataset(dataset.to_string(), location.to_string()));
        Ok(())
    }

    fn drop_table_if_exists(&self, table: &TableId) -> Result<(), WarehouseError> {
        self.record(Call::Drop(table.to_string()));
        self.tables.borrow_mut().remove(&table.to_string());
        Ok(())
    }
}

/// Warehouse that replays queued load outcomes regardless of file content.
pub struct ScriptedWarehouse {
    outcomes: RefCell<VecDeque<Result<u64, WarehouseError>>>,
    calls: RefCell<Vec<Call>>,
    schema: TableSchema,
    rows: u64,
}

impl ScriptedWarehouse {
    pub fn new(outcomes: Vec<Result<u64, WarehouseError>>) -> Self {
        Self {
            outcomes: RefCell::new(outcomes.into()),
            calls: RefCell::new(Vec::new()),
            schema: TableSchema {
                fields: vec![SchemaField::new("airport_fee", FieldType::float64())],
            },
            rows: 0,
        }
    }

    pub fn with_rows(mut self, rows: u64) -> Self {
        self.rows = rows;
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.borrow().clone()
    }

    pub fn load_modes(&self) -> Vec<bool> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Load { auto_detect, .. } => Some(auto_detect),
                _ => None,
            })
            .collect()
    }

    pub fn alter_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, Call::Alter { .. }))
            .count()
    }
}

impl Warehouse for ScriptedWarehouse {
    fn load_file(
        &self,
        _path: &Path,
        table: &TableId,
        config: &LoadConfig,
    ) -> Result<u64, WarehouseError> {
        assert_append_config(config);
        self.calls.borrow_mut().push(Call::Load {
            table: table.to_string(),
            auto_detect: config.schema.is_auto_detect(),
            partition_field: config.partition_field.clone(),
        });
        self.outcomes.borrow_mut().pop_front().unwrap_or(Ok(0))
    }

    fn table_schema(&self, table: &TableId) -> Result<TableSchema, WarehouseError> {
        self.calls.borrow_mut().push(Call::Schema(table.to_string()));
        Ok(self.schema.clone())
    }

    fn table_row_count(&self, table: &TableId) -> Result<u64, WarehouseError> {
        self.calls.borrow_mut().push(Call::RowCount(table.to_string()));
        Ok(self.rows)
    }

    fn alter_column_type(
        &self,
        table: &TableId,
        column: &str,
        new_type: &FieldType,
    ) -> Result<(), WarehouseError> {
        self.calls.borrow_mut().push(Call::Alter {
            table: table.to_string(),
            column: column.to_string(),
            new_type: new_type.to_string(),
        });
        Ok(())
    }

    fn table_exists(&self, table: &TableId) -> Result<bool, WarehouseError> {
        self.calls.borrow_mut().push(Call::Exists(table.to_string()));
        Ok(true)
    }

    fn ensure_dataset(&self, dataset: &DatasetId, location: &str) -> Result<(), WarehouseError> {
        self.calls
            .borrow_mut()
            .push(Call::EnsureDataset(dataset.to_string(), location.to_string()));
        Ok(())
    }

    fn drop_table_if_exists(&self, table: &TableId) -> Result<(), WarehouseError> {
        self.calls.borrow_mut().push(Call::Drop(table.to_string()));
        Ok(())
    }
}

/// Downloader that writes generated trip files for known names and answers
/// 404 for everything else.
#[derive(Default)]
pub struct FixtureDownloader {
    files: HashMap<String, (String, Fee)>,
    requests: RefCell<Vec<String>>,
}

impl FixtureDownloader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, name: &str, pickup_column: &str, fee: Fee) -> Self {
        self.files
            .insert(name.to_string(), (pickup_column.to_string(), fee));
        self
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.borrow().clone()
    }
}

impl Downloader for FixtureDownloader {
    fn download(&self, url: &str, destination: &Path) -> Result<u64, DownloadError> {
        self.requests.borrow_mut().push(url.to_string());
        let name = url.rsplit('/').next().unwrap_or(url);
        let Some((pickup_column, fee)) = self.files.get(name) else {
            return Err(DownloadError::Status {
                url: url.to_string(),
                status: StatusCode::NOT_FOUND,
            });
        };
        write_trip_file(destination, pickup_column, fee);
        Ok(std::fs::metadata(destination).map(|meta| meta.len()).unwrap_or(0))
    }
}
