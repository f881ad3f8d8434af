use std::fmt;

use anyhow::{Result, anyhow};
use chrono::NaiveDate;
use clap::ValueEnum;

use crate::warehouse::{DatasetId, TableId};

pub const DEFAULT_BASE_URL: &str = "https://d37ci6vzurychx.cloudfront.net/trip-data";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum)]
#[value(rename_all = "lower")]
pub enum TaxiType {
    Yellow,
    Green,
}

impl TaxiType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaxiType::Yellow => "yellow",
            TaxiType::Green => "green",
        }
    }

    /// Pickup timestamp column, used as the destination's partitioning field.
    pub fn pickup_column(&self) -> &'static str {
        match self {
            TaxiType::Yellow => "tpep_pickup_datetime",
            TaxiType::Green => "lpep_pickup_datetime",
        }
    }

    pub fn table_name(&self) -> String {
        format!("{}_tripdata", self.as_str())
    }

    pub fn table_id(&self, dataset: &DatasetId) -> TableId {
        dataset.table(self.table_name())
    }
}

impl fmt::Display for TaxiType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One monthly source file for a taxi type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TripFile {
    pub taxi_type: TaxiType,
    pub period: NaiveDate,
}

impl TripFile {
    pub fn new(taxi_type: TaxiType, year: i32, month: u32) -> Result<Self> {
        let period = NaiveDate::from_ymd_opt(year, month, 1)
            .ok_or_else(|| anyhow!("Invalid trip file period {year}-{month:02}"))?;
        Ok(Self { taxi_type, period })
    }

    pub fn file_name(&self) -> String {
        format!(
            "{}_tripdata_{}.parquet",
            self.taxi_type.as_str(),
            self.period.format("%Y-%m")
        )
    }

    pub fn url(&self, base_url: &str) -> String {
        format!("{}/{}", base_url.trim_end_matches('/'), self.file_name())
    }
}
