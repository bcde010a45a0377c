//! CSV file data source.
//!
//! Defaults match the online-retail transaction export: one row per invoice
//! line, `StockCode` as the entity, `InvoiceDate` as the timestamp and
//! `Quantity × UnitPrice` as the value (revenue).

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use csv::StringRecord;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use super::DataSource;
use crate::domain::{RawRecord, TimeRange};
use crate::error::{SourceError, TransientIoError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CsvSourceConfig {
    /// CSV file to read
    pub path: PathBuf,

    #[serde(default = "default_entity_column")]
    pub entity_column: String,

    #[serde(default = "default_timestamp_column")]
    pub timestamp_column: String,

    /// Column holding the value directly; when unset the value is
    /// `quantity_column × unit_price_column`
    #[serde(default)]
    pub value_column: Option<String>,

    #[serde(default = "default_quantity_column")]
    pub quantity_column: String,

    #[serde(default = "default_unit_price_column")]
    pub unit_price_column: String,

    #[serde(default = "default_delimiter")]
    pub delimiter: char,
}

fn default_entity_column() -> String {
    "StockCode".to_string()
}
fn default_timestamp_column() -> String {
    "InvoiceDate".to_string()
}
fn default_quantity_column() -> String {
    "Quantity".to_string()
}
fn default_unit_price_column() -> String {
    "UnitPrice".to_string()
}
fn default_delimiter() -> char {
    ','
}

impl CsvSourceConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            entity_column: default_entity_column(),
            timestamp_column: default_timestamp_column(),
            value_column: None,
            quantity_column: default_quantity_column(),
            unit_price_column: default_unit_price_column(),
            delimiter: default_delimiter(),
        }
    }
}

/// Parse the timestamp formats seen in retail exports
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M", "%m/%d/%Y %H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}

fn parse_number(raw: Option<&str>) -> Option<f64> {
    raw.map(str::trim)
        .filter(|s| !s.is_empty())
        .and_then(|s| s.parse::<f64>().ok())
}

/// Column positions resolved from the header row
struct Columns {
    entity: usize,
    timestamp: usize,
    value: ValueColumns,
}

enum ValueColumns {
    Direct(usize),
    Product { quantity: usize, unit_price: usize },
}

impl Columns {
    fn resolve(headers: &StringRecord, config: &CsvSourceConfig) -> Result<Self, SourceError> {
        let find = |name: &str| {
            headers
                .iter()
                .position(|h| h.trim() == name)
                .ok_or_else(|| SourceError::Rejected(format!("missing column '{}'", name)))
        };

        let value = match &config.value_column {
            Some(column) => ValueColumns::Direct(find(column)?),
            None => ValueColumns::Product {
                quantity: find(&config.quantity_column)?,
                unit_price: find(&config.unit_price_column)?,
            },
        };

        Ok(Self {
            entity: find(&config.entity_column)?,
            timestamp: find(&config.timestamp_column)?,
            value,
        })
    }

    fn record(&self, row: &StringRecord, source: &str) -> RawRecord {
        let value = match self.value {
            ValueColumns::Direct(idx) => parse_number(row.get(idx)),
            ValueColumns::Product {
                quantity,
                unit_price,
            } => match (parse_number(row.get(quantity)), parse_number(row.get(unit_price))) {
                (Some(q), Some(p)) => Some(q * p),
                _ => None,
            },
        };

        RawRecord {
            entity_id: row.get(self.entity).unwrap_or_default().trim().to_string(),
            timestamp: row.get(self.timestamp).and_then(parse_timestamp),
            value,
            source: source.to_string(),
        }
    }
}

/// Reads raw records from a CSV file on every fetch
#[derive(Debug, Clone)]
pub struct CsvDataSource {
    config: CsvSourceConfig,
    name: String,
}

impl CsvDataSource {
    pub fn new(config: CsvSourceConfig) -> Self {
        let name = format!("csv:{}", config.path.display());
        Self { config, name }
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Read every row, keeping those `keep` accepts
    async fn read_all<F>(&self, keep: F) -> Result<Vec<RawRecord>, SourceError>
    where
        F: Fn(&RawRecord) -> bool + Send + 'static,
    {
        let config = self.config.clone();
        let source = self.name.clone();

        tokio::task::spawn_blocking(move || read_file(&config, &source, keep))
            .await
            .map_err(|e| SourceError::Io(TransientIoError::new("csv read task", e)))?
    }
}

fn read_file<F>(config: &CsvSourceConfig, source: &str, keep: F) -> Result<Vec<RawRecord>, SourceError>
where
    F: Fn(&RawRecord) -> bool,
{
    let io_err = |e: csv::Error| {
        SourceError::Io(TransientIoError::new(
            format!("read {}", config.path.display()),
            e,
        ))
    };

    let delimiter = u8::try_from(config.delimiter)
        .map_err(|_| SourceError::Rejected(format!("unsupported delimiter {:?}", config.delimiter)))?;

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .from_path(&config.path)
        .map_err(|e| {
            let missing = matches!(
                e.kind(),
                csv::ErrorKind::Io(io) if io.kind() == std::io::ErrorKind::NotFound
            );
            if missing {
                SourceError::Rejected(format!("data file not found: {}", config.path.display()))
            } else {
                io_err(e)
            }
        })?;

    let headers = reader.headers().map_err(io_err)?.clone();
    let columns = Columns::resolve(&headers, config)?;

    let mut records = Vec::new();
    for row in reader.records() {
        let row = row.map_err(io_err)?;
        let record = columns.record(&row, source);
        if keep(&record) {
            records.push(record);
        }
    }
    Ok(records)
}

#[async_trait]
impl DataSource for CsvDataSource {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self), fields(source = %self.name))]
    async fn fetch(&self, entity_id: &str, range: TimeRange) -> Result<Vec<RawRecord>, SourceError> {
        let wanted = entity_id.to_string();
        let records = self
            .read_all(move |r| {
                r.entity_id == wanted && r.timestamp.map_or(true, |ts| range.contains(ts))
            })
            .await?;
        debug!(records = records.len(), "Fetched records");
        Ok(records)
    }

    async fn entities(&self) -> Result<Vec<String>, SourceError> {
        let records = self.read_all(|r| !r.entity_id.is_empty()).await?;
        let unique: BTreeSet<String> = records.into_iter().map(|r| r.entity_id).collect();
        Ok(unique.into_iter().collect())
    }
}
