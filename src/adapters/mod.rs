//! Adapter interfaces for external systems.
//!
//! The pipeline talks to two collaborators:
//! - a raw data source that returns records for one entity and time range
//! - an insight provider that narrates a forecast summary

pub mod csv_source;
pub mod insight;
pub mod memory;

use async_trait::async_trait;

use crate::domain::{ForecastSummary, RawRecord, TimeRange};
use crate::error::SourceError;

pub use csv_source::{CsvDataSource, CsvSourceConfig};
pub use insight::{HttpInsightClient, InsightConfig};
pub use memory::MemoryDataSource;

/// Source of raw records
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Human-readable source name
    fn name(&self) -> &str;

    /// Records of `entity_id` observed within `range`
    async fn fetch(&self, entity_id: &str, range: TimeRange) -> Result<Vec<RawRecord>, SourceError>;

    /// Every entity the source knows about
    async fn entities(&self) -> Result<Vec<String>, SourceError>;
}

/// Natural-language narration of forecasts
#[async_trait]
pub trait InsightProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn narrate(&self, summary: &ForecastSummary) -> anyhow::Result<String>;
}
