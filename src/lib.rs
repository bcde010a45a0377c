//! bi-forecast - Revenue forecasting pipeline
//!
//! Turns raw transaction records into per-entity revenue forecasts:
//! validate the records, aggregate them into a regular series, train a
//! seasonal smoothing model, promote it through a versioned registry and
//! publish forecasts with confidence intervals.
//!
//! # Architecture
//!
//! - Each entity moves through `validate → build → train → promote → store`
//!   independently; one failing entity never fails the others
//! - Runs are recorded as append-only JSONL events and can be replayed
//! - The model registry and forecast store are journaled so state
//!   survives restarts
//!
//! # Modules
//!
//! - `adapters`: Data sources (CSV, in-memory) and the insight client
//! - `core`: Pipeline stages, registry, store, orchestrator
//! - `domain`: Data structures (RawRecord, SeriesWindow, ForecastResult, RunRecord)
//! - `trigger`: Interval scheduler and data file watcher
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Forecast every entity in a CSV export
//! bi-forecast --data online_retail.csv run
//!
//! # Latest forecast for one entity
//! bi-forecast latest 85123A
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod error;
pub mod trigger;

// Re-export main types at crate root for convenience
pub use adapters::{DataSource, InsightProvider};
pub use core::{ForecastStore, ModelRegistry, Orchestrator, PipelineConfig};
pub use domain::{ForecastResult, ModelArtifact, RawRecord, RunRecord, RunStatus, SeriesWindow};
pub use error::OrchestratorError;
