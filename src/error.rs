//! Error taxonomy for the forecast pipeline.
//!
//! Batch-level, entity-level, request-level and read-time failures each get
//! their own type so callers can tell them apart without string matching:
//! - `DataQualityError`: a batch exceeded the rejection threshold
//! - `InsufficientDataError` / `TrainingError`: one entity is skipped
//! - `RunInProgressError`: a duplicate run request was rejected
//! - `StaleDataError`: the served forecast is older than the freshness SLA
//! - `TransientIoError`: storage or source I/O, eligible for retry

use chrono::{DateTime, Utc};
use thiserror::Error;

/// A batch was aborted because too many records were rejected.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("Data quality check failed: {rejected}/{total} records rejected (rate {rate:.3} > threshold {threshold:.3})")]
pub struct DataQualityError {
    pub rejected: usize,
    pub total: usize,
    pub rate: f64,
    pub threshold: f64,
}

/// Not enough usable observations to build a series window.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Insufficient data for entity '{entity_id}': {reason}")]
pub struct InsufficientDataError {
    pub entity_id: String,
    pub reason: String,
}

/// Model fitting failed for one entity.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrainingError {
    #[error("Entity '{entity_id}' has {have} observations, at least {need} required")]
    TooFewObservations {
        entity_id: String,
        have: usize,
        need: usize,
    },

    #[error("Model fit for entity '{entity_id}' is degenerate: {reason}")]
    Degenerate { entity_id: String, reason: String },
}

/// A run was requested for entities that already have an active run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Run already in progress for: {}", .entity_ids.join(", "))]
pub struct RunInProgressError {
    pub entity_ids: Vec<String>,
}

/// The latest forecast is older than the freshness SLA.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Forecast for '{entity_id}' generated at {generated_at} is stale ({age_seconds}s old, SLA {sla_seconds}s)")]
pub struct StaleDataError {
    pub entity_id: String,
    pub generated_at: DateTime<Utc>,
    pub age_seconds: i64,
    pub sla_seconds: i64,
}

/// Storage or source I/O failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("I/O error during {operation}: {message}")]
pub struct TransientIoError {
    pub operation: String,
    pub message: String,
}

impl TransientIoError {
    pub fn new(operation: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self {
            operation: operation.into(),
            message: err.to_string(),
        }
    }
}

/// Lookup of a missing entity, artifact or forecast.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} not found: {key}")]
pub struct NotFoundError {
    pub kind: &'static str,
    pub key: String,
}

/// Points pushed into a series window out of chronological order.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Point at {timestamp} is not after the last point at {last}")]
pub struct SeriesOrderError {
    pub timestamp: DateTime<Utc>,
    pub last: DateTime<Utc>,
}

/// Pipeline configuration rejected before a run starts.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid configuration: {0}")]
pub struct InvalidConfigError(pub String);

/// Errors from the model registry
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RegistryError {
    #[error(transparent)]
    NotFound(#[from] NotFoundError),

    #[error("Artifact {entity_id}@{version} already exists")]
    Duplicate { entity_id: String, version: String },

    #[error("Artifact {entity_id}@{version} is retired and cannot be promoted")]
    Retired { entity_id: String, version: String },

    #[error(transparent)]
    Io(#[from] TransientIoError),
}

/// Errors from the forecast store
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    #[error(transparent)]
    NotFound(#[from] NotFoundError),

    #[error(transparent)]
    Stale(#[from] StaleDataError),

    #[error(transparent)]
    Io(#[from] TransientIoError),
}

/// Errors from a raw data source
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    #[error(transparent)]
    Io(#[from] TransientIoError),

    #[error("Source rejected request: {0}")]
    Rejected(String),
}

/// Run-level errors: the run is aborted before any entity starts.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    RunInProgress(#[from] RunInProgressError),

    #[error(transparent)]
    InvalidConfig(#[from] InvalidConfigError),

    #[error("No entities requested")]
    NoEntities,

    #[error("Entity '{0}' requested more than once")]
    DuplicateEntity(String),

    #[error(transparent)]
    Io(#[from] TransientIoError),
}

/// Whether an error may succeed on retry.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

impl Transient for TransientIoError {
    fn is_transient(&self) -> bool {
        true
    }
}

impl Transient for RegistryError {
    fn is_transient(&self) -> bool {
        matches!(self, RegistryError::Io(_))
    }
}

impl Transient for StoreError {
    fn is_transient(&self) -> bool {
        matches!(self, StoreError::Io(_))
    }
}

impl Transient for SourceError {
    fn is_transient(&self) -> bool {
        matches!(self, SourceError::Io(_))
    }
}
