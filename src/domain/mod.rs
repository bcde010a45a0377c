//! Domain types for the forecast pipeline.
//!
//! This module contains the core data structures:
//! - RawRecord / ValidationResult: ingested observations and their verdicts
//! - SeriesWindow: a resampled, gap-checked series for one entity
//! - ForecastResult: versioned forecast output
//! - ModelArtifact: trained model state with promotion status
//! - RunRecord / Event: pipeline execution state and its append-only log

pub mod artifact;
pub mod events;
pub mod forecast;
pub mod record;
pub mod run;
pub mod series;

// Re-export commonly used types
pub use artifact::{ModelArtifact, PromotionStatus, TrainingMetrics};
pub use events::{Event, EventType};
pub use forecast::{ForecastPoint, ForecastResult, ForecastSummary};
pub use record::{
    RawRecord, ReasonCode, ValidationReport, ValidationResult, ValidationStatus,
    ValidationSummary,
};
pub use run::{
    EntityOutcome, EntityReport, EntityStage, FailureReason, InvalidTransition, RunRecord,
    RunStatus, RunSummary,
};
pub use series::{SeriesPoint, SeriesWindow, TimeRange};
