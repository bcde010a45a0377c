//! Core pipeline logic.
//!
//! This module contains:
//! - Validator, FeatureBuilder, ForecastEngine: the per-entity stages
//! - ModelRegistry, ForecastStore: versioned, journaled state
//! - EventStore: append-only run logging
//! - Orchestrator: runs entities through the stages in parallel

pub mod engine;
pub mod event_store;
pub mod features;
pub mod forecast_store;
pub mod guard;
pub mod journal;
pub mod orchestrator;
pub mod pipeline;
pub mod registry;
pub mod validator;

// Re-export commonly used types
pub use engine::{EngineConfig, ForecastEngine, ModelState, SmoothingParams, TrainedModel};
pub use event_store::EventStore;
pub use features::{Aggregation, FeatureBuilder, FeatureConfig};
pub use forecast_store::{ForecastHistory, ForecastStore, StoreConfig};
pub use guard::{ActiveRuns, RunClaim};
pub use journal::Journal;
pub use orchestrator::{CancelToken, Orchestrator};
pub use pipeline::{PipelineConfig, PromotionConfig, RetryPolicy, StageTimeouts};
pub use registry::{ModelRegistry, PromotionDecision};
pub use validator::{CorrectionStrategy, ValidationConfig, Validator};
