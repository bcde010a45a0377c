//! Run state and reconstruction from events.
//!
//! A RunRecord represents a single pipeline execution across a set of
//! entities. Each entity moves through its own stage machine:
//!
//! `Pending → Validating → Building → Training → Promoting → Storing → Done`
//!
//! with `Failed(reason)` reachable from any non-terminal stage.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::events::{Event, EventType};
use super::record::ValidationSummary;

/// Stage of one entity within a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "stage", content = "reason")]
pub enum EntityStage {
    Pending,
    Validating,
    Building,
    Training,
    Promoting,
    Storing,
    Done,
    Failed(FailureReason),
}

impl EntityStage {
    /// Successor on the happy path (None for terminal stages)
    pub fn next(&self) -> Option<EntityStage> {
        match self {
            EntityStage::Pending => Some(EntityStage::Validating),
            EntityStage::Validating => Some(EntityStage::Building),
            EntityStage::Building => Some(EntityStage::Training),
            EntityStage::Training => Some(EntityStage::Promoting),
            EntityStage::Promoting => Some(EntityStage::Storing),
            EntityStage::Storing => Some(EntityStage::Done),
            EntityStage::Done | EntityStage::Failed(_) => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, EntityStage::Done | EntityStage::Failed(_))
    }

    /// Move to `to`, which must be the happy-path successor or a failure
    pub fn transition(&self, to: EntityStage) -> Result<EntityStage, InvalidTransition> {
        let allowed = match &to {
            EntityStage::Failed(_) => !self.is_terminal(),
            other => self.next().as_ref() == Some(other),
        };

        if allowed {
            Ok(to)
        } else {
            Err(InvalidTransition {
                from: self.name(),
                to: to.name(),
            })
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            EntityStage::Pending => "pending",
            EntityStage::Validating => "validating",
            EntityStage::Building => "building",
            EntityStage::Training => "training",
            EntityStage::Promoting => "promoting",
            EntityStage::Storing => "storing",
            EntityStage::Done => "done",
            EntityStage::Failed(_) => "failed",
        }
    }
}

impl Default for EntityStage {
    fn default() -> Self {
        Self::Pending
    }
}

/// Attempted an illegal stage change
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid stage transition: {from} → {to}")]
pub struct InvalidTransition {
    pub from: &'static str,
    pub to: &'static str,
}

/// Why an entity ended in `Failed`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum FailureReason {
    /// Batch rejection rate above threshold
    DataQuality { rejected: usize, total: usize },

    /// Too little data to build a window or train
    InsufficientData { detail: String },

    /// Model fitting failed
    Training { detail: String },

    /// Candidate did not beat the promoted model and awaits review
    HeldForReview { version: String },

    /// The training window matches an artifact that was already retired
    RetiredVersion { version: String },

    /// A stage exceeded its time budget
    Timeout { stage: String },

    /// I/O failed after retries were exhausted
    Io { detail: String },

    /// Registry refused the artifact
    Registry { detail: String },

    /// Run was cancelled
    Cancelled,

    /// Worker crashed or violated the stage machine
    Internal { detail: String },
}

impl FailureReason {
    /// Outcome category reported in the run summary
    pub fn outcome(&self) -> EntityOutcome {
        match self {
            FailureReason::DataQuality { .. } => EntityOutcome::ValidationFailed,
            FailureReason::InsufficientData { .. }
            | FailureReason::HeldForReview { .. }
            | FailureReason::RetiredVersion { .. } => EntityOutcome::Skipped,
            FailureReason::Training { .. } => EntityOutcome::TrainingFailed,
            FailureReason::Timeout { .. }
            | FailureReason::Io { .. }
            | FailureReason::Registry { .. }
            | FailureReason::Cancelled
            | FailureReason::Internal { .. } => EntityOutcome::Failed,
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::DataQuality { rejected, total } => {
                write!(f, "data quality: {}/{} records rejected", rejected, total)
            }
            FailureReason::InsufficientData { detail } => write!(f, "insufficient data: {}", detail),
            FailureReason::Training { detail } => write!(f, "training failed: {}", detail),
            FailureReason::HeldForReview { version } => {
                write!(f, "candidate {} held for review", version)
            }
            FailureReason::RetiredVersion { version } => {
                write!(f, "model {} was already retired", version)
            }
            FailureReason::Timeout { stage } => write!(f, "{} timed out", stage),
            FailureReason::Io { detail } => write!(f, "I/O failure: {}", detail),
            FailureReason::Registry { detail } => write!(f, "registry: {}", detail),
            FailureReason::Cancelled => write!(f, "cancelled"),
            FailureReason::Internal { detail } => write!(f, "internal error: {}", detail),
        }
    }
}

/// Per-entity outcome category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityOutcome {
    Success,
    ValidationFailed,
    TrainingFailed,
    Skipped,
    Failed,
}

/// What happened to one entity in a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityReport {
    pub entity_id: String,

    /// Current (or final) stage
    pub stage: EntityStage,

    /// Transient failures retried for this entity
    pub retries: u32,

    /// Validation counts, once validation ran
    pub validation: Option<ValidationSummary>,

    /// Training-window version of the trained model
    pub model_version: Option<String>,

    /// Backtest score of the trained model
    pub quality_score: Option<f64>,

    /// Narrative from the insight collaborator
    pub insight: Option<String>,

    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl EntityReport {
    pub fn new(entity_id: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            stage: EntityStage::Pending,
            retries: 0,
            validation: None,
            model_version: None,
            quality_score: None,
            insight: None,
            started_at: None,
            finished_at: None,
        }
    }

    /// Outcome category (None while still running)
    pub fn outcome(&self) -> Option<EntityOutcome> {
        match &self.stage {
            EntityStage::Done => Some(EntityOutcome::Success),
            EntityStage::Failed(reason) => Some(reason.outcome()),
            _ => None,
        }
    }

    pub fn failure(&self) -> Option<&FailureReason> {
        match &self.stage {
            EntityStage::Failed(reason) => Some(reason),
            _ => None,
        }
    }
}

/// Overall status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    PartialSuccess,
    Failed,
}

impl RunStatus {
    /// Machine-readable status code reported to the scheduling trigger
    pub fn code(&self) -> i32 {
        match self {
            RunStatus::Success => 0,
            RunStatus::Failed => 1,
            RunStatus::PartialSuccess => 2,
            RunStatus::Running => 4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::PartialSuccess => "partial_success",
            RunStatus::Failed => "failed",
        }
    }
}

impl Default for RunStatus {
    fn default() -> Self {
        Self::Running
    }
}

/// A pipeline execution across a set of entities
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    /// Unique identifier for this run
    pub id: Uuid,

    /// Entities requested, in request order
    pub entity_ids: Vec<String>,

    /// Overall status
    pub status: RunStatus,

    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,

    /// Per-entity reports keyed by entity id
    pub entities: BTreeMap<String, EntityReport>,

    /// Total transient retries across all entities
    pub retry_count: u32,
}

impl RunRecord {
    pub fn new(id: Uuid, entity_ids: Vec<String>) -> Self {
        let entities = entity_ids
            .iter()
            .map(|e| (e.clone(), EntityReport::new(e.clone())))
            .collect();

        Self {
            id,
            entity_ids,
            status: RunStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            entities,
            retry_count: 0,
        }
    }

    /// Reconstruct a run from its event log
    pub fn from_events(events: &[Event]) -> Option<Self> {
        let first = events.first()?;

        let mut run = Self::new(
            first.run_id,
            first.entity_ids.clone().unwrap_or_default(),
        );
        run.started_at = first.timestamp;

        for event in events {
            run.apply_event(event);
        }

        Some(run)
    }

    /// Apply a single event to update run state
    pub fn apply_event(&mut self, event: &Event) {
        match event.event_type {
            EventType::RunStarted => {
                self.status = RunStatus::Running;
                self.started_at = event.timestamp;
                if let Some(ref ids) = event.entity_ids {
                    for id in ids {
                        self.entities
                            .entry(id.clone())
                            .or_insert_with(|| EntityReport::new(id.clone()));
                    }
                    self.entity_ids = ids.clone();
                }
            }
            EventType::StageEntered => {
                if let (Some(id), Some(stage)) = (&event.entity_id, &event.stage) {
                    let report = self
                        .entities
                        .entry(id.clone())
                        .or_insert_with(|| EntityReport::new(id.clone()));
                    if report.started_at.is_none() {
                        report.started_at = Some(event.timestamp);
                    }
                    report.stage = stage.clone();
                }
            }
            EventType::StageRetrying => {
                if let Some(ref id) = event.entity_id {
                    if let Some(report) = self.entities.get_mut(id) {
                        report.retries += 1;
                    }
                    self.retry_count += 1;
                }
            }
            EventType::EntityFinished => {
                if let Some(ref report) = event.report {
                    self.entities
                        .insert(report.entity_id.clone(), report.clone());
                }
            }
            EventType::RunCompleted => {
                self.status = event.status.unwrap_or(RunStatus::Failed);
                self.completed_at = Some(event.timestamp);
            }
        }
    }

    /// Record a finished entity
    pub fn record(&mut self, report: EntityReport) {
        self.entities.insert(report.entity_id.clone(), report);
    }

    /// Close the run: derive the overall status from per-entity outcomes
    pub fn finalize(&mut self, completed_at: DateTime<Utc>) -> RunStatus {
        self.retry_count = self.entities.values().map(|r| r.retries).sum();

        let successes = self
            .entities
            .values()
            .filter(|r| r.outcome() == Some(EntityOutcome::Success))
            .count();

        self.status = if successes == 0 {
            RunStatus::Failed
        } else if successes == self.entities.len() {
            RunStatus::Success
        } else {
            RunStatus::PartialSuccess
        };
        self.completed_at = Some(completed_at);
        self.status
    }

    pub fn is_running(&self) -> bool {
        matches!(self.status, RunStatus::Running)
    }

    pub fn summary(&self) -> RunSummary {
        let mut summary = RunSummary {
            run_id: self.id,
            status: self.status,
            status_code: self.status.code(),
            total: self.entities.len(),
            ..Default::default()
        };

        for report in self.entities.values() {
            match report.outcome() {
                Some(EntityOutcome::Success) => summary.succeeded += 1,
                Some(EntityOutcome::ValidationFailed) => summary.validation_failed += 1,
                Some(EntityOutcome::TrainingFailed) => summary.training_failed += 1,
                Some(EntityOutcome::Skipped) => summary.skipped += 1,
                Some(EntityOutcome::Failed) => summary.failed += 1,
                None => summary.unfinished += 1,
            }
        }
        summary.retries = self.retry_count;
        summary
    }
}

/// Counts reported back to the scheduling trigger
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub status_code: i32,
    pub total: usize,
    pub succeeded: usize,
    pub validation_failed: usize,
    pub training_failed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub unfinished: usize,
    pub retries: u32,
}
