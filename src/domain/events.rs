//! Event types for the run log.
//!
//! Every stage change of a run is recorded as an immutable event in an
//! append-only log; the RunRecord can be rebuilt by replaying it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::run::{EntityReport, EntityStage, RunStatus};

/// A single event in the append-only run log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier for this event
    pub id: Uuid,

    /// When this event occurred (ISO 8601)
    pub timestamp: DateTime<Utc>,

    /// The run this event belongs to
    pub run_id: Uuid,

    /// Entity the event refers to (None for run-level events)
    pub entity_id: Option<String>,

    /// Type of event
    pub event_type: EventType,

    /// Human-readable summary
    pub payload_summary: String,

    /// Stage entered (for stage events)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<EntityStage>,

    /// Attempt number (for retries)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,

    /// Entities covered by the run (for RunStarted)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_ids: Option<Vec<String>>,

    /// Final per-entity report (for EntityFinished)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report: Option<EntityReport>,

    /// Final run status (for RunCompleted)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RunStatus>,

    /// Time taken in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,

    /// Error message if failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Event {
    /// Create a new event with the current timestamp
    pub fn new(
        run_id: Uuid,
        entity_id: Option<String>,
        event_type: EventType,
        payload_summary: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            run_id,
            entity_id,
            event_type,
            payload_summary,
            stage: None,
            attempt: None,
            entity_ids: None,
            report: None,
            status: None,
            duration_ms: None,
            error: None,
        }
    }

    pub fn with_stage(mut self, stage: EntityStage) -> Self {
        self.stage = Some(stage);
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    pub fn with_entities(mut self, entity_ids: Vec<String>) -> Self {
        self.entity_ids = Some(entity_ids);
        self
    }

    pub fn with_report(mut self, report: EntityReport) -> Self {
        self.report = Some(report);
        self
    }

    pub fn with_status(mut self, status: RunStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_error(mut self, error: String) -> Self {
        self.error = Some(error);
        self
    }
}

/// Types of events that can occur during a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A new run has started
    RunStarted,

    /// A run finished (status says how)
    RunCompleted,

    /// An entity entered a new stage
    StageEntered,

    /// A transient failure is being retried
    StageRetrying,

    /// An entity reached a terminal stage
    EntityFinished,
}
