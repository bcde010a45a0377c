//! Interval scheduler: triggers a run every `every` until stopped.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::core::{Orchestrator, PipelineConfig};
use crate::domain::RunSummary;
use crate::error::OrchestratorError;

/// Result of one trigger
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// The run finished (whatever its status)
    Completed(RunSummary),

    /// Every requested entity was busy or nothing was requested
    Skipped(String),

    /// The run was rejected before it started
    Failed(String),
}

/// Invokes `run_pipeline` for a fixed or discovered entity set
pub struct Scheduler {
    orchestrator: Arc<Orchestrator>,
    config: PipelineConfig,

    /// Entities to run; discovered from the data source when empty
    entities: Vec<String>,
}

impl Scheduler {
    pub fn new(orchestrator: Arc<Orchestrator>, config: PipelineConfig, entities: Vec<String>) -> Self {
        Self {
            orchestrator,
            config,
            entities,
        }
    }

    async fn resolve_entities(&self) -> Result<Vec<String>, String> {
        if !self.entities.is_empty() {
            return Ok(self.entities.clone());
        }
        self.orchestrator
            .source()
            .entities()
            .await
            .map_err(|e| format!("entity discovery failed: {}", e))
    }

    /// Trigger a single run
    pub async fn tick(&self) -> TickOutcome {
        let entities = match self.resolve_entities().await {
            Ok(entities) if entities.is_empty() => {
                return TickOutcome::Skipped("no entities to run".to_string())
            }
            Ok(entities) => entities,
            Err(e) => {
                warn!(error = %e, "Scheduled run not started");
                return TickOutcome::Failed(e);
            }
        };

        match self.orchestrator.run_pipeline(&entities, &self.config).await {
            Ok(run) => TickOutcome::Completed(run.summary()),
            Err(OrchestratorError::RunInProgress(e)) => {
                warn!(busy = ?e.entity_ids, "Previous run still active, skipping tick");
                TickOutcome::Skipped(e.to_string())
            }
            Err(e) => {
                error!(error = %e, "Scheduled run rejected");
                TickOutcome::Failed(e.to_string())
            }
        }
    }

    /// Tick every `every` until `stop` flips to true. Returns the outcomes.
    pub async fn run_every(&self, every: Duration, mut stop: watch::Receiver<bool>) -> Vec<TickOutcome> {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut outcomes = Vec::new();

        info!(every_secs = every.as_secs(), "Scheduler started");
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let outcome = self.tick().await;
                    if let TickOutcome::Completed(summary) = &outcome {
                        info!(run_id = %summary.run_id, status = summary.status.as_str(), "Scheduled run finished");
                    }
                    outcomes.push(outcome);
                }
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
            if *stop.borrow() {
                break;
            }
        }
        info!(ticks = outcomes.len(), "Scheduler stopped");
        outcomes
    }
}
