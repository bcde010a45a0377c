//! Main orchestrator for pipeline runs.
//!
//! A run processes a set of entities in parallel, bounded by
//! `max_workers`. Each entity moves through its own stage machine:
//! validating, building, training, promoting, storing. Failures of one
//! entity never abort its siblings; the run status is derived from the
//! per-entity outcomes when every entity has reached a terminal stage.

use std::collections::HashSet;
use std::fmt::Display;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::adapters::{DataSource, InsightProvider};
use crate::domain::{
    EntityReport, EntityStage, Event, EventType, FailureReason, RunRecord, SeriesWindow,
    TimeRange, ValidationResult,
};
use crate::error::{
    OrchestratorError, RegistryError, TrainingError, Transient, TransientIoError,
};

use super::engine::{ForecastEngine, TrainedModel};
use super::event_store::EventStore;
use super::features::FeatureBuilder;
use super::forecast_store::ForecastStore;
use super::guard::ActiveRuns;
use super::pipeline::{PipelineConfig, RetryPolicy};
use super::registry::{ModelRegistry, PromotionDecision};
use super::validator::Validator;

/// Cooperative cancellation shared between a caller and a run
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask every entity to stop before its next stage
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Main pipeline orchestrator
pub struct Orchestrator {
    source: Arc<dyn DataSource>,
    registry: Arc<ModelRegistry>,
    store: Arc<ForecastStore>,
    insight: Option<Arc<dyn InsightProvider>>,

    /// Where run event logs live (no logging when unset)
    runs_dir: Option<PathBuf>,

    active: ActiveRuns,
}

impl Orchestrator {
    /// Create a new orchestrator over injected services
    pub fn new(
        source: Arc<dyn DataSource>,
        registry: Arc<ModelRegistry>,
        store: Arc<ForecastStore>,
    ) -> Self {
        Self {
            source,
            registry,
            store,
            insight: None,
            runs_dir: None,
            active: ActiveRuns::new(),
        }
    }

    pub fn with_insight(mut self, insight: Arc<dyn InsightProvider>) -> Self {
        self.insight = Some(insight);
        self
    }

    /// Persist each run's events under `runs_dir/<run_id>/events.jsonl`
    pub fn with_run_log(mut self, runs_dir: impl Into<PathBuf>) -> Self {
        self.runs_dir = Some(runs_dir.into());
        self
    }

    /// Exclude runs of other processes through per-entity lock files in `dir`
    pub fn with_lock_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.active = ActiveRuns::with_lock_dir(dir);
        self
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<ForecastStore> {
        &self.store
    }

    pub fn source(&self) -> &Arc<dyn DataSource> {
        &self.source
    }

    /// Whether an entity has an active run
    pub fn is_active(&self, entity_id: &str) -> bool {
        self.active.is_active(entity_id)
    }

    /// Run the pipeline for `entity_ids`
    pub async fn run_pipeline(
        &self,
        entity_ids: &[String],
        config: &PipelineConfig,
    ) -> Result<RunRecord, OrchestratorError> {
        self.run_pipeline_with_cancel(entity_ids, config, CancelToken::new())
            .await
    }

    /// Run the pipeline, stopping entities at their next stage once
    /// `cancel` fires
    #[instrument(skip(self, config, cancel), fields(entities = entity_ids.len()))]
    pub async fn run_pipeline_with_cancel(
        &self,
        entity_ids: &[String],
        config: &PipelineConfig,
        cancel: CancelToken,
    ) -> Result<RunRecord, OrchestratorError> {
        config.validate()?;
        if entity_ids.is_empty() {
            return Err(OrchestratorError::NoEntities);
        }
        let mut seen = HashSet::new();
        for id in entity_ids {
            if !seen.insert(id.as_str()) {
                return Err(OrchestratorError::DuplicateEntity(id.clone()));
            }
        }

        let run_id = Uuid::new_v4();
        let claim = self.active.try_claim(run_id, entity_ids).map_err(|e| {
            match &e {
                OrchestratorError::RunInProgress(busy) => {
                    warn!(busy = ?busy.entity_ids, "Rejected run: entities already active")
                }
                other => warn!(error = %other, "Could not claim entities"),
            }
            e
        })?;

        let log = match &self.runs_dir {
            Some(dir) => Some(Arc::new(
                EventStore::open(dir, run_id)
                    .await
                    .map_err(|e| TransientIoError::new("open run log", format!("{:#}", e)))?,
            )),
            None => None,
        };

        let run_start = Instant::now();
        let mut run = RunRecord::new(run_id, entity_ids.to_vec());
        info!(%run_id, "Starting pipeline run");

        if let Some(log) = &log {
            let started = Event::new(
                run_id,
                None,
                EventType::RunStarted,
                format!("Run started for {} entities", entity_ids.len()),
            )
            .with_entities(entity_ids.to_vec());
            log.append(&started)
                .await
                .map_err(|e| TransientIoError::new("write run log", format!("{:#}", e)))?;
        }

        let config = Arc::new(config.clone());
        let semaphore = Arc::new(Semaphore::new(config.max_workers));
        let mut workers = JoinSet::new();

        for entity_id in entity_ids {
            let worker = EntityWorker {
                run_id,
                report: EntityReport::new(entity_id.clone()),
                source: Arc::clone(&self.source),
                registry: Arc::clone(&self.registry),
                store: Arc::clone(&self.store),
                insight: self.insight.clone(),
                config: Arc::clone(&config),
                cancel: cancel.clone(),
                log: log.clone(),
            };
            let semaphore = Arc::clone(&semaphore);

            workers.spawn(async move {
                match semaphore.acquire_owned().await {
                    Ok(_permit) => worker.run().await,
                    Err(e) => {
                        worker
                            .finish(EntityStage::Failed(FailureReason::Internal {
                                detail: e.to_string(),
                            }))
                            .await
                    }
                }
            });
        }

        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(report) => {
                    claim.release(&report.entity_id);
                    run.record(report);
                }
                Err(e) => error!(%run_id, error = %e, "Entity worker crashed"),
            }
        }

        // Workers that crashed never reported back
        let crashed: Vec<String> = run
            .entities
            .values()
            .filter(|r| !r.stage.is_terminal())
            .map(|r| r.entity_id.clone())
            .collect();
        for entity_id in crashed {
            let mut report = EntityReport::new(entity_id.clone());
            report.stage = EntityStage::Failed(FailureReason::Internal {
                detail: "worker task crashed".to_string(),
            });
            report.finished_at = Some(Utc::now());
            emit(
                &log,
                Event::new(
                    run_id,
                    Some(entity_id),
                    EventType::EntityFinished,
                    "Worker crashed".to_string(),
                )
                .with_report(report.clone()),
            )
            .await;
            run.record(report);
        }

        let status = run.finalize(Utc::now());
        let duration_ms = run_start.elapsed().as_millis() as u64;
        let summary = run.summary();

        emit(
            &log,
            Event::new(
                run_id,
                None,
                EventType::RunCompleted,
                format!(
                    "Run finished: {} ({}/{} succeeded)",
                    status.as_str(),
                    summary.succeeded,
                    summary.total
                ),
            )
            .with_status(status)
            .with_duration(duration_ms),
        )
        .await;

        info!(
            %run_id,
            status = status.as_str(),
            succeeded = summary.succeeded,
            validation_failed = summary.validation_failed,
            training_failed = summary.training_failed,
            skipped = summary.skipped,
            failed = summary.failed,
            retries = summary.retries,
            duration_ms,
            "Pipeline run finished"
        );

        drop(claim);
        Ok(run)
    }

    /// Rebuild a run from its event log
    pub async fn get_run_status(&self, run_id: Uuid) -> Result<RunRecord> {
        let dir = self.runs_dir()?;
        if !dir.join(run_id.to_string()).exists() {
            anyhow::bail!("Run not found: {}", run_id);
        }
        let store = EventStore::open(dir, run_id).await?;
        store.load_run().await
    }

    /// Most recent runs first
    pub async fn list_runs(&self, limit: usize) -> Result<Vec<RunRecord>> {
        let dir = self.runs_dir()?;
        let mut runs = Vec::new();
        for run_id in EventStore::list_runs(dir).await? {
            let store = EventStore::open(dir, run_id).await?;
            match store.load_run().await {
                Ok(run) => runs.push(run),
                Err(e) => debug!(%run_id, error = %e, "Skipping unreadable run log"),
            }
        }
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(limit);
        Ok(runs)
    }

    fn runs_dir(&self) -> Result<&PathBuf> {
        self.runs_dir
            .as_ref()
            .context("Run logging is not configured")
    }
}

/// Append to the run log; a failed append is logged, never fatal
async fn emit(log: &Option<Arc<EventStore>>, event: Event) {
    if let Some(log) = log {
        if let Err(e) = log.append(&event).await {
            warn!(run_id = %event.run_id, error = %e, "Failed to append run event");
        }
    }
}

/// Failure of an I/O stage operation
enum StageError<E> {
    Op(E),
    TimedOut,
}

/// One entity's pass through the stage machine
struct EntityWorker {
    run_id: Uuid,
    report: EntityReport,
    source: Arc<dyn DataSource>,
    registry: Arc<ModelRegistry>,
    store: Arc<ForecastStore>,
    insight: Option<Arc<dyn InsightProvider>>,
    config: Arc<PipelineConfig>,
    cancel: CancelToken,
    log: Option<Arc<EventStore>>,
}

impl EntityWorker {
    async fn run(mut self) -> EntityReport {
        self.report.started_at = Some(Utc::now());
        let final_stage = match self.stages().await {
            Ok(()) => EntityStage::Done,
            Err(reason) => EntityStage::Failed(reason),
        };
        self.finish(final_stage).await
    }

    async fn finish(mut self, stage: EntityStage) -> EntityReport {
        let stage = match self.report.stage.transition(stage) {
            Ok(stage) => stage,
            Err(e) => EntityStage::Failed(FailureReason::Internal {
                detail: e.to_string(),
            }),
        };
        self.report.stage = stage;
        self.report.finished_at = Some(Utc::now());

        match self.report.failure() {
            None => info!(entity_id = %self.report.entity_id, "Entity done"),
            Some(reason) => warn!(entity_id = %self.report.entity_id, %reason, "Entity failed"),
        }

        let event = self
            .event(EventType::EntityFinished, format!("Finished in stage {}", self.report.stage.name()))
            .with_report(self.report.clone());
        let event = match self.report.failure() {
            Some(reason) => event.with_error(reason.to_string()),
            None => event,
        };
        emit(&self.log, event).await;
        self.report
    }

    async fn stages(&mut self) -> Result<(), FailureReason> {
        let now = Utc::now();

        self.enter(EntityStage::Validating).await?;
        let results = self.validate(now).await?;

        self.enter(EntityStage::Building).await?;
        let window = self.build(results).await?;

        self.enter(EntityStage::Training).await?;
        let model = self.train(window).await?;

        self.enter(EntityStage::Promoting).await?;
        self.promote(&model).await?;

        self.enter(EntityStage::Storing).await?;
        self.write_forecast(&model).await
    }

    fn entity_id(&self) -> &str {
        &self.report.entity_id
    }

    fn event(&self, event_type: EventType, summary: String) -> Event {
        Event::new(
            self.run_id,
            Some(self.report.entity_id.clone()),
            event_type,
            summary,
        )
    }

    /// Check cancellation, then move to the next stage
    async fn enter(&mut self, stage: EntityStage) -> Result<(), FailureReason> {
        if self.cancel.is_cancelled() {
            return Err(FailureReason::Cancelled);
        }
        self.report.stage = self
            .report
            .stage
            .transition(stage)
            .map_err(|e| FailureReason::Internal {
                detail: e.to_string(),
            })?;

        debug!(entity_id = %self.entity_id(), stage = self.report.stage.name(), "Entering stage");
        let event = self
            .event(EventType::StageEntered, format!("Entering {}", self.report.stage.name()))
            .with_stage(self.report.stage.clone());
        emit(&self.log, event).await;
        Ok(())
    }

    /// Run an I/O operation with a per-attempt timeout, retrying transient
    /// failures with backoff
    async fn retry_io<T, E, F, Fut>(
        &mut self,
        operation: &str,
        limit: Duration,
        mut op: F,
    ) -> Result<T, StageError<E>>
    where
        E: Transient + Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let policy: RetryPolicy = self.config.retry.clone();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let error = match tokio::time::timeout(limit, op()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) if e.is_transient() => {
                    if !policy.should_retry(attempt) {
                        return Err(StageError::Op(e));
                    }
                    e.to_string()
                }
                Ok(Err(e)) => return Err(StageError::Op(e)),
                Err(_) => {
                    if !policy.should_retry(attempt) {
                        return Err(StageError::TimedOut);
                    }
                    format!("timed out after {:?}", limit)
                }
            };

            let delay = policy.delay_for_attempt(attempt);
            self.report.retries += 1;
            warn!(
                entity_id = %self.entity_id(),
                operation,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Operation failed, retrying"
            );
            let event = self
                .event(
                    EventType::StageRetrying,
                    format!("{} failed, retrying in {:?}", operation, delay),
                )
                .with_attempt(attempt)
                .with_error(error);
            emit(&self.log, event).await;

            tokio::time::sleep(delay).await;
        }
    }

    /// Fetch and validate the entity's raw records
    async fn validate(&mut self, now: DateTime<Utc>) -> Result<Vec<ValidationResult>, FailureReason> {
        let source = Arc::clone(&self.source);
        let entity_id = self.entity_id().to_string();
        let range = TimeRange::trailing_days(now, self.config.lookback_days());

        let records = self
            .retry_io("fetch", self.config.timeouts.fetch(), || {
                let source = Arc::clone(&source);
                let entity_id = entity_id.clone();
                async move { source.fetch(&entity_id, range).await }
            })
            .await
            .map_err(|e| io_failure("fetch", e))?;

        let validator = Validator::new(self.config.validation.clone());
        let report = compute("validate", self.config.timeouts.validate_stage(), move || {
            validator.validate(&records, now)
        })
        .await?
        .map_err(|e| FailureReason::DataQuality {
            rejected: e.rejected,
            total: e.total,
        })?;

        self.report.validation = Some(report.summary);
        Ok(report.results)
    }

    async fn build(&mut self, results: Vec<ValidationResult>) -> Result<SeriesWindow, FailureReason> {
        let builder = FeatureBuilder::new(self.config.features.clone());
        let entity_id = self.entity_id().to_string();

        compute("build", self.config.timeouts.build(), move || {
            builder.build(&entity_id, &results)
        })
        .await?
        .map_err(|e| FailureReason::InsufficientData { detail: e.reason })
    }

    async fn train(&mut self, window: SeriesWindow) -> Result<TrainedModel, FailureReason> {
        let engine = ForecastEngine::new(self.config.engine.clone());

        let model = compute("train", self.config.timeouts.train(), move || engine.train(&window))
            .await?
            .map_err(|e| match e {
                TrainingError::TooFewObservations { .. } => FailureReason::InsufficientData {
                    detail: e.to_string(),
                },
                TrainingError::Degenerate { .. } => FailureReason::Training {
                    detail: e.to_string(),
                },
            })?;

        self.report.model_version = Some(model.version.clone());
        self.report.quality_score = Some(model.metrics.backtest_mape);
        Ok(model)
    }

    /// Register the candidate and apply the promotion policy
    async fn promote(&mut self, model: &TrainedModel) -> Result<(), FailureReason> {
        let artifact = model
            .to_artifact(Utc::now())
            .map_err(|e| FailureReason::Internal {
                detail: format!("serialize model state: {}", e),
            })?;
        let registry = Arc::clone(&self.registry);
        let limit = self.config.timeouts.promote();

        let stored = self
            .retry_io("store candidate", limit, || {
                let registry = Arc::clone(&registry);
                let artifact = artifact.clone();
                async move { registry.store(artifact).await }
            })
            .await;

        match stored {
            Ok(()) => {}
            Err(StageError::Op(RegistryError::Duplicate { .. })) => {
                // Same training window as an earlier run
                debug!(entity_id = %self.entity_id(), version = %model.version, "Reusing stored artifact");
            }
            Err(e) => return Err(registry_failure("store candidate", e)),
        }

        let tolerance = self.config.promotion.tolerance;
        let entity_id = self.entity_id().to_string();
        let version = model.version.clone();
        let decision = self
            .retry_io("promote", limit, || {
                let registry = Arc::clone(&registry);
                let entity_id = entity_id.clone();
                let version = version.clone();
                async move { registry.auto_promote(&entity_id, &version, tolerance).await }
            })
            .await;

        match decision {
            Ok(PromotionDecision::Held { .. }) => Err(FailureReason::HeldForReview { version }),
            Ok(_) => Ok(()),
            Err(StageError::Op(RegistryError::Retired { .. })) => {
                Err(FailureReason::RetiredVersion { version })
            }
            Err(e) => Err(registry_failure("promote", e)),
        }
    }

    /// Write the forecast of the promoted model, then narrate it
    async fn write_forecast(&mut self, model: &TrainedModel) -> Result<(), FailureReason> {
        let forecast = model.forecast(Utc::now());
        let summary = forecast.summary();
        let store = Arc::clone(&self.store);

        self.retry_io("write forecast", self.config.timeouts.store(), || {
            let store = Arc::clone(&store);
            let forecast = forecast.clone();
            async move { store.write(forecast).await }
        })
        .await
        .map_err(|e| io_failure("write forecast", e))?;

        if !self.config.insights_enabled {
            return Ok(());
        }
        if let Some(insight) = &self.insight {
            let narration =
                tokio::time::timeout(self.config.timeouts.store(), insight.narrate(&summary)).await;
            match narration {
                Ok(Ok(text)) => self.report.insight = Some(text),
                Ok(Err(e)) => {
                    warn!(entity_id = %self.entity_id(), provider = insight.name(), error = %e, "Insight generation failed")
                }
                Err(_) => {
                    warn!(entity_id = %self.entity_id(), provider = insight.name(), "Insight generation timed out")
                }
            }
        }
        Ok(())
    }
}

/// Run a compute stage on the blocking pool under a time limit
async fn compute<T, F>(stage: &str, limit: Duration, work: F) -> Result<T, FailureReason>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    match tokio::time::timeout(limit, tokio::task::spawn_blocking(work)).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(FailureReason::Internal {
            detail: format!("{} task failed: {}", stage, e),
        }),
        Err(_) => Err(FailureReason::Timeout {
            stage: stage.to_string(),
        }),
    }
}

fn io_failure<E: Display>(operation: &str, error: StageError<E>) -> FailureReason {
    match error {
        StageError::TimedOut => FailureReason::Timeout {
            stage: operation.to_string(),
        },
        StageError::Op(e) => FailureReason::Io {
            detail: format!("{}: {}", operation, e),
        },
    }
}

fn registry_failure(operation: &str, error: StageError<RegistryError>) -> FailureReason {
    match error {
        StageError::Op(e) if !e.is_transient() => FailureReason::Registry {
            detail: format!("{}: {}", operation, e),
        },
        other => io_failure(operation, other),
    }
}
