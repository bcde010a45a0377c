//! Pipeline Integration Tests
//!
//! End-to-end runs through the orchestrator: partial failures, data
//! quality aborts, retries, timeouts, cancellation, promotion holds and
//! mutual exclusion.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bi_forecast::adapters::{
    CsvDataSource, CsvSourceConfig, DataSource, InsightProvider, MemoryDataSource,
};
use bi_forecast::core::{
    CancelToken, ForecastStore, ModelRegistry, Orchestrator, PipelineConfig, StoreConfig,
};
use bi_forecast::domain::{
    EntityOutcome, EntityStage, FailureReason, ForecastSummary, ModelArtifact, PromotionStatus,
    RawRecord, RunStatus, TimeRange, TrainingMetrics,
};
use bi_forecast::error::{OrchestratorError, SourceError, StoreError, TransientIoError};
use chrono::{Duration, Utc};
use tempfile::TempDir;
use tokio::sync::Notify;

fn daily_records(entity: &str, days: i64) -> Vec<RawRecord> {
    let now = Utc::now();
    (0..days)
        .map(|d| RawRecord::new(entity, now - Duration::days(days - d), 100.0 + (d % 7) as f64 * 4.0))
        .collect()
}

fn ids(values: &[&str]) -> Vec<String> {
    values.iter().map(|s| s.to_string()).collect()
}

fn orchestrator(source: Arc<dyn DataSource>) -> Orchestrator {
    Orchestrator::new(
        source,
        Arc::new(ModelRegistry::in_memory()),
        Arc::new(ForecastStore::in_memory(StoreConfig::default())),
    )
}

fn fast_retry_config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.retry.initial_delay_ms = 5;
    config.retry.max_delay_ms = 20;
    config
}

#[tokio::test]
async fn test_short_history_skips_only_that_entity() {
    let mut records = daily_records("sku-long", 90);
    records.extend(daily_records("sku-short", 20));
    let orch = orchestrator(Arc::new(MemoryDataSource::from_records(records)));

    let run = orch
        .run_pipeline(&ids(&["sku-long", "sku-short"]), &PipelineConfig::default())
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::PartialSuccess);
    assert_eq!(run.entities["sku-long"].stage, EntityStage::Done);

    let short = &run.entities["sku-short"];
    assert!(matches!(
        short.stage,
        EntityStage::Failed(FailureReason::InsufficientData { .. })
    ));
    assert_eq!(short.outcome(), Some(EntityOutcome::Skipped));

    let forecast = orch.store().latest("sku-long").await.unwrap();
    assert_eq!(forecast.points.len(), 90);
    assert!(matches!(
        orch.store().latest("sku-short").await,
        Err(StoreError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_bad_batch_is_rejected_before_training() {
    let now = Utc::now();
    let records: Vec<RawRecord> = (0..100)
        .map(|d| {
            let value = if d % 5 < 2 { -5.0 } else { 100.0 };
            RawRecord::new("sku-q", now - Duration::days(100 - d), value)
        })
        .collect();
    let orch = orchestrator(Arc::new(MemoryDataSource::from_records(records)));

    let run = orch
        .run_pipeline(&ids(&["sku-q"]), &PipelineConfig::default())
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    let report = &run.entities["sku-q"];
    assert_eq!(
        report.stage,
        EntityStage::Failed(FailureReason::DataQuality {
            rejected: 40,
            total: 100
        })
    );
    assert_eq!(report.outcome(), Some(EntityOutcome::ValidationFailed));
    assert!(report.model_version.is_none());

    assert!(orch.registry().list("sku-q").await.is_empty());
    assert!(orch.store().latest("sku-q").await.is_err());
}

/// Fails the first `failures` fetches with a transient error
struct FlakySource {
    inner: MemoryDataSource,
    failures: u32,
    calls: AtomicU32,
}

#[async_trait]
impl DataSource for FlakySource {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn fetch(&self, entity_id: &str, range: TimeRange) -> Result<Vec<RawRecord>, SourceError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(SourceError::Io(TransientIoError::new("fetch", "connection reset")));
        }
        self.inner.fetch(entity_id, range).await
    }

    async fn entities(&self) -> Result<Vec<String>, SourceError> {
        self.inner.entities().await
    }
}

#[tokio::test]
async fn test_transient_fetch_errors_are_retried() {
    let source = Arc::new(FlakySource {
        inner: MemoryDataSource::from_records(daily_records("sku-1", 60)),
        failures: 2,
        calls: AtomicU32::new(0),
    });
    let orch = orchestrator(source.clone());

    let run = orch
        .run_pipeline(&ids(&["sku-1"]), &fast_retry_config())
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(run.entities["sku-1"].retries, 2);
    assert_eq!(run.retry_count, 2);
    assert_eq!(source.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_exhausted_retries_fail_the_entity() {
    let source = Arc::new(FlakySource {
        inner: MemoryDataSource::from_records(daily_records("sku-1", 60)),
        failures: u32::MAX,
        calls: AtomicU32::new(0),
    });
    let orch = orchestrator(source.clone());

    let run = orch
        .run_pipeline(&ids(&["sku-1"]), &fast_retry_config())
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    let report = &run.entities["sku-1"];
    assert!(matches!(report.stage, EntityStage::Failed(FailureReason::Io { .. })));
    assert_eq!(report.outcome(), Some(EntityOutcome::Failed));
    assert_eq!(report.retries, 2);
    assert_eq!(source.calls.load(Ordering::SeqCst), 3);
}

/// Blocks fetches of one entity until released
struct GatedSource {
    inner: MemoryDataSource,
    gated: String,
    started: Arc<Notify>,
    release: Arc<Notify>,
}

#[async_trait]
impl DataSource for GatedSource {
    fn name(&self) -> &str {
        "gated"
    }

    async fn fetch(&self, entity_id: &str, range: TimeRange) -> Result<Vec<RawRecord>, SourceError> {
        if entity_id == self.gated {
            self.started.notify_one();
            self.release.notified().await;
        }
        self.inner.fetch(entity_id, range).await
    }

    async fn entities(&self) -> Result<Vec<String>, SourceError> {
        self.inner.entities().await
    }
}

#[tokio::test]
async fn test_overlapping_runs_are_rejected() {
    let mut records = daily_records("sku-1", 60);
    records.extend(daily_records("sku-2", 60));
    let started = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let source = Arc::new(GatedSource {
        inner: MemoryDataSource::from_records(records),
        gated: "sku-1".to_string(),
        started: started.clone(),
        release: release.clone(),
    });
    let orch = Arc::new(orchestrator(source));

    let first = {
        let orch = orch.clone();
        tokio::spawn(async move {
            orch.run_pipeline(&ids(&["sku-1"]), &PipelineConfig::default())
                .await
        })
    };
    started.notified().await;
    assert!(orch.is_active("sku-1"));

    // Any overlap rejects the whole request
    match orch
        .run_pipeline(&ids(&["sku-2", "sku-1"]), &PipelineConfig::default())
        .await
    {
        Err(OrchestratorError::RunInProgress(e)) => assert_eq!(e.entity_ids, ids(&["sku-1"])),
        other => panic!("expected RunInProgress, got {:?}", other.map(|r| r.status)),
    }
    assert!(!orch.is_active("sku-2"));

    // Disjoint entities run alongside
    let other = orch
        .run_pipeline(&ids(&["sku-2"]), &PipelineConfig::default())
        .await
        .unwrap();
    assert_eq!(other.status, RunStatus::Success);

    release.notify_one();
    let first = first.await.unwrap().unwrap();
    assert_eq!(first.status, RunStatus::Success);
    assert!(!orch.is_active("sku-1"));

    // Claim released: sku-1 can run again
    release.notify_one();
    let again = orch
        .run_pipeline(&ids(&["sku-1"]), &PipelineConfig::default())
        .await
        .unwrap();
    assert_eq!(again.status, RunStatus::Success);
}

#[tokio::test]
async fn test_workers_are_bounded_but_all_entities_finish() {
    let entities: Vec<String> = (0..10).map(|i| format!("sku-{}", i)).collect();
    let records: Vec<RawRecord> = entities.iter().flat_map(|e| daily_records(e, 45)).collect();
    let orch = orchestrator(Arc::new(MemoryDataSource::from_records(records)));

    let mut config = PipelineConfig::default();
    config.max_workers = 2;
    let run = orch.run_pipeline(&entities, &config).await.unwrap();

    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(run.summary().succeeded, 10);
    assert_eq!(orch.store().entities().await, {
        let mut sorted = entities.clone();
        sorted.sort();
        sorted
    });
}

#[tokio::test]
async fn test_missing_fields_count_toward_rejection() {
    let now = Utc::now();
    let records: Vec<RawRecord> = (0..100)
        .map(|d| {
            let mut record = RawRecord::new("sku-m", now - Duration::days(100 - d), 100.0);
            match d % 5 {
                0 => record.timestamp = None,
                1 => record.value = None,
                _ => {}
            }
            record
        })
        .collect();
    let orch = orchestrator(Arc::new(MemoryDataSource::from_records(records)));

    let run = orch
        .run_pipeline(&ids(&["sku-m"]), &PipelineConfig::default())
        .await
        .unwrap();

    let report = &run.entities["sku-m"];
    assert_eq!(
        report.stage,
        EntityStage::Failed(FailureReason::DataQuality {
            rejected: 40,
            total: 100
        })
    );
    assert_eq!(report.outcome(), Some(EntityOutcome::ValidationFailed));
    assert!(orch.registry().list("sku-m").await.is_empty());
}

/// Stalls the first `slow_calls` fetches past the fetch timeout
struct SlowSource {
    inner: MemoryDataSource,
    slow_calls: u32,
    calls: AtomicU32,
}

#[async_trait]
impl DataSource for SlowSource {
    fn name(&self) -> &str {
        "slow"
    }

    async fn fetch(&self, entity_id: &str, range: TimeRange) -> Result<Vec<RawRecord>, SourceError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.slow_calls {
            tokio::time::sleep(std::time::Duration::from_millis(1500)).await;
        }
        self.inner.fetch(entity_id, range).await
    }

    async fn entities(&self) -> Result<Vec<String>, SourceError> {
        self.inner.entities().await
    }
}

#[tokio::test]
async fn test_fetch_timeouts_are_retried_then_fail() {
    let mut config = fast_retry_config();
    config.timeouts.fetch_seconds = 1;
    config.retry.max_attempts = 2;

    // One slow attempt, then a fast one
    let recovering = Arc::new(SlowSource {
        inner: MemoryDataSource::from_records(daily_records("sku-1", 60)),
        slow_calls: 1,
        calls: AtomicU32::new(0),
    });
    let run = orchestrator(recovering.clone())
        .run_pipeline(&ids(&["sku-1"]), &config)
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(run.entities["sku-1"].retries, 1);
    assert_eq!(recovering.calls.load(Ordering::SeqCst), 2);

    // Every attempt times out
    let stuck = Arc::new(SlowSource {
        inner: MemoryDataSource::from_records(daily_records("sku-1", 60)),
        slow_calls: u32::MAX,
        calls: AtomicU32::new(0),
    });
    let run = orchestrator(stuck.clone())
        .run_pipeline(&ids(&["sku-1"]), &config)
        .await
        .unwrap();
    let report = &run.entities["sku-1"];
    assert_eq!(
        report.stage,
        EntityStage::Failed(FailureReason::Timeout {
            stage: "fetch".to_string()
        })
    );
    assert_eq!(report.outcome(), Some(EntityOutcome::Failed));
    assert_eq!(report.retries, 1);
    assert_eq!(stuck.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_missing_data_file_is_not_retried() {
    let temp = TempDir::new().unwrap();
    let source = CsvDataSource::new(CsvSourceConfig::new(temp.path().join("absent.csv")));
    let orch = orchestrator(Arc::new(source));

    let run = orch
        .run_pipeline(&ids(&["sku-1"]), &fast_retry_config())
        .await
        .unwrap();

    let report = &run.entities["sku-1"];
    match &report.stage {
        EntityStage::Failed(FailureReason::Io { detail }) => assert!(detail.contains("not found")),
        other => panic!("expected Io failure, got {:?}", other),
    }
    assert_eq!(report.retries, 0);
}

#[tokio::test]
async fn test_cancel_mid_run_keeps_previous_model() {
    let registry = Arc::new(ModelRegistry::in_memory());
    let store = Arc::new(ForecastStore::in_memory(StoreConfig::default()));
    let records = daily_records("sku-1", 60);

    let first = Orchestrator::new(
        Arc::new(MemoryDataSource::from_records(records.clone())),
        registry.clone(),
        store.clone(),
    )
    .run_pipeline(&ids(&["sku-1"]), &PipelineConfig::default())
    .await
    .unwrap();
    assert_eq!(first.status, RunStatus::Success);
    let promoted = registry.get_promoted("sku-1").await.unwrap();
    let served = store.latest("sku-1").await.unwrap();

    let started = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let gated = Arc::new(GatedSource {
        inner: MemoryDataSource::from_records(records),
        gated: "sku-1".to_string(),
        started: started.clone(),
        release: release.clone(),
    });
    let orch = Arc::new(Orchestrator::new(gated, registry.clone(), store.clone()));
    let cancel = CancelToken::new();

    let run = {
        let orch = orch.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            orch.run_pipeline_with_cancel(&ids(&["sku-1"]), &PipelineConfig::default(), cancel)
                .await
        })
    };
    started.notified().await;
    cancel.cancel();
    release.notify_one();

    let run = run.await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    let report = &run.entities["sku-1"];
    assert_eq!(report.stage, EntityStage::Failed(FailureReason::Cancelled));
    assert!(report.model_version.is_none());
    assert!(!orch.is_active("sku-1"));

    // The earlier model and forecast are untouched
    assert_eq!(registry.get_promoted("sku-1").await.unwrap(), promoted);
    assert_eq!(registry.list("sku-1").await.len(), 1);
    assert_eq!(store.latest("sku-1").await.unwrap(), served);
}

/// Insight provider that is always down
struct FailingInsight;

#[async_trait]
impl InsightProvider for FailingInsight {
    fn name(&self) -> &str {
        "failing"
    }

    async fn narrate(&self, _summary: &ForecastSummary) -> anyhow::Result<String> {
        anyhow::bail!("provider unavailable")
    }
}

/// Insight provider that describes the horizon
struct HorizonInsight;

#[async_trait]
impl InsightProvider for HorizonInsight {
    fn name(&self) -> &str {
        "horizon"
    }

    async fn narrate(&self, summary: &ForecastSummary) -> anyhow::Result<String> {
        Ok(format!("{} days ahead for {}", summary.horizon, summary.entity_id))
    }
}

#[tokio::test]
async fn test_insight_failure_does_not_fail_the_entity() {
    let source = Arc::new(MemoryDataSource::from_records(daily_records("sku-1", 60)));

    let orch = orchestrator(source.clone()).with_insight(Arc::new(FailingInsight));
    let run = orch
        .run_pipeline(&ids(&["sku-1"]), &PipelineConfig::default())
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Success);
    let report = &run.entities["sku-1"];
    assert_eq!(report.stage, EntityStage::Done);
    assert!(report.insight.is_none());
    assert!(orch.store().latest("sku-1").await.is_ok());

    let orch = orchestrator(source).with_insight(Arc::new(HorizonInsight));
    let run = orch
        .run_pipeline(&ids(&["sku-1"]), &PipelineConfig::default())
        .await
        .unwrap();
    assert_eq!(
        run.entities["sku-1"].insight.as_deref(),
        Some("90 days ahead for sku-1")
    );
}

#[tokio::test]
async fn test_worse_candidate_is_held_for_review() {
    let now = Utc::now();
    // Irregular component a weekly model cannot fit
    let records: Vec<RawRecord> = (0..60)
        .map(|d| {
            let value = 100.0 + (d % 7) as f64 * 4.0 + ((d * 37) % 11) as f64 * 3.0;
            RawRecord::new("sku-1", now - Duration::days(60 - d), value)
        })
        .collect();
    let orch = orchestrator(Arc::new(MemoryDataSource::from_records(records)));

    // A perfect model is already serving
    let incumbent = ModelArtifact::candidate(
        "sku-1".to_string(),
        "incumbent".to_string(),
        "{}".to_string(),
        TrainingMetrics {
            backtest_mape: 0.0,
            residual_std: 0.0,
            observations: 60,
            holdout: 14,
        },
        7,
        now - Duration::days(1),
    );
    orch.registry().store(incumbent).await.unwrap();
    orch.registry().promote("sku-1", "incumbent").await.unwrap();

    let mut config = PipelineConfig::default();
    config.promotion.tolerance = 0.0;
    let run = orch.run_pipeline(&ids(&["sku-1"]), &config).await.unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    let report = &run.entities["sku-1"];
    let version = report.model_version.clone().unwrap();
    assert_eq!(
        report.stage,
        EntityStage::Failed(FailureReason::HeldForReview {
            version: version.clone()
        })
    );
    assert_eq!(report.outcome(), Some(EntityOutcome::Skipped));

    // Candidate stored, incumbent still promoted, nothing served
    let candidate = orch.registry().get("sku-1", &version).await.unwrap();
    assert_eq!(candidate.status, PromotionStatus::Candidate);
    assert_eq!(orch.registry().get_promoted("sku-1").await.unwrap().version, "incumbent");
    assert!(matches!(
        orch.store().latest("sku-1").await,
        Err(StoreError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_runs_sharing_a_lock_dir_exclude_each_other() {
    let temp = TempDir::new().unwrap();
    let locks = temp.path().join("locks");
    let records = daily_records("sku-1", 60);

    let started = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let gated = Arc::new(GatedSource {
        inner: MemoryDataSource::from_records(records.clone()),
        gated: "sku-1".to_string(),
        started: started.clone(),
        release: release.clone(),
    });
    // Separate orchestrators stand in for separate processes
    let first = Arc::new(orchestrator(gated).with_lock_dir(&locks));
    let second = orchestrator(Arc::new(MemoryDataSource::from_records(records))).with_lock_dir(&locks);

    let running = {
        let first = first.clone();
        tokio::spawn(async move {
            first
                .run_pipeline(&ids(&["sku-1"]), &PipelineConfig::default())
                .await
        })
    };
    started.notified().await;

    assert!(!second.is_active("sku-1"));
    match second
        .run_pipeline(&ids(&["sku-1"]), &PipelineConfig::default())
        .await
    {
        Err(OrchestratorError::RunInProgress(e)) => assert_eq!(e.entity_ids, ids(&["sku-1"])),
        other => panic!("expected RunInProgress, got {:?}", other.map(|r| r.status)),
    }

    release.notify_one();
    assert_eq!(running.await.unwrap().unwrap().status, RunStatus::Success);

    // Lock released with the run
    let after = second
        .run_pipeline(&ids(&["sku-1"]), &PipelineConfig::default())
        .await
        .unwrap();
    assert_eq!(after.status, RunStatus::Success);
}
