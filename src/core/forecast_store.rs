//! Versioned forecast store.
//!
//! Every write appends a new immutable version. Readers get the most recent
//! version by generation time, and never silently stale data.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument};

use super::journal::Journal;
use crate::domain::{ForecastResult, TimeRange};
use crate::error::{NotFoundError, StaleDataError, StoreError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// `latest` fails as stale beyond this age (default: 48)
    #[serde(default = "default_freshness_sla_hours")]
    pub freshness_sla_hours: i64,

    /// Versions older than this are pruned on write, except the latest
    /// (default: 90)
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
}

fn default_freshness_sla_hours() -> i64 {
    48
}
fn default_retention_days() -> i64 {
    90
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            freshness_sla_hours: default_freshness_sla_hours(),
            retention_days: default_retention_days(),
        }
    }
}

impl StoreConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.freshness_sla_hours <= 0 {
            return Err("freshness_sla_hours must be positive".to_string());
        }
        if self.retention_days <= 0 {
            return Err("retention_days must be positive".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum StoreEntry {
    Written { forecast: ForecastResult },
    Pruned { entity_id: String, cutoff: DateTime<Utc> },
}

#[derive(Debug, Default)]
struct StoreState {
    /// Versions per entity in write order
    forecasts: HashMap<String, Vec<Arc<ForecastResult>>>,
}

impl StoreState {
    /// Index of the latest version: max generated_at, ties to the last written
    fn latest_index(versions: &[Arc<ForecastResult>]) -> Option<usize> {
        versions
            .iter()
            .enumerate()
            .max_by(|(i, a), (j, b)| a.generated_at.cmp(&b.generated_at).then(i.cmp(j)))
            .map(|(idx, _)| idx)
    }

    fn latest(&self, entity_id: &str) -> Option<&Arc<ForecastResult>> {
        let versions = self.forecasts.get(entity_id)?;
        Self::latest_index(versions).map(|idx| &versions[idx])
    }

    /// Versions that a prune at `cutoff` would remove
    fn prunable(&self, entity_id: &str, cutoff: DateTime<Utc>) -> usize {
        let Some(versions) = self.forecasts.get(entity_id) else {
            return 0;
        };
        let latest = Self::latest_index(versions);
        versions
            .iter()
            .enumerate()
            .filter(|(idx, f)| Some(*idx) != latest && f.generated_at < cutoff)
            .count()
    }

    /// Same entity, model version and generation time
    fn contains(&self, forecast: &ForecastResult) -> bool {
        self.forecasts.get(&forecast.entity_id).is_some_and(|versions| {
            versions.iter().any(|f| {
                f.model_version == forecast.model_version && f.generated_at == forecast.generated_at
            })
        })
    }

    fn apply(&mut self, entry: StoreEntry) {
        match entry {
            StoreEntry::Written { forecast } => {
                if self.contains(&forecast) {
                    return;
                }
                self.forecasts
                    .entry(forecast.entity_id.clone())
                    .or_default()
                    .push(Arc::new(forecast));
            }
            StoreEntry::Pruned { entity_id, cutoff } => {
                if let Some(versions) = self.forecasts.get_mut(&entity_id) {
                    let latest = Self::latest_index(versions);
                    let mut idx = 0;
                    versions.retain(|f| {
                        let keep = Some(idx) == latest || f.generated_at >= cutoff;
                        idx += 1;
                        keep
                    });
                }
            }
        }
    }
}

/// Persists forecast versions and serves the latest valid one
#[derive(Debug)]
pub struct ForecastStore {
    config: StoreConfig,
    state: RwLock<StoreState>,
    journal: Option<Journal<StoreEntry>>,
}

impl ForecastStore {
    pub fn in_memory(config: StoreConfig) -> Self {
        Self {
            config,
            state: RwLock::new(StoreState::default()),
            journal: None,
        }
    }

    /// Open a journaled store, replaying existing entries
    pub async fn open(path: impl Into<PathBuf>, config: StoreConfig) -> Result<Self, StoreError> {
        let journal = Journal::open(path).await?;
        let mut state = StoreState::default();
        for entry in journal.replay().await? {
            state.apply(entry);
        }
        Ok(Self {
            config,
            state: RwLock::new(state),
            journal: Some(journal),
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    async fn record(&self, entry: &StoreEntry) -> Result<(), StoreError> {
        if let Some(journal) = &self.journal {
            journal.append(entry).await?;
        }
        Ok(())
    }

    pub async fn write(&self, forecast: ForecastResult) -> Result<(), StoreError> {
        self.write_at(forecast, Utc::now()).await
    }

    /// Append a version and prune expired ones as of `now`
    #[instrument(skip(self, forecast, now), fields(entity_id = %forecast.entity_id, version = %forecast.model_version))]
    pub async fn write_at(
        &self,
        forecast: ForecastResult,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let entity_id = forecast.entity_id.clone();
        let mut state = self.state.write().await;

        if state.contains(&forecast) {
            debug!("Forecast version already stored");
            return Ok(());
        }

        let entry = StoreEntry::Written { forecast };
        self.record(&entry).await?;
        state.apply(entry);
        info!("Wrote forecast version");

        let cutoff = now - Duration::days(self.config.retention_days);
        let prunable = state.prunable(&entity_id, cutoff);
        if prunable > 0 {
            let entry = StoreEntry::Pruned {
                entity_id: entity_id.clone(),
                cutoff,
            };
            self.record(&entry).await?;
            state.apply(entry);
            debug!(pruned = prunable, "Pruned expired forecast versions");
        }
        Ok(())
    }

    pub async fn latest(&self, entity_id: &str) -> Result<ForecastResult, StoreError> {
        self.latest_at(entity_id, Utc::now()).await
    }

    /// Most recent version, or `Stale` when older than the freshness SLA
    pub async fn latest_at(
        &self,
        entity_id: &str,
        now: DateTime<Utc>,
    ) -> Result<ForecastResult, StoreError> {
        let state = self.state.read().await;
        let latest = state.latest(entity_id).ok_or_else(|| {
            StoreError::NotFound(NotFoundError {
                kind: "forecast",
                key: entity_id.to_string(),
            })
        })?;

        let age = latest.age(now);
        let sla = Duration::hours(self.config.freshness_sla_hours);
        if age > sla {
            return Err(StoreError::Stale(StaleDataError {
                entity_id: entity_id.to_string(),
                generated_at: latest.generated_at,
                age_seconds: age.num_seconds(),
                sla_seconds: sla.num_seconds(),
            }));
        }
        Ok(latest.as_ref().clone())
    }

    /// Versions generated within `range`, oldest first
    pub async fn history(&self, entity_id: &str, range: TimeRange) -> ForecastHistory {
        let state = self.state.read().await;
        let mut versions: Vec<Arc<ForecastResult>> =
            state.forecasts.get(entity_id).cloned().unwrap_or_default();
        versions.sort_by_key(|f| f.generated_at);
        ForecastHistory {
            versions: versions.into(),
            range,
        }
    }

    /// Entities with at least one stored version, sorted
    pub async fn entities(&self) -> Vec<String> {
        let mut entities: Vec<String> = self.state.read().await.forecasts.keys().cloned().collect();
        entities.sort();
        entities
    }
}

/// Snapshot of one entity's versions, filtered lazily by time range.
///
/// Iterating does not touch the store; call `iter` again to restart.
#[derive(Debug, Clone)]
pub struct ForecastHistory {
    versions: Arc<[Arc<ForecastResult>]>,
    range: TimeRange,
}

impl ForecastHistory {
    pub fn iter(&self) -> impl Iterator<Item = &ForecastResult> + '_ {
        self.versions
            .iter()
            .map(|f| f.as_ref())
            .filter(move |f| self.range.contains(f.generated_at))
    }

    pub fn range(&self) -> TimeRange {
        self.range
    }
}

impl<'a> IntoIterator for &'a ForecastHistory {
    type Item = &'a ForecastResult;
    type IntoIter = Box<dyn Iterator<Item = &'a ForecastResult> + 'a>;

    fn into_iter(self) -> Self::IntoIter {
        Box::new(self.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
    }

    fn forecast(entity: &str, generated_at: DateTime<Utc>, version: &str) -> ForecastResult {
        ForecastResult {
            entity_id: entity.to_string(),
            generated_at,
            model_version: version.to_string(),
            points: Vec::new(),
            quality_score: 5.0,
            confidence_level: 0.95,
        }
    }

    #[tokio::test]
    async fn test_latest_by_generation_time() {
        let store = ForecastStore::in_memory(StoreConfig::default());
        let now = t0();

        store.write_at(forecast("sku-1", now - Duration::hours(2), "v1"), now).await.unwrap();
        store.write_at(forecast("sku-1", now - Duration::hours(1), "v2"), now).await.unwrap();
        // written later but generated earlier
        store.write_at(forecast("sku-1", now - Duration::hours(3), "v0"), now).await.unwrap();

        assert_eq!(store.latest_at("sku-1", now).await.unwrap().model_version, "v2");

        // ties go to the last written
        store.write_at(forecast("sku-1", now - Duration::hours(1), "v3"), now).await.unwrap();
        assert_eq!(store.latest_at("sku-1", now).await.unwrap().model_version, "v3");
    }

    #[tokio::test]
    async fn test_repeated_write_is_stored_once() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("forecasts.jsonl");
        let now = t0();

        let store = ForecastStore::open(&path, StoreConfig::default()).await.unwrap();
        let first = forecast("sku-1", now - Duration::hours(1), "v1");
        store.write_at(first.clone(), now).await.unwrap();
        // a retried write after an ambiguous failure
        store.write_at(first.clone(), now).await.unwrap();

        assert_eq!(store.history("sku-1", TimeRange::all()).await.iter().count(), 1);
        let raw = std::fs::read_to_string(&path).unwrap();
        assert_eq!(raw.lines().count(), 1);

        // a duplicate already in the journal replays as one version
        std::fs::write(&path, format!("{}{}", raw, raw)).unwrap();
        let reopened = ForecastStore::open(&path, StoreConfig::default()).await.unwrap();
        assert_eq!(reopened.history("sku-1", TimeRange::all()).await.iter().count(), 1);

        // a new generation of the same model version is a new entry
        store.write_at(forecast("sku-1", now, "v1"), now).await.unwrap();
        assert_eq!(store.history("sku-1", TimeRange::all()).await.iter().count(), 2);
    }

    #[tokio::test]
    async fn test_latest_not_found_and_stale() {
        let store = ForecastStore::in_memory(StoreConfig::default());
        assert!(matches!(
            store.latest_at("sku-1", t0()).await,
            Err(StoreError::NotFound(_))
        ));

        store.write_at(forecast("sku-1", t0(), "v1"), t0()).await.unwrap();
        assert!(store.latest_at("sku-1", t0() + Duration::hours(48)).await.is_ok());

        match store.latest_at("sku-1", t0() + Duration::hours(49)).await {
            Err(StoreError::Stale(err)) => {
                assert_eq!(err.age_seconds, 49 * 3600);
                assert_eq!(err.sla_seconds, 48 * 3600);
            }
            other => panic!("expected stale, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_retention_keeps_latest() {
        let store = ForecastStore::in_memory(StoreConfig {
            retention_days: 10,
            ..Default::default()
        });
        let now = t0();
        store.write_at(forecast("sku-1", now - Duration::days(30), "old"), now).await.unwrap();
        // the only version is kept even though it is expired
        assert_eq!(store.history("sku-1", TimeRange::all()).await.iter().count(), 1);

        store.write_at(forecast("sku-1", now - Duration::days(20), "older"), now).await.unwrap();
        store.write_at(forecast("sku-1", now - Duration::days(1), "fresh"), now).await.unwrap();

        let history = store.history("sku-1", TimeRange::all()).await;
        let versions: Vec<&str> = history.iter().map(|f| f.model_version.as_str()).collect();
        assert_eq!(versions, vec!["fresh"]);
    }

    #[tokio::test]
    async fn test_history_is_restartable_snapshot() {
        let store = ForecastStore::in_memory(StoreConfig::default());
        let now = t0();
        for d in 0..5 {
            store
                .write_at(forecast("sku-1", now - Duration::days(d), &format!("v{}", d)), now)
                .await
                .unwrap();
        }

        let range = TimeRange::new(now - Duration::days(3), now);
        let history = store.history("sku-1", range).await;
        let first: Vec<String> = history.iter().map(|f| f.model_version.clone()).collect();
        assert_eq!(first, vec!["v3", "v2", "v1"]);

        // later writes do not affect the snapshot
        store.write_at(forecast("sku-1", now - Duration::hours(1), "v9"), now).await.unwrap();
        let second: Vec<String> = (&history).into_iter().map(|f| f.model_version.clone()).collect();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_journal_replay() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("forecasts/forecasts.jsonl");
        let config = StoreConfig {
            retention_days: 10,
            ..Default::default()
        };
        let now = t0();

        {
            let store = ForecastStore::open(&path, config.clone()).await.unwrap();
            store.write_at(forecast("sku-1", now - Duration::days(20), "v1"), now).await.unwrap();
            store.write_at(forecast("sku-1", now, "v2"), now).await.unwrap();
            store.write_at(forecast("sku-2", now, "v1"), now).await.unwrap();
        }

        let reopened = ForecastStore::open(&path, config).await.unwrap();
        assert_eq!(reopened.latest_at("sku-1", now).await.unwrap().model_version, "v2");
        assert_eq!(reopened.history("sku-1", TimeRange::all()).await.iter().count(), 1);
        assert_eq!(reopened.entities().await, vec!["sku-1", "sku-2"]);
    }
}
