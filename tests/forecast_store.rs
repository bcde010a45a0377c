//! Forecast Store Integration Tests
//!
//! Latest-version serving, freshness, history and journal recovery.

use bi_forecast::core::{ForecastStore, StoreConfig};
use bi_forecast::domain::{ForecastPoint, ForecastResult, TimeRange};
use bi_forecast::error::StoreError;
use chrono::{DateTime, Duration, TimeZone, Utc};
use tempfile::TempDir;

fn at(day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, day, hour, 0, 0).unwrap()
}

fn forecast(entity: &str, generated_at: DateTime<Utc>, version: &str) -> ForecastResult {
    ForecastResult {
        entity_id: entity.to_string(),
        generated_at,
        model_version: version.to_string(),
        points: vec![ForecastPoint {
            timestamp: generated_at + Duration::days(1),
            point: 120.0,
            lower: 100.0,
            upper: 140.0,
        }],
        quality_score: 6.5,
        confidence_level: 0.95,
    }
}

#[tokio::test]
async fn test_latest_never_goes_backwards() {
    let store = ForecastStore::in_memory(StoreConfig::default());
    let now = at(10, 12);

    store.write_at(forecast("sku-1", at(10, 8), "v2"), now).await.unwrap();
    // An older forecast arriving late does not replace the newer one
    store.write_at(forecast("sku-1", at(9, 8), "v1"), now).await.unwrap();

    let latest = store.latest_at("sku-1", now).await.unwrap();
    assert_eq!(latest.model_version, "v2");

    store.write_at(forecast("sku-1", at(10, 11), "v3"), now).await.unwrap();
    assert_eq!(store.latest_at("sku-1", now).await.unwrap().model_version, "v3");
}

#[tokio::test]
async fn test_stale_forecast_is_reported() {
    let store = ForecastStore::in_memory(StoreConfig {
        freshness_sla_hours: 24,
        retention_days: 90,
    });
    store.write_at(forecast("sku-1", at(1, 0), "v1"), at(1, 0)).await.unwrap();

    assert!(store.latest_at("sku-1", at(1, 23)).await.is_ok());

    match store.latest_at("sku-1", at(3, 0)).await {
        Err(StoreError::Stale(e)) => {
            assert_eq!(e.entity_id, "sku-1");
            assert_eq!(e.age_seconds, 48 * 3600);
            assert_eq!(e.sla_seconds, 24 * 3600);
        }
        other => panic!("expected Stale, got {:?}", other),
    }
    assert!(matches!(
        store.latest_at("ghost", at(1, 0)).await,
        Err(StoreError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_history_is_filtered_and_ordered() {
    let store = ForecastStore::in_memory(StoreConfig::default());
    let now = at(20, 0);
    for (day, version) in [(12, "c"), (5, "a"), (8, "b")] {
        store.write_at(forecast("sku-1", at(day, 0), version), now).await.unwrap();
    }

    let history = store.history("sku-1", TimeRange::new(at(6, 0), at(20, 0))).await;
    let versions: Vec<&str> = history.iter().map(|f| f.model_version.as_str()).collect();
    assert_eq!(versions, vec!["b", "c"]);

    let all = store.history("sku-1", TimeRange::all()).await;
    assert_eq!(all.iter().count(), 3);
    assert_eq!(store.history("ghost", TimeRange::all()).await.iter().count(), 0);
}

#[tokio::test]
async fn test_journal_survives_restart() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("forecasts").join("forecasts.jsonl");
    let config = StoreConfig {
        freshness_sla_hours: 48,
        retention_days: 3,
    };
    let now = at(10, 0);

    {
        let store = ForecastStore::open(&path, config.clone()).await.unwrap();
        store.write_at(forecast("sku-1", at(2, 0), "old"), now).await.unwrap();
        store.write_at(forecast("sku-1", at(9, 0), "new"), now).await.unwrap();
        store.write_at(forecast("sku-2", at(9, 12), "x"), now).await.unwrap();
    }

    let store = ForecastStore::open(&path, config).await.unwrap();
    assert_eq!(store.entities().await, vec!["sku-1".to_string(), "sku-2".to_string()]);
    assert_eq!(store.latest_at("sku-1", now).await.unwrap().model_version, "new");

    // The expired version was pruned and stays pruned after replay
    let history = store.history("sku-1", TimeRange::all()).await;
    let versions: Vec<&str> = history.iter().map(|f| f.model_version.as_str()).collect();
    assert_eq!(versions, vec!["new"]);
}

#[tokio::test]
async fn test_writes_after_torn_tail_survive_restart() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("forecasts.jsonl");
    let config = StoreConfig::default();
    let now = at(10, 0);

    {
        let store = ForecastStore::open(&path, config.clone()).await.unwrap();
        store.write_at(forecast("sku-1", at(8, 0), "v1"), now).await.unwrap();
    }

    // Crash in the middle of an append
    let mut raw = std::fs::read_to_string(&path).unwrap();
    raw.push_str("{\"op\":\"written\",\"forec");
    std::fs::write(&path, raw).unwrap();

    {
        let store = ForecastStore::open(&path, config.clone()).await.unwrap();
        assert_eq!(store.latest_at("sku-1", now).await.unwrap().model_version, "v1");
        store.write_at(forecast("sku-1", at(9, 0), "v2"), now).await.unwrap();
        store.write_at(forecast("sku-1", at(9, 12), "v3"), now).await.unwrap();
    }

    let store = ForecastStore::open(&path, config).await.unwrap();
    assert_eq!(store.latest_at("sku-1", now).await.unwrap().model_version, "v3");
    let history = store.history("sku-1", TimeRange::all()).await;
    let versions: Vec<&str> = history.iter().map(|f| f.model_version.as_str()).collect();
    assert_eq!(versions, vec!["v1", "v2", "v3"]);
}
