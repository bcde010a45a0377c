//! Forecast engine: damped additive Holt-Winters per series.
//!
//! Smoothing parameters come from a seeded random search, so training is a
//! pure function of the window and the seed. The fitted state is serialized
//! into the model artifact and forecasts can be regenerated from it.

use chrono::{DateTime, Duration, Utc};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};
use tracing::{debug, instrument};

use crate::domain::{ForecastPoint, ForecastResult, ModelArtifact, SeriesWindow, TrainingMetrics};
use crate::error::TrainingError;

/// Smoothing candidate tried before the random draws
const BASELINE: SmoothingParams = SmoothingParams {
    alpha: 0.3,
    beta: 0.1,
    gamma: 0.1,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Fewer points than this fail training (default: 30)
    #[serde(default = "default_min_observations")]
    pub min_observations: usize,

    /// Periods forecast ahead (default: 90)
    #[serde(default = "default_horizon_periods")]
    pub horizon_periods: usize,

    /// Interval coverage (default: 0.95)
    #[serde(default = "default_confidence_level")]
    pub confidence_level: f64,

    /// Seasonal period in buckets (default: 7, weekly on daily data)
    #[serde(default = "default_season_length")]
    pub season_length: Option<usize>,

    /// Trend damping factor phi (default: 0.98)
    #[serde(default = "default_damping")]
    pub damping: f64,

    /// Random parameter draws (default: 48)
    #[serde(default = "default_search_iterations")]
    pub search_iterations: usize,

    /// Seed for the parameter search (default: 42)
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Trailing points held out for the backtest (default: 14)
    #[serde(default = "default_backtest_holdout")]
    pub backtest_holdout: usize,
}

fn default_min_observations() -> usize {
    30
}
fn default_horizon_periods() -> usize {
    90
}
fn default_confidence_level() -> f64 {
    0.95
}
fn default_season_length() -> Option<usize> {
    Some(7)
}
fn default_damping() -> f64 {
    0.98
}
fn default_search_iterations() -> usize {
    48
}
fn default_seed() -> u64 {
    42
}
fn default_backtest_holdout() -> usize {
    14
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            min_observations: default_min_observations(),
            horizon_periods: default_horizon_periods(),
            confidence_level: default_confidence_level(),
            season_length: default_season_length(),
            damping: default_damping(),
            search_iterations: default_search_iterations(),
            seed: default_seed(),
            backtest_holdout: default_backtest_holdout(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !(self.confidence_level > 0.0 && self.confidence_level < 1.0) {
            return Err(format!(
                "confidence_level must be within (0, 1), got {}",
                self.confidence_level
            ));
        }
        if !(self.damping > 0.0 && self.damping <= 1.0) {
            return Err(format!("damping must be within (0, 1], got {}", self.damping));
        }
        if self.horizon_periods == 0 {
            return Err("horizon_periods must be at least 1".to_string());
        }
        if self.min_observations < 4 {
            return Err("min_observations must be at least 4".to_string());
        }
        if matches!(self.season_length, Some(m) if m < 2) {
            return Err("season_length must be at least 2".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SmoothingParams {
    pub alpha: f64,
    pub beta: f64,
    pub gamma: f64,
}

/// Fitted Holt-Winters state, stored as the artifact's model state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelState {
    pub params: SmoothingParams,
    pub damping: f64,
    pub level: f64,
    pub trend: f64,

    /// Seasonal components, empty when seasonality is disabled
    pub seasonal: Vec<f64>,

    /// Points the state was fitted on
    pub observations: usize,

    pub residual_std: f64,
    pub last_timestamp: DateTime<Utc>,
    pub frequency_seconds: i64,
}

impl ModelState {
    /// Point forecast `h` periods after the last observation
    fn point(&self, h: usize) -> f64 {
        let damped: f64 = (1..=h).map(|i| self.damping.powi(i as i32)).sum();
        let seasonal = if self.seasonal.is_empty() {
            0.0
        } else {
            self.seasonal[(self.observations + h - 1) % self.seasonal.len()]
        };
        self.level + damped * self.trend + seasonal
    }
}

/// A fitted model ready to forecast
#[derive(Debug, Clone, PartialEq)]
pub struct TrainedModel {
    pub entity_id: String,
    pub version: String,
    pub state: ModelState,
    pub metrics: TrainingMetrics,
    pub seed: u64,
    horizon_periods: usize,
    confidence_level: f64,
}

impl TrainedModel {
    /// Rebuild a model from a stored artifact
    pub fn from_artifact(
        artifact: &ModelArtifact,
        config: &EngineConfig,
    ) -> Result<Self, TrainingError> {
        let state: ModelState =
            serde_json::from_str(&artifact.state).map_err(|e| TrainingError::Degenerate {
                entity_id: artifact.entity_id.clone(),
                reason: format!("unreadable model state: {}", e),
            })?;
        Ok(Self {
            entity_id: artifact.entity_id.clone(),
            version: artifact.version.clone(),
            state,
            metrics: artifact.metrics,
            seed: artifact.seed,
            horizon_periods: config.horizon_periods,
            confidence_level: config.confidence_level,
        })
    }

    /// Candidate artifact for the registry
    pub fn to_artifact(&self, created_at: DateTime<Utc>) -> Result<ModelArtifact, serde_json::Error> {
        Ok(ModelArtifact::candidate(
            self.entity_id.clone(),
            self.version.clone(),
            serde_json::to_string(&self.state)?,
            self.metrics,
            self.seed,
            created_at,
        ))
    }

    /// Forecast `horizon_periods` ahead with symmetric normal intervals
    pub fn forecast(&self, generated_at: DateTime<Utc>) -> ForecastResult {
        let z = z_score(self.confidence_level);
        let step = Duration::seconds(self.state.frequency_seconds);

        let points = (1..=self.horizon_periods)
            .map(|h| {
                let point = self.state.point(h);
                let half_width = z * self.state.residual_std * (h as f64).sqrt();
                ForecastPoint {
                    timestamp: self.state.last_timestamp + step * h as i32,
                    point: point.max(0.0),
                    lower: (point - half_width).max(0.0),
                    upper: (point + half_width).max(0.0),
                }
            })
            .collect();

        ForecastResult {
            entity_id: self.entity_id.clone(),
            generated_at,
            model_version: self.version.clone(),
            points,
            quality_score: self.metrics.backtest_mape,
            confidence_level: self.confidence_level,
        }
    }
}

/// Two-sided standard normal quantile
fn z_score(confidence_level: f64) -> f64 {
    match Normal::new(0.0, 1.0) {
        Ok(normal) => normal.inverse_cdf(0.5 + confidence_level / 2.0),
        Err(_) => 1.96,
    }
}

struct Fit {
    level: f64,
    trend: f64,
    seasonal: Vec<f64>,
    sse: f64,
    residuals: usize,
}

/// Run the smoothing recursions over `values`
fn fit(values: &[f64], params: SmoothingParams, damping: f64, season: Option<usize>) -> Fit {
    let SmoothingParams { alpha, beta, gamma } = params;

    let (mut level, mut trend, mut seasonal, start) = match season {
        Some(m) => {
            let first = mean(&values[..m]);
            let second = mean(&values[m..2 * m]);
            let seasonal: Vec<f64> = values[..m].iter().map(|v| v - first).collect();
            (first, (second - first) / m as f64, seasonal, 0)
        }
        None => {
            let trend = values.get(1).map(|v| v - values[0]).unwrap_or(0.0);
            (values[0], trend, Vec::new(), 1)
        }
    };

    let mut sse = 0.0;
    let mut residuals = 0;
    for (t, &y) in values.iter().enumerate().skip(start) {
        let s = if seasonal.is_empty() { 0.0 } else { seasonal[t % seasonal.len()] };
        let predicted = level + damping * trend + s;
        sse += (y - predicted).powi(2);
        residuals += 1;

        let previous_level = level;
        level = alpha * (y - s) + (1.0 - alpha) * (level + damping * trend);
        trend = beta * (level - previous_level) + (1.0 - beta) * damping * trend;
        if !seasonal.is_empty() {
            let idx = t % seasonal.len();
            seasonal[idx] = gamma * (y - level) + (1.0 - gamma) * seasonal[idx];
        }
    }

    Fit {
        level,
        trend,
        seasonal,
        sse,
        residuals,
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Trains models from series windows
#[derive(Debug, Clone, Default)]
pub struct ForecastEngine {
    config: EngineConfig,
}

impl ForecastEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Fit a model on the full window and score it with a holdout backtest
    #[instrument(skip(self, window), fields(entity_id = %window.entity_id, points = window.len()))]
    pub fn train(&self, window: &SeriesWindow) -> Result<TrainedModel, TrainingError> {
        let n = window.len();
        if n < self.config.min_observations {
            return Err(TrainingError::TooFewObservations {
                entity_id: window.entity_id.clone(),
                have: n,
                need: self.config.min_observations,
            });
        }

        let values = window.values();
        let last_timestamp = match window.last() {
            Some(point) => point.timestamp,
            None => {
                return Err(TrainingError::TooFewObservations {
                    entity_id: window.entity_id.clone(),
                    have: 0,
                    need: self.config.min_observations,
                })
            }
        };

        let (params, season) = self.search(&window.entity_id, &values)?;
        let full = fit(&values, params, self.config.damping, season);
        let residual_std = (full.sse / full.residuals.max(1) as f64).sqrt();

        let backtest_mape = self.backtest(&window.entity_id, &values)?;
        let holdout = self.holdout_len(n);

        let state = ModelState {
            params,
            damping: self.config.damping,
            level: full.level,
            trend: full.trend,
            seasonal: full.seasonal,
            observations: n,
            residual_std,
            last_timestamp,
            frequency_seconds: window.frequency_seconds,
        };

        let finite = state.level.is_finite()
            && state.trend.is_finite()
            && state.residual_std.is_finite()
            && backtest_mape.is_finite()
            && state.seasonal.iter().all(|s| s.is_finite());
        if !finite {
            return Err(TrainingError::Degenerate {
                entity_id: window.entity_id.clone(),
                reason: "non-finite model state".to_string(),
            });
        }

        debug!(
            alpha = params.alpha,
            beta = params.beta,
            gamma = params.gamma,
            seasonal = season.is_some(),
            backtest_mape,
            residual_std,
            "Trained model"
        );

        Ok(TrainedModel {
            entity_id: window.entity_id.clone(),
            version: window.version(),
            state,
            metrics: TrainingMetrics {
                backtest_mape,
                residual_std,
                observations: n,
                holdout,
            },
            seed: self.config.seed,
            horizon_periods: self.config.horizon_periods,
            confidence_level: self.config.confidence_level,
        })
    }

    fn season_for(&self, n: usize) -> Option<usize> {
        self.config.season_length.filter(|m| *m >= 2 && n >= 2 * m)
    }

    fn holdout_len(&self, n: usize) -> usize {
        self.config.backtest_holdout.min(n / 2)
    }

    /// Pick the smoothing parameters with the lowest one-step squared error
    fn search(
        &self,
        entity_id: &str,
        values: &[f64],
    ) -> Result<(SmoothingParams, Option<usize>), TrainingError> {
        let season = self.season_for(values.len());
        let mut rng = ChaCha8Rng::seed_from_u64(self.config.seed);

        let candidates = std::iter::once(BASELINE).chain(
            (0..self.config.search_iterations)
                .map(|_| SmoothingParams {
                    alpha: rng.gen_range(0.01..0.99),
                    beta: rng.gen_range(0.01..0.5),
                    gamma: rng.gen_range(0.01..0.99),
                })
                .collect::<Vec<_>>(),
        );

        let mut best: Option<(SmoothingParams, f64)> = None;
        for params in candidates {
            let sse = fit(values, params, self.config.damping, season).sse;
            if !sse.is_finite() {
                continue;
            }
            if best.map_or(true, |(_, best_sse)| sse < best_sse) {
                best = Some((params, sse));
            }
        }

        match best {
            Some((params, _)) => Ok((params, season)),
            None => Err(TrainingError::Degenerate {
                entity_id: entity_id.to_string(),
                reason: "no smoothing parameters produced a finite fit".to_string(),
            }),
        }
    }

    /// MAPE (percent) of a refit on all but the trailing holdout
    fn backtest(&self, entity_id: &str, values: &[f64]) -> Result<f64, TrainingError> {
        let holdout = self.holdout_len(values.len());
        if holdout == 0 {
            return Ok(0.0);
        }
        let (train, actual) = values.split_at(values.len() - holdout);

        let (params, season) = self.search(entity_id, train)?;
        let fitted = fit(train, params, self.config.damping, season);
        let state = ModelState {
            params,
            damping: self.config.damping,
            level: fitted.level,
            trend: fitted.trend,
            seasonal: fitted.seasonal,
            observations: train.len(),
            residual_std: 0.0,
            last_timestamp: DateTime::<Utc>::MIN_UTC,
            frequency_seconds: 0,
        };

        let predicted: Vec<f64> = (1..=holdout).map(|h| state.point(h).max(0.0)).collect();
        Ok(mape(actual, &predicted, train))
    }
}

/// Mean absolute percentage error over non-zero actuals.
///
/// When every actual is zero the mean absolute error is scaled by the mean
/// absolute training value instead.
fn mape(actual: &[f64], predicted: &[f64], train: &[f64]) -> f64 {
    let pairs: Vec<(f64, f64)> = actual
        .iter()
        .zip(predicted)
        .filter(|(a, _)| **a != 0.0)
        .map(|(a, p)| (*a, *p))
        .collect();

    if !pairs.is_empty() {
        let total: f64 = pairs.iter().map(|(a, p)| ((a - p) / a).abs()).sum();
        return 100.0 * total / pairs.len() as f64;
    }

    let scale = mean(&train.iter().map(|v| v.abs()).collect::<Vec<_>>());
    if scale == 0.0 {
        return 0.0;
    }
    let mae = mean(
        &actual
            .iter()
            .zip(predicted)
            .map(|(a, p)| (a - p).abs())
            .collect::<Vec<_>>(),
    );
    100.0 * mae / scale
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::SeriesPoint;
    use chrono::TimeZone;

    fn window(values: &[f64]) -> SeriesWindow {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        SeriesWindow::from_points(
            "sku-1",
            86_400,
            values.iter().enumerate().map(|(i, &v)| SeriesPoint {
                timestamp: start + Duration::days(i as i64),
                value: v,
            }),
        )
        .unwrap()
    }

    fn weekly(n: usize) -> Vec<f64> {
        (0..n)
            .map(|i| 100.0 + i as f64 * 0.5 + [0.0, 5.0, 10.0, 5.0, 0.0, -10.0, -5.0][i % 7])
            .collect()
    }

    #[test]
    fn test_too_few_observations() {
        let err = ForecastEngine::default().train(&window(&[1.0; 20])).unwrap_err();
        assert_eq!(
            err,
            TrainingError::TooFewObservations {
                entity_id: "sku-1".to_string(),
                have: 20,
                need: 30
            }
        );
    }

    #[test]
    fn test_training_is_deterministic() {
        let engine = ForecastEngine::default();
        let w = window(&weekly(90));
        let created = Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap();

        let a = engine.train(&w).unwrap().to_artifact(created).unwrap();
        let b = engine.train(&w).unwrap().to_artifact(created).unwrap();
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
        assert_eq!(a.seed, 42);
        assert_eq!(a.version, w.version());
    }

    #[test]
    fn test_forecast_shape_and_intervals() {
        let engine = ForecastEngine::default();
        let w = window(&weekly(90));
        let model = engine.train(&w).unwrap();
        let forecast = model.forecast(Utc::now());

        assert_eq!(forecast.points.len(), 90);
        assert_eq!(
            forecast.points[0].timestamp,
            w.last().unwrap().timestamp + Duration::days(1)
        );
        for pair in forecast.points.windows(2) {
            assert!(pair[0].timestamp < pair[1].timestamp);
        }
        for p in &forecast.points {
            assert!(p.lower <= p.point && p.point <= p.upper);
            assert!(p.lower >= 0.0);
        }
        // intervals widen with the horizon
        let first = forecast.points[0].upper - forecast.points[0].lower;
        let last = forecast.points[89].upper - forecast.points[89].lower;
        assert!(last >= first);
    }

    #[test]
    fn test_seasonal_series_backtests_well() {
        let model = ForecastEngine::default().train(&window(&weekly(120))).unwrap();
        assert_eq!(model.state.seasonal.len(), 7);
        assert!(model.metrics.backtest_mape < 10.0, "mape {}", model.metrics.backtest_mape);
        assert_eq!(model.metrics.holdout, 14);
    }

    #[test]
    fn test_short_window_disables_seasonality() {
        let engine = ForecastEngine::new(EngineConfig {
            min_observations: 10,
            season_length: Some(7),
            ..Default::default()
        });
        let model = engine.train(&window(&weekly(13))).unwrap();
        assert!(model.state.seasonal.is_empty());
    }

    #[test]
    fn test_artifact_round_trip_forecasts_identically() {
        let config = EngineConfig::default();
        let model = ForecastEngine::new(config.clone()).train(&window(&weekly(60))).unwrap();
        let artifact = model.to_artifact(Utc::now()).unwrap();
        let restored = TrainedModel::from_artifact(&artifact, &config).unwrap();

        let at = Utc::now();
        assert_eq!(model.forecast(at), restored.forecast(at));
    }

    #[test]
    fn test_mape_all_zero_actuals() {
        assert_eq!(mape(&[0.0, 0.0], &[1.0, 3.0], &[4.0, 4.0]), 50.0);
        assert_eq!(mape(&[0.0], &[1.0], &[0.0, 0.0]), 0.0);
        assert_eq!(mape(&[10.0, 0.0, 20.0], &[11.0, 5.0, 18.0], &[]), 10.0);
    }

    #[test]
    fn test_z_score() {
        assert!((z_score(0.95) - 1.959964).abs() < 1e-4);
        assert!(z_score(0.8) < z_score(0.95));
    }

    #[test]
    fn test_config_validation() {
        assert!(EngineConfig::default().validate().is_ok());
        let bad = EngineConfig {
            confidence_level: 1.0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }
}
