//! Forecast output written to the forecast store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One future period
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ForecastPoint {
    pub timestamp: DateTime<Utc>,
    pub point: f64,
    pub lower: f64,
    pub upper: f64,
}

/// A versioned forecast for one entity. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastResult {
    pub entity_id: String,

    /// When the forecast was generated
    pub generated_at: DateTime<Utc>,

    /// Training-window version of the promoted model that produced it
    pub model_version: String,

    /// Ordered future periods
    pub points: Vec<ForecastPoint>,

    /// Backtest score of the model (MAPE, lower is better)
    pub quality_score: f64,

    /// Confidence level of the intervals (e.g. 0.95)
    pub confidence_level: f64,
}

impl ForecastResult {
    /// Age of the forecast at `now`
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.generated_at
    }

    /// Compact description handed to the insight collaborator
    pub fn summary(&self) -> ForecastSummary {
        let total: f64 = self.points.iter().map(|p| p.point).sum();
        let mean = if self.points.is_empty() {
            0.0
        } else {
            total / self.points.len() as f64
        };

        ForecastSummary {
            entity_id: self.entity_id.clone(),
            model_version: self.model_version.clone(),
            generated_at: self.generated_at,
            horizon: self.points.len(),
            period_start: self.points.first().map(|p| p.timestamp),
            period_end: self.points.last().map(|p| p.timestamp),
            total,
            mean,
            first_point: self.points.first().map(|p| p.point),
            last_point: self.points.last().map(|p| p.point),
            quality_score: self.quality_score,
        }
    }
}

/// Aggregate view of a forecast
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastSummary {
    pub entity_id: String,
    pub model_version: String,
    pub generated_at: DateTime<Utc>,
    pub horizon: usize,
    pub period_start: Option<DateTime<Utc>>,
    pub period_end: Option<DateTime<Utc>>,
    pub total: f64,
    pub mean: f64,
    pub first_point: Option<f64>,
    pub last_point: Option<f64>,
    pub quality_score: f64,
}
