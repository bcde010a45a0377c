//! Data validation for raw records.
//!
//! Every record passes through two checks:
//! - Schema: required fields, finite values, allowed range, freshness window
//! - Outliers: values beyond `outlier_sigma` standard deviations of the
//!   trailing accepted values of the same entity are corrected
//!
//! The batch is aborted only when the rejection rate exceeds the configured
//! threshold.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::domain::{
    RawRecord, ReasonCode, ValidationReport, ValidationResult, ValidationStatus,
    ValidationSummary,
};
use crate::error::DataQualityError;

/// How to correct a statistical outlier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrectionStrategy {
    /// Mark corrected without a value; the record is excluded downstream
    Drop,
    /// Clamp to the trailing mean ± sigma·sd
    Clip,
    /// Midpoint of the neighbouring non-outlier values
    Interpolate,
}

impl Default for CorrectionStrategy {
    fn default() -> Self {
        Self::Clip
    }
}

/// Schema and quality rules
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Smallest allowed value (default: 0.0)
    #[serde(default = "default_min_value")]
    pub min_value: Option<f64>,

    /// Largest allowed value (default: unbounded)
    #[serde(default)]
    pub max_value: Option<f64>,

    /// Records older than this many days are rejected as stale (default: 1095)
    #[serde(default = "default_freshness_window_days")]
    pub freshness_window_days: Option<i64>,

    /// Records further in the future than this are rejected (default: 24)
    #[serde(default = "default_max_future_skew_hours")]
    pub max_future_skew_hours: i64,

    /// Outlier threshold in standard deviations (default: 3.0)
    #[serde(default = "default_outlier_sigma")]
    pub outlier_sigma: f64,

    /// Trailing values considered for outlier detection (default: 30)
    #[serde(default = "default_outlier_window")]
    pub outlier_window: usize,

    /// Minimum trailing values before outliers are flagged (default: 10)
    #[serde(default = "default_outlier_min_history")]
    pub outlier_min_history: usize,

    #[serde(default)]
    pub correction: CorrectionStrategy,

    /// Abort the batch above this rejection rate (default: 0.30)
    #[serde(default = "default_max_rejection_rate")]
    pub max_rejection_rate: f64,
}

fn default_min_value() -> Option<f64> {
    Some(0.0)
}
fn default_freshness_window_days() -> Option<i64> {
    Some(1095)
}
fn default_max_future_skew_hours() -> i64 {
    24
}
fn default_outlier_sigma() -> f64 {
    3.0
}
fn default_outlier_window() -> usize {
    30
}
fn default_outlier_min_history() -> usize {
    10
}
fn default_max_rejection_rate() -> f64 {
    0.30
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            min_value: default_min_value(),
            max_value: None,
            freshness_window_days: default_freshness_window_days(),
            max_future_skew_hours: default_max_future_skew_hours(),
            outlier_sigma: default_outlier_sigma(),
            outlier_window: default_outlier_window(),
            outlier_min_history: default_outlier_min_history(),
            correction: CorrectionStrategy::default(),
            max_rejection_rate: default_max_rejection_rate(),
        }
    }
}

impl ValidationConfig {
    pub fn validate(&self) -> Result<(), String> {
        if let (Some(min), Some(max)) = (self.min_value, self.max_value) {
            if min > max {
                return Err(format!("min_value {} > max_value {}", min, max));
            }
        }
        if !(0.0..=1.0).contains(&self.max_rejection_rate) {
            return Err(format!(
                "max_rejection_rate must be within [0, 1], got {}",
                self.max_rejection_rate
            ));
        }
        if !(self.outlier_sigma > 0.0) {
            return Err("outlier_sigma must be positive".to_string());
        }
        if self.outlier_window == 0 {
            return Err("outlier_window must be at least 1".to_string());
        }
        if self.outlier_min_history < 2 {
            return Err("outlier_min_history must be at least 2".to_string());
        }
        if matches!(self.freshness_window_days, Some(d) if d <= 0) {
            return Err("freshness_window_days must be positive".to_string());
        }
        Ok(())
    }
}

/// Validates batches of raw records
#[derive(Debug, Clone, Default)]
pub struct Validator {
    config: ValidationConfig,
}

impl Validator {
    pub fn new(config: ValidationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ValidationConfig {
        &self.config
    }

    /// Validate a batch, returning one result per record in input order
    pub fn validate(
        &self,
        batch: &[RawRecord],
        now: DateTime<Utc>,
    ) -> Result<ValidationReport, DataQualityError> {
        let mut results: Vec<ValidationResult> = batch
            .iter()
            .map(|record| {
                let reasons = self.schema_violations(record, now);
                if reasons.is_empty() {
                    ValidationResult::accepted(record.clone())
                } else {
                    ValidationResult::rejected(record.clone(), reasons)
                }
            })
            .collect();

        self.correct_outliers(&mut results);

        let summary = ValidationSummary::from_results(&results);
        info!(
            total = summary.total,
            accepted = summary.accepted,
            rejected = summary.rejected,
            corrected = summary.corrected,
            "Validated batch"
        );

        let rate = summary.rejection_rate();
        if rate > self.config.max_rejection_rate {
            warn!(
                rejected = summary.rejected,
                total = summary.total,
                rate,
                threshold = self.config.max_rejection_rate,
                "Batch rejected: too many invalid records"
            );
            return Err(DataQualityError {
                rejected: summary.rejected,
                total: summary.total,
                rate,
                threshold: self.config.max_rejection_rate,
            });
        }

        Ok(ValidationReport { results, summary })
    }

    fn schema_violations(&self, record: &RawRecord, now: DateTime<Utc>) -> Vec<ReasonCode> {
        let mut reasons = Vec::new();

        if record.entity_id.trim().is_empty() {
            reasons.push(ReasonCode::MissingEntity);
        }

        match record.timestamp {
            None => reasons.push(ReasonCode::MissingTimestamp),
            Some(ts) => {
                if let Some(days) = self.config.freshness_window_days {
                    if ts < now - Duration::days(days) {
                        reasons.push(ReasonCode::Stale);
                    }
                }
                if ts > now + Duration::hours(self.config.max_future_skew_hours) {
                    reasons.push(ReasonCode::FutureTimestamp);
                }
            }
        }

        match record.value {
            None => reasons.push(ReasonCode::MissingValue),
            Some(v) if !v.is_finite() => reasons.push(ReasonCode::NonFiniteValue),
            Some(v) => {
                if matches!(self.config.min_value, Some(min) if v < min) {
                    reasons.push(ReasonCode::BelowMinimum);
                }
                if matches!(self.config.max_value, Some(max) if v > max) {
                    reasons.push(ReasonCode::AboveMaximum);
                }
            }
        }

        reasons
    }

    /// Flag and correct outliers among schema-accepted records, per entity
    /// in chronological order.
    fn correct_outliers(&self, results: &mut [ValidationResult]) {
        let mut by_entity: HashMap<&str, Vec<usize>> = HashMap::new();
        for (idx, result) in results.iter().enumerate() {
            if result.status == ValidationStatus::Accepted {
                by_entity
                    .entry(result.record.entity_id.as_str())
                    .or_default()
                    .push(idx);
            }
        }

        let mut groups: Vec<Vec<usize>> = by_entity.into_values().collect();
        for indices in groups.iter_mut() {
            // Stable sort keeps input order for equal timestamps
            indices.sort_by_key(|&i| results[i].record.timestamp);
        }

        let mut corrections: Vec<(usize, Option<f64>)> = Vec::new();
        for indices in &groups {
            let values: Vec<f64> = indices
                .iter()
                .map(|&i| results[i].record.value.unwrap_or_default())
                .collect();
            for (position, corrected) in self.scan_entity(&values) {
                corrections.push((indices[position], corrected));
            }
        }

        for (idx, corrected) in corrections {
            let result = &mut results[idx];
            result.status = ValidationStatus::Corrected;
            result.reasons.push(ReasonCode::Outlier);
            result.corrected_value = corrected;
        }
    }

    /// Walk one entity's values and return `(position, corrected value)`
    /// for every outlier.
    fn scan_entity(&self, values: &[f64]) -> Vec<(usize, Option<f64>)> {
        let sigma = self.config.outlier_sigma;
        let mut trailing: VecDeque<f64> = VecDeque::with_capacity(self.config.outlier_window);
        let mut outliers = Vec::new();

        for (pos, &value) in values.iter().enumerate() {
            let mut admitted = Some(value);

            if trailing.len() >= self.config.outlier_min_history {
                let (mean, sd) = mean_std(trailing.iter().copied());
                if sd > f64::EPSILON && (value - mean).abs() > sigma * sd {
                    let corrected = match self.config.correction {
                        CorrectionStrategy::Drop => None,
                        CorrectionStrategy::Clip => {
                            Some(value.clamp(mean - sigma * sd, mean + sigma * sd))
                        }
                        CorrectionStrategy::Interpolate => {
                            let previous = trailing.back().copied().unwrap_or(mean);
                            let next = values[pos + 1..]
                                .iter()
                                .copied()
                                .find(|v| (v - mean).abs() <= sigma * sd);
                            Some(match next {
                                Some(next) => (previous + next) / 2.0,
                                None => mean,
                            })
                        }
                    };
                    outliers.push((pos, corrected));
                    admitted = corrected;
                }
            }

            if let Some(v) = admitted {
                if trailing.len() == self.config.outlier_window {
                    trailing.pop_front();
                }
                trailing.push_back(v);
            }
        }

        outliers
    }
}

/// Population mean and standard deviation
fn mean_std(values: impl Iterator<Item = f64> + Clone) -> (f64, f64) {
    let (count, sum) = values
        .clone()
        .fold((0usize, 0.0), |(n, s), v| (n + 1, s + v));
    if count == 0 {
        return (0.0, 0.0);
    }
    let mean = sum / count as f64;
    let variance = values.map(|v| (v - mean).powi(2)).sum::<f64>() / count as f64;
    (mean, variance.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
    }

    fn daily(entity: &str, values: &[f64]) -> Vec<RawRecord> {
        values
            .iter()
            .enumerate()
            .map(|(i, &v)| {
                RawRecord::new(entity, now() - Duration::days(values.len() as i64 - i as i64), v)
            })
            .collect()
    }

    fn steady_with_spike(spike: f64) -> Vec<f64> {
        let mut values: Vec<f64> = (0..20).map(|i| 100.0 + (i % 5) as f64).collect();
        values.push(spike);
        values.push(101.0);
        values
    }

    #[test]
    fn test_schema_rejections() {
        let validator = Validator::new(ValidationConfig {
            max_value: Some(1_000.0),
            ..Default::default()
        });

        let base = RawRecord::new("sku-1", now() - Duration::days(1), 10.0);
        let batch = vec![
            base.clone(),
            RawRecord { entity_id: " ".to_string(), ..base.clone() },
            RawRecord { timestamp: None, ..base.clone() },
            RawRecord { value: None, ..base.clone() },
            RawRecord { value: Some(f64::NAN), ..base.clone() },
            RawRecord { value: Some(-1.0), ..base.clone() },
            RawRecord { value: Some(5_000.0), ..base.clone() },
            RawRecord { timestamp: Some(now() - Duration::days(2_000)), ..base.clone() },
            RawRecord { timestamp: Some(now() + Duration::days(3)), ..base.clone() },
        ];

        let permissive = Validator::new(ValidationConfig {
            max_value: Some(1_000.0),
            max_rejection_rate: 1.0,
            ..Default::default()
        });
        let report = permissive.validate(&batch, now()).unwrap();

        let reasons: Vec<Vec<ReasonCode>> =
            report.results.iter().map(|r| r.reasons.clone()).collect();
        assert!(reasons[0].is_empty());
        assert_eq!(reasons[1], vec![ReasonCode::MissingEntity]);
        assert_eq!(reasons[2], vec![ReasonCode::MissingTimestamp]);
        assert_eq!(reasons[3], vec![ReasonCode::MissingValue]);
        assert_eq!(reasons[4], vec![ReasonCode::NonFiniteValue]);
        assert_eq!(reasons[5], vec![ReasonCode::BelowMinimum]);
        assert_eq!(reasons[6], vec![ReasonCode::AboveMaximum]);
        assert_eq!(reasons[7], vec![ReasonCode::Stale]);
        assert_eq!(reasons[8], vec![ReasonCode::FutureTimestamp]);
        assert_eq!(report.summary.rejected, 8);

        // Same batch with the default threshold aborts
        assert!(validator.validate(&batch, now()).is_err());
    }

    #[test]
    fn test_rejection_threshold_is_strict() {
        let validator = Validator::default();
        let mut batch = daily("sku-1", &[10.0; 7]);
        for record in batch.iter_mut().take(3) {
            record.value = None;
        }
        // 3/10 = 0.30 is not above the threshold
        batch.extend(daily("sku-2", &[10.0; 3]));
        let report = validator.validate(&batch, now()).unwrap();
        assert_eq!(report.summary.rejected, 3);

        batch[3].value = None;
        let err = validator.validate(&batch, now()).unwrap_err();
        assert_eq!(err.rejected, 4);
        assert_eq!(err.total, 10);
    }

    #[test]
    fn test_clip_outlier() {
        let validator = Validator::default();
        let batch = daily("sku-1", &steady_with_spike(10_000.0));
        let report = validator.validate(&batch, now()).unwrap();

        assert_eq!(report.summary.corrected, 1);
        let spike = &report.results[20];
        assert_eq!(spike.status, ValidationStatus::Corrected);
        assert_eq!(spike.reasons, vec![ReasonCode::Outlier]);
        let clipped = spike.corrected_value.unwrap();
        assert!(clipped > 100.0 && clipped < 110.0);
        assert_eq!(report.results[21].status, ValidationStatus::Accepted);
    }

    #[test]
    fn test_drop_outlier() {
        let validator = Validator::new(ValidationConfig {
            correction: CorrectionStrategy::Drop,
            ..Default::default()
        });
        let report = validator
            .validate(&daily("sku-1", &steady_with_spike(10_000.0)), now())
            .unwrap();
        let spike = &report.results[20];
        assert_eq!(spike.status, ValidationStatus::Corrected);
        assert_eq!(spike.corrected_value, None);
        assert_eq!(spike.usable_value(), None);
    }

    #[test]
    fn test_interpolate_outlier() {
        let validator = Validator::new(ValidationConfig {
            correction: CorrectionStrategy::Interpolate,
            ..Default::default()
        });
        let values = steady_with_spike(10_000.0);
        let report = validator.validate(&daily("sku-1", &values), now()).unwrap();
        // previous accepted value is values[19] = 104, next normal value is 101
        assert_eq!(report.results[20].corrected_value, Some((104.0 + 101.0) / 2.0));
    }

    #[test]
    fn test_outliers_are_per_entity() {
        let validator = Validator::default();
        let mut batch = daily("sku-1", &[100.0; 15]);
        batch.extend(daily("sku-2", &[10_000.0; 3]));
        let report = validator.validate(&batch, now()).unwrap();
        assert_eq!(report.summary.corrected, 0);
    }

    #[test]
    fn test_completeness_holds() {
        let validator = Validator::new(ValidationConfig {
            max_rejection_rate: 1.0,
            ..Default::default()
        });
        let mut batch = daily("sku-1", &steady_with_spike(5_000.0));
        batch[3].value = None;
        batch[7].timestamp = None;
        batch.extend(daily("sku-2", &[1.0, -4.0, 2.0]));

        let report = validator.validate(&batch, now()).unwrap();
        let s = report.summary;
        assert_eq!(s.accepted + s.rejected + s.corrected, s.total);
        assert_eq!(s.total, batch.len());
        assert_eq!(report.results.len(), batch.len());
        for (result, record) in report.results.iter().zip(&batch) {
            assert_eq!(&result.record, record);
        }
    }

    #[test]
    fn test_empty_batch() {
        let report = Validator::default().validate(&[], now()).unwrap();
        assert_eq!(report.summary.total, 0);
        assert!(report.results.is_empty());
    }

    #[test]
    fn test_config_validation() {
        assert!(ValidationConfig::default().validate().is_ok());
        let bad = ValidationConfig {
            max_rejection_rate: 1.5,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
        let inverted = ValidationConfig {
            min_value: Some(10.0),
            max_value: Some(1.0),
            ..Default::default()
        };
        assert!(inverted.validate().is_err());
    }
}
