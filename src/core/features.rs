//! Feature building: validated records to a fixed-frequency series window.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::{SeriesPoint, SeriesWindow, ValidationResult};
use crate::error::InsufficientDataError;

/// How values in the same bucket are combined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    Sum,
    Mean,
    Last,
}

impl Default for Aggregation {
    fn default() -> Self {
        Self::Sum
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureConfig {
    /// Bucket width in seconds (default: 86400, one day)
    #[serde(default = "default_frequency_seconds")]
    pub frequency_seconds: i64,

    #[serde(default)]
    pub aggregation: Aggregation,

    /// Trailing days kept in the window (default: 730)
    #[serde(default = "default_horizon_days")]
    pub horizon_days: i64,

    /// Longest run of missing buckets that is interpolated (default: 7)
    #[serde(default = "default_max_gap_periods")]
    pub max_gap_periods: usize,
}

fn default_frequency_seconds() -> i64 {
    86_400
}
fn default_horizon_days() -> i64 {
    730
}
fn default_max_gap_periods() -> usize {
    7
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            frequency_seconds: default_frequency_seconds(),
            aggregation: Aggregation::default(),
            horizon_days: default_horizon_days(),
            max_gap_periods: default_max_gap_periods(),
        }
    }
}

impl FeatureConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.frequency_seconds <= 0 {
            return Err("frequency_seconds must be positive".to_string());
        }
        if self.horizon_days <= 0 {
            return Err("horizon_days must be positive".to_string());
        }
        if self.horizon_days * 86_400 < self.frequency_seconds {
            return Err("horizon_days must cover at least one period".to_string());
        }
        Ok(())
    }

    /// Number of buckets kept in the trailing horizon
    fn horizon_periods(&self) -> i64 {
        ((self.horizon_days * 86_400) / self.frequency_seconds).max(1)
    }
}

#[derive(Debug, Default)]
struct Bucket {
    sum: f64,
    count: usize,
    last: f64,
}

impl Bucket {
    fn add(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
        self.last = value;
    }

    fn value(&self, aggregation: Aggregation) -> f64 {
        match aggregation {
            Aggregation::Sum => self.sum,
            Aggregation::Mean => self.sum / self.count as f64,
            Aggregation::Last => self.last,
        }
    }
}

/// Builds series windows from validation results
#[derive(Debug, Clone, Default)]
pub struct FeatureBuilder {
    config: FeatureConfig,
}

impl FeatureBuilder {
    pub fn new(config: FeatureConfig) -> Self {
        Self { config }
    }

    /// Resample the usable records of `entity_id` into a window.
    ///
    /// Rejected records and dropped outliers never reach the window. Results
    /// for other entities are ignored.
    pub fn build(
        &self,
        entity_id: &str,
        results: &[ValidationResult],
    ) -> Result<SeriesWindow, InsufficientDataError> {
        let freq = self.config.frequency_seconds;
        let insufficient = |reason: String| InsufficientDataError {
            entity_id: entity_id.to_string(),
            reason,
        };

        let mut usable: Vec<(DateTime<Utc>, f64)> = results
            .iter()
            .filter(|r| r.record.entity_id == entity_id)
            .filter_map(|r| Some((r.record.timestamp?, r.usable_value()?)))
            .collect();
        if usable.is_empty() {
            return Err(insufficient("no usable records".to_string()));
        }
        usable.sort_by_key(|(ts, _)| *ts);

        let mut buckets: BTreeMap<i64, Bucket> = BTreeMap::new();
        for (ts, value) in usable {
            let start = ts.timestamp().div_euclid(freq) * freq;
            buckets.entry(start).or_default().add(value);
        }

        let last_bucket = match buckets.keys().next_back() {
            Some(last) => *last,
            None => return Err(insufficient("no usable records".to_string())),
        };
        let earliest_kept = last_bucket - (self.config.horizon_periods() - 1) * freq;
        let kept: Vec<(i64, f64)> = buckets
            .range(earliest_kept..)
            .map(|(start, bucket)| (*start, bucket.value(self.config.aggregation)))
            .collect();

        let mut window = SeriesWindow::new(entity_id, freq);
        let mut previous: Option<(i64, f64)> = None;
        for (start, value) in kept {
            if let Some((prev_start, prev_value)) = previous {
                let missing = ((start - prev_start) / freq - 1) as usize;
                if missing > self.config.max_gap_periods {
                    return Err(insufficient(format!(
                        "gap of {} periods before {} exceeds {}",
                        missing,
                        bucket_time(start),
                        self.config.max_gap_periods
                    )));
                }
                for step in 1..=missing {
                    let fraction = step as f64 / (missing + 1) as f64;
                    let filled = prev_value + (value - prev_value) * fraction;
                    push(&mut window, prev_start + step as i64 * freq, filled, entity_id)?;
                    window.interpolated += 1;
                }
            }
            push(&mut window, start, value, entity_id)?;
            previous = Some((start, value));
        }

        debug!(
            entity_id,
            points = window.len(),
            interpolated = window.interpolated,
            "Built series window"
        );
        Ok(window)
    }
}

fn bucket_time(start: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(start, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn push(
    window: &mut SeriesWindow,
    start: i64,
    value: f64,
    entity_id: &str,
) -> Result<(), InsufficientDataError> {
    window
        .push(SeriesPoint {
            timestamp: bucket_time(start),
            value,
        })
        .map_err(|e| InsufficientDataError {
            entity_id: entity_id.to_string(),
            reason: e.to_string(),
        })
}
