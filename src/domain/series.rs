//! Time-indexed series windows.
//!
//! A window is built by the feature builder for a single entity and owned by
//! the run unit that created it. Points are strictly increasing in time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::SeriesOrderError;

/// One resampled observation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SeriesPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

/// Ordered observations for one entity at a fixed frequency
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesWindow {
    pub entity_id: String,

    /// Spacing between points in seconds
    pub frequency_seconds: i64,

    points: Vec<SeriesPoint>,

    /// Number of points filled by interpolation
    pub interpolated: usize,
}

impl SeriesWindow {
    pub fn new(entity_id: impl Into<String>, frequency_seconds: i64) -> Self {
        Self {
            entity_id: entity_id.into(),
            frequency_seconds,
            points: Vec::new(),
            interpolated: 0,
        }
    }

    /// Build a window from already-ordered points
    pub fn from_points(
        entity_id: impl Into<String>,
        frequency_seconds: i64,
        points: impl IntoIterator<Item = SeriesPoint>,
    ) -> Result<Self, SeriesOrderError> {
        let mut window = Self::new(entity_id, frequency_seconds);
        for point in points {
            window.push(point)?;
        }
        Ok(window)
    }

    /// Append a point; it must be strictly after the current last point
    pub fn push(&mut self, point: SeriesPoint) -> Result<(), SeriesOrderError> {
        if let Some(last) = self.points.last() {
            if point.timestamp <= last.timestamp {
                return Err(SeriesOrderError {
                    timestamp: point.timestamp,
                    last: last.timestamp,
                });
            }
        }
        self.points.push(point);
        Ok(())
    }

    pub fn points(&self) -> &[SeriesPoint] {
        &self.points
    }

    pub fn values(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.value).collect()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn first(&self) -> Option<&SeriesPoint> {
        self.points.first()
    }

    pub fn last(&self) -> Option<&SeriesPoint> {
        self.points.last()
    }

    /// Training-window version derived from the window content.
    ///
    /// Format: `{YYYYMMDD of last point}-{first 16 hex chars of SHA-256}`.
    pub fn version(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.entity_id.as_bytes());
        hasher.update(self.frequency_seconds.to_le_bytes());
        for point in &self.points {
            hasher.update(point.timestamp.timestamp().to_le_bytes());
            hasher.update(point.value.to_bits().to_le_bytes());
        }
        let digest = hasher.finalize();

        let day = self
            .points
            .last()
            .map(|p| p.timestamp.format("%Y%m%d").to_string())
            .unwrap_or_else(|| "empty".to_string());

        format!("{}-{}", day, hex::encode(&digest[..8]))
    }
}

/// Half-open time range `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// Range covering every representable timestamp
    pub fn all() -> Self {
        Self {
            start: DateTime::<Utc>::MIN_UTC,
            end: DateTime::<Utc>::MAX_UTC,
        }
    }

    /// The trailing `days` up to and including `now`
    pub fn trailing_days(now: DateTime<Utc>, days: i64) -> Self {
        Self {
            start: now - chrono::Duration::days(days),
            end: now + chrono::Duration::seconds(1),
        }
    }

    pub fn contains(&self, timestamp: DateTime<Utc>) -> bool {
        timestamp >= self.start && timestamp < self.end
    }
}
