//! Raw ingested records and the validator's verdict on each of them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One ingested observation.
///
/// Required fields are optional here because the source is untrusted: a
/// record with a missing timestamp or value is still ingested, and the
/// validator rejects it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    /// Entity being observed (product, store, ...)
    pub entity_id: String,

    /// Observation time
    pub timestamp: Option<DateTime<Utc>>,

    /// Observed value (e.g. revenue)
    pub value: Option<f64>,

    /// Where the record came from
    pub source: String,
}

impl RawRecord {
    pub fn new(entity_id: impl Into<String>, timestamp: DateTime<Utc>, value: f64) -> Self {
        Self {
            entity_id: entity_id.into(),
            timestamp: Some(timestamp),
            value: Some(value),
            source: "unknown".to_string(),
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }
}

/// Verdict for a single record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    Accepted,
    Rejected,
    Corrected,
}

/// Why a record was rejected or corrected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    MissingEntity,
    MissingTimestamp,
    MissingValue,
    NonFiniteValue,
    BelowMinimum,
    AboveMaximum,
    Stale,
    FutureTimestamp,
    Outlier,
}

/// Outcome of validating one record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub record: RawRecord,
    pub status: ValidationStatus,
    pub reasons: Vec<ReasonCode>,

    /// Replacement value for corrected records (`None` when dropped)
    pub corrected_value: Option<f64>,
}

impl ValidationResult {
    pub fn accepted(record: RawRecord) -> Self {
        Self {
            record,
            status: ValidationStatus::Accepted,
            reasons: Vec::new(),
            corrected_value: None,
        }
    }

    pub fn rejected(record: RawRecord, reasons: Vec<ReasonCode>) -> Self {
        Self {
            record,
            status: ValidationStatus::Rejected,
            reasons,
            corrected_value: None,
        }
    }

    /// The value the feature builder may use, if any
    pub fn usable_value(&self) -> Option<f64> {
        match self.status {
            ValidationStatus::Accepted => self.record.value,
            ValidationStatus::Corrected => self.corrected_value,
            ValidationStatus::Rejected => None,
        }
    }
}

/// Per-batch counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationSummary {
    pub total: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub corrected: usize,
}

impl ValidationSummary {
    pub fn from_results(results: &[ValidationResult]) -> Self {
        let mut summary = Self {
            total: results.len(),
            ..Default::default()
        };
        for result in results {
            match result.status {
                ValidationStatus::Accepted => summary.accepted += 1,
                ValidationStatus::Rejected => summary.rejected += 1,
                ValidationStatus::Corrected => summary.corrected += 1,
            }
        }
        summary
    }

    /// Fraction of rejected records (0 for an empty batch)
    pub fn rejection_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.rejected as f64 / self.total as f64
        }
    }
}

/// Validator output: one result per input record, in input order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub results: Vec<ValidationResult>,
    pub summary: ValidationSummary,
}
