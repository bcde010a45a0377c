//! Trained model artifacts held by the model registry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A trained model for one entity and training-window version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    /// Entity the model forecasts
    pub entity_id: String,

    /// Training-window version
    pub version: String,

    /// Serialized model state (JSON)
    pub state: String,

    /// Metrics recorded at training time
    pub metrics: TrainingMetrics,

    /// Current promotion status
    pub status: PromotionStatus,

    /// Seed used for the parameter search
    pub seed: u64,

    /// When the artifact was trained
    pub created_at: DateTime<Utc>,

    /// When the artifact was promoted (if ever)
    pub promoted_at: Option<DateTime<Utc>>,

    /// When the artifact was retired (if ever)
    pub retired_at: Option<DateTime<Utc>>,
}

impl ModelArtifact {
    /// Create a new candidate artifact
    pub fn candidate(
        entity_id: String,
        version: String,
        state: String,
        metrics: TrainingMetrics,
        seed: u64,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            entity_id,
            version,
            state,
            metrics,
            status: PromotionStatus::Candidate,
            seed,
            created_at,
            promoted_at: None,
            retired_at: None,
        }
    }

    /// Backtest score used for promotion decisions (lower is better)
    pub fn quality_score(&self) -> f64 {
        self.metrics.backtest_mape
    }

    pub fn is_promoted(&self) -> bool {
        self.status == PromotionStatus::Promoted
    }
}

/// Metrics recorded when a model is trained
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrainingMetrics {
    /// Mean absolute percentage error over the held-out tail
    pub backtest_mape: f64,

    /// Standard deviation of one-step-ahead residuals
    pub residual_std: f64,

    /// Points in the training window
    pub observations: usize,

    /// Points held out for the backtest
    pub holdout: usize,
}

/// Promotion lifecycle: candidate → promoted → retired
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromotionStatus {
    Candidate,
    Promoted,
    Retired,
}

impl PromotionStatus {
    /// Whether moving to `next` is allowed. Retired is final.
    pub fn can_transition_to(self, next: PromotionStatus) -> bool {
        matches!(
            (self, next),
            (PromotionStatus::Candidate, PromotionStatus::Promoted)
                | (PromotionStatus::Promoted, PromotionStatus::Retired)
        )
    }
}

impl Default for PromotionStatus {
    fn default() -> Self {
        Self::Candidate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_promotion_is_monotonic() {
        use PromotionStatus::*;

        assert!(Candidate.can_transition_to(Promoted));
        assert!(Promoted.can_transition_to(Retired));

        assert!(!Retired.can_transition_to(Promoted));
        assert!(!Retired.can_transition_to(Candidate));
        assert!(!Promoted.can_transition_to(Candidate));
        assert!(!Candidate.can_transition_to(Retired));
    }

    #[test]
    fn test_artifact_serialization() {
        let artifact = ModelArtifact::candidate(
            "sku-1".to_string(),
            "20240101-0011223344556677".to_string(),
            "{}".to_string(),
            TrainingMetrics {
                backtest_mape: 8.5,
                residual_std: 1.2,
                observations: 60,
                holdout: 14,
            },
            42,
            Utc::now(),
        );

        let json = serde_json::to_string(&artifact).unwrap();
        let parsed: ModelArtifact = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed, artifact);
        assert_eq!(parsed.status, PromotionStatus::Candidate);
        assert_eq!(parsed.quality_score(), 8.5);
    }
}
