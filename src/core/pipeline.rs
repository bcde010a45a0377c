//! Pipeline configuration and loading.
//!
//! A pipeline run is configured by one YAML document whose sections map to
//! the components it drives (validation, features, engine, promotion,
//! store), plus retry, timeout and worker settings for the orchestrator.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::engine::EngineConfig;
use super::features::FeatureConfig;
use super::forecast_store::StoreConfig;
use super::validator::ValidationConfig;
use crate::error::InvalidConfigError;

/// Everything a run needs to know
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub validation: ValidationConfig,

    #[serde(default)]
    pub features: FeatureConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub promotion: PromotionConfig,

    #[serde(default)]
    pub store: StoreConfig,

    /// Retry policy for transient I/O failures
    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub timeouts: StageTimeouts,

    /// Entities processed in parallel (default: 4)
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Days of raw data fetched per entity (default: the feature horizon)
    #[serde(default)]
    pub lookback_days: Option<i64>,

    /// Call the insight provider after storing a forecast (default: true)
    #[serde(default = "default_insights_enabled")]
    pub insights_enabled: bool,
}

fn default_max_workers() -> usize {
    4
}
fn default_insights_enabled() -> bool {
    true
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            validation: ValidationConfig::default(),
            features: FeatureConfig::default(),
            engine: EngineConfig::default(),
            promotion: PromotionConfig::default(),
            store: StoreConfig::default(),
            retry: RetryPolicy::default(),
            timeouts: StageTimeouts::default(),
            max_workers: default_max_workers(),
            lookback_days: None,
            insights_enabled: default_insights_enabled(),
        }
    }
}

impl PipelineConfig {
    /// Load a pipeline config from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pipeline config: {}", path.display()))?;

        Self::from_yaml(&content)
    }

    /// Parse a pipeline config from YAML content
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse pipeline config YAML")
    }

    /// Reject configurations that cannot run
    pub fn validate(&self) -> Result<(), InvalidConfigError> {
        let sections = [
            ("validation", self.validation.validate()),
            ("features", self.features.validate()),
            ("engine", self.engine.validate()),
            ("store", self.store.validate()),
            ("retry", self.retry.validate()),
            ("timeouts", self.timeouts.validate()),
        ];
        for (section, result) in sections {
            if let Err(msg) = result {
                return Err(InvalidConfigError(format!("{}: {}", section, msg)));
            }
        }

        if self.max_workers == 0 {
            return Err(InvalidConfigError("max_workers must be at least 1".to_string()));
        }
        if !(self.promotion.tolerance >= 0.0) {
            return Err(InvalidConfigError(
                "promotion.tolerance must be non-negative".to_string(),
            ));
        }
        if matches!(self.lookback_days, Some(d) if d <= 0) {
            return Err(InvalidConfigError("lookback_days must be positive".to_string()));
        }
        Ok(())
    }

    /// Days of raw history to request from the source
    pub fn lookback_days(&self) -> i64 {
        self.lookback_days.unwrap_or(self.features.horizon_days)
    }
}

/// Automatic promotion policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromotionConfig {
    /// A candidate may score this much worse (MAPE points) than the
    /// promoted model and still replace it (default: 1.0)
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
}

fn default_tolerance() -> f64 {
    1.0
}

impl Default for PromotionConfig {
    fn default() -> Self {
        Self {
            tolerance: default_tolerance(),
        }
    }
}

/// Per-stage time limits in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageTimeouts {
    /// Raw data fetch (default: 60)
    #[serde(default = "default_fetch_timeout")]
    pub fetch_seconds: u64,

    #[serde(default = "default_validate_timeout")]
    pub validate_seconds: u64,

    #[serde(default = "default_build_timeout")]
    pub build_seconds: u64,

    /// Training and backtest (default: 300)
    #[serde(default = "default_train_timeout")]
    pub train_seconds: u64,

    #[serde(default = "default_promote_timeout")]
    pub promote_seconds: u64,

    #[serde(default = "default_store_timeout")]
    pub store_seconds: u64,
}

fn default_fetch_timeout() -> u64 {
    60
}
fn default_validate_timeout() -> u64 {
    30
}
fn default_build_timeout() -> u64 {
    30
}
fn default_train_timeout() -> u64 {
    300
}
fn default_promote_timeout() -> u64 {
    30
}
fn default_store_timeout() -> u64 {
    30
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            fetch_seconds: default_fetch_timeout(),
            validate_seconds: default_validate_timeout(),
            build_seconds: default_build_timeout(),
            train_seconds: default_train_timeout(),
            promote_seconds: default_promote_timeout(),
            store_seconds: default_store_timeout(),
        }
    }
}

impl StageTimeouts {
    fn validate(&self) -> Result<(), String> {
        let all = [
            self.fetch_seconds,
            self.validate_seconds,
            self.build_seconds,
            self.train_seconds,
            self.promote_seconds,
            self.store_seconds,
        ];
        if all.contains(&0) {
            return Err("every stage timeout must be at least 1 second".to_string());
        }
        Ok(())
    }

    pub fn fetch(&self) -> Duration {
        Duration::from_secs(self.fetch_seconds)
    }
    pub fn validate_stage(&self) -> Duration {
        Duration::from_secs(self.validate_seconds)
    }
    pub fn build(&self) -> Duration {
        Duration::from_secs(self.build_seconds)
    }
    pub fn train(&self) -> Duration {
        Duration::from_secs(self.train_seconds)
    }
    pub fn promote(&self) -> Duration {
        Duration::from_secs(self.promote_seconds)
    }
    pub fn store(&self) -> Duration {
        Duration::from_secs(self.store_seconds)
    }
}

/// Retry policy for transient failures
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including first try)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay between retries in milliseconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier (delay *= multiplier after each retry)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_delay() -> u64 {
    1000
}
fn default_max_delay() -> u64 {
    30000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryPolicy {
    fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be at least 1".to_string());
        }
        if !(self.backoff_multiplier >= 1.0) {
            return Err("backoff_multiplier must be at least 1.0".to_string());
        }
        Ok(())
    }

    /// Calculate delay for a specific attempt (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::from_millis(self.initial_delay_ms.min(self.max_delay_ms));
        }

        let delay = self.initial_delay_ms as f64
            * self.backoff_multiplier.powi((attempt - 1) as i32);

        let capped = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(capped)
    }

    /// Check if we should retry based on attempt count
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::validator::CorrectionStrategy;

    const TEST_CONFIG_YAML: &str = r#"
validation:
  max_rejection_rate: 0.2
  correction: interpolate
features:
  aggregation: mean
engine:
  horizon_periods: 30
  seed: 7
promotion:
  tolerance: 0.5
retry:
  max_attempts: 5
timeouts:
  train_seconds: 10
max_workers: 2
"#;

    #[test]
    fn test_config_parsing() {
        let config = PipelineConfig::from_yaml(TEST_CONFIG_YAML).unwrap();

        assert_eq!(config.validation.max_rejection_rate, 0.2);
        assert_eq!(config.validation.correction, CorrectionStrategy::Interpolate);
        // untouched fields keep their defaults
        assert_eq!(config.validation.outlier_sigma, 3.0);
        assert_eq!(config.engine.horizon_periods, 30);
        assert_eq!(config.engine.seed, 7);
        assert_eq!(config.engine.min_observations, 30);
        assert_eq!(config.promotion.tolerance, 0.5);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.initial_delay_ms, 1000);
        assert_eq!(config.timeouts.train(), Duration::from_secs(10));
        assert_eq!(config.timeouts.fetch(), Duration::from_secs(60));
        assert_eq!(config.max_workers, 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_document_is_all_defaults() {
        let config = PipelineConfig::from_yaml("{}").unwrap();
        assert_eq!(config.max_workers, 4);
        assert_eq!(config.store.freshness_sla_hours, 48);
        assert_eq!(config.features.frequency_seconds, 86_400);
        assert_eq!(config.lookback_days(), 730);
        assert!(config.insights_enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_config_names_section() {
        let mut config = PipelineConfig::default();
        config.engine.confidence_level = 1.5;
        let err = config.validate().unwrap_err();
        assert!(err.0.starts_with("engine:"));

        let mut config = PipelineConfig::default();
        config.max_workers = 0;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.timeouts.fetch_seconds = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_retry_policy_delays() {
        let policy = RetryPolicy {
            initial_delay_ms: 1000,
            backoff_multiplier: 2.0,
            max_delay_ms: 10000,
            ..Default::default()
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(4000));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(8000));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(10000)); // Capped
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }
}
