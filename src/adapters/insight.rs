//! HTTP client for the natural-language insight service.
//!
//! Endpoint: POST <endpoint>
//! Auth: Bearer token (optional)

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::InsightProvider;
use crate::domain::ForecastSummary;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InsightConfig {
    /// Service URL; insights are disabled when unset
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Environment variable holding the bearer token
    #[serde(default = "default_token_env")]
    pub token_env: String,

    /// Request timeout in seconds (default: 30)
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

fn default_token_env() -> String {
    "BI_FORECAST_INSIGHT_TOKEN".to_string()
}
fn default_timeout_seconds() -> u64 {
    30
}

impl Default for InsightConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            token_env: default_token_env(),
            timeout_seconds: default_timeout_seconds(),
        }
    }
}

/// Request body
#[derive(Debug, Serialize)]
pub struct InsightRequest<'a> {
    /// Instruction for the narrator
    pub prompt: String,
    pub forecast: &'a ForecastSummary,
}

/// Response body
#[derive(Debug, Deserialize)]
pub struct InsightResponse {
    #[serde(alias = "text", alias = "message")]
    pub insight: String,
}

/// Insight service client
pub struct HttpInsightClient {
    endpoint: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl HttpInsightClient {
    /// Create a new client
    pub fn new(endpoint: String, token: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            endpoint,
            token,
            client,
        })
    }

    /// Create from config, reading the token from its environment variable.
    /// Returns None when no endpoint is configured.
    pub fn from_config(config: &InsightConfig) -> Result<Option<Self>> {
        let Some(endpoint) = config.endpoint.clone() else {
            return Ok(None);
        };
        let token = std::env::var(&config.token_env).ok().filter(|t| !t.is_empty());
        Self::new(endpoint, token, Duration::from_secs(config.timeout_seconds)).map(Some)
    }

    fn prompt(summary: &ForecastSummary) -> String {
        format!(
            "Summarize the {}-period revenue forecast for {} (total {:.2}, mean {:.2}, backtest MAPE {:.1}%) for a business audience.",
            summary.horizon, summary.entity_id, summary.total, summary.mean, summary.quality_score
        )
    }
}

#[async_trait]
impl InsightProvider for HttpInsightClient {
    fn name(&self) -> &str {
        "http"
    }

    async fn narrate(&self, summary: &ForecastSummary) -> Result<String> {
        let payload = InsightRequest {
            prompt: Self::prompt(summary),
            forecast: summary,
        };

        let mut request = self
            .client
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .json(&payload);
        if let Some(token) = &self.token {
            request = request.header("Authorization", format!("Bearer {}", token));
        }

        let response = request
            .send()
            .await
            .context("Failed to reach insight service")?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("Insight service error ({}): {}", status, text)
        }

        let body: InsightResponse = response
            .json()
            .await
            .context("Failed to parse insight response")?;
        Ok(body.insight)
    }
}
