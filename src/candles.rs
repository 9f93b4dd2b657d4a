// =============================================================================
// Candle Service Client — OHLCV rows from the candle microservice
// =============================================================================

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// One candle fetch job as understood by the candle microservice.
#[derive(Debug, Clone, Serialize)]
pub struct CandleJob {
    pub exchange: String,
    pub pair: String,
    pub timeframe: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub length: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct JobResponse {
    #[serde(default)]
    data: Vec<[serde_json::Value; 6]>,
}

/// Thin client for the candle microservice.
///
/// The service accepts a POST of job descriptors and returns one response per
/// job with rows shaped `[ts, open, high, low, close, volume]`.
#[derive(Clone)]
pub struct CandleServiceClient {
    base_url: String,
    client: reqwest::Client,
}

impl CandleServiceClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .expect("failed to build reqwest client");
        Self { base_url, client }
    }

    /// Fetch close prices for one (pair, timeframe, lookback) job.
    pub async fn fetch_closes(
        &self,
        exchange: &str,
        pair: &str,
        timeframe: &str,
        length: Option<&str>,
    ) -> Result<Vec<f64>> {
        let job = CandleJob {
            exchange: exchange.to_string(),
            pair: pair.to_string(),
            timeframe: timeframe.to_string(),
            length: length.map(|s| s.to_string()),
        };
        let url = format!("{}/", self.base_url);

        let resp = self
            .client
            .post(&url)
            .json(&vec![job])
            .send()
            .await
            .context("candle service request failed")?;

        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("candle service returned {status}");
        }

        let jobs: Vec<JobResponse> = resp
            .json()
            .await
            .context("invalid JSON returned by candle service")?;

        let Some(first) = jobs.into_iter().next() else {
            return Ok(Vec::new());
        };

        // Column 4 is the close; rows with non-numeric closes are dropped.
        let closes: Vec<f64> = first
            .data
            .iter()
            .filter_map(|row| row[4].as_f64().or_else(|| row[4].as_str()?.parse().ok()))
            .filter(|c| c.is_finite() && *c > 0.0)
            .collect();

        debug!(pair, timeframe, rows = closes.len(), "candle closes fetched");
        Ok(closes)
    }
}
