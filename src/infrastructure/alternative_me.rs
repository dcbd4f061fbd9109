//! Crypto Fear & Greed index from alternative.me

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use crate::domain::entities::risk_index::RiskIndex;
use crate::domain::repositories::sentiment_source::{SentimentError, SentimentSource};

const FEAR_GREED_API: &str = "https://api.alternative.me/fng/?limit=1";

#[derive(Debug, Deserialize)]
struct FearGreedResponse {
    data: Vec<FearGreedReading>,
}

/// The API reports numbers as strings
#[derive(Debug, Deserialize)]
struct FearGreedReading {
    value: String,
    value_classification: String,
    timestamp: String,
}

pub struct AlternativeMeSentimentSource {
    client: Client,
    url: String,
}

impl AlternativeMeSentimentSource {
    pub fn new() -> Self {
        Self::with_url(FEAR_GREED_API)
    }

    pub fn with_url(url: &str) -> Self {
        Self {
            client: Client::new(),
            url: url.to_string(),
        }
    }

    /// Decode the latest reading from a response body
    pub fn parse(body: &str) -> Result<RiskIndex, SentimentError> {
        let response: FearGreedResponse =
            serde_json::from_str(body).map_err(|e| SentimentError::Malformed(e.to_string()))?;
        let reading = response
            .data
            .into_iter()
            .next()
            .ok_or_else(|| SentimentError::Malformed("empty data array".to_string()))?;

        let value: f64 = reading
            .value
            .trim()
            .parse()
            .map_err(|_| SentimentError::Malformed(format!("value '{}' is not a number", reading.value)))?;
        let timestamp = parse_unix_seconds(&reading.timestamp)?;

        RiskIndex::new(value, reading.value_classification, timestamp)
            .map_err(|e| SentimentError::Malformed(e.to_string()))
    }
}

impl Default for AlternativeMeSentimentSource {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_unix_seconds(raw: &str) -> Result<DateTime<Utc>, SentimentError> {
    raw.trim()
        .parse::<i64>()
        .ok()
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
        .ok_or_else(|| SentimentError::Malformed(format!("timestamp '{}' is not unix seconds", raw)))
}

#[async_trait]
impl SentimentSource for AlternativeMeSentimentSource {
    async fn fetch_index(&self) -> Result<RiskIndex, SentimentError> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| SentimentError::Request(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(SentimentError::Request(format!("HTTP {}", status)));
        }

        let body = response
            .text()
            .await
            .map_err(|e| SentimentError::Request(e.to_string()))?;
        let index = Self::parse(&body)?;
        debug!("Fear & Greed reading {} ({})", index.value(), index.classification());
        Ok(index)
    }
}
