use async_trait::async_trait;
use thiserror::Error;

use crate::domain::entities::risk_index::RiskIndex;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SentimentError {
    #[error("Sentiment request failed: {0}")]
    Request(String),

    #[error("Malformed sentiment payload: {0}")]
    Malformed(String),
}

/// Provider of the market-wide fear/greed reading
#[async_trait]
pub trait SentimentSource: Send + Sync {
    async fn fetch_index(&self) -> Result<RiskIndex, SentimentError>;
}
