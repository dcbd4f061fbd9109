use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum PriceFeedError {
    #[error("No price available for {0}")]
    UnknownSymbol(String),

    #[error("Price request failed: {0}")]
    Request(String),

    #[error("Malformed price payload: {0}")]
    Malformed(String),
}

/// Source of the latest traded price per symbol
#[async_trait]
pub trait PriceFeed: Send + Sync {
    async fn latest_price(&self, symbol: &str) -> Result<f64, PriceFeedError>;
}
