//! Last-trade prices from the public Binance ticker endpoint

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;

use crate::domain::repositories::price_feed::{PriceFeed, PriceFeedError};

const BINANCE_API_BASE: &str = "https://api.binance.com";

#[derive(Debug, Deserialize)]
struct TickerPrice {
    symbol: String,
    price: String,
}

pub struct BinanceTickerPriceFeed {
    client: Client,
    api_base: String,
}

impl BinanceTickerPriceFeed {
    pub fn new() -> Self {
        Self::with_base(BINANCE_API_BASE)
    }

    pub fn with_base(api_base: &str) -> Self {
        Self {
            client: Client::new(),
            api_base: api_base.trim_end_matches('/').to_string(),
        }
    }

    /// `BTC-USDT`, `btc/usdt` and `BTCUSDT` all map to `BTCUSDT`
    pub fn normalize_symbol(symbol: &str) -> String {
        symbol
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_uppercase()
    }

    pub fn parse(symbol: &str, body: &str) -> Result<f64, PriceFeedError> {
        let ticker: TickerPrice =
            serde_json::from_str(body).map_err(|e| PriceFeedError::Malformed(e.to_string()))?;
        if ticker.symbol != Self::normalize_symbol(symbol) {
            return Err(PriceFeedError::Malformed(format!(
                "asked for {}, got {}",
                symbol, ticker.symbol
            )));
        }
        let price: f64 = ticker
            .price
            .parse()
            .map_err(|_| PriceFeedError::Malformed(format!("price '{}' is not a number", ticker.price)))?;
        if !price.is_finite() || price <= 0.0 {
            return Err(PriceFeedError::Malformed(format!("price {} out of range", price)));
        }
        Ok(price)
    }
}

impl Default for BinanceTickerPriceFeed {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PriceFeed for BinanceTickerPriceFeed {
    async fn latest_price(&self, symbol: &str) -> Result<f64, PriceFeedError> {
        let url = format!(
            "{}/api/v3/ticker/price?symbol={}",
            self.api_base,
            Self::normalize_symbol(symbol)
        );
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| PriceFeedError::Request(e.to_string()))?;

        match response.status() {
            s if s.is_success() => {}
            StatusCode::BAD_REQUEST | StatusCode::NOT_FOUND => {
                return Err(PriceFeedError::UnknownSymbol(symbol.to_string()))
            }
            s => return Err(PriceFeedError::Request(format!("HTTP {}", s))),
        }

        let body = response
            .text()
            .await
            .map_err(|e| PriceFeedError::Request(e.to_string()))?;
        Self::parse(symbol, &body)
    }
}
