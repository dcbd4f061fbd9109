//! Paper-trading collaborators: an exchange that fills at the reference price, a scripted
//! price feed and a settable sentiment source. Used for dry runs and by the test suites.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

use crate::domain::entities::credential::ExchangeCredential;
use crate::domain::entities::exchange::Exchange;
use crate::domain::entities::order::Order;
use crate::domain::entities::position::ExecutionReceipt;
use crate::domain::entities::risk_index::RiskIndex;
use crate::domain::repositories::exchange_client::{ExchangeClient, ExchangeError, ExchangeResult};
use crate::domain::repositories::price_feed::{PriceFeed, PriceFeedError};
use crate::domain::repositories::sentiment_source::{SentimentError, SentimentSource};

fn locked<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Debug, Clone, Default)]
struct Faults {
    placement: Option<String>,
    close: Option<String>,
    /// Close attempts that fail before closes start succeeding
    close_failures_left: Option<u32>,
    placement_delay: Option<Duration>,
    close_delay: Option<Duration>,
}

/// Exchange double that fills every order in full at its reference price
#[derive(Debug)]
pub struct SimulatedExchangeClient {
    exchange: Exchange,
    faults: Mutex<Faults>,
    placed: Mutex<Vec<Order>>,
    closed: Mutex<Vec<Order>>,
    close_attempts: AtomicUsize,
    next_order: AtomicU64,
}

impl SimulatedExchangeClient {
    pub fn new(exchange: Exchange) -> Self {
        Self {
            exchange,
            faults: Mutex::new(Faults::default()),
            placed: Mutex::new(Vec::new()),
            closed: Mutex::new(Vec::new()),
            close_attempts: AtomicUsize::new(0),
            next_order: AtomicU64::new(1),
        }
    }

    /// Reject every placement with `reason`
    pub fn reject_placements(self, reason: impl Into<String>) -> Self {
        locked(&self.faults).placement = Some(reason.into());
        self
    }

    /// Fail every close with a retryable error
    pub fn fail_closes(self, reason: impl Into<String>) -> Self {
        locked(&self.faults).close = Some(reason.into());
        self
    }

    /// Fail the first `count` close attempts, then succeed
    pub fn fail_first_closes(self, count: u32) -> Self {
        locked(&self.faults).close_failures_left = Some(count);
        self
    }

    pub fn delay_placements(self, delay: Duration) -> Self {
        locked(&self.faults).placement_delay = Some(delay);
        self
    }

    /// Stall every close attempt for `delay` before answering
    pub fn delay_closes(self, delay: Duration) -> Self {
        locked(&self.faults).close_delay = Some(delay);
        self
    }

    pub fn placed_orders(&self) -> Vec<Order> {
        locked(&self.placed).clone()
    }

    pub fn closed_orders(&self) -> Vec<Order> {
        locked(&self.closed).clone()
    }

    pub fn close_attempts(&self) -> usize {
        self.close_attempts.load(Ordering::SeqCst)
    }

    fn order_id(&self) -> String {
        format!(
            "{}-{}",
            self.exchange,
            self.next_order.fetch_add(1, Ordering::Relaxed)
        )
    }
}

#[async_trait]
impl ExchangeClient for SimulatedExchangeClient {
    fn exchange(&self) -> Exchange {
        self.exchange
    }

    async fn place_order(
        &self,
        credential: &ExchangeCredential,
        order: &Order,
    ) -> ExchangeResult<ExecutionReceipt> {
        let faults = locked(&self.faults).clone();
        if let Some(delay) = faults.placement_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(reason) = faults.placement {
            return Err(ExchangeError::OrderPlacementFailed(reason));
        }

        locked(&self.placed).push(order.clone());
        let order_id = self.order_id();
        debug!("{} filled {} for {}", self.exchange, order.client_order_id, credential.id);

        Ok(ExecutionReceipt {
            exchange: self.exchange,
            credential_id: credential.id.clone(),
            order_id,
            filled_quantity: order.quantity.value(),
            filled_price: order.reference_price.value(),
            placed_at: Utc::now(),
        })
    }

    async fn close_position(
        &self,
        _credential: &ExchangeCredential,
        _receipt: &ExecutionReceipt,
        order: &Order,
    ) -> ExchangeResult<String> {
        self.close_attempts.fetch_add(1, Ordering::SeqCst);
        let delay = locked(&self.faults).close_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        {
            let mut faults = locked(&self.faults);
            if let Some(reason) = &faults.close {
                return Err(ExchangeError::CloseFailed(reason.clone()));
            }
            if let Some(left) = faults.close_failures_left.as_mut() {
                if *left > 0 {
                    *left -= 1;
                    return Err(ExchangeError::NetworkError("connection reset".to_string()));
                }
            }
        }

        locked(&self.closed).push(order.clone());
        Ok(self.order_id())
    }
}

/// Price feed that replays a per-symbol script. The last scripted price repeats.
#[derive(Debug, Default)]
pub struct ScriptedPriceFeed {
    scripts: Mutex<HashMap<String, VecDeque<f64>>>,
    failing: Mutex<HashSet<String>>,
    calls: AtomicUsize,
}

impl ScriptedPriceFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_price(&self, symbol: &str, price: f64) {
        self.script(symbol, [price]);
    }

    pub fn script(&self, symbol: &str, prices: impl IntoIterator<Item = f64>) {
        locked(&self.failing).remove(symbol);
        locked(&self.scripts).insert(symbol.to_string(), prices.into_iter().collect());
    }

    pub fn fail(&self, symbol: &str) {
        locked(&self.failing).insert(symbol.to_string());
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PriceFeed for ScriptedPriceFeed {
    async fn latest_price(&self, symbol: &str) -> Result<f64, PriceFeedError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if locked(&self.failing).contains(symbol) {
            return Err(PriceFeedError::Request(format!("{} feed unavailable", symbol)));
        }

        let mut scripts = locked(&self.scripts);
        let script = scripts
            .get_mut(symbol)
            .ok_or_else(|| PriceFeedError::UnknownSymbol(symbol.to_string()))?;
        let price = if script.len() > 1 {
            script.pop_front()
        } else {
            script.front().copied()
        };
        price.ok_or_else(|| PriceFeedError::UnknownSymbol(symbol.to_string()))
    }
}

/// Sentiment source with a settable reading; `None` simulates an outage
#[derive(Debug, Default)]
pub struct FixedSentimentSource {
    reading: Mutex<Option<f64>>,
}

impl FixedSentimentSource {
    pub fn new(value: f64) -> Self {
        Self {
            reading: Mutex::new(Some(value)),
        }
    }

    pub fn unavailable() -> Self {
        Self::default()
    }

    pub fn set(&self, value: Option<f64>) {
        *locked(&self.reading) = value;
    }
}

#[async_trait]
impl SentimentSource for FixedSentimentSource {
    async fn fetch_index(&self) -> Result<RiskIndex, SentimentError> {
        let value = (*locked(&self.reading))
            .ok_or_else(|| SentimentError::Request("sentiment source offline".to_string()))?;
        let classification = match value {
            v if v < 25.0 => "Extreme Fear",
            v if v < 45.0 => "Fear",
            v if v <= 55.0 => "Neutral",
            v if v <= 75.0 => "Greed",
            _ => "Extreme Greed",
        };
        RiskIndex::new(value, classification, Utc::now())
            .map_err(|e| SentimentError::Malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::position::PositionSide;
    use crate::domain::value_objects::price::Price;
    use crate::domain::value_objects::quantity::Quantity;

    fn order() -> Order {
        Order::market_open(
            "pos_1",
            "cred_1",
            "BTCUSDT",
            PositionSide::Long,
            Quantity::new(0.5).unwrap(),
            Price::new(100.0).unwrap(),
            1.0,
        )
    }

    #[tokio::test]
    async fn test_fills_at_reference_price() {
        let client = SimulatedExchangeClient::new(Exchange::Binance);
        let credential = ExchangeCredential::new("cred_1", "u1", Exchange::Binance);
        let receipt = client.place_order(&credential, &order()).await.unwrap();

        assert_eq!(receipt.filled_price, 100.0);
        assert_eq!(receipt.filled_quantity, 0.5);
        assert_eq!(receipt.credential_id, "cred_1");
        assert_eq!(client.placed_orders().len(), 1);
    }

    #[tokio::test]
    async fn test_transient_close_failures_then_success() {
        let client = SimulatedExchangeClient::new(Exchange::Bybit).fail_first_closes(2);
        let credential = ExchangeCredential::new("cred_1", "u1", Exchange::Bybit);
        let receipt = client.place_order(&credential, &order()).await.unwrap();

        assert!(client.close_position(&credential, &receipt, &order()).await.is_err());
        assert!(client.close_position(&credential, &receipt, &order()).await.is_err());
        assert!(client.close_position(&credential, &receipt, &order()).await.is_ok());
        assert_eq!(client.close_attempts(), 3);
    }

    #[tokio::test]
    async fn test_scripted_feed_repeats_last_price() {
        let feed = ScriptedPriceFeed::new();
        feed.script("BTCUSDT", [101.0, 99.0]);
        assert_eq!(feed.latest_price("BTCUSDT").await.unwrap(), 101.0);
        assert_eq!(feed.latest_price("BTCUSDT").await.unwrap(), 99.0);
        assert_eq!(feed.latest_price("BTCUSDT").await.unwrap(), 99.0);
        assert!(feed.latest_price("ETHUSDT").await.is_err());

        feed.fail("BTCUSDT");
        assert!(feed.latest_price("BTCUSDT").await.is_err());
    }

    #[tokio::test]
    async fn test_sentiment_outage() {
        let source = FixedSentimentSource::new(20.0);
        assert_eq!(source.fetch_index().await.unwrap().classification(), "Extreme Fear");
        source.set(None);
        assert!(source.fetch_index().await.is_err());
    }
}
