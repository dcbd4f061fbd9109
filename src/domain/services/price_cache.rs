//! Per-symbol price cache in front of a `PriceFeed`

use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::domain::errors::EngineError;
use crate::domain::repositories::price_feed::PriceFeed;
use crate::domain::services::snapshot::SnapshotCell;

#[derive(Debug, Clone, Copy)]
struct CachedPrice {
    price: f64,
    fetched_at: Instant,
}

/// Snapshot cache with a short TTL. A miss or stale entry triggers exactly one fetch.
pub struct PriceCache {
    feed: Arc<dyn PriceFeed>,
    snapshot: SnapshotCell<HashMap<String, CachedPrice>>,
    ttl: Duration,
    fetch_timeout: Duration,
}

impl PriceCache {
    pub fn new(feed: Arc<dyn PriceFeed>, ttl: Duration, fetch_timeout: Duration) -> Self {
        Self {
            feed,
            snapshot: SnapshotCell::default(),
            ttl,
            fetch_timeout,
        }
    }

    /// Fresh cached value without touching the feed
    pub fn cached(&self, symbol: &str) -> Option<f64> {
        self.snapshot
            .load()
            .get(symbol)
            .filter(|c| c.fetched_at.elapsed() < self.ttl)
            .map(|c| c.price)
    }

    /// Last fetched value regardless of age, for closes that cannot wait out a feed outage
    pub fn last_known(&self, symbol: &str) -> Option<f64> {
        self.snapshot.load().get(symbol).map(|c| c.price)
    }

    pub async fn price(&self, symbol: &str) -> Result<f64, EngineError> {
        if let Some(price) = self.cached(symbol) {
            return Ok(price);
        }

        let fetched = tokio::time::timeout(self.fetch_timeout, self.feed.latest_price(symbol)).await;
        let price = match fetched {
            Ok(Ok(price)) if price.is_finite() && price > 0.0 => price,
            Ok(Ok(price)) => {
                return Err(EngineError::PriceUnavailable {
                    symbol: symbol.to_string(),
                    reason: format!("feed returned unusable price {}", price),
                })
            }
            Ok(Err(e)) => {
                warn!("Price fetch for {} failed: {}", symbol, e);
                return Err(EngineError::PriceUnavailable {
                    symbol: symbol.to_string(),
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                warn!("Price fetch for {} timed out after {:?}", symbol, self.fetch_timeout);
                return Err(EngineError::PriceUnavailable {
                    symbol: symbol.to_string(),
                    reason: format!("timed out after {}ms", self.fetch_timeout.as_millis()),
                });
            }
        };

        let entry = CachedPrice {
            price,
            fetched_at: Instant::now(),
        };
        self.snapshot.update(|current| {
            let mut next = current.clone();
            next.insert(symbol.to_string(), entry);
            next
        });
        debug!("Cached price {} for {}", price, symbol);
        Ok(price)
    }

    /// Resolve several symbols concurrently; each result stands alone
    pub async fn prices(&self, symbols: &[String]) -> HashMap<String, Result<f64, EngineError>> {
        let lookups = symbols.iter().map(|symbol| async move {
            (symbol.clone(), self.price(symbol).await)
        });
        join_all(lookups).await.into_iter().collect()
    }

    pub fn invalidate(&self, symbol: &str) {
        self.snapshot.update(|current| {
            let mut next = current.clone();
            next.remove(symbol);
            next
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::repositories::price_feed::PriceFeedError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingFeed {
        calls: AtomicUsize,
        price: Option<f64>,
    }

    #[async_trait]
    impl PriceFeed for CountingFeed {
        async fn latest_price(&self, symbol: &str) -> Result<f64, PriceFeedError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.price
                .ok_or_else(|| PriceFeedError::UnknownSymbol(symbol.to_string()))
        }
    }

    struct SlowFeed;

    #[async_trait]
    impl PriceFeed for SlowFeed {
        async fn latest_price(&self, _symbol: &str) -> Result<f64, PriceFeedError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(1.0)
        }
    }

    #[tokio::test]
    async fn test_fresh_entries_skip_the_feed() {
        let feed = Arc::new(CountingFeed {
            calls: AtomicUsize::new(0),
            price: Some(50000.0),
        });
        let cache = PriceCache::new(feed.clone(), Duration::from_secs(30), Duration::from_secs(1));

        assert_eq!(cache.price("BTCUSDT").await.unwrap(), 50000.0);
        assert_eq!(cache.price("BTCUSDT").await.unwrap(), 50000.0);
        assert_eq!(feed.calls.load(Ordering::SeqCst), 1);

        cache.invalidate("BTCUSDT");
        cache.price("BTCUSDT").await.unwrap();
        assert_eq!(feed.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failure_fetches_once_and_reports_unavailable() {
        let feed = Arc::new(CountingFeed {
            calls: AtomicUsize::new(0),
            price: None,
        });
        let cache = PriceCache::new(feed.clone(), Duration::from_secs(30), Duration::from_secs(1));

        let err = cache.price("DOGEUSDT").await.unwrap_err();
        assert!(matches!(err, EngineError::PriceUnavailable { .. }));
        assert_eq!(feed.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_is_unavailable() {
        let cache = PriceCache::new(Arc::new(SlowFeed), Duration::from_secs(30), Duration::from_millis(20));
        let err = cache.price("BTCUSDT").await.unwrap_err();
        assert_eq!(err.error_code(), "ERR_PRICE_UNAVAILABLE");
    }

    #[tokio::test]
    async fn test_last_known_survives_expiry_and_outage() {
        let feed = Arc::new(crate::infrastructure::simulated::ScriptedPriceFeed::new());
        feed.set_price("BTCUSDT", 42000.0);
        let cache = PriceCache::new(feed.clone(), Duration::ZERO, Duration::from_secs(1));

        assert_eq!(cache.last_known("BTCUSDT"), None);
        cache.price("BTCUSDT").await.unwrap();
        feed.fail("BTCUSDT");

        assert!(cache.price("BTCUSDT").await.is_err());
        assert_eq!(cache.cached("BTCUSDT"), None);
        assert_eq!(cache.last_known("BTCUSDT"), Some(42000.0));
    }

    #[tokio::test]
    async fn test_zero_ttl_always_refetches() {
        let feed = Arc::new(CountingFeed {
            calls: AtomicUsize::new(0),
            price: Some(10.0),
        });
        let cache = PriceCache::new(feed.clone(), Duration::ZERO, Duration::from_secs(1));
        let symbols = vec!["A".to_string(), "B".to_string()];
        let results = cache.prices(&symbols).await;
        assert_eq!(results.len(), 2);
        cache.prices(&symbols).await;
        assert_eq!(feed.calls.load(Ordering::SeqCst), 4);
    }
}
