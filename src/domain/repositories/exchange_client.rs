//! Exchange Client Trait
//!
//! Common interface for placing and flattening market positions on one exchange.
//! Wire protocols, signing and SDKs live behind implementations of this trait.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::domain::entities::credential::ExchangeCredential;
use crate::domain::entities::exchange::Exchange;
use crate::domain::entities::order::Order;
use crate::domain::entities::position::ExecutionReceipt;

/// Common result type for exchange operations
pub type ExchangeResult<T> = Result<T, ExchangeError>;

/// Errors that can occur during exchange operations
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExchangeError {
    #[error("Order placement failed: {0}")]
    OrderPlacementFailed(String),

    #[error("Position close failed: {0}")]
    CloseFailed(String),

    #[error("Authentication error: {0}")]
    AuthenticationError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Invalid order: {0}")]
    InvalidOrder(String),

    #[error("Exchange call timed out after {0}ms")]
    Timeout(u64),

    #[error("No client registered for {0}")]
    Unsupported(Exchange),
}

impl ExchangeError {
    /// Whether retrying the same call can succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExchangeError::NetworkError(_) | ExchangeError::Timeout(_) | ExchangeError::CloseFailed(_)
        )
    }
}

#[async_trait]
pub trait ExchangeClient: Send + Sync {
    fn exchange(&self) -> Exchange;

    /// Place a market order; the receipt carries the fill
    async fn place_order(
        &self,
        credential: &ExchangeCredential,
        order: &Order,
    ) -> ExchangeResult<ExecutionReceipt>;

    /// Flatten the exposure recorded in `receipt`; returns the closing order id
    async fn close_position(
        &self,
        credential: &ExchangeCredential,
        receipt: &ExecutionReceipt,
        order: &Order,
    ) -> ExchangeResult<String>;
}

/// Clients keyed by the exchange they talk to
#[derive(Clone, Default)]
pub struct ExchangeRegistry {
    clients: HashMap<Exchange, Arc<dyn ExchangeClient>>,
}

impl ExchangeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, client: Arc<dyn ExchangeClient>) {
        self.clients.insert(client.exchange(), client);
    }

    pub fn with(mut self, client: Arc<dyn ExchangeClient>) -> Self {
        self.register(client);
        self
    }

    pub fn get(&self, exchange: Exchange) -> ExchangeResult<Arc<dyn ExchangeClient>> {
        self.clients
            .get(&exchange)
            .cloned()
            .ok_or(ExchangeError::Unsupported(exchange))
    }

    pub fn exchanges(&self) -> Vec<Exchange> {
        self.clients.keys().copied().collect()
    }
}

impl std::fmt::Debug for ExchangeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeRegistry")
            .field("exchanges", &self.exchanges())
            .finish()
    }
}
