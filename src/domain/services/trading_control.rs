//! Operator pause switches. Pausing blocks new opens only; monitoring and closes continue.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::{info, warn};

use crate::domain::entities::exchange::Exchange;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradingStatus {
    pub paused: bool,
    pub paused_exchanges: Vec<Exchange>,
}

#[derive(Debug, Default)]
pub struct TradingControl {
    global_pause: AtomicBool,
    paused_exchanges: Mutex<BTreeSet<Exchange>>,
}

impl TradingControl {
    pub fn new() -> Self {
        Self::default()
    }

    fn exchanges(&self) -> std::sync::MutexGuard<'_, BTreeSet<Exchange>> {
        match self.paused_exchanges.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn pause(&self, exchange: Option<Exchange>) {
        match exchange {
            Some(exchange) => {
                self.exchanges().insert(exchange);
                warn!("Trading paused on {}", exchange);
            }
            None => {
                self.global_pause.store(true, Ordering::SeqCst);
                warn!("Trading paused globally");
            }
        }
    }

    pub fn resume(&self, exchange: Option<Exchange>) {
        match exchange {
            Some(exchange) => {
                self.exchanges().remove(&exchange);
                info!("Trading resumed on {}", exchange);
            }
            None => {
                self.global_pause.store(false, Ordering::SeqCst);
                info!("Trading resumed globally");
            }
        }
    }

    pub fn is_paused(&self) -> bool {
        self.global_pause.load(Ordering::SeqCst)
    }

    /// True if opens on `exchange` are blocked, globally or individually
    pub fn is_exchange_paused(&self, exchange: Exchange) -> bool {
        self.is_paused() || self.exchanges().contains(&exchange)
    }

    pub fn status(&self) -> TradingStatus {
        TradingStatus {
            paused: self.is_paused(),
            paused_exchanges: self.exchanges().iter().copied().collect(),
        }
    }
}
