//! Position sizing result value objects

use serde::{Deserialize, Serialize};

/// Outcome of sizing one entry for one user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SizingResult {
    /// Quote-currency amount committed, after clamping to the trade bounds
    pub notional: f64,
    pub quantity: f64,
    pub entry_price: f64,
    /// Set when the raw percentage fell outside [min_trade_usd, max_trade_usd]
    pub clamped: bool,
}

/// Stop-loss and take-profit prices for a new position
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProtectivePrices {
    pub stop_loss: f64,
    pub take_profit: f64,
}
