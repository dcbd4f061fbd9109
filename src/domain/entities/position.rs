use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::domain::entities::exchange::Exchange;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// +1 for LONG, -1 for SHORT
    pub fn sign(&self) -> f64 {
        match self {
            PositionSide::Long => 1.0,
            PositionSide::Short => -1.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PositionSide::Long => "LONG",
            PositionSide::Short => "SHORT",
        }
    }
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PositionSide {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "LONG" | "BUY" => Ok(PositionSide::Long),
            "SHORT" | "SELL" => Ok(PositionSide::Short),
            other => Err(format!("Unknown position side: {}", other)),
        }
    }
}

/// Lifecycle state: opening -> open -> closing -> closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionStatus {
    Opening,
    Open,
    Closing,
    Closed,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Opening => "opening",
            PositionStatus::Open => "open",
            PositionStatus::Closing => "closing",
            PositionStatus::Closed => "closed",
        }
    }
}

impl FromStr for PositionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "opening" => Ok(PositionStatus::Opening),
            "open" => Ok(PositionStatus::Open),
            "closing" => Ok(PositionStatus::Closing),
            "closed" => Ok(PositionStatus::Closed),
            other => Err(format!("Unknown position status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    StopLoss,
    TakeProfit,
    TrailingStop,
    Timeout,
    Manual,
    Emergency,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::StopLoss => "stop_loss",
            CloseReason::TakeProfit => "take_profit",
            CloseReason::TrailingStop => "trailing_stop",
            CloseReason::Timeout => "timeout",
            CloseReason::Manual => "manual",
            CloseReason::Emergency => "emergency",
        }
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CloseReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stop_loss" => Ok(CloseReason::StopLoss),
            "take_profit" => Ok(CloseReason::TakeProfit),
            "trailing_stop" => Ok(CloseReason::TrailingStop),
            "timeout" => Ok(CloseReason::Timeout),
            "manual" => Ok(CloseReason::Manual),
            "emergency" => Ok(CloseReason::Emergency),
            other => Err(format!("Unknown close reason: {}", other)),
        }
    }
}

/// Proof of a fill on one exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReceipt {
    pub exchange: Exchange,
    pub credential_id: String,
    pub order_id: String,
    pub filled_quantity: f64,
    pub filled_price: f64,
    pub placed_at: DateTime<Utc>,
}

/// Trailing stop state. The threshold only ever moves in the position's favor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrailingStop {
    /// Distance behind the best price, as a fraction (0.01 = 1%)
    pub offset_pct: f64,
    /// Best favorable price seen since open
    pub best_price: f64,
    pub threshold: f64,
}

impl TrailingStop {
    pub fn new(side: PositionSide, entry_price: f64, offset_pct: f64) -> Self {
        Self {
            offset_pct,
            best_price: entry_price,
            threshold: Self::threshold_behind(side, entry_price, offset_pct),
        }
    }

    fn threshold_behind(side: PositionSide, best: f64, offset_pct: f64) -> f64 {
        match side {
            PositionSide::Long => best * (1.0 - offset_pct),
            PositionSide::Short => best * (1.0 + offset_pct),
        }
    }

    /// Fold a new market price into the state
    pub fn advance(&self, side: PositionSide, price: f64) -> TrailingStop {
        let best_price = match side {
            PositionSide::Long => self.best_price.max(price),
            PositionSide::Short => self.best_price.min(price),
        };
        let candidate = Self::threshold_behind(side, best_price, self.offset_pct);
        let threshold = match side {
            PositionSide::Long => self.threshold.max(candidate),
            PositionSide::Short => self.threshold.min(candidate),
        };
        TrailingStop {
            offset_pct: self.offset_pct,
            best_price,
            threshold,
        }
    }

    /// Most favorable combination of two states for the same position
    pub fn merge(&self, side: PositionSide, other: &TrailingStop) -> TrailingStop {
        match side {
            PositionSide::Long => TrailingStop {
                offset_pct: self.offset_pct,
                best_price: self.best_price.max(other.best_price),
                threshold: self.threshold.max(other.threshold),
            },
            PositionSide::Short => TrailingStop {
                offset_pct: self.offset_pct,
                best_price: self.best_price.min(other.best_price),
                threshold: self.threshold.min(other.threshold),
            },
        }
    }

    pub fn is_triggered(&self, side: PositionSide, price: f64) -> bool {
        match side {
            PositionSide::Long => price <= self.threshold,
            PositionSide::Short => price >= self.threshold,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosingData {
    pub exit_price: f64,
    pub pnl: f64,
    pub reason: CloseReason,
    pub closed_at: DateTime<Utc>,
}

/// One open-to-close exposure for a user, possibly spread over several exchanges
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub user_id: String,
    pub symbol: String,
    pub side: PositionSide,
    pub entry_price: f64,
    pub quantity: f64,
    pub leverage: f64,
    pub stop_loss_price: f64,
    pub take_profit_price: f64,
    pub trailing: Option<TrailingStop>,
    pub opened_at: DateTime<Utc>,
    pub status: PositionStatus,
    pub receipts: Vec<ExecutionReceipt>,
    pub closing: Option<ClosingData>,
    pub signal_source: String,
}

impl Position {
    /// Position in the `opening` state, before any exchange placement
    #[allow(clippy::too_many_arguments)]
    pub fn opening(
        id: String,
        user_id: String,
        symbol: String,
        side: PositionSide,
        entry_price: f64,
        quantity: f64,
        leverage: f64,
        stop_loss_price: f64,
        take_profit_price: f64,
        opened_at: DateTime<Utc>,
    ) -> Self {
        Position {
            id,
            user_id,
            symbol,
            side,
            entry_price,
            quantity,
            leverage,
            stop_loss_price,
            take_profit_price,
            trailing: None,
            opened_at,
            status: PositionStatus::Opening,
            receipts: Vec::new(),
            closing: None,
            signal_source: String::new(),
        }
    }

    pub fn with_trailing_stop(mut self, offset_pct: f64) -> Self {
        self.trailing = Some(TrailingStop::new(self.side, self.entry_price, offset_pct));
        self
    }

    pub fn is_active(&self) -> bool {
        matches!(self.status, PositionStatus::Open | PositionStatus::Closing)
    }

    pub fn is_closed(&self) -> bool {
        self.status == PositionStatus::Closed
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now.signed_duration_since(self.opened_at)
    }

    /// Realized PnL if the position were closed at `exit_price`
    pub fn pnl_at(&self, exit_price: f64) -> f64 {
        (exit_price - self.entry_price) * self.quantity * self.leverage * self.side.sign()
    }

    pub fn unrealized_pnl(&self, current_price: f64) -> f64 {
        self.pnl_at(current_price)
    }

    pub fn notional(&self) -> f64 {
        self.entry_price * self.quantity
    }

    pub fn should_stop_loss(&self, price: f64) -> bool {
        match self.side {
            PositionSide::Long => price <= self.stop_loss_price,
            PositionSide::Short => price >= self.stop_loss_price,
        }
    }

    pub fn should_take_profit(&self, price: f64) -> bool {
        match self.side {
            PositionSide::Long => price >= self.take_profit_price,
            PositionSide::Short => price <= self.take_profit_price,
        }
    }

    /// Mark closed in memory; persistence happens through the settlement commit
    pub fn close(&mut self, exit_price: f64, reason: CloseReason, closed_at: DateTime<Utc>) {
        let pnl = self.pnl_at(exit_price);
        self.status = PositionStatus::Closed;
        self.closing = Some(ClosingData {
            exit_price,
            pnl,
            reason,
            closed_at,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position(side: PositionSide) -> Position {
        let (stop, target) = match side {
            PositionSide::Long => (47500.0, 55000.0),
            PositionSide::Short => (52500.0, 45000.0),
        };
        Position::opening(
            "pos_1".to_string(),
            "user_1".to_string(),
            "BTCUSDT".to_string(),
            side,
            50000.0,
            1.0,
            1.0,
            stop,
            target,
            Utc::now(),
        )
    }

    #[test]
    fn test_position_opening() {
        let position = position(PositionSide::Long);
        assert_eq!(position.id, "pos_1");
        assert_eq!(position.status, PositionStatus::Opening);
        assert!(!position.is_active());
        assert!(position.receipts.is_empty());
        assert!(position.closing.is_none());
    }

    #[test]
    fn test_position_pnl_long() {
        let position = position(PositionSide::Long);
        assert_eq!(position.pnl_at(55000.0), 5000.0);
        assert_eq!(position.pnl_at(45000.0), -5000.0);
    }

    #[test]
    fn test_position_pnl_short() {
        let position = position(PositionSide::Short);
        assert_eq!(position.pnl_at(45000.0), 5000.0);
        assert_eq!(position.pnl_at(55000.0), -5000.0);
    }

    #[test]
    fn test_pnl_scales_with_leverage() {
        let mut position = position(PositionSide::Long);
        position.leverage = 5.0;
        assert_eq!(position.pnl_at(51000.0), 5000.0);
    }

    #[test]
    fn test_position_stop_loss_long() {
        let position = position(PositionSide::Long);
        assert!(!position.should_stop_loss(48000.0));
        assert!(position.should_stop_loss(47500.0));
    }

    #[test]
    fn test_position_take_profit_short() {
        let position = position(PositionSide::Short);
        assert!(!position.should_take_profit(46000.0));
        assert!(position.should_take_profit(45000.0));
    }

    #[test]
    fn test_close_records_reason_and_pnl() {
        let mut position = position(PositionSide::Long);
        position.status = PositionStatus::Open;
        let now = Utc::now();
        position.close(51000.0, CloseReason::Manual, now);

        assert!(position.is_closed());
        let closing = position.closing.unwrap();
        assert_eq!(closing.pnl, 1000.0);
        assert_eq!(closing.reason, CloseReason::Manual);
        assert_eq!(closing.closed_at, now);
    }

    #[test]
    fn test_trailing_stop_never_regresses_long() {
        let trailing = TrailingStop::new(PositionSide::Long, 100.0, 0.01);
        assert!((trailing.threshold - 99.0).abs() < 1e-9);

        let up = trailing.advance(PositionSide::Long, 110.0);
        assert_eq!(up.best_price, 110.0);
        assert!((up.threshold - 108.9).abs() < 1e-9);

        let down = up.advance(PositionSide::Long, 105.0);
        assert_eq!(down.best_price, 110.0);
        assert_eq!(down.threshold, up.threshold);
        assert!(down.is_triggered(PositionSide::Long, 105.0));
    }

    #[test]
    fn test_trailing_stop_short_moves_down_only() {
        let trailing = TrailingStop::new(PositionSide::Short, 100.0, 0.02);
        let down = trailing.advance(PositionSide::Short, 90.0);
        assert!((down.threshold - 91.8).abs() < 1e-9);

        let bounce = down.advance(PositionSide::Short, 95.0);
        assert_eq!(bounce.threshold, down.threshold);
        assert!(bounce.is_triggered(PositionSide::Short, 95.0));
        assert!(!bounce.is_triggered(PositionSide::Short, 91.0));
    }

    #[test]
    fn test_trailing_merge_keeps_most_favorable() {
        let a = TrailingStop::new(PositionSide::Long, 100.0, 0.01).advance(PositionSide::Long, 120.0);
        let b = TrailingStop::new(PositionSide::Long, 100.0, 0.01).advance(PositionSide::Long, 110.0);
        let merged = b.merge(PositionSide::Long, &a);
        assert_eq!(merged.best_price, 120.0);
        assert_eq!(merged.threshold, a.threshold);
    }

    #[test]
    fn test_enum_string_round_trip() {
        assert_eq!("stop_loss".parse::<CloseReason>().unwrap(), CloseReason::StopLoss);
        assert_eq!("closing".parse::<PositionStatus>().unwrap(), PositionStatus::Closing);
        assert_eq!("short".parse::<PositionSide>().unwrap(), PositionSide::Short);
    }
}
