use serde::{Deserialize, Serialize};

use crate::domain::entities::position::PositionSide;
use crate::domain::errors::ValidationError;

/// Realized or unrealized profit and loss. May be negative, never NaN.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct PnL(f64);

impl PnL {
    pub fn new(value: f64) -> Result<Self, ValidationError> {
        if !value.is_finite() {
            return Err(ValidationError::MustBeFinite);
        }
        Ok(PnL(value))
    }

    /// `(exit - entry) * quantity * leverage`, sign flipped for SHORT
    pub fn of_trade(
        side: PositionSide,
        entry_price: f64,
        exit_price: f64,
        quantity: f64,
        leverage: f64,
    ) -> Result<Self, ValidationError> {
        PnL::new((exit_price - entry_price) * quantity * leverage * side.sign())
    }

    pub fn zero() -> Self {
        PnL(0.0)
    }

    pub fn value(&self) -> f64 {
        self.0
    }

    pub fn is_profit(&self) -> bool {
        self.0 > 0.0
    }

    pub fn is_loss(&self) -> bool {
        self.0 < 0.0
    }

    pub fn abs(&self) -> f64 {
        self.0.abs()
    }

    /// Commission owed at `rate`; zero unless the trade was profitable
    pub fn commission(&self, rate: f64) -> f64 {
        if self.is_profit() {
            self.0 * rate
        } else {
            0.0
        }
    }
}

impl std::fmt::Display for PnL {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0 >= 0.0 {
            write!(f, "+${:.2}", self.0)
        } else {
            write!(f, "-${:.2}", self.0.abs())
        }
    }
}

impl std::ops::Add for PnL {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        PnL(self.0 + other.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pnl_of_long_and_short() {
        let long = PnL::of_trade(PositionSide::Long, 100.0, 110.0, 2.0, 1.0).unwrap();
        assert_eq!(long.value(), 20.0);
        let short = PnL::of_trade(PositionSide::Short, 100.0, 110.0, 2.0, 1.0).unwrap();
        assert_eq!(short.value(), -20.0);
    }

    #[test]
    fn test_pnl_leverage() {
        let pnl = PnL::of_trade(PositionSide::Short, 100.0, 90.0, 1.0, 3.0).unwrap();
        assert_eq!(pnl.value(), 30.0);
    }

    #[test]
    fn test_commission_only_on_profit() {
        assert!((PnL::new(100.0).unwrap().commission(0.2) - 20.0).abs() < 1e-9);
        assert_eq!(PnL::new(-100.0).unwrap().commission(0.2), 0.0);
        assert_eq!(PnL::zero().commission(0.2), 0.0);
    }

    #[test]
    fn test_pnl_invalid() {
        assert!(PnL::new(f64::NAN).is_err());
        assert!(PnL::new(f64::INFINITY).is_err());
    }

    #[test]
    fn test_pnl_display() {
        assert_eq!(format!("{}", PnL::new(1234.56).unwrap()), "+$1234.56");
        assert_eq!(format!("{}", PnL::new(-789.12).unwrap()), "-$789.12");
    }

    #[test]
    fn test_pnl_add() {
        let total = PnL::new(1000.0).unwrap() + PnL::new(-300.0).unwrap();
        assert_eq!(total.value(), 700.0);
    }
}
