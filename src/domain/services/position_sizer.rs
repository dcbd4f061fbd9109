//! Position sizing from balance and per-user policy

use tracing::debug;

use crate::domain::entities::position::PositionSide;
use crate::domain::entities::risk_policy::RiskPolicy;
use crate::domain::errors::EngineError;
use crate::domain::value_objects::position_sizing::{ProtectivePrices, SizingResult};
use crate::domain::value_objects::price::Price;
use crate::domain::value_objects::quantity::Quantity;

pub struct PositionSizer;

impl PositionSizer {
    /// notional = balance x position_size_percent, clamped to [min_trade_usd, max_trade_usd];
    /// quantity = notional / price
    pub fn size(balance: f64, policy: &RiskPolicy, price: f64) -> Result<SizingResult, EngineError> {
        if !balance.is_finite() || balance < policy.min_account_balance {
            return Err(EngineError::InsufficientBalance {
                required: policy.min_account_balance,
                available: if balance.is_finite() { balance } else { 0.0 },
            });
        }

        let entry = Price::new(price).map_err(|_| EngineError::InvalidPrice { price })?;

        let raw = balance * policy.position_size_percent;
        let notional = raw.clamp(policy.min_trade_usd, policy.max_trade_usd.max(policy.min_trade_usd));
        let clamped = (notional - raw).abs() > f64::EPSILON;

        // Margin actually posted on the exchange
        let leverage = policy.leverage.max(1.0);
        let margin = notional / leverage;
        if margin > balance {
            return Err(EngineError::InsufficientBalance {
                required: margin,
                available: balance,
            });
        }

        let quantity = Quantity::from_notional(notional, entry.value())
            .map_err(|_| EngineError::InvalidPrice { price })?;

        debug!(
            "Sized {:.2} notional ({:.6} units at {}) from balance {:.2}{}",
            notional,
            quantity.value(),
            entry,
            balance,
            if clamped { ", clamped" } else { "" }
        );

        Ok(SizingResult {
            notional,
            quantity: quantity.value(),
            entry_price: entry.value(),
            clamped,
        })
    }

    /// Stop below and target above entry for LONG, inverted for SHORT
    pub fn protective_prices(
        side: PositionSide,
        entry: f64,
        policy: &RiskPolicy,
    ) -> Result<ProtectivePrices, EngineError> {
        let entry_price = Price::new(entry).map_err(|_| EngineError::InvalidPrice { price: entry })?;
        if !(policy.stop_loss_pct > 0.0 && policy.stop_loss_pct < 1.0) {
            return Err(EngineError::rejected(format!(
                "Stop-loss distance {} must be within (0, 1)",
                policy.stop_loss_pct
            )));
        }
        if !(policy.take_profit_pct > 0.0 && policy.take_profit_pct.is_finite()) {
            return Err(EngineError::rejected(format!(
                "Take-profit distance {} must be positive",
                policy.take_profit_pct
            )));
        }

        let (stop_offset, target_offset) = match side {
            PositionSide::Long => (-policy.stop_loss_pct, policy.take_profit_pct),
            PositionSide::Short => (policy.stop_loss_pct, -policy.take_profit_pct),
        };

        let invalid = |_| EngineError::InvalidPrice { price: entry };
        Ok(ProtectivePrices {
            stop_loss: entry_price.offset_by(stop_offset).map_err(invalid)?.value(),
            take_profit: entry_price.offset_by(target_offset).map_err(invalid)?.value(),
        })
    }
}
