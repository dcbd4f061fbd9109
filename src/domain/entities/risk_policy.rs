//! Per-user risk policy, supplied by the account layer and read-only to the engine

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};

/// Daily window in UTC. A window whose end precedes its start wraps past midnight.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TradingHours {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TradingHours {
    pub fn contains(&self, time: NaiveTime) -> bool {
        if self.start <= self.end {
            time >= self.start && time < self.end
        } else {
            time >= self.start || time < self.end
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskPolicy {
    pub max_open_positions: usize,
    pub max_daily_trades: usize,
    /// Maximum realized loss per UTC day, in quote currency
    pub max_daily_loss: f64,
    /// Fraction of the free balance committed per position (0.05 = 5%)
    pub position_size_percent: f64,
    pub min_trade_usd: f64,
    pub max_trade_usd: f64,
    pub min_account_balance: f64,
    /// Stop distance from entry as a fraction
    pub stop_loss_pct: f64,
    /// Target distance from entry as a fraction
    pub take_profit_pct: f64,
    pub leverage: f64,
    pub trailing_stop: bool,
    /// Overrides the engine-wide trailing offset when set
    pub trailing_offset_pct: Option<f64>,
    pub whitelist: Vec<String>,
    pub blacklist: Vec<String>,
    pub trading_hours: Option<TradingHours>,
    pub allow_weekends: bool,
    pub allow_holidays: bool,
    pub holidays: Vec<NaiveDate>,
    pub min_signal_confidence: f64,
    pub quote_asset: String,
}

impl Default for RiskPolicy {
    fn default() -> Self {
        Self {
            max_open_positions: 5,
            max_daily_trades: 20,
            max_daily_loss: 500.0,
            position_size_percent: 0.05,
            min_trade_usd: 10.0,
            max_trade_usd: 1000.0,
            min_account_balance: 50.0,
            stop_loss_pct: 0.02,
            take_profit_pct: 0.06,
            leverage: 1.0,
            trailing_stop: false,
            trailing_offset_pct: None,
            whitelist: Vec::new(),
            blacklist: Vec::new(),
            trading_hours: None,
            allow_weekends: true,
            allow_holidays: true,
            holidays: Vec::new(),
            min_signal_confidence: 0.0,
            quote_asset: "USDT".to_string(),
        }
    }
}

impl RiskPolicy {
    /// Trading-hours, weekend and holiday checks
    pub fn check_trading_window(&self, now: DateTime<Utc>) -> Result<(), String> {
        let date = now.date_naive();

        if !self.allow_weekends && matches!(date.weekday(), Weekday::Sat | Weekday::Sun) {
            return Err(format!("Weekend trading is disabled ({})", date.weekday()));
        }

        if !self.allow_holidays && self.holidays.contains(&date) {
            return Err(format!("Holiday trading is disabled ({})", date));
        }

        if let Some(hours) = &self.trading_hours {
            let time = now.time();
            if !hours.contains(time) {
                return Err(format!(
                    "Outside trading hours: {} not within {}-{} UTC",
                    time.format("%H:%M"),
                    hours.start.format("%H:%M"),
                    hours.end.format("%H:%M")
                ));
            }
        }

        Ok(())
    }

    /// Blacklist first; a non-empty whitelist must contain the symbol
    pub fn check_symbol(&self, symbol: &str) -> Result<(), String> {
        if self.blacklist.iter().any(|s| s.eq_ignore_ascii_case(symbol)) {
            return Err(format!("Symbol {} is blacklisted", symbol));
        }
        if !self.whitelist.is_empty() && !self.whitelist.iter().any(|s| s.eq_ignore_ascii_case(symbol)) {
            return Err(format!("Symbol {} is not in the whitelist", symbol));
        }
        Ok(())
    }

    /// Signals without a confidence score always pass
    pub fn check_confidence(&self, confidence: Option<f64>) -> Result<(), String> {
        match confidence {
            Some(c) if c < self.min_signal_confidence => Err(format!(
                "Signal confidence {:.2} below minimum threshold {:.2}",
                c, self.min_signal_confidence
            )),
            _ => Ok(()),
        }
    }
}
