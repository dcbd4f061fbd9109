//! Append-only money records produced by settlement

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::domain::entities::exchange::Exchange;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerKind {
    /// Commission debited on a profitable close
    Commission,
    /// Operator correction
    Adjustment,
}

impl LedgerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerKind::Commission => "commission",
            LedgerKind::Adjustment => "adjustment",
        }
    }
}

impl FromStr for LedgerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "commission" => Ok(LedgerKind::Commission),
            "adjustment" => Ok(LedgerKind::Adjustment),
            other => Err(format!("Unknown ledger kind: {}", other)),
        }
    }
}

/// Signed credit (positive) or debit (negative). Never updated once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: String,
    pub user_id: String,
    pub position_id: Option<String>,
    pub kind: LedgerKind,
    pub amount: f64,
    pub currency: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommissionRecord {
    pub id: String,
    pub user_id: String,
    pub position_id: String,
    pub rate: f64,
    pub pnl: f64,
    pub amount: f64,
    pub currency: String,
    pub created_at: DateTime<Utc>,
}

/// Exchange-side close that exhausted its retries and needs an operator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationFlag {
    pub position_id: String,
    pub exchange: Exchange,
    pub credential_id: String,
    pub order_id: String,
    pub attempts: u32,
    pub reason: String,
    pub flagged_at: DateTime<Utc>,
}

/// Balance derived from a user's entries
pub fn balance_of(entries: &[LedgerEntry]) -> f64 {
    entries.iter().map(|e| e.amount).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(amount: f64) -> LedgerEntry {
        LedgerEntry {
            id: format!("led_{}", amount),
            user_id: "u1".to_string(),
            position_id: None,
            kind: LedgerKind::Adjustment,
            amount,
            currency: "USDT".to_string(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_balance_is_sum_of_entries() {
        assert_eq!(balance_of(&[]), 0.0);
        assert_eq!(balance_of(&[entry(100.0), entry(-20.0), entry(-5.5)]), 74.5);
    }

    #[test]
    fn test_ledger_kind_round_trip() {
        for kind in [LedgerKind::Commission, LedgerKind::Adjustment] {
            assert_eq!(kind.as_str().parse::<LedgerKind>().unwrap(), kind);
        }
    }
}
