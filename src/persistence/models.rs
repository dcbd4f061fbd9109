//! Database Models
//!
//! Row types for positions, receipts, ledger entries, commissions and reconciliation flags,
//! with conversions to and from the domain entities.

use chrono::{DateTime, Utc};
use sqlx::FromRow;

use crate::domain::entities::ledger::{CommissionRecord, LedgerEntry, ReconciliationFlag};
use crate::domain::entities::position::{
    ClosingData, ExecutionReceipt, Position, PositionStatus, TrailingStop,
};
use crate::domain::errors::StoreError;

/// Position record in database
#[derive(Debug, Clone, FromRow)]
pub struct PositionRecord {
    pub id: String,
    pub user_id: String,
    pub symbol: String,
    pub side: String, // "LONG" or "SHORT"
    pub entry_price: f64,
    pub quantity: f64,
    pub leverage: f64,
    pub stop_loss_price: f64,
    pub take_profit_price: f64,
    pub trailing_offset: Option<f64>,
    pub trailing_best: Option<f64>,
    pub trailing_threshold: Option<f64>,
    pub status: String,
    pub signal_source: String,
    pub opened_at: DateTime<Utc>,
    pub exit_price: Option<f64>,
    pub realized_pnl: Option<f64>,
    pub close_reason: Option<String>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl PositionRecord {
    pub fn into_position(self, receipts: Vec<ExecutionReceipt>) -> Result<Position, StoreError> {
        let side = self.side.parse().map_err(StoreError::Decode)?;
        let status: PositionStatus = self.status.parse().map_err(StoreError::Decode)?;

        let trailing = match (self.trailing_offset, self.trailing_best, self.trailing_threshold) {
            (Some(offset_pct), Some(best_price), Some(threshold)) => Some(TrailingStop {
                offset_pct,
                best_price,
                threshold,
            }),
            _ => None,
        };

        let closing = match (self.exit_price, self.realized_pnl, self.close_reason, self.closed_at) {
            (Some(exit_price), Some(pnl), Some(reason), Some(closed_at)) => Some(ClosingData {
                exit_price,
                pnl,
                reason: reason.parse().map_err(StoreError::Decode)?,
                closed_at,
            }),
            _ => None,
        };

        if status == PositionStatus::Closed && closing.is_none() {
            return Err(StoreError::Decode(format!(
                "closed position {} has no closing data",
                self.id
            )));
        }

        Ok(Position {
            id: self.id,
            user_id: self.user_id,
            symbol: self.symbol,
            side,
            entry_price: self.entry_price,
            quantity: self.quantity,
            leverage: self.leverage,
            stop_loss_price: self.stop_loss_price,
            take_profit_price: self.take_profit_price,
            trailing,
            opened_at: self.opened_at,
            status,
            receipts,
            closing,
            signal_source: self.signal_source,
        })
    }
}

/// One per-exchange fill belonging to a position
#[derive(Debug, Clone, FromRow)]
pub struct ReceiptRecord {
    pub position_id: String,
    pub exchange: String,
    pub credential_id: String,
    pub order_id: String,
    pub filled_quantity: f64,
    pub filled_price: f64,
    pub placed_at: DateTime<Utc>,
}

impl TryFrom<ReceiptRecord> for ExecutionReceipt {
    type Error = StoreError;

    fn try_from(record: ReceiptRecord) -> Result<Self, Self::Error> {
        Ok(ExecutionReceipt {
            exchange: record.exchange.parse().map_err(StoreError::Decode)?,
            credential_id: record.credential_id,
            order_id: record.order_id,
            filled_quantity: record.filled_quantity,
            filled_price: record.filled_price,
            placed_at: record.placed_at,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct LedgerRecord {
    pub id: String,
    pub user_id: String,
    pub position_id: Option<String>,
    pub kind: String,
    pub amount: f64,
    pub currency: String,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<LedgerRecord> for LedgerEntry {
    type Error = StoreError;

    fn try_from(record: LedgerRecord) -> Result<Self, Self::Error> {
        Ok(LedgerEntry {
            id: record.id,
            user_id: record.user_id,
            position_id: record.position_id,
            kind: record.kind.parse().map_err(StoreError::Decode)?,
            amount: record.amount,
            currency: record.currency,
            created_at: record.created_at,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct CommissionRow {
    pub id: String,
    pub user_id: String,
    pub position_id: String,
    pub rate: f64,
    pub pnl: f64,
    pub amount: f64,
    pub currency: String,
    pub created_at: DateTime<Utc>,
}

impl From<CommissionRow> for CommissionRecord {
    fn from(row: CommissionRow) -> Self {
        CommissionRecord {
            id: row.id,
            user_id: row.user_id,
            position_id: row.position_id,
            rate: row.rate,
            pnl: row.pnl,
            amount: row.amount,
            currency: row.currency,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct ReconciliationFlagRecord {
    pub position_id: String,
    pub exchange: String,
    pub credential_id: String,
    pub order_id: String,
    pub attempts: i64,
    pub reason: String,
    pub flagged_at: DateTime<Utc>,
}

impl TryFrom<ReconciliationFlagRecord> for ReconciliationFlag {
    type Error = StoreError;

    fn try_from(record: ReconciliationFlagRecord) -> Result<Self, Self::Error> {
        Ok(ReconciliationFlag {
            position_id: record.position_id,
            exchange: record.exchange.parse().map_err(StoreError::Decode)?,
            credential_id: record.credential_id,
            order_id: record.order_id,
            attempts: u32::try_from(record.attempts)
                .map_err(|e| StoreError::Decode(format!("attempts: {}", e)))?,
            reason: record.reason,
            flagged_at: record.flagged_at,
        })
    }
}
