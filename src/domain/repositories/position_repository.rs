use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::entities::ledger::{CommissionRecord, LedgerEntry, ReconciliationFlag};
use crate::domain::entities::position::{CloseReason, Position, TrailingStop};
use crate::domain::errors::StoreError;

pub type StoreResult<T> = Result<T, StoreError>;

/// Everything written when a position closes. Applied atomically or not at all.
#[derive(Debug, Clone, PartialEq)]
pub struct SettlementCommit {
    pub position_id: String,
    pub exit_price: f64,
    pub pnl: f64,
    pub reason: CloseReason,
    pub closed_at: DateTime<Utc>,
    pub commission: Option<CommissionRecord>,
    pub ledger_entries: Vec<LedgerEntry>,
}

#[async_trait]
pub trait PositionRepository: Send + Sync {
    async fn insert(&self, position: &Position) -> StoreResult<()>;

    async fn get(&self, position_id: &str) -> StoreResult<Option<Position>>;

    /// Positions in `open` or `closing`
    async fn list_open(&self) -> StoreResult<Vec<Position>>;

    async fn list_for_user(&self, user_id: &str) -> StoreResult<Vec<Position>>;

    /// Positions in `opening`, `open` or `closing` for the user
    async fn count_open_for_user(&self, user_id: &str) -> StoreResult<usize>;

    /// Positions opened at or after `since`, whatever their state now
    async fn count_opened_since(&self, user_id: &str, since: DateTime<Utc>) -> StoreResult<usize>;

    /// Sum of loss magnitudes over positions closed at or after `since`
    async fn realized_loss_since(&self, user_id: &str, since: DateTime<Utc>) -> StoreResult<f64>;

    /// Merge trailing state into an active position. The stored threshold never regresses.
    /// Returns false when the position is no longer active.
    async fn update_trailing(&self, position_id: &str, trailing: &TrailingStop) -> StoreResult<bool>;

    /// `opening -> open` with the fills obtained. Entry, size, protective prices, trailing
    /// state and receipts are taken from `position`. Returns false unless the stored
    /// position was `opening`.
    async fn mark_open(&self, position: &Position) -> StoreResult<bool>;

    /// Drop an `opening` position that never received a fill.
    /// Returns false, removing nothing, for any other state.
    async fn discard_opening(&self, position_id: &str) -> StoreResult<bool>;

    /// `open -> closing`. Returns false unless the position was `open`.
    async fn mark_closing(&self, position_id: &str) -> StoreResult<bool>;

    /// `open|closing -> closed` together with commission and ledger rows.
    /// Returns false, writing nothing, if the position was already closed.
    async fn commit_settlement(&self, commit: &SettlementCommit) -> StoreResult<bool>;

    async fn flag_for_reconciliation(&self, flag: &ReconciliationFlag) -> StoreResult<()>;

    async fn pending_reconciliations(&self) -> StoreResult<Vec<ReconciliationFlag>>;
}
