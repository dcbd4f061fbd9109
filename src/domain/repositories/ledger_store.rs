use async_trait::async_trait;

use crate::domain::entities::ledger::{balance_of, CommissionRecord, LedgerEntry};
use crate::domain::repositories::position_repository::StoreResult;

/// Append-only ledger. Settlement rows arrive through `PositionRepository::commit_settlement`;
/// `append` is for operator adjustments.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn append(&self, entry: &LedgerEntry) -> StoreResult<()>;

    async fn entries_for_user(&self, user_id: &str) -> StoreResult<Vec<LedgerEntry>>;

    async fn commissions_for_user(&self, user_id: &str) -> StoreResult<Vec<CommissionRecord>>;

    async fn commission_for_position(&self, position_id: &str) -> StoreResult<Option<CommissionRecord>>;

    async fn balance(&self, user_id: &str) -> StoreResult<f64> {
        let entries = self.entries_for_user(user_id).await?;
        Ok(balance_of(&entries))
    }
}
