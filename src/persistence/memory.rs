//! In-memory store with the same guarantees as `SqliteStore`.
//!
//! A single lock guards positions and ledger rows together, so a settlement commit is
//! atomic with respect to every reader.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::domain::entities::ledger::{CommissionRecord, LedgerEntry, ReconciliationFlag};
use crate::domain::entities::position::{ClosingData, Position, PositionStatus, TrailingStop};
use crate::domain::repositories::ledger_store::LedgerStore;
use crate::domain::repositories::position_repository::{
    PositionRepository, SettlementCommit, StoreResult,
};

#[derive(Default)]
struct State {
    positions: HashMap<String, Position>,
    ledger: Vec<LedgerEntry>,
    commissions: Vec<CommissionRecord>,
    flags: Vec<ReconciliationFlag>,
}

#[derive(Default)]
pub struct InMemoryStore {
    state: RwLock<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn sorted_by_open(mut positions: Vec<Position>) -> Vec<Position> {
    positions.sort_by(|a, b| a.opened_at.cmp(&b.opened_at).then_with(|| a.id.cmp(&b.id)));
    positions
}

#[async_trait]
impl PositionRepository for InMemoryStore {
    async fn insert(&self, position: &Position) -> StoreResult<()> {
        let mut state = self.state.write().await;
        state.positions.insert(position.id.clone(), position.clone());
        Ok(())
    }

    async fn get(&self, position_id: &str) -> StoreResult<Option<Position>> {
        Ok(self.state.read().await.positions.get(position_id).cloned())
    }

    async fn list_open(&self) -> StoreResult<Vec<Position>> {
        let state = self.state.read().await;
        Ok(sorted_by_open(
            state.positions.values().filter(|p| p.is_active()).cloned().collect(),
        ))
    }

    async fn list_for_user(&self, user_id: &str) -> StoreResult<Vec<Position>> {
        let state = self.state.read().await;
        let mut positions = sorted_by_open(
            state
                .positions
                .values()
                .filter(|p| p.user_id == user_id)
                .cloned()
                .collect(),
        );
        positions.reverse();
        Ok(positions)
    }

    async fn count_open_for_user(&self, user_id: &str) -> StoreResult<usize> {
        let state = self.state.read().await;
        Ok(state
            .positions
            .values()
            .filter(|p| p.user_id == user_id && !p.is_closed())
            .count())
    }

    async fn count_opened_since(&self, user_id: &str, since: DateTime<Utc>) -> StoreResult<usize> {
        let state = self.state.read().await;
        Ok(state
            .positions
            .values()
            .filter(|p| p.user_id == user_id && p.opened_at >= since)
            .count())
    }

    async fn realized_loss_since(&self, user_id: &str, since: DateTime<Utc>) -> StoreResult<f64> {
        let state = self.state.read().await;
        Ok(state
            .positions
            .values()
            .filter(|p| p.user_id == user_id)
            .filter_map(|p| p.closing.as_ref())
            .filter(|c| c.closed_at >= since && c.pnl < 0.0)
            .map(|c| -c.pnl)
            .sum())
    }

    async fn update_trailing(&self, position_id: &str, trailing: &TrailingStop) -> StoreResult<bool> {
        let mut state = self.state.write().await;
        let Some(position) = state.positions.get_mut(position_id) else {
            return Ok(false);
        };
        if !position.is_active() {
            return Ok(false);
        }
        position.trailing = Some(match position.trailing {
            Some(current) => current.merge(position.side, trailing),
            None => *trailing,
        });
        Ok(true)
    }

    async fn mark_open(&self, position: &Position) -> StoreResult<bool> {
        let mut state = self.state.write().await;
        match state.positions.get_mut(&position.id) {
            Some(stored) if stored.status == PositionStatus::Opening => {
                *stored = Position {
                    status: PositionStatus::Open,
                    ..position.clone()
                };
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn discard_opening(&self, position_id: &str) -> StoreResult<bool> {
        let mut state = self.state.write().await;
        let discardable = matches!(
            state.positions.get(position_id),
            Some(p) if p.status == PositionStatus::Opening && p.receipts.is_empty()
        );
        if discardable {
            state.positions.remove(position_id);
        }
        Ok(discardable)
    }

    async fn mark_closing(&self, position_id: &str) -> StoreResult<bool> {
        let mut state = self.state.write().await;
        match state.positions.get_mut(position_id) {
            Some(position) if position.status == PositionStatus::Open => {
                position.status = PositionStatus::Closing;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn commit_settlement(&self, commit: &SettlementCommit) -> StoreResult<bool> {
        let mut state = self.state.write().await;
        let Some(position) = state.positions.get_mut(&commit.position_id) else {
            return Ok(false);
        };
        if !position.is_active() {
            return Ok(false);
        }

        position.status = PositionStatus::Closed;
        position.closing = Some(ClosingData {
            exit_price: commit.exit_price,
            pnl: commit.pnl,
            reason: commit.reason,
            closed_at: commit.closed_at,
        });

        if let Some(commission) = &commit.commission {
            state.commissions.push(commission.clone());
        }
        state.ledger.extend(commit.ledger_entries.iter().cloned());
        Ok(true)
    }

    async fn flag_for_reconciliation(&self, flag: &ReconciliationFlag) -> StoreResult<()> {
        self.state.write().await.flags.push(flag.clone());
        Ok(())
    }

    async fn pending_reconciliations(&self) -> StoreResult<Vec<ReconciliationFlag>> {
        Ok(self.state.read().await.flags.clone())
    }
}

#[async_trait]
impl LedgerStore for InMemoryStore {
    async fn append(&self, entry: &LedgerEntry) -> StoreResult<()> {
        self.state.write().await.ledger.push(entry.clone());
        Ok(())
    }

    async fn entries_for_user(&self, user_id: &str) -> StoreResult<Vec<LedgerEntry>> {
        let state = self.state.read().await;
        Ok(state
            .ledger
            .iter()
            .filter(|e| e.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn commissions_for_user(&self, user_id: &str) -> StoreResult<Vec<CommissionRecord>> {
        let state = self.state.read().await;
        Ok(state
            .commissions
            .iter()
            .filter(|c| c.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn commission_for_position(&self, position_id: &str) -> StoreResult<Option<CommissionRecord>> {
        let state = self.state.read().await;
        Ok(state
            .commissions
            .iter()
            .find(|c| c.position_id == position_id)
            .cloned())
    }
}
