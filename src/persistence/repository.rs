//! Database Repository
//!
//! sqlx implementation of `PositionRepository` and `LedgerStore`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, error};

use super::models::*;
use super::DbPool;
use crate::domain::entities::ledger::{CommissionRecord, LedgerEntry, ReconciliationFlag};
use crate::domain::entities::position::{
    ExecutionReceipt, Position, PositionSide, PositionStatus, TrailingStop,
};
use crate::domain::errors::StoreError;
use crate::domain::repositories::ledger_store::LedgerStore;
use crate::domain::repositories::position_repository::{
    PositionRepository, SettlementCommit, StoreResult,
};

fn query_error(context: &'static str) -> impl Fn(sqlx::Error) -> StoreError {
    move |e| {
        error!("{}: {}", context, e);
        StoreError::Backend(format!("{}: {}", context, e))
    }
}

/// Position and ledger store backed by SQLite
#[derive(Clone)]
pub struct SqliteStore {
    pool: DbPool,
}

impl SqliteStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    async fn receipts_for(&self, position_id: &str) -> StoreResult<Vec<ExecutionReceipt>> {
        let records = sqlx::query_as::<_, ReceiptRecord>(
            r#"
            SELECT position_id, exchange, credential_id, order_id,
                   filled_quantity, filled_price, placed_at
            FROM position_receipts
            WHERE position_id = ?1
            ORDER BY id
            "#,
        )
        .bind(position_id)
        .fetch_all(&self.pool)
        .await
        .map_err(query_error("Failed to load receipts"))?;

        records.into_iter().map(TryInto::try_into).collect()
    }

    async fn hydrate(&self, records: Vec<PositionRecord>) -> StoreResult<Vec<Position>> {
        let mut positions = Vec::with_capacity(records.len());
        for record in records {
            let receipts = self.receipts_for(&record.id).await?;
            positions.push(record.into_position(receipts)?);
        }
        Ok(positions)
    }
}

const POSITION_COLUMNS: &str = "id, user_id, symbol, side, entry_price, quantity, leverage, \
     stop_loss_price, take_profit_price, trailing_offset, trailing_best, trailing_threshold, \
     status, signal_source, opened_at, exit_price, realized_pnl, close_reason, closed_at";

#[async_trait]
impl PositionRepository for SqliteStore {
    async fn insert(&self, position: &Position) -> StoreResult<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(query_error("Failed to begin transaction"))?;

        sqlx::query(
            r#"
            INSERT INTO positions (
                id, user_id, symbol, side, entry_price, quantity, leverage,
                stop_loss_price, take_profit_price, trailing_offset, trailing_best,
                trailing_threshold, status, signal_source, opened_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
            "#,
        )
        .bind(&position.id)
        .bind(&position.user_id)
        .bind(&position.symbol)
        .bind(position.side.as_str())
        .bind(position.entry_price)
        .bind(position.quantity)
        .bind(position.leverage)
        .bind(position.stop_loss_price)
        .bind(position.take_profit_price)
        .bind(position.trailing.map(|t| t.offset_pct))
        .bind(position.trailing.map(|t| t.best_price))
        .bind(position.trailing.map(|t| t.threshold))
        .bind(position.status.as_str())
        .bind(&position.signal_source)
        .bind(position.opened_at)
        .execute(&mut *tx)
        .await
        .map_err(query_error("Failed to create position"))?;

        insert_receipts(&mut tx, position).await?;

        tx.commit()
            .await
            .map_err(query_error("Failed to commit position"))?;

        debug!("Created position: {} for {}", position.id, position.symbol);
        Ok(())
    }

    async fn get(&self, position_id: &str) -> StoreResult<Option<Position>> {
        let record = sqlx::query_as::<_, PositionRecord>(&format!(
            "SELECT {} FROM positions WHERE id = ?1",
            POSITION_COLUMNS
        ))
        .bind(position_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(query_error("Failed to get position"))?;

        match record {
            Some(record) => {
                let receipts = self.receipts_for(&record.id).await?;
                Ok(Some(record.into_position(receipts)?))
            }
            None => Ok(None),
        }
    }

    async fn list_open(&self) -> StoreResult<Vec<Position>> {
        let records = sqlx::query_as::<_, PositionRecord>(&format!(
            "SELECT {} FROM positions WHERE status IN ('open', 'closing') ORDER BY opened_at",
            POSITION_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(query_error("Failed to get open positions"))?;

        self.hydrate(records).await
    }

    async fn list_for_user(&self, user_id: &str) -> StoreResult<Vec<Position>> {
        let records = sqlx::query_as::<_, PositionRecord>(&format!(
            "SELECT {} FROM positions WHERE user_id = ?1 ORDER BY opened_at DESC",
            POSITION_COLUMNS
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(query_error("Failed to get user positions"))?;

        self.hydrate(records).await
    }

    async fn count_open_for_user(&self, user_id: &str) -> StoreResult<usize> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM positions WHERE user_id = ?1 AND status != 'closed'",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(query_error("Failed to count open positions"))?;

        Ok(count.max(0) as usize)
    }

    async fn count_opened_since(&self, user_id: &str, since: DateTime<Utc>) -> StoreResult<usize> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM positions WHERE user_id = ?1 AND opened_at >= ?2",
        )
        .bind(user_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await
        .map_err(query_error("Failed to count daily trades"))?;

        Ok(count.max(0) as usize)
    }

    async fn realized_loss_since(&self, user_id: &str, since: DateTime<Utc>) -> StoreResult<f64> {
        let (loss,): (Option<f64>,) = sqlx::query_as(
            r#"
            SELECT SUM(-realized_pnl) FROM positions
            WHERE user_id = ?1 AND status = 'closed' AND closed_at >= ?2 AND realized_pnl < 0
            "#,
        )
        .bind(user_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await
        .map_err(query_error("Failed to sum daily loss"))?;

        Ok(loss.unwrap_or(0.0))
    }

    async fn update_trailing(&self, position_id: &str, trailing: &TrailingStop) -> StoreResult<bool> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(query_error("Failed to begin transaction"))?;

        let row: Option<(String, String, Option<f64>, Option<f64>, Option<f64>)> = sqlx::query_as(
            r#"
            SELECT side, status, trailing_offset, trailing_best, trailing_threshold
            FROM positions WHERE id = ?1
            "#,
        )
        .bind(position_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(query_error("Failed to read trailing state"))?;

        let Some((side, status, offset, best, threshold)) = row else {
            return Ok(false);
        };
        let status: PositionStatus = status.parse().map_err(StoreError::Decode)?;
        if !matches!(status, PositionStatus::Open | PositionStatus::Closing) {
            return Ok(false);
        }
        let side: PositionSide = side.parse().map_err(StoreError::Decode)?;

        let merged = match (offset, best, threshold) {
            (Some(offset_pct), Some(best_price), Some(threshold)) => TrailingStop {
                offset_pct,
                best_price,
                threshold,
            }
            .merge(side, trailing),
            _ => *trailing,
        };

        sqlx::query(
            r#"
            UPDATE positions
            SET trailing_offset = ?1, trailing_best = ?2, trailing_threshold = ?3
            WHERE id = ?4
            "#,
        )
        .bind(merged.offset_pct)
        .bind(merged.best_price)
        .bind(merged.threshold)
        .bind(position_id)
        .execute(&mut *tx)
        .await
        .map_err(query_error("Failed to update trailing state"))?;

        tx.commit()
            .await
            .map_err(query_error("Failed to commit trailing state"))?;
        Ok(true)
    }

    async fn mark_open(&self, position: &Position) -> StoreResult<bool> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(query_error("Failed to begin transaction"))?;

        let rows = sqlx::query(
            r#"
            UPDATE positions
            SET status = 'open', entry_price = ?1, quantity = ?2, stop_loss_price = ?3,
                take_profit_price = ?4, trailing_offset = ?5, trailing_best = ?6,
                trailing_threshold = ?7
            WHERE id = ?8 AND status = 'opening'
            "#,
        )
        .bind(position.entry_price)
        .bind(position.quantity)
        .bind(position.stop_loss_price)
        .bind(position.take_profit_price)
        .bind(position.trailing.map(|t| t.offset_pct))
        .bind(position.trailing.map(|t| t.best_price))
        .bind(position.trailing.map(|t| t.threshold))
        .bind(&position.id)
        .execute(&mut *tx)
        .await
        .map_err(query_error("Failed to mark position open"))?
        .rows_affected();

        if rows == 0 {
            tx.rollback()
                .await
                .map_err(query_error("Failed to roll back open"))?;
            return Ok(false);
        }

        insert_receipts(&mut tx, position).await?;

        tx.commit()
            .await
            .map_err(query_error("Failed to commit open"))?;

        debug!("Opened position: {} with {} receipt(s)", position.id, position.receipts.len());
        Ok(true)
    }

    async fn discard_opening(&self, position_id: &str) -> StoreResult<bool> {
        let rows = sqlx::query(
            r#"
            DELETE FROM positions
            WHERE id = ?1 AND status = 'opening'
              AND NOT EXISTS (SELECT 1 FROM position_receipts WHERE position_id = ?1)
            "#,
        )
        .bind(position_id)
        .execute(&self.pool)
        .await
        .map_err(query_error("Failed to discard opening position"))?
        .rows_affected();

        Ok(rows == 1)
    }

    async fn mark_closing(&self, position_id: &str) -> StoreResult<bool> {
        let rows = sqlx::query(
            "UPDATE positions SET status = 'closing' WHERE id = ?1 AND status = 'open'",
        )
        .bind(position_id)
        .execute(&self.pool)
        .await
        .map_err(query_error("Failed to mark position closing"))?
        .rows_affected();

        Ok(rows == 1)
    }

    async fn commit_settlement(&self, commit: &SettlementCommit) -> StoreResult<bool> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(query_error("Failed to begin transaction"))?;

        let rows = sqlx::query(
            r#"
            UPDATE positions
            SET status = 'closed', exit_price = ?1, realized_pnl = ?2,
                close_reason = ?3, closed_at = ?4
            WHERE id = ?5 AND status IN ('open', 'closing')
            "#,
        )
        .bind(commit.exit_price)
        .bind(commit.pnl)
        .bind(commit.reason.as_str())
        .bind(commit.closed_at)
        .bind(&commit.position_id)
        .execute(&mut *tx)
        .await
        .map_err(query_error("Failed to close position"))?
        .rows_affected();

        if rows == 0 {
            tx.rollback()
                .await
                .map_err(query_error("Failed to roll back settlement"))?;
            return Ok(false);
        }

        if let Some(commission) = &commit.commission {
            sqlx::query(
                r#"
                INSERT INTO commission_records (
                    id, user_id, position_id, rate, pnl, amount, currency, created_at
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
            )
            .bind(&commission.id)
            .bind(&commission.user_id)
            .bind(&commission.position_id)
            .bind(commission.rate)
            .bind(commission.pnl)
            .bind(commission.amount)
            .bind(&commission.currency)
            .bind(commission.created_at)
            .execute(&mut *tx)
            .await
            .map_err(query_error("Failed to store commission"))?;
        }

        for entry in &commit.ledger_entries {
            insert_ledger_entry(&mut tx, entry).await?;
        }

        tx.commit()
            .await
            .map_err(query_error("Failed to commit settlement"))?;

        debug!("Closed position: {}", commit.position_id);
        Ok(true)
    }

    async fn flag_for_reconciliation(&self, flag: &ReconciliationFlag) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO reconciliation_flags (
                position_id, exchange, credential_id, order_id, attempts, reason, flagged_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(&flag.position_id)
        .bind(flag.exchange.name())
        .bind(&flag.credential_id)
        .bind(&flag.order_id)
        .bind(flag.attempts as i64)
        .bind(&flag.reason)
        .bind(flag.flagged_at)
        .execute(&self.pool)
        .await
        .map_err(query_error("Failed to store reconciliation flag"))?;

        Ok(())
    }

    async fn pending_reconciliations(&self) -> StoreResult<Vec<ReconciliationFlag>> {
        let records = sqlx::query_as::<_, ReconciliationFlagRecord>(
            r#"
            SELECT position_id, exchange, credential_id, order_id, attempts, reason, flagged_at
            FROM reconciliation_flags
            WHERE resolved = 0
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(query_error("Failed to load reconciliation flags"))?;

        records.into_iter().map(TryInto::try_into).collect()
    }
}

async fn insert_receipts(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    position: &Position,
) -> StoreResult<()> {
    for receipt in &position.receipts {
        sqlx::query(
            r#"
            INSERT INTO position_receipts (
                position_id, exchange, credential_id, order_id,
                filled_quantity, filled_price, placed_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(&position.id)
        .bind(receipt.exchange.name())
        .bind(&receipt.credential_id)
        .bind(&receipt.order_id)
        .bind(receipt.filled_quantity)
        .bind(receipt.filled_price)
        .bind(receipt.placed_at)
        .execute(&mut **tx)
        .await
        .map_err(query_error("Failed to store receipt"))?;
    }
    Ok(())
}

async fn insert_ledger_entry(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    entry: &LedgerEntry,
) -> StoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO ledger_entries (id, user_id, position_id, kind, amount, currency, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        "#,
    )
    .bind(&entry.id)
    .bind(&entry.user_id)
    .bind(&entry.position_id)
    .bind(entry.kind.as_str())
    .bind(entry.amount)
    .bind(&entry.currency)
    .bind(entry.created_at)
    .execute(&mut **tx)
    .await
    .map_err(query_error("Failed to store ledger entry"))?;

    Ok(())
}

#[async_trait]
impl LedgerStore for SqliteStore {
    async fn append(&self, entry: &LedgerEntry) -> StoreResult<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(query_error("Failed to begin transaction"))?;
        insert_ledger_entry(&mut tx, entry).await?;
        tx.commit()
            .await
            .map_err(query_error("Failed to commit ledger entry"))?;
        Ok(())
    }

    async fn entries_for_user(&self, user_id: &str) -> StoreResult<Vec<LedgerEntry>> {
        let records = sqlx::query_as::<_, LedgerRecord>(
            r#"
            SELECT id, user_id, position_id, kind, amount, currency, created_at
            FROM ledger_entries WHERE user_id = ?1 ORDER BY created_at, id
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(query_error("Failed to load ledger entries"))?;

        records.into_iter().map(TryInto::try_into).collect()
    }

    async fn commissions_for_user(&self, user_id: &str) -> StoreResult<Vec<CommissionRecord>> {
        let rows = sqlx::query_as::<_, CommissionRow>(
            r#"
            SELECT id, user_id, position_id, rate, pnl, amount, currency, created_at
            FROM commission_records WHERE user_id = ?1 ORDER BY created_at, id
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(query_error("Failed to load commissions"))?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn commission_for_position(&self, position_id: &str) -> StoreResult<Option<CommissionRecord>> {
        let row = sqlx::query_as::<_, CommissionRow>(
            r#"
            SELECT id, user_id, position_id, rate, pnl, amount, currency, created_at
            FROM commission_records WHERE position_id = ?1
            "#,
        )
        .bind(position_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(query_error("Failed to load commission"))?;

        Ok(row.map(Into::into))
    }

    async fn balance(&self, user_id: &str) -> StoreResult<f64> {
        let (total,): (Option<f64>,) =
            sqlx::query_as("SELECT SUM(amount) FROM ledger_entries WHERE user_id = ?1")
                .bind(user_id)
                .fetch_one(&self.pool)
                .await
                .map_err(query_error("Failed to sum ledger"))?;

        Ok(total.unwrap_or(0.0))
    }
}
