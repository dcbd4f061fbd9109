//! Periodic exit evaluation and the worker pool that acts on it

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures_util::future::join_all;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::domain::entities::position::{CloseReason, Position, PositionStatus, TrailingStop};
use crate::domain::errors::EngineError;
use crate::domain::repositories::position_repository::PositionRepository;
use crate::domain::services::exit_rules::{self, Evaluation};
use crate::domain::services::position_lease::PositionLeases;
use crate::domain::services::price_cache::PriceCache;
use crate::domain::services::settlement::{ClosedPosition, SettlementEngine};

#[derive(Debug, Clone, PartialEq)]
pub enum MonitorAction {
    Close {
        position_id: String,
        reason: CloseReason,
        exit_price: f64,
    },
    AdvanceTrailing {
        position_id: String,
        trailing: TrailingStop,
    },
    Skip {
        position_id: String,
        reason: String,
    },
}

impl MonitorAction {
    pub fn position_id(&self) -> &str {
        match self {
            MonitorAction::Close { position_id, .. }
            | MonitorAction::AdvanceTrailing { position_id, .. }
            | MonitorAction::Skip { position_id, .. } => position_id,
        }
    }
}

/// What one `apply` pass did
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TickReport {
    pub closed: Vec<String>,
    pub trailing_updated: usize,
    pub skipped: usize,
    pub failed: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub workers: usize,
    pub max_holding: Option<ChronoDuration>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            max_holding: Some(ChronoDuration::hours(72)),
        }
    }
}

enum Outcome {
    Closed(String),
    TrailingUpdated,
    Skipped,
    Failed(String),
}

pub struct PositionMonitor {
    positions: Arc<dyn PositionRepository>,
    prices: Arc<PriceCache>,
    settlement: Arc<SettlementEngine>,
    leases: Arc<PositionLeases>,
    workers: Semaphore,
    config: MonitorConfig,
}

impl PositionMonitor {
    pub fn new(
        positions: Arc<dyn PositionRepository>,
        prices: Arc<PriceCache>,
        settlement: Arc<SettlementEngine>,
        leases: Arc<PositionLeases>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            positions,
            prices,
            settlement,
            leases,
            workers: Semaphore::new(config.workers.max(1)),
            config,
        }
    }

    /// Decide what to do with every active position at `now`. Writes nothing.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<Vec<MonitorAction>, EngineError> {
        let active = self.positions.list_open().await?;
        if active.is_empty() {
            return Ok(Vec::new());
        }

        let symbols: Vec<String> = active
            .iter()
            .map(|p| p.symbol.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let prices = self.prices.prices(&symbols).await;

        let mut actions = Vec::new();
        for position in &active {
            let price = match prices.get(&position.symbol) {
                Some(Ok(price)) => *price,
                Some(Err(e)) => {
                    actions.push(MonitorAction::Skip {
                        position_id: position.id.clone(),
                        reason: e.to_string(),
                    });
                    continue;
                }
                None => continue,
            };

            match exit_rules::evaluate(position, price, now, self.config.max_holding) {
                Evaluation::Exit { reason, exit_price } => {
                    debug!("{} hit {} at {}", position.id, reason, price);
                    actions.push(MonitorAction::Close {
                        position_id: position.id.clone(),
                        reason,
                        exit_price,
                    });
                }
                Evaluation::AdvanceTrailing(trailing) => actions.push(MonitorAction::AdvanceTrailing {
                    position_id: position.id.clone(),
                    trailing,
                }),
                Evaluation::Hold | Evaluation::Inactive => {}
            }
        }
        Ok(actions)
    }

    /// Execute actions on the bounded worker pool
    pub async fn apply(&self, actions: Vec<MonitorAction>, now: DateTime<Utc>) -> TickReport {
        let outcomes = join_all(actions.into_iter().map(|action| self.run_action(action, now))).await;

        let mut report = TickReport::default();
        for outcome in outcomes {
            match outcome {
                Outcome::Closed(id) => report.closed.push(id),
                Outcome::TrailingUpdated => report.trailing_updated += 1,
                Outcome::Skipped => report.skipped += 1,
                Outcome::Failed(id) => report.failed.push(id),
            }
        }
        report
    }

    pub async fn run_tick(&self, now: DateTime<Utc>) -> Result<TickReport, EngineError> {
        let actions = self.tick(now).await?;
        let report = self.apply(actions, now).await;
        if !report.closed.is_empty() || !report.failed.is_empty() {
            info!(
                "Monitor tick: {} closed, {} trailing updates, {} skipped, {} failed",
                report.closed.len(),
                report.trailing_updated,
                report.skipped,
                report.failed.len()
            );
        }
        Ok(report)
    }

    async fn run_action(&self, action: MonitorAction, now: DateTime<Utc>) -> Outcome {
        let _permit = match self.workers.acquire().await {
            Ok(permit) => permit,
            Err(_) => return Outcome::Failed(action.position_id().to_string()),
        };

        match action {
            MonitorAction::Skip { position_id, reason } => {
                debug!("Skipping {} this tick: {}", position_id, reason);
                Outcome::Skipped
            }
            MonitorAction::AdvanceTrailing {
                position_id,
                trailing,
            } => match self.positions.update_trailing(&position_id, &trailing).await {
                Ok(true) => {
                    debug!(
                        "Trailing stop for {} now {:.4} (best {:.4})",
                        position_id, trailing.threshold, trailing.best_price
                    );
                    Outcome::TrailingUpdated
                }
                Ok(false) => Outcome::Skipped,
                Err(e) => {
                    error!("Failed to persist trailing stop for {}: {}", position_id, e);
                    Outcome::Failed(position_id)
                }
            },
            MonitorAction::Close {
                position_id,
                reason,
                exit_price,
            } => match self.settle(&position_id, exit_price, reason, now).await {
                Ok(_) => Outcome::Closed(position_id),
                Err(EngineError::AlreadyClosed { .. }) => Outcome::Skipped,
                Err(EngineError::ValidationRejected { reason }) => {
                    debug!("Close of {} skipped: {}", position_id, reason);
                    Outcome::Skipped
                }
                Err(e) => {
                    error!("Close of {} failed: {}", position_id, e);
                    Outcome::Failed(position_id)
                }
            },
        }
    }

    /// Lease, reload, move to `closing` and settle one position.
    ///
    /// `exit_price` of `None` uses the current cached market price. Emergency closes fall
    /// back to the last price ever fetched when the feed is down.
    pub async fn close_now(
        &self,
        position_id: &str,
        exit_price: Option<f64>,
        reason: CloseReason,
        now: DateTime<Utc>,
    ) -> Result<ClosedPosition, EngineError> {
        let exit_price = match exit_price {
            Some(price) => price,
            None => {
                let position = self
                    .positions
                    .get(position_id)
                    .await?
                    .ok_or_else(|| EngineError::NotFound(position_id.to_string()))?;
                match self.prices.price(&position.symbol).await {
                    Ok(price) => price,
                    Err(e) if reason == CloseReason::Emergency => {
                        let Some(price) = self.prices.last_known(&position.symbol) else {
                            return Err(e);
                        };
                        warn!(
                            "Emergency close of {} uses last known {} price {}: {}",
                            position_id, position.symbol, price, e
                        );
                        price
                    }
                    Err(e) => return Err(e),
                }
            }
        };
        self.settle(position_id, exit_price, reason, now).await
    }

    async fn settle(
        &self,
        position_id: &str,
        exit_price: f64,
        reason: CloseReason,
        now: DateTime<Utc>,
    ) -> Result<ClosedPosition, EngineError> {
        let Some(_lease) = self.leases.try_acquire(position_id) else {
            return Err(EngineError::rejected(format!(
                "Position {} is being handled by another worker",
                position_id
            )));
        };

        let position = self.reload_active(position_id).await?;
        if position.status == PositionStatus::Open && !self.positions.mark_closing(position_id).await? {
            // Lost a race with a writer that does not take leases
            self.reload_active(position_id).await?;
        }

        let closed = self.settlement.close(&position, exit_price, reason, now).await?;
        if closed.flattening > 0 {
            debug!("{} exchange-side close(s) for {} running in the background", closed.flattening, position_id);
        }
        Ok(closed)
    }

    async fn reload_active(&self, position_id: &str) -> Result<Position, EngineError> {
        let position = self
            .positions
            .get(position_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(position_id.to_string()))?;
        if !position.is_active() {
            return Err(EngineError::AlreadyClosed {
                position_id: position_id.to_string(),
            });
        }
        Ok(position)
    }
}
