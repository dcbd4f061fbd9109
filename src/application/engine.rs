//! Trading engine facade: wires the services together and exposes the public operations

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::domain::entities::exchange::Exchange;
use crate::domain::entities::ledger::{CommissionRecord, LedgerEntry, ReconciliationFlag};
use crate::domain::entities::position::{CloseReason, Position};
use crate::domain::entities::signal::{Signal, SignalKind};
use crate::domain::errors::EngineError;
use crate::domain::repositories::account_provider::AccountProvider;
use crate::domain::repositories::event_publisher::EventPublisher;
use crate::domain::repositories::exchange_client::ExchangeRegistry;
use crate::domain::repositories::ledger_store::LedgerStore;
use crate::domain::repositories::position_repository::PositionRepository;
use crate::domain::repositories::price_feed::PriceFeed;
use crate::domain::repositories::sentiment_source::SentimentSource;
use crate::domain::services::cooldown::CooldownRegistry;
use crate::domain::services::opening_orchestrator::{OpenReport, OpeningConfig, OpeningOrchestrator};
use crate::domain::services::position_lease::PositionLeases;
use crate::domain::services::position_monitor::{MonitorConfig, PositionMonitor, TickReport};
use crate::domain::services::price_cache::PriceCache;
use crate::domain::services::risk_gate::{EffectiveIndex, RiskGate};
use crate::domain::services::settlement::{ClosedPosition, SettlementConfig, SettlementEngine};
use crate::domain::services::trading_control::{TradingControl, TradingStatus};
use crate::task_runner::RetryPolicy;

/// Collaborators supplied by the embedding application
pub struct EngineComponents {
    pub accounts: Arc<dyn AccountProvider>,
    pub positions: Arc<dyn PositionRepository>,
    pub ledger: Arc<dyn LedgerStore>,
    pub exchanges: ExchangeRegistry,
    pub price_feed: Arc<dyn PriceFeed>,
    pub sentiment: Arc<dyn SentimentSource>,
    pub events: Arc<dyn EventPublisher>,
}

/// Per-user results of one dispatched signal
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DispatchReport {
    pub opened: Vec<String>,
    pub closed: Vec<String>,
    pub rejected: Vec<UserOutcome>,
    pub failed: Vec<UserOutcome>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserOutcome {
    pub user_id: String,
    pub code: String,
    pub message: String,
}

impl UserOutcome {
    fn from_error(user_id: &str, error: &EngineError) -> Self {
        Self {
            user_id: user_id.to_string(),
            code: error.error_code().to_string(),
            message: error.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BulkCloseReport {
    pub closed: Vec<String>,
    pub failed: Vec<UserOutcome>,
}

pub struct TradingEngine {
    accounts: Arc<dyn AccountProvider>,
    positions: Arc<dyn PositionRepository>,
    ledger: Arc<dyn LedgerStore>,
    gate: Arc<RiskGate>,
    prices: Arc<PriceCache>,
    control: Arc<TradingControl>,
    settlement: Arc<SettlementEngine>,
    opening: OpeningOrchestrator,
    monitor: PositionMonitor,
    config: EngineConfig,
}

impl TradingEngine {
    pub fn new(config: EngineConfig, components: EngineComponents) -> Self {
        let EngineComponents {
            accounts,
            positions,
            ledger,
            exchanges,
            price_feed,
            sentiment,
            events,
        } = components;

        let gate = Arc::new(RiskGate::new(
            sentiment,
            config.index_staleness(),
            config.index_fallback_value,
            config.index_timeout(),
        ));
        let prices = Arc::new(PriceCache::new(
            price_feed,
            config.price_cache_ttl(),
            config.price_fetch_timeout(),
        ));
        let control = Arc::new(TradingControl::new());
        let cooldowns = Arc::new(CooldownRegistry::new(config.cooldown()));

        let settlement = Arc::new(SettlementEngine::new(
            Arc::clone(&positions),
            Arc::clone(&accounts),
            exchanges.clone(),
            Arc::clone(&events),
            Arc::clone(&cooldowns),
            SettlementConfig {
                commission_rate_with_plan: config.commission_rate_with_plan,
                commission_rate_without_plan: config.commission_rate_without_plan,
                commission_currency: config.commission_currency.clone(),
                retry: RetryPolicy::new(config.settlement_max_attempts, config.settlement_backoff()),
                exchange_timeout: config.exchange_timeout(),
            },
        ));

        let opening = OpeningOrchestrator::new(
            Arc::clone(&accounts),
            Arc::clone(&positions),
            exchanges,
            Arc::clone(&gate),
            cooldowns,
            Arc::clone(&control),
            events,
            OpeningConfig {
                exchange_timeout: config.exchange_timeout(),
                open_deadline: config.open_deadline(),
                trailing_offset_pct: config.trailing_offset_percent,
            },
        );

        let monitor = PositionMonitor::new(
            Arc::clone(&positions),
            Arc::clone(&prices),
            Arc::clone(&settlement),
            Arc::new(PositionLeases::new(config.lease_ttl())),
            MonitorConfig {
                workers: config.monitor_workers,
                max_holding: config.max_holding(),
            },
        );

        info!(
            "Trading engine ready: monitor every {:?} with {} worker(s), index refresh every {:?}",
            config.monitor_interval(),
            config.monitor_workers,
            config.index_refresh_interval()
        );

        Self {
            accounts,
            positions,
            ledger,
            gate,
            prices,
            control,
            settlement,
            opening,
            monitor,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Route one signal to every subscribed user.
    ///
    /// Entry signals open per user; close signals settle the user's matching positions
    /// with reason `manual`; confirmations change nothing.
    pub async fn dispatch_signal(&self, signal: &Signal) -> Result<DispatchReport, EngineError> {
        self.dispatch_signal_at(signal, Utc::now()).await
    }

    pub async fn dispatch_signal_at(
        &self,
        signal: &Signal,
        now: DateTime<Utc>,
    ) -> Result<DispatchReport, EngineError> {
        if signal.kind == SignalKind::Confirmation {
            debug!("Confirmation for {} {} ignored", signal.direction, signal.symbol);
            return Ok(DispatchReport::default());
        }

        let users = self
            .accounts
            .subscribed_users()
            .await
            .map_err(|e| EngineError::rejected(format!("Subscriber lookup failed: {}", e)))?;
        info!(
            "Dispatching {:?} {} {} to {} user(s)",
            signal.kind,
            signal.direction,
            signal.symbol,
            users.len()
        );

        let mut report = DispatchReport::default();
        match signal.kind {
            SignalKind::Entry => {
                let opens = users.iter().map(|user| async move {
                    (user, self.opening.open_at(signal, user, now).await)
                });
                for (user, result) in join_all(opens).await {
                    match result {
                        Ok(open) => report.opened.push(open.position.id),
                        Err(e @ EngineError::ValidationRejected { .. }) => {
                            report.rejected.push(UserOutcome::from_error(user, &e))
                        }
                        Err(EngineError::Timeout {
                            persisted_position: Some(id),
                            ..
                        }) => report.opened.push(id),
                        Err(e) => report.failed.push(UserOutcome::from_error(user, &e)),
                    }
                }
            }
            SignalKind::Close => {
                let closes = users
                    .iter()
                    .map(|user| self.close_matching(user, signal, now));
                for bulk in join_all(closes).await {
                    report.closed.extend(bulk.closed);
                    report.failed.extend(bulk.failed);
                }
            }
            SignalKind::Confirmation => {}
        }
        Ok(report)
    }

    async fn close_matching(&self, user_id: &str, signal: &Signal, now: DateTime<Utc>) -> BulkCloseReport {
        let positions = match self.positions.list_for_user(user_id).await {
            Ok(positions) => positions,
            Err(e) => {
                let error = EngineError::from(e);
                error!("Close signal for {}: {}", user_id, error);
                return BulkCloseReport {
                    closed: Vec::new(),
                    failed: vec![UserOutcome::from_error(user_id, &error)],
                };
            }
        };
        let targets: Vec<Position> = positions
            .into_iter()
            .filter(|p| p.is_active() && p.symbol == signal.symbol && p.side == signal.direction)
            .collect();
        self.close_all(targets, CloseReason::Manual, now).await
    }

    async fn close_all(&self, targets: Vec<Position>, reason: CloseReason, now: DateTime<Utc>) -> BulkCloseReport {
        let closes = targets.iter().map(|position| async move {
            (
                position,
                self.monitor.close_now(&position.id, None, reason, now).await,
            )
        });

        let mut report = BulkCloseReport::default();
        for (position, result) in join_all(closes).await {
            match result {
                Ok(closed) => report.closed.push(closed.position.id),
                Err(EngineError::AlreadyClosed { .. }) => {}
                Err(e) => {
                    warn!("Close of {} ({}) failed: {}", position.id, reason, e);
                    report
                        .failed
                        .push(UserOutcome::from_error(&position.user_id, &e));
                }
            }
        }
        report
    }

    /// Run the opening pipeline for one user
    pub async fn open(&self, signal: &Signal, user_id: &str) -> Result<OpenReport, EngineError> {
        self.opening.open(signal, user_id).await
    }

    pub async fn open_at(
        &self,
        signal: &Signal,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<OpenReport, EngineError> {
        self.opening.open_at(signal, user_id, now).await
    }

    /// Operator close at the current market price, or at `exit_price` when given
    pub async fn close_position(
        &self,
        position_id: &str,
        exit_price: Option<f64>,
    ) -> Result<ClosedPosition, EngineError> {
        info!("Manual close requested for {}", position_id);
        self.monitor
            .close_now(position_id, exit_price, CloseReason::Manual, Utc::now())
            .await
    }

    /// Pause all opens, then close every active position with reason `emergency`
    pub async fn emergency_close_all(&self) -> Result<BulkCloseReport, EngineError> {
        self.emergency_close_all_at(Utc::now()).await
    }

    pub async fn emergency_close_all_at(&self, now: DateTime<Utc>) -> Result<BulkCloseReport, EngineError> {
        warn!("Emergency close-all requested; pausing new opens");
        self.control.pause(None);
        let targets = self.positions.list_open().await?;
        let report = self.close_all(targets, CloseReason::Emergency, now).await;
        warn!(
            "Emergency close-all: {} closed, {} failed",
            report.closed.len(),
            report.failed.len()
        );
        Ok(report)
    }

    pub fn pause(&self, exchange: Option<Exchange>) {
        self.control.pause(exchange);
    }

    pub fn resume(&self, exchange: Option<Exchange>) {
        self.control.resume(exchange);
    }

    pub fn trading_status(&self) -> TradingStatus {
        self.control.status()
    }

    /// One monitor pass: evaluate, then act
    pub async fn run_monitor_tick(&self, now: DateTime<Utc>) -> Result<TickReport, EngineError> {
        self.monitor.run_tick(now).await
    }

    pub fn monitor(&self) -> &PositionMonitor {
        &self.monitor
    }

    /// Exchange-side closes still running after their local settlement
    pub fn pending_exchange_closes(&self) -> usize {
        self.settlement.pending_flattening()
    }

    /// Wait until every exchange-side close started so far has finished or been flagged
    pub async fn drain_exchange_closes(&self) {
        self.settlement.drain().await
    }

    pub async fn refresh_risk_index(&self, now: DateTime<Utc>) -> Result<(), EngineError> {
        self.gate.refresh(now).await.map(|_| ())
    }

    pub fn risk_index(&self, now: DateTime<Utc>) -> EffectiveIndex {
        self.gate.effective_index(now)
    }

    pub async fn position(&self, position_id: &str) -> Result<Position, EngineError> {
        self.positions
            .get(position_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(position_id.to_string()))
    }

    pub async fn open_positions(&self) -> Result<Vec<Position>, EngineError> {
        Ok(self.positions.list_open().await?)
    }

    pub async fn positions_for_user(&self, user_id: &str) -> Result<Vec<Position>, EngineError> {
        Ok(self.positions.list_for_user(user_id).await?)
    }

    /// Mark-to-market PnL of an active position
    pub async fn unrealized_pnl(&self, position_id: &str) -> Result<f64, EngineError> {
        let position = self.position(position_id).await?;
        if !position.is_active() {
            return Err(EngineError::AlreadyClosed {
                position_id: position_id.to_string(),
            });
        }
        let price = self.prices.price(&position.symbol).await?;
        Ok(position.unrealized_pnl(price))
    }

    pub async fn ledger_entries(&self, user_id: &str) -> Result<Vec<LedgerEntry>, EngineError> {
        Ok(self.ledger.entries_for_user(user_id).await?)
    }

    pub async fn ledger_balance(&self, user_id: &str) -> Result<f64, EngineError> {
        Ok(self.ledger.balance(user_id).await?)
    }

    pub async fn commissions(&self, user_id: &str) -> Result<Vec<CommissionRecord>, EngineError> {
        Ok(self.ledger.commissions_for_user(user_id).await?)
    }

    pub async fn pending_reconciliations(&self) -> Result<Vec<ReconciliationFlag>, EngineError> {
        Ok(self.positions.pending_reconciliations().await?)
    }
}
