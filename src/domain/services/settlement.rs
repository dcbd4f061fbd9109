//! Settlement: PnL, commission, ledger and exchange-side flattening for one close

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::domain::entities::credential::ExchangeCredential;
use crate::domain::entities::events::DomainEvent;
use crate::domain::entities::ledger::{CommissionRecord, LedgerEntry, LedgerKind, ReconciliationFlag};
use crate::domain::entities::order::Order;
use crate::domain::entities::position::{CloseReason, ExecutionReceipt, Position};
use crate::domain::errors::EngineError;
use crate::domain::repositories::account_provider::AccountProvider;
use crate::domain::repositories::event_publisher::EventPublisher;
use crate::domain::repositories::exchange_client::{ExchangeError, ExchangeRegistry};
use crate::domain::repositories::position_repository::{PositionRepository, SettlementCommit};
use crate::domain::services::cooldown::CooldownRegistry;
use crate::domain::value_objects::pnl::PnL;
use crate::domain::value_objects::price::Price;
use crate::domain::value_objects::quantity::Quantity;
use crate::task_runner::{retry_with_backoff, RetryPolicy};

#[derive(Debug, Clone)]
pub struct SettlementConfig {
    pub commission_rate_with_plan: f64,
    pub commission_rate_without_plan: f64,
    pub commission_currency: String,
    pub retry: RetryPolicy,
    pub exchange_timeout: Duration,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            commission_rate_with_plan: 0.10,
            commission_rate_without_plan: 0.20,
            commission_currency: "USDT".to_string(),
            retry: RetryPolicy::new(3, Duration::from_millis(500)),
            exchange_timeout: Duration::from_secs(10),
        }
    }
}

/// Outcome of a successful local close. Exchange-side flattening continues in the background.
#[derive(Debug, Clone)]
pub struct ClosedPosition {
    pub position: Position,
    pub pnl: f64,
    pub commission: Option<CommissionRecord>,
    /// Receipts handed to the background flattening task
    pub flattening: usize,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Closes the venue-side legs of a settled position, flagging the ones that give up
#[derive(Clone)]
struct ExchangeFlattener {
    positions: Arc<dyn PositionRepository>,
    accounts: Arc<dyn AccountProvider>,
    exchanges: ExchangeRegistry,
    events: Arc<dyn EventPublisher>,
    retry: RetryPolicy,
    exchange_timeout: Duration,
}

pub struct SettlementEngine {
    positions: Arc<dyn PositionRepository>,
    accounts: Arc<dyn AccountProvider>,
    events: Arc<dyn EventPublisher>,
    cooldowns: Arc<CooldownRegistry>,
    config: SettlementConfig,
    flattener: ExchangeFlattener,
    flattening: Mutex<Vec<JoinHandle<()>>>,
}

impl SettlementEngine {
    pub fn new(
        positions: Arc<dyn PositionRepository>,
        accounts: Arc<dyn AccountProvider>,
        exchanges: ExchangeRegistry,
        events: Arc<dyn EventPublisher>,
        cooldowns: Arc<CooldownRegistry>,
        config: SettlementConfig,
    ) -> Self {
        let flattener = ExchangeFlattener {
            positions: Arc::clone(&positions),
            accounts: Arc::clone(&accounts),
            exchanges,
            events: Arc::clone(&events),
            retry: config.retry.clone(),
            exchange_timeout: config.exchange_timeout,
        };
        Self {
            positions,
            accounts,
            events,
            cooldowns,
            config,
            flattener,
            flattening: Mutex::new(Vec::new()),
        }
    }

    async fn commission_rate(&self, user_id: &str) -> f64 {
        match self.accounts.has_active_plan(user_id).await {
            Ok(true) => self.config.commission_rate_with_plan,
            Ok(false) => self.config.commission_rate_without_plan,
            Err(e) => {
                warn!(
                    "Plan lookup for {} failed ({}), charging the no-plan rate",
                    user_id, e
                );
                self.config.commission_rate_without_plan
            }
        }
    }

    /// Close `position` at `exit_price`.
    ///
    /// The local close, commission and ledger rows commit first and atomically, then the
    /// cool-down starts and `position.closed` is published. Exchange-side closes run in a
    /// background task: one that exhausts its retries is flagged for reconciliation, but the
    /// position stays closed. Must be called from within a tokio runtime.
    pub async fn close(
        &self,
        position: &Position,
        exit_price: f64,
        reason: CloseReason,
        now: DateTime<Utc>,
    ) -> Result<ClosedPosition, EngineError> {
        if position.is_closed() {
            return Err(EngineError::AlreadyClosed {
                position_id: position.id.clone(),
            });
        }
        let exit = Price::new(exit_price).map_err(|_| EngineError::InvalidPrice { price: exit_price })?;

        let pnl = PnL::of_trade(
            position.side,
            position.entry_price,
            exit.value(),
            position.quantity,
            position.leverage,
        )
        .map_err(|_| EngineError::InvalidPrice { price: exit_price })?;

        let (commission, ledger_entries) = if pnl.is_profit() {
            let rate = self.commission_rate(&position.user_id).await;
            let amount = pnl.commission(rate);
            let record = CommissionRecord {
                id: format!("com_{}", position.id),
                user_id: position.user_id.clone(),
                position_id: position.id.clone(),
                rate,
                pnl: pnl.value(),
                amount,
                currency: self.config.commission_currency.clone(),
                created_at: now,
            };
            let entry = LedgerEntry {
                id: format!("led_{}_commission", position.id),
                user_id: position.user_id.clone(),
                position_id: Some(position.id.clone()),
                kind: LedgerKind::Commission,
                amount: -amount,
                currency: self.config.commission_currency.clone(),
                created_at: now,
            };
            (Some(record), vec![entry])
        } else {
            (None, Vec::new())
        };

        let commit = SettlementCommit {
            position_id: position.id.clone(),
            exit_price: exit.value(),
            pnl: pnl.value(),
            reason,
            closed_at: now,
            commission: commission.clone(),
            ledger_entries,
        };
        if !self.positions.commit_settlement(&commit).await? {
            info!("Position {} was already closed; settlement skipped", position.id);
            return Err(EngineError::AlreadyClosed {
                position_id: position.id.clone(),
            });
        }

        let mut closed = position.clone();
        closed.close(exit.value(), reason, now);
        info!(
            "Closed {} {} {} for {} at {} ({}): PnL {}",
            closed.side, closed.symbol, closed.id, closed.user_id, exit, reason, pnl
        );

        self.cooldowns.start(&closed.user_id, &closed.symbol, now);

        self.events.publish(DomainEvent::PositionClosed {
            position_id: closed.id.clone(),
            user_id: closed.user_id.clone(),
            symbol: closed.symbol.clone(),
            reason,
            exit_price: exit.value(),
            pnl: pnl.value(),
            commission: commission.as_ref().map(|c| c.amount).unwrap_or(0.0),
            at: now,
        });

        let flattening = closed.receipts.len();
        self.spawn_flattening(closed.clone(), exit, now);

        Ok(ClosedPosition {
            position: closed,
            pnl: pnl.value(),
            commission,
            flattening,
        })
    }

    fn spawn_flattening(&self, position: Position, exit: Price, now: DateTime<Utc>) {
        if position.receipts.is_empty() {
            return;
        }
        let flattener = self.flattener.clone();
        let handle = tokio::spawn(async move {
            flattener.close_on_exchanges(&position, exit, now).await;
        });

        let mut tasks = locked(&self.flattening);
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    /// Exchange-side closes still running
    pub fn pending_flattening(&self) -> usize {
        locked(&self.flattening)
            .iter()
            .filter(|task| !task.is_finished())
            .count()
    }

    /// Wait for every exchange-side close started so far, including ones started while waiting
    pub async fn drain(&self) {
        loop {
            let tasks = std::mem::take(&mut *locked(&self.flattening));
            if tasks.is_empty() {
                return;
            }
            debug!("Waiting for {} exchange-side close task(s)", tasks.len());
            for task in tasks {
                if let Err(e) = task.await {
                    warn!("Exchange-side close task ended abnormally: {}", e);
                }
            }
        }
    }
}

impl ExchangeFlattener {
    /// Returns the number of receipts flagged for reconciliation
    async fn close_on_exchanges(&self, position: &Position, exit: Price, now: DateTime<Utc>) -> usize {
        let credentials = match self.accounts.credentials(&position.user_id).await {
            Ok(credentials) => credentials,
            Err(e) => {
                warn!(
                    "Credential lookup for {} failed: {}; closing with stored handles",
                    position.user_id, e
                );
                Vec::new()
            }
        };

        let closes = position.receipts.iter().map(|receipt| {
            // Deactivated credentials still flatten what they opened
            let credential = credentials
                .iter()
                .find(|c| c.id == receipt.credential_id)
                .cloned()
                .unwrap_or_else(|| {
                    ExchangeCredential::new(
                        receipt.credential_id.clone(),
                        position.user_id.clone(),
                        receipt.exchange,
                    )
                });
            self.close_receipt(position, receipt, credential, exit)
        });
        let outcomes = join_all(closes).await;

        let mut flagged = 0;
        for (receipt, outcome) in position.receipts.iter().zip(outcomes) {
            let Err((attempts, reason)) = outcome else {
                continue;
            };
            let failure = EngineError::SettlementExchangeError {
                position_id: position.id.clone(),
                exchange: receipt.exchange,
                attempts,
                reason: reason.clone(),
            };
            error!("{}", failure);

            let flag = ReconciliationFlag {
                position_id: position.id.clone(),
                exchange: receipt.exchange,
                credential_id: receipt.credential_id.clone(),
                order_id: receipt.order_id.clone(),
                attempts,
                reason: reason.clone(),
                flagged_at: now,
            };
            if let Err(e) = self.positions.flag_for_reconciliation(&flag).await {
                error!("Failed to persist reconciliation flag for {}: {}", position.id, e);
            }
            self.events.publish(DomainEvent::ReconciliationRequired {
                position_id: position.id.clone(),
                exchange: receipt.exchange,
                credential_id: receipt.credential_id.clone(),
                reason,
                at: now,
            });
            flagged += 1;
        }
        if flagged == 0 {
            debug!("Exchange-side closes for {} complete", position.id);
        }
        flagged
    }

    async fn close_receipt(
        &self,
        position: &Position,
        receipt: &ExecutionReceipt,
        credential: ExchangeCredential,
        exit: Price,
    ) -> Result<String, (u32, String)> {
        let client = self
            .exchanges
            .get(receipt.exchange)
            .map_err(|e| (0, e.to_string()))?;
        let quantity = Quantity::new(receipt.filled_quantity).map_err(|e| (0, e.to_string()))?;
        let order = Order::market_close(
            &position.id,
            &receipt.credential_id,
            &position.symbol,
            position.side,
            quantity,
            exit,
            position.leverage,
        );

        let operation = format!("close {} on {}", position.id, receipt.exchange);
        let timeout = self.exchange_timeout;
        retry_with_backoff(
            &operation,
            &self.retry,
            ExchangeError::is_retryable,
            |_| {
                let client = Arc::clone(&client);
                let credential = &credential;
                let order = &order;
                async move {
                    match tokio::time::timeout(timeout, client.close_position(credential, receipt, order))
                        .await
                    {
                        Ok(result) => result,
                        Err(_) => Err(ExchangeError::Timeout(timeout.as_millis() as u64)),
                    }
                }
            },
        )
        .await
        .map_err(|exhausted| (exhausted.attempts, exhausted.last_error.to_string()))
    }
}
