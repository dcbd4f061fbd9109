//! Opening pipeline: validation chain, sizing, concurrent placement and persistence

use chrono::{DateTime, Utc};
use futures_util::stream::{FuturesUnordered, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::domain::entities::credential::ExchangeCredential;
use crate::domain::entities::events::DomainEvent;
use crate::domain::entities::exchange::Exchange;
use crate::domain::entities::ledger::ReconciliationFlag;
use crate::domain::entities::order::Order;
use crate::domain::entities::position::{ExecutionReceipt, Position, PositionStatus};
use crate::domain::entities::risk_policy::RiskPolicy;
use crate::domain::entities::signal::{Signal, SignalKind};
use crate::domain::errors::{EngineError, ExchangeFailure, StoreError};
use crate::domain::repositories::account_provider::AccountProvider;
use crate::domain::repositories::event_publisher::EventPublisher;
use crate::domain::repositories::exchange_client::{ExchangeError, ExchangeRegistry};
use crate::domain::repositories::position_repository::PositionRepository;
use crate::domain::services::cooldown::CooldownRegistry;
use crate::domain::services::position_sizer::PositionSizer;
use crate::domain::services::risk_gate::RiskGate;
use crate::domain::services::trading_control::TradingControl;
use crate::domain::value_objects::price::Price;
use crate::domain::value_objects::quantity::Quantity;

#[derive(Debug, Clone)]
pub struct OpeningConfig {
    /// Per placement call
    pub exchange_timeout: Duration,
    /// Whole fan-out for one open
    pub open_deadline: Duration,
    /// Used when the policy enables trailing stops without its own offset
    pub trailing_offset_pct: f64,
}

impl Default for OpeningConfig {
    fn default() -> Self {
        Self {
            exchange_timeout: Duration::from_secs(10),
            open_deadline: Duration::from_secs(15),
            trailing_offset_pct: 0.01,
        }
    }
}

/// A persisted open. `failures` lists the credentials whose placement did not fill.
#[derive(Debug, Clone)]
pub struct OpenReport {
    pub position: Position,
    pub failures: Vec<ExchangeFailure>,
}

impl OpenReport {
    pub fn is_partial(&self) -> bool {
        !self.failures.is_empty()
    }
}

/// A placement still unanswered when the open deadline fired
struct InFlight {
    exchange: Exchange,
    credential_id: String,
    client_order_id: String,
}

struct FanOut {
    receipts: Vec<ExecutionReceipt>,
    failures: Vec<ExchangeFailure>,
    in_flight: Vec<InFlight>,
    elapsed: Duration,
}

impl FanOut {
    fn timed_out(&self) -> bool {
        !self.in_flight.is_empty()
    }
}

pub struct OpeningOrchestrator {
    accounts: Arc<dyn AccountProvider>,
    positions: Arc<dyn PositionRepository>,
    exchanges: ExchangeRegistry,
    gate: Arc<RiskGate>,
    cooldowns: Arc<CooldownRegistry>,
    control: Arc<TradingControl>,
    events: Arc<dyn EventPublisher>,
    config: OpeningConfig,
    user_gates: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    sequence: AtomicU64,
}

impl OpeningOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        accounts: Arc<dyn AccountProvider>,
        positions: Arc<dyn PositionRepository>,
        exchanges: ExchangeRegistry,
        gate: Arc<RiskGate>,
        cooldowns: Arc<CooldownRegistry>,
        control: Arc<TradingControl>,
        events: Arc<dyn EventPublisher>,
        config: OpeningConfig,
    ) -> Self {
        Self {
            accounts,
            positions,
            exchanges,
            gate,
            cooldowns,
            control,
            events,
            config,
            user_gates: Mutex::new(HashMap::new()),
            sequence: AtomicU64::new(1),
        }
    }

    fn user_gate(&self, user_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut gates = match self.user_gates.lock() {
            Ok(gates) => gates,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(gates.entry(user_id.to_string()).or_default())
    }

    pub async fn open(&self, signal: &Signal, user_id: &str) -> Result<OpenReport, EngineError> {
        self.open_at(signal, user_id, Utc::now()).await
    }

    /// Run the pipeline with `now` as the reference time for every date-based check.
    ///
    /// Opens for one user are serialized; different users proceed in parallel.
    pub async fn open_at(
        &self,
        signal: &Signal,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<OpenReport, EngineError> {
        let gate = self.user_gate(user_id);
        let _serialized = gate.lock().await;

        let result = self.open_serialized(signal, user_id, now).await;
        match &result {
            Ok(report) => {
                self.events.publish(DomainEvent::PositionOpened {
                    position_id: report.position.id.clone(),
                    user_id: user_id.to_string(),
                    symbol: report.position.symbol.clone(),
                    side: report.position.side,
                    entry_price: report.position.entry_price,
                    quantity: report.position.quantity,
                    exchanges: report.position.receipts.iter().map(|r| r.exchange).collect(),
                    at: now,
                });
                if report.is_partial() {
                    let partial = EngineError::PartialExecutionFailed {
                        position_id: report.position.id.clone(),
                        failures: report.failures.clone(),
                    };
                    warn!("{}", partial);
                    self.alert(user_id, Some(report.position.id.clone()), &partial, now);
                }
            }
            Err(EngineError::ValidationRejected { reason }) => {
                info!(
                    "Rejected {} {} for {}: {}",
                    signal.direction, signal.symbol, user_id, reason
                );
                self.events.publish(DomainEvent::SignalRejected {
                    user_id: user_id.to_string(),
                    symbol: signal.symbol.clone(),
                    side: signal.direction,
                    reason: reason.clone(),
                    at: now,
                });
            }
            Err(e @ (EngineError::ExecutionFailed { .. } | EngineError::Timeout { .. })) => {
                error!("Open of {} for {} failed: {}", signal.symbol, user_id, e);
                let position_id = match e {
                    EngineError::Timeout {
                        persisted_position, ..
                    } => persisted_position.clone(),
                    _ => None,
                };
                self.alert(user_id, position_id, e, now);
            }
            Err(e) => {
                warn!(
                    "Open of {} for {} dropped [{}]: {}",
                    signal.symbol,
                    user_id,
                    e.error_code(),
                    e
                );
            }
        }
        result
    }

    fn alert(&self, user_id: &str, position_id: Option<String>, error: &EngineError, now: DateTime<Utc>) {
        self.events.publish(DomainEvent::ExecutionAlert {
            user_id: user_id.to_string(),
            position_id,
            code: error.error_code().to_string(),
            message: error.to_string(),
            at: now,
        });
    }

    async fn open_serialized(
        &self,
        signal: &Signal,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<OpenReport, EngineError> {
        let (policy, credentials) = self.validate(signal, user_id, now).await?;

        let balance = self
            .accounts
            .free_balance(user_id, &policy.quote_asset)
            .await
            .map_err(|e| EngineError::rejected(format!("Balance unavailable: {}", e)))?;
        let sizing = PositionSizer::size(balance, &policy, signal.price)?;

        let position_id = self.next_position_id(user_id, &signal.symbol, now);
        let reservation = self.reserve(position_id, user_id, signal, &policy, sizing.quantity, now)?;
        self.positions.insert(&reservation).await?;
        debug!("Reserved {} as opening", reservation.id);

        let fan_out = self
            .place_everywhere(&reservation.id, signal, &policy, &credentials, sizing.quantity)
            .await;
        if fan_out.timed_out() {
            self.flag_in_flight(&reservation.id, &fan_out.in_flight, now).await;
        }

        if fan_out.receipts.is_empty() {
            if !self.positions.discard_opening(&reservation.id).await? {
                warn!("Opening reservation {} was already gone", reservation.id);
            }
            if fan_out.timed_out() {
                return Err(EngineError::Timeout {
                    operation: format!("open {}", signal.symbol),
                    elapsed_ms: fan_out.elapsed.as_millis() as u64,
                    persisted_position: None,
                });
            }
            return Err(EngineError::ExecutionFailed {
                failures: fan_out.failures,
            });
        }

        let timed_out = fan_out.timed_out();
        let position = self.filled(&reservation, &policy, fan_out.receipts)?;
        if !self.positions.mark_open(&position).await? {
            return Err(EngineError::Storage(StoreError::NotFound(format!(
                "opening position {}",
                position.id
            ))));
        }
        info!(
            "Opened {} {} {} for {}: {:.6} @ {:.4} on {} exchange(s), stop {:.4}, target {:.4}",
            position.side,
            position.symbol,
            position.id,
            user_id,
            position.quantity,
            position.entry_price,
            position.receipts.len(),
            position.stop_loss_price,
            position.take_profit_price
        );

        if timed_out {
            return Err(EngineError::Timeout {
                operation: format!("open {}", signal.symbol),
                elapsed_ms: fan_out.elapsed.as_millis() as u64,
                persisted_position: Some(position.id),
            });
        }

        Ok(OpenReport {
            position,
            failures: fan_out.failures,
        })
    }

    /// Placements abandoned at the deadline may still fill on the venue
    async fn flag_in_flight(&self, position_id: &str, in_flight: &[InFlight], now: DateTime<Utc>) {
        for placement in in_flight {
            let reason = format!(
                "placement {} unanswered at the {}ms open deadline",
                placement.client_order_id,
                self.config.open_deadline.as_millis()
            );
            error!("Open {} on {}: {}", position_id, placement.exchange, reason);

            let flag = ReconciliationFlag {
                position_id: position_id.to_string(),
                exchange: placement.exchange,
                credential_id: placement.credential_id.clone(),
                order_id: placement.client_order_id.clone(),
                attempts: 1,
                reason: reason.clone(),
                flagged_at: now,
            };
            if let Err(e) = self.positions.flag_for_reconciliation(&flag).await {
                error!("Failed to persist reconciliation flag for {}: {}", position_id, e);
            }
            self.events.publish(DomainEvent::ReconciliationRequired {
                position_id: position_id.to_string(),
                exchange: placement.exchange,
                credential_id: placement.credential_id.clone(),
                reason,
                at: now,
            });
        }
    }

    /// Checks in order; the first failure rejects the signal
    async fn validate(
        &self,
        signal: &Signal,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(RiskPolicy, Vec<ExchangeCredential>), EngineError> {
        if signal.kind != SignalKind::Entry {
            return Err(EngineError::rejected(format!(
                "{:?} signals do not open positions",
                signal.kind
            )));
        }
        if signal.symbol.trim().is_empty() {
            return Err(EngineError::rejected("Signal has no symbol"));
        }

        // 1. credentials
        let credentials = self
            .accounts
            .credentials(user_id)
            .await
            .map_err(|e| EngineError::rejected(format!("Credentials unavailable: {}", e)))?;
        let usable: Vec<ExchangeCredential> = credentials.into_iter().filter(|c| c.is_usable()).collect();
        if usable.is_empty() {
            return Err(EngineError::rejected(
                "No active, validated exchange credentials",
            ));
        }
        let eligible: Vec<ExchangeCredential> = usable
            .into_iter()
            .filter(|c| !self.control.is_exchange_paused(c.exchange))
            .collect();
        if eligible.is_empty() {
            return Err(EngineError::rejected(
                "Trading is paused on every exchange the user can trade",
            ));
        }

        // 2. sentiment gate
        let decision = self.gate.check(signal, now);
        if !decision.allowed {
            return Err(EngineError::rejected(
                decision
                    .reason
                    .unwrap_or_else(|| "Blocked by risk index".to_string()),
            ));
        }

        let policy = self
            .accounts
            .risk_policy(user_id)
            .await
            .map_err(|e| EngineError::rejected(format!("Risk policy unavailable: {}", e)))?;

        // 3. trading window
        policy
            .check_trading_window(now)
            .map_err(EngineError::rejected)?;

        // 4. open positions
        let open = self.positions.count_open_for_user(user_id).await?;
        if open >= policy.max_open_positions {
            return Err(EngineError::rejected(format!(
                "Maximum open positions reached ({}/{})",
                open, policy.max_open_positions
            )));
        }

        let day_start = now
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|midnight| midnight.and_utc())
            .unwrap_or(now);

        // 5. daily trades
        let trades = self.positions.count_opened_since(user_id, day_start).await?;
        if trades >= policy.max_daily_trades {
            return Err(EngineError::rejected(format!(
                "Daily trade limit reached ({}/{})",
                trades, policy.max_daily_trades
            )));
        }

        // 6. daily loss
        let loss = self.positions.realized_loss_since(user_id, day_start).await?;
        if loss >= policy.max_daily_loss {
            return Err(EngineError::rejected(format!(
                "Daily loss limit reached ({:.2}/{:.2})",
                loss, policy.max_daily_loss
            )));
        }

        // 7. symbol lists
        policy.check_symbol(&signal.symbol).map_err(EngineError::rejected)?;

        // 7b. cool-down after a recent close
        if let Some(remaining) = self.cooldowns.remaining(user_id, &signal.symbol, now) {
            return Err(EngineError::rejected(format!(
                "{} is cooling down for {} more minute(s)",
                signal.symbol,
                remaining.num_minutes().max(1)
            )));
        }

        // 8. confidence
        policy
            .check_confidence(signal.confidence)
            .map_err(EngineError::rejected)?;

        debug!(
            "Signal {} {} passed validation for {} on {} credential(s)",
            signal.direction,
            signal.symbol,
            user_id,
            eligible.len()
        );
        Ok((policy, eligible))
    }

    fn next_position_id(&self, user_id: &str, symbol: &str, now: DateTime<Utc>) -> String {
        format!(
            "pos_{}_{}_{}_{}",
            user_id,
            symbol,
            now.timestamp_millis(),
            self.sequence.fetch_add(1, Ordering::Relaxed)
        )
    }

    /// Place one market order per credential. The sized quantity is split evenly.
    async fn place_everywhere(
        &self,
        position_id: &str,
        signal: &Signal,
        policy: &RiskPolicy,
        credentials: &[ExchangeCredential],
        total_quantity: f64,
    ) -> FanOut {
        let mut failures = Vec::new();
        let (reference, share) = match (
            Price::new(signal.price),
            Quantity::new(total_quantity / credentials.len().max(1) as f64),
        ) {
            (Ok(price), Ok(quantity)) => (price, quantity),
            (Err(e), _) | (_, Err(e)) => {
                for credential in credentials {
                    failures.push(ExchangeFailure {
                        exchange: credential.exchange,
                        credential_id: credential.id.clone(),
                        reason: e.to_string(),
                    });
                }
                return FanOut {
                    receipts: Vec::new(),
                    failures,
                    in_flight: Vec::new(),
                    elapsed: Duration::ZERO,
                };
            }
        };

        let timeout = self.config.exchange_timeout;
        let orders: Vec<(&ExchangeCredential, Order)> = credentials
            .iter()
            .map(|credential| {
                let order = Order::market_open(
                    position_id,
                    &credential.id,
                    &signal.symbol,
                    signal.direction,
                    share,
                    reference,
                    policy.leverage.max(1.0),
                );
                (credential, order)
            })
            .collect();
        let mut pending: FuturesUnordered<_> = orders
            .iter()
            .map(|(credential, order)| {
                let client = self.exchanges.get(credential.exchange);
                async move {
                    let result = match client {
                        Ok(client) => {
                            match tokio::time::timeout(timeout, client.place_order(credential, order)).await {
                                Ok(result) => result,
                                Err(_) => Err(ExchangeError::Timeout(timeout.as_millis() as u64)),
                            }
                        }
                        Err(e) => Err(e),
                    };
                    (*credential, result)
                }
            })
            .collect();

        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + self.config.open_deadline;
        let mut receipts = Vec::new();
        let mut settled: Vec<&str> = Vec::new();
        let mut timed_out = false;

        loop {
            match tokio::time::timeout_at(deadline, pending.next()).await {
                Ok(Some((credential, Ok(receipt)))) => {
                    debug!(
                        "{} filled {} for {} in {:?}",
                        credential.exchange,
                        receipt.order_id,
                        position_id,
                        started.elapsed()
                    );
                    settled.push(&credential.id);
                    receipts.push(receipt);
                }
                Ok(Some((credential, Err(e)))) => {
                    warn!(
                        "Placement for {} on {} ({}) failed: {}",
                        position_id, credential.exchange, credential.id, e
                    );
                    settled.push(&credential.id);
                    failures.push(ExchangeFailure {
                        exchange: credential.exchange,
                        credential_id: credential.id.clone(),
                        reason: e.to_string(),
                    });
                }
                Ok(None) => break,
                Err(_) => {
                    timed_out = true;
                    break;
                }
            }
        }
        drop(pending);
        let elapsed = started.elapsed();

        let mut in_flight = Vec::new();
        if timed_out {
            for (credential, order) in orders.iter().filter(|(c, _)| !settled.contains(&c.id.as_str())) {
                failures.push(ExchangeFailure {
                    exchange: credential.exchange,
                    credential_id: credential.id.clone(),
                    reason: format!(
                        "no fill before the {}ms open deadline",
                        self.config.open_deadline.as_millis()
                    ),
                });
                in_flight.push(InFlight {
                    exchange: credential.exchange,
                    credential_id: credential.id.clone(),
                    client_order_id: order.client_order_id.clone(),
                });
            }
        }

        FanOut {
            receipts,
            failures,
            in_flight,
            elapsed,
        }
    }

    /// The `opening` row written before any order leaves: sized quantity at the signal price
    fn reserve(
        &self,
        position_id: String,
        user_id: &str,
        signal: &Signal,
        policy: &RiskPolicy,
        quantity: f64,
        now: DateTime<Utc>,
    ) -> Result<Position, EngineError> {
        let protective = PositionSizer::protective_prices(signal.direction, signal.price, policy)?;
        let mut position = Position::opening(
            position_id,
            user_id.to_string(),
            signal.symbol.clone(),
            signal.direction,
            signal.price,
            quantity,
            policy.leverage.max(1.0),
            protective.stop_loss,
            protective.take_profit,
            now,
        );
        position.signal_source = signal.source.clone();
        Ok(position)
    }

    /// Reprice the reservation from the fills obtained and move it to `open`
    fn filled(
        &self,
        reservation: &Position,
        policy: &RiskPolicy,
        receipts: Vec<ExecutionReceipt>,
    ) -> Result<Position, EngineError> {
        let quantity: f64 = receipts.iter().map(|r| r.filled_quantity).sum();
        let entry_price = if quantity > 0.0 {
            receipts
                .iter()
                .map(|r| r.filled_price * r.filled_quantity)
                .sum::<f64>()
                / quantity
        } else {
            reservation.entry_price
        };
        let protective = PositionSizer::protective_prices(reservation.side, entry_price, policy)?;

        let mut position = Position::opening(
            reservation.id.clone(),
            reservation.user_id.clone(),
            reservation.symbol.clone(),
            reservation.side,
            entry_price,
            quantity,
            reservation.leverage,
            protective.stop_loss,
            protective.take_profit,
            reservation.opened_at,
        );
        if policy.trailing_stop {
            let offset = policy
                .trailing_offset_pct
                .unwrap_or(self.config.trailing_offset_pct);
            position = position.with_trailing_stop(offset);
        }
        position.signal_source = reservation.signal_source.clone();
        position.receipts = receipts;
        position.status = PositionStatus::Open;
        Ok(position)
    }
}
#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::position::{CloseReason, PositionSide};
    use crate::infrastructure::event_bus::EventJournal;
    use crate::infrastructure::simulated::{FixedSentimentSource, SimulatedExchangeClient};
    use crate::infrastructure::static_accounts::{AccountProfile, StaticAccounts};
    use crate::persistence::InMemoryStore;
    use crate::domain::repositories::position_repository::SettlementCommit;
    use chrono::{Duration as ChronoDuration, TimeZone};

    struct Fixture {
        store: Arc<InMemoryStore>,
        journal: Arc<EventJournal>,
        cooldowns: Arc<CooldownRegistry>,
        control: Arc<TradingControl>,
        sentiment: Arc<FixedSentimentSource>,
        gate: Arc<RiskGate>,
        orchestrator: OpeningOrchestrator,
    }

    fn credentials(exchanges: &[Exchange]) -> Vec<ExchangeCredential> {
        exchanges
            .iter()
            .enumerate()
            .map(|(i, e)| ExchangeCredential::new(format!("cred_{}", i + 1), "u1", *e))
            .collect()
    }

    fn fixture(
        policy: RiskPolicy,
        creds: Vec<ExchangeCredential>,
        clients: Vec<SimulatedExchangeClient>,
        config: OpeningConfig,
    ) -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let journal = Arc::new(EventJournal::new());
        let cooldowns = Arc::new(CooldownRegistry::new(ChronoDuration::hours(2)));
        let control = Arc::new(TradingControl::new());
        let sentiment = Arc::new(FixedSentimentSource::new(50.0));
        let gate = Arc::new(RiskGate::new(
            sentiment.clone(),
            ChronoDuration::hours(2),
            50.0,
            Duration::from_secs(1),
        ));
        let accounts = StaticAccounts::new().with_user("u1", AccountProfile::new(creds, policy, 10_000.0));
        let mut registry = ExchangeRegistry::new();
        for client in clients {
            registry.register(Arc::new(client));
        }
        let orchestrator = OpeningOrchestrator::new(
            Arc::new(accounts),
            store.clone(),
            registry,
            gate.clone(),
            cooldowns.clone(),
            control.clone(),
            journal.clone(),
            config,
        );
        Fixture {
            store,
            journal,
            cooldowns,
            control,
            sentiment,
            gate,
            orchestrator,
        }
    }

    fn simple() -> Fixture {
        fixture(
            RiskPolicy::default(),
            credentials(&[Exchange::Binance]),
            vec![SimulatedExchangeClient::new(Exchange::Binance)],
            OpeningConfig::default(),
        )
    }

    fn long_btc() -> Signal {
        Signal::entry("BTCUSDT", PositionSide::Long, 100.0)
    }

    // Wednesday noon
    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 8, 12, 0, 0).unwrap()
    }

    fn rejection(err: EngineError) -> String {
        match err {
            EngineError::ValidationRejected { reason } => reason,
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_open_persists_position_with_protective_prices() {
        let f = simple();
        let report = f.orchestrator.open_at(&long_btc(), "u1", noon()).await.unwrap();

        let position = &report.position;
        assert_eq!(position.status, PositionStatus::Open);
        assert_eq!(position.entry_price, 100.0);
        // 5% of 10_000 = 500 notional
        assert!((position.quantity - 5.0).abs() < 1e-9);
        assert!((position.stop_loss_price - 98.0).abs() < 1e-9);
        assert!((position.take_profit_price - 106.0).abs() < 1e-9);
        assert_eq!(position.receipts.len(), 1);
        assert!(!report.is_partial());

        let stored = f.store.get(&position.id).await.unwrap().unwrap();
        assert_eq!(&stored, position);
        assert_eq!(f.journal.named("position.opened").len(), 1);
    }

    #[tokio::test]
    async fn test_extreme_fear_blocks_shorts_only() {
        let f = simple();
        f.sentiment.set(Some(25.0));
        f.gate.refresh(noon()).await.unwrap();

        let short = Signal::entry("BTCUSDT", PositionSide::Short, 100.0);
        let reason = rejection(f.orchestrator.open_at(&short, "u1", noon()).await.unwrap_err());
        assert!(reason.contains("25.0"));
        assert!(reason.contains("below 30"));
        assert_eq!(f.journal.named("signal.rejected").len(), 1);

        assert!(f.orchestrator.open_at(&long_btc(), "u1", noon()).await.is_ok());
    }

    #[tokio::test]
    async fn test_max_open_positions() {
        let policy = RiskPolicy {
            max_open_positions: 2,
            ..RiskPolicy::default()
        };
        let f = fixture(
            policy,
            credentials(&[Exchange::Binance]),
            vec![SimulatedExchangeClient::new(Exchange::Binance)],
            OpeningConfig::default(),
        );

        for symbol in ["BTCUSDT", "ETHUSDT"] {
            let signal = Signal::entry(symbol, PositionSide::Long, 100.0);
            f.orchestrator.open_at(&signal, "u1", noon()).await.unwrap();
        }
        let third = Signal::entry("SOLUSDT", PositionSide::Long, 100.0);
        let reason = rejection(f.orchestrator.open_at(&third, "u1", noon()).await.unwrap_err());
        assert!(reason.contains("Maximum open positions"));
        assert_eq!(f.store.count_open_for_user("u1").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_daily_loss_limit() {
        let policy = RiskPolicy {
            max_daily_loss: 5.0,
            ..RiskPolicy::default()
        };
        let f = fixture(
            policy,
            credentials(&[Exchange::Binance]),
            vec![SimulatedExchangeClient::new(Exchange::Binance)],
            OpeningConfig::default(),
        );
        let report = f.orchestrator.open_at(&long_btc(), "u1", noon()).await.unwrap();
        f.store
            .commit_settlement(&SettlementCommit {
                position_id: report.position.id.clone(),
                exit_price: 98.0,
                pnl: -10.0,
                reason: CloseReason::StopLoss,
                closed_at: noon(),
                commission: None,
                ledger_entries: vec![],
            })
            .await
            .unwrap();

        let eth = Signal::entry("ETHUSDT", PositionSide::Long, 100.0);
        let reason = rejection(f.orchestrator.open_at(&eth, "u1", noon()).await.unwrap_err());
        assert!(reason.contains("Daily loss"));
    }

    #[tokio::test]
    async fn test_cooldown_blocks_symbol_reentry() {
        let f = simple();
        f.cooldowns.start("u1", "BTCUSDT", noon() - ChronoDuration::minutes(30));

        let reason = rejection(f.orchestrator.open_at(&long_btc(), "u1", noon()).await.unwrap_err());
        assert!(reason.contains("cooling down"));

        let eth = Signal::entry("ETHUSDT", PositionSide::Long, 100.0);
        assert!(f.orchestrator.open_at(&eth, "u1", noon()).await.is_ok());
    }

    #[tokio::test]
    async fn test_confidence_and_symbol_lists() {
        let policy = RiskPolicy {
            blacklist: vec!["DOGEUSDT".to_string()],
            min_signal_confidence: 0.6,
            ..RiskPolicy::default()
        };
        let f = fixture(
            policy,
            credentials(&[Exchange::Binance]),
            vec![SimulatedExchangeClient::new(Exchange::Binance)],
            OpeningConfig::default(),
        );

        let doge = Signal::entry("DOGEUSDT", PositionSide::Long, 0.1);
        assert!(rejection(f.orchestrator.open_at(&doge, "u1", noon()).await.unwrap_err())
            .contains("blacklisted"));

        let weak = long_btc().with_confidence(0.4);
        assert!(rejection(f.orchestrator.open_at(&weak, "u1", noon()).await.unwrap_err())
            .contains("confidence"));
    }

    #[tokio::test]
    async fn test_no_usable_credentials() {
        let mut creds = credentials(&[Exchange::Binance]);
        creds[0].validated = false;
        let f = fixture(
            RiskPolicy::default(),
            creds,
            vec![SimulatedExchangeClient::new(Exchange::Binance)],
            OpeningConfig::default(),
        );
        let reason = rejection(f.orchestrator.open_at(&long_btc(), "u1", noon()).await.unwrap_err());
        assert!(reason.contains("credentials"));
    }

    #[tokio::test]
    async fn test_paused_exchange_is_skipped() {
        let f = fixture(
            RiskPolicy::default(),
            credentials(&[Exchange::Binance, Exchange::Bybit]),
            vec![
                SimulatedExchangeClient::new(Exchange::Binance),
                SimulatedExchangeClient::new(Exchange::Bybit),
            ],
            OpeningConfig::default(),
        );
        f.control.pause(Some(Exchange::Bybit));

        let report = f.orchestrator.open_at(&long_btc(), "u1", noon()).await.unwrap();
        assert_eq!(report.position.receipts.len(), 1);
        assert_eq!(report.position.receipts[0].exchange, Exchange::Binance);

        f.control.pause(None);
        let eth = Signal::entry("ETHUSDT", PositionSide::Long, 100.0);
        assert!(rejection(f.orchestrator.open_at(&eth, "u1", noon()).await.unwrap_err())
            .contains("paused"));
    }

    #[tokio::test]
    async fn test_partial_placement_persists_successful_receipts() {
        let f = fixture(
            RiskPolicy::default(),
            credentials(&[Exchange::Binance, Exchange::Bybit]),
            vec![
                SimulatedExchangeClient::new(Exchange::Binance),
                SimulatedExchangeClient::new(Exchange::Bybit).reject_placements("margin mode"),
            ],
            OpeningConfig::default(),
        );

        let report = f.orchestrator.open_at(&long_btc(), "u1", noon()).await.unwrap();
        assert!(report.is_partial());
        assert_eq!(report.failures[0].exchange, Exchange::Bybit);
        assert_eq!(report.position.receipts.len(), 1);
        // Half of the sized 5 units went to the failed venue
        assert!((report.position.quantity - 2.5).abs() < 1e-9);
        assert_eq!(f.journal.named("execution.alert").len(), 1);
    }

    #[tokio::test]
    async fn test_total_failure_persists_nothing() {
        let f = fixture(
            RiskPolicy::default(),
            credentials(&[Exchange::Binance, Exchange::Bybit]),
            vec![
                SimulatedExchangeClient::new(Exchange::Binance).reject_placements("insufficient margin"),
                SimulatedExchangeClient::new(Exchange::Bybit).reject_placements("rate limited"),
            ],
            OpeningConfig::default(),
        );

        match f.orchestrator.open_at(&long_btc(), "u1", noon()).await {
            Err(EngineError::ExecutionFailed { failures }) => assert_eq!(failures.len(), 2),
            other => panic!("expected ExecutionFailed, got {:?}", other),
        }
        assert!(f.store.list_for_user("u1").await.unwrap().is_empty());
        assert!(f.journal.named("position.opened").is_empty());
    }

    #[tokio::test]
    async fn test_unregistered_exchange_counts_as_failure() {
        let f = fixture(
            RiskPolicy::default(),
            credentials(&[Exchange::Okx]),
            vec![],
            OpeningConfig::default(),
        );
        assert!(matches!(
            f.orchestrator.open_at(&long_btc(), "u1", noon()).await,
            Err(EngineError::ExecutionFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_deadline_keeps_fills_obtained_in_time() {
        let config = OpeningConfig {
            exchange_timeout: Duration::from_secs(5),
            open_deadline: Duration::from_millis(50),
            trailing_offset_pct: 0.01,
        };
        let f = fixture(
            RiskPolicy::default(),
            credentials(&[Exchange::Binance, Exchange::Bybit]),
            vec![
                SimulatedExchangeClient::new(Exchange::Binance),
                SimulatedExchangeClient::new(Exchange::Bybit).delay_placements(Duration::from_secs(2)),
            ],
            config,
        );

        match f.orchestrator.open_at(&long_btc(), "u1", noon()).await {
            Err(EngineError::Timeout {
                persisted_position: Some(id),
                elapsed_ms,
                ..
            }) => {
                assert!((40..2000).contains(&elapsed_ms), "elapsed {}ms", elapsed_ms);
                let stored = f.store.get(&id).await.unwrap().unwrap();
                assert_eq!(stored.status, PositionStatus::Open);
                assert_eq!(stored.receipts.len(), 1);
                assert_eq!(stored.receipts[0].exchange, Exchange::Binance);

                // The Bybit order may still fill after we stopped waiting
                let flags = f.store.pending_reconciliations().await.unwrap();
                assert_eq!(flags.len(), 1);
                assert_eq!(flags[0].position_id, id);
                assert_eq!(flags[0].exchange, Exchange::Bybit);
                assert_eq!(flags[0].credential_id, "cred_2");
                assert_eq!(flags[0].order_id, format!("{}-cred_2-open", id));
                assert_eq!(f.journal.named("reconciliation.required").len(), 1);
            }
            other => panic!("expected Timeout with persisted position, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_deadline_without_fills_discards_reservation() {
        let config = OpeningConfig {
            exchange_timeout: Duration::from_secs(5),
            open_deadline: Duration::from_millis(50),
            trailing_offset_pct: 0.01,
        };
        let f = fixture(
            RiskPolicy::default(),
            credentials(&[Exchange::Binance]),
            vec![SimulatedExchangeClient::new(Exchange::Binance).delay_placements(Duration::from_secs(2))],
            config,
        );

        match f.orchestrator.open_at(&long_btc(), "u1", noon()).await {
            Err(EngineError::Timeout {
                persisted_position: None,
                elapsed_ms,
                ..
            }) => assert!((40..2000).contains(&elapsed_ms), "elapsed {}ms", elapsed_ms),
            other => panic!("expected Timeout without position, got {:?}", other),
        }
        assert!(f.store.list_for_user("u1").await.unwrap().is_empty());
        assert_eq!(f.store.pending_reconciliations().await.unwrap().len(), 1);
        assert!(f.journal.named("position.opened").is_empty());
    }

    #[tokio::test]
    async fn test_position_is_opening_while_orders_are_out() {
        let f = fixture(
            RiskPolicy::default(),
            credentials(&[Exchange::Binance]),
            vec![SimulatedExchangeClient::new(Exchange::Binance).delay_placements(Duration::from_millis(200))],
            OpeningConfig::default(),
        );

        let observe = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let during = f.store.list_for_user("u1").await.unwrap();
            let open = f.store.list_open().await.unwrap();
            (during, open)
        };
        let signal = long_btc();
        let (report, (during, open)) = tokio::join!(f.orchestrator.open_at(&signal, "u1", noon()), observe);

        assert_eq!(during.len(), 1);
        assert_eq!(during[0].status, PositionStatus::Opening);
        assert!(during[0].receipts.is_empty());
        assert!(open.is_empty(), "opening positions are not monitored");

        let report = report.unwrap();
        assert_eq!(during[0].id, report.position.id);
        let stored = f.store.get(&report.position.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PositionStatus::Open);
    }

    #[tokio::test]
    async fn test_trailing_stop_starts_at_entry() {
        let policy = RiskPolicy {
            trailing_stop: true,
            ..RiskPolicy::default()
        };
        let f = fixture(
            policy,
            credentials(&[Exchange::Binance]),
            vec![SimulatedExchangeClient::new(Exchange::Binance)],
            OpeningConfig::default(),
        );
        let report = f.orchestrator.open_at(&long_btc(), "u1", noon()).await.unwrap();
        let trailing = report.position.trailing.unwrap();
        assert_eq!(trailing.best_price, 100.0);
        assert!((trailing.threshold - 99.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_close_signal_does_not_open() {
        let f = simple();
        let close = Signal::close("BTCUSDT", PositionSide::Long, 100.0);
        assert!(matches!(
            f.orchestrator.open_at(&close, "u1", noon()).await,
            Err(EngineError::ValidationRejected { .. })
        ));
    }
}
