//! Engine lifecycle end-to-end tests
//!
//! Drives `TradingEngine` through its public surface with simulated exchanges, a scripted
//! price feed and a fixed sentiment source:
//! 1. Gate and risk limits on open
//! 2. Multi-exchange fan-out, partial and total failure
//! 3. Monitor exits (stop-loss, trailing stop)
//! 4. Settlement: commission tiers, idempotent close, reconciliation
//! 5. Signal dispatch, emergency close, SQLite persistence

use chrono::Utc;
use std::sync::Arc;

use lifeguard::application::engine::{EngineComponents, TradingEngine};
use lifeguard::config::EngineConfig;
use lifeguard::domain::entities::credential::ExchangeCredential;
use lifeguard::domain::entities::exchange::Exchange;
use lifeguard::domain::entities::position::{CloseReason, PositionSide, PositionStatus};
use lifeguard::domain::entities::risk_policy::RiskPolicy;
use lifeguard::domain::entities::signal::Signal;
use lifeguard::domain::errors::EngineError;
use lifeguard::domain::repositories::exchange_client::ExchangeRegistry;
use lifeguard::domain::repositories::ledger_store::LedgerStore;
use lifeguard::domain::repositories::position_repository::PositionRepository;
use lifeguard::infrastructure::event_bus::EventJournal;
use lifeguard::infrastructure::simulated::{
    FixedSentimentSource, ScriptedPriceFeed, SimulatedExchangeClient,
};
use lifeguard::infrastructure::static_accounts::{AccountProfile, StaticAccounts};
use lifeguard::persistence::{init_database, DatabaseConfig, InMemoryStore, SqliteStore};

struct Harness {
    engine: TradingEngine,
    feed: Arc<ScriptedPriceFeed>,
    sentiment: Arc<FixedSentimentSource>,
    journal: Arc<EventJournal>,
    binance: Arc<SimulatedExchangeClient>,
}

fn test_config() -> EngineConfig {
    EngineConfig {
        // Every monitor tick reads the next scripted price
        price_cache_ttl_seconds: 0,
        settlement_backoff_milliseconds: 1,
        ..EngineConfig::default()
    }
}

fn profile(user: &str, exchanges: &[Exchange], policy: RiskPolicy) -> AccountProfile {
    let credentials = exchanges
        .iter()
        .map(|e| ExchangeCredential::new(format!("{}_{}", user, e), user, *e))
        .collect();
    AccountProfile::new(credentials, policy, 10_000.0)
}

async fn harness_with(
    accounts: StaticAccounts,
    positions: Arc<dyn PositionRepository>,
    ledger: Arc<dyn LedgerStore>,
    registry: ExchangeRegistry,
    binance: Arc<SimulatedExchangeClient>,
    sentiment_value: f64,
) -> Harness {
    let feed = Arc::new(ScriptedPriceFeed::new());
    let sentiment = Arc::new(FixedSentimentSource::new(sentiment_value));
    let journal = Arc::new(EventJournal::new());
    let engine = TradingEngine::new(
        test_config(),
        EngineComponents {
            accounts: Arc::new(accounts),
            positions,
            ledger,
            exchanges: registry.with(binance.clone()),
            price_feed: feed.clone(),
            sentiment: sentiment.clone(),
            events: journal.clone(),
        },
    );
    engine.refresh_risk_index(Utc::now()).await.unwrap();
    Harness {
        engine,
        feed,
        sentiment,
        journal,
        binance,
    }
}

async fn harness(accounts: StaticAccounts, sentiment_value: f64) -> Harness {
    let store = Arc::new(InMemoryStore::new());
    harness_with(
        accounts,
        store.clone(),
        store,
        ExchangeRegistry::new(),
        Arc::new(SimulatedExchangeClient::new(Exchange::Binance)),
        sentiment_value,
    )
    .await
}

fn single_user(policy: RiskPolicy) -> StaticAccounts {
    StaticAccounts::new().with_user("alice", profile("alice", &[Exchange::Binance], policy))
}

fn long(symbol: &str) -> Signal {
    Signal::entry(symbol, PositionSide::Long, 100.0)
}

fn short(symbol: &str) -> Signal {
    Signal::entry(symbol, PositionSide::Short, 100.0)
}

fn assert_rejected(result: Result<impl std::fmt::Debug, EngineError>, fragment: &str) {
    match result {
        Err(EngineError::ValidationRejected { reason }) => {
            assert!(reason.contains(fragment), "unexpected reason: {}", reason)
        }
        other => panic!("expected rejection containing '{}', got {:?}", fragment, other),
    }
}

// ==================== Gate and limits ====================

#[tokio::test]
async fn test_fearful_market_only_opens_longs() {
    let h = harness(single_user(RiskPolicy::default()), 25.0).await;

    assert_rejected(h.engine.open(&short("BTCUSDT"), "alice").await, "LONG_ONLY");
    let report = h.engine.open(&long("BTCUSDT"), "alice").await.unwrap();
    assert_eq!(report.position.status, PositionStatus::Open);
    assert_eq!(h.journal.named("signal.rejected").len(), 1);
}

#[tokio::test]
async fn test_greedy_market_only_opens_shorts() {
    let h = harness(single_user(RiskPolicy::default()), 85.0).await;

    assert_rejected(h.engine.open(&long("ETHUSDT"), "alice").await, "SHORT_ONLY");
    let report = h.engine.open(&short("ETHUSDT"), "alice").await.unwrap();
    assert_eq!(report.position.side, PositionSide::Short);
    // Short protective prices are inverted around the entry
    assert!(report.position.stop_loss_price > report.position.entry_price);
    assert!(report.position.take_profit_price < report.position.entry_price);
}

#[tokio::test]
async fn test_index_change_takes_effect_after_refresh() {
    let h = harness(single_user(RiskPolicy::default()), 50.0).await;
    h.sentiment.set(Some(90.0));
    h.engine.refresh_risk_index(Utc::now()).await.unwrap();

    assert_rejected(h.engine.open(&long("BTCUSDT"), "alice").await, "SHORT_ONLY");
}

#[tokio::test]
async fn test_max_open_positions_blocks_third_open() {
    let policy = RiskPolicy {
        max_open_positions: 2,
        ..RiskPolicy::default()
    };
    let h = harness(single_user(policy), 50.0).await;

    h.engine.open(&long("BTCUSDT"), "alice").await.unwrap();
    h.engine.open(&long("ETHUSDT"), "alice").await.unwrap();
    assert_rejected(h.engine.open(&long("SOLUSDT"), "alice").await, "open positions");

    assert_eq!(h.engine.open_positions().await.unwrap().len(), 2);
    assert_eq!(h.binance.placed_orders().len(), 2);
}

#[tokio::test]
async fn test_cooldown_blocks_reentry_after_close() {
    let h = harness(single_user(RiskPolicy::default()), 50.0).await;
    let report = h.engine.open(&long("BTCUSDT"), "alice").await.unwrap();
    h.engine
        .close_position(&report.position.id, Some(101.0))
        .await
        .unwrap();

    assert_rejected(h.engine.open(&long("BTCUSDT"), "alice").await, "cooling down");
    // Other symbols are unaffected
    h.engine.open(&long("ETHUSDT"), "alice").await.unwrap();
}

// ==================== Fan-out ====================

#[tokio::test]
async fn test_partial_fill_keeps_successful_exchange() {
    let accounts = StaticAccounts::new().with_user(
        "alice",
        profile("alice", &[Exchange::Binance, Exchange::Bybit], RiskPolicy::default()),
    );
    let store = Arc::new(InMemoryStore::new());
    let h = harness_with(
        accounts,
        store.clone(),
        store,
        ExchangeRegistry::new()
            .with(Arc::new(SimulatedExchangeClient::new(Exchange::Bybit).reject_placements("margin"))),
        Arc::new(SimulatedExchangeClient::new(Exchange::Binance)),
        50.0,
    )
    .await;

    let report = h.engine.open(&long("BTCUSDT"), "alice").await.unwrap();
    assert!(report.is_partial());
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].exchange, Exchange::Bybit);
    assert_eq!(report.position.receipts.len(), 1);
    // 500 notional split across two credentials, only one filled
    assert!((report.position.quantity - 2.5).abs() < 1e-9);
    assert_eq!(h.journal.named("execution.alert").len(), 1);
}

#[tokio::test]
async fn test_total_failure_persists_nothing() {
    let store = Arc::new(InMemoryStore::new());
    let h = harness_with(
        single_user(RiskPolicy::default()),
        store.clone(),
        store,
        ExchangeRegistry::new(),
        Arc::new(SimulatedExchangeClient::new(Exchange::Binance).reject_placements("maintenance")),
        50.0,
    )
    .await;

    let err = h.engine.open(&long("BTCUSDT"), "alice").await.unwrap_err();
    assert!(matches!(err, EngineError::ExecutionFailed { .. }));
    assert!(h.engine.positions_for_user("alice").await.unwrap().is_empty());
}

// ==================== Monitor ====================

#[tokio::test]
async fn test_price_path_triggers_stop_loss() {
    let h = harness(single_user(RiskPolicy::default()), 50.0).await;
    let report = h.engine.open(&long("BTCUSDT"), "alice").await.unwrap();
    assert!((report.position.stop_loss_price - 98.0).abs() < 1e-9);
    h.feed.script("BTCUSDT", [101.0, 99.0, 97.0]);

    let now = Utc::now();
    assert!(h.engine.run_monitor_tick(now).await.unwrap().closed.is_empty());
    assert!(h.engine.run_monitor_tick(now).await.unwrap().closed.is_empty());
    let tick = h.engine.run_monitor_tick(now).await.unwrap();
    assert_eq!(tick.closed, vec![report.position.id.clone()]);

    let closed = h.engine.position(&report.position.id).await.unwrap();
    let closing = closed.closing.unwrap();
    assert_eq!(closing.reason, CloseReason::StopLoss);
    assert_eq!(closing.exit_price, 97.0);
    assert!((closing.pnl + 15.0).abs() < 1e-9);
    // Losing trades carry no commission
    assert!(h.engine.commissions("alice").await.unwrap().is_empty());
    assert_eq!(h.engine.ledger_balance("alice").await.unwrap(), 0.0);
    h.engine.drain_exchange_closes().await;
    assert_eq!(h.binance.closed_orders().len(), 1);
}

#[tokio::test]
async fn test_trailing_stop_exits_at_threshold() {
    let policy = RiskPolicy {
        trailing_stop: true,
        take_profit_pct: 0.5,
        ..RiskPolicy::default()
    };
    let h = harness(single_user(policy), 50.0).await;
    let report = h.engine.open(&long("BTCUSDT"), "alice").await.unwrap();
    assert!(report.position.trailing.is_some());
    h.feed.script("BTCUSDT", [100.0, 110.0, 108.8]);

    let now = Utc::now();
    h.engine.run_monitor_tick(now).await.unwrap();
    let tick = h.engine.run_monitor_tick(now).await.unwrap();
    assert_eq!(tick.trailing_updated, 1);
    let trailing = h.engine.position(&report.position.id).await.unwrap().trailing.unwrap();
    assert!((trailing.threshold - 108.9).abs() < 1e-9);

    let tick = h.engine.run_monitor_tick(now).await.unwrap();
    assert_eq!(tick.closed.len(), 1);
    let closing = h
        .engine
        .position(&report.position.id)
        .await
        .unwrap()
        .closing
        .unwrap();
    assert_eq!(closing.reason, CloseReason::TrailingStop);
    assert!((closing.exit_price - 108.9).abs() < 1e-9);
}

// ==================== Settlement ====================

#[tokio::test]
async fn test_commission_rate_depends_on_plan() {
    let accounts = StaticAccounts::new()
        .with_user(
            "alice",
            profile("alice", &[Exchange::Binance], RiskPolicy::default()).with_plan(true),
        )
        .with_user("bob", profile("bob", &[Exchange::Binance], RiskPolicy::default()));
    let h = harness(accounts, 50.0).await;

    let a = h.engine.open(&long("BTCUSDT"), "alice").await.unwrap();
    let b = h.engine.open(&long("BTCUSDT"), "bob").await.unwrap();
    let closed_a = h.engine.close_position(&a.position.id, Some(110.0)).await.unwrap();
    let closed_b = h.engine.close_position(&b.position.id, Some(110.0)).await.unwrap();

    assert!((closed_a.pnl - 50.0).abs() < 1e-9);
    assert!((closed_a.commission.unwrap().amount - 5.0).abs() < 1e-9);
    assert!((closed_b.commission.unwrap().amount - 10.0).abs() < 1e-9);
    assert!((h.engine.ledger_balance("alice").await.unwrap() + 5.0).abs() < 1e-9);
    assert!((h.engine.ledger_balance("bob").await.unwrap() + 10.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_concurrent_closes_settle_once() {
    let h = harness(single_user(RiskPolicy::default()), 50.0).await;
    let report = h.engine.open(&long("BTCUSDT"), "alice").await.unwrap();
    let id = report.position.id.as_str();

    let (first, second) = tokio::join!(
        h.engine.close_position(id, Some(110.0)),
        h.engine.close_position(id, Some(111.0)),
    );
    assert_eq!(
        [first.is_ok(), second.is_ok()].iter().filter(|ok| **ok).count(),
        1
    );
    assert_eq!(h.engine.commissions("alice").await.unwrap().len(), 1);
    assert_eq!(h.engine.ledger_entries("alice").await.unwrap().len(), 1);
    assert_eq!(h.journal.named("position.closed").len(), 1);

    let again = h.engine.close_position(id, Some(112.0)).await.unwrap_err();
    assert!(matches!(again, EngineError::AlreadyClosed { .. }));
}

#[tokio::test]
async fn test_exchange_close_failure_flags_reconciliation() {
    let store = Arc::new(InMemoryStore::new());
    let h = harness_with(
        single_user(RiskPolicy::default()),
        store.clone(),
        store,
        ExchangeRegistry::new(),
        Arc::new(SimulatedExchangeClient::new(Exchange::Binance).fail_closes("position not found")),
        50.0,
    )
    .await;
    let report = h.engine.open(&long("BTCUSDT"), "alice").await.unwrap();

    let closed = h
        .engine
        .close_position(&report.position.id, Some(99.0))
        .await
        .unwrap();
    assert_eq!(closed.position.status, PositionStatus::Closed);
    assert_eq!(closed.flattening, 1);
    assert_eq!(h.journal.named("position.closed").len(), 1);

    h.engine.drain_exchange_closes().await;
    assert_eq!(h.engine.pending_exchange_closes(), 0);
    let flags = h.engine.pending_reconciliations().await.unwrap();
    assert_eq!(flags.len(), 1);
    assert_eq!(flags[0].position_id, report.position.id);
    assert_eq!(h.journal.named("reconciliation.required").len(), 1);
}

// ==================== Dispatch and operator controls ====================

#[tokio::test]
async fn test_dispatch_reaches_every_subscriber() {
    let strict = RiskPolicy {
        min_signal_confidence: 0.9,
        ..RiskPolicy::default()
    };
    let accounts = StaticAccounts::new()
        .with_user("alice", profile("alice", &[Exchange::Binance], RiskPolicy::default()))
        .with_user("bob", profile("bob", &[Exchange::Binance], strict))
        .with_user("carol", profile("carol", &[Exchange::Binance], RiskPolicy::default()));
    accounts.modify("carol", |p| p.subscribed = false);
    let h = harness(accounts, 50.0).await;

    let report = h
        .engine
        .dispatch_signal(&long("BTCUSDT").with_confidence(0.6))
        .await
        .unwrap();
    assert_eq!(report.opened.len(), 1);
    assert_eq!(report.rejected.len(), 1);
    assert_eq!(report.rejected[0].user_id, "bob");
    assert_eq!(report.rejected[0].code, "ERR_VALIDATION_REJECTED");
    assert!(h.engine.positions_for_user("carol").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_close_signal_settles_matching_positions() {
    let h = harness(single_user(RiskPolicy::default()), 50.0).await;
    h.engine.open(&long("BTCUSDT"), "alice").await.unwrap();
    h.engine.open(&long("ETHUSDT"), "alice").await.unwrap();
    h.feed.set_price("BTCUSDT", 104.0);

    let report = h
        .engine
        .dispatch_signal(&Signal::close("BTCUSDT", PositionSide::Long, 104.0))
        .await
        .unwrap();
    assert_eq!(report.closed.len(), 1);

    let open = h.engine.open_positions().await.unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].symbol, "ETHUSDT");
}

#[tokio::test]
async fn test_emergency_close_pauses_and_flattens() {
    let accounts = StaticAccounts::new()
        .with_user("alice", profile("alice", &[Exchange::Binance], RiskPolicy::default()))
        .with_user("bob", profile("bob", &[Exchange::Binance], RiskPolicy::default()));
    let h = harness(accounts, 50.0).await;
    h.engine.dispatch_signal(&long("BTCUSDT")).await.unwrap();
    h.feed.set_price("BTCUSDT", 100.0);

    let report = h.engine.emergency_close_all().await.unwrap();
    assert_eq!(report.closed.len(), 2);
    assert!(report.failed.is_empty());
    assert!(h.engine.trading_status().paused);
    assert!(h.engine.open_positions().await.unwrap().is_empty());
    for position in h.engine.positions_for_user("alice").await.unwrap() {
        assert_eq!(position.closing.unwrap().reason, CloseReason::Emergency);
    }

    assert_rejected(h.engine.open(&long("ETHUSDT"), "alice").await, "paused");
    h.engine.resume(None);
    h.engine.open(&long("ETHUSDT"), "alice").await.unwrap();
}

#[tokio::test]
async fn test_emergency_close_survives_price_outage() {
    let h = harness(single_user(RiskPolicy::default()), 50.0).await;
    let report = h.engine.open(&long("BTCUSDT"), "alice").await.unwrap();
    h.feed.set_price("BTCUSDT", 101.0);
    h.engine.run_monitor_tick(Utc::now()).await.unwrap();
    h.feed.fail("BTCUSDT");

    let manual = h.engine.close_position(&report.position.id, None).await;
    assert!(matches!(manual, Err(EngineError::PriceUnavailable { .. })));

    let bulk = h.engine.emergency_close_all().await.unwrap();
    assert_eq!(bulk.closed, vec![report.position.id.clone()]);
    let closing = h.engine.position(&report.position.id).await.unwrap().closing.unwrap();
    assert_eq!(closing.reason, CloseReason::Emergency);
    assert_eq!(closing.exit_price, 101.0);
}

// ==================== Persistence ====================

#[tokio::test]
async fn test_sqlite_store_round_trips_lifecycle() {
    let pool = init_database(&DatabaseConfig::in_memory()).await.unwrap();
    let store = Arc::new(SqliteStore::new(pool));
    let h = harness_with(
        single_user(RiskPolicy::default()),
        store.clone(),
        store.clone(),
        ExchangeRegistry::new(),
        Arc::new(SimulatedExchangeClient::new(Exchange::Binance)),
        50.0,
    )
    .await;

    let report = h.engine.open(&long("BTCUSDT"), "alice").await.unwrap();
    let stored = store.get(&report.position.id).await.unwrap().unwrap();
    assert_eq!(stored.receipts.len(), 1);
    assert_eq!(stored.status, PositionStatus::Open);

    h.engine
        .close_position(&report.position.id, Some(106.0))
        .await
        .unwrap();
    let stored = store.get(&report.position.id).await.unwrap().unwrap();
    assert_eq!(stored.status, PositionStatus::Closed);
    assert!(store.list_open().await.unwrap().is_empty());

    let commission = store
        .commission_for_position(&report.position.id)
        .await
        .unwrap()
        .unwrap();
    assert!((commission.pnl - 30.0).abs() < 1e-9);
    assert!((commission.amount - 6.0).abs() < 1e-9);
    assert!((store.balance("alice").await.unwrap() + 6.0).abs() < 1e-9);
}
