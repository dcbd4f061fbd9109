use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use lifeguard::application::admin_api;
use lifeguard::application::engine::{EngineComponents, TradingEngine};
use lifeguard::application::runtime::EngineRuntime;
use lifeguard::config::EngineConfig;
use lifeguard::domain::entities::exchange::Exchange;
use lifeguard::domain::repositories::exchange_client::ExchangeRegistry;
use lifeguard::infrastructure::alternative_me::AlternativeMeSentimentSource;
use lifeguard::infrastructure::binance_price_feed::BinanceTickerPriceFeed;
use lifeguard::infrastructure::event_bus::BroadcastEventPublisher;
use lifeguard::infrastructure::simulated::SimulatedExchangeClient;
use lifeguard::infrastructure::static_accounts::StaticAccounts;
use lifeguard::persistence::{init_database, SqliteStore};
use lifeguard::telemetry;

/// Paper-trading host: live prices and sentiment, simulated fills, accounts from a JSON file
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    telemetry::init_tracing(telemetry::DEFAULT_FILTER);

    let config = EngineConfig::load();
    info!("Lifeguard starting (paper trading)");

    let accounts_path =
        std::env::var("ACCOUNTS_FILE").unwrap_or_else(|_| "data/accounts.json".to_string());
    let accounts = match std::fs::read_to_string(&accounts_path) {
        Ok(raw) => StaticAccounts::from_json(&raw)?,
        Err(e) => {
            warn!("No accounts loaded from {}: {}", accounts_path, e);
            StaticAccounts::new()
        }
    };

    let pool = init_database(&config.database).await?;
    let store = Arc::new(SqliteStore::new(pool));

    let mut exchanges = ExchangeRegistry::new();
    for exchange in Exchange::all() {
        exchanges.register(Arc::new(SimulatedExchangeClient::new(exchange)));
    }

    let events = Arc::new(BroadcastEventPublisher::default());
    let mut event_log = events.subscribe();
    tokio::spawn(async move {
        loop {
            match event_log.recv().await {
                Ok(event) => info!("event {}: {:?}", event.name(), event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("Event log lagged, {} events dropped", missed)
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let engine = Arc::new(TradingEngine::new(
        config.clone(),
        EngineComponents {
            accounts: Arc::new(accounts),
            positions: store.clone(),
            ledger: store,
            exchanges,
            price_feed: Arc::new(BinanceTickerPriceFeed::new()),
            sentiment: Arc::new(AlternativeMeSentimentSource::new()),
            events,
        },
    ));

    let runtime = EngineRuntime::spawn(Arc::clone(&engine));

    let admin = if config.admin_api_keys.is_empty() {
        warn!("ADMIN_API_KEYS not set; admin API disabled");
        None
    } else {
        let engine = Arc::clone(&engine);
        let shutdown = runtime.shutdown_signal();
        Some(tokio::spawn(async move {
            if let Err(e) = admin_api::serve(engine, shutdown).await {
                error!("Admin API stopped: {}", e);
            }
        }))
    };

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");

    runtime.shutdown().await;
    if let Some(handle) = admin {
        if let Err(e) = handle.await {
            warn!("Admin API task ended abnormally: {}", e);
        }
    }
    info!("Lifeguard stopped");
    Ok(())
}
