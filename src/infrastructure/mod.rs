pub mod alternative_me;
pub mod binance_price_feed;
pub mod event_bus;
pub mod simulated;
pub mod static_accounts;
