pub mod account_provider;
pub mod event_publisher;
pub mod exchange_client;
pub mod ledger_store;
pub mod position_repository;
pub mod price_feed;
pub mod sentiment_source;
