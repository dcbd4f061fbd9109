//! Lifeguard position lifecycle engine
//!
//! Opens positions across a user's exchanges behind a market-sentiment gate and per-user
//! risk limits, watches them for stop-loss, take-profit, trailing-stop and timeout exits,
//! and settles each close exactly once with its commission and ledger entries.

pub mod application;
pub mod auth;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod persistence;
pub mod rate_limit;
pub mod task_runner;
pub mod telemetry;
