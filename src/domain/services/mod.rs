pub mod cooldown;
pub mod exit_rules;
pub mod opening_orchestrator;
pub mod position_lease;
pub mod position_monitor;
pub mod position_sizer;
pub mod price_cache;
pub mod risk_gate;
pub mod settlement;
pub mod snapshot;
pub mod trading_control;
