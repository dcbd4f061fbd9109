pub mod credential;
pub mod events;
pub mod exchange;
pub mod ledger;
pub mod order;
pub mod position;
pub mod risk_index;
pub mod risk_policy;
pub mod signal;
