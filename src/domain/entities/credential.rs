use serde::{Deserialize, Serialize};

use crate::domain::entities::exchange::Exchange;

/// A user's API credential set for one exchange. Secrets stay with the account layer;
/// the engine only sees the handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeCredential {
    pub id: String,
    pub user_id: String,
    pub exchange: Exchange,
    pub active: bool,
    pub validated: bool,
}

impl ExchangeCredential {
    pub fn new(id: impl Into<String>, user_id: impl Into<String>, exchange: Exchange) -> Self {
        Self {
            id: id.into(),
            user_id: user_id.into(),
            exchange,
            active: true,
            validated: true,
        }
    }

    pub fn is_usable(&self) -> bool {
        self.active && self.validated
    }
}
