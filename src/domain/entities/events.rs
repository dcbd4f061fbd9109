//! Domain events published to downstream consumers (notifications, dashboards)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::entities::exchange::Exchange;
use crate::domain::entities::position::{CloseReason, PositionSide};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DomainEvent {
    #[serde(rename = "position.opened")]
    PositionOpened {
        position_id: String,
        user_id: String,
        symbol: String,
        side: PositionSide,
        entry_price: f64,
        quantity: f64,
        exchanges: Vec<Exchange>,
        at: DateTime<Utc>,
    },

    #[serde(rename = "position.closed")]
    PositionClosed {
        position_id: String,
        user_id: String,
        symbol: String,
        reason: CloseReason,
        exit_price: f64,
        pnl: f64,
        commission: f64,
        at: DateTime<Utc>,
    },

    #[serde(rename = "signal.rejected")]
    SignalRejected {
        user_id: String,
        symbol: String,
        side: PositionSide,
        reason: String,
        at: DateTime<Utc>,
    },

    /// Partial placement or other execution problem an operator should see
    #[serde(rename = "execution.alert")]
    ExecutionAlert {
        user_id: String,
        position_id: Option<String>,
        code: String,
        message: String,
        at: DateTime<Utc>,
    },

    #[serde(rename = "reconciliation.required")]
    ReconciliationRequired {
        position_id: String,
        exchange: Exchange,
        credential_id: String,
        reason: String,
        at: DateTime<Utc>,
    },
}

impl DomainEvent {
    pub fn name(&self) -> &'static str {
        match self {
            DomainEvent::PositionOpened { .. } => "position.opened",
            DomainEvent::PositionClosed { .. } => "position.closed",
            DomainEvent::SignalRejected { .. } => "signal.rejected",
            DomainEvent::ExecutionAlert { .. } => "execution.alert",
            DomainEvent::ReconciliationRequired { .. } => "reconciliation.required",
        }
    }
}
