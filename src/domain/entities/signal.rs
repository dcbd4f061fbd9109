//! Signal entity - an immutable trade suggestion from the ingestion layer

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::entities::position::PositionSide;

/// What the signal asks the engine to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    /// Open a new directional position
    Entry,
    /// Close positions on the symbol
    Close,
    /// Confirms an earlier signal, opens nothing
    Confirmation,
}

impl SignalKind {
    pub fn is_directional(&self) -> bool {
        matches!(self, SignalKind::Entry)
    }
}

/// Trade suggestion with direction and reference price
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub symbol: String,
    pub direction: PositionSide,
    pub kind: SignalKind,
    pub price: f64,
    pub confidence: Option<f64>,
    pub source: String,
    pub received_at: DateTime<Utc>,
}

impl Signal {
    /// Directional entry signal received now
    pub fn entry(symbol: impl Into<String>, direction: PositionSide, price: f64) -> Self {
        Self {
            symbol: symbol.into(),
            direction,
            kind: SignalKind::Entry,
            price,
            confidence: None,
            source: "webhook".to_string(),
            received_at: Utc::now(),
        }
    }

    pub fn close(symbol: impl Into<String>, direction: PositionSide, price: f64) -> Self {
        Self {
            kind: SignalKind::Close,
            ..Self::entry(symbol, direction, price)
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_kind(mut self, kind: SignalKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn received_at(mut self, at: DateTime<Utc>) -> Self {
        self.received_at = at;
        self
    }

    pub fn is_directional(&self) -> bool {
        self.kind.is_directional()
    }
}
