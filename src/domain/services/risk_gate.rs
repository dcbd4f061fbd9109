//! Sentiment gate restricting which directions may be opened

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::domain::entities::risk_index::{
    PermittedDirections, RiskIndex, LONG_ONLY_BELOW, SHORT_ONLY_ABOVE,
};
use crate::domain::entities::signal::Signal;
use crate::domain::errors::EngineError;
use crate::domain::repositories::sentiment_source::SentimentSource;
use crate::domain::services::snapshot::SnapshotCell;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GateDecision {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl GateDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    fn reject(reason: String) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
        }
    }
}

/// Index the gate is currently deciding with
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EffectiveIndex {
    pub index: RiskIndex,
    /// True when the fallback value stands in for a stale or missing reading
    pub degraded: bool,
}

#[derive(Debug, Clone)]
struct CachedIndex {
    index: RiskIndex,
    fetched_at: DateTime<Utc>,
}

pub struct RiskGate {
    source: Arc<dyn SentimentSource>,
    cache: SnapshotCell<Option<CachedIndex>>,
    staleness: ChronoDuration,
    fallback_value: f64,
    fetch_timeout: Duration,
}

impl RiskGate {
    pub fn new(
        source: Arc<dyn SentimentSource>,
        staleness: ChronoDuration,
        fallback_value: f64,
        fetch_timeout: Duration,
    ) -> Self {
        Self {
            source,
            cache: SnapshotCell::new(None),
            staleness,
            fallback_value,
            fetch_timeout,
        }
    }

    pub fn permitted_directions(value: f64) -> PermittedDirections {
        PermittedDirections::for_value(value)
    }

    /// Pure decision for one signal against one index reading
    pub fn validate(signal: &Signal, index: &RiskIndex) -> GateDecision {
        if !signal.is_directional() {
            return GateDecision::allow();
        }

        let permitted = index.permitted_directions();
        if permitted.allows(signal.direction) {
            return GateDecision::allow();
        }

        let threshold = match permitted {
            PermittedDirections::LongOnly => format!("below {}", LONG_ONLY_BELOW),
            PermittedDirections::ShortOnly => format!("above {}", SHORT_ONLY_ABOVE),
            PermittedDirections::Both => String::new(),
        };
        GateDecision::reject(format!(
            "Risk index {:.1} ({}) is {} ({}): {} entries on {} are blocked",
            index.value(),
            index.classification(),
            threshold,
            permitted,
            signal.direction,
            signal.symbol
        ))
    }

    /// Last good reading if fresh, otherwise the configured fallback
    pub fn effective_index(&self, now: DateTime<Utc>) -> EffectiveIndex {
        let cached = self.cache.load();
        match cached.as_ref() {
            Some(c) if now.signed_duration_since(c.fetched_at) <= self.staleness => EffectiveIndex {
                index: c.index.clone(),
                degraded: false,
            },
            Some(c) => {
                let error = EngineError::IndexUnavailable {
                    reason: format!("last reading fetched at {} is stale", c.fetched_at),
                };
                warn!("{}; using fallback {}", error, self.fallback_value);
                self.fallback(now)
            }
            None => {
                let error = EngineError::IndexUnavailable {
                    reason: "no reading fetched yet".to_string(),
                };
                warn!("{}; using fallback {}", error, self.fallback_value);
                self.fallback(now)
            }
        }
    }

    fn fallback(&self, now: DateTime<Utc>) -> EffectiveIndex {
        EffectiveIndex {
            index: RiskIndex::fallback(self.fallback_value, now),
            degraded: true,
        }
    }

    /// Validate against the effective index at `now`
    pub fn check(&self, signal: &Signal, now: DateTime<Utc>) -> GateDecision {
        let effective = self.effective_index(now);
        Self::validate(signal, &effective.index)
    }

    /// Fetch a new reading. Failure keeps the previous snapshot.
    pub async fn refresh(&self, now: DateTime<Utc>) -> Result<RiskIndex, EngineError> {
        let fetched = tokio::time::timeout(self.fetch_timeout, self.source.fetch_index()).await;
        match fetched {
            Ok(Ok(index)) => {
                info!(
                    "Risk index refreshed: {:.1} ({}) -> {}",
                    index.value(),
                    index.classification(),
                    index.permitted_directions()
                );
                self.cache.store(Some(CachedIndex {
                    index: index.clone(),
                    fetched_at: now,
                }));
                Ok(index)
            }
            Ok(Err(e)) => {
                let error = EngineError::IndexUnavailable {
                    reason: e.to_string(),
                };
                warn!("Risk index refresh failed: {}", error);
                Err(error)
            }
            Err(_) => {
                let error = EngineError::IndexUnavailable {
                    reason: format!("timed out after {}ms", self.fetch_timeout.as_millis()),
                };
                warn!("Risk index refresh failed: {}", error);
                Err(error)
            }
        }
    }
}
