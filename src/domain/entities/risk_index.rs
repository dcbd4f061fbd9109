//! Market sentiment index and the trade directions it permits

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::entities::position::PositionSide;
use crate::domain::errors::ValidationError;

/// Readings strictly below this only permit LONG entries
pub const LONG_ONLY_BELOW: f64 = 30.0;
/// Readings strictly above this only permit SHORT entries
pub const SHORT_ONLY_ABOVE: f64 = 80.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PermittedDirections {
    LongOnly,
    Both,
    ShortOnly,
}

impl PermittedDirections {
    /// Maps an index reading onto exactly one permitted set
    pub fn for_value(value: f64) -> Self {
        if value < LONG_ONLY_BELOW {
            PermittedDirections::LongOnly
        } else if value > SHORT_ONLY_ABOVE {
            PermittedDirections::ShortOnly
        } else {
            PermittedDirections::Both
        }
    }

    pub fn allows(&self, side: PositionSide) -> bool {
        match self {
            PermittedDirections::Both => true,
            PermittedDirections::LongOnly => side == PositionSide::Long,
            PermittedDirections::ShortOnly => side == PositionSide::Short,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PermittedDirections::LongOnly => "LONG_ONLY",
            PermittedDirections::Both => "BOTH",
            PermittedDirections::ShortOnly => "SHORT_ONLY",
        }
    }
}

impl std::fmt::Display for PermittedDirections {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A sentiment reading in [0, 100]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskIndex {
    value: f64,
    classification: String,
    timestamp: DateTime<Utc>,
}

impl RiskIndex {
    pub fn new(
        value: f64,
        classification: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Result<Self, ValidationError> {
        if !value.is_finite() {
            return Err(ValidationError::MustBeFinite);
        }
        if !(0.0..=100.0).contains(&value) {
            return Err(ValidationError::InvalidIndex(format!(
                "{} is outside [0, 100]",
                value
            )));
        }
        Ok(Self {
            value,
            classification: classification.into(),
            timestamp,
        })
    }

    /// The named default used when the source is stale or failing
    pub fn fallback(value: f64, now: DateTime<Utc>) -> Self {
        let value = if value.is_finite() {
            value.clamp(0.0, 100.0)
        } else {
            50.0
        };
        Self {
            value,
            classification: "Fallback".to_string(),
            timestamp: now,
        }
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn classification(&self) -> &str {
        &self.classification
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn permitted_directions(&self) -> PermittedDirections {
        PermittedDirections::for_value(self.value)
    }
}
