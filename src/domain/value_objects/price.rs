use serde::{Deserialize, Serialize};

use crate::domain::errors::ValidationError;

/// A strictly positive, finite market price
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct Price(f64);

impl Price {
    pub fn new(value: f64) -> Result<Self, ValidationError> {
        if !value.is_finite() {
            return Err(ValidationError::MustBeFinite);
        }
        if value <= 0.0 {
            return Err(ValidationError::InvalidPrice(format!(
                "{} must be greater than zero",
                value
            )));
        }
        Ok(Price(value))
    }

    pub fn value(&self) -> f64 {
        self.0
    }

    /// Price moved by a signed fraction, e.g. `-0.02` for two percent lower
    pub fn offset_by(&self, fraction: f64) -> Result<Price, ValidationError> {
        if !fraction.is_finite() {
            return Err(ValidationError::MustBeFinite);
        }
        Price::new(self.0 * (1.0 + fraction))
    }
}

impl std::fmt::Display for Price {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
