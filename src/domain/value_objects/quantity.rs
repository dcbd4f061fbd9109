use serde::{Deserialize, Serialize};

use crate::domain::errors::ValidationError;

#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct Quantity(f64);

impl Quantity {
    pub fn new(value: f64) -> Result<Self, ValidationError> {
        if !value.is_finite() {
            return Err(ValidationError::MustBeFinite);
        }
        if value < 0.0 {
            return Err(ValidationError::InvalidQuantity(
                "Quantity must be non-negative".to_string(),
            ));
        }
        Ok(Quantity(value))
    }

    /// Quantity bought by spending `notional` at `price`
    pub fn from_notional(notional: f64, price: f64) -> Result<Self, ValidationError> {
        if price <= 0.0 || !price.is_finite() {
            return Err(ValidationError::InvalidPrice(format!(
                "{} must be greater than zero",
                price
            )));
        }
        Quantity::new(notional / price)
    }

    pub fn value(&self) -> f64 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quantity_new_valid() {
        let qty = Quantity::new(100.0);
        assert!(qty.is_ok());
        assert_eq!(qty.unwrap().value(), 100.0);
    }

    #[test]
    fn test_quantity_new_negative() {
        let qty = Quantity::new(-5.0);
        assert_eq!(
            qty.unwrap_err(),
            ValidationError::InvalidQuantity("Quantity must be non-negative".to_string())
        );
    }

    #[test]
    fn test_quantity_from_notional() {
        let qty = Quantity::from_notional(1000.0, 50000.0).unwrap();
        assert!((qty.value() - 0.02).abs() < 1e-12);
        assert!(Quantity::from_notional(1000.0, 0.0).is_err());
    }

    #[test]
    fn test_quantity_zero() {
        assert!(Quantity::new(0.0).unwrap().is_zero());
    }
}
