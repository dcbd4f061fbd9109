use serde::{Deserialize, Serialize};

use crate::domain::entities::position::PositionSide;
use crate::domain::value_objects::{price::Price, quantity::Quantity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// Side that opens a position in `side`
    pub fn opening(side: PositionSide) -> Self {
        match side {
            PositionSide::Long => OrderSide::Buy,
            PositionSide::Short => OrderSide::Sell,
        }
    }

    /// Side that flattens a position in `side`
    pub fn closing(side: PositionSide) -> Self {
        match side {
            PositionSide::Long => OrderSide::Sell,
            PositionSide::Short => OrderSide::Buy,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

/// Market order handed to an `ExchangeClient`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    /// Idempotency key; `{position_id}-{credential_id}-open|close`
    pub client_order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: Quantity,
    pub reference_price: Price,
    pub leverage: f64,
    pub reduce_only: bool,
}

impl Order {
    pub fn market_open(
        position_id: &str,
        credential_id: &str,
        symbol: &str,
        side: PositionSide,
        quantity: Quantity,
        reference_price: Price,
        leverage: f64,
    ) -> Self {
        Order {
            client_order_id: format!("{}-{}-open", position_id, credential_id),
            symbol: symbol.to_string(),
            side: OrderSide::opening(side),
            quantity,
            reference_price,
            leverage,
            reduce_only: false,
        }
    }

    pub fn market_close(
        position_id: &str,
        credential_id: &str,
        symbol: &str,
        side: PositionSide,
        quantity: Quantity,
        reference_price: Price,
        leverage: f64,
    ) -> Self {
        Order {
            client_order_id: format!("{}-{}-close", position_id, credential_id),
            symbol: symbol.to_string(),
            side: OrderSide::closing(side),
            quantity,
            reference_price,
            leverage,
            reduce_only: true,
        }
    }

    pub fn notional(&self) -> f64 {
        self.quantity.value() * self.reference_price.value()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_and_close_sides_are_opposite() {
        let qty = Quantity::new(0.5).unwrap();
        let price = Price::new(2000.0).unwrap();

        let open = Order::market_open("pos_1", "cred", "ETHUSDT", PositionSide::Short, qty, price, 2.0);
        assert_eq!(open.side, OrderSide::Sell);
        assert!(!open.reduce_only);
        assert_eq!(open.client_order_id, "pos_1-cred-open");

        let close = Order::market_close("pos_1", "cred", "ETHUSDT", PositionSide::Short, qty, price, 2.0);
        assert_eq!(close.side, OrderSide::Buy);
        assert!(close.reduce_only);
        assert_eq!(close.client_order_id, "pos_1-cred-close");
    }

    #[test]
    fn test_order_notional() {
        let order = Order::market_open(
            "pos_1",
            "cred",
            "BTCUSDT",
            PositionSide::Long,
            Quantity::new(0.1).unwrap(),
            Price::new(50000.0).unwrap(),
            1.0,
        );
        assert!((order.notional() - 5000.0).abs() < 1e-9);
    }
}
