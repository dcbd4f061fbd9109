pub mod pnl;
pub mod position_sizing;
pub mod price;
pub mod quantity;
