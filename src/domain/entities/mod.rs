pub mod position;
pub mod trade;

pub use position::{Fill, Position, PositionKey};
pub use trade::{Side, Trade, TradeStatus};
