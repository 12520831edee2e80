// Order book core - maker liquidity, taker fills, reservation lifecycle
pub mod address;
pub mod engine;
pub mod memo;

pub use engine::{OrderBook, OrderBookConfig};
