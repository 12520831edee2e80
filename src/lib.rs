pub mod bootstrap;
pub mod config;
pub mod error;
pub mod gateway;
pub mod ledger;
pub mod orderbook;
pub mod settlement;
