pub mod binance;
pub mod cache;
pub mod connection;
pub mod fetcher;
pub mod orchestrator;
pub mod pipeline;
pub mod synchronizer;
pub mod types;
