pub mod error;
pub mod market;
pub mod state;
pub mod telemetry;

pub use error::{AppError, AppResult};
pub use market::orchestrator::MarketSync;
pub use market::synchronizer::SyncStats;
pub use market::types::{
    Bar, ConnectionState, MarketTimeframe, Quote, QuoteSource, SubscriptionId, SubscriptionKey,
    SyncArgs, SyncConfig,
};
