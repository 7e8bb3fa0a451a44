use crate::market::synchronizer::SyncStats;
use crate::market::types::{Bar, ConnectionState, Quote, SubscriptionId, SubscriptionKey};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct TaskHandle {
    pub cancellation_token: CancellationToken,
    pub join_handle: JoinHandle<()>,
}

/// Last published state of the pipeline. Written only by the pipeline task,
/// read by any number of consumers.
#[derive(Debug, Clone)]
pub struct SyncView {
    pub key: SubscriptionKey,
    pub subscription: SubscriptionId,
    pub series: Arc<Vec<Bar>>,
    pub connection_state: ConnectionState,
    pub quote: Option<Quote>,
    pub transient_error: Option<String>,
    pub stats: SyncStats,
}

impl SyncView {
    pub fn new(key: SubscriptionKey) -> Self {
        Self {
            key,
            subscription: SubscriptionId(0),
            series: Arc::new(Vec::new()),
            connection_state: ConnectionState::Idle,
            quote: None,
            transient_error: None,
            stats: SyncStats::default(),
        }
    }
}

pub type SharedView = Arc<RwLock<SyncView>>;
