use crate::error::{AppError, AppResult};
use crate::market::binance::{BinanceRestSource, TungsteniteConnector};
use crate::market::cache::FreshnessCache;
use crate::market::connection::StreamConnector;
use crate::market::fetcher::{MarketDataSource, ResponseCache};
use crate::market::pipeline::{
    new_shared_view, spawn_pipeline, Listeners, PipelineCommand, PipelineDeps,
};
use crate::market::synchronizer::SyncStats;
use crate::market::types::{
    Bar, ConnectionState, MarketTimeframe, Quote, SubscriptionId, SubscriptionKey, SyncConfig,
};
use crate::state::{SharedView, TaskHandle};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

/// Consumer-facing handle over one running sync pipeline.
///
/// Readers never block on the network: every accessor returns the last state
/// the pipeline published.
pub struct MarketSync {
    commands: mpsc::Sender<PipelineCommand>,
    view: SharedView,
    listeners: Arc<Listeners>,
    task: Option<TaskHandle>,
}

impl MarketSync {
    /// Starts against the venue configured in `config`. Requires a Tokio
    /// runtime.
    pub fn start(config: SyncConfig) -> AppResult<Self> {
        let source = BinanceRestSource::new(&config.rest_base_url, config.fetch_timeout())?;
        Ok(Self::start_with(
            &config,
            Arc::new(source),
            Arc::new(TungsteniteConnector),
            Arc::new(FreshnessCache::new()),
        ))
    }

    pub fn start_with(
        config: &SyncConfig,
        source: Arc<dyn MarketDataSource>,
        connector: Arc<dyn StreamConnector>,
        cache: Arc<ResponseCache>,
    ) -> Self {
        let view = new_shared_view(config.subscription_key());
        let listeners = Arc::new(Listeners::default());
        let handle = spawn_pipeline(
            config,
            PipelineDeps {
                source,
                connector,
                cache,
            },
            Arc::clone(&view),
            Arc::clone(&listeners),
        );

        Self {
            commands: handle.commands,
            view,
            listeners,
            task: Some(handle.task),
        }
    }

    pub fn series(&self) -> Arc<Vec<Bar>> {
        Arc::clone(&self.view.read().series)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.view.read().connection_state
    }

    pub fn quote(&self) -> Option<Quote> {
        self.view.read().quote
    }

    pub fn transient_error(&self) -> Option<String> {
        self.view.read().transient_error.clone()
    }

    pub fn stats(&self) -> SyncStats {
        self.view.read().stats
    }

    pub fn subscription(&self) -> (SubscriptionKey, SubscriptionId) {
        let view = self.view.read();
        (view.key.clone(), view.subscription)
    }

    pub fn on_series_changed(&self, listener: impl Fn(&[Bar]) + Send + Sync + 'static) {
        self.listeners.add_series(Box::new(listener));
    }

    pub fn on_connection_state_changed(
        &self,
        listener: impl Fn(ConnectionState) + Send + Sync + 'static,
    ) {
        self.listeners.add_connection_state(Box::new(listener));
    }

    /// `None` is delivered when the current error expires.
    pub fn on_transient_error(&self, listener: impl Fn(Option<&str>) + Send + Sync + 'static) {
        self.listeners.add_transient_error(Box::new(listener));
    }

    pub async fn select_subscription(
        &self,
        symbol: &str,
        timeframe: MarketTimeframe,
    ) -> AppResult<SubscriptionId> {
        let key = SubscriptionKey::new(symbol, timeframe)?;
        let (reply, response) = oneshot::channel();
        self.send(PipelineCommand::Select { key, reply }).await?;
        response
            .await
            .map_err(|_| AppError::ChannelClosed("pipeline reply"))
    }

    /// Reloads history and quote bypassing cache freshness, and reconnects
    /// the stream if it went offline.
    pub async fn refresh(&self) -> AppResult<SubscriptionId> {
        let (reply, response) = oneshot::channel();
        self.send(PipelineCommand::Refresh { reply }).await?;
        response
            .await
            .map_err(|_| AppError::ChannelClosed("pipeline reply"))
    }

    pub async fn shutdown(mut self) -> AppResult<()> {
        let (reply, response) = oneshot::channel();
        self.send(PipelineCommand::Shutdown { reply }).await?;
        response
            .await
            .map_err(|_| AppError::ChannelClosed("pipeline reply"))?;

        if let Some(task) = self.task.take() {
            if let Err(error) = task.join_handle.await {
                warn!(%error, "pipeline task ended abnormally");
            }
        }
        Ok(())
    }

    async fn send(&self, command: PipelineCommand) -> AppResult<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| AppError::ChannelClosed("pipeline command"))
    }
}

impl Drop for MarketSync {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.cancellation_token.cancel();
        }
    }
}
