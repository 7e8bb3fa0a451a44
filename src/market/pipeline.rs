use crate::error::AppError;
use crate::market::connection::{
    ConnectionSettings, StreamConnectionManager, StreamConnector, StreamEvent, StreamEventKind,
};
use crate::market::fetcher::{BulkFetcher, CachePolicy, FetchSettings, MarketDataSource, ResponseCache};
use crate::market::synchronizer::{ApplyOutcome, CandleSynchronizer, LiveUpdate, LoadOutcome};
use crate::market::types::{
    Bar, ConnectionState, Quote, SubscriptionId, SubscriptionKey, SyncConfig,
};
use crate::state::{SharedView, SyncView, TaskHandle};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

const COMMAND_CHANNEL_CAPACITY: usize = 32;

pub type SeriesListener = Box<dyn Fn(&[Bar]) + Send + Sync>;
pub type StateListener = Box<dyn Fn(ConnectionState) + Send + Sync>;
pub type ErrorListener = Box<dyn Fn(Option<&str>) + Send + Sync>;

/// Registered consumer callbacks. Invoked from the pipeline task; a callback
/// must not register further callbacks.
#[derive(Default)]
pub struct Listeners {
    series: RwLock<Vec<SeriesListener>>,
    connection_state: RwLock<Vec<StateListener>>,
    transient_error: RwLock<Vec<ErrorListener>>,
}

impl Listeners {
    pub fn add_series(&self, listener: SeriesListener) {
        self.series.write().push(listener);
    }

    pub fn add_connection_state(&self, listener: StateListener) {
        self.connection_state.write().push(listener);
    }

    pub fn add_transient_error(&self, listener: ErrorListener) {
        self.transient_error.write().push(listener);
    }

    fn notify_series(&self, series: &[Bar]) {
        for listener in self.series.read().iter() {
            listener(series);
        }
    }

    fn notify_connection_state(&self, state: ConnectionState) {
        for listener in self.connection_state.read().iter() {
            listener(state);
        }
    }

    fn notify_transient_error(&self, message: Option<&str>) {
        for listener in self.transient_error.read().iter() {
            listener(message);
        }
    }
}

pub enum PipelineCommand {
    Select {
        key: SubscriptionKey,
        reply: oneshot::Sender<SubscriptionId>,
    },
    Refresh {
        reply: oneshot::Sender<SubscriptionId>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

enum FetchEvent {
    HistoryLoaded {
        subscription: SubscriptionId,
        result: Result<Vec<Bar>, AppError>,
    },
    QuoteLoaded {
        subscription: SubscriptionId,
        quote: Quote,
    },
}

pub struct PipelineHandle {
    pub commands: mpsc::Sender<PipelineCommand>,
    pub task: TaskHandle,
}

pub struct PipelineDeps {
    pub source: Arc<dyn MarketDataSource>,
    pub connector: Arc<dyn StreamConnector>,
    pub cache: Arc<ResponseCache>,
}

/// Spawns the pipeline task and activates the configured subscription.
/// Must be called from within a Tokio runtime.
pub fn spawn_pipeline(
    config: &SyncConfig,
    deps: PipelineDeps,
    view: SharedView,
    listeners: Arc<Listeners>,
) -> PipelineHandle {
    let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
    let (stream_tx, stream_rx) = mpsc::unbounded_channel();
    let (fetch_tx, fetch_rx) = mpsc::unbounded_channel();
    let cancellation_token = CancellationToken::new();

    let initial_key = config.subscription_key();
    let connection = StreamConnectionManager::new(
        deps.connector,
        ConnectionSettings::from_config(config),
        stream_tx,
        initial_key.clone(),
        SubscriptionId(0),
    );
    let fetcher = BulkFetcher::new(deps.source, deps.cache, FetchSettings::from_config(config));

    let pipeline = SyncPipeline {
        synchronizer: CandleSynchronizer::new(config.max_bars),
        connection,
        fetcher: Arc::new(fetcher),
        view,
        listeners,
        fetch_tx,
        fetch_cancel: cancellation_token.child_token(),
        history_limit: u16::try_from(config.max_bars).unwrap_or(u16::MAX),
        transient_error_ttl: config.transient_error_ttl(),
        transient_expiry: None,
    };

    let join_handle = tokio::spawn(run_pipeline(
        pipeline,
        initial_key,
        commands_rx,
        stream_rx,
        fetch_rx,
        cancellation_token.clone(),
    ));

    PipelineHandle {
        commands: commands_tx,
        task: TaskHandle {
            cancellation_token,
            join_handle,
        },
    }
}

struct SyncPipeline {
    synchronizer: CandleSynchronizer,
    connection: StreamConnectionManager,
    fetcher: Arc<BulkFetcher>,
    view: SharedView,
    listeners: Arc<Listeners>,
    fetch_tx: mpsc::UnboundedSender<FetchEvent>,
    fetch_cancel: CancellationToken,
    history_limit: u16,
    transient_error_ttl: Duration,
    transient_expiry: Option<Instant>,
}

async fn run_pipeline(
    mut pipeline: SyncPipeline,
    initial_key: SubscriptionKey,
    mut commands: mpsc::Receiver<PipelineCommand>,
    mut stream_events: mpsc::UnboundedReceiver<StreamEvent>,
    mut fetch_events: mpsc::UnboundedReceiver<FetchEvent>,
    cancel_token: CancellationToken,
) {
    pipeline.activate(initial_key, CachePolicy::PreferCache);

    loop {
        let transient_expiry = pipeline.transient_expiry;
        tokio::select! {
            biased;
            _ = cancel_token.cancelled() => break,
            command = commands.recv() => match command {
                Some(PipelineCommand::Select { key, reply }) => {
                    let subscription = pipeline.activate(key, CachePolicy::PreferCache);
                    let _ = reply.send(subscription);
                }
                Some(PipelineCommand::Refresh { reply }) => {
                    let subscription = pipeline.refresh();
                    let _ = reply.send(subscription);
                }
                Some(PipelineCommand::Shutdown { reply }) => {
                    pipeline.teardown().await;
                    let _ = reply.send(());
                    return;
                }
                None => break,
            },
            Some(event) = stream_events.recv() => pipeline.handle_stream_event(event),
            Some(event) = fetch_events.recv() => pipeline.handle_fetch_event(event),
            _ = sleep_until(transient_expiry.unwrap_or_else(Instant::now)), if transient_expiry.is_some() => {
                pipeline.clear_transient_error();
            }
        }
    }

    pipeline.teardown().await;
}

impl SyncPipeline {
    fn activate(&mut self, key: SubscriptionKey, policy: CachePolicy) -> SubscriptionId {
        let subscription = self.synchronizer.change_subscription(key.clone());
        self.connection.change_subscription(key.clone(), subscription);
        info!(%key, %subscription, "subscription activated");

        {
            let mut view = self.view.write();
            view.key = key.clone();
            view.subscription = subscription;
            view.series = Arc::new(Vec::new());
            view.quote = None;
            view.stats = self.synchronizer.stats();
        }

        self.spawn_history_fetch(subscription, key.clone(), policy);
        self.spawn_quote_fetch(subscription, key, policy);
        subscription
    }

    fn refresh(&mut self) -> SubscriptionId {
        let subscription = self.synchronizer.subscription();
        let key = self.view.read().key.clone();
        info!(%key, %subscription, "refresh requested");

        self.spawn_history_fetch(subscription, key.clone(), CachePolicy::Bypass);
        self.spawn_quote_fetch(subscription, key, CachePolicy::Bypass);
        if matches!(
            self.connection.state(),
            ConnectionState::Closed | ConnectionState::Idle
        ) {
            self.connection.connect();
        }
        subscription
    }

    async fn teardown(&mut self) {
        self.fetch_cancel.cancel();
        self.connection.close().await;
        self.view.write().connection_state = ConnectionState::Closed;
        self.listeners
            .notify_connection_state(ConnectionState::Closed);
        info!("market sync pipeline stopped");
    }

    fn spawn_history_fetch(&self, subscription: SubscriptionId, key: SubscriptionKey, policy: CachePolicy) {
        let fetcher = Arc::clone(&self.fetcher);
        let fetch_tx = self.fetch_tx.clone();
        let cancel_token = self.fetch_cancel.clone();
        let limit = self.history_limit;

        tokio::spawn(async move {
            let result = tokio::select! {
                biased;
                _ = cancel_token.cancelled() => return,
                result = fetcher.fetch_historical_bars(&key.symbol, key.timeframe, limit, policy) => result,
            };
            let _ = fetch_tx.send(FetchEvent::HistoryLoaded {
                subscription,
                result,
            });
        });
    }

    fn spawn_quote_fetch(&self, subscription: SubscriptionId, key: SubscriptionKey, policy: CachePolicy) {
        let fetcher = Arc::clone(&self.fetcher);
        let fetch_tx = self.fetch_tx.clone();
        let cancel_token = self.fetch_cancel.clone();

        tokio::spawn(async move {
            let quote = tokio::select! {
                biased;
                _ = cancel_token.cancelled() => return,
                quote = fetcher.fetch_snapshot_quote(&key.symbol, policy) => quote,
            };
            let _ = fetch_tx.send(FetchEvent::QuoteLoaded {
                subscription,
                quote,
            });
        });
    }

    fn handle_fetch_event(&mut self, event: FetchEvent) {
        match event {
            FetchEvent::HistoryLoaded {
                subscription,
                result: Ok(bars),
            } => match self.synchronizer.load_initial(subscription, bars) {
                LoadOutcome::Loaded {
                    len,
                    dropped_duplicates,
                    ..
                } => {
                    debug!(%subscription, len, dropped_duplicates, "series primed");
                    self.publish_series();
                }
                LoadOutcome::Superseded => {
                    debug!(%subscription, "discarding history for superseded subscription");
                }
            },
            FetchEvent::HistoryLoaded {
                subscription,
                result: Err(error),
            } => {
                if subscription != self.synchronizer.subscription() {
                    return;
                }
                warn!(%subscription, %error, "historical bars unavailable");
                self.set_transient_error(format!("historical bars unavailable: {error}"));
            }
            FetchEvent::QuoteLoaded {
                subscription,
                quote,
            } => {
                if subscription != self.synchronizer.subscription() {
                    return;
                }
                if quote.is_fallback() && self.synchronizer.quote().is_some() {
                    return;
                }
                self.synchronizer.set_quote(quote);
                self.view.write().quote = Some(quote);
            }
        }
    }

    fn handle_stream_event(&mut self, event: StreamEvent) {
        let StreamEvent { subscription, kind } = event;
        if let StreamEventKind::BarUpdate { bar, quote } = kind {
            let outcome = self.synchronizer.apply_live_update(LiveUpdate {
                subscription,
                bar,
                quote,
            });
            if outcome.changed_series() {
                self.publish_series();
            } else {
                if let ApplyOutcome::Superseded { update, active } = outcome {
                    trace!(%update, %active, "discarding bar from superseded subscription");
                }
                self.view.write().stats = self.synchronizer.stats();
            }
            return;
        }

        if subscription != self.synchronizer.subscription() {
            trace!(%subscription, "discarding event from superseded subscription");
            return;
        }

        match kind {
            StreamEventKind::StateChanged(state) => {
                self.view.write().connection_state = state;
                self.listeners.notify_connection_state(state);
            }
            StreamEventKind::QuoteUpdate(quote) => {
                self.synchronizer.set_quote(quote);
                self.view.write().quote = Some(quote);
            }
            StreamEventKind::ConnectivityLost(reason) => {
                info!(%subscription, %reason, "stream connectivity lost");
            }
            StreamEventKind::TransientError(message) => self.set_transient_error(message),
            StreamEventKind::Terminal(message) => {
                warn!(%subscription, %message, "stream offline until refresh or reselect");
                self.set_transient_error(message);
            }
            StreamEventKind::BarUpdate { .. } => {}
        }
    }

    fn publish_series(&self) {
        let series = Arc::new(self.synchronizer.snapshot());
        {
            let mut view = self.view.write();
            view.series = Arc::clone(&series);
            view.quote = self.synchronizer.quote();
            view.stats = self.synchronizer.stats();
        }
        self.listeners.notify_series(&series);
    }

    fn set_transient_error(&mut self, message: String) {
        self.transient_expiry = Some(Instant::now() + self.transient_error_ttl);
        self.view.write().transient_error = Some(message.clone());
        self.listeners.notify_transient_error(Some(&message));
    }

    fn clear_transient_error(&mut self) {
        self.transient_expiry = None;
        self.view.write().transient_error = None;
        self.listeners.notify_transient_error(None);
    }
}

pub fn new_shared_view(key: SubscriptionKey) -> SharedView {
    Arc::new(RwLock::new(SyncView::new(key)))
}
