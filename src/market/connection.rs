use crate::error::AppError;
use crate::market::binance::{heartbeat_frame, stream_endpoint};
use crate::market::types::{
    parse_stream_payload, Bar, ConnectionState, Quote, SubscriptionId, SubscriptionKey,
    SyncConfig,
};
use crate::state::TaskHandle;
use async_trait::async_trait;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use rand::Rng;
use std::borrow::Cow;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const CLOSE_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(1);

pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Message, AppError>> + Send>>;
pub type FrameSink = Pin<Box<dyn Sink<Message, Error = AppError> + Send>>;

/// An opened duplex link to one stream endpoint.
pub struct StreamLink {
    pub frames: FrameStream,
    pub sink: FrameSink,
}

#[async_trait]
pub trait StreamConnector: Send + Sync {
    async fn open(&self, url: &str) -> Result<StreamLink, AppError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamEvent {
    pub subscription: SubscriptionId,
    pub kind: StreamEventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEventKind {
    StateChanged(ConnectionState),
    BarUpdate { bar: Bar, quote: Option<Quote> },
    QuoteUpdate(Quote),
    ConnectivityLost(String),
    TransientError(String),
    /// Retry budget exhausted; no further automatic attempts.
    Terminal(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ms: u64,
    pub max_attempts: u32,
    pub failures_before_rotation: u32,
}

impl ReconnectPolicy {
    /// `min(base * 2^(attempt-1), max)` for a 1-indexed attempt.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay_ms = self
            .base_delay_ms
            .saturating_mul(1_u64 << exponent)
            .min(self.max_delay_ms);
        Duration::from_millis(delay_ms)
    }

    pub fn delay_with_jitter(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter_ms == 0 {
            return base;
        }
        let jitter_ms = rand::thread_rng().gen_range(0..=self.jitter_ms);
        base + Duration::from_millis(jitter_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDecision {
    Retry { attempt: u32, endpoint_index: usize },
    Exhausted { attempts: u32 },
}

/// Counts consecutive failures and decides when to rotate endpoints. Rotation
/// happens only after `failures_before_rotation` failures on the same endpoint.
#[derive(Debug, Clone)]
pub struct FailureTracker {
    endpoint_count: usize,
    max_attempts: u32,
    failures_before_rotation: u32,
    consecutive: u32,
    on_endpoint: u32,
    endpoint_index: usize,
}

impl FailureTracker {
    pub fn new(endpoint_count: usize, policy: &ReconnectPolicy) -> Self {
        Self {
            endpoint_count: endpoint_count.max(1),
            max_attempts: policy.max_attempts.max(1),
            failures_before_rotation: policy.failures_before_rotation.max(1),
            consecutive: 0,
            on_endpoint: 0,
            endpoint_index: 0,
        }
    }

    pub fn endpoint_index(&self) -> usize {
        self.endpoint_index
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive
    }

    /// Continues from a previously selected endpoint instead of the primary.
    pub fn resume_at(&mut self, endpoint_index: usize) {
        self.endpoint_index = endpoint_index % self.endpoint_count;
    }

    pub fn reset(&mut self) {
        self.consecutive = 0;
        self.on_endpoint = 0;
        self.endpoint_index = 0;
    }

    pub fn record_failure(&mut self) -> FailureDecision {
        self.consecutive = self.consecutive.saturating_add(1);
        if self.consecutive >= self.max_attempts {
            return FailureDecision::Exhausted {
                attempts: self.consecutive,
            };
        }

        self.on_endpoint += 1;
        if self.on_endpoint >= self.failures_before_rotation {
            self.endpoint_index = (self.endpoint_index + 1) % self.endpoint_count;
            self.on_endpoint = 0;
        }

        FailureDecision::Retry {
            attempt: self.consecutive,
            endpoint_index: self.endpoint_index,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub endpoints: Vec<String>,
    pub include_ticker: bool,
    pub connect_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub reconnect: ReconnectPolicy,
}

impl ConnectionSettings {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            endpoints: config.stream_endpoints.clone(),
            include_ticker: config.include_ticker_stream,
            connect_timeout: config.connect_timeout(),
            heartbeat_interval: config.heartbeat_interval(),
            reconnect: ReconnectPolicy {
                base_delay_ms: config.reconnect_base_delay_ms,
                max_delay_ms: config.reconnect_max_delay_ms,
                jitter_ms: config.reconnect_jitter_ms,
                max_attempts: config.max_reconnect_attempts,
                failures_before_rotation: config.failures_before_rotation,
            },
        }
    }
}

#[derive(Debug)]
struct LinkShared {
    generation: u64,
    state: ConnectionState,
    endpoint_index: usize,
}

#[derive(Clone)]
struct EventEmitter {
    shared: Arc<Mutex<LinkShared>>,
    events: mpsc::UnboundedSender<StreamEvent>,
    generation: u64,
    subscription: SubscriptionId,
}

impl EventEmitter {
    fn transition(&self, state: ConnectionState) -> bool {
        let mut shared = self.shared.lock();
        if shared.generation != self.generation {
            return false;
        }
        if shared.state != state {
            shared.state = state;
            self.send(StreamEventKind::StateChanged(state));
        }
        true
    }

    fn emit(&self, kind: StreamEventKind) -> bool {
        let shared = self.shared.lock();
        if shared.generation != self.generation {
            return false;
        }
        self.send(kind);
        true
    }

    fn set_endpoint_index(&self, endpoint_index: usize) {
        let mut shared = self.shared.lock();
        if shared.generation == self.generation {
            shared.endpoint_index = endpoint_index;
        }
    }

    fn send(&self, kind: StreamEventKind) {
        let _ = self.events.send(StreamEvent {
            subscription: self.subscription,
            kind,
        });
    }
}

pub struct StreamConnectionManager {
    connector: Arc<dyn StreamConnector>,
    settings: Arc<ConnectionSettings>,
    events: mpsc::UnboundedSender<StreamEvent>,
    shared: Arc<Mutex<LinkShared>>,
    task: Option<TaskHandle>,
    key: SubscriptionKey,
    subscription: SubscriptionId,
}

impl StreamConnectionManager {
    pub fn new(
        connector: Arc<dyn StreamConnector>,
        settings: ConnectionSettings,
        events: mpsc::UnboundedSender<StreamEvent>,
        key: SubscriptionKey,
        subscription: SubscriptionId,
    ) -> Self {
        Self {
            connector,
            settings: Arc::new(settings),
            events,
            shared: Arc::new(Mutex::new(LinkShared {
                generation: 0,
                state: ConnectionState::Idle,
                endpoint_index: 0,
            })),
            task: None,
            key,
            subscription,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    pub fn endpoint_index(&self) -> usize {
        self.shared.lock().endpoint_index
    }

    pub fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    /// No-op while `Connecting` or `Open`. Otherwise starts on the current
    /// endpoint, which is the one the last run ended on.
    pub fn connect(&mut self) {
        if let Some(task) = self.task.take() {
            if self.state().is_active() {
                self.task = Some(task);
                debug!(key = %self.key, "connect ignored, link already active");
                return;
            }
            task.cancellation_token.cancel();
        }

        let (generation, endpoint_index) = {
            let mut shared = self.shared.lock();
            shared.generation += 1;
            shared.state = ConnectionState::Connecting;
            let _ = self.events.send(StreamEvent {
                subscription: self.subscription,
                kind: StreamEventKind::StateChanged(ConnectionState::Connecting),
            });
            (shared.generation, shared.endpoint_index)
        };

        let emitter = EventEmitter {
            shared: Arc::clone(&self.shared),
            events: self.events.clone(),
            generation,
            subscription: self.subscription,
        };
        let cancellation_token = CancellationToken::new();
        let join_handle = tokio::spawn(run_link(
            Arc::clone(&self.connector),
            Arc::clone(&self.settings),
            self.key.clone(),
            endpoint_index,
            emitter,
            cancellation_token.clone(),
        ));

        info!(key = %self.key, subscription = %self.subscription, generation, endpoint_index, "stream link started");
        self.task = Some(TaskHandle {
            cancellation_token,
            join_handle,
        });
    }

    /// Cancels every timer of the current activation before returning and
    /// suppresses automatic reconnects until the next `connect`.
    pub fn disconnect(&mut self) {
        let _ = self.stop();
    }

    /// Like [`disconnect`](Self::disconnect), then waits for the link task to
    /// finish its close handshake.
    pub async fn close(&mut self) {
        if let Some(join_handle) = self.stop() {
            if let Err(error) = join_handle.await {
                warn!(%error, "stream link task ended abnormally");
            }
        }
    }

    pub fn change_subscription(&mut self, key: SubscriptionKey, subscription: SubscriptionId) {
        self.disconnect();
        self.shared.lock().endpoint_index = 0;
        self.key = key;
        self.subscription = subscription;
        self.connect();
    }

    fn stop(&mut self) -> Option<JoinHandle<()>> {
        let join_handle = self.task.take().map(|task| {
            task.cancellation_token.cancel();
            task.join_handle
        });

        let mut shared = self.shared.lock();
        shared.generation += 1;
        if shared.state != ConnectionState::Closed {
            shared.state = ConnectionState::Closed;
            let _ = self.events.send(StreamEvent {
                subscription: self.subscription,
                kind: StreamEventKind::StateChanged(ConnectionState::Closed),
            });
            info!(key = %self.key, "stream link closed");
        }
        join_handle
    }
}

impl Drop for StreamConnectionManager {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.cancellation_token.cancel();
        }
    }
}

enum SessionEnd {
    Cancelled,
    Dropped(String),
}

async fn run_link(
    connector: Arc<dyn StreamConnector>,
    settings: Arc<ConnectionSettings>,
    key: SubscriptionKey,
    start_index: usize,
    emitter: EventEmitter,
    cancel_token: CancellationToken,
) {
    let policy = settings.reconnect;
    let mut tracker = FailureTracker::new(settings.endpoints.len(), &policy);
    tracker.resume_at(start_index);
    let connect_timeout_ms = settings.connect_timeout.as_millis().min(u64::MAX as u128) as u64;

    while !cancel_token.is_cancelled() {
        let endpoint_index = tracker.endpoint_index();
        let Some(endpoint) = settings.endpoints.get(endpoint_index) else {
            emitter.transition(ConnectionState::Closed);
            emitter.emit(StreamEventKind::Terminal("no stream endpoints configured".to_string()));
            return;
        };
        let url = stream_endpoint(endpoint, &key, settings.include_ticker);
        emitter.set_endpoint_index(endpoint_index);
        if !emitter.transition(ConnectionState::Connecting) {
            return;
        }
        debug!(%url, attempt = tracker.consecutive_failures() + 1, "opening stream link");

        let opened = tokio::select! {
            biased;
            _ = cancel_token.cancelled() => return,
            opened = tokio::time::timeout(settings.connect_timeout, connector.open(&url)) => opened,
        };

        let failure = match opened {
            Ok(Ok(link)) => {
                tracker.reset();
                emitter.set_endpoint_index(0);
                if !emitter.transition(ConnectionState::Open) {
                    return;
                }
                info!(%url, "stream link open");

                match run_session(link, &settings, &emitter, &cancel_token).await {
                    SessionEnd::Cancelled => return,
                    SessionEnd::Dropped(reason) => {
                        if !emitter.transition(ConnectionState::Reconnecting) {
                            return;
                        }
                        emitter.emit(StreamEventKind::ConnectivityLost(reason.clone()));
                        reason
                    }
                }
            }
            Ok(Err(error)) => format!("stream connect to {endpoint} failed: {error}"),
            Err(_) => AppError::Timeout {
                operation: "stream connect",
                timeout_ms: connect_timeout_ms,
            }
            .to_string(),
        };

        warn!(%url, reason = %failure, "stream link failure");
        if !emitter.emit(StreamEventKind::TransientError(failure)) {
            return;
        }

        match tracker.record_failure() {
            FailureDecision::Exhausted { attempts } => {
                emitter.transition(ConnectionState::Closed);
                let message = format!("stream offline after {attempts} consecutive failures");
                error!(key = %key, attempts, "{message}");
                emitter.emit(StreamEventKind::Terminal(message));
                return;
            }
            FailureDecision::Retry {
                attempt,
                endpoint_index,
            } => {
                if !emitter.transition(ConnectionState::Reconnecting) {
                    return;
                }
                let delay = policy.delay_with_jitter(attempt);
                debug!(attempt, endpoint_index, delay_ms = delay.as_millis() as u64, "scheduling reconnect");
                tokio::select! {
                    biased;
                    _ = cancel_token.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

async fn run_session(
    link: StreamLink,
    settings: &ConnectionSettings,
    emitter: &EventEmitter,
    cancel_token: &CancellationToken,
) -> SessionEnd {
    let StreamLink {
        mut frames,
        mut sink,
    } = link;
    let period = settings.heartbeat_interval;
    let mut heartbeat = interval_at(Instant::now() + period, period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut heartbeat_id = 0_u64;

    loop {
        tokio::select! {
            biased;
            _ = cancel_token.cancelled() => {
                close_link(&mut sink).await;
                return SessionEnd::Cancelled;
            }
            _ = heartbeat.tick() => {
                heartbeat_id += 1;
                if let Err(error) = sink.send(Message::Text(heartbeat_frame(heartbeat_id))).await {
                    return SessionEnd::Dropped(format!("heartbeat send failed: {error}"));
                }
            }
            frame = frames.next() => match frame {
                Some(Ok(message)) => {
                    if let Some(reason) = handle_frame(message, emitter) {
                        return SessionEnd::Dropped(reason);
                    }
                }
                Some(Err(error)) => return SessionEnd::Dropped(format!("stream error: {error}")),
                None => return SessionEnd::Dropped("stream ended".to_string()),
            },
        }
    }
}

async fn close_link(sink: &mut FrameSink) {
    let frame = CloseFrame {
        code: CloseCode::Normal,
        reason: Cow::Borrowed("client disconnect"),
    };
    match tokio::time::timeout(CLOSE_HANDSHAKE_TIMEOUT, sink.send(Message::Close(Some(frame)))).await {
        Ok(Ok(())) => {}
        Ok(Err(error)) => debug!(%error, "close frame not delivered"),
        Err(_) => debug!("close frame timed out"),
    }
}

/// Returns a reason when the frame ends the session.
fn handle_frame(message: Message, emitter: &EventEmitter) -> Option<String> {
    let mut payload = match message {
        Message::Text(text) => text.into_bytes(),
        Message::Binary(bytes) => bytes,
        Message::Close(Some(frame)) => {
            return Some(format!(
                "closed by venue ({}): {}",
                u16::from(frame.code),
                frame.reason
            ))
        }
        Message::Close(None) => return Some("closed by venue".to_string()),
        _ => return None,
    };

    match parse_stream_payload(payload.as_mut_slice()) {
        Ok(frame) => match (frame.bar, frame.quote) {
            (Some(bar), quote) => {
                emitter.emit(StreamEventKind::BarUpdate { bar, quote });
            }
            (None, Some(quote)) => {
                emitter.emit(StreamEventKind::QuoteUpdate(quote));
            }
            (None, None) => {}
        },
        Err(error) => warn!(%error, "dropping malformed stream frame"),
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::types::MarketTimeframe;
    use futures_util::{sink, stream};
    use std::collections::VecDeque;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const KLINE: &str = r#"{"e":"kline","E":1,"k":{"t":60000,"o":"1","h":"2","l":"0.5","c":"1.5","v":"3"}}"#;

    fn key() -> SubscriptionKey {
        SubscriptionKey::new("BTCUSDT", MarketTimeframe::M1).expect("test key should be valid")
    }

    fn settings(max_attempts: u32) -> ConnectionSettings {
        ConnectionSettings {
            endpoints: vec![
                "ws://a".to_string(),
                "ws://b".to_string(),
                "ws://c".to_string(),
            ],
            include_ticker: false,
            connect_timeout: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(30),
            reconnect: ReconnectPolicy {
                base_delay_ms: 1,
                max_delay_ms: 5,
                jitter_ms: 0,
                max_attempts,
                failures_before_rotation: 2,
            },
        }
    }

    #[derive(Default)]
    struct FailingConnector {
        urls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl StreamConnector for FailingConnector {
        async fn open(&self, url: &str) -> Result<StreamLink, AppError> {
            self.urls.lock().push(url.to_string());
            Err(AppError::Upstream("connection refused".to_string()))
        }
    }

    struct HangingConnector;

    #[async_trait]
    impl StreamConnector for HangingConnector {
        async fn open(&self, _url: &str) -> Result<StreamLink, AppError> {
            std::future::pending::<()>().await;
            Err(AppError::Upstream("unreachable".to_string()))
        }
    }

    /// Each `open` pops one scripted session; the frames are delivered and
    /// the link then stays silent.
    #[derive(Default)]
    struct ScriptedConnector {
        opens: AtomicUsize,
        sessions: Mutex<VecDeque<Vec<Message>>>,
    }

    impl ScriptedConnector {
        fn with_sessions(sessions: Vec<Vec<Message>>) -> Self {
            Self {
                opens: AtomicUsize::new(0),
                sessions: Mutex::new(sessions.into()),
            }
        }
    }

    #[async_trait]
    impl StreamConnector for ScriptedConnector {
        async fn open(&self, _url: &str) -> Result<StreamLink, AppError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let messages = self.sessions.lock().pop_front().unwrap_or_default();
            let frames = stream::iter(messages.into_iter().map(Ok::<Message, AppError>))
                .chain(stream::pending());
            let sink = sink::drain::<Message>()
                .sink_map_err(|never: Infallible| -> AppError { match never {} });
            Ok(StreamLink {
                frames: Box::pin(frames),
                sink: Box::pin(sink),
            })
        }
    }

    /// Records every frame written to the link; with `fail_sends` the first
    /// write errors instead.
    #[derive(Default)]
    struct RecordingConnector {
        opens: AtomicUsize,
        fail_sends: bool,
        sent: Arc<Mutex<Vec<Message>>>,
    }

    #[async_trait]
    impl StreamConnector for RecordingConnector {
        async fn open(&self, _url: &str) -> Result<StreamLink, AppError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let fail_sends = self.fail_sends;
            let sink = sink::unfold(
                Arc::clone(&self.sent),
                move |sent, message: Message| async move {
                    if fail_sends {
                        return Err(AppError::Upstream("broken pipe".to_string()));
                    }
                    sent.lock().push(message);
                    Ok(sent)
                },
            );
            Ok(StreamLink {
                frames: Box::pin(stream::pending::<Result<Message, AppError>>()),
                sink: Box::pin(sink),
            })
        }
    }

    async fn next_event(events: &mut mpsc::UnboundedReceiver<StreamEvent>) -> StreamEvent {
        tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("event should arrive in time")
            .expect("event channel should stay open")
    }

    async fn collect_until(
        events: &mut mpsc::UnboundedReceiver<StreamEvent>,
        done: impl Fn(&StreamEventKind) -> bool,
    ) -> Vec<StreamEventKind> {
        let mut seen = Vec::new();
        loop {
            let event = next_event(events).await;
            let finished = done(&event.kind);
            seen.push(event.kind);
            if finished {
                return seen;
            }
        }
    }

    #[test]
    fn backoff_doubles_until_cap() {
        let policy = ReconnectPolicy {
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            jitter_ms: 0,
            max_attempts: 5,
            failures_before_rotation: 2,
        };
        let delays: Vec<u64> = (1..=7)
            .map(|attempt| policy.delay_with_jitter(attempt).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1_000, 2_000, 4_000, 8_000, 16_000, 30_000, 30_000]);
    }

    #[test]
    fn jitter_stays_within_bound() {
        let policy = ReconnectPolicy {
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            jitter_ms: 1_000,
            max_attempts: 5,
            failures_before_rotation: 2,
        };
        for _ in 0..50 {
            let delay = policy.delay_with_jitter(2).as_millis() as u64;
            assert!((2_000..=3_000).contains(&delay));
        }
    }

    #[test]
    fn tracker_rotates_after_two_failures_per_endpoint() {
        let mut tracker = FailureTracker::new(3, &settings(5).reconnect);
        let mut indices = vec![tracker.endpoint_index()];
        for _ in 0..4 {
            match tracker.record_failure() {
                FailureDecision::Retry { endpoint_index, .. } => indices.push(endpoint_index),
                FailureDecision::Exhausted { .. } => panic!("budget should not be exhausted yet"),
            }
        }
        assert_eq!(indices, vec![0, 0, 1, 1, 2]);
        assert_eq!(
            tracker.record_failure(),
            FailureDecision::Exhausted { attempts: 5 }
        );

        tracker.reset();
        assert_eq!(tracker.endpoint_index(), 0);
        assert_eq!(tracker.consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn exhausts_budget_across_endpoints_then_closes() {
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let connector = Arc::new(FailingConnector::default());
        let mut manager = StreamConnectionManager::new(
            connector.clone(),
            settings(5),
            events_tx,
            key(),
            SubscriptionId(1),
        );

        manager.connect();
        let seen = collect_until(&mut events, |kind| {
            matches!(kind, StreamEventKind::Terminal(_))
        })
        .await;

        assert_eq!(manager.state(), ConnectionState::Closed);
        let urls = connector.urls.lock().clone();
        assert_eq!(
            urls,
            vec![
                "ws://a/ws/btcusdt@kline_1m",
                "ws://a/ws/btcusdt@kline_1m",
                "ws://b/ws/btcusdt@kline_1m",
                "ws://b/ws/btcusdt@kline_1m",
                "ws://c/ws/btcusdt@kline_1m",
            ]
        );
        let transient = seen
            .iter()
            .filter(|kind| matches!(kind, StreamEventKind::TransientError(_)))
            .count();
        assert_eq!(transient, 5);
        assert_eq!(
            seen.last(),
            Some(&StreamEventKind::Terminal(
                "stream offline after 5 consecutive failures".to_string()
            ))
        );

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(connector.urls.lock().len(), 5);
    }

    #[tokio::test]
    async fn connect_timeout_is_reported_as_transient_error() {
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let mut settings = settings(1);
        settings.connect_timeout = Duration::from_millis(20);
        let mut manager = StreamConnectionManager::new(
            Arc::new(HangingConnector),
            settings,
            events_tx,
            key(),
            SubscriptionId(1),
        );

        manager.connect();
        let seen = collect_until(&mut events, |kind| {
            matches!(kind, StreamEventKind::Terminal(_))
        })
        .await;

        assert!(seen.iter().any(|kind| matches!(
            kind,
            StreamEventKind::TransientError(message) if message.contains("timed out after 20ms")
        )));
        assert_eq!(manager.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn connect_is_idempotent_while_active() {
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let connector = Arc::new(ScriptedConnector::default());
        let mut manager = StreamConnectionManager::new(
            connector.clone(),
            settings(5),
            events_tx,
            key(),
            SubscriptionId(1),
        );

        manager.connect();
        manager.connect();
        collect_until(&mut events, |kind| {
            *kind == StreamEventKind::StateChanged(ConnectionState::Open)
        })
        .await;
        manager.connect();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(connector.opens.load(Ordering::SeqCst), 1);
        assert_eq!(manager.state(), ConnectionState::Open);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn forwards_bars_and_survives_malformed_frames() {
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let connector = Arc::new(ScriptedConnector::with_sessions(vec![vec![
            Message::Text("not json".to_string()),
            Message::Text(r#"{"result":null,"id":1}"#.to_string()),
            Message::Text(KLINE.to_string()),
        ]]));
        let mut manager = StreamConnectionManager::new(
            connector.clone(),
            settings(5),
            events_tx,
            key(),
            SubscriptionId(7),
        );

        manager.connect();
        let seen = collect_until(&mut events, |kind| {
            matches!(kind, StreamEventKind::BarUpdate { .. })
        })
        .await;

        assert!(!seen
            .iter()
            .any(|kind| matches!(kind, StreamEventKind::ConnectivityLost(_))));
        match seen.last() {
            Some(StreamEventKind::BarUpdate { bar, quote }) => {
                assert_eq!(bar.timestamp, 60);
                assert_eq!(bar.close, 1.5);
                assert!(quote.is_none());
            }
            other => panic!("expected bar update, got {other:?}"),
        }
        assert_eq!(manager.state(), ConnectionState::Open);
        assert_eq!(connector.opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn venue_close_triggers_connectivity_lost_and_reconnect() {
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let connector = Arc::new(ScriptedConnector::with_sessions(vec![
            vec![Message::Text(KLINE.to_string()), Message::Close(None)],
            Vec::new(),
        ]));
        let mut manager = StreamConnectionManager::new(
            connector.clone(),
            settings(5),
            events_tx,
            key(),
            SubscriptionId(1),
        );

        manager.connect();
        collect_until(&mut events, |kind| {
            matches!(kind, StreamEventKind::ConnectivityLost(_))
        })
        .await;
        assert!(matches!(
            manager.state(),
            ConnectionState::Reconnecting | ConnectionState::Connecting | ConnectionState::Open
        ));

        collect_until(&mut events, |kind| {
            *kind == StreamEventKind::StateChanged(ConnectionState::Open)
        })
        .await;
        assert_eq!(connector.opens.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn disconnect_suppresses_reconnect() {
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let connector = Arc::new(ScriptedConnector::default());
        let mut manager = StreamConnectionManager::new(
            connector.clone(),
            settings(5),
            events_tx,
            key(),
            SubscriptionId(1),
        );

        manager.connect();
        collect_until(&mut events, |kind| {
            *kind == StreamEventKind::StateChanged(ConnectionState::Open)
        })
        .await;

        manager.disconnect();
        assert_eq!(manager.state(), ConnectionState::Closed);
        assert_eq!(
            next_event(&mut events).await.kind,
            StreamEventKind::StateChanged(ConnectionState::Closed)
        );

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(events.try_recv().is_err());
        assert_eq!(connector.opens.load(Ordering::SeqCst), 1);
        assert_eq!(manager.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn change_subscription_restarts_on_primary_endpoint_with_new_identity() {
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let connector = Arc::new(ScriptedConnector::default());
        let mut manager = StreamConnectionManager::new(
            connector.clone(),
            settings(5),
            events_tx,
            key(),
            SubscriptionId(1),
        );
        manager.connect();
        collect_until(&mut events, |kind| {
            *kind == StreamEventKind::StateChanged(ConnectionState::Open)
        })
        .await;

        let next_key =
            SubscriptionKey::new("ETHUSDT", MarketTimeframe::M5).expect("test key should be valid");
        manager.change_subscription(next_key.clone(), SubscriptionId(2));

        let closed = next_event(&mut events).await;
        assert_eq!(closed.subscription, SubscriptionId(1));
        assert_eq!(
            closed.kind,
            StreamEventKind::StateChanged(ConnectionState::Closed)
        );

        let connecting = next_event(&mut events).await;
        assert_eq!(connecting.subscription, SubscriptionId(2));
        assert_eq!(
            connecting.kind,
            StreamEventKind::StateChanged(ConnectionState::Connecting)
        );

        let open = next_event(&mut events).await;
        assert_eq!(open.subscription, SubscriptionId(2));
        assert_eq!(manager.key(), &next_key);
        assert_eq!(manager.endpoint_index(), 0);
        assert_eq!(connector.opens.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn heartbeats_while_open_and_closes_with_normal_code() {
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let connector = Arc::new(RecordingConnector::default());
        let mut settings = settings(5);
        settings.heartbeat_interval = Duration::from_millis(20);
        let mut manager = StreamConnectionManager::new(
            connector.clone(),
            settings,
            events_tx,
            key(),
            SubscriptionId(1),
        );

        manager.connect();
        collect_until(&mut events, |kind| {
            *kind == StreamEventKind::StateChanged(ConnectionState::Open)
        })
        .await;

        let heartbeats = |sent: &[Message]| {
            sent.iter()
                .filter(|message| {
                    matches!(message, Message::Text(text) if text.contains("LIST_SUBSCRIPTIONS"))
                })
                .count()
        };
        tokio::time::timeout(Duration::from_secs(2), async {
            while heartbeats(connector.sent.lock().as_slice()) < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("heartbeats should be sent while open");

        manager.close().await;
        let sent = connector.sent.lock().clone();
        match sent.last() {
            Some(Message::Close(Some(frame))) => assert_eq!(frame.code, CloseCode::Normal),
            other => panic!("expected a normal close frame, got {other:?}"),
        }
        assert_eq!(heartbeats(sent.as_slice()), sent.len() - 1);
        assert_eq!(connector.opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_heartbeat_drops_link_and_reconnects() {
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let connector = Arc::new(RecordingConnector {
            fail_sends: true,
            ..RecordingConnector::default()
        });
        let mut settings = settings(5);
        settings.heartbeat_interval = Duration::from_millis(20);
        let mut manager = StreamConnectionManager::new(
            connector.clone(),
            settings,
            events_tx,
            key(),
            SubscriptionId(1),
        );

        manager.connect();
        let seen = collect_until(&mut events, |kind| {
            matches!(kind, StreamEventKind::ConnectivityLost(_))
        })
        .await;
        match seen.last() {
            Some(StreamEventKind::ConnectivityLost(reason)) => {
                assert!(reason.starts_with("heartbeat send failed"));
            }
            other => panic!("expected connectivity lost, got {other:?}"),
        }
        assert_eq!(
            seen[seen.len() - 2],
            StreamEventKind::StateChanged(ConnectionState::Reconnecting)
        );

        collect_until(&mut events, |kind| {
            *kind == StreamEventKind::StateChanged(ConnectionState::Open)
        })
        .await;
        assert_eq!(connector.opens.load(Ordering::SeqCst), 2);
        manager.disconnect();
    }

    #[tokio::test]
    async fn reconnect_after_exhaustion_resumes_on_last_endpoint() {
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let connector = Arc::new(FailingConnector::default());
        let mut manager = StreamConnectionManager::new(
            connector.clone(),
            settings(5),
            events_tx,
            key(),
            SubscriptionId(1),
        );

        manager.connect();
        collect_until(&mut events, |kind| {
            matches!(kind, StreamEventKind::Terminal(_))
        })
        .await;
        assert_eq!(manager.endpoint_index(), 2);

        manager.connect();
        collect_until(&mut events, |kind| {
            matches!(kind, StreamEventKind::Terminal(_))
        })
        .await;

        let urls = connector.urls.lock().clone();
        assert_eq!(
            &urls[5..],
            [
                "ws://c/ws/btcusdt@kline_1m",
                "ws://c/ws/btcusdt@kline_1m",
                "ws://a/ws/btcusdt@kline_1m",
                "ws://a/ws/btcusdt@kline_1m",
                "ws://b/ws/btcusdt@kline_1m",
            ]
        );
    }
}
