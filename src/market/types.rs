use crate::error::AppError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const DEFAULT_SYMBOL: &str = "BTCUSDT";
pub const DEFAULT_TIMEFRAME: MarketTimeframe = MarketTimeframe::M1;
pub const DEFAULT_MAX_BARS: usize = 100;
pub const DEFAULT_STREAM_ENDPOINTS: [&str; 3] = [
    "wss://stream.binance.com:9443",
    "wss://stream.binance.com:443",
    "wss://data-stream.binance.vision",
];
pub const DEFAULT_REST_BASE_URL: &str = "https://api.binance.com";
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 30_000;
pub const DEFAULT_RECONNECT_BASE_DELAY_MS: u64 = 1_000;
pub const DEFAULT_RECONNECT_MAX_DELAY_MS: u64 = 30_000;
pub const DEFAULT_RECONNECT_JITTER_MS: u64 = 1_000;
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
pub const DEFAULT_FAILURES_BEFORE_ROTATION: u32 = 2;
pub const DEFAULT_FETCH_TIMEOUT_MS: u64 = 15_000;
pub const DEFAULT_FETCH_RETRIES: u32 = 2;
pub const DEFAULT_FETCH_RETRY_DELAY_MS: u64 = 500;
pub const DEFAULT_HISTORY_TTL_MS: u64 = 300_000;
pub const DEFAULT_QUOTE_TTL_MS: u64 = 20_000;
pub const DEFAULT_TRANSIENT_ERROR_TTL_MS: u64 = 10_000;
pub const DEFAULT_INCLUDE_TICKER_STREAM: bool = false;
pub const MIN_MAX_BARS: usize = 10;
pub const MAX_MAX_BARS: usize = 1_000;
pub const MIN_CONNECT_TIMEOUT_MS: u64 = 1_000;
pub const MAX_CONNECT_TIMEOUT_MS: u64 = 60_000;
pub const MIN_HEARTBEAT_INTERVAL_MS: u64 = 1_000;
// The venue drops links that stay silent for 60s.
pub const MAX_HEARTBEAT_INTERVAL_MS: u64 = 59_000;
pub const MIN_RECONNECT_BASE_DELAY_MS: u64 = 1;
pub const MAX_RECONNECT_BASE_DELAY_MS: u64 = 10_000;
pub const MAX_RECONNECT_JITTER_MS: u64 = 5_000;
pub const MIN_MAX_RECONNECT_ATTEMPTS: u32 = 1;
pub const MAX_MAX_RECONNECT_ATTEMPTS: u32 = 50;
pub const MIN_FETCH_TIMEOUT_MS: u64 = 1_000;
pub const MAX_FETCH_TIMEOUT_MS: u64 = 60_000;
pub const MAX_FETCH_RETRIES: u32 = 5;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum MarketTimeframe {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "3m")]
    M3,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "30m")]
    M30,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "2h")]
    H2,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "6h")]
    H6,
    #[serde(rename = "8h")]
    H8,
    #[serde(rename = "12h")]
    H12,
    #[serde(rename = "1d")]
    D1,
    #[serde(rename = "3d")]
    D3,
    #[serde(rename = "1w")]
    W1,
    #[serde(rename = "1M")]
    Mo1,
}

impl MarketTimeframe {
    pub const ALL: [MarketTimeframe; 15] = [
        Self::M1,
        Self::M3,
        Self::M5,
        Self::M15,
        Self::M30,
        Self::H1,
        Self::H2,
        Self::H4,
        Self::H6,
        Self::H8,
        Self::H12,
        Self::D1,
        Self::D3,
        Self::W1,
        Self::Mo1,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::M1 => "1m",
            Self::M3 => "3m",
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::M30 => "30m",
            Self::H1 => "1h",
            Self::H2 => "2h",
            Self::H4 => "4h",
            Self::H6 => "6h",
            Self::H8 => "8h",
            Self::H12 => "12h",
            Self::D1 => "1d",
            Self::D3 => "3d",
            Self::W1 => "1w",
            Self::Mo1 => "1M",
        }
    }

    pub fn duration_ms(self) -> i64 {
        match self {
            Self::M1 => 60_000,
            Self::M3 => 180_000,
            Self::M5 => 300_000,
            Self::M15 => 900_000,
            Self::M30 => 1_800_000,
            Self::H1 => 3_600_000,
            Self::H2 => 7_200_000,
            Self::H4 => 14_400_000,
            Self::H6 => 21_600_000,
            Self::H8 => 28_800_000,
            Self::H12 => 43_200_000,
            Self::D1 => 86_400_000,
            Self::D3 => 259_200_000,
            Self::W1 => 604_800_000,
            Self::Mo1 => 2_592_000_000,
        }
    }

    /// Case matters: `1m` is a minute, `1M` a month.
    pub fn parse_str(value: &str) -> Result<Self, AppError> {
        let trimmed = value.trim();
        Self::ALL
            .into_iter()
            .find(|timeframe| timeframe.as_str() == trimmed)
            .ok_or_else(|| AppError::InvalidArgument(format!("unsupported timeframe '{trimmed}'")))
    }
}

impl fmt::Display for MarketTimeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Reconnecting,
    Closed,
}

impl ConnectionState {
    pub fn is_open(self) -> bool {
        matches!(self, Self::Open)
    }

    pub fn is_active(self) -> bool {
        matches!(self, Self::Connecting | Self::Open)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Reconnecting => "reconnecting",
            Self::Closed => "closed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionKey {
    pub symbol: String,
    pub timeframe: MarketTimeframe,
}

impl SubscriptionKey {
    pub fn new(symbol: &str, timeframe: MarketTimeframe) -> Result<Self, AppError> {
        Ok(Self {
            symbol: normalize_symbol(symbol)?,
            timeframe,
        })
    }

    pub fn stream_name(&self) -> String {
        format!(
            "{}@kline_{}",
            self.symbol.to_ascii_lowercase(),
            self.timeframe.as_str()
        )
    }

    pub fn ticker_stream_name(&self) -> String {
        format!("{}@ticker", self.symbol.to_ascii_lowercase())
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.symbol, self.timeframe)
    }
}

/// Identity of one activation of a subscription key. Re-selecting the same key
/// still mints a new id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SubscriptionId(pub u64);

impl SubscriptionId {
    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Bar {
    /// Bar open time in seconds.
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Bar {
    pub fn from_decimal_strings(
        open_time_ms: i64,
        open: &str,
        high: &str,
        low: &str,
        close: &str,
        volume: &str,
    ) -> Result<Self, AppError> {
        let open = open.parse::<f64>()?;
        let high = high.parse::<f64>()?;
        let low = low.parse::<f64>()?;
        let close = close.parse::<f64>()?;
        let volume = volume.parse::<f64>()?;

        if !open.is_finite()
            || !high.is_finite()
            || !low.is_finite()
            || !close.is_finite()
            || !volume.is_finite()
            || volume < 0.0
        {
            return Err(AppError::Upstream(
                "kline values must be finite and volume non-negative".to_string(),
            ));
        }

        Ok(Self {
            timestamp: open_time_ms.div_euclid(1_000),
            open,
            high,
            low,
            close,
            volume,
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum QuoteSource {
    Snapshot,
    Stream,
    Fallback,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Quote {
    pub price: f64,
    pub change: f64,
    pub change_percent: f64,
    /// Unix milliseconds.
    pub as_of: i64,
    pub source: QuoteSource,
}

impl Quote {
    pub fn fallback(as_of: i64) -> Self {
        Self {
            price: 0.0,
            change: 0.0,
            change_percent: 0.0,
            as_of,
            source: QuoteSource::Fallback,
        }
    }

    pub fn is_fallback(&self) -> bool {
        self.source == QuoteSource::Fallback
    }

    fn from_decimal_strings(
        price: &str,
        change: &str,
        change_percent: &str,
        as_of: i64,
        source: QuoteSource,
    ) -> Result<Self, AppError> {
        let price = price.parse::<f64>()?;
        let change = change.parse::<f64>()?;
        let change_percent = change_percent.parse::<f64>()?;
        if !price.is_finite() || !change.is_finite() || !change_percent.is_finite() {
            return Err(AppError::Upstream(
                "quote values must be finite".to_string(),
            ));
        }
        Ok(Self {
            price,
            change,
            change_percent,
            as_of,
            source,
        })
    }
}

#[derive(Debug, Deserialize)]
#[allow(dead_code)]
pub struct KlineWire(
    pub i64,
    pub String,
    pub String,
    pub String,
    pub String,
    pub String,
    pub i64,
    pub String,
    pub u64,
    pub String,
    pub String,
    pub String,
);

impl TryFrom<KlineWire> for Bar {
    type Error = AppError;

    fn try_from(value: KlineWire) -> Result<Self, Self::Error> {
        Bar::from_decimal_strings(value.0, &value.1, &value.2, &value.3, &value.4, &value.5)
    }
}

#[derive(Debug, Deserialize)]
pub struct TickerSnapshotWire {
    #[serde(rename = "lastPrice")]
    pub last_price: String,
    #[serde(rename = "priceChange")]
    pub price_change: String,
    #[serde(rename = "priceChangePercent")]
    pub price_change_percent: String,
    #[serde(rename = "closeTime")]
    pub close_time: i64,
}

impl TryFrom<TickerSnapshotWire> for Quote {
    type Error = AppError;

    fn try_from(value: TickerSnapshotWire) -> Result<Self, Self::Error> {
        Quote::from_decimal_strings(
            &value.last_price,
            &value.price_change,
            &value.price_change_percent,
            value.close_time,
            QuoteSource::Snapshot,
        )
    }
}

#[derive(Debug, Deserialize)]
pub struct KlineBodyWire {
    #[serde(rename = "t")]
    pub open_time: i64,
    #[serde(rename = "o")]
    pub open: String,
    #[serde(rename = "h")]
    pub high: String,
    #[serde(rename = "l")]
    pub low: String,
    #[serde(rename = "c")]
    pub close: String,
    #[serde(rename = "v")]
    pub volume: String,
}

/// Every stream frame shape the venue sends: single-stream events, the
/// combined-stream envelope, and control replies (`{"result":..,"id":..}`).
#[derive(Debug, Deserialize)]
pub struct StreamEventWire {
    #[serde(rename = "e", default)]
    pub event_type: Option<String>,
    #[serde(rename = "E", default)]
    pub event_time: Option<i64>,
    #[serde(rename = "k", default)]
    pub kline: Option<KlineBodyWire>,
    #[serde(rename = "c", default)]
    pub last_price: Option<String>,
    #[serde(rename = "p", default)]
    pub price_change: Option<String>,
    #[serde(rename = "P", default)]
    pub price_change_percent: Option<String>,
    #[serde(default)]
    pub data: Option<Box<StreamEventWire>>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct StreamFrame {
    pub bar: Option<Bar>,
    pub quote: Option<Quote>,
}

impl StreamFrame {
    pub fn is_empty(&self) -> bool {
        self.bar.is_none() && self.quote.is_none()
    }
}

impl TryFrom<StreamEventWire> for StreamFrame {
    type Error = AppError;

    fn try_from(value: StreamEventWire) -> Result<Self, Self::Error> {
        if let Some(inner) = value.data {
            return (*inner).try_into();
        }

        let mut frame = StreamFrame::default();
        match value.event_type.as_deref() {
            Some("kline") => {
                let body = value.kline.as_ref().ok_or_else(|| {
                    AppError::Upstream("kline event without kline body".to_string())
                })?;
                frame.bar = Some(Bar::from_decimal_strings(
                    body.open_time,
                    &body.open,
                    &body.high,
                    &body.low,
                    &body.close,
                    &body.volume,
                )?);
            }
            Some("24hrTicker") => {
                if value.last_price.is_none() {
                    return Err(AppError::Upstream(
                        "ticker event without last price".to_string(),
                    ));
                }
            }
            _ => return Ok(frame),
        }

        if let (Some(price), Some(change), Some(change_percent)) = (
            value.last_price.as_deref(),
            value.price_change.as_deref(),
            value.price_change_percent.as_deref(),
        ) {
            frame.quote = Some(Quote::from_decimal_strings(
                price,
                change,
                change_percent,
                value.event_time.unwrap_or_else(now_unix_ms),
                QuoteSource::Stream,
            )?);
        }

        Ok(frame)
    }
}

pub fn parse_stream_payload(payload: &mut [u8]) -> Result<StreamFrame, AppError> {
    let wire: StreamEventWire = simd_json::serde::from_slice(payload)?;
    wire.try_into()
}

pub fn normalize_symbol(symbol: &str) -> Result<String, AppError> {
    let symbol = symbol.trim().to_ascii_uppercase();
    if symbol.is_empty() || !symbol.chars().all(|ch| ch.is_ascii_alphanumeric()) {
        return Err(AppError::InvalidArgument(
            "symbol must be non-empty alphanumeric ASCII".to_string(),
        ));
    }
    Ok(symbol)
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SyncArgs {
    pub symbol: Option<String>,
    pub timeframe: Option<MarketTimeframe>,
    pub max_bars: Option<usize>,
    pub stream_endpoints: Option<Vec<String>>,
    pub rest_base_url: Option<String>,
    pub connect_timeout_ms: Option<u64>,
    pub heartbeat_interval_ms: Option<u64>,
    pub reconnect_base_delay_ms: Option<u64>,
    pub reconnect_max_delay_ms: Option<u64>,
    pub reconnect_jitter_ms: Option<u64>,
    pub max_reconnect_attempts: Option<u32>,
    pub failures_before_rotation: Option<u32>,
    pub fetch_timeout_ms: Option<u64>,
    pub fetch_retries: Option<u32>,
    pub fetch_retry_delay_ms: Option<u64>,
    pub history_ttl_ms: Option<u64>,
    pub quote_ttl_ms: Option<u64>,
    pub transient_error_ttl_ms: Option<u64>,
    pub include_ticker_stream: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfig {
    pub symbol: String,
    pub timeframe: MarketTimeframe,
    pub max_bars: usize,
    pub stream_endpoints: Vec<String>,
    pub rest_base_url: String,
    pub connect_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub reconnect_jitter_ms: u64,
    pub max_reconnect_attempts: u32,
    pub failures_before_rotation: u32,
    pub fetch_timeout_ms: u64,
    pub fetch_retries: u32,
    pub fetch_retry_delay_ms: u64,
    pub history_ttl_ms: u64,
    pub quote_ttl_ms: u64,
    pub transient_error_ttl_ms: u64,
    pub include_ticker_stream: bool,
}

impl SyncArgs {
    pub fn normalize(self) -> Result<SyncConfig, AppError> {
        let symbol = normalize_symbol(self.symbol.as_deref().unwrap_or(DEFAULT_SYMBOL))?;
        let timeframe = self.timeframe.unwrap_or(DEFAULT_TIMEFRAME);

        let max_bars = self.max_bars.unwrap_or(DEFAULT_MAX_BARS);
        if !(MIN_MAX_BARS..=MAX_MAX_BARS).contains(&max_bars) {
            return Err(AppError::InvalidArgument(format!(
                "maxBars must be between {MIN_MAX_BARS} and {MAX_MAX_BARS}"
            )));
        }

        let stream_endpoints: Vec<String> = self
            .stream_endpoints
            .unwrap_or_else(|| {
                DEFAULT_STREAM_ENDPOINTS
                    .iter()
                    .map(|endpoint| endpoint.to_string())
                    .collect()
            })
            .into_iter()
            .map(|endpoint| endpoint.trim().trim_end_matches('/').to_string())
            .filter(|endpoint| !endpoint.is_empty())
            .collect();
        if stream_endpoints.is_empty() {
            return Err(AppError::InvalidArgument(
                "streamEndpoints must contain at least one endpoint".to_string(),
            ));
        }
        if let Some(invalid) = stream_endpoints
            .iter()
            .find(|endpoint| !endpoint.starts_with("ws://") && !endpoint.starts_with("wss://"))
        {
            return Err(AppError::InvalidArgument(format!(
                "stream endpoint '{invalid}' must use ws:// or wss://"
            )));
        }

        let rest_base_url = self
            .rest_base_url
            .unwrap_or_else(|| DEFAULT_REST_BASE_URL.to_string())
            .trim()
            .trim_end_matches('/')
            .to_string();
        if !rest_base_url.starts_with("http://") && !rest_base_url.starts_with("https://") {
            return Err(AppError::InvalidArgument(
                "restBaseUrl must use http:// or https://".to_string(),
            ));
        }

        let connect_timeout_ms = self.connect_timeout_ms.unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS);
        if !(MIN_CONNECT_TIMEOUT_MS..=MAX_CONNECT_TIMEOUT_MS).contains(&connect_timeout_ms) {
            return Err(AppError::InvalidArgument(format!(
                "connectTimeoutMs must be between {MIN_CONNECT_TIMEOUT_MS} and {MAX_CONNECT_TIMEOUT_MS}"
            )));
        }

        let heartbeat_interval_ms = self
            .heartbeat_interval_ms
            .unwrap_or(DEFAULT_HEARTBEAT_INTERVAL_MS);
        if !(MIN_HEARTBEAT_INTERVAL_MS..=MAX_HEARTBEAT_INTERVAL_MS).contains(&heartbeat_interval_ms)
        {
            return Err(AppError::InvalidArgument(format!(
                "heartbeatIntervalMs must be between {MIN_HEARTBEAT_INTERVAL_MS} and {MAX_HEARTBEAT_INTERVAL_MS}"
            )));
        }

        let reconnect_base_delay_ms = self
            .reconnect_base_delay_ms
            .unwrap_or(DEFAULT_RECONNECT_BASE_DELAY_MS);
        if !(MIN_RECONNECT_BASE_DELAY_MS..=MAX_RECONNECT_BASE_DELAY_MS)
            .contains(&reconnect_base_delay_ms)
        {
            return Err(AppError::InvalidArgument(format!(
                "reconnectBaseDelayMs must be between {MIN_RECONNECT_BASE_DELAY_MS} and {MAX_RECONNECT_BASE_DELAY_MS}"
            )));
        }

        let reconnect_max_delay_ms = self
            .reconnect_max_delay_ms
            .unwrap_or(DEFAULT_RECONNECT_MAX_DELAY_MS);
        if reconnect_max_delay_ms < reconnect_base_delay_ms {
            return Err(AppError::InvalidArgument(
                "reconnectMaxDelayMs must not be below reconnectBaseDelayMs".to_string(),
            ));
        }

        let reconnect_jitter_ms = self
            .reconnect_jitter_ms
            .unwrap_or(DEFAULT_RECONNECT_JITTER_MS);
        if reconnect_jitter_ms > MAX_RECONNECT_JITTER_MS {
            return Err(AppError::InvalidArgument(format!(
                "reconnectJitterMs must not exceed {MAX_RECONNECT_JITTER_MS}"
            )));
        }

        let max_reconnect_attempts = self
            .max_reconnect_attempts
            .unwrap_or(DEFAULT_MAX_RECONNECT_ATTEMPTS);
        if !(MIN_MAX_RECONNECT_ATTEMPTS..=MAX_MAX_RECONNECT_ATTEMPTS)
            .contains(&max_reconnect_attempts)
        {
            return Err(AppError::InvalidArgument(format!(
                "maxReconnectAttempts must be between {MIN_MAX_RECONNECT_ATTEMPTS} and {MAX_MAX_RECONNECT_ATTEMPTS}"
            )));
        }

        let failures_before_rotation = self
            .failures_before_rotation
            .unwrap_or(DEFAULT_FAILURES_BEFORE_ROTATION);
        if failures_before_rotation == 0 {
            return Err(AppError::InvalidArgument(
                "failuresBeforeRotation must be at least 1".to_string(),
            ));
        }

        let fetch_timeout_ms = self.fetch_timeout_ms.unwrap_or(DEFAULT_FETCH_TIMEOUT_MS);
        if !(MIN_FETCH_TIMEOUT_MS..=MAX_FETCH_TIMEOUT_MS).contains(&fetch_timeout_ms) {
            return Err(AppError::InvalidArgument(format!(
                "fetchTimeoutMs must be between {MIN_FETCH_TIMEOUT_MS} and {MAX_FETCH_TIMEOUT_MS}"
            )));
        }

        let fetch_retries = self.fetch_retries.unwrap_or(DEFAULT_FETCH_RETRIES);
        if fetch_retries > MAX_FETCH_RETRIES {
            return Err(AppError::InvalidArgument(format!(
                "fetchRetries must not exceed {MAX_FETCH_RETRIES}"
            )));
        }
        let fetch_retry_delay_ms = self
            .fetch_retry_delay_ms
            .unwrap_or(DEFAULT_FETCH_RETRY_DELAY_MS);

        let history_ttl_ms = self.history_ttl_ms.unwrap_or(DEFAULT_HISTORY_TTL_MS);
        let quote_ttl_ms = self.quote_ttl_ms.unwrap_or(DEFAULT_QUOTE_TTL_MS);
        let transient_error_ttl_ms = self
            .transient_error_ttl_ms
            .unwrap_or(DEFAULT_TRANSIENT_ERROR_TTL_MS);
        if history_ttl_ms == 0 || quote_ttl_ms == 0 || transient_error_ttl_ms == 0 {
            return Err(AppError::InvalidArgument(
                "historyTtlMs, quoteTtlMs and transientErrorTtlMs must be positive".to_string(),
            ));
        }

        let include_ticker_stream = self
            .include_ticker_stream
            .unwrap_or(DEFAULT_INCLUDE_TICKER_STREAM);

        Ok(SyncConfig {
            symbol,
            timeframe,
            max_bars,
            stream_endpoints,
            rest_base_url,
            connect_timeout_ms,
            heartbeat_interval_ms,
            reconnect_base_delay_ms,
            reconnect_max_delay_ms,
            reconnect_jitter_ms,
            max_reconnect_attempts,
            failures_before_rotation,
            fetch_timeout_ms,
            fetch_retries,
            fetch_retry_delay_ms,
            history_ttl_ms,
            quote_ttl_ms,
            transient_error_ttl_ms,
            include_ticker_stream,
        })
    }

    pub fn from_env() -> Result<Self, AppError> {
        let mut args = Self {
            symbol: env_value("MARKET_SYNC_SYMBOL"),
            ..Self::default()
        };

        if let Some(raw) = env_value("MARKET_SYNC_TIMEFRAME") {
            args.timeframe = Some(MarketTimeframe::parse_str(&raw)?);
        }
        if let Some(raw) = env_value("MARKET_SYNC_ENDPOINTS") {
            args.stream_endpoints = Some(raw.split(',').map(str::to_string).collect());
        }
        if let Some(raw) = env_value("MARKET_SYNC_MAX_BARS") {
            let parsed = raw.parse::<usize>().map_err(|_| {
                AppError::InvalidArgument(format!("MARKET_SYNC_MAX_BARS '{raw}' is not a count"))
            })?;
            args.max_bars = Some(parsed);
        }
        if let Some(raw) = env_value("MARKET_SYNC_TICKER") {
            args.include_ticker_stream =
                Some(matches!(raw.to_ascii_lowercase().as_str(), "1" | "true" | "yes"));
        }

        Ok(args)
    }
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, AppError> {
        SyncArgs::from_env()?.normalize()
    }

    pub fn subscription_key(&self) -> SubscriptionKey {
        SubscriptionKey {
            symbol: self.symbol.clone(),
            timeframe: self.timeframe,
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn transient_error_ttl(&self) -> Duration {
        Duration::from_millis(self.transient_error_ttl_ms)
    }
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub(crate) fn now_unix_ms() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_millis().min(i64::MAX as u128) as i64,
        Err(_) => 0,
    }
}
