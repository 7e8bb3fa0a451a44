use crate::error::AppError;
use crate::market::cache::FreshnessCache;
use crate::market::types::{now_unix_ms, Bar, MarketTimeframe, Quote, SyncConfig};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Request/response side of the venue.
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    async fn fetch_klines(
        &self,
        symbol: &str,
        timeframe: MarketTimeframe,
        limit: u16,
    ) -> Result<Vec<Bar>, AppError>;

    async fn fetch_ticker(&self, symbol: &str) -> Result<Quote, AppError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    PreferCache,
    Bypass,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointKind {
    HistoricalBars,
    SnapshotQuote,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub kind: EndpointKind,
    pub symbol: String,
    pub params: String,
}

impl CacheKey {
    pub fn historical_bars(symbol: &str, timeframe: MarketTimeframe, limit: u16) -> Self {
        Self {
            kind: EndpointKind::HistoricalBars,
            symbol: symbol.to_ascii_uppercase(),
            params: format!("{timeframe}:{limit}"),
        }
    }

    pub fn snapshot_quote(symbol: &str) -> Self {
        Self {
            kind: EndpointKind::SnapshotQuote,
            symbol: symbol.to_ascii_uppercase(),
            params: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CachedPayload {
    Bars(Arc<Vec<Bar>>),
    Quote(Quote),
}

pub type ResponseCache = FreshnessCache<CacheKey, CachedPayload>;

#[derive(Debug, Clone)]
pub struct FetchSettings {
    pub timeout: Duration,
    pub retries: u32,
    pub retry_delay: Duration,
    pub history_ttl: Duration,
    pub quote_ttl: Duration,
}

impl FetchSettings {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            timeout: config.fetch_timeout(),
            retries: config.fetch_retries,
            retry_delay: Duration::from_millis(config.fetch_retry_delay_ms),
            history_ttl: Duration::from_millis(config.history_ttl_ms),
            quote_ttl: Duration::from_millis(config.quote_ttl_ms),
        }
    }
}

pub struct BulkFetcher {
    source: Arc<dyn MarketDataSource>,
    cache: Arc<ResponseCache>,
    settings: FetchSettings,
}

impl BulkFetcher {
    pub fn new(
        source: Arc<dyn MarketDataSource>,
        cache: Arc<ResponseCache>,
        settings: FetchSettings,
    ) -> Self {
        Self {
            source,
            cache,
            settings,
        }
    }

    /// Historical bars have no safe substitute: an upstream failure is always
    /// returned to the caller, even when a stale cached copy exists.
    pub async fn fetch_historical_bars(
        &self,
        symbol: &str,
        timeframe: MarketTimeframe,
        limit: u16,
        policy: CachePolicy,
    ) -> Result<Vec<Bar>, AppError> {
        self.cache.maybe_sweep();
        let key = CacheKey::historical_bars(symbol, timeframe, limit);
        if policy == CachePolicy::PreferCache {
            if let Some(CachedPayload::Bars(bars)) = self.cache.get(&key) {
                debug!(%symbol, %timeframe, "historical bars served from cache");
                return Ok(bars.as_ref().clone());
            }
        }

        let source = Arc::clone(&self.source);
        let result = self
            .with_retries("historical bars fetch", || {
                let source = Arc::clone(&source);
                async move { source.fetch_klines(symbol, timeframe, limit).await }
            })
            .await;

        match result {
            Ok(bars) => {
                self.cache.put(
                    key,
                    CachedPayload::Bars(Arc::new(bars.clone())),
                    self.settings.history_ttl,
                );
                Ok(bars)
            }
            Err(error) => {
                warn!(%symbol, %timeframe, %error, "historical bars fetch failed");
                Err(error)
            }
        }
    }

    /// Never fails: an upstream failure with nothing cached yields
    /// [`Quote::fallback`].
    pub async fn fetch_snapshot_quote(&self, symbol: &str, policy: CachePolicy) -> Quote {
        self.cache.maybe_sweep();
        let key = CacheKey::snapshot_quote(symbol);
        let cached = match self.cache.get(&key) {
            Some(CachedPayload::Quote(quote)) => Some(quote),
            _ => None,
        };

        if policy == CachePolicy::PreferCache {
            if let Some(quote) = cached {
                debug!(%symbol, "snapshot quote served from cache");
                return quote;
            }
        }

        let source = Arc::clone(&self.source);
        let result = self
            .with_retries("snapshot quote fetch", || {
                let source = Arc::clone(&source);
                async move { source.fetch_ticker(symbol).await }
            })
            .await;

        match result {
            Ok(quote) => {
                self.cache
                    .put(key, CachedPayload::Quote(quote), self.settings.quote_ttl);
                quote
            }
            Err(error) => {
                warn!(%symbol, %error, "snapshot quote unavailable");
                cached.unwrap_or_else(|| Quote::fallback(now_unix_ms()))
            }
        }
    }

    async fn with_retries<T, F, Fut>(
        &self,
        operation: &'static str,
        mut call: F,
    ) -> Result<T, AppError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        let timeout_ms = self.settings.timeout.as_millis().min(u64::MAX as u128) as u64;
        let mut attempt = 0_u32;
        loop {
            let outcome = match tokio::time::timeout(self.settings.timeout, call()).await {
                Ok(result) => result,
                Err(_) => Err(AppError::Timeout {
                    operation,
                    timeout_ms,
                }),
            };

            match outcome {
                Ok(value) => return Ok(value),
                Err(error) if attempt < self.settings.retries => {
                    attempt += 1;
                    let delay = self.settings.retry_delay.saturating_mul(attempt);
                    warn!(operation, attempt, %error, delay_ms = delay.as_millis() as u64, "retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(error) => return Err(error),
            }
        }
    }
}
