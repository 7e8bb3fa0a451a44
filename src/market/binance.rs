use crate::error::AppError;
use crate::market::connection::{StreamConnector, StreamLink};
use crate::market::fetcher::MarketDataSource;
use crate::market::types::{
    Bar, KlineWire, MarketTimeframe, Quote, SubscriptionKey, TickerSnapshotWire,
};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use reqwest::Client;
use std::time::Duration;
use tokio_tungstenite::connect_async_with_config;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tracing::debug;

const BINANCE_MAX_KLINES_PER_REQUEST: u16 = 1_000;

pub fn stream_endpoint(base_url: &str, key: &SubscriptionKey, include_ticker: bool) -> String {
    if include_ticker {
        format!(
            "{base_url}/stream?streams={}/{}",
            key.stream_name(),
            key.ticker_stream_name()
        )
    } else {
        format!("{base_url}/ws/{}", key.stream_name())
    }
}

fn klines_endpoint(
    base_url: &str,
    symbol: &str,
    timeframe: MarketTimeframe,
    limit: u16,
) -> String {
    format!("{base_url}/api/v3/klines")
        + &format!(
            "?symbol={}&interval={}&limit={}",
            symbol.to_ascii_uppercase(),
            timeframe.as_str(),
            limit.clamp(1, BINANCE_MAX_KLINES_PER_REQUEST)
        )
}

fn ticker_endpoint(base_url: &str, symbol: &str) -> String {
    format!("{base_url}/api/v3/ticker/24hr")
        + &format!("?symbol={}", symbol.to_ascii_uppercase())
}

/// Liveness probe. The venue answers with `{"result":[..],"id":n}`, which the
/// frame parser ignores.
pub fn heartbeat_frame(id: u64) -> String {
    format!(r#"{{"method":"LIST_SUBSCRIPTIONS","id":{id}}}"#)
}

#[derive(Debug, Clone, Default)]
pub struct TungsteniteConnector;

#[async_trait]
impl StreamConnector for TungsteniteConnector {
    async fn open(&self, url: &str) -> Result<StreamLink, AppError> {
        let ws_config = WebSocketConfig {
            max_message_size: Some(16 << 20),
            max_frame_size: Some(4 << 20),
            ..Default::default()
        };

        let (stream, _) = connect_async_with_config(url, Some(ws_config), true).await?;
        let (sink, frames) = stream.split();
        debug!(url, "websocket handshake completed");

        Ok(StreamLink {
            frames: Box::pin(frames.map(|frame| frame.map_err(AppError::from))),
            sink: Box::pin(sink.sink_map_err(AppError::from)),
        })
    }
}

#[derive(Debug, Clone)]
pub struct BinanceRestSource {
    client: Client,
    base_url: String,
}

impl BinanceRestSource {
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self, AppError> {
        let client = Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl MarketDataSource for BinanceRestSource {
    async fn fetch_klines(
        &self,
        symbol: &str,
        timeframe: MarketTimeframe,
        limit: u16,
    ) -> Result<Vec<Bar>, AppError> {
        let endpoint = klines_endpoint(&self.base_url, symbol, timeframe, limit);
        let response = self.client.get(endpoint).send().await?.error_for_status()?;
        let payload = response.json::<Vec<KlineWire>>().await?;

        let mut bars = Vec::with_capacity(payload.len());
        for kline in payload {
            bars.push(kline.try_into()?);
        }
        Ok(bars)
    }

    async fn fetch_ticker(&self, symbol: &str) -> Result<Quote, AppError> {
        let endpoint = ticker_endpoint(&self.base_url, symbol);
        let response = self.client.get(endpoint).send().await?.error_for_status()?;
        let payload = response.json::<TickerSnapshotWire>().await?;
        payload.try_into()
    }
}
