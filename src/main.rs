use market_sync::telemetry::init_tracing;
use market_sync::{AppResult, MarketSync, SyncConfig};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> AppResult<()> {
    init_tracing("info,market_sync=debug");

    let config = SyncConfig::from_env()?;
    info!(
        symbol = %config.symbol,
        timeframe = %config.timeframe,
        max_bars = config.max_bars,
        endpoints = config.stream_endpoints.len(),
        "starting market sync"
    );

    let sync = MarketSync::start(config)?;
    sync.on_series_changed(|series| {
        if let Some(last) = series.last() {
            info!(
                len = series.len(),
                timestamp = last.timestamp,
                close = last.close,
                volume = last.volume,
                "series updated"
            );
        }
    });
    sync.on_connection_state_changed(|state| info!(%state, "connection state changed"));
    sync.on_transient_error(|message| match message {
        Some(message) => warn!(%message, "transient error"),
        None => info!("transient error cleared"),
    });

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    if let Some(quote) = sync.quote() {
        info!(price = quote.price, change_percent = quote.change_percent, source = ?quote.source, "last quote");
    }
    let stats = sync.stats();
    info!(
        loads = stats.loads,
        appended = stats.appended,
        replaced = stats.replaced,
        stale_dropped = stats.stale_dropped,
        "sync stats"
    );
    sync.shutdown().await
}
