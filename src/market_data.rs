// =============================================================================
// Market Data — combined bookTicker + aggTrade WebSocket streams
// =============================================================================
//
// One connection serves up to 100 symbols on the combined-stream endpoint.
// The loop reconnects with a short backoff until the stop signal fires;
// frames are routed to the owning trader by the orchestrator.

use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use tokio_tungstenite::connect_async;
use tracing::{error, info, warn};

use crate::orchestrator::GridRunner;
use crate::types::StopSignal;

const FUTURES_STREAM: &str = "wss://fstream.binance.com/stream";

/// Maximum symbols multiplexed onto one combined connection.
pub const SYMBOLS_PER_CONNECTION: usize = 100;

/// Combined streams: bookTicker + aggTrade for each symbol.
pub fn build_stream_url(symbols: &[String]) -> String {
    let mut streams = Vec::with_capacity(symbols.len() * 2);
    for sym in symbols {
        let s = sym.to_lowercase();
        streams.push(format!("{s}@bookTicker"));
        streams.push(format!("{s}@aggTrade"));
    }
    format!("{FUTURES_STREAM}?streams={}", streams.join("/"))
}

/// Run one combined-stream connection with auto-reconnect until `stop`.
pub async fn run_combined_stream(runner: Arc<GridRunner>, symbols: Vec<String>, stop: StopSignal) {
    let url = build_stream_url(&symbols);

    while !stop.is_set() {
        match stream_once(&runner, &url, symbols.len(), &stop).await {
            Ok(()) => {
                if stop.is_set() {
                    break;
                }
                warn!(symbols = symbols.len(), "market stream ended — reconnecting in 3s");
            }
            Err(e) => {
                if stop.is_set() {
                    break;
                }
                error!(error = %e, "market stream error — reconnecting in 3s");
            }
        }
        if stop.sleep_interruptible(3.0).await {
            break;
        }
    }
}

async fn stream_once(
    runner: &Arc<GridRunner>,
    url: &str,
    symbol_count: usize,
    stop: &StopSignal,
) -> Result<()> {
    let (ws_stream, _response) = connect_async(url)
        .await
        .context("failed to connect to market WebSocket")?;
    info!(symbols = symbol_count, "market stream connected");

    let (_write, mut read) = ws_stream.split();
    loop {
        tokio::select! {
            _ = stop.wait() => return Ok(()),
            msg = read.next() => match msg {
                Some(Ok(tokio_tungstenite::tungstenite::Message::Text(text))) => {
                    runner.dispatch_frame(&text);
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
                None => return Ok(()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_combines_both_channels_per_symbol() {
        let url = build_stream_url(&["BTCUSDT".to_string(), "ETHUSDT".to_string()]);
        assert!(url.starts_with("wss://fstream.binance.com/stream?streams="));
        assert!(url.contains("btcusdt@bookTicker"));
        assert!(url.contains("btcusdt@aggTrade"));
        assert!(url.contains("ethusdt@bookTicker"));
        assert!(url.contains("ethusdt@aggTrade"));
        let streams = url.split_once("?streams=").unwrap().1;
        assert_eq!(streams.split('/').count(), 4);
    }
}
