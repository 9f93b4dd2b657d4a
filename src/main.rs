// =============================================================================
// Helix Grid — Main Entry Point
// =============================================================================
//
// Per-account short-grid trading runtime. Credentials come from the
// environment; storage and logs are namespaced by the derived account scope
// so multiple accounts never share state.

// ── Module declarations ──────────────────────────────────────────────────────
mod bridge;
mod candles;
mod exchange;
mod grid;
mod market_data;
mod orchestrator;
mod runtime_config;
mod signals;
mod store;
mod types;
mod volatility;

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::exchange::binance::BinanceFuturesExecutor;
use crate::exchange::ExchangeExecutor;
use crate::orchestrator::GridRunner;
use crate::runtime_config::RunnerConfig;
use crate::store::StateStore;
use crate::types::StopSignal;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("helix-grid starting up");

    let config_path =
        std::env::var("HELIX_CONFIG").unwrap_or_else(|_| "runtime_config.json".to_string());
    let mut config = RunnerConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        RunnerConfig::default()
    });

    // Symbol override from the environment.
    if let Ok(syms) = std::env::var("HELIX_SYMBOLS") {
        config.symbols = syms
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
    }

    // ── 2. Exchange executor ─────────────────────────────────────────────
    let api_key = std::env::var("BINANCE_API_KEY").unwrap_or_default();
    let api_secret = std::env::var("BINANCE_API_SECRET").unwrap_or_default();

    // The executor owns account-scope resolution; without credentials the
    // same derivation still yields a deterministic namespace.
    let (executor, user_scope): (Option<Arc<dyn ExchangeExecutor>>, String) =
        if api_key.is_empty() || api_secret.is_empty() {
            warn!("no API credentials — running signal-only (no orders will be placed)");
            (
                None,
                exchange::derive_account_scope(&api_key, &config.user_scope),
            )
        } else {
            let ex = BinanceFuturesExecutor::new(api_key.clone(), api_secret, &config.user_scope);
            let scope = ex.account_scope().to_string();
            (Some(Arc::new(ex) as Arc<dyn ExchangeExecutor>), scope)
        };
    if config.account_scoped_storage && !config.log_dir.ends_with(&user_scope) {
        config.log_dir = format!("{}_{}", config.log_dir.trim_end_matches('/'), user_scope);
    }
    std::fs::create_dir_all(&config.log_dir).ok();

    info!(
        scope = %user_scope,
        symbols = ?config.symbols,
        log_dir = %config.log_dir,
        live = executor.is_some(),
        "configuration resolved"
    );

    // ── 3. State store ───────────────────────────────────────────────────
    let redis_url = if !config.redis_url.is_empty() {
        config.redis_url.clone()
    } else {
        let host = std::env::var("REDIS_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = std::env::var("REDIS_PORT").unwrap_or_else(|_| "6379".to_string());
        format!("redis://{host}:{port}")
    };
    let store = StateStore::connect(&redis_url, &user_scope).await;

    // ── 4. Orchestrator ──────────────────────────────────────────────────
    let runner = GridRunner::new(config, executor, store, user_scope);

    // ── 5. HTTP bridge ───────────────────────────────────────────────────
    let bridge_runner = runner.clone();
    let bind_addr = runner.config.bridge_bind_addr.clone();
    tokio::spawn(async move {
        bridge::serve(bridge_runner, bind_addr).await;
    });

    // ── 6. Run until shutdown ────────────────────────────────────────────
    let stop = StopSignal::new();
    let ctrl_c_stop = stop.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "ctrl-c handler failed");
            return;
        }
        warn!("shutdown signal received — stopping gracefully");
        ctrl_c_stop.set();
    });

    runner.run(stop).await;

    info!("helix-grid shut down complete");
    Ok(())
}
