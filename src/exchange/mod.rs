// =============================================================================
// Exchange executor contract — the seam between strategy and venue
// =============================================================================
//
// The orchestrator depends only on this trait. The concrete Binance futures
// implementation lives in `binance.rs`; tests drive the strategy through the
// trait with stub executors.

pub mod binance;
pub mod stealth;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::types::{OrderSide, OrderStatus};

// ---------------------------------------------------------------------------
// Contract types
// ---------------------------------------------------------------------------

/// Exchange symbol metadata used for grid rounding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolInfo {
    /// Raw symbol, e.g. "BTCUSDT".
    pub symbol: String,
    pub min_qty: f64,
    pub qty_step: f64,
    pub price_step: f64,
    pub price_precision: u32,
    pub qty_precision: u32,
    pub min_notional: f64,
}

/// Result from a confirmed filled order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillResult {
    pub order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub qty: f64,
    pub avg_price: f64,
    pub cost: f64,
    pub fee: f64,
    pub is_maker: bool,
    pub timestamp: f64,
}

/// One open position as reported by the exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionInfo {
    /// "long" or "short".
    pub side: String,
    pub contracts: f64,
    pub notional: f64,
    pub entry_price: f64,
    pub unrealized_pnl: f64,
}

/// Callback invoked from the user-data stream for terminal order states.
pub type OrderUpdateHandler =
    Arc<dyn Fn(&str, OrderStatus, Option<FillResult>) + Send + Sync>;

// ---------------------------------------------------------------------------
// Executor trait
// ---------------------------------------------------------------------------

/// Contract the core depends on. Post-only orders that would cross are
/// rejected without side effects; amendments on a crossing price are
/// rejected with the original order left alive when the venue reports
/// "no need to modify".
#[async_trait]
pub trait ExchangeExecutor: Send + Sync {
    async fn get_symbol_info(&self, symbol: &str) -> Option<SymbolInfo>;

    /// Fire-and-forget post-only SELL. Returns the order id immediately;
    /// fill/cancel arrives via the user-data stream. `None` on rejection.
    async fn fire_limit_sell(&self, symbol: &str, qty: f64, price: f64) -> Option<String>;

    /// Post-only reduce-only limit BUY used for immediate maker exits.
    /// Returns a fill when the order closes in the confirmation window;
    /// a still-resting order is cancelled and `None` returned.
    async fn limit_buy(&self, symbol: &str, qty: f64, price: f64) -> Option<FillResult>;

    /// Post-only reduce-only limit BUY left resting on the book (TP slices).
    /// Returns the order id plus an immediate fill when the submission
    /// response is already closed. `None` on rejection.
    async fn rest_limit_buy(
        &self,
        symbol: &str,
        qty: f64,
        price: f64,
    ) -> Option<(String, Option<FillResult>)>;

    /// Immediate-or-cancel reduce-only BUY at a price cap.
    async fn ioc_buy(&self, symbol: &str, qty: f64, price: f64) -> Option<FillResult>;

    /// Reduce-only market BUY.
    async fn market_buy(&self, symbol: &str, qty: f64) -> Option<FillResult>;

    /// Atomic price/qty replace. Returns the (possibly new) order id on
    /// success; the original id when the venue reports nothing to modify;
    /// `None` when the amended price would cross or the order is gone.
    async fn amend_order(
        &self,
        order_id: &str,
        symbol: &str,
        side: OrderSide,
        qty: f64,
        price: f64,
    ) -> Option<String>;

    /// Cancel one order. Order-not-found counts as success.
    async fn cancel_order(&self, order_id: &str, symbol: &str) -> bool;

    async fn cancel_all_symbol_orders(&self, symbol: &str) -> usize;

    async fn cancel_all_tracked_orders(&self) -> usize;

    /// Open positions keyed by unified symbol ("BASE/USDT:USDT").
    async fn get_positions(&self) -> HashMap<String, PositionInfo>;

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<()>;

    /// Register the user-data-stream callback.
    fn set_order_update_handler(&self, handler: OrderUpdateHandler);

    /// Start the user-data stream task (no-op for stub executors).
    async fn start_user_stream(self: Arc<Self>) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Rounding helpers
// ---------------------------------------------------------------------------

/// Snap a price onto the symbol's tick grid.
pub fn round_price(price: f64, info: &SymbolInfo) -> f64 {
    if info.price_step <= 0.0 {
        return price;
    }
    let steps = (price / info.price_step).round();
    let snapped = steps * info.price_step;
    let factor = 10_f64.powi(info.price_precision as i32);
    (snapped * factor).round() / factor
}

/// Snap a quantity down onto the symbol's lot grid.
pub fn round_qty(qty: f64, info: &SymbolInfo) -> f64 {
    if info.qty_step <= 0.0 {
        return qty;
    }
    let steps = (qty / info.qty_step).floor();
    let snapped = steps * info.qty_step;
    let factor = 10_f64.powi(info.qty_precision as i32);
    (snapped * factor).round() / factor
}

// ---------------------------------------------------------------------------
// Symbol forms
// ---------------------------------------------------------------------------

/// "BTCUSDT" → "BTC/USDT:USDT".
pub fn to_unified_symbol(raw: &str) -> String {
    let upper = raw.to_uppercase();
    match upper.strip_suffix("USDT") {
        Some(base) if !base.is_empty() => format!("{base}/USDT:USDT"),
        _ => upper,
    }
}

/// "BTC/USDT:USDT" → "BTCUSDT".
pub fn to_raw_symbol(unified: &str) -> String {
    unified.replace("/USDT:USDT", "USDT").replace('/', "")
}

// ---------------------------------------------------------------------------
// Account scope
// ---------------------------------------------------------------------------

fn sanitize_scope(value: &str) -> String {
    let mut cleaned = String::with_capacity(value.len());
    let mut last_dash = false;
    for ch in value.trim().to_lowercase().chars() {
        if ch.is_ascii_alphanumeric() || ch == '.' || ch == '_' || ch == '-' {
            cleaned.push(ch);
            last_dash = false;
        } else if !last_dash {
            cleaned.push('-');
            last_dash = true;
        }
    }
    let cleaned: String = cleaned
        .trim_matches(|c| c == '-' || c == '.' || c == '_')
        .chars()
        .take(64)
        .collect();
    cleaned
}

/// Stable account namespace for storage/routing.
///
/// Priority: explicit preferred scope, then a deterministic twelve-hex
/// digest of the API key, then a static fallback tag.
pub fn derive_account_scope(api_key: &str, preferred_scope: &str) -> String {
    let manual = sanitize_scope(preferred_scope);
    if !manual.is_empty() {
        return manual;
    }
    let key = api_key.trim();
    if key.is_empty() {
        return "acct-unknown".to_string();
    }
    let digest = hex::encode(Sha256::digest(key.as_bytes()));
    format!("acct-{}", &digest[..12])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> SymbolInfo {
        SymbolInfo {
            symbol: "BTCUSDT".to_string(),
            min_qty: 0.001,
            qty_step: 0.001,
            price_step: 0.1,
            price_precision: 1,
            qty_precision: 3,
            min_notional: 5.0,
        }
    }

    #[test]
    fn price_snaps_to_tick() {
        let i = info();
        assert_eq!(round_price(50_000.04, &i), 50_000.0);
        assert_eq!(round_price(50_000.06, &i), 50_000.1);
    }

    #[test]
    fn qty_floors_to_lot() {
        let i = info();
        assert_eq!(round_qty(0.0019, &i), 0.001);
        assert_eq!(round_qty(0.0021, &i), 0.002);
    }

    #[test]
    fn symbol_round_trip() {
        assert_eq!(to_unified_symbol("BTCUSDT"), "BTC/USDT:USDT");
        assert_eq!(to_raw_symbol("BTC/USDT:USDT"), "BTCUSDT");
        assert_eq!(to_raw_symbol(&to_unified_symbol("SOLUSDT")), "SOLUSDT");
    }

    #[test]
    fn account_scope_prefers_manual_then_digest() {
        assert_eq!(derive_account_scope("key", "Main Account!"), "main-account");
        let derived = derive_account_scope("my-api-key", "");
        assert!(derived.starts_with("acct-"));
        assert_eq!(derived.len(), "acct-".len() + 12);
        // Deterministic.
        assert_eq!(derived, derive_account_scope("my-api-key", ""));
        assert_eq!(derive_account_scope("", ""), "acct-unknown");
    }
}
