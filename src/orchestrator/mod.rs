// =============================================================================
// Grid Runner — multi-pair short grid orchestrator
// =============================================================================
//
// Runs N grid traders over shared combined WebSocket connections.
//
// Risk controls:
//   per symbol  — max layers, circuit breaker, notional cap
//   portfolio   — max_total_notional across all pairs
//
// Lifecycle:
//   startup  — sync exchange positions into grid state, adopt orphans
//   running  — drain intent queues, execute, confirm fills, reconcile truth
//   shutdown — cancel open orders, optionally close positions, verify flat

pub mod orders;
pub mod persistence;
pub mod telemetry;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{error, info, warn};

use crate::exchange::{to_raw_symbol, to_unified_symbol, ExchangeExecutor};
use crate::grid::GridTrader;
use crate::market_data;
use crate::runtime_config::RunnerConfig;
use crate::signals::SecondBucketFlow;
use crate::store::StateStore;
use crate::types::{now_ts, StopSignal};

pub use telemetry::StrategyEvent;

pub type TraderHandle = Arc<RwLock<GridTrader>>;

/// Fire-and-forget entry being tracked until fill/cancel.
#[derive(Debug, Clone)]
pub(crate) struct PendingEntry {
    pub symbol: String,
    pub layer_idx: usize,
    pub ref_price: f64,
    pub qty: f64,
    pub ts: f64,
    pub last_amend_ts: f64,
    pub amend_count: u32,
}

/// Resting take-profit order state for one symbol.
#[derive(Debug, Clone, Default)]
pub(crate) struct RestingTp {
    pub order_id: Option<String>,
    pub all_order_ids: Vec<String>,
    pub price: f64,
    pub qty: f64,
    pub ts: f64,
    pub placing: bool,
}

/// A position owned by the external position-management service, monitored
/// here and closed through its HTTP API instead of the exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualPosition {
    pub id: String,
    /// Unified symbol, e.g. "BTC/USDT:USDT".
    pub symbol: String,
    pub side: String,
    pub entry_price: f64,
    pub quantity: f64,
    pub notional: f64,
}

/// Ring capacity for buffered strategy events.
const EVENT_BUFFER_CAP: usize = 20_000;

/// Multi-pair grid trading orchestrator (one instance per account).
pub struct GridRunner {
    pub config: RunnerConfig,
    pub executor: Option<Arc<dyn ExchangeExecutor>>,
    pub store: StateStore,
    pub user_scope: String,
    pub session_id: String,

    pub(crate) traders: RwLock<HashMap<String, TraderHandle>>,
    /// Per-symbol total notional mirror, summed for the portfolio check.
    pub(crate) notional_cache: RwLock<HashMap<String, f64>>,

    pub(crate) start_time: Mutex<f64>,
    pub(crate) shutting_down: AtomicBool,
    babysitter_enabled: AtomicBool,
    pub(crate) orders_ready: Notify,

    pub(crate) pending_entries: RwLock<HashMap<String, PendingEntry>>,
    pub(crate) active_entry_orders: RwLock<HashMap<String, String>>,
    pub(crate) resting_tp_orders: RwLock<HashMap<String, RestingTp>>,
    /// Order ids already driven to a terminal state (at-least-once dedup).
    pub(crate) settled_orders: Mutex<VecDeque<String>>,

    pub(crate) global_flow: Mutex<SecondBucketFlow>,
    pub(crate) symbol_last_trade_ts: RwLock<HashMap<String, f64>>,
    pub(crate) price_cache: RwLock<HashMap<String, (f64, i64)>>,

    pub(crate) event_buffer: Mutex<VecDeque<StrategyEvent>>,
    pub(crate) event_seq: AtomicU64,
    pub(crate) last_prune_ts: Mutex<f64>,

    pub(crate) virtual_positions: RwLock<HashMap<String, VirtualPosition>>,
    pub(crate) http: reqwest::Client,
}

impl GridRunner {
    pub fn new(
        config: RunnerConfig,
        executor: Option<Arc<dyn ExchangeExecutor>>,
        store: StateStore,
        user_scope: String,
    ) -> Arc<Self> {
        let session_id = if config.session_id.is_empty() {
            chrono::Utc::now().format("%Y%m%d_%H%M%S").to_string()
        } else {
            config.session_id.clone()
        };
        let babysitter = config.babysitter_enabled;
        Arc::new(Self {
            config,
            executor,
            store,
            user_scope,
            session_id,
            traders: RwLock::new(HashMap::new()),
            notional_cache: RwLock::new(HashMap::new()),
            start_time: Mutex::new(0.0),
            shutting_down: AtomicBool::new(false),
            babysitter_enabled: AtomicBool::new(babysitter),
            orders_ready: Notify::new(),
            pending_entries: RwLock::new(HashMap::new()),
            active_entry_orders: RwLock::new(HashMap::new()),
            resting_tp_orders: RwLock::new(HashMap::new()),
            settled_orders: Mutex::new(VecDeque::with_capacity(256)),
            global_flow: Mutex::new(SecondBucketFlow::new(600)),
            symbol_last_trade_ts: RwLock::new(HashMap::new()),
            price_cache: RwLock::new(HashMap::new()),
            event_buffer: Mutex::new(VecDeque::with_capacity(EVENT_BUFFER_CAP)),
            event_seq: AtomicU64::new(0),
            last_prune_ts: Mutex::new(0.0),
            virtual_positions: RwLock::new(HashMap::new()),
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .build()
                .expect("failed to build reqwest client"),
        })
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub fn set_babysitter_enabled(&self, enabled: bool, source: &str) {
        self.babysitter_enabled.store(enabled, Ordering::SeqCst);
        info!(enabled, source, "babysitter toggled");
    }

    pub fn babysitter_enabled(&self) -> bool {
        self.babysitter_enabled.load(Ordering::SeqCst)
    }

    pub fn trader(&self, symbol: &str) -> Option<TraderHandle> {
        self.traders.read().get(symbol).cloned()
    }

    // ── Portfolio ───────────────────────────────────────────────────────

    /// Total notional across all active positions.
    pub fn portfolio_total_notional(&self) -> f64 {
        self.notional_cache.read().values().sum()
    }

    /// Can `additional_notional` be added without breaching the cap?
    pub fn portfolio_check(&self, additional_notional: f64) -> bool {
        self.portfolio_total_notional() + additional_notional <= self.config.max_total_notional
    }

    pub(crate) fn update_notional_cache(&self, symbol: &str, total_notional: f64) {
        self.notional_cache
            .write()
            .insert(symbol.to_string(), total_notional);
    }

    // ── Market-data dispatch ────────────────────────────────────────────

    /// Route one combined-stream frame to the owning trader.
    pub fn dispatch_frame(&self, raw: &str) {
        let Ok(msg) = serde_json::from_str::<serde_json::Value>(raw) else {
            return;
        };
        let stream = msg["stream"].as_str().unwrap_or_default();
        let payload = if msg["data"].is_object() { &msg["data"] } else { &msg };

        let Some((symbol_key, channel)) = stream.split_once('@') else {
            return;
        };
        let symbol = symbol_key.to_uppercase();
        let Some(trader) = self.trader(&symbol) else {
            return;
        };
        let now = now_ts();

        match channel {
            "bookTicker" => {
                let bid = json_f64(&payload["b"]);
                let ask = json_f64(&payload["a"]);
                let bid_qty = json_f64(&payload["B"]);
                let ask_qty = json_f64(&payload["A"]);
                let ts = payload["E"].as_f64().unwrap_or(now * 1000.0) / 1000.0;

                let total_notional = {
                    let mut guard = trader.write();
                    guard.on_book(bid, ask, bid_qty, ask_qty, ts);
                    guard.total_notional
                };
                self.update_notional_cache(&symbol, total_notional);

                // Latest mid for the shared price cache (flushed on a tick).
                if bid > 0.0 && ask > 0.0 {
                    let mid = (bid + ask) / 2.0;
                    self.price_cache
                        .write()
                        .insert(symbol.clone(), (mid, (now * 1000.0) as i64));
                }
            }
            "aggTrade" => {
                let price = json_f64(&payload["p"]);
                let qty = json_f64(&payload["q"]);
                let is_buyer_maker = payload["m"].as_bool().unwrap_or(false);
                let ts = payload["E"].as_f64().unwrap_or(now * 1000.0) / 1000.0;

                self.global_flow.lock().add(ts, qty, price, is_buyer_maker);
                self.symbol_last_trade_ts.write().insert(symbol.clone(), ts);
                trader.write().on_trade(price, qty, is_buyer_maker, ts);
            }
            _ => {}
        }
    }

    /// Global market-speed context across all streamed symbols.
    pub(crate) fn global_flow_snapshot(&self, now: f64) -> BTreeMap<String, f64> {
        // Bound the activity map so it cannot grow over a long run.
        {
            let mut map = self.symbol_last_trade_ts.write();
            map.retain(|_, last_ts| now - *last_ts <= 1200.0);
        }
        let mut snap = self.global_flow.lock().snapshot(now, "global_");

        let (mut active_1s, mut active_5s, mut active_60s) = (0u32, 0u32, 0u32);
        for last_ts in self.symbol_last_trade_ts.read().values() {
            let age = now - last_ts;
            if age <= 1.0 {
                active_1s += 1;
            }
            if age <= 5.0 {
                active_5s += 1;
            }
            if age <= 60.0 {
                active_60s += 1;
            }
        }

        let tps_1s = snap.get("global_tps_1s").copied().unwrap_or(0.0);
        let tps_5s = snap.get("global_tps_5s").copied().unwrap_or(0.0);
        let tps_10s = snap.get("global_tps_10s").copied().unwrap_or(0.0);
        let tps_60s = snap.get("global_tps_60s").copied().unwrap_or(0.0);

        snap.insert("global_active_symbols_1s".to_string(), active_1s as f64);
        snap.insert("global_active_symbols_5s".to_string(), active_5s as f64);
        snap.insert("global_active_symbols_60s".to_string(), active_60s as f64);
        snap.insert(
            "global_speed_ratio_1s_10s".to_string(),
            tps_1s / tps_10s.max(1e-9),
        );
        snap.insert(
            "global_speed_ratio_5s_60s".to_string(),
            tps_5s / tps_60s.max(1e-9),
        );
        snap
    }

    // ── Trader factory ──────────────────────────────────────────────────

    /// Construct a trader with the runner's capabilities wired in and its
    /// persisted state seeded from the store.
    pub async fn spawn_trader(self: &Arc<Self>, symbol: &str) -> TraderHandle {
        let symbol = symbol.to_uppercase();
        let cfg = self.config.grid_config(&symbol);
        let mut trader = GridTrader::new(cfg, now_ts());

        let weak = Arc::downgrade(self);
        trader.set_portfolio_check(Arc::new(move |additional| {
            weak.upgrade()
                .map(|r| r.portfolio_check(additional))
                .unwrap_or(false)
        }));

        let weak = Arc::downgrade(self);
        trader.set_order_notify(Arc::new(move || {
            if let Some(r) = weak.upgrade() {
                r.orders_ready.notify_one();
            }
        }));

        let weak = Arc::downgrade(self);
        let sym_for_snapshot = symbol.clone();
        trader.set_external_snapshot_provider(Arc::new(move || {
            let Some(r) = weak.upgrade() else {
                return BTreeMap::new();
            };
            let now = now_ts();
            let mut snap = r.global_flow_snapshot(now);
            let last_ts = r
                .symbol_last_trade_ts
                .read()
                .get(&sym_for_snapshot)
                .copied()
                .unwrap_or(0.0);
            let idle_sec = if last_ts > 0.0 { (now - last_ts).max(0.0) } else { 9999.0 };
            snap.insert("symbol_idle_sec".to_string(), idle_sec);
            snap.insert(
                "symbol_active_1s".to_string(),
                if idle_sec <= 1.0 { 1.0 } else { 0.0 },
            );
            snap.insert(
                "symbol_active_5s".to_string(),
                if idle_sec <= 5.0 { 1.0 } else { 0.0 },
            );
            snap
        }));

        let weak = Arc::downgrade(self);
        trader.set_event_sink(Arc::new(move |record| {
            if let Some(r) = weak.upgrade() {
                r.strategy_event_sink(record);
            }
        }));

        let handle: TraderHandle = Arc::new(RwLock::new(trader));
        self.seed_trader_state(&symbol, &handle).await;
        self.traders.write().insert(symbol.clone(), handle.clone());
        handle
    }

    // ── Startup position sync ───────────────────────────────────────────

    /// Fetch exchange positions and reconstruct grid state so a restart
    /// resumes exactly where the last session stopped.
    /// Returns newly adopted orphan symbols.
    pub async fn sync_live_positions(self: &Arc<Self>) -> Vec<String> {
        let mut adopted: Vec<String> = Vec::new();
        let Some(executor) = self.executor.clone() else {
            return adopted;
        };

        let positions = executor.get_positions().await;
        let now = now_ts();

        if positions.is_empty() {
            info!("no existing positions to sync");
            let traders: Vec<(String, TraderHandle)> = self
                .traders
                .read()
                .iter()
                .map(|(s, t)| (s.clone(), t.clone()))
                .collect();
            for (symbol, trader) in traders {
                let had_layers = {
                    let mut guard = trader.write();
                    if guard.layers.is_empty() {
                        false
                    } else {
                        guard.sync_with_exchange_position(0.0, 0.0, "startup_sync_flat", 0, now);
                        true
                    }
                };
                if had_layers {
                    self.update_notional_cache(&symbol, 0.0);
                    self.persist_runtime_state(&symbol, &trader).await;
                }
            }
            return adopted;
        }

        let mut synced = 0usize;
        for (unified, pos) in &positions {
            let raw = to_raw_symbol(unified);
            if pos.side != "short" || pos.contracts <= 0.0 || pos.entry_price <= 0.0 {
                warn!(symbol = %raw, side = %pos.side, "existing position is not a short — skipping");
                continue;
            }

            if self.trader(&raw).is_none() {
                if !self.config.adopt_orphan_positions {
                    warn!(symbol = %raw, contracts = pos.contracts, "orphan position not adopted (disabled)");
                    continue;
                }
                let handle = self.spawn_trader(&raw).await;
                if self.config.orphan_recovery_only {
                    // Pin adopted orphans to recovery-only mode regardless of
                    // what the restored snapshot carried.
                    handle.write().set_entry_enabled(false, "orphan_adopt");
                }
                adopted.push(raw.clone());
                warn!(symbol = %raw, contracts = pos.contracts, "adopted orphan short into recovery management");
            }

            let trader = self.trader(&raw).expect("trader just ensured");
            let kept = {
                let guard = trader.read();
                telemetry::layers_match_exchange(&guard, pos.contracts, pos.entry_price)
            };
            if kept {
                synced += 1;
                info!(
                    symbol = %raw,
                    layers = trader.read().layers.len(),
                    contracts = pos.contracts,
                    entry = pos.entry_price,
                    "runtime context kept (matches exchange)"
                );
            } else {
                // Exchange truth wins over a stale or divergent local stack.
                // Estimate the layer count so inverse TP activates sanely.
                let est_layers = self.estimate_layer_count(pos.notional).await;
                trader.write().sync_with_exchange_position(
                    pos.contracts,
                    pos.entry_price,
                    "startup_sync",
                    est_layers,
                    now,
                );
                synced += 1;
                info!(
                    symbol = %raw,
                    contracts = pos.contracts,
                    entry = pos.entry_price,
                    est_layers,
                    upnl = pos.unrealized_pnl,
                    "synced from exchange"
                );
            }
            let total = trader.read().total_notional;
            self.update_notional_cache(&raw, total);
            self.persist_runtime_state(&raw, &trader).await;
        }

        // Clear stale local layers that no longer exist on the exchange.
        let short_symbols: std::collections::HashSet<String> = positions
            .iter()
            .filter(|(_, p)| p.side == "short" && p.contracts > 0.0 && p.entry_price > 0.0)
            .map(|(unified, _)| to_raw_symbol(unified))
            .collect();
        let traders: Vec<(String, TraderHandle)> = self
            .traders
            .read()
            .iter()
            .map(|(s, t)| (s.clone(), t.clone()))
            .collect();
        for (symbol, trader) in traders {
            if short_symbols.contains(&symbol) {
                continue;
            }
            let had_layers = {
                let mut guard = trader.write();
                if guard.layers.is_empty() {
                    false
                } else {
                    guard.sync_with_exchange_position(0.0, 0.0, "startup_sync_flat", 0, now);
                    true
                }
            };
            if had_layers {
                self.update_notional_cache(&symbol, 0.0);
                self.persist_runtime_state(&symbol, &trader).await;
            }
        }

        if synced > 0 {
            info!(synced, "existing positions synced into grid state");
        }
        adopted
    }

    /// Adopt a PMS virtual position: exit-only monitoring, closes routed to
    /// the PMS HTTP API instead of the exchange.
    pub async fn register_virtual_position(self: &Arc<Self>, vp: VirtualPosition) -> bool {
        if vp.entry_price <= 0.0 || vp.quantity <= 0.0 || vp.id.is_empty() {
            return false;
        }
        let raw = to_raw_symbol(&vp.symbol);

        // A real exchange position on this symbol takes precedence.
        if let Some(trader) = self.trader(&raw) {
            if !trader.read().layers.is_empty() && self.virtual_positions.read().get(&raw).is_none()
            {
                info!(symbol = %raw, "symbol already holds live layers — tracking id only");
                self.virtual_positions.write().insert(raw, vp);
                return false;
            }
        }

        if self.trader(&raw).is_none() {
            let handle = self.spawn_trader(&raw).await;
            handle.write().set_entry_enabled(false, "virtual_adopt");
        }
        let trader = self.trader(&raw).expect("trader just ensured");
        let est_layers = self.estimate_layer_count(vp.notional).await;
        trader.write().sync_with_exchange_position(
            vp.quantity,
            vp.entry_price,
            "virtual_pms",
            est_layers,
            now_ts(),
        );
        let total = trader.read().total_notional;
        self.update_notional_cache(&raw, total);

        info!(
            symbol = %raw,
            qty = vp.quantity,
            entry = vp.entry_price,
            notional = format!("{:.2}", vp.notional),
            id = &vp.id[..vp.id.len().min(8)],
            "adopted virtual position"
        );
        self.virtual_positions.write().insert(raw, vp);
        true
    }

    // ── Reconciliation ──────────────────────────────────────────────────

    /// Periodic truth sync: when local state diverges from the exchange,
    /// adopt exchange state. A flat exchange side always wins.
    pub async fn reconcile_positions_once(self: &Arc<Self>) {
        let Some(executor) = self.executor.clone() else {
            return;
        };
        if self.is_shutting_down() || !self.babysitter_enabled() {
            return;
        }

        let positions = executor.get_positions().await;
        let now = now_ts();
        let traders: Vec<(String, TraderHandle)> = self
            .traders
            .read()
            .iter()
            .map(|(s, t)| (s.clone(), t.clone()))
            .collect();

        for (symbol, trader) in traders {
            // Virtual positions reconcile against the PMS, not the exchange.
            if self.virtual_positions.read().contains_key(&symbol) {
                continue;
            }
            let (local_qty, local_entry, pending) = {
                let guard = trader.read();
                (
                    if guard.layers.is_empty() { 0.0 } else { guard.total_qty },
                    guard.avg_entry_price,
                    guard.is_pending(),
                )
            };
            // In-flight orders are transient states — skip.
            if pending {
                continue;
            }

            let unified = to_unified_symbol(&symbol);
            let (ex_qty, ex_entry) = positions
                .get(&unified)
                .filter(|p| p.side == "short" && p.contracts > 0.0 && p.entry_price > 0.0)
                .map(|p| (p.contracts, p.entry_price))
                .unwrap_or((0.0, 0.0));

            let qty_tol = (0.02 * local_qty.max(ex_qty)).max(1e-6);
            let qty_mismatch = (local_qty - ex_qty).abs() > qty_tol;
            let entry_mismatch = ex_qty > 0.0
                && local_qty > 0.0
                && local_entry > 0.0
                && (local_entry - ex_entry).abs() / ex_entry > 0.01;

            if !qty_mismatch && !entry_mismatch {
                continue;
            }

            warn!(
                symbol = %symbol,
                local_qty,
                ex_qty,
                ex_entry,
                "reconcile drift detected — adopting exchange truth"
            );
            trader
                .write()
                .sync_with_exchange_position(ex_qty, ex_entry, "reconcile", 0, now);
            let total = trader.read().total_notional;
            self.update_notional_cache(&symbol, total);
            self.persist_runtime_state(&symbol, &trader).await;
        }
    }

    async fn reconcile_loop(self: Arc<Self>, stop: StopSignal) {
        while !stop.is_set() {
            if stop.sleep_interruptible(2.0).await {
                break;
            }
            if self.is_shutting_down() {
                break;
            }
            self.reconcile_positions_once().await;
        }
    }

    /// Force one trader to match exchange truth for its symbol.
    pub(crate) async fn sync_trader_from_exchange(
        self: &Arc<Self>,
        symbol: &str,
        trader: &TraderHandle,
        source: &str,
    ) {
        let Some(executor) = self.executor.clone() else {
            return;
        };
        let positions = executor.get_positions().await;
        let unified = to_unified_symbol(symbol);
        let (qty, entry) = positions
            .get(&unified)
            .filter(|p| p.side == "short" && p.contracts > 0.0 && p.entry_price > 0.0)
            .map(|p| (p.contracts, p.entry_price))
            .unwrap_or((0.0, 0.0));
        trader
            .write()
            .sync_with_exchange_position(qty, entry, source, 0, now_ts());
        let total = trader.read().total_notional;
        self.update_notional_cache(symbol, total);
        self.persist_runtime_state(symbol, trader).await;
    }

    // ── Pair scanning & rotation ────────────────────────────────────────

    /// Scan the futures universe for the hottest USDT pairs by 24h move.
    pub async fn scan_pairs(&self) -> Vec<String> {
        let fallback = vec![
            "BTCUSDT".to_string(),
            "ETHUSDT".to_string(),
            "SOLUSDT".to_string(),
            "BNBUSDT".to_string(),
            "XRPUSDT".to_string(),
        ];
        let url = "https://fapi.binance.com/fapi/v1/ticker/24hr";
        let body: Vec<serde_json::Value> = match self.http.get(url).send().await {
            Ok(resp) => match resp.json().await {
                Ok(v) => v,
                Err(e) => {
                    error!(error = %e, "scanner parse failed");
                    return fallback;
                }
            },
            Err(e) => {
                error!(error = %e, "scanner request failed");
                return fallback;
            }
        };

        let mut movers: Vec<(String, f64)> = body
            .iter()
            .filter_map(|t| {
                let symbol = t["symbol"].as_str()?.to_uppercase();
                if !symbol.ends_with("USDT") {
                    return None;
                }
                let change: f64 = t["priceChangePercent"].as_str()?.parse().ok()?;
                Some((symbol, change.abs()))
            })
            .filter(|(symbol, change)| {
                *change >= self.config.min_change_pct
                    && !self.config.blacklist.iter().any(|b| b == symbol)
            })
            .collect();
        movers.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        movers.truncate(self.config.top_n);

        if movers.is_empty() {
            return fallback;
        }
        movers.into_iter().map(|(s, _)| s).collect()
    }

    /// Periodically rescan hot pairs: add new symbols, drop cold flat ones.
    async fn pair_rotation_loop(self: Arc<Self>, stop: StopSignal) {
        let interval = self.config.rotation_interval_sec;
        if interval <= 0.0 {
            return;
        }

        while !stop.is_set() {
            if stop.sleep_interruptible(interval).await {
                break;
            }
            if self.is_shutting_down() {
                break;
            }

            let fresh = self.scan_pairs().await;
            if fresh.is_empty() {
                continue;
            }
            let fresh_set: std::collections::HashSet<&String> = fresh.iter().collect();
            let current: Vec<String> = self.traders.read().keys().cloned().collect();

            // Cold symbols to drop — only when completely inactive, so
            // session stats and working positions survive rotation.
            let mut dropped = Vec::new();
            for sym in current.iter().filter(|s| !fresh_set.contains(s)) {
                let Some(trader) = self.trader(sym) else { continue };
                let guard = trader.read();
                if !guard.layers.is_empty() || guard.total_trades > 0 {
                    continue;
                }
                drop(guard);
                if self.active_entry_orders.read().contains_key(sym) {
                    continue;
                }
                if self.resting_tp_orders.read().contains_key(sym) {
                    continue;
                }
                self.traders.write().remove(sym);
                self.notional_cache.write().remove(sym);
                self.symbol_last_trade_ts.write().remove(sym);
                dropped.push(sym.clone());
            }

            // New symbols to add.
            let mut added = Vec::new();
            for sym in fresh.iter().filter(|s| !current.contains(*s)) {
                self.spawn_trader(sym).await;
                if let Some(executor) = &self.executor {
                    if let Err(e) = executor.set_leverage(sym, 1).await {
                        warn!(symbol = %sym, error = %e, "set_leverage failed");
                    }
                }
                added.push(sym.clone());
            }

            // A fresh connection serves the rotated-in batch.
            if !added.is_empty() {
                tokio::spawn(market_data::run_combined_stream(
                    Arc::clone(&self),
                    added.clone(),
                    stop.clone(),
                ));
            }

            if !added.is_empty() || !dropped.is_empty() {
                info!(
                    added = added.len(),
                    dropped = dropped.len(),
                    active = self.traders.read().len(),
                    "pair rotation applied"
                );
            } else {
                info!(active = self.traders.read().len(), "pair rotation: no changes");
            }
        }
    }

    // ── Price cache flush ───────────────────────────────────────────────

    async fn price_flush_loop(self: Arc<Self>, stop: StopSignal) {
        while !stop.is_set() {
            if stop.sleep_interruptible(1.0).await {
                break;
            }
            let snapshot: Vec<(String, (f64, i64))> = self
                .price_cache
                .write()
                .drain()
                .collect();
            for (symbol, (mark, ts_ms)) in snapshot {
                self.store.set_price(&symbol, mark, ts_ms).await;
            }
        }
    }

    // ── Status aggregation ──────────────────────────────────────────────

    /// Read-only per-symbol status map for the dashboard and HTTP bridge.
    pub fn get_all_status(&self) -> BTreeMap<String, crate::grid::telemetry::GridStatus> {
        let now = now_ts();
        self.traders
            .read()
            .iter()
            .map(|(symbol, trader)| (symbol.clone(), trader.read().status(now)))
            .collect()
    }

    // ── Graceful shutdown ───────────────────────────────────────────────

    /// Shutdown sequence: stop accepting orders, cancel everything resting,
    /// then either keep or market-close every tracked position and verify.
    pub async fn graceful_shutdown(self: &Arc<Self>) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let Some(executor) = self.executor.clone() else {
            return;
        };
        info!("shutdown sequence started");

        // Cancel all fire-and-forget pending entries.
        let entries: Vec<(String, String)> = self
            .pending_entries
            .write()
            .drain()
            .map(|(oid, e)| (oid, e.symbol))
            .collect();
        for (oid, symbol) in &entries {
            executor.cancel_order(oid, symbol).await;
            if let Some(trader) = self.trader(symbol) {
                trader.write().clear_pending();
            }
        }
        self.active_entry_orders.write().clear();
        if !entries.is_empty() {
            info!(count = entries.len(), "pending entries cancelled");
        }

        // Cancel all resting TP slices.
        let tps: Vec<(String, RestingTp)> = self.resting_tp_orders.write().drain().collect();
        for (symbol, tp) in &tps {
            for oid in tp.all_order_ids.iter().chain(tp.order_id.iter()) {
                executor.cancel_order(oid, symbol).await;
            }
        }
        if !tps.is_empty() {
            info!(count = tps.len(), "resting TP orders cancelled");
        }

        // Tracked orders, then belt-and-suspenders per-symbol cancel-all.
        let cancelled = executor.cancel_all_tracked_orders().await;
        if cancelled > 0 {
            info!(cancelled, "tracked open orders cancelled");
        }
        let symbols: Vec<String> = self.traders.read().keys().cloned().collect();
        for sym in &symbols {
            let n = executor.cancel_all_symbol_orders(sym).await;
            if n > 0 {
                info!(symbol = %sym, n, "resting orders cancelled");
            }
        }

        let positions = executor.get_positions().await;
        let tracked: HashMap<String, String> = symbols
            .iter()
            .map(|s| (to_unified_symbol(s), s.clone()))
            .collect();

        if self.config.keep_positions {
            let open: Vec<&String> = positions
                .iter()
                .filter(|(u, p)| tracked.contains_key(*u) && p.contracts > 0.0)
                .map(|(u, _)| u)
                .collect();
            if open.is_empty() {
                info!("no open positions to keep");
            } else {
                info!(count = open.len(), "keeping positions open (keep_positions)");
            }
            return;
        }

        // Market-close every tracked short (blacklist excluded).
        let mut closed = 0usize;
        let now = now_ts();
        for (unified, pos) in &positions {
            let Some(raw) = tracked.get(unified) else { continue };
            if self.config.blacklist.iter().any(|b| b == raw) {
                info!(symbol = %raw, "skipping blacklisted symbol at shutdown");
                continue;
            }
            if pos.contracts <= 0.0 || pos.side != "short" {
                continue;
            }
            info!(symbol = %raw, contracts = pos.contracts, upnl = pos.unrealized_pnl, "closing position");
            match executor.market_buy(raw, pos.contracts).await {
                Some(fill) => {
                    if let Some(trader) = self.trader(raw) {
                        let mut guard = trader.write();
                        if !guard.layers.is_empty() {
                            guard.on_external_close_fill(fill.avg_price, fill.fee, "shutdown", now);
                        }
                    }
                    self.update_notional_cache(raw, 0.0);
                    closed += 1;
                }
                None => {
                    error!(symbol = %raw, "failed to close position — manual intervention needed");
                }
            }
        }

        // Verify flat; close any orphans from race conditions.
        let positions = executor.get_positions().await;
        let mut remaining: Vec<(&String, f64)> = positions
            .iter()
            .filter(|(u, p)| tracked.contains_key(*u) && p.contracts > 0.0)
            .map(|(u, p)| (tracked.get(u).expect("tracked"), p.contracts))
            .collect();
        if !remaining.is_empty() {
            warn!(count = remaining.len(), "orphans after close pass — closing again");
            for (raw, contracts) in &remaining {
                executor.market_buy(raw, *contracts).await;
            }
            let positions = executor.get_positions().await;
            remaining = positions
                .iter()
                .filter(|(u, p)| tracked.contains_key(*u) && p.contracts > 0.0)
                .map(|(u, p)| (tracked.get(u).expect("tracked"), p.contracts))
                .collect();
        }

        if remaining.is_empty() {
            info!(closed, "all tracked positions flat");
        } else {
            error!(count = remaining.len(), "positions still open after shutdown");
        }
    }

    // ── Main entry point ────────────────────────────────────────────────

    pub async fn run(self: Arc<Self>, stop: StopSignal) {
        *self.start_time.lock() = now_ts();

        // Resolve the symbol universe.
        let mut symbols: Vec<String> = if self.config.symbols.is_empty() {
            self.scan_pairs().await
        } else {
            self.config
                .symbols
                .iter()
                .map(|s| s.to_uppercase())
                .collect()
        };
        symbols.retain(|s| !self.config.blacklist.iter().any(|b| b == s));
        if symbols.is_empty() {
            error!("no symbols to trade");
            return;
        }

        info!(
            symbols = symbols.len(),
            scope = %self.user_scope,
            session = %self.session_id,
            portfolio_cap = self.config.max_total_notional,
            babysitter = self.babysitter_enabled(),
            "starting grid traders"
        );

        // Leverage 1x across the board.
        if let Some(executor) = &self.executor {
            for sym in &symbols {
                if let Err(e) = executor.set_leverage(sym, 1).await {
                    warn!(symbol = %sym, error = %e, "set_leverage failed");
                }
            }
        }

        for sym in &symbols {
            self.spawn_trader(sym).await;
        }

        // Grid sizing persisted for layer estimation on future restarts.
        self.persist_session_config().await;

        // Sync existing exchange positions into grid state.
        if self.executor.is_some() {
            let adopted = self.sync_live_positions().await;
            for sym in adopted {
                if !symbols.contains(&sym) {
                    if let Some(executor) = &self.executor {
                        let _ = executor.set_leverage(&sym, 1).await;
                    }
                    symbols.push(sym);
                }
            }
        }

        // Register the user-data-stream fill callback.
        if let Some(executor) = self.executor.clone() {
            let weak = Arc::downgrade(&self);
            executor.set_order_update_handler(Arc::new(move |order_id, status, fill| {
                if let Some(runner) = weak.upgrade() {
                    let order_id = order_id.to_string();
                    tokio::spawn(async move {
                        runner.handle_order_update(order_id, status, fill).await;
                    });
                }
            }));
            if let Err(e) = executor.start_user_stream().await {
                error!(error = %e, "user stream failed to start");
            }
        }

        // Long-running tasks.
        let mut tasks = Vec::new();
        for chunk in symbols.chunks(market_data::SYMBOLS_PER_CONNECTION) {
            tasks.push(tokio::spawn(market_data::run_combined_stream(
                Arc::clone(&self),
                chunk.to_vec(),
                stop.clone(),
            )));
        }
        tasks.push(tokio::spawn(Arc::clone(&self).order_loop(stop.clone())));
        tasks.push(tokio::spawn(Arc::clone(&self).reconcile_loop(stop.clone())));
        tasks.push(tokio::spawn(
            Arc::clone(&self).manage_resting_entries(stop.clone()),
        ));
        tasks.push(tokio::spawn(
            Arc::clone(&self).manage_resting_tp_orders(stop.clone()),
        ));
        tasks.push(tokio::spawn(
            Arc::clone(&self).persistence_loop(stop.clone()),
        ));
        tasks.push(tokio::spawn(Arc::clone(&self).price_flush_loop(stop.clone())));
        tasks.push(tokio::spawn(Arc::clone(&self).display_loop(stop.clone())));
        if self.config.rotation_interval_sec > 0.0 && self.config.symbols.is_empty() {
            tasks.push(tokio::spawn(
                Arc::clone(&self).pair_rotation_loop(stop.clone()),
            ));
        }

        stop.wait().await;

        if self.executor.is_some() {
            self.graceful_shutdown().await;
        }
        self.persist_all_states_once().await;
        self.flush_strategy_events_once().await;

        for task in &tasks {
            task.abort();
        }
        self.final_summary();
    }
}

pub(crate) fn json_f64(v: &serde_json::Value) -> f64 {
    v.as_str()
        .and_then(|s| s.parse().ok())
        .or_else(|| v.as_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_runner() -> Arc<GridRunner> {
        let config = RunnerConfig {
            symbols: vec!["BTCUSDT".to_string()],
            vol_drift_enabled: false,
            ..Default::default()
        };
        GridRunner::new(config, None, StateStore::disabled("acct-test"), "acct-test".to_string())
    }

    #[tokio::test]
    async fn portfolio_check_uses_cached_totals() {
        let runner = test_runner();
        runner.update_notional_cache("BTCUSDT", 295.0);
        assert!(!runner.portfolio_check(8.0));
        assert!(runner.portfolio_check(5.0));
        runner.update_notional_cache("BTCUSDT", 0.0);
        assert!(runner.portfolio_check(8.0));
    }

    #[tokio::test]
    async fn dispatch_routes_book_and_trade_frames() {
        let runner = test_runner();
        runner.spawn_trader("BTCUSDT").await;

        let book = serde_json::json!({
            "stream": "btcusdt@bookTicker",
            "data": { "b": "50000.0", "a": "50005.0", "B": "3.0", "A": "2.0", "E": 1_700_000_000_000u64 }
        });
        runner.dispatch_frame(&book.to_string());
        let trader = runner.trader("BTCUSDT").unwrap();
        {
            let guard = trader.read();
            assert_eq!(guard.bid, 50_000.0);
            assert_eq!(guard.ask, 50_005.0);
        }
        // Mid landed in the shared price cache.
        assert!(runner.price_cache.read().contains_key("BTCUSDT"));

        let trade = serde_json::json!({
            "stream": "btcusdt@aggTrade",
            "data": { "p": "50002.0", "q": "0.5", "m": true, "E": 1_700_000_000_100u64 }
        });
        runner.dispatch_frame(&trade.to_string());
        assert!(runner.symbol_last_trade_ts.read().contains_key("BTCUSDT"));

        // Unknown symbols are ignored without error.
        let other = serde_json::json!({
            "stream": "dogeusdt@aggTrade",
            "data": { "p": "0.1", "q": "10", "m": false, "E": 1u64 }
        });
        runner.dispatch_frame(&other.to_string());
    }

    #[tokio::test]
    async fn virtual_position_registration_adopts_symbol() {
        let runner = test_runner();
        let adopted = runner
            .register_virtual_position(VirtualPosition {
                id: "vp-123456".to_string(),
                symbol: "DOGE/USDT:USDT".to_string(),
                side: "short".to_string(),
                entry_price: 0.25,
                quantity: 100.0,
                notional: 25.0,
            })
            .await;
        assert!(adopted);
        let trader = runner.trader("DOGEUSDT").unwrap();
        let guard = trader.read();
        assert!(!guard.layers.is_empty());
        assert!(!guard.entry_enabled());
        assert!(runner.virtual_positions.read().contains_key("DOGEUSDT"));
    }
}
