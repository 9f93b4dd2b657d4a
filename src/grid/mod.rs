// =============================================================================
// Grid Trader — per-symbol short grid strategy state machine
// =============================================================================
//
// Sells into pumps at geometrically-spaced levels, buys back when price
// mean-reverts. One order at a time: `pending_order` blocks every gate until
// the orchestrator confirms a fill or the watchdog clears the flag.
//
// Life-cycle per tick (on_book):
//   depth buckets → waterfall ring → signals → vol regime → spread median →
//   pending watchdog → exit check | entry check → averaging check
//
// The trader never talks to the exchange itself. It enqueues `OrderIntent`s
// and the orchestrator owns execution and fill confirmation.

pub mod dynamics;
pub mod edge;
pub mod fills;
pub mod recovery;
pub mod telemetry;

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::signals::micro::{EntryThresholds, ExitReason, ExitThresholds};
use crate::signals::MicroSignals;
use crate::volatility::{VolatilityCalibrator, VolatilityConfig, VolatilitySnapshot};

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Exit strategy mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TpMode {
    Auto,
    Fast,
    Vol,
    LongShort,
}

impl Default for TpMode {
    fn default() -> Self {
        Self::Auto
    }
}

/// Configuration for one grid trader instance.
#[derive(Debug, Clone)]
pub struct GridConfig {
    pub symbol: String,

    // Fee structure (account's actual rates, as fractions).
    pub maker_fee: f64,
    pub taker_fee: f64,

    // Grid sizing.
    pub min_notional: f64,
    pub max_notional: f64,
    pub max_layers: usize,
    pub spacing_growth: f64,
    pub size_growth: f64,
    /// Auto-calibrated from spread/vol when 0.
    pub base_spacing_bps: f64,
    /// Price-rise scale for spacing boost (0 = off).
    pub trend_spacing_scale: f64,

    // Volatility calibration.
    pub vol: VolatilityConfig,
    pub vol_tail_cooldown_sec: f64,

    // Entry filters.
    pub min_spread_bps: f64,
    pub max_spread_bps: f64,
    /// Base min gap between entries; the behavior adapter can increase it.
    pub cooldown_sec: f64,
    pub warmup_sec: f64,
    pub resume_context_rewarm_sec: f64,

    // Signal thresholds.
    pub pump_threshold: f64,
    pub exhaust_threshold: f64,
    pub max_trend_bps: f64,
    pub max_trend_30s_bps: f64,
    pub max_buy_ratio: f64,

    // Exit targets.
    pub tp_spread_mult: f64,
    pub min_tp_profit_bps: f64,
    pub tp_decay_half_life_min: f64,
    pub tp_decay_floor: f64,
    pub tp_vol_capture_ratio: f64,
    pub tp_vol_scale_cap: f64,
    pub tp_mode: TpMode,
    pub fast_tp_ti: f64,
    pub min_fast_tp_bps: f64,
    /// 0 disables the hard stop; drawdowns are held and averaged.
    pub stop_loss_bps: f64,

    // Edge model.
    pub min_edge_bps: f64,
    pub edge_signal_slope_bps: f64,
    pub edge_exec_buffer_bps: f64,
    pub edge_default_slippage_bps: f64,
    pub edge_uncertainty_z: f64,
    pub edge_min_samples: usize,

    // Per-symbol notional cap (0 = disabled).
    pub max_symbol_notional: f64,

    // Inverse grid TP.
    pub inverse_tp_enabled: bool,
    pub inverse_tp_min_layers: usize,
    pub inverse_tp_max_zones: usize,
    pub inverse_tp_time_cap_sec: f64,

    // Waterfall protection.
    pub waterfall_vol_threshold: f64,
    pub waterfall_decay_sec: f64,

    // Recovery accounting.
    pub recovery_debt_enabled: bool,
    pub recovery_paydown_ratio: f64,
    pub recovery_max_paydown_bps: f64,
    pub recovery_debt_cap_usd: f64,
    pub recovery_avg_enabled: bool,
    pub recovery_avg_min_unrealized_bps: f64,
    pub recovery_avg_min_hurdle_improve_bps: f64,
    pub recovery_avg_cooldown_sec: f64,
    pub recovery_avg_max_adds_per_hour: usize,

    // Stealth order spreading.
    pub stealth_max_l1_fraction: f64,
    pub stealth_max_ticks: usize,
    pub stealth_always_split: bool,
    pub stealth_min_slices: usize,
    pub stealth_max_slices: usize,

    // Risk.
    pub max_loss_bps: f64,
    pub circuit_pause_sec: f64,
    pub loss_cooldown_sec: f64,
    pub dynamic_behavior_enabled: bool,
    pub behavior_lookback: usize,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            symbol: "BTCUSDT".to_string(),
            maker_fee: 0.000252,
            taker_fee: 0.000336,
            min_notional: 6.0,
            max_notional: 30.0,
            max_layers: 8,
            spacing_growth: 1.6,
            size_growth: 1.0,
            base_spacing_bps: 0.0,
            trend_spacing_scale: 5.0,
            vol: VolatilityConfig::default(),
            vol_tail_cooldown_sec: 20.0,
            min_spread_bps: 5.0,
            max_spread_bps: 40.0,
            cooldown_sec: 2.0,
            warmup_sec: 30.0,
            resume_context_rewarm_sec: 30.0,
            pump_threshold: 2.0,
            exhaust_threshold: 1.0,
            max_trend_bps: 5.0,
            max_trend_30s_bps: 30.0,
            max_buy_ratio: 1.0,
            tp_spread_mult: 1.2,
            min_tp_profit_bps: 10.0,
            tp_decay_half_life_min: 0.0,
            tp_decay_floor: 0.5,
            tp_vol_capture_ratio: 0.15,
            tp_vol_scale_cap: 50.0,
            tp_mode: TpMode::Auto,
            fast_tp_ti: -0.25,
            min_fast_tp_bps: -10.0,
            stop_loss_bps: 0.0,
            min_edge_bps: 2.0,
            edge_signal_slope_bps: 1.0,
            edge_exec_buffer_bps: 0.3,
            edge_default_slippage_bps: 0.5,
            edge_uncertainty_z: 0.75,
            edge_min_samples: 5,
            max_symbol_notional: 0.0,
            inverse_tp_enabled: true,
            inverse_tp_min_layers: 3,
            inverse_tp_max_zones: 5,
            inverse_tp_time_cap_sec: 1800.0,
            waterfall_vol_threshold: 3.0,
            waterfall_decay_sec: 30.0,
            recovery_debt_enabled: true,
            recovery_paydown_ratio: 0.25,
            recovery_max_paydown_bps: 25.0,
            recovery_debt_cap_usd: 75.0,
            recovery_avg_enabled: true,
            recovery_avg_min_unrealized_bps: 35.0,
            recovery_avg_min_hurdle_improve_bps: 0.75,
            recovery_avg_cooldown_sec: 20.0,
            recovery_avg_max_adds_per_hour: 8,
            stealth_max_l1_fraction: 0.5,
            stealth_max_ticks: 5,
            stealth_always_split: true,
            stealth_min_slices: 2,
            stealth_max_slices: 5,
            max_loss_bps: 500.0,
            circuit_pause_sec: 120.0,
            loss_cooldown_sec: 8.0,
            dynamic_behavior_enabled: true,
            behavior_lookback: 120,
        }
    }
}

// ---------------------------------------------------------------------------
// Grid layer
// ---------------------------------------------------------------------------

/// One short entry in the grid. Immutable once constructed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridLayer {
    /// Entry price (fill price in live mode).
    pub price: f64,
    /// Position size in base asset.
    pub qty: f64,
    /// USD value at entry.
    pub notional: f64,
    pub entry_ts: f64,
    /// 0-based layer index.
    pub layer_idx: usize,
    #[serde(default)]
    pub order_id: String,
    /// Actual fee paid (0 when unknown; estimated from the fee schedule).
    #[serde(default)]
    pub fee: f64,
    /// Signal snapshot captured at entry time.
    #[serde(default)]
    pub entry_signals: BTreeMap<String, f64>,
}

// ---------------------------------------------------------------------------
// Order intents
// ---------------------------------------------------------------------------

/// One order intent enqueued by the trader, consumed by the orchestrator.
#[derive(Debug, Clone)]
pub enum OrderIntent {
    /// Open or average a short.
    Sell {
        symbol: String,
        qty: f64,
        layer_idx: usize,
        ref_price: f64,
    },
    /// Close (full or partial).
    Buy {
        symbol: String,
        qty: f64,
        reason: String,
        n_layers: usize,
        est_pnl_bps: f64,
        est_pnl_usd: f64,
        bid: f64,
        ask: f64,
        signal_ts: f64,
        min_net_bps: f64,
        partial_tp: bool,
        /// Zone index for inverse-TP partials; -1 otherwise.
        inverse_tp_zone: i32,
    },
}

// ---------------------------------------------------------------------------
// Behavior samples
// ---------------------------------------------------------------------------

/// Gap between consecutive sell fills (for churn detection).
#[derive(Debug, Clone, Copy)]
pub struct FillGap {
    pub gap_sec: f64,
    pub gap_bps: f64,
}

/// One completed close, kept for behavioral adaptation.
#[derive(Debug, Clone)]
pub struct CloseBehavior {
    pub net_usd: f64,
    pub net_bps: f64,
    pub reason: String,
    pub layers: usize,
    pub notional: f64,
}

/// Last computed edge-gate breakdown, kept for telemetry.
#[derive(Debug, Clone, Default)]
pub struct EdgeSnapshot {
    pub context: &'static str,
    pub tp_target_bps: f64,
    pub signal_strength: f64,
    pub signal_bonus_bps: f64,
    pub expected_cost_bps: f64,
    pub uncertainty_bps: f64,
    pub expected_edge_bps: f64,
    pub edge_lcb_bps: f64,
    pub required_edge_bps: f64,
    pub slippage_est_bps: f64,
    pub trend_penalty_bps: f64,
    pub spread_risk_bps: f64,
    pub projected_notional: f64,
}

/// Last recovery-averaging guardrail decision, kept for diagnostics.
#[derive(Debug, Clone, Default)]
pub struct RecoveryAvgSnapshot {
    pub ok: bool,
    pub reason: &'static str,
    pub hurdle_now_bps: f64,
    pub hurdle_next_bps: f64,
    pub hurdle_improve_bps: f64,
    pub unrealized_bps: f64,
    pub adds_1h: usize,
}

// ---------------------------------------------------------------------------
// Callbacks (capability objects injected by the orchestrator)
// ---------------------------------------------------------------------------

pub type PortfolioCheck = Arc<dyn Fn(f64) -> bool + Send + Sync>;
pub type OrderNotify = Arc<dyn Fn() + Send + Sync>;
pub type SnapshotProvider = Arc<dyn Fn() -> BTreeMap<String, f64> + Send + Sync>;
pub type EventSink = Arc<dyn Fn(telemetry::TradeEventRecord) + Send + Sync>;

// ---------------------------------------------------------------------------
// Grid trader
// ---------------------------------------------------------------------------

/// Pending-order watchdog: auto-clear the flag after this many seconds.
const PENDING_ORDER_TIMEOUT_SEC: f64 = 10.0;
/// Averaging-gate diagnostics are logged at most this often per symbol.
const AVG_DIAG_INTERVAL_SEC: f64 = 10.0;

/// Per-symbol short grid trader.
pub struct GridTrader {
    pub config: GridConfig,
    pub symbol: String,

    pub signals: MicroSignals,
    pub(crate) vol_calibrator: Arc<VolatilityCalibrator>,
    pub(crate) vol_snapshot: VolatilitySnapshot,

    // Book state.
    pub bid: f64,
    pub ask: f64,
    pub bid_qty: f64,
    pub ask_qty: f64,
    pub mid: f64,
    pub last_book_ts: f64,

    // Rolling min L1 depth (60 s window) for stealth sizing.
    pub min_bid_qty_1m: f64,
    pub min_ask_qty_1m: f64,
    pub(crate) bid_qty_samples: VecDeque<(f64, f64)>,
    pub(crate) ask_qty_samples: VecDeque<(f64, f64)>,

    // Spread tracking for calibration.
    pub(crate) spread_history: VecDeque<f64>,
    pub(crate) median_spread_bps: f64,
    pub(crate) last_spread_calc_ts: f64,
    pub(crate) layer_cooldown_until: f64,
    pub(crate) last_tail_log_ts: f64,

    // Grid state.
    pub layers: Vec<GridLayer>,
    pub avg_entry_price: f64,
    pub total_qty: f64,
    pub total_notional: f64,

    // Tracking.
    pub start_ts: f64,
    pub realized_pnl: f64,
    pub realized_pnl_bps: f64,
    pub total_trades: u64,
    pub wins: u64,
    pub total_fees: f64,
    pub last_entry_ts: f64,
    pub last_entry_price: f64,
    pub(crate) circuit_breaker_ts: f64,
    pub(crate) cooldown_until: f64,
    pub(crate) trade_count_for_cooldown: u32,

    // Behavior history.
    pub(crate) recent_sell_fill_gaps: VecDeque<FillGap>,
    pub(crate) recent_close_behaviors: VecDeque<CloseBehavior>,
    pub(crate) recent_exit_slippage_bps: VecDeque<f64>,
    pub(crate) recent_close_prices: VecDeque<f64>,
    pub(crate) last_edge_snapshot: EdgeSnapshot,
    pub(crate) last_recovery_avg_snapshot: RecoveryAvgSnapshot,

    // Waterfall tracking: rolling 30 s high price.
    pub(crate) price_30s_high: crate::signals::rolling::PriceRing,
    pub(crate) waterfall_peak_ts: f64,

    // Recovery.
    pub recovery_debt_usd: f64,
    pub(crate) entry_enabled: bool,
    pub adoption_ts: f64,
    pub(crate) session_rpnl: f64,
    pub(crate) session_trades: u64,
    pub(crate) session_closed_notional: f64,
    pub(crate) hist_rpnl_per_hour: f64,
    pub(crate) hist_trade_count: u64,
    pub last_recovery_add_ts: f64,
    pub(crate) recovery_add_events: VecDeque<f64>,
    pub(crate) resume_rewarm_until: f64,
    pub(crate) last_runtime_restore_ts: f64,

    // Inverse grid TP state.
    pub(crate) inverse_tp_active: bool,
    pub(crate) inverse_tp_zones: Vec<f64>,
    pub(crate) inverse_tp_next_idx: usize,
    pub(crate) inverse_tp_start_ts: f64,
    pub(crate) inverse_tp_layers_at_start: usize,
    pub(crate) inverse_tp_avg_entry: f64,

    // One order at a time.
    pub(crate) pending_order: bool,
    pub(crate) pending_order_ts: f64,
    pub(crate) pending_exit: bool,
    pub(crate) order_queue: Vec<OrderIntent>,
    pub(crate) avg_diag_last_ts: f64,

    // Capabilities injected by the orchestrator.
    pub(crate) portfolio_check: Option<PortfolioCheck>,
    pub(crate) order_notify: Option<OrderNotify>,
    pub(crate) external_snapshot_provider: Option<SnapshotProvider>,
    pub(crate) event_sink: Option<EventSink>,
}

impl GridTrader {
    pub fn new(config: GridConfig, start_ts: f64) -> Self {
        let hist_n = config.behavior_lookback.max(20);
        let symbol = config.symbol.clone();
        let vol_calibrator = Arc::new(VolatilityCalibrator::new(symbol.clone(), config.vol.clone()));
        Self {
            symbol,
            signals: MicroSignals::new(),
            vol_calibrator,
            vol_snapshot: VolatilitySnapshot::default(),
            bid: 0.0,
            ask: 0.0,
            bid_qty: 0.0,
            ask_qty: 0.0,
            mid: 0.0,
            last_book_ts: 0.0,
            min_bid_qty_1m: 0.0,
            min_ask_qty_1m: 0.0,
            bid_qty_samples: VecDeque::with_capacity(600),
            ask_qty_samples: VecDeque::with_capacity(600),
            spread_history: VecDeque::with_capacity(500),
            median_spread_bps: 0.0,
            last_spread_calc_ts: 0.0,
            layer_cooldown_until: 0.0,
            last_tail_log_ts: 0.0,
            layers: Vec::new(),
            avg_entry_price: 0.0,
            total_qty: 0.0,
            total_notional: 0.0,
            start_ts,
            realized_pnl: 0.0,
            realized_pnl_bps: 0.0,
            total_trades: 0,
            wins: 0,
            total_fees: 0.0,
            last_entry_ts: 0.0,
            last_entry_price: 0.0,
            circuit_breaker_ts: 0.0,
            cooldown_until: 0.0,
            trade_count_for_cooldown: 0,
            recent_sell_fill_gaps: VecDeque::with_capacity(hist_n),
            recent_close_behaviors: VecDeque::with_capacity(hist_n),
            recent_exit_slippage_bps: VecDeque::with_capacity(hist_n),
            recent_close_prices: VecDeque::with_capacity(5),
            last_edge_snapshot: EdgeSnapshot::default(),
            last_recovery_avg_snapshot: RecoveryAvgSnapshot::default(),
            price_30s_high: crate::signals::rolling::PriceRing::new(300),
            waterfall_peak_ts: 0.0,
            recovery_debt_usd: 0.0,
            entry_enabled: true,
            adoption_ts: start_ts,
            session_rpnl: 0.0,
            session_trades: 0,
            session_closed_notional: 0.0,
            hist_rpnl_per_hour: 0.0,
            hist_trade_count: 0,
            last_recovery_add_ts: 0.0,
            recovery_add_events: VecDeque::with_capacity(64),
            resume_rewarm_until: 0.0,
            last_runtime_restore_ts: 0.0,
            inverse_tp_active: false,
            inverse_tp_zones: Vec::new(),
            inverse_tp_next_idx: 0,
            inverse_tp_start_ts: 0.0,
            inverse_tp_layers_at_start: 0,
            inverse_tp_avg_entry: 0.0,
            pending_order: false,
            pending_order_ts: 0.0,
            pending_exit: false,
            order_queue: Vec::new(),
            avg_diag_last_ts: 0.0,
            portfolio_check: None,
            order_notify: None,
            external_snapshot_provider: None,
            event_sink: None,
            config,
        }
    }

    pub fn set_portfolio_check(&mut self, check: PortfolioCheck) {
        self.portfolio_check = Some(check);
    }

    pub fn set_order_notify(&mut self, notify: OrderNotify) {
        self.order_notify = Some(notify);
    }

    pub fn set_external_snapshot_provider(&mut self, provider: SnapshotProvider) {
        self.external_snapshot_provider = Some(provider);
    }

    pub fn set_event_sink(&mut self, sink: EventSink) {
        self.event_sink = Some(sink);
    }

    pub fn is_pending(&self) -> bool {
        self.pending_order || self.pending_exit
    }

    pub fn inverse_tp_active(&self) -> bool {
        self.inverse_tp_active
    }

    pub fn median_spread_bps(&self) -> f64 {
        self.median_spread_bps
    }

    pub fn entry_enabled(&self) -> bool {
        self.entry_enabled
    }

    // ─── Book updates ───────────────────────────────────────────────────

    /// Process an L1 book update. Main event-loop driver.
    pub fn on_book(&mut self, bid: f64, ask: f64, bid_qty: f64, ask_qty: f64, ts: f64) {
        self.bid = bid;
        self.ask = ask;
        self.bid_qty = bid_qty;
        self.ask_qty = ask_qty;
        self.mid = if bid > 0.0 && ask > 0.0 { (bid + ask) / 2.0 } else { 0.0 };
        self.last_book_ts = ts;

        // Rolling min L1 depth (60 s window) for stealth sizing.
        if bid_qty > 0.0 {
            self.bid_qty_samples.push_back((ts, bid_qty));
        }
        if ask_qty > 0.0 {
            self.ask_qty_samples.push_back((ts, ask_qty));
        }
        let cutoff = ts - 60.0;
        while self.bid_qty_samples.front().is_some_and(|&(t, _)| t < cutoff) {
            self.bid_qty_samples.pop_front();
        }
        while self.ask_qty_samples.front().is_some_and(|&(t, _)| t < cutoff) {
            self.ask_qty_samples.pop_front();
        }
        self.min_bid_qty_1m = self
            .bid_qty_samples
            .iter()
            .map(|&(_, q)| q)
            .fold(f64::INFINITY, f64::min);
        if !self.min_bid_qty_1m.is_finite() {
            self.min_bid_qty_1m = bid_qty;
        }
        self.min_ask_qty_1m = self
            .ask_qty_samples
            .iter()
            .map(|&(_, q)| q)
            .fold(f64::INFINITY, f64::min);
        if !self.min_ask_qty_1m.is_finite() {
            self.min_ask_qty_1m = ask_qty;
        }

        if self.mid <= 0.0 {
            return;
        }

        // Rolling 30 s high for waterfall detection; peak ts is the latest
        // timestamp of the max price in the window.
        self.price_30s_high.push(ts, self.mid);
        self.price_30s_high.evict_before(ts - 30.0);
        if let Some((_, peak_ts)) = self.price_30s_high.high_with_ts() {
            self.waterfall_peak_ts = peak_ts;
        }

        // Feed signals + volatility regime.
        self.signals.on_book(bid, ask, bid_qty, ask_qty, ts);
        self.update_vol_regime(ts);

        // Track spread; recompute the median every 2 s once calibrated.
        let spread_bps = (ask - bid) / self.mid * 10_000.0;
        if self.spread_history.len() == 500 {
            self.spread_history.pop_front();
        }
        self.spread_history.push_back(spread_bps);
        if ts - self.last_spread_calc_ts > 2.0 && self.spread_history.len() > 10 {
            self.median_spread_bps = median(self.spread_history.iter().copied());
            self.last_spread_calc_ts = ts;
        }

        // Pending-order watchdog: auto-reset after a stall.
        if self.pending_order
            && self.pending_order_ts > 0.0
            && ts - self.pending_order_ts > PENDING_ORDER_TIMEOUT_SEC
        {
            warn!(symbol = %self.symbol, "pending_order watchdog fired — auto-resetting");
            self.pending_order = false;
            self.pending_order_ts = 0.0;
        }
        if self.pending_order || self.pending_exit {
            return;
        }

        // Main logic.
        if !self.layers.is_empty() {
            self.check_exit(ts);
        } else {
            self.check_entry(ts, spread_bps);
        }

        // Averaging (add more layers) under the adaptive cap.
        if !self.layers.is_empty()
            && self.layers.len() < self.dynamic_max_layers()
            && !self.pending_order
        {
            self.check_averaging(ts, spread_bps);
        }
    }

    /// Process an aggTrade event — feeds microstructure signals.
    pub fn on_trade(&mut self, price: f64, qty: f64, is_buyer_maker: bool, ts: f64) {
        self.signals.on_trade(price, qty, is_buyer_maker, ts);
    }

    // ─── Persistent quoting helpers ─────────────────────────────────────

    /// Is the entry signal that triggered a resting order still active?
    /// The resting-entry manager keeps or reaps orders based on this.
    pub fn signal_still_valid(&self) -> bool {
        if !self.signals.is_warm() {
            return false;
        }
        if self.signals.pump_score <= 1.0 {
            return false;
        }
        self.signals.ret_2s_bps() <= self.config.max_trend_bps
    }

    /// Current optimal TP buy price for a resting TP order (0 if none).
    ///
    /// While inverse-TP is active this rests at the NEXT zone target below
    /// the frozen average entry instead of the normal TP price.
    pub fn tp_price(&self) -> f64 {
        if self.layers.is_empty() || self.bid <= 0.0 {
            return 0.0;
        }
        if self.inverse_tp_active && self.inverse_tp_next_idx < self.inverse_tp_zones.len() {
            let zone_bps = self.inverse_tp_zones[self.inverse_tp_next_idx];
            return self.inverse_tp_avg_entry * (1.0 - zone_bps / 10_000.0);
        }
        let tp_bps = self.tp_target_bps(self.last_book_ts);
        self.avg_entry_price * (1.0 - tp_bps / 10_000.0)
    }

    // ─── Entry logic ────────────────────────────────────────────────────

    /// Check conditions for the initial short entry (signal-based).
    fn check_entry(&mut self, now: f64, spread_bps: f64) {
        if !self.entry_enabled || now < self.resume_rewarm_until {
            return;
        }
        if !self.layers.is_empty() || self.pending_order {
            return;
        }
        if now - self.start_ts < self.config.warmup_sec {
            return;
        }
        if !self.can_trade(now) {
            return;
        }
        // Median spread must be calibrated.
        if self.median_spread_bps <= 0.0 {
            return;
        }
        // Adaptive cooldown reacts to churn and near-zero close pressure.
        if now - self.last_entry_ts < self.dynamic_entry_cooldown_sec() {
            return;
        }
        // Waterfall guard: skip entry on a vol-relative drawdown.
        if self.waterfall_score(now) > self.config.waterfall_vol_threshold {
            return;
        }

        let sig = self.signals.entry_signal(&EntryThresholds {
            pump: self.config.pump_threshold,
            exhaust: self.config.exhaust_threshold,
            min_spread_bps: self.config.min_spread_bps,
            max_spread_bps: self.config.max_spread_bps,
            max_trend_bps: self.config.max_trend_bps,
            max_trend_30s_bps: self.config.max_trend_30s_bps,
            max_buy_ratio: self.config.max_buy_ratio,
        });
        if !sig.should_enter {
            return;
        }

        // Vol-normalized sizing, scaled by spread width.
        let spread_scale = self.spread_scaled_notional(spread_bps);
        let notional = self.signals.position_size(
            spread_scale,
            self.config.min_notional,
            self.config.max_notional,
        );

        let price = self.ask;
        if price <= 0.0 {
            return;
        }
        let qty = notional / price;
        let actual_notional = price * qty;

        let cap = self.symbol_notional_cap();
        if cap > 0.0 && actual_notional > cap {
            return;
        }

        // Cost-aware expected-edge gate (LCB).
        if !self.has_sufficient_edge(sig.signal_strength, spread_bps, actual_notional, "entry") {
            return;
        }

        // Portfolio-level cap check on the projected notional.
        if let Some(check) = &self.portfolio_check {
            if !check(actual_notional) {
                return;
            }
        }

        // Block immediately — one order at a time.
        self.pending_order = true;
        self.pending_order_ts = now;
        self.enqueue_order(OrderIntent::Sell {
            symbol: self.symbol.clone(),
            qty,
            layer_idx: 0,
            ref_price: price,
        });

        info!(
            symbol = %self.symbol,
            price,
            notional = actual_notional,
            pump = sig.pump,
            exhaust = sig.exhaust,
            "entry intent queued (L0)"
        );
    }

    // ─── Averaging logic ────────────────────────────────────────────────

    /// Add another short layer if price has risen enough against us.
    ///
    /// Gates run in a fixed order; the first blocker is surfaced through a
    /// throttled diagnostic line (at most once per 10 s per symbol).
    fn check_averaging(&mut self, now: f64, spread_bps: f64) {
        if self.layers.is_empty() {
            return;
        }

        let should_diag = now - self.avg_diag_last_ts >= AVG_DIAG_INTERVAL_SEC;
        let n = self.layers.len();

        let block_reason: Option<String> = if now < self.resume_rewarm_until {
            Some("rewarm".to_string())
        } else if self.pending_order {
            Some("pending_order".to_string())
        } else if n >= self.dynamic_max_layers() {
            Some(format!("max_layers({n}/{})", self.dynamic_max_layers()))
        } else if !self.can_trade(now) {
            Some("circuit_breaker".to_string())
        } else if now < self.layer_cooldown_until {
            Some(format!("layer_cd({:.0}s)", self.layer_cooldown_until - now))
        } else if now - self.last_entry_ts < self.dynamic_entry_cooldown_sec() {
            Some(format!(
                "entry_cd({:.0}s)",
                self.dynamic_entry_cooldown_sec() - (now - self.last_entry_ts)
            ))
        } else {
            let required_spacing = self.required_spacing_bps();
            let price_rise_bps =
                (self.ask - self.avg_entry_price) / self.avg_entry_price * 10_000.0;
            if price_rise_bps < required_spacing {
                Some(format!(
                    "spacing(rise={price_rise_bps:.0}bp<req={required_spacing:.0}bp)"
                ))
            } else if spread_bps < self.averaging_min_spread() {
                Some(format!(
                    "spread({spread_bps:.1}<{:.1})",
                    self.averaging_min_spread()
                ))
            } else if self.last_entry_price > 0.0 {
                let price_diff_bps =
                    (self.ask - self.last_entry_price).abs() / self.last_entry_price * 10_000.0;
                if price_diff_bps < self.dynamic_layer_gap_bps() {
                    Some(format!(
                        "burst_guard({price_diff_bps:.0}<{:.0}bp)",
                        self.dynamic_layer_gap_bps()
                    ))
                } else {
                    None
                }
            } else {
                None
            }
        };

        if let Some(reason) = block_reason {
            if should_diag {
                self.avg_diag_last_ts = now;
                info!(
                    symbol = %self.symbol,
                    layers = n,
                    unrealized_bps = format!("{:.0}", self.unrealized_bps()),
                    spread_bps = format!("{spread_bps:.1}"),
                    blocked = %reason,
                    "averaging gate blocked"
                );
            }
            return;
        }

        // Passed fast gates — size the next layer and run the slow gates.
        let price = self.ask;
        let base_notional = self.spread_scaled_notional(spread_bps);
        let layer_notional =
            (base_notional * self.config.size_growth.powi(n as i32)).min(self.config.max_notional);
        let qty = layer_notional / price;
        let notional = price * qty;
        let projected_notional = self.total_notional + notional;

        let cap = self.symbol_notional_cap();
        if cap > 0.0 && projected_notional > cap {
            if should_diag {
                self.avg_diag_last_ts = now;
                info!(
                    symbol = %self.symbol,
                    layers = n,
                    projected = format!("{projected_notional:.0}"),
                    cap = format!("{cap:.0}"),
                    "averaging gate blocked: notional cap"
                );
            }
            return;
        }

        if !self.recovery_average_allowed(now, projected_notional) {
            if should_diag {
                self.avg_diag_last_ts = now;
                info!(
                    symbol = %self.symbol,
                    layers = n,
                    reason = self.last_recovery_avg_snapshot.reason,
                    unrealized_bps = format!("{:.0}", self.unrealized_bps()),
                    "averaging gate blocked: recovery guardrail"
                );
            }
            return;
        }

        // Marginal edge gate.
        let signal_strength =
            ((self.signals.pump_score + self.signals.exhaust_score) * 0.5).max(0.0);
        if !self.has_sufficient_edge(signal_strength, spread_bps, projected_notional, "average") {
            if should_diag {
                self.avg_diag_last_ts = now;
                info!(
                    symbol = %self.symbol,
                    layers = n,
                    edge_lcb = format!("{:.1}", self.last_edge_snapshot.edge_lcb_bps),
                    required = format!("{:.1}", self.last_edge_snapshot.required_edge_bps),
                    "averaging gate blocked: edge"
                );
            }
            return;
        }

        if let Some(check) = &self.portfolio_check {
            if !check(notional) {
                if should_diag {
                    self.avg_diag_last_ts = now;
                    info!(symbol = %self.symbol, layers = n, "averaging gate blocked: portfolio cap");
                }
                return;
            }
        }

        // All gates passed — fire the layer.
        self.pending_order = true;
        self.pending_order_ts = now;
        self.enqueue_order(OrderIntent::Sell {
            symbol: self.symbol.clone(),
            qty,
            layer_idx: n,
            ref_price: price,
        });

        info!(
            symbol = %self.symbol,
            layer = n,
            price,
            notional,
            spacing = format!("{:.1}", self.required_spacing_bps()),
            drift = format!("{:.2}", self.vol_snapshot.drift_mult),
            "averaging intent queued"
        );
    }

    /// Geometric spacing requirement for the next layer, trend-scaled.
    fn required_spacing_bps(&self) -> f64 {
        let n = self.layers.len();
        let base_spacing = self.base_spacing_bps();
        let eff_growth = self.effective_spacing_growth();
        let mut required = base_spacing * eff_growth.powi(n.saturating_sub(1) as i32);
        required = required.max(self.dynamic_layer_gap_bps());

        let price_rise_bps = (self.ask - self.avg_entry_price) / self.avg_entry_price * 10_000.0;
        if self.config.trend_spacing_scale > 0.0 && price_rise_bps > 0.0 {
            required *= 1.0 + price_rise_bps / self.config.trend_spacing_scale;
        }
        required
    }

    // ─── Exit logic ─────────────────────────────────────────────────────

    /// Check whether to close (signal TP / fast TP / stop).
    fn check_exit(&mut self, now: f64) {
        if self.layers.is_empty() || self.pending_exit || self.pending_order {
            return;
        }

        // Inverse grid TP owns the exit while active.
        if self.inverse_tp_active {
            self.check_inverse_tp(now);
            return;
        }

        let (net_pnl, net_pnl_bps) = self.estimate_close_pnl(self.ask);

        let exit_sig = self.signals.exit_signal(
            self.avg_entry_price,
            &ExitThresholds {
                tp_spread_mult: self.config.tp_spread_mult,
                fast_tp_ti: self.config.fast_tp_ti,
                min_fast_tp_bps: self.dynamic_min_fast_tp_bps(),
                min_tp_profit_bps: self.dynamic_min_tp_profit_bps(),
            },
        );

        if let Some(reason) = exit_sig.reason {
            // Vol mode suppresses fast_tp — wait for the wider target.
            if reason == ExitReason::FastTp && self.effective_tp_mode() == TpMode::Vol {
                return;
            }
            let mut min_exec_bps: f64 = 0.0;
            if reason == ExitReason::FastTp {
                // Avoid tiny "wins" that vanish before execution.
                min_exec_bps = (self.fee_floor_bps() * 0.2).max(1.0);
            }
            // Recovery ledger: profit must also repay part of realized losses.
            min_exec_bps = min_exec_bps.max(self.recovery_exit_hurdle_bps());

            // Strict executable-PnL gate at the ask.
            if net_pnl_bps < min_exec_bps {
                return;
            }

            // Multi-layer TP transitions into the inverse grid.
            if self.config.inverse_tp_enabled
                && reason == ExitReason::Tp
                && self.layers.len() >= self.config.inverse_tp_min_layers
            {
                self.activate_inverse_tp(now);
                return;
            }

            self.close_all(now, reason.as_str(), net_pnl, net_pnl_bps, min_exec_bps);
            return;
        }

        // Hard stop (disabled by default: stop_loss_bps == 0).
        if self.config.stop_loss_bps > 0.0 && net_pnl_bps < -self.config.stop_loss_bps {
            self.close_all(now, "stop", net_pnl, net_pnl_bps, 0.0);
        }
    }

    // ─── Inverse grid TP ────────────────────────────────────────────────

    /// Zone targets in bps below the frozen average entry, mirroring the
    /// entry grid spacing downward. Capped at `inverse_tp_max_zones`.
    fn compute_inverse_tp_zones(&self) -> Vec<f64> {
        let base = self.base_spacing_bps();
        let growth = self.effective_spacing_growth();
        let n_zones = self.layers.len().min(self.config.inverse_tp_max_zones);
        (0..n_zones).map(|i| base * growth.powi(i as i32)).collect()
    }

    fn activate_inverse_tp(&mut self, now: f64) {
        let zones = self.compute_inverse_tp_zones();
        self.inverse_tp_active = true;
        self.inverse_tp_zones = zones;
        self.inverse_tp_next_idx = 0;
        self.inverse_tp_start_ts = now;
        self.inverse_tp_layers_at_start = self.layers.len();
        self.inverse_tp_avg_entry = self.avg_entry_price;

        info!(
            symbol = %self.symbol,
            layers = self.layers.len(),
            zones = ?self.inverse_tp_zones.iter().map(|z| format!("{z:.0}")).collect::<Vec<_>>(),
            avg_entry = self.avg_entry_price,
            "inverse TP activated"
        );
        // The first zone may already be reached.
        self.check_inverse_tp(now);
    }

    /// Check if price has reached the next inverse-TP zone target.
    fn check_inverse_tp(&mut self, now: f64) {
        if self.layers.is_empty() || self.pending_order {
            return;
        }

        // Time cap: close everything when the unwind stalls.
        let elapsed = now - self.inverse_tp_start_ts;
        if elapsed > self.config.inverse_tp_time_cap_sec {
            let (net_pnl, net_pnl_bps) = self.estimate_close_pnl(self.ask);
            info!(
                symbol = %self.symbol,
                elapsed = format!("{elapsed:.0}"),
                layers = self.layers.len(),
                "inverse TP time cap — closing remaining"
            );
            self.inverse_tp_active = false;
            self.close_all(now, "inverse_tp_timeout", net_pnl, net_pnl_bps, 0.0);
            return;
        }

        // All zones exhausted — should already be flat, but close any rest.
        if self.inverse_tp_next_idx >= self.inverse_tp_zones.len() {
            if !self.layers.is_empty() {
                let (net_pnl, net_pnl_bps) = self.estimate_close_pnl(self.ask);
                self.inverse_tp_active = false;
                self.close_all(now, "inverse_tp_final", net_pnl, net_pnl_bps, 0.0);
            }
            return;
        }

        let zone_bps = self.inverse_tp_zones[self.inverse_tp_next_idx];
        let tp_price = self.inverse_tp_avg_entry * (1.0 - zone_bps / 10_000.0);

        // Closing (buying) a short: the bid must trade down to the target.
        if self.bid > 0.0 && self.bid <= tp_price {
            self.close_partial(now, self.inverse_tp_next_idx, zone_bps);
        }
    }

    /// FIFO layer batch to close at a given zone.
    pub(crate) fn inverse_tp_batch_len(&self, zone_idx: usize) -> usize {
        let n_zones = self.inverse_tp_zones.len();
        let n_layers = self.layers.len();
        if n_zones == 0 || n_layers == 0 {
            return 0;
        }
        if zone_idx + 1 >= n_zones {
            return n_layers;
        }
        let remaining_zones = n_zones - zone_idx;
        (n_layers / remaining_zones).max(1).min(n_layers)
    }

    /// Close a fraction of the position at an inverse-TP zone.
    fn close_partial(&mut self, now: f64, zone_idx: usize, zone_bps: f64) {
        let batch = self.inverse_tp_batch_len(zone_idx);
        if batch == 0 {
            return;
        }
        let n_layers = self.layers.len();
        let is_final = zone_idx + 1 >= self.inverse_tp_zones.len() || batch == n_layers;
        let close_layers = &self.layers[..batch];

        let close_qty: f64 = close_layers.iter().map(|l| l.qty).sum();
        let close_notional: f64 = close_layers.iter().map(|l| l.notional).sum();
        if close_qty <= 0.0 {
            return;
        }

        // Net PnL for the batch: oldest-layer entry fees plus a taker exit.
        let close_price = self.bid;
        let gross_pnl: f64 = close_layers
            .iter()
            .map(|l| (l.price - close_price) * l.qty)
            .sum();
        let entry_fees: f64 = close_layers
            .iter()
            .map(|l| if l.fee > 0.0 { l.fee } else { l.notional * self.config.maker_fee })
            .sum();
        let exit_fees = close_price * close_qty * self.config.taker_fee;
        let net_pnl = gross_pnl - entry_fees - exit_fees;
        let net_pnl_bps = if close_notional > 0.0 {
            net_pnl / close_notional * 10_000.0
        } else {
            0.0
        };

        info!(
            symbol = %self.symbol,
            zone = zone_idx,
            zone_bps = format!("{zone_bps:.0}"),
            closing = batch,
            of = n_layers,
            qty = close_qty,
            pnl_bps = format!("{net_pnl_bps:+.1}"),
            "inverse TP partial close queued"
        );

        self.pending_order = true;
        self.pending_order_ts = now;
        self.enqueue_order(OrderIntent::Buy {
            symbol: self.symbol.clone(),
            qty: close_qty,
            reason: "inverse_tp".to_string(),
            n_layers: batch,
            est_pnl_bps: net_pnl_bps,
            est_pnl_usd: net_pnl,
            bid: self.bid,
            ask: self.ask,
            signal_ts: now,
            min_net_bps: 0.0,
            partial_tp: !is_final,
            inverse_tp_zone: zone_idx as i32,
        });
    }

    /// Queue a full close of all layers.
    fn close_all(&mut self, now: f64, reason: &str, net_pnl: f64, net_pnl_bps: f64, min_net_bps: f64) {
        let n_layers = self.layers.len();

        // Block immediately — close also blocks new entries.
        self.pending_exit = true;
        self.pending_order = true;
        self.pending_order_ts = now;
        self.enqueue_order(OrderIntent::Buy {
            symbol: self.symbol.clone(),
            qty: self.total_qty,
            reason: reason.to_string(),
            n_layers,
            est_pnl_bps: net_pnl_bps,
            est_pnl_usd: net_pnl,
            bid: self.bid,
            ask: self.ask,
            signal_ts: now,
            min_net_bps,
            partial_tp: false,
            inverse_tp_zone: -1,
        });

        info!(
            symbol = %self.symbol,
            layers = n_layers,
            pnl_bps = format!("{net_pnl_bps:+.1}"),
            reason,
            "close intent queued"
        );
    }
}

/// Median of a float iterator (interpolated for even counts).
pub(crate) fn median(values: impl Iterator<Item = f64>) -> f64 {
    let mut v: Vec<f64> = values.collect();
    if v.is_empty() {
        return 0.0;
    }
    v.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = v.len() / 2;
    if v.len() % 2 == 1 {
        v[mid]
    } else {
        (v[mid - 1] + v[mid]) / 2.0
    }
}

#[cfg(test)]
mod tests;
