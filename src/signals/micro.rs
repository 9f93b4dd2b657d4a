// =============================================================================
// MicroSignals — per-symbol microstructure signal engine
// =============================================================================
//
// Computes from aggTrade + L1 book:
//   TI   = trade imbalance (rolling windows)
//   QI   = quote imbalance (L1)
//   MD   = micro-price displacement
//   pump = regime score (short-skew detection)
//   exhaust = flow exhaustion (entry trigger)
//   rv   = realized volatility (for sizing)
//
// Pure math, no I/O. Invalid or non-positive inputs are silently ignored and
// missing data degrades to neutral outputs.

use std::collections::BTreeMap;

use crate::signals::flow::SecondBucketFlow;
use crate::signals::rolling::{PriceRing, RollingQty, RollingRv};
use crate::signals::zscore::EmaZScore;

/// Throttle for delta-feature z-score updates (20 Hz).
const DELTA_THROTTLE_SEC: f64 = 0.05;

/// Entry gate thresholds, passed in from the grid config.
#[derive(Debug, Clone, Copy)]
pub struct EntryThresholds {
    pub pump: f64,
    pub exhaust: f64,
    pub min_spread_bps: f64,
    pub max_spread_bps: f64,
    pub max_trend_bps: f64,
    pub max_trend_30s_bps: f64,
    pub max_buy_ratio: f64,
}

/// Exit gate thresholds, passed in from the grid config.
#[derive(Debug, Clone, Copy)]
pub struct ExitThresholds {
    pub tp_spread_mult: f64,
    pub fast_tp_ti: f64,
    pub min_fast_tp_bps: f64,
    pub min_tp_profit_bps: f64,
}

/// Result of the entry gate.
#[derive(Debug, Clone, Copy, Default)]
pub struct EntrySignal {
    pub should_enter: bool,
    pub pump: f64,
    pub exhaust: f64,
    pub signal_strength: f64,
}

/// Why the exit gate fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Tp,
    FastTp,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tp => "tp",
            Self::FastTp => "fast_tp",
        }
    }
}

/// Result of the exit gate.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExitSignal {
    pub reason: Option<ExitReason>,
}

impl ExitSignal {
    pub fn should_exit(&self) -> bool {
        self.reason.is_some()
    }
}

/// Per-symbol microstructure signal engine.
///
/// Feed with `on_trade` / `on_book`; query with `entry_signal`,
/// `exit_signal`, `position_size`.
pub struct MicroSignals {
    // Rolling TI windows.
    ti_2s: RollingQty,
    ti_500ms: RollingQty,
    ti_300ms: RollingQty,

    // Previous values for delta computation.
    prev_ti_300ms: f64,
    prev_qi: f64,
    prev_ti_update_ts: f64,
    prev_qi_update_ts: f64,

    // Realized volatility (1 s log returns).
    rv: RollingRv,

    // Multi-timeframe flow metrics (bounded 10 m memory).
    flow: SecondBucketFlow,

    // L1 state.
    pub bid: f64,
    pub ask: f64,
    pub bid_qty: f64,
    pub ask_qty: f64,
    pub mid: f64,
    pub spread: f64,
    pub spread_bps: f64,

    // Price tracking for window returns.
    price_2s: PriceRing,
    price_30s: PriceRing,
    last_book_ts: f64,

    // Z-score trackers.
    z_ret_2s_tracker: EmaZScore,
    z_ti_2s_tracker: EmaZScore,
    z_md_2s_tracker: EmaZScore,
    z_neg_dti_tracker: EmaZScore,
    z_neg_dqi_tracker: EmaZScore,

    // Computed signals.
    pub ti_2s_val: f64,
    pub ti_500ms_val: f64,
    pub ti_300ms_val: f64,
    pub qi: f64,
    pub micro_price: f64,
    pub md: f64,

    pub z_ret_2s: f64,
    pub z_ti_2s: f64,
    pub z_md_2s: f64,
    pub z_neg_dti: f64,
    pub z_neg_dqi: f64,

    pub pump_score: f64,
    pub exhaust_score: f64,

    // Warmup counters.
    trade_count: u64,
    book_count: u64,
}

impl MicroSignals {
    pub fn new() -> Self {
        Self {
            ti_2s: RollingQty::new(2.0),
            ti_500ms: RollingQty::new(0.5),
            ti_300ms: RollingQty::new(0.3),
            prev_ti_300ms: 0.0,
            prev_qi: 0.0,
            prev_ti_update_ts: 0.0,
            prev_qi_update_ts: 0.0,
            rv: RollingRv::new(1.0),
            flow: SecondBucketFlow::new(600),
            bid: 0.0,
            ask: 0.0,
            bid_qty: 0.0,
            ask_qty: 0.0,
            mid: 0.0,
            spread: 0.0,
            spread_bps: 0.0,
            price_2s: PriceRing::new(200),
            price_30s: PriceRing::new(600),
            last_book_ts: 0.0,
            z_ret_2s_tracker: EmaZScore::new(5.0, 0.1, 5.0),
            z_ti_2s_tracker: EmaZScore::new(5.0, 0.1, 5.0),
            z_md_2s_tracker: EmaZScore::new(5.0, 0.1, 5.0),
            z_neg_dti_tracker: EmaZScore::new(3.0, 0.1, 5.0),
            z_neg_dqi_tracker: EmaZScore::new(3.0, 0.1, 5.0),
            ti_2s_val: 0.0,
            ti_500ms_val: 0.0,
            ti_300ms_val: 0.0,
            qi: 0.0,
            micro_price: 0.0,
            md: 0.0,
            z_ret_2s: 0.0,
            z_ti_2s: 0.0,
            z_md_2s: 0.0,
            z_neg_dti: 0.0,
            z_neg_dqi: 0.0,
            pump_score: 0.0,
            exhaust_score: 0.0,
            trade_count: 0,
            book_count: 0,
        }
    }

    // ── Feed methods ────────────────────────────────────────────────────

    /// Process an aggTrade event.
    ///
    /// `is_buyer_maker == true` means the seller was the taker, i.e. a
    /// sell-aggressor trade.
    pub fn on_trade(&mut self, price: f64, qty: f64, is_buyer_maker: bool, ts: f64) {
        if price <= 0.0 || qty <= 0.0 || ts <= 0.0 {
            return;
        }
        let is_sell = is_buyer_maker;

        self.ti_2s.add(ts, qty, is_sell);
        self.ti_500ms.add(ts, qty, is_sell);
        self.ti_300ms.add(ts, qty, is_sell);
        self.flow.add(ts, qty, price, is_sell);
        self.rv.add(ts, price);
        self.trade_count += 1;

        self.ti_2s_val = self.ti_2s.ti();
        self.ti_500ms_val = self.ti_500ms.ti();
        self.ti_300ms_val = self.ti_300ms.ti();

        // dTI (change in TI_300ms) for exhaust, throttled to 20 Hz.
        if ts - self.prev_ti_update_ts > DELTA_THROTTLE_SEC {
            let dti = self.ti_300ms_val - self.prev_ti_300ms;
            self.z_neg_dti = self.z_neg_dti_tracker.update(-dti);
            self.prev_ti_300ms = self.ti_300ms_val;
            self.prev_ti_update_ts = ts;
        }
    }

    /// Process an L1 book update. Recomputes QI, MD, composite scores.
    pub fn on_book(&mut self, bid: f64, ask: f64, bid_qty: f64, ask_qty: f64, ts: f64) {
        self.bid = bid;
        self.ask = ask;
        self.bid_qty = bid_qty;
        self.ask_qty = ask_qty;

        if bid <= 0.0 || ask <= 0.0 {
            return;
        }

        self.mid = (bid + ask) / 2.0;
        self.spread = ask - bid;
        self.spread_bps = if self.mid > 0.0 {
            self.spread / self.mid * 10_000.0
        } else {
            0.0
        };

        // Quote imbalance.
        let total_qty = bid_qty + ask_qty;
        self.qi = if total_qty > 1e-12 {
            (bid_qty - ask_qty) / total_qty
        } else {
            0.0
        };

        // Micro-price and displacement.
        if total_qty > 1e-12 && self.spread > 0.0 {
            self.micro_price = (ask * bid_qty + bid * ask_qty) / total_qty;
            self.md = (self.micro_price - self.mid) / self.spread;
        } else {
            self.micro_price = self.mid;
            self.md = 0.0;
        }

        // Track mid for 2s / 30s returns (evict by timestamp).
        self.price_2s.push(ts, self.mid);
        self.price_30s.push(ts, self.mid);
        self.price_2s.evict_before(ts - 2.5);
        self.price_30s.evict_before(ts - 31.0);
        self.last_book_ts = ts;

        let ret_2s = self.price_2s.ret_bps_since(ts - 2.0, self.mid);

        // Z-scores.
        self.z_ret_2s = self.z_ret_2s_tracker.update(ret_2s);
        self.z_ti_2s = self.z_ti_2s_tracker.update(self.ti_2s_val);
        self.z_md_2s = self.z_md_2s_tracker.update(self.md);

        // dQI for exhaust, throttled.
        if ts - self.prev_qi_update_ts > DELTA_THROTTLE_SEC {
            let dqi = self.qi - self.prev_qi;
            self.z_neg_dqi = self.z_neg_dqi_tracker.update(-dqi);
            self.prev_qi = self.qi;
            self.prev_qi_update_ts = ts;
        }

        // Pump = 0.4·z(ret_2s) + 0.8·z(TI_2s) + 0.6·z(MD_2s).
        self.pump_score = 0.4 * self.z_ret_2s + 0.8 * self.z_ti_2s + 0.6 * self.z_md_2s;

        // Exhaust = z(-dTI_300ms) + z(-dQI_300ms) + 1[MD < 0].
        let md_indicator = if self.md < 0.0 { 1.0 } else { 0.0 };
        self.exhaust_score = self.z_neg_dti + self.z_neg_dqi + md_indicator;

        self.book_count += 1;
    }

    // ── Helpers ─────────────────────────────────────────────────────────

    /// Current 2s mid return in bps.
    pub fn ret_2s_bps(&self) -> f64 {
        self.price_2s.ret_bps_since(self.last_book_ts - 2.0, self.mid)
    }

    /// Current 30s mid return in bps.
    pub fn ret_30s_bps(&self) -> f64 {
        self.price_30s.ret_bps_since(self.last_book_ts - 30.0, self.mid)
    }

    /// Current rolling 1s realized volatility (std of log returns).
    pub fn rv_1s(&self) -> f64 {
        self.rv.rv()
    }

    /// Multi-timeframe flow snapshot for this symbol.
    pub fn flow_snapshot(&mut self, now: f64, prefix: &str) -> BTreeMap<String, f64> {
        let ts = if now > 0.0 { now } else { self.last_book_ts };
        self.flow.snapshot(ts, prefix)
    }

    // ── Query methods ───────────────────────────────────────────────────

    /// Enough data for meaningful signals.
    pub fn is_warm(&self) -> bool {
        self.trade_count > 20 && self.book_count > 50
    }

    /// Check if short-entry conditions are met.
    ///
    /// Short only if pump and exhaust exceed their thresholds, the spread is
    /// in range, the 2s return is not still strongly positive (still
    /// pumping), the 30s return has no sustained move in either direction,
    /// and buyers are not dominating the tape.
    pub fn entry_signal(&self, th: &EntryThresholds) -> EntrySignal {
        if !self.is_warm() {
            return EntrySignal::default();
        }

        if self.spread_bps < th.min_spread_bps || self.spread_bps > th.max_spread_bps {
            return EntrySignal::default();
        }

        let rejected = EntrySignal {
            should_enter: false,
            pump: self.pump_score,
            exhaust: self.exhaust_score,
            signal_strength: 0.0,
        };

        if self.pump_score <= th.pump {
            return rejected;
        }
        if self.exhaust_score <= th.exhaust {
            return rejected;
        }

        // Still-pumping guard.
        if self.ret_2s_bps() > th.max_trend_bps {
            return rejected;
        }

        // Sustained-trend guard, both directions.
        if th.max_trend_30s_bps > 0.0 && self.ret_30s_bps().abs() > th.max_trend_30s_bps {
            return rejected;
        }

        // Trade-side delta: skip short if buyers dominating.
        if th.max_buy_ratio < 1.0 && self.ti_2s.buy_ratio() > th.max_buy_ratio {
            return rejected;
        }

        EntrySignal {
            should_enter: true,
            pump: self.pump_score,
            exhaust: self.exhaust_score,
            signal_strength: self.pump_score * 0.5 + self.exhaust_score * 0.5,
        }
    }

    /// Check exit conditions for a short position.
    ///
    /// TP: return from entry (at the ask) drops below
    /// `-max(tp_spread_mult · spread_bps, min_tp_profit_bps)`.
    /// Fast TP: 500 ms flow reversed and the return clears the fast floor.
    pub fn exit_signal(&self, entry_price: f64, th: &ExitThresholds) -> ExitSignal {
        if entry_price <= 0.0 || self.ask <= 0.0 {
            return ExitSignal::default();
        }

        // Return from entry in bps — uses the ASK (actual close price for shorts).
        let ret_from_entry = (self.ask - entry_price) / entry_price * 10_000.0;

        let tp_target_bps = -(th.tp_spread_mult * self.spread_bps).max(th.min_tp_profit_bps);
        if ret_from_entry <= tp_target_bps {
            return ExitSignal { reason: Some(ExitReason::Tp) };
        }

        if self.ti_500ms_val < th.fast_tp_ti && ret_from_entry <= th.min_fast_tp_bps {
            return ExitSignal { reason: Some(ExitReason::FastTp) };
        }

        ExitSignal::default()
    }

    /// Vol-normalized position sizing:
    /// `clip(strength / (rv · 10⁴) · base, min, max)`.
    pub fn position_size(&self, base_notional: f64, min_notional: f64, max_notional: f64) -> f64 {
        let rv = self.rv.rv();
        if rv < 1e-8 {
            return base_notional;
        }
        let strength = (self.pump_score * 0.5 + self.exhaust_score * 0.5).max(0.5);
        let raw = strength / (rv * 10_000.0);
        (raw * base_notional).min(max_notional).max(min_notional)
    }

    /// Call when the position is fully closed. Drops stale delta context so
    /// post-close exhaust readings rebuild from the live tape.
    pub fn reset_entry_tracking(&mut self) {
        self.prev_ti_300ms = self.ti_300ms_val;
        self.prev_qi = self.qi;
    }
}

impl Default for MicroSignals {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_entry_thresholds() -> EntryThresholds {
        EntryThresholds {
            pump: 2.0,
            exhaust: 1.0,
            min_spread_bps: 5.0,
            max_spread_bps: 40.0,
            max_trend_bps: 5.0,
            max_trend_30s_bps: 30.0,
            max_buy_ratio: 1.0,
        }
    }

    fn default_exit_thresholds() -> ExitThresholds {
        ExitThresholds {
            tp_spread_mult: 1.2,
            fast_tp_ti: -0.25,
            min_fast_tp_bps: -10.0,
            min_tp_profit_bps: 10.0,
        }
    }

    /// Pump enough trades and book updates through the engine to clear warmup.
    fn warm_engine(sig: &mut MicroSignals, bid: f64, ask: f64) {
        let mut ts = 1_000.0;
        for i in 0..60 {
            sig.on_book(bid, ask, 10.0, 10.0, ts);
            if i % 2 == 0 {
                sig.on_trade((bid + ask) / 2.0, 1.0, i % 4 == 0, ts);
            }
            ts += 0.1;
        }
    }

    #[test]
    fn cold_engine_rejects_entry() {
        let sig = MicroSignals::new();
        assert!(!sig.entry_signal(&default_entry_thresholds()).should_enter);
    }

    #[test]
    fn spread_out_of_range_rejects_entry() {
        let mut sig = MicroSignals::new();
        // Spread ≈ 1bp — below the 5bp floor.
        warm_engine(&mut sig, 50_000.0, 50_005.0);
        assert!(sig.is_warm());
        assert!(!sig.entry_signal(&default_entry_thresholds()).should_enter);

        // Spread way above the 40bp cap.
        let mut wide = MicroSignals::new();
        warm_engine(&mut wide, 100.0, 101.0);
        assert!(!wide.entry_signal(&default_entry_thresholds()).should_enter);
    }

    #[test]
    fn quote_imbalance_and_micro_price() {
        let mut sig = MicroSignals::new();
        sig.on_book(99.0, 101.0, 30.0, 10.0, 1.0);
        // QI = (30-10)/40 = 0.5
        assert!((sig.qi - 0.5).abs() < 1e-12);
        // micro = (101*30 + 99*10)/40 = 100.5; MD = (100.5-100)/2 = 0.25
        assert!((sig.micro_price - 100.5).abs() < 1e-9);
        assert!((sig.md - 0.25).abs() < 1e-9);
    }

    #[test]
    fn invalid_book_is_ignored() {
        let mut sig = MicroSignals::new();
        sig.on_book(0.0, 101.0, 1.0, 1.0, 1.0);
        assert_eq!(sig.mid, 0.0);
        assert_eq!(sig.book_count, 0);
    }

    #[test]
    fn exit_tp_fires_on_deep_drop() {
        let mut sig = MicroSignals::new();
        // Spread 7bp at ~50000; entry at 50035, ask drops to 49980 → -11bp.
        sig.on_book(49_955.0, 49_980.0, 10.0, 10.0, 1.0);
        let out = sig.exit_signal(50_035.0, &default_exit_thresholds());
        assert_eq!(out.reason, Some(ExitReason::Tp));
    }

    #[test]
    fn exit_holds_above_profit_floor() {
        let mut sig = MicroSignals::new();
        // Entry 50035, ask 49990 → about -9bp: under the 10bp floor.
        sig.on_book(49_965.0, 49_990.0, 10.0, 10.0, 1.0);
        let out = sig.exit_signal(50_035.0, &default_exit_thresholds());
        assert!(out.reason.is_none());
    }

    #[test]
    fn fast_tp_requires_reversed_flow_and_profit() {
        let mut sig = MicroSignals::new();
        sig.on_book(99.0, 99.9, 10.0, 10.0, 1.0);
        // Heavy sell aggression in the 500ms window.
        sig.on_trade(99.9, 5.0, true, 1.1);
        sig.on_trade(99.9, 5.0, true, 1.15);
        sig.on_book(99.0, 99.9, 10.0, 10.0, 1.2);
        // Entry 101.5 → ret ≈ -158bp, past the spread-scaled target; TP wins.
        let out = sig.exit_signal(101.5, &default_exit_thresholds());
        assert_eq!(out.reason, Some(ExitReason::Tp));

        // Shallow profit: entry such that ret ≈ -12bp, below fast floor but
        // above the spread-scaled TP target (spread ≈ 91bp → target -109bp).
        let entry = 100.02;
        let out = sig.exit_signal(entry, &default_exit_thresholds());
        assert_eq!(out.reason, Some(ExitReason::FastTp));
    }

    #[test]
    fn position_size_clamped() {
        let mut sig = MicroSignals::new();
        // No rv yet → base passes through.
        assert_eq!(sig.position_size(12.0, 6.0, 30.0), 12.0);
        warm_engine(&mut sig, 100.0, 100.05);
        let sized = sig.position_size(12.0, 6.0, 30.0);
        assert!((6.0..=30.0).contains(&sized));
    }

    #[test]
    fn z_scores_stay_capped() {
        let mut sig = MicroSignals::new();
        let mut ts = 1.0;
        for i in 0..500 {
            let px = 100.0 + (i as f64) * 0.5;
            sig.on_book(px, px + 0.05, 5.0, 5.0, ts);
            sig.on_trade(px, 2.0, false, ts);
            ts += 0.1;
        }
        assert!(sig.z_ret_2s.abs() <= 5.0);
        assert!(sig.z_ti_2s.abs() <= 5.0);
        assert!(sig.z_md_2s.abs() <= 5.0);
        assert!(sig.z_neg_dti.abs() <= 5.0);
        assert!(sig.z_neg_dqi.abs() <= 5.0);
    }
}
