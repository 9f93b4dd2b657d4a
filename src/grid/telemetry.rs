// =============================================================================
// Trader telemetry — signal snapshots, strategy events, status reporting
// =============================================================================

use std::collections::BTreeMap;

use serde::Serialize;

use crate::grid::GridTrader;

/// Raw per-trade event handed to the orchestrator's event sink.
#[derive(Debug, Clone)]
pub struct TradeEventRecord {
    pub ts: f64,
    pub symbol: String,
    /// "entry" | "close".
    pub action: &'static str,
    pub reason: String,
    pub layer_idx: usize,
    pub layers: usize,
    pub qty: f64,
    pub price: f64,
    pub notional: f64,
    pub pnl_usd: f64,
    pub pnl_bps: f64,
    pub spread_bps: f64,
    pub median_spread_bps: f64,
    pub vol_blended_bps: f64,
    pub vol_drift_mult: f64,
    pub edge_lcb_bps: f64,
    pub edge_required_bps: f64,
    pub recovery_debt_usd: f64,
    /// Entry-time signals (notional-weighted average on closes).
    pub entry_signals: BTreeMap<String, f64>,
    /// Exit-time signals (closes only).
    pub exit_signals: BTreeMap<String, f64>,
}

/// Serialized per-symbol status for the dashboard and HTTP bridge.
#[derive(Debug, Clone, Serialize)]
pub struct GridStatus {
    pub symbol: String,
    pub spread_bps: f64,
    pub median_spread_bps: f64,
    pub layers: usize,
    pub max_layers: usize,
    pub dynamic_max_layers: usize,
    pub avg_entry: f64,
    pub total_notional: f64,
    pub unrealized_usd: f64,
    pub unrealized_bps: f64,
    pub realized_bps: f64,
    pub realized_usd: f64,
    pub total_fees: f64,
    pub trades: u64,
    pub win_rate: f64,
    pub tp_target_bps: f64,
    pub expected_edge_bps: f64,
    pub edge_lcb_bps: f64,
    pub edge_required_bps: f64,
    pub edge_context: String,
    pub entry_enabled: bool,
    pub symbol_notional_cap: f64,
    pub recovery_debt_usd: f64,
    pub recovery_exit_hurdle_bps: f64,
    pub recovery_mode: String,
    pub recovery_velocity_bps_hr: f64,
    /// Infinity serialized as null.
    pub recovery_eta_hours: Option<f64>,
    pub recovery_adds_1h: usize,
    pub session_rpnl: f64,
    pub session_trades: u64,
    pub circuit_breaker: bool,
    pub cooldown_left_sec: f64,
    pub layer_cooldown_left_sec: f64,
    pub dynamic_entry_cooldown_sec: f64,
    pub dynamic_layer_gap_bps: f64,
    pub dynamic_min_tp_profit_bps: f64,
    pub dynamic_min_fast_tp_bps: f64,
    pub behavior_dup_ratio: f64,
    pub behavior_near_zero_ratio: f64,
    pub resume_rewarm_left_sec: f64,
    pub vol_baseline_bps: f64,
    pub vol_live_bps: f64,
    pub vol_drift_mult: f64,
    pub vol_tail_ratio: f64,
    pub inverse_tp_active: bool,
    pub pending: bool,
}

impl GridTrader {
    /// Capture the current microstructure signal state for logging, merged
    /// with the per-symbol flow snapshot and any global runner context.
    pub(crate) fn signal_snapshot(&mut self, now: f64) -> BTreeMap<String, f64> {
        let mut snap = BTreeMap::new();
        let s = &self.signals;
        snap.insert("TI_2s".to_string(), s.ti_2s_val);
        snap.insert("TI_500ms".to_string(), s.ti_500ms_val);
        snap.insert("z_TI_2s".to_string(), s.z_ti_2s);
        snap.insert("z_ret_2s".to_string(), s.z_ret_2s);
        snap.insert("z_MD_2s".to_string(), s.z_md_2s);
        snap.insert("pump_score".to_string(), s.pump_score);
        snap.insert("exhaust_score".to_string(), s.exhaust_score);
        snap.insert("QI".to_string(), s.qi);
        snap.insert("MD".to_string(), s.md);
        snap.insert("rv_1s".to_string(), s.rv_1s());
        snap.insert("spread_bps".to_string(), s.spread_bps);

        for (key, val) in self.signals.flow_snapshot(now, "pair_") {
            snap.insert(key, val);
        }
        if let Some(provider) = &self.external_snapshot_provider {
            for (key, val) in provider() {
                snap.insert(key, val);
            }
        }
        snap
    }

    pub(crate) fn emit_entry_event(&mut self, now: f64) {
        let Some(sink) = self.event_sink.clone() else { return };
        let Some(layer) = self.layers.last() else { return };
        let record = TradeEventRecord {
            ts: now,
            symbol: self.symbol.clone(),
            action: "entry",
            reason: String::new(),
            layer_idx: layer.layer_idx,
            layers: self.layers.len(),
            qty: layer.qty,
            price: layer.price,
            notional: layer.notional,
            pnl_usd: 0.0,
            pnl_bps: 0.0,
            spread_bps: self.signals.spread_bps,
            median_spread_bps: self.median_spread_bps,
            vol_blended_bps: self.vol_snapshot.blended_bps,
            vol_drift_mult: self.vol_snapshot.drift_mult,
            edge_lcb_bps: self.last_edge_snapshot.edge_lcb_bps,
            edge_required_bps: self.last_edge_snapshot.required_edge_bps,
            recovery_debt_usd: self.recovery_debt_usd,
            entry_signals: self.layers.last().map(|l| l.entry_signals.clone()).unwrap_or_default(),
            exit_signals: BTreeMap::new(),
        };
        sink(record);
    }

    pub(crate) fn emit_close_event(
        &mut self,
        now: f64,
        reason: &str,
        pnl_usd: f64,
        pnl_bps: f64,
        n_layers: usize,
    ) {
        let Some(sink) = self.event_sink.clone() else { return };
        let entry_wavg = self.weighted_entry_signals();
        let exit_signals = self.signal_snapshot(now);
        let record = TradeEventRecord {
            ts: now,
            symbol: self.symbol.clone(),
            action: "close",
            reason: reason.to_string(),
            layer_idx: 0,
            layers: n_layers,
            qty: self.total_qty,
            price: self.bid,
            notional: self.total_notional,
            pnl_usd,
            pnl_bps,
            spread_bps: self.signals.spread_bps,
            median_spread_bps: self.median_spread_bps,
            vol_blended_bps: self.vol_snapshot.blended_bps,
            vol_drift_mult: self.vol_snapshot.drift_mult,
            edge_lcb_bps: self.last_edge_snapshot.edge_lcb_bps,
            edge_required_bps: self.last_edge_snapshot.required_edge_bps,
            recovery_debt_usd: self.recovery_debt_usd,
            entry_signals: entry_wavg,
            exit_signals,
        };
        sink(record);
    }

    /// Entry-time signals aggregated across layers, weighted by notional.
    fn weighted_entry_signals(&self) -> BTreeMap<String, f64> {
        let mut out = BTreeMap::new();
        if self.layers.is_empty() {
            return out;
        }
        let mut keys: Vec<&String> = Vec::new();
        for layer in &self.layers {
            for key in layer.entry_signals.keys() {
                if !keys.contains(&key) {
                    keys.push(key);
                }
            }
        }
        for key in keys {
            let mut wsum = 0.0;
            let mut weight_sum = 0.0;
            for layer in &self.layers {
                if let Some(val) = layer.entry_signals.get(key) {
                    wsum += val * layer.notional;
                    weight_sum += layer.notional;
                }
            }
            if weight_sum > 0.0 {
                out.insert(key.clone(), wsum / weight_sum.max(1e-9));
            }
        }
        out
    }

    /// Build the display/bridge status snapshot.
    pub fn status(&self, now: f64) -> GridStatus {
        let spread_bps = if self.mid > 0.0 {
            (self.ask - self.bid) / self.mid * 10_000.0
        } else {
            0.0
        };
        let unrealized_usd: f64 = self
            .layers
            .iter()
            .map(|l| (l.price - self.bid) * l.qty)
            .sum();
        let eta = self.recovery_eta_hours(now);
        let edge = &self.last_edge_snapshot;

        GridStatus {
            symbol: self.symbol.clone(),
            spread_bps,
            median_spread_bps: self.median_spread_bps,
            layers: self.layers.len(),
            max_layers: self.config.max_layers,
            dynamic_max_layers: self.dynamic_max_layers(),
            avg_entry: self.avg_entry_price,
            total_notional: self.total_notional,
            unrealized_usd,
            unrealized_bps: if self.total_notional > 0.0 {
                unrealized_usd / self.total_notional * 10_000.0
            } else {
                0.0
            },
            realized_bps: self.realized_pnl_bps,
            realized_usd: self.realized_pnl,
            total_fees: self.total_fees,
            trades: self.total_trades,
            win_rate: self.wins as f64 / (self.total_trades.max(1) as f64) * 100.0,
            tp_target_bps: self.tp_target_bps(now),
            expected_edge_bps: edge.expected_edge_bps,
            edge_lcb_bps: edge.edge_lcb_bps,
            edge_required_bps: edge.required_edge_bps,
            edge_context: edge.context.to_string(),
            entry_enabled: self.entry_enabled,
            symbol_notional_cap: self.symbol_notional_cap(),
            recovery_debt_usd: self.recovery_debt_usd,
            recovery_exit_hurdle_bps: self.recovery_exit_hurdle_bps(),
            recovery_mode: self.recovery_mode(now).to_string(),
            recovery_velocity_bps_hr: self.recovery_velocity_bps_hr(now),
            recovery_eta_hours: if eta.is_finite() { Some(eta) } else { None },
            recovery_adds_1h: self.recovery_add_events.len(),
            session_rpnl: self.session_rpnl,
            session_trades: self.session_trades,
            circuit_breaker: self.circuit_breaker_ts > 0.0,
            cooldown_left_sec: (self.cooldown_until - now).max(0.0),
            layer_cooldown_left_sec: (self.layer_cooldown_until - now).max(0.0),
            dynamic_entry_cooldown_sec: self.dynamic_entry_cooldown_sec(),
            dynamic_layer_gap_bps: self.dynamic_layer_gap_bps(),
            dynamic_min_tp_profit_bps: self.dynamic_min_tp_profit_bps(),
            dynamic_min_fast_tp_bps: self.dynamic_min_fast_tp_bps(),
            behavior_dup_ratio: self.duplicate_fill_ratio(),
            behavior_near_zero_ratio: self.near_zero_close_ratio(),
            resume_rewarm_left_sec: (self.resume_rewarm_until - now).max(0.0),
            vol_baseline_bps: self.vol_snapshot.baseline_bps,
            vol_live_bps: self.vol_snapshot.live_bps,
            vol_drift_mult: self.vol_snapshot.drift_mult,
            vol_tail_ratio: self.vol_snapshot.tail_ratio,
            inverse_tp_active: self.inverse_tp_active,
            pending: self.pending_order || self.pending_exit,
        }
    }
}
