// =============================================================================
// Recovery and state management — debt, sync, crash-safe runtime snapshots
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::grid::{GridLayer, GridTrader, RecoveryAvgSnapshot};
use crate::volatility::VolatilitySnapshot;

/// Persisted per-symbol runtime context (crash-safe restore).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeStateSnapshot {
    #[serde(default = "default_version")]
    pub version: u32,
    pub symbol: String,
    #[serde(default)]
    pub updated_ts: f64,
    #[serde(default = "default_true")]
    pub entry_enabled: bool,
    #[serde(default)]
    pub last_entry_ts: f64,
    #[serde(default)]
    pub last_entry_price: f64,
    #[serde(default)]
    pub cooldown_until: f64,
    #[serde(default)]
    pub layer_cooldown_until: f64,
    #[serde(default)]
    pub layers: Vec<GridLayer>,
    #[serde(default)]
    pub spread_history_bps: Vec<f64>,
    #[serde(default)]
    pub median_spread_bps: f64,
    #[serde(default)]
    pub vol_snapshot: VolatilitySnapshot,
    #[serde(default)]
    pub recovery_debt_usd: f64,
    #[serde(default)]
    pub session_rpnl: f64,
    #[serde(default)]
    pub session_trades: u64,
    #[serde(default)]
    pub session_closed_notional: f64,
}

fn default_version() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

/// Smaller persisted recovery snapshot: survives even when the full runtime
/// snapshot is dropped so recovery velocity carries across sessions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecoveryStateSnapshot {
    #[serde(default)]
    pub adoption_ts: f64,
    #[serde(default)]
    pub session_rpnl: f64,
    #[serde(default)]
    pub session_trades: u64,
    #[serde(default)]
    pub session_closed_notional: f64,
    #[serde(default)]
    pub last_recovery_add_ts: f64,
    #[serde(default)]
    pub recovery_add_events: Vec<f64>,
    #[serde(default)]
    pub updated_ts: f64,
}

impl GridTrader {
    // ─── Recovery debt ──────────────────────────────────────────────────

    /// Losses accumulate as debt; profits pay it down. Clamped to
    /// `[0, recovery_debt_cap_usd]`.
    pub(crate) fn update_recovery_debt(&mut self, net_pnl: f64) {
        if !self.config.recovery_debt_enabled {
            return;
        }
        if net_pnl < 0.0 {
            self.recovery_debt_usd += net_pnl.abs();
        } else if net_pnl > 0.0 && self.recovery_debt_usd > 0.0 {
            self.recovery_debt_usd = (self.recovery_debt_usd - net_pnl).max(0.0);
        }
        let cap = self.config.recovery_debt_cap_usd.max(0.0);
        if cap > 0.0 {
            self.recovery_debt_usd = self.recovery_debt_usd.min(cap);
        }
    }

    /// Inject historical recovery velocity from the store at startup.
    pub fn set_recovery_stats(&mut self, rpnl_per_hour: f64, trade_count: u64, adoption_ts: f64) {
        self.hist_rpnl_per_hour = rpnl_per_hour;
        self.hist_trade_count = trade_count;
        if adoption_ts > 0.0 {
            self.adoption_ts = adoption_ts;
        }
    }

    /// Hydrate persistent recovery state across sessions.
    pub fn set_recovery_state(&mut self, state: &RecoveryStateSnapshot, source: &str) {
        if state.adoption_ts > 0.0 {
            self.adoption_ts = state.adoption_ts;
        }
        if state.session_rpnl != 0.0 {
            self.session_rpnl = state.session_rpnl;
        }
        if state.session_trades > 0 {
            self.session_trades = state.session_trades;
        }
        if state.session_closed_notional > 0.0 {
            self.session_closed_notional = state.session_closed_notional;
        }
        if state.last_recovery_add_ts > 0.0 {
            self.last_recovery_add_ts = state.last_recovery_add_ts;
        }
        for &ts in &state.recovery_add_events {
            if ts > 0.0 {
                if self.recovery_add_events.len() == 64 {
                    self.recovery_add_events.pop_front();
                }
                self.recovery_add_events.push_back(ts);
            }
        }
        info!(symbol = %self.symbol, source, "recovery state restored");
    }

    /// Snapshot persistent recovery state.
    pub fn export_recovery_state(&mut self, now: f64) -> RecoveryStateSnapshot {
        self.evict_recovery_add_events(now);
        RecoveryStateSnapshot {
            adoption_ts: self.adoption_ts,
            session_rpnl: self.session_rpnl,
            session_trades: self.session_trades,
            session_closed_notional: self.session_closed_notional,
            last_recovery_add_ts: self.last_recovery_add_ts,
            recovery_add_events: self.recovery_add_events.iter().copied().collect(),
            updated_ts: now,
        }
    }

    pub(crate) fn evict_recovery_add_events(&mut self, now: f64) {
        let cutoff = now - 3600.0;
        while self.recovery_add_events.front().is_some_and(|&t| t < cutoff) {
            self.recovery_add_events.pop_front();
        }
    }

    pub(crate) fn record_recovery_add_event(&mut self, now: f64) {
        self.evict_recovery_add_events(now);
        if self.recovery_add_events.len() == 64 {
            self.recovery_add_events.pop_front();
        }
        self.recovery_add_events.push_back(now);
        self.last_recovery_add_ts = now;
    }

    /// Averaging guardrail: require drawdown depth, pacing, and a debt-
    /// hurdle improvement before adding into a losing position.
    pub(crate) fn recovery_average_allowed(&mut self, now: f64, projected_notional: f64) -> bool {
        if !self.config.recovery_avg_enabled {
            return true;
        }

        let unrealized_bps = self.unrealized_bps();
        let min_loss = self.config.recovery_avg_min_unrealized_bps.max(0.0);
        if unrealized_bps > -min_loss {
            self.last_recovery_avg_snapshot = RecoveryAvgSnapshot {
                ok: false,
                reason: "drawdown_too_small",
                unrealized_bps,
                ..Default::default()
            };
            return false;
        }

        let cooldown = self.config.recovery_avg_cooldown_sec.max(0.0);
        if cooldown > 0.0
            && self.last_recovery_add_ts > 0.0
            && now - self.last_recovery_add_ts < cooldown
        {
            self.last_recovery_avg_snapshot = RecoveryAvgSnapshot {
                ok: false,
                reason: "cooldown",
                unrealized_bps,
                ..Default::default()
            };
            return false;
        }

        self.evict_recovery_add_events(now);
        let max_adds = self.config.recovery_avg_max_adds_per_hour;
        if max_adds > 0 && self.recovery_add_events.len() >= max_adds {
            self.last_recovery_avg_snapshot = RecoveryAvgSnapshot {
                ok: false,
                reason: "hourly_limit",
                unrealized_bps,
                adds_1h: self.recovery_add_events.len(),
                ..Default::default()
            };
            return false;
        }

        let cur_hurdle = self.recovery_entry_hurdle_bps(self.total_notional);
        let next_hurdle = self.recovery_entry_hurdle_bps(projected_notional);
        let improve = cur_hurdle - next_hurdle;
        let min_improve = self.config.recovery_avg_min_hurdle_improve_bps.max(0.0);
        // Skip the hurdle check for negligible debt: improvements are
        // sub-0.01bp there and would block averaging forever.
        if self.recovery_debt_usd > 0.10 && improve < min_improve {
            self.last_recovery_avg_snapshot = RecoveryAvgSnapshot {
                ok: false,
                reason: "hurdle_improve_too_small",
                hurdle_now_bps: cur_hurdle,
                hurdle_next_bps: next_hurdle,
                hurdle_improve_bps: improve,
                unrealized_bps,
                adds_1h: self.recovery_add_events.len(),
            };
            return false;
        }

        self.last_recovery_avg_snapshot = RecoveryAvgSnapshot {
            ok: true,
            reason: "ok",
            hurdle_now_bps: cur_hurdle,
            hurdle_next_bps: next_hurdle,
            hurdle_improve_bps: improve,
            unrealized_bps,
            adds_1h: self.recovery_add_events.len(),
        };
        true
    }

    // ─── Recovery velocity ──────────────────────────────────────────────

    /// Blended recovery velocity: session rPnL rate + historical rate.
    pub fn recovery_velocity_bps_hr(&self, now: f64) -> f64 {
        let session_hours = ((now - self.start_ts) / 3600.0).max(0.01);
        let avg_closed_notional = if self.session_trades > 0 {
            self.session_closed_notional / (self.session_trades as f64).max(1.0)
        } else {
            self.total_notional
        };
        let notion_ref = avg_closed_notional.max(self.config.min_notional).max(0.01);
        let session_rate = self.session_rpnl / notion_ref * 10_000.0 / session_hours;
        if self.hist_trade_count > 0 && self.session_trades > 0 {
            (session_rate + self.hist_rpnl_per_hour) * 0.5
        } else if self.hist_trade_count > 0 {
            self.hist_rpnl_per_hour
        } else {
            session_rate
        }
    }

    /// "flat" | "active" | "passive".
    pub fn recovery_mode(&self, now: f64) -> &'static str {
        if self.layers.is_empty() {
            return "flat";
        }
        let can_trade = self.median_spread_bps >= self.config.min_spread_bps;
        if can_trade && self.recovery_velocity_bps_hr(now) > 0.0 {
            "active"
        } else {
            "passive"
        }
    }

    /// Estimated hours until the unrealized loss is recovered.
    /// Infinity when the velocity is non-positive.
    pub fn recovery_eta_hours(&self, now: f64) -> f64 {
        if self.layers.is_empty() {
            return 0.0;
        }
        let unrealized_bps = self.unrealized_bps().abs();
        let vel = self.recovery_velocity_bps_hr(now);
        if vel <= 0.0 {
            return f64::INFINITY;
        }
        unrealized_bps / vel
    }

    /// Unrealized PnL in basis points (negative = losing), bid-marked.
    pub(crate) fn unrealized_bps(&self) -> f64 {
        if self.layers.is_empty() || self.total_notional <= 0.0 || self.bid <= 0.0 {
            return 0.0;
        }
        let unrealized_usd: f64 = self
            .layers
            .iter()
            .map(|l| (l.price - self.bid) * l.qty)
            .sum();
        unrealized_usd / self.total_notional * 10_000.0
    }

    pub fn set_recovery_debt(&mut self, debt_usd: f64, source: &str) {
        let mut debt = debt_usd.max(0.0);
        let cap = self.config.recovery_debt_cap_usd.max(0.0);
        if cap > 0.0 {
            debt = debt.min(cap);
        }
        self.recovery_debt_usd = debt;
        if debt > 0.0 {
            warn!(symbol = %self.symbol, debt_usd = format!("{debt:.4}"), source, "recovery debt set");
        }
    }

    pub fn set_entry_enabled(&mut self, enabled: bool, source: &str) {
        self.entry_enabled = enabled;
        info!(
            symbol = %self.symbol,
            mode = if enabled { "enabled" } else { "disabled" },
            source,
            "fresh-entry mode changed"
        );
    }

    // ─── Exchange sync ──────────────────────────────────────────────────

    /// Replace local grid state with exchange truth.
    ///
    /// `qty <= 0` means flat: clear local state. `qty > 0` rebuilds layers;
    /// `est_layers > 1` splits into synthetic layers so inverse-TP can
    /// still activate with a sane layer count.
    pub fn sync_with_exchange_position(
        &mut self,
        qty: f64,
        entry_price: f64,
        source: &str,
        est_layers: usize,
        now: f64,
    ) {
        let qty = qty.max(0.0);
        let entry_price = entry_price.max(0.0);

        if qty <= 0.0 || entry_price <= 0.0 {
            if !self.layers.is_empty() {
                warn!(
                    symbol = %self.symbol,
                    source,
                    cleared_layers = self.layers.len(),
                    "sync to flat — clearing local grid"
                );
            }
            self.reset_grid();
            return;
        }

        let notional = qty * entry_price;
        let n_layers = est_layers.max(1);
        let order_id = format!("{source}_sync");

        if n_layers > 1 {
            let per_qty = qty / n_layers as f64;
            let per_notional = notional / n_layers as f64;
            self.layers = (0..n_layers)
                .map(|i| GridLayer {
                    price: entry_price,
                    qty: per_qty,
                    notional: per_notional,
                    entry_ts: now,
                    layer_idx: i,
                    order_id: order_id.clone(),
                    fee: per_notional * self.config.maker_fee,
                    entry_signals: Default::default(),
                })
                .collect();
        } else {
            self.layers = vec![GridLayer {
                price: entry_price,
                qty,
                notional,
                entry_ts: now,
                layer_idx: 0,
                order_id,
                fee: notional * self.config.maker_fee,
                entry_signals: Default::default(),
            }];
        }
        self.update_avg();
        self.pending_order = false;
        self.pending_exit = false;
        self.last_entry_ts = now;
        self.last_entry_price = entry_price;
        self.signals.reset_entry_tracking();
        warn!(
            symbol = %self.symbol,
            source,
            qty,
            entry_price,
            notional = format!("{notional:.2}"),
            layers = n_layers,
            "grid synced to exchange position"
        );
    }

    /// Clear all grid state (position, pending flags, inverse-TP).
    pub(crate) fn reset_grid(&mut self) {
        self.layers.clear();
        self.avg_entry_price = 0.0;
        self.total_qty = 0.0;
        self.total_notional = 0.0;
        self.pending_order = false;
        self.pending_exit = false;
        self.last_entry_price = 0.0;
        self.signals.reset_entry_tracking();
        self.inverse_tp_active = false;
        self.inverse_tp_zones.clear();
        self.inverse_tp_next_idx = 0;
        self.inverse_tp_start_ts = 0.0;
        self.inverse_tp_layers_at_start = 0;
        self.inverse_tp_avg_entry = 0.0;
    }

    /// Recalculate average entry price and totals from the layer list.
    pub(crate) fn update_avg(&mut self) {
        if self.layers.is_empty() {
            self.avg_entry_price = 0.0;
            self.total_qty = 0.0;
            self.total_notional = 0.0;
            return;
        }
        self.total_qty = self.layers.iter().map(|l| l.qty).sum();
        self.total_notional = self.layers.iter().map(|l| l.notional).sum();
        self.avg_entry_price = if self.total_qty > 0.0 {
            self.total_notional / self.total_qty
        } else {
            0.0
        };
    }

    // ─── Runtime state persistence ──────────────────────────────────────

    /// Force a short rewarm window after restart/restore so stale spread
    /// and vol context cannot trigger immediate entries.
    pub fn arm_context_rewarm(&mut self, now: f64, sec: Option<f64>, reset_spread: bool, reset_vol: bool) {
        let rewarm_sec = sec.unwrap_or(self.config.resume_context_rewarm_sec).max(0.0);
        if reset_spread {
            self.spread_history.clear();
            self.median_spread_bps = 0.0;
            self.last_spread_calc_ts = 0.0;
        }
        if reset_vol {
            self.vol_snapshot = VolatilitySnapshot::default();
        }
        if rewarm_sec > 0.0 {
            self.resume_rewarm_until = self.resume_rewarm_until.max(now + rewarm_sec);
        }
    }

    /// Snapshot the full per-symbol runtime context for crash-safe restore.
    /// Spread history is trimmed to the last 240 samples.
    pub fn export_runtime_state(&self, now: f64) -> RuntimeStateSnapshot {
        let skip = self.spread_history.len().saturating_sub(240);
        RuntimeStateSnapshot {
            version: 1,
            symbol: self.symbol.clone(),
            updated_ts: now,
            entry_enabled: self.entry_enabled,
            last_entry_ts: self.last_entry_ts,
            last_entry_price: self.last_entry_price,
            cooldown_until: self.cooldown_until,
            layer_cooldown_until: self.layer_cooldown_until,
            layers: self.layers.clone(),
            spread_history_bps: self.spread_history.iter().skip(skip).copied().collect(),
            median_spread_bps: self.median_spread_bps,
            vol_snapshot: self.vol_snapshot.clone(),
            recovery_debt_usd: self.recovery_debt_usd,
            session_rpnl: self.session_rpnl,
            session_trades: self.session_trades,
            session_closed_notional: self.session_closed_notional,
        }
    }

    /// Restore runtime context from a persisted snapshot.
    ///
    /// Pending flags always clear (in-flight orders reconcile from exchange
    /// truth) and a rewarm window is armed with spread/vol context reset.
    /// Returns true when at least one layer was restored.
    pub fn restore_runtime_state(&mut self, state: &RuntimeStateSnapshot, source: &str, now: f64) -> bool {
        if !state.symbol.is_empty()
            && !state.symbol.eq_ignore_ascii_case(&self.symbol)
        {
            return false;
        }

        let mut restored: Vec<GridLayer> = Vec::new();
        for raw in &state.layers {
            if raw.price <= 0.0 || raw.qty <= 0.0 {
                continue;
            }
            let mut layer = raw.clone();
            if layer.notional <= 0.0 {
                layer.notional = layer.price * layer.qty;
            }
            if layer.entry_ts <= 0.0 {
                layer.entry_ts = now;
            }
            layer.layer_idx = restored.len();
            restored.push(layer);
        }

        self.layers = restored;
        self.update_avg();
        self.entry_enabled = state.entry_enabled;
        if state.last_entry_ts > 0.0 {
            self.last_entry_ts = state.last_entry_ts;
        }
        if state.last_entry_price > 0.0 {
            self.last_entry_price = state.last_entry_price;
        }
        if state.cooldown_until > 0.0 {
            self.cooldown_until = state.cooldown_until;
        }
        if state.layer_cooldown_until > 0.0 {
            self.layer_cooldown_until = state.layer_cooldown_until;
        }
        if state.recovery_debt_usd > 0.0 {
            self.recovery_debt_usd = state.recovery_debt_usd;
        }
        if state.session_rpnl != 0.0 {
            self.session_rpnl = state.session_rpnl;
        }
        if state.session_trades > 0 {
            self.session_trades = state.session_trades;
        }
        if state.session_closed_notional > 0.0 {
            self.session_closed_notional = state.session_closed_notional;
        }

        self.pending_order = false;
        self.pending_exit = false;
        self.last_runtime_restore_ts = now;

        // Rebuild local spread/vol context before allowing entries again.
        self.arm_context_rewarm(now, None, true, true);

        info!(
            symbol = %self.symbol,
            source,
            layers = self.layers.len(),
            notional = format!("{:.2}", self.total_notional),
            "runtime state restored"
        );
        !self.layers.is_empty()
    }
}
