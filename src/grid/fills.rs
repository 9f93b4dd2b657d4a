// =============================================================================
// Fill handling — live fill callbacks, close recording, order queue
// =============================================================================

use tracing::{info, warn};

use crate::grid::{CloseBehavior, FillGap, GridLayer, GridTrader, OrderIntent};

/// Escalating post-close cooldown schedule (seconds). Index advances on
/// non-profitable closes and resets only on profitable TP-style closes.
const COOLDOWN_SCHEDULE_TAIL: [f64; 3] = [30.0, 90.0, 300.0];

impl GridTrader {
    fn behavior_cap(&self) -> usize {
        self.config.behavior_lookback.max(20)
    }

    // ─── Sell (entry) fills ─────────────────────────────────────────────

    /// Called by the orchestrator when a SELL order fills.
    ///
    /// Validates the adaptive layer cap and per-symbol notional cap. When
    /// the fill would breach either, returns the fill quantity as excess —
    /// the orchestrator must buy it back immediately.
    pub fn on_sell_fill(
        &mut self,
        fill_price: f64,
        fill_qty: f64,
        order_id: &str,
        fee: f64,
        layer_idx: usize,
        now: f64,
    ) -> Option<f64> {
        let notional = fill_price * fill_qty;

        let max_layers_now = self.dynamic_max_layers();
        if self.layers.len() >= max_layers_now {
            warn!(
                symbol = %self.symbol,
                max_layers = max_layers_now,
                "rejecting fill — already at max layers; excess will be closed"
            );
            self.pending_order = false;
            return Some(fill_qty);
        }

        let cap = self.symbol_notional_cap();
        if cap > 0.0 && self.total_notional + notional > cap {
            warn!(
                symbol = %self.symbol,
                projected = format!("{:.2}", self.total_notional + notional),
                cap = format!("{cap:.2}"),
                "rejecting fill — symbol notional cap; excess will be closed"
            );
            self.pending_order = false;
            return Some(fill_qty);
        }

        let snap = self.signal_snapshot(now);
        let layer = GridLayer {
            price: fill_price,
            qty: fill_qty,
            notional,
            entry_ts: now,
            layer_idx,
            order_id: order_id.to_string(),
            fee,
            entry_signals: snap,
        };
        self.layers.push(layer);
        self.update_avg();
        self.register_sell_fill_event(fill_price, now);
        if layer_idx > 0 {
            self.record_recovery_add_event(now);
        }
        self.total_fees += fee;
        self.emit_entry_event(now);

        // Unblock — ready for the next order.
        self.pending_order = false;

        info!(
            symbol = %self.symbol,
            layer = layer_idx,
            fill_price,
            notional = format!("{notional:.2}"),
            fee = format!("{fee:.4}"),
            layers = self.layers.len(),
            grid_notional = format!("{:.0}", self.total_notional),
            "short fill applied"
        );
        None
    }

    // ─── Buy (close) fills ──────────────────────────────────────────────

    /// Called by the orchestrator when a BUY order fills (position close).
    #[allow(clippy::too_many_arguments)]
    pub fn on_buy_fill(
        &mut self,
        fill_price: f64,
        fill_qty: f64,
        order_id: &str,
        fee: f64,
        reason: &str,
        decision_ask: f64,
        partial_tp: bool,
        inverse_tp_zone: i32,
        now: f64,
    ) {
        // Inverse-TP partial close: remove the covered FIFO batch only.
        if partial_tp && self.inverse_tp_active {
            let zone_idx = if inverse_tp_zone >= 0 {
                inverse_tp_zone as usize
            } else {
                self.inverse_tp_next_idx.saturating_sub(1)
            };
            let batch = self.inverse_tp_batch_len(zone_idx);
            if batch == 0 {
                self.pending_order = false;
                return;
            }
            let close_layers: Vec<GridLayer> = self.layers[..batch].to_vec();
            let close_notional: f64 = close_layers.iter().map(|l| l.notional).sum();

            let gross: f64 = close_layers
                .iter()
                .map(|l| (l.price - fill_price) * l.qty)
                .sum();
            let entry_fees: f64 = close_layers.iter().map(|l| l.fee).sum();
            let actual_net = gross - entry_fees - fee;
            let actual_bps = if close_notional > 0.0 {
                actual_net / close_notional * 10_000.0
            } else {
                0.0
            };

            info!(
                symbol = %self.symbol,
                zone = zone_idx,
                layers = batch,
                fill_price,
                pnl_bps = format!("{actual_bps:+.1}"),
                order_id = &order_id[..order_id.len().min(8)],
                "inverse TP fill applied"
            );

            self.total_fees += fee;
            self.apply_partial_close(batch, actual_net, actual_bps, now, zone_idx);
            return;
        }

        // Standard full close.
        let n_layers = self.layers.len();
        let actual_pnl: f64 = self
            .layers
            .iter()
            .map(|l| (l.price - fill_price) * l.qty)
            .sum();
        let total_entry_fees: f64 = self.layers.iter().map(|l| l.fee).sum();
        let actual_net = actual_pnl - total_entry_fees - fee;
        let actual_bps = if self.total_notional > 0.0 {
            actual_net / self.total_notional * 10_000.0
        } else {
            0.0
        };

        info!(
            symbol = %self.symbol,
            layers = n_layers,
            fill_price,
            fill_qty,
            avg_entry = self.avg_entry_price,
            pnl_bps = format!("{actual_bps:+.1}"),
            pnl_usd = format!("{actual_net:+.4}"),
            fees = format!("{:.4}", total_entry_fees + fee),
            reason,
            "close fill applied"
        );

        self.total_fees += fee;
        // Slippage sample for the edge model (ask-referenced).
        let ask_ref = if decision_ask > 0.0 { decision_ask } else { self.ask };
        if ask_ref > 0.0 {
            let slippage_bps = (fill_price - ask_ref) / ask_ref * 10_000.0;
            if self.recent_exit_slippage_bps.len() >= self.behavior_cap() {
                self.recent_exit_slippage_bps.pop_front();
            }
            self.recent_exit_slippage_bps.push_back(slippage_bps);
        }
        self.record_close(actual_net, actual_bps, now, reason, n_layers);
        self.emit_close_event(now, reason, actual_net, actual_bps, n_layers);
        self.reset_grid();
    }

    /// Apply an inverse-TP partial close: remove the FIFO batch, update
    /// state, advance the zone.
    pub(crate) fn apply_partial_close(
        &mut self,
        batch: usize,
        net_pnl: f64,
        net_pnl_bps: f64,
        now: f64,
        zone_idx: usize,
    ) {
        let close_notional: f64 = self.layers[..batch].iter().map(|l| l.notional).sum();

        self.realized_pnl += net_pnl;
        self.realized_pnl_bps += net_pnl_bps * (close_notional / self.total_notional.max(1e-10));
        self.session_rpnl += net_pnl;
        self.session_closed_notional += close_notional;
        if net_pnl > 0.0 {
            self.wins += 1;
        }
        self.total_trades += 1;
        self.session_trades += 1;

        self.layers.drain(..batch);
        self.inverse_tp_next_idx = zone_idx + 1;
        self.update_avg();

        if self.layers.is_empty() {
            info!(
                symbol = %self.symbol,
                layers_at_start = self.inverse_tp_layers_at_start,
                zones_used = zone_idx + 1,
                "inverse TP complete — fully unwound"
            );
            self.inverse_tp_active = false;
            self.pending_order = false;
            self.pending_exit = false;
            self.last_entry_price = 0.0;
            self.signals.reset_entry_tracking();
        } else {
            info!(
                symbol = %self.symbol,
                remaining = self.layers.len(),
                avg_entry = self.avg_entry_price,
                notional = format!("{:.2}", self.total_notional),
                next_zone = self.inverse_tp_next_idx,
                zones = self.inverse_tp_zones.len(),
                "inverse TP advanced"
            );
            self.pending_order = false;
        }

        self.update_recovery_debt(net_pnl);
        self.emit_close_event(now, "inverse_tp", net_pnl, net_pnl_bps, self.inverse_tp_layers_at_start);
    }

    /// Record a close executed outside the normal buy flow (e.g. shutdown
    /// market close). Returns (net_usd, net_bps).
    pub fn on_external_close_fill(&mut self, fill_price: f64, fee: f64, reason: &str, now: f64) -> (f64, f64) {
        if self.layers.is_empty() || self.total_notional <= 0.0 {
            return (0.0, 0.0);
        }
        let n_layers = self.layers.len();
        let gross: f64 = self
            .layers
            .iter()
            .map(|l| (l.price - fill_price) * l.qty)
            .sum();
        let total_entry_fees: f64 = self.layers.iter().map(|l| l.fee).sum();
        let net = gross - total_entry_fees - fee;
        let bps = net / self.total_notional * 10_000.0;
        self.total_fees += fee;
        self.record_close(net, bps, now, reason, n_layers);
        self.emit_close_event(now, reason, net, bps, n_layers);
        self.reset_grid();
        (net, bps)
    }

    // ─── Order queue ────────────────────────────────────────────────────

    /// Pop all pending intents (called by the orchestrator).
    pub fn drain_orders(&mut self) -> Vec<OrderIntent> {
        std::mem::take(&mut self.order_queue)
    }

    /// Queue an intent and wake the orchestrator.
    pub(crate) fn enqueue_order(&mut self, intent: OrderIntent) {
        self.order_queue.push(intent);
        if let Some(notify) = &self.order_notify {
            notify();
        }
    }

    /// Clear the pending flags after a failed or rejected submission.
    pub fn clear_pending(&mut self) {
        self.pending_order = false;
        self.pending_order_ts = 0.0;
        self.pending_exit = false;
    }

    /// Mark the trader busy while an exit executes outside the tick loop
    /// (resting-TP immediate fills).
    pub fn mark_pending_exit(&mut self, now: f64) {
        self.pending_exit = true;
        self.pending_order = true;
        self.pending_order_ts = now;
    }

    // ─── Close recording ────────────────────────────────────────────────

    /// Record a completed round trip, update the circuit breaker, recovery
    /// debt, and the escalating cooldown.
    pub(crate) fn record_close(&mut self, net_pnl: f64, net_pnl_bps: f64, now: f64, reason: &str, n_layers: usize) {
        let close_notional = self.total_notional.max(0.0);
        self.realized_pnl += net_pnl;
        self.realized_pnl_bps += net_pnl_bps;
        self.total_trades += 1;
        self.session_rpnl += net_pnl;
        self.session_trades += 1;
        self.session_closed_notional += close_notional;
        if net_pnl > 0.0 {
            self.wins += 1;
        }

        // Close prices feed falling-knife detection.
        let close_price = if self.bid > 0.0 { self.bid } else { self.mid };
        if close_price > 0.0 {
            if self.recent_close_prices.len() == 5 {
                self.recent_close_prices.pop_front();
            }
            self.recent_close_prices.push_back(close_price);
        }

        if self.realized_pnl_bps < -self.config.max_loss_bps && self.circuit_breaker_ts == 0.0 {
            warn!(
                symbol = %self.symbol,
                cumulative_bps = format!("{:.1}", self.realized_pnl_bps),
                max_loss_bps = self.config.max_loss_bps,
                "circuit breaker tripped"
            );
            self.circuit_breaker_ts = now;
        }

        self.update_recovery_debt(net_pnl);
        self.register_close_behavior(net_pnl, net_pnl_bps, reason, n_layers, close_notional);

        // Escalating cooldown prevents close→reopen churn. Profitable TP
        // resets the ladder: the regime is favorable.
        if net_pnl > 0.0 && (reason == "tp" || reason == "fast_tp") {
            self.trade_count_for_cooldown = 0;
        } else {
            self.trade_count_for_cooldown += 1;
        }
        let schedule = [
            self.config.loss_cooldown_sec,
            COOLDOWN_SCHEDULE_TAIL[0],
            COOLDOWN_SCHEDULE_TAIL[1],
            COOLDOWN_SCHEDULE_TAIL[2],
        ];
        let idx = (self.trade_count_for_cooldown.max(1) as usize - 1).min(schedule.len() - 1);
        let mut cooldown = schedule[idx];
        if net_pnl < 0.0 && (reason == "stop" || reason == "drawdown") {
            // Extra penalty for panic exits.
            cooldown *= 1.5;
        }
        self.cooldown_until = self.cooldown_until.max(now + cooldown);
    }

    pub(crate) fn register_sell_fill_event(&mut self, price: f64, ts: f64) {
        if self.last_entry_ts > 0.0 && self.last_entry_price > 0.0 {
            let gap = FillGap {
                gap_sec: (ts - self.last_entry_ts).max(0.0),
                gap_bps: (price - self.last_entry_price).abs() / self.last_entry_price * 10_000.0,
            };
            if self.recent_sell_fill_gaps.len() >= self.behavior_cap() {
                self.recent_sell_fill_gaps.pop_front();
            }
            self.recent_sell_fill_gaps.push_back(gap);
        }
        self.last_entry_ts = ts;
        self.last_entry_price = price;
    }

    pub(crate) fn register_close_behavior(
        &mut self,
        net_pnl: f64,
        net_pnl_bps: f64,
        reason: &str,
        n_layers: usize,
        notional: f64,
    ) {
        if self.recent_close_behaviors.len() >= self.behavior_cap() {
            self.recent_close_behaviors.pop_front();
        }
        self.recent_close_behaviors.push_back(CloseBehavior {
            net_usd: net_pnl,
            net_bps: net_pnl_bps,
            reason: reason.to_string(),
            layers: n_layers,
            notional,
        });
    }

    /// Estimate executable net PnL at a close price: layer entry fees (or a
    /// maker estimate where unknown) plus a taker exit estimate.
    /// Returns (net_usd, net_bps).
    pub fn estimate_close_pnl(&self, close_price: f64) -> (f64, f64) {
        let px = close_price;
        if self.layers.is_empty() || self.total_notional <= 0.0 || px <= 0.0 {
            return (0.0, 0.0);
        }
        let unrealized: f64 = self.layers.iter().map(|l| (l.price - px) * l.qty).sum();
        let total_entry_fees: f64 = self
            .layers
            .iter()
            .map(|l| if l.fee > 0.0 { l.fee } else { l.notional * self.config.maker_fee })
            .sum();
        let total_exit_fees = px * self.total_qty * self.config.taker_fee;
        let net = unrealized - total_entry_fees - total_exit_fees;
        (net, net / self.total_notional * 10_000.0)
    }
}
