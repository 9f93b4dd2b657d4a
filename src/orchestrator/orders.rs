// =============================================================================
// Order management — execution loop, fire-and-forget entries, resting TPs
// =============================================================================
//
// Entries are fire-and-forget stealth-sliced GTX sells confirmed through the
// user-data stream. Exits walk a maker → IOC → market ladder. Per symbol at
// most one entry and one resting TP (possibly sliced) exist at once.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::exchange::stealth::{compute_stealth_slices, SliceDirection, StealthParams};
use crate::exchange::FillResult;
use crate::grid::OrderIntent;
use crate::orchestrator::{GridRunner, PendingEntry, RestingTp, TraderHandle, VirtualPosition};
use crate::types::{now_ts, OrderSide, OrderStatus, StopSignal};

/// Resting entries are reaped outright after this age.
const ENTRY_MAX_AGE_SEC: f64 = 8.0;
/// Entries older than this are reaped when the signal has reversed.
const ENTRY_SIGNAL_AGE_SEC: f64 = 2.0;
/// Minimum spacing between amendments of one order.
const AMEND_MIN_INTERVAL_SEC: f64 = 0.5;
/// Resting TPs older than this are re-issued instead of amended.
const TP_REISSUE_AGE_SEC: f64 = 30.0;
/// fast_tp intents older than this are dropped as stale.
const FAST_TP_STALE_MS: f64 = 1200.0;
/// Terminal order ids remembered for duplicate suppression.
const SETTLED_RING_CAP: usize = 256;

impl GridRunner {
    // ── Order loop ──────────────────────────────────────────────────────

    /// Drain and execute queued intents — event-driven with a 50 ms
    /// timeout fallback.
    pub(crate) async fn order_loop(self: Arc<Self>, stop: StopSignal) {
        while !stop.is_set() {
            tokio::select! {
                _ = self.orders_ready.notified() => {}
                _ = tokio::time::sleep(std::time::Duration::from_millis(50)) => {}
                _ = stop.wait() => break,
            }
            if self.is_shutting_down() {
                break;
            }

            let mut batch: Vec<(TraderHandle, OrderIntent)> = Vec::new();
            {
                let traders = self.traders.read();
                for trader in traders.values() {
                    let intents = trader.write().drain_orders();
                    for intent in intents {
                        batch.push((trader.clone(), intent));
                    }
                }
            }

            if !batch.is_empty() {
                let mut futures = Vec::with_capacity(batch.len());
                for (trader, intent) in batch {
                    let runner = Arc::clone(&self);
                    futures.push(tokio::spawn(async move {
                        runner.execute_order(trader, intent).await;
                    }));
                }
                for f in futures {
                    let _ = f.await;
                }
            }
        }
    }

    // ── User-stream callbacks ───────────────────────────────────────────

    /// Terminal-state dedup: each order id is applied at most once.
    fn mark_settled(&self, order_id: &str) -> bool {
        let mut settled = self.settled_orders.lock();
        if settled.iter().any(|oid| oid == order_id) {
            return false;
        }
        if settled.len() >= SETTLED_RING_CAP {
            settled.pop_front();
        }
        settled.push_back(order_id.to_string());
        true
    }

    /// Entry point for user-data-stream order updates. At-least-once
    /// delivery; duplicates after a terminal state are ignored.
    pub async fn handle_order_update(
        self: Arc<Self>,
        order_id: String,
        status: OrderStatus,
        fill: Option<FillResult>,
    ) {
        if !self.mark_settled(&order_id) {
            debug!(order_id = %order_id, "duplicate order update ignored");
            return;
        }

        let entry = self.pending_entries.write().remove(&order_id);
        if let Some(entry) = entry {
            self.handle_entry_fill(&order_id, status, fill, entry).await;
            return;
        }

        let tp_hit = {
            let map = self.resting_tp_orders.read();
            map.iter()
                .find(|(_, tp)| tp.order_id.as_deref() == Some(order_id.as_str()))
                .map(|(symbol, _)| symbol.clone())
        };
        if let Some(symbol) = tp_hit {
            self.handle_tp_fill(&order_id, status, fill, &symbol).await;
        }
    }

    async fn handle_entry_fill(
        self: &Arc<Self>,
        order_id: &str,
        status: OrderStatus,
        fill: Option<FillResult>,
        entry: PendingEntry,
    ) {
        let symbol = entry.symbol.clone();
        {
            let mut active = self.active_entry_orders.write();
            if active.get(&symbol).map(|o| o.as_str()) == Some(order_id) {
                active.remove(&symbol);
            }
        }
        let Some(trader) = self.trader(&symbol) else {
            return;
        };

        match (status, fill) {
            (OrderStatus::Filled, Some(fill)) => {
                let now = now_ts();
                let (excess, total_notional) = {
                    let mut guard = trader.write();
                    let excess = guard.on_sell_fill(
                        fill.avg_price,
                        fill.qty,
                        &fill.order_id,
                        fill.fee,
                        entry.layer_idx,
                        now,
                    );
                    (excess, guard.total_notional)
                };
                self.update_notional_cache(&symbol, total_notional);
                info!(
                    symbol = %symbol,
                    qty = fill.qty,
                    price = fill.avg_price,
                    order_id = &order_id[..order_id.len().min(8)],
                    "entry fill confirmed"
                );
                match excess {
                    Some(excess_qty) if excess_qty > 0.0 => {
                        // The reconciliation loop detects the over-position
                        // and the next pass closes it.
                        warn!(symbol = %symbol, excess_qty, "fill exceeded caps — will reconcile");
                    }
                    _ => {
                        self.schedule_tp_order(&symbol, &trader);
                    }
                }
            }
            _ => {
                trader.write().clear_pending();
                debug!(symbol = %symbol, status = %status, "entry order terminal without fill");
            }
        }
        self.persist_runtime_state(&symbol, &trader).await;
    }

    async fn handle_tp_fill(
        self: &Arc<Self>,
        order_id: &str,
        status: OrderStatus,
        fill: Option<FillResult>,
        symbol: &str,
    ) {
        self.resting_tp_orders.write().remove(symbol);
        let Some(trader) = self.trader(symbol) else {
            return;
        };

        if let (OrderStatus::Filled, Some(fill)) = (status, fill) {
            info!(
                symbol = %symbol,
                qty = fill.qty,
                price = fill.avg_price,
                order_id = &order_id[..order_id.len().min(8)],
                "resting TP filled (maker exit)"
            );
            let now = now_ts();
            let total_notional = {
                let mut guard = trader.write();
                let decision_ask = guard.ask;
                guard.on_buy_fill(
                    fill.avg_price,
                    fill.qty,
                    &fill.order_id,
                    fill.fee,
                    "tp",
                    decision_ask,
                    false,
                    -1,
                    now,
                );
                guard.total_notional
            };
            self.update_notional_cache(symbol, total_notional);
            self.persist_runtime_state(symbol, &trader).await;
        } else {
            debug!(symbol = %symbol, status = %status, "resting TP terminal without fill");
        }
    }

    // ── Resting TP management ───────────────────────────────────────────

    /// Schedule a persistent TP order after an entry fill. Non-blocking.
    pub(crate) fn schedule_tp_order(self: &Arc<Self>, symbol: &str, trader: &TraderHandle) {
        let (tp, qty) = {
            let guard = trader.read();
            (guard.tp_price(), guard.layers.iter().map(|l| l.qty).sum::<f64>())
        };
        if tp <= 0.0 || qty <= 0.0 {
            return;
        }

        let existing = self.resting_tp_orders.write().remove(symbol);
        if let Some(existing) = existing {
            let runner = Arc::clone(self);
            let sym = symbol.to_string();
            tokio::spawn(async move {
                runner.cancel_tp_order(&sym, &existing).await;
            });
        }

        self.resting_tp_orders.write().insert(
            symbol.to_string(),
            RestingTp {
                order_id: None,
                all_order_ids: Vec::new(),
                price: tp,
                qty,
                ts: now_ts(),
                placing: true,
            },
        );

        let runner = Arc::clone(self);
        let sym = symbol.to_string();
        let trader = trader.clone();
        tokio::spawn(async move {
            runner.place_tp_order(&sym, &trader, qty, tp).await;
        });
    }

    /// Cancel every slice of a resting TP.
    async fn cancel_tp_order(&self, symbol: &str, tp: &RestingTp) {
        let Some(executor) = self.executor.clone() else {
            return;
        };
        for oid in tp.order_id.iter().chain(tp.all_order_ids.iter()) {
            executor.cancel_order(oid, symbol).await;
        }
    }

    /// Place a resting GTX buy (TP), stealth-spread across ticks.
    async fn place_tp_order(self: &Arc<Self>, symbol: &str, trader: &TraderHandle, qty: f64, price: f64) {
        let Some(executor) = self.executor.clone() else {
            self.resting_tp_orders.write().remove(symbol);
            return;
        };
        let Some(info) = executor.get_symbol_info(symbol).await else {
            self.resting_tp_orders.write().remove(symbol);
            return;
        };

        let rounded_price = crate::exchange::round_price(price, &info);
        let rounded_qty = crate::exchange::round_qty(qty, &info);
        if rounded_qty < info.min_qty {
            self.resting_tp_orders.write().remove(symbol);
            return;
        }

        let (bid_depth, params) = {
            let guard = trader.read();
            let depth = if guard.min_bid_qty_1m > 0.0 { guard.min_bid_qty_1m } else { guard.bid_qty };
            let params = StealthParams {
                max_fraction: guard.config.stealth_max_l1_fraction,
                max_ticks: guard.config.stealth_max_ticks,
                min_qty: info.min_qty,
                direction: SliceDirection::Down,
                always_split: guard.config.stealth_always_split,
                min_slices: guard.config.stealth_min_slices,
                max_slices: guard.config.stealth_max_slices,
                min_notional: info.min_notional,
            };
            (depth, params)
        };

        let slices =
            compute_stealth_slices(rounded_qty, rounded_price, info.price_step, bid_depth, &params);
        if slices.len() > 1 {
            info!(
                symbol = %symbol,
                slices = slices.len(),
                qty = rounded_qty,
                "stealth TP placement"
            );
        }

        let mut placed: Vec<String> = Vec::new();
        for (slice_qty, slice_price) in slices {
            let s_qty = crate::exchange::round_qty(slice_qty, &info);
            let s_price = crate::exchange::round_price(slice_price, &info);
            if s_qty < info.min_qty {
                continue;
            }

            let Some((order_id, immediate_fill)) =
                executor.rest_limit_buy(symbol, s_qty, s_price).await
            else {
                debug!(symbol = %symbol, "TP slice rejected");
                continue;
            };

            // The TP may have been cancelled while this slice was in flight.
            if !self.resting_tp_orders.read().contains_key(symbol) {
                executor.cancel_order(&order_id, symbol).await;
                for oid in &placed {
                    executor.cancel_order(oid, symbol).await;
                }
                return;
            }

            if let Some(fill) = immediate_fill {
                // Submission response already closed: take the TP now and
                // drop every other slice.
                info!(symbol = %symbol, qty = fill.qty, price = fill.avg_price, "TP filled on placement");
                self.resting_tp_orders.write().remove(symbol);
                let now = now_ts();
                let total_notional = {
                    let mut guard = trader.write();
                    guard.mark_pending_exit(now);
                    let decision_ask = guard.ask;
                    guard.on_buy_fill(
                        fill.avg_price,
                        fill.qty,
                        &fill.order_id,
                        fill.fee,
                        "tp",
                        decision_ask,
                        false,
                        -1,
                        now,
                    );
                    guard.total_notional
                };
                self.update_notional_cache(symbol, total_notional);
                self.persist_runtime_state(symbol, trader).await;
                for oid in &placed {
                    executor.cancel_order(oid, symbol).await;
                }
                return;
            }

            placed.push(order_id);
        }

        let mut map = self.resting_tp_orders.write();
        if placed.is_empty() {
            map.remove(symbol);
            return;
        }
        if let Some(tp) = map.get_mut(symbol) {
            tp.order_id = Some(placed[0].clone());
            tp.all_order_ids = placed.clone();
            tp.placing = false;
            tp.price = rounded_price;
            info!(
                symbol = %symbol,
                qty = rounded_qty,
                price = rounded_price,
                slices = placed.len(),
                "resting TP placed"
            );
        }
    }

    /// Manage resting entry orders: amend toward the live ask, reap on age
    /// or signal reversal.
    pub(crate) async fn manage_resting_entries(self: Arc<Self>, stop: StopSignal) {
        let Some(executor) = self.executor.clone() else {
            return;
        };
        while !stop.is_set() {
            if stop.sleep_interruptible(0.5).await {
                break;
            }
            let now = now_ts();
            let entries: Vec<(String, PendingEntry)> = self
                .pending_entries
                .read()
                .iter()
                .map(|(oid, e)| (oid.clone(), e.clone()))
                .collect();

            for (oid, entry) in entries {
                let symbol = entry.symbol.clone();
                let Some(trader) = self.trader(&symbol) else {
                    continue;
                };
                let age = now - entry.ts;

                if age > ENTRY_MAX_AGE_SEC {
                    self.reap_entry(&oid, &symbol, &trader).await;
                    warn!(symbol = %symbol, age = format!("{age:.1}"), "entry reaped (max age)");
                    continue;
                }

                if age > ENTRY_SIGNAL_AGE_SEC && !trader.read().signal_still_valid() {
                    self.reap_entry(&oid, &symbol, &trader).await;
                    info!(symbol = %symbol, age = format!("{age:.1}"), "entry reaped (signal reversed)");
                    continue;
                }

                let current_ask = trader.read().ask;
                if current_ask <= 0.0 {
                    continue;
                }
                if now - entry.last_amend_ts < AMEND_MIN_INTERVAL_SEC {
                    continue;
                }
                if (current_ask - entry.ref_price).abs() / entry.ref_price.max(1e-20) < 1e-8 {
                    continue;
                }

                match executor
                    .amend_order(&oid, &symbol, OrderSide::Sell, entry.qty, current_ask)
                    .await
                {
                    Some(new_id) => {
                        let mut map = self.pending_entries.write();
                        if let Some(tracked) = map.remove(&oid) {
                            let mut updated = tracked;
                            updated.ref_price = current_ask;
                            updated.last_amend_ts = now;
                            updated.amend_count += 1;
                            map.insert(new_id.clone(), updated);
                        }
                        if new_id != oid {
                            let mut active = self.active_entry_orders.write();
                            if active.get(&symbol).map(|o| o.as_str()) == Some(oid.as_str()) {
                                active.insert(symbol.clone(), new_id.clone());
                            }
                        }
                        debug!(symbol = %symbol, price = current_ask, "entry amended");
                    }
                    None => {
                        self.reap_entry(&oid, &symbol, &trader).await;
                        info!(symbol = %symbol, "entry amend failed — reaped");
                    }
                }
            }
        }
    }

    async fn reap_entry(&self, order_id: &str, symbol: &str, trader: &TraderHandle) {
        self.pending_entries.write().remove(order_id);
        trader.write().clear_pending();
        {
            let mut active = self.active_entry_orders.write();
            if active.get(symbol).map(|o| o.as_str()) == Some(order_id) {
                active.remove(symbol);
            }
        }
        if let Some(executor) = &self.executor {
            executor.cancel_order(order_id, symbol).await;
        }
    }

    /// Manage resting TP orders: follow price/qty, re-issue stale orders,
    /// drop TPs whose position is gone.
    pub(crate) async fn manage_resting_tp_orders(self: Arc<Self>, stop: StopSignal) {
        let Some(executor) = self.executor.clone() else {
            return;
        };
        while !stop.is_set() {
            if stop.sleep_interruptible(0.5).await {
                break;
            }
            let now = now_ts();
            let tps: Vec<(String, RestingTp)> = self
                .resting_tp_orders
                .read()
                .iter()
                .filter(|(_, tp)| !tp.placing && tp.order_id.is_some())
                .map(|(s, tp)| (s.clone(), tp.clone()))
                .collect();

            for (symbol, tp) in tps {
                let Some(trader) = self.trader(&symbol) else {
                    continue;
                };
                let order_id = tp.order_id.clone().unwrap_or_default();

                // Position gone → nothing left to take profit on.
                if trader.read().layers.is_empty() {
                    self.resting_tp_orders.write().remove(&symbol);
                    self.cancel_tp_order(&symbol, &tp).await;
                    continue;
                }

                let current_tp = trader.read().tp_price();
                let info = executor.get_symbol_info(&symbol).await;
                let rounded_tp = match &info {
                    Some(i) => crate::exchange::round_price(current_tp, i),
                    None => current_tp,
                };

                // Stale: re-issue unless the target is unchanged.
                if now - tp.ts > TP_REISSUE_AGE_SEC {
                    if current_tp > 0.0
                        && (rounded_tp - tp.price).abs() / tp.price.max(1e-20) < 1e-8
                    {
                        if let Some(entry) = self.resting_tp_orders.write().get_mut(&symbol) {
                            entry.ts = now;
                        }
                        continue;
                    }
                    self.resting_tp_orders.write().remove(&symbol);
                    self.cancel_tp_order(&symbol, &tp).await;
                    self.schedule_tp_order(&symbol, &trader);
                    continue;
                }

                if current_tp <= 0.0 {
                    continue;
                }

                let current_qty: f64 = trader.read().layers.iter().map(|l| l.qty).sum();
                let price_same = (rounded_tp - tp.price).abs() / tp.price.max(1e-20) < 1e-8;
                let qty_same = (current_qty - tp.qty).abs() / tp.qty.max(1e-20) < 1e-6;
                if price_same && qty_same {
                    continue;
                }

                match executor
                    .amend_order(&order_id, &symbol, OrderSide::Buy, current_qty, rounded_tp)
                    .await
                {
                    Some(new_id) => {
                        let mut map = self.resting_tp_orders.write();
                        if let Some(entry) = map.get_mut(&symbol) {
                            if entry.order_id.as_deref() == Some(order_id.as_str()) {
                                entry.order_id = Some(new_id.clone());
                                for oid in entry.all_order_ids.iter_mut() {
                                    if oid.as_str() == order_id.as_str() {
                                        *oid = new_id.clone();
                                    }
                                }
                                entry.price = rounded_tp;
                                entry.qty = current_qty;
                            }
                        }
                        debug!(symbol = %symbol, price = rounded_tp, "resting TP amended");
                    }
                    None => {
                        self.resting_tp_orders.write().remove(&symbol);
                        self.cancel_tp_order(&symbol, &tp).await;
                        self.schedule_tp_order(&symbol, &trader);
                    }
                }
            }
        }
    }

    // ── Virtual position close ──────────────────────────────────────────

    /// Close a virtual position through the PMS REST API. Zero exchange
    /// orders are submitted for these symbols.
    async fn close_virtual_position(
        self: &Arc<Self>,
        symbol: &str,
        trader: &TraderHandle,
        reason: &str,
        bid: f64,
        ask: f64,
        vp: VirtualPosition,
    ) {
        let close_price = if bid > 0.0 {
            bid
        } else if ask > 0.0 {
            ask
        } else {
            trader.read().bid
        };
        if vp.id.is_empty() || close_price <= 0.0 {
            warn!(symbol = %symbol, "virtual close skipped: missing id or price");
            trader.write().clear_pending();
            return;
        }

        let url = format!("{}/babysitter/close-position", self.config.pms_api_url);
        let payload = serde_json::json!({
            "positionId": vp.id,
            "closePrice": close_price,
            "reason": reason.to_uppercase(),
        });

        info!(
            symbol = %symbol,
            id = &vp.id[..vp.id.len().min(8)],
            close_price,
            reason,
            "closing virtual position via PMS"
        );

        match self.http.post(&url).json(&payload).send().await {
            Ok(resp) => match resp.json::<serde_json::Value>().await {
                Ok(result) if result["success"].as_bool() == Some(true) => {
                    info!(symbol = %symbol, "virtual position closed via PMS");
                    self.virtual_positions.write().remove(symbol);
                    trader
                        .write()
                        .sync_with_exchange_position(0.0, 0.0, "virtual_close", 0, now_ts());
                    self.update_notional_cache(symbol, 0.0);
                    self.resting_tp_orders.write().remove(symbol);
                    self.persist_runtime_state(symbol, trader).await;
                }
                Ok(result) => {
                    error!(symbol = %symbol, error = %result["error"], "PMS virtual close failed");
                }
                Err(e) => {
                    error!(symbol = %symbol, error = %e, "PMS virtual close: bad response");
                }
            },
            Err(e) => {
                error!(symbol = %symbol, error = %e, "PMS virtual close request failed");
            }
        }

        trader.write().clear_pending();
    }

    // ── Order execution ─────────────────────────────────────────────────

    /// Execute one intent. Entries are fire-and-forget; exits walk the
    /// blocking maker → IOC → market ladder.
    pub(crate) async fn execute_order(self: Arc<Self>, trader: TraderHandle, intent: OrderIntent) {
        let Some(executor) = self.executor.clone() else {
            trader.write().clear_pending();
            return;
        };

        match intent {
            OrderIntent::Sell { symbol, qty, layer_idx, ref_price } => {
                // Portfolio cap re-check at execution time.
                let est_notional = ref_price.max(0.0) * qty.max(0.0);
                let projected = self.portfolio_total_notional() + est_notional;
                if projected > self.config.max_total_notional {
                    warn!(
                        symbol = %symbol,
                        projected = format!("{projected:.0}"),
                        cap = format!("{:.0}", self.config.max_total_notional),
                        "entry skipped — portfolio cap"
                    );
                    trader.write().clear_pending();
                    return;
                }

                // Cancel every still-alive slice from a previous fire so no
                // stale entry order leaks.
                let stale: Vec<String> = self
                    .pending_entries
                    .read()
                    .iter()
                    .filter(|(_, e)| e.symbol == symbol)
                    .map(|(oid, _)| oid.clone())
                    .collect();
                for oid in &stale {
                    self.pending_entries.write().remove(oid);
                    executor.cancel_order(oid, &symbol).await;
                }
                if !stale.is_empty() {
                    info!(symbol = %symbol, count = stale.len(), "cancelled stale entry slices before re-fire");
                }
                self.active_entry_orders.write().remove(&symbol);

                let info = executor.get_symbol_info(&symbol).await;
                let (ask_depth, params) = {
                    let guard = trader.read();
                    let depth = if guard.min_ask_qty_1m > 0.0 {
                        guard.min_ask_qty_1m
                    } else {
                        guard.ask_qty
                    };
                    let params = StealthParams {
                        max_fraction: guard.config.stealth_max_l1_fraction,
                        max_ticks: guard.config.stealth_max_ticks,
                        min_qty: info.as_ref().map(|i| i.min_qty).unwrap_or(0.0),
                        direction: SliceDirection::Up,
                        always_split: guard.config.stealth_always_split,
                        min_slices: guard.config.stealth_min_slices,
                        max_slices: guard.config.stealth_max_slices,
                        min_notional: info.as_ref().map(|i| i.min_notional).unwrap_or(5.0),
                    };
                    (depth, params)
                };
                let price_step = info.as_ref().map(|i| i.price_step).unwrap_or(0.0);

                let slices =
                    compute_stealth_slices(qty, ref_price, price_step, ask_depth, &params);
                if slices.len() > 1 {
                    info!(symbol = %symbol, slices = slices.len(), qty, "stealth entry");
                }

                let now = now_ts();
                let mut first_oid: Option<String> = None;
                for (slice_qty, slice_price) in slices {
                    let Some(oid) = executor.fire_limit_sell(&symbol, slice_qty, slice_price).await
                    else {
                        continue;
                    };
                    if first_oid.is_none() {
                        first_oid = Some(oid.clone());
                    }
                    self.pending_entries.write().insert(
                        oid,
                        PendingEntry {
                            symbol: symbol.clone(),
                            layer_idx,
                            ref_price: slice_price,
                            qty: slice_qty,
                            ts: now,
                            last_amend_ts: 0.0,
                            amend_count: 0,
                        },
                    );
                }

                match first_oid {
                    Some(oid) => {
                        self.active_entry_orders.write().insert(symbol.clone(), oid);
                    }
                    None => {
                        trader.write().clear_pending();
                    }
                }
            }

            OrderIntent::Buy {
                symbol,
                qty,
                reason,
                est_pnl_bps: _,
                est_pnl_usd: _,
                n_layers: _,
                bid,
                ask,
                signal_ts,
                min_net_bps,
                partial_tp,
                inverse_tp_zone,
            } => {
                // Virtual positions close through the PMS, never the venue.
                let vp = self.virtual_positions.read().get(&symbol).cloned();
                if let Some(vp) = vp {
                    self.close_virtual_position(&symbol, &trader, &reason, bid, ask, vp)
                        .await;
                    return;
                }

                // A working TP must not race the active close.
                let resting = self.resting_tp_orders.write().remove(&symbol);
                if let Some(resting) = resting {
                    self.cancel_tp_order(&symbol, &resting).await;
                }

                let now = now_ts();
                if reason == "tp" || reason == "fast_tp" {
                    // The signal is an estimate from decision time; re-check
                    // executable PnL at the live ask before paying fees.
                    let (exec_ask, cur_net_usd, cur_net_bps) = {
                        let guard = trader.read();
                        let exec_ask = if guard.ask > 0.0 { guard.ask } else { ask };
                        let (usd, bps) = guard.estimate_close_pnl(exec_ask);
                        (exec_ask, usd, bps)
                    };
                    if exec_ask <= 0.0 {
                        trader.write().clear_pending();
                        return;
                    }
                    let signal_age_ms = if signal_ts > 0.0 { (now - signal_ts) * 1000.0 } else { 0.0 };
                    if cur_net_bps < min_net_bps {
                        info!(
                            symbol = %symbol,
                            reason = %reason,
                            now_bps = format!("{cur_net_bps:+.2}"),
                            min_bps = format!("{min_net_bps:+.2}"),
                            age_ms = format!("{signal_age_ms:.0}"),
                            est_usd = format!("{cur_net_usd:+.4}"),
                            "close skipped — stale signal"
                        );
                        trader.write().clear_pending();
                        return;
                    }
                    if reason == "fast_tp" && signal_age_ms > FAST_TP_STALE_MS {
                        info!(
                            symbol = %symbol,
                            age_ms = format!("{signal_age_ms:.0}"),
                            "fast_tp skipped — signal too old"
                        );
                        trader.write().clear_pending();
                        return;
                    }
                }

                let (exec_bid, exec_ask) = {
                    let guard = trader.read();
                    (
                        if guard.bid > 0.0 { guard.bid } else { bid },
                        if guard.ask > 0.0 { guard.ask } else { ask },
                    )
                };

                // 1. Maker exit for non-panic reasons.
                let mut fill: Option<FillResult> = None;
                let panic_exit = matches!(reason.as_str(), "stop" | "shutdown" | "drawdown" | "timeout");
                if exec_bid > 0.0 && !panic_exit {
                    if let Some(info) = executor.get_symbol_info(&symbol).await {
                        let maker_price = exec_bid + info.price_step;
                        fill = executor.limit_buy(&symbol, qty, maker_price).await;
                        if fill.is_some() {
                            info!(symbol = %symbol, price = maker_price, "maker exit filled (saved taker fee)");
                        }
                    }
                }

                // 2. IOC at the ask.
                if fill.is_none() && exec_ask > 0.0 {
                    fill = executor.ioc_buy(&symbol, qty, exec_ask).await;
                    if fill.is_some() {
                        debug!(symbol = %symbol, "IOC exit filled");
                    }
                }

                // 3. Market sweep.
                if fill.is_none() {
                    fill = executor.market_buy(&symbol, qty).await;
                }

                let Some(mut fill) = fill else {
                    error!(symbol = %symbol, "close failed all three methods — syncing from exchange");
                    self.sync_trader_from_exchange(&symbol, &trader, "buy_failed").await;
                    return;
                };

                // Partial close below the requested quantity: sweep the
                // remainder, then hand off to reconciliation if still short.
                if fill.qty + 1e-9 < qty && !partial_tp {
                    let remaining = (qty - fill.qty).max(0.0);
                    warn!(
                        symbol = %symbol,
                        filled = fill.qty,
                        requested = qty,
                        remaining,
                        reason = %reason,
                        "partial close — sweeping remainder"
                    );
                    if let Some(sweep) = executor.market_buy(&symbol, remaining).await {
                        let total_qty = fill.qty + sweep.qty;
                        if total_qty > 0.0 {
                            fill.avg_price = (fill.avg_price * fill.qty
                                + sweep.avg_price * sweep.qty)
                                / total_qty;
                        }
                        fill.qty = total_qty;
                        fill.fee += sweep.fee;
                        fill.order_id = format!("{}+{}", fill.order_id, sweep.order_id);
                    }
                }
                if fill.qty + 1e-9 < qty && !partial_tp {
                    error!(
                        symbol = %symbol,
                        filled = fill.qty,
                        requested = qty,
                        "close incomplete after sweep — syncing local grid to exchange"
                    );
                    self.sync_trader_from_exchange(&symbol, &trader, "partial_close").await;
                    return;
                }

                let total_notional = {
                    let mut guard = trader.write();
                    guard.on_buy_fill(
                        fill.avg_price,
                        fill.qty,
                        &fill.order_id,
                        fill.fee,
                        &reason,
                        ask,
                        partial_tp,
                        inverse_tp_zone,
                        now,
                    );
                    guard.total_notional
                };
                self.update_notional_cache(&symbol, total_notional);
                self.persist_runtime_state(&symbol, &trader).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use crate::exchange::{ExchangeExecutor, OrderUpdateHandler, PositionInfo, SymbolInfo};
    use crate::orchestrator::VirtualPosition;
    use crate::runtime_config::RunnerConfig;
    use crate::store::StateStore;

    /// Scripted executor: GTX sells always rest, maker exits never fill,
    /// IOC fills in full at the requested price.
    #[derive(Default)]
    struct StubExecutor {
        next_id: AtomicU64,
        fired_sells: Mutex<Vec<(String, f64, f64)>>,
        ioc_buys: Mutex<Vec<(String, f64, f64)>>,
        market_buys: Mutex<Vec<(String, f64)>>,
    }

    impl StubExecutor {
        fn fill(&self, symbol: &str, side: crate::types::OrderSide, qty: f64, price: f64) -> FillResult {
            FillResult {
                order_id: format!("stub-{}", self.next_id.fetch_add(1, Ordering::SeqCst)),
                symbol: symbol.to_string(),
                side,
                qty,
                avg_price: price,
                cost: qty * price,
                fee: qty * price * 0.000336,
                is_maker: false,
                timestamp: 0.0,
            }
        }

        fn total_exchange_orders(&self) -> usize {
            self.fired_sells.lock().len() + self.ioc_buys.lock().len() + self.market_buys.lock().len()
        }
    }

    #[async_trait]
    impl ExchangeExecutor for StubExecutor {
        async fn get_symbol_info(&self, symbol: &str) -> Option<SymbolInfo> {
            Some(SymbolInfo {
                symbol: symbol.to_string(),
                min_qty: 0.0001,
                qty_step: 0.0001,
                price_step: 0.1,
                price_precision: 1,
                qty_precision: 4,
                min_notional: 5.0,
            })
        }

        async fn fire_limit_sell(&self, symbol: &str, qty: f64, price: f64) -> Option<String> {
            self.fired_sells.lock().push((symbol.to_string(), qty, price));
            Some(format!("sell-{}", self.next_id.fetch_add(1, Ordering::SeqCst)))
        }

        async fn limit_buy(&self, _symbol: &str, _qty: f64, _price: f64) -> Option<FillResult> {
            None
        }

        async fn rest_limit_buy(
            &self,
            _symbol: &str,
            _qty: f64,
            _price: f64,
        ) -> Option<(String, Option<FillResult>)> {
            Some((
                format!("tp-{}", self.next_id.fetch_add(1, Ordering::SeqCst)),
                None,
            ))
        }

        async fn ioc_buy(&self, symbol: &str, qty: f64, price: f64) -> Option<FillResult> {
            self.ioc_buys.lock().push((symbol.to_string(), qty, price));
            Some(self.fill(symbol, crate::types::OrderSide::Buy, qty, price))
        }

        async fn market_buy(&self, symbol: &str, qty: f64) -> Option<FillResult> {
            self.market_buys.lock().push((symbol.to_string(), qty));
            Some(self.fill(symbol, crate::types::OrderSide::Buy, qty, 1.0))
        }

        async fn amend_order(
            &self,
            order_id: &str,
            _symbol: &str,
            _side: OrderSide,
            _qty: f64,
            _price: f64,
        ) -> Option<String> {
            Some(order_id.to_string())
        }

        async fn cancel_order(&self, _order_id: &str, _symbol: &str) -> bool {
            true
        }

        async fn cancel_all_symbol_orders(&self, _symbol: &str) -> usize {
            0
        }

        async fn cancel_all_tracked_orders(&self) -> usize {
            0
        }

        async fn get_positions(&self) -> HashMap<String, PositionInfo> {
            HashMap::new()
        }

        async fn set_leverage(&self, _symbol: &str, _leverage: u32) -> anyhow::Result<()> {
            Ok(())
        }

        fn set_order_update_handler(&self, _handler: OrderUpdateHandler) {}

        async fn start_user_stream(self: Arc<Self>) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn runner_with_stub() -> (Arc<GridRunner>, Arc<StubExecutor>) {
        let stub = Arc::new(StubExecutor::default());
        let config = RunnerConfig {
            symbols: vec!["BTCUSDT".to_string()],
            vol_drift_enabled: false,
            ..Default::default()
        };
        let runner = GridRunner::new(
            config,
            Some(stub.clone() as Arc<dyn ExchangeExecutor>),
            StateStore::disabled("acct-stub"),
            "acct-stub".to_string(),
        );
        (runner, stub)
    }

    #[tokio::test]
    async fn duplicate_order_updates_are_ignored() {
        let (runner, _stub) = runner_with_stub();
        assert!(runner.mark_settled("order-1"));
        assert!(!runner.mark_settled("order-1"));
        assert!(runner.mark_settled("order-2"));
    }

    #[tokio::test]
    async fn entry_rejected_at_portfolio_cap_clears_pending() {
        let (runner, stub) = runner_with_stub();
        let trader = runner.spawn_trader("BTCUSDT").await;
        runner.update_notional_cache("ETHUSDT", 295.0);
        // Simulate the gate having set pending before the intent landed.
        {
            let mut guard = trader.write();
            guard.bid = 49_995.0;
            guard.ask = 50_000.0;
            guard.mark_pending_exit(0.0);
        }

        runner
            .clone()
            .execute_order(
                trader.clone(),
                OrderIntent::Sell {
                    symbol: "BTCUSDT".to_string(),
                    qty: 8.0 / 50_000.0,
                    layer_idx: 0,
                    ref_price: 50_000.0,
                },
            )
            .await;

        // Projected 295 + 8 > 300: nothing fired, flags cleared.
        assert_eq!(stub.fired_sells.lock().len(), 0);
        assert!(!trader.read().is_pending());
        assert!(runner.pending_entries.read().is_empty());
    }

    #[tokio::test]
    async fn entry_fires_slices_and_tracks_them() {
        let (runner, stub) = runner_with_stub();
        let trader = runner.spawn_trader("BTCUSDT").await;
        {
            let mut guard = trader.write();
            guard.bid = 49_995.0;
            guard.ask = 50_000.0;
            guard.ask_qty = 100.0;
        }

        runner
            .clone()
            .execute_order(
                trader.clone(),
                OrderIntent::Sell {
                    symbol: "BTCUSDT".to_string(),
                    qty: 12.0 / 50_000.0,
                    layer_idx: 0,
                    ref_price: 50_000.0,
                },
            )
            .await;

        let fired = stub.fired_sells.lock();
        assert!(!fired.is_empty());
        let total: f64 = fired.iter().map(|(_, q, _)| q).sum();
        assert!((total - 12.0 / 50_000.0).abs() < 1e-9);
        assert_eq!(runner.pending_entries.read().len(), fired.len());
        assert!(runner.active_entry_orders.read().contains_key("BTCUSDT"));
    }

    #[tokio::test]
    async fn close_falls_back_to_ioc_and_applies_fill() {
        let (runner, stub) = runner_with_stub();
        let trader = runner.spawn_trader("BTCUSDT").await;
        let qty = {
            let mut guard = trader.write();
            guard.bid = 49_895.0;
            guard.ask = 49_900.0;
            let qty = 12.0 / 50_000.0;
            assert!(guard
                .on_sell_fill(50_000.0, qty, "seed", 0.003, 0, 100.0)
                .is_none());
            guard.mark_pending_exit(101.0);
            qty
        };

        runner
            .execute_order(
                trader.clone(),
                OrderIntent::Buy {
                    symbol: "BTCUSDT".to_string(),
                    qty,
                    reason: "tp".to_string(),
                    n_layers: 1,
                    est_pnl_bps: 14.0,
                    est_pnl_usd: 0.016,
                    bid: 49_895.0,
                    ask: 49_900.0,
                    signal_ts: crate::types::now_ts(),
                    min_net_bps: 0.0,
                    partial_tp: false,
                    inverse_tp_zone: -1,
                },
            )
            .await;

        // Maker leg never fills in the stub, so the IOC leg takes it.
        assert_eq!(stub.ioc_buys.lock().len(), 1);
        assert!(stub.market_buys.lock().is_empty());
        let guard = trader.read();
        assert!(guard.layers.is_empty());
        assert_eq!(guard.total_trades, 1);
        assert!(guard.realized_pnl > 0.0);
        assert!(!guard.is_pending());
    }

    #[tokio::test]
    async fn virtual_symbol_close_submits_no_exchange_orders() {
        let (runner, stub) = runner_with_stub();
        let adopted = runner
            .register_virtual_position(VirtualPosition {
                id: "vp-42".to_string(),
                symbol: "DOGE/USDT:USDT".to_string(),
                side: "short".to_string(),
                entry_price: 0.25,
                quantity: 100.0,
                notional: 25.0,
            })
            .await;
        assert!(adopted);
        let trader = runner.trader("DOGEUSDT").unwrap();
        {
            let mut guard = trader.write();
            guard.bid = 0.2490;
            guard.ask = 0.2491;
            guard.mark_pending_exit(0.0);
        }

        runner
            .execute_order(
                trader.clone(),
                OrderIntent::Buy {
                    symbol: "DOGEUSDT".to_string(),
                    qty: 100.0,
                    reason: "tp".to_string(),
                    n_layers: 4,
                    est_pnl_bps: 40.0,
                    est_pnl_usd: 0.1,
                    bid: 0.2490,
                    ask: 0.2491,
                    signal_ts: crate::types::now_ts(),
                    min_net_bps: 0.0,
                    partial_tp: false,
                    inverse_tp_zone: -1,
                },
            )
            .await;

        // The close went to the PMS HTTP endpoint (which is down here), not
        // the exchange; either way zero venue orders are submitted and the
        // trader is unblocked.
        assert_eq!(stub.total_exchange_orders(), 0);
        assert!(!trader.read().is_pending());
    }
}
