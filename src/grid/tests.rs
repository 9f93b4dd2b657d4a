// =============================================================================
// Grid trader tests — gate mechanics, fills, inverse TP, persistence
// =============================================================================

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::grid::{GridConfig, GridTrader, OrderIntent};
use crate::volatility::VolatilityConfig;

fn test_config() -> GridConfig {
    GridConfig {
        symbol: "BTCUSDT".to_string(),
        vol: VolatilityConfig {
            enabled: false,
            ..Default::default()
        },
        // Signal-score calibration is covered by the signal tests; here the
        // composite thresholds are opened up so gate mechanics are
        // deterministic under synthetic ticks.
        pump_threshold: -10.0,
        exhaust_threshold: -10.0,
        ..Default::default()
    }
}

/// Feed ~40s of flat book/trade ticks at 7bp spread around 50000 so warmup,
/// median spread, and signal warmth are all satisfied.
fn warm_trader(mut config: GridConfig) -> GridTrader {
    config.symbol = "BTCUSDT".to_string();
    let mut trader = GridTrader::new(config, 1_000.0);
    trader.set_entry_enabled(false, "test_warmup");
    let (bid, ask) = (49_982.5, 50_017.5);
    let mut ts = 1_000.0;
    for i in 0..400 {
        trader.on_book(bid, ask, 10.0, 10.0, ts);
        if i % 2 == 0 {
            trader.on_trade(50_000.0, 1.0, i % 4 == 0, ts);
        }
        ts += 0.1;
    }
    trader.set_entry_enabled(true, "test_warmup");
    trader
}

fn fill_layer(trader: &mut GridTrader, price: f64, notional: f64, layer_idx: usize, now: f64) {
    let qty = notional / price;
    let fee = notional * trader.config.maker_fee;
    let excess = trader.on_sell_fill(price, qty, &format!("oid-{layer_idx}"), fee, layer_idx, now);
    assert!(excess.is_none());
}

// ---------------------------------------------------------------------------
// Invariants
// ---------------------------------------------------------------------------

#[test]
fn totals_track_layer_list() {
    let mut trader = warm_trader(test_config());
    let now = 1_100.0;
    fill_layer(&mut trader, 50_000.0, 10.0, 0, now);
    fill_layer(&mut trader, 50_100.0, 12.0, 1, now + 5.0);

    let sum_qty: f64 = trader.layers.iter().map(|l| l.qty).sum();
    let sum_notional: f64 = trader.layers.iter().map(|l| l.notional).sum();
    assert!((trader.total_qty - sum_qty).abs() < 1e-12);
    assert!((trader.total_notional - sum_notional).abs() < 1e-12);
    assert!(
        (trader.avg_entry_price * trader.total_qty - trader.total_notional).abs()
            / trader.total_notional
            < 1e-8
    );
}

#[test]
fn spread_scaled_notional_interpolates() {
    let trader = GridTrader::new(test_config(), 0.0);
    // min_spread 5 → min_notional; 3× min spread → max_notional.
    assert!((trader.spread_scaled_notional(5.0) - 6.0).abs() < 1e-9);
    assert!((trader.spread_scaled_notional(15.0) - 30.0).abs() < 1e-9);
    assert!((trader.spread_scaled_notional(10.0) - 18.0).abs() < 1e-9);
    // Clamped outside the band.
    assert!((trader.spread_scaled_notional(1.0) - 6.0).abs() < 1e-9);
    assert!((trader.spread_scaled_notional(100.0) - 30.0).abs() < 1e-9);
}

#[test]
fn averaging_min_spread_boundary() {
    let mut trader = warm_trader(test_config());
    let now = 1_100.0;
    fill_layer(&mut trader, 50_000.0, 10.0, 0, now);

    // Exactly at the threshold depth the full min spread still applies.
    // unrealized = -35bp → bid = avg_entry * (1 + 35/10000).
    let avg = trader.avg_entry_price;
    let bid = avg * (1.0 + 35.0 / 10_000.0);
    trader.bid = bid;
    assert!((trader.unrealized_bps() + 35.0).abs() < 0.01);
    assert!((trader.averaging_min_spread() - trader.config.min_spread_bps).abs() < 1e-9);

    // Deeply underwater the requirement eases toward the 0.15× floor.
    trader.bid = avg * (1.0 + 500.0 / 10_000.0);
    let relaxed = trader.averaging_min_spread();
    assert!(relaxed < trader.config.min_spread_bps);
    assert!(relaxed >= trader.config.min_spread_bps * 0.15 - 1e-9);
}

#[test]
fn short_pnl_sign_follows_price() {
    let mut trader = warm_trader(test_config());
    fill_layer(&mut trader, 50_000.0, 10.0, 0, 1_100.0);
    // Short profits when price drops.
    let (down_usd, down_bps) = trader.estimate_close_pnl(49_500.0);
    assert!(down_usd > 0.0 && down_bps > 0.0);
    let (up_usd, up_bps) = trader.estimate_close_pnl(50_500.0);
    assert!(up_usd < 0.0 && up_bps < 0.0);
}

#[test]
fn recovery_debt_clamped_to_cap() {
    let mut trader = GridTrader::new(test_config(), 0.0);
    trader.update_recovery_debt(-100.0);
    assert!((trader.recovery_debt_usd - 75.0).abs() < 1e-12);
    trader.update_recovery_debt(50.0);
    assert!((trader.recovery_debt_usd - 25.0).abs() < 1e-12);
    trader.update_recovery_debt(100.0);
    assert_eq!(trader.recovery_debt_usd, 0.0);
}

// ---------------------------------------------------------------------------
// Scenario: entry → fill → TP exit
// ---------------------------------------------------------------------------

#[test]
fn entry_fill_then_tp_exit() {
    let mut trader = warm_trader(test_config());
    let mut now = trader.last_book_ts + 0.1;

    // Trigger tick: all gates open → Sell intent, pending set.
    trader.on_book(49_982.5, 50_017.5, 10.0, 10.0, now);
    let orders = trader.drain_orders();
    assert_eq!(orders.len(), 1);
    let OrderIntent::Sell { qty, layer_idx, ref_price, .. } = &orders[0] else {
        panic!("expected sell intent");
    };
    assert_eq!(*layer_idx, 0);
    assert!(*qty > 0.0);
    assert!((*ref_price - 50_017.5).abs() < 1e-9);
    assert!(trader.is_pending());

    // While pending, no further intents are enqueued.
    now += 0.1;
    trader.on_book(49_982.5, 50_017.5, 10.0, 10.0, now);
    assert!(trader.drain_orders().is_empty());

    // Fill confirmation at 50035, $12 notional.
    now += 0.1;
    let fill_qty = 12.0 / 50_035.0;
    let excess = trader.on_sell_fill(50_035.0, fill_qty, "oid-0", 12.0 * 0.000252, 0, now);
    assert!(excess.is_none());
    assert!(!trader.is_pending());
    assert_eq!(trader.layers.len(), 1);

    // -9bp from entry: under the 10bp floor, no exit.
    now += 0.5;
    trader.on_book(49_965.0, 49_990.0, 10.0, 10.0, now);
    assert!(trader.drain_orders().is_empty());

    // -11bp from entry: TP fires; single layer → direct full close.
    now += 0.5;
    trader.on_book(49_955.0, 49_980.0, 10.0, 10.0, now);
    let orders = trader.drain_orders();
    assert_eq!(orders.len(), 1);
    let OrderIntent::Buy { reason, qty, n_layers, partial_tp, min_net_bps, .. } = &orders[0] else {
        panic!("expected buy intent");
    };
    assert_eq!(reason, "tp");
    assert_eq!(*n_layers, 1);
    assert!(!*partial_tp);
    assert!((*qty - fill_qty).abs() < 1e-12);
    assert!(*min_net_bps >= 0.0);
    assert!(trader.is_pending());

    // Maker-exit fill near the bid: profitable close, cooldown ladder resets.
    now += 0.2;
    trader.on_buy_fill(49_966.0, fill_qty, "oid-c", 0.004, "tp", 49_980.0, false, -1, now);
    assert!(trader.layers.is_empty());
    assert_eq!(trader.total_trades, 1);
    assert_eq!(trader.wins, 1);
    assert!(trader.realized_pnl > 0.0);
    assert_eq!(trader.recovery_debt_usd, 0.0);
    assert_eq!(trader.trade_count_for_cooldown, 0);
    assert!(!trader.is_pending());
}

#[test]
fn portfolio_cap_rejection_leaves_state_untouched() {
    let mut trader = warm_trader(test_config());
    trader.set_portfolio_check(Arc::new(|_| false));
    let now = trader.last_book_ts + 0.1;
    trader.on_book(49_982.5, 50_017.5, 10.0, 10.0, now);
    assert!(trader.drain_orders().is_empty());
    assert!(!trader.is_pending());
    assert!(trader.layers.is_empty());
}

#[test]
fn order_notify_fires_on_enqueue() {
    let mut trader = warm_trader(test_config());
    let count = Arc::new(AtomicUsize::new(0));
    let counter = count.clone();
    trader.set_order_notify(Arc::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    }));
    let now = trader.last_book_ts + 0.1;
    trader.on_book(49_982.5, 50_017.5, 10.0, 10.0, now);
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

// ---------------------------------------------------------------------------
// Scenario: averaging under the spacing gate
// ---------------------------------------------------------------------------

#[test]
fn averaging_blocked_then_fires_on_spacing() {
    let mut config = test_config();
    config.base_spacing_bps = 7.0;
    config.trend_spacing_scale = 0.0;
    config.recovery_avg_enabled = false;
    config.min_edge_bps = 0.5;
    let mut trader = warm_trader(config);
    let mut now = trader.last_book_ts + 0.1;

    fill_layer(&mut trader, 50_035.0, 12.0, 0, now);
    now += 5.0; // clear the entry cooldown

    // Rise of ~1bp < 7bp required spacing → no averaging intent.
    trader.on_book(50_005.0, 50_040.0, 10.0, 10.0, now);
    assert!(trader.drain_orders().is_empty());

    // Rise of ~9bp ≥ 7bp → layer 1 fires.
    now += 1.0;
    trader.on_book(50_045.0, 50_080.0, 10.0, 10.0, now);
    let orders = trader.drain_orders();
    assert_eq!(orders.len(), 1);
    let OrderIntent::Sell { layer_idx, .. } = &orders[0] else {
        panic!("expected sell intent");
    };
    assert_eq!(*layer_idx, 1);
    assert!(trader.is_pending());
}

#[test]
fn averaging_respects_recovery_drawdown_guardrail() {
    let mut config = test_config();
    config.base_spacing_bps = 7.0;
    config.trend_spacing_scale = 0.0;
    // Guardrail on: averaging requires ≥ 35bp of drawdown.
    config.recovery_avg_enabled = true;
    let mut trader = warm_trader(config);
    let mut now = trader.last_book_ts + 0.1;

    fill_layer(&mut trader, 50_035.0, 12.0, 0, now);
    now += 5.0;

    // 9bp rise satisfies spacing but the drawdown is too shallow.
    trader.on_book(50_045.0, 50_080.0, 10.0, 10.0, now);
    assert!(trader.drain_orders().is_empty());
    assert_eq!(trader.last_recovery_avg_snapshot.reason, "drawdown_too_small");
}

#[test]
fn layer_notional_grows_and_caps() {
    let mut config = test_config();
    config.size_growth = 2.0;
    let trader = GridTrader::new(config, 0.0);
    // Base at 7bp spread is 10.8; growth 2^n capped at max_notional 30.
    let base = trader.spread_scaled_notional(7.0);
    assert!((base - 10.8).abs() < 1e-9);
    assert!((base * 2.0_f64.powi(1)).min(30.0) - 21.6 < 1e-9);
    assert_eq!((base * 2.0_f64.powi(3)).min(30.0), 30.0);
}

// ---------------------------------------------------------------------------
// Scenario: inverse TP
// ---------------------------------------------------------------------------

fn inverse_tp_trader() -> (GridTrader, f64) {
    let mut config = test_config();
    config.base_spacing_bps = 7.0;
    config.trend_spacing_scale = 0.0;
    let mut trader = warm_trader(config);
    let mut now = trader.last_book_ts + 0.1;
    for i in 0..4 {
        fill_layer(&mut trader, 0.1230 + i as f64 * 0.0002, 8.0, i, now);
        now += 1.0;
    }
    (trader, now)
}

#[test]
fn inverse_tp_activation_freezes_zones() {
    let (mut trader, now) = inverse_tp_trader();
    // Bid above every zone target so activation does not fire a close yet.
    trader.bid = trader.avg_entry_price;
    trader.activate_inverse_tp(now);

    assert!(trader.inverse_tp_active());
    assert_eq!(trader.inverse_tp_zones.len(), 4);
    // Zones mirror the entry grid: 7·1.6^i.
    let expected = [7.0, 11.2, 17.92, 28.672];
    for (z, e) in trader.inverse_tp_zones.iter().zip(expected) {
        assert!((z - e).abs() < 1e-6, "zone {z} vs {e}");
    }
    assert_eq!(trader.inverse_tp_next_idx, 0);
    assert_eq!(trader.inverse_tp_layers_at_start, 4);
    assert!((trader.inverse_tp_avg_entry - trader.avg_entry_price).abs() < 1e-12);
    assert!(trader.drain_orders().is_empty());
}

#[test]
fn inverse_tp_partial_closes_fifo_batches() {
    let (mut trader, now) = inverse_tp_trader();
    trader.bid = trader.avg_entry_price;
    trader.activate_inverse_tp(now);
    let avg_at_start = trader.inverse_tp_avg_entry;
    let oldest_qty = trader.layers[0].qty;

    // Bid reaches the first zone target → 4 layers / 4 zones → 1 FIFO layer.
    let zone0_price = avg_at_start * (1.0 - 7.0 / 10_000.0);
    trader.bid = zone0_price - 1e-7;
    trader.ask = trader.bid * 1.0001;
    trader.check_inverse_tp(now + 1.0);
    let orders = trader.drain_orders();
    assert_eq!(orders.len(), 1);
    let OrderIntent::Buy { qty, partial_tp, inverse_tp_zone, reason, .. } = &orders[0] else {
        panic!("expected buy intent");
    };
    assert_eq!(reason, "inverse_tp");
    assert!(*partial_tp);
    assert_eq!(*inverse_tp_zone, 0);
    assert!((*qty - oldest_qty).abs() < 1e-12);

    // Fill: oldest layer removed, zone advances, avg_entry stays frozen.
    trader.on_buy_fill(trader.bid, *qty, "oid-z0", 0.002, "inverse_tp", trader.ask, true, 0, now + 1.5);
    assert_eq!(trader.layers.len(), 3);
    assert_eq!(trader.inverse_tp_next_idx, 1);
    assert!(trader.inverse_tp_active());
    assert!((trader.inverse_tp_avg_entry - avg_at_start).abs() < 1e-12);
    assert_eq!(trader.inverse_tp_layers_at_start, 4);
    assert!(!trader.is_pending());
}

#[test]
fn inverse_tp_time_cap_forces_full_close() {
    let (mut trader, now) = inverse_tp_trader();
    trader.bid = trader.avg_entry_price;
    trader.activate_inverse_tp(now);

    let late = now + trader.config.inverse_tp_time_cap_sec + 1.0;
    trader.check_inverse_tp(late);
    let orders = trader.drain_orders();
    assert_eq!(orders.len(), 1);
    let OrderIntent::Buy { reason, qty, partial_tp, .. } = &orders[0] else {
        panic!("expected buy intent");
    };
    assert_eq!(reason, "inverse_tp_timeout");
    assert!(!*partial_tp);
    assert!((*qty - trader.total_qty).abs() < 1e-12);
    assert!(!trader.inverse_tp_active());
}

#[test]
fn multi_layer_tp_transitions_to_inverse_grid() {
    let mut config = test_config();
    config.base_spacing_bps = 7.0;
    config.trend_spacing_scale = 0.0;
    let mut trader = warm_trader(config);
    let mut now = trader.last_book_ts + 0.1;
    for i in 0..3 {
        fill_layer(&mut trader, 50_000.0 + i as f64 * 40.0, 10.0, i, now);
        now += 1.0;
    }
    assert_eq!(trader.layers.len(), 3);

    // Deep drop: exit signal says tp, position has ≥ inverse_tp_min_layers.
    now += 1.0;
    trader.on_book(49_700.0, 49_720.0, 10.0, 10.0, now);
    // No direct close intent — the trader entered inverse-TP mode instead
    // (the first zone check may itself queue a partial close).
    assert!(trader.inverse_tp_active());
    for intent in trader.drain_orders() {
        match intent {
            OrderIntent::Buy { partial_tp, reason, .. } => {
                assert!(partial_tp || reason.starts_with("inverse_tp"));
            }
            OrderIntent::Sell { .. } => panic!("unexpected sell during inverse TP"),
        }
    }
}

// ---------------------------------------------------------------------------
// Fill-handler edge cases
// ---------------------------------------------------------------------------

#[test]
fn sell_fill_beyond_max_layers_returns_excess() {
    let mut config = test_config();
    config.max_layers = 2;
    config.dynamic_behavior_enabled = false;
    let mut trader = warm_trader(config);
    let now = trader.last_book_ts + 0.1;
    fill_layer(&mut trader, 50_000.0, 10.0, 0, now);
    fill_layer(&mut trader, 50_050.0, 10.0, 1, now + 1.0);

    let excess = trader.on_sell_fill(50_100.0, 0.0002, "oid-x", 0.001, 2, now + 2.0);
    assert_eq!(excess, Some(0.0002));
    assert_eq!(trader.layers.len(), 2);
    assert!(!trader.is_pending());
}

#[test]
fn sell_fill_beyond_symbol_cap_returns_excess() {
    let mut config = test_config();
    config.max_symbol_notional = 15.0;
    let mut trader = warm_trader(config);
    let now = trader.last_book_ts + 0.1;
    fill_layer(&mut trader, 50_000.0, 10.0, 0, now);

    let qty = 10.0 / 50_000.0;
    let excess = trader.on_sell_fill(50_000.0, qty, "oid-x", 0.001, 1, now + 1.0);
    assert_eq!(excess, Some(qty));
    assert_eq!(trader.layers.len(), 1);
}

#[test]
fn escalating_cooldown_schedule() {
    let mut trader = warm_trader(test_config());
    let now = trader.last_book_ts;
    trader.bid = 50_000.0;

    // Losing stop close: first rung with the 1.5× panic penalty.
    trader.record_close(-0.5, -10.0, now, "stop", 1);
    assert!((trader.cooldown_until - (now + 12.0)).abs() < 1e-9);
    assert_eq!(trader.trade_count_for_cooldown, 1);

    // Second consecutive non-profitable close escalates to 30s.
    trader.record_close(-0.1, -2.0, now + 20.0, "fast_tp", 1);
    assert!((trader.cooldown_until - (now + 50.0)).abs() < 1e-9);

    // Profitable TP resets the ladder to the first rung.
    trader.record_close(0.5, 10.0, now + 100.0, "tp", 1);
    assert_eq!(trader.trade_count_for_cooldown, 0);
    assert!((trader.cooldown_until - (now + 108.0)).abs() < 1e-9);
}

#[test]
fn pending_watchdog_clears_after_timeout() {
    let mut trader = warm_trader(test_config());
    let now = trader.last_book_ts + 0.1;
    trader.pending_order = true;
    trader.pending_order_ts = now;

    trader.on_book(49_982.5, 50_017.5, 10.0, 10.0, now + 5.0);
    assert!(trader.pending_order);

    trader.on_book(49_982.5, 50_017.5, 10.0, 10.0, now + 10.5);
    assert!(!trader.pending_order);
}

// ---------------------------------------------------------------------------
// Persistence round trip
// ---------------------------------------------------------------------------

#[test]
fn runtime_state_round_trip() {
    let mut trader = warm_trader(test_config());
    let now = trader.last_book_ts + 0.1;
    fill_layer(&mut trader, 50_000.0, 10.0, 0, now);
    fill_layer(&mut trader, 50_050.0, 12.0, 1, now + 1.0);
    trader.recovery_debt_usd = 3.25;
    trader.set_entry_enabled(false, "test");

    let snapshot = trader.export_runtime_state(now + 2.0);
    let json = serde_json::to_string(&snapshot).unwrap();
    let parsed: super::recovery::RuntimeStateSnapshot = serde_json::from_str(&json).unwrap();

    let mut restored = GridTrader::new(test_config(), now + 10.0);
    assert!(restored.restore_runtime_state(&parsed, "test", now + 10.0));

    assert_eq!(restored.layers.len(), 2);
    assert!((restored.total_qty - trader.total_qty).abs() < 1e-15);
    assert!((restored.total_notional - trader.total_notional).abs() < 1e-12);
    assert!((restored.avg_entry_price - trader.avg_entry_price).abs() < 1e-9);
    assert!((restored.recovery_debt_usd - 3.25).abs() < 1e-12);
    assert!(!restored.entry_enabled());
    assert!((restored.last_entry_price - trader.last_entry_price).abs() < 1e-12);

    // Restore arms a rewarm window and clears spread context.
    assert!(restored.resume_rewarm_until > now + 10.0);
    assert_eq!(restored.median_spread_bps(), 0.0);
    assert!(!restored.is_pending());
}

#[test]
fn restore_rejects_foreign_symbol() {
    let mut trader = warm_trader(test_config());
    let now = trader.last_book_ts;
    let mut snapshot = trader.export_runtime_state(now);
    snapshot.symbol = "ETHUSDT".to_string();

    let mut restored = GridTrader::new(test_config(), now);
    assert!(!restored.restore_runtime_state(&snapshot, "test", now));
    assert!(restored.layers.is_empty());
}

#[test]
fn sync_with_exchange_flat_wins() {
    let mut trader = warm_trader(test_config());
    let now = trader.last_book_ts;
    fill_layer(&mut trader, 50_000.0, 10.0, 0, now);
    assert!(!trader.layers.is_empty());

    trader.sync_with_exchange_position(0.0, 0.0, "reconcile", 0, now + 1.0);
    assert!(trader.layers.is_empty());
    assert_eq!(trader.total_qty, 0.0);
    assert_eq!(trader.avg_entry_price, 0.0);
    assert!(!trader.is_pending());
}

#[test]
fn sync_with_exchange_splits_estimated_layers() {
    let mut trader = warm_trader(test_config());
    let now = trader.last_book_ts;
    trader.sync_with_exchange_position(0.004, 50_000.0, "startup_sync", 4, now);

    assert_eq!(trader.layers.len(), 4);
    assert!((trader.total_qty - 0.004).abs() < 1e-15);
    assert!((trader.avg_entry_price - 50_000.0).abs() < 1e-9);
    for layer in &trader.layers {
        assert!((layer.qty - 0.001).abs() < 1e-15);
        assert!(layer.order_id.contains("startup_sync"));
        assert!(layer.fee > 0.0);
    }
}

#[test]
fn recovery_state_round_trip() {
    let mut trader = warm_trader(test_config());
    let now = trader.last_book_ts;
    trader.session_rpnl = -1.5;
    trader.session_trades = 7;
    trader.session_closed_notional = 88.0;
    trader.record_recovery_add_event(now);

    let snap = trader.export_recovery_state(now);
    let json = serde_json::to_string(&snap).unwrap();
    let parsed: super::recovery::RecoveryStateSnapshot = serde_json::from_str(&json).unwrap();

    let mut restored = GridTrader::new(test_config(), now);
    restored.set_recovery_state(&parsed, "test");
    assert!((restored.session_rpnl - (-1.5)).abs() < 1e-12);
    assert_eq!(restored.session_trades, 7);
    assert!((restored.session_closed_notional - 88.0).abs() < 1e-12);
    assert!((restored.last_recovery_add_ts - now).abs() < 1e-9);
    assert_eq!(restored.recovery_add_events.len(), 1);
}
