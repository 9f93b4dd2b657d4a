// =============================================================================
// Runner telemetry — strategy-event buffering, dashboard, final summary
// =============================================================================

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::grid::telemetry::TradeEventRecord;
use crate::grid::GridTrader;
use crate::orchestrator::GridRunner;
use crate::types::{now_ts, StopSignal};

/// Compact persisted strategy event. `event_id` is unique per session:
/// `{scope}|{symbol}|{action}|{event_ms}|{session_id}|{seq}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyEvent {
    pub event_id: String,
    pub symbol: String,
    pub action: String,
    pub reason: String,
    pub layer_idx: usize,
    pub layers: usize,
    pub qty: f64,
    pub price: f64,
    pub notional: f64,
    pub pnl_bps: f64,
    pub pnl_usd: f64,
    pub spread_bps: f64,
    pub median_spread_bps: f64,
    pub vol_blended_bps: f64,
    pub vol_drift_mult: f64,
    pub edge_lcb_bps: f64,
    pub edge_required_bps: f64,
    pub recovery_debt_usd: f64,
    pub event_ts: f64,
    pub event_time_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<BTreeMap<String, BTreeMap<String, f64>>>,
}

/// Keep only the load-bearing signal keys in persisted payloads.
pub(crate) fn extract_signal_subset(signals: &BTreeMap<String, f64>) -> BTreeMap<String, f64> {
    const KEEP: [&str; 9] = [
        "pump_score",
        "exhaust_score",
        "TI_2s",
        "TI_500ms",
        "spread_bps",
        "rv_1s",
        "z_ret_2s",
        "z_TI_2s",
        "z_MD_2s",
    ];
    KEEP.iter()
        .filter_map(|key| signals.get(*key).map(|v| (key.to_string(), *v)))
        .collect()
}

/// Does the local layer stack match the exchange position closely enough
/// to keep persisted runtime context? 1% on quantity, 0.25% on entry.
pub(crate) fn layers_match_exchange(trader: &GridTrader, ex_qty: f64, ex_entry: f64) -> bool {
    if ex_qty <= 0.0 || ex_entry <= 0.0 || trader.layers.is_empty() {
        return false;
    }
    let local_qty = trader.total_qty;
    if local_qty <= 0.0 {
        return false;
    }
    let qty_tol = (0.01 * local_qty.max(ex_qty)).max(1e-8);
    if (local_qty - ex_qty).abs() > qty_tol {
        return false;
    }
    let local_entry = trader.avg_entry_price;
    if local_entry <= 0.0 {
        return false;
    }
    (local_entry - ex_entry).abs() / ex_entry <= 0.0025
}

impl GridRunner {
    // ── Event sink ──────────────────────────────────────────────────────

    /// Fold a trader event into the bounded ring buffer (synchronous; flush
    /// happens on the persistence cadence).
    pub(crate) fn strategy_event_sink(&self, record: TradeEventRecord) {
        if !self.config.strategy_event_logging {
            return;
        }
        let seq = self.event_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let event_ms = (record.ts * 1000.0) as i64;
        let action = record.action.to_lowercase();
        let symbol = record.symbol.to_uppercase();

        let mut payload: BTreeMap<String, BTreeMap<String, f64>> = BTreeMap::new();
        if !record.entry_signals.is_empty() {
            let subset = extract_signal_subset(&record.entry_signals);
            if !subset.is_empty() {
                let key = if action == "entry" { "entry" } else { "entry_wavg" };
                payload.insert(key.to_string(), subset);
            }
        }
        if !record.exit_signals.is_empty() {
            let subset = extract_signal_subset(&record.exit_signals);
            if !subset.is_empty() {
                payload.insert("exit".to_string(), subset);
            }
        }

        let event = StrategyEvent {
            event_id: format!(
                "{}|{}|{}|{}|{}|{}",
                self.user_scope, symbol, action, event_ms, self.session_id, seq
            ),
            symbol,
            action,
            reason: record.reason,
            layer_idx: record.layer_idx,
            layers: record.layers,
            qty: record.qty,
            price: record.price,
            notional: record.notional,
            pnl_bps: record.pnl_bps,
            pnl_usd: record.pnl_usd,
            spread_bps: record.spread_bps,
            median_spread_bps: record.median_spread_bps,
            vol_blended_bps: record.vol_blended_bps,
            vol_drift_mult: record.vol_drift_mult,
            edge_lcb_bps: record.edge_lcb_bps,
            edge_required_bps: record.edge_required_bps,
            recovery_debt_usd: record.recovery_debt_usd,
            event_ts: record.ts,
            event_time_ms: event_ms,
            payload: if payload.is_empty() { None } else { Some(payload) },
        };

        let mut buffer = self.event_buffer.lock();
        if buffer.len() >= super::EVENT_BUFFER_CAP {
            buffer.pop_front();
        }
        buffer.push_back(event);
    }

    /// Flush buffered events in one batch; on store errors the batch is
    /// re-queued at the front for the next tick. Prunes hourly.
    pub(crate) async fn flush_strategy_events_once(&self) {
        if !self.config.strategy_event_logging {
            return;
        }
        let events: Vec<StrategyEvent> = {
            let mut buffer = self.event_buffer.lock();
            buffer.drain(..).collect()
        };
        if events.is_empty() {
            return;
        }

        let items: Vec<(i64, String)> = events
            .iter()
            .filter_map(|e| serde_json::to_string(e).ok().map(|raw| (e.event_time_ms, raw)))
            .collect();

        if let Err(e) = self.store.append_strategy_events(&items).await {
            debug!(error = %e, count = events.len(), "event flush failed — re-queueing");
            let mut buffer = self.event_buffer.lock();
            for event in events.into_iter().rev() {
                if buffer.len() >= super::EVENT_BUFFER_CAP {
                    break;
                }
                buffer.push_front(event);
            }
            return;
        }

        let now = now_ts();
        let due = {
            let mut last = self.last_prune_ts.lock();
            if now - *last > 3600.0 {
                *last = now;
                true
            } else {
                false
            }
        };
        if due {
            self.store
                .prune_strategy_events(
                    self.config.strategy_event_retention_days,
                    (now * 1000.0) as i64,
                )
                .await;
        }
    }

    // ── Dashboard ───────────────────────────────────────────────────────

    /// Render the human-readable dashboard snapshot on an interval.
    pub(crate) async fn display_loop(self: Arc<Self>, stop: StopSignal) {
        let interval = 10.0;
        while !stop.is_set() {
            if stop.sleep_interruptible(interval).await {
                break;
            }
            let now = now_ts();
            let elapsed = now - *self.start_time.lock();

            let mut total_trades = 0u64;
            let mut total_wins = 0u64;
            let mut total_pnl_bps = 0.0;
            let mut total_pnl_usd = 0.0;
            let mut total_fees = 0.0;
            let mut active_grids = 0usize;
            let mut portfolio_notional = 0.0;
            let mut lines: Vec<String> = Vec::new();

            let statuses = self.get_all_status();
            for (symbol, s) in &statuses {
                total_trades += s.trades;
                total_pnl_bps += s.realized_bps;
                total_pnl_usd += s.realized_usd;
                total_fees += s.total_fees;
                total_wins += (s.win_rate / 100.0 * s.trades as f64).round() as u64;
                portfolio_notional += s.total_notional;
                if s.layers > 0 {
                    active_grids += 1;
                }

                let in_regime = s.spread_bps >= self.config.min_spread_bps
                    && s.spread_bps <= self.config.max_spread_bps;
                let interesting = s.layers > 0 || s.trades > 0 || in_regime;
                if !interesting {
                    continue;
                }
                let grid = if s.layers > 0 {
                    format!("L{}/{} ${:.0}", s.layers, s.max_layers, s.total_notional)
                } else {
                    "flat".to_string()
                };
                let unr = if s.layers > 0 {
                    format!("unr={:+.1}bp ${:+.4}", s.unrealized_bps, s.unrealized_usd)
                } else {
                    String::new()
                };
                let cb = if s.circuit_breaker { " CB" } else { "" };
                let pending = if s.pending { " *" } else { "" };
                lines.push(format!(
                    "  {symbol:<14} spr={:>5.1} med={:>5.1} | grid={grid:<16} {unr:<24} | \
                     rPnL={:>+7.1}bp ${:+.4} | T={:>2}{cb}{pending}",
                    s.spread_bps, s.median_spread_bps, s.realized_bps, s.realized_usd, s.trades,
                ));
            }

            let win_pct = total_wins as f64 / total_trades.max(1) as f64 * 100.0;
            let cap_pct = portfolio_notional / self.config.max_total_notional * 100.0;
            info!(
                "[{elapsed:.0}s] {}p | {active_grids} grids | portfolio ${portfolio_notional:.0}/${:.0} ({cap_pct:.0}%) | \
                 {total_trades}T WR {win_pct:.0}% | PnL {total_pnl_bps:+.1}bp ${total_pnl_usd:+.4} | fees ${total_fees:.4}",
                statuses.len(),
                self.config.max_total_notional,
            );
            for line in lines {
                info!("{line}");
            }
        }
    }

    /// End-of-session summary.
    pub(crate) fn final_summary(&self) {
        let elapsed = now_ts() - *self.start_time.lock();
        let traders = self.traders.read();
        let total_trades: u64 = traders.values().map(|t| t.read().total_trades).sum();
        let total_wins: u64 = traders.values().map(|t| t.read().wins).sum();
        let total_pnl_bps: f64 = traders.values().map(|t| t.read().realized_pnl_bps).sum();
        let total_pnl_usd: f64 = traders.values().map(|t| t.read().realized_pnl).sum();
        let total_fees: f64 = traders.values().map(|t| t.read().total_fees).sum();

        let mut traded: Vec<(String, u64, u64, f64, f64, f64)> = traders
            .iter()
            .filter(|(_, t)| t.read().total_trades > 0)
            .map(|(s, t)| {
                let g = t.read();
                (
                    s.clone(),
                    g.total_trades,
                    g.wins,
                    g.realized_pnl_bps,
                    g.realized_pnl,
                    g.total_fees,
                )
            })
            .collect();
        traded.sort_by(|a, b| b.3.partial_cmp(&a.3).unwrap_or(std::cmp::Ordering::Equal));

        info!(
            elapsed = format!("{elapsed:.0}"),
            pairs = traders.len(),
            traded = traded.len(),
            trades = total_trades,
            win_rate = format!("{:.1}", total_wins as f64 / total_trades.max(1) as f64 * 100.0),
            pnl_bps = format!("{total_pnl_bps:+.1}"),
            pnl_usd = format!("{total_pnl_usd:+.4}"),
            fees = format!("{total_fees:.4}"),
            "final summary"
        );
        for (symbol, trades, wins, pnl_bps, pnl_usd, fees) in traded {
            info!(
                symbol = %symbol,
                trades,
                win_rate = format!("{:.0}", wins as f64 / trades.max(1) as f64 * 100.0),
                pnl_bps = format!("{pnl_bps:+.1}"),
                pnl_usd = format!("{pnl_usd:+.4}"),
                fees = format!("{fees:.4}"),
                "per-symbol result"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::GridConfig;
    use crate::runtime_config::RunnerConfig;
    use crate::store::StateStore;
    use crate::volatility::VolatilityConfig;

    fn flat_trader() -> GridTrader {
        let config = GridConfig {
            vol: VolatilityConfig {
                enabled: false,
                ..Default::default()
            },
            ..Default::default()
        };
        GridTrader::new(config, 0.0)
    }

    #[test]
    fn layers_match_tolerances() {
        let mut trader = flat_trader();
        assert!(trader.on_sell_fill(50_000.0, 0.001, "a", 0.01, 0, 10.0).is_none());
        assert!(trader.on_sell_fill(50_050.0, 0.001, "b", 0.01, 1, 11.0).is_none());

        // Exact match.
        assert!(layers_match_exchange(&trader, 0.002, trader.avg_entry_price));
        // Within 1% qty and 0.25% entry.
        assert!(layers_match_exchange(
            &trader,
            0.002 * 1.005,
            trader.avg_entry_price * 1.002
        ));
        // Quantity off by more than 1%.
        assert!(!layers_match_exchange(&trader, 0.0025, trader.avg_entry_price));
        // Entry off by more than 0.25%.
        assert!(!layers_match_exchange(
            &trader,
            0.002,
            trader.avg_entry_price * 1.01
        ));
        // Flat exchange never matches local layers.
        assert!(!layers_match_exchange(&trader, 0.0, 0.0));
    }

    #[test]
    fn signal_subset_keeps_only_known_keys() {
        let mut signals = BTreeMap::new();
        signals.insert("pump_score".to_string(), 3.0);
        signals.insert("exhaust_score".to_string(), 2.0);
        signals.insert("pair_tw_1s".to_string(), 123.0);
        let subset = extract_signal_subset(&signals);
        assert_eq!(subset.len(), 2);
        assert!(subset.contains_key("pump_score"));
        assert!(!subset.contains_key("pair_tw_1s"));
    }

    #[tokio::test]
    async fn event_ids_are_unique_and_scoped() {
        let config = RunnerConfig {
            session_id: "testsess".to_string(),
            ..Default::default()
        };
        let runner = GridRunner::new(
            config,
            None,
            StateStore::disabled("acct-ev"),
            "acct-ev".to_string(),
        );

        for i in 0..3 {
            runner.strategy_event_sink(TradeEventRecord {
                ts: 1_700_000_000.0 + i as f64,
                symbol: "BTCUSDT".to_string(),
                action: "entry",
                reason: String::new(),
                layer_idx: 0,
                layers: 1,
                qty: 0.001,
                price: 50_000.0,
                notional: 50.0,
                pnl_usd: 0.0,
                pnl_bps: 0.0,
                spread_bps: 7.0,
                median_spread_bps: 7.0,
                vol_blended_bps: 8.0,
                vol_drift_mult: 1.0,
                edge_lcb_bps: 3.0,
                edge_required_bps: 2.0,
                recovery_debt_usd: 0.0,
                entry_signals: BTreeMap::new(),
                exit_signals: BTreeMap::new(),
            });
        }

        let buffer = runner.event_buffer.lock();
        assert_eq!(buffer.len(), 3);
        let ids: std::collections::HashSet<&String> =
            buffer.iter().map(|e| &e.event_id).collect();
        assert_eq!(ids.len(), 3);
        for event in buffer.iter() {
            assert!(event.event_id.starts_with("acct-ev|BTCUSDT|entry|"));
            assert!(event.event_id.contains("|testsess|"));
        }
    }
}
