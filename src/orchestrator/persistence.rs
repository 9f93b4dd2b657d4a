// =============================================================================
// Persistence — runtime/recovery snapshots, session config, layer estimation
// =============================================================================
//
// Crash-safe per-symbol state lives in the store under scoped keys:
//   runtime_state:{SYMBOL}   full runtime snapshot
//   recovery_state:{SYMBOL}  recovery pacing snapshot
//   session_config           grid sizing for restart layer estimation
//
// Writes are best-effort; the reconciliation loop remains the authoritative
// repair mechanism when persistence lags.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::grid::recovery::{RecoveryStateSnapshot, RuntimeStateSnapshot};
use crate::orchestrator::{GridRunner, TraderHandle};
use crate::types::{now_ts, StopSignal};

/// Grid sizing persisted for layer estimation on future restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default)]
    pub min_notional: f64,
    #[serde(default)]
    pub max_notional: f64,
    #[serde(default)]
    pub size_growth: f64,
    #[serde(default)]
    pub max_layers: usize,
    #[serde(default)]
    pub updated_ts: f64,
}

fn runtime_state_key(symbol: &str) -> String {
    format!("runtime_state:{}", symbol.to_uppercase())
}

fn recovery_state_key(symbol: &str) -> String {
    format!("recovery_state:{}", symbol.to_uppercase())
}

impl GridRunner {
    // ── Seeding at trader construction ──────────────────────────────────

    /// Restore persisted runtime context and recovery pacing for a fresh
    /// trader. Runtime state carries the layer stack and recovery debt; the
    /// recovery snapshot survives even when the runtime snapshot is gone.
    pub(crate) async fn seed_trader_state(&self, symbol: &str, trader: &TraderHandle) {
        if self.config.runtime_state_enabled {
            if let Some(state) = self
                .store
                .get_state::<RuntimeStateSnapshot>(&runtime_state_key(symbol))
                .await
            {
                let restored = trader
                    .write()
                    .restore_runtime_state(&state, "runtime_state", now_ts());
                if restored {
                    let total = trader.read().total_notional;
                    self.update_notional_cache(symbol, total);
                }
            }
        }
        if let Some(state) = self
            .store
            .get_state::<RecoveryStateSnapshot>(&recovery_state_key(symbol))
            .await
        {
            trader.write().set_recovery_state(&state, "state_store");
        }
    }

    // ── Per-symbol persistence ──────────────────────────────────────────

    pub(crate) async fn persist_runtime_state(&self, symbol: &str, trader: &TraderHandle) {
        if !self.config.runtime_state_enabled {
            return;
        }
        let snapshot = trader.read().export_runtime_state(now_ts());
        if !self
            .store
            .set_state(&runtime_state_key(symbol), &snapshot)
            .await
        {
            debug!(symbol = %symbol, "runtime state persist failed");
        }
    }

    pub(crate) async fn persist_recovery_state(&self, symbol: &str, trader: &TraderHandle) {
        let snapshot = trader.write().export_recovery_state(now_ts());
        if !self
            .store
            .set_state(&recovery_state_key(symbol), &snapshot)
            .await
        {
            debug!(symbol = %symbol, "recovery state persist failed");
        }
    }

    /// Write every trader's runtime + recovery snapshot once.
    pub(crate) async fn persist_all_states_once(&self) {
        let traders: Vec<(String, TraderHandle)> = self
            .traders
            .read()
            .iter()
            .map(|(s, t)| (s.clone(), t.clone()))
            .collect();
        for (symbol, trader) in traders {
            self.persist_runtime_state(&symbol, &trader).await;
            self.persist_recovery_state(&symbol, &trader).await;
        }
    }

    // ── Session config ──────────────────────────────────────────────────

    pub(crate) async fn persist_session_config(&self) {
        let session = SessionConfig {
            min_notional: self.config.min_notional,
            max_notional: self.config.max_notional,
            size_growth: self.config.size_growth,
            max_layers: self.config.max_layers,
            updated_ts: now_ts(),
        };
        if self.store.set_state("session_config", &session).await {
            info!(
                min_notional = self.config.min_notional,
                max_notional = self.config.max_notional,
                size_growth = self.config.size_growth,
                "session config saved"
            );
        }
    }

    pub(crate) async fn load_session_config(&self) -> Option<SessionConfig> {
        self.store.get_state("session_config").await
    }

    /// Estimate how many layers produced a given total notional by
    /// reverse-simulating the grid sizing (persisted config preferred).
    pub(crate) async fn estimate_layer_count(&self, notional: f64) -> usize {
        let saved = self.load_session_config().await;
        let (min_n, max_n, growth, max_layers) = match &saved {
            Some(s) if s.min_notional > 0.0 => {
                (s.min_notional, s.max_notional, s.size_growth, s.max_layers.max(1))
            }
            _ => (
                self.config.min_notional,
                self.config.max_notional,
                self.config.size_growth,
                self.config.max_layers.max(1),
            ),
        };
        estimate_layers(notional, min_n, max_n, growth, max_layers)
    }

    // ── Persistence loop ────────────────────────────────────────────────

    /// Periodic loop: recovery snapshots, runtime snapshots, and strategy-
    /// event flushes each on their own cadence; the loop ticks at the
    /// fastest of the enabled intervals.
    pub(crate) async fn persistence_loop(self: Arc<Self>, stop: StopSignal) {
        let recovery_interval = if self.config.recovery_state_sync_sec > 0.0 {
            self.config.recovery_state_sync_sec.max(5.0)
        } else {
            0.0
        };
        let runtime_interval = if self.config.runtime_state_enabled {
            self.config.runtime_state_sync_sec.max(5.0)
        } else {
            0.0
        };
        let event_interval = if self.config.strategy_event_logging { 5.0 } else { 0.0 };

        let intervals: Vec<f64> = [recovery_interval, runtime_interval, event_interval]
            .into_iter()
            .filter(|x| *x > 0.0)
            .collect();
        let tick = intervals.iter().copied().fold(f64::INFINITY, f64::min);
        let tick = if tick.is_finite() { tick } else { 10.0 };

        let mut last_recovery = 0.0_f64;
        let mut last_runtime = 0.0_f64;
        let mut last_events = 0.0_f64;

        while !stop.is_set() {
            if stop.sleep_interruptible(tick).await {
                break;
            }
            if self.is_shutting_down() {
                break;
            }
            let now = now_ts();

            if recovery_interval > 0.0 && now - last_recovery >= recovery_interval {
                let traders: Vec<(String, TraderHandle)> = self
                    .traders
                    .read()
                    .iter()
                    .map(|(s, t)| (s.clone(), t.clone()))
                    .collect();
                for (symbol, trader) in traders {
                    self.persist_recovery_state(&symbol, &trader).await;
                }
                last_recovery = now;
            }
            if runtime_interval > 0.0 && now - last_runtime >= runtime_interval {
                let traders: Vec<(String, TraderHandle)> = self
                    .traders
                    .read()
                    .iter()
                    .map(|(s, t)| (s.clone(), t.clone()))
                    .collect();
                for (symbol, trader) in traders {
                    self.persist_runtime_state(&symbol, &trader).await;
                }
                last_runtime = now;
            }
            if event_interval > 0.0 && now - last_events >= event_interval {
                self.flush_strategy_events_once().await;
                last_events = now;
            }
        }
    }
}

/// Reverse grid sizing: how many layers sum to `notional` under geometric
/// growth capped per layer (95% tolerance for fees/rounding).
pub(crate) fn estimate_layers(
    notional: f64,
    min_notional: f64,
    max_notional: f64,
    size_growth: f64,
    max_layers: usize,
) -> usize {
    if min_notional <= 0.0 {
        return 1;
    }
    let mut total = 0.0;
    let mut layers = 0usize;
    while total < notional * 0.95 {
        let layer_n = (min_notional * size_growth.powi(layers as i32)).min(max_notional);
        total += layer_n;
        layers += 1;
        if layers >= max_layers {
            break;
        }
    }
    layers.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_layers_reverse_sizing() {
        // Flat sizing: $6 per layer.
        assert_eq!(estimate_layers(6.0, 6.0, 30.0, 1.0, 8), 1);
        assert_eq!(estimate_layers(12.0, 6.0, 30.0, 1.0, 8), 2);
        assert_eq!(estimate_layers(24.0, 6.0, 30.0, 1.0, 8), 4);
        // Slightly under a full layer stays within the 95% tolerance.
        assert_eq!(estimate_layers(11.5, 6.0, 30.0, 1.0, 8), 2);
        // Geometric growth: 6 + 12 + 24(→cap 30 at later depths).
        assert_eq!(estimate_layers(18.0, 6.0, 30.0, 2.0, 8), 2);
        assert_eq!(estimate_layers(42.0, 6.0, 30.0, 2.0, 8), 3);
        // Capped by max_layers.
        assert_eq!(estimate_layers(1_000.0, 6.0, 30.0, 1.0, 8), 8);
        // Degenerate config.
        assert_eq!(estimate_layers(50.0, 0.0, 30.0, 1.0, 8), 1);
    }

    #[test]
    fn session_config_defaults_tolerated() {
        let parsed: SessionConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(parsed.min_notional, 0.0);
        assert_eq!(parsed.max_layers, 0);
    }
}
