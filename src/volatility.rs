// =============================================================================
// Volatility Calibrator — multi-timeframe OHLCV baseline blended with live vol
// =============================================================================
//
// The tick path calls `update(live_vol_bps, now)` on every trade. A detached
// background task refreshes the candle-derived baseline on schedule; the tick
// loop never blocks on candle fetches. When no baseline is available the
// calibrator runs in live-only mode forever.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::candles::CandleServiceClient;

/// Point-in-time volatility regime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolatilitySnapshot {
    #[serde(default)]
    pub baseline_bps: f64,
    #[serde(default)]
    pub live_bps: f64,
    #[serde(default)]
    pub blended_bps: f64,
    #[serde(default = "default_drift")]
    pub drift_mult: f64,
    #[serde(default = "default_drift")]
    pub tail_ratio: f64,
    #[serde(default)]
    pub heavy_tail: bool,
    #[serde(default)]
    pub last_refresh_ts: f64,
    #[serde(default = "default_source")]
    pub source: String,
}

fn default_drift() -> f64 {
    1.0
}

fn default_source() -> String {
    "live_only".to_string()
}

impl Default for VolatilitySnapshot {
    fn default() -> Self {
        Self {
            baseline_bps: 0.0,
            live_bps: 0.0,
            blended_bps: 0.0,
            drift_mult: 1.0,
            tail_ratio: 1.0,
            heavy_tail: false,
            last_refresh_ts: 0.0,
            source: default_source(),
        }
    }
}

/// Tunables for one calibrator instance.
#[derive(Debug, Clone)]
pub struct VolatilityConfig {
    pub enabled: bool,
    pub candle_service_url: String,
    pub exchange: String,
    pub refresh_sec: f64,
    pub live_weight: f64,
    pub drift_min: f64,
    pub drift_max: f64,
    pub tail_mult: f64,
    pub live_ema_alpha: f64,
    pub tf_weights: BTreeMap<String, f64>,
    pub tf_lookbacks: BTreeMap<String, String>,
}

impl Default for VolatilityConfig {
    fn default() -> Self {
        let mut tf_weights = BTreeMap::new();
        tf_weights.insert("1m".to_string(), 0.5);
        tf_weights.insert("5m".to_string(), 0.3);
        tf_weights.insert("15m".to_string(), 0.2);
        let mut tf_lookbacks = BTreeMap::new();
        tf_lookbacks.insert("1m".to_string(), "6h".to_string());
        tf_lookbacks.insert("5m".to_string(), "2d".to_string());
        tf_lookbacks.insert("15m".to_string(), "7d".to_string());
        Self {
            enabled: true,
            candle_service_url: "http://localhost:3003".to_string(),
            exchange: "binance".to_string(),
            refresh_sec: 120.0,
            live_weight: 0.45,
            drift_min: 0.8,
            drift_max: 3.0,
            tail_mult: 2.2,
            live_ema_alpha: 0.25,
            tf_weights,
            tf_lookbacks,
        }
    }
}

/// Compute vol in bps from candle closes: std(log returns) · 10 000.
pub fn vol_bps_from_closes(closes: &[f64]) -> f64 {
    let mut rets: Vec<f64> = Vec::with_capacity(closes.len());
    let mut prev = 0.0;
    for &px in closes {
        if prev > 0.0 && px > 0.0 {
            rets.push((px / prev).ln());
        }
        prev = px;
    }
    if rets.len() < 2 {
        return 0.0;
    }
    let n = rets.len() as f64;
    let mean = rets.iter().sum::<f64>() / n;
    let var = rets.iter().map(|r| (r - mean) * (r - mean)).sum::<f64>() / n;
    (var.max(0.0).sqrt() * 10_000.0).max(0.0)
}

#[derive(Debug, Default)]
struct CalibratorState {
    baseline_bps: f64,
    live_vol_ema_bps: f64,
    last_refresh_ts: f64,
}

/// Per-symbol volatility calibrator.
pub struct VolatilityCalibrator {
    symbol: String,
    config: VolatilityConfig,
    state: Mutex<CalibratorState>,
    refresh_running: Arc<AtomicBool>,
    client: Option<CandleServiceClient>,
    enabled: bool,
}

impl VolatilityCalibrator {
    pub fn new(symbol: impl Into<String>, mut config: VolatilityConfig) -> Self {
        config.refresh_sec = config.refresh_sec.max(15.0);
        config.live_weight = config.live_weight.clamp(0.0, 1.0);
        config.drift_min = config.drift_min.max(0.1);
        config.drift_max = config.drift_max.max(config.drift_min);
        config.tail_mult = config.tail_mult.max(1.0);
        config.live_ema_alpha = config.live_ema_alpha.clamp(0.01, 1.0);
        normalize_weights(&mut config.tf_weights);

        let enabled = config.enabled;
        let client = if enabled {
            Some(CandleServiceClient::new(config.candle_service_url.clone()))
        } else {
            None
        };

        Self {
            symbol: symbol.into().to_uppercase(),
            config,
            state: Mutex::new(CalibratorState::default()),
            refresh_running: Arc::new(AtomicBool::new(false)),
            client,
            enabled,
        }
    }

    /// Fold in the latest live realized vol and return the current snapshot.
    ///
    /// May spawn a detached baseline refresh; never blocks on it.
    pub fn update(self: &Arc<Self>, live_vol_bps: f64, now: f64) -> VolatilitySnapshot {
        let lv = live_vol_bps.max(0.0);
        if lv > 0.0 {
            let mut state = self.state.lock();
            if state.live_vol_ema_bps <= 0.0 {
                state.live_vol_ema_bps = lv;
            } else {
                state.live_vol_ema_bps += self.config.live_ema_alpha * (lv - state.live_vol_ema_bps);
            }
        }

        self.maybe_spawn_refresh(now);
        self.snapshot_at(now)
    }

    /// Build the snapshot without mutating the live EMA. Used by restore paths.
    pub fn snapshot_at(&self, _now: f64) -> VolatilitySnapshot {
        let (mut baseline_bps, mut live_bps, last_refresh, has_baseline) = {
            let state = self.state.lock();
            (
                state.baseline_bps,
                state.live_vol_ema_bps,
                state.last_refresh_ts,
                state.baseline_bps > 0.0,
            )
        };

        // No baseline yet: substitute so drift stays well-defined and near 1.
        if baseline_bps <= 0.0 {
            baseline_bps = live_bps.max(8.0);
        }
        if live_bps <= 0.0 {
            live_bps = baseline_bps;
        }

        let blended_bps =
            (1.0 - self.config.live_weight) * baseline_bps + self.config.live_weight * live_bps;
        let drift_mult = (blended_bps / baseline_bps.max(1e-9))
            .clamp(self.config.drift_min, self.config.drift_max);
        let tail_ratio = live_bps.max(blended_bps) / baseline_bps.max(1e-9);
        let heavy_tail = tail_ratio >= self.config.tail_mult;

        let source = if self.enabled && has_baseline {
            "mtf+live".to_string()
        } else {
            "live_only".to_string()
        };

        VolatilitySnapshot {
            baseline_bps,
            live_bps,
            blended_bps,
            drift_mult,
            tail_ratio,
            heavy_tail,
            last_refresh_ts: last_refresh,
            source,
        }
    }

    fn maybe_spawn_refresh(self: &Arc<Self>, now: f64) {
        if !self.enabled || self.client.is_none() {
            return;
        }
        {
            let state = self.state.lock();
            if state.last_refresh_ts > 0.0 && (now - state.last_refresh_ts) < self.config.refresh_sec {
                return;
            }
        }
        if self
            .refresh_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.refresh_baseline(now).await;
            this.refresh_running.store(false, Ordering::Release);
        });
    }

    async fn refresh_baseline(&self, now: f64) {
        let Some(client) = &self.client else { return };
        let mut tf_vols: BTreeMap<String, f64> = BTreeMap::new();

        for (tf, weight) in &self.config.tf_weights {
            if *weight <= 0.0 {
                continue;
            }
            let lookback = self.config.tf_lookbacks.get(tf).map(|s| s.as_str());
            match client
                .fetch_closes(&self.config.exchange, &self.symbol, tf, lookback)
                .await
            {
                Ok(closes) => {
                    let vol = vol_bps_from_closes(&closes);
                    if vol > 0.0 {
                        tf_vols.insert(tf.clone(), vol);
                    }
                }
                Err(e) => {
                    debug!(symbol = %self.symbol, tf = %tf, error = %e, "candle fetch failed");
                }
            }
        }

        if tf_vols.is_empty() {
            // Hold the previous baseline until the next successful refresh.
            self.state.lock().last_refresh_ts = now;
            return;
        }

        // Reweight only on available timeframes.
        let total_w: f64 = tf_vols
            .keys()
            .map(|tf| self.config.tf_weights.get(tf).copied().unwrap_or(0.0))
            .sum();
        let baseline = if total_w <= 0.0 {
            tf_vols.values().sum::<f64>() / tf_vols.len() as f64
        } else {
            tf_vols
                .iter()
                .map(|(tf, v)| v * self.config.tf_weights.get(tf).copied().unwrap_or(0.0) / total_w)
                .sum()
        };

        let mut state = self.state.lock();
        state.baseline_bps = baseline.max(0.0);
        state.last_refresh_ts = now;
    }
}

fn normalize_weights(weights: &mut BTreeMap<String, f64>) {
    weights.retain(|_, w| *w > 0.0);
    let total: f64 = weights.values().sum();
    if total <= 0.0 {
        weights.clear();
        weights.insert("1m".to_string(), 1.0);
        return;
    }
    for w in weights.values_mut() {
        *w /= total;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn live_only_calibrator() -> Arc<VolatilityCalibrator> {
        let config = VolatilityConfig {
            enabled: false,
            ..Default::default()
        };
        Arc::new(VolatilityCalibrator::new("TESTUSDT", config))
    }

    #[test]
    fn baseline_fallback_keeps_drift_defined() {
        let cal = live_only_calibrator();
        // Live below the 8bp floor → baseline substitutes 8, live holds.
        {
            cal.state.lock().live_vol_ema_bps = 4.0;
        }
        let snap = cal.snapshot_at(0.0);
        assert_eq!(snap.baseline_bps, 8.0);
        assert_eq!(snap.live_bps, 4.0);
        assert_eq!(snap.source, "live_only");

        // Live above the floor → baseline tracks live and drift stays ~1.
        {
            cal.state.lock().live_vol_ema_bps = 20.0;
        }
        let snap = cal.snapshot_at(0.0);
        assert_eq!(snap.baseline_bps, 20.0);
        assert!((snap.drift_mult - 1.0).abs() < 1e-9);
    }

    #[test]
    fn drift_clamped_to_configured_range() {
        let cal = live_only_calibrator();
        {
            let mut state = cal.state.lock();
            state.baseline_bps = 10.0;
            state.live_vol_ema_bps = 100.0;
        }
        let snap = cal.snapshot_at(0.0);
        // Blend = 0.55*10 + 0.45*100 = 50.5 → ratio 5.05 clamps at drift_max 3.
        assert!((snap.drift_mult - 3.0).abs() < 1e-9);
        assert!(snap.heavy_tail);
        assert!(snap.tail_ratio >= 2.2);
    }

    #[test]
    fn vol_bps_from_closes_matches_log_return_std() {
        // Alternating ±1% closes have a well-defined stdev of log returns.
        let closes = vec![100.0, 101.0, 100.0, 101.0, 100.0];
        let vol = vol_bps_from_closes(&closes);
        assert!(vol > 90.0 && vol < 110.0);

        assert_eq!(vol_bps_from_closes(&[100.0]), 0.0);
        assert_eq!(vol_bps_from_closes(&[]), 0.0);
    }

    #[test]
    fn weights_renormalize() {
        let mut w = BTreeMap::new();
        w.insert("1m".to_string(), 2.0);
        w.insert("5m".to_string(), 2.0);
        w.insert("15m".to_string(), 0.0);
        normalize_weights(&mut w);
        assert_eq!(w.len(), 2);
        assert!((w["1m"] - 0.5).abs() < 1e-12);
    }
}
