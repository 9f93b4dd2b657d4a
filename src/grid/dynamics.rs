// =============================================================================
// Dynamic parameter adjustment — behavior- and regime-adaptive tuning
// =============================================================================
//
// Methods that adapt trading parameters from recent behavior, the volatility
// regime, and position state. All outputs stay bounded by their configured
// inputs.

use tracing::{info, warn};

use crate::grid::{GridTrader, TpMode};

impl GridTrader {
    /// Scale position size by spread width: wider spread, bigger size.
    ///
    /// Linear from `min_notional` at `min_spread_bps` to `max_notional` at
    /// 3× the minimum spread.
    pub(crate) fn spread_scaled_notional(&self, spread_bps: f64) -> f64 {
        let lo = self.config.min_spread_bps.max(1.0);
        let hi = lo * 3.0;
        let t = ((spread_bps - lo) / (hi - lo).max(1.0)).clamp(0.0, 1.0);
        self.config.min_notional + t * (self.config.max_notional - self.config.min_notional)
    }

    pub(crate) fn dynamic_entry_cooldown_sec(&self) -> f64 {
        let base = self.config.cooldown_sec.max(0.1);
        if !self.config.dynamic_behavior_enabled {
            return base;
        }
        let dup = self.duplicate_fill_ratio();
        let near_zero = self.near_zero_close_ratio();
        let vol = self.vol_snapshot.drift_mult.max(0.5);
        let mut mult = 1.0 + (dup * 3.0 + near_zero * 2.0) / vol;
        mult *= self.falling_knife_cooldown_mult();
        (base * mult).clamp(base, base * 8.0)
    }

    /// Escalate cooldown when recent closes form a declining pattern.
    pub(crate) fn falling_knife_cooldown_mult(&self) -> f64 {
        if self.recent_close_prices.len() < 2 {
            return 1.0;
        }
        let prices: Vec<f64> = self.recent_close_prices.iter().copied().collect();
        let declining = prices.windows(2).filter(|w| w[1] < w[0]).count();
        let ratio = declining as f64 / (prices.len() - 1) as f64;
        if ratio > 0.6 {
            1.0 + ratio * 4.0
        } else {
            1.0
        }
    }

    /// Spread requirement for averaging, relaxed when deeply underwater.
    ///
    /// Two-phase curve: the full `min_spread_bps` applies down to the
    /// recovery threshold; past it a quadratic ease-out drops the
    /// requirement to a 0.15× floor by -500 bps unrealized. Lets tight-
    /// spread pairs keep averaging when a position is stuck.
    pub(crate) fn averaging_min_spread(&self) -> f64 {
        let base = self.config.min_spread_bps;
        let unr_bps = self.unrealized_bps().abs();
        let threshold = self.config.recovery_avg_min_unrealized_bps;

        if unr_bps < threshold {
            return base;
        }

        let depth_past = unr_bps - threshold;
        let max_depth = 500.0 - threshold;
        let t = (depth_past / max_depth).min(1.0);
        let relief_factor = (1.0 - 0.85 * t.powf(0.3)).max(0.15);
        base * relief_factor
    }

    /// Drawdown from the 30 s high in vol units, decayed by peak age.
    /// Higher = more waterfall-like.
    pub(crate) fn waterfall_score(&self, now: f64) -> f64 {
        if self.price_30s_high.is_empty() || self.mid <= 0.0 {
            return 0.0;
        }
        let Some((high, _)) = self.price_30s_high.high_with_ts() else {
            return 0.0;
        };
        if high <= 0.0 {
            return 0.0;
        }
        let drawdown_bps = (high - self.mid) / high * 10_000.0;
        if drawdown_bps <= 0.0 {
            return 0.0;
        }
        let peak_age = (now - self.waterfall_peak_ts).max(0.0);
        let decay_hl = self.config.waterfall_decay_sec.max(1.0);
        let decay = (-peak_age * std::f64::consts::LN_2 / decay_hl).exp();
        let vol = self.vol_snapshot.blended_bps.max(1.0);
        drawdown_bps / vol * decay
    }

    pub(crate) fn dynamic_layer_gap_bps(&self) -> f64 {
        let base = self
            .config
            .min_spread_bps
            .max(self.median_spread_bps)
            .max(self.fee_floor_bps() * 0.5);
        if !self.config.dynamic_behavior_enabled {
            return base;
        }
        let dup = self.duplicate_fill_ratio();
        (base * (1.0 + 2.0 * dup)).max(base)
    }

    pub(crate) fn dynamic_min_tp_profit_bps(&self) -> f64 {
        let base = self.config.min_tp_profit_bps.max(0.0);
        let fee = self.fee_floor_bps();
        if !self.config.dynamic_behavior_enabled {
            return base.max(fee * 1.1);
        }
        let near_zero = self.near_zero_close_ratio();
        let loss = self.loss_reason_pressure();
        let target = base.max(fee * (1.1 + near_zero));
        target * (1.0 + 0.5 * loss)
    }

    pub(crate) fn dynamic_min_fast_tp_bps(&self) -> f64 {
        let base = self.config.min_fast_tp_bps;
        if !self.config.dynamic_behavior_enabled {
            return base;
        }
        let fee = self.fee_floor_bps();
        let near_zero = self.near_zero_close_ratio();
        let adjust = fee * (0.3 + near_zero);
        (base - adjust).min(-1.0)
    }

    /// Adaptive layer ceiling, tightened when deep grids have been losing.
    pub(crate) fn dynamic_max_layers(&self) -> usize {
        let base = self.config.max_layers.max(1);
        if !self.config.dynamic_behavior_enabled {
            return base;
        }
        let samples: Vec<f64> = self
            .recent_close_behaviors
            .iter()
            .filter(|s| s.layers >= 3)
            .map(|s| s.net_bps)
            .collect();
        if samples.len() < 8 {
            return base;
        }
        let avg_deep_bps = samples.iter().sum::<f64>() / samples.len() as f64;
        let fee = self.fee_floor_bps();
        if avg_deep_bps < 0.0 {
            base.min(2)
        } else if avg_deep_bps < fee {
            base.min(3)
        } else {
            base
        }
    }

    /// Resolve tp_mode, auto-switching on position size.
    pub(crate) fn effective_tp_mode(&self) -> TpMode {
        match self.config.tp_mode {
            TpMode::Auto => {
                if self.total_notional > 50.0 {
                    TpMode::Vol
                } else {
                    TpMode::Fast
                }
            }
            mode => mode,
        }
    }

    /// Base spacing — vol-aware blend of spread and OHLCV/micro volatility.
    ///
    /// Uses the dominant of median spread and blended volatility so high-vol
    /// coins get wider spacing even when their spread is tight.
    pub(crate) fn base_spacing_bps(&self) -> f64 {
        if self.config.base_spacing_bps > 0.0 {
            return self.config.base_spacing_bps;
        }
        let spread = self.median_spread_bps.max(0.0);
        let vol = self.vol_snapshot.blended_bps.max(0.0);
        spread.max(vol).max(5.0)
    }

    /// Geometric spacing growth adjusted by volatility drift.
    pub(crate) fn effective_spacing_growth(&self) -> f64 {
        (self.config.spacing_growth * self.vol_snapshot.drift_mult).clamp(1.05, 8.0)
    }

    /// TP target in bps, with vol scaling and optional time decay.
    pub(crate) fn tp_target_bps(&self, now: f64) -> f64 {
        let spread_tp = if self.median_spread_bps > 0.0 {
            self.median_spread_bps * self.config.tp_spread_mult
        } else {
            5.0
        };

        // During vol shocks, scale the TP with live vol (capped).
        let mut vol_tp = 0.0;
        if self.config.tp_vol_capture_ratio > 0.0 && self.vol_snapshot.live_bps > 0.0 {
            vol_tp = (self.vol_snapshot.live_bps * self.config.tp_vol_capture_ratio)
                .min(self.config.tp_vol_scale_cap);
        }

        let mut target = spread_tp.max(vol_tp);

        // Time decay: tighten the TP as the position ages.
        let half_life = self.config.tp_decay_half_life_min;
        if half_life > 0.0 && !self.layers.is_empty() {
            let oldest_ts = self
                .layers
                .iter()
                .map(|l| l.entry_ts)
                .fold(f64::INFINITY, f64::min);
            let age_min = (now - oldest_ts) / 60.0;
            let decay = (1.0 - age_min * (1.0 - self.config.tp_decay_floor) / half_life)
                .max(self.config.tp_decay_floor);
            target *= decay;
        }

        target
    }

    /// Update the blended vol regime from live + weighted MTF OHLCV.
    ///
    /// A heavy-tail reading while positioned pauses layering for a scaled
    /// cooldown window.
    pub(crate) fn update_vol_regime(&mut self, now: f64) {
        let live_vol_bps = self.signals.rv_1s() * 10_000.0;
        self.vol_snapshot = self.vol_calibrator.update(live_vol_bps, now);

        if !self.layers.is_empty()
            && self.vol_snapshot.heavy_tail
            && self.config.vol_tail_cooldown_sec > 0.0
        {
            let scale = (self.vol_snapshot.tail_ratio / self.config.vol.tail_mult.max(1.0))
                .clamp(1.0, 3.0);
            let cool = self.config.vol_tail_cooldown_sec * scale;
            self.layer_cooldown_until = self.layer_cooldown_until.max(now + cool);
            if now - self.last_tail_log_ts > 5.0 {
                warn!(
                    symbol = %self.symbol,
                    tail_ratio = format!("{:.2}", self.vol_snapshot.tail_ratio),
                    baseline_bps = format!("{:.1}", self.vol_snapshot.baseline_bps),
                    live_bps = format!("{:.1}", self.vol_snapshot.live_bps),
                    cooldown_sec = format!("{cool:.1}"),
                    "heavy tail detected — layer cooldown extended"
                );
                self.last_tail_log_ts = now;
            }
        }
    }

    /// Circuit breaker / loss-cooldown check.
    pub(crate) fn can_trade(&mut self, now: f64) -> bool {
        if self.cooldown_until > 0.0 {
            if now < self.cooldown_until {
                return false;
            }
            self.cooldown_until = 0.0;
        }

        if self.circuit_breaker_ts > 0.0 {
            if now - self.circuit_breaker_ts < self.config.circuit_pause_sec {
                return false;
            }
            info!(symbol = %self.symbol, "circuit breaker reset");
            self.circuit_breaker_ts = 0.0;
            // Still in breach after the pause: re-trip immediately.
            if self.realized_pnl_bps < -self.config.max_loss_bps {
                self.circuit_breaker_ts = now;
                return false;
            }
        }
        true
    }
}
