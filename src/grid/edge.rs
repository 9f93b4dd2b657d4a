// =============================================================================
// Edge gate — lower-confidence-bound expected-edge model
// =============================================================================
//
// Pure computation: fee floors, recovery hurdles, execution-cost estimates,
// and the behavioral ratios that feed the dynamic parameter tuning.

use crate::grid::{EdgeSnapshot, GridTrader};

/// Winsorization bound for recent close samples (bps). A single outlier
/// must not spike the uncertainty estimate.
const CLOSE_SAMPLE_CLIP_BPS: f64 = 30.0;
/// Absolute ceiling on the uncertainty penalty (bps).
const UNCERTAINTY_CAP_BPS: f64 = 60.0;

impl GridTrader {
    pub(crate) fn fee_floor_bps(&self) -> f64 {
        ((self.config.maker_fee + self.config.taker_fee) * 10_000.0).max(0.0)
    }

    pub(crate) fn symbol_notional_cap(&self) -> f64 {
        self.config.max_symbol_notional.max(0.0)
    }

    /// Recovery hurdle in bps for a projected notional: the slice of debt
    /// to repay per close, spread over the position, capped.
    pub(crate) fn recovery_entry_hurdle_bps(&self, projected_notional: f64) -> f64 {
        if !self.config.recovery_debt_enabled || self.recovery_debt_usd <= 0.0 {
            return 0.0;
        }
        let notion = projected_notional.max(0.0);
        if notion <= 0.0 {
            return 0.0;
        }
        let target_usd = self.recovery_debt_usd * self.config.recovery_paydown_ratio.max(0.0);
        let hurdle = target_usd / notion * 10_000.0;
        hurdle.max(0.0).min(self.config.recovery_max_paydown_bps.max(0.0))
    }

    pub(crate) fn recovery_exit_hurdle_bps(&self) -> f64 {
        self.recovery_entry_hurdle_bps(self.total_notional)
    }

    /// 70th percentile of recent observed exit slippage (ask-referenced),
    /// with a configured fallback until enough samples exist.
    pub(crate) fn expected_exit_slippage_bps(&self) -> f64 {
        let samples: Vec<f64> = self
            .recent_exit_slippage_bps
            .iter()
            .map(|v| v.max(0.0))
            .collect();
        if samples.len() < 5 {
            return self.config.edge_default_slippage_bps.max(0.0);
        }
        percentile(&samples, 70.0)
    }

    /// Uncertainty penalty: z-scaled std of recent winsorized close results.
    pub(crate) fn edge_uncertainty_penalty_bps(&self) -> f64 {
        let samples: Vec<f64> = self
            .recent_close_behaviors
            .iter()
            .map(|s| s.net_bps)
            .collect();
        if samples.len() < self.config.edge_min_samples.max(1) {
            return self.config.edge_exec_buffer_bps.max(0.0);
        }
        let clipped: Vec<f64> = samples
            .iter()
            .map(|s| s.clamp(-CLOSE_SAMPLE_CLIP_BPS, CLOSE_SAMPLE_CLIP_BPS))
            .collect();
        let std = if clipped.len() >= 2 { population_std(&clipped) } else { 0.0 };
        let penalty = self.config.edge_uncertainty_z.max(0.0) * std;
        penalty.max(0.0).min(UNCERTAINTY_CAP_BPS)
    }

    /// Lower-confidence-bound edge gate:
    /// `expected_move - expected_cost - uncertainty >= required_hurdle`.
    ///
    /// Records the full breakdown on `last_edge_snapshot` for telemetry.
    pub(crate) fn has_sufficient_edge(
        &mut self,
        signal_strength: f64,
        spread_bps: f64,
        projected_notional: f64,
        context: &'static str,
    ) -> bool {
        let tp_target = self
            .tp_target_bps(self.last_book_ts)
            .max(self.dynamic_min_tp_profit_bps());
        let fee_floor = self.fee_floor_bps();
        let slippage = self.expected_exit_slippage_bps();
        let exec_buffer = self.config.edge_exec_buffer_bps.max(0.0);
        let expected_cost = fee_floor + slippage + exec_buffer;

        let threshold_strength =
            ((self.config.pump_threshold + self.config.exhaust_threshold) * 0.5).max(0.1);
        let signal_bonus = (signal_strength - threshold_strength).max(0.0)
            * self.config.edge_signal_slope_bps.max(0.0);
        let trend_penalty = self.signals.ret_2s_bps().max(0.0) * 0.2;
        let spread_risk = (spread_bps - self.median_spread_bps.max(0.0)).max(0.0) * 0.1;
        let expected_edge = tp_target + signal_bonus - expected_cost - trend_penalty - spread_risk;

        // Cap uncertainty at 75% of a positive edge — attenuate, don't
        // annihilate.
        let mut uncertainty = self.edge_uncertainty_penalty_bps();
        if expected_edge > 0.0 {
            uncertainty = uncertainty.min(expected_edge * 0.75);
        }
        let edge_lcb = expected_edge - uncertainty;
        let required = self
            .config
            .min_edge_bps
            .max(self.recovery_entry_hurdle_bps(projected_notional));
        let ok = edge_lcb >= required;

        self.last_edge_snapshot = EdgeSnapshot {
            context,
            tp_target_bps: tp_target,
            signal_strength,
            signal_bonus_bps: signal_bonus,
            expected_cost_bps: expected_cost,
            uncertainty_bps: uncertainty,
            expected_edge_bps: expected_edge,
            edge_lcb_bps: edge_lcb,
            required_edge_bps: required,
            slippage_est_bps: slippage,
            trend_penalty_bps: trend_penalty,
            spread_risk_bps: spread_risk,
            projected_notional,
        };
        ok
    }

    /// Fraction of recent sell-fill gaps that land within both the cooldown
    /// and a fifth of the median spread — churn signature.
    pub(crate) fn duplicate_fill_ratio(&self) -> f64 {
        if !self.config.dynamic_behavior_enabled {
            return 0.0;
        }
        let n = self.recent_sell_fill_gaps.len();
        if n < 10 {
            return 0.0;
        }
        let sec_cut = self.config.cooldown_sec.max(1.0);
        let bps_cut = (self.median_spread_bps * 0.2).max(0.5);
        let dup = self
            .recent_sell_fill_gaps
            .iter()
            .filter(|g| g.gap_sec <= sec_cut && g.gap_bps <= bps_cut)
            .count();
        dup as f64 / n as f64
    }

    /// Fraction of recent closes with |net_bps| under half the fee floor.
    pub(crate) fn near_zero_close_ratio(&self) -> f64 {
        if !self.config.dynamic_behavior_enabled {
            return 0.0;
        }
        let n = self.recent_close_behaviors.len();
        if n < 10 {
            return 0.0;
        }
        let near_bps = (self.fee_floor_bps() * 0.5).max(1.0);
        let near = self
            .recent_close_behaviors
            .iter()
            .filter(|s| s.net_bps.abs() <= near_bps)
            .count();
        near as f64 / n as f64
    }

    /// Fraction of recent closes with a distressed exit reason.
    pub(crate) fn loss_reason_pressure(&self) -> f64 {
        if !self.config.dynamic_behavior_enabled {
            return 0.0;
        }
        let n = self.recent_close_behaviors.len();
        if n < 10 {
            return 0.0;
        }
        let bad = ["flow_stop", "timeout", "stop", "drawdown", "shutdown"];
        let hits = self
            .recent_close_behaviors
            .iter()
            .filter(|s| bad.contains(&s.reason.as_str()))
            .count();
        hits as f64 / n as f64
    }
}

/// Linear-interpolation percentile over a copy of the samples.
pub(crate) fn percentile(samples: &[f64], pct: f64) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    if sorted.len() == 1 {
        return sorted[0];
    }
    let rank = pct.clamp(0.0, 100.0) / 100.0 * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    if lo == hi {
        sorted[lo]
    } else {
        let frac = rank - lo as f64;
        sorted[lo] + (sorted[hi] - sorted[lo]) * frac
    }
}

/// Population standard deviation.
pub(crate) fn population_std(samples: &[f64]) -> f64 {
    if samples.len() < 2 {
        return 0.0;
    }
    let n = samples.len() as f64;
    let mean = samples.iter().sum::<f64>() / n;
    let var = samples.iter().map(|s| (s - mean) * (s - mean)).sum::<f64>() / n;
    var.max(0.0).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentile_interpolates() {
        let samples = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        assert!((percentile(&samples, 0.0) - 1.0).abs() < 1e-12);
        assert!((percentile(&samples, 100.0) - 5.0).abs() < 1e-12);
        assert!((percentile(&samples, 50.0) - 3.0).abs() < 1e-12);
        // p70 of 5 points: rank 2.8 → 3 + 0.8*(4-3) = 3.8.
        assert!((percentile(&samples, 70.0) - 3.8).abs() < 1e-12);
    }

    #[test]
    fn population_std_matches_hand_calc() {
        let samples = vec![2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        assert!((population_std(&samples) - 2.0).abs() < 1e-12);
        assert_eq!(population_std(&[1.0]), 0.0);
    }
}
