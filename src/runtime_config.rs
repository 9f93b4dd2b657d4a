// =============================================================================
// Runtime Configuration — engine settings with atomic save
// =============================================================================
//
// Central configuration hub for the Helix grid runner. Persistence uses an
// atomic tmp + rename pattern to prevent corruption on crash. All fields
// carry serde defaults so adding new fields never breaks loading an older
// config file.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::grid::{GridConfig, TpMode};
use crate::volatility::VolatilityConfig;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn d_top_n() -> usize {
    50
}
fn d_min_change_pct() -> f64 {
    3.0
}
fn d_rotation_interval_sec() -> f64 {
    600.0
}
fn d_display_interval() -> f64 {
    10.0
}
fn d_max_total_notional() -> f64 {
    300.0
}
fn d_min_notional() -> f64 {
    6.0
}
fn d_max_notional() -> f64 {
    30.0
}
fn d_max_layers() -> usize {
    8
}
fn d_spacing_growth() -> f64 {
    1.6
}
fn d_size_growth() -> f64 {
    1.0
}
fn d_trend_spacing_scale() -> f64 {
    5.0
}
fn d_maker_fee() -> f64 {
    0.000252
}
fn d_taker_fee() -> f64 {
    0.000336
}
fn d_candle_service_url() -> String {
    std::env::var("CANDLE_SERVICE_URL").unwrap_or_else(|_| "http://localhost:3003".to_string())
}
fn d_vol_refresh_sec() -> f64 {
    120.0
}
fn d_vol_live_weight() -> f64 {
    0.45
}
fn d_vol_drift_min() -> f64 {
    0.8
}
fn d_vol_drift_max() -> f64 {
    3.0
}
fn d_vol_tail_mult() -> f64 {
    2.2
}
fn d_vol_tail_cooldown_sec() -> f64 {
    20.0
}
fn d_vol_tf_weights() -> BTreeMap<String, f64> {
    VolatilityConfig::default().tf_weights
}
fn d_vol_tf_lookbacks() -> BTreeMap<String, String> {
    VolatilityConfig::default().tf_lookbacks
}
fn d_min_spread_bps() -> f64 {
    5.0
}
fn d_max_spread_bps() -> f64 {
    40.0
}
fn d_cooldown_sec() -> f64 {
    2.0
}
fn d_warmup_sec() -> f64 {
    30.0
}
fn d_resume_context_rewarm_sec() -> f64 {
    30.0
}
fn d_pump_threshold() -> f64 {
    2.0
}
fn d_exhaust_threshold() -> f64 {
    1.0
}
fn d_max_trend_bps() -> f64 {
    5.0
}
fn d_max_trend_30s_bps() -> f64 {
    30.0
}
fn d_max_buy_ratio() -> f64 {
    1.0
}
fn d_tp_spread_mult() -> f64 {
    1.2
}
fn d_min_tp_profit_bps() -> f64 {
    10.0
}
fn d_tp_decay_floor() -> f64 {
    0.5
}
fn d_tp_vol_capture_ratio() -> f64 {
    0.15
}
fn d_tp_vol_scale_cap() -> f64 {
    50.0
}
fn d_fast_tp_ti() -> f64 {
    -0.25
}
fn d_min_fast_tp_bps() -> f64 {
    -10.0
}
fn d_min_edge_bps() -> f64 {
    2.0
}
fn d_edge_signal_slope_bps() -> f64 {
    1.0
}
fn d_edge_exec_buffer_bps() -> f64 {
    0.3
}
fn d_edge_default_slippage_bps() -> f64 {
    0.5
}
fn d_edge_uncertainty_z() -> f64 {
    0.75
}
fn d_edge_min_samples() -> usize {
    5
}
fn d_inverse_tp_min_layers() -> usize {
    3
}
fn d_inverse_tp_max_zones() -> usize {
    5
}
fn d_inverse_tp_time_cap_sec() -> f64 {
    1800.0
}
fn d_waterfall_vol_threshold() -> f64 {
    3.0
}
fn d_waterfall_decay_sec() -> f64 {
    30.0
}
fn d_recovery_paydown_ratio() -> f64 {
    0.25
}
fn d_recovery_max_paydown_bps() -> f64 {
    25.0
}
fn d_recovery_debt_cap_usd() -> f64 {
    75.0
}
fn d_recovery_lookback_hours() -> f64 {
    24.0
}
fn d_recovery_avg_min_unrealized_bps() -> f64 {
    35.0
}
fn d_recovery_avg_min_hurdle_improve_bps() -> f64 {
    0.75
}
fn d_recovery_avg_cooldown_sec() -> f64 {
    20.0
}
fn d_recovery_avg_max_adds_per_hour() -> usize {
    8
}
fn d_recovery_state_sync_sec() -> f64 {
    30.0
}
fn d_runtime_state_sync_sec() -> f64 {
    20.0
}
fn d_strategy_event_retention_days() -> f64 {
    14.0
}
fn d_stealth_max_l1_fraction() -> f64 {
    0.5
}
fn d_stealth_max_ticks() -> usize {
    5
}
fn d_stealth_min_slices() -> usize {
    2
}
fn d_stealth_max_slices() -> usize {
    5
}
fn d_max_loss_bps() -> f64 {
    500.0
}
fn d_circuit_pause_sec() -> f64 {
    120.0
}
fn d_loss_cooldown_sec() -> f64 {
    8.0
}
fn d_behavior_lookback() -> usize {
    120
}
fn d_log_dir() -> String {
    "./helix_sessions".to_string()
}
fn d_bridge_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}
fn d_pms_api_url() -> String {
    let port = std::env::var("PMS_PORT").unwrap_or_else(|_| "3900".to_string());
    format!("http://localhost:{port}/api/bot")
}

// =============================================================================
// RunnerConfig
// =============================================================================

/// Top-level runtime configuration for the grid runner.
///
/// Every field has a serde default so older JSON files missing new fields
/// still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    // --- Symbols & scanning --------------------------------------------------
    /// Fixed symbol list; empty means scan the universe.
    #[serde(default)]
    pub symbols: Vec<String>,
    #[serde(default = "d_top_n")]
    pub top_n: usize,
    #[serde(default = "d_min_change_pct")]
    pub min_change_pct: f64,
    /// 0 disables pair rotation.
    #[serde(default = "d_rotation_interval_sec")]
    pub rotation_interval_sec: f64,
    /// Symbols never traded.
    #[serde(default)]
    pub blacklist: Vec<String>,

    // --- Session / scoping ---------------------------------------------------
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub user_scope: String,
    #[serde(default = "default_true")]
    pub account_scoped_storage: bool,
    #[serde(default = "d_log_dir")]
    pub log_dir: String,

    // --- Portfolio risk ------------------------------------------------------
    #[serde(default = "d_max_total_notional")]
    pub max_total_notional: f64,
    #[serde(default)]
    pub max_symbol_notional: f64,

    // --- Fees ----------------------------------------------------------------
    #[serde(default = "d_maker_fee")]
    pub maker_fee: f64,
    #[serde(default = "d_taker_fee")]
    pub taker_fee: f64,

    // --- Grid ----------------------------------------------------------------
    #[serde(default = "d_min_notional")]
    pub min_notional: f64,
    #[serde(default = "d_max_notional")]
    pub max_notional: f64,
    #[serde(default = "d_max_layers")]
    pub max_layers: usize,
    #[serde(default = "d_spacing_growth")]
    pub spacing_growth: f64,
    #[serde(default = "d_size_growth")]
    pub size_growth: f64,
    #[serde(default)]
    pub base_spacing_bps: f64,
    #[serde(default = "d_trend_spacing_scale")]
    pub trend_spacing_scale: f64,

    // --- Volatility calibration ----------------------------------------------
    #[serde(default = "default_true")]
    pub vol_drift_enabled: bool,
    #[serde(default = "d_candle_service_url")]
    pub candle_service_url: String,
    #[serde(default = "d_vol_refresh_sec")]
    pub vol_refresh_sec: f64,
    #[serde(default = "d_vol_live_weight")]
    pub vol_live_weight: f64,
    #[serde(default = "d_vol_drift_min")]
    pub vol_drift_min: f64,
    #[serde(default = "d_vol_drift_max")]
    pub vol_drift_max: f64,
    #[serde(default = "d_vol_tail_mult")]
    pub vol_tail_mult: f64,
    #[serde(default = "d_vol_tail_cooldown_sec")]
    pub vol_tail_cooldown_sec: f64,
    #[serde(default = "d_vol_tf_weights")]
    pub vol_tf_weights: BTreeMap<String, f64>,
    #[serde(default = "d_vol_tf_lookbacks")]
    pub vol_tf_lookbacks: BTreeMap<String, String>,

    // --- Signals -------------------------------------------------------------
    #[serde(default = "d_min_spread_bps")]
    pub min_spread_bps: f64,
    #[serde(default = "d_max_spread_bps")]
    pub max_spread_bps: f64,
    #[serde(default = "d_cooldown_sec")]
    pub cooldown_sec: f64,
    #[serde(default = "d_warmup_sec")]
    pub warmup_sec: f64,
    #[serde(default = "d_resume_context_rewarm_sec")]
    pub resume_context_rewarm_sec: f64,
    #[serde(default = "d_pump_threshold")]
    pub pump_threshold: f64,
    #[serde(default = "d_exhaust_threshold")]
    pub exhaust_threshold: f64,
    #[serde(default = "d_max_trend_bps")]
    pub max_trend_bps: f64,
    #[serde(default = "d_max_trend_30s_bps")]
    pub max_trend_30s_bps: f64,
    #[serde(default = "d_max_buy_ratio")]
    pub max_buy_ratio: f64,

    // --- Exit ----------------------------------------------------------------
    #[serde(default = "d_tp_spread_mult")]
    pub tp_spread_mult: f64,
    #[serde(default = "d_min_tp_profit_bps")]
    pub min_tp_profit_bps: f64,
    #[serde(default)]
    pub tp_decay_half_life_min: f64,
    #[serde(default = "d_tp_decay_floor")]
    pub tp_decay_floor: f64,
    #[serde(default = "d_tp_vol_capture_ratio")]
    pub tp_vol_capture_ratio: f64,
    #[serde(default = "d_tp_vol_scale_cap")]
    pub tp_vol_scale_cap: f64,
    #[serde(default)]
    pub tp_mode: TpMode,
    #[serde(default = "d_fast_tp_ti")]
    pub fast_tp_ti: f64,
    #[serde(default = "d_min_fast_tp_bps")]
    pub min_fast_tp_bps: f64,
    #[serde(default)]
    pub stop_loss_bps: f64,

    // --- Edge model ----------------------------------------------------------
    #[serde(default = "d_min_edge_bps")]
    pub min_edge_bps: f64,
    #[serde(default = "d_edge_signal_slope_bps")]
    pub edge_signal_slope_bps: f64,
    #[serde(default = "d_edge_exec_buffer_bps")]
    pub edge_exec_buffer_bps: f64,
    #[serde(default = "d_edge_default_slippage_bps")]
    pub edge_default_slippage_bps: f64,
    #[serde(default = "d_edge_uncertainty_z")]
    pub edge_uncertainty_z: f64,
    #[serde(default = "d_edge_min_samples")]
    pub edge_min_samples: usize,

    // --- Inverse grid TP -----------------------------------------------------
    #[serde(default = "default_true")]
    pub inverse_tp_enabled: bool,
    #[serde(default = "d_inverse_tp_min_layers")]
    pub inverse_tp_min_layers: usize,
    #[serde(default = "d_inverse_tp_max_zones")]
    pub inverse_tp_max_zones: usize,
    #[serde(default = "d_inverse_tp_time_cap_sec")]
    pub inverse_tp_time_cap_sec: f64,

    // --- Waterfall -----------------------------------------------------------
    #[serde(default = "d_waterfall_vol_threshold")]
    pub waterfall_vol_threshold: f64,
    #[serde(default = "d_waterfall_decay_sec")]
    pub waterfall_decay_sec: f64,

    // --- Recovery ------------------------------------------------------------
    #[serde(default = "default_true")]
    pub recovery_debt_enabled: bool,
    #[serde(default = "d_recovery_paydown_ratio")]
    pub recovery_paydown_ratio: f64,
    #[serde(default = "d_recovery_max_paydown_bps")]
    pub recovery_max_paydown_bps: f64,
    #[serde(default = "d_recovery_debt_cap_usd")]
    pub recovery_debt_cap_usd: f64,
    #[serde(default = "d_recovery_lookback_hours")]
    pub recovery_lookback_hours: f64,
    #[serde(default = "default_true")]
    pub recovery_avg_enabled: bool,
    #[serde(default = "d_recovery_avg_min_unrealized_bps")]
    pub recovery_avg_min_unrealized_bps: f64,
    #[serde(default = "d_recovery_avg_min_hurdle_improve_bps")]
    pub recovery_avg_min_hurdle_improve_bps: f64,
    #[serde(default = "d_recovery_avg_cooldown_sec")]
    pub recovery_avg_cooldown_sec: f64,
    #[serde(default = "d_recovery_avg_max_adds_per_hour")]
    pub recovery_avg_max_adds_per_hour: usize,

    // --- Persistence cadence -------------------------------------------------
    #[serde(default = "d_recovery_state_sync_sec")]
    pub recovery_state_sync_sec: f64,
    #[serde(default = "default_true")]
    pub runtime_state_enabled: bool,
    #[serde(default = "d_runtime_state_sync_sec")]
    pub runtime_state_sync_sec: f64,
    #[serde(default = "default_true")]
    pub strategy_event_logging: bool,
    #[serde(default = "d_strategy_event_retention_days")]
    pub strategy_event_retention_days: f64,

    // --- Lifecycle -----------------------------------------------------------
    #[serde(default = "default_true")]
    pub babysitter_enabled: bool,
    #[serde(default = "default_true")]
    pub adopt_orphan_positions: bool,
    #[serde(default)]
    pub orphan_recovery_only: bool,
    /// Leave positions on the exchange at shutdown.
    #[serde(default = "default_true")]
    pub keep_positions: bool,

    // --- Stealth -------------------------------------------------------------
    #[serde(default = "d_stealth_max_l1_fraction")]
    pub stealth_max_l1_fraction: f64,
    #[serde(default = "d_stealth_max_ticks")]
    pub stealth_max_ticks: usize,
    #[serde(default = "default_true")]
    pub stealth_always_split: bool,
    #[serde(default = "d_stealth_min_slices")]
    pub stealth_min_slices: usize,
    #[serde(default = "d_stealth_max_slices")]
    pub stealth_max_slices: usize,

    // --- Risk ----------------------------------------------------------------
    #[serde(default = "d_max_loss_bps")]
    pub max_loss_bps: f64,
    #[serde(default = "d_circuit_pause_sec")]
    pub circuit_pause_sec: f64,
    #[serde(default = "d_loss_cooldown_sec")]
    pub loss_cooldown_sec: f64,
    #[serde(default = "default_true")]
    pub dynamic_behavior_enabled: bool,
    #[serde(default = "d_behavior_lookback")]
    pub behavior_lookback: usize,

    // --- External services ---------------------------------------------------
    #[serde(default = "d_bridge_bind_addr")]
    pub bridge_bind_addr: String,
    #[serde(default = "d_pms_api_url")]
    pub pms_api_url: String,
    #[serde(default)]
    pub redis_url: String,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults deserialise")
    }
}

impl RunnerConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// Returns an error if the file is missing so the caller can fall back
    /// to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runner config from {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runner config from {}", path.display()))?;
        info!(
            path = %path.display(),
            symbols = ?config.symbols,
            max_total_notional = config.max_total_notional,
            "runner config loaded"
        );
        Ok(config)
    }

    /// Persist the configuration with an atomic tmp + rename write.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content =
            serde_json::to_string_pretty(self).context("failed to serialise runner config")?;
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;
        info!(path = %path.display(), "runner config saved (atomic)");
        Ok(())
    }

    /// Build the per-symbol grid config.
    pub fn grid_config(&self, symbol: &str) -> GridConfig {
        GridConfig {
            symbol: symbol.to_uppercase(),
            maker_fee: self.maker_fee,
            taker_fee: self.taker_fee,
            min_notional: self.min_notional,
            max_notional: self.max_notional,
            max_layers: self.max_layers,
            spacing_growth: self.spacing_growth,
            size_growth: self.size_growth,
            base_spacing_bps: self.base_spacing_bps,
            trend_spacing_scale: self.trend_spacing_scale,
            vol: VolatilityConfig {
                enabled: self.vol_drift_enabled,
                candle_service_url: self.candle_service_url.clone(),
                exchange: "binance".to_string(),
                refresh_sec: self.vol_refresh_sec,
                live_weight: self.vol_live_weight,
                drift_min: self.vol_drift_min,
                drift_max: self.vol_drift_max,
                tail_mult: self.vol_tail_mult,
                live_ema_alpha: 0.25,
                tf_weights: self.vol_tf_weights.clone(),
                tf_lookbacks: self.vol_tf_lookbacks.clone(),
            },
            vol_tail_cooldown_sec: self.vol_tail_cooldown_sec,
            min_spread_bps: self.min_spread_bps,
            max_spread_bps: self.max_spread_bps,
            cooldown_sec: self.cooldown_sec,
            warmup_sec: self.warmup_sec,
            resume_context_rewarm_sec: self.resume_context_rewarm_sec,
            pump_threshold: self.pump_threshold,
            exhaust_threshold: self.exhaust_threshold,
            max_trend_bps: self.max_trend_bps,
            max_trend_30s_bps: self.max_trend_30s_bps,
            max_buy_ratio: self.max_buy_ratio,
            tp_spread_mult: self.tp_spread_mult,
            min_tp_profit_bps: self.min_tp_profit_bps,
            tp_decay_half_life_min: self.tp_decay_half_life_min,
            tp_decay_floor: self.tp_decay_floor,
            tp_vol_capture_ratio: self.tp_vol_capture_ratio,
            tp_vol_scale_cap: self.tp_vol_scale_cap,
            tp_mode: self.tp_mode,
            fast_tp_ti: self.fast_tp_ti,
            min_fast_tp_bps: self.min_fast_tp_bps,
            stop_loss_bps: self.stop_loss_bps,
            min_edge_bps: self.min_edge_bps,
            edge_signal_slope_bps: self.edge_signal_slope_bps,
            edge_exec_buffer_bps: self.edge_exec_buffer_bps,
            edge_default_slippage_bps: self.edge_default_slippage_bps,
            edge_uncertainty_z: self.edge_uncertainty_z,
            edge_min_samples: self.edge_min_samples,
            max_symbol_notional: self.max_symbol_notional,
            inverse_tp_enabled: self.inverse_tp_enabled,
            inverse_tp_min_layers: self.inverse_tp_min_layers,
            inverse_tp_max_zones: self.inverse_tp_max_zones,
            inverse_tp_time_cap_sec: self.inverse_tp_time_cap_sec,
            waterfall_vol_threshold: self.waterfall_vol_threshold,
            waterfall_decay_sec: self.waterfall_decay_sec,
            recovery_debt_enabled: self.recovery_debt_enabled,
            recovery_paydown_ratio: self.recovery_paydown_ratio,
            recovery_max_paydown_bps: self.recovery_max_paydown_bps,
            recovery_debt_cap_usd: self.recovery_debt_cap_usd,
            recovery_avg_enabled: self.recovery_avg_enabled,
            recovery_avg_min_unrealized_bps: self.recovery_avg_min_unrealized_bps,
            recovery_avg_min_hurdle_improve_bps: self.recovery_avg_min_hurdle_improve_bps,
            recovery_avg_cooldown_sec: self.recovery_avg_cooldown_sec,
            recovery_avg_max_adds_per_hour: self.recovery_avg_max_adds_per_hour,
            stealth_max_l1_fraction: self.stealth_max_l1_fraction,
            stealth_max_ticks: self.stealth_max_ticks,
            stealth_always_split: self.stealth_always_split,
            stealth_min_slices: self.stealth_min_slices,
            stealth_max_slices: self.stealth_max_slices,
            max_loss_bps: self.max_loss_bps,
            circuit_pause_sec: self.circuit_pause_sec,
            loss_cooldown_sec: self.loss_cooldown_sec,
            dynamic_behavior_enabled: self.dynamic_behavior_enabled,
            behavior_lookback: self.behavior_lookback,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RunnerConfig::default();
        assert!(cfg.symbols.is_empty());
        assert_eq!(cfg.max_layers, 8);
        assert!((cfg.max_total_notional - 300.0).abs() < f64::EPSILON);
        assert!((cfg.min_notional - 6.0).abs() < f64::EPSILON);
        assert!((cfg.spacing_growth - 1.6).abs() < f64::EPSILON);
        assert!((cfg.min_spread_bps - 5.0).abs() < f64::EPSILON);
        assert!((cfg.tp_spread_mult - 1.2).abs() < f64::EPSILON);
        assert_eq!(cfg.tp_mode, TpMode::Auto);
        assert!(cfg.inverse_tp_enabled);
        assert_eq!(cfg.inverse_tp_min_layers, 3);
        assert!(cfg.recovery_debt_enabled);
        assert!((cfg.recovery_debt_cap_usd - 75.0).abs() < f64::EPSILON);
        assert!(cfg.stealth_always_split);
        assert_eq!(cfg.stop_loss_bps, 0.0);
        assert!(cfg.keep_positions);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "symbols": ["ETHUSDT"], "max_total_notional": 500.0, "tp_mode": "vol" }"#;
        let cfg: RunnerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.symbols, vec!["ETHUSDT"]);
        assert!((cfg.max_total_notional - 500.0).abs() < f64::EPSILON);
        assert_eq!(cfg.tp_mode, TpMode::Vol);
        assert_eq!(cfg.max_layers, 8);
        assert!(cfg.adopt_orphan_positions);
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = RunnerConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: RunnerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.max_layers, cfg2.max_layers);
        assert_eq!(cfg.tp_mode, cfg2.tp_mode);
        assert!((cfg.max_total_notional - cfg2.max_total_notional).abs() < f64::EPSILON);
    }

    #[test]
    fn grid_config_inherits_runner_values() {
        let mut cfg = RunnerConfig::default();
        cfg.max_symbol_notional = 42.0;
        cfg.pump_threshold = 2.5;
        cfg.vol_drift_enabled = false;
        let grid = cfg.grid_config("solusdt");
        assert_eq!(grid.symbol, "SOLUSDT");
        assert!((grid.max_symbol_notional - 42.0).abs() < f64::EPSILON);
        assert!((grid.pump_threshold - 2.5).abs() < f64::EPSILON);
        assert!(!grid.vol.enabled);
    }
}
