// =============================================================================
// Stealth order slicing — randomized, tick-laddered order placement
// =============================================================================
//
// Splits an order into random-sized pieces across price ticks so resting
// size looks organic instead of one fat level. Entries ladder upward from
// the reference price, exits ladder downward.

use rand::Rng;

/// Direction the slice ladder moves from the base price.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceDirection {
    /// Entries (sell): higher prices.
    Up,
    /// Exits (buy): lower prices.
    Down,
}

/// Inputs for one slicing decision.
#[derive(Debug, Clone)]
pub struct StealthParams {
    pub max_fraction: f64,
    pub max_ticks: usize,
    pub min_qty: f64,
    pub direction: SliceDirection,
    pub always_split: bool,
    pub min_slices: usize,
    pub max_slices: usize,
    /// Venue minimum notional per order (USD).
    pub min_notional: f64,
}

impl Default for StealthParams {
    fn default() -> Self {
        Self {
            max_fraction: 0.5,
            max_ticks: 5,
            min_qty: 0.0,
            direction: SliceDirection::Up,
            always_split: false,
            min_slices: 2,
            max_slices: 5,
            min_notional: 5.0,
        }
    }
}

/// Split `total_qty` into random (qty, price) slices.
///
/// Weights are exponential draws normalized to the total (Dirichlet-like).
/// Every slice satisfies both `min_qty` and the notional floor — undersized
/// slices steal from the largest; stragglers merge. The largest slice
/// absorbs rounding drift so the quantities sum exactly. Slice order is
/// shuffled so the placement sequence is unpredictable.
pub fn compute_stealth_slices(
    total_qty: f64,
    base_price: f64,
    price_step: f64,
    l1_depth_qty: f64,
    params: &StealthParams,
) -> Vec<(f64, f64)> {
    if total_qty <= 0.0 || price_step <= 0.0 {
        return vec![(total_qty, base_price)];
    }

    // Floor: each slice must satisfy BOTH min_qty AND the min notional.
    let notional_floor_qty = if base_price > 0.0 {
        params.min_notional / base_price
    } else {
        0.0
    };
    let effective_min = params.min_qty.max(notional_floor_qty).max(1e-12);

    let max_possible = ((total_qty / effective_min) as usize).max(1);

    let mut rng = rand::thread_rng();
    let n_slices = if params.always_split && max_possible >= 2 {
        let lo = params.min_slices.min(max_possible).max(2);
        let mut hi = params.max_slices.min(max_possible).min(params.max_ticks.max(1));
        if hi < lo {
            hi = lo;
        }
        rng.gen_range(lo..=hi)
    } else if l1_depth_qty > 0.0 {
        // Legacy path: only split when exceeding L1 capacity.
        let capacity = l1_depth_qty * params.max_fraction;
        if total_qty <= capacity {
            return vec![(total_qty, base_price)];
        }
        let wanted = ((total_qty / capacity.max(1e-12)) as usize + 1).max(2);
        wanted.min(params.max_ticks).min(max_possible)
    } else {
        return vec![(total_qty, base_price)];
    };

    if n_slices < 2 {
        return vec![(total_qty, base_price)];
    }

    // Random weights — Dirichlet-like via exponential draws.
    let raw_weights: Vec<f64> = (0..n_slices)
        .map(|_| -(1.0 - rng.gen::<f64>()).ln())
        .collect();
    let weight_sum: f64 = raw_weights.iter().sum();
    let mut qtys: Vec<f64> = raw_weights
        .iter()
        .map(|w| w / weight_sum * total_qty)
        .collect();

    // Enforce the floor: steal from the largest slice to fix undersized ones.
    for _ in 0..n_slices * 2 {
        let undersized: Vec<usize> = (0..qtys.len())
            .filter(|&i| qtys[i] < effective_min)
            .collect();
        if undersized.is_empty() {
            break;
        }
        let largest = largest_index(&qtys);
        for i in undersized {
            let deficit = effective_min - qtys[i];
            if qtys[largest] - deficit >= effective_min {
                qtys[largest] -= deficit;
                qtys[i] = effective_min;
            }
        }
    }

    // Merge any remaining stragglers into the first valid slice.
    let leftover: f64 = qtys.iter().filter(|&&q| q < effective_min).sum();
    if leftover > 0.0 {
        qtys.retain(|&q| q >= effective_min);
        if qtys.is_empty() {
            return vec![(total_qty, base_price)];
        }
        qtys[0] += leftover;
    }

    if qtys.len() < 2 {
        return vec![(total_qty, base_price)];
    }

    // Correct rounding drift on the largest slice so the total is exact.
    let drift = total_qty - qtys.iter().sum::<f64>();
    let largest = largest_index(&qtys);
    qtys[largest] += drift;

    // Assign prices: ladder across ticks, saturating at max_ticks.
    let tick_sign = match params.direction {
        SliceDirection::Up => 1.0,
        SliceDirection::Down => -1.0,
    };
    let mut slices: Vec<(f64, f64)> = qtys
        .iter()
        .enumerate()
        .map(|(i, &qty)| {
            let tick_offset = i.min(params.max_ticks.saturating_sub(1)) as f64;
            (qty, base_price + tick_offset * tick_sign * price_step)
        })
        .collect();

    // Shuffle so the placement sequence is unpredictable.
    for i in (1..slices.len()).rev() {
        let j = rng.gen_range(0..=i);
        slices.swap(i, j);
    }

    slices
}

fn largest_index(qtys: &[f64]) -> usize {
    let mut idx = 0;
    for (i, &q) in qtys.iter().enumerate() {
        if q > qtys[idx] {
            idx = i;
        }
    }
    idx
}

#[cfg(test)]
mod tests {
    use super::*;

    fn always_split_params() -> StealthParams {
        StealthParams {
            max_fraction: 0.5,
            max_ticks: 5,
            min_qty: 10.0,
            direction: SliceDirection::Up,
            always_split: true,
            min_slices: 2,
            max_slices: 5,
            min_notional: 5.0,
        }
    }

    #[test]
    fn always_split_preserves_total_and_ladder() {
        // total=100, price=1.0, tick=0.01, min_qty=10 → effective_min 10,
        // up to 10 slices possible, chosen count in [2, 5].
        for _ in 0..50 {
            let slices =
                compute_stealth_slices(100.0, 1.0, 0.01, 40.0, &always_split_params());
            assert!(slices.len() >= 2 && slices.len() <= 5, "{}", slices.len());

            let total: f64 = slices.iter().map(|(q, _)| q).sum();
            assert!((total - 100.0).abs() < 1e-9);

            for (qty, price) in &slices {
                assert!(*qty >= 10.0 - 1e-9);
                // Prices land on {1.00, 1.01, 1.02, 1.03, 1.04}.
                let offset = (price - 1.0) / 0.01;
                assert!(offset >= -1e-9 && offset <= 4.0 + 1e-9);
                assert!((offset - offset.round()).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn down_direction_ladders_below_base() {
        let params = StealthParams {
            direction: SliceDirection::Down,
            ..always_split_params()
        };
        let slices = compute_stealth_slices(100.0, 1.0, 0.01, 40.0, &params);
        for (_, price) in &slices {
            assert!(*price <= 1.0 + 1e-12);
            assert!(*price >= 1.0 - 0.04 - 1e-12);
        }
    }

    #[test]
    fn small_order_within_depth_is_not_split() {
        let params = StealthParams {
            always_split: false,
            ..always_split_params()
        };
        // Depth capacity 40·0.5 = 20 covers qty 15 → single slice.
        let slices = compute_stealth_slices(15.0, 1.0, 0.01, 40.0, &params);
        assert_eq!(slices.len(), 1);
        assert_eq!(slices[0], (15.0, 1.0));
    }

    #[test]
    fn depth_overflow_splits_legacy_path() {
        let params = StealthParams {
            always_split: false,
            min_qty: 1.0,
            ..always_split_params()
        };
        // Capacity 10·0.5 = 5, qty 30 → splits.
        let slices = compute_stealth_slices(30.0, 1.0, 0.01, 10.0, &params);
        assert!(slices.len() >= 2);
        let total: f64 = slices.iter().map(|(q, _)| q).sum();
        assert!((total - 30.0).abs() < 1e-9);
    }

    #[test]
    fn tiny_order_falls_back_to_single_slice() {
        // Below 2× the effective minimum there is nothing to split.
        let slices = compute_stealth_slices(12.0, 1.0, 0.01, 40.0, &always_split_params());
        assert_eq!(slices.len(), 1);
    }

    #[test]
    fn zero_tick_passthrough() {
        let slices = compute_stealth_slices(10.0, 1.0, 0.0, 40.0, &always_split_params());
        assert_eq!(slices, vec![(10.0, 1.0)]);
    }
}
