// =============================================================================
// Bounded-memory multi-timeframe flow metrics
// =============================================================================
//
// Per-second trade aggregates served as rolling-window metrics with O(1)
// update cost and a bounded memory footprint.

use std::collections::{BTreeMap, VecDeque};

/// Rolling windows served by every snapshot.
pub const WINDOW_SPECS: [(u64, &str); 7] = [
    (1, "1s"),
    (5, "5s"),
    (10, "10s"),
    (30, "30s"),
    (60, "60s"),
    (300, "5m"),
    (600, "10m"),
];

/// One second of aggregated trade flow.
#[derive(Debug, Clone, Copy, Default)]
struct Bucket {
    sec: u64,
    buy_qty: f64,
    sell_qty: f64,
    trades: f64,
    notional: f64,
}

/// Rolling per-second flow aggregator.
#[derive(Debug)]
pub struct SecondBucketFlow {
    max_window_sec: u64,
    buckets: VecDeque<Bucket>,
}

impl SecondBucketFlow {
    pub fn new(max_window_sec: u64) -> Self {
        Self {
            max_window_sec: max_window_sec.max(1),
            buckets: VecDeque::new(),
        }
    }

    /// Fold in one trade event.
    pub fn add(&mut self, ts: f64, qty: f64, price: f64, is_sell: bool) {
        let sec = ts as u64;
        if sec == 0 {
            return;
        }
        let qty = qty.max(0.0);
        let price = price.max(0.0);
        if qty <= 0.0 || price <= 0.0 {
            return;
        }

        self.evict(sec);
        let Some(bucket) = self.ensure_bucket(sec) else {
            return;
        };
        if is_sell {
            bucket.sell_qty += qty;
        } else {
            bucket.buy_qty += qty;
        }
        bucket.trades += 1.0;
        bucket.notional += qty * price;
    }

    fn ensure_bucket(&mut self, sec: u64) -> Option<&mut Bucket> {
        match self.buckets.back().map(|b| b.sec) {
            None => {
                self.buckets.push_back(Bucket { sec, ..Default::default() });
                self.buckets.back_mut()
            }
            Some(last) if sec > last => {
                self.buckets.push_back(Bucket { sec, ..Default::default() });
                self.buckets.back_mut()
            }
            Some(last) if sec == last => self.buckets.back_mut(),
            _ => {
                // Out-of-order trade: find its bucket among the recent tail,
                // otherwise drop the stale update.
                self.buckets.iter_mut().rev().find(|b| b.sec == sec)
            }
        }
    }

    fn evict(&mut self, now_sec: u64) {
        let cutoff = now_sec.saturating_sub(self.max_window_sec + 1);
        while let Some(front) = self.buckets.front() {
            if front.sec >= cutoff {
                break;
            }
            self.buckets.pop_front();
        }
    }

    fn window_totals(&self, now_sec: u64, window_sec: u64) -> (f64, f64, f64, f64) {
        let cutoff = now_sec.saturating_sub(window_sec).saturating_add(1);
        let mut buy = 0.0;
        let mut sell = 0.0;
        let mut trades = 0.0;
        let mut notional = 0.0;
        for b in self.buckets.iter().rev() {
            if b.sec < cutoff {
                break;
            }
            buy += b.buy_qty;
            sell += b.sell_qty;
            trades += b.trades;
            notional += b.notional;
        }
        (buy, sell, trades, notional)
    }

    /// Flat metrics per window.
    ///
    /// Keys per window label:
    ///   {prefix}tw_<label>  — total aggressive qty in window
    ///   {prefix}tps_<label> — trades per second
    ///   {prefix}nps_<label> — notional per second
    ///   {prefix}ti_<label>  — signed imbalance in [-1, +1]
    ///   {prefix}lsr_<label> — long/short ratio (buy_qty / sell_qty)
    pub fn snapshot(&mut self, now_ts: f64, prefix: &str) -> BTreeMap<String, f64> {
        let now_sec = now_ts as u64;
        self.evict(now_sec);
        let mut out = BTreeMap::new();
        for (win_sec, label) in WINDOW_SPECS {
            let (buy, sell, trades, notional) = self.window_totals(now_sec, win_sec);
            let total = buy + sell;
            let ti = if total > 1e-12 { (buy - sell) / total } else { 0.0 };
            let lsr = if sell > 1e-12 {
                buy / sell
            } else if buy > 0.0 {
                999.0
            } else {
                1.0
            };
            let denom = (win_sec as f64).max(1.0);
            out.insert(format!("{prefix}tw_{label}"), total);
            out.insert(format!("{prefix}tps_{label}"), trades / denom);
            out.insert(format!("{prefix}nps_{label}"), notional / denom);
            out.insert(format!("{prefix}ti_{label}"), ti);
            out.insert(format!("{prefix}lsr_{label}"), lsr);
        }
        out
    }
}

impl Default for SecondBucketFlow {
    fn default() -> Self {
        Self::new(600)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_aggregates_one_window() {
        let mut flow = SecondBucketFlow::new(600);
        flow.add(1000.2, 2.0, 10.0, false);
        flow.add(1000.7, 1.0, 10.0, true);
        let snap = flow.snapshot(1000.9, "pair_");
        assert!((snap["pair_tw_1s"] - 3.0).abs() < 1e-9);
        assert!((snap["pair_tps_1s"] - 2.0).abs() < 1e-9);
        assert!((snap["pair_nps_1s"] - 30.0).abs() < 1e-9);
        assert!((snap["pair_ti_1s"] - (1.0 / 3.0)).abs() < 1e-9);
        assert!((snap["pair_lsr_1s"] - 2.0).abs() < 1e-9);
    }

    #[test]
    fn lsr_sentinels() {
        let mut flow = SecondBucketFlow::new(600);
        // Buys only → 999 sentinel.
        flow.add(2000.0, 1.0, 5.0, false);
        let snap = flow.snapshot(2000.0, "");
        assert_eq!(snap["lsr_1s"], 999.0);
        // Empty window → 1.
        let snap = flow.snapshot(2700.0, "");
        assert_eq!(snap["lsr_1s"], 1.0);
    }

    #[test]
    fn eviction_bounds_memory() {
        let mut flow = SecondBucketFlow::new(10);
        for sec in 0..100u64 {
            flow.add(1000.0 + sec as f64, 1.0, 1.0, false);
        }
        let _ = flow.snapshot(1099.0, "");
        assert!(flow.buckets.len() <= 12);
    }

    #[test]
    fn out_of_order_trade_folds_into_existing_bucket() {
        let mut flow = SecondBucketFlow::new(600);
        flow.add(3000.0, 1.0, 1.0, false);
        flow.add(3001.0, 1.0, 1.0, false);
        // A straggler for sec 3000 lands in the earlier bucket.
        flow.add(3000.5, 1.0, 1.0, false);
        let snap = flow.snapshot(3001.0, "");
        assert!((snap["tw_5s"] - 3.0).abs() < 1e-9);
    }

    #[test]
    fn ignores_nonpositive_inputs() {
        let mut flow = SecondBucketFlow::new(600);
        flow.add(1000.0, 0.0, 5.0, false);
        flow.add(1000.0, 1.0, 0.0, true);
        let snap = flow.snapshot(1000.0, "");
        assert_eq!(snap["tw_1s"], 0.0);
    }
}
