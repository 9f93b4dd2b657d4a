// =============================================================================
// Rolling windows — trade imbalance, realized vol, timestamped price rings
// =============================================================================

use std::collections::VecDeque;

/// Rolling sum of buy/sell aggressive quantity over a time window.
#[derive(Debug, Clone)]
pub struct RollingQty {
    window_sec: f64,
    buys: VecDeque<(f64, f64)>,
    sells: VecDeque<(f64, f64)>,
    buy_sum: f64,
    sell_sum: f64,
}

impl RollingQty {
    pub fn new(window_sec: f64) -> Self {
        Self {
            window_sec,
            buys: VecDeque::new(),
            sells: VecDeque::new(),
            buy_sum: 0.0,
            sell_sum: 0.0,
        }
    }

    pub fn add(&mut self, ts: f64, qty: f64, is_sell: bool) {
        if is_sell {
            self.sells.push_back((ts, qty));
            self.sell_sum += qty;
        } else {
            self.buys.push_back((ts, qty));
            self.buy_sum += qty;
        }
        self.evict(ts);
    }

    fn evict(&mut self, now: f64) {
        let cutoff = now - self.window_sec;
        while let Some(&(ts, qty)) = self.buys.front() {
            if ts >= cutoff {
                break;
            }
            self.buy_sum -= qty;
            self.buys.pop_front();
        }
        while let Some(&(ts, qty)) = self.sells.front() {
            if ts >= cutoff {
                break;
            }
            self.sell_sum -= qty;
            self.sells.pop_front();
        }
        // Clamp floating point drift.
        if self.buy_sum < 0.0 {
            self.buy_sum = 0.0;
        }
        if self.sell_sum < 0.0 {
            self.sell_sum = 0.0;
        }
    }

    /// Trade imbalance: (buy - sell) / (buy + sell), range [-1, 1].
    pub fn ti(&self) -> f64 {
        let total = self.buy_sum + self.sell_sum;
        if total < 1e-12 {
            return 0.0;
        }
        (self.buy_sum - self.sell_sum) / total
    }

    /// Fraction of volume that is buy-aggression, range [0, 1].
    pub fn buy_ratio(&self) -> f64 {
        let total = self.buy_sum + self.sell_sum;
        if total < 1e-12 {
            return 0.5;
        }
        self.buy_sum / total
    }
}

// ---------------------------------------------------------------------------
// Realized volatility
// ---------------------------------------------------------------------------

/// Realized volatility from log returns over a rolling window.
#[derive(Debug, Clone)]
pub struct RollingRv {
    window_sec: f64,
    prices: VecDeque<(f64, f64)>,
}

impl RollingRv {
    pub fn new(window_sec: f64) -> Self {
        Self {
            window_sec,
            prices: VecDeque::new(),
        }
    }

    pub fn add(&mut self, ts: f64, price: f64) {
        self.prices.push_back((ts, price));
        let cutoff = ts - self.window_sec;
        while let Some(&(t, _)) = self.prices.front() {
            if t >= cutoff {
                break;
            }
            self.prices.pop_front();
        }
    }

    /// Standard deviation of log returns in the window (0 while warming).
    pub fn rv(&self) -> f64 {
        if self.prices.len() < 3 {
            return 0.0;
        }
        let mut log_rets: Vec<f64> = Vec::with_capacity(self.prices.len());
        let mut prev = 0.0;
        for &(_, px) in &self.prices {
            if prev > 0.0 && px > 0.0 {
                log_rets.push((px / prev).ln());
            }
            prev = px;
        }
        if log_rets.len() < 2 {
            return 0.0;
        }
        let n = log_rets.len() as f64;
        let mean = log_rets.iter().sum::<f64>() / n;
        let var = log_rets.iter().map(|r| (r - mean) * (r - mean)).sum::<f64>() / n;
        var.max(0.0).sqrt()
    }
}

// ---------------------------------------------------------------------------
// Timestamped price ring
// ---------------------------------------------------------------------------

/// Bounded ring of (ts, price) pairs; serves window returns and highs.
#[derive(Debug, Clone)]
pub struct PriceRing {
    max_len: usize,
    points: VecDeque<(f64, f64)>,
}

impl PriceRing {
    pub fn new(max_len: usize) -> Self {
        Self {
            max_len,
            points: VecDeque::with_capacity(max_len),
        }
    }

    pub fn push(&mut self, ts: f64, price: f64) {
        self.points.push_back((ts, price));
        while self.points.len() > self.max_len {
            self.points.pop_front();
        }
    }

    pub fn evict_before(&mut self, cutoff: f64) {
        while let Some(&(t, _)) = self.points.front() {
            if t >= cutoff {
                break;
            }
            self.points.pop_front();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Return in bps from the oldest point at or after `cutoff` to `mark`.
    pub fn ret_bps_since(&self, cutoff: f64, mark: f64) -> f64 {
        if mark <= 0.0 {
            return 0.0;
        }
        for &(ts, px) in &self.points {
            if ts >= cutoff {
                if px > 0.0 {
                    return (mark - px) / px * 10_000.0;
                }
                break;
            }
        }
        0.0
    }

    /// Highest price in the ring along with its latest timestamp.
    pub fn high_with_ts(&self) -> Option<(f64, f64)> {
        let mut high = 0.0;
        let mut high_ts = 0.0;
        for &(ts, px) in &self.points {
            if px > high {
                high = px;
                high_ts = ts;
            }
        }
        if high > 0.0 {
            Some((high, high_ts))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rolling_qty_evicts_by_timestamp() {
        let mut w = RollingQty::new(2.0);
        w.add(0.0, 10.0, false);
        w.add(0.5, 5.0, true);
        assert!((w.ti() - (10.0 - 5.0) / 15.0).abs() < 1e-12);
        // 3.0s later the first two trades are out of window.
        w.add(3.0, 2.0, true);
        assert!((w.ti() - (-1.0)).abs() < 1e-12);
    }

    #[test]
    fn buy_ratio_neutral_when_empty() {
        let w = RollingQty::new(2.0);
        assert!((w.buy_ratio() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn rv_zero_until_three_points() {
        let mut rv = RollingRv::new(1.0);
        rv.add(0.0, 100.0);
        rv.add(0.1, 101.0);
        assert_eq!(rv.rv(), 0.0);
        rv.add(0.2, 100.5);
        assert!(rv.rv() > 0.0);
    }

    #[test]
    fn rv_flat_series_is_zero() {
        let mut rv = RollingRv::new(1.0);
        for i in 0..10 {
            rv.add(i as f64 * 0.05, 100.0);
        }
        assert!(rv.rv() < 1e-12);
    }

    #[test]
    fn price_ring_return_and_high() {
        let mut ring = PriceRing::new(10);
        ring.push(0.0, 100.0);
        ring.push(1.0, 102.0);
        ring.push(2.0, 101.0);
        // Return from the first point >= cutoff 0.0 to mark 101.
        let ret = ring.ret_bps_since(0.0, 101.0);
        assert!((ret - 100.0).abs() < 1e-9);
        let (high, high_ts) = ring.high_with_ts().unwrap();
        assert_eq!(high, 102.0);
        assert_eq!(high_ts, 1.0);
    }
}
