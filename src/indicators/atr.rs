//! Average true range, Wilder smoothing.
//!
//! ```text
//! TR[0] = high[0] - low[0]
//! TR[i] = max(high[i] - low[i], |high[i] - close[i-1]|, |low[i] - close[i-1]|)
//! ```
//!
//! The smoothed series seeds at index `period` with the simple mean of
//! `TR[1 ..= period]`, then follows Wilder's recurrence
//! `atr[i] = (atr[i-1] * (period - 1) + TR[i]) / period`. Indices
//! `0 .. period` are the warmup prefix (NaN).

/// Full-length ATR series aligned to the input arrays.
pub fn atr(high: &[f64], low: &[f64], close: &[f64], period: usize) -> Vec<f64> {
    let n = close.len();
    let mut out = vec![f64::NAN; n];
    if period == 0 || n < period + 1 {
        return out;
    }

    let tr_at = |i: usize| -> f64 {
        let hl = high[i] - low[i];
        if i == 0 {
            return hl;
        }
        let hc = (high[i] - close[i - 1]).abs();
        let lc = (low[i] - close[i - 1]).abs();
        hl.max(hc).max(lc)
    };

    let period_f = period as f64;
    let seed: f64 = (1..=period).map(tr_at).sum::<f64>() / period_f;
    out[period] = seed;

    let mut prev = seed;
    for i in (period + 1)..n {
        let value = (prev * (period_f - 1.0) + tr_at(i)) / period_f;
        out[i] = value;
        prev = value;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn constant_range_series(n: usize, spread: f64) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
        let closes: Vec<f64> = (0..n).map(|i| 100.0 + i as f64 * 0.1).collect();
        let highs: Vec<f64> = closes.iter().map(|c| c + spread / 2.0).collect();
        let lows: Vec<f64> = closes.iter().map(|c| c - spread / 2.0).collect();
        (highs, lows, closes)
    }

    #[test]
    fn warmup_prefix_is_nan() {
        let (h, l, c) = constant_range_series(30, 1.0);
        let series = atr(&h, &l, &c, 14);
        for v in &series[..14] {
            assert!(v.is_nan());
        }
        assert!(series[14].is_finite());
    }

    #[test]
    fn constant_range_converges_to_range() {
        let (h, l, c) = constant_range_series(60, 10.0);
        let series = atr(&h, &l, &c, 14);
        let last = series.last().unwrap();
        assert!((last - 10.0).abs() < 0.5, "expected ~10.0, got {last}");
    }

    #[test]
    fn gap_bar_widens_true_range() {
        // Second bar gaps far above the first close; TR must use |high - prev_close|.
        let high = vec![105.0, 120.0, 121.0, 122.0];
        let low = vec![95.0, 118.0, 119.0, 120.0];
        let close = vec![96.0, 119.0, 120.0, 121.0];
        let series = atr(&high, &low, &close, 3);
        // TR[1] = |120 - 96| = 24 dominates the seed mean.
        assert!(series[3] > 8.0, "gap should inflate ATR, got {}", series[3]);
    }

    #[test]
    fn insufficient_rows_all_nan() {
        let (h, l, c) = constant_range_series(10, 1.0);
        let series = atr(&h, &l, &c, 14);
        assert!(series.iter().all(|v| v.is_nan()));
    }

    #[test]
    fn atr_is_positive_once_defined() {
        let closes: Vec<f64> = (0..80).map(|i| 1.1 + (i as f64 * 0.3).sin() * 0.01).collect();
        let highs: Vec<f64> = closes.iter().map(|c| c + 0.002).collect();
        let lows: Vec<f64> = closes.iter().map(|c| c - 0.002).collect();
        let series = atr(&highs, &lows, &closes, 14);
        for v in &series[14..] {
            assert!(*v > 0.0);
        }
    }
}
