//! Stochastic RSI.
//!
//! The raw oscillator normalizes the RSI over a rolling `period` window:
//! `(rsi[i] - min) / (max - min)`, in `[0, 1]`, defined as 0 when the window
//! is flat. `%K` is the `k_smooth`-bar simple mean of the raw series and the
//! returned value is its `d_smooth`-bar simple mean (`%D`); pass
//! `d_smooth = 1` to get `%K` itself.

use super::rsi::rsi;

/// Full-length Stoch-RSI series aligned to `closes`.
pub fn stoch_rsi(closes: &[f64], period: usize, k_smooth: usize, d_smooth: usize) -> Vec<f64> {
    let n = closes.len();
    if period == 0 || k_smooth == 0 || d_smooth == 0 {
        return vec![f64::NAN; n];
    }

    let rsi_series = rsi(closes, period);
    let raw = rolling_normalize(&rsi_series, period);
    let k = rolling_mean(&raw, k_smooth);
    rolling_mean(&k, d_smooth)
}

/// `(x - rolling_min) / (rolling_max - rolling_min)` over windows of
/// `window` defined values; NaN while the window still overlaps the warmup.
fn rolling_normalize(values: &[f64], window: usize) -> Vec<f64> {
    let n = values.len();
    let mut out = vec![f64::NAN; n];
    for i in 0..n {
        if i + 1 < window {
            continue;
        }
        let slice = &values[i + 1 - window..=i];
        if slice.iter().any(|v| v.is_nan()) {
            continue;
        }
        let min = slice.iter().copied().fold(f64::INFINITY, f64::min);
        let max = slice.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        out[i] = if max > min {
            (values[i] - min) / (max - min)
        } else {
            0.0
        };
    }
    out
}

fn rolling_mean(values: &[f64], window: usize) -> Vec<f64> {
    let n = values.len();
    let mut out = vec![f64::NAN; n];
    if window == 1 {
        out.copy_from_slice(values);
        return out;
    }
    for i in 0..n {
        if i + 1 < window {
            continue;
        }
        let slice = &values[i + 1 - window..=i];
        if slice.iter().any(|v| v.is_nan()) {
            continue;
        }
        out[i] = slice.iter().sum::<f64>() / window as f64;
    }
    out
}
