//! Relative strength index, Wilder smoothing.
//!
//! Average gain and loss seed with the simple mean of the first `period`
//! deltas, then follow Wilder's recurrence. The first defined value sits at
//! index `period`; earlier indices are the warmup prefix (NaN).
//!
//! Zero-loss convention: whenever the smoothed average loss is zero the RSI
//! is defined as 100, including the fully flat case.

/// Full-length RSI series aligned to `closes`, values in `[0, 100]`.
pub fn rsi(closes: &[f64], period: usize) -> Vec<f64> {
    let n = closes.len();
    let mut out = vec![f64::NAN; n];
    if period == 0 || n < period + 1 {
        return out;
    }

    let period_f = period as f64;
    let mut sum_gain = 0.0;
    let mut sum_loss = 0.0;
    for i in 1..=period {
        let delta = closes[i] - closes[i - 1];
        if delta > 0.0 {
            sum_gain += delta;
        } else {
            sum_loss += -delta;
        }
    }
    let mut avg_gain = sum_gain / period_f;
    let mut avg_loss = sum_loss / period_f;
    out[period] = rsi_value(avg_gain, avg_loss);

    for i in (period + 1)..n {
        let delta = closes[i] - closes[i - 1];
        let gain = if delta > 0.0 { delta } else { 0.0 };
        let loss = if delta < 0.0 { -delta } else { 0.0 };
        avg_gain = (avg_gain * (period_f - 1.0) + gain) / period_f;
        avg_loss = (avg_loss * (period_f - 1.0) + loss) / period_f;
        out[i] = rsi_value(avg_gain, avg_loss);
    }
    out
}

fn rsi_value(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 {
        return 100.0;
    }
    let rs = avg_gain / avg_loss;
    100.0 - 100.0 / (1.0 + rs)
}
