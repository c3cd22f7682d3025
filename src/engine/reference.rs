use anyhow::Result;

use super::sim::build_result;
use super::types::{ExitReason, RiskParams, Side, SignalSet, TradeResult};
use crate::data::CoreFrame;

/// Per-trade reference simulator: the oracle the vectorized path is checked
/// against. Deliberately naive — one trade at a time, scanning forward bar
/// by bar with the same exit rules and the same tie-break. O(trades × bars)
/// and proud of it; never used for production results.
pub fn simulate_reference(
    frame: &CoreFrame,
    signals: &SignalSet,
    risk: &RiskParams,
) -> Result<Vec<TradeResult>> {
    let n = frame.len();
    let mut results = Vec::with_capacity(signals.len());

    for k in 0..signals.len() {
        let entry_idx = signals.entry_idx[k];
        let side = if signals.side[k] > 0 {
            Side::Long
        } else {
            Side::Short
        };
        let stop = signals.stop_price[k];
        let target = signals.target_price[k];

        let mut resolved: Option<(usize, f64, ExitReason)> = None;
        for i in entry_idx..n {
            let (hit_stop, hit_target) = if signals.side[k] > 0 {
                (frame.low[i] <= stop, frame.high[i] >= target)
            } else {
                (frame.high[i] >= stop, frame.low[i] <= target)
            };
            if hit_stop {
                resolved = Some((i, stop, ExitReason::Sl));
                break;
            }
            if hit_target {
                resolved = Some((i, target, ExitReason::Tp));
                break;
            }
            if let Some(max_hold) = risk.max_hold_bars {
                if i - entry_idx + 1 >= max_hold {
                    resolved = Some((i, frame.close[i], ExitReason::Expiry));
                    break;
                }
            }
        }
        let (exit_idx, exit_price, exit_reason) =
            resolved.unwrap_or((n - 1, frame.close[n - 1], ExitReason::EndOfData));

        results.push(build_result(
            entry_idx,
            exit_idx,
            side,
            signals.entry_price[k],
            stop,
            target,
            exit_price,
            exit_reason,
            signals.size[k],
            risk,
        ));
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_from_ohlc(ohlc: &[(f64, f64, f64, f64)]) -> CoreFrame {
        let n = ohlc.len();
        CoreFrame {
            symbol: "EURUSD".into(),
            cadence_seconds: 3600,
            timestamp: (0..n as i64).map(|i| i * 3600).collect(),
            open: ohlc.iter().map(|b| b.0).collect(),
            high: ohlc.iter().map(|b| b.1).collect(),
            low: ohlc.iter().map(|b| b.2).collect(),
            close: ohlc.iter().map(|b| b.3).collect(),
            volume: vec![1.0; n],
            is_gap: vec![false; n],
        }
    }

    #[test]
    fn reference_applies_stop_wins_tie() {
        let frame = frame_from_ohlc(&[
            (1.1000, 1.1005, 1.0995, 1.1000),
            (1.1000, 1.1110, 1.0940, 1.1050),
        ]);
        let mut signals = SignalSet::default();
        signals.push(0, Side::Long, 1.1000, 1.0950, 1.1100, 1.0);
        let trades = simulate_reference(&frame, &signals, &RiskParams::default()).unwrap();
        assert_eq!(trades[0].exit_reason, ExitReason::Sl);
        assert_eq!(trades[0].exit_price, 1.0950);
    }

    #[test]
    fn reference_end_of_data() {
        let frame = frame_from_ohlc(&[(1.1, 1.101, 1.099, 1.1), (1.1, 1.101, 1.099, 1.1005)]);
        let mut signals = SignalSet::default();
        signals.push(0, Side::Long, 1.1, 1.0, 1.3, 1.0);
        let trades = simulate_reference(&frame, &signals, &RiskParams::default()).unwrap();
        assert_eq!(trades[0].exit_reason, ExitReason::EndOfData);
        assert_eq!(trades[0].exit_idx, 1);
    }
}
