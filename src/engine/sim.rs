use anyhow::Result;

use super::types::{ExitReason, RiskParams, Side, SignalSet, TradeResult};
use crate::data::CoreFrame;
use crate::error::{EngineError, Phase};

/// Resolve exits for every signal of one symbol in a single sweep over the
/// OHLC arrays.
///
/// The sweep keeps an active set of open trades and touches each bar once:
/// trades enter when the bar index reaches their entry, and every open trade
/// is checked against its own absolute stop and target. Total work is
/// O(bars + total open-trade bars), never O(trades × bars).
///
/// Exit precedence within a bar, in order:
/// 1. stop — including the same-bar stop∧target tie, which always goes to
///    the stop (pessimistic intrabar path, deterministic);
/// 2. target;
/// 3. expiry (`max_hold_bars` reached), at that bar's close.
///
/// A trade entered at bar `i` is eligible for exit at bar `i` itself.
/// Anything still open after the last bar exits at the final close with
/// reason `END_OF_DATA`.
pub fn simulate(
    frame: &CoreFrame,
    signals: &SignalSet,
    risk: &RiskParams,
) -> Result<Vec<TradeResult>> {
    let n = frame.len();
    let m = signals.len();
    if m == 0 {
        return Ok(Vec::new());
    }
    if let Some(&last_entry) = signals.entry_idx.last() {
        if last_entry >= n {
            return Err(EngineError::runtime(
                &frame.symbol,
                Phase::Simulate,
                format!("signal entry index {last_entry} beyond frame of {n} bars"),
            )
            .into());
        }
    }

    // Parallel exit arrays, filled exactly once per signal.
    let mut exit_idx = vec![0usize; m];
    let mut exit_price = vec![0.0f64; m];
    let mut exit_reason = vec![ExitReason::EndOfData; m];

    let mut active: Vec<usize> = Vec::new();
    let mut next = 0usize; // first signal not yet entered
    let mut i = signals.entry_idx[0];

    while i < n {
        while next < m && signals.entry_idx[next] == i {
            active.push(next);
            next += 1;
        }

        let (high, low, close) = (frame.high[i], frame.low[i], frame.close[i]);
        active.retain(|&k| {
            let side = signals.side[k];
            let stop = signals.stop_price[k];
            let target = signals.target_price[k];

            let (hit_stop, hit_target) = if side > 0 {
                (low <= stop, high >= target)
            } else {
                (high >= stop, low <= target)
            };

            if hit_stop {
                exit_idx[k] = i;
                exit_price[k] = stop;
                exit_reason[k] = ExitReason::Sl;
                return false;
            }
            if hit_target {
                exit_idx[k] = i;
                exit_price[k] = target;
                exit_reason[k] = ExitReason::Tp;
                return false;
            }
            if let Some(max_hold) = risk.max_hold_bars {
                if i - signals.entry_idx[k] + 1 >= max_hold {
                    exit_idx[k] = i;
                    exit_price[k] = close;
                    exit_reason[k] = ExitReason::Expiry;
                    return false;
                }
            }
            true
        });

        if active.is_empty() {
            if next >= m {
                break;
            }
            // Jump straight to the next entry; the bars between hold no work.
            i = signals.entry_idx[next];
        } else {
            i += 1;
        }
    }

    // Whatever survived the last bar leaves at the final close.
    let last = n - 1;
    for &k in &active {
        exit_idx[k] = last;
        exit_price[k] = frame.close[last];
        exit_reason[k] = ExitReason::EndOfData;
    }

    let mut results = Vec::with_capacity(m);
    for k in 0..m {
        let side = if signals.side[k] > 0 {
            Side::Long
        } else {
            Side::Short
        };
        results.push(build_result(
            signals.entry_idx[k],
            exit_idx[k],
            side,
            signals.entry_price[k],
            signals.stop_price[k],
            signals.target_price[k],
            exit_price[k],
            exit_reason[k],
            signals.size[k],
            risk,
        ));
    }
    Ok(results)
}

/// Assemble one trade record; shared with the reference simulator so both
/// paths price PnL identically.
#[allow(clippy::too_many_arguments)]
pub(crate) fn build_result(
    entry_idx: usize,
    exit_idx: usize,
    side: Side,
    entry_price: f64,
    stop_price: f64,
    target_price: f64,
    exit_price: f64,
    exit_reason: ExitReason,
    size: f64,
    risk: &RiskParams,
) -> TradeResult {
    let risk_distance = (entry_price - stop_price).abs();
    let signed_move = (exit_price - entry_price) * side.multiplier();
    let fee = risk.fee_pips * risk.pip_size;
    let pnl_r = (signed_move - fee) / risk_distance;

    TradeResult {
        entry_idx,
        exit_idx,
        side,
        entry_price,
        stop_price,
        target_price,
        exit_price,
        exit_reason,
        pnl_r,
        duration_bars: exit_idx - entry_idx + 1,
        size,
        trailing_used: false,
    }
}
