pub mod allocation;
pub mod correlation;
pub mod snapshot;

use std::collections::{BTreeMap, VecDeque};

use anyhow::Result;
use chrono::Utc;
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use statrs::statistics::Statistics;
use tracing::{info, warn};

use crate::data::CoreFrame;
use crate::engine::run::{run_symbol, run_symbol_pipeline, CancelToken, SymbolRunOutput};
use crate::engine::types::{RunRequest, RuntimeFailureEvent, TradeResult, ts_to_datetime};
use crate::error::{classify, EngineError, Phase};
use crate::strategies::Strategy;
use allocation::{allocate, AllocationRequest};
use correlation::{CorrelationTracker, WINDOW_CAPACITY};
use snapshot::{PortfolioSnapshotRecord, PositionSnapshot, SnapshotWriter};

/// Smallest volatility fed to the allocation engine; windows too young or
/// too flat to estimate from are floored here instead of failing the round.
const VOL_FLOOR: f64 = 1e-8;

/// Independent multi-symbol mode: every symbol runs the full pipeline in a
/// bounded worker pool, one symbol end-to-end per worker, no shared mutable
/// state. An isolatable failure skips that symbol and is reported as a
/// [`RuntimeFailureEvent`]; everything else fails the run.
pub(crate) fn run_independent(
    req: &RunRequest,
    strategy: &dyn Strategy,
    cancel: &CancelToken,
) -> Result<(Vec<SymbolRunOutput>, Vec<RuntimeFailureEvent>)> {
    let bar = ProgressBar::new(req.datasets.len() as u64).with_style(
        ProgressStyle::with_template("{prefix} [{bar:30}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    bar.set_prefix("symbols");

    let results: Vec<Result<SymbolRunOutput, EngineError>> = req
        .datasets
        .par_iter()
        .map(|spec| {
            let result = run_symbol(req, spec, strategy, cancel)
                .map_err(|e| classify(&e, &spec.symbol, Phase::Ingest));
            bar.inc(1);
            result
        })
        .collect();
    bar.finish_and_clear();

    let mut outputs = Vec::new();
    let mut failures = Vec::new();
    for result in results {
        match result {
            Ok(output) => outputs.push(output),
            Err(e) if e.is_isolatable() => {
                warn!(symbol = ?e.symbol, phase = %e.phase, "symbol skipped: {}", e.message);
                failures.push(RuntimeFailureEvent {
                    symbol: e.symbol.clone().unwrap_or_default(),
                    reason: e.message.clone(),
                    phase: e.phase,
                    timestamp: e.at,
                });
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok((outputs, failures))
}

pub(crate) struct PortfolioOutcome {
    pub outputs: Vec<SymbolRunOutput>,
    pub failures: Vec<RuntimeFailureEvent>,
    pub snapshot_path: Option<String>,
}

/// One scheduled trade on the shared time grid. Exit timing comes from the
/// batch simulator; sizing is decided at entry time by the allocation
/// engine, so risk amounts are portfolio state, not signal state.
#[derive(Debug, Clone)]
struct PlannedTrade {
    entry_ts: i64,
    exit_ts: i64,
    pnl_r: f64,
    entry_price: f64,
    side: i8,
    risk_dist: f64,
}

#[derive(Debug, Clone)]
struct OpenPosition {
    symbol_id: usize,
    entry_price: f64,
    side: i8,
    risk_dist: f64,
    risk_amount: f64,
    size: f64,
    exit_ts: i64,
    pnl_r: f64,
}

/// Portfolio mode: shared capital, synchronized bar loop over the
/// intersection grid, rolling pairwise correlations, allocation-driven
/// sizing, periodic snapshots, per-symbol failure isolation.
pub(crate) fn run_portfolio(
    req: &RunRequest,
    strategy: &dyn Strategy,
    cancel: &CancelToken,
) -> Result<PortfolioOutcome> {
    // Deterministic reductions: symbols processed in sorted order everywhere.
    let mut specs = req.datasets.clone();
    specs.sort_by(|a, b| a.symbol.cmp(&b.symbol));

    let mut outputs: Vec<SymbolRunOutput> = Vec::new();
    let mut failures: Vec<RuntimeFailureEvent> = Vec::new();
    let mut frames: Vec<Option<CoreFrame>> = Vec::new();
    let mut planned: Vec<Vec<PlannedTrade>> = Vec::new();
    let mut symbols: Vec<String> = Vec::new();

    for spec in &specs {
        cancel.checkpoint(Phase::Ingest)?;
        match run_symbol_pipeline(req, spec, strategy, cancel) {
            Ok((output, frame)) => {
                planned.push(plan_trades(&frame, &output.trades));
                symbols.push(spec.symbol.clone());
                frames.push(Some(frame));
                outputs.push(output);
            }
            Err(e) => {
                let e = classify(&e, &spec.symbol, Phase::Ingest);
                if e.is_isolatable() {
                    warn!(symbol = %spec.symbol, "portfolio symbol isolated at start: {}", e.message);
                    failures.push(RuntimeFailureEvent {
                        symbol: spec.symbol.clone(),
                        reason: e.message.clone(),
                        phase: e.phase,
                        timestamp: e.at,
                    });
                } else {
                    return Err(e.into());
                }
            }
        }
    }

    if symbols.is_empty() {
        return Ok(PortfolioOutcome {
            outputs,
            failures,
            snapshot_path: None,
        });
    }

    cancel.checkpoint(Phase::Allocate)?;

    let (grid, aligned) = intersect_grids(&frames);
    let n_symbols = symbols.len();
    let mut tracker = CorrelationTracker::new(symbols.clone());
    let mut vol_windows: Vec<VecDeque<f64>> = vec![VecDeque::new(); n_symbols];
    let mut trade_ptr: Vec<usize> = vec![0; n_symbols];
    let mut open: Vec<OpenPosition> = Vec::new();
    let mut realized_pnl = 0.0f64;
    let mut allocations: BTreeMap<String, f64> = BTreeMap::new();
    let mut last_div_ratio = 0.0f64;

    let capital = req.risk.account_equity;
    let mut writer = match &req.flags.output_dir {
        Some(dir) if !req.flags.dry_run => Some(SnapshotWriter::create(dir, Utc::now())?),
        _ => None,
    };

    for g in 0..grid.len() {
        let ts = grid[g];

        // Returns and integrity guard, symbols in sorted (id) order.
        let mut returns: Vec<Option<f64>> = vec![None; n_symbols];
        let mut to_isolate: Vec<usize> = Vec::new();
        for id in 0..n_symbols {
            if !tracker.is_enabled(id) {
                continue;
            }
            let frame = frames[id].as_ref().unwrap();
            let bar = aligned[id][g];
            if !frame.close[bar].is_finite() {
                to_isolate.push(id);
                continue;
            }
            if g > 0 {
                let prev = frame.close[aligned[id][g - 1]];
                if prev > 0.0 {
                    returns[id] = Some((frame.close[bar] - prev) / prev);
                }
            }
        }
        for &id in &to_isolate {
            realized_pnl += isolate_symbol(
                id,
                &symbols,
                &mut tracker,
                &mut open,
                frames[id].as_ref().unwrap(),
                aligned[id][g],
                &mut failures,
            );
        }

        tracker.record_returns(&returns);
        for id in 0..n_symbols {
            if let Some(r) = returns[id] {
                if vol_windows[id].len() == WINDOW_CAPACITY {
                    vol_windows[id].pop_front();
                }
                vol_windows[id].push_back(r);
            }
        }

        // Close positions whose simulated exit has been reached.
        open.retain(|p| {
            if p.exit_ts <= ts {
                realized_pnl += p.pnl_r * p.risk_amount;
                false
            } else {
                true
            }
        });

        // Entries scheduled on this grid bar.
        let entries_pending = (0..n_symbols).any(|id| {
            tracker.is_enabled(id)
                && planned[id]
                    .get(trade_ptr[id])
                    .is_some_and(|t| t.entry_ts == ts)
        });

        // Allocation cadence: at every signal and on the periodic interval.
        if entries_pending || g % req.flags.snapshot_interval == 0 {
            if let Some(response) = reallocate(req, &symbols, &tracker, &vol_windows, capital) {
                allocations = response.allocations;
                last_div_ratio = response.diversification_ratio;
            }
        }

        for id in 0..n_symbols {
            if !tracker.is_enabled(id) {
                continue;
            }
            while let Some(t) = planned[id].get(trade_ptr[id]) {
                // Entries that fell outside the shared grid (range edges,
                // holes in another symbol) are skipped, not deferred.
                if t.entry_ts < ts {
                    trade_ptr[id] += 1;
                    continue;
                }
                if t.entry_ts != ts {
                    break;
                }
                trade_ptr[id] += 1;
                let share = allocations
                    .get(&symbols[id])
                    .copied()
                    .unwrap_or(capital / n_symbols as f64);
                let target_risk = share * req.risk.risk_per_trade;
                let committed: f64 = open.iter().map(|p| p.risk_amount).sum();
                let headroom = req.flags.max_exposure * capital - committed;
                let risk_budget = target_risk.min(headroom);
                let size = sized_units(risk_budget, t.risk_dist, &req.risk);
                if size <= 0.0 {
                    info!(
                        symbol = %symbols[id],
                        ts,
                        "portfolio entry rejected: exposure cap or lot rounding left no size"
                    );
                    continue;
                }
                let risk_amount = size * t.risk_dist * req.risk.pip_value;
                open.push(OpenPosition {
                    symbol_id: id,
                    entry_price: t.entry_price,
                    side: t.side,
                    risk_dist: t.risk_dist,
                    risk_amount,
                    size,
                    exit_ts: t.exit_ts,
                    pnl_r: t.pnl_r,
                });
            }
        }

        // Periodic snapshot emission.
        if g % req.flags.snapshot_interval == 0 {
            if let Some(w) = writer.as_mut() {
                let record = build_snapshot(
                    ts,
                    g,
                    &symbols,
                    &frames,
                    &aligned,
                    &open,
                    realized_pnl,
                    capital,
                    last_div_ratio,
                    tracker.max_window_len(),
                );
                w.append(&record)?;
            }
        }
    }

    // Grid exhausted: remaining positions resolve at their simulated exits.
    for p in &open {
        realized_pnl += p.pnl_r * p.risk_amount;
    }
    open.clear();

    cancel.checkpoint(Phase::Snapshot)?;
    let snapshot_path = match writer {
        Some(w) => {
            let (path, records) = w.finish()?;
            info!(records, path = %path.display(), "portfolio snapshots written");
            Some(path.display().to_string())
        }
        None => None,
    };

    info!(
        symbols = n_symbols,
        grid_bars = grid.len(),
        realized_pnl,
        "portfolio run complete"
    );

    Ok(PortfolioOutcome {
        outputs,
        failures,
        snapshot_path,
    })
}

/// Convert simulated trades into grid-schedulable entries.
fn plan_trades(frame: &CoreFrame, trades: &[TradeResult]) -> Vec<PlannedTrade> {
    trades
        .iter()
        .map(|t| PlannedTrade {
            entry_ts: frame.timestamp[t.entry_idx],
            exit_ts: frame.timestamp[t.exit_idx],
            pnl_r: t.pnl_r,
            entry_price: t.entry_price,
            side: t.side.signum(),
            risk_dist: (t.entry_price - t.stop_price).abs(),
        })
        .collect()
}

/// Size a position from a risk budget, honoring lot step and position cap.
fn sized_units(risk_budget: f64, risk_dist: f64, risk: &crate::engine::types::RiskParams) -> f64 {
    if risk_budget <= 0.0 || risk_dist <= 0.0 {
        return 0.0;
    }
    let raw = risk_budget / (risk_dist * risk.pip_value);
    ((raw / risk.lot_step).floor() * risk.lot_step).min(risk.max_position)
}

/// Run one allocation round; `None` keeps the previous allocations (e.g. a
/// window too young to produce volatilities).
fn reallocate(
    req: &RunRequest,
    symbols: &[String],
    tracker: &CorrelationTracker,
    vol_windows: &[VecDeque<f64>],
    capital: f64,
) -> Option<allocation::AllocationResponse> {
    let enabled: Vec<String> = symbols
        .iter()
        .enumerate()
        .filter(|(id, _)| tracker.is_enabled(*id))
        .map(|(_, s)| s.clone())
        .collect();
    if enabled.is_empty() {
        return None;
    }

    let mut volatility = BTreeMap::new();
    for (id, symbol) in symbols.iter().enumerate() {
        if !tracker.is_enabled(id) {
            continue;
        }
        let window: Vec<f64> = vol_windows[id].iter().copied().collect();
        let vol = if window.len() >= 2 {
            window.as_slice().std_dev().max(VOL_FLOOR)
        } else {
            VOL_FLOOR
        };
        volatility.insert(symbol.clone(), vol);
    }

    // Pairs under the configured threshold are treated as uncorrelated.
    let correlations: BTreeMap<String, f64> = tracker
        .correlation_map()
        .into_iter()
        .filter(|(_, c)| c.abs() >= req.flags.correlation_threshold)
        .collect();

    match allocate(&AllocationRequest {
        symbols: enabled,
        volatility,
        correlations,
        base_weights: None,
        capital,
        penalty_coef: req.flags.correlation_penalty_coef,
        rounding_dp: req.flags.allocation_rounding_dp,
    }) {
        Ok(response) => Some(response),
        Err(e) => {
            warn!("allocation round failed, keeping previous weights: {e:#}");
            None
        }
    }
}

/// Hard-failure isolation: flag the symbol off, purge its correlations, and
/// close its open positions at the current bar's open. Returns the realized
/// PnL delta from the forced closes.
fn isolate_symbol(
    id: usize,
    symbols: &[String],
    tracker: &mut CorrelationTracker,
    open: &mut Vec<OpenPosition>,
    frame: &CoreFrame,
    bar: usize,
    failures: &mut Vec<RuntimeFailureEvent>,
) -> f64 {
    tracker.isolate(id);
    let close_price = frame.open[bar];
    let mut realized = 0.0;
    open.retain(|p| {
        if p.symbol_id != id {
            return true;
        }
        let r = (close_price - p.entry_price) * f64::from(p.side) / p.risk_dist;
        realized += r * p.risk_amount;
        false
    });
    warn!(symbol = %symbols[id], "symbol isolated mid-run; positions closed at open");
    failures.push(RuntimeFailureEvent {
        symbol: symbols[id].clone(),
        reason: "non-finite close encountered mid-run".to_string(),
        phase: Phase::Allocate,
        timestamp: ts_to_datetime(frame.timestamp[bar]),
    });
    realized
}

#[allow(clippy::too_many_arguments)]
fn build_snapshot(
    ts: i64,
    bar_index: usize,
    symbols: &[String],
    frames: &[Option<CoreFrame>],
    aligned: &[Vec<usize>],
    open: &[OpenPosition],
    realized_pnl: f64,
    capital: f64,
    diversification_ratio: f64,
    correlation_window_len: usize,
) -> PortfolioSnapshotRecord {
    let mut positions = BTreeMap::new();
    let mut unrealized = 0.0f64;
    for p in open {
        let frame = frames[p.symbol_id].as_ref().unwrap();
        let current = frame.close[aligned[p.symbol_id][bar_index]];
        let r_now = (current - p.entry_price) * f64::from(p.side) / p.risk_dist;
        unrealized += r_now * p.risk_amount;
        positions.insert(
            symbols[p.symbol_id].clone(),
            PositionSnapshot {
                size: p.size,
                entry_price: p.entry_price,
                side: p.side,
                unrealized_r: r_now,
            },
        );
    }
    let committed: f64 = open.iter().map(|p| p.risk_amount).sum();

    PortfolioSnapshotRecord {
        timestamp: ts_to_datetime(ts),
        bar_index,
        positions,
        unrealized_pnl: unrealized,
        aggregate_pnl: realized_pnl + unrealized,
        exposure_fraction: if capital > 0.0 { committed / capital } else { 0.0 },
        diversification_ratio,
        correlation_window_len,
    }
}

/// Intersection of all frames' timestamps, plus per-symbol mapping from grid
/// position to that symbol's bar index.
fn intersect_grids(frames: &[Option<CoreFrame>]) -> (Vec<i64>, Vec<Vec<usize>>) {
    let mut grid: Option<Vec<i64>> = None;
    for frame in frames.iter().flatten() {
        grid = Some(match grid {
            None => frame.timestamp.clone(),
            Some(current) => intersect_sorted(&current, &frame.timestamp),
        });
    }
    let grid = grid.unwrap_or_default();

    let aligned = frames
        .iter()
        .map(|frame| match frame {
            Some(f) => map_grid_to_bars(&grid, &f.timestamp),
            None => Vec::new(),
        })
        .collect();
    (grid, aligned)
}

fn intersect_sorted(a: &[i64], b: &[i64]) -> Vec<i64> {
    let mut out = Vec::with_capacity(a.len().min(b.len()));
    let (mut i, mut j) = (0usize, 0usize);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                out.push(a[i]);
                i += 1;
                j += 1;
            }
        }
    }
    out
}

/// For each grid timestamp, the bar index in `timestamps` holding it. The
/// grid is a subset of every member's timestamps by construction.
fn map_grid_to_bars(grid: &[i64], timestamps: &[i64]) -> Vec<usize> {
    let mut out = Vec::with_capacity(grid.len());
    let mut j = 0usize;
    for &ts in grid {
        while timestamps[j] != ts {
            j += 1;
        }
        out.push(j);
        j += 1;
    }
    out
}
