use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::info;

use super::fidelity::check_fidelity;
use super::metrics::DirectionalMetrics;
use super::reference::simulate_reference;
use super::scan::scan_direction;
use super::sim::simulate;
use super::types::{
    ConflictEvent, DatasetSpec, Direction, RunMode, RunRequest, Side, SignalSet, TradeResult,
    ts_to_datetime,
};
use crate::bench::{BenchmarkRecord, Hotspot, MemorySampler, PhaseTimer, PhaseTimes};
use crate::data::manifest::{manifest_hash, ManifestEntry};
use crate::data::{ingest, CoreFrame, IngestOptions, IngestionMetrics};
use crate::error::{EngineError, Phase};
use crate::indicators::IndicatorCache;
use crate::report::{ExecutionRecord, RunMetadata, RunReport, SignalRecord, SymbolSummary};
use crate::strategies::{find_strategy, Strategy};

/// Fixed seed installed when `deterministic` is set. No core path draws from
/// it today; it exists so future stochastic extensions inherit reproducible
/// behavior without an interface change.
const DETERMINISTIC_SEED: u64 = 0x5eed_f0e1;

/// Cooperative cancellation token, checked between phases and between
/// symbols. Guaranteed latency: at most one phase.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub(crate) fn checkpoint(&self, phase: Phase) -> Result<()> {
        if self.is_canceled() {
            return Err(EngineError::aborted(phase).into());
        }
        Ok(())
    }
}

/// Everything a completed per-symbol pipeline hands back to the orchestrator.
#[derive(Debug)]
pub(crate) struct SymbolRunOutput {
    pub symbol: String,
    pub frame_rows: usize,
    pub raw_bytes: usize,
    pub peak_bytes: usize,
    pub ingestion: IngestionMetrics,
    pub manifest: ManifestEntry,
    pub trades: Vec<TradeResult>,
    pub conflicts: Vec<ConflictEvent>,
    pub signal_records: Vec<SignalRecord>,
    pub execution_records: Vec<ExecutionRecord>,
    pub metrics: DirectionalMetrics,
    pub phase_times: PhaseTimes,
    pub hotspots: Vec<Hotspot>,
}

/// Select the `portion`-th contiguous chronological slice of length
/// `ceil(n · frac)`. Applied before any indicator is computed, so warmup is
/// paid on the slice, not the full frame.
pub fn slice_fraction(frame: &CoreFrame, frac: f64, portion: usize) -> CoreFrame {
    if frac >= 1.0 {
        return frame.clone();
    }
    let n = frame.len();
    let slice_len = ((n as f64) * frac).ceil() as usize;
    let start = (portion - 1) * slice_len;
    frame.slice(start, slice_len)
}

/// Reject long/short signals landing on the identical bar: both are dropped
/// and one `ConflictEvent` per bar is emitted. Signals at different bars are
/// left alone.
pub fn reject_conflicts(
    frame: &CoreFrame,
    long: &mut SignalSet,
    short: &mut SignalSet,
) -> Vec<ConflictEvent> {
    let mut conflicts = Vec::new();
    let mut drop_long = Vec::new();
    let mut drop_short = Vec::new();

    let (mut i, mut j) = (0usize, 0usize);
    while i < long.len() && j < short.len() {
        match long.entry_idx[i].cmp(&short.entry_idx[j]) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                let bar = long.entry_idx[i];
                conflicts.push(ConflictEvent::rejected_both(
                    frame.timestamp[bar],
                    &frame.symbol,
                ));
                drop_long.push(i);
                drop_short.push(j);
                i += 1;
                j += 1;
            }
        }
    }

    long.remove_positions(&drop_long);
    short.remove_positions(&drop_short);
    conflicts
}

/// Merge two per-direction sets into one, ordered by entry index. Equal
/// indices cannot occur: conflicts are rejected beforehand.
pub fn merge_signal_sets(a: &SignalSet, b: &SignalSet) -> SignalSet {
    let mut merged = SignalSet::default();
    let (mut i, mut j) = (0usize, 0usize);
    let push_from = |set: &SignalSet, k: usize, out: &mut SignalSet| {
        let side = if set.side[k] > 0 {
            Side::Long
        } else {
            Side::Short
        };
        out.push(
            set.entry_idx[k],
            side,
            set.entry_price[k],
            set.stop_price[k],
            set.target_price[k],
            set.size[k],
        );
    };
    while i < a.len() || j < b.len() {
        let take_a = match (i < a.len(), j < b.len()) {
            (true, true) => a.entry_idx[i] < b.entry_idx[j],
            (true, false) => true,
            (false, _) => false,
        };
        if take_a {
            push_from(a, i, &mut merged);
            i += 1;
        } else {
            push_from(b, j, &mut merged);
            j += 1;
        }
    }
    merged
}

pub(crate) fn signal_records(frame: &CoreFrame, signals: &SignalSet) -> Vec<SignalRecord> {
    (0..signals.len())
        .map(|k| SignalRecord {
            symbol: frame.symbol.clone(),
            timestamp: ts_to_datetime(frame.timestamp[signals.entry_idx[k]]),
            side: if signals.side[k] > 0 {
                Side::Long
            } else {
                Side::Short
            },
            entry_price: signals.entry_price[k],
            stop_price: signals.stop_price[k],
            target_price: signals.target_price[k],
            size: signals.size[k],
        })
        .collect()
}

pub(crate) fn execution_records(frame: &CoreFrame, trades: &[TradeResult]) -> Vec<ExecutionRecord> {
    trades
        .iter()
        .map(|t| ExecutionRecord {
            symbol: frame.symbol.clone(),
            entry_time: ts_to_datetime(frame.timestamp[t.entry_idx]),
            exit_time: ts_to_datetime(frame.timestamp[t.exit_idx]),
            side: t.side,
            entry_price: t.entry_price,
            exit_price: t.exit_price,
            exit_reason: t.exit_reason,
            pnl_r: t.pnl_r,
            duration_bars: t.duration_bars,
            size: t.size,
        })
        .collect()
}

/// Full per-symbol pipeline: ingest → slice → indicators/scan → simulate →
/// metrics. Isolated from every other symbol; the orchestrator decides what
/// a failure here means.
pub(crate) fn run_symbol(
    req: &RunRequest,
    spec: &DatasetSpec,
    strategy: &dyn Strategy,
    cancel: &CancelToken,
) -> Result<SymbolRunOutput> {
    let (output, _frame) = run_symbol_pipeline(req, spec, strategy, cancel)?;
    Ok(output)
}

/// [`run_symbol`] variant that also returns the normalized frame; portfolio
/// mode needs the aligned closes for its correlation and allocation state.
pub(crate) fn run_symbol_pipeline(
    req: &RunRequest,
    spec: &DatasetSpec,
    strategy: &dyn Strategy,
    cancel: &CancelToken,
) -> Result<(SymbolRunOutput, CoreFrame)> {
    let mut phase_times = PhaseTimes::default();
    let mut hotspots: Vec<Hotspot> = Vec::new();
    let mut sampler = MemorySampler::default();

    // Ingest phase.
    cancel.checkpoint(Phase::Ingest)?;
    let timer = PhaseTimer::start();
    let ingest_opts = IngestOptions {
        expected_cadence_seconds: req.flags.expected_cadence_seconds,
        mode: req.flags.read_mode,
        downcast: req.flags.downcast,
    };
    let (full_frame, ingestion) = ingest(&spec.path, &spec.symbol, &ingest_opts)?;
    let t = PhaseTimer::start();
    let manifest = ManifestEntry::for_dataset(&spec.path, &full_frame, &ingestion.backend)?;
    let manifest_secs = t.stop();
    let t = PhaseTimer::start();
    let frame = slice_fraction(&full_frame, req.flags.data_frac, req.flags.portion);
    let slice_secs = t.stop();
    drop(full_frame);
    phase_times.ingest = timer.stop();
    sampler.sample(frame.raw_bytes());
    if req.flags.profile {
        hotspots.push(Hotspot {
            name: format!("{}:ingest.read_normalize", spec.symbol),
            seconds: ingestion.runtime_seconds,
        });
        hotspots.push(Hotspot {
            name: format!("{}:ingest.manifest", spec.symbol),
            seconds: manifest_secs,
        });
        hotspots.push(Hotspot {
            name: format!("{}:ingest.slice", spec.symbol),
            seconds: slice_secs,
        });
    }

    if frame.is_empty() || req.flags.dry_run {
        let metrics = DirectionalMetrics::from_trades(req.direction, &[]);
        let output = SymbolRunOutput {
            symbol: spec.symbol.clone(),
            frame_rows: frame.len(),
            raw_bytes: frame.raw_bytes(),
            peak_bytes: sampler.peak_bytes(),
            ingestion,
            manifest,
            trades: Vec::new(),
            conflicts: Vec::new(),
            signal_records: Vec::new(),
            execution_records: Vec::new(),
            metrics,
            phase_times,
            hotspots,
        };
        return Ok((output, frame));
    }

    // Scan phase. The indicator cache lives exactly as long as this block.
    cancel.checkpoint(Phase::Scan)?;
    let timer = PhaseTimer::start();
    let mut cache = IndicatorCache::new();
    let mut conflicts = Vec::new();
    let merged = match req.direction {
        Direction::Long | Direction::Short => {
            let side = req.direction.sides()[0];
            let t = PhaseTimer::start();
            let set = scan_direction(
                &frame,
                strategy,
                &mut cache,
                &req.strategy_params,
                &req.risk,
                side,
            )?;
            if req.flags.profile {
                hotspots.push(Hotspot {
                    name: format!("{}:scan.{}", spec.symbol, if side == Side::Long { "long" } else { "short" }),
                    seconds: t.stop(),
                });
            }
            set
        }
        Direction::Both => {
            let t = PhaseTimer::start();
            let mut long = scan_direction(
                &frame,
                strategy,
                &mut cache,
                &req.strategy_params,
                &req.risk,
                Side::Long,
            )?;
            let long_secs = t.stop();
            let t = PhaseTimer::start();
            let mut short = scan_direction(
                &frame,
                strategy,
                &mut cache,
                &req.strategy_params,
                &req.risk,
                Side::Short,
            )?;
            let short_secs = t.stop();
            let t = PhaseTimer::start();
            conflicts = reject_conflicts(&frame, &mut long, &mut short);
            let merged = merge_signal_sets(&long, &short);
            if req.flags.profile {
                hotspots.push(Hotspot {
                    name: format!("{}:scan.long", spec.symbol),
                    seconds: long_secs,
                });
                hotspots.push(Hotspot {
                    name: format!("{}:scan.short", spec.symbol),
                    seconds: short_secs,
                });
                hotspots.push(Hotspot {
                    name: format!("{}:scan.conflicts", spec.symbol),
                    seconds: t.stop(),
                });
            }
            merged
        }
    };
    drop(cache);
    phase_times.scan = timer.stop();
    sampler.sample(frame.raw_bytes() + merged.len() * (8 * 4 + 8 + 1));

    if !conflicts.is_empty() {
        info!(
            symbol = %spec.symbol,
            rejected = conflicts.len(),
            "both-direction conflicts rejected"
        );
    }

    // Simulate phase.
    cancel.checkpoint(Phase::Simulate)?;
    let timer = PhaseTimer::start();
    let t = PhaseTimer::start();
    let trades = simulate(&frame, &merged, &req.risk)?;
    let batch_secs = t.stop();
    if req.flags.profile {
        hotspots.push(Hotspot {
            name: format!("{}:simulate.batch", spec.symbol),
            seconds: batch_secs,
        });
        // Profiled runs also exercise the reference oracle and the fidelity
        // gate; divergence fails the run.
        let t = PhaseTimer::start();
        let reference = simulate_reference(&frame, &merged, &req.risk)?;
        hotspots.push(Hotspot {
            name: format!("{}:simulate.reference", spec.symbol),
            seconds: t.stop(),
        });
        let t = PhaseTimer::start();
        check_fidelity(&spec.symbol, &trades, &reference)?;
        hotspots.push(Hotspot {
            name: format!("{}:fidelity.compare", spec.symbol),
            seconds: t.stop(),
        });
    }
    phase_times.simulate = timer.stop();
    sampler.sample(frame.raw_bytes() + trades.len() * 112);

    // Aggregate and assemble report records.
    let t = PhaseTimer::start();
    let metrics = DirectionalMetrics::from_trades(req.direction, &trades);
    if req.flags.profile {
        hotspots.push(Hotspot {
            name: format!("{}:metrics.aggregate", spec.symbol),
            seconds: t.stop(),
        });
    }
    let t = PhaseTimer::start();
    let signal_records = signal_records(&frame, &merged);
    let execution_records = execution_records(&frame, &trades);
    if req.flags.profile {
        hotspots.push(Hotspot {
            name: format!("{}:records.assemble", spec.symbol),
            seconds: t.stop(),
        });
    }

    let output = SymbolRunOutput {
        symbol: spec.symbol.clone(),
        frame_rows: frame.len(),
        raw_bytes: frame.raw_bytes(),
        peak_bytes: sampler.peak_bytes(),
        ingestion,
        manifest,
        trades,
        conflicts,
        signal_records,
        execution_records,
        metrics,
        phase_times,
        hotspots,
    };
    Ok((output, frame))
}

/// Single entry point: `RunRequest` in, `RunReport` out.
pub fn run(req: &RunRequest) -> Result<RunReport> {
    run_with_cancel(req, &CancelToken::new())
}

/// [`run`] with an externally owned cancellation token.
pub fn run_with_cancel(req: &RunRequest, cancel: &CancelToken) -> Result<RunReport> {
    use garde::Validate;

    let started_at = Utc::now();
    let wall = PhaseTimer::start();

    req.validate().map_err(|e| {
        EngineError::input(Phase::Ingest, format!("invalid run request: {e}"))
    })?;
    let strategy = find_strategy(&req.strategy).ok_or_else(|| {
        EngineError::input(Phase::Ingest, format!("unknown strategy '{}'", req.strategy))
    })?;
    if req.mode == RunMode::Single && req.datasets.len() != 1 {
        return Err(EngineError::input(
            Phase::Ingest,
            format!(
                "single-symbol mode takes exactly one dataset, got {}",
                req.datasets.len()
            ),
        )
        .into());
    }

    // Reserved: no core path draws from this, but deterministic runs pin the
    // seed so any future stochastic extension stays reproducible.
    let _rng: Option<StdRng> = req
        .flags
        .deterministic
        .then(|| StdRng::seed_from_u64(DETERMINISTIC_SEED));

    let (outputs, failures, snapshot_path) = match req.mode {
        RunMode::Single => {
            let output = run_symbol(req, &req.datasets[0], strategy.as_ref(), cancel)
                .map_err(|e| crate::error::classify(&e, &req.datasets[0].symbol, Phase::Ingest))?;
            (vec![output], Vec::new(), None)
        }
        RunMode::Independent => {
            let (outputs, failures) =
                crate::portfolio::run_independent(req, strategy.as_ref(), cancel)?;
            (outputs, failures, None)
        }
        RunMode::Portfolio => {
            let outcome = crate::portfolio::run_portfolio(req, strategy.as_ref(), cancel)?;
            (outcome.outputs, outcome.failures, outcome.snapshot_path)
        }
    };

    let ended_at = Utc::now();

    // Deterministic assembly: symbols in sorted order.
    let mut outputs = outputs;
    outputs.sort_by(|a, b| a.symbol.cmp(&b.symbol));

    let mut all_trades: Vec<TradeResult> = Vec::new();
    let mut all_conflicts: Vec<ConflictEvent> = Vec::new();
    let mut all_signals: Vec<SignalRecord> = Vec::new();
    let mut all_executions: Vec<ExecutionRecord> = Vec::new();
    let mut per_symbol = BTreeMap::new();
    let mut phase_times = PhaseTimes::default();
    let mut hotspots = Vec::new();
    let mut manifest_entries = Vec::new();
    let mut dataset_rows = 0usize;
    let mut raw_bytes_total = 0usize;
    let mut peak_bytes_total = 0usize;

    for out in &outputs {
        all_trades.extend(out.trades.iter().cloned());
        all_conflicts.extend(out.conflicts.iter().cloned());
        all_signals.extend(out.signal_records.iter().cloned());
        all_executions.extend(out.execution_records.iter().cloned());
        phase_times.accumulate(&out.phase_times);
        hotspots.extend(out.hotspots.iter().cloned());
        manifest_entries.push(out.manifest.clone());
        dataset_rows += out.frame_rows;
        raw_bytes_total += out.raw_bytes;
        peak_bytes_total += out.peak_bytes;
        per_symbol.insert(
            out.symbol.clone(),
            SymbolSummary {
                symbol: out.symbol.clone(),
                rows: out.frame_rows,
                trade_count: out.trades.len(),
                ingestion: out.ingestion.clone(),
                metrics: out.metrics.clone(),
                manifest: out.manifest.clone(),
            },
        );
    }

    let assemble = PhaseTimer::start();
    let metrics = DirectionalMetrics::from_trades(req.direction, &all_trades);

    let params_json = serde_json::to_string(&(&req.strategy_params, &req.risk))
        .unwrap_or_default();
    let hash = manifest_hash(strategy.version(), &params_json, &manifest_entries);
    if req.flags.profile {
        hotspots.push(Hotspot {
            name: "run:report.assemble".to_string(),
            seconds: assemble.stop(),
        });
    }

    let benchmark = BenchmarkRecord::new(
        dataset_rows,
        all_trades.len(),
        phase_times,
        wall.stop(),
        peak_bytes_total,
        raw_bytes_total,
        req.flags.data_frac,
        hotspots,
    );

    let symbols: Vec<String> = req.datasets.iter().map(|d| d.symbol.clone()).collect();
    let report = RunReport {
        run_metadata: RunMetadata {
            run_id: uuid::Uuid::new_v4().to_string(),
            started_at,
            ended_at,
            direction: req.direction,
            symbols,
            manifest_hash: hash,
        },
        metrics,
        per_symbol,
        signals: req.flags.include_signals.then_some(all_signals),
        executions: req.flags.include_executions.then_some(all_executions),
        conflicts: all_conflicts,
        failures,
        benchmark,
        snapshot_path,
    };

    if let Some(dir) = &req.flags.output_dir {
        if !req.flags.dry_run {
            let json_path = report.write_json(dir)?;
            let text_path = report.write_text(dir)?;
            if req.flags.profile {
                report.write_benchmark_json(dir)?;
            }
            info!(json = %json_path.display(), text = %text_path.display(), "run report written");
        }
    }

    Ok(report)
}
