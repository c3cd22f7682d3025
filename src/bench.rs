use std::collections::BTreeMap;
use std::time::Instant;

use serde::Serialize;

/// Wall-clock seconds spent in each pipeline phase.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PhaseTimes {
    pub ingest: f64,
    pub scan: f64,
    pub simulate: f64,
}

impl PhaseTimes {
    pub fn accumulate(&mut self, other: &PhaseTimes) {
        self.ingest += other.ingest;
        self.scan += other.scan;
        self.simulate += other.simulate;
    }
}

/// One-shot stopwatch for a phase or a profiled sub-step.
pub struct PhaseTimer {
    started: Instant,
}

impl PhaseTimer {
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    pub fn stop(self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }
}

/// Named sub-step timing, collected when profiling is enabled.
#[derive(Debug, Clone, Serialize)]
pub struct Hotspot {
    pub name: String,
    pub seconds: f64,
}

/// Live-bytes sampler. The engine reports its estimated live structure sizes
/// at phase boundaries; the sampler keeps the maximum seen.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemorySampler {
    peak_bytes: usize,
}

impl MemorySampler {
    pub fn sample(&mut self, live_bytes: usize) {
        if live_bytes > self.peak_bytes {
            self.peak_bytes = live_bytes;
        }
    }

    pub fn peak_bytes(self) -> usize {
        self.peak_bytes
    }
}

/// Structured benchmark record emitted once per run.
#[derive(Debug, Clone, Serialize)]
pub struct BenchmarkRecord {
    pub dataset_rows: usize,
    pub trades_simulated: usize,
    pub phase_times: PhaseTimes,
    pub wall_clock_total: f64,
    pub memory_peak_bytes: usize,
    /// `memory_peak_bytes / raw_dataset_bytes`; zero-row runs report 0.
    pub memory_ratio: f64,
    pub fraction_used: f64,
    pub hotspots: Vec<Hotspot>,
    /// Pass/fail flags keyed by success criterion id.
    pub criteria: BTreeMap<String, bool>,
}

impl BenchmarkRecord {
    pub fn new(
        dataset_rows: usize,
        trades_simulated: usize,
        phase_times: PhaseTimes,
        wall_clock_total: f64,
        memory_peak_bytes: usize,
        raw_dataset_bytes: usize,
        fraction_used: f64,
        hotspots: Vec<Hotspot>,
    ) -> Self {
        let memory_ratio = if raw_dataset_bytes > 0 {
            memory_peak_bytes as f64 / raw_dataset_bytes as f64
        } else {
            0.0
        };

        let mut criteria = BTreeMap::new();
        criteria.insert("memory_ratio_le_1_5".to_string(), memory_ratio <= 1.5);
        criteria.insert(
            "fraction_used_in_unit_interval".to_string(),
            fraction_used > 0.0 && fraction_used <= 1.0,
        );
        criteria.insert(
            "phase_times_non_negative".to_string(),
            phase_times.ingest >= 0.0 && phase_times.scan >= 0.0 && phase_times.simulate >= 0.0,
        );

        Self {
            dataset_rows,
            trades_simulated,
            phase_times,
            wall_clock_total,
            memory_peak_bytes,
            memory_ratio,
            fraction_used,
            hotspots,
            criteria,
        }
    }
}
