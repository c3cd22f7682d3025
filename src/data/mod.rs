pub mod csv;
pub mod manifest;
pub mod normalize;
pub mod parquet;

use std::path::Path;

use anyhow::Result;
use polars::prelude::DataFrame;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Phase};

/// Input columns every raw candle file must carry. Extra columns are dropped.
pub const REQUIRED_COLUMNS: [&str; 6] = ["timestamp", "open", "high", "low", "close", "volume"];

/// Reader execution mode. Both produce the same frame; they differ in how the
/// file is materialized (eager columnar read vs lazy scan).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadMode {
    #[default]
    Columnar,
    Iterator,
}

#[derive(Debug, Clone)]
pub struct IngestOptions {
    pub expected_cadence_seconds: i64,
    pub mode: ReadMode,
    pub downcast: bool,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            expected_cadence_seconds: 3600,
            mode: ReadMode::Columnar,
            downcast: false,
        }
    }
}

/// Normalized core representation of one symbol's candle history.
///
/// Timestamps are epoch seconds UTC, strictly increasing and unique. Synthetic
/// rows inserted by gap fill carry `is_gap = true`, zero volume, and all four
/// prices equal to the previous close. Indicator values never live here; they
/// are kept in a parallel store keyed by indicator name (see
/// [`crate::indicators::IndicatorCache`]).
#[derive(Debug, Clone, Default)]
pub struct CoreFrame {
    pub symbol: String,
    pub cadence_seconds: i64,
    pub timestamp: Vec<i64>,
    pub open: Vec<f64>,
    pub high: Vec<f64>,
    pub low: Vec<f64>,
    pub close: Vec<f64>,
    pub volume: Vec<f64>,
    pub is_gap: Vec<bool>,
}

impl CoreFrame {
    pub fn len(&self) -> usize {
        self.timestamp.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamp.is_empty()
    }

    /// Raw byte footprint of the selected columns: six 8-byte columns plus the
    /// gap flag. This is the denominator of the memory-ratio criterion.
    pub fn raw_bytes(&self) -> usize {
        self.len() * (6 * 8 + 1)
    }

    /// Contiguous chronological sub-frame `[start, start + len)`.
    pub fn slice(&self, start: usize, len: usize) -> CoreFrame {
        let end = (start + len).min(self.len());
        let start = start.min(end);
        CoreFrame {
            symbol: self.symbol.clone(),
            cadence_seconds: self.cadence_seconds,
            timestamp: self.timestamp[start..end].to_vec(),
            open: self.open[start..end].to_vec(),
            high: self.high[start..end].to_vec(),
            low: self.low[start..end].to_vec(),
            close: self.close[start..end].to_vec(),
            volume: self.volume[start..end].to_vec(),
            is_gap: self.is_gap[start..end].to_vec(),
        }
    }

    /// Inclusive timestamp range, `None` for an empty frame.
    pub fn date_range(&self) -> Option<(i64, i64)> {
        Some((*self.timestamp.first()?, *self.timestamp.last()?))
    }
}

/// Per-ingestion accounting emitted alongside the core frame.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestionMetrics {
    pub total_rows_input: usize,
    pub total_rows_output: usize,
    pub gaps_inserted: usize,
    pub duplicates_removed: usize,
    pub completeness_pct: f64,
    pub runtime_seconds: f64,
    pub backend: String,
    pub downcast_applied: bool,
}

/// Read a raw candle file and normalize it into a [`CoreFrame`].
///
/// Dispatches on file extension: `.parquet` goes through the columnar scan,
/// everything else is treated as CSV. All sorting, dedup, cadence analysis,
/// and gap fill happen in [`normalize`].
pub fn ingest(
    path: &Path,
    symbol: &str,
    opts: &IngestOptions,
) -> Result<(CoreFrame, IngestionMetrics)> {
    let started = std::time::Instant::now();
    if !path.exists() {
        return Err(EngineError::input(
            Phase::Ingest,
            format!("UnreadablePath: {}", path.display()),
        )
        .into());
    }

    let is_parquet = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("parquet"));

    let (raw, backend): (DataFrame, &str) = if is_parquet {
        (parquet::read(path)?, "parquet")
    } else {
        match opts.mode {
            ReadMode::Columnar => (csv::read(path)?, "csv"),
            ReadMode::Iterator => (csv::read_lazy(path)?, "csv-lazy"),
        }
    };

    let (frame, mut metrics) = normalize::normalize(&raw, symbol, opts)?;
    metrics.backend = backend.to_string();
    metrics.runtime_seconds = started.elapsed().as_secs_f64();
    Ok((frame, metrics))
}
