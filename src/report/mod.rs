pub mod text;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::bench::BenchmarkRecord;
use crate::data::manifest::ManifestEntry;
use crate::data::IngestionMetrics;
use crate::engine::metrics::DirectionalMetrics;
use crate::engine::types::{ConflictEvent, Direction, ExitReason, RuntimeFailureEvent, Side};

/// Exit tie-break policy, documented verbatim in the text report footer.
pub const TIE_BREAK_POLICY: &str =
    "same-bar stop/target ties resolve to the stop (pessimistic intrabar path)";

#[derive(Debug, Clone, Serialize)]
pub struct RunMetadata {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub direction: Direction,
    pub symbols: Vec<String>,
    pub manifest_hash: String,
}

/// One emitted signal, timestamped for the report. Present only when the
/// request asked for signals.
#[derive(Debug, Clone, Serialize)]
pub struct SignalRecord {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub side: Side,
    pub entry_price: f64,
    pub stop_price: f64,
    pub target_price: f64,
    pub size: f64,
}

/// One executed (simulated) trade, timestamped for the report.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionRecord {
    pub symbol: String,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub side: Side,
    pub entry_price: f64,
    pub exit_price: f64,
    pub exit_reason: ExitReason,
    pub pnl_r: f64,
    pub duration_bars: usize,
    pub size: f64,
}

/// Per-symbol roll-up inside a multi-symbol run.
#[derive(Debug, Clone, Serialize)]
pub struct SymbolSummary {
    pub symbol: String,
    pub rows: usize,
    pub trade_count: usize,
    pub ingestion: IngestionMetrics,
    pub metrics: DirectionalMetrics,
    pub manifest: ManifestEntry,
}

/// The single output of a run. Serialized as JSON (non-finite floats become
/// null; undefined metrics are already `None`) or rendered as the fixed text
/// layout in [`text`].
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_metadata: RunMetadata,
    pub metrics: DirectionalMetrics,
    pub per_symbol: BTreeMap<String, SymbolSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signals: Option<Vec<SignalRecord>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executions: Option<Vec<ExecutionRecord>>,
    pub conflicts: Vec<ConflictEvent>,
    pub failures: Vec<RuntimeFailureEvent>,
    pub benchmark: BenchmarkRecord,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_path: Option<String>,
}

impl RunReport {
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("serializing run report")
    }

    pub fn to_text(&self) -> String {
        text::render(self)
    }

    /// Write the JSON report into `dir` under the canonical filename.
    pub fn write_json(&self, dir: &Path) -> Result<PathBuf> {
        let name = output_filename(
            self.run_metadata.direction,
            &self.run_metadata.symbols,
            self.run_metadata.ended_at,
            "json",
        );
        let path = dir.join(name);
        std::fs::write(&path, self.to_json_string()?)
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(path)
    }

    /// Write the benchmark record alone as JSON, next to the main report.
    pub fn write_benchmark_json(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(format!(
            "backtest_benchmark_{}.json",
            self.run_metadata.ended_at.format("%Y%m%d_%H%M%S")
        ));
        let json = serde_json::to_string_pretty(&self.benchmark)
            .context("serializing benchmark record")?;
        std::fs::write(&path, json).with_context(|| format!("writing {}", path.display()))?;
        Ok(path)
    }

    /// Write the text report into `dir` under the canonical filename.
    pub fn write_text(&self, dir: &Path) -> Result<PathBuf> {
        let name = output_filename(
            self.run_metadata.direction,
            &self.run_metadata.symbols,
            self.run_metadata.ended_at,
            "txt",
        );
        let path = dir.join(name);
        std::fs::write(&path, self.to_text())
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(path)
    }
}

/// Canonical output filename:
/// `backtest_<direction>_<symbol|multi>_<YYYYMMDD>_<HHMMSS>.<ext>`.
/// Single-symbol runs use the lowercase pair; anything else is `multi`.
pub fn output_filename(
    direction: Direction,
    symbols: &[String],
    at: DateTime<Utc>,
    ext: &str,
) -> String {
    let symbol_part = if symbols.len() == 1 {
        let cleaned: String = symbols[0]
            .chars()
            .filter(char::is_ascii_alphanumeric)
            .collect::<String>()
            .to_lowercase();
        if cleaned.len() == 6 {
            cleaned
        } else {
            "multi".to_string()
        }
    } else {
        "multi".to_string()
    };
    format!(
        "backtest_{}_{}_{}.{}",
        direction.label(),
        symbol_part,
        at.format("%Y%m%d_%H%M%S"),
        ext
    )
}
