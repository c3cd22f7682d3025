use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// One open position as seen by a snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct PositionSnapshot {
    pub size: f64,
    pub entry_price: f64,
    pub side: i8,
    pub unrealized_r: f64,
}

/// Periodic portfolio state record, one JSON object per line.
#[derive(Debug, Clone, Serialize)]
pub struct PortfolioSnapshotRecord {
    pub timestamp: DateTime<Utc>,
    pub bar_index: usize,
    pub positions: BTreeMap<String, PositionSnapshot>,
    pub unrealized_pnl: f64,
    pub aggregate_pnl: f64,
    pub exposure_fraction: f64,
    pub diversification_ratio: f64,
    pub correlation_window_len: usize,
}

/// Append-only JSONL sink for snapshot records.
pub struct SnapshotWriter {
    writer: BufWriter<File>,
    path: PathBuf,
    records_written: usize,
}

impl SnapshotWriter {
    pub fn create(dir: &Path, at: DateTime<Utc>) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating snapshot dir {}", dir.display()))?;
        let path = dir.join(format!(
            "backtest_snapshots_{}.jsonl",
            at.format("%Y%m%d_%H%M%S")
        ));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening snapshot stream {}", path.display()))?;
        Ok(Self {
            writer: BufWriter::new(file),
            path,
            records_written: 0,
        })
    }

    pub fn append(&mut self, record: &PortfolioSnapshotRecord) -> Result<()> {
        let line = serde_json::to_string(record).context("serializing snapshot record")?;
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.records_written += 1;
        Ok(())
    }

    pub fn finish(mut self) -> Result<(PathBuf, usize)> {
        self.writer.flush()?;
        Ok((self.path, self.records_written))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(bar: usize) -> PortfolioSnapshotRecord {
        PortfolioSnapshotRecord {
            timestamp: Utc.with_ymd_and_hms(2024, 3, 5, 12, 0, 0).unwrap(),
            bar_index: bar,
            positions: BTreeMap::new(),
            unrealized_pnl: 0.0,
            aggregate_pnl: 12.5,
            exposure_fraction: 0.2,
            diversification_ratio: 0.8,
            correlation_window_len: 42,
        }
    }

    #[test]
    fn writes_one_object_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let at = Utc.with_ymd_and_hms(2024, 3, 5, 12, 0, 0).unwrap();
        let mut w = SnapshotWriter::create(dir.path(), at).unwrap();
        w.append(&record(50)).unwrap();
        w.append(&record(100)).unwrap();
        let (path, count) = w.finish().unwrap();
        assert_eq!(count, 2);

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            let v: serde_json::Value = serde_json::from_str(line).unwrap();
            assert!(v["bar_index"].is_number());
            assert!(v["correlation_window_len"].is_number());
        }
    }

    #[test]
    fn filename_carries_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let at = Utc.with_ymd_and_hms(2024, 3, 5, 12, 0, 0).unwrap();
        let w = SnapshotWriter::create(dir.path(), at).unwrap();
        let (path, _) = w.finish().unwrap();
        assert!(path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .contains("20240305_120000"));
    }
}
