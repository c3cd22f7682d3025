use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};

use super::CoreFrame;

/// Per-dataset provenance entry carried on the run report.
#[derive(Debug, Clone, Serialize)]
pub struct ManifestEntry {
    pub symbol: String,
    pub path: String,
    pub sha256: String,
    pub row_count: usize,
    /// Inclusive epoch-second range of the normalized frame, absent when the
    /// dataset was empty.
    pub date_range: Option<(i64, i64)>,
    pub source: String,
}

impl ManifestEntry {
    pub fn for_dataset(path: &Path, frame: &CoreFrame, source: &str) -> Result<Self> {
        Ok(Self {
            symbol: frame.symbol.clone(),
            path: path.display().to_string(),
            sha256: sha256_file(path)?,
            row_count: frame.len(),
            date_range: frame.date_range(),
            source: source.to_string(),
        })
    }
}

/// Streaming SHA-256 of a file's bytes.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)
        .with_context(|| format!("cannot open {} for hashing", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Reproducibility fingerprint for a run:
/// `SHA256(strategy_version | parameter_serialization | concat(dataset sha256, sorted))`.
pub fn manifest_hash(
    strategy_version: &str,
    parameter_serialization: &str,
    entries: &[ManifestEntry],
) -> String {
    let mut dataset_hashes: Vec<&str> = entries.iter().map(|e| e.sha256.as_str()).collect();
    dataset_hashes.sort_unstable();

    let mut hasher = Sha256::new();
    hasher.update(strategy_version.as_bytes());
    hasher.update(b"|");
    hasher.update(parameter_serialization.as_bytes());
    hasher.update(b"|");
    for h in dataset_hashes {
        hasher.update(h.as_bytes());
    }
    hex::encode(hasher.finalize())
}
