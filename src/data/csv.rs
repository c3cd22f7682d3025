use std::path::Path;

use anyhow::{Context, Result};
use polars::prelude::*;

/// Columnar CSV read via the lazy scan engine, collected eagerly.
/// Dtype enforcement happens in the normalize pass; here we only need the
/// header present and the file parseable.
pub fn read(path: &Path) -> Result<DataFrame> {
    scan(path, false)
}

/// Iterator-mode variant of [`read`]: the low-memory scan trades throughput
/// for smaller read chunks. Same logical output.
pub fn read_lazy(path: &Path) -> Result<DataFrame> {
    scan(path, true)
}

fn scan(path: &Path, low_memory: bool) -> Result<DataFrame> {
    let path_str = path.to_string_lossy().to_string();
    let df = LazyCsvReader::new(path_str.as_str().into())
        .with_has_header(true)
        .with_infer_schema_length(Some(1024))
        .with_low_memory(low_memory)
        .finish()
        .with_context(|| format!("UnreadablePath: {}", path.display()))?
        .collect()
        .with_context(|| format!("failed to parse CSV {}", path.display()))?;
    Ok(df)
}
