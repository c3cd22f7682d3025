use std::path::Path;

use anyhow::{Context, Result};
use polars::prelude::*;

/// Columnar Parquet read. Same logical schema as the CSV path; readers differ
/// in performance only.
pub fn read(path: &Path) -> Result<DataFrame> {
    let path_str = path.to_string_lossy().to_string();
    let df = LazyFrame::scan_parquet(path_str.as_str().into(), ScanArgsParquet::default())
        .with_context(|| format!("UnreadablePath: {}", path.display()))?
        .collect()
        .with_context(|| format!("failed to read Parquet {}", path.display()))?;
    Ok(df)
}
