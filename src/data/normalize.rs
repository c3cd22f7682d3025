use anyhow::Result;
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use polars::prelude::*;
use tracing::{debug, warn};

use super::{CoreFrame, IngestOptions, IngestionMetrics, REQUIRED_COLUMNS};
use crate::error::{EngineError, Phase};

/// Completeness below this percentage draws a warning; ingestion still
/// proceeds — real FX data is expected to be gappy.
const COMPLETENESS_WARN_PCT: f64 = 50.0;

/// Maximum relative precision loss tolerated when deciding whether prices
/// survive a float32 round-trip.
const DOWNCAST_REL_TOL: f64 = 1e-6;

/// Normalize a raw frame into the seven-column core representation:
/// sort ascending, dedup keep-last, cadence analysis, gap fill, downcast
/// check. Single pass over the data after the sort; no per-row fallbacks.
pub fn normalize(
    raw: &DataFrame,
    symbol: &str,
    opts: &IngestOptions,
) -> Result<(CoreFrame, IngestionMetrics)> {
    let mut metrics = IngestionMetrics {
        total_rows_input: raw.height(),
        ..IngestionMetrics::default()
    };

    for col in REQUIRED_COLUMNS {
        if !raw.schema().contains(col) {
            return Err(EngineError::input(
                Phase::Ingest,
                format!("MissingColumns: required column '{col}' absent"),
            )
            .into());
        }
    }

    if raw.height() == 0 {
        warn!(symbol, "EmptyFile: ingesting produced an empty core frame");
        let frame = CoreFrame {
            symbol: symbol.to_string(),
            cadence_seconds: opts.expected_cadence_seconds,
            ..CoreFrame::default()
        };
        metrics.completeness_pct = 0.0;
        return Ok((frame, metrics));
    }

    // Unknown extra columns are dropped here; everything downstream sees
    // exactly the required set.
    let selected = raw.select(REQUIRED_COLUMNS)?;

    let mut timestamp = extract_timestamps(selected.column("timestamp")?)?;
    let mut open = extract_f64(&selected, "open")?;
    let mut high = extract_f64(&selected, "high")?;
    let mut low = extract_f64(&selected, "low")?;
    let mut close = extract_f64(&selected, "close")?;
    let mut volume = extract_f64(&selected, "volume")?;

    // Stable ascending sort by timestamp; skipped when already sorted so the
    // common pre-sorted case stays O(n).
    if !timestamp.windows(2).all(|w| w[0] <= w[1]) {
        let mut order: Vec<usize> = (0..timestamp.len()).collect();
        order.sort_by_key(|&i| timestamp[i]);
        timestamp = order.iter().map(|&i| timestamp[i]).collect();
        open = order.iter().map(|&i| open[i]).collect();
        high = order.iter().map(|&i| high[i]).collect();
        low = order.iter().map(|&i| low[i]).collect();
        close = order.iter().map(|&i| close[i]).collect();
        volume = order.iter().map(|&i| volume[i]).collect();
    }

    // Dedup policy: multiple rows sharing a timestamp keep the last occurrence
    // by input order (the stable sort preserves it).
    let n = timestamp.len();
    let mut keep = vec![true; n];
    let mut duplicates_removed = 0usize;
    let mut first_dropped: Option<i64> = None;
    let mut last_dropped: Option<i64> = None;
    for i in 0..n.saturating_sub(1) {
        if timestamp[i] == timestamp[i + 1] {
            keep[i] = false;
            duplicates_removed += 1;
            first_dropped.get_or_insert(timestamp[i]);
            last_dropped = Some(timestamp[i]);
        }
    }
    if duplicates_removed > 0 {
        warn!(
            symbol,
            duplicates_removed,
            first_dropped = first_dropped.unwrap_or_default(),
            last_dropped = last_dropped.unwrap_or_default(),
            "dropped duplicate timestamps, keeping last occurrence"
        );
        retain_by_mask(&mut timestamp, &keep);
        retain_by_mask(&mut open, &keep);
        retain_by_mask(&mut high, &keep);
        retain_by_mask(&mut low, &keep);
        retain_by_mask(&mut close, &keep);
        retain_by_mask(&mut volume, &keep);
    }
    metrics.duplicates_removed = duplicates_removed;

    validate_rows(symbol, &timestamp, &open, &high, &low, &close, &volume)?;

    // Cadence analysis — informational, never fatal.
    let cadence = opts.expected_cadence_seconds.max(1);
    let span = timestamp.last().unwrap() - timestamp.first().unwrap();
    let expected_rows = (span / cadence + 1).max(1) as usize;
    let completeness_pct = 100.0 * timestamp.len() as f64 / expected_rows as f64;
    metrics.completeness_pct = completeness_pct;
    if completeness_pct < COMPLETENESS_WARN_PCT {
        warn!(
            symbol,
            completeness_pct,
            expected_rows,
            observed_rows = timestamp.len(),
            "dataset completeness below 50%; continuing"
        );
    } else {
        debug!(symbol, completeness_pct, "cadence analysis");
    }

    let (frame, gaps_inserted) = fill_gaps(
        symbol,
        cadence,
        &timestamp,
        &open,
        &high,
        &low,
        &close,
        &volume,
    );
    metrics.gaps_inserted = gaps_inserted;
    metrics.total_rows_output = frame.len();

    if opts.downcast {
        metrics.downcast_applied = downcast_is_lossless(&frame);
        if !metrics.downcast_applied {
            debug!(
                symbol,
                "downcast requested but float32 would lose more than {DOWNCAST_REL_TOL} relative precision; keeping float64"
            );
        }
    }

    Ok((frame, metrics))
}

fn retain_by_mask<T: Copy>(values: &mut Vec<T>, keep: &[bool]) {
    let mut idx = 0;
    values.retain(|_| {
        let k = keep[idx];
        idx += 1;
        k
    });
}

/// Pull the timestamp column into epoch seconds, UTC.
///
/// Accepted encodings: integer epoch seconds, ISO-8601 strings (`Z`,
/// `+00:00`, or naive — naive is treated as UTC), and polars Datetime
/// columns in UTC or without a timezone. Any other explicit offset or
/// timezone fails the run with `NonUtcTimestamp`.
fn extract_timestamps(col: &Column) -> Result<Vec<i64>> {
    match col.dtype() {
        DataType::Int64 => Ok(col.i64()?.into_no_null_iter().collect()),
        DataType::Int32 => Ok(col.i32()?.into_no_null_iter().map(i64::from).collect()),
        DataType::String => {
            let ca = col.str()?;
            let mut out = Vec::with_capacity(ca.len());
            for opt in ca {
                let s = opt.ok_or_else(|| {
                    EngineError::input(Phase::Ingest, "MissingColumns: null timestamp cell")
                })?;
                out.push(parse_utc_timestamp(s)?);
            }
            Ok(out)
        }
        DataType::Datetime(tu, tz) => {
            if let Some(tz) = tz {
                if tz.to_string() != "UTC" {
                    return Err(EngineError::input(
                        Phase::Ingest,
                        format!("NonUtcTimestamp: datetime column in timezone {tz}"),
                    )
                    .into());
                }
            }
            let divisor = match tu {
                TimeUnit::Milliseconds => 1_000,
                TimeUnit::Microseconds => 1_000_000,
                TimeUnit::Nanoseconds => 1_000_000_000,
            };
            Ok(col
                .datetime()?
                .phys
                .into_no_null_iter()
                .map(|v| v / divisor)
                .collect())
        }
        other => Err(EngineError::input(
            Phase::Ingest,
            format!("MissingColumns: unsupported timestamp dtype {other:?}"),
        )
        .into()),
    }
}

fn parse_utc_timestamp(s: &str) -> Result<i64> {
    // Plain epoch seconds as text.
    if let Ok(epoch) = s.parse::<i64>() {
        return Ok(epoch);
    }
    // Explicit-offset ISO-8601: only +00:00 / Z are UTC-comparable.
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        if dt.offset().local_minus_utc() != 0 {
            return Err(EngineError::input(
                Phase::Ingest,
                format!("NonUtcTimestamp: '{s}' has a non-UTC offset"),
            )
            .into());
        }
        return Ok(dt.timestamp());
    }
    // Naive forms are treated as UTC.
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(naive.and_utc().timestamp());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Ok(date.and_hms_opt(0, 0, 0).unwrap().and_utc().timestamp());
    }
    Err(EngineError::input(
        Phase::Ingest,
        format!("NonUtcTimestamp: cannot parse '{s}' as a UTC timestamp"),
    )
    .into())
}

fn extract_f64(df: &DataFrame, name: &str) -> Result<Vec<f64>> {
    let casted = df.column(name)?.cast(&DataType::Float64)?;
    let ca = casted.f64()?;
    Ok(ca.iter().map(|v| v.unwrap_or(f64::NAN)).collect())
}

/// Row integrity: positive finite prices, `low <= open,close <= high`,
/// non-negative volume. Violations are fatal for this symbol.
#[allow(clippy::too_many_arguments)]
fn validate_rows(
    symbol: &str,
    timestamp: &[i64],
    open: &[f64],
    high: &[f64],
    low: &[f64],
    close: &[f64],
    volume: &[f64],
) -> Result<()> {
    for i in 0..timestamp.len() {
        let (o, h, l, c, v) = (open[i], high[i], low[i], close[i], volume[i]);
        let prices_ok = l > 0.0
            && [o, h, l, c].iter().all(|p| p.is_finite())
            && l <= o
            && o <= h
            && l <= c
            && c <= h;
        if !prices_ok || !v.is_finite() || v < 0.0 {
            return Err(EngineError::data_integrity(
                symbol,
                Phase::Ingest,
                format!(
                    "invalid candle at ts={} (o={o} h={h} l={l} c={c} v={v})",
                    timestamp[i]
                ),
            )
            .into());
        }
    }
    Ok(())
}

/// Synthesize rows for every missing expected interval: prices carried from
/// the previous close, volume zero, `is_gap = true`. One forward pass.
#[allow(clippy::too_many_arguments)]
fn fill_gaps(
    symbol: &str,
    cadence: i64,
    timestamp: &[i64],
    open: &[f64],
    high: &[f64],
    low: &[f64],
    close: &[f64],
    volume: &[f64],
) -> (CoreFrame, usize) {
    let n = timestamp.len();
    let span = timestamp[n - 1] - timestamp[0];
    let capacity = (span / cadence + 1).max(n as i64) as usize;

    let mut frame = CoreFrame {
        symbol: symbol.to_string(),
        cadence_seconds: cadence,
        timestamp: Vec::with_capacity(capacity),
        open: Vec::with_capacity(capacity),
        high: Vec::with_capacity(capacity),
        low: Vec::with_capacity(capacity),
        close: Vec::with_capacity(capacity),
        volume: Vec::with_capacity(capacity),
        is_gap: Vec::with_capacity(capacity),
    };

    let mut gaps_inserted = 0usize;
    for i in 0..n {
        if i > 0 {
            let prev_close = close[i - 1];
            let mut expected = timestamp[i - 1] + cadence;
            while expected < timestamp[i] {
                frame.timestamp.push(expected);
                frame.open.push(prev_close);
                frame.high.push(prev_close);
                frame.low.push(prev_close);
                frame.close.push(prev_close);
                frame.volume.push(0.0);
                frame.is_gap.push(true);
                gaps_inserted += 1;
                expected += cadence;
            }
        }
        frame.timestamp.push(timestamp[i]);
        frame.open.push(open[i]);
        frame.high.push(high[i]);
        frame.low.push(low[i]);
        frame.close.push(close[i]);
        frame.volume.push(volume[i]);
        frame.is_gap.push(false);
    }

    if gaps_inserted > 0 {
        debug!(symbol, gaps_inserted, "gap fill inserted synthetic rows");
    }
    (frame, gaps_inserted)
}

/// True when every price survives a float32 round-trip within
/// `DOWNCAST_REL_TOL` relative error.
fn downcast_is_lossless(frame: &CoreFrame) -> bool {
    let lossless = |v: &f64| {
        let round_tripped = f64::from(*v as f32);
        (round_tripped - v).abs() <= DOWNCAST_REL_TOL * v.abs()
    };
    frame.open.iter().all(lossless)
        && frame.high.iter().all(lossless)
        && frame.low.iter().all(lossless)
        && frame.close.iter().all(lossless)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::ReadMode;

    fn opts(cadence: i64) -> IngestOptions {
        IngestOptions {
            expected_cadence_seconds: cadence,
            mode: ReadMode::Columnar,
            downcast: false,
        }
    }

    fn raw_df(ts: &[i64], closes: &[f64]) -> DataFrame {
        let opens: Vec<f64> = closes.iter().map(|c| c - 0.001).collect();
        let highs: Vec<f64> = closes.iter().map(|c| c + 0.002).collect();
        let lows: Vec<f64> = closes.iter().map(|c| c - 0.002).collect();
        let volumes: Vec<f64> = vec![100.0; ts.len()];
        df! {
            "timestamp" => ts,
            "open" => &opens,
            "high" => &highs,
            "low" => &lows,
            "close" => closes,
            "volume" => &volumes,
        }
        .unwrap()
    }

    #[test]
    fn missing_column_rejected() {
        let df = df! { "timestamp" => &[1_i64], "close" => &[1.0_f64] }.unwrap();
        let err = normalize(&df, "EURUSD", &opts(60)).unwrap_err();
        let e = err.downcast_ref::<EngineError>().unwrap();
        assert!(e.message.contains("MissingColumns"), "{}", e.message);
    }

    #[test]
    fn empty_file_yields_empty_frame_not_error() {
        let df = raw_df(&[], &[]);
        let (frame, metrics) = normalize(&df, "EURUSD", &opts(60)).unwrap();
        assert!(frame.is_empty());
        assert_eq!(metrics.total_rows_output, 0);
    }

    #[test]
    fn unsorted_input_is_sorted() {
        let df = raw_df(&[180, 60, 120], &[1.2, 1.0, 1.1]);
        let (frame, _) = normalize(&df, "EURUSD", &opts(60)).unwrap();
        assert_eq!(frame.timestamp, vec![60, 120, 180]);
        assert_eq!(frame.close, vec![1.0, 1.1, 1.2]);
    }

    #[test]
    fn duplicates_keep_last_occurrence() {
        let df = raw_df(&[60, 120, 120, 180], &[1.0, 1.1, 1.15, 1.2]);
        let (frame, metrics) = normalize(&df, "EURUSD", &opts(60)).unwrap();
        assert_eq!(metrics.duplicates_removed, 1);
        assert_eq!(frame.timestamp, vec![60, 120, 180]);
        // Last occurrence of ts=120 wins.
        assert_eq!(frame.close[1], 1.15);
    }

    #[test]
    fn gap_fill_synthesizes_carried_rows() {
        // One missing interval between 60 and 240 at cadence 60: 120, 180.
        let df = raw_df(&[60, 240], &[1.0, 1.2]);
        let (frame, metrics) = normalize(&df, "EURUSD", &opts(60)).unwrap();
        assert_eq!(metrics.gaps_inserted, 2);
        assert_eq!(frame.timestamp, vec![60, 120, 180, 240]);
        assert_eq!(frame.is_gap, vec![false, true, true, false]);
        // Synthetic rows carry the previous close on all four prices.
        for i in [1usize, 2] {
            assert_eq!(frame.open[i], 1.0);
            assert_eq!(frame.high[i], 1.0);
            assert_eq!(frame.low[i], 1.0);
            assert_eq!(frame.close[i], 1.0);
            assert_eq!(frame.volume[i], 0.0);
        }
    }

    #[test]
    fn timestamps_strictly_increasing_after_normalize() {
        let df = raw_df(&[300, 60, 60, 180], &[1.3, 1.0, 1.05, 1.2]);
        let (frame, _) = normalize(&df, "EURUSD", &opts(60)).unwrap();
        assert!(frame.timestamp.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn low_completeness_warns_but_continues() {
        // 3 rows over a span that expects 61 — far below 50%.
        let df = raw_df(&[0, 1800, 3600], &[1.0, 1.1, 1.2]);
        let (frame, metrics) = normalize(&df, "EURUSD", &opts(60)).unwrap();
        assert!(metrics.completeness_pct < 50.0);
        assert!(!frame.is_empty());
    }

    #[test]
    fn iso8601_and_epoch_strings_parse_as_utc() {
        assert_eq!(parse_utc_timestamp("1700000000").unwrap(), 1_700_000_000);
        assert_eq!(
            parse_utc_timestamp("2023-11-14T22:13:20Z").unwrap(),
            1_700_000_000
        );
        assert_eq!(
            parse_utc_timestamp("2023-11-14 22:13:20").unwrap(),
            1_700_000_000
        );
    }

    #[test]
    fn non_utc_offset_rejected() {
        let err = parse_utc_timestamp("2023-11-14T22:13:20+02:00").unwrap_err();
        let e = err.downcast_ref::<EngineError>().unwrap();
        assert!(e.message.contains("NonUtcTimestamp"));
    }

    #[test]
    fn invalid_candle_is_data_integrity_error() {
        let df = df! {
            "timestamp" => &[60_i64],
            "open" => &[1.0_f64],
            "high" => &[0.9_f64], // high below open
            "low" => &[0.8_f64],
            "close" => &[0.85_f64],
            "volume" => &[10.0_f64],
        }
        .unwrap();
        let err = normalize(&df, "EURUSD", &opts(60)).unwrap_err();
        let e = err.downcast_ref::<EngineError>().unwrap();
        assert_eq!(e.kind, crate::error::ErrorKind::DataIntegrity);
    }

    #[test]
    fn downcast_flag_reports_losslessness() {
        let df = raw_df(&[60, 120], &[1.0, 1.1]);
        let mut o = opts(60);
        o.downcast = true;
        let (_, metrics) = normalize(&df, "EURUSD", &o).unwrap();
        // Small FX-scale prices round-trip through f32 within 1e-6 relative.
        assert!(metrics.downcast_applied);
    }

    #[test]
    fn extra_columns_dropped() {
        let mut df = raw_df(&[60, 120], &[1.0, 1.1]);
        df.with_column(Column::new("spread".into(), &[0.1_f64, 0.2]))
            .unwrap();
        let (frame, _) = normalize(&df, "EURUSD", &opts(60)).unwrap();
        assert_eq!(frame.len(), 2);
    }
}
