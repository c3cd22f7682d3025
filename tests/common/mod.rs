use std::io::Write;
use std::path::PathBuf;

/// Install a test subscriber once; repeated calls are no-ops.
#[allow(dead_code)]
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// One synthetic candle destined for a CSV fixture.
#[derive(Debug, Clone, Copy)]
pub struct Bar {
    pub ts: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Bar {
    pub fn flat(ts: i64, close: f64) -> Self {
        Self {
            ts,
            open: close,
            high: close + 0.0005,
            low: close - 0.0005,
            close,
            volume: 100.0,
        }
    }
}

/// Write bars to `<dir>/<name>.csv` in the engine's input schema.
pub fn write_csv(dir: &std::path::Path, name: &str, bars: &[Bar]) -> PathBuf {
    let path = dir.join(format!("{name}.csv"));
    let mut file = std::fs::File::create(&path).unwrap();
    writeln!(file, "timestamp,open,high,low,close,volume").unwrap();
    for b in bars {
        writeln!(
            file,
            "{},{},{},{},{},{}",
            b.ts, b.open, b.high, b.low, b.close, b.volume
        )
        .unwrap();
    }
    path
}

/// Hourly bars trending up by `step` per bar from `start_close`.
pub fn trending_bars(start_ts: i64, n: usize, start_close: f64, step: f64) -> Vec<Bar> {
    (0..n)
        .map(|i| Bar::flat(start_ts + i as i64 * 3600, start_close + i as f64 * step))
        .collect()
}

/// The engineered "basic long" scenario: a steady uptrend, one sharp
/// pullback bar that touches the fast EMA with depressed RSI, a breakout
/// close above the pullback bar's high, a quiet tail, then a surge that
/// trades through the 2R target.
pub fn basic_long_bars(start_ts: i64) -> Vec<Bar> {
    let mut bars = trending_bars(start_ts, 60, 1.1000, 0.0010);
    let ts = |i: usize| start_ts + i as i64 * 3600;

    // Pullback bar: deep low onto the fast EMA.
    bars.push(Bar {
        ts: ts(60),
        open: 1.1400,
        high: 1.1405,
        low: 1.1350,
        close: 1.1400,
        volume: 100.0,
    });
    // Breakout bar: close above the pullback bar's high.
    bars.push(Bar::flat(ts(61), 1.1640));
    // Quiet tail: lows stay far above any plausible stop.
    for k in 0..5 {
        bars.push(Bar::flat(ts(62 + k), 1.1650 + k as f64 * 0.0010));
    }
    // Surge bar: trades through entry + 2·(entry − stop).
    bars.push(Bar::flat(ts(67), 1.1800));
    bars.push(Bar::flat(ts(68), 1.1795));
    bars
}
