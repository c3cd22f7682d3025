pub mod atr;
pub mod ema;
pub mod rsi;
pub mod stoch_rsi;

use std::sync::Arc;

use anyhow::Result;
use rustc_hash::FxHashMap;

use crate::data::CoreFrame;
use crate::error::EngineError;

/// An indicator request: kind plus parameters. Doubles as the cache key, so
/// parameters are integral (periods and smoothing lengths).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndicatorSpec {
    Ema { period: usize },
    Atr { period: usize },
    Rsi { period: usize },
    StochRsi { period: usize, k_smooth: usize, d_smooth: usize },
}

impl IndicatorSpec {
    pub fn name(&self) -> String {
        match self {
            IndicatorSpec::Ema { period } => format!("ema_{period}"),
            IndicatorSpec::Atr { period } => format!("atr_{period}"),
            IndicatorSpec::Rsi { period } => format!("rsi_{period}"),
            IndicatorSpec::StochRsi {
                period,
                k_smooth,
                d_smooth,
            } => format!("stoch_rsi_{period}_{k_smooth}_{d_smooth}"),
        }
    }

    /// Index of the first defined value; everything before it is the warmup
    /// prefix and is stored as NaN.
    pub fn warmup(&self) -> usize {
        match *self {
            IndicatorSpec::Ema { period } => period.saturating_sub(1),
            IndicatorSpec::Atr { period } | IndicatorSpec::Rsi { period } => period,
            IndicatorSpec::StochRsi {
                period,
                k_smooth,
                d_smooth,
            } => (2 * period + k_smooth + d_smooth).saturating_sub(3),
        }
    }

    /// Minimum frame length that yields at least one defined value.
    pub fn min_rows(&self) -> usize {
        self.warmup() + 1
    }

    fn compute(&self, frame: &CoreFrame) -> Vec<f64> {
        match *self {
            IndicatorSpec::Ema { period } => ema::ema(&frame.close, period),
            IndicatorSpec::Atr { period } => atr::atr(&frame.high, &frame.low, &frame.close, period),
            IndicatorSpec::Rsi { period } => rsi::rsi(&frame.close, period),
            IndicatorSpec::StochRsi {
                period,
                k_smooth,
                d_smooth,
            } => stoch_rsi::stoch_rsi(&frame.close, period, k_smooth, d_smooth),
        }
    }
}

/// Lazy per-run indicator store for one dataset.
///
/// The first request for a spec computes and stores the full-length series;
/// subsequent requests return the same allocation by reference. Series are
/// immutable after first write and discarded with the cache at run end.
/// Identical inputs produce bit-identical series: every kernel is a plain
/// sequential f64 recurrence with a documented seed.
#[derive(Debug, Default)]
pub struct IndicatorCache {
    series: FxHashMap<IndicatorSpec, Arc<Vec<f64>>>,
}

impl IndicatorCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch (computing on first use) the series for `spec`, aligned to
    /// `frame` with a NaN warmup prefix.
    pub fn get(&mut self, frame: &CoreFrame, spec: IndicatorSpec) -> Result<Arc<Vec<f64>>> {
        if let Some(existing) = self.series.get(&spec) {
            return Ok(Arc::clone(existing));
        }
        if frame.len() < spec.min_rows() {
            return Err(EngineError::strategy_config(format!(
                "indicator {} needs at least {} rows, frame has {}",
                spec.name(),
                spec.min_rows(),
                frame.len()
            ))
            .into());
        }
        let computed = Arc::new(spec.compute(frame));
        debug_assert_eq!(computed.len(), frame.len());
        self.series.insert(spec, Arc::clone(&computed));
        Ok(computed)
    }

    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_with_closes(closes: &[f64]) -> CoreFrame {
        CoreFrame {
            symbol: "EURUSD".into(),
            cadence_seconds: 60,
            timestamp: (0..closes.len() as i64).map(|i| i * 60).collect(),
            open: closes.to_vec(),
            high: closes.iter().map(|c| c + 0.001).collect(),
            low: closes.iter().map(|c| c - 0.001).collect(),
            close: closes.to_vec(),
            volume: vec![1.0; closes.len()],
            is_gap: vec![false; closes.len()],
        }
    }

    #[test]
    fn cache_returns_same_allocation() {
        let frame = frame_with_closes(&[1.0, 1.1, 1.2, 1.3, 1.4, 1.5]);
        let mut cache = IndicatorCache::new();
        let spec = IndicatorSpec::Ema { period: 3 };
        let a = cache.get(&frame, spec).unwrap();
        let b = cache.get(&frame, spec).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn period_longer_than_frame_is_strategy_config_error() {
        let frame = frame_with_closes(&[1.0, 1.1]);
        let mut cache = IndicatorCache::new();
        let err = cache
            .get(&frame, IndicatorSpec::Rsi { period: 14 })
            .unwrap_err();
        let e = err.downcast_ref::<EngineError>().unwrap();
        assert_eq!(e.kind, crate::error::ErrorKind::StrategyConfig);
    }

    #[test]
    fn warmup_prefix_is_nan_sentinel() {
        let closes: Vec<f64> = (0..20).map(|i| 1.0 + f64::from(i) * 0.01).collect();
        let frame = frame_with_closes(&closes);
        let mut cache = IndicatorCache::new();
        let spec = IndicatorSpec::Ema { period: 5 };
        let series = cache.get(&frame, spec).unwrap();
        for v in &series[..spec.warmup()] {
            assert!(v.is_nan());
        }
        for v in &series[spec.warmup()..] {
            assert!(v.is_finite());
        }
    }

    #[test]
    fn distinct_params_are_distinct_keys() {
        let closes: Vec<f64> = (0..30).map(|i| 1.0 + f64::from(i) * 0.01).collect();
        let frame = frame_with_closes(&closes);
        let mut cache = IndicatorCache::new();
        cache.get(&frame, IndicatorSpec::Ema { period: 5 }).unwrap();
        cache.get(&frame, IndicatorSpec::Ema { period: 10 }).unwrap();
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn identical_inputs_bit_identical_outputs() {
        let closes: Vec<f64> = (0..50).map(|i| (f64::from(i) * 0.7).sin() + 2.0).collect();
        let frame = frame_with_closes(&closes);
        let spec = IndicatorSpec::Rsi { period: 14 };
        let a = IndicatorCache::new().get(&frame, spec).unwrap();
        let b = IndicatorCache::new().get(&frame, spec).unwrap();
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.to_bits(), y.to_bits());
        }
    }
}
