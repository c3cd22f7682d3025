use anyhow::Result;
use tracing::{debug, warn};

use super::types::{RiskParams, Side, SignalSet, StrategyParams};
use crate::data::CoreFrame;
use crate::error::EngineError;
use crate::indicators::{IndicatorCache, IndicatorSpec};
use crate::strategies::Strategy;

/// Scan one direction of one symbol: strategy masks in, fully-parameterized
/// signals out. One pass over precomputed columns.
///
/// The scanner owns everything the strategy does not: the cooldown gate,
/// per-signal stop/target placement, position sizing, and the invariant
/// checks on its own output.
pub fn scan_direction(
    frame: &CoreFrame,
    strategy: &dyn Strategy,
    cache: &mut IndicatorCache,
    sparams: &StrategyParams,
    risk: &RiskParams,
    side: Side,
) -> Result<SignalSet> {
    if risk.atr_mult <= 0.0 && risk.min_stop_distance <= 0.0 {
        return Err(EngineError::risk_config(
            "stop policy needs atr_mult > 0 or min_stop_distance > 0",
        )
        .into());
    }
    if risk.risk_per_trade <= 0.0 {
        return Err(EngineError::risk_config(format!(
            "risk_per_trade must be positive, got {}",
            risk.risk_per_trade
        ))
        .into());
    }

    // ATR backs the stop policy; its absence is a risk configuration error,
    // not a strategy one.
    let atr = if risk.atr_mult > 0.0 {
        let spec = IndicatorSpec::Atr {
            period: sparams.atr_period,
        };
        Some(cache.get(frame, spec).map_err(|e| {
            EngineError::risk_config(format!("ATR unavailable for ATR-based stops: {e:#}"))
        })?)
    } else {
        None
    };

    let masks = strategy.masks(frame, cache, sparams, side)?;
    debug_assert_eq!(masks.len(), frame.len());

    let mut signals = SignalSet::default();
    let mut last_entry: Option<usize> = None;
    let mut dropped_zero_size = 0usize;

    for i in 0..frame.len() {
        if !(masks.trend_ok[i] && masks.pullback_ok[i] && masks.reversal_ok[i]) {
            continue;
        }
        if let Some(last) = last_entry {
            if i < last + sparams.cooldown_bars {
                continue;
            }
        }

        let atr_component = match &atr {
            Some(series) => {
                let v = series[i];
                if v.is_nan() {
                    continue; // still in warmup
                }
                risk.atr_mult * v
            }
            None => 0.0,
        };
        let stop_distance = atr_component.max(risk.min_stop_distance);
        if stop_distance <= 0.0 {
            continue;
        }

        let entry = frame.close[i];
        let mult = side.multiplier();
        let stop = entry - mult * stop_distance;
        let target = entry + mult * stop_distance * risk.target_r_mult;

        let raw_size = risk.account_equity * risk.risk_per_trade / (stop_distance * risk.pip_value);
        let stepped = (raw_size / risk.lot_step).floor() * risk.lot_step;
        let size = stepped.min(risk.max_position);
        if size <= 0.0 {
            dropped_zero_size += 1;
            warn!(
                symbol = %frame.symbol,
                bar = i,
                raw_size,
                "signal dropped: size rounds to zero at lot_step"
            );
            continue;
        }

        signals.push(i, side, entry, stop, target, size);
        last_entry = Some(i);
    }

    if dropped_zero_size > 0 {
        debug!(
            symbol = %frame.symbol,
            dropped_zero_size,
            "scanner dropped zero-size signals"
        );
    }

    validate_signal_set(frame, &signals, side)?;
    Ok(signals)
}

/// Invariants the scanner guarantees on its own output: price ordering per
/// direction, strictly positive sizes, strictly increasing entry indices.
fn validate_signal_set(frame: &CoreFrame, signals: &SignalSet, side: Side) -> Result<()> {
    let mut prev_idx: Option<usize> = None;
    for k in 0..signals.len() {
        let (entry, stop, target) = (
            signals.entry_price[k],
            signals.stop_price[k],
            signals.target_price[k],
        );
        let ordered = match side {
            Side::Long => stop < entry && entry < target,
            Side::Short => target < entry && entry < stop,
        };
        if !ordered {
            return Err(EngineError::runtime(
                &frame.symbol,
                crate::error::Phase::Scan,
                format!("signal {k}: stop/entry/target ordering violated (s={stop} e={entry} t={target})"),
            )
            .into());
        }
        if signals.size[k] <= 0.0 {
            return Err(EngineError::runtime(
                &frame.symbol,
                crate::error::Phase::Scan,
                format!("signal {k}: non-positive size {}", signals.size[k]),
            )
            .into());
        }
        if let Some(prev) = prev_idx {
            if signals.entry_idx[k] <= prev {
                return Err(EngineError::runtime(
                    &frame.symbol,
                    crate::error::Phase::Scan,
                    format!("signal {k}: entry indices not strictly increasing"),
                )
                .into());
            }
        }
        prev_idx = Some(signals.entry_idx[k]);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::Direction;
    use crate::strategies::{StrategyMasks, Strategy as StrategyTrait};

    /// Test double emitting signals at fixed bars, independent of prices.
    struct FixedBars(Vec<usize>);

    impl StrategyTrait for FixedBars {
        fn name(&self) -> &'static str {
            "fixed_bars"
        }
        fn version(&self) -> &'static str {
            "fixed_bars/test"
        }
        fn required_indicators(&self, params: &StrategyParams) -> Vec<IndicatorSpec> {
            vec![IndicatorSpec::Atr {
                period: params.atr_period,
            }]
        }
        fn masks(
            &self,
            frame: &CoreFrame,
            _cache: &mut IndicatorCache,
            _params: &StrategyParams,
            _side: Side,
        ) -> Result<StrategyMasks> {
            let mut m = vec![false; frame.len()];
            for &i in &self.0 {
                m[i] = true;
            }
            Ok(StrategyMasks {
                trend_ok: m.clone(),
                pullback_ok: m.clone(),
                reversal_ok: m,
            })
        }
    }

    fn trending_frame(n: usize) -> CoreFrame {
        let closes: Vec<f64> = (0..n).map(|i| 1.1 + i as f64 * 0.0002).collect();
        CoreFrame {
            symbol: "EURUSD".into(),
            cadence_seconds: 3600,
            timestamp: (0..n as i64).map(|i| 1_700_000_000 + i * 3600).collect(),
            open: closes.clone(),
            high: closes.iter().map(|c| c + 0.0008).collect(),
            low: closes.iter().map(|c| c - 0.0008).collect(),
            close: closes,
            volume: vec![50.0; n],
            is_gap: vec![false; n],
        }
    }

    fn risk() -> RiskParams {
        RiskParams {
            pip_value: 10_000.0,
            ..RiskParams::default()
        }
    }

    #[test]
    fn signal_prices_ordered_for_longs() {
        let frame = trending_frame(120);
        let strategy = FixedBars(vec![40, 80]);
        let mut cache = IndicatorCache::new();
        let set = scan_direction(
            &frame,
            &strategy,
            &mut cache,
            &StrategyParams::default(),
            &risk(),
            Side::Long,
        )
        .unwrap();
        assert_eq!(set.len(), 2);
        for k in 0..set.len() {
            assert!(set.stop_price[k] < set.entry_price[k]);
            assert!(set.entry_price[k] < set.target_price[k]);
            assert!(set.size[k] > 0.0);
        }
    }

    #[test]
    fn short_prices_mirrored() {
        let frame = trending_frame(120);
        let strategy = FixedBars(vec![60]);
        let mut cache = IndicatorCache::new();
        let set = scan_direction(
            &frame,
            &strategy,
            &mut cache,
            &StrategyParams::default(),
            &risk(),
            Side::Short,
        )
        .unwrap();
        assert_eq!(set.len(), 1);
        assert!(set.target_price[0] < set.entry_price[0]);
        assert!(set.entry_price[0] < set.stop_price[0]);
    }

    #[test]
    fn target_placed_at_r_multiple() {
        let frame = trending_frame(120);
        let strategy = FixedBars(vec![50]);
        let mut cache = IndicatorCache::new();
        let mut r = risk();
        r.target_r_mult = 2.0;
        let set = scan_direction(
            &frame,
            &strategy,
            &mut cache,
            &StrategyParams::default(),
            &r,
            Side::Long,
        )
        .unwrap();
        let dist = set.entry_price[0] - set.stop_price[0];
        let reach = set.target_price[0] - set.entry_price[0];
        assert!((reach - 2.0 * dist).abs() < 1e-12);
    }

    #[test]
    fn cooldown_suppresses_adjacent_entries() {
        let frame = trending_frame(120);
        let strategy = FixedBars(vec![50, 52, 54, 70]);
        let mut cache = IndicatorCache::new();
        let mut params = StrategyParams::default();
        params.cooldown_bars = 10;
        let set = scan_direction(&frame, &strategy, &mut cache, &params, &risk(), Side::Long)
            .unwrap();
        assert_eq!(set.entry_idx, vec![50, 70]);
    }

    #[test]
    fn warmup_bars_not_eligible() {
        let frame = trending_frame(120);
        // Bar 5 is inside the ATR(14) warmup.
        let strategy = FixedBars(vec![5, 60]);
        let mut cache = IndicatorCache::new();
        let set = scan_direction(
            &frame,
            &strategy,
            &mut cache,
            &StrategyParams::default(),
            &risk(),
            Side::Long,
        )
        .unwrap();
        assert_eq!(set.entry_idx, vec![60]);
    }

    #[test]
    fn zero_size_signal_dropped() {
        let frame = trending_frame(120);
        let strategy = FixedBars(vec![60]);
        let mut cache = IndicatorCache::new();
        let mut r = risk();
        // Lot step far above what the equity can buy.
        r.lot_step = 1.0e9;
        let set = scan_direction(
            &frame,
            &strategy,
            &mut cache,
            &StrategyParams::default(),
            &r,
            Side::Long,
        )
        .unwrap();
        assert!(set.is_empty());
    }

    #[test]
    fn min_stop_distance_floors_tight_atr() {
        let frame = trending_frame(120);
        let strategy = FixedBars(vec![60]);
        let mut cache = IndicatorCache::new();
        let mut r = risk();
        r.min_stop_distance = 0.05; // far above the ~0.0016 ATR
        let set = scan_direction(
            &frame,
            &strategy,
            &mut cache,
            &StrategyParams::default(),
            &r,
            Side::Long,
        )
        .unwrap();
        let dist = set.entry_price[0] - set.stop_price[0];
        assert!((dist - 0.05).abs() < 1e-12);
    }

    #[test]
    fn unusable_stop_policy_is_risk_config_error() {
        let frame = trending_frame(120);
        let strategy = FixedBars(vec![60]);
        let mut cache = IndicatorCache::new();
        let mut r = risk();
        r.atr_mult = 0.0;
        r.min_stop_distance = 0.0;
        let err = scan_direction(
            &frame,
            &strategy,
            &mut cache,
            &StrategyParams::default(),
            &r,
            Side::Long,
        )
        .unwrap_err();
        let e = err.downcast_ref::<EngineError>().unwrap();
        assert_eq!(e.kind, crate::error::ErrorKind::RiskConfig);
    }

    #[test]
    fn atr_period_longer_than_frame_is_risk_config_error() {
        let frame = trending_frame(10);
        let strategy = FixedBars(vec![5]);
        let mut cache = IndicatorCache::new();
        let mut params = StrategyParams::default();
        params.atr_period = 50;
        let err = scan_direction(&frame, &strategy, &mut cache, &params, &risk(), Side::Long)
            .unwrap_err();
        let e = err.downcast_ref::<EngineError>().unwrap();
        assert_eq!(e.kind, crate::error::ErrorKind::RiskConfig);
    }

    #[test]
    fn sizes_capped_at_max_position() {
        let frame = trending_frame(120);
        let strategy = FixedBars(vec![60]);
        let mut cache = IndicatorCache::new();
        let mut r = risk();
        r.max_position = 0.05;
        let set = scan_direction(
            &frame,
            &strategy,
            &mut cache,
            &StrategyParams::default(),
            &r,
            Side::Long,
        )
        .unwrap();
        assert_eq!(set.size[0], 0.05);
    }

    #[test]
    fn direction_sides_cover_both() {
        // Direction::Both expands to a long and a short scan.
        assert_eq!(Direction::Both.sides().len(), 2);
    }
}
