use anyhow::Result;

use super::{Strategy, StrategyMasks};
use crate::data::CoreFrame;
use crate::engine::types::{Side, StrategyParams};
use crate::indicators::{IndicatorCache, IndicatorSpec};

/// EMA-trend pullback strategy.
///
/// Long setup: fast EMA above slow EMA, the prior bar pulled back to touch
/// the fast EMA with RSI below the oversold threshold, and the current bar
/// closes above the prior high. Shorts mirror every condition.
///
/// Comparisons against NaN warmup values are false, so masks are silently
/// inert until every indicator involved is defined.
pub struct EmaPullback;

impl Strategy for EmaPullback {
    fn name(&self) -> &'static str {
        "ema_pullback"
    }

    fn version(&self) -> &'static str {
        "ema_pullback/1"
    }

    fn required_indicators(&self, params: &StrategyParams) -> Vec<IndicatorSpec> {
        vec![
            IndicatorSpec::Ema {
                period: params.ema_fast,
            },
            IndicatorSpec::Ema {
                period: params.ema_slow,
            },
            IndicatorSpec::Rsi {
                period: params.rsi_period,
            },
            IndicatorSpec::Atr {
                period: params.atr_period,
            },
        ]
    }

    fn masks(
        &self,
        frame: &CoreFrame,
        cache: &mut IndicatorCache,
        params: &StrategyParams,
        side: Side,
    ) -> Result<StrategyMasks> {
        let n = frame.len();
        let ema_fast = cache.get(
            frame,
            IndicatorSpec::Ema {
                period: params.ema_fast,
            },
        )?;
        let ema_slow = cache.get(
            frame,
            IndicatorSpec::Ema {
                period: params.ema_slow,
            },
        )?;
        let rsi = cache.get(
            frame,
            IndicatorSpec::Rsi {
                period: params.rsi_period,
            },
        )?;

        let mut trend_ok = vec![false; n];
        let mut pullback_ok = vec![false; n];
        let mut reversal_ok = vec![false; n];

        match side {
            Side::Long => {
                for i in 0..n {
                    trend_ok[i] = ema_fast[i] > ema_slow[i];
                }
                for i in 1..n {
                    pullback_ok[i] =
                        frame.low[i - 1] <= ema_fast[i - 1] && rsi[i - 1] < params.rsi_oversold;
                    reversal_ok[i] = frame.close[i] > frame.high[i - 1];
                }
            }
            Side::Short => {
                for i in 0..n {
                    trend_ok[i] = ema_fast[i] < ema_slow[i];
                }
                for i in 1..n {
                    pullback_ok[i] =
                        frame.high[i - 1] >= ema_fast[i - 1] && rsi[i - 1] > params.rsi_overbought;
                    reversal_ok[i] = frame.close[i] < frame.low[i - 1];
                }
            }
        }

        Ok(StrategyMasks {
            trend_ok,
            pullback_ok,
            reversal_ok,
        })
    }
}
