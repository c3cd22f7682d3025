pub mod pullback;

use anyhow::Result;

use crate::data::CoreFrame;
use crate::engine::types::{Side, StrategyParams};
use crate::indicators::{IndicatorCache, IndicatorSpec};

/// Direction-specific boolean columns a strategy hands the scanner. A signal
/// fires where all three are true (plus the scanner-owned cooldown gate).
#[derive(Debug, Clone)]
pub struct StrategyMasks {
    pub trend_ok: Vec<bool>,
    pub pullback_ok: Vec<bool>,
    pub reversal_ok: Vec<bool>,
}

impl StrategyMasks {
    pub fn len(&self) -> usize {
        self.trend_ok.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trend_ok.is_empty()
    }
}

/// Strategy capability: declares the indicators it needs and produces
/// per-direction masks. Strategies never touch the simulator and carry no
/// risk logic; the scanner owns stop/target/size parameterization.
pub trait Strategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Version string folded into the manifest hash.
    fn version(&self) -> &'static str;

    fn required_indicators(&self, params: &StrategyParams) -> Vec<IndicatorSpec>;

    fn masks(
        &self,
        frame: &CoreFrame,
        cache: &mut IndicatorCache,
        params: &StrategyParams,
        side: Side,
    ) -> Result<StrategyMasks>;
}

pub fn all_strategies() -> Vec<Box<dyn Strategy>> {
    vec![Box::new(pullback::EmaPullback)]
}

pub fn find_strategy(name: &str) -> Option<Box<dyn Strategy>> {
    all_strategies().into_iter().find(|s| s.name() == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_strategy_known() {
        let s = find_strategy("ema_pullback");
        assert!(s.is_some());
        assert_eq!(s.unwrap().name(), "ema_pullback");
    }

    #[test]
    fn find_strategy_unknown_returns_none() {
        assert!(find_strategy("nonexistent").is_none());
    }

    #[test]
    fn all_strategies_have_unique_names() {
        let strategies = all_strategies();
        let mut names: Vec<&str> = strategies.iter().map(|s| s.name()).collect();
        let total = names.len();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), total);
    }

    #[test]
    fn all_strategies_declare_indicators() {
        let params = StrategyParams::default();
        for s in all_strategies() {
            assert!(
                !s.required_indicators(&params).is_empty(),
                "strategy '{}' declares no indicators",
                s.name()
            );
        }
    }
}
