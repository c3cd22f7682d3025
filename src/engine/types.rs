use std::path::PathBuf;

use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};

use crate::data::ReadMode;
use crate::error::Phase;

/// Trade direction of a single signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Long = 1,
    Short = -1,
}

impl Side {
    pub fn multiplier(self) -> f64 {
        match self {
            Side::Long => 1.0,
            Side::Short => -1.0,
        }
    }

    pub fn signum(self) -> i8 {
        match self {
            Side::Long => 1,
            Side::Short => -1,
        }
    }
}

/// Direction a run scans for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Long,
    Short,
    #[default]
    Both,
}

impl Direction {
    pub fn label(self) -> &'static str {
        match self {
            Direction::Long => "long",
            Direction::Short => "short",
            Direction::Both => "both",
        }
    }

    /// Sides this run direction scans.
    pub fn sides(self) -> &'static [Side] {
        match self {
            Direction::Long => &[Side::Long],
            Direction::Short => &[Side::Short],
            Direction::Both => &[Side::Long, Side::Short],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    #[default]
    Single,
    Independent,
    Portfolio,
}

/// Why a trade left the market.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    #[serde(rename = "TP")]
    Tp,
    #[serde(rename = "SL")]
    Sl,
    #[serde(rename = "END_OF_DATA")]
    EndOfData,
    #[serde(rename = "EXPIRY")]
    Expiry,
}

/// One symbol's input dataset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetSpec {
    pub symbol: String,
    pub path: PathBuf,
}

fn validate_slow_gt_fast(fast: &usize) -> impl FnOnce(&usize, &()) -> garde::Result + '_ {
    move |slow: &usize, (): &()| {
        if slow <= fast {
            return Err(garde::Error::new(format!(
                "ema_slow ({slow}) must be greater than ema_fast ({fast})"
            )));
        }
        Ok(())
    }
}

/// Parameters the reference strategies read. Strategy-specific knobs stay
/// here rather than on the engine; the scanner only sees the masks.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct StrategyParams {
    #[garde(range(min = 1))]
    pub ema_fast: usize,
    #[garde(range(min = 2), custom(validate_slow_gt_fast(&self.ema_fast)))]
    pub ema_slow: usize,
    #[garde(range(min = 1))]
    pub rsi_period: usize,
    #[garde(range(min = 0.0, max = 100.0))]
    pub rsi_oversold: f64,
    #[garde(range(min = 0.0, max = 100.0))]
    pub rsi_overbought: f64,
    #[garde(range(min = 1))]
    pub atr_period: usize,
    #[garde(skip)]
    pub cooldown_bars: usize,
}

impl Default for StrategyParams {
    fn default() -> Self {
        Self {
            ema_fast: 20,
            ema_slow: 50,
            rsi_period: 14,
            rsi_oversold: 30.0,
            rsi_overbought: 70.0,
            atr_period: 14,
            cooldown_bars: 5,
        }
    }
}

/// Per-signal risk parameterization: stop distance from ATR, target as an R
/// multiple, size from fixed-fractional risk.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RiskParams {
    #[garde(range(min = 0.0))]
    pub atr_mult: f64,
    #[garde(range(min = 0.0))]
    pub min_stop_distance: f64,
    #[garde(range(min = 0.1))]
    pub target_r_mult: f64,
    #[garde(range(min = 0.01))]
    pub account_equity: f64,
    #[garde(range(min = 0.000_01, max = 1.0))]
    pub risk_per_trade: f64,
    /// Price increment of one pip (0.0001 for most FX pairs); converts
    /// `fee_pips` into price units.
    #[garde(range(min = 0.000_000_1))]
    pub pip_size: f64,
    /// Account-currency value of a one-price-unit move for one unit of size;
    /// the sizing denominator is `stop_distance × pip_value`.
    #[garde(range(min = 0.000_001))]
    pub pip_value: f64,
    #[garde(range(min = 0.000_001))]
    pub lot_step: f64,
    #[garde(range(min = 0.000_001))]
    pub max_position: f64,
    /// Round-trip cost deducted from the PnL numerator, in pips.
    #[garde(range(min = 0.0))]
    pub fee_pips: f64,
    /// Bars after which an open trade is closed at that bar's close (EXPIRY).
    #[garde(inner(range(min = 1)))]
    pub max_hold_bars: Option<usize>,
}

impl Default for RiskParams {
    fn default() -> Self {
        Self {
            atr_mult: 1.5,
            min_stop_distance: 0.0005,
            target_r_mult: 2.0,
            account_equity: 10_000.0,
            risk_per_trade: 0.01,
            pip_size: 0.0001,
            pip_value: 10.0,
            lot_step: 0.01,
            max_position: 50.0,
            fee_pips: 0.0,
            max_hold_bars: None,
        }
    }
}

fn validate_portion(data_frac: &f64) -> impl FnOnce(&usize, &()) -> garde::Result + '_ {
    move |portion: &usize, (): &()| {
        let max_portion = (1.0 / data_frac).ceil() as usize;
        if *portion < 1 || *portion > max_portion {
            return Err(garde::Error::new(format!(
                "portion ({portion}) must be in [1, {max_portion}] for data_frac {data_frac}"
            )));
        }
        Ok(())
    }
}

/// Run-level switches and knobs.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RunFlags {
    #[garde(skip)]
    pub profile: bool,
    #[garde(skip)]
    pub deterministic: bool,
    #[garde(skip)]
    pub dry_run: bool,
    /// Contiguous chronological fraction of each dataset to run on.
    #[garde(range(min = 0.000_001, max = 1.0))]
    pub data_frac: f64,
    /// Which 1-based slice of length `data_frac` to select.
    #[garde(custom(validate_portion(&self.data_frac)))]
    pub portion: usize,
    #[garde(range(min = 1))]
    pub snapshot_interval: usize,
    #[garde(range(min = -1.0, max = 1.0))]
    pub correlation_threshold: f64,
    #[garde(range(min = 1))]
    pub expected_cadence_seconds: i64,
    #[garde(skip)]
    pub include_signals: bool,
    #[garde(skip)]
    pub include_executions: bool,
    #[garde(skip)]
    pub downcast: bool,
    #[garde(skip)]
    pub read_mode: ReadMode,
    /// Portfolio-level cap on summed risk as a fraction of capital.
    #[garde(range(min = 0.0, max = 1.0))]
    pub max_exposure: f64,
    #[garde(range(min = 0.0))]
    pub correlation_penalty_coef: f64,
    #[garde(range(min = 0))]
    pub allocation_rounding_dp: u32,
    /// Directory snapshots and reports are written into, when requested.
    #[garde(skip)]
    pub output_dir: Option<PathBuf>,
}

impl Default for RunFlags {
    fn default() -> Self {
        Self {
            profile: false,
            deterministic: false,
            dry_run: false,
            data_frac: 1.0,
            portion: 1,
            snapshot_interval: 50,
            correlation_threshold: 0.7,
            expected_cadence_seconds: 3600,
            include_signals: false,
            include_executions: false,
            downcast: false,
            read_mode: ReadMode::Columnar,
            max_exposure: 0.5,
            correlation_penalty_coef: 0.5,
            allocation_rounding_dp: 2,
            output_dir: None,
        }
    }
}

/// The single entry-point request: datasets + strategy + risk + flags in,
/// [`crate::report::RunReport`] out.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RunRequest {
    #[garde(skip)]
    pub mode: RunMode,
    #[garde(skip)]
    pub direction: Direction,
    #[garde(length(min = 1))]
    pub datasets: Vec<DatasetSpec>,
    #[garde(length(min = 1))]
    pub strategy: String,
    #[garde(dive)]
    pub strategy_params: StrategyParams,
    #[garde(dive)]
    pub risk: RiskParams,
    #[garde(dive)]
    pub flags: RunFlags,
}

/// Columnar scanner output for one direction. Entry indices are strictly
/// increasing; every column is aligned with every other.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SignalSet {
    pub entry_idx: Vec<usize>,
    pub side: Vec<i8>,
    pub entry_price: Vec<f64>,
    pub stop_price: Vec<f64>,
    pub target_price: Vec<f64>,
    pub size: Vec<f64>,
}

impl SignalSet {
    pub fn len(&self) -> usize {
        self.entry_idx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entry_idx.is_empty()
    }

    pub fn push(
        &mut self,
        entry_idx: usize,
        side: Side,
        entry_price: f64,
        stop_price: f64,
        target_price: f64,
        size: f64,
    ) {
        self.entry_idx.push(entry_idx);
        self.side.push(side.signum());
        self.entry_price.push(entry_price);
        self.stop_price.push(stop_price);
        self.target_price.push(target_price);
        self.size.push(size);
    }

    /// Drop the signals at the given (sorted, deduplicated) positions.
    pub fn remove_positions(&mut self, positions: &[usize]) {
        if positions.is_empty() {
            return;
        }
        let mut keep = vec![true; self.len()];
        for &p in positions {
            if p < keep.len() {
                keep[p] = false;
            }
        }
        fn retain_masked<T: Copy>(values: &mut Vec<T>, keep: &[bool]) {
            let mut i = 0;
            values.retain(|_| {
                let k = keep[i];
                i += 1;
                k
            });
        }
        retain_masked(&mut self.entry_idx, &keep);
        retain_masked(&mut self.side, &keep);
        retain_masked(&mut self.entry_price, &keep);
        retain_masked(&mut self.stop_price, &keep);
        retain_masked(&mut self.target_price, &keep);
        retain_masked(&mut self.size, &keep);
    }
}

/// One simulated trade, in signal order.
#[derive(Debug, Clone, Serialize)]
pub struct TradeResult {
    pub entry_idx: usize,
    pub exit_idx: usize,
    pub side: Side,
    pub entry_price: f64,
    pub stop_price: f64,
    pub target_price: f64,
    pub exit_price: f64,
    pub exit_reason: ExitReason,
    pub pnl_r: f64,
    pub duration_bars: usize,
    pub size: f64,
    pub trailing_used: bool,
}

/// Emitted when a long and a short signal land on the same bar of the same
/// symbol in a BOTH-direction run; both signals are rejected.
#[derive(Debug, Clone, Serialize)]
pub struct ConflictEvent {
    pub timestamp: DateTime<Utc>,
    pub symbol: String,
    pub resolution: &'static str,
}

impl ConflictEvent {
    pub const RESOLUTION: &'static str = "REJECTED_BOTH";

    pub fn rejected_both(epoch_seconds: i64, symbol: &str) -> Self {
        Self {
            timestamp: ts_to_datetime(epoch_seconds),
            symbol: symbol.to_string(),
            resolution: Self::RESOLUTION,
        }
    }
}

/// Emitted when a symbol is isolated mid-run.
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeFailureEvent {
    pub symbol: String,
    pub reason: String,
    pub phase: Phase,
    pub timestamp: DateTime<Utc>,
}

pub fn ts_to_datetime(epoch_seconds: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(epoch_seconds, 0).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> RunRequest {
        RunRequest {
            mode: RunMode::Single,
            direction: Direction::Long,
            datasets: vec![DatasetSpec {
                symbol: "EURUSD".into(),
                path: PathBuf::from("eurusd.csv"),
            }],
            strategy: "ema_pullback".into(),
            strategy_params: StrategyParams::default(),
            risk: RiskParams::default(),
            flags: RunFlags::default(),
        }
    }

    #[test]
    fn default_request_validates() {
        assert!(request().validate().is_ok());
    }

    #[test]
    fn zero_data_frac_rejected() {
        let mut req = request();
        req.flags.data_frac = 0.0;
        assert!(req.validate().is_err());
    }

    #[test]
    fn portion_beyond_fraction_count_rejected() {
        let mut req = request();
        req.flags.data_frac = 0.25;
        req.flags.portion = 5; // only 4 quarters exist
        assert!(req.validate().is_err());
    }

    #[test]
    fn portion_within_bounds_accepted() {
        let mut req = request();
        req.flags.data_frac = 0.25;
        req.flags.portion = 4;
        assert!(req.validate().is_ok());
    }

    #[test]
    fn slow_ema_must_exceed_fast() {
        let mut req = request();
        req.strategy_params.ema_fast = 50;
        req.strategy_params.ema_slow = 20;
        assert!(req.validate().is_err());
    }

    #[test]
    fn empty_dataset_list_rejected() {
        let mut req = request();
        req.datasets.clear();
        assert!(req.validate().is_err());
    }

    #[test]
    fn non_positive_risk_rejected() {
        let mut req = request();
        req.risk.risk_per_trade = 0.0;
        assert!(req.validate().is_err());
    }

    #[test]
    fn side_multipliers() {
        assert_eq!(Side::Long.multiplier(), 1.0);
        assert_eq!(Side::Short.multiplier(), -1.0);
        assert_eq!(Side::Short.signum(), -1);
    }

    #[test]
    fn direction_sides() {
        assert_eq!(Direction::Long.sides(), &[Side::Long]);
        assert_eq!(Direction::Both.sides().len(), 2);
    }

    #[test]
    fn exit_reason_serializes_to_wire_names() {
        assert_eq!(
            serde_json::to_string(&ExitReason::EndOfData).unwrap(),
            "\"END_OF_DATA\""
        );
        assert_eq!(serde_json::to_string(&ExitReason::Tp).unwrap(), "\"TP\"");
    }

    #[test]
    fn signal_set_remove_positions() {
        let mut set = SignalSet::default();
        for i in 0..5 {
            set.push(i * 10, Side::Long, 1.0, 0.99, 1.02, 1.0);
        }
        set.remove_positions(&[1, 3]);
        assert_eq!(set.entry_idx, vec![0, 20, 40]);
        assert_eq!(set.size.len(), 3);
    }

    #[test]
    fn conflict_event_resolution_constant() {
        let c = ConflictEvent::rejected_both(1_700_000_000, "EURUSD");
        assert_eq!(c.resolution, "REJECTED_BOTH");
        assert_eq!(c.symbol, "EURUSD");
    }
}
