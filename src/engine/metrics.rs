use serde::Serialize;

use super::types::{Direction, TradeResult};

/// Aggregate performance of a trade list, in R-multiples.
///
/// Ratios whose denominator is zero are an explicit `None` ("undefined"),
/// never NaN: the JSON layer writes them as null and the text layer as a
/// dash. `max_drawdown_r` is always defined (zero for an empty list).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSummary {
    pub trade_count: usize,
    pub wins: usize,
    pub losses: usize,
    pub win_rate: Option<f64>,
    pub avg_r: Option<f64>,
    pub expectancy: Option<f64>,
    pub profit_factor: Option<f64>,
    pub max_drawdown_r: f64,
    pub sharpe: Option<f64>,
}

impl MetricsSummary {
    pub const EMPTY: MetricsSummary = MetricsSummary {
        trade_count: 0,
        wins: 0,
        losses: 0,
        win_rate: None,
        avg_r: None,
        expectancy: None,
        profit_factor: None,
        max_drawdown_r: 0.0,
        sharpe: None,
    };
}

/// Per-direction breakdown. Single-sided runs omit the unused side entirely
/// rather than null-filling it; `combined` is always present.
#[derive(Debug, Clone, Serialize)]
pub struct DirectionalMetrics {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub long_only: Option<MetricsSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub short_only: Option<MetricsSummary>,
    pub combined: MetricsSummary,
}

impl DirectionalMetrics {
    /// Split `trades` by side according to the run direction and summarize.
    pub fn from_trades(direction: Direction, trades: &[TradeResult]) -> Self {
        let longs: Vec<&TradeResult> = trades.iter().filter(|t| t.side.signum() > 0).collect();
        let shorts: Vec<&TradeResult> = trades.iter().filter(|t| t.side.signum() < 0).collect();

        let long_only = match direction {
            Direction::Long | Direction::Both => Some(summarize_refs(&longs)),
            Direction::Short => None,
        };
        let short_only = match direction {
            Direction::Short | Direction::Both => Some(summarize_refs(&shorts)),
            Direction::Long => None,
        };

        Self {
            long_only,
            short_only,
            combined: summarize(trades),
        }
    }
}

pub fn summarize(trades: &[TradeResult]) -> MetricsSummary {
    let refs: Vec<&TradeResult> = trades.iter().collect();
    summarize_refs(&refs)
}

fn summarize_refs(trades: &[&TradeResult]) -> MetricsSummary {
    if trades.is_empty() {
        return MetricsSummary::EMPTY;
    }

    let total = trades.len();
    let mut wins = 0usize;
    let mut losses = 0usize;
    let mut win_sum = 0.0f64;
    let mut loss_sum = 0.0f64;
    let mut pnl_sum = 0.0f64;

    for t in trades {
        pnl_sum += t.pnl_r;
        if t.pnl_r > 0.0 {
            wins += 1;
            win_sum += t.pnl_r;
        } else if t.pnl_r < 0.0 {
            losses += 1;
            loss_sum += t.pnl_r;
        }
        // Zero-R scratch trades count toward the total only.
    }

    let win_rate = Some(wins as f64 / total as f64);
    let avg_r = Some(pnl_sum / total as f64);

    let avg_winner = if wins > 0 {
        Some(win_sum / wins as f64)
    } else {
        None
    };
    let avg_loser = if losses > 0 {
        Some(loss_sum / losses as f64)
    } else {
        None
    };
    // Expectancy per trade: p(win)·avg_win + p(loss)·avg_loss.
    let expectancy = Some(
        win_rate.unwrap() * avg_winner.unwrap_or(0.0)
            + (losses as f64 / total as f64) * avg_loser.unwrap_or(0.0),
    );

    let profit_factor = if loss_sum < 0.0 {
        Some(win_sum / loss_sum.abs())
    } else {
        // No losing trades: the ratio is undefined, not infinite.
        None
    };

    let max_drawdown_r = max_drawdown(trades);

    let sharpe = if total >= 2 {
        let returns: Vec<f64> = trades.iter().map(|t| t.pnl_r).collect();
        let std = std_dev(&returns);
        if std > 0.0 {
            Some(avg_r.unwrap() / std)
        } else {
            None
        }
    } else {
        None
    };

    MetricsSummary {
        trade_count: total,
        wins,
        losses,
        win_rate,
        avg_r,
        expectancy,
        profit_factor,
        max_drawdown_r,
        sharpe,
    }
}

/// Peak-to-trough fall of the cumulative R curve, reported positive.
fn max_drawdown(trades: &[&TradeResult]) -> f64 {
    let mut equity = 0.0f64;
    let mut peak = 0.0f64;
    let mut max_dd = 0.0f64;
    for t in trades {
        equity += t.pnl_r;
        if equity > peak {
            peak = equity;
        }
        let dd = peak - equity;
        if dd > max_dd {
            max_dd = dd;
        }
    }
    max_dd
}

fn std_dev(data: &[f64]) -> f64 {
    if data.len() < 2 {
        return 0.0;
    }
    let mean = data.iter().sum::<f64>() / data.len() as f64;
    let variance = data.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (data.len() - 1) as f64;
    variance.sqrt()
}
