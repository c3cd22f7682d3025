use std::collections::BTreeMap;

use anyhow::Result;
use serde::Serialize;

use crate::error::{EngineError, Phase};

/// Tolerance on user-supplied base weights summing to one.
const WEIGHT_SUM_TOL: f64 = 1e-6;

/// Inputs to one allocation round. Correlations are keyed `"AAA:BBB"` with
/// the two symbols in lexicographic order; absent pairs count as zero.
#[derive(Debug, Clone)]
pub struct AllocationRequest {
    pub symbols: Vec<String>,
    pub volatility: BTreeMap<String, f64>,
    pub correlations: BTreeMap<String, f64>,
    pub base_weights: Option<BTreeMap<String, f64>>,
    pub capital: f64,
    pub penalty_coef: f64,
    pub rounding_dp: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct AllocationResponse {
    pub allocations: BTreeMap<String, f64>,
    pub diversification_ratio: f64,
    pub correlation_penalty: f64,
}

/// Deterministic capital allocation with a correlation penalty.
///
/// Base weights (equal unless supplied) are shrunk by
/// `1 + Σ_j max(0, |corr_ij|) · penalty_coef`, renormalized, converted to
/// integer units of `10^-rounding_dp`, and settled by largest remainder so
/// the allocations sum to `capital` exactly at the requested precision.
/// Symbols are iterated in sorted order throughout; same inputs, same bits.
pub fn allocate(req: &AllocationRequest) -> Result<AllocationResponse> {
    if req.symbols.is_empty() {
        return Err(err("EmptySymbolSet: no enabled symbols to allocate across").into());
    }
    if req.capital < 0.0 {
        return Err(err(format!("NegativeCapital: {}", req.capital)).into());
    }

    let mut symbols = req.symbols.clone();
    symbols.sort_unstable();

    for s in &symbols {
        match req.volatility.get(s) {
            Some(v) if *v > 0.0 => {}
            Some(v) => {
                return Err(err(format!("VolatilityNonPositive: {s} has volatility {v}")).into())
            }
            None => return Err(err(format!("VolatilityNonPositive: {s} missing")).into()),
        }
    }

    let n = symbols.len();
    let base: Vec<f64> = match &req.base_weights {
        Some(weights) => {
            let sum: f64 = weights.values().sum();
            if (sum - 1.0).abs() > WEIGHT_SUM_TOL {
                return Err(err(format!("WeightsDoNotSum: base weights sum to {sum}")).into());
            }
            symbols
                .iter()
                .map(|s| weights.get(s).copied().unwrap_or(0.0))
                .collect()
        }
        None => vec![1.0 / n as f64; n],
    };

    // Correlation penalty: shrink each weight by its summed positive
    // correlation exposure, then renormalize.
    let corr = |a: &str, b: &str| -> f64 {
        let key = if a < b {
            format!("{a}:{b}")
        } else {
            format!("{b}:{a}")
        };
        req.correlations.get(&key).copied().unwrap_or(0.0)
    };

    let mut penalties = Vec::with_capacity(n);
    let mut effective = Vec::with_capacity(n);
    for (i, s) in symbols.iter().enumerate() {
        let exposure: f64 = symbols
            .iter()
            .enumerate()
            .filter(|(j, _)| *j != i)
            .map(|(_, other)| corr(s, other).abs().max(0.0))
            .sum();
        let penalty = exposure * req.penalty_coef;
        penalties.push(penalty);
        effective.push(base[i] / (1.0 + penalty));
    }
    let total_effective: f64 = effective.iter().sum();
    let weights: Vec<f64> = if total_effective > 0.0 {
        effective.iter().map(|w| w / total_effective).collect()
    } else {
        vec![1.0 / n as f64; n]
    };

    // Largest-remainder settlement in integer units of 10^-dp.
    let scale = 10f64.powi(req.rounding_dp as i32);
    let total_units = (req.capital * scale).round() as i64;
    let ideal: Vec<f64> = weights.iter().map(|w| w * total_units as f64).collect();
    let mut units: Vec<i64> = ideal.iter().map(|u| u.floor() as i64).collect();
    let assigned: i64 = units.iter().sum();
    let mut residual = total_units - assigned;

    // Hand leftover units to the largest fractional remainders; ties resolve
    // by symbol order so the result is input-order independent.
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| {
        let fa = ideal[a] - ideal[a].floor();
        let fb = ideal[b] - ideal[b].floor();
        fb.partial_cmp(&fa)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| symbols[a].cmp(&symbols[b]))
    });
    let mut k = 0usize;
    while residual > 0 {
        units[order[k % n]] += 1;
        residual -= 1;
        k += 1;
    }

    let allocations: BTreeMap<String, f64> = symbols
        .iter()
        .zip(units.iter())
        .map(|(s, &u)| (s.clone(), u as f64 / scale))
        .collect();

    let diversification_ratio = diversification_ratio(&symbols, &weights, &req.volatility, corr);
    let correlation_penalty = penalties.iter().sum::<f64>() / n as f64;

    Ok(AllocationResponse {
        allocations,
        diversification_ratio,
        correlation_penalty,
    })
}

/// Portfolio volatility over the weighted average of individual volatilities,
/// capped into `[0, 1]` against noisy inputs.
fn diversification_ratio(
    symbols: &[String],
    weights: &[f64],
    volatility: &BTreeMap<String, f64>,
    corr: impl Fn(&str, &str) -> f64,
) -> f64 {
    let vols: Vec<f64> = symbols
        .iter()
        .map(|s| volatility.get(s).copied().unwrap_or(0.0))
        .collect();

    let weighted_avg: f64 = weights.iter().zip(vols.iter()).map(|(w, v)| w * v).sum();
    if weighted_avg <= 0.0 {
        return 0.0;
    }

    let mut variance = 0.0;
    for i in 0..symbols.len() {
        for j in 0..symbols.len() {
            let c = if i == j {
                1.0
            } else {
                corr(&symbols[i], &symbols[j])
            };
            variance += weights[i] * weights[j] * vols[i] * vols[j] * c;
        }
    }
    let portfolio_vol = variance.max(0.0).sqrt();
    (portfolio_vol / weighted_avg).clamp(0.0, 1.0)
}

fn err(message: impl Into<String>) -> EngineError {
    EngineError::input(Phase::Allocate, message)
}
