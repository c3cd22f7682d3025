use anyhow::Result;

use super::types::TradeResult;
use crate::error::EngineError;

/// Canonical fidelity tolerances: absolute exit price, relative PnL, and the
/// exit index must match exactly. One set, used everywhere.
pub const ABS_PRICE_TOL: f64 = 1e-6;
pub const REL_PNL_TOL: f64 = 1e-4;

/// Compare the vectorized simulator's output against the per-trade reference.
/// The first divergent trade fails the run; fidelity errors are never
/// swallowed.
pub fn check_fidelity(
    symbol: &str,
    vectorized: &[TradeResult],
    reference: &[TradeResult],
) -> Result<()> {
    if vectorized.len() != reference.len() {
        return Err(EngineError::fidelity(
            symbol,
            format!(
                "trade count mismatch: vectorized {} vs reference {}",
                vectorized.len(),
                reference.len()
            ),
        )
        .into());
    }

    for (k, (v, r)) in vectorized.iter().zip(reference.iter()).enumerate() {
        if v.exit_idx != r.exit_idx {
            return Err(EngineError::fidelity(
                symbol,
                format!(
                    "trade {k}: exit_idx diverged (vectorized {} vs reference {})",
                    v.exit_idx, r.exit_idx
                ),
            )
            .into());
        }
        if (v.exit_price - r.exit_price).abs() > ABS_PRICE_TOL {
            return Err(EngineError::fidelity(
                symbol,
                format!(
                    "trade {k}: exit_price diverged by {} (tolerance {ABS_PRICE_TOL})",
                    (v.exit_price - r.exit_price).abs()
                ),
            )
            .into());
        }
        let denom = r.pnl_r.abs().max(1.0);
        if (v.pnl_r - r.pnl_r).abs() / denom > REL_PNL_TOL {
            return Err(EngineError::fidelity(
                symbol,
                format!(
                    "trade {k}: pnl_r diverged (vectorized {} vs reference {})",
                    v.pnl_r, r.pnl_r
                ),
            )
            .into());
        }
    }
    Ok(())
}
