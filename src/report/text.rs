use std::fmt::Write as _;

use ordered_float::OrderedFloat;

use super::{RunReport, TIE_BREAK_POLICY};
use crate::engine::metrics::MetricsSummary;

/// Trades shown in the optional top-trades section.
const TOP_K_TRADES: usize = 5;

/// Fixed human-readable layout: metadata block, per-direction metrics tables,
/// combined table, conflict count, optional top-K trades, policy footer.
pub fn render(report: &RunReport) -> String {
    let mut out = String::new();
    let meta = &report.run_metadata;

    let _ = writeln!(out, "==============================================");
    let _ = writeln!(out, "  FXLAB BACKTEST REPORT");
    let _ = writeln!(out, "==============================================");
    let _ = writeln!(out, "  Run ID        : {}", meta.run_id);
    let _ = writeln!(out, "  Started       : {}", meta.started_at.to_rfc3339());
    let _ = writeln!(out, "  Ended         : {}", meta.ended_at.to_rfc3339());
    let _ = writeln!(out, "  Direction     : {}", meta.direction.label());
    let _ = writeln!(out, "  Symbols       : {}", meta.symbols.join(", "));
    let _ = writeln!(out, "  Manifest Hash : {}", meta.manifest_hash);
    let _ = writeln!(out, "----------------------------------------------");

    if let Some(long) = &report.metrics.long_only {
        render_metrics(&mut out, "LONG ONLY", long);
    }
    if let Some(short) = &report.metrics.short_only {
        render_metrics(&mut out, "SHORT ONLY", short);
    }
    render_metrics(&mut out, "COMBINED", &report.metrics.combined);

    let _ = writeln!(out, "----------------------------------------------");
    let _ = writeln!(out, "  Conflicts     : {}", report.conflicts.len());
    let _ = writeln!(out, "  Failures      : {}", report.failures.len());

    if let Some(executions) = &report.executions {
        if !executions.is_empty() {
            let mut ranked: Vec<_> = executions.iter().collect();
            ranked.sort_by_key(|e| std::cmp::Reverse(OrderedFloat(e.pnl_r)));
            let _ = writeln!(out, "  Top trades:");
            for (rank, e) in ranked.iter().take(TOP_K_TRADES).enumerate() {
                let _ = writeln!(
                    out,
                    "    {}. {:+.2}R {} {:?} {} -> {}",
                    rank + 1,
                    e.pnl_r,
                    e.symbol,
                    e.side,
                    e.entry_time.format("%Y-%m-%d %H:%M"),
                    e.exit_time.format("%Y-%m-%d %H:%M"),
                );
            }
        }
    }

    let _ = writeln!(out, "----------------------------------------------");
    let _ = writeln!(out, "  Exit tie-break policy: {TIE_BREAK_POLICY}");
    let _ = writeln!(out, "==============================================");
    out
}

fn render_metrics(out: &mut String, title: &str, m: &MetricsSummary) {
    let _ = writeln!(out, "  {title}");
    let _ = writeln!(out, "    Trades        : {}", m.trade_count);
    let _ = writeln!(out, "    Wins / Losses : {} / {}", m.wins, m.losses);
    let _ = writeln!(out, "    Win Rate      : {}", fmt_pct(m.win_rate));
    let _ = writeln!(out, "    Avg R         : {}", fmt_opt(m.avg_r));
    let _ = writeln!(out, "    Expectancy    : {}", fmt_opt(m.expectancy));
    let _ = writeln!(out, "    Profit Factor : {}", fmt_opt(m.profit_factor));
    let _ = writeln!(out, "    Max DD (R)    : {:.3}", m.max_drawdown_r);
    let _ = writeln!(out, "    Sharpe (est.) : {}", fmt_opt(m.sharpe));
}

fn fmt_opt(v: Option<f64>) -> String {
    match v {
        Some(x) => format!("{x:.3}"),
        None => "-".to_string(),
    }
}

fn fmt_pct(v: Option<f64>) -> String {
    match v {
        Some(x) => format!("{:.1}%", x * 100.0),
        None => "-".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bench::{BenchmarkRecord, PhaseTimes};
    use crate::engine::metrics::DirectionalMetrics;
    use crate::engine::types::Direction;
    use crate::report::RunMetadata;
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;

    fn minimal_report() -> RunReport {
        RunReport {
            run_metadata: RunMetadata {
                run_id: "test-run".into(),
                started_at: Utc.with_ymd_and_hms(2024, 3, 5, 14, 0, 0).unwrap(),
                ended_at: Utc.with_ymd_and_hms(2024, 3, 5, 14, 0, 5).unwrap(),
                direction: Direction::Long,
                symbols: vec!["EURUSD".into()],
                manifest_hash: "deadbeef".into(),
            },
            metrics: DirectionalMetrics::from_trades(Direction::Long, &[]),
            per_symbol: BTreeMap::new(),
            signals: None,
            executions: None,
            conflicts: vec![],
            failures: vec![],
            benchmark: BenchmarkRecord::new(0, 0, PhaseTimes::default(), 0.0, 0, 0, 1.0, vec![]),
            snapshot_path: None,
        }
    }

    #[test]
    fn footer_documents_tie_break_policy() {
        let rendered = render(&minimal_report());
        assert!(rendered.contains(TIE_BREAK_POLICY));
    }

    #[test]
    fn metadata_block_present() {
        let rendered = render(&minimal_report());
        assert!(rendered.contains("Run ID"));
        assert!(rendered.contains("deadbeef"));
        assert!(rendered.contains("EURUSD"));
    }

    #[test]
    fn undefined_metrics_render_as_dash() {
        let rendered = render(&minimal_report());
        assert!(rendered.contains("Profit Factor : -"));
    }

    #[test]
    fn single_direction_omits_other_side() {
        let rendered = render(&minimal_report());
        assert!(rendered.contains("LONG ONLY"));
        assert!(!rendered.contains("SHORT ONLY"));
        assert!(rendered.contains("COMBINED"));
    }
}
