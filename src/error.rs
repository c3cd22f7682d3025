use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

/// Pipeline phase an error was raised in. Carried on every `EngineError` so
/// multi-symbol modes can report where a symbol fell over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Ingest,
    Scan,
    Simulate,
    Allocate,
    Snapshot,
    Report,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Ingest => "ingest",
            Phase::Scan => "scan",
            Phase::Simulate => "simulate",
            Phase::Allocate => "allocate",
            Phase::Snapshot => "snapshot",
            Phase::Report => "report",
        };
        f.write_str(s)
    }
}

/// Error classification. Kinds, not concrete causes: the same kind can be
/// produced by several modules, and callers dispatch on kind alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed file, missing columns, non-UTC timestamp, invalid parameter.
    /// Surfaced at the boundary; the run is not started.
    Input,
    /// Data discovered mid-ingest to be unusable. Fatal for the affected
    /// symbol only; multi-symbol modes isolate and continue.
    DataIntegrity,
    /// Strategy declared an indicator that cannot be computed, or a required
    /// parameter is absent.
    StrategyConfig,
    /// Risk parameterization is unusable (non-positive risk, missing ATR).
    RiskConfig,
    /// Vectorized results diverged from the reference simulator beyond
    /// tolerance. Never swallowed.
    SimulationFidelity,
    /// Unexpected fault inside a symbol's pipeline.
    Runtime,
    /// Cooperative cancellation between phases.
    Aborted,
}

#[derive(Debug, Clone, Error)]
#[error("{kind:?} [{}] in {phase} phase: {message}", .symbol.as_deref().unwrap_or("-"))]
pub struct EngineError {
    pub kind: ErrorKind,
    pub symbol: Option<String>,
    pub phase: Phase,
    pub at: DateTime<Utc>,
    pub message: String,
}

impl EngineError {
    pub fn new(kind: ErrorKind, phase: Phase, message: impl Into<String>) -> Self {
        Self {
            kind,
            symbol: None,
            phase,
            at: Utc::now(),
            message: message.into(),
        }
    }

    pub fn with_symbol(mut self, symbol: impl Into<String>) -> Self {
        self.symbol = Some(symbol.into());
        self
    }

    pub fn input(phase: Phase, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Input, phase, message)
    }

    pub fn data_integrity(symbol: &str, phase: Phase, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::DataIntegrity, phase, message).with_symbol(symbol)
    }

    pub fn strategy_config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::StrategyConfig, Phase::Scan, message)
    }

    pub fn risk_config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RiskConfig, Phase::Scan, message)
    }

    pub fn fidelity(symbol: &str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::SimulationFidelity, Phase::Simulate, message).with_symbol(symbol)
    }

    pub fn runtime(symbol: &str, phase: Phase, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Runtime, phase, message).with_symbol(symbol)
    }

    pub fn aborted(phase: Phase) -> Self {
        Self::new(ErrorKind::Aborted, phase, "run canceled by caller")
    }

    /// Process exit code for CLI wrappers.
    pub fn exit_code(&self) -> i32 {
        match self.kind {
            ErrorKind::Input | ErrorKind::StrategyConfig | ErrorKind::RiskConfig => 2,
            ErrorKind::DataIntegrity => 3,
            ErrorKind::SimulationFidelity => 4,
            ErrorKind::Aborted => 5,
            ErrorKind::Runtime => 1,
        }
    }

    /// Whether multi-symbol modes may recover by isolating the symbol.
    pub fn is_isolatable(&self) -> bool {
        matches!(self.kind, ErrorKind::DataIntegrity | ErrorKind::Runtime)
    }
}

/// Classify an `anyhow` error chain back into an `EngineError`. Pipeline code
/// attaches typed errors at the point of failure; anything untyped that
/// reaches a symbol boundary is a runtime failure by definition.
pub fn classify(err: &anyhow::Error, symbol: &str, phase: Phase) -> EngineError {
    match err.downcast_ref::<EngineError>() {
        Some(e) => {
            let mut e = e.clone();
            if e.symbol.is_none() {
                e.symbol = Some(symbol.to_string());
            }
            e
        }
        None => EngineError::runtime(symbol, phase, format!("{err:#}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_match_cli_contract() {
        assert_eq!(EngineError::input(Phase::Ingest, "bad flag").exit_code(), 2);
        assert_eq!(EngineError::strategy_config("missing param").exit_code(), 2);
        assert_eq!(
            EngineError::data_integrity("EURUSD", Phase::Ingest, "all-NaN column").exit_code(),
            3
        );
        assert_eq!(EngineError::fidelity("EURUSD", "trade 3 diverged").exit_code(), 4);
        assert_eq!(EngineError::aborted(Phase::Scan).exit_code(), 5);
    }

    #[test]
    fn display_includes_symbol_and_phase() {
        let e = EngineError::data_integrity("GBPUSD", Phase::Ingest, "non-monotonic after dedup");
        let s = e.to_string();
        assert!(s.contains("GBPUSD"), "{s}");
        assert!(s.contains("ingest"), "{s}");
    }

    #[test]
    fn classify_recovers_typed_error_from_chain() {
        let typed = EngineError::fidelity("EURUSD", "trade 0: exit price diverged");
        let chained: anyhow::Error = anyhow::Error::new(typed).context("simulate phase");
        let back = classify(&chained, "EURUSD", Phase::Simulate);
        assert_eq!(back.kind, ErrorKind::SimulationFidelity);
    }

    #[test]
    fn classify_untyped_is_runtime() {
        let err = anyhow::anyhow!("something unexpected");
        let back = classify(&err, "USDJPY", Phase::Scan);
        assert_eq!(back.kind, ErrorKind::Runtime);
        assert_eq!(back.symbol.as_deref(), Some("USDJPY"));
    }

    #[test]
    fn isolatable_kinds() {
        assert!(EngineError::runtime("X", Phase::Simulate, "boom").is_isolatable());
        assert!(!EngineError::input(Phase::Ingest, "bad").is_isolatable());
        assert!(!EngineError::fidelity("X", "diverged").is_isolatable());
    }
}
