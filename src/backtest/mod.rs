//! Backtesting Engine
//!
//! Deterministic event-loop simulation over OHLCV bars: strategies emit
//! signals, the risk gate filters orders, the slippage model prices fills,
//! and the portfolio produces an equity curve plus end-of-run metrics.
//!
//! # Determinism Guarantees
//!
//! - No wall-clock reads inside the loop; all time comes from bar timestamps.
//! - Symbol and order iteration is sorted, never hash-ordered.
//! - Order and trade ids derive from per-run sequences.
//! - Randomness (validation only) comes from a seeded `ChaCha8Rng`.
//!
//! Given identical `(bars, config, seed)`, two runs produce bitwise-identical
//! trades, equity curves and metrics.

pub mod engine;
pub mod metrics;
pub mod runner;

#[cfg(test)]
mod engine_tests;

pub use engine::{BacktestEngine, BacktestReport, ProgressUpdate};
pub use metrics::{periods_per_year, PerformanceMetrics};
pub use runner::{RunRegistry, RunState, RunStatus};

use crate::agent::sizing::SizingConfig;
use crate::errors::ConfigError;
use crate::risk::RiskConfig;
use crate::slippage::SlippageSpec;
use crate::strategy::ParameterValue;
use crate::validation::monte_carlo::MonteCarloConfig;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Post-run validation to attach to the report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationConfig {
    pub monte_carlo: Option<MonteCarloConfig>,
}

/// Full backtest run configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestConfig {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Bar timeframe tag, e.g. "1h"; drives annualization.
    pub timeframe: String,
    pub symbols: Vec<String>,
    pub strategy: String,
    pub strategy_params: BTreeMap<String, ParameterValue>,
    pub initial_capital: Decimal,
    /// Commission charged per fill, in basis points of notional.
    pub commission_bps: Decimal,
    pub slippage: SlippageSpec,
    pub risk: RiskConfig,
    pub sizing: SizingConfig,
    /// Seed for every stochastic component attached to this run.
    pub seed: u64,
    pub validation: Option<ValidationConfig>,
}

impl BacktestConfig {
    pub fn new(
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        symbols: Vec<String>,
        strategy: impl Into<String>,
    ) -> Self {
        Self {
            start,
            end,
            timeframe: "1h".into(),
            symbols,
            strategy: strategy.into(),
            strategy_params: BTreeMap::new(),
            initial_capital: dec!(10000),
            commission_bps: dec!(10),
            slippage: SlippageSpec::Fixed { bps: dec!(10) },
            risk: RiskConfig::default(),
            sizing: SizingConfig::default(),
            seed: 42,
            validation: None,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.start >= self.end {
            return Err(ConfigError::Invalid(format!(
                "start {} must precede end {}",
                self.start, self.end
            )));
        }
        if self.symbols.is_empty() {
            return Err(ConfigError::Invalid("no symbols configured".into()));
        }
        if self.initial_capital <= Decimal::ZERO {
            return Err(ConfigError::Invalid(format!(
                "initial capital {} must be positive",
                self.initial_capital
            )));
        }
        if self.commission_bps < Decimal::ZERO {
            return Err(ConfigError::Invalid("negative commission".into()));
        }
        Ok(())
    }
}
