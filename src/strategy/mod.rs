//! Strategy Contract and Registry
//!
//! Every strategy is single-symbol, bar- or tick-driven, and exposes a typed
//! parameter surface the optimizer can sweep uniformly. The harness invokes
//! each subscribed instance sequentially in event-timestamp order; strategies
//! never see events out of order and never share state.

pub mod indicators;

pub mod breakout;
pub mod dca;
pub mod grid;
pub mod mean_reversion;
pub mod momentum;
pub mod rsi_divergence;
pub mod trend;
pub mod vwap_reversion;

pub use breakout::Breakout;
pub use dca::DollarCostAveraging;
pub use grid::GridTrading;
pub use mean_reversion::MeanReversion;
pub use momentum::Momentum;
pub use rsi_divergence::RsiDivergence;
pub use trend::TrendFollowing;
pub use vwap_reversion::VwapReversion;

use crate::errors::StrategyError;
use crate::types::{Bar, Signal, Tick};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// A typed parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "value")]
pub enum ParameterValue {
    Int(i64),
    Float(f64),
    Choice(String),
}

impl ParameterValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParameterValue::Int(v) => Some(*v as f64),
            ParameterValue::Float(v) => Some(*v),
            ParameterValue::Choice(_) => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ParameterValue::Int(v) => Some(*v),
            ParameterValue::Float(v) => Some(v.round() as i64),
            ParameterValue::Choice(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParameterValue::Choice(v) => Some(v),
            _ => None,
        }
    }
}

/// Parameter type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterKind {
    Int,
    Float,
    Choice,
}

/// Declared bounds and current value of one strategy parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub kind: ParameterKind,
    pub default: ParameterValue,
    pub min: Option<f64>,
    pub max: Option<f64>,
    /// Discrete options for `Choice` parameters.
    pub choices: Vec<String>,
    pub current: ParameterValue,
}

impl ParameterSpec {
    pub fn int(current: i64, default: i64, min: i64, max: i64) -> Self {
        Self {
            kind: ParameterKind::Int,
            default: ParameterValue::Int(default),
            min: Some(min as f64),
            max: Some(max as f64),
            choices: Vec::new(),
            current: ParameterValue::Int(current),
        }
    }

    pub fn float(current: f64, default: f64, min: f64, max: f64) -> Self {
        Self {
            kind: ParameterKind::Float,
            default: ParameterValue::Float(default),
            min: Some(min),
            max: Some(max),
            choices: Vec::new(),
            current: ParameterValue::Float(current),
        }
    }

    pub fn choice(current: &str, default: &str, options: &[&str]) -> Self {
        Self {
            kind: ParameterKind::Choice,
            default: ParameterValue::Choice(default.to_string()),
            min: None,
            max: None,
            choices: options.iter().map(|s| s.to_string()).collect(),
            current: ParameterValue::Choice(current.to_string()),
        }
    }
}

/// Validate and coerce `value` against a spec. Ints accept floats (rounded)
/// and vice versa so the optimizer can sweep both uniformly.
pub fn coerce_parameter(
    name: &str,
    spec: &ParameterSpec,
    value: ParameterValue,
) -> Result<ParameterValue, StrategyError> {
    let check_bounds = |v: f64| -> Result<(), StrategyError> {
        if let Some(min) = spec.min {
            if v < min {
                return Err(StrategyError::OutOfBounds {
                    name: name.to_string(),
                    reason: format!("{v} < min {min}"),
                });
            }
        }
        if let Some(max) = spec.max {
            if v > max {
                return Err(StrategyError::OutOfBounds {
                    name: name.to_string(),
                    reason: format!("{v} > max {max}"),
                });
            }
        }
        Ok(())
    };

    match spec.kind {
        ParameterKind::Int => {
            let v = value.as_i64().ok_or_else(|| StrategyError::WrongType {
                name: name.to_string(),
                expected: "int".into(),
            })?;
            check_bounds(v as f64)?;
            Ok(ParameterValue::Int(v))
        }
        ParameterKind::Float => {
            let v = value.as_f64().ok_or_else(|| StrategyError::WrongType {
                name: name.to_string(),
                expected: "float".into(),
            })?;
            if !v.is_finite() {
                return Err(StrategyError::OutOfBounds {
                    name: name.to_string(),
                    reason: "non-finite value".into(),
                });
            }
            check_bounds(v)?;
            Ok(ParameterValue::Float(v))
        }
        ParameterKind::Choice => {
            let v = value.as_str().ok_or_else(|| StrategyError::WrongType {
                name: name.to_string(),
                expected: "choice".into(),
            })?;
            if !spec.choices.iter().any(|c| c == v) {
                return Err(StrategyError::OutOfBounds {
                    name: name.to_string(),
                    reason: format!("'{v}' not in {:?}", spec.choices),
                });
            }
            Ok(ParameterValue::Choice(v.to_string()))
        }
    }
}

/// Context handed to a strategy at initialization.
#[derive(Debug, Clone)]
pub struct StrategyContext {
    pub symbol: String,
    pub timeframe: String,
    pub initial_capital: Decimal,
}

/// The strategy contract.
pub trait Strategy: Send {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// Declared parameters with bounds and current values.
    fn parameters(&self) -> BTreeMap<String, ParameterSpec>;

    /// Set a parameter by name. Must be called before `initialize`.
    fn set_parameter(&mut self, name: &str, value: ParameterValue) -> Result<(), StrategyError>;

    /// Bind the strategy to its symbol and warm internal state.
    fn initialize(&mut self, ctx: &StrategyContext);

    /// Consume a bar; optionally emit a signal.
    fn on_bar(&mut self, bar: &Bar) -> Option<Signal>;

    /// Consume a tick. Bar-driven strategies ignore ticks.
    fn on_tick(&mut self, _tick: &Tick) -> Option<Signal> {
        None
    }

    /// Clear all rolling state, keeping parameters.
    fn reset(&mut self);
}

type StrategyFactory = Arc<dyn Fn() -> Box<dyn Strategy> + Send + Sync>;

/// Registry of strategy constructors keyed by name.
#[derive(Clone)]
pub struct StrategyRegistry {
    factories: BTreeMap<String, StrategyFactory>,
}

impl StrategyRegistry {
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Registry pre-loaded with the reference strategy library.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register("momentum", || Box::new(Momentum::default()));
        registry.register("mean_reversion", || Box::new(MeanReversion::default()));
        registry.register("breakout", || Box::new(Breakout::default()));
        registry.register("trend_following", || Box::new(TrendFollowing::default()));
        registry.register("rsi_divergence", || Box::new(RsiDivergence::default()));
        registry.register("vwap_reversion", || Box::new(VwapReversion::default()));
        registry.register("grid", || Box::new(GridTrading::default()));
        registry.register("dca", || Box::new(DollarCostAveraging::default()));
        registry
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        factory: impl Fn() -> Box<dyn Strategy> + Send + Sync + 'static,
    ) {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    /// Create a fresh instance by name.
    pub fn create(&self, name: &str) -> Result<Box<dyn Strategy>, StrategyError> {
        self.factories
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| StrategyError::Unknown(name.to_string()))
    }

    /// Create an instance and apply `params` before it is initialized.
    pub fn create_configured(
        &self,
        name: &str,
        params: &BTreeMap<String, ParameterValue>,
    ) -> Result<Box<dyn Strategy>, StrategyError> {
        let mut strategy = self.create(name)?;
        for (param_name, value) in params {
            strategy.set_parameter(param_name, value.clone())?;
        }
        Ok(strategy)
    }

    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_creates_fresh_instances() {
        let registry = StrategyRegistry::with_defaults();
        assert_eq!(registry.names().len(), 8);

        let mut a = registry.create("momentum").unwrap();
        a.set_parameter("period", ParameterValue::Int(20)).unwrap();
        let b = registry.create("momentum").unwrap();
        // The second instance keeps defaults
        assert_ne!(
            a.parameters()["period"].current,
            b.parameters()["period"].current
        );
    }

    #[test]
    fn test_unknown_strategy() {
        let registry = StrategyRegistry::with_defaults();
        assert!(matches!(
            registry.create("nope"),
            Err(StrategyError::Unknown(_))
        ));
    }

    #[test]
    fn test_coerce_parameter_bounds() {
        let spec = ParameterSpec::int(14, 14, 2, 200);
        assert_eq!(
            coerce_parameter("period", &spec, ParameterValue::Int(20)).unwrap(),
            ParameterValue::Int(20)
        );
        // Floats are rounded into int parameters
        assert_eq!(
            coerce_parameter("period", &spec, ParameterValue::Float(20.4)).unwrap(),
            ParameterValue::Int(20)
        );
        assert!(coerce_parameter("period", &spec, ParameterValue::Int(1)).is_err());
        assert!(coerce_parameter("period", &spec, ParameterValue::Choice("x".into())).is_err());

        let spec = ParameterSpec::float(0.02, 0.02, 0.001, 0.5);
        assert!(coerce_parameter("threshold", &spec, ParameterValue::Float(f64::NAN)).is_err());

        let spec = ParameterSpec::choice("rolling", "rolling", &["rolling", "anchored"]);
        assert!(
            coerce_parameter("mode", &spec, ParameterValue::Choice("anchored".into())).is_ok()
        );
        assert!(coerce_parameter("mode", &spec, ParameterValue::Choice("other".into())).is_err());
    }

    #[test]
    fn test_create_configured_applies_params() {
        let registry = StrategyRegistry::with_defaults();
        let mut params = BTreeMap::new();
        params.insert("period".to_string(), ParameterValue::Int(30));
        params.insert("threshold".to_string(), ParameterValue::Float(0.05));
        let strategy = registry.create_configured("momentum", &params).unwrap();
        assert_eq!(
            strategy.parameters()["period"].current,
            ParameterValue::Int(30)
        );

        let mut bad = BTreeMap::new();
        bad.insert("no_such".to_string(), ParameterValue::Int(1));
        assert!(registry.create_configured("momentum", &bad).is_err());
    }
}
