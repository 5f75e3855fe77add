//! Momentum Strategy
//!
//! Rate-of-change over N bars: buy when momentum exceeds the threshold, sell
//! when it falls below the negative threshold. Exits through a symmetric
//! percentage bracket around the entry.

use crate::errors::StrategyError;
use crate::num;
use crate::strategy::{
    coerce_parameter, ParameterSpec, ParameterValue, Strategy, StrategyContext,
};
use crate::types::{Bar, Side, Signal};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, VecDeque};

pub struct Momentum {
    period: usize,
    threshold: f64,
    bracket_pct: f64,
    closes: VecDeque<f64>,
    symbol: String,
}

impl Default for Momentum {
    fn default() -> Self {
        Self {
            period: 14,
            threshold: 0.02,
            bracket_pct: 0.05,
            closes: VecDeque::new(),
            symbol: String::new(),
        }
    }
}

impl Momentum {
    fn specs(&self) -> BTreeMap<String, ParameterSpec> {
        let mut specs = BTreeMap::new();
        specs.insert(
            "period".to_string(),
            ParameterSpec::int(self.period as i64, 14, 2, 200),
        );
        specs.insert(
            "threshold".to_string(),
            ParameterSpec::float(self.threshold, 0.02, 0.001, 0.5),
        );
        specs.insert(
            "bracket_pct".to_string(),
            ParameterSpec::float(self.bracket_pct, 0.05, 0.005, 0.5),
        );
        specs
    }
}

impl Strategy for Momentum {
    fn name(&self) -> &str {
        "momentum"
    }

    fn description(&self) -> &str {
        "Rate-of-change momentum with a symmetric exit bracket"
    }

    fn parameters(&self) -> BTreeMap<String, ParameterSpec> {
        self.specs()
    }

    fn set_parameter(&mut self, name: &str, value: ParameterValue) -> Result<(), StrategyError> {
        let specs = self.specs();
        let spec = specs
            .get(name)
            .ok_or_else(|| StrategyError::UnknownParameter(name.to_string()))?;
        match (name, coerce_parameter(name, spec, value)?) {
            ("period", ParameterValue::Int(v)) => self.period = v as usize,
            ("threshold", ParameterValue::Float(v)) => self.threshold = v,
            ("bracket_pct", ParameterValue::Float(v)) => self.bracket_pct = v,
            _ => return Err(StrategyError::UnknownParameter(name.to_string())),
        }
        Ok(())
    }

    fn initialize(&mut self, ctx: &StrategyContext) {
        self.symbol = ctx.symbol.clone();
        self.reset();
    }

    fn on_bar(&mut self, bar: &Bar) -> Option<Signal> {
        let close = num::to_f64(bar.close);
        let reference = if self.closes.len() > self.period {
            self.closes.pop_front();
            self.closes.front().copied()
        } else {
            self.closes.front().copied().filter(|_| self.closes.len() == self.period)
        };
        self.closes.push_back(close);

        let reference = reference?;
        if reference <= 0.0 {
            return None;
        }
        let momentum = (close - reference) / reference;
        let side = if momentum > self.threshold {
            Side::Buy
        } else if momentum < -self.threshold {
            Side::Sell
        } else {
            return None;
        };

        let strength = (momentum.abs() / self.threshold).min(1.0);
        let bracket = num::from_f64(self.bracket_pct)?;
        let (stop, target) = match side {
            Side::Buy => (
                bar.close * (Decimal::ONE - bracket),
                bar.close * (Decimal::ONE + bracket),
            ),
            Side::Sell => (
                bar.close * (Decimal::ONE + bracket),
                bar.close * (Decimal::ONE - bracket),
            ),
        };
        Some(
            Signal::new(
                &self.symbol,
                side,
                strength,
                format!("momentum {momentum:.4} over {} bars", self.period),
                bar.timestamp,
            )
            .with_entry(bar.close)
            .with_stop(stop)
            .with_target(target),
        )
    }

    fn reset(&mut self) {
        self.closes.clear();
    }
}
