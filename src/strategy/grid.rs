//! Grid-Trading Strategy
//!
//! Anchors a base price at the first bar, then lays N buy levels below and
//! N sell levels above at fixed percentage spacing. A level fires when the
//! close newly crosses it and re-arms when price crosses back. All exits
//! target the base price.

use crate::errors::StrategyError;
use crate::num;
use crate::strategy::{
    coerce_parameter, ParameterSpec, ParameterValue, Strategy, StrategyContext,
};
use crate::types::{Bar, Side, Signal};
use std::collections::BTreeMap;

pub struct GridTrading {
    levels: usize,
    spacing_pct: f64,
    base_price: Option<f64>,
    prev_close: Option<f64>,
    symbol: String,
}

impl Default for GridTrading {
    fn default() -> Self {
        Self {
            levels: 5,
            spacing_pct: 0.01,
            base_price: None,
            prev_close: None,
            symbol: String::new(),
        }
    }
}

impl GridTrading {
    fn specs(&self) -> BTreeMap<String, ParameterSpec> {
        let mut specs = BTreeMap::new();
        specs.insert(
            "levels".to_string(),
            ParameterSpec::int(self.levels as i64, 5, 1, 50),
        );
        specs.insert(
            "spacing_pct".to_string(),
            ParameterSpec::float(self.spacing_pct, 0.01, 0.001, 0.2),
        );
        specs
    }

    fn buy_level(&self, base: f64, index: usize) -> f64 {
        base * (1.0 - self.spacing_pct * index as f64)
    }

    fn sell_level(&self, base: f64, index: usize) -> f64 {
        base * (1.0 + self.spacing_pct * index as f64)
    }
}

impl Strategy for GridTrading {
    fn name(&self) -> &str {
        "grid"
    }

    fn description(&self) -> &str {
        "Fixed-grid level trading anchored at the first bar"
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
            ("levels", ParameterValue::Int(v)) => self.levels = v as usize,
            ("spacing_pct", ParameterValue::Float(v)) => self.spacing_pct = v,
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
        let base = match self.base_price {
            Some(base) => base,
            None => {
                // The first bar anchors the grid; no trading yet.
                self.base_price = Some(close);
                self.prev_close = Some(close);
                return None;
            }
        };
        let prev = self.prev_close.replace(close)?;

        // Deepest newly-crossed level wins when a single bar jumps several.
        let mut fired: Option<(Side, usize, f64)> = None;
        for index in 1..=self.levels {
            let level = self.buy_level(base, index);
            if prev > level && close <= level {
                fired = Some((Side::Buy, index, level));
            }
        }
        if fired.is_none() {
            for index in 1..=self.levels {
                let level = self.sell_level(base, index);
                if prev < level && close >= level {
                    fired = Some((Side::Sell, index, level));
                }
            }
        }

        let (side, index, level) = fired?;
        let strength = (index as f64 / self.levels as f64).min(1.0);
        Some(
            Signal::new(
                &self.symbol,
                side,
                strength,
                format!("grid level {index} at {level:.4} crossed (base {base:.4})"),
                bar.timestamp,
            )
            .with_entry(bar.close)
            .with_target(num::from_f64(base)?),
        )
    }

    fn reset(&mut self) {
        self.base_price = None;
        self.prev_close = None;
    }
}
