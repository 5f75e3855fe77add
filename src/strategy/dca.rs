//! Dollar-Cost-Averaging Strategy
//!
//! Buys on a fixed bar cadence, with an extra buy whenever a single bar drops
//! by at least the dip threshold. Accumulation only; no exits.

use crate::errors::StrategyError;
use crate::num;
use crate::strategy::{
    coerce_parameter, ParameterSpec, ParameterValue, Strategy, StrategyContext,
};
use crate::types::{Bar, Side, Signal};
use std::collections::BTreeMap;

pub struct DollarCostAveraging {
    interval_bars: usize,
    dip_pct: f64,
    bars_since_buy: usize,
    prev_close: Option<f64>,
    symbol: String,
}

impl Default for DollarCostAveraging {
    fn default() -> Self {
        Self {
            interval_bars: 24,
            dip_pct: 0.05,
            bars_since_buy: 0,
            prev_close: None,
            symbol: String::new(),
        }
    }
}

impl DollarCostAveraging {
    fn specs(&self) -> BTreeMap<String, ParameterSpec> {
        let mut specs = BTreeMap::new();
        specs.insert(
            "interval_bars".to_string(),
            ParameterSpec::int(self.interval_bars as i64, 24, 1, 1000),
        );
        specs.insert(
            "dip_pct".to_string(),
            ParameterSpec::float(self.dip_pct, 0.05, 0.005, 0.5),
        );
        specs
    }
}

impl Strategy for DollarCostAveraging {
    fn name(&self) -> &str {
        "dca"
    }

    fn description(&self) -> &str {
        "Scheduled accumulation with opportunistic dip buys"
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
            ("interval_bars", ParameterValue::Int(v)) => self.interval_bars = v as usize,
            ("dip_pct", ParameterValue::Float(v)) => self.dip_pct = v,
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
        let prev = self.prev_close.replace(close);
        self.bars_since_buy += 1;

        let dip = prev
            .filter(|prev| *prev > 0.0)
            .map(|prev| (prev - close) / prev)
            .filter(|drop| *drop >= self.dip_pct);

        let scheduled = self.bars_since_buy >= self.interval_bars;
        if !scheduled && dip.is_none() {
            return None;
        }
        self.bars_since_buy = 0;

        let (strength, reason) = match dip {
            Some(drop) => (1.0, format!("dip buy: single-bar drop {:.2}%", drop * 100.0)),
            None => (
                0.5,
                format!("scheduled buy every {} bars", self.interval_bars),
            ),
        };
        Some(
            Signal::new(&self.symbol, Side::Buy, strength, reason, bar.timestamp)
                .with_entry(bar.close),
        )
    }

    fn reset(&mut self) {
        self.bars_since_buy = 0;
        self.prev_close = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn bar(close: f64, hour: i64) -> Bar {
        let close = num::from_f64(close).unwrap();
        Bar {
            symbol: "SOL/USDT".into(),
            open: close,
            high: close,
            low: close,
            close,
            volume: dec!(1000),
            timestamp: Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap()
                + chrono::Duration::hours(hour),
        }
    }

    fn make(interval: i64, dip: f64) -> DollarCostAveraging {
        let mut strategy = DollarCostAveraging::default();
        strategy
            .set_parameter("interval_bars", ParameterValue::Int(interval))
            .unwrap();
        strategy
            .set_parameter("dip_pct", ParameterValue::Float(dip))
            .unwrap();
        strategy.initialize(&StrategyContext {
            symbol: "SOL/USDT".into(),
            timeframe: "1h".into(),
            initial_capital: dec!(10000),
        });
        strategy
    }

    #[test]
    fn test_scheduled_cadence() {
        let mut strategy = make(4, 0.5);
        let mut buys = Vec::new();
        for hour in 0..12 {
            if strategy.on_bar(&bar(100.0, hour)).is_some() {
                buys.push(hour);
            }
        }
        assert_eq!(buys, vec![3, 7, 11]);
    }

    #[test]
    fn test_dip_buy_resets_cadence() {
        let mut strategy = make(10, 0.05);
        assert!(strategy.on_bar(&bar(100.0, 0)).is_none());
        // 6% single-bar drop triggers an immediate buy at full strength
        let signal = strategy.on_bar(&bar(94.0, 1)).expect("dip should buy");
        assert_eq!(signal.side, Side::Buy);
        assert_eq!(signal.strength, 1.0);
        assert!(signal.reason.contains("dip"));

        // Cadence restarts from the dip buy
        for hour in 2..11 {
            assert!(strategy.on_bar(&bar(94.0, hour)).is_none());
        }
        assert!(strategy.on_bar(&bar(94.0, 11)).is_some());
    }

    #[test]
    fn test_small_drop_is_not_a_dip() {
        let mut strategy = make(100, 0.05);
        strategy.on_bar(&bar(100.0, 0));
        assert!(strategy.on_bar(&bar(98.0, 1)).is_none());
    }
}
