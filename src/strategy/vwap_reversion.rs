//! VWAP-Reversion Strategy
//!
//! Session VWAP with a k-sigma band over the close/VWAP deviation. Buys below
//! the lower band, sells above the upper band, targets the VWAP itself.

use crate::errors::StrategyError;
use crate::num;
use crate::strategy::indicators::{RollingStd, SessionVwap};
use crate::strategy::{
    coerce_parameter, ParameterSpec, ParameterValue, Strategy, StrategyContext,
};
use crate::types::{Bar, Side, Signal};
use rust_decimal::Decimal;
use std::collections::BTreeMap;

pub struct VwapReversion {
    period: usize,
    num_std: f64,
    stop_pct: f64,
    vwap: SessionVwap,
    deviation: RollingStd,
    symbol: String,
}

impl Default for VwapReversion {
    fn default() -> Self {
        Self {
            period: 20,
            num_std: 1.5,
            stop_pct: 0.03,
            vwap: SessionVwap::new(),
            deviation: RollingStd::new(20),
            symbol: String::new(),
        }
    }
}

impl VwapReversion {
    fn specs(&self) -> BTreeMap<String, ParameterSpec> {
        let mut specs = BTreeMap::new();
        specs.insert(
            "period".to_string(),
            ParameterSpec::int(self.period as i64, 20, 5, 200),
        );
        specs.insert(
            "num_std".to_string(),
            ParameterSpec::float(self.num_std, 1.5, 0.5, 4.0),
        );
        specs.insert(
            "stop_pct".to_string(),
            ParameterSpec::float(self.stop_pct, 0.03, 0.005, 0.2),
        );
        specs
    }
}

impl Strategy for VwapReversion {
    fn name(&self) -> &str {
        "vwap_reversion"
    }

    fn description(&self) -> &str {
        "Session-VWAP band reversion"
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
            ("period", ParameterValue::Int(v)) => {
                self.period = v as usize;
                self.deviation = RollingStd::new(self.period);
            }
            ("num_std", ParameterValue::Float(v)) => self.num_std = v,
            ("stop_pct", ParameterValue::Float(v)) => self.stop_pct = v,
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
        let typical =
            (num::to_f64(bar.high) + num::to_f64(bar.low) + close) / 3.0;
        let vwap = self
            .vwap
            .update(bar.timestamp, typical, num::to_f64(bar.volume))?;
        let sigma = self.deviation.update(close - vwap)?;
        if sigma <= 0.0 {
            return None;
        }

        let deviation = close - vwap;
        let side = if deviation < -self.num_std * sigma {
            Side::Buy
        } else if deviation > self.num_std * sigma {
            Side::Sell
        } else {
            return None;
        };

        let strength = ((deviation.abs() / sigma) / (2.0 * self.num_std)).min(1.0);
        let stop_pct = num::from_f64(self.stop_pct)?;
        let stop = match side {
            Side::Buy => bar.close * (Decimal::ONE - stop_pct),
            Side::Sell => bar.close * (Decimal::ONE + stop_pct),
        };
        Some(
            Signal::new(
                &self.symbol,
                side,
                strength,
                format!("close {deviation:+.4} from session vwap {vwap:.4}"),
                bar.timestamp,
            )
            .with_entry(bar.close)
            .with_stop(stop)
            .with_target(num::from_f64(vwap)?),
        )
    }

    fn reset(&mut self) {
        self.vwap = SessionVwap::new();
        self.deviation = RollingStd::new(self.period);
    }
}
