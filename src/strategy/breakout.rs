//! Breakout Strategy
//!
//! Channel breakout over the prior N bars, confirmed by volume. A close above
//! the prior highest high (below the lowest low) with volume at least m times
//! the rolling average fires a signal. Target is one channel range away;
//! stop sits at mid-range.

use crate::errors::StrategyError;
use crate::num;
use crate::strategy::indicators::{RollingExtrema, Sma};
use crate::strategy::{
    coerce_parameter, ParameterSpec, ParameterValue, Strategy, StrategyContext,
};
use crate::types::{Bar, Side, Signal};
use std::collections::BTreeMap;

pub struct Breakout {
    period: usize,
    volume_mult: f64,
    channel: RollingExtrema,
    avg_volume: Sma,
    symbol: String,
}

impl Default for Breakout {
    fn default() -> Self {
        Self {
            period: 20,
            volume_mult: 1.5,
            channel: RollingExtrema::new(20),
            avg_volume: Sma::new(20),
            symbol: String::new(),
        }
    }
}

impl Breakout {
    fn specs(&self) -> BTreeMap<String, ParameterSpec> {
        let mut specs = BTreeMap::new();
        specs.insert(
            "period".to_string(),
            ParameterSpec::int(self.period as i64, 20, 5, 200),
        );
        specs.insert(
            "volume_mult".to_string(),
            ParameterSpec::float(self.volume_mult, 1.5, 1.0, 5.0),
        );
        specs
    }
}

impl Strategy for Breakout {
    fn name(&self) -> &str {
        "breakout"
    }

    fn description(&self) -> &str {
        "Volume-confirmed channel breakout over the prior N bars"
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
                self.channel = RollingExtrema::new(self.period);
                self.avg_volume = Sma::new(self.period);
            }
            ("volume_mult", ParameterValue::Float(v)) => self.volume_mult = v,
            _ => return Err(StrategyError::UnknownParameter(name.to_string())),
        }
        Ok(())
    }

    fn initialize(&mut self, ctx: &StrategyContext) {
        self.symbol = ctx.symbol.clone();
        self.reset();
    }

    fn on_bar(&mut self, bar: &Bar) -> Option<Signal> {
        // Query the channel BEFORE pushing the current bar so the breakout is
        // measured against the prior N bars.
        let highest = self.channel.highest();
        let lowest = self.channel.lowest();
        let avg_volume = self.avg_volume.value();

        let high = num::to_f64(bar.high);
        let low = num::to_f64(bar.low);
        let close = num::to_f64(bar.close);
        let volume = num::to_f64(bar.volume);
        self.channel.update(high, low);
        self.avg_volume.update(volume);

        let (highest, lowest, avg_volume) = (highest?, lowest?, avg_volume?);
        if avg_volume <= 0.0 {
            return None;
        }
        let volume_ratio = volume / avg_volume;
        if volume_ratio < self.volume_mult {
            return None;
        }

        let side = if close > highest {
            Side::Buy
        } else if close < lowest {
            Side::Sell
        } else {
            return None;
        };

        let range = highest - lowest;
        let mid = lowest + range / 2.0;
        let (stop, target) = match side {
            Side::Buy => (mid, close + range),
            Side::Sell => (mid, close - range),
        };
        let strength = (volume_ratio / (2.0 * self.volume_mult)).min(1.0);
        Some(
            Signal::new(
                &self.symbol,
                side,
                strength,
                format!(
                    "close {close:.4} broke {}-bar channel [{lowest:.4}, {highest:.4}], volume x{volume_ratio:.2}",
                    self.period
                ),
                bar.timestamp,
            )
            .with_entry(bar.close)
            .with_stop(num::from_f64(stop)?)
            .with_target(num::from_f64(target)?),
        )
    }

    fn reset(&mut self) {
        self.channel = RollingExtrema::new(self.period);
        self.avg_volume = Sma::new(self.period);
    }
}
