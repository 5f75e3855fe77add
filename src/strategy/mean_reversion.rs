//! Mean-Reversion Strategy
//!
//! Bollinger-style bands: rolling SMA(N) plus/minus k standard deviations.
//! Buys below the lower band, sells above the upper band, targets the mean.

use crate::errors::StrategyError;
use crate::num;
use crate::strategy::indicators::RollingStd;
use crate::strategy::{
    coerce_parameter, ParameterSpec, ParameterValue, Strategy, StrategyContext,
};
use crate::types::{Bar, Side, Signal};
use rust_decimal::Decimal;
use std::collections::BTreeMap;

pub struct MeanReversion {
    period: usize,
    num_std: f64,
    stop_pct: f64,
    stats: RollingStd,
    symbol: String,
}

impl Default for MeanReversion {
    fn default() -> Self {
        Self {
            period: 20,
            num_std: 2.0,
            stop_pct: 0.03,
            stats: RollingStd::new(20),
            symbol: String::new(),
        }
    }
}

impl MeanReversion {
    fn specs(&self) -> BTreeMap<String, ParameterSpec> {
        let mut specs = BTreeMap::new();
        specs.insert(
            "period".to_string(),
            ParameterSpec::int(self.period as i64, 20, 5, 200),
        );
        specs.insert(
            "num_std".to_string(),
            ParameterSpec::float(self.num_std, 2.0, 0.5, 4.0),
        );
        specs.insert(
            "stop_pct".to_string(),
            ParameterSpec::float(self.stop_pct, 0.03, 0.005, 0.2),
        );
        specs
    }
}

impl Strategy for MeanReversion {
    fn name(&self) -> &str {
        "mean_reversion"
    }

    fn description(&self) -> &str {
        "Bollinger-band reversion toward the rolling mean"
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
                self.stats = RollingStd::new(self.period);
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
        let std_dev = self.stats.update(close)?;
        let mean = self.stats.mean()?;
        if std_dev <= 0.0 {
            return None;
        }

        let z = (close - mean) / std_dev;
        let side = if z < -self.num_std {
            Side::Buy
        } else if z > self.num_std {
            Side::Sell
        } else {
            return None;
        };

        let strength = (z.abs() / (2.0 * self.num_std)).min(1.0);
        let target = num::from_f64(mean)?;
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
                format!("z-score {z:.2} beyond {:.1} band", self.num_std),
                bar.timestamp,
            )
            .with_entry(bar.close)
            .with_stop(stop)
            .with_target(target),
        )
    }

    fn reset(&mut self) {
        self.stats = RollingStd::new(self.period);
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

    #[test]
    fn test_buy_below_lower_band_targets_mean() {
        let mut strategy = MeanReversion::default();
        strategy.set_parameter("period", ParameterValue::Int(10)).unwrap();
        strategy
            .set_parameter("num_std", ParameterValue::Float(2.0))
            .unwrap();
        strategy.initialize(&StrategyContext {
            symbol: "SOL/USDT".into(),
            timeframe: "1h".into(),
            initial_capital: dec!(10000),
        });

        // Oscillate gently around 100, then crash far below the band
        let mut hour = 0;
        for i in 0..10 {
            let wiggle = if i % 2 == 0 { 0.5 } else { -0.5 };
            assert!(strategy.on_bar(&bar(100.0 + wiggle, hour)).is_none());
            hour += 1;
        }
        let signal = strategy.on_bar(&bar(90.0, hour)).expect("crash should signal");
        assert_eq!(signal.side, Side::Buy);
        // Target is the rolling mean, well above the crash price
        let target = num::to_f64(signal.suggested_target.unwrap());
        assert!(target > 95.0);
        assert!(signal.suggested_stop.unwrap() < signal.suggested_entry.unwrap());
    }

    #[test]
    fn test_sell_above_upper_band() {
        let mut strategy = MeanReversion::default();
        strategy.set_parameter("period", ParameterValue::Int(10)).unwrap();
        strategy.initialize(&StrategyContext {
            symbol: "SOL/USDT".into(),
            timeframe: "1h".into(),
            initial_capital: dec!(10000),
        });

        let mut hour = 0;
        for i in 0..10 {
            let wiggle = if i % 2 == 0 { 0.5 } else { -0.5 };
            strategy.on_bar(&bar(100.0 + wiggle, hour));
            hour += 1;
        }
        let signal = strategy.on_bar(&bar(110.0, hour)).expect("spike should signal");
        assert_eq!(signal.side, Side::Sell);
    }
}
