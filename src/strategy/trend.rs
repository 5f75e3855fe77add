//! Trend-Following Strategy
//!
//! Fast/slow EMA crossover. A bullish cross buys, a bearish cross sells; the
//! exit bracket is asymmetric (wider target than stop) to let trends run.

use crate::errors::StrategyError;
use crate::num;
use crate::strategy::indicators::Ema;
use crate::strategy::{
    coerce_parameter, ParameterSpec, ParameterValue, Strategy, StrategyContext,
};
use crate::types::{Bar, Side, Signal};
use rust_decimal::Decimal;
use std::collections::BTreeMap;

pub struct TrendFollowing {
    fast_period: usize,
    slow_period: usize,
    stop_pct: f64,
    target_pct: f64,
    fast: Ema,
    slow: Ema,
    prev_diff: Option<f64>,
    bars_seen: usize,
    symbol: String,
}

impl Default for TrendFollowing {
    fn default() -> Self {
        Self {
            fast_period: 12,
            slow_period: 26,
            stop_pct: 0.03,
            target_pct: 0.06,
            fast: Ema::new(12),
            slow: Ema::new(26),
            prev_diff: None,
            bars_seen: 0,
            symbol: String::new(),
        }
    }
}

impl TrendFollowing {
    fn specs(&self) -> BTreeMap<String, ParameterSpec> {
        let mut specs = BTreeMap::new();
        specs.insert(
            "fast_period".to_string(),
            ParameterSpec::int(self.fast_period as i64, 12, 2, 100),
        );
        specs.insert(
            "slow_period".to_string(),
            ParameterSpec::int(self.slow_period as i64, 26, 5, 300),
        );
        specs.insert(
            "stop_pct".to_string(),
            ParameterSpec::float(self.stop_pct, 0.03, 0.005, 0.2),
        );
        specs.insert(
            "target_pct".to_string(),
            ParameterSpec::float(self.target_pct, 0.06, 0.01, 0.5),
        );
        specs
    }
}

impl Strategy for TrendFollowing {
    fn name(&self) -> &str {
        "trend_following"
    }

    fn description(&self) -> &str {
        "Fast/slow EMA crossover trend entry"
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
            ("fast_period", ParameterValue::Int(v)) => {
                self.fast_period = v as usize;
                self.fast = Ema::new(self.fast_period);
            }
            ("slow_period", ParameterValue::Int(v)) => {
                self.slow_period = v as usize;
                self.slow = Ema::new(self.slow_period);
            }
            ("stop_pct", ParameterValue::Float(v)) => self.stop_pct = v,
            ("target_pct", ParameterValue::Float(v)) => self.target_pct = v,
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
        let fast = self.fast.update(close);
        let slow = self.slow.update(close);
        self.bars_seen += 1;

        let diff = fast - slow;
        let prev_diff = self.prev_diff.replace(diff);

        // Both EMAs need a full slow-period warmup before crosses mean much.
        if self.bars_seen <= self.slow_period {
            return None;
        }
        let prev_diff = prev_diff?;

        let side = if prev_diff <= 0.0 && diff > 0.0 {
            Side::Buy
        } else if prev_diff >= 0.0 && diff < 0.0 {
            Side::Sell
        } else {
            return None;
        };

        // Strength scales with the separation of the EMAs at the cross.
        let strength = if slow.abs() > f64::EPSILON {
            ((diff.abs() / slow.abs()) / 0.01).min(1.0)
        } else {
            0.0
        };
        let stop_pct = num::from_f64(self.stop_pct)?;
        let target_pct = num::from_f64(self.target_pct)?;
        let (stop, target) = match side {
            Side::Buy => (
                bar.close * (Decimal::ONE - stop_pct),
                bar.close * (Decimal::ONE + target_pct),
            ),
            Side::Sell => (
                bar.close * (Decimal::ONE + stop_pct),
                bar.close * (Decimal::ONE - target_pct),
            ),
        };
        Some(
            Signal::new(
                &self.symbol,
                side,
                strength,
                format!(
                    "ema({}) crossed ema({}) {}",
                    self.fast_period,
                    self.slow_period,
                    match side {
                        Side::Buy => "bullish",
                        Side::Sell => "bearish",
                    }
                ),
                bar.timestamp,
            )
            .with_entry(bar.close)
            .with_stop(stop)
            .with_target(target),
        )
    }

    fn reset(&mut self) {
        self.fast = Ema::new(self.fast_period);
        self.slow = Ema::new(self.slow_period);
        self.prev_diff = None;
        self.bars_seen = 0;
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
    fn test_bullish_cross_after_downtrend() {
        let mut strategy = TrendFollowing::default();
        strategy
            .set_parameter("fast_period", ParameterValue::Int(3))
            .unwrap();
        strategy
            .set_parameter("slow_period", ParameterValue::Int(8))
            .unwrap();
        strategy.initialize(&StrategyContext {
            symbol: "SOL/USDT".into(),
            timeframe: "1h".into(),
            initial_capital: dec!(10000),
        });

        let mut signals = Vec::new();
        let mut hour = 0;
        // Downtrend to pull fast below slow, then a sharp rally
        for i in 0..15 {
            if let Some(s) = strategy.on_bar(&bar(100.0 - i as f64, hour)) {
                signals.push(s);
            }
            hour += 1;
        }
        for i in 0..10 {
            if let Some(s) = strategy.on_bar(&bar(86.0 + 3.0 * i as f64, hour)) {
                signals.push(s);
            }
            hour += 1;
        }
        let buy = signals.iter().find(|s| s.side == Side::Buy);
        let buy = buy.expect("rally should produce a bullish cross");
        assert!(buy.suggested_target.unwrap() > buy.suggested_entry.unwrap());
        assert!(buy.suggested_stop.unwrap() < buy.suggested_entry.unwrap());
    }

    #[test]
    fn test_bearish_cross_after_uptrend() {
        let mut strategy = TrendFollowing::default();
        strategy
            .set_parameter("fast_period", ParameterValue::Int(3))
            .unwrap();
        strategy
            .set_parameter("slow_period", ParameterValue::Int(8))
            .unwrap();
        strategy.initialize(&StrategyContext {
            symbol: "SOL/USDT".into(),
            timeframe: "1h".into(),
            initial_capital: dec!(10000),
        });

        let mut sides = Vec::new();
        let mut hour = 0;
        for i in 0..15 {
            if let Some(s) = strategy.on_bar(&bar(100.0 + i as f64, hour)) {
                sides.push(s.side);
            }
            hour += 1;
        }
        for i in 0..10 {
            if let Some(s) = strategy.on_bar(&bar(114.0 - 3.0 * i as f64, hour)) {
                sides.push(s.side);
            }
            hour += 1;
        }
        assert!(sides.contains(&Side::Sell));
    }
}
