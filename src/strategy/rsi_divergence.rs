//! RSI-Divergence Strategy
//!
//! 14-period RSI compared with price over a short lookback. A new price low
//! that the RSI refuses to confirm (higher RSI low) is bullish; a new price
//! high with a weaker RSI high is bearish.

use crate::errors::StrategyError;
use crate::num;
use crate::strategy::indicators::Rsi;
use crate::strategy::{
    coerce_parameter, ParameterSpec, ParameterValue, Strategy, StrategyContext,
};
use crate::types::{Bar, Side, Signal};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, VecDeque};

pub struct RsiDivergence {
    period: usize,
    lookback: usize,
    stop_pct: f64,
    target_pct: f64,
    rsi: Rsi,
    window: VecDeque<(f64, f64)>,
    symbol: String,
}

impl Default for RsiDivergence {
    fn default() -> Self {
        Self {
            period: 14,
            lookback: 10,
            stop_pct: 0.04,
            target_pct: 0.08,
            rsi: Rsi::new(14),
            window: VecDeque::new(),
            symbol: String::new(),
        }
    }
}

impl RsiDivergence {
    fn specs(&self) -> BTreeMap<String, ParameterSpec> {
        let mut specs = BTreeMap::new();
        specs.insert(
            "period".to_string(),
            ParameterSpec::int(self.period as i64, 14, 2, 100),
        );
        specs.insert(
            "lookback".to_string(),
            ParameterSpec::int(self.lookback as i64, 10, 3, 50),
        );
        specs.insert(
            "stop_pct".to_string(),
            ParameterSpec::float(self.stop_pct, 0.04, 0.005, 0.2),
        );
        specs.insert(
            "target_pct".to_string(),
            ParameterSpec::float(self.target_pct, 0.08, 0.01, 0.5),
        );
        specs
    }
}

impl Strategy for RsiDivergence {
    fn name(&self) -> &str {
        "rsi_divergence"
    }

    fn description(&self) -> &str {
        "Price/RSI divergence reversal"
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
                self.rsi = Rsi::new(self.period);
            }
            ("lookback", ParameterValue::Int(v)) => self.lookback = v as usize,
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
        let rsi = match self.rsi.update(close) {
            Some(rsi) => rsi,
            None => return None,
        };

        let signal = if self.window.len() >= self.lookback {
            // Extremes of the prior lookback window
            let (min_close, rsi_at_min) = self
                .window
                .iter()
                .copied()
                .min_by(|a, b| a.0.total_cmp(&b.0))?;
            let (max_close, rsi_at_max) = self
                .window
                .iter()
                .copied()
                .max_by(|a, b| a.0.total_cmp(&b.0))?;

            if close < min_close && rsi > rsi_at_min {
                Some((Side::Buy, rsi - rsi_at_min))
            } else if close > max_close && rsi < rsi_at_max {
                Some((Side::Sell, rsi_at_max - rsi))
            } else {
                None
            }
        } else {
            None
        };

        if self.window.len() >= self.lookback {
            self.window.pop_front();
        }
        self.window.push_back((close, rsi));

        let (side, rsi_gap) = signal?;
        let strength = (rsi_gap / 20.0).clamp(0.1, 1.0);
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
                    "{} divergence: price extreme unconfirmed by rsi ({rsi:.1})",
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
        self.rsi = Rsi::new(self.period);
        self.window.clear();
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
    fn test_bullish_divergence_fires() {
        let mut strategy = RsiDivergence::default();
        strategy.set_parameter("period", ParameterValue::Int(3)).unwrap();
        strategy.set_parameter("lookback", ParameterValue::Int(5)).unwrap();
        strategy.initialize(&StrategyContext {
            symbol: "SOL/USDT".into(),
            timeframe: "1h".into(),
            initial_capital: dec!(10000),
        });

        // Sharp sell-off to a low (RSI pinned at zero), strong recovery,
        // then a retest that undercuts the prior low by a hair: price makes
        // a lower low while the RSI stays far higher.
        let closes = [
            100.0, 98.0, 94.0, 88.0, 80.0, // crash, deeply oversold
            90.0, 96.0, 99.0, 98.0, // strong recovery
            79.5, // marginal lower low
        ];
        let mut signals = Vec::new();
        for (i, &close) in closes.iter().enumerate() {
            if let Some(signal) = strategy.on_bar(&bar(close, i as i64)) {
                signals.push(signal);
            }
        }
        let buy = signals.iter().find(|s| s.side == Side::Buy);
        let buy = buy.expect("unconfirmed lower low should fire bullish divergence");
        assert!(buy.suggested_stop.unwrap() < buy.suggested_entry.unwrap());
        assert!(buy.suggested_target.unwrap() > buy.suggested_entry.unwrap());
    }

    #[test]
    fn test_confirmed_low_stays_silent() {
        let mut strategy = RsiDivergence::default();
        strategy.set_parameter("period", ParameterValue::Int(5)).unwrap();
        strategy.set_parameter("lookback", ParameterValue::Int(5)).unwrap();
        strategy.initialize(&StrategyContext {
            symbol: "SOL/USDT".into(),
            timeframe: "1h".into(),
            initial_capital: dec!(10000),
        });

        // A steady decline keeps making lows the RSI confirms: no divergence.
        let mut signals = 0;
        for i in 0..20 {
            if strategy.on_bar(&bar(100.0 - 2.0 * i as f64, i as i64)).is_some() {
                signals += 1;
            }
        }
        assert_eq!(signals, 0);
    }
}
