//! Technical Indicators
//!
//! Rolling indicator state shared by the reference strategies. Indicator math
//! runs in f64; strategies convert back to `Decimal` at the signal boundary.
//! Every indicator returns `None` until it has enough history.

use chrono::{DateTime, NaiveDate, Utc};
use std::collections::VecDeque;

/// Simple moving average over a fixed window.
#[derive(Debug, Clone)]
pub struct Sma {
    period: usize,
    window: VecDeque<f64>,
    sum: f64,
}

impl Sma {
    pub fn new(period: usize) -> Self {
        Self {
            period: period.max(1),
            window: VecDeque::with_capacity(period),
            sum: 0.0,
        }
    }

    pub fn update(&mut self, value: f64) -> Option<f64> {
        if self.window.len() == self.period {
            if let Some(evicted) = self.window.pop_front() {
                self.sum -= evicted;
            }
        }
        self.window.push_back(value);
        self.sum += value;
        self.value()
    }

    pub fn value(&self) -> Option<f64> {
        if self.window.len() < self.period {
            return None;
        }
        Some(self.sum / self.period as f64)
    }

    pub fn reset(&mut self) {
        self.window.clear();
        self.sum = 0.0;
    }
}

/// Exponential moving average, seeded with the first observation.
#[derive(Debug, Clone)]
pub struct Ema {
    alpha: f64,
    value: Option<f64>,
}

impl Ema {
    pub fn new(period: usize) -> Self {
        Self {
            alpha: 2.0 / (period.max(1) as f64 + 1.0),
            value: None,
        }
    }

    pub fn update(&mut self, value: f64) -> f64 {
        let next = match self.value {
            Some(prev) => prev + self.alpha * (value - prev),
            None => value,
        };
        self.value = Some(next);
        next
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }

    pub fn reset(&mut self) {
        self.value = None;
    }
}

/// Rolling population standard deviation over a fixed window.
#[derive(Debug, Clone)]
pub struct RollingStd {
    period: usize,
    window: VecDeque<f64>,
}

impl RollingStd {
    pub fn new(period: usize) -> Self {
        Self {
            period: period.max(2),
            window: VecDeque::with_capacity(period),
        }
    }

    pub fn update(&mut self, value: f64) -> Option<f64> {
        if self.window.len() == self.period {
            self.window.pop_front();
        }
        self.window.push_back(value);
        self.value()
    }

    pub fn value(&self) -> Option<f64> {
        if self.window.len() < self.period {
            return None;
        }
        let n = self.window.len() as f64;
        let mean = self.window.iter().sum::<f64>() / n;
        let variance = self
            .window
            .iter()
            .map(|v| (v - mean) * (v - mean))
            .sum::<f64>()
            / n;
        Some(variance.sqrt())
    }

    pub fn mean(&self) -> Option<f64> {
        if self.window.len() < self.period {
            return None;
        }
        Some(self.window.iter().sum::<f64>() / self.window.len() as f64)
    }

    pub fn reset(&mut self) {
        self.window.clear();
    }
}

/// Relative Strength Index with Wilder smoothing.
#[derive(Debug, Clone)]
pub struct Rsi {
    period: usize,
    prev_close: Option<f64>,
    avg_gain: f64,
    avg_loss: f64,
    samples: usize,
}

impl Rsi {
    pub fn new(period: usize) -> Self {
        Self {
            period: period.max(1),
            prev_close: None,
            avg_gain: 0.0,
            avg_loss: 0.0,
            samples: 0,
        }
    }

    pub fn update(&mut self, close: f64) -> Option<f64> {
        let prev = match self.prev_close.replace(close) {
            Some(prev) => prev,
            None => return None,
        };
        let change = close - prev;
        let gain = change.max(0.0);
        let loss = (-change).max(0.0);
        self.samples += 1;

        if self.samples <= self.period {
            // Accumulate the seed averages
            self.avg_gain += gain / self.period as f64;
            self.avg_loss += loss / self.period as f64;
            if self.samples < self.period {
                return None;
            }
        } else {
            let n = self.period as f64;
            self.avg_gain = (self.avg_gain * (n - 1.0) + gain) / n;
            self.avg_loss = (self.avg_loss * (n - 1.0) + loss) / n;
        }
        self.value()
    }

    pub fn value(&self) -> Option<f64> {
        if self.samples < self.period {
            return None;
        }
        if self.avg_loss == 0.0 {
            return Some(100.0);
        }
        let rs = self.avg_gain / self.avg_loss;
        Some(100.0 - 100.0 / (1.0 + rs))
    }

    pub fn reset(&mut self) {
        self.prev_close = None;
        self.avg_gain = 0.0;
        self.avg_loss = 0.0;
        self.samples = 0;
    }
}

/// Rolling highest-high / lowest-low over a fixed window.
#[derive(Debug, Clone)]
pub struct RollingExtrema {
    period: usize,
    highs: VecDeque<f64>,
    lows: VecDeque<f64>,
}

impl RollingExtrema {
    pub fn new(period: usize) -> Self {
        Self {
            period: period.max(1),
            highs: VecDeque::with_capacity(period),
            lows: VecDeque::with_capacity(period),
        }
    }

    /// Push a bar's high/low. Query `highest`/`lowest` BEFORE updating to get
    /// the extrema of the prior window.
    pub fn update(&mut self, high: f64, low: f64) {
        if self.highs.len() == self.period {
            self.highs.pop_front();
            self.lows.pop_front();
        }
        self.highs.push_back(high);
        self.lows.push_back(low);
    }

    pub fn is_warm(&self) -> bool {
        self.highs.len() >= self.period
    }

    pub fn highest(&self) -> Option<f64> {
        if !self.is_warm() {
            return None;
        }
        self.highs.iter().copied().fold(None, |acc, v| {
            Some(acc.map_or(v, |a: f64| a.max(v)))
        })
    }

    pub fn lowest(&self) -> Option<f64> {
        if !self.is_warm() {
            return None;
        }
        self.lows.iter().copied().fold(None, |acc, v| {
            Some(acc.map_or(v, |a: f64| a.min(v)))
        })
    }

    pub fn reset(&mut self) {
        self.highs.clear();
        self.lows.clear();
    }
}

/// Session (UTC-day) volume-weighted average price.
#[derive(Debug, Clone, Default)]
pub struct SessionVwap {
    session: Option<NaiveDate>,
    cumulative_pv: f64,
    cumulative_volume: f64,
}

impl SessionVwap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a bar's typical price and volume; resets on a new UTC day.
    pub fn update(&mut self, timestamp: DateTime<Utc>, typical_price: f64, volume: f64) -> Option<f64> {
        let date = timestamp.date_naive();
        if self.session != Some(date) {
            self.session = Some(date);
            self.cumulative_pv = 0.0;
            self.cumulative_volume = 0.0;
        }
        self.cumulative_pv += typical_price * volume;
        self.cumulative_volume += volume;
        self.value()
    }

    pub fn value(&self) -> Option<f64> {
        if self.cumulative_volume <= 0.0 {
            return None;
        }
        Some(self.cumulative_pv / self.cumulative_volume)
    }

    pub fn reset(&mut self) {
        self.session = None;
        self.cumulative_pv = 0.0;
        self.cumulative_volume = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::TimeZone;

    #[test]
    fn test_sma_warmup_and_window() {
        let mut sma = Sma::new(3);
        assert_eq!(sma.update(1.0), None);
        assert_eq!(sma.update(2.0), None);
        assert_eq!(sma.update(3.0), Some(2.0));
        assert_eq!(sma.update(4.0), Some(3.0));
    }

    #[test]
    fn test_ema_converges_toward_input() {
        let mut ema = Ema::new(10);
        assert_eq!(ema.update(100.0), 100.0);
        for _ in 0..100 {
            ema.update(110.0);
        }
        assert_relative_eq!(ema.value().unwrap(), 110.0, epsilon = 0.01);
    }

    #[test]
    fn test_rolling_std() {
        let mut std = RollingStd::new(4);
        for v in [2.0, 4.0, 4.0, 4.0] {
            std.update(v);
        }
        // mean 3.5, variance (2.25 + 0.25*3)/4 = 0.75
        assert_relative_eq!(std.value().unwrap(), 0.75_f64.sqrt(), epsilon = 1e-12);
    }

    #[test]
    fn test_rsi_extremes() {
        // Monotonic rally pegs RSI at 100
        let mut rsi = Rsi::new(14);
        let mut last = None;
        for i in 0..30 {
            last = rsi.update(100.0 + i as f64);
        }
        assert_eq!(last, Some(100.0));

        // Monotonic decline pegs RSI near 0
        let mut rsi = Rsi::new(14);
        let mut last = None;
        for i in 0..30 {
            last = rsi.update(100.0 - i as f64);
        }
        assert!(last.unwrap() < 1.0);
    }

    #[test]
    fn test_rolling_extrema_prior_window() {
        let mut extrema = RollingExtrema::new(3);
        extrema.update(10.0, 9.0);
        extrema.update(12.0, 8.0);
        assert!(!extrema.is_warm());
        extrema.update(11.0, 10.0);
        assert_eq!(extrema.highest(), Some(12.0));
        assert_eq!(extrema.lowest(), Some(8.0));
    }

    #[test]
    fn test_session_vwap_resets_daily() {
        let mut vwap = SessionVwap::new();
        let day1 = Utc.with_ymd_and_hms(2023, 1, 1, 10, 0, 0).unwrap();
        let day2 = Utc.with_ymd_and_hms(2023, 1, 2, 10, 0, 0).unwrap();

        vwap.update(day1, 100.0, 10.0);
        let v = vwap.update(day1, 110.0, 10.0).unwrap();
        assert_relative_eq!(v, 105.0, epsilon = 1e-12);

        let v = vwap.update(day2, 50.0, 10.0).unwrap();
        assert_relative_eq!(v, 50.0, epsilon = 1e-12);
    }
}
