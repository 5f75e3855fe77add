//! Position Sizing
//!
//! Shared by the backtester's signal-to-order stage and the live agent. All
//! strategies return a quantity in base units, never more notional than the
//! current equity.

use crate::num;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Sizing strategy selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "strategy")]
pub enum SizingConfig {
    /// Constant quantity per order.
    Fixed { size: Decimal },
    /// Risk a fixed fraction of equity per trade, scaled by stop distance
    /// when the signal suggests one.
    PercentRisk { percent: Decimal },
    /// Fractional Kelly from the empirical win/loss record. `fraction` is
    /// the Kelly multiplier (0.5 = half-Kelly); the resulting bet fraction
    /// is clamped to [0, 0.25].
    Kelly { fraction: Decimal },
    /// Scale inventory so realized volatility matches the target.
    VolatilityAdjusted { target_vol: Decimal },
}

impl Default for SizingConfig {
    fn default() -> Self {
        SizingConfig::PercentRisk {
            percent: dec!(0.02),
        }
    }
}

/// Kelly bet-fraction cap.
const KELLY_CAP: Decimal = dec!(0.25);
/// Minimum decided trades before Kelly trusts the empirical edge.
const KELLY_MIN_TRADES: u64 = 10;
/// Bet fraction used while the Kelly record is still warming up.
const KELLY_WARMUP_FRACTION: Decimal = dec!(0.05);

/// Rolling win/loss record feeding the Kelly estimate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TradeStats {
    pub wins: u64,
    pub losses: u64,
    pub gross_win: Decimal,
    pub gross_loss: Decimal,
}

impl TradeStats {
    pub fn record(&mut self, realized_pnl: Decimal) {
        if realized_pnl > Decimal::ZERO {
            self.wins += 1;
            self.gross_win += realized_pnl;
        } else if realized_pnl < Decimal::ZERO {
            self.losses += 1;
            self.gross_loss += -realized_pnl;
        }
    }

    pub fn decided(&self) -> u64 {
        self.wins + self.losses
    }

    pub fn win_rate(&self) -> f64 {
        if self.decided() == 0 {
            return 0.5;
        }
        self.wins as f64 / self.decided() as f64
    }

    pub fn avg_win(&self) -> f64 {
        if self.wins == 0 {
            return 0.0;
        }
        num::to_f64(self.gross_win) / self.wins as f64
    }

    pub fn avg_loss(&self) -> f64 {
        if self.losses == 0 {
            return 0.0;
        }
        num::to_f64(self.gross_loss) / self.losses as f64
    }
}

/// Raw Kelly fraction `f* = (b*p - q) / b` with `b = avg_win / avg_loss`.
fn kelly_fraction(stats: &TradeStats) -> f64 {
    let avg_loss = stats.avg_loss();
    if avg_loss <= 0.0 {
        return 0.0;
    }
    let b = stats.avg_win() / avg_loss;
    if b <= 0.0 {
        return 0.0;
    }
    let p = stats.win_rate();
    let q = 1.0 - p;
    ((b * p - q) / b).max(0.0)
}

/// Compute the order quantity for one signal.
///
/// `realized_vol` is the per-bar standard deviation of returns for the
/// symbol; the volatility-adjusted mode interprets `target_vol` on the same
/// per-bar basis.
pub fn compute_size(
    config: &SizingConfig,
    equity: Decimal,
    entry_price: Decimal,
    stop_price: Option<Decimal>,
    stats: &TradeStats,
    realized_vol: Option<f64>,
) -> Decimal {
    if entry_price <= Decimal::ZERO || equity <= Decimal::ZERO {
        return Decimal::ZERO;
    }

    let quantity = match config {
        SizingConfig::Fixed { size } => *size,
        SizingConfig::PercentRisk { percent } => {
            let risk_amount = equity * *percent;
            let stop_distance = stop_price
                .map(|stop| (entry_price - stop).abs())
                .filter(|d| *d > Decimal::ZERO);
            match stop_distance {
                Some(distance) => num::div_scaled(risk_amount, distance).unwrap_or(Decimal::ZERO),
                None => num::div_scaled(risk_amount, entry_price).unwrap_or(Decimal::ZERO),
            }
        }
        SizingConfig::Kelly { fraction } => {
            let bet_fraction = if stats.decided() < KELLY_MIN_TRADES {
                KELLY_WARMUP_FRACTION
            } else {
                let full = num::from_f64(kelly_fraction(stats)).unwrap_or(Decimal::ZERO);
                (full * *fraction).clamp(Decimal::ZERO, KELLY_CAP)
            };
            num::div_scaled(equity * bet_fraction, entry_price).unwrap_or(Decimal::ZERO)
        }
        SizingConfig::VolatilityAdjusted { target_vol } => {
            let scale = match realized_vol {
                Some(vol) if vol > 0.0 => {
                    let ratio = num::to_f64(*target_vol) / vol;
                    num::from_f64(ratio.min(1.0)).unwrap_or(Decimal::ZERO)
                }
                // Without a volatility estimate, treat the target as a plain
                // equity fraction.
                _ => *target_vol,
            };
            num::div_scaled(equity * scale, entry_price).unwrap_or(Decimal::ZERO)
        }
    };

    // Never size beyond current equity at the entry price.
    let max_quantity = num::div_scaled(equity, entry_price).unwrap_or(Decimal::ZERO);
    quantity.clamp(Decimal::ZERO, max_quantity)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_size() {
        let size = compute_size(
            &SizingConfig::Fixed { size: dec!(2) },
            dec!(10000),
            dec!(100),
            None,
            &TradeStats::default(),
            None,
        );
        assert_eq!(size, dec!(2));
    }

    #[test]
    fn test_percent_risk_with_stop() {
        // Risk 2% of 10k = 200; stop distance 5 => 40 units
        let size = compute_size(
            &SizingConfig::PercentRisk { percent: dec!(0.02) },
            dec!(10000),
            dec!(100),
            Some(dec!(95)),
            &TradeStats::default(),
            None,
        );
        assert_eq!(size, dec!(40));
    }

    #[test]
    fn test_percent_risk_without_stop() {
        // 2% of 10k / 100 = 2 units
        let size = compute_size(
            &SizingConfig::PercentRisk { percent: dec!(0.02) },
            dec!(10000),
            dec!(100),
            None,
            &TradeStats::default(),
            None,
        );
        assert_eq!(size, dec!(2));
    }

    #[test]
    fn test_kelly_warmup_then_empirical() {
        let config = SizingConfig::Kelly { fraction: dec!(0.5) };
        let mut stats = TradeStats::default();

        // Warmup fraction while the record is thin
        let size = compute_size(&config, dec!(10000), dec!(100), None, &stats, None);
        assert_eq!(size, dec!(5)); // 5% of 10k / 100

        // 60% win rate, wins twice the losses: strong positive edge
        for _ in 0..12 {
            stats.record(dec!(200));
        }
        for _ in 0..8 {
            stats.record(dec!(-100));
        }
        let size = compute_size(&config, dec!(10000), dec!(100), None, &stats, None);
        // f* = (2*0.6 - 0.4)/2 = 0.4; half-Kelly 0.2 => 20 units
        assert_eq!(size, dec!(20));
    }

    #[test]
    fn test_kelly_negative_edge_is_zero() {
        let config = SizingConfig::Kelly { fraction: dec!(0.5) };
        let mut stats = TradeStats::default();
        for _ in 0..5 {
            stats.record(dec!(100));
        }
        for _ in 0..15 {
            stats.record(dec!(-150));
        }
        let size = compute_size(&config, dec!(10000), dec!(100), None, &stats, None);
        assert_eq!(size, Decimal::ZERO);
    }

    #[test]
    fn test_kelly_cap() {
        let config = SizingConfig::Kelly { fraction: dec!(1) };
        let mut stats = TradeStats::default();
        // Overwhelming edge: full Kelly would far exceed the cap
        for _ in 0..50 {
            stats.record(dec!(500));
        }
        stats.record(dec!(-1));
        let size = compute_size(&config, dec!(10000), dec!(100), None, &stats, None);
        // Capped at 25% of equity: 2500 / 100 = 25 units
        assert_eq!(size, dec!(25));
    }

    #[test]
    fn test_volatility_adjusted() {
        let config = SizingConfig::VolatilityAdjusted {
            target_vol: dec!(0.01),
        };
        // Realized vol twice the target: half exposure
        let size = compute_size(&config, dec!(10000), dec!(100), None, &TradeStats::default(), Some(0.02));
        assert_eq!(size, dec!(50));

        // Calm markets cap at full equity, never leverage
        let size = compute_size(&config, dec!(10000), dec!(100), None, &TradeStats::default(), Some(0.001));
        assert_eq!(size, dec!(100));
    }

    #[test]
    fn test_never_exceeds_equity() {
        let size = compute_size(
            &SizingConfig::Fixed { size: dec!(1000) },
            dec!(10000),
            dec!(100),
            None,
            &TradeStats::default(),
            None,
        );
        assert_eq!(size, dec!(100));
    }
}
