//! Slippage Models
//!
//! Fill-price estimation for simulated execution. Every model answers the
//! same question: given a side, a quantity and a reference price, where does
//! the order actually fill?
//!
//! When no order book is available the models return an error instead of
//! guessing, so the caller decides between rejecting the order and falling
//! back to the reference price.

use crate::errors::SlippageError;
use crate::num;
use crate::types::{OrderBookSnapshot, Side};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};

/// Result of a slippage estimate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlippageEstimate {
    /// Expected slippage in basis points (always >= 0; direction follows the
    /// order side).
    pub expected_slippage_bps: Decimal,
    /// (low, high) band around the expected slippage, in basis points.
    pub slippage_range: (Decimal, Decimal),
    /// Reference price adjusted by the expected slippage.
    pub expected_fill_price: Decimal,
    /// Set by MEV-aware models when sandwich risk is elevated.
    pub mev_risk: bool,
}

impl SlippageEstimate {
    fn from_bps(side: Side, reference_price: Decimal, bps: Decimal, range: (Decimal, Decimal)) -> Self {
        Self {
            expected_slippage_bps: bps,
            slippage_range: range,
            expected_fill_price: adjusted_price(side, reference_price, bps),
            mev_risk: false,
        }
    }
}

/// Price worsened by `bps` in the direction that hurts the taker.
fn adjusted_price(side: Side, reference_price: Decimal, bps: Decimal) -> Decimal {
    let delta = num::apply_bps(reference_price, bps);
    match side {
        Side::Buy => reference_price + delta,
        Side::Sell => reference_price - delta,
    }
}

/// Common interface for all slippage models.
pub trait SlippageModel: Send + Sync {
    fn name(&self) -> &str;

    fn estimate(
        &self,
        side: Side,
        quantity: Decimal,
        reference_price: Decimal,
        order_book: Option<&OrderBookSnapshot>,
        volatility: Option<Decimal>,
    ) -> Result<SlippageEstimate, SlippageError>;
}

fn validate_inputs(quantity: Decimal, reference_price: Decimal) -> Result<(), SlippageError> {
    if quantity <= Decimal::ZERO {
        return Err(SlippageError::InvalidInput(format!(
            "non-positive quantity {quantity}"
        )));
    }
    if reference_price <= Decimal::ZERO {
        return Err(SlippageError::InvalidInput(format!(
            "non-positive reference price {reference_price}"
        )));
    }
    Ok(())
}

// ============================================================================
// Fixed
// ============================================================================

/// Constant slippage in basis points. For tests and simple simulations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixedSlippage {
    pub bps: Decimal,
}

impl FixedSlippage {
    pub fn new(bps: Decimal) -> Self {
        Self { bps }
    }
}

impl SlippageModel for FixedSlippage {
    fn name(&self) -> &str {
        "fixed"
    }

    fn estimate(
        &self,
        side: Side,
        quantity: Decimal,
        reference_price: Decimal,
        _order_book: Option<&OrderBookSnapshot>,
        _volatility: Option<Decimal>,
    ) -> Result<SlippageEstimate, SlippageError> {
        validate_inputs(quantity, reference_price)?;
        Ok(SlippageEstimate::from_bps(
            side,
            reference_price,
            self.bps,
            (self.bps, self.bps),
        ))
    }
}

// ============================================================================
// Volume-weighted
// ============================================================================

/// Square-root market-impact model:
/// `expected = base_bps + impact_factor * sqrt(order_size / reference_volume)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeWeightedSlippage {
    pub base_bps: Decimal,
    /// Impact coefficient, in basis points per sqrt(participation).
    pub impact_factor: Decimal,
    /// Reference volume a full participation unit is measured against.
    pub reference_volume: Decimal,
}

impl VolumeWeightedSlippage {
    pub fn new(base_bps: Decimal, impact_factor: Decimal, reference_volume: Decimal) -> Self {
        Self {
            base_bps,
            impact_factor,
            reference_volume,
        }
    }

    fn impact_bps(&self, quantity: Decimal) -> Result<Decimal, SlippageError> {
        if self.reference_volume <= Decimal::ZERO {
            return Err(SlippageError::InvalidInput(
                "reference volume must be positive".into(),
            ));
        }
        let participation = num::to_f64(quantity) / num::to_f64(self.reference_volume);
        let impact = num::to_f64(self.impact_factor) * participation.sqrt();
        let impact = num::from_f64(impact).ok_or_else(|| {
            SlippageError::InvalidInput("impact computation produced a non-finite value".into())
        })?;
        Ok(self.base_bps + impact)
    }
}

impl SlippageModel for VolumeWeightedSlippage {
    fn name(&self) -> &str {
        "volume_weighted"
    }

    fn estimate(
        &self,
        side: Side,
        quantity: Decimal,
        reference_price: Decimal,
        _order_book: Option<&OrderBookSnapshot>,
        volatility: Option<Decimal>,
    ) -> Result<SlippageEstimate, SlippageError> {
        validate_inputs(quantity, reference_price)?;
        let expected = self.impact_bps(quantity)?;
        // Volatility widens the band; without it the band is +/-50% of the
        // expected impact.
        let half_band = match volatility {
            Some(vol) if vol > Decimal::ZERO => expected * vol.min(Decimal::ONE),
            _ => expected / dec!(2),
        };
        let low = (expected - half_band).max(Decimal::ZERO);
        Ok(SlippageEstimate::from_bps(
            side,
            reference_price,
            expected,
            (low, expected + half_band),
        ))
    }
}

// ============================================================================
// Order-book traversal
// ============================================================================

/// Walks the opposite side of the book, consuming levels in book order until
/// the quantity is filled. The fill price is size-weighted; unfilled residual
/// is surfaced as an error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BookTraversalSlippage;

impl SlippageModel for BookTraversalSlippage {
    fn name(&self) -> &str {
        "book_traversal"
    }

    fn estimate(
        &self,
        side: Side,
        quantity: Decimal,
        reference_price: Decimal,
        order_book: Option<&OrderBookSnapshot>,
        _volatility: Option<Decimal>,
    ) -> Result<SlippageEstimate, SlippageError> {
        validate_inputs(quantity, reference_price)?;
        let book = order_book.ok_or_else(|| SlippageError::EmptyBook {
            symbol: "<none>".into(),
            side: side.opposite().to_string(),
        })?;

        // A buy consumes asks, a sell consumes bids.
        let levels = match side {
            Side::Buy => &book.asks,
            Side::Sell => &book.bids,
        };
        if levels.is_empty() {
            return Err(SlippageError::EmptyBook {
                symbol: book.symbol.clone(),
                side: side.opposite().to_string(),
            });
        }

        let mut remaining = quantity;
        let mut notional = Decimal::ZERO;
        for level in levels {
            if remaining.is_zero() {
                break;
            }
            let take = remaining.min(level.quantity);
            notional += take * level.price;
            remaining -= take;
        }
        if remaining > Decimal::ZERO {
            return Err(SlippageError::InsufficientLiquidity {
                requested: quantity,
                available: quantity - remaining,
            });
        }

        let fill_price = num::div_scaled(notional, quantity).ok_or_else(|| {
            SlippageError::InvalidInput("zero quantity after traversal".into())
        })?;
        let signed_bps = num::diff_bps(fill_price, reference_price)
            .ok_or_else(|| SlippageError::InvalidInput("zero reference price".into()))?;
        // Slippage is the adverse component; a fill better than reference is
        // reported as zero expected slippage.
        let bps = match side {
            Side::Buy => signed_bps.max(Decimal::ZERO),
            Side::Sell => (-signed_bps).max(Decimal::ZERO),
        };
        Ok(SlippageEstimate {
            expected_slippage_bps: bps,
            slippage_range: (bps, bps),
            expected_fill_price: fill_price,
            mev_risk: false,
        })
    }
}

// ============================================================================
// MEV-aware
// ============================================================================

/// Volume-weighted base plus a sandwich-risk buffer for EVM symbols. Risk is
/// flagged when the symbol routes through a known DEX router or the latest
/// gas price exceeds twice the rolling median.
pub struct MevAwareSlippage {
    inner: VolumeWeightedSlippage,
    /// Extra buffer applied when MEV risk is detected.
    pub mev_buffer_bps: Decimal,
    dex_router_symbols: HashSet<String>,
    gas: Mutex<GasTracker>,
}

#[derive(Debug, Default)]
struct GasTracker {
    samples: VecDeque<Decimal>,
    latest: Option<Decimal>,
}

const GAS_WINDOW: usize = 256;

impl GasTracker {
    fn record(&mut self, gas_price: Decimal) {
        if self.samples.len() == GAS_WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back(gas_price);
        self.latest = Some(gas_price);
    }

    fn median(&self) -> Option<Decimal> {
        if self.samples.is_empty() {
            return None;
        }
        let mut sorted: Vec<Decimal> = self.samples.iter().copied().collect();
        sorted.sort();
        Some(sorted[sorted.len() / 2])
    }

    fn is_spiking(&self) -> bool {
        match (self.latest, self.median()) {
            (Some(latest), Some(median)) if median > Decimal::ZERO => latest > median * dec!(2),
            _ => false,
        }
    }
}

impl MevAwareSlippage {
    pub fn new(
        inner: VolumeWeightedSlippage,
        mev_buffer_bps: Decimal,
        dex_router_symbols: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            inner,
            mev_buffer_bps,
            dex_router_symbols: dex_router_symbols.into_iter().collect(),
            gas: Mutex::new(GasTracker::default()),
        }
    }

    /// Feed an observed gas price into the rolling median.
    pub fn record_gas_price(&self, gas_price: Decimal) {
        self.gas.lock().record(gas_price);
    }

    pub fn routes_through_dex(&self, symbol: &str) -> bool {
        self.dex_router_symbols.contains(symbol)
    }
}

impl SlippageModel for MevAwareSlippage {
    fn name(&self) -> &str {
        "mev_aware"
    }

    fn estimate(
        &self,
        side: Side,
        quantity: Decimal,
        reference_price: Decimal,
        order_book: Option<&OrderBookSnapshot>,
        volatility: Option<Decimal>,
    ) -> Result<SlippageEstimate, SlippageError> {
        let base = self
            .inner
            .estimate(side, quantity, reference_price, order_book, volatility)?;

        let symbol_risky = order_book
            .map(|book| self.routes_through_dex(&book.symbol))
            .unwrap_or(false);
        let gas_spiking = self.gas.lock().is_spiking();
        let mev_risk = symbol_risky || gas_spiking;

        if !mev_risk {
            return Ok(base);
        }

        let bps = base.expected_slippage_bps + self.mev_buffer_bps;
        Ok(SlippageEstimate {
            expected_slippage_bps: bps,
            slippage_range: (
                base.slippage_range.0,
                base.slippage_range.1 + self.mev_buffer_bps,
            ),
            expected_fill_price: adjusted_price(side, reference_price, bps),
            mev_risk: true,
        })
    }
}

/// Serializable model selection for configs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "model")]
pub enum SlippageSpec {
    Fixed {
        bps: Decimal,
    },
    VolumeWeighted {
        base_bps: Decimal,
        impact_factor: Decimal,
        reference_volume: Decimal,
    },
    BookTraversal,
}

impl SlippageSpec {
    pub fn build(&self) -> Box<dyn SlippageModel> {
        match self {
            SlippageSpec::Fixed { bps } => Box::new(FixedSlippage::new(*bps)),
            SlippageSpec::VolumeWeighted {
                base_bps,
                impact_factor,
                reference_volume,
            } => Box::new(VolumeWeightedSlippage::new(
                *base_bps,
                *impact_factor,
                *reference_volume,
            )),
            SlippageSpec::BookTraversal => Box::new(BookTraversalSlippage),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Level;
    use chrono::Utc;

    fn book(symbol: &str) -> OrderBookSnapshot {
        OrderBookSnapshot {
            symbol: symbol.into(),
            bids: vec![
                Level::new(dec!(99), dec!(5)),
                Level::new(dec!(98), dec!(10)),
                Level::new(dec!(97), dec!(20)),
            ],
            asks: vec![
                Level::new(dec!(101), dec!(5)),
                Level::new(dec!(102), dec!(10)),
                Level::new(dec!(103), dec!(20)),
            ],
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_fixed_slippage() {
        let model = FixedSlippage::new(dec!(10));
        let est = model
            .estimate(Side::Buy, dec!(1), dec!(100), None, None)
            .unwrap();
        assert_eq!(est.expected_slippage_bps, dec!(10));
        assert_eq!(est.expected_fill_price, dec!(100.1));
        assert_eq!(est.slippage_range, (dec!(10), dec!(10)));

        let est = model
            .estimate(Side::Sell, dec!(1), dec!(100), None, None)
            .unwrap();
        assert_eq!(est.expected_fill_price, dec!(99.9));
    }

    #[test]
    fn test_fixed_rejects_bad_inputs() {
        let model = FixedSlippage::new(dec!(10));
        assert!(model
            .estimate(Side::Buy, Decimal::ZERO, dec!(100), None, None)
            .is_err());
        assert!(model
            .estimate(Side::Buy, dec!(1), Decimal::ZERO, None, None)
            .is_err());
    }

    #[test]
    fn test_volume_weighted_sqrt_law() {
        let model = VolumeWeightedSlippage::new(dec!(2), dec!(10), dec!(100));
        // participation = 25/100 => sqrt = 0.5 => 2 + 10*0.5 = 7 bps
        let est = model
            .estimate(Side::Buy, dec!(25), dec!(100), None, None)
            .unwrap();
        assert_eq!(est.expected_slippage_bps, dec!(7));

        // Larger orders cost more
        let bigger = model
            .estimate(Side::Buy, dec!(100), dec!(100), None, None)
            .unwrap();
        assert!(bigger.expected_slippage_bps > est.expected_slippage_bps);
    }

    #[test]
    fn test_book_traversal_weighted_fill() {
        let model = BookTraversalSlippage;
        // Buy 10: 5 @ 101, 5 @ 102 => avg 101.5
        let est = model
            .estimate(Side::Buy, dec!(10), dec!(100), Some(&book("ETH/USDT")), None)
            .unwrap();
        assert_eq!(est.expected_fill_price, dec!(101.5));
        assert_eq!(est.expected_slippage_bps, dec!(150));

        // Sell 10: 5 @ 99, 5 @ 98 => avg 98.5
        let est = model
            .estimate(Side::Sell, dec!(10), dec!(100), Some(&book("ETH/USDT")), None)
            .unwrap();
        assert_eq!(est.expected_fill_price, dec!(98.5));
        assert_eq!(est.expected_slippage_bps, dec!(150));
    }

    #[test]
    fn test_book_traversal_residual_is_error() {
        let model = BookTraversalSlippage;
        let err = model
            .estimate(Side::Buy, dec!(100), dec!(100), Some(&book("ETH/USDT")), None)
            .unwrap_err();
        assert_eq!(
            err,
            SlippageError::InsufficientLiquidity {
                requested: dec!(100),
                available: dec!(35),
            }
        );
    }

    #[test]
    fn test_book_traversal_empty_book() {
        let model = BookTraversalSlippage;
        let empty = OrderBookSnapshot {
            symbol: "ETH/USDT".into(),
            bids: vec![],
            asks: vec![],
            timestamp: Utc::now(),
        };
        assert!(matches!(
            model.estimate(Side::Buy, dec!(1), dec!(100), Some(&empty), None),
            Err(SlippageError::EmptyBook { .. })
        ));
        assert!(matches!(
            model.estimate(Side::Buy, dec!(1), dec!(100), None, None),
            Err(SlippageError::EmptyBook { .. })
        ));
    }

    #[test]
    fn test_mev_router_buffer() {
        let model = MevAwareSlippage::new(
            VolumeWeightedSlippage::new(dec!(2), dec!(10), dec!(100)),
            dec!(25),
            vec!["WETH/USDC".to_string()],
        );
        let routed = model
            .estimate(Side::Buy, dec!(25), dec!(100), Some(&book("WETH/USDC")), None)
            .unwrap();
        assert!(routed.mev_risk);
        assert_eq!(routed.expected_slippage_bps, dec!(32)); // 7 + 25 buffer

        let clean = model
            .estimate(Side::Buy, dec!(25), dec!(100), Some(&book("ETH/USDT")), None)
            .unwrap();
        assert!(!clean.mev_risk);
        assert_eq!(clean.expected_slippage_bps, dec!(7));
    }

    #[test]
    fn test_mev_gas_spike_buffer() {
        let model = MevAwareSlippage::new(
            VolumeWeightedSlippage::new(dec!(2), dec!(10), dec!(100)),
            dec!(25),
            Vec::<String>::new(),
        );
        for _ in 0..10 {
            model.record_gas_price(dec!(30));
        }
        let calm = model
            .estimate(Side::Buy, dec!(25), dec!(100), Some(&book("ETH/USDT")), None)
            .unwrap();
        assert!(!calm.mev_risk);

        // Latest gas is > 2x the rolling median
        model.record_gas_price(dec!(90));
        let spiking = model
            .estimate(Side::Buy, dec!(25), dec!(100), Some(&book("ETH/USDT")), None)
            .unwrap();
        assert!(spiking.mev_risk);
    }

    #[test]
    fn test_spec_builds_named_models() {
        assert_eq!(SlippageSpec::Fixed { bps: dec!(10) }.build().name(), "fixed");
        assert_eq!(SlippageSpec::BookTraversal.build().name(), "book_traversal");
    }
}
